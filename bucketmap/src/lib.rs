//! Persist a mapping from serializable keys to 64-bit values in a bucketed, disk-resident hash map.
//!
//! # Overview
//!
//! Keys are hashed into a fixed number of buckets (chosen once, when the store is created). Each
//! non-empty bucket is serialized into an append-only [log::Log] and a [index::BucketIndex] tracks
//! where the latest copy of every bucket lives. Reads resolve a key through the index to a single
//! bucket record and scan it without decoding. Writes are buffered in a [map::WriteSession] and
//! applied to all touched buckets in parallel when the session ends.
//!
//! # Status
//!
//! `bucketmap` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod bucket;
mod fs;
pub mod index;
pub mod keys;
pub mod log;
pub mod map;
pub mod pool;

/// Reserved value that means "delete" when used as a new value and "do not check" when used as
/// an expected old value.
pub const INVALID_VALUE: i64 = i64::MIN;
