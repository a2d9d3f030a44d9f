//! An append-only log of checksummed records, split into segments.
//!
//! Each write session appends into its own segment (a file in the log directory). Records are
//! never modified once written; a newer copy of a bucket is appended to a newer segment and the
//! caller keeps track of which [Location] is current.
//!
//! # Format
//!
//! Segments are named `segment_{id:016x}.dat` and contain a sequence of records:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//! |   Length (u32)    |    Data   |   CRC32 (u32) |
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! Both integers are little-endian. The checksum covers the data only.
//!
//! # Locations
//!
//! A [Location] packs the segment id (upper 24 bits) and the byte offset of the record within the
//! segment (lower 40 bits) into a `u64`. Segment ids start at 1, so a location is never 0.

mod storage;

pub use storage::Log;

use std::{fmt, path::PathBuf};
use thiserror::Error;

/// Identifier of a segment.
pub type SegmentId = u64;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Largest segment id that fits in a [Location].
pub const MAX_SEGMENT_ID: SegmentId = (1 << (64 - OFFSET_BITS)) - 1;

/// Largest byte offset that fits in a [Location].
pub const MAX_OFFSET: u64 = OFFSET_MASK;

/// Position of a record in the log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(u64);

impl Location {
    /// Create a location, or `None` if either component is out of range.
    pub fn new(segment: SegmentId, offset: u64) -> Option<Self> {
        if segment == 0 || segment > MAX_SEGMENT_ID || offset > MAX_OFFSET {
            return None;
        }
        Some(Self((segment << OFFSET_BITS) | offset))
    }

    /// Interpret a packed location (0 is not a location).
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn segment(&self) -> SegmentId {
        self.0 >> OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({}:{})", self.segment(), self.offset())
    }
}

/// Errors that can occur when interacting with the [Log].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch at {0:?}")]
    ChecksumMismatch(Location),
    #[error("record out of bounds at {0:?}")]
    RecordOutOfBounds(Location),
    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentId),
    #[error("segment full: {0}")]
    SegmentFull(SegmentId),
    #[error("too many segments")]
    TooManySegments,
    #[error("no active segment")]
    NoActiveSegment,
    #[error("segment already active: {0}")]
    SegmentActive(SegmentId),
    #[error("record too large: {0}")]
    RecordTooLarge(usize),
}

/// Configuration for [Log] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the segment files (created if missing).
    pub directory: PathBuf,
}
