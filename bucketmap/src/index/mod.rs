//! Track the [Location] of the latest copy of every bucket.
//!
//! A [BucketIndex] is a fixed-size table with one slot per bucket number. A slot is either empty
//! (the bucket has no entries) or holds the [Location] of the bucket's most recent record in the
//! [crate::log::Log]. Readers and the single writer access the index concurrently: every
//! implementation is `Send + Sync` and each slot is read or written as a whole.
//!
//! Two implementations are provided:
//!
//! - [MemoryIndex] keeps all slots in memory and writes the index file only when synced.
//! - [DiskIndex] keeps the slots in the index file and reads or writes one slot per access.
//!
//! # Checkpoints
//!
//! The index file is only brought up to date by [BucketIndex::sync] (when the store is closed)
//! and [BucketIndex::persist] (when it is snapshotted). It records the newest log segment it
//! reflects, its checkpoint, so the owner can replay later segments after an unclean shutdown.
//! A file that is missing, has the wrong size, or fails its checksum is not trusted: the index
//! opens empty, [BucketIndex::checkpoint] returns `None`, and the owner rebuilds it from the log.
//!
//! # Format
//!
//! Both implementations read and write the same index file:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |16 |...|23 |24 |...
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---
//! |  Buckets (u32)|        Checkpoint (u64)       |  CRC32 (u32)  | Slot 0 (u64)  | ...
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---
//! ```
//!
//! All integers are little-endian, the checksum covers the checkpoint and the slots, and a slot
//! of 0 is empty.

mod disk;
mod memory;

pub use disk::DiskIndex;
pub use memory::MemoryIndex;

use crate::log::{Location, SegmentId};
use bytes::{Buf, BufMut};
use std::path::Path;
use thiserror::Error;

/// Size of the index file header.
const HEADER_SIZE: usize = 16;

/// Offset of the checksum in the header.
const CHECKSUM_OFFSET: usize = 12;

/// Size of one slot.
const SLOT_SIZE: usize = 8;

/// Errors that can occur when interacting with a [BucketIndex].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bucket out of range: {0}")]
    OutOfRange(u32),
    #[error("invalid index file: {0}")]
    InvalidFile(&'static str),
}

/// Map bucket numbers to the [Location] of their latest record.
pub trait BucketIndex: Send + Sync {
    /// Number of slots.
    fn num_buckets(&self) -> u32;

    /// Location of `bucket`, or `None` if the bucket is empty.
    fn get(&self, bucket: u32) -> Result<Option<Location>, Error>;

    /// Point `bucket` at `location`.
    fn put(&self, bucket: u32, location: Location) -> Result<(), Error>;

    /// Mark `bucket` as empty.
    fn remove(&self, bucket: u32) -> Result<(), Error>;

    /// Number of non-empty slots.
    fn occupied(&self) -> u64;

    /// Newest segment reflected by the index file as of the last open or sync, or `None` if the
    /// file could not be trusted and the index started empty.
    fn checkpoint(&self) -> Option<SegmentId>;

    /// Write the full index to `path` (replacing any existing file), recording that it reflects
    /// every segment up to `checkpoint`.
    fn persist(&self, path: &Path, checkpoint: SegmentId) -> Result<(), Error>;

    /// Bring the index file up to date with every segment up to `checkpoint` and make it durable.
    fn sync(&self, checkpoint: SegmentId) -> Result<(), Error>;
}

/// Total size of an index file with `num_buckets` slots.
fn file_size(num_buckets: u32) -> u64 {
    (HEADER_SIZE + num_buckets as usize * SLOT_SIZE) as u64
}

fn slot_offset(bucket: u32) -> u64 {
    (HEADER_SIZE + bucket as usize * SLOT_SIZE) as u64
}

fn check_range(bucket: u32, num_buckets: u32) -> Result<(), Error> {
    if bucket >= num_buckets {
        return Err(Error::OutOfRange(bucket));
    }
    Ok(())
}

/// Encode the header of an index file (with a zero checksum).
fn encode_header(buf: &mut impl BufMut, num_buckets: u32, checkpoint: SegmentId) {
    buf.put_u32_le(num_buckets);
    buf.put_u64_le(checkpoint);
    buf.put_u32_le(0);
}

/// Encode `slots` as an index file.
fn encode(slots: impl ExactSizeIterator<Item = u64>, checkpoint: SegmentId) -> Vec<u8> {
    let num_buckets = slots.len();
    let mut buf = Vec::with_capacity(HEADER_SIZE + num_buckets * SLOT_SIZE);
    encode_header(&mut buf, num_buckets as u32, checkpoint);
    for slot in slots {
        buf.put_u64_le(slot);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[4..CHECKSUM_OFFSET]);
    hasher.update(&buf[HEADER_SIZE..]);
    let checksum = hasher.finalize();
    buf[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Decoded header of an index file.
struct Header {
    checkpoint: SegmentId,
    checksum: u32,
}

impl Header {
    /// Start a checksum over the checkpoint (the slots are added by the caller).
    fn hasher(&self) -> crc32fast::Hasher {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.checkpoint.to_le_bytes());
        hasher
    }
}

fn read_header(mut buf: &[u8], num_buckets: u32) -> Result<Header, Error> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::InvalidFile("truncated header"));
    }
    if buf.get_u32_le() != num_buckets {
        return Err(Error::InvalidFile("bucket count mismatch"));
    }
    Ok(Header {
        checkpoint: buf.get_u64_le(),
        checksum: buf.get_u32_le(),
    })
}

/// Decode an index file, returning its checkpoint and slots.
fn decode(data: &[u8], num_buckets: u32) -> Result<(SegmentId, Vec<u64>), Error> {
    let header = read_header(data, num_buckets)?;
    if data.len() as u64 != file_size(num_buckets) {
        return Err(Error::InvalidFile("unexpected length"));
    }
    let mut body = &data[HEADER_SIZE..];
    let mut hasher = header.hasher();
    hasher.update(body);
    if hasher.finalize() != header.checksum {
        return Err(Error::InvalidFile("checksum mismatch"));
    }
    let slots = (0..num_buckets).map(|_| body.get_u64_le()).collect();
    Ok((header.checkpoint, slots))
}
