use super::{check_range, decode, encode, BucketIndex, Error};
use crate::{
    fs::write_atomic,
    log::{Location, SegmentId},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};
use tracing::{debug, trace, warn};

/// A [BucketIndex] held entirely in memory.
///
/// Slots are atomics, so lookups never block. When opened from a file, [BucketIndex::sync]
/// rewrites that file (atomically) if any slot or the checkpoint changed since it was written.
pub struct MemoryIndex {
    path: Option<PathBuf>,
    slots: Vec<AtomicU64>,
    occupied: AtomicU64,
    dirty: AtomicBool,
    checkpoint: Mutex<Option<SegmentId>>,
}

impl MemoryIndex {
    /// Create an empty index that is not backed by a file.
    pub fn new(num_buckets: u32) -> Self {
        Self {
            path: None,
            slots: (0..num_buckets).map(|_| AtomicU64::new(0)).collect(),
            occupied: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            checkpoint: Mutex::new(None),
        }
    }

    /// Load the index stored at `path`.
    ///
    /// If there is no such file, or it cannot be trusted, the index starts empty without a
    /// checkpoint.
    pub fn open(path: &Path, num_buckets: u32) -> Result<Self, Error> {
        let mut index = Self::new(num_buckets);
        index.path = Some(path.to_path_buf());
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(?path, num_buckets, "no index file");
                index.dirty.store(true, Ordering::Relaxed);
                return Ok(index);
            }
            Err(err) => return Err(err.into()),
        };
        let (checkpoint, slots) = match decode(&data, num_buckets) {
            Ok(decoded) => decoded,
            Err(Error::InvalidFile(reason)) => {
                warn!(?path, reason, "discarding index file");
                index.dirty.store(true, Ordering::Relaxed);
                return Ok(index);
            }
            Err(err) => return Err(err),
        };
        let occupied = slots.iter().filter(|slot| **slot != 0).count() as u64;
        debug!(?path, num_buckets, occupied, checkpoint, "loaded index");
        index.slots = slots.into_iter().map(AtomicU64::new).collect();
        index.occupied = AtomicU64::new(occupied);
        index.checkpoint = Mutex::new(Some(checkpoint));
        Ok(index)
    }

    fn slot(&self, bucket: u32) -> Result<&AtomicU64, Error> {
        check_range(bucket, self.num_buckets())?;
        Ok(&self.slots[bucket as usize])
    }

    fn encode(&self, checkpoint: SegmentId) -> Vec<u8> {
        encode(
            self.slots.iter().map(|slot| slot.load(Ordering::Acquire)),
            checkpoint,
        )
    }
}

impl BucketIndex for MemoryIndex {
    fn num_buckets(&self) -> u32 {
        self.slots.len() as u32
    }

    fn get(&self, bucket: u32) -> Result<Option<Location>, Error> {
        Ok(Location::from_raw(self.slot(bucket)?.load(Ordering::Acquire)))
    }

    fn put(&self, bucket: u32, location: Location) -> Result<(), Error> {
        let previous = self.slot(bucket)?.swap(location.raw(), Ordering::AcqRel);
        if previous == 0 {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, bucket: u32) -> Result<(), Error> {
        let previous = self.slot(bucket)?.swap(0, Ordering::AcqRel);
        if previous != 0 {
            self.occupied.fetch_sub(1, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Option<SegmentId> {
        *self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, path: &Path, checkpoint: SegmentId) -> Result<(), Error> {
        write_atomic(path, &self.encode(checkpoint))?;
        trace!(?path, checkpoint, "persisted index");
        Ok(())
    }

    fn sync(&self, checkpoint: SegmentId) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut current = self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner);
        let dirty = self.dirty.swap(false, Ordering::AcqRel);
        if !dirty && *current == Some(checkpoint) {
            return Ok(());
        }
        if let Err(err) = write_atomic(path, &self.encode(checkpoint)) {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(err.into());
        }
        *current = Some(checkpoint);
        trace!(?path, checkpoint, occupied = self.occupied(), "synced index");
        Ok(())
    }
}
