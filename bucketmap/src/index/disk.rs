use super::{
    check_range, encode_header, file_size, read_header, slot_offset, BucketIndex, Error,
    CHECKSUM_OFFSET, HEADER_SIZE, SLOT_SIZE,
};
use crate::{
    fs::{read_exact_at, write_all_at},
    log::{Location, SegmentId},
};
use bytes::Buf;
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};
use tracing::{debug, trace, warn};

/// Number of slots read at a time when scanning the file.
const SCAN_SLOTS: usize = 4096;

/// Read every slot of `file`, adding them to `hasher`. Returns the checksum and the number of
/// occupied slots.
fn scan(
    file: &File,
    num_buckets: u32,
    mut hasher: crc32fast::Hasher,
) -> Result<(u32, u64), Error> {
    let mut occupied = 0;
    let mut chunk = vec![0u8; SCAN_SLOTS * SLOT_SIZE];
    let mut bucket = 0u32;
    while bucket < num_buckets {
        let count = SCAN_SLOTS.min((num_buckets - bucket) as usize);
        let buf = &mut chunk[..count * SLOT_SIZE];
        read_exact_at(file, buf, slot_offset(bucket))?;
        hasher.update(buf);
        let mut slots = &buf[..];
        while slots.has_remaining() {
            if slots.get_u64_le() != 0 {
                occupied += 1;
            }
        }
        bucket += count as u32;
    }
    Ok((hasher.finalize(), occupied))
}

/// Check the header, length, and checksum of an index file. Returns its checkpoint and the
/// number of occupied slots.
fn verify(file: &File, num_buckets: u32) -> Result<(SegmentId, u64), Error> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact_at(file, &mut header, 0).map_err(|_| Error::InvalidFile("truncated header"))?;
    let header = read_header(&header, num_buckets)?;
    if file.metadata()?.len() != file_size(num_buckets) {
        return Err(Error::InvalidFile("unexpected length"));
    }
    let (checksum, occupied) = scan(file, num_buckets, header.hasher())?;
    if checksum != header.checksum {
        return Err(Error::InvalidFile("checksum mismatch"));
    }
    Ok((header.checkpoint, occupied))
}

/// Create an index file of empty slots. Its checksum is left invalid until the first sync.
fn create(path: &Path, num_buckets: u32) -> Result<File, Error> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut header = Vec::with_capacity(HEADER_SIZE);
    encode_header(&mut header, num_buckets, 0);
    write_all_at(&file, &header, 0)?;
    file.set_len(file_size(num_buckets))?;
    file.sync_all()?;
    Ok(file)
}

/// A [BucketIndex] whose slots live in the index file.
///
/// Every lookup is a positional read of one slot and every update a positional write, so memory
/// use does not grow with the number of buckets. The header (checkpoint and checksum) is only
/// refreshed by [BucketIndex::sync], so a file updated since its last sync fails verification
/// on open and is rebuilt.
pub struct DiskIndex {
    path: PathBuf,
    file: File,
    num_buckets: u32,
    occupied: AtomicU64,
    dirty: AtomicBool,
    checkpoint: Mutex<Option<SegmentId>>,
}

impl DiskIndex {
    /// Open the index file at `path`.
    ///
    /// If there is no such file, or it cannot be trusted, it is replaced by an empty index
    /// without a checkpoint.
    pub fn open(path: &Path, num_buckets: u32) -> Result<Self, Error> {
        if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            match verify(&file, num_buckets) {
                Ok((checkpoint, occupied)) => {
                    debug!(?path, num_buckets, occupied, checkpoint, "opened index");
                    return Ok(Self::new(path, file, num_buckets, Some(checkpoint), occupied));
                }
                Err(Error::InvalidFile(reason)) => {
                    warn!(?path, reason, "discarding index file");
                }
                Err(err) => return Err(err),
            }
        } else {
            debug!(?path, num_buckets, "no index file");
        }
        let file = create(path, num_buckets)?;
        Ok(Self::new(path, file, num_buckets, None, 0))
    }

    fn new(
        path: &Path,
        file: File,
        num_buckets: u32,
        checkpoint: Option<SegmentId>,
        occupied: u64,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            num_buckets,
            occupied: AtomicU64::new(occupied),
            dirty: AtomicBool::new(checkpoint.is_none()),
            checkpoint: Mutex::new(checkpoint),
        }
    }

    fn read_slot(&self, bucket: u32) -> Result<u64, Error> {
        check_range(bucket, self.num_buckets)?;
        let mut buf = [0u8; SLOT_SIZE];
        read_exact_at(&self.file, &mut buf, slot_offset(bucket))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_slot(&self, bucket: u32, slot: u64) -> Result<(), Error> {
        write_all_at(&self.file, &slot.to_le_bytes(), slot_offset(bucket))?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Write `checkpoint` and the checksum it implies into the header and sync the file.
    fn write_header(&self, checkpoint: SegmentId) -> Result<(), Error> {
        let bytes = checkpoint.to_le_bytes();
        write_all_at(&self.file, &bytes, 4)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        let (checksum, _) = scan(&self.file, self.num_buckets, hasher)?;
        write_all_at(&self.file, &checksum.to_le_bytes(), CHECKSUM_OFFSET as u64)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl BucketIndex for DiskIndex {
    fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    fn get(&self, bucket: u32) -> Result<Option<Location>, Error> {
        Ok(Location::from_raw(self.read_slot(bucket)?))
    }

    fn put(&self, bucket: u32, location: Location) -> Result<(), Error> {
        let previous = self.read_slot(bucket)?;
        self.write_slot(bucket, location.raw())?;
        if previous == 0 {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn remove(&self, bucket: u32) -> Result<(), Error> {
        if self.read_slot(bucket)? == 0 {
            return Ok(());
        }
        self.write_slot(bucket, 0)?;
        self.occupied.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Option<SegmentId> {
        *self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, path: &Path, checkpoint: SegmentId) -> Result<(), Error> {
        self.sync(checkpoint)?;
        if path == self.path {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        fs::copy(&self.path, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, path)?;
        trace!(?path, checkpoint, "persisted index");
        Ok(())
    }

    fn sync(&self, checkpoint: SegmentId) -> Result<(), Error> {
        let mut current = self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner);
        let dirty = self.dirty.swap(false, Ordering::AcqRel);
        if !dirty && *current == Some(checkpoint) {
            return Ok(());
        }
        if let Err(err) = self.write_header(checkpoint) {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(err);
        }
        *current = Some(checkpoint);
        trace!(path = ?self.path, checkpoint, occupied = self.occupied(), "synced index");
        Ok(())
    }
}
