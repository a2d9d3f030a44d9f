use super::{Config, Error, Location, SegmentId, MAX_OFFSET, MAX_SEGMENT_ID};
use crate::fs::{read_exact_at, write_all_at};
use bytes::{BufMut, Bytes};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};
use tracing::{debug, trace, warn};

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".dat";

/// Bytes added to every record (length prefix and checksum).
const RECORD_OVERHEAD: usize = 8;

fn segment_name(id: SegmentId) -> String {
    format!("{SEGMENT_PREFIX}{id:016x}{SEGMENT_SUFFIX}")
}

fn parse_segment_name(name: &str) -> Option<SegmentId> {
    let hex = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    SegmentId::from_str_radix(hex, 16).ok()
}

/// The segment currently accepting appends.
struct Active {
    id: SegmentId,
    file: Arc<File>,
    offset: u64,
    records: u64,
}

/// Implementation of the append-only record [Log].
///
/// Reads may run concurrently with each other and with appends. Appends are written through to
/// the segment file before their [Location] is returned, so a location can be handed to readers
/// immediately.
pub struct Log {
    directory: PathBuf,
    segments: RwLock<BTreeMap<SegmentId, Arc<File>>>,
    active: Mutex<Option<Active>>,
    next_id: Mutex<SegmentId>,
}

impl Log {
    /// Open the log, indexing every existing segment in the directory.
    pub fn init(cfg: Config) -> Result<Self, Error> {
        fs::create_dir_all(&cfg.directory)?;
        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&cfg.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_segment_name) else {
                trace!(name = ?name, "skipping unrelated file");
                continue;
            };
            let file = OpenOptions::new().read(true).open(entry.path())?;
            segments.insert(id, Arc::new(file));
        }
        let next_id = segments.keys().next_back().map_or(1, |id| id + 1);
        debug!(
            directory = ?cfg.directory,
            segments = segments.len(),
            next_id,
            "opened log"
        );
        Ok(Self {
            directory: cfg.directory,
            segments: RwLock::new(segments),
            active: Mutex::new(None),
            next_id: Mutex::new(next_id),
        })
    }

    fn active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn segment(&self, id: SegmentId) -> Option<Arc<File>> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Start a new segment. Only one segment may accept appends at a time.
    pub fn start_segment(&self) -> Result<SegmentId, Error> {
        let mut active = self.active();
        if let Some(active) = active.as_ref() {
            return Err(Error::SegmentActive(active.id));
        }
        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next_id;
        if id > MAX_SEGMENT_ID {
            return Err(Error::TooManySegments);
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(self.directory.join(segment_name(id)))?,
        );
        *next_id = id + 1;
        self.segments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, file.clone());
        *active = Some(Active {
            id,
            file,
            offset: 0,
            records: 0,
        });
        trace!(segment = id, "started segment");
        Ok(id)
    }

    /// Append a record to the active segment.
    pub fn append(&self, data: &[u8]) -> Result<Location, Error> {
        let mut active = self.active();
        let active = active.as_mut().ok_or(Error::NoActiveSegment)?;
        let len = u32::try_from(data.len()).map_err(|_| Error::RecordTooLarge(data.len()))?;
        let size = (data.len() + RECORD_OVERHEAD) as u64;
        if active.offset + size > MAX_OFFSET {
            return Err(Error::SegmentFull(active.id));
        }
        let location =
            Location::new(active.id, active.offset).ok_or(Error::SegmentFull(active.id))?;

        let mut record = Vec::with_capacity(data.len() + RECORD_OVERHEAD);
        record.put_u32_le(len);
        record.put_slice(data);
        record.put_u32_le(crc32fast::hash(data));
        write_all_at(&active.file, &record, active.offset)?;

        active.offset += size;
        active.records += 1;
        Ok(location)
    }

    /// Finish the active segment.
    ///
    /// A segment that received appends is synced and its id returned. An empty segment is
    /// deleted and `None` is returned.
    pub fn end_segment(&self) -> Result<Option<SegmentId>, Error> {
        let active = self.active().take().ok_or(Error::NoActiveSegment)?;
        if active.records == 0 {
            self.segments
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&active.id);
            drop(active.file);
            fs::remove_file(self.directory.join(segment_name(active.id)))?;
            trace!(segment = active.id, "removed empty segment");
            return Ok(None);
        }
        active.file.sync_all()?;
        debug!(
            segment = active.id,
            records = active.records,
            bytes = active.offset,
            "finished segment"
        );
        Ok(Some(active.id))
    }

    /// Read the record at `location`, verifying its checksum.
    pub fn read(&self, location: Location) -> Result<Bytes, Error> {
        let segment = location.segment();
        let file = self
            .segment(segment)
            .ok_or(Error::SegmentNotFound(segment))?;
        let size = file.metadata()?.len();
        let mut buf = Vec::new();
        read_record(&file, location, size, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Call `f` with every record of `segment`, in the order they were appended.
    ///
    /// Reading stops at the first record that runs past the end of the segment or fails its
    /// checksum (the tail of a segment that was being written when the process stopped). Returns
    /// false if the segment ended early for that reason.
    pub fn replay(
        &self,
        segment: SegmentId,
        mut f: impl FnMut(Location, &[u8]),
    ) -> Result<bool, Error> {
        let file = self
            .segment(segment)
            .ok_or(Error::SegmentNotFound(segment))?;
        let size = file.metadata()?.len();
        let mut buf = Vec::new();
        let mut offset = 0;
        let mut records = 0;
        while offset < size {
            let location = Location::new(segment, offset).ok_or(Error::SegmentFull(segment))?;
            match read_record(&file, location, size, &mut buf) {
                Ok(()) => {}
                Err(err @ (Error::ChecksumMismatch(_) | Error::RecordOutOfBounds(_))) => {
                    warn!(segment, records, ?err, "segment ends with a damaged record");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
            f(location, &buf);
            offset += (buf.len() + RECORD_OVERHEAD) as u64;
            records += 1;
        }
        trace!(segment, records, "replayed segment");
        Ok(true)
    }

    /// Ids of all segments (including the active one), in ascending order.
    pub fn segments(&self) -> Vec<SegmentId> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Total size of all segments in bytes.
    pub fn size(&self) -> Result<u64, Error> {
        let files: Vec<_> = self
            .segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut size = 0;
        for file in files {
            size += file.metadata()?.len();
        }
        Ok(size)
    }

    /// Copy every finished segment into `directory` (hard-linking where possible).
    pub fn copy_to(&self, directory: &Path) -> Result<(), Error> {
        fs::create_dir_all(directory)?;
        let active = self.active().as_ref().map(|active| active.id);
        for id in self.segments() {
            if Some(id) == active {
                continue;
            }
            let name = segment_name(id);
            let (from, to) = (self.directory.join(&name), directory.join(&name));
            match fs::hard_link(&from, &to) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    trace!(segment = id, ?err, "hard link failed, copying");
                    fs::copy(&from, &to)?;
                }
            }
        }
        debug!(?directory, "copied log");
        Ok(())
    }

    /// Flush the active segment (if any) to disk.
    pub fn sync(&self) -> Result<(), Error> {
        if let Some(active) = self.active().as_ref() {
            active.file.sync_all()?;
        }
        Ok(())
    }

    /// Id of the newest segment, or 0 if there are none.
    pub fn last_segment(&self) -> SegmentId {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Read the record at `location` of a segment that is `size` bytes long into `buf`.
fn read_record(file: &File, location: Location, size: u64, buf: &mut Vec<u8>) -> Result<(), Error> {
    let offset = location.offset();
    if offset + 4 > size {
        return Err(Error::RecordOutOfBounds(location));
    }
    let mut len = [0u8; 4];
    read_exact_at(file, &mut len, offset)?;
    let len = u32::from_le_bytes(len) as usize;
    if offset + (len + RECORD_OVERHEAD) as u64 > size {
        return Err(Error::RecordOutOfBounds(location));
    }
    buf.clear();
    buf.resize(len + 4, 0);
    read_exact_at(file, buf, offset + 4)?;

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&buf[len..]);
    if u32::from_le_bytes(checksum) != crc32fast::hash(&buf[..len]) {
        warn!(?location, "checksum mismatch");
        return Err(Error::ChecksumMismatch(location));
    }
    buf.truncate(len);
    Ok(())
}
