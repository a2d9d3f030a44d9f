//! Commit records and rebuilding the bucket index from the log.

use super::Error;
use crate::{
    bucket::RawView,
    index::BucketIndex,
    log::{Location, Log, SegmentId},
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    Decode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, ReadRangeExt, Write,
};
use tracing::{debug, info, warn};

/// First byte of a commit record. Bucket records always start with the bucket index tag (0x0D).
const COMMIT_MARKER: u8 = 0x12;

/// Last record of every committed segment.
///
/// Buckets that become empty are dropped from the index without writing anything for them, so
/// the commit record lists them. A segment without one was never fully committed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct CommitRecord {
    pub removed: Vec<u32>,
}

impl CommitRecord {
    /// Returns true if `data` is a commit record rather than a bucket.
    pub fn matches(data: &[u8]) -> bool {
        data.first() == Some(&COMMIT_MARKER)
    }
}

impl Write for CommitRecord {
    fn write(&self, buf: &mut impl BufMut) {
        COMMIT_MARKER.write(buf);
        self.removed.write(buf);
    }
}

impl EncodeSize for CommitRecord {
    fn encode_size(&self) -> usize {
        COMMIT_MARKER.encode_size() + self.removed.encode_size()
    }
}

impl Read for CommitRecord {
    /// Maximum number of removed buckets.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max: &usize) -> Result<Self, CodecError> {
        if u8::read(buf)? != COMMIT_MARKER {
            return Err(CodecError::Invalid("CommitRecord", "marker"));
        }
        let removed = Vec::<u32>::read_range(buf, RangeCfg::from(..=*max))?;
        Ok(Self { removed })
    }
}

/// Outcome of [recover].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct Recovery {
    /// Segments whose commits were applied to the index.
    pub segments: u64,
    /// Segments skipped because they lack a commit record.
    pub incomplete: u64,
    /// Bucket records applied to the index.
    pub buckets: u64,
}

/// Bring `index` up to date with every committed segment newer than its checkpoint (or every
/// segment, if it has none).
///
/// Within a segment, every bucket record points its bucket at the record and every bucket listed
/// in the commit record is removed. A segment without a commit record is skipped.
pub(super) fn recover(index: &dyn BucketIndex, log: &Log) -> Result<Recovery, Error> {
    let checkpoint = match index.checkpoint() {
        Some(checkpoint) => checkpoint,
        None => {
            if !log.segments().is_empty() {
                info!(directory = ?log.directory(), "rebuilding index from log");
            }
            0
        }
    };
    let mut recovery = Recovery::default();
    for segment in log.segments() {
        if segment <= checkpoint {
            continue;
        }
        let Some((written, removed)) = read_segment(log, segment, index.num_buckets())? else {
            warn!(segment, "skipping incomplete commit");
            recovery.incomplete += 1;
            continue;
        };
        for (bucket, location) in &written {
            index.put(*bucket, *location)?;
        }
        for bucket in removed {
            index.remove(bucket)?;
        }
        recovery.segments += 1;
        recovery.buckets += written.len() as u64;
    }
    if recovery != Recovery::default() {
        debug!(
            checkpoint,
            segments = recovery.segments,
            incomplete = recovery.incomplete,
            buckets = recovery.buckets,
            "replayed log"
        );
    }
    Ok(recovery)
}

/// Buckets written and buckets removed by one commit.
type Changes = (Vec<(u32, Location)>, Vec<u32>);

/// Read the changes made by the commit in `segment`, or `None` if it has no commit record.
fn read_segment(log: &Log, segment: SegmentId, num_buckets: u32) -> Result<Option<Changes>, Error> {
    let mut written = Vec::new();
    let mut removed = None;
    let mut error = None;
    log.replay(segment, |location, data| {
        if error.is_some() {
            return;
        }
        let result = if CommitRecord::matches(data) {
            CommitRecord::decode_cfg(data, &(num_buckets as usize))
                .map(|record| removed = Some(record.removed))
                .map_err(Error::from)
        } else {
            RawView::new(data)
                .map(|view| written.push((view.index(), location)))
                .map_err(Error::from)
        };
        if let Err(err) = result {
            error = Some(err);
        }
    })?;
    if let Some(err) = error {
        return Err(err);
    }
    Ok(removed.map(|removed| (written, removed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::Encode;

    #[test]
    fn test_commit_record() {
        let record = CommitRecord {
            removed: vec![0, 7, 1 << 20],
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encode_size());
        assert!(CommitRecord::matches(&encoded));
        assert_eq!(CommitRecord::decode_cfg(encoded.clone(), &3).unwrap(), record);

        // Too many removals for the table
        assert!(CommitRecord::decode_cfg(encoded, &2).is_err());

        // Buckets are never mistaken for commit records
        let mut bucket = Vec::new();
        crate::bucket::wire::write_header(&mut bucket, 3);
        assert!(!CommitRecord::matches(&bucket));
        assert!(!CommitRecord::matches(&[]));

        let empty = CommitRecord::default().encode();
        assert_eq!(CommitRecord::decode_cfg(empty, &0).unwrap(), CommitRecord::default());
    }

    #[test]
    fn test_commit_record_bad_marker() {
        let mut encoded = CommitRecord::default().encode().to_vec();
        encoded[0] = 0x0d;
        assert!(matches!(
            CommitRecord::decode_cfg(&encoded[..], &0),
            Err(CodecError::Invalid("CommitRecord", "marker"))
        ));
    }
}
