use super::Error;
use crate::fs::write_atomic;
use bytes::{Buf, BufMut};
use commonware_codec::{DecodeExt, Encode, FixedSize, Read, ReadExt, Write};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Version of the on-disk layout written by this crate.
pub(super) const FORMAT_VERSION: u32 = 1;

/// Average number of entries a bucket is sized for.
pub const AVERAGE_BUCKET_ENTRIES: u64 = 32;

/// Largest bucket count (the next power of two must fit in a `u32`).
const MAX_BUCKETS: u64 = 1 << 31;

const METADATA_SUFFIX: &str = "_metadata.hdhm";
const INDEX_SUFFIX: &str = "_bucket_index.ll";
const LOG_SUFFIX: &str = "_log";

/// Files that make up a store named `name` in `directory`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Paths {
    pub metadata: PathBuf,
    pub index: PathBuf,
    pub log: PathBuf,
}

impl Paths {
    pub fn new(directory: &Path, name: &str) -> Self {
        Self {
            metadata: directory.join(format!("{name}{METADATA_SUFFIX}")),
            index: directory.join(format!("{name}{INDEX_SUFFIX}")),
            log: directory.join(format!("{name}{LOG_SUFFIX}")),
        }
    }
}

/// Parameters fixed when a store is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Metadata {
    pub version: u32,
    pub minimum_buckets: u32,
    pub num_buckets: u32,
}

impl Metadata {
    /// Size a new store for `map_size` live entries.
    pub fn for_size(map_size: u64) -> Result<Self, Error> {
        let minimum = (map_size / AVERAGE_BUCKET_ENTRIES).max(1);
        if minimum > MAX_BUCKETS {
            return Err(Error::InvalidConfig("map size too large"));
        }
        Ok(Self {
            version: FORMAT_VERSION,
            minimum_buckets: minimum as u32,
            num_buckets: minimum.next_power_of_two() as u32,
        })
    }

    /// Load the metadata stored at `path`, if any.
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if data.len() != Self::SIZE + 4 {
            return Err(Error::MetadataCorrupted);
        }
        let (body, mut checksum) = data.split_at(Self::SIZE);
        if crc32fast::hash(body) != checksum.get_u32_le() {
            return Err(Error::MetadataCorrupted);
        }
        let metadata = Self::decode(body)?;
        if metadata.version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(metadata.version));
        }
        if !metadata.num_buckets.is_power_of_two()
            || metadata.num_buckets < metadata.minimum_buckets
        {
            return Err(Error::MetadataCorrupted);
        }
        Ok(Some(metadata))
    }

    /// Write the metadata (with a trailing checksum) to `path`.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let mut data = self.encode().to_vec();
        let checksum = crc32fast::hash(&data);
        data.put_u32_le(checksum);
        write_atomic(path, &data)?;
        Ok(())
    }
}

impl FixedSize for Metadata {
    const SIZE: usize = u32::SIZE * 3;
}

impl Write for Metadata {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        self.minimum_buckets.write(buf);
        self.num_buckets.write(buf);
    }
}

impl Read for Metadata {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, commonware_codec::Error> {
        Ok(Self {
            version: u32::read(buf)?,
            minimum_buckets: u32::read(buf)?,
            num_buckets: u32::read(buf)?,
        })
    }
}

/// Move a store from `legacy` to `name` if only the legacy store exists.
///
/// The index file and log directory are renamed first, then the metadata is rewritten under the
/// new name, and finally the legacy metadata is removed. Returns true if a store was migrated.
pub(super) fn migrate(directory: &Path, legacy: &str, name: &str) -> Result<bool, Error> {
    let current = Paths::new(directory, name);
    if current.metadata.exists() {
        return Ok(false);
    }
    let previous = Paths::new(directory, legacy);
    let Some(metadata) = Metadata::load(&previous.metadata)? else {
        debug!(legacy, "no legacy store found");
        return Ok(false);
    };
    if previous.index.exists() {
        fs::rename(&previous.index, &current.index)?;
    }
    if previous.log.exists() {
        fs::rename(&previous.log, &current.log)?;
    }
    metadata.store(&current.metadata)?;
    fs::remove_file(&previous.metadata)?;
    info!(legacy, name, ?directory, "migrated legacy store");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 1, 1; "empty")]
    #[test_case(31, 1, 1; "below average")]
    #[test_case(64, 2, 2; "two buckets")]
    #[test_case(3_200, 100, 128; "rounded up")]
    #[test_case(32 * 1024, 1024, 1024; "power of two")]
    fn test_for_size(map_size: u64, minimum: u32, buckets: u32) {
        let metadata = Metadata::for_size(map_size).unwrap();
        assert_eq!(metadata.version, FORMAT_VERSION);
        assert_eq!(metadata.minimum_buckets, minimum);
        assert_eq!(metadata.num_buckets, buckets);
    }

    #[test]
    fn test_for_size_too_large() {
        assert!(matches!(
            Metadata::for_size(u64::MAX),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(
            Metadata::for_size(MAX_BUCKETS * AVERAGE_BUCKET_ENTRIES)
                .unwrap()
                .num_buckets,
            1 << 31
        );
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        assert_eq!(Metadata::load(&path).unwrap(), None);

        let metadata = Metadata::for_size(3_200).unwrap();
        metadata.store(&path).unwrap();
        assert_eq!(Metadata::load(&path).unwrap(), Some(metadata));

        // A flipped bit is detected
        let mut data = fs::read(&path).unwrap();
        data[5] ^= 1;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            Metadata::load(&path),
            Err(Error::MetadataCorrupted)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        Metadata {
            version: FORMAT_VERSION + 1,
            minimum_buckets: 1,
            num_buckets: 1,
        }
        .store(&path)
        .unwrap();
        assert!(matches!(
            Metadata::load(&path),
            Err(Error::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn test_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = Paths::new(dir.path(), "old");
        let current = Paths::new(dir.path(), "new");

        // Nothing to migrate
        assert!(!migrate(dir.path(), "old", "new").unwrap());

        let metadata = Metadata::for_size(64).unwrap();
        metadata.store(&legacy.metadata).unwrap();
        fs::write(&legacy.index, b"index").unwrap();
        fs::create_dir(&legacy.log).unwrap();
        fs::write(legacy.log.join("segment"), b"log").unwrap();

        assert!(migrate(dir.path(), "old", "new").unwrap());
        assert!(!legacy.metadata.exists());
        assert!(!legacy.index.exists());
        assert!(!legacy.log.exists());
        assert_eq!(Metadata::load(&current.metadata).unwrap(), Some(metadata));
        assert_eq!(fs::read(&current.index).unwrap(), b"index");
        assert_eq!(fs::read(current.log.join("segment")).unwrap(), b"log");

        // Migration only happens once
        assert!(!migrate(dir.path(), "old", "new").unwrap());
    }
}
