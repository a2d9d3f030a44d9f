use super::{
    metadata::{migrate, Metadata, Paths},
    recovery::recover,
    Config, Error, WriteSession,
};
use crate::{
    bucket::RawView,
    index::{BucketIndex, DiskIndex, MemoryIndex},
    keys::KeySerializer,
    log::{self, Location, Log},
    pool::BucketPool,
    INVALID_VALUE,
};
use bytes::Bytes;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Exclusive right to mutate a [Store], released when dropped.
pub(super) struct WriterSlot<'a> {
    held: &'a AtomicBool,
}

impl<'a> WriterSlot<'a> {
    fn claim(held: &'a AtomicBool) -> Option<Self> {
        held.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { held })
    }
}

impl Drop for WriterSlot<'_> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Result of [Store::validate].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    /// Number of non-empty buckets.
    pub buckets: u64,
    /// Number of entries across all buckets.
    pub entries: u64,
    /// Entries whose key does not hash to the bucket that holds them.
    pub misplaced: u64,
}

/// Implementation of the persistent hash map.
pub struct Store<S: KeySerializer> {
    directory: PathBuf,
    name: String,
    paths: Paths,
    metadata: Metadata,

    pub(super) keys: S,
    pub(super) index: Box<dyn BucketIndex>,
    pub(super) log: Log,
    pub(super) pool: BucketPool,
    pub(super) workers: rayon::ThreadPool,
    pub(super) commit_concurrency: usize,

    writer: AtomicBool,
    pub(super) failed: AtomicBool,

    gets: Counter,
    pub(super) commits: Counter,
    pub(super) buckets_written: Counter,
    pub(super) buckets_removed: Counter,
    pub(super) pending_mutations: Gauge,
    pub(super) indexed_buckets: Gauge,
}

impl<S: KeySerializer> Store<S> {
    /// Open the store described by `cfg`, creating it if it does not exist.
    ///
    /// Metrics are registered on `registry`.
    pub fn open(cfg: Config<S>, registry: &mut Registry) -> Result<Self, Error> {
        if cfg.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty"));
        }
        if cfg.map_size == 0 {
            return Err(Error::InvalidConfig("map size must be greater than zero"));
        }
        if cfg.commit_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "commit concurrency must be greater than zero",
            ));
        }
        if cfg.bucket_pool_size < cfg.commit_concurrency {
            return Err(Error::InvalidConfig(
                "bucket pool must be at least as large as commit concurrency",
            ));
        }
        fs::create_dir_all(&cfg.directory)?;

        // Adopt a store written under the previous name
        if let Some(legacy) = &cfg.legacy_name {
            if legacy != &cfg.name {
                migrate(&cfg.directory, legacy, &cfg.name)?;
            }
        }

        // The bucket count is fixed once the store exists
        let paths = Paths::new(&cfg.directory, &cfg.name);
        let requested = Metadata::for_size(cfg.map_size)?;
        let metadata = match Metadata::load(&paths.metadata)? {
            Some(metadata) => {
                if metadata.minimum_buckets != requested.minimum_buckets {
                    warn!(
                        stored = metadata.minimum_buckets,
                        requested = requested.minimum_buckets,
                        "ignoring requested size of existing store"
                    );
                }
                metadata
            }
            None => {
                requested.store(&paths.metadata)?;
                requested
            }
        };

        let index: Box<dyn BucketIndex> = if cfg.prefer_disk_index {
            Box::new(DiskIndex::open(&paths.index, metadata.num_buckets)?)
        } else {
            Box::new(MemoryIndex::open(&paths.index, metadata.num_buckets)?)
        };
        let log = Log::init(log::Config {
            directory: paths.log.clone(),
        })?;

        // Bring the index up to date with commits made since it was last written
        let checkpoint = index.checkpoint();
        let recovery = recover(index.as_ref(), &log)?;
        if checkpoint.is_none() || recovery.segments > 0 {
            index.sync(log.last_segment())?;
        }
        let pool = BucketPool::new(cfg.bucket_pool_size, cfg.bucket_kind);
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.commit_concurrency)
            .thread_name(|i| format!("bucketmap-commit-{i}"))
            .build()?;

        // Initialize metrics
        let gets = Counter::default();
        let commits = Counter::default();
        let buckets_written = Counter::default();
        let buckets_removed = Counter::default();
        let pending_mutations = Gauge::default();
        let indexed_buckets = Gauge::default();
        registry.register("gets", "Number of gets performed", gets.clone());
        registry.register("commits", "Number of write sessions committed", commits.clone());
        registry.register(
            "buckets_written",
            "Number of buckets appended to the log",
            buckets_written.clone(),
        );
        registry.register(
            "buckets_removed",
            "Number of buckets removed from the index",
            buckets_removed.clone(),
        );
        registry.register(
            "pending_mutations",
            "Number of mutations buffered by the active write session",
            pending_mutations.clone(),
        );
        registry.register(
            "indexed_buckets",
            "Number of non-empty buckets",
            indexed_buckets.clone(),
        );
        indexed_buckets.set(index.occupied() as i64);

        debug!(
            directory = ?cfg.directory,
            name = %cfg.name,
            num_buckets = metadata.num_buckets,
            indexed = index.occupied(),
            ?checkpoint,
            replayed = recovery.segments,
            kind = ?cfg.bucket_kind,
            disk_index = cfg.prefer_disk_index,
            "opened store"
        );
        Ok(Self {
            directory: cfg.directory,
            name: cfg.name,
            paths,
            metadata,
            keys: cfg.keys,
            index,
            log,
            pool,
            workers,
            commit_concurrency: cfg.commit_concurrency,
            writer: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            gets,
            commits,
            buckets_written,
            buckets_removed,
            pending_mutations,
            indexed_buckets,
        })
    }

    /// Bucket that `hash_code` maps to.
    pub(super) fn bucket_for(&self, hash_code: i32) -> u32 {
        (hash_code as u32) & (self.metadata.num_buckets - 1)
    }

    /// Number of buckets (a power of two).
    pub fn num_buckets(&self) -> u32 {
        self.metadata.num_buckets
    }

    /// Number of buckets the store was sized for when created.
    pub fn minimum_buckets(&self) -> u32 {
        self.metadata.minimum_buckets
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the bucket stored at `location` and check that it is `bucket`.
    pub(super) fn read_bucket(&self, bucket: u32, location: Location) -> Result<Bytes, Error> {
        let data = self.log.read(location)?;
        let found = RawView::new(&data)?.index();
        if found != bucket {
            return Err(Error::BucketMismatch {
                expected: bucket,
                found,
            });
        }
        Ok(data)
    }

    /// Get the value of `key`.
    ///
    /// Reads never wait for (or observe the buffered mutations of) a write session.
    pub fn get(&self, key: &S::Key) -> Result<Option<i64>, Error> {
        self.gets.inc();
        let hash_code = self.keys.hash_code(key);
        let bucket = self.bucket_for(hash_code);
        let Some(location) = self.index.get(bucket)? else {
            return Ok(None);
        };
        let data = self.read_bucket(bucket, location)?;
        let value = RawView::new(&data)?.find_value(&self.keys, hash_code, key, INVALID_VALUE)?;
        Ok((value != INVALID_VALUE).then_some(value))
    }

    /// Start buffering mutations.
    ///
    /// Only one session (or snapshot) may be active at a time. A store whose last commit failed
    /// refuses new sessions.
    pub fn start_writing(&self) -> Result<WriteSession<'_, S>, Error> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Failed);
        }
        let slot = WriterSlot::claim(&self.writer).ok_or(Error::SessionActive)?;
        Ok(WriteSession::new(self, slot))
    }

    /// Write a copy of the store into `directory`, which can then be opened as a store with the
    /// same name.
    pub fn snapshot(&self, directory: &Path) -> Result<(), Error> {
        let _slot = WriterSlot::claim(&self.writer).ok_or(Error::SessionActive)?;
        let target = Paths::new(directory, &self.name);
        if target.metadata == self.paths.metadata {
            return Err(Error::InvalidConfig("snapshot directory must differ"));
        }
        fs::create_dir_all(directory)?;
        self.metadata.store(&target.metadata)?;
        self.index.persist(&target.index, self.log.last_segment())?;
        self.log.copy_to(&target.log)?;
        debug!(?directory, name = %self.name, "created snapshot");
        Ok(())
    }

    /// Check every indexed bucket: its header, the encoding of each entry, and that each key
    /// hashes to the bucket holding it.
    pub fn validate(&self) -> Result<Validation, Error> {
        let mut validation = Validation::default();
        for bucket in 0..self.num_buckets() {
            let Some(location) = self.index.get(bucket)? else {
                continue;
            };
            let data = self.read_bucket(bucket, location)?;
            validation.buckets += 1;
            for entry in RawView::new(&data)?.entries()? {
                validation.entries += 1;
                let key = self.keys.deserialize(entry.key_bytes)?;
                let hash_code = self.keys.hash_code(&key);
                if hash_code != entry.hash_code || self.bucket_for(hash_code) != bucket {
                    warn!(bucket, hash_code = entry.hash_code, "misplaced entry");
                    validation.misplaced += 1;
                }
            }
        }
        debug!(
            buckets = validation.buckets,
            entries = validation.entries,
            misplaced = validation.misplaced,
            "validated store"
        );
        Ok(validation)
    }

    /// Flush the log and index and close the store.
    pub fn close(self) -> Result<(), Error> {
        self.log.sync()?;
        self.index.sync(self.log.last_segment())?;
        debug!(name = %self.name, "closed store");
        Ok(())
    }
}
