//! A persistent hash map from keys to 64-bit values.
//!
//! [Store] hashes every key into one of a fixed number of buckets. Each non-empty bucket is
//! serialized (see [crate::bucket]) into a record of the [Log](crate::log::Log) and the
//! [BucketIndex](crate::index::BucketIndex) remembers where the latest record of every bucket
//! lives. A lookup costs one index access and one log read of a single bucket, which is scanned
//! without being decoded.
//!
//! # Sizing
//!
//! The number of buckets is chosen when a store is created, so that a store holding `map_size`
//! keys averages [AVERAGE_BUCKET_ENTRIES] entries per bucket (rounded up to a power of two). It
//! never changes afterwards: reopening a store with a different `map_size` logs a warning and
//! keeps the original bucket count.
//!
//! # Writing
//!
//! There is at most one writer at a time. [Store::start_writing] returns a [WriteSession] that
//! buffers mutations (grouped by bucket) until [WriteSession::end_writing]. Commit then:
//!
//! 1. Loads every touched bucket on a dedicated thread pool, keeping at most `commit_concurrency`
//!    buckets in flight, and replays that bucket's mutations in the order they were made.
//! 2. Appends each changed bucket to a new log segment and points the index at it, or removes
//!    the bucket from the index once it is empty.
//! 3. Appends a commit record listing the removed buckets and syncs the segment.
//!
//! A commit that changes no bucket leaves no segment behind. The index itself is only written
//! out by [Store::close] and [Store::snapshot], together with the newest segment it reflects.
//!
//! Readers run concurrently with a commit and observe each bucket either before or after it was
//! rewritten. A commit that fails part way is not rolled back: the error is returned and the
//! store refuses further write sessions until it is reopened.
//!
//! # Files
//!
//! A store named `name` in `directory` consists of:
//!
//! ```text
//! <name>_metadata.hdhm     format version, bucket counts, and checksum
//! <name>_bucket_index.ll   bucket index (see [crate::index])
//! <name>_log/              log segments (see [crate::log])
//! ```
//!
//! # Recovery
//!
//! When a store is opened, every segment newer than the index's checkpoint is replayed into the
//! index in id order: its bucket records point their buckets at them and its commit record
//! removes the buckets it lists. A missing or corrupt index file has no checkpoint, so the whole
//! log is replayed. Segments without a commit record (a commit interrupted by a crash or an
//! error) are skipped.
//!
//! If `legacy_name` is configured and only the legacy store exists, its files are renamed to the
//! current name when the store is opened.
//!
//! # Example
//!
//! ```rust
//! use bucketmap::{bucket::BucketKind, keys::RawKeys, map::{Config, Store}};
//! use prometheus_client::registry::Registry;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut registry = Registry::default();
//! let store = Store::open(
//!     Config {
//!         directory: dir.path().to_path_buf(),
//!         name: "accounts".into(),
//!         legacy_name: None,
//!         map_size: 1_000,
//!         keys: RawKeys,
//!         prefer_disk_index: false,
//!         bucket_kind: BucketKind::Raw,
//!         commit_concurrency: 4,
//!         bucket_pool_size: 8,
//!     },
//!     &mut registry,
//! )
//! .unwrap();
//!
//! // Buffer some mutations and commit them
//! let mut session = store.start_writing().unwrap();
//! session.put(b"alice".to_vec(), 10).unwrap();
//! session.put(b"bob".to_vec(), 20).unwrap();
//! session.end_writing().unwrap();
//!
//! assert_eq!(store.get(&b"alice".to_vec()).unwrap(), Some(10));
//! store.close().unwrap();
//! ```

mod metadata;
mod recovery;
mod session;
mod storage;

pub use metadata::AVERAGE_BUCKET_ENTRIES;
pub use session::WriteSession;
pub use storage::{Store, Validation};

use crate::bucket::BucketKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when interacting with a [Store].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("bucket error: {0}")]
    Bucket(#[from] crate::bucket::Error),
    #[error("log error: {0}")]
    Log(#[from] crate::log::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(i64),
    #[error("write session already active")]
    SessionActive,
    #[error("store failed during a previous commit")]
    Failed,
    #[error("bucket mismatch: expected {expected}, found {found}")]
    BucketMismatch { expected: u32, found: u32 },
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("metadata corrupted")]
    MetadataCorrupted,
    #[error("commit worker panicked")]
    WorkerPanicked,
}

/// Configuration for [Store] storage.
#[derive(Clone)]
pub struct Config<S> {
    /// Directory holding the store's files.
    pub directory: PathBuf,

    /// Name of the store (prefix of every file it owns).
    pub name: String,

    /// Name the store was previously opened under, if it was renamed.
    pub legacy_name: Option<String>,

    /// Expected maximum number of live keys. Only used when the store is created.
    pub map_size: u64,

    /// Serializer for keys.
    pub keys: S,

    /// Keep the bucket index on disk rather than in memory.
    pub prefer_disk_index: bool,

    /// Representation of buckets mutated during commit.
    pub bucket_kind: BucketKind,

    /// Maximum number of buckets loaded in parallel during commit.
    pub commit_concurrency: usize,

    /// Number of pooled buckets (at least `commit_concurrency`).
    pub bucket_pool_size: usize,
}
