//! Helpers shared by the `map` benchmarks.

use bucketmap::{
    bucket::BucketKind,
    keys::CodecKeys,
    map::{Config, Store},
};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::Path;

/// Keys are 64-bit integers encoded with the codec.
pub type Keys = CodecKeys<u64>;

/// Number of threads loading buckets during commit.
const COMMIT_CONCURRENCY: usize = 8;

/// Open (or create) a store in `directory` sized for `items` keys.
pub fn open(directory: &Path, items: u64, kind: BucketKind, disk_index: bool) -> Store<Keys> {
    let cfg = Config {
        directory: directory.to_path_buf(),
        name: "bench".into(),
        legacy_name: None,
        map_size: items,
        keys: Keys::default(),
        prefer_disk_index: disk_index,
        bucket_kind: kind,
        commit_concurrency: COMMIT_CONCURRENCY,
        bucket_pool_size: COMMIT_CONCURRENCY * 2,
    };
    Store::open(cfg, &mut Registry::default()).unwrap()
}

/// Write `count` random keys (in `0..space`) in a single session.
pub fn put_random(store: &Store<Keys>, count: u64, space: u64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut session = store.start_writing().unwrap();
    for _ in 0..count {
        session
            .put(rng.gen_range(0..space), rng.gen_range(0..i64::MAX))
            .unwrap();
    }
    session.end_writing().unwrap();
}
