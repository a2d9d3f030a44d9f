use super::utils::{open, put_random};
use bucketmap::bucket::BucketKind;
use criterion::{black_box, criterion_group, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Items pre-loaded into the store.
const ITEMS: u64 = 100_000;

fn bench_get(c: &mut Criterion) {
    for disk_index in [false, true] {
        // Create one store per index kind so setup is not timed
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), ITEMS, BucketKind::Raw, disk_index);
        put_random(&store, ITEMS, ITEMS, 0);

        for reads in [1_000, 10_000] {
            let label = format!(
                "{}/disk_index={} reads={}",
                module_path!(),
                disk_index,
                reads
            );
            let mut rng = StdRng::seed_from_u64(42);
            let keys: Vec<u64> = (0..reads).map(|_| rng.gen_range(0..ITEMS)).collect();
            c.bench_function(&label, |b| {
                b.iter(|| {
                    for key in &keys {
                        black_box(store.get(key).unwrap());
                    }
                });
            });
        }
        store.close().unwrap();
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_get
}
