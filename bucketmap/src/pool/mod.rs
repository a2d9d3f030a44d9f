//! A fixed-capacity pool of reusable buckets.
//!
//! Commit processing loads, mutates, and serializes many buckets in quick succession. Drawing them
//! from a [BucketPool] bounds both the number of buckets alive at once and the allocations made
//! for them (a cleared bucket keeps its buffers).
//!
//! # Ownership
//!
//! [BucketPool::checkout] hands out a [PooledBucket], which is the only handle to the bucket until
//! it is dropped (or consumed by [PooledBucket::release]). At that point the bucket is cleared and
//! returned to the pool, so a bucket can neither be returned twice nor used after it was returned.
//!
//! # Lifecycle
//!
//! Pooled buckets hold a weak reference to the pool. A bucket returned after the pool is dropped
//! is simply freed.

use crate::bucket::{Bucket, BucketKind};
use std::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
    },
};

struct Inner {
    kind: BucketKind,
    capacity: usize,
    free: Mutex<Vec<Bucket>>,
    returned: Condvar,
    waits: AtomicU64,
}

impl Inner {
    fn free(&self) -> MutexGuard<'_, Vec<Bucket>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, mut bucket: Bucket) {
        bucket.clear();
        self.free().push(bucket);
        self.returned.notify_one();
    }
}

/// A thread-safe pool of pre-allocated buckets.
#[derive(Clone)]
pub struct BucketPool {
    inner: Arc<Inner>,
}

impl BucketPool {
    /// Create a pool of `capacity` empty buckets of `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, kind: BucketKind) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        let free = (0..capacity).map(|_| Bucket::new(kind)).collect();
        Self {
            inner: Arc::new(Inner {
                kind,
                capacity,
                free: Mutex::new(free),
                returned: Condvar::new(),
                waits: AtomicU64::new(0),
            }),
        }
    }

    /// Take a bucket from the pool, blocking until one is returned if the pool is exhausted.
    ///
    /// The bucket is empty and has index 0.
    pub fn checkout(&self) -> PooledBucket {
        let mut free = self.inner.free();
        if free.is_empty() {
            self.inner.waits.fetch_add(1, Ordering::Relaxed);
        }
        let bucket = loop {
            if let Some(bucket) = free.pop() {
                break bucket;
            }
            free = self
                .inner
                .returned
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        };
        self.wrap(bucket)
    }

    /// Take a bucket from the pool if one is available.
    pub fn try_checkout(&self) -> Option<PooledBucket> {
        let bucket = self.inner.free().pop()?;
        Some(self.wrap(bucket))
    }

    fn wrap(&self, bucket: Bucket) -> PooledBucket {
        PooledBucket {
            bucket: ManuallyDrop::new(bucket),
            pool: Arc::downgrade(&self.inner),
        }
    }

    pub fn kind(&self) -> BucketKind {
        self.inner.kind
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buckets currently in the pool.
    pub fn available(&self) -> usize {
        self.inner.free().len()
    }

    /// Number of checkouts that found the pool exhausted.
    pub fn waits(&self) -> u64 {
        self.inner.waits.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BucketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketPool")
            .field("kind", &self.inner.kind)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A bucket checked out of a [BucketPool].
///
/// Returned to the pool (cleared) when dropped.
pub struct PooledBucket {
    bucket: ManuallyDrop<Bucket>,
    pool: Weak<Inner>,
}

impl PooledBucket {
    /// Return the bucket to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBucket {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.bucket
    }
}

impl DerefMut for PooledBucket {
    fn deref_mut(&mut self) -> &mut Bucket {
        &mut self.bucket
    }
}

impl fmt::Debug for PooledBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledBucket").field(&*self.bucket).finish()
    }
}

impl Drop for PooledBucket {
    fn drop(&mut self) {
        // SAFETY: Drop is only called once and the bucket is not accessed afterwards.
        let bucket = unsafe { ManuallyDrop::take(&mut self.bucket) };
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(bucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::RawKeys, INVALID_VALUE};
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn test_checkout_and_release() {
        let pool = BucketPool::new(2, BucketKind::Raw);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let mut a = pool.checkout();
        let b = pool.try_checkout().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_checkout().is_none());

        // Mutate a bucket and make sure it comes back clean
        a.set_index(9);
        a.put_value(&RawKeys, &b"k".to_vec(), INVALID_VALUE, 1)
            .unwrap();
        assert_eq!(a.entry_count(), 1);
        a.release();
        drop(b);
        assert_eq!(pool.available(), 2);

        for _ in 0..2 {
            let bucket = pool.checkout();
            assert!(bucket.is_empty());
            assert_eq!(bucket.index(), 0);
            assert_eq!(bucket.kind(), BucketKind::Raw);
        }
    }

    #[test]
    fn test_exhausted_checkout_blocks() {
        let pool = BucketPool::new(1, BucketKind::Parsed);
        let first = pool.checkout();

        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn({
            let pool = pool.clone();
            move || {
                let bucket = pool.checkout();
                sender.send(()).unwrap();
                drop(bucket);
            }
        });

        // The second checkout cannot complete while the first bucket is out
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

        first.release();
        receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
        assert_eq!(pool.waits(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_after_pool_dropped() {
        let pool = BucketPool::new(1, BucketKind::Raw);
        let bucket = pool.checkout();
        drop(pool);
        bucket.release();
    }

    #[test]
    fn test_concurrent_checkouts() {
        let pool = BucketPool::new(3, BucketKind::Raw);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for j in 0..100u32 {
                        let mut bucket = pool.checkout();
                        assert!(bucket.is_empty());
                        bucket.set_index(i * 1000 + j);
                        bucket
                            .put_value(&RawKeys, &j.to_le_bytes().to_vec(), INVALID_VALUE, 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 3);
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than zero")]
    fn test_zero_capacity() {
        BucketPool::new(0, BucketKind::Raw);
    }
}
