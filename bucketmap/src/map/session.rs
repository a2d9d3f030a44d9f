use super::{recovery::CommitRecord, storage::WriterSlot, Error, Store};
use crate::{keys::KeySerializer, log::SegmentId, pool::PooledBucket, INVALID_VALUE};
use commonware_codec::Encode;
use std::{
    collections::HashMap,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, mpsc},
};
use tracing::{debug, trace, warn};

/// A buffered `put_value` call.
struct Mutation<K> {
    key: K,
    expected: i64,
    value: i64,
}

/// What [store_bucket] did with an applied bucket.
enum Stored {
    Unchanged,
    Written,
    Removed(u32),
}

/// A bucket after its mutations were applied.
struct Applied {
    bucket: PooledBucket,
    indexed: bool,
    changed: bool,
}

/// Buffers mutations against a [Store] until [WriteSession::end_writing].
///
/// Holding a session is the only way to mutate the store. Readers never observe buffered
/// mutations. Dropping a session without ending it discards everything it buffered.
pub struct WriteSession<'a, S: KeySerializer> {
    store: &'a Store<S>,
    _slot: WriterSlot<'a>,
    pending: HashMap<u32, Vec<Mutation<S::Key>>>,
    mutations: usize,
}

impl<'a, S: KeySerializer> WriteSession<'a, S> {
    pub(super) fn new(store: &'a Store<S>, slot: WriterSlot<'a>) -> Self {
        trace!("started write session");
        Self {
            store,
            _slot: slot,
            pending: HashMap::new(),
            mutations: 0,
        }
    }

    fn push(&mut self, key: S::Key, expected: i64, value: i64) {
        let bucket = self.store.bucket_for(self.store.keys.hash_code(&key));
        self.pending.entry(bucket).or_default().push(Mutation {
            key,
            expected,
            value,
        });
        self.mutations += 1;
        self.store.pending_mutations.set(self.mutations as i64);
    }

    /// Set `key` to `value`.
    pub fn put(&mut self, key: S::Key, value: i64) -> Result<(), Error> {
        self.put_if_equal(key, INVALID_VALUE, value)
    }

    /// Set `key` to `value` if its current value is `expected`.
    ///
    /// A key that does not exist is never created by a conditional put.
    pub fn put_if_equal(&mut self, key: S::Key, expected: i64, value: i64) -> Result<(), Error> {
        if value == INVALID_VALUE {
            return Err(Error::InvalidValue(value));
        }
        self.push(key, expected, value);
        Ok(())
    }

    /// Remove `key`.
    pub fn delete(&mut self, key: S::Key) -> Result<(), Error> {
        self.delete_if_equal(key, INVALID_VALUE)
    }

    /// Remove `key` if its current value is `expected`.
    pub fn delete_if_equal(&mut self, key: S::Key, expected: i64) -> Result<(), Error> {
        self.push(key, expected, INVALID_VALUE);
        Ok(())
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.mutations
    }

    /// Apply all buffered mutations and end the session.
    ///
    /// Returns the log segment holding the commit, or `None` if no bucket changed. If the commit
    /// fails, some buckets may already point at their new contents and the store refuses further
    /// sessions.
    pub fn end_writing(mut self) -> Result<Option<SegmentId>, Error> {
        let pending = mem::take(&mut self.pending);
        let mutations = mem::replace(&mut self.mutations, 0);
        let store = self.store;
        let result = commit(store, pending);
        store.pending_mutations.set(0);
        match &result {
            Ok(segment) => debug!(mutations, ?segment, "committed write session"),
            Err(err) => {
                store.failed.store(true, Ordering::Release);
                warn!(mutations, ?err, "commit failed");
            }
        }
        result
    }
}

impl<S: KeySerializer> Drop for WriteSession<'_, S> {
    fn drop(&mut self) {
        if self.mutations > 0 {
            warn!(mutations = self.mutations, "discarding uncommitted mutations");
            self.store.pending_mutations.set(0);
        }
    }
}

/// Load `bucket` (or start it empty) and replay `chain` against it.
fn load_and_apply<S: KeySerializer>(
    store: &Store<S>,
    bucket: u32,
    chain: Vec<Mutation<S::Key>>,
) -> Result<Applied, Error> {
    let mut pooled = store.pool.checkout();
    let location = store.index.get(bucket)?;
    match location {
        Some(location) => pooled.load(&store.read_bucket(bucket, location)?)?,
        None => pooled.set_index(bucket),
    }
    let mut changed = false;
    for Mutation {
        key,
        expected,
        value,
    } in chain
    {
        changed |= pooled.put_value(&store.keys, &key, expected, value)?;
    }
    Ok(Applied {
        bucket: pooled,
        indexed: location.is_some(),
        changed,
    })
}

/// Persist an applied bucket: append it to the log, or drop it from the index once empty.
fn store_bucket<S: KeySerializer>(
    store: &Store<S>,
    applied: Applied,
    buf: &mut Vec<u8>,
) -> Result<Stored, Error> {
    if !applied.changed {
        return Ok(Stored::Unchanged);
    }
    let bucket = &applied.bucket;
    if bucket.is_empty() {
        if !applied.indexed {
            return Ok(Stored::Unchanged);
        }
        store.index.remove(bucket.index())?;
        store.buckets_removed.inc();
        trace!(bucket = bucket.index(), "removed bucket");
        return Ok(Stored::Removed(bucket.index()));
    }
    buf.clear();
    bucket.write(buf);
    let location = store.log.append(buf)?;
    store.index.put(bucket.index(), location)?;
    store.buckets_written.inc();
    trace!(
        bucket = bucket.index(),
        entries = bucket.entry_count(),
        ?location,
        "stored bucket"
    );
    Ok(Stored::Written)
}

/// Load and mutate buckets on the worker pool, storing each as soon as it is ready.
///
/// At most `commit_concurrency` buckets are being loaded (or waiting to be stored) at once.
/// Returns the changes to record in the commit record.
fn apply<S: KeySerializer>(
    store: &Store<S>,
    pending: HashMap<u32, Vec<Mutation<S::Key>>>,
) -> Result<(bool, CommitRecord), Error> {
    let (sender, receiver) = mpsc::channel();
    let receive = || -> Result<Applied, Error> {
        receiver.recv().map_err(|_| Error::WorkerPanicked)?
    };
    let mut buf = Vec::new();
    let mut changed = false;
    let mut record = CommitRecord::default();
    let mut store_applied = |applied: Applied| -> Result<(), Error> {
        match store_bucket(store, applied, &mut buf)? {
            Stored::Unchanged => {}
            Stored::Written => changed = true,
            Stored::Removed(bucket) => {
                changed = true;
                record.removed.push(bucket);
            }
        }
        Ok(())
    };
    store.workers.in_place_scope(|scope| {
        let mut in_flight = 0;
        for (bucket, chain) in pending {
            if in_flight == store.commit_concurrency {
                let applied = receive()?;
                in_flight -= 1;
                store_applied(applied)?;
            }
            let sender = sender.clone();
            scope.spawn(move |_| {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    load_and_apply(store, bucket, chain)
                }))
                .unwrap_or_else(|_| Err(Error::WorkerPanicked));
                let _ = sender.send(result);
            });
            in_flight += 1;
        }
        // Workers hold the only senders left, so a lost result ends `recv`
        drop(sender);
        while in_flight > 0 {
            let applied = receive()?;
            in_flight -= 1;
            store_applied(applied)?;
        }
        Ok::<_, Error>(())
    })?;
    Ok((changed, record))
}

/// Commit `pending` into a new log segment, ending with a [CommitRecord] if anything changed.
fn commit<S: KeySerializer>(
    store: &Store<S>,
    pending: HashMap<u32, Vec<Mutation<S::Key>>>,
) -> Result<Option<SegmentId>, Error> {
    if pending.is_empty() {
        return Ok(None);
    }
    let buckets = pending.len();
    store.log.start_segment()?;
    let result = apply(store, pending).and_then(|(changed, record)| {
        if changed {
            store.log.append(&record.encode())?;
        }
        Ok(record.removed.len())
    });
    let removed = match result {
        Ok(removed) => removed,
        Err(err) => {
            if let Err(end) = store.log.end_segment() {
                warn!(?end, "failed to finish segment of failed commit");
            }
            return Err(err);
        }
    };
    let segment = store.log.end_segment()?;
    store.commits.inc();
    store.indexed_buckets.set(store.index.occupied() as i64);
    debug!(buckets, removed, ?segment, "applied mutations");
    Ok(segment)
}
