//! Encode, decode, and mutate buckets of key-value entries.
//!
//! A bucket holds every entry whose key hashes to the same bucket number. Entries are not sorted:
//! a [ParsedBucket] keeps insertion order and a [RawBucket] keeps physical append order.
//!
//! # Format
//!
//! Buckets are encoded as a sequence of tagged fields (`tag = field << 3 | wire type`, both
//! varints). Variable-size fields are length-prefixed, hash codes and values are fixed-width
//! little-endian:
//!
//! ```text
//! +------+-----------+------+-----------+--------------+------+-----------+--------------+---
//! | 0x0D | index:u32 | 0x5A | len:varint|    Entry     | 0x5A | len:varint|    Entry     |...
//! +------+-----------+------+-----------+--------------+------+-----------+--------------+---
//!
//! Entry:
//! +------+----------+------+-----------+------+-----------+-----------+
//! | 0x0D | hash:i32 | 0x11 | value:i64 | 0x1A | len:varint| key bytes |
//! +------+----------+------+-----------+------+-----------+-----------+
//! ```
//!
//! The value field may be omitted, in which case the value is 0. The index field must come
//! first. Any tag not shown above is rejected, as is an entry without a hash code or key bytes.
//!
//! # Mutation
//!
//! Both representations implement the same `put_value(key, expected, value)` contract, where
//! [crate::INVALID_VALUE] means "delete" as a new value and "do not check" as an expected value:
//!
//! - A delete removes the entry if it exists and `expected` matches (or is not checked).
//! - An update overwrites the entry's value if it exists and `expected` matches.
//! - A missing entry is only created by an unchecked put.

mod parsed;
mod raw;
pub(crate) mod wire;

pub use parsed::{Entry, ParsedBucket};
pub use raw::{RawBucket, RawView};

use crate::keys::KeySerializer;
use bytes::BufMut;
use commonware_codec::Write;
use thiserror::Error;

/// Errors that can occur when decoding a bucket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown tag: {0:#x}")]
    UnknownTag(u64),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("truncated bucket")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
}

impl Error {
    /// Static description of the error (used when reporting through [commonware_codec::Error]).
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownTag(_) => "unknown tag",
            Self::MissingField(field) => field,
            Self::Truncated => "truncated",
            Self::VarintOverflow => "varint overflow",
        }
    }
}

/// A borrowed view of one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub hash_code: i32,
    pub value: i64,
    pub key_bytes: &'a [u8],
}

/// Representation used for buckets that are loaded, mutated, and rewritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BucketKind {
    /// Keep the encoded bytes and mutate them in place.
    #[default]
    Raw,
    /// Decode into a list of entries.
    Parsed,
}

/// A mutable bucket in either representation.
#[derive(Clone, Debug)]
pub enum Bucket {
    Raw(RawBucket),
    Parsed(ParsedBucket),
}

impl Bucket {
    /// Create an empty bucket (with index 0) of the given kind.
    pub fn new(kind: BucketKind) -> Self {
        match kind {
            BucketKind::Raw => Self::Raw(RawBucket::new()),
            BucketKind::Parsed => Self::Parsed(ParsedBucket::default()),
        }
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            Self::Raw(_) => BucketKind::Raw,
            Self::Parsed(_) => BucketKind::Parsed,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            Self::Raw(bucket) => bucket.index(),
            Self::Parsed(bucket) => bucket.index(),
        }
    }

    pub fn set_index(&mut self, index: u32) {
        match self {
            Self::Raw(bucket) => bucket.set_index(index),
            Self::Parsed(bucket) => bucket.set_index(index),
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            Self::Raw(bucket) => bucket.entry_count(),
            Self::Parsed(bucket) => bucket.entry_count(),
        }
    }

    /// Returns true if the bucket has no entries (and so must not be persisted).
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Exact size of the encoded bucket, including the index field.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Raw(bucket) => bucket.size_in_bytes(),
            Self::Parsed(bucket) => bucket.size_in_bytes(),
        }
    }

    /// Reset to an empty bucket with index 0.
    pub fn clear(&mut self) {
        match self {
            Self::Raw(bucket) => bucket.clear(),
            Self::Parsed(bucket) => bucket.clear(),
        }
    }

    /// Replace the contents with an encoded bucket. On error the bucket is left empty.
    pub fn load(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Self::Raw(bucket) => bucket.load(data),
            Self::Parsed(bucket) => bucket.load(data),
        }
    }

    /// Append the encoded bucket to `buf`.
    pub fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Raw(bucket) => buf.put_slice(bucket.as_bytes()),
            Self::Parsed(bucket) => bucket.write(buf),
        }
    }

    /// Return the value stored for `key`, or `not_found`.
    pub fn find_value<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
        not_found: i64,
    ) -> Result<i64, Error> {
        match self {
            Self::Raw(bucket) => bucket.find_value(keys, hash_code, key, not_found),
            Self::Parsed(bucket) => Ok(bucket.find_value(keys, hash_code, key, not_found)),
        }
    }

    /// Apply one mutation (see the module documentation). Returns true if the bucket changed.
    pub fn put_value<S: KeySerializer>(
        &mut self,
        keys: &S,
        key: &S::Key,
        expected: i64,
        value: i64,
    ) -> Result<bool, Error> {
        match self {
            Self::Raw(bucket) => bucket.put_value(keys, key, expected, value),
            Self::Parsed(bucket) => Ok(bucket.put_value(keys, key, expected, value)),
        }
    }

    /// Decode every entry.
    pub fn entries(&self) -> Result<Vec<EntryRef<'_>>, Error> {
        match self {
            Self::Raw(bucket) => bucket.entries(),
            Self::Parsed(bucket) => Ok(bucket.entries().iter().map(Entry::as_entry_ref).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::RawKeys, INVALID_VALUE};
    use commonware_codec::{Decode, Encode};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;
    use test_case::test_case;

    fn key(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn encode(bucket: &Bucket) -> Vec<u8> {
        let mut buf = Vec::new();
        bucket.write(&mut buf);
        buf
    }

    fn lookup(bucket: &Bucket, k: &str) -> i64 {
        let k = key(k);
        bucket
            .find_value(&RawKeys, RawKeys.hash_code(&k), &k, INVALID_VALUE)
            .unwrap()
    }

    fn sorted(bucket: &Bucket) -> Vec<(Vec<u8>, i64, i32)> {
        let mut entries: Vec<_> = bucket
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| (e.key_bytes.to_vec(), e.value, e.hash_code))
            .collect();
        entries.sort();
        entries
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_empty_bucket(kind: BucketKind) {
        let mut bucket = Bucket::new(kind);
        assert_eq!(bucket.kind(), kind);
        assert!(bucket.is_empty());
        assert_eq!(bucket.index(), 0);
        assert_eq!(bucket.size_in_bytes(), wire::HEADER_SIZE);

        bucket.set_index(77);
        let encoded = encode(&bucket);
        assert_eq!(encoded, [0x0d, 77, 0, 0, 0]);
        assert_eq!(lookup(&bucket, "missing"), INVALID_VALUE);
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_conditional_put(kind: BucketKind) {
        let keys = RawKeys;
        let k = key("k");
        let mut bucket = Bucket::new(kind);
        assert!(bucket.put_value(&keys, &k, INVALID_VALUE, 1).unwrap());
        assert!(bucket.put_value(&keys, &k, 1, 2).unwrap());
        assert_eq!(lookup(&bucket, "k"), 2);

        // Wrong expected value is a no-op
        assert!(!bucket.put_value(&keys, &k, 1, 3).unwrap());
        assert_eq!(lookup(&bucket, "k"), 2);

        // A conditional put never creates an entry
        let other = key("other");
        assert!(!bucket.put_value(&keys, &other, 2, 3).unwrap());
        assert_eq!(lookup(&bucket, "other"), INVALID_VALUE);
        assert_eq!(bucket.entry_count(), 1);
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_delete(kind: BucketKind) {
        let keys = RawKeys;
        let (a, b) = (key("a"), key("b"));
        let mut bucket = Bucket::new(kind);

        // Deleting an absent key does nothing
        assert!(!bucket
            .put_value(&keys, &a, INVALID_VALUE, INVALID_VALUE)
            .unwrap());
        assert!(bucket.is_empty());

        bucket.put_value(&keys, &a, INVALID_VALUE, 1).unwrap();
        bucket.put_value(&keys, &b, INVALID_VALUE, 2).unwrap();

        // Conditional delete with the wrong value does nothing
        assert!(!bucket.put_value(&keys, &a, 5, INVALID_VALUE).unwrap());
        assert_eq!(lookup(&bucket, "a"), 1);

        // Conditional delete with the right value removes
        assert!(bucket.put_value(&keys, &a, 1, INVALID_VALUE).unwrap());
        assert_eq!(lookup(&bucket, "a"), INVALID_VALUE);
        assert_eq!(lookup(&bucket, "b"), 2);
        assert!(!bucket.is_empty());

        // Unconditional delete of the last entry empties the bucket
        assert!(bucket
            .put_value(&keys, &b, INVALID_VALUE, INVALID_VALUE)
            .unwrap());
        assert!(bucket.is_empty());
        assert_eq!(bucket.size_in_bytes(), wire::HEADER_SIZE);
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_one_entry_per_key(kind: BucketKind) {
        let keys = RawKeys;
        let k = key("same");
        let mut bucket = Bucket::new(kind);
        for value in [5, 0, -3, 5, i64::MAX, 0, 42] {
            bucket.put_value(&keys, &k, INVALID_VALUE, value).unwrap();
            assert_eq!(bucket.entry_count(), 1);
            assert_eq!(lookup(&bucket, "same"), value);
            assert_eq!(bucket.size_in_bytes(), encode(&bucket).len());
        }
    }

    #[test_case(BucketKind::Raw, BucketKind::Raw; "raw to raw")]
    #[test_case(BucketKind::Raw, BucketKind::Parsed; "raw to parsed")]
    #[test_case(BucketKind::Parsed, BucketKind::Raw; "parsed to raw")]
    #[test_case(BucketKind::Parsed, BucketKind::Parsed; "parsed to parsed")]
    fn test_round_trip(from: BucketKind, to: BucketKind) {
        let keys = RawKeys;
        for count in [0usize, 1, 2, 17, 100] {
            let mut bucket = Bucket::new(from);
            bucket.set_index(count as u32 + 3);
            for i in 0..count {
                // Include zero values, which the parsed encoding omits
                let value = if i % 5 == 0 { 0 } else { i as i64 * -7 };
                bucket
                    .put_value(&keys, &key(&format!("key-{i}")), INVALID_VALUE, value)
                    .unwrap();
            }
            let encoded = encode(&bucket);
            assert_eq!(encoded.len(), bucket.size_in_bytes());

            let mut decoded = Bucket::new(to);
            decoded.load(&encoded).unwrap();
            assert_eq!(decoded.index(), bucket.index());
            assert_eq!(decoded.entry_count(), count);
            assert_eq!(sorted(&decoded), sorted(&bucket));
            assert_eq!(decoded.size_in_bytes(), encode(&decoded).len());
        }
    }

    #[test]
    fn test_raw_updates_omitted_value() {
        // A bucket written by the parsed representation omits zero values
        let keys = RawKeys;
        let mut parsed = Bucket::new(BucketKind::Parsed);
        parsed.put_value(&keys, &key("z"), INVALID_VALUE, 0).unwrap();
        parsed.put_value(&keys, &key("y"), INVALID_VALUE, 9).unwrap();

        let mut raw = Bucket::new(BucketKind::Raw);
        raw.load(&encode(&parsed)).unwrap();
        assert_eq!(lookup(&raw, "z"), 0);

        // Conditional update against the implicit zero
        assert!(raw.put_value(&keys, &key("z"), 0, 11).unwrap());
        assert_eq!(lookup(&raw, "z"), 11);
        assert_eq!(lookup(&raw, "y"), 9);
        assert_eq!(raw.entry_count(), 2);
        assert_eq!(raw.size_in_bytes(), encode(&raw).len());
    }

    #[test]
    fn test_raw_delete_keeps_capacity() {
        let keys = RawKeys;
        let mut bucket = RawBucket::new();
        for i in 0..50 {
            bucket
                .put_value(&keys, &key(&format!("key-{i}")), INVALID_VALUE, i)
                .unwrap();
        }
        let capacity = bucket.capacity();
        let size = bucket.size_in_bytes();

        // Remove an entry in the middle and make sure the rest is intact
        assert!(bucket
            .put_value(&keys, &key("key-25"), INVALID_VALUE, INVALID_VALUE)
            .unwrap());
        assert!(bucket.size_in_bytes() < size);
        assert_eq!(bucket.capacity(), capacity);
        assert_eq!(bucket.entry_count(), 49);
        for i in 0..50 {
            let k = key(&format!("key-{i}"));
            let expected = if i == 25 { INVALID_VALUE } else { i };
            assert_eq!(
                bucket
                    .find_value(&keys, keys.hash_code(&k), &k, INVALID_VALUE)
                    .unwrap(),
                expected
            );
        }

        // Clearing keeps the allocation too
        bucket.clear();
        assert!(bucket.is_empty());
        assert_eq!(bucket.capacity(), capacity);
    }

    #[test]
    fn test_hash_collision() {
        // Two different keys with the same hash code must be told apart by their bytes
        struct Colliding;
        impl KeySerializer for Colliding {
            type Key = Vec<u8>;
            fn serialize(&self, key: &Self::Key, buf: &mut Vec<u8>) {
                buf.extend_from_slice(key);
            }
            fn deserialize(&self, bytes: &[u8]) -> Result<Self::Key, commonware_codec::Error> {
                Ok(bytes.to_vec())
            }
            fn hash_code(&self, _: &Self::Key) -> i32 {
                7
            }
        }

        for kind in [BucketKind::Raw, BucketKind::Parsed] {
            let mut bucket = Bucket::new(kind);
            bucket
                .put_value(&Colliding, &key("a"), INVALID_VALUE, 1)
                .unwrap();
            bucket
                .put_value(&Colliding, &key("b"), INVALID_VALUE, 2)
                .unwrap();
            assert_eq!(bucket.entry_count(), 2);
            assert_eq!(
                bucket
                    .find_value(&Colliding, 7, &key("a"), INVALID_VALUE)
                    .unwrap(),
                1
            );
            assert_eq!(
                bucket
                    .find_value(&Colliding, 7, &key("b"), INVALID_VALUE)
                    .unwrap(),
                2
            );
            assert_eq!(
                bucket
                    .find_value(&Colliding, 8, &key("a"), INVALID_VALUE)
                    .unwrap(),
                INVALID_VALUE
            );
        }
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_load_rejects_corruption(kind: BucketKind) {
        let keys = RawKeys;
        let mut bucket = Bucket::new(kind);
        bucket.set_index(4);
        bucket.put_value(&keys, &key("a"), INVALID_VALUE, 1).unwrap();
        let mut encoded = encode(&bucket);

        // Unknown top-level field
        let mut unknown = encoded.clone();
        unknown.extend_from_slice(&[0x15, 0, 0, 0, 0]);
        let mut target = Bucket::new(kind);
        assert_eq!(target.load(&unknown), Err(Error::UnknownTag(0x15)));
        assert!(target.is_empty());
        assert_eq!(target.index(), 0);

        // Missing index
        assert_eq!(
            target.load(&encoded[wire::HEADER_SIZE..]),
            Err(Error::MissingField("index"))
        );

        // Truncated entry
        encoded.pop();
        assert_eq!(target.load(&encoded), Err(Error::Truncated));
    }

    #[test]
    fn test_parsed_codec() {
        let keys = RawKeys;
        let mut bucket = ParsedBucket::new(12);
        bucket.put_value(&keys, &key("x"), INVALID_VALUE, 100);
        bucket.put_value(&keys, &key("y"), INVALID_VALUE, 0);
        let encoded = bucket.encode();
        assert_eq!(encoded.len(), bucket.size_in_bytes());
        let decoded = ParsedBucket::decode_cfg(encoded, &()).unwrap();
        assert_eq!(decoded, bucket);

        // Insertion order is preserved
        let order: Vec<_> = decoded.entries().iter().map(|e| e.key_bytes.clone()).collect();
        assert_eq!(order, vec![key("x"), key("y")]);

        assert!(ParsedBucket::decode_cfg(&[0x15u8, 0, 0, 0, 0][..], &()).is_err());
    }

    #[test_case(BucketKind::Raw; "raw")]
    #[test_case(BucketKind::Parsed; "parsed")]
    fn test_random_against_model(kind: BucketKind) {
        let keys = RawKeys;
        let mut rng = StdRng::seed_from_u64(kind as u64);
        let mut bucket = Bucket::new(kind);
        let mut model: HashMap<Vec<u8>, i64> = HashMap::new();
        for _ in 0..2_000 {
            let k = key(&format!("key-{}", rng.gen_range(0..40)));
            let current = model.get(&k).copied();
            let expected = match rng.gen_range(0..3) {
                0 => INVALID_VALUE,
                1 => current.unwrap_or(INVALID_VALUE),
                _ => rng.gen_range(0..4),
            };
            let value = if rng.gen_bool(0.3) {
                INVALID_VALUE
            } else {
                rng.gen_range(0..4)
            };

            let matches = expected == INVALID_VALUE || Some(expected) == current;
            match (current, value == INVALID_VALUE) {
                (Some(_), true) if matches => {
                    model.remove(&k);
                }
                (Some(_), false) if matches => {
                    model.insert(k.clone(), value);
                }
                (None, false) if expected == INVALID_VALUE => {
                    model.insert(k.clone(), value);
                }
                _ => {}
            }
            bucket.put_value(&keys, &k, expected, value).unwrap();

            assert_eq!(bucket.entry_count(), model.len());
            assert_eq!(bucket.size_in_bytes(), encode(&bucket).len());
        }
        for (k, v) in &model {
            assert_eq!(
                bucket
                    .find_value(&keys, keys.hash_code(k), k, INVALID_VALUE)
                    .unwrap(),
                *v
            );
        }
    }
}
