//! Serialize, compare, and hash keys stored in buckets.
//!
//! Buckets never hold typed keys. They hold the bytes produced by a [KeySerializer] and compare
//! them against a typed key on lookup. The hash returned by [KeySerializer::hash_code] selects the
//! bucket a key lives in and is persisted alongside every entry, so it must be stable across
//! processes.

use commonware_codec::{Codec, Decode, Error as CodecError, Write};
use std::marker::PhantomData;

/// Translate keys to and from the bytes stored in a bucket.
pub trait KeySerializer: Send + Sync + 'static {
    /// The typed key.
    type Key: Send + Sync + 'static;

    /// Append the serialized form of `key` to `buf`.
    fn serialize(&self, key: &Self::Key, buf: &mut Vec<u8>);

    /// Recover a key from its serialized form.
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Key, CodecError>;

    /// Returns true if `bytes` is the serialized form of `key`.
    fn equals(&self, bytes: &[u8], key: &Self::Key) -> bool {
        let mut buf = Vec::with_capacity(bytes.len());
        self.serialize(key, &mut buf);
        buf == bytes
    }

    /// Hash `key` into the 32-bit code used to pick (and filter within) a bucket.
    ///
    /// The default hashes the serialized key with CRC32, which does not depend on the process or
    /// the compiler version.
    fn hash_code(&self, key: &Self::Key) -> i32 {
        let mut buf = Vec::new();
        self.serialize(key, &mut buf);
        crc32fast::hash(&buf) as i32
    }
}

/// Keys that are already raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawKeys;

impl KeySerializer for RawKeys {
    type Key = Vec<u8>;

    fn serialize(&self, key: &Self::Key, buf: &mut Vec<u8>) {
        buf.extend_from_slice(key);
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Key, CodecError> {
        Ok(bytes.to_vec())
    }

    fn equals(&self, bytes: &[u8], key: &Self::Key) -> bool {
        bytes == key.as_slice()
    }

    fn hash_code(&self, key: &Self::Key) -> i32 {
        crc32fast::hash(key) as i32
    }
}

/// Keys encoded with [commonware_codec].
pub struct CodecKeys<K: Codec> {
    cfg: K::Cfg,
    _phantom: PhantomData<fn() -> K>,
}

impl<K: Codec> CodecKeys<K> {
    /// Create a serializer that decodes keys with `cfg`.
    pub fn new(cfg: K::Cfg) -> Self {
        Self {
            cfg,
            _phantom: PhantomData,
        }
    }
}

impl<K: Codec<Cfg = ()>> Default for CodecKeys<K> {
    fn default() -> Self {
        Self::new(())
    }
}

impl<K: Codec> Clone for CodecKeys<K> {
    fn clone(&self) -> Self {
        Self::new(self.cfg.clone())
    }
}

impl<K> KeySerializer for CodecKeys<K>
where
    K: Codec + Send + Sync + 'static,
    K::Cfg: Send + Sync + 'static,
{
    type Key = K;

    fn serialize(&self, key: &Self::Key, buf: &mut Vec<u8>) {
        key.write(buf);
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Key, CodecError> {
        K::decode_cfg(bytes, &self.cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_keys() {
        let keys = RawKeys;
        let key = b"hello".to_vec();
        let mut buf = Vec::new();
        keys.serialize(&key, &mut buf);
        assert_eq!(buf, b"hello");
        assert!(keys.equals(&buf, &key));
        assert!(!keys.equals(b"hellO", &key));
        assert_eq!(keys.deserialize(&buf).unwrap(), key);
        assert_eq!(keys.hash_code(&key), crc32fast::hash(b"hello") as i32);
    }

    #[test]
    fn test_codec_keys() {
        let keys = CodecKeys::<u64>::default();
        let mut buf = Vec::new();
        keys.serialize(&42u64, &mut buf);
        assert_eq!(buf.len(), 8);
        assert!(keys.equals(&buf, &42));
        assert!(!keys.equals(&buf, &43));
        assert_eq!(keys.deserialize(&buf).unwrap(), 42);

        // Trailing bytes are not a valid key
        buf.push(0);
        assert!(keys.deserialize(&buf).is_err());
    }

    #[test]
    fn test_hash_code_stable() {
        // The same key always hashes the same way, regardless of the serializer instance
        let a = CodecKeys::<u64>::default();
        let b = CodecKeys::<u64>::default();
        assert_eq!(a.hash_code(&7), b.hash_code(&7));
        assert_ne!(a.hash_code(&7), a.hash_code(&8));
    }
}
