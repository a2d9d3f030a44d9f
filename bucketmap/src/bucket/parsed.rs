use super::{
    wire::{self, Spans, HEADER_SIZE},
    EntryRef, Error,
};
use crate::{keys::KeySerializer, INVALID_VALUE};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, Write};

/// A decoded bucket entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub hash_code: i32,
    pub value: i64,
    pub key_bytes: Vec<u8>,
}

impl Entry {
    pub fn new(hash_code: i32, value: i64, key_bytes: Vec<u8>) -> Self {
        Self {
            hash_code,
            value,
            key_bytes,
        }
    }

    pub fn as_entry_ref(&self) -> EntryRef<'_> {
        EntryRef {
            hash_code: self.hash_code,
            value: self.value,
            key_bytes: &self.key_bytes,
        }
    }

    /// Size of the encoded record (zero values are omitted).
    fn record_size(&self) -> usize {
        wire::entry_record_size(wire::entry_body_size(
            self.key_bytes.len(),
            self.value != 0,
        ))
    }
}

/// A bucket decoded into a list of entries when loaded.
///
/// Lookups scan the list comparing cached hash codes before key bytes. Mutations overwrite,
/// remove, or append list elements directly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedBucket {
    index: u32,
    entries: Vec<Entry>,
}

impl ParsedBucket {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            entries: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        HEADER_SIZE + self.entries.iter().map(Entry::record_size).sum::<usize>()
    }

    pub fn clear(&mut self) {
        self.index = 0;
        self.entries.clear();
    }

    /// Replace the contents with the decoding of `data`.
    ///
    /// On error the bucket is left empty.
    pub fn load(&mut self, data: &[u8]) -> Result<(), Error> {
        self.clear();
        let result = self.decode_into(data);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn decode_into(&mut self, data: &[u8]) -> Result<(), Error> {
        self.index = wire::read_header(data)?;
        for span in Spans::new(data) {
            let span = span?;
            self.entries.push(Entry::new(
                span.hash_code,
                span.value,
                data[span.key].to_vec(),
            ));
        }
        Ok(())
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn position<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
    ) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.hash_code == hash_code && keys.equals(&entry.key_bytes, key))
    }

    pub fn find_value<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
        not_found: i64,
    ) -> i64 {
        self.position(keys, hash_code, key)
            .map_or(not_found, |i| self.entries[i].value)
    }

    /// Apply one mutation. Returns true if the bucket changed.
    pub fn put_value<S: KeySerializer>(
        &mut self,
        keys: &S,
        key: &S::Key,
        expected: i64,
        value: i64,
    ) -> bool {
        let hash_code = keys.hash_code(key);
        let Some(i) = self.position(keys, hash_code, key) else {
            if value == INVALID_VALUE || expected != INVALID_VALUE {
                return false;
            }
            let mut key_bytes = Vec::new();
            keys.serialize(key, &mut key_bytes);
            self.entries.push(Entry::new(hash_code, value, key_bytes));
            return true;
        };
        if expected != INVALID_VALUE && expected != self.entries[i].value {
            return false;
        }
        if value == INVALID_VALUE {
            self.entries.remove(i);
        } else {
            self.entries[i].value = value;
        }
        true
    }
}

impl Write for ParsedBucket {
    fn write(&self, buf: &mut impl BufMut) {
        wire::write_header(buf, self.index);
        for entry in &self.entries {
            let value = (entry.value != 0).then_some(entry.value);
            wire::write_entry(buf, entry.hash_code, value, &entry.key_bytes);
        }
    }
}

impl EncodeSize for ParsedBucket {
    fn encode_size(&self) -> usize {
        self.size_in_bytes()
    }
}

impl Read for ParsedBucket {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let data = buf.copy_to_bytes(buf.remaining());
        let mut bucket = Self::default();
        bucket
            .load(&data)
            .map_err(|err| CodecError::Invalid("ParsedBucket", err.reason()))?;
        Ok(bucket)
    }
}
