use super::{
    wire::{self, EntrySpan, Spans, HEADER_SIZE},
    EntryRef, Error,
};
use crate::{keys::KeySerializer, INVALID_VALUE};

/// Read-only view over an encoded bucket.
///
/// Lookups compare the hash code of each entry before comparing key bytes, and never decode
/// entries into owned values.
#[derive(Clone, Copy, Debug)]
pub struct RawView<'a> {
    buf: &'a [u8],
    index: u32,
}

impl<'a> RawView<'a> {
    /// Wrap an encoded bucket. Only the header is checked here; entries are checked as they are
    /// scanned.
    pub fn new(buf: &'a [u8]) -> Result<Self, Error> {
        let index = wire::read_header(buf)?;
        Ok(Self { buf, index })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Find the record of the entry for `key`, if any.
    pub(crate) fn find<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
    ) -> Result<Option<EntrySpan>, Error> {
        for span in Spans::new(self.buf) {
            let span = span?;
            if span.hash_code == hash_code && keys.equals(&self.buf[span.key.clone()], key) {
                return Ok(Some(span));
            }
        }
        Ok(None)
    }

    /// Return the value stored for `key`, or `not_found`.
    pub fn find_value<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
        not_found: i64,
    ) -> Result<i64, Error> {
        Ok(self
            .find(keys, hash_code, key)?
            .map_or(not_found, |span| span.value))
    }

    /// Decode every entry (in physical order).
    pub fn entries(&self) -> Result<Vec<EntryRef<'a>>, Error> {
        let buf = self.buf;
        Spans::new(buf)
            .map(|span| {
                span.map(|span| EntryRef {
                    hash_code: span.hash_code,
                    value: span.value,
                    key_bytes: &buf[span.key],
                })
            })
            .collect()
    }
}

/// A bucket kept in its encoded form.
///
/// Inserts append a record to the end of the buffer (growing it when needed). Deletes shift the
/// following records left over the removed one; the allocation is never shrunk, so a bucket that
/// is cleared and reused keeps its capacity.
#[derive(Clone, Debug)]
pub struct RawBucket {
    buf: Vec<u8>,
    entries: usize,
    scratch: Vec<u8>,
}

impl Default for RawBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawBucket {
    /// Create an empty bucket with index 0.
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        wire::write_header(&mut buf, 0);
        Self {
            buf,
            entries: 0,
            scratch: Vec::new(),
        }
    }

    fn view(&self) -> RawView<'_> {
        RawView {
            buf: &self.buf,
            index: self.index(),
        }
    }

    pub fn index(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[1..HEADER_SIZE]);
        u32::from_le_bytes(bytes)
    }

    pub fn set_index(&mut self, index: u32) {
        self.buf[1..HEADER_SIZE].copy_from_slice(&index.to_le_bytes());
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Allocated capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Reset to an empty bucket with index 0, keeping allocations.
    pub fn clear(&mut self) {
        self.buf.clear();
        wire::write_header(&mut self.buf, 0);
        self.entries = 0;
        self.scratch.clear();
    }

    /// Replace the contents with a copy of `data`, which is fully checked.
    ///
    /// On error the bucket is left empty.
    pub fn load(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = wire::read_header(data).and_then(|_| {
            Spans::new(data).try_fold(0usize, |count, span| span.map(|_| count + 1))
        });
        match result {
            Ok(entries) => {
                self.buf.clear();
                self.buf.extend_from_slice(data);
                self.entries = entries;
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    pub fn find_value<S: KeySerializer>(
        &self,
        keys: &S,
        hash_code: i32,
        key: &S::Key,
        not_found: i64,
    ) -> Result<i64, Error> {
        self.view().find_value(keys, hash_code, key, not_found)
    }

    pub fn entries(&self) -> Result<Vec<EntryRef<'_>>, Error> {
        self.view().entries()
    }

    /// Apply one mutation. Returns true if the bucket changed.
    pub fn put_value<S: KeySerializer>(
        &mut self,
        keys: &S,
        key: &S::Key,
        expected: i64,
        value: i64,
    ) -> Result<bool, Error> {
        let hash_code = keys.hash_code(key);
        let Some(span) = self.view().find(keys, hash_code, key)? else {
            if value == INVALID_VALUE || expected != INVALID_VALUE {
                return Ok(false);
            }
            self.scratch.clear();
            keys.serialize(key, &mut self.scratch);
            wire::write_entry(&mut self.buf, hash_code, Some(value), &self.scratch);
            self.entries += 1;
            return Ok(true);
        };
        if expected != INVALID_VALUE && expected != span.value {
            return Ok(false);
        }
        if value == INVALID_VALUE {
            self.remove(&span);
            return Ok(true);
        }
        match span.value_at {
            Some(at) => self.buf[at..at + 8].copy_from_slice(&value.to_le_bytes()),
            None => {
                // No value field to overwrite, so re-append the entry with one
                self.scratch.clear();
                self.scratch.extend_from_slice(&self.buf[span.key.clone()]);
                self.remove(&span);
                wire::write_entry(&mut self.buf, hash_code, Some(value), &self.scratch);
                self.entries += 1;
            }
        }
        Ok(true)
    }

    fn remove(&mut self, span: &EntrySpan) {
        self.buf.copy_within(span.end.., span.start);
        self.buf.truncate(self.buf.len() - (span.end - span.start));
        self.entries -= 1;
    }
}
