//! Tags, varints, and entry scanning shared by both bucket representations.

use super::Error;
use bytes::BufMut;
use std::ops::Range;

const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

const fn tag(field: u64, wire: u64) -> u64 {
    (field << 3) | wire
}

pub(crate) const BUCKET_INDEX: u64 = tag(1, WIRE_FIXED32);
pub(crate) const BUCKET_ENTRY: u64 = tag(11, WIRE_LEN);
pub(crate) const ENTRY_HASH: u64 = tag(1, WIRE_FIXED32);
pub(crate) const ENTRY_VALUE: u64 = tag(2, WIRE_FIXED64);
pub(crate) const ENTRY_KEY: u64 = tag(3, WIRE_LEN);

/// Size of the bucket index field (one tag byte and a fixed `u32`).
pub(crate) const HEADER_SIZE: usize = 5;

/// Longest LEB128 encoding of a `u64`.
const MAX_VARINT_SIZE: usize = 10;

/// Number of bytes needed to encode `value` as a varint.
pub(crate) const fn varint_size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

pub(crate) fn write_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_SIZE {
        let byte = *buf.get(*pos).ok_or(Error::Truncated)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::VarintOverflow)
}

fn read_fixed<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N], Error> {
    let end = pos.checked_add(N).ok_or(Error::Truncated)?;
    let slice = buf.get(*pos..end).ok_or(Error::Truncated)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    *pos = end;
    Ok(out)
}

/// Read a length prefix and return the range it covers (checked against `buf`).
fn read_len(buf: &[u8], pos: &mut usize) -> Result<Range<usize>, Error> {
    let len = read_varint(buf, pos)?;
    let len = usize::try_from(len).map_err(|_| Error::Truncated)?;
    let start = *pos;
    let end = start.checked_add(len).ok_or(Error::Truncated)?;
    if end > buf.len() {
        return Err(Error::Truncated);
    }
    *pos = end;
    Ok(start..end)
}

/// Write the bucket index field.
pub(crate) fn write_header(buf: &mut impl BufMut, index: u32) {
    write_varint(buf, BUCKET_INDEX);
    buf.put_u32_le(index);
}

/// Read the bucket index field, which must lead every encoded bucket.
pub(crate) fn read_header(buf: &[u8]) -> Result<u32, Error> {
    let mut pos = 0;
    match read_varint(buf, &mut pos) {
        Ok(BUCKET_INDEX) => Ok(u32::from_le_bytes(read_fixed(buf, &mut pos)?)),
        Ok(_) | Err(Error::Truncated) => Err(Error::MissingField("index")),
        Err(err) => Err(err),
    }
}

/// Size of an entry's fields (excluding its own tag and length prefix).
pub(crate) const fn entry_body_size(key_len: usize, with_value: bool) -> usize {
    let value = if with_value { 9 } else { 0 };
    HEADER_SIZE + value + 1 + varint_size(key_len as u64) + key_len
}

/// Size of a complete entry record for an entry body of `body` bytes.
pub(crate) const fn entry_record_size(body: usize) -> usize {
    1 + varint_size(body as u64) + body
}

/// Write a complete entry record. A `None` value is omitted from the encoding (and decodes as 0).
pub(crate) fn write_entry(buf: &mut impl BufMut, hash_code: i32, value: Option<i64>, key: &[u8]) {
    write_varint(buf, BUCKET_ENTRY);
    write_varint(buf, entry_body_size(key.len(), value.is_some()) as u64);
    write_varint(buf, ENTRY_HASH);
    buf.put_i32_le(hash_code);
    if let Some(value) = value {
        write_varint(buf, ENTRY_VALUE);
        buf.put_i64_le(value);
    }
    write_varint(buf, ENTRY_KEY);
    write_varint(buf, key.len() as u64);
    buf.put_slice(key);
}

/// Position and contents of one entry record inside an encoded bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EntrySpan {
    /// Offset of the record's tag.
    pub start: usize,
    /// Offset just past the record.
    pub end: usize,
    pub hash_code: i32,
    pub value: i64,
    /// Offset of the fixed 8 value bytes, if the value was encoded.
    pub value_at: Option<usize>,
    pub key: Range<usize>,
}

fn parse_entry(buf: &[u8], start: usize, body: Range<usize>) -> Result<EntrySpan, Error> {
    let end = body.end;
    let fields = &buf[..end];
    let mut pos = body.start;
    let mut hash_code = None;
    let mut value = 0;
    let mut value_at = None;
    let mut key = None;
    while pos < end {
        match read_varint(fields, &mut pos)? {
            ENTRY_HASH => hash_code = Some(i32::from_le_bytes(read_fixed(fields, &mut pos)?)),
            ENTRY_VALUE => {
                value_at = Some(pos);
                value = i64::from_le_bytes(read_fixed(fields, &mut pos)?);
            }
            ENTRY_KEY => key = Some(read_len(fields, &mut pos)?),
            other => return Err(Error::UnknownTag(other)),
        }
    }
    Ok(EntrySpan {
        start,
        end,
        hash_code: hash_code.ok_or(Error::MissingField("hash_code"))?,
        value,
        value_at,
        key: key.ok_or(Error::MissingField("key_bytes"))?,
    })
}

/// Iterate over the entry records of an encoded bucket.
///
/// Iteration stops after the first error.
pub(crate) struct Spans<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Spans<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn next_span(&mut self) -> Result<Option<EntrySpan>, Error> {
        while self.pos < self.buf.len() {
            let start = self.pos;
            match read_varint(self.buf, &mut self.pos)? {
                BUCKET_INDEX => {
                    read_fixed::<4>(self.buf, &mut self.pos)?;
                }
                BUCKET_ENTRY => {
                    let body = read_len(self.buf, &mut self.pos)?;
                    return parse_entry(self.buf, start, body).map(Some);
                }
                other => return Err(Error::UnknownTag(other)),
            }
        }
        Ok(None)
    }
}

impl Iterator for Spans<'_> {
    type Item = Result<EntrySpan, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_span() {
            Ok(span) => span.map(Ok),
            Err(err) => {
                self.pos = self.buf.len();
                Some(Err(err))
            }
        }
    }
}
