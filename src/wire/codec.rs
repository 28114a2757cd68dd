use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Largest count a length prefix may carry.
const MAX_LENGTH: u64 = i32::MAX as u64;

/// A length prefix never needs more than five 7-bit groups.
const MAX_LENGTH_BYTES: usize = 5;

/// Append-only writer for the job wire format.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_length(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// One presence byte, then the value only if present.
    pub fn write_optional_i32(&mut self, value: Option<i32>) {
        match value {
            Some(v) => {
                self.buf.put_u8(1);
                self.buf.put_i32_le(v);
            }
            None => self.buf.put_u8(0),
        }
    }

    /// Write a non-negative count as 7-bit groups, low group first.
    pub fn write_length(&mut self, length: usize) {
        let mut value = length as u64;
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn write_string_map(&mut self, map: &HashMap<String, String>) {
        self.write_length(map.len());
        for (key, value) in map {
            self.write_string(key);
            self.write_string(value);
        }
    }

    pub fn write_string_list<S: AsRef<str>>(&mut self, items: &[S]) {
        self.write_length(items.len());
        for item in items {
            self.write_string(item.as_ref());
        }
    }

    /// Raw bytes with no prefix. Only valid as the last field of a frame.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received payload.
///
/// Readers never require the payload to be fully consumed: newer peers may
/// append trailing fields that older readers skip.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.len() < needed {
            return Err(WireError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Any non-zero byte reads as `true`.
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_optional_i32(&mut self) -> Result<Option<i32>, WireError> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            self.read_i32().map(Some)
        }
    }

    pub fn read_length(&mut self) -> Result<usize, WireError> {
        let mut value: u64 = 0;
        for group in 0..MAX_LENGTH_BYTES {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << (7 * group);
            if byte & 0x80 == 0 {
                if value > MAX_LENGTH {
                    return Err(WireError::LengthOverflow(value));
                }
                return Ok(value as usize);
            }
        }
        Err(WireError::LengthOverflow(value))
    }

    /// A collection count. Every element occupies at least one byte, so a
    /// count larger than what is left is rejected before allocating.
    pub fn read_count(&mut self) -> Result<usize, WireError> {
        let count = self.read_length()?;
        self.ensure(count)?;
        Ok(count)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_length()?;
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        let value = std::str::from_utf8(head)
            .map_err(|_| WireError::InvalidUtf8)?
            .to_string();
        self.buf = tail;
        Ok(value)
    }

    /// Duplicate keys resolve last-write-wins.
    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>, WireError> {
        let count = self.read_count()?;
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_string()?);
        }
        Ok(items)
    }

    /// Everything left in the payload.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}
