//! Primitive field codecs for the metadata section: 7z variable-length
//! numbers, MSB-first bit vectors and little-endian fixed-width fields.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{ArchiveError, Result};

// ── Reading ───────────────────────────────────────────────────────────────────

/// Cursor over an in-memory metadata buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize { self.pos }
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }
    pub fn is_empty(&self) -> bool { self.remaining() == 0 }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        let n = usize::try_from(n).map_err(|_| truncated())?;
        self.take(n).map(|_| ())
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// 7z number: the count of leading one bits in the first byte is the
    /// number of extra little-endian bytes; the rest of the first byte holds
    /// the high bits.
    pub fn read_number(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = u64::from(first & mask.wrapping_sub(1));
                value |= high << (8 * i);
                return Ok(value);
            }
            value |= u64::from(self.read_u8()?) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    /// A number that is used as a size or position; must fit in `i64`.
    pub fn read_size(&mut self) -> Result<u64> {
        let v = self.read_number()?;
        if v > i64::MAX as u64 {
            return Err(ArchiveError::corrupted(format!("number {v:#x} out of range")));
        }
        Ok(v)
    }

    /// A count bounded by `limit`, returned as `usize`.
    pub fn read_count(&mut self, limit: usize) -> Result<usize> {
        let v = self.read_number()?;
        match usize::try_from(v) {
            Ok(n) if n <= limit => Ok(n),
            _ => Err(ArchiveError::corrupted(format!("count {v} exceeds limit {limit}"))),
        }
    }

    pub fn read_u32_number(&mut self) -> Result<u32> {
        let v = self.read_number()?;
        u32::try_from(v).map_err(|_| ArchiveError::corrupted(format!("value {v:#x} overflows u32")))
    }

    pub fn read_bits(&mut self, n: usize) -> Result<Vec<bool>> {
        let bytes = self.take(n.div_ceil(8))?;
        Ok((0..n).map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0).collect())
    }

    /// "All defined" byte followed by a bit vector when it is zero.
    pub fn read_defined(&mut self, n: usize) -> Result<Vec<bool>> {
        if self.read_u8()? != 0 {
            Ok(vec![true; n])
        } else {
            self.read_bits(n)
        }
    }

    /// Attribute bodies must be stored inline.
    pub fn expect_inline(&mut self) -> Result<()> {
        match self.read_u8()? {
            0 => Ok(()),
            _ => Err(ArchiveError::corrupted("external attribute storage is not supported")),
        }
    }

    pub fn read_digests(&mut self, n: usize) -> Result<Vec<Option<u32>>> {
        let defined = self.read_defined(n)?;
        defined
            .into_iter()
            .map(|d| if d { self.read_u32_le().map(Some) } else { Ok(None) })
            .collect()
    }
}

fn truncated() -> ArchiveError {
    ArchiveError::corrupted("metadata truncated")
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Writing helpers on a plain byte vector.
pub trait ByteSink {
    fn put_number(&mut self, value: u64);
    fn put_bits(&mut self, bits: &[bool]);
    /// Writes the "all defined" marker, or 0 followed by the bit vector.
    fn put_defined(&mut self, bits: &[bool]);
    fn put_u32_le(&mut self, value: u32);
    fn put_u64_le(&mut self, value: u64);
}

impl ByteSink for Vec<u8> {
    fn put_number(&mut self, value: u64) {
        let mut first = 0u64;
        let mut mask = 0x80u64;
        let mut extra = 0usize;
        while extra < 8 {
            if value < 1u64 << (7 * (extra + 1)) {
                first |= value >> (8 * extra);
                break;
            }
            first |= mask;
            mask >>= 1;
            extra += 1;
        }
        self.push(first as u8);
        self.extend_from_slice(&value.to_le_bytes()[..extra]);
    }

    fn put_bits(&mut self, bits: &[bool]) {
        for chunk in bits.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| if b { acc | (0x80 >> i) } else { acc });
            self.push(byte);
        }
    }

    fn put_defined(&mut self, bits: &[bool]) {
        if bits.iter().all(|&b| b) {
            self.push(1);
        } else {
            self.push(0);
            self.put_bits(bits);
        }
    }

    fn put_u32_le(&mut self, value: u32) {
        // Vec<u8> writes are infallible.
        let _ = self.write_u32::<LittleEndian>(value);
    }

    fn put_u64_le(&mut self, value: u64) {
        let _ = self.write_u64::<LittleEndian>(value);
    }
}
