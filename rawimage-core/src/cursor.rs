//! A small bounds-checked reader over on-disk structures.
use crate::partition::PartitionError;

/// Reads fixed-width little-endian fields from a byte slice.
///
/// Every read is checked against the end of the slice, so a truncated sector
/// turns into [`PartitionError::Truncated`] instead of a panic.
#[derive(Clone, Debug)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// A cursor positioned at `pos`. Fails if `pos` lies past the end.
    pub fn at(buf: &'a [u8], pos: usize) -> Result<Self, PartitionError> {
        let mut cursor = Self::new(buf);
        cursor.seek(pos)?;
        Ok(cursor)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), PartitionError> {
        if pos > self.buf.len() {
            return Err(PartitionError::Truncated {
                offset: pos,
                wanted: 0,
                len: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), PartitionError> {
        self.take(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], PartitionError> {
        self.take(n)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], PartitionError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u32_le(&mut self) -> Result<u32, PartitionError> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64_le(&mut self) -> Result<u64, PartitionError> {
        self.array().map(u64::from_le_bytes)
    }

    /// Decodes `n` bytes of UTF-16LE text, stopping at the first zero code unit.
    pub fn utf16_le(&mut self, n: usize) -> Result<String, PartitionError> {
        let raw = self.take(n)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PartitionError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(PartitionError::Truncated {
                offset: self.pos,
                wanted: n,
                len: self.buf.len(),
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

/// Byte offset of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
