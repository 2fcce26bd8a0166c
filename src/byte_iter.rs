use crate::error::*;
use crate::leb128::*;

#[derive(Clone, Copy)]
pub struct ByteIter<'a> {
    pub bytes: &'a [u8],
    pub idx: usize,
}

impl<'a> ByteIter<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8], idx: usize) -> Self { Self { bytes, idx } }
    #[inline]
    pub fn empty(&self) -> bool { self.idx >= self.bytes.len() }
    #[inline]
    pub fn has_n_left(&self, n: usize) -> bool { self.idx.saturating_add(n) <= self.bytes.len() }
    #[inline]
    pub fn cur(&self) -> usize { self.idx }
    #[inline]
    pub fn advance(&mut self, n: usize) { self.idx += n; }
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.bytes.get(self.idx).ok_or(Error::Malformed(UNEXPECTED_END))?;
        self.idx += 1;
        Ok(b)
    }
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        safe_read_leb128(self.bytes, &mut self.idx, 32)
    }
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if !self.has_n_left(len) { return Err(Error::Malformed(UNEXPECTED_END)); }
        let out = &self.bytes[self.idx..self.idx + len];
        self.idx += len;
        Ok(out)
    }
    /// Length-prefixed UTF-8 name.
    pub fn read_name(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let raw = self.read_bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| Error::Malformed(INVALID_UTF8))
    }
}
