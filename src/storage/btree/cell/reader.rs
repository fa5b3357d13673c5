use crate::primitives::block::BlockAddr;
use crate::types::{Result, SombraError};

/// Cursor over the cell area of a page image.
#[derive(Clone, Copy, Debug)]
pub struct CellReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CellReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns true once every byte was consumed.
    pub fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(SombraError::Corruption("cell truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads an unsigned varint.
    pub fn read_var(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..10 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(SombraError::Corruption("cell varint too long"))
    }

    /// Reads a varint that must fit in `usize`.
    pub fn read_len(&mut self) -> Result<usize> {
        usize::try_from(self.read_var()?).map_err(|_| SombraError::Corruption("cell length overflow"))
    }

    /// Takes `len` bytes without copying.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(SombraError::Corruption("cell length overflow"))?;
        if end > self.buf.len() {
            return Err(SombraError::Corruption("cell buffer truncated"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads a block address cookie.
    pub fn read_addr(&mut self) -> Result<BlockAddr> {
        let mut off = self.pos;
        let addr = BlockAddr::decode(self.buf, &mut off)?;
        self.pos = off;
        Ok(addr)
    }
}
