//! Little-endian cursor over persisted buffers

use crate::model::BlockId;
use crate::{Error, Result};
use bytes::BufMut;

/// Bounds-checked reader; every short read is [`Error::Truncated`]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Truncated {
                needed: self.pos.saturating_add(len),
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Corrupt(format!(
                "Invalid flag byte {} at offset {}",
                other,
                self.pos - 1
            ))),
        }
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn id(&mut self) -> Result<BlockId> {
        Ok(BlockId::new(self.u64()?))
    }

    /// Length prefix followed by that many ids
    pub(crate) fn ids(&mut self) -> Result<Vec<BlockId>> {
        let count = self.count(8)?;
        (0..count).map(|_| self.id()).collect()
    }

    /// Read a u64 element count, rejecting counts the buffer cannot hold
    pub(crate) fn count(&mut self, element_size: usize) -> Result<usize> {
        let count = self.u64()?;
        let needed = (count as usize).saturating_mul(element_size);
        if count > usize::MAX as u64 || needed > self.remaining() {
            return Err(Error::Truncated {
                needed: self.pos.saturating_add(needed),
                available: self.buf.len(),
            });
        }
        Ok(count as usize)
    }
}

pub(crate) fn put_id(out: &mut Vec<u8>, id: BlockId) {
    out.put_u64_le(id.raw());
}

pub(crate) fn put_ids(out: &mut Vec<u8>, ids: &[BlockId]) {
    out.put_u64_le(ids.len() as u64);
    for id in ids {
        put_id(out, *id);
    }
}
