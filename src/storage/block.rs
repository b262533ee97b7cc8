use crate::core::{Error, Result};

/// Heap-backed block-addressable storage region
///
/// Erased blocks read back as `0xFF`, like NOR flash.
#[derive(Debug)]
pub struct BlockStore {
    block_size: usize,
    data: Vec<u8>,
}

impl BlockStore {
    /// Creates an erased region of `block_count` blocks
    pub fn new(block_size: usize, block_count: usize) -> Self {
        BlockStore {
            block_size,
            data: vec![0xFF; block_size * block_count],
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        if self.block_size == 0 {
            0
        } else {
            self.data.len() / self.block_size
        }
    }

    /// Total bytes in the region
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Writes `data` at byte address `addr`
    pub fn program(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        let end = self.check_range(addr, data.len())?;
        self.data[addr..end].copy_from_slice(data);
        Ok(())
    }

    /// Fills `buf` from byte address `addr`
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let end = self.check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[addr..end]);
        Ok(())
    }

    /// Erases the blocks covering `addr..addr + len`
    pub fn erase(&mut self, addr: usize, len: usize) -> Result<()> {
        let end = self.check_range(addr, len)?;
        if self.block_size == 0 || addr % self.block_size != 0 || end % self.block_size != 0 {
            return Err(Error::storage(format!(
                "Erase of {}..{} is not aligned to {} byte blocks",
                addr, end, self.block_size
            )));
        }
        self.data[addr..end].fill(0xFF);
        Ok(())
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<usize> {
        match addr.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(end),
            _ => Err(Error::storage(format!(
                "Access of {} bytes at {} exceeds capacity {}",
                len,
                addr,
                self.data.len()
            ))),
        }
    }
}
