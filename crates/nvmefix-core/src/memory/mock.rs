//! In-memory image for tests
//!
//! Lets tests lay out synthetic machine code at fake addresses without
//! touching real process memory.

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

pub struct MockMemoryReader {
    base: u64,
    data: Vec<u8>,
}

impl ReadMemory for MockMemoryReader {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let start = address
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .ok_or_else(|| Error::MemoryReadFailed {
                address,
                message: "below mock base".to_string(),
            })?;
        let end = start + size;
        if end > self.data.len() {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!("read of {} bytes past end of mock image", size),
            });
        }
        Ok(self.data[start..end].to_vec())
    }
}

pub struct MockMemoryBuilder {
    base: u64,
    data: Vec<u8>,
}

impl MockMemoryBuilder {
    pub fn new() -> Self {
        Self {
            base: 0x1000,
            data: Vec::new(),
        }
    }

    pub fn base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Ensure the image is at least `size` bytes, padding with `int3`.
    pub fn with_size(mut self, size: usize) -> Self {
        if self.data.len() < size {
            self.data.resize(size, 0xCC);
        }
        self
    }

    /// Place `bytes` at `offset` from the base.
    pub fn write_bytes(mut self, offset: usize, bytes: &[u8]) -> Self {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0xCC);
        }
        self.data[offset..end].copy_from_slice(bytes);
        self
    }

    pub fn build(self) -> MockMemoryReader {
        MockMemoryReader {
            base: self.base,
            data: self.data,
        }
    }
}

impl Default for MockMemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
