use crate::error::{Error, Result};

/// Read-only view of a loaded image.
pub trait ReadMemory {
    fn base_address(&self) -> u64;

    fn size(&self) -> usize;

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Number of bytes readable from `address` to the end of the image.
    fn available(&self, address: u64) -> usize {
        let base = self.base_address();
        if address < base {
            return 0;
        }
        self.size().saturating_sub((address - base) as usize)
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }
}

/// A driver image mapped into the current address space, as reported by the
/// image-load callback.
#[derive(Debug, Clone, Copy)]
pub struct ImageMemory {
    base: u64,
    size: usize,
}

impl ImageMemory {
    /// # Safety
    ///
    /// `base..base + size` must stay mapped and readable for the lifetime of
    /// the returned value.
    pub unsafe fn new(base: u64, size: usize) -> Self {
        Self { base, size }
    }

    pub fn contains(&self, address: u64, size: usize) -> bool {
        address >= self.base
            && address
                .checked_add(size as u64)
                .is_some_and(|end| end <= self.base + self.size as u64)
    }
}

impl ReadMemory for ImageMemory {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        if self.base == 0 {
            return Err(Error::MemoryReadFailed {
                address,
                message: "image base is null".to_string(),
            });
        }
        if !self.contains(address, size) {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!(
                    "range of {} bytes outside image {:#x}+{:#x}",
                    size, self.base, self.size
                ),
            });
        }
        // SAFETY: the range was checked against the mapping promised by `new`.
        let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, size) };
        Ok(bytes.to_vec())
    }
}

/// Code copied out of an image, read at its original addresses.
#[derive(Debug, Clone)]
pub struct CodeDump {
    base: u64,
    data: Vec<u8>,
}

impl CodeDump {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }
}

impl ReadMemory for CodeDump {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let start = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok());
        match start.and_then(|start| Some(start..start.checked_add(size)?)) {
            Some(range) if range.end <= self.data.len() => Ok(self.data[range].to_vec()),
            _ => Err(Error::MemoryReadFailed {
                address,
                message: format!("outside dump {:#x}+{:#x}", self.base, self.data.len()),
            }),
        }
    }
}
