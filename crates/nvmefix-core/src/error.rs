use thiserror::Error;

use crate::platform::ServiceId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Failed to install interception for {0}")]
    InterceptionFailed(String),

    #[error("Member offset not resolved: {0}")]
    MemberNotResolved(&'static str),

    #[error("Failed to read image memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Driver call failed for controller {controller} during {stage}: {status:#x}")]
    Driver {
        controller: ServiceId,
        stage: &'static str,
        status: i32,
    },

    #[error("NVMe command failed for controller {controller} during {stage}: status {status:#x}")]
    NvmeStatus {
        controller: ServiceId,
        stage: &'static str,
        status: u32,
    },

    #[error("Invalid identify data: {0}")]
    InvalidIdentify(String),

    #[error("Failed to allocate {0} byte DMA buffer")]
    BufferAllocation(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Whether the failure came back from the device or the driver request path,
    /// as opposed to a missing symbol or member.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Error::Driver { .. } | Error::NvmeStatus { .. })
    }
}
