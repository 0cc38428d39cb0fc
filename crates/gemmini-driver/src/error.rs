//! Error types for GemminiDevA driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, GemminiError>;

/// Errors that can occur while submitting work to the accelerator
#[derive(Debug, Error)]
pub enum GemminiError {
    /// Request rejected before any allocation or register write
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request
        reason: String,
    },

    /// A device-visible buffer could not be allocated
    #[error("Out of DMA memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Size of the failed allocation
        bytes: usize,
    },

    /// Copy to or from caller memory failed
    #[error("Fault accessing caller memory at {addr:#x} ({len} bytes)")]
    Fault {
        /// Caller address that faulted
        addr: u64,
        /// Length of the attempted copy
        len: usize,
    },

    /// Device did not signal completion in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Control command other than RUN
    #[error("Unsupported control command {cmd:#010x}")]
    UnsupportedOperation {
        /// Command number received
        cmd: u32,
    },

    /// I/O error while opening or mapping device memory
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Device memory node not present
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Mapping a physical window failed
    #[error("Failed to map device memory: {reason}")]
    MapFailed {
        /// Reason for failure
        reason: String,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Reason for rejection
        reason: String,
    },
}

impl GemminiError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an out of memory error
    pub const fn out_of_memory(bytes: usize) -> Self {
        Self::OutOfMemory { bytes }
    }

    /// Create a fault error
    pub const fn fault(addr: u64, len: usize) -> Self {
        Self::Fault { addr, len }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a map failed error
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Positive errno equivalent, as the character-device entry point reports it
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } | Self::Config { .. } => libc::EINVAL,
            Self::OutOfMemory { .. } | Self::MapFailed { .. } => libc::ENOMEM,
            Self::Fault { .. } => libc::EFAULT,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::UnsupportedOperation { .. } => libc::ENOTTY,
            Self::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceNotFound { .. } => libc::ENODEV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(GemminiError::invalid_argument("x").errno(), libc::EINVAL);
        assert_eq!(GemminiError::out_of_memory(16).errno(), libc::ENOMEM);
        assert_eq!(GemminiError::fault(0x1000, 16).errno(), libc::EFAULT);
        assert_eq!(GemminiError::Timeout { duration_ms: 5 }.errno(), libc::ETIMEDOUT);
        assert_eq!(
            GemminiError::UnsupportedOperation { cmd: 1 }.errno(),
            libc::ENOTTY
        );
        let io = GemminiError::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.errno(), libc::EACCES);
    }

    #[test]
    fn messages_carry_context() {
        let e = GemminiError::fault(0xdead_0000, 64);
        assert_eq!(
            e.to_string(),
            "Fault accessing caller memory at 0xdead0000 (64 bytes)"
        );
        let e = GemminiError::UnsupportedOperation { cmd: 0x4700 };
        assert!(e.to_string().contains("0x00004700"));
    }
}
