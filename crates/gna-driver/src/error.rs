//! Error types for GNA driver operations

use thiserror::Error;

/// Result type alias for GNA driver operations
pub type Result<T> = std::result::Result<T, GnaError>;

/// Errors reported by the platform collaborator (page pinning, DMA
/// allocation, host I/O).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The pages could not be touched while locking or unlocking them
    #[error("Access violation on user pages")]
    AccessViolation,

    /// The platform ran out of lockable pages or DMA memory
    #[error("Out of DMA resources")]
    OutOfResources,

    /// Host I/O failure (ioctl, mmap, mlock)
    #[error("Platform I/O error: {reason}")]
    Io {
        /// Reason for failure
        reason: String,
    },
}

impl PlatformError {
    /// Create a host I/O error
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<rustix::io::Errno> for PlatformError {
    fn from(e: rustix::io::Errno) -> Self {
        Self::io(e.to_string())
    }
}

/// Errors that can occur during GNA driver operations
///
/// Clone + PartialEq so a rejection can travel inside a request completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GnaError {
    /// Mapping length is zero or above the mappable maximum
    #[error("Invalid mapping size: {size} bytes (max {max})")]
    InvalidSize {
        /// Requested length
        size: usize,
        /// Largest mappable length
        max: usize,
    },

    /// A required address was null
    #[error("Null argument: {what}")]
    NullArgument {
        /// Which argument
        what: &'static str,
    },

    /// User buffer is not page aligned
    #[error("Buffer {address:#x} is not page aligned")]
    BadAlignment {
        /// Offending address
        address: u64,
    },

    /// Pages could not be pinned or page tables could not be built
    #[error("Mapping failed: {reason}")]
    MappingFailure {
        /// Reason for failure
        reason: String,
    },

    /// Page table would need more segments than the descriptor can hold
    #[error("Mapping needs {segments} page-table segments (max {max})")]
    TooLarge {
        /// Segments required
        segments: usize,
        /// Segments supported
        max: usize,
    },

    /// Request buffer length disagrees with the length its header implies
    #[error("Invalid request buffer size: got {actual} bytes, expected {expected}")]
    InvalidBufferSize {
        /// Length computed from the header
        expected: usize,
        /// Length supplied
        actual: usize,
    },

    /// A request field is out of range
    #[error("Invalid parameter: {reason}")]
    InvalidParameter {
        /// Reason for failure
        reason: String,
    },

    /// Request references a memory identifier the session never mapped
    #[error("Memory {id} is not mapped in this session")]
    NotMapped {
        /// Memory identifier
        id: u32,
    },

    /// Session memory table has no free slot
    #[error("Memory table full ({capacity} entries)")]
    RegistryFull {
        /// Table capacity
        capacity: usize,
    },

    /// Power command still in progress, transition refused
    #[error("Invalid power state transition: {reason}")]
    InvalidStateTransition {
        /// Reason for failure
        reason: String,
    },

    /// Device did not reach the requested power state
    #[error("Power request failed: wanted d0i3={wanted}")]
    PowerRequestFailed {
        /// Requested D0i3 state
        wanted: bool,
    },

    /// BAR0 has an unexpected size
    #[error("MMIO window is {actual:#x} bytes, expected {expected:#x}")]
    MmioSizeMismatch {
        /// Expected window size
        expected: usize,
        /// Window size found
        actual: usize,
    },

    /// Request was cancelled before it completed
    #[error("Request cancelled")]
    Cancelled,

    /// Device left D0 and no longer accepts work
    #[error("Device is not accepting requests")]
    DeviceRemoved,

    /// Platform collaborator error
    #[error("Platform error: {source}")]
    Platform {
        /// Underlying platform error
        #[from]
        source: PlatformError,
    },
}

impl GnaError {
    /// Create a mapping failure error
    pub fn mapping_failure(reason: impl Into<String>) -> Self {
        Self::MappingFailure {
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Create an invalid state transition error
    pub fn invalid_state_transition(reason: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_errors_convert() {
        let err: GnaError = PlatformError::OutOfResources.into();
        assert!(matches!(
            err,
            GnaError::Platform {
                source: PlatformError::OutOfResources
            }
        ));
        assert_eq!(err.to_string(), "Platform error: Out of DMA resources");
    }

    #[test]
    fn io_errors_keep_their_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "mlock refused");
        let err = PlatformError::from(io);
        assert_eq!(err, PlatformError::io("mlock refused"));
    }
}
