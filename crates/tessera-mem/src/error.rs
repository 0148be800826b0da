//! Error handling for the raw memory manager.
//!
//! All allocator-level failures are surfaced to the immediate caller as a
//! [`MemError`]; nothing is retried transparently. Exhaustion is kept
//! distinct from malformed arguments so callers can tell "free something or
//! ask for less" apart from "this request can never succeed".

use std::fmt;
use thiserror::Error;

/// Error codes for categorizing memory errors.
///
/// These codes can be used for programmatic error handling and are stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // Argument errors (0x0000 - 0x00FF)
    /// Invalid argument provided.
    InvalidArgument = 0x0000,
    /// Address does not refer to an allocated block.
    InvalidAddress = 0x0001,
    /// Access past the end of an allocated block.
    OutOfBounds = 0x0002,

    // Exhaustion errors (0x0100 - 0x01FF)
    /// No segment could satisfy the allocation.
    OutOfMemory = 0x0100,
    /// Request exceeds what a single segment can ever hold.
    RequestTooLarge = 0x0101,

    // Corruption errors (0x0200 - 0x02FF)
    /// Internal inconsistency in block metadata.
    Corruption = 0x0200,

    // Batch errors (0x0300 - 0x03FF)
    /// A multi-address operation partially failed.
    BatchFailure = 0x0300,

    // I/O errors (0x0400 - 0x04FF)
    /// I/O error while dumping memory.
    Io = 0x0400,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "Argument",
            0x01 => "Exhaustion",
            0x02 => "Corruption",
            0x03 => "Batch",
            0x04 => "I/O",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The error type for all raw memory operations.
#[derive(Debug, Error)]
pub enum MemError {
    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Invalid allocation size (zero).
    #[error("invalid allocation size {size}")]
    InvalidSize {
        /// The rejected size.
        size: u64,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Address does not refer to an allocated block.
    #[error("address {address:#x} does not refer to an allocated block")]
    InvalidAddress {
        /// The rejected address.
        address: u64,
    },

    /// Custom state value outside the valid range 0..=2.
    #[error("custom state {state} out of range (valid: 0..=2)")]
    InvalidCustomState {
        /// The rejected state value.
        state: u8,
    },

    /// Access past the end of an allocated block.
    #[error(
        "access of {len} bytes at offset {offset} exceeds block of size {size} \
         at address {address:#x}"
    )]
    OutOfBounds {
        /// Address of the block.
        address: u64,
        /// Offset of the access within the block.
        offset: u64,
        /// Width of the access in bytes.
        len: u64,
        /// Recorded size of the block.
        size: u64,
    },

    /// No segment could satisfy the allocation, even after reassignment.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// The requested size.
        size: u32,
    },

    /// Request exceeds what a single segment can ever hold.
    #[error("request of {size} bytes exceeds maximum block size {max}")]
    RequestTooLarge {
        /// The requested size.
        size: u64,
        /// The largest size a segment can serve.
        max: u64,
    },

    /// Internal inconsistency in block metadata.
    ///
    /// This indicates a prior correctness bug, not a transient condition.
    #[error("corrupted block metadata at {address:#x}: {message}")]
    Corruption {
        /// Address where the inconsistency was observed.
        address: u64,
        /// Description of the inconsistency.
        message: String,
    },

    /// A multi-address free partially failed.
    #[error("failed to free {failed} of {total} addresses")]
    BatchFreeFailed {
        /// Number of addresses that could not be freed.
        failed: usize,
        /// Total number of non-zero addresses in the batch.
        total: usize,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl MemError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. }
            | Self::InvalidSize { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidCustomState { .. } => ErrorCode::InvalidArgument,
            Self::InvalidAddress { .. } => ErrorCode::InvalidAddress,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Self::RequestTooLarge { .. } => ErrorCode::RequestTooLarge,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::BatchFreeFailed { .. } => ErrorCode::BatchFailure,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Returns true if retrying after freeing memory may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(address: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            address,
            message: message.into(),
        }
    }
}

/// Result type alias for raw memory operations.
pub type MemResult<T> = std::result::Result<T, MemError>;
