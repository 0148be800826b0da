//! Configuration for the raw memory manager.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SEGMENT_SIZE, DEFAULT_TOTAL_SIZE, MIN_SEGMENT_SIZE};
use crate::error::{MemError, MemResult};

/// Raw memory configuration.
///
/// # Example
///
/// ```rust
/// use tessera_mem::MemoryConfig;
///
/// let config = MemoryConfig::default();
/// assert_eq!(config.segment_size, 8 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total managed memory in bytes.
    ///
    /// Rounded up to a whole number of segments at initialization.
    pub total_size: u64,

    /// Requested segment size in bytes.
    ///
    /// Rounded down to a power of two at initialization; the per-segment
    /// free-list count is derived from its log2.
    pub segment_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_size: DEFAULT_TOTAL_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl MemoryConfig {
    /// Creates a configuration with the given total and segment sizes.
    #[must_use]
    pub const fn new(total_size: u64, segment_size: u64) -> Self {
        Self {
            total_size,
            segment_size,
        }
    }

    /// Creates a small configuration for testing (256 KiB in 64 KiB segments).
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            total_size: 256 * 1024,
            segment_size: 64 * 1024,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidConfig`] if either size is too small to
    /// hold a minimally sized segment.
    pub fn validate(&self) -> MemResult<()> {
        if self.total_size < MIN_SEGMENT_SIZE {
            return Err(MemError::InvalidConfig {
                message: format!(
                    "total_size must be at least {MIN_SEGMENT_SIZE} bytes, got {}",
                    self.total_size
                ),
            });
        }

        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(MemError::InvalidConfig {
                message: format!(
                    "segment_size must be at least {MIN_SEGMENT_SIZE} bytes, got {}",
                    self.segment_size
                ),
            });
        }

        Ok(())
    }
}
