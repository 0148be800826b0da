//! System-wide constants for the raw memory manager.
//!
//! These values size the boundary-tag encoding, the free-list geometry and
//! the arena assignment policy. They are shared by every segment.

// =============================================================================
// Block Encoding
// =============================================================================

/// Width in bytes of an in-region free-list pointer.
///
/// 5 bytes address up to 1 TiB of managed storage, which is far beyond the
/// memory a single node keeps resident.
pub const POINTER_WIDTH: u64 = 5;

/// Maximum width in bytes of an occupied block's length field.
pub const MAX_HEADER_WIDTH: u64 = 3;

/// Largest payload a single block can describe with a 3-byte length field.
pub const MAX_BLOCK_SIZE: u32 = (1 << 24) - 1;

// =============================================================================
// Free Lists
// =============================================================================

/// Smallest free block that is linked into a size-class list.
///
/// A listed free block needs two link pointers and a size field at each end,
/// so 1 + 5 + 5 + 1 = 12 bytes is the floor. Smaller free blocks keep inline
/// boundary tags only and are found again during coalescing.
pub const MIN_LISTED_BLOCK: u64 = 12;

/// Hand-tuned minimum sizes for the smallest size classes.
///
/// The first classes grow linearly to absorb the fixed free-list link
/// overhead; later classes double.
pub const SMALL_CLASS_SIZES: [u64; 4] = [12, 24, 36, 48];

/// Free blocks below this span count as "small" in the fragmentation metric.
pub const SMALL_BLOCK_THRESHOLD: u64 = 64;

// =============================================================================
// Segments
// =============================================================================

/// Smallest accepted segment size.
pub const MIN_SEGMENT_SIZE: u64 = 4096;

/// Default total managed memory (128 MiB).
pub const DEFAULT_TOTAL_SIZE: u64 = 128 * 1024 * 1024;

/// Default segment size (8 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

/// Alignment of the backing storage region (cache line).
pub const REGION_ALIGNMENT: usize = 64;

// =============================================================================
// Arena Assignment
// =============================================================================

/// Sweeps over all segments that find no candidate with enough free space
/// before segment assignment falls back to the fullest lockable segment and
/// lets the allocation attempt fail with an out-of-memory error.
pub const MAX_BARREN_SWEEPS: u32 = 64;
