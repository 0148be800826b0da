//! The raw memory facade.
//!
//! [`RawMemory`] owns the storage region, its segments and the arena
//! manager. It translates block addresses into (segment, in-segment
//! operation) pairs and exposes the typed read/write surface the data-store
//! layer above is written against.
//!
//! Addresses returned by [`RawMemory::malloc`] point at the block's length
//! field; payload bytes follow it. Every accessor re-derives the payload
//! position from the block's leading marker, so callers only ever handle
//! the one address.

use std::path::Path;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::arena::{thread_token, ArenaManager};
use crate::config::MemoryConfig;
use crate::constants::{MAX_BLOCK_SIZE, MAX_HEADER_WIDTH, POINTER_WIDTH};
use crate::error::{MemError, MemResult};
use crate::freelist::SizeClasses;
use crate::marker::{self, payload_width, Marker};
use crate::segment::{Segment, SegmentState, SegmentStatus};
use crate::storage::{HeapStorage, Storage};

/// Manages a large pre-allocated memory region as variable-length blocks.
///
/// # Example
///
/// ```rust
/// use tessera_mem::{MemoryConfig, RawMemory};
///
/// let memory = RawMemory::with_heap(&MemoryConfig::for_testing()).unwrap();
/// let address = memory.malloc(64).unwrap();
/// memory.write_long(address, 0, 0xDEAD_BEEF).unwrap();
/// assert_eq!(memory.read_long(address, 0).unwrap(), 0xDEAD_BEEF);
/// memory.free(address).unwrap();
/// ```
pub struct RawMemory<S: Storage = HeapStorage> {
    storage: S,
    segments: Vec<Segment>,
    classes: SizeClasses,
    arena: ArenaManager,
    /// Power-of-two usable size of all segments but possibly the last.
    segment_size: u64,
    /// Distance between consecutive segment bases, control area included.
    stride: u64,
    /// Actual size of the backing region.
    backing_size: u64,
}

impl RawMemory<HeapStorage> {
    /// Initializes a heap-backed memory region from `config`.
    ///
    /// # Errors
    ///
    /// Fails only on an invalid configuration or when the backing region
    /// cannot be allocated.
    pub fn with_heap(config: &MemoryConfig) -> MemResult<Self> {
        Self::new(HeapStorage::new(), config)
    }
}

impl<S: Storage> RawMemory<S> {
    /// Initializes the memory over the given storage.
    ///
    /// The segment-size hint is rounded down to a power of two; its log2
    /// fixes the number of per-segment free lists. `total_size` is split
    /// into whole segments, the last of which may be short. Each segment
    /// starts as one all-covering free block.
    ///
    /// # Errors
    ///
    /// Fails only on an invalid configuration or when the backing region
    /// cannot be allocated.
    pub fn new(mut storage: S, config: &MemoryConfig) -> MemResult<Self> {
        config.validate()?;

        let segment_size = 1u64 << config.segment_size.ilog2();
        // No list is needed for a block covering the full segment.
        let list_count = (config.segment_size.ilog2() - 1) as usize;
        let control_size = list_count as u64 * POINTER_WIDTH;
        let stride = segment_size + 2 + control_size;

        let segment_count = config.total_size.div_ceil(segment_size);
        let last_usable = config.total_size - (segment_count - 1) * segment_size;
        let backing_size = (segment_count - 1) * stride + last_usable + 2 + control_size;

        storage.allocate(backing_size)?;
        storage.set(0, backing_size, 0);

        let classes = SizeClasses::new(list_count);
        let mut segments = Vec::with_capacity(segment_count as usize);
        for index in 0..segment_count {
            let usable = if index + 1 == segment_count {
                last_usable
            } else {
                segment_size
            };
            segments.push(Segment::new(
                &storage,
                &classes,
                index as usize,
                index * stride,
                usable,
            ));
        }

        info!(
            total_size = config.total_size,
            backing_size,
            segment_size,
            segment_count,
            free_lists = list_count,
            "raw memory initialized"
        );

        Ok(Self {
            storage,
            segments,
            classes,
            arena: ArenaManager::new(),
            segment_size,
            stride,
            backing_size,
        })
    }

    /// Returns the actual size of the backing region in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.backing_size
    }

    /// Tears the memory down and releases the backing region.
    pub fn disengage(mut self) {
        debug!("raw memory disengaged");
        self.storage.release();
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates a block of `size` payload bytes.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidSize`] for a zero size, [`MemError::RequestTooLarge`]
    /// when no segment could ever hold the block, and
    /// [`MemError::OutOfMemory`] when no segment can currently satisfy the
    /// request even after reassignment.
    pub fn malloc(&self, size: u32) -> MemResult<u64> {
        if size == 0 {
            return Err(MemError::InvalidSize { size: 0 });
        }
        if u64::from(size) > u64::from(MAX_BLOCK_SIZE) {
            return Err(MemError::RequestTooLarge {
                size: u64::from(size),
                max: u64::from(MAX_BLOCK_SIZE),
            });
        }

        let width = payload_width(size);
        let needed = u64::from(size) + u64::from(width);
        if needed > self.segment_size {
            return Err(MemError::RequestTooLarge {
                size: u64::from(size),
                max: self.segment_size - MAX_HEADER_WIDTH,
            });
        }

        let token = thread_token();
        let min_free = u64::from(size) + MAX_HEADER_WIDTH;

        let (index, mut guard) = self.arena.enter(&self.segments, token, min_free);
        if let Some(address) =
            self.segments[index].alloc_block(&self.storage, &self.classes, &mut guard, size)?
        {
            return Ok(address);
        }

        // The segment ran dry; move to another one and retry once.
        let (index, mut guard) =
            self.arena
                .assign(&self.segments, token, Some((index, guard)), min_free);
        if let Some(address) =
            self.segments[index].alloc_block(&self.storage, &self.classes, &mut guard, size)?
        {
            return Ok(address);
        }
        drop(guard);

        warn!(size, "allocation failed after segment reassignment");
        self.log_segment_status();
        Err(MemError::OutOfMemory { size })
    }

    /// Allocates several objects packed into one combined block.
    ///
    /// The combined block is carved into sub-blocks with their own boundary
    /// tags, so every returned address behaves like a [`RawMemory::malloc`]
    /// result and is freed individually. Entries of size 0 yield address 0.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RawMemory::malloc`], plus
    /// [`MemError::InvalidArgument`] for an empty or all-zero size list.
    pub fn malloc_many(&self, sizes: &[u32]) -> MemResult<Vec<u64>> {
        let required = required_memory(sizes)?;
        let (combined, slack) = fit_combined(required)?;
        let block = self.malloc(combined)?;

        // The carve rewrites markers on bytes shared with the neighbors of
        // the combined block, so it runs under the segment lock.
        let segment = self.segment_for(block)?;
        let _state = segment.state.lock();

        let mut addresses = Vec::with_capacity(sizes.len());
        let mut cursor = block - 1;
        for &size in sizes {
            if size == 0 {
                addresses.push(0);
                continue;
            }
            let width = payload_width(size);
            let code = Marker::Occupied { width, state: 0 }.encode();
            marker::write_low(&self.storage, cursor, code);

            let address = cursor + 1;
            self.storage.write_val(address, u64::from(size), width);
            cursor = address + u64::from(width) + u64::from(size);
            marker::write_high(&self.storage, cursor, code);
            addresses.push(address);
        }

        if slack == 1 {
            marker::write_low(&self.storage, cursor, marker::SINGLE_BYTE_CODE);
            marker::write_high(&self.storage, cursor + 1, marker::SINGLE_BYTE_CODE);
        }

        Ok(addresses)
    }

    /// Frees the block at `address`, merging it with free neighbors.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidAddress`] when `address` does not refer to an
    /// occupied block; [`MemError::Corruption`] on inconsistent metadata.
    pub fn free(&self, address: u64) -> MemResult<()> {
        let segment = self.segment_for(address)?;
        let mut state = segment.state.lock();
        segment.free_block(&self.storage, &self.classes, &mut state, address)
    }

    /// Frees several blocks, skipping zero addresses.
    ///
    /// The batch continues through individual failures; if any address
    /// could not be freed, one aggregate [`MemError::BatchFreeFailed`] is
    /// returned afterwards. Callers cannot assume all-or-nothing semantics.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] for an empty list,
    /// [`MemError::BatchFreeFailed`] when part of the batch failed.
    pub fn free_many(&self, addresses: &[u64]) -> MemResult<()> {
        if addresses.is_empty() {
            return Err(MemError::invalid_argument("no addresses given"));
        }

        let mut failed = 0;
        let mut total = 0;
        for &address in addresses {
            if address == 0 {
                continue;
            }
            total += 1;
            if self.free(address).is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            Err(MemError::BatchFreeFailed { failed, total })
        } else {
            Ok(())
        }
    }

    /// Resizes a block by allocating a fresh one and copying.
    ///
    /// The payload (up to `new_size` bytes) and the custom state move to
    /// the new block; the old address is freed and becomes invalid.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RawMemory::malloc`] and [`RawMemory::free`].
    pub fn realloc(&self, address: u64, new_size: u32) -> MemResult<u64> {
        if new_size == 0 {
            return Err(MemError::InvalidSize { size: 0 });
        }

        let custom_state = self.get_custom_state(address)?;
        let old = self.read_bytes(address, 0)?;

        let new_address = self.malloc(new_size)?;
        let copy = old.len().min(new_size as usize);
        self.write_bytes(new_address, 0, &old[..copy])?;
        if custom_state != 0 {
            self.set_custom_state(new_address, custom_state)?;
        }

        self.free(address)?;
        Ok(new_address)
    }

    /// Computes the combined footprint of several objects packed by
    /// [`RawMemory::malloc_many`]: payloads, length fields and the shared
    /// boundary bytes between them. Pure size planning, no side effects.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] for an empty or all-zero size list.
    pub fn get_required_memory(&self, sizes: &[u32]) -> MemResult<u64> {
        required_memory(sizes)
    }

    // =========================================================================
    // Typed Access
    // =========================================================================

    /// Reads one byte at `offset` within the block at `address`.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn read_byte(&self, address: u64, offset: u64) -> MemResult<u8> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 1, size)?;
        Ok(self.storage.read_byte(address + u64::from(width) + offset))
    }

    /// Reads a little-endian u16 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn read_short(&self, address: u64, offset: u64) -> MemResult<u16> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 2, size)?;
        Ok(self.storage.read_short(address + u64::from(width) + offset))
    }

    /// Reads a little-endian u32 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn read_int(&self, address: u64, offset: u64) -> MemResult<u32> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 4, size)?;
        Ok(self.storage.read_int(address + u64::from(width) + offset))
    }

    /// Reads a little-endian u64 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn read_long(&self, address: u64, offset: u64) -> MemResult<u64> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 8, size)?;
        Ok(self.storage.read_long(address + u64::from(width) + offset))
    }

    /// Reads from `offset` to the end of the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when `offset` is not inside the block.
    pub fn read_bytes(&self, address: u64, offset: u64) -> MemResult<Vec<u8>> {
        let (_guard, width, size) = self.locked_block(address)?;
        if offset >= size {
            return Err(MemError::OutOfBounds {
                address,
                offset,
                len: 1,
                size,
            });
        }

        let mut data = vec![0u8; (size - offset) as usize];
        self.storage
            .read_bytes(address + u64::from(width) + offset, &mut data);
        Ok(data)
    }

    /// Writes one byte at `offset` within the block at `address`.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn write_byte(&self, address: u64, offset: u64, value: u8) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 1, size)?;
        self.storage
            .write_byte(address + u64::from(width) + offset, value);
        Ok(())
    }

    /// Writes a little-endian u16 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn write_short(&self, address: u64, offset: u64, value: u16) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 2, size)?;
        self.storage
            .write_short(address + u64::from(width) + offset, value);
        Ok(())
    }

    /// Writes a little-endian u32 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn write_int(&self, address: u64, offset: u64, value: u32) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 4, size)?;
        self.storage
            .write_int(address + u64::from(width) + offset, value);
        Ok(())
    }

    /// Writes a little-endian u64 at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn write_long(&self, address: u64, offset: u64, value: u64) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, 8, size)?;
        self.storage
            .write_long(address + u64::from(width) + offset, value);
        Ok(())
    }

    /// Writes `data` at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when the access leaves the block.
    pub fn write_bytes(&self, address: u64, offset: u64, data: &[u8]) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, offset, data.len() as u64, size)?;
        self.storage
            .write_bytes(address + u64::from(width) + offset, data);
        Ok(())
    }

    /// Fills the first `len` payload bytes of the block with `value`.
    ///
    /// # Errors
    ///
    /// [`MemError::OutOfBounds`] when `len` exceeds the block size.
    pub fn set(&self, address: u64, len: u64, value: u8) -> MemResult<()> {
        let (_guard, width, size) = self.locked_block(address)?;
        check_bounds(address, 0, len, size)?;
        self.storage.set(address + u64::from(width), len, value);
        Ok(())
    }

    // =========================================================================
    // Block Metadata
    // =========================================================================

    /// Returns the payload size recorded for the block at `address`.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidAddress`] when the address is not an occupied block.
    pub fn get_size(&self, address: u64) -> MemResult<u64> {
        let (_guard, _width, size) = self.locked_block(address)?;
        Ok(size)
    }

    /// Returns the block's user-defined state (0..=2).
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidAddress`] when the address is not an occupied block.
    pub fn get_custom_state(&self, address: u64) -> MemResult<u8> {
        let segment = self.segment_for(address)?;
        let _state = segment.state.lock();
        match Marker::decode(marker::read_low(&self.storage, address - 1)) {
            Marker::Occupied { state, .. } => Ok(state),
            _ => Err(MemError::InvalidAddress { address }),
        }
    }

    /// Sets the block's user-defined state (0..=2) in both markers.
    ///
    /// The state survives payload writes and is copied by
    /// [`RawMemory::realloc`].
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidCustomState`] for values above 2,
    /// [`MemError::InvalidAddress`] when the address is not an occupied block.
    pub fn set_custom_state(&self, address: u64, state: u8) -> MemResult<()> {
        if state > 2 {
            return Err(MemError::InvalidCustomState { state });
        }

        let (_guard, width, size) = self.locked_block(address)?;
        let code = Marker::Occupied { width, state }.encode();
        marker::write_low(&self.storage, address - 1, code);
        marker::write_high(&self.storage, address + u64::from(width) + size, code);
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Returns the fragmentation ratio of every segment.
    #[must_use]
    pub fn get_fragmentation(&self) -> Vec<f64> {
        self.segments
            .iter()
            .map(|segment| segment.status().fragmentation())
            .collect()
    }

    /// Returns a snapshot of every segment's counters.
    #[must_use]
    pub fn get_segment_status(&self) -> Vec<SegmentStatus> {
        self.segments.iter().map(Segment::status).collect()
    }

    /// Dumps `count` raw bytes starting at `addr` to a file.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] for an out-of-range span,
    /// [`MemError::Io`] when the file cannot be written.
    pub fn dump(&self, path: &Path, addr: u64, count: u64) -> MemResult<()> {
        self.storage.dump(path, addr, count)
    }

    fn log_segment_status(&self) {
        for status in self.get_segment_status() {
            debug!(
                id = status.id,
                free_space = status.free_space,
                free_blocks = status.free_blocks,
                small_blocks = status.small_blocks,
                assigned = status.assigned,
                "segment status"
            );
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Resolves the segment owning `address`, rejecting addresses outside
    /// any segment's usable range.
    fn segment_for(&self, address: u64) -> MemResult<&Segment> {
        let index = (address / self.stride) as usize;
        let segment = self
            .segments
            .get(index)
            .ok_or(MemError::InvalidAddress { address })?;
        if address <= segment.base || address >= segment.base + 1 + segment.usable {
            return Err(MemError::InvalidAddress { address });
        }
        Ok(segment)
    }

    /// Locks the owning segment and decodes the occupied block at `address`.
    fn locked_block(
        &self,
        address: u64,
    ) -> MemResult<(MutexGuard<'_, SegmentState>, u8, u64)> {
        let segment = self.segment_for(address)?;
        let guard = segment.state.lock();
        match Marker::decode(marker::read_low(&self.storage, address - 1)) {
            Marker::Occupied { width, .. } => {
                let size = self.storage.read_val(address, width);
                Ok((guard, width, size))
            }
            _ => Err(MemError::InvalidAddress { address }),
        }
    }
}

impl<S: Storage> Drop for RawMemory<S> {
    fn drop(&mut self) {
        self.storage.release();
    }
}

impl<S: Storage> std::fmt::Debug for RawMemory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMemory")
            .field("backing_size", &self.backing_size)
            .field("segment_size", &self.segment_size)
            .field("segments", &self.segments.len())
            .finish()
    }
}

fn check_bounds(address: u64, offset: u64, len: u64, size: u64) -> MemResult<()> {
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(MemError::OutOfBounds {
            address,
            offset,
            len,
            size,
        });
    }
    Ok(())
}

/// Combined footprint of packed objects: Σ (payload + length field + one
/// boundary byte), minus the trailing boundary shared with the neighbor.
fn required_memory(sizes: &[u32]) -> MemResult<u64> {
    if sizes.is_empty() {
        return Err(MemError::invalid_argument("no sizes given"));
    }

    let mut total = 0u64;
    let mut nonzero = false;
    for &size in sizes {
        if size == 0 {
            continue;
        }
        if size > MAX_BLOCK_SIZE {
            return Err(MemError::RequestTooLarge {
                size: u64::from(size),
                max: u64::from(MAX_BLOCK_SIZE),
            });
        }
        nonzero = true;
        total += u64::from(size) + u64::from(payload_width(size)) + 1;
    }

    if !nonzero {
        return Err(MemError::invalid_argument("no non-zero sizes given"));
    }
    Ok(total - 1)
}

/// Finds a payload whose block span covers `required` bytes exactly, or
/// with one slack byte when the exact span is unrepresentable (a payload
/// one below a width boundary). The slack byte becomes a single-byte stub.
fn fit_combined(required: u64) -> MemResult<(u32, u64)> {
    for slack in 0..=1u64 {
        let span = required + slack;
        for width in 1..=3u8 {
            let Some(payload) = span.checked_sub(u64::from(width)) else {
                continue;
            };
            if payload == 0 || payload > u64::from(u32::MAX) {
                continue;
            }
            if payload_width(payload as u32) == width {
                return Ok((payload as u32, slack));
            }
        }
    }

    Err(MemError::invalid_argument(format!(
        "combined span {required} is not representable"
    )))
}
