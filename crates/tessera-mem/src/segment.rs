//! Segments: independently locked sub-ranges of the managed storage.
//!
//! A segment owns a fixed window of the region plus a trailing control area
//! holding its free-list heads. Allocation searches the size-class lists,
//! splits the chosen free block, and writes occupied boundary tags; freeing
//! classifies both neighbors from single boundary bytes and merges without
//! consulting any side table. No block ever spans two segments.
//!
//! Layout of one segment within the region:
//!
//! ```text
//! [boundary][ usable block space ............ ][boundary][ list heads ]
//!  base      base+1                             base+1+u  pointer_offset
//! ```

use parking_lot::Mutex;

use crate::constants::{MIN_LISTED_BLOCK, POINTER_WIDTH, SMALL_BLOCK_THRESHOLD};
use crate::error::{MemError, MemResult};
use crate::freelist::{self, SizeClasses};
use crate::marker::{self, payload_width, span_width, Marker};
use crate::storage::Storage;

/// What the boundary byte said about a neighbor during a free.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Neighbor {
    /// Occupied, at the segment edge, or absent.
    Solid,
    /// A real free block (inline or listed) of the given span.
    Free(u64),
    /// A reserved single-byte remainder.
    Stub,
}

/// Mutable per-segment state, guarded by the segment's lock.
#[derive(Debug)]
pub(crate) struct SegmentState {
    /// Free bytes, counting full block spans.
    pub(crate) free_space: u64,
    /// Number of free blocks (inline and listed; stubs excluded).
    pub(crate) free_blocks: u64,
    /// Number of free blocks below [`SMALL_BLOCK_THRESHOLD`].
    pub(crate) small_blocks: u64,
    /// Token of the thread the segment is assigned to; 0 when unassigned.
    pub(crate) assigned: u64,
}

impl SegmentState {
    /// Ratio of small free blocks to all free blocks.
    pub(crate) fn fragmentation(&self) -> f64 {
        if self.free_blocks == 0 {
            0.0
        } else {
            self.small_blocks as f64 / self.free_blocks as f64
        }
    }
}

/// Immutable snapshot of a segment's state.
///
/// Returned by copy; never a live view into the locked state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentStatus {
    /// Segment id.
    pub id: usize,
    /// Free bytes, counting full block spans.
    pub free_space: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of free blocks below the small-block threshold.
    pub small_blocks: u64,
    /// Token of the assigned thread; 0 when unassigned.
    pub assigned: u64,
}

impl SegmentStatus {
    /// Ratio of small free blocks to all free blocks.
    #[must_use]
    pub fn fragmentation(&self) -> f64 {
        if self.free_blocks == 0 {
            0.0
        } else {
            self.small_blocks as f64 / self.free_blocks as f64
        }
    }
}

/// A fixed-capacity, independently locked window of the managed storage.
pub(crate) struct Segment {
    pub(crate) id: usize,
    /// Address of the segment's leading boundary byte.
    pub(crate) base: u64,
    /// Usable block space in bytes.
    pub(crate) usable: u64,
    /// Address of the first list-head slot in the control area.
    pub(crate) pointer_offset: u64,
    pub(crate) state: Mutex<SegmentState>,
}

impl Segment {
    /// Creates a segment and seeds it with one all-covering free block.
    pub(crate) fn new<S: Storage>(
        store: &S,
        classes: &SizeClasses,
        id: usize,
        base: u64,
        usable: u64,
    ) -> Self {
        let pointer_offset = base + usable + 2;
        let segment = Self {
            id,
            base,
            usable,
            pointer_offset,
            state: Mutex::new(SegmentState {
                free_space: usable,
                free_blocks: 1,
                small_blocks: u64::from(usable < SMALL_BLOCK_THRESHOLD),
                assigned: 0,
            }),
        };
        segment.create_free_block(store, classes, base + 1, usable);
        segment
    }

    /// Returns a snapshot of the segment's counters.
    pub(crate) fn status(&self) -> SegmentStatus {
        let state = self.state.lock();
        SegmentStatus {
            id: self.id,
            free_space: state.free_space,
            free_blocks: state.free_blocks,
            small_blocks: state.small_blocks,
            assigned: state.assigned,
        }
    }

    /// Allocates a block of `size` payload bytes, or `None` when this
    /// segment cannot satisfy the request.
    ///
    /// The caller must hold the segment lock (it passes the guarded state).
    pub(crate) fn alloc_block<S: Storage>(
        &self,
        store: &S,
        classes: &SizeClasses,
        state: &mut SegmentState,
        size: u32,
    ) -> MemResult<Option<u64>> {
        let width = payload_width(size);
        let needed = u64::from(size) + u64::from(width);
        if needed > self.usable {
            return Ok(None);
        }

        // Exact-fit strategy: take the head of the first non-empty list
        // above the request's own class. Anything there is large enough.
        let mut address = 0;
        let mut list = classes.class_of(needed) + 1;
        while list < classes.count() {
            address = freelist::read_pointer(store, freelist::head_slot(self.pointer_offset, list));
            if address != 0 {
                break;
            }
            list += 1;
        }

        if address == 0 {
            // Fall back to a first-fit walk of the request's own class,
            // the only list that may still hold an oversized block.
            let class = classes.class_of(needed);
            let mut cursor =
                freelist::read_pointer(store, freelist::head_slot(self.pointer_offset, class));
            while cursor != 0 {
                let cursor_width = self.free_width_at(store, cursor)?;
                let span = store.read_val(cursor, cursor_width);
                if span >= needed {
                    address = cursor;
                    break;
                }
                cursor =
                    freelist::read_pointer(store, cursor + u64::from(cursor_width) + POINTER_WIDTH);
            }
        }

        if address == 0 {
            return Ok(None);
        }

        let free_width = self.free_width_at(store, address)?;
        let free_span = store.read_val(address, free_width);
        freelist::unhook(store, self.pointer_offset, address);

        let was_small = free_span < SMALL_BLOCK_THRESHOLD;
        if free_span == needed {
            state.free_space -= needed;
            state.free_blocks -= 1;
            if was_small {
                state.small_blocks -= 1;
            }
        } else if free_span == needed + 1 {
            // The remainder cannot hold even an inline block; park it as a
            // reserved single-byte marker pair instead.
            marker::write_low(store, address + needed, marker::SINGLE_BYTE_CODE);
            marker::write_high(store, address + needed + 1, marker::SINGLE_BYTE_CODE);

            state.free_space -= needed + 1;
            state.free_blocks -= 1;
            if was_small {
                state.small_blocks -= 1;
            }
        } else {
            // Split: the remainder becomes a new free block after the byte
            // consumed as the new boundary.
            let rest = free_span - needed - 1;
            self.create_free_block(store, classes, address + needed + 1, rest);

            state.free_space -= needed + 1;
            if !was_small && rest < SMALL_BLOCK_THRESHOLD {
                state.small_blocks += 1;
            }
        }

        let occupied = Marker::Occupied { width, state: 0 }.encode();
        marker::write_high(store, address + needed, occupied);
        marker::write_low(store, address - 1, occupied);
        store.write_val(address, u64::from(size), width);

        Ok(Some(address))
    }

    /// Frees the occupied block at `address`, merging with free neighbors.
    ///
    /// The caller must hold the segment lock.
    pub(crate) fn free_block<S: Storage>(
        &self,
        store: &S,
        classes: &SizeClasses,
        state: &mut SegmentState,
        address: u64,
    ) -> MemResult<()> {
        let width = match Marker::decode(marker::read_low(store, address - 1)) {
            Marker::Occupied { width, .. } => width,
            _ => return Err(MemError::InvalidAddress { address }),
        };
        let payload = store.read_val(address, width);
        let span = u64::from(width) + payload;

        let end = address + span;
        if end > self.base + 1 + self.usable {
            return Err(MemError::corruption(
                address,
                format!("block of span {span} runs past the segment end"),
            ));
        }

        let mut start = address;
        let mut total = span;

        // Classify the left neighbor from one boundary byte. Never looks
        // across the segment's leading byte.
        let left = if address - 1 == self.base {
            Neighbor::Solid
        } else {
            match Marker::decode(marker::read_high(store, address - 1)) {
                Marker::FreeInline => {
                    let left_span = store.read_val(address - 2, 1);
                    self.check_left_span(address, left_span)?;
                    Neighbor::Free(left_span)
                }
                Marker::FreeListed { width: left_width } => {
                    if address < self.base + 2 + u64::from(left_width) {
                        return Err(MemError::corruption(
                            address - 1,
                            "left neighbor size field reaches outside the segment".to_string(),
                        ));
                    }
                    let left_span = store.read_val(address - 1 - u64::from(left_width), left_width);
                    self.check_left_span(address, left_span)?;
                    freelist::unhook(store, self.pointer_offset, address - 1 - left_span);
                    Neighbor::Free(left_span)
                }
                Marker::SingleByte => Neighbor::Stub,
                Marker::Occupied { .. } => Neighbor::Solid,
            }
        };

        match left {
            Neighbor::Free(left_span) => {
                start = address - 1 - left_span;
                total += left_span + 1;
            }
            Neighbor::Stub => {
                start = address - 1;
                total += 1;
            }
            Neighbor::Solid => {}
        }

        // Classify the right neighbor. Never looks across the segment's
        // trailing boundary byte.
        let right = if end == self.base + 1 + self.usable {
            Neighbor::Solid
        } else {
            match Marker::decode(marker::read_low(store, end)) {
                Marker::FreeInline => {
                    let right_span = store.read_val(end + 1, 1);
                    self.check_right_span(end, right_span)?;
                    Neighbor::Free(right_span)
                }
                Marker::FreeListed { width: right_width } => {
                    let right_span = store.read_val(end + 1, right_width);
                    self.check_right_span(end, right_span)?;
                    freelist::unhook(store, self.pointer_offset, end + 1);
                    Neighbor::Free(right_span)
                }
                Marker::SingleByte => Neighbor::Stub,
                Marker::Occupied { .. } => Neighbor::Solid,
            }
        };

        match right {
            Neighbor::Free(right_span) => total += right_span + 1,
            Neighbor::Stub => total += 1,
            Neighbor::Solid => {}
        }

        self.create_free_block(store, classes, start, total);

        // Counter deltas: the freed span plus every reclaimed boundary or
        // stub byte becomes free space; merged neighbors collapse into the
        // one new block.
        let mut gained = span;
        let mut merged_blocks = 0;
        let mut merged_small = 0;
        for side in [left, right] {
            match side {
                Neighbor::Free(side_span) => {
                    gained += 1;
                    merged_blocks += 1;
                    if side_span < SMALL_BLOCK_THRESHOLD {
                        merged_small += 1;
                    }
                }
                Neighbor::Stub => gained += 1,
                Neighbor::Solid => {}
            }
        }

        state.free_space += gained;
        state.free_blocks = state.free_blocks + 1 - merged_blocks;
        state.small_blocks =
            state.small_blocks + u64::from(total < SMALL_BLOCK_THRESHOLD) - merged_small;

        Ok(())
    }

    /// Writes a free block covering `[addr, addr + span)`: size fields,
    /// boundary tags, and a list link when the span is large enough.
    pub(crate) fn create_free_block<S: Storage>(
        &self,
        store: &S,
        classes: &SizeClasses,
        addr: u64,
        span: u64,
    ) {
        if span < MIN_LISTED_BLOCK {
            store.write_val(addr, span, 1);
            store.write_val(addr + span - 1, span, 1);
            marker::write_low(store, addr - 1, Marker::FreeInline.encode());
            marker::write_high(store, addr + span, Marker::FreeInline.encode());
        } else {
            let width = span_width(span);
            store.write_val(addr, span, width);
            store.write_val(addr + span - u64::from(width), span, width);

            let code = Marker::FreeListed { width }.encode();
            marker::write_low(store, addr - 1, code);
            freelist::hook(
                store,
                self.pointer_offset,
                classes.class_of(span),
                addr,
                width,
            );
            marker::write_high(store, addr + span, code);
        }
    }

    /// Reads the size-field width of the listed free block at `addr`.
    fn free_width_at<S: Storage>(&self, store: &S, addr: u64) -> MemResult<u8> {
        match Marker::decode(marker::read_low(store, addr - 1)) {
            Marker::FreeListed { width } => Ok(width),
            other => Err(MemError::corruption(
                addr,
                format!("free list entry carries marker {other:?}"),
            )),
        }
    }

    fn check_left_span(&self, address: u64, left_span: u64) -> MemResult<()> {
        if left_span == 0 || address - 1 < self.base + 1 + left_span {
            return Err(MemError::corruption(
                address - 1,
                format!("left neighbor span {left_span} reaches outside the segment"),
            ));
        }
        Ok(())
    }

    fn check_right_span(&self, end: u64, right_span: u64) -> MemResult<()> {
        if right_span == 0 || end + 1 + right_span > self.base + 1 + self.usable {
            return Err(MemError::corruption(
                end,
                format!("right neighbor span {right_span} reaches outside the segment"),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("usable", &self.usable)
            .field("free_space", &status.free_space)
            .field("free_blocks", &status.free_blocks)
            .field("assigned", &status.assigned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HeapStorage;

    const USABLE: u64 = 4096;

    fn fixture() -> (HeapStorage, SizeClasses, Segment) {
        // Geometry of a 4 KiB segment: 11 free lists, control area after
        // the trailing boundary byte.
        let classes = SizeClasses::new(11);
        let store = HeapStorage::with_capacity(USABLE + 2 + 11 * POINTER_WIDTH).expect("allocate");
        let segment = Segment::new(&store, &classes, 0, 0, USABLE);
        (store, classes, segment)
    }

    fn alloc(
        store: &HeapStorage,
        classes: &SizeClasses,
        segment: &Segment,
        size: u32,
    ) -> Option<u64> {
        let mut state = segment.state.lock();
        segment
            .alloc_block(store, classes, &mut state, size)
            .expect("alloc")
    }

    fn free(store: &HeapStorage, classes: &SizeClasses, segment: &Segment, addr: u64) {
        let mut state = segment.state.lock();
        segment
            .free_block(store, classes, &mut state, addr)
            .expect("free");
    }

    #[test]
    fn test_new_segment_is_one_free_block() {
        let (_store, _classes, segment) = fixture();
        let status = segment.status();
        assert_eq!(status.free_space, USABLE);
        assert_eq!(status.free_blocks, 1);
        assert_eq!(status.small_blocks, 0);
        assert_eq!(status.assigned, 0);
    }

    #[test]
    fn test_alloc_returns_first_usable_address() {
        let (store, classes, segment) = fixture();
        let addr = alloc(&store, &classes, &segment, 100).expect("fits");
        assert_eq!(addr, 1);

        // 100 bytes payload + 1 length byte + 1 new boundary byte.
        let status = segment.status();
        assert_eq!(status.free_space, USABLE - 102);
        assert_eq!(status.free_blocks, 1);
    }

    #[test]
    fn test_alloc_too_large_for_segment() {
        let (store, classes, segment) = fixture();
        assert_eq!(alloc(&store, &classes, &segment, USABLE as u32), None);
    }

    #[test]
    fn test_freed_block_is_reused() {
        let (store, classes, segment) = fixture();
        let first = alloc(&store, &classes, &segment, 64).expect("fits");
        free(&store, &classes, &segment, first);
        let second = alloc(&store, &classes, &segment, 64).expect("fits");
        assert_eq!(first, second);
    }

    #[test]
    fn test_exact_fit_consumes_whole_block() {
        let (store, classes, segment) = fixture();
        // Fill most of the segment so the leftover tail lands in the same
        // class as the hole and the upper lists stay empty.
        let _big = alloc(&store, &classes, &segment, 3800).expect("fits");
        let a = alloc(&store, &classes, &segment, 100).expect("fits");
        let _b = alloc(&store, &classes, &segment, 100).expect("fits");
        free(&store, &classes, &segment, a);

        // The hole has span 101; a 100-byte request (needed 101) fits it
        // exactly, leaving no remainder block.
        let blocks_before = segment.status().free_blocks;
        let again = alloc(&store, &classes, &segment, 100).expect("fits");
        assert_eq!(again, a);
        assert_eq!(segment.status().free_blocks, blocks_before - 1);
    }

    #[test]
    fn test_one_byte_remainder_becomes_stub() {
        let (store, classes, segment) = fixture();
        let _big = alloc(&store, &classes, &segment, 3900).expect("fits");
        let a = alloc(&store, &classes, &segment, 100).expect("fits");
        let b = alloc(&store, &classes, &segment, 50).expect("fits");
        free(&store, &classes, &segment, a);

        // Hole span 101, request needs 100: one byte too small to split.
        let again = alloc(&store, &classes, &segment, 99).expect("fits");
        assert_eq!(again, a);
        assert_eq!(marker::read_low(&store, again + 100), marker::SINGLE_BYTE_CODE);
        assert_eq!(marker::read_high(&store, again + 101), marker::SINGLE_BYTE_CODE);

        // Freeing the right neighbor reclaims the stub byte.
        let space_before = segment.status().free_space;
        free(&store, &classes, &segment, b);
        assert_eq!(segment.status().free_space, space_before + 51 + 1 + 1);
    }

    #[test]
    fn test_free_merges_both_neighbors() {
        let (store, classes, segment) = fixture();
        let _big = alloc(&store, &classes, &segment, 3600).expect("fits");
        let a = alloc(&store, &classes, &segment, 100).expect("fits");
        let b = alloc(&store, &classes, &segment, 100).expect("fits");
        let c = alloc(&store, &classes, &segment, 100).expect("fits");
        let _guard = alloc(&store, &classes, &segment, 100).expect("fits");

        free(&store, &classes, &segment, a);
        free(&store, &classes, &segment, c);
        let status = segment.status();
        assert_eq!(status.free_blocks, 3); // a, c, tail

        // Freeing b merges a + b + c into one block.
        free(&store, &classes, &segment, b);
        let status = segment.status();
        assert_eq!(status.free_blocks, 2); // merged, tail

        // The merged hole serves one request of the combined span.
        let merged_span = 3 * 101 + 2;
        let size = (merged_span - 2) as u32; // 2-byte length field
        let again = alloc(&store, &classes, &segment, size).expect("fits");
        assert_eq!(again, a);
    }

    #[test]
    fn test_free_merges_left_only_and_right_only() {
        let (store, classes, segment) = fixture();
        let a = alloc(&store, &classes, &segment, 40).expect("fits");
        let b = alloc(&store, &classes, &segment, 40).expect("fits");
        let c = alloc(&store, &classes, &segment, 40).expect("fits");
        let _guard = alloc(&store, &classes, &segment, 40).expect("fits");

        // Left-only merge: free a, then b.
        free(&store, &classes, &segment, a);
        let before = segment.status();
        free(&store, &classes, &segment, b);
        let after = segment.status();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_space, before.free_space + 41 + 1);

        // Right-only merge: free c against the a+b hole.
        let before = after;
        free(&store, &classes, &segment, c);
        let after = segment.status();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_space, before.free_space + 41 + 1);
    }

    #[test]
    fn test_small_block_counter_tracks_fragments() {
        let (store, classes, segment) = fixture();
        let a = alloc(&store, &classes, &segment, 20).expect("fits");
        let _b = alloc(&store, &classes, &segment, 200).expect("fits");
        free(&store, &classes, &segment, a);

        let status = segment.status();
        assert_eq!(status.small_blocks, 1);
        assert!(status.fragmentation() > 0.0);
    }

    #[test]
    fn test_first_fit_walk_in_own_class() {
        let (store, classes, segment) = fixture();
        // Leave the tail block in the class just below the top one.
        let _a = alloc(&store, &classes, &segment, 2000).expect("fits");

        // The request's class is the tail's own class and everything above
        // is empty, so only the first-fit walk can find the tail.
        let addr = alloc(&store, &classes, &segment, 2046).expect("fits");
        assert!(addr > 2000);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let (store, classes, segment) = fixture();
        let a = alloc(&store, &classes, &segment, 100).expect("fits");
        free(&store, &classes, &segment, a);

        let mut state = segment.state.lock();
        let err = segment
            .free_block(&store, &classes, &mut state, a)
            .expect_err("double free");
        assert!(matches!(err, MemError::InvalidAddress { .. }));
    }

    #[test]
    fn test_short_segment_with_inline_free_block() {
        let classes = SizeClasses::new(11);
        let store = HeapStorage::with_capacity(128).expect("allocate");
        // 8 usable bytes: the seed block is below the list minimum.
        let segment = Segment::new(&store, &classes, 3, 0, 8);
        let status = segment.status();
        assert_eq!(status.free_space, 8);
        assert_eq!(status.free_blocks, 1);
        assert_eq!(status.small_blocks, 1);

        // Too small for any listed allocation.
        let mut state = segment.state.lock();
        assert_eq!(
            segment
                .alloc_block(&store, &classes, &mut state, 64)
                .expect("alloc"),
            None
        );
    }
}
