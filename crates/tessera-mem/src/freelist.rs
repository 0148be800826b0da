//! Size-classed free lists kept inside the storage region.
//!
//! Each segment owns one doubly linked free list per size class. The list
//! heads live in the segment's control area; the link pointers live inside
//! the free blocks themselves. Nothing about a free list exists outside the
//! storage region, so there is no parallel metadata heap to keep in sync.
//!
//! A listed free block of span `s` is laid out as
//!
//! ```text
//! [size: w][prev: 5][next: 5] ............ [size: w]
//! ```
//!
//! where `w` is the smallest width encoding `s`. The head block's `prev`
//! points at its list-head slot in the control area; slots are
//! distinguishable from blocks because the control area sits above every
//! block address of its segment.

use crate::constants::{POINTER_WIDTH, SMALL_CLASS_SIZES};
use crate::marker;
use crate::storage::Storage;

/// The ascending table of size-class minimums for one segment geometry.
///
/// `sizes[i] = 2^(i+2)`, with the smallest four classes overridden by
/// hand-tuned minimums that absorb the free-list link overhead.
#[derive(Debug, Clone)]
pub struct SizeClasses {
    sizes: Vec<u64>,
}

impl SizeClasses {
    /// Builds the class table for a segment with `count` free lists.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let mut sizes: Vec<u64> = (0..count).map(|i| 1u64 << (i + 2)).collect();
        for (i, &size) in SMALL_CLASS_SIZES.iter().enumerate().take(count) {
            sizes[i] = size;
        }
        Self { sizes }
    }

    /// Number of classes (and free lists per segment).
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// Minimum span of class `index`.
    #[inline]
    #[must_use]
    pub fn min_of(&self, index: usize) -> u64 {
        self.sizes[index]
    }

    /// Returns the class whose range contains `span`: the largest index with
    /// `min_of(index) <= span`, or 0 for spans below the smallest minimum.
    #[must_use]
    pub fn class_of(&self, span: u64) -> usize {
        let mut index = 0;
        while index + 1 < self.sizes.len() && self.sizes[index + 1] <= span {
            index += 1;
        }
        index
    }
}

/// Address of the list-head slot for `class` in a segment's control area.
#[inline]
pub fn head_slot(pointer_offset: u64, class: usize) -> u64 {
    pointer_offset + class as u64 * POINTER_WIDTH
}

/// Reads a 5-byte in-region pointer. 0 means "none".
#[inline]
pub fn read_pointer<S: Storage>(store: &S, addr: u64) -> u64 {
    store.read_val(addr, POINTER_WIDTH as u8)
}

/// Writes a 5-byte in-region pointer.
#[inline]
pub fn write_pointer<S: Storage>(store: &S, addr: u64, pointer: u64) {
    store.write_val(addr, pointer, POINTER_WIDTH as u8);
}

/// Links the free block at `addr` (size-field width `width`) into the head
/// of its class list.
///
/// The block's size fields must already be written; its markers may be
/// written before or after hooking.
pub fn hook<S: Storage>(store: &S, pointer_offset: u64, class: usize, addr: u64, width: u8) {
    let slot = head_slot(pointer_offset, class);
    let anchor = read_pointer(store, slot);

    write_pointer(store, addr + u64::from(width), slot);
    write_pointer(store, addr + u64::from(width) + POINTER_WIDTH, anchor);

    if anchor != 0 {
        // The old head's prev field sits after its own size field.
        let anchor_width = u64::from(marker::read_low(store, anchor - 1));
        write_pointer(store, anchor + anchor_width, addr);
    }

    write_pointer(store, slot, addr);
}

/// Unlinks the free block at `addr` from its class list.
///
/// The block's leading marker must still carry its size-field width.
pub fn unhook<S: Storage>(store: &S, pointer_offset: u64, addr: u64) {
    let width = u64::from(marker::read_low(store, addr - 1));
    let prev = read_pointer(store, addr + width);
    let next = read_pointer(store, addr + width + POINTER_WIDTH);

    if prev >= pointer_offset {
        // prev is the list-head slot itself.
        write_pointer(store, prev, next);
    } else {
        let prev_width = u64::from(marker::read_low(store, prev - 1));
        write_pointer(store, prev + prev_width + POINTER_WIDTH, next);
    }

    if next != 0 {
        let next_width = u64::from(marker::read_low(store, next - 1));
        write_pointer(store, next + next_width, prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::{span_width, Marker};
    use crate::storage::HeapStorage;

    const POINTER_OFFSET: u64 = 3000;

    /// Writes a listed free block shape (size fields + markers) at `addr`.
    fn shape_block(store: &HeapStorage, addr: u64, span: u64) -> u8 {
        let width = span_width(span);
        store.write_val(addr, span, width);
        store.write_val(addr + span - u64::from(width), span, width);
        marker::write_low(store, addr - 1, Marker::FreeListed { width }.encode());
        marker::write_high(store, addr + span, Marker::FreeListed { width }.encode());
        width
    }

    fn chain(store: &HeapStorage, class: usize) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = read_pointer(store, head_slot(POINTER_OFFSET, class));
        while cur != 0 {
            out.push(cur);
            let width = u64::from(marker::read_low(store, cur - 1));
            cur = read_pointer(store, cur + width + POINTER_WIDTH);
        }
        out
    }

    #[test]
    fn test_class_table() {
        let classes = SizeClasses::new(15);
        assert_eq!(classes.min_of(0), 12);
        assert_eq!(classes.min_of(3), 48);
        assert_eq!(classes.min_of(4), 64);
        assert_eq!(classes.min_of(5), 128);

        assert_eq!(classes.class_of(2), 0);
        assert_eq!(classes.class_of(12), 0);
        assert_eq!(classes.class_of(23), 0);
        assert_eq!(classes.class_of(24), 1);
        assert_eq!(classes.class_of(64), 4);
        assert_eq!(classes.class_of(127), 4);
        assert_eq!(classes.class_of(1 << 16), 14);
        // Spans above the top class minimum stay in the top class.
        assert_eq!(classes.class_of(1 << 20), 14);
    }

    #[test]
    fn test_hook_builds_lifo_chain() {
        let store = HeapStorage::with_capacity(4096).expect("allocate");
        let spans = [(100u64, 64u64), (300, 80), (500, 48)];

        for &(addr, span) in &spans {
            let width = shape_block(&store, addr, span);
            hook(&store, POINTER_OFFSET, 4, addr, width);
        }

        assert_eq!(chain(&store, 4), vec![500, 300, 100]);
    }

    #[test]
    fn test_unhook_head_middle_tail() {
        let store = HeapStorage::with_capacity(4096).expect("allocate");
        for addr in [100u64, 300, 500] {
            let width = shape_block(&store, addr, 64);
            hook(&store, POINTER_OFFSET, 4, addr, width);
        }
        // Chain is now 500 -> 300 -> 100.

        unhook(&store, POINTER_OFFSET, 300);
        assert_eq!(chain(&store, 4), vec![500, 100]);

        unhook(&store, POINTER_OFFSET, 500);
        assert_eq!(chain(&store, 4), vec![100]);

        unhook(&store, POINTER_OFFSET, 100);
        assert_eq!(chain(&store, 4), Vec::<u64>::new());
    }

    #[test]
    fn test_hook_unhook_random_order() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let store = HeapStorage::with_capacity(8192).expect("allocate");

        let mut addrs: Vec<u64> = (0..20).map(|i| 64 + i * 32).collect();
        for &addr in &addrs {
            let width = shape_block(&store, addr, 24);
            hook(&store, POINTER_OFFSET, 1, addr, width);
        }

        addrs.shuffle(&mut rng);
        for (removed, &addr) in addrs.iter().enumerate() {
            unhook(&store, POINTER_OFFSET, addr);
            let remaining = chain(&store, 1);
            assert_eq!(remaining.len(), addrs.len() - removed - 1);
            assert!(!remaining.contains(&addr));
        }
    }

    #[test]
    fn test_lists_with_mixed_widths() {
        let store = HeapStorage::with_capacity(8192).expect("allocate");

        // A wide block (2-byte size field) and a narrow one in the same list.
        let wide = shape_block(&store, 1000, 300);
        assert_eq!(wide, 2);
        hook(&store, POINTER_OFFSET, 6, 1000, wide);

        let narrow = shape_block(&store, 2000, 255);
        assert_eq!(narrow, 1);
        hook(&store, POINTER_OFFSET, 6, 2000, narrow);

        assert_eq!(chain(&store, 6), vec![2000, 1000]);
        unhook(&store, POINTER_OFFSET, 2000);
        assert_eq!(chain(&store, 6), vec![1000]);
    }
}
