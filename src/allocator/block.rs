//! Variable-Size Block Allocator
//!
//! Manages the integer range `[0, capacity)` as a set of free blocks indexed
//! twice:
//!
//! ```text
//!   by_offset: BTreeMap<offset, size>       neighbour lookup for coalescing
//!   by_size:   BTreeSet<(size, offset)>     best-fit lookup
//! ```
//!
//! Allocation takes the smallest free block that still fits `count` slots
//! after alignment. Leading alignment padding and the trailing excess both
//! stay in the free list. Freeing merges with the free blocks immediately
//! before and after, so a pool that has been fully released is always one
//! block again, regardless of the order in which it was released.
//!
//! The allocator is not synchronized; owners serialize access.

use std::collections::{BTreeMap, BTreeSet};

use super::align_up;

#[derive(Debug, Clone)]
pub struct BlockAllocator {
    capacity: u32,
    free_size: u32,
    peak_used: u32,
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let mut allocator = Self {
            capacity,
            free_size: capacity,
            peak_used: 0,
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
        };
        if capacity > 0 {
            allocator.insert_free_block(0, capacity);
        }
        allocator
    }

    /// Allocates `count` slots whose offset is a multiple of `alignment`.
    ///
    /// Returns `None` when no free block can hold the request. Running out of
    /// space is an ordinary outcome; the caller decides whether to grow.
    ///
    /// # Panics
    ///
    /// In debug builds, if `count` is zero or `alignment` is not a power of two.
    pub fn allocate(&mut self, count: u32, alignment: u32) -> Option<u32> {
        debug_assert!(count > 0, "zero-sized block allocation");
        if count == 0 || count > self.free_size {
            return None;
        }

        let (size, offset, aligned) = self
            .by_size
            .range((count, 0)..)
            .find_map(|&(size, offset)| {
                let aligned = align_up(offset, alignment);
                (aligned + u64::from(count) <= u64::from(offset) + u64::from(size))
                    .then_some((size, offset, aligned as u32))
            })?;

        self.remove_free_block(offset, size);

        let padding = aligned - offset;
        if padding > 0 {
            self.insert_free_block(offset, padding);
        }
        let tail = size - padding - count;
        if tail > 0 {
            self.insert_free_block(aligned + count, tail);
        }

        self.free_size -= count;
        self.peak_used = self.peak_used.max(self.used_size());
        Some(aligned)
    }

    /// Returns `[offset, offset + count)` to the free list, merging it with
    /// adjacent free blocks.
    ///
    /// # Panics
    ///
    /// In debug builds, if the range lies outside the allocator or overlaps a
    /// block that is already free (a double free).
    pub fn free(&mut self, offset: u32, count: u32) {
        debug_assert!(count > 0, "zero-sized block free");
        let end = u64::from(offset) + u64::from(count);
        debug_assert!(
            end <= u64::from(self.capacity),
            "range [{offset}, {end}) is outside the allocator (capacity {})",
            self.capacity
        );
        let end = end as u32;

        let mut start = offset;
        let mut size = count;

        if let Some((&prev_offset, &prev_size)) = self.by_offset.range(..offset).next_back() {
            debug_assert!(
                prev_offset + prev_size <= offset,
                "double free: [{offset}, {end}) overlaps free block [{prev_offset}, {})",
                prev_offset + prev_size
            );
            if prev_offset + prev_size == offset {
                self.remove_free_block(prev_offset, prev_size);
                start = prev_offset;
                size += prev_size;
            }
        }

        if let Some((&next_offset, &next_size)) = self.by_offset.range(offset..).next() {
            debug_assert!(
                next_offset >= end,
                "double free: [{offset}, {end}) overlaps free block [{next_offset}, {})",
                next_offset + next_size
            );
            if next_offset == end {
                self.remove_free_block(next_offset, next_size);
                size += next_size;
            }
        }

        self.insert_free_block(start, size);
        self.free_size += count;
        debug_assert!(self.free_size <= self.capacity);
    }

    fn insert_free_block(&mut self, offset: u32, size: u32) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove_free_block(&mut self, offset: u32, size: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    // ─── Diagnostics ─────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn free_size(&self) -> u32 {
        self.free_size
    }

    #[inline]
    #[must_use]
    pub fn used_size(&self) -> u32 {
        self.capacity - self.free_size
    }

    /// Highest number of slots that were allocated at the same time.
    #[inline]
    #[must_use]
    pub fn peak_used(&self) -> u32 {
        self.peak_used
    }

    /// No slot is allocated.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free_size == self.capacity
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free_size == 0
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.by_offset.len()
    }

    #[must_use]
    pub fn largest_free_block(&self) -> u32 {
        self.by_size.last().map_or(0, |&(size, _)| size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_prefers_smallest_block() {
        let mut allocator = BlockAllocator::new(100);
        let a = allocator.allocate(10, 1).unwrap();
        let b = allocator.allocate(30, 1).unwrap();
        let c = allocator.allocate(5, 1).unwrap();
        let _d = allocator.allocate(10, 1).unwrap();
        assert_eq!((a, b, c), (0, 10, 40));

        allocator.free(a, 10);
        allocator.free(b, 30);
        // a and b coalesced into [0,40)
        assert_eq!(allocator.free_block_count(), 2);

        allocator.free(c, 5);
        // [0,45) merged as well
        assert_eq!(allocator.free_block_count(), 2);
        assert_eq!(allocator.allocate(45, 1), Some(0));
    }

    #[test]
    fn smallest_fitting_block_is_chosen() {
        let mut allocator = BlockAllocator::new(64);
        let offsets: Vec<u32> = (0..8).map(|_| allocator.allocate(8, 1).unwrap()).collect();
        // Leave holes of 8 (at 0) and 16 (at 24..40)
        allocator.free(offsets[0], 8);
        allocator.free(offsets[3], 8);
        allocator.free(offsets[4], 8);

        assert_eq!(allocator.allocate(8, 1), Some(0));
        assert_eq!(allocator.allocate(16, 1), Some(24));
        assert_eq!(allocator.allocate(1, 1), None);
    }

    #[test]
    fn alignment_keeps_padding_free() {
        let mut allocator = BlockAllocator::new(64);
        assert_eq!(allocator.allocate(3, 1), Some(0));
        assert_eq!(allocator.allocate(8, 16), Some(16));

        // [3,16) stays available
        assert_eq!(allocator.free_size(), 64 - 3 - 8);
        assert_eq!(allocator.allocate(13, 1), Some(3));
    }

    #[test]
    fn alignment_skips_blocks_that_cannot_fit() {
        let mut allocator = BlockAllocator::new(32);
        let _a = allocator.allocate(1, 1).unwrap();
        let b = allocator.allocate(7, 1).unwrap();
        let _c = allocator.allocate(24, 1).unwrap();
        allocator.free(b, 7);

        // [1,8) holds 7 slots, but no 4-aligned run of 5
        assert_eq!(allocator.allocate(5, 4), None);
        assert_eq!(allocator.allocate(4, 4), Some(4));
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let mut allocator = BlockAllocator::new(16);
        let a = allocator.allocate(10, 1).unwrap();
        allocator.free(a, 10);
        let _ = allocator.allocate(4, 1).unwrap();
        assert_eq!(allocator.peak_used(), 10);
        assert_eq!(allocator.used_size(), 4);
    }

    #[test]
    fn request_larger_than_free_space_fails() {
        let mut allocator = BlockAllocator::new(8);
        assert_eq!(allocator.allocate(9, 1), None);
        assert_eq!(allocator.allocate(8, 1), Some(0));
        assert!(allocator.is_full());
        assert_eq!(allocator.allocate(1, 1), None);
    }

    #[test]
    #[should_panic(expected = "double free")]
    #[cfg(debug_assertions)]
    fn double_free_is_caught() {
        let mut allocator = BlockAllocator::new(8);
        let a = allocator.allocate(4, 1).unwrap();
        allocator.free(a, 4);
        allocator.free(a, 4);
    }
}
