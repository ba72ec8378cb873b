//! Dynamic Ring Allocator
//!
//! Transient descriptor allocations for one recording context. Slots are
//! bump-allocated from chunks borrowed from a shared partition; nothing is
//! freed individually. At a batch boundary [`DynamicRingAllocator::release_all`]
//! hands every chunk back through the reclamation queue, tagged with the
//! queues that will consume the batch.
//!
//! ```text
//!   chunks: [ ███████████░ | ██████░░░░░░ ]
//!                                 ▲ cursor
//!   allocate(n): fits? carve at cursor : borrow max(chunk_size, n) and reset cursor
//! ```
//!
//! Single-writer: every mutating method takes `&mut self`.

use std::sync::Arc;

use super::{DescriptorAllocation, DescriptorTableAllocator, StaleAllocation};
use crate::backend::NativeHandle;
use crate::errors::Result;
use crate::reclamation::{DeferredReclamationQueue, QueueMask};

/// Slots carved from a ring chunk, valid until the next
/// [`release_all`](DynamicRingAllocator::release_all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicAllocation {
    pub heap: NativeHandle,
    pub offset: u32,
    pub count: u32,
}

pub struct DynamicRingAllocator {
    name: String,
    pool: Arc<DescriptorTableAllocator>,
    chunk_size: u32,
    chunks: Vec<DescriptorAllocation>,
    /// Slots used in the last chunk.
    cursor: u32,

    current_slots: u32,
    peak_slots: u32,
    current_chunk_slots: u32,
    peak_chunk_slots: u32,
}

impl DynamicRingAllocator {
    /// # Panics
    ///
    /// If `chunk_size` is zero.
    #[must_use]
    pub fn new(name: impl Into<String>, pool: Arc<DescriptorTableAllocator>, chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "dynamic descriptor chunk size must be non-zero");
        Self {
            name: name.into(),
            pool,
            chunk_size,
            chunks: Vec::new(),
            cursor: 0,
            current_slots: 0,
            peak_slots: 0,
            current_chunk_slots: 0,
            peak_chunk_slots: 0,
        }
    }

    /// Carves `count` slots, borrowing a new chunk when the current one is too small.
    ///
    /// # Panics
    ///
    /// If `count` is zero.
    pub fn allocate(&mut self, count: u32) -> Result<DynamicAllocation> {
        assert!(count > 0, "zero-sized dynamic descriptor allocation");

        let fits = self
            .chunks
            .last()
            .is_some_and(|chunk| chunk.count() - self.cursor >= count);

        if !fits {
            let chunk = self.pool.allocate(self.chunk_size.max(count))?;
            self.current_chunk_slots += chunk.count();
            self.peak_chunk_slots = self.peak_chunk_slots.max(self.current_chunk_slots);
            self.chunks.push(chunk);
            self.cursor = 0;
        }

        let Some(chunk) = self.chunks.last() else {
            unreachable!("a chunk was just borrowed");
        };
        let allocation = DynamicAllocation {
            heap: chunk.heap(),
            offset: chunk.offset() + self.cursor,
            count,
        };
        self.cursor += count;

        self.current_slots += count;
        self.peak_slots = self.peak_slots.max(self.current_slots);
        Ok(allocation)
    }

    /// Returns every chunk to the shared partition once all queues in `mask`
    /// have completed.
    pub fn release_all(&mut self, queue: &DeferredReclamationQueue, mask: QueueMask) {
        for chunk in self.chunks.drain(..) {
            queue.release(StaleAllocation::new(chunk, Arc::clone(&self.pool)), mask);
        }
        self.cursor = 0;
        self.current_slots = 0;
        self.current_chunk_slots = 0;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Slots allocated since the last `release_all`.
    #[must_use]
    pub fn allocated_slots(&self) -> u32 {
        self.current_slots
    }

    #[must_use]
    pub fn peak_slots(&self) -> u32 {
        self.peak_slots
    }

    #[must_use]
    pub fn peak_chunk_slots(&self) -> u32 {
        self.peak_chunk_slots
    }
}

impl Drop for DynamicRingAllocator {
    fn drop(&mut self) {
        if !self.chunks.is_empty() {
            debug_assert!(
                std::thread::panicking(),
                "dynamic descriptor allocator '{}' dropped with {} unreleased chunk(s)",
                self.name,
                self.chunks.len()
            );
            log::warn!(
                "Dynamic descriptor allocator '{}': returning {} chunk(s) without waiting for the GPU",
                self.name,
                self.chunks.len()
            );
            for chunk in self.chunks.drain(..) {
                self.pool.free(chunk);
            }
        }

        log::info!(
            "Dynamic descriptor allocator '{}': peak slots {}, peak chunk slots {}",
            self.name,
            self.peak_slots,
            self.peak_chunk_slots
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{DescriptorHeapKind, GpuDescriptorHeap};
    use crate::backend::HeadlessBackend;

    #[test]
    fn allocations_are_contiguous_within_a_chunk() {
        let backend = Arc::new(HeadlessBackend::default());
        let gpu = GpuDescriptorHeap::new(backend, DescriptorHeapKind::ResourceView, 4, 64).unwrap();
        let queue = DeferredReclamationQueue::new();
        let mut ring = gpu.create_dynamic_allocator("ctx", 16);

        let a = ring.allocate(5).unwrap();
        let b = ring.allocate(7).unwrap();
        assert_eq!(b.offset, a.offset + 5);
        assert_eq!(ring.chunk_count(), 1);

        // 4 slots left in the chunk
        let c = ring.allocate(5).unwrap();
        assert_eq!(ring.chunk_count(), 2);
        assert_ne!(c.offset, b.offset + 7);

        ring.release_all(&queue, QueueMask::queue(0));
        assert_eq!(ring.chunk_count(), 0);
        assert_eq!(queue.purge(QueueMask::queue(0)), 2);
        assert_eq!(gpu.dynamic_partition().stats().allocated_slots, 0);
    }

    #[test]
    fn oversized_request_borrows_a_larger_chunk() {
        let backend = Arc::new(HeadlessBackend::default());
        let gpu = GpuDescriptorHeap::new(backend, DescriptorHeapKind::Sampler, 4, 64).unwrap();
        let queue = DeferredReclamationQueue::new();
        let mut ring = gpu.create_dynamic_allocator("big", 8);

        let a = ring.allocate(20).unwrap();
        assert_eq!(a.count, 20);
        assert_eq!(ring.peak_chunk_slots(), 20);

        ring.release_all(&queue, QueueMask::NONE);
        queue.purge(QueueMask::NONE);
    }
}
