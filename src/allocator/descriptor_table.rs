//! Descriptor Table Allocator
//!
//! A growable pool of native descriptor heaps. Each pool embeds a
//! [`BlockAllocator`] over its slots; the allocator keeps the indices of the
//! pools that still have free space in an ordered set and tries them in
//! order.
//!
//! ```text
//!   pools:     [ Pool#0 (full) | Pool#1 | Pool#2 ]
//!   available: { 1, 2 }
//!
//!   allocate(n):  try 1, then 2  ── both fail ──►  create Pool#3 (max(default, n))
//!   free(a):      pools[a.pool_id].free(..); available.insert(a.pool_id)
//! ```
//!
//! Two flavours share the same code:
//!
//! | Constructed by                          | Growth        | Heap ownership      |
//! |-----------------------------------------|---------------|---------------------|
//! | [`DescriptorTableAllocator::new`]       | on demand     | one heap per pool   |
//! | [`GpuDescriptorHeap`](super::GpuDescriptorHeap) | never | shared GPU heap     |
//!
//! A fixed partition reports [`EmberError::DescriptorHeapExhausted`] instead
//! of growing.
//!
//! # Thread safety
//!
//! One mutex guards pool selection, availability bookkeeping and the pools'
//! block allocators. No other structure's lock is taken while it is held.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{BlockAllocator, DescriptorHeapKind};
use crate::backend::{DescriptorHeapBackend, DescriptorHeapDesc, NativeHandle};
use crate::errors::{EmberError, Result};
use crate::reclamation::{DeferredReclamationQueue, QueueMask, Reclaimable};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

// ─── Public Types ────────────────────────────────────────────────────────────

/// A run of descriptor slots in one native heap.
///
/// Move-only: it is handed back exactly once, either directly through
/// [`DescriptorTableAllocator::free`] or through the reclamation queue.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "descriptor allocations must be freed"]
pub struct DescriptorAllocation {
    heap: NativeHandle,
    offset: u32,
    count: u32,
    pool_id: u32,
    owner_id: u64,
}

impl DescriptorAllocation {
    /// Native heap holding the slots.
    #[inline]
    #[must_use]
    pub fn heap(&self) -> NativeHandle {
        self.heap
    }

    /// First slot, relative to the start of the native heap.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Id of the [`DescriptorTableAllocator`] this allocation came from.
    #[inline]
    #[must_use]
    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    /// Half-open slot range `[offset, offset + count)`.
    #[inline]
    #[must_use]
    pub fn range(&self) -> std::ops::Range<u32> {
        self.offset..self.offset + self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTableStats {
    pub pool_count: usize,
    pub total_slots: u32,
    pub allocated_slots: u32,
    pub peak_allocated_slots: u32,
}

impl DescriptorTableStats {
    #[must_use]
    pub fn peak_utilization(&self) -> f32 {
        if self.total_slots == 0 {
            0.0
        } else {
            self.peak_allocated_slots as f32 / self.total_slots as f32
        }
    }
}

// ─── Internal Types ──────────────────────────────────────────────────────────

/// A native heap, destroyed when the last pool referencing it goes away.
pub(crate) struct OwnedHeap {
    pub(crate) handle: NativeHandle,
    pub(crate) backend: Arc<dyn DescriptorHeapBackend>,
}

impl Drop for OwnedHeap {
    fn drop(&mut self) {
        self.backend.destroy_descriptor_heap(self.handle);
    }
}

struct DescriptorPool {
    heap: Arc<OwnedHeap>,
    /// Position of the pool's first slot inside the native heap.
    first_slot: u32,
    slots: BlockAllocator,
    live_allocations: u32,
}

impl DescriptorPool {
    fn allocate(&mut self, count: u32) -> Option<u32> {
        let offset = self.slots.allocate(count, 1)?;
        self.live_allocations += 1;
        Some(self.first_slot + offset)
    }

    fn free(&mut self, offset: u32, count: u32) {
        debug_assert!(self.live_allocations > 0, "pool has no live allocations");
        self.slots.free(offset - self.first_slot, count);
        self.live_allocations -= 1;
    }
}

enum Growth {
    OnDemand { default_pool_size: u32 },
    Fixed { partition: &'static str },
}

struct TableState {
    pools: Vec<DescriptorPool>,
    available: BTreeSet<usize>,
    allocated_slots: u32,
    peak_allocated_slots: u32,
}

// ─── Allocator ───────────────────────────────────────────────────────────────

pub struct DescriptorTableAllocator {
    id: u64,
    kind: DescriptorHeapKind,
    label: String,
    growth: Growth,
    backend: Arc<dyn DescriptorHeapBackend>,
    state: Mutex<TableState>,
}

impl DescriptorTableAllocator {
    /// A CPU-only allocator that creates a new native heap of
    /// `default_pool_size` slots (or more) whenever existing pools cannot
    /// satisfy a request. No heap is created until the first allocation.
    ///
    /// # Panics
    ///
    /// If `default_pool_size` is zero.
    pub fn new(
        backend: Arc<dyn DescriptorHeapBackend>,
        kind: DescriptorHeapKind,
        default_pool_size: u32,
    ) -> Self {
        assert!(default_pool_size > 0, "descriptor pool size must be non-zero");
        Self::with_state(
            backend,
            kind,
            format!("CPU {}", kind.name()),
            Growth::OnDemand { default_pool_size },
            Vec::new(),
        )
    }

    /// An allocator over `[first_slot, first_slot + count)` of an existing
    /// shader-visible heap. It never grows.
    pub(crate) fn with_fixed_partition(
        backend: Arc<dyn DescriptorHeapBackend>,
        kind: DescriptorHeapKind,
        partition: &'static str,
        heap: Arc<OwnedHeap>,
        first_slot: u32,
        count: u32,
    ) -> Self {
        let pool = DescriptorPool {
            heap,
            first_slot,
            slots: BlockAllocator::new(count),
            live_allocations: 0,
        };
        Self::with_state(
            backend,
            kind,
            format!("GPU {} ({partition})", kind.name()),
            Growth::Fixed { partition },
            vec![pool],
        )
    }

    fn with_state(
        backend: Arc<dyn DescriptorHeapBackend>,
        kind: DescriptorHeapKind,
        label: String,
        growth: Growth,
        pools: Vec<DescriptorPool>,
    ) -> Self {
        let available = (0..pools.len()).collect();
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            label,
            growth,
            backend,
            state: Mutex::new(TableState {
                pools,
                available,
                allocated_slots: 0,
                peak_allocated_slots: 0,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocates `count` contiguous slots.
    ///
    /// Growable allocators only fail if a new native heap cannot be created.
    /// Fixed partitions fail with [`EmberError::DescriptorHeapExhausted`].
    ///
    /// # Panics
    ///
    /// If `count` is zero.
    pub fn allocate(&self, count: u32) -> Result<DescriptorAllocation> {
        assert!(count > 0, "zero-sized descriptor allocation");

        let mut state = self.state.lock();
        let TableState {
            pools, available, ..
        } = &mut *state;

        let mut found = None;
        let mut exhausted: SmallVec<[usize; 4]> = SmallVec::new();
        for &pool_id in available.iter() {
            let pool = &mut pools[pool_id];
            let offset = pool.allocate(count);
            if pool.slots.is_full() {
                exhausted.push(pool_id);
            }
            if let Some(offset) = offset {
                found = Some((pool_id, offset));
                break;
            }
        }
        for pool_id in exhausted {
            available.remove(&pool_id);
        }

        let (pool_id, offset) = match found {
            Some(found) => found,
            None => self.grow(&mut state, count)?,
        };

        state.allocated_slots += count;
        state.peak_allocated_slots = state.peak_allocated_slots.max(state.allocated_slots);

        Ok(DescriptorAllocation {
            heap: state.pools[pool_id].heap.handle,
            offset,
            count,
            pool_id: pool_id as u32,
            owner_id: self.id,
        })
    }

    /// Creates a new pool large enough for `count` and allocates from it.
    fn grow(&self, state: &mut TableState, count: u32) -> Result<(usize, u32)> {
        let default_pool_size = match self.growth {
            Growth::OnDemand { default_pool_size } => default_pool_size,
            Growth::Fixed { partition } => {
                log::error!("{} descriptor heap: space is exhausted ({count} slots requested)", self.label);
                return Err(EmberError::DescriptorHeapExhausted {
                    heap: self.kind.name(),
                    partition,
                    requested: count,
                });
            }
        };

        let pool_size = default_pool_size.max(count);
        if count > default_pool_size {
            log::info!(
                "{} descriptor heap: request of {count} slots exceeds the default pool size {default_pool_size}",
                self.label
            );
        }

        state
            .pools
            .try_reserve(1)
            .map_err(|_| EmberError::OutOfHostMemory {
                context: "descriptor pool list",
            })?;

        let handle = self.backend.create_descriptor_heap(&DescriptorHeapDesc {
            kind: self.kind,
            capacity: pool_size,
            shader_visible: false,
        })?;

        let mut pool = DescriptorPool {
            heap: Arc::new(OwnedHeap {
                handle,
                backend: Arc::clone(&self.backend),
            }),
            first_slot: 0,
            slots: BlockAllocator::new(pool_size),
            live_allocations: 0,
        };
        let Some(offset) = pool.allocate(count) else {
            unreachable!("a fresh pool of {pool_size} slots cannot hold {count}");
        };

        let pool_id = state.pools.len();
        if !pool.slots.is_full() {
            state.available.insert(pool_id);
        }
        state.pools.push(pool);

        log::info!(
            "{} descriptor heap: created pool #{pool_id} with {pool_size} slots",
            self.label
        );
        Ok((pool_id, offset))
    }

    /// Returns `allocation` to its pool immediately.
    ///
    /// Only call this once no queue can still reference the slots; otherwise
    /// go through [`release`](Self::release).
    ///
    /// # Panics
    ///
    /// If `allocation` was not made by this allocator.
    pub fn free(&self, allocation: DescriptorAllocation) {
        assert_eq!(
            allocation.owner_id, self.id,
            "descriptor allocation does not belong to the {} descriptor heap",
            self.label
        );

        let mut state = self.state.lock();
        let pool_id = allocation.pool_id as usize;
        state.pools[pool_id].free(allocation.offset, allocation.count);
        state.available.insert(pool_id);
        state.allocated_slots -= allocation.count;
    }

    /// Hands `allocation` to `queue`; it is freed once every queue in `mask`
    /// has completed.
    pub fn release(
        self: &Arc<Self>,
        allocation: DescriptorAllocation,
        queue: &DeferredReclamationQueue,
        mask: QueueMask,
    ) {
        queue.release(StaleAllocation::new(allocation, Arc::clone(self)), mask);
    }

    #[must_use]
    pub fn stats(&self) -> DescriptorTableStats {
        let state = self.state.lock();
        DescriptorTableStats {
            pool_count: state.pools.len(),
            total_slots: state.pools.iter().map(|pool| pool.slots.capacity()).sum(),
            allocated_slots: state.allocated_slots,
            peak_allocated_slots: state.peak_allocated_slots,
        }
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Number of pools currently considered for allocation.
    #[must_use]
    pub fn available_pool_count(&self) -> usize {
        self.state.lock().available.len()
    }
}

impl Drop for DescriptorTableAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let live: u32 = state.pools.iter().map(|pool| pool.live_allocations).sum();
        if live > 0 {
            log::error!(
                "{} descriptor heap: {live} allocation(s) ({} slots) have not been freed",
                self.label,
                state.allocated_slots
            );
            debug_assert!(
                std::thread::panicking(),
                "{} descriptor heap destroyed with {live} live allocation(s)",
                self.label
            );
        }

        if state.pools.is_empty() {
            return;
        }
        let total: u32 = state.pools.iter().map(|pool| pool.slots.capacity()).sum();
        log::info!(
            "{} descriptor heap: {} pool(s), peak slots used/total: {}/{} ({:.2}%)",
            self.label,
            state.pools.len(),
            state.peak_allocated_slots,
            total,
            f64::from(state.peak_allocated_slots) * 100.0 / f64::from(total.max(1))
        );
    }
}

// ─── Deferred release ────────────────────────────────────────────────────────

/// An allocation waiting in the reclamation queue, together with the
/// allocator it returns to.
pub struct StaleAllocation {
    allocation: DescriptorAllocation,
    owner: Arc<DescriptorTableAllocator>,
}

impl StaleAllocation {
    /// # Panics
    ///
    /// If `allocation` was not made by `owner`.
    pub fn new(allocation: DescriptorAllocation, owner: Arc<DescriptorTableAllocator>) -> Self {
        assert_eq!(
            allocation.owner_id, owner.id,
            "descriptor allocation does not belong to the {} descriptor heap",
            owner.label
        );
        Self { allocation, owner }
    }
}

impl Reclaimable for StaleAllocation {
    fn reclaim(self: Box<Self>) {
        let Self { allocation, owner } = *self;
        owner.free(allocation);
    }
}
