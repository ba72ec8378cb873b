//! Device Context
//!
//! One [`DeviceContext`] per logical device owns every allocator, cache and
//! queue of this crate. It is built at device initialization and torn down at
//! shutdown; nothing here is a process-wide singleton.
//!
//! ```text
//!   DeviceContext
//!   ├── identities            IdentityRegistry
//!   ├── cpu_descriptor_heaps  [DescriptorTableAllocator; 4]   one per DescriptorHeapKind
//!   ├── gpu_descriptor_heaps  [GpuDescriptorHeap; 2]          ResourceView, Sampler
//!   ├── release_queue         DeferredReclamationQueue
//!   ├── binding_cache         ObjectBindingCache
//!   ├── archive               ObjectArchive
//!   └── command_pool          CommandBufferPool
//! ```
//!
//! # Shutdown
//!
//! The owner waits for the device to go idle, drops every outstanding
//! allocation, ring allocator and command buffer, then drops the context.
//! Dropping reclaims whatever is still queued before the allocators check
//! that they are empty.

use std::sync::Arc;

use crate::allocator::{
    DescriptorAllocation, DescriptorHeapKind, DescriptorTableAllocator, DynamicRingAllocator,
    GpuDescriptorHeap,
};
use crate::archive::ObjectArchive;
use crate::backend::{BackendType, DescriptorHeapBackend, DeviceBackend};
use crate::binding_cache::ObjectBindingCache;
use crate::command_pool::CommandBufferPool;
use crate::errors::Result;
use crate::identity::{Identity, IdentityRegistry, ResourceClass};
use crate::reclamation::{DeferredReclamationQueue, QueueMask};
use crate::settings::DeviceSettings;

pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    settings: DeviceSettings,
    identities: IdentityRegistry,

    // ---- Reclamation (purged first on drop) ----
    release_queue: DeferredReclamationQueue,

    // ---- Descriptor heaps ----
    cpu_descriptor_heaps: [Arc<DescriptorTableAllocator>; DescriptorHeapKind::COUNT],
    gpu_descriptor_heaps: [GpuDescriptorHeap; DescriptorHeapKind::SHADER_VISIBLE_COUNT],

    // ---- Caches ----
    binding_cache: ObjectBindingCache,
    archive: ObjectArchive,

    command_pool: Arc<CommandBufferPool>,
}

impl DeviceContext {
    pub fn new(backend: Arc<dyn DeviceBackend>, settings: DeviceSettings) -> Result<Self> {
        settings.validate()?;

        let heap_backend: Arc<dyn DescriptorHeapBackend> = backend.clone();
        let backend_type = heap_backend.backend_type();

        let cpu_descriptor_heaps = DescriptorHeapKind::ALL.map(|kind| {
            Arc::new(DescriptorTableAllocator::new(
                Arc::clone(&heap_backend),
                kind,
                settings.cpu_heap_size(kind),
            ))
        });

        let [resource_view, sampler] = DescriptorHeapKind::SHADER_VISIBLE;
        let gpu_heap = |kind: DescriptorHeapKind| {
            let i = kind.index();
            GpuDescriptorHeap::new(
                Arc::clone(&heap_backend),
                kind,
                settings.gpu_static_size[i],
                settings.gpu_dynamic_size[i],
            )
        };
        let gpu_descriptor_heaps = [gpu_heap(resource_view)?, gpu_heap(sampler)?];

        let binding_cache = ObjectBindingCache::new(backend.clone())?;
        let command_pool = Arc::new(CommandBufferPool::new(
            backend.clone(),
            settings.command_queue_family,
        )?);

        log::info!("{} device context initialized", backend_type.name());

        Ok(Self {
            backend,
            settings,
            identities: IdentityRegistry::new(),
            release_queue: DeferredReclamationQueue::new(),
            cpu_descriptor_heaps,
            gpu_descriptor_heaps,
            binding_cache,
            archive: ObjectArchive::new(),
            command_pool,
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        DescriptorHeapBackend::backend_type(&*self.backend)
    }

    #[must_use]
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    #[must_use]
    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    #[must_use]
    pub fn cpu_descriptor_heap(&self, kind: DescriptorHeapKind) -> &Arc<DescriptorTableAllocator> {
        &self.cpu_descriptor_heaps[kind.index()]
    }

    /// The shader-visible heap of `kind`, or `None` for CPU-only kinds.
    #[must_use]
    pub fn gpu_descriptor_heap(&self, kind: DescriptorHeapKind) -> Option<&GpuDescriptorHeap> {
        kind.is_shader_visible()
            .then(|| &self.gpu_descriptor_heaps[kind.index()])
    }

    #[must_use]
    pub fn release_queue(&self) -> &DeferredReclamationQueue {
        &self.release_queue
    }

    #[must_use]
    pub fn binding_cache(&self) -> &ObjectBindingCache {
        &self.binding_cache
    }

    #[must_use]
    pub fn archive(&self) -> &ObjectArchive {
        &self.archive
    }

    #[must_use]
    pub fn command_pool(&self) -> &Arc<CommandBufferPool> {
        &self.command_pool
    }

    // ─── Identities ──────────────────────────────────────────────────────────

    pub fn create_identity(&self, class: ResourceClass) -> Identity {
        self.identities.create(class)
    }

    /// Retires `identity` and evicts every cached binding object built from it.
    pub fn destroy_identity(&self, identity: Identity) {
        self.binding_cache.on_resource_destroyed(identity);
        if self.identities.destroy(identity).is_none() {
            log::warn!("Identity {identity:?} destroyed twice");
        }
    }

    // ─── Descriptors ─────────────────────────────────────────────────────────

    /// CPU-only descriptor slots; the heap grows as needed.
    pub fn allocate_cpu_descriptors(&self, kind: DescriptorHeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.cpu_descriptor_heap(kind).allocate(count)
    }

    /// Long-lived slots in the static partition of a shader-visible heap.
    ///
    /// # Panics
    ///
    /// If `kind` is not shader-visible.
    pub fn allocate_gpu_descriptors(&self, kind: DescriptorHeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.shader_visible_heap(kind).static_partition().allocate(count)
    }

    /// Returns `allocation` to its owner once every queue in `mask` has completed.
    ///
    /// # Panics
    ///
    /// If `allocation` was not made by one of this device's allocators.
    pub fn release_descriptors(&self, allocation: DescriptorAllocation, mask: QueueMask) {
        let owner = self
            .cpu_descriptor_heaps
            .iter()
            .chain(self.gpu_descriptor_heaps.iter().flat_map(|heap| {
                [heap.static_partition(), heap.dynamic_partition()]
            }))
            .find(|allocator| allocator.id() == allocation.owner_id())
            .unwrap_or_else(|| panic!("descriptor allocation {allocation:?} was not made by this device"));
        owner.release(allocation, &self.release_queue, mask);
    }

    /// A ring allocator over the dynamic partition of `kind`'s shader-visible heap.
    ///
    /// # Panics
    ///
    /// If `kind` is not shader-visible.
    #[must_use]
    pub fn create_dynamic_allocator(&self, kind: DescriptorHeapKind, name: impl Into<String>) -> DynamicRingAllocator {
        let heap = self.shader_visible_heap(kind);
        heap.create_dynamic_allocator(name, self.settings.dynamic_chunk_size[kind.index()])
    }

    fn shader_visible_heap(&self, kind: DescriptorHeapKind) -> &GpuDescriptorHeap {
        self.gpu_descriptor_heap(kind)
            .unwrap_or_else(|| panic!("{} descriptors are never shader-visible", kind.name()))
    }

    // ─── Completion ──────────────────────────────────────────────────────────

    /// Reclaims every released resource whose queues have all completed.
    pub fn purge(&self, completed: QueueMask) -> usize {
        self.release_queue.purge(completed)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let reclaimed = self.release_queue.purge_all();
        if reclaimed > 0 {
            log::debug!("Reclaimed {reclaimed} resource(s) at device shutdown");
        }
        self.binding_cache.clear();
        log::info!("{} device context destroyed", self.backend_type().name());
    }
}
