//! Headless Backend
//!
//! A CPU-only implementation of every capability trait. It hands out
//! monotonically increasing [`NativeHandle`]s and keeps a ledger of what is
//! alive, which makes it the backend of choice for tests, benchmarks and
//! tools that build archives without a GPU.
//!
//! Failure injection: [`HeadlessBackend::fail_next_heap_creations`] makes the
//! next `n` heap creations report [`EmberError::OutOfHostMemory`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    BackendType, BindingObjectBackend, CommandBufferBackend, DescriptorHeapBackend,
    DescriptorHeapDesc, NativeHandle,
};
use crate::binding_cache::BindingObjectDesc;
use crate::errors::{EmberError, Result};

#[derive(Default)]
struct Ledger {
    heaps: FxHashMap<NativeHandle, DescriptorHeapDesc>,
    binding_objects: FxHashMap<NativeHandle, BindingObjectDesc>,
    command_pools: FxHashSet<NativeHandle>,
    /// Command buffer -> owning command pool.
    command_buffers: FxHashMap<NativeHandle, NativeHandle>,
    recording: FxHashSet<NativeHandle>,
    resets: u64,
}

pub struct HeadlessBackend {
    backend_type: BackendType,
    next_handle: AtomicU64,
    failing_heap_creations: AtomicU32,
    ledger: Mutex<Ledger>,
}

impl HeadlessBackend {
    #[must_use]
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            next_handle: AtomicU64::new(1),
            failing_heap_creations: AtomicU32::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn mint(&self) -> NativeHandle {
        NativeHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes the next `count` heap creations fail as if the host were out of memory.
    pub fn fail_next_heap_creations(&self, count: u32) {
        self.failing_heap_creations.store(count, Ordering::Relaxed);
    }

    // ─── Ledger queries ──────────────────────────────────────────────────────

    #[must_use]
    pub fn live_heap_count(&self) -> usize {
        self.ledger.lock().heaps.len()
    }

    #[must_use]
    pub fn heap_desc(&self, heap: NativeHandle) -> Option<DescriptorHeapDesc> {
        self.ledger.lock().heaps.get(&heap).copied()
    }

    #[must_use]
    pub fn live_binding_object_count(&self) -> usize {
        self.ledger.lock().binding_objects.len()
    }

    /// The description `object` was built from, if it is still alive.
    #[must_use]
    pub fn binding_object_desc(&self, object: NativeHandle) -> Option<BindingObjectDesc> {
        self.ledger.lock().binding_objects.get(&object).cloned()
    }

    #[must_use]
    pub fn live_command_pool_count(&self) -> usize {
        self.ledger.lock().command_pools.len()
    }

    #[must_use]
    pub fn live_command_buffer_count(&self) -> usize {
        self.ledger.lock().command_buffers.len()
    }

    #[must_use]
    pub fn is_recording(&self, buffer: NativeHandle) -> bool {
        self.ledger.lock().recording.contains(&buffer)
    }

    #[must_use]
    pub fn command_buffer_reset_count(&self) -> u64 {
        self.ledger.lock().resets
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(BackendType::Vulkan)
    }
}

impl DescriptorHeapBackend for HeadlessBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<NativeHandle> {
        let injected = self
            .failing_heap_creations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EmberError::OutOfHostMemory {
                context: "descriptor heap",
            });
        }

        let heap = self.mint();
        self.ledger.lock().heaps.insert(heap, *desc);
        Ok(heap)
    }

    fn destroy_descriptor_heap(&self, heap: NativeHandle) {
        let removed = self.ledger.lock().heaps.remove(&heap);
        assert!(removed.is_some(), "descriptor heap {heap:?} destroyed twice");
    }
}

impl BindingObjectBackend for HeadlessBackend {
    fn create_binding_object(&self, desc: &BindingObjectDesc) -> Result<NativeHandle> {
        let object = self.mint();
        self.ledger.lock().binding_objects.insert(object, desc.clone());
        Ok(object)
    }

    fn destroy_binding_object(&self, object: NativeHandle) {
        let removed = self.ledger.lock().binding_objects.remove(&object);
        assert!(removed.is_some(), "binding object {object:?} destroyed twice");
    }
}

impl CommandBufferBackend for HeadlessBackend {
    fn create_command_pool(&self, _queue_family: u32) -> Result<NativeHandle> {
        let pool = self.mint();
        self.ledger.lock().command_pools.insert(pool);
        Ok(pool)
    }

    fn allocate_command_buffer(&self, pool: NativeHandle) -> Result<NativeHandle> {
        let mut ledger = self.ledger.lock();
        if !ledger.command_pools.contains(&pool) {
            return Err(EmberError::Backend {
                backend: self.backend_type,
                operation: "allocate a command buffer",
                reason: format!("unknown command pool {pool:?}"),
            });
        }
        let buffer = self.mint();
        ledger.command_buffers.insert(buffer, pool);
        Ok(buffer)
    }

    fn reset_command_buffer(&self, buffer: NativeHandle) -> Result<()> {
        let mut ledger = self.ledger.lock();
        if !ledger.command_buffers.contains_key(&buffer) {
            return Err(EmberError::Backend {
                backend: self.backend_type,
                operation: "reset a command buffer",
                reason: format!("unknown command buffer {buffer:?}"),
            });
        }
        ledger.recording.remove(&buffer);
        ledger.resets += 1;
        Ok(())
    }

    fn begin_one_time_submit(&self, buffer: NativeHandle) -> Result<()> {
        let mut ledger = self.ledger.lock();
        if !ledger.recording.insert(buffer) {
            return Err(EmberError::Backend {
                backend: self.backend_type,
                operation: "begin a command buffer",
                reason: format!("{buffer:?} is already recording"),
            });
        }
        Ok(())
    }

    fn free_command_buffer(&self, pool: NativeHandle, buffer: NativeHandle) {
        let mut ledger = self.ledger.lock();
        let owner = ledger.command_buffers.remove(&buffer);
        assert_eq!(owner, Some(pool), "command buffer {buffer:?} freed against the wrong pool");
        ledger.recording.remove(&buffer);
    }

    fn destroy_command_pool(&self, pool: NativeHandle) {
        let mut ledger = self.ledger.lock();
        assert!(ledger.command_pools.remove(&pool), "command pool {pool:?} destroyed twice");
        ledger.command_buffers.retain(|_, owner| *owner != pool);
    }
}
