//! Shader-Visible Descriptor Heaps
//!
//! Only one shader-visible heap per kind can be bound at a time, so each is
//! created once, at its full size, and split into two fixed partitions:
//!
//! ```text
//!   0                      static_size                static_size + dynamic_size
//!   ├──── static ──────────┼──────── dynamic ─────────┤
//!     long-lived tables       chunks for DynamicRingAllocator
//! ```
//!
//! Both partitions are [`DescriptorTableAllocator`]s that never grow. The
//! native heap is destroyed once both partitions are gone.

use std::sync::Arc;

use super::descriptor_table::OwnedHeap;
use super::{DescriptorHeapKind, DescriptorTableAllocator, DynamicRingAllocator};
use crate::backend::{DescriptorHeapBackend, DescriptorHeapDesc, NativeHandle};
use crate::errors::Result;

pub struct GpuDescriptorHeap {
    kind: DescriptorHeapKind,
    heap: NativeHandle,
    static_partition: Arc<DescriptorTableAllocator>,
    dynamic_partition: Arc<DescriptorTableAllocator>,
}

impl GpuDescriptorHeap {
    /// Creates the native heap and both partitions.
    ///
    /// # Panics
    ///
    /// If `kind` is not shader-visible or a partition is empty.
    pub fn new(
        backend: Arc<dyn DescriptorHeapBackend>,
        kind: DescriptorHeapKind,
        static_size: u32,
        dynamic_size: u32,
    ) -> Result<Self> {
        assert!(kind.is_shader_visible(), "{} heaps are never shader-visible", kind.name());
        assert!(
            static_size > 0 && dynamic_size > 0,
            "GPU descriptor heap partitions must be non-empty"
        );

        let capacity = static_size + dynamic_size;
        let handle = backend.create_descriptor_heap(&DescriptorHeapDesc {
            kind,
            capacity,
            shader_visible: true,
        })?;
        let heap = Arc::new(OwnedHeap {
            handle,
            backend: Arc::clone(&backend),
        });

        let static_partition = DescriptorTableAllocator::with_fixed_partition(
            Arc::clone(&backend),
            kind,
            "static",
            Arc::clone(&heap),
            0,
            static_size,
        );
        let dynamic_partition = DescriptorTableAllocator::with_fixed_partition(
            backend,
            kind,
            "dynamic",
            heap,
            static_size,
            dynamic_size,
        );

        log::info!(
            "GPU {} descriptor heap: {capacity} slots ({static_size} static, {dynamic_size} dynamic)",
            kind.name()
        );

        Ok(Self {
            kind,
            heap: handle,
            static_partition: Arc::new(static_partition),
            dynamic_partition: Arc::new(dynamic_partition),
        })
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// The native heap both partitions live in.
    #[inline]
    #[must_use]
    pub fn heap(&self) -> NativeHandle {
        self.heap
    }

    /// Allocator for long-lived descriptor tables.
    #[inline]
    #[must_use]
    pub fn static_partition(&self) -> &Arc<DescriptorTableAllocator> {
        &self.static_partition
    }

    /// Shared chunk source for [`DynamicRingAllocator`]s.
    #[inline]
    #[must_use]
    pub fn dynamic_partition(&self) -> &Arc<DescriptorTableAllocator> {
        &self.dynamic_partition
    }

    /// A ring allocator borrowing `chunk_size`-slot chunks from the dynamic partition.
    #[must_use]
    pub fn create_dynamic_allocator(&self, name: impl Into<String>, chunk_size: u32) -> DynamicRingAllocator {
        DynamicRingAllocator::new(name, Arc::clone(&self.dynamic_partition), chunk_size)
    }
}
