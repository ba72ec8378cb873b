//! Descriptor Allocation
//!
//! Slot allocation for descriptor heaps, leaves first:
//!
//! ```text
//!   BlockAllocator            free-list over [0, capacity), not synchronized
//!        ▲
//!   DescriptorTableAllocator  pool of BlockAllocator-backed native heaps, one mutex
//!        ▲
//!   GpuDescriptorHeap         one shader-visible heap split into static | dynamic
//!        ▲
//!   DynamicRingAllocator      &mut self bump allocator over dynamic-partition chunks
//! ```
//!
//! Freed slots go back to their owner through the
//! [`DeferredReclamationQueue`](crate::reclamation::DeferredReclamationQueue)
//! whenever the GPU may still be reading them; see [`StaleAllocation`].

pub mod block;
pub mod descriptor_table;
pub mod dynamic_ring;
pub mod gpu_heap;

use serde::{Deserialize, Serialize};

pub use block::BlockAllocator;
pub use descriptor_table::{
    DescriptorAllocation, DescriptorTableAllocator, DescriptorTableStats, StaleAllocation,
};
pub use dynamic_ring::{DynamicAllocation, DynamicRingAllocator};
pub use gpu_heap::GpuDescriptorHeap;

/// Kind of descriptor a heap stores.
///
/// The shader-visible kinds come first so that per-kind GPU tables can be
/// indexed with the same [`index`](Self::index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views.
    ResourceView,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl DescriptorHeapKind {
    pub const COUNT: usize = 4;
    pub const SHADER_VISIBLE_COUNT: usize = 2;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ResourceView,
        Self::Sampler,
        Self::RenderTarget,
        Self::DepthStencil,
    ];

    pub const SHADER_VISIBLE: [Self; Self::SHADER_VISIBLE_COUNT] = [Self::ResourceView, Self::Sampler];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether a GPU (shader-visible) heap exists for this kind.
    #[inline]
    #[must_use]
    pub const fn is_shader_visible(self) -> bool {
        matches!(self, Self::ResourceView | Self::Sampler)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ResourceView => "resource view",
            Self::Sampler => "sampler",
            Self::RenderTarget => "render target",
            Self::DepthStencil => "depth stencil",
        }
    }
}

/// Rounds `value` up to a power-of-two `alignment`, widening to avoid overflow.
#[inline]
pub(crate) fn align_up(value: u32, alignment: u32) -> u64 {
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    let mask = u64::from(alignment) - 1;
    (u64::from(value) + mask) & !mask
}
