#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! # Ember RHI
//!
//! Resource-lifecycle core of a rendering hardware interface that targets
//! several native graphics backends. Backends only implement the native calls
//! (see [`backend`]); everything else is shared:
//!
//! | Module            | Provides                                                      |
//! |-------------------|---------------------------------------------------------------|
//! | [`allocator`]     | block allocator, descriptor table pools, GPU heaps, ring allocator |
//! | [`reclamation`]   | release of resources once GPU queues have retired them        |
//! | [`binding_cache`] | native binding objects keyed by pipeline and bound buffers    |
//! | [`archive`]       | cross-backend device object archive with bytecode dedup       |
//! | [`command_pool`]  | recyclable command buffers                                    |
//! | [`device`]        | [`DeviceContext`], owning one of each                         |

pub mod allocator;
pub mod archive;
pub mod backend;
pub mod binding_cache;
pub mod command_pool;
pub mod device;
pub mod errors;
pub mod identity;
pub mod reclamation;
pub mod settings;

pub use allocator::{
    BlockAllocator, DescriptorAllocation, DescriptorHeapKind, DescriptorTableAllocator,
    DynamicAllocation, DynamicRingAllocator, GpuDescriptorHeap,
};
pub use archive::{ArchiveObject, ArchiveReader, ObjectArchive, ObjectStatus, ResourceKind};
pub use backend::{BackendFlags, BackendType, DeviceBackend, HeadlessBackend, NativeHandle};
pub use binding_cache::{BindingAttribs, BindingKey, ObjectBindingCache};
pub use command_pool::{CommandBuffer, CommandBufferPool};
pub use device::DeviceContext;
pub use errors::{EmberError, Result};
pub use identity::{Identity, IdentityRegistry, ResourceClass};
pub use reclamation::{DeferredReclamationQueue, QueueMask, Reclaimable};
pub use settings::DeviceSettings;
