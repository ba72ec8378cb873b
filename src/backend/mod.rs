//! Native Backend Boundary
//!
//! Every allocator, cache and archive in this crate is written once, against
//! the small capability traits defined here. A backend (Direct3D 12, Vulkan,
//! OpenGL, ...) implements them only for the native calls themselves:
//!
//! | Trait                     | Native objects                        | Used by                        |
//! |---------------------------|---------------------------------------|--------------------------------|
//! | [`DescriptorHeapBackend`] | descriptor heaps / pools              | `DescriptorTableAllocator`     |
//! | [`BindingObjectBackend`]  | vertex-array / input binding objects  | `ObjectBindingCache`           |
//! | [`CommandBufferBackend`]  | command pools and command buffers     | `CommandBufferPool`            |
//!
//! Native objects never cross this boundary as owning pointers. They are
//! opaque [`NativeHandle`]s; the component that created a handle is the only
//! one that destroys it.

pub mod headless;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::allocator::DescriptorHeapKind;
use crate::binding_cache::BindingObjectDesc;
use crate::errors::Result;

pub use headless::HeadlessBackend;

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Opaque handle to a native backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ─── Backend Types ───────────────────────────────────────────────────────────

/// Native graphics backends an object can be built for.
///
/// The discriminant is the backend's fixed position in archive blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackendType {
    OpenGl = 0,
    Direct3D11 = 1,
    Direct3D12 = 2,
    Vulkan = 3,
    MetalMacOs = 4,
    MetalIos = 5,
}

impl BackendType {
    pub const COUNT: usize = 6;

    pub const ALL: [BackendType; Self::COUNT] = [
        Self::OpenGl,
        Self::Direct3D11,
        Self::Direct3D12,
        Self::Vulkan,
        Self::MetalMacOs,
        Self::MetalIos,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn flag(self) -> BackendFlags {
        match self {
            Self::OpenGl => BackendFlags::OPENGL,
            Self::Direct3D11 => BackendFlags::DIRECT3D11,
            Self::Direct3D12 => BackendFlags::DIRECT3D12,
            Self::Vulkan => BackendFlags::VULKAN,
            Self::MetalMacOs => BackendFlags::METAL_MACOS,
            Self::MetalIos => BackendFlags::METAL_IOS,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OpenGl => "OpenGL",
            Self::Direct3D11 => "Direct3D11",
            Self::Direct3D12 => "Direct3D12",
            Self::Vulkan => "Vulkan",
            Self::MetalMacOs => "Metal (macOS)",
            Self::MetalIos => "Metal (iOS)",
        }
    }
}

bitflags! {
    /// Set of [`BackendType`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BackendFlags: u32 {
        const OPENGL      = 1 << 0;
        const DIRECT3D11  = 1 << 1;
        const DIRECT3D12  = 1 << 2;
        const VULKAN      = 1 << 3;
        const METAL_MACOS = 1 << 4;
        const METAL_IOS   = 1 << 5;
    }
}

impl BackendFlags {
    /// Iterates the contained backends in archive order.
    pub fn backends(self) -> impl Iterator<Item = BackendType> {
        BackendType::ALL
            .into_iter()
            .filter(move |backend| self.contains(backend.flag()))
    }
}

// ─── Capability Traits ───────────────────────────────────────────────────────

/// Parameters of a native descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    /// Shader-visible heaps are bound at draw time; CPU-only heaps are staging.
    pub shader_visible: bool,
}

/// Creation and destruction of native descriptor heaps.
pub trait DescriptorHeapBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Creates a heap with `desc.capacity` slots.
    ///
    /// Failure here means the host (or device) is out of memory and is
    /// propagated as failure of the allocation that triggered the growth.
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<NativeHandle>;

    fn destroy_descriptor_heap(&self, heap: NativeHandle);
}

/// Creation and destruction of native binding objects.
pub trait BindingObjectBackend: Send + Sync {
    /// Builds a native object capturing the bindings in `desc`.
    ///
    /// `desc.attributes` are in the pipeline's input-layout declaration order.
    fn create_binding_object(&self, desc: &BindingObjectDesc) -> Result<NativeHandle>;

    fn destroy_binding_object(&self, object: NativeHandle);
}

/// Native command pools and command buffers.
pub trait CommandBufferBackend: Send + Sync {
    fn create_command_pool(&self, queue_family: u32) -> Result<NativeHandle>;

    fn allocate_command_buffer(&self, pool: NativeHandle) -> Result<NativeHandle>;

    /// Returns a previously submitted buffer to the initial state.
    fn reset_command_buffer(&self, buffer: NativeHandle) -> Result<()>;

    /// Begins a recording that will be submitted exactly once.
    fn begin_one_time_submit(&self, buffer: NativeHandle) -> Result<()>;

    fn free_command_buffer(&self, pool: NativeHandle, buffer: NativeHandle);

    fn destroy_command_pool(&self, pool: NativeHandle);
}

/// Everything a [`DeviceContext`](crate::device::DeviceContext) needs from a backend.
pub trait DeviceBackend: DescriptorHeapBackend + BindingObjectBackend + CommandBufferBackend {}

impl<T> DeviceBackend for T where T: DescriptorHeapBackend + BindingObjectBackend + CommandBufferBackend {}
