//! Device Settings
//!
//! Sizing of every descriptor heap the [`DeviceContext`](crate::device::DeviceContext)
//! creates at initialization.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember::settings::DeviceSettings;
//!
//! // Defaults suit a desktop-class renderer
//! let settings = DeviceSettings::default();
//!
//! // Partial JSON overrides; omitted fields keep their defaults
//! let settings = DeviceSettings::from_json_str(r#"{ "dynamic_chunk_size": [128, 16] }"#)?;
//! ```
//!
//! # Layout
//!
//! CPU-only heap sizes are indexed by [`DescriptorHeapKind::index`]. GPU
//! (shader-visible) sizes only exist for `ResourceView` and `Sampler` and are
//! indexed the same way:
//!
//! ```text
//!   cpu_heap_size       [ResourceView, Sampler, RenderTarget, DepthStencil]
//!   gpu_static_size     [ResourceView, Sampler]
//!   gpu_dynamic_size    [ResourceView, Sampler]
//!   dynamic_chunk_size  [ResourceView, Sampler]
//! ```

use serde::{Deserialize, Serialize};

use crate::allocator::DescriptorHeapKind;
use crate::errors::{EmberError, Result};

/// Descriptor heap sizing for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    // === CPU-only heaps ===
    /// Slots per pool of each CPU-only descriptor table allocator.
    ///
    /// Pools grow on demand; this only sets the default pool size.
    pub cpu_heap_size: [u32; DescriptorHeapKind::COUNT],

    // === Shader-visible heaps ===
    /// Slots of the static partition of each GPU descriptor heap.
    pub gpu_static_size: [u32; DescriptorHeapKind::SHADER_VISIBLE_COUNT],

    /// Slots of the dynamic partition of each GPU descriptor heap.
    pub gpu_dynamic_size: [u32; DescriptorHeapKind::SHADER_VISIBLE_COUNT],

    /// Default chunk size dynamic ring allocators borrow from the dynamic partition.
    pub dynamic_chunk_size: [u32; DescriptorHeapKind::SHADER_VISIBLE_COUNT],

    // === Command recording ===
    /// Queue family the device's command buffer pool records for.
    pub command_queue_family: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            cpu_heap_size: [8192, 2048, 1024, 1024],
            gpu_static_size: [16384, 1024],
            gpu_dynamic_size: [8192, 1024],
            dynamic_chunk_size: [256, 32],
            command_queue_family: 0,
        }
    }
}

impl DeviceSettings {
    /// Parses settings from JSON and validates them.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects zero-sized heaps and chunks that cannot fit their partition.
    pub fn validate(&self) -> Result<()> {
        for kind in DescriptorHeapKind::ALL {
            if self.cpu_heap_size[kind.index()] == 0 {
                return Err(EmberError::InvalidSettings(format!(
                    "CPU {} heap size must be non-zero",
                    kind.name()
                )));
            }
        }

        for kind in DescriptorHeapKind::SHADER_VISIBLE {
            let i = kind.index();
            if self.gpu_static_size[i] == 0 || self.gpu_dynamic_size[i] == 0 {
                return Err(EmberError::InvalidSettings(format!(
                    "GPU {} heap partitions must be non-zero (static {}, dynamic {})",
                    kind.name(),
                    self.gpu_static_size[i],
                    self.gpu_dynamic_size[i]
                )));
            }
            if self.dynamic_chunk_size[i] == 0 || self.dynamic_chunk_size[i] > self.gpu_dynamic_size[i] {
                return Err(EmberError::InvalidSettings(format!(
                    "{} dynamic chunk size {} must be in 1..={}",
                    kind.name(),
                    self.dynamic_chunk_size[i],
                    self.gpu_dynamic_size[i]
                )));
            }
            if self.gpu_static_size[i].checked_add(self.gpu_dynamic_size[i]).is_none() {
                return Err(EmberError::InvalidSettings(format!(
                    "GPU {} heap size overflows",
                    kind.name()
                )));
            }
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn cpu_heap_size(&self, kind: DescriptorHeapKind) -> u32 {
        self.cpu_heap_size[kind.index()]
    }

    /// `(static, dynamic)` partition sizes, or `None` for CPU-only kinds.
    #[must_use]
    pub fn gpu_partition_sizes(&self, kind: DescriptorHeapKind) -> Option<(u32, u32)> {
        kind.is_shader_visible()
            .then(|| (self.gpu_static_size[kind.index()], self.gpu_dynamic_size[kind.index()]))
    }

    #[must_use]
    pub fn dynamic_chunk_size(&self, kind: DescriptorHeapKind) -> Option<u32> {
        kind.is_shader_visible().then(|| self.dynamic_chunk_size[kind.index()])
    }
}
