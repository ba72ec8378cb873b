//! Binding keys.
//!
//! A [`BindingKey`] captures everything a native binding object depends on:
//! the pipeline's identity, the index buffer's identity, and the
//! `(buffer identity, byte offset)` bound at every slot the pipeline's input
//! layout reads from. Slots the layout never reads are ignored, so rebinding
//! an unused slot does not miss the cache.
//!
//! Populated slots are stored as an explicit list in ascending slot order;
//! the hash is computed once at construction and combined in that order.

use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

use crate::backend::NativeHandle;
use crate::identity::Identity;

/// Number of vertex buffer slots a binding object can reference.
pub const MAX_BUFFER_SLOTS: usize = 32;

// ─── Input Layout ────────────────────────────────────────────────────────────

/// Scalar type of one vertex attribute component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float16,
    Float32,
}

impl ValueType {
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 | Self::Float16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Float16 | Self::Float32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputRate {
    #[default]
    PerVertex,
    /// Advances once every `step_rate` instances.
    PerInstance { step_rate: u32 },
}

/// One attribute of a pipeline's input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutElement {
    pub input_index: u32,
    pub buffer_slot: u32,
    pub num_components: u8,
    pub value_type: ValueType,
    pub normalized: bool,
    /// Byte offset of the attribute inside one vertex.
    pub relative_offset: u32,
    pub rate: InputRate,
}

impl LayoutElement {
    #[must_use]
    pub const fn new(input_index: u32, buffer_slot: u32, num_components: u8, value_type: ValueType) -> Self {
        Self {
            input_index,
            buffer_slot,
            num_components,
            value_type,
            normalized: false,
            relative_offset: 0,
            rate: InputRate::PerVertex,
        }
    }

    #[must_use]
    pub const fn normalized(mut self) -> Self {
        self.normalized = true;
        self
    }

    #[must_use]
    pub const fn at_offset(mut self, relative_offset: u32) -> Self {
        self.relative_offset = relative_offset;
        self
    }

    #[must_use]
    pub const fn per_instance(mut self, step_rate: u32) -> Self {
        self.rate = InputRate::PerInstance { step_rate };
        self
    }

    /// Size of the attribute in bytes.
    #[must_use]
    pub const fn byte_size(&self) -> u32 {
        self.num_components as u32 * self.value_type.size()
    }
}

/// The input side of a pipeline, as seen by the binding cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInputLayout {
    pub pipeline: Identity,
    /// Elements in declaration order.
    pub elements: Vec<LayoutElement>,
    /// Vertex stride of each buffer slot; 0 for unused slots.
    pub strides: [u32; MAX_BUFFER_SLOTS],
}

impl PipelineInputLayout {
    /// A layout with strides computed as tightly packed attributes per slot.
    ///
    /// # Panics
    ///
    /// If an element references a slot `>= MAX_BUFFER_SLOTS`.
    #[must_use]
    pub fn packed(pipeline: Identity, elements: Vec<LayoutElement>) -> Self {
        let mut strides = [0u32; MAX_BUFFER_SLOTS];
        for element in &elements {
            let slot = checked_slot(element);
            let end = element.relative_offset + element.byte_size();
            strides[slot] = strides[slot].max(end);
        }
        Self {
            pipeline,
            elements,
            strides,
        }
    }

    #[inline]
    #[must_use]
    pub fn stride(&self, slot: u32) -> u32 {
        self.strides[slot as usize]
    }
}

// ─── Bound State ─────────────────────────────────────────────────────────────

/// A buffer as both the cache (identity) and the backend (native handle) see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundBuffer {
    pub identity: Identity,
    pub native: NativeHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexStream {
    pub buffer: Option<BoundBuffer>,
    /// Byte offset of the first vertex inside the buffer.
    pub offset: u64,
}

impl VertexStream {
    #[must_use]
    pub const fn new(buffer: BoundBuffer, offset: u64) -> Self {
        Self {
            buffer: Some(buffer),
            offset,
        }
    }
}

/// Everything [`ObjectBindingCache::get`](super::ObjectBindingCache::get) looks at.
#[derive(Debug, Clone, Copy)]
pub struct BindingAttribs<'a> {
    pub layout: &'a PipelineInputLayout,
    /// Indexed by buffer slot.
    pub vertex_streams: &'a [VertexStream],
    pub index_buffer: Option<BoundBuffer>,
}

#[inline]
fn checked_slot(element: &LayoutElement) -> usize {
    let slot = element.buffer_slot as usize;
    assert!(
        slot < MAX_BUFFER_SLOTS,
        "input element {} uses buffer slot {slot}, the maximum is {}",
        element.input_index,
        MAX_BUFFER_SLOTS - 1
    );
    slot
}

/// The buffer bound at `element`'s slot.
///
/// # Panics
///
/// If the slot is out of range or has no buffer bound.
pub(super) fn bound_buffer(element: &LayoutElement, streams: &[VertexStream]) -> (BoundBuffer, u64) {
    let slot = checked_slot(element);
    let stream = streams.get(slot).unwrap_or_else(|| {
        panic!(
            "input element {} reads buffer slot {slot}, but only {} vertex stream(s) are bound",
            element.input_index,
            streams.len()
        )
    });
    let Some(buffer) = stream.buffer else {
        panic!(
            "input element {} reads buffer slot {slot}, but no vertex buffer is bound there",
            element.input_index
        );
    };
    (buffer, stream.offset)
}

// ─── Key ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotBinding {
    slot: u8,
    buffer: Identity,
    offset: u64,
}

/// Composite cache key of one binding object.
#[derive(Debug, Clone)]
pub struct BindingKey {
    pipeline: Identity,
    index_buffer: Option<Identity>,
    slots: SmallVec<[SlotBinding; 4]>,
    used_slots: u32,
    hash: u64,
}

impl BindingKey {
    /// # Panics
    ///
    /// If the layout reads a slot with no bound buffer.
    #[must_use]
    pub fn new(attribs: &BindingAttribs<'_>) -> Self {
        let mut used_slots = 0u32;
        let mut slots: SmallVec<[SlotBinding; 4]> = SmallVec::new();

        for element in &attribs.layout.elements {
            let (buffer, offset) = bound_buffer(element, attribs.vertex_streams);
            let bit = 1u32 << element.buffer_slot;
            if used_slots & bit == 0 {
                used_slots |= bit;
                slots.push(SlotBinding {
                    slot: element.buffer_slot as u8,
                    buffer: buffer.identity,
                    offset,
                });
            }
        }
        slots.sort_unstable_by_key(|binding| binding.slot);

        let pipeline = attribs.layout.pipeline;
        let index_buffer = attribs.index_buffer.map(|buffer| buffer.identity);

        let mut hasher = rustc_hash::FxHasher::default();
        pipeline.hash(&mut hasher);
        index_buffer.hash(&mut hasher);
        for binding in &slots {
            binding.buffer.hash(&mut hasher);
            binding.offset.hash(&mut hasher);
        }
        used_slots.hash(&mut hasher);

        Self {
            pipeline,
            index_buffer,
            slots,
            used_slots,
            hash: hasher.finish(),
        }
    }

    #[inline]
    #[must_use]
    pub fn pipeline(&self) -> Identity {
        self.pipeline
    }

    #[inline]
    #[must_use]
    pub fn index_buffer(&self) -> Option<Identity> {
        self.index_buffer
    }

    /// Bitmask of the buffer slots the pipeline reads.
    #[inline]
    #[must_use]
    pub fn used_slots(&self) -> u32 {
        self.used_slots
    }

    /// `(slot, buffer identity, offset)` in ascending slot order.
    pub fn slot_bindings(&self) -> impl Iterator<Item = (u32, Identity, u64)> + '_ {
        self.slots
            .iter()
            .map(|binding| (u32::from(binding.slot), binding.buffer, binding.offset))
    }

    /// Every distinct buffer identity the key references, index buffer included.
    #[must_use]
    pub fn referenced_buffers(&self) -> SmallVec<[Identity; 4]> {
        let mut buffers: SmallVec<[Identity; 4]> = self.index_buffer.into_iter().collect();
        for binding in &self.slots {
            if !buffers.contains(&binding.buffer) {
                buffers.push(binding.buffer);
            }
        }
        buffers
    }

    /// Whether the key depends on `identity` in any role.
    #[must_use]
    pub fn references(&self, identity: Identity) -> bool {
        self.pipeline == identity
            || self.index_buffer == Some(identity)
            || self.slots.iter().any(|binding| binding.buffer == identity)
    }

    #[inline]
    #[must_use]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for BindingKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.pipeline == other.pipeline
            && self.index_buffer == other.index_buffer
            && self.used_slots == other.used_slots
            && self.slots == other.slots
    }
}

impl Eq for BindingKey {}

impl Hash for BindingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRegistry, ResourceClass};

    fn buffer(registry: &IdentityRegistry, raw: u64) -> BoundBuffer {
        BoundBuffer {
            identity: registry.create(ResourceClass::Buffer),
            native: NativeHandle::from_raw(raw),
        }
    }

    #[test]
    fn declaration_order_does_not_change_the_key() {
        let registry = IdentityRegistry::new();
        let pipeline = registry.create(ResourceClass::Pipeline);
        let (b0, b1) = (buffer(&registry, 1), buffer(&registry, 2));
        let streams = [VertexStream::new(b0, 0), VertexStream::new(b1, 64)];

        let forward = PipelineInputLayout::packed(
            pipeline,
            vec![
                LayoutElement::new(0, 0, 3, ValueType::Float32),
                LayoutElement::new(1, 1, 2, ValueType::Float32),
            ],
        );
        let reversed = PipelineInputLayout::packed(
            pipeline,
            vec![
                LayoutElement::new(1, 1, 2, ValueType::Float32),
                LayoutElement::new(0, 0, 3, ValueType::Float32),
            ],
        );

        let a = BindingKey::new(&BindingAttribs {
            layout: &forward,
            vertex_streams: &streams,
            index_buffer: None,
        });
        let b = BindingKey::new(&BindingAttribs {
            layout: &reversed,
            vertex_streams: &streams,
            index_buffer: None,
        });
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_eq!(a.used_slots(), 0b11);
    }

    #[test]
    fn unused_slots_are_ignored() {
        let registry = IdentityRegistry::new();
        let pipeline = registry.create(ResourceClass::Pipeline);
        let (b0, stray, other) = (buffer(&registry, 1), buffer(&registry, 2), buffer(&registry, 3));
        let layout = PipelineInputLayout::packed(pipeline, vec![LayoutElement::new(0, 0, 4, ValueType::Uint8)]);

        let with_stray = [VertexStream::new(b0, 0), VertexStream::new(stray, 0)];
        let with_other = [VertexStream::new(b0, 0), VertexStream::new(other, 16)];
        let a = BindingKey::new(&BindingAttribs {
            layout: &layout,
            vertex_streams: &with_stray,
            index_buffer: None,
        });
        let b = BindingKey::new(&BindingAttribs {
            layout: &layout,
            vertex_streams: &with_other,
            index_buffer: None,
        });
        assert_eq!(a, b);
    }

    #[test]
    fn offsets_and_index_buffers_distinguish_keys() {
        let registry = IdentityRegistry::new();
        let pipeline = registry.create(ResourceClass::Pipeline);
        let (b0, ib) = (buffer(&registry, 1), buffer(&registry, 2));
        let layout = PipelineInputLayout::packed(pipeline, vec![LayoutElement::new(0, 0, 3, ValueType::Float32)]);

        let key = |offset: u64, index_buffer: Option<BoundBuffer>| {
            BindingKey::new(&BindingAttribs {
                layout: &layout,
                vertex_streams: &[VertexStream::new(b0, offset)],
                index_buffer,
            })
        };
        assert_ne!(key(0, None), key(12, None));
        assert_ne!(key(0, None), key(0, Some(ib)));
        assert_eq!(key(0, Some(ib)), key(0, Some(ib)));
        assert_eq!(key(0, Some(ib)).referenced_buffers().as_slice(), &[ib.identity, b0.identity]);
    }

    #[test]
    fn packed_strides_cover_every_attribute() {
        let registry = IdentityRegistry::new();
        let layout = PipelineInputLayout::packed(
            registry.create(ResourceClass::Pipeline),
            vec![
                LayoutElement::new(0, 0, 3, ValueType::Float32),
                LayoutElement::new(1, 0, 4, ValueType::Uint8).normalized().at_offset(12),
                LayoutElement::new(2, 1, 2, ValueType::Float16).per_instance(1),
            ],
        );
        assert_eq!(layout.stride(0), 16);
        assert_eq!(layout.stride(1), 4);
        assert_eq!(layout.stride(2), 0);
    }

    #[test]
    #[should_panic(expected = "no vertex buffer is bound")]
    fn missing_buffer_panics() {
        let registry = IdentityRegistry::new();
        let layout = PipelineInputLayout::packed(
            registry.create(ResourceClass::Pipeline),
            vec![LayoutElement::new(0, 1, 3, ValueType::Float32)],
        );
        let streams = [VertexStream::new(buffer(&registry, 1), 0), VertexStream::default()];
        let _ = BindingKey::new(&BindingAttribs {
            layout: &layout,
            vertex_streams: &streams,
            index_buffer: None,
        });
    }
}
