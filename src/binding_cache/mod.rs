//! Object Binding Cache
//!
//! Native binding objects (vertex array objects, input-assembler state
//! blocks) are expensive to build and are fully determined by the pipeline,
//! the index buffer and the vertex buffers bound at the slots the pipeline
//! reads. [`ObjectBindingCache`] builds each one once per [`BindingKey`].
//!
//! # Invalidation
//!
//! The cache stores identities, never owning references. When a pipeline or
//! buffer is destroyed its owner calls
//! [`on_resource_destroyed`](ObjectBindingCache::on_resource_destroyed). Two
//! reverse indices make that proportional to the number of entries touching
//! the identity:
//!
//! ```text
//!   objects:          BindingKey ─────────► NativeHandle
//!   pipeline_to_keys: pipeline Identity ──► [BindingKey]
//!   buffer_to_keys:   buffer Identity ────► [BindingKey]   (index buffer included)
//! ```
//!
//! After evicting the entries, only the identities those entries referenced
//! have their reverse-index lists pruned of dangling keys.

pub mod key;

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::backend::{BindingObjectBackend, NativeHandle};
use crate::errors::Result;
use crate::identity::Identity;

pub use key::{
    BindingAttribs, BindingKey, BoundBuffer, InputRate, LayoutElement, MAX_BUFFER_SLOTS,
    PipelineInputLayout, ValueType, VertexStream,
};

// ─── Native Description ──────────────────────────────────────────────────────

/// One attribute as the backend should wire it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttributeBinding {
    pub input_index: u32,
    pub buffer_slot: u32,
    pub buffer: NativeHandle,
    pub num_components: u8,
    pub value_type: ValueType,
    pub normalized: bool,
    pub stride: u32,
    /// Stream offset plus the element's relative offset, in bytes.
    pub offset: u64,
    pub rate: InputRate,
}

/// Input handed to [`BindingObjectBackend::create_binding_object`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingObjectDesc {
    /// In input-layout declaration order.
    pub attributes: Vec<VertexAttributeBinding>,
    pub index_buffer: Option<NativeHandle>,
}

impl BindingObjectDesc {
    fn from_attribs(attribs: &BindingAttribs<'_>) -> Self {
        let layout = attribs.layout;
        let attributes = layout
            .elements
            .iter()
            .map(|element| {
                let (buffer, stream_offset) = key::bound_buffer(element, attribs.vertex_streams);
                VertexAttributeBinding {
                    input_index: element.input_index,
                    buffer_slot: element.buffer_slot,
                    buffer: buffer.native,
                    num_components: element.num_components,
                    value_type: element.value_type,
                    normalized: element.normalized,
                    stride: layout.stride(element.buffer_slot),
                    offset: stream_offset + u64::from(element.relative_offset),
                    rate: element.rate,
                }
            })
            .collect();

        Self {
            attributes,
            index_buffer: attribs.index_buffer.map(|buffer| buffer.native),
        }
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CacheState {
    objects: FxHashMap<BindingKey, NativeHandle>,
    pipeline_to_keys: FxHashMap<Identity, Vec<BindingKey>>,
    buffer_to_keys: FxHashMap<Identity, Vec<BindingKey>>,
}

impl CacheState {
    /// Prunes keys no longer in `objects` from the reverse lists of every
    /// identity the `stale` keys referenced.
    fn clear_stale_keys(&mut self, stale: &[BindingKey]) {
        let mut pipelines: FxHashSet<Identity> = FxHashSet::default();
        let mut buffers: FxHashSet<Identity> = FxHashSet::default();
        for key in stale {
            pipelines.insert(key.pipeline());
            buffers.extend(key.referenced_buffers());
        }

        let Self {
            objects,
            pipeline_to_keys,
            buffer_to_keys,
        } = self;

        for (index, candidates) in [(pipeline_to_keys, pipelines), (buffer_to_keys, buffers)] {
            for identity in candidates {
                if let Some(keys) = index.get_mut(&identity) {
                    keys.retain(|key| objects.contains_key(key));
                    if keys.is_empty() {
                        index.remove(&identity);
                    }
                }
            }
        }
    }
}

pub struct ObjectBindingCache {
    backend: Arc<dyn BindingObjectBackend>,
    empty_object: NativeHandle,
    state: Mutex<CacheState>,
}

impl ObjectBindingCache {
    /// Creates the cache and its shared empty binding object.
    pub fn new(backend: Arc<dyn BindingObjectBackend>) -> Result<Self> {
        let empty_object = backend.create_binding_object(&BindingObjectDesc::default())?;
        Ok(Self {
            backend,
            empty_object,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Returns the binding object for `attribs`, building it on first use.
    ///
    /// # Panics
    ///
    /// If the input layout reads a buffer slot that has no buffer bound.
    pub fn get(&self, attribs: &BindingAttribs<'_>) -> Result<NativeHandle> {
        let key = BindingKey::new(attribs);

        let mut state = self.state.lock();
        if let Some(&object) = state.objects.get(&key) {
            return Ok(object);
        }

        let object = self
            .backend
            .create_binding_object(&BindingObjectDesc::from_attribs(attribs))?;

        state
            .pipeline_to_keys
            .entry(key.pipeline())
            .or_default()
            .push(key.clone());
        for buffer in key.referenced_buffers() {
            state.buffer_to_keys.entry(buffer).or_default().push(key.clone());
        }
        state.objects.insert(key, object);

        log::debug!("Built binding object {object:?} ({} cached)", state.objects.len());
        Ok(object)
    }

    /// Evicts every binding object whose key references `identity` and
    /// destroys the native objects. Returns the number evicted.
    ///
    /// Identities that no cached key references are a no-op.
    pub fn on_resource_destroyed(&self, identity: Identity) -> usize {
        let evicted: SmallVec<[NativeHandle; 8]> = {
            let mut state = self.state.lock();

            let mut stale: Vec<BindingKey> = Vec::new();
            if let Some(keys) = state.pipeline_to_keys.remove(&identity) {
                stale.extend(keys);
            }
            if let Some(keys) = state.buffer_to_keys.remove(&identity) {
                stale.extend(keys);
            }
            if stale.is_empty() {
                return 0;
            }

            let evicted = stale
                .iter()
                .filter_map(|key| state.objects.remove(key))
                .collect();
            state.clear_stale_keys(&stale);
            evicted
        };

        for &object in &evicted {
            self.backend.destroy_binding_object(object);
        }
        log::debug!("Evicted {} binding object(s) referencing {identity:?}", evicted.len());
        evicted.len()
    }

    /// Drops every cached object and both reverse indices.
    pub fn clear(&self) {
        let objects = std::mem::take(&mut *self.state.lock()).objects;
        for object in objects.into_values() {
            self.backend.destroy_binding_object(object);
        }
    }

    /// Binding object with no attributes and no index buffer.
    #[inline]
    #[must_use]
    pub fn empty_object(&self) -> NativeHandle {
        self.empty_object
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reverse-index entries recorded for `identity`, across both indices.
    #[must_use]
    pub fn indexed_key_count(&self, identity: Identity) -> usize {
        let state = self.state.lock();
        state.pipeline_to_keys.get(&identity).map_or(0, Vec::len)
            + state.buffer_to_keys.get(&identity).map_or(0, Vec::len)
    }
}

impl Drop for ObjectBindingCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.objects.is_empty() {
            log::warn!(
                "Binding cache dropped with {} object(s) still cached; were all pipelines and buffers destroyed?",
                state.objects.len()
            );
        }
        for (_, object) in state.objects.drain() {
            self.backend.destroy_binding_object(object);
        }
        self.backend.destroy_binding_object(self.empty_object);
    }
}
