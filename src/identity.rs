//! Resource Identities
//!
//! Caches and archives never hold owning references to the resources they
//! describe. They hold an [`Identity`]: a generation-tagged slot key handed
//! out once per logical resource by the [`IdentityRegistry`].
//!
//! Destroying an identity frees its slot; the next resource that reuses the
//! slot gets a bumped generation, so keys built from the old identity can
//! never match the new resource.

use parking_lot::Mutex;
use slotmap::{Key, SlotMap, new_key_type};

new_key_type! {
    /// Stable identity of one logical resource.
    pub struct Identity;
}

impl Identity {
    /// Packed `(generation, index)` form, stable for the identity's lifetime.
    #[inline]
    #[must_use]
    pub fn to_bits(self) -> u64 {
        self.data().as_ffi()
    }
}

/// Broad class of the resource an identity was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Buffer,
    Texture,
    Sampler,
    Pipeline,
    ResourceSignature,
}

/// Thread-safe issuer of [`Identity`] values.
pub struct IdentityRegistry {
    slots: Mutex<SlotMap<Identity, ResourceClass>>,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::with_key()),
        }
    }

    pub fn create(&self, class: ResourceClass) -> Identity {
        self.slots.lock().insert(class)
    }

    /// Retires `identity`. Returns the class it was created with, or `None`
    /// if it was already destroyed.
    pub fn destroy(&self, identity: Identity) -> Option<ResourceClass> {
        self.slots.lock().remove(identity)
    }

    #[must_use]
    pub fn class_of(&self, identity: Identity) -> Option<ResourceClass> {
        self.slots.lock().get(identity).copied()
    }

    #[must_use]
    pub fn is_alive(&self, identity: Identity) -> bool {
        self.slots.lock().contains_key(identity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
