//! Device Object Archive
//!
//! Collects device objects (pipelines, resource signatures, render passes,
//! standalone shaders) built for several backends and packs them into one
//! relocatable blob.
//!
//! # Deduplication
//!
//! Shader bytecode is the bulk of an archive and is heavily shared between
//! pipelines. Per backend, every bytecode is hashed with xxh3 and stored once
//! in a shared table; records refer to table entries by index.
//!
//! ```text
//!   GraphicsPipeline "lit"    Vulkan: [0, 1]  ─┐
//!   GraphicsPipeline "unlit"  Vulkan: [0, 2]  ─┼─►  Vulkan table: #0 vs.spv  #1 lit.spv  #2 unlit.spv
//!   StandaloneShader "vs"     Vulkan: [0]     ─┘
//! ```
//!
//! # Registration
//!
//! Registration is idempotent for identical content and rejects a different
//! object under a name already in use for that kind. Pipelines register their
//! resource signatures and render pass first. Each kind has its own lock.
//!
//! # Readiness
//!
//! Objects may be registered while still compiling. [`ObjectArchive::build`]
//! skips objects that are not [`ObjectStatus::Ready`] and reports them in
//! [`ArchiveBuildOutput::skipped`].

pub mod reader;
pub mod serializer;

use std::collections::hash_map::Entry;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::{BackendFlags, BackendType};
use crate::errors::{EmberError, Result};

pub use reader::{ArchiveReader, BackendData, DecodedArchive, DecodedBytecode, DecodedRecord};
pub use serializer::{ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC};

use serializer::ArchiveContents;

// ─── Kinds & Status ──────────────────────────────────────────────────────────

/// Kind of archived device object. The discriminant is the record tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ResourceKind {
    ResourceSignature = 0,
    RenderPass = 1,
    GraphicsPipeline = 2,
    ComputePipeline = 3,
    RayTracingPipeline = 4,
    TilePipeline = 5,
    StandaloneShader = 6,
}

impl ResourceKind {
    pub const COUNT: usize = 7;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ResourceSignature,
        Self::RenderPass,
        Self::GraphicsPipeline,
        Self::ComputePipeline,
        Self::RayTracingPipeline,
        Self::TilePipeline,
        Self::StandaloneShader,
    ];

    #[inline]
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_pipeline(self) -> bool {
        matches!(
            self,
            Self::GraphicsPipeline | Self::ComputePipeline | Self::RayTracingPipeline | Self::TilePipeline
        )
    }

    /// Whether per-backend data is a bytecode list (as opposed to inline bytes).
    #[inline]
    #[must_use]
    pub const fn uses_bytecode(self) -> bool {
        self.is_pipeline() || matches!(self, Self::StandaloneShader)
    }
}

/// Build state of an archived object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectStatus {
    Ready = 0,
    /// Still compiling.
    Pending = 1,
    Failed = 2,
}

impl ObjectStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Pending,
            _ => Self::Failed,
        }
    }
}

// ─── Objects ─────────────────────────────────────────────────────────────────

/// Per-backend payload of an [`ArchiveObject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPayload {
    Inline(Vec<u8>),
    /// One bytecode per shader stage.
    Bytecode(Vec<Vec<u8>>),
}

#[derive(Debug)]
pub struct ArchiveObject {
    kind: ResourceKind,
    name: String,
    common: Vec<u8>,
    backends: [Option<BackendPayload>; BackendType::COUNT],
    dependencies: Vec<Arc<ArchiveObject>>,
    status: AtomicU8,
}

impl ArchiveObject {
    /// A ready object with backend-independent data `common` and no backend payloads yet.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>, common: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            name: name.into(),
            common: common.into(),
            backends: Default::default(),
            dependencies: Vec::new(),
            status: AtomicU8::new(ObjectStatus::Ready as u8),
        }
    }

    /// Inline data for `backend` (signatures and render passes).
    ///
    /// A zero-length backend slot in the blob means "absent", so inline data
    /// must be non-empty.
    ///
    /// # Panics
    ///
    /// If the kind stores bytecode instead, or `data` is empty.
    #[must_use]
    pub fn with_inline(mut self, backend: BackendType, data: impl Into<Vec<u8>>) -> Self {
        assert!(
            !self.kind.uses_bytecode(),
            "{:?} '{}' stores bytecode, not inline data",
            self.kind,
            self.name
        );
        let data = data.into();
        assert!(
            !data.is_empty(),
            "{:?} '{}' has empty inline data for {}",
            self.kind,
            self.name,
            backend.name()
        );
        self.backends[backend.index()] = Some(BackendPayload::Inline(data));
        self
    }

    /// Stage bytecode for `backend` (pipelines and standalone shaders).
    ///
    /// # Panics
    ///
    /// If the kind stores inline data, or a standalone shader is given
    /// anything other than exactly one bytecode.
    #[must_use]
    pub fn with_bytecode(mut self, backend: BackendType, stages: Vec<Vec<u8>>) -> Self {
        assert!(
            self.kind.uses_bytecode(),
            "{:?} '{}' stores inline data, not bytecode",
            self.kind,
            self.name
        );
        if self.kind == ResourceKind::StandaloneShader {
            assert_eq!(stages.len(), 1, "standalone shader '{}' has exactly one bytecode per backend", self.name);
        }
        self.backends[backend.index()] = Some(BackendPayload::Bytecode(stages));
        self
    }

    /// A resource signature or render pass this pipeline is built against.
    ///
    /// # Panics
    ///
    /// If `self` is not a pipeline, or `dependency` is neither a resource
    /// signature nor a render pass.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Arc<ArchiveObject>) -> Self {
        assert!(self.kind.is_pipeline(), "only pipelines have dependencies");
        assert!(
            matches!(dependency.kind, ResourceKind::ResourceSignature | ResourceKind::RenderPass),
            "pipeline '{}' cannot depend on {:?} '{}'",
            self.name,
            dependency.kind,
            dependency.name
        );
        self.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn with_status(self, status: ObjectStatus) -> Self {
        self.set_status(status);
        self
    }

    /// Updates the build state, e.g. when asynchronous compilation finishes.
    pub fn set_status(&self, status: ObjectStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        ObjectStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn common(&self) -> &[u8] {
        &self.common
    }

    #[must_use]
    pub fn backend_payload(&self, backend: BackendType) -> Option<&BackendPayload> {
        self.backends[backend.index()].as_ref()
    }

    /// Backends this object carries data for.
    #[must_use]
    pub fn backends(&self) -> BackendFlags {
        BackendType::ALL
            .into_iter()
            .filter(|backend| self.backends[backend.index()].is_some())
            .fold(BackendFlags::empty(), |flags, backend| flags | backend.flag())
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Arc<ArchiveObject>] {
        &self.dependencies
    }
}

/// Content equality; the build status is not content.
impl PartialEq for ArchiveObject {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.common == other.common
            && self.backends == other.backends
            && self.dependencies.len() == other.dependencies.len()
            && self
                .dependencies
                .iter()
                .zip(&other.dependencies)
                .all(|(a, b)| a.kind == b.kind && a.name == b.name)
    }
}

impl Eq for ArchiveObject {}

// ─── Archive ─────────────────────────────────────────────────────────────────

/// An object left out of a build because it, or a dependency, was not ready.
///
/// For a pipeline held back by a dependency, `status` is the dependency's
/// status and `blocked_by` names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedObject {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ObjectStatus,
    pub blocked_by: Option<(ResourceKind, String)>,
}

#[derive(Debug)]
pub struct ArchiveBuildOutput {
    pub blob: Vec<u8>,
    pub skipped: Vec<SkippedObject>,
}

type Registry = Mutex<FxHashMap<String, Arc<ArchiveObject>>>;

pub struct ObjectArchive {
    registries: [Registry; ResourceKind::COUNT],
}

impl Default for ObjectArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectArchive {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registries: std::array::from_fn(|_| Mutex::new(FxHashMap::default())),
        }
    }

    /// Adds `object` under its kind and name.
    ///
    /// Registering identical content again is a no-op. A pipeline's
    /// dependencies are registered first; if one of them collides, the
    /// pipeline is rejected with that error.
    pub fn register(&self, object: Arc<ArchiveObject>) -> Result<()> {
        for dependency in object.dependencies() {
            self.register(Arc::clone(dependency))?;
        }

        let kind = object.kind();
        let mut registry = self.registries[kind.index()].lock();
        match registry.entry(object.name().to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(())
            }
            Entry::Occupied(existing) => {
                if Arc::ptr_eq(existing.get(), &object) || **existing.get() == *object {
                    Ok(())
                } else {
                    log::error!(
                        "{kind:?} with name '{}' is already present in the archive with different content",
                        object.name()
                    );
                    Err(EmberError::NameCollision {
                        kind,
                        name: object.name().to_owned(),
                    })
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Arc<ArchiveObject>> {
        self.registries[kind.index()].lock().get(name).cloned()
    }

    /// Forgets every registered object.
    pub fn reset(&self) {
        for registry in &self.registries {
            registry.lock().clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registries.iter().map(|registry| registry.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes every ready object into one blob tagged with `content_version`.
    ///
    /// Fails as a whole if the host cannot allocate the tables or the blob.
    pub fn build(&self, content_version: u32) -> Result<ArchiveBuildOutput> {
        let (objects, skipped) = self.snapshot();
        let contents = ArchiveContents::collect(content_version, &objects)?;
        let blob = contents.to_blob()?;

        log::info!(
            "Archive v{content_version}: {} object(s), {} skipped, {} bytes ({})",
            contents.record_count(),
            skipped.len(),
            blob.len(),
            BackendType::ALL
                .iter()
                .filter(|&&backend| contents.bytecode_count(backend) > 0)
                .map(|&backend| format!("{}: {} bytecode(s)", backend.name(), contents.bytecode_count(backend)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(ArchiveBuildOutput { blob, skipped })
    }

    /// Like [`build`](Self::build), writing the blob to `writer`.
    pub fn build_to_writer<W: Write>(&self, content_version: u32, writer: &mut W) -> Result<Vec<SkippedObject>> {
        let ArchiveBuildOutput { blob, skipped } = self.build(content_version)?;
        writer.write_all(&blob)?;
        Ok(skipped)
    }

    /// Ready objects in (kind, name) order, plus the ones left out.
    ///
    /// A pipeline is ready only once every dependency registered for it is
    /// ready as well.
    fn snapshot(&self) -> (Vec<Arc<ArchiveObject>>, Vec<SkippedObject>) {
        let by_kind: [Vec<Arc<ArchiveObject>>; ResourceKind::COUNT] = std::array::from_fn(|index| {
            let mut objects: Vec<Arc<ArchiveObject>> = self.registries[index].lock().values().cloned().collect();
            objects.sort_unstable_by(|a, b| a.name.cmp(&b.name));
            objects
        });

        // Dependencies are judged by the registered copy; a missing one
        // (registered after its kind was snapshotted) holds the pipeline back.
        let registered_status = |kind: ResourceKind, name: &str| {
            let objects = &by_kind[kind.index()];
            objects
                .binary_search_by(|object| object.name().cmp(name))
                .map_or(ObjectStatus::Pending, |at| objects[at].status())
        };

        let mut ready = Vec::new();
        let mut skipped = Vec::new();

        for kind in ResourceKind::ALL {
            for object in &by_kind[kind.index()] {
                let status = object.status();
                if status != ObjectStatus::Ready {
                    log::warn!(
                        "{kind:?} '{}' is not ready ({status:?}) and will not be archived",
                        object.name()
                    );
                    skipped.push(SkippedObject {
                        kind,
                        name: object.name().to_owned(),
                        status,
                        blocked_by: None,
                    });
                    continue;
                }

                let blocker = object.dependencies().iter().find_map(|dependency| {
                    let status = registered_status(dependency.kind(), dependency.name());
                    (status != ObjectStatus::Ready).then_some((dependency, status))
                });

                match blocker {
                    None => ready.push(Arc::clone(object)),
                    Some((dependency, status)) => {
                        log::warn!(
                            "{kind:?} '{}' depends on {:?} '{}' which is not ready ({status:?}); it will not be archived",
                            object.name(),
                            dependency.kind(),
                            dependency.name()
                        );
                        skipped.push(SkippedObject {
                            kind,
                            name: object.name().to_owned(),
                            status,
                            blocked_by: Some((dependency.kind(), dependency.name().to_owned())),
                        });
                    }
                }
            }
        }

        (ready, skipped)
    }
}
