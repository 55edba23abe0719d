//! Mirror Scene Interface
//!
//! The mirror scene is the renderer-owned representation kept in sync with
//! the source graph. It is the only thing this crate writes to:
//!
//! - [`MirrorScene`]: attach/detach entities, update transforms, tag owners,
//!   enumerate by owner or class, store the last digest, renderer settings
//! - [`MirrorHandle`]: the shared handle through which the render thread
//!   reads and the controlling thread mutates
//! - [`ops`]: mutation primitives shared by pull and push mode
//! - [`lights`]: environment/ground singletons and the default-light crossover
//! - [`memory::MemoryMirror`]: an in-process implementation
//!
//! # Locking
//!
//! The render thread takes read locks for as long as it consumes a frame.
//! The controlling thread prepares all geometry first and takes the write
//! lock only around the attach/detach/transform calls of one cycle or batch.

pub mod lights;
pub mod memory;
pub mod ops;

use std::sync::Arc;

use glam::Affine3A;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::digest::ChangeDigest;
use crate::identity::{GeometryId, MaterialId, StableHandle};
use crate::motion::Motion;
use crate::record::ShapeInfo;
use crate::settings::{EnvironmentSettings, GroundSettings, TonemapSettings};
use crate::source::LightKind;

pub use memory::MemoryMirror;

new_key_type! {
    pub struct EntityKey;
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Shape,
    Light(LightKind),
    /// Placed environment emitter.
    EnvironmentLight,
    Portal,
    /// Render-global environment singleton.
    Environment,
    /// Render-global ground singleton.
    Ground,
    /// Fallback light present while the scene has no light contribution.
    DefaultLight,
}

/// Coarse entity classes used for enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Shape,
    Light,
    EnvironmentLight,
    Portal,
    Environment,
    Ground,
    DefaultLight,
}

impl EntityKind {
    #[must_use]
    pub fn class(&self) -> EntityClass {
        match self {
            Self::Shape => EntityClass::Shape,
            Self::Light(_) => EntityClass::Light,
            Self::EnvironmentLight => EntityClass::EnvironmentLight,
            Self::Portal => EntityClass::Portal,
            Self::Environment => EntityClass::Environment,
            Self::Ground => EntityClass::Ground,
            Self::DefaultLight => EntityClass::DefaultLight,
        }
    }
}

/// Geometry constructed once per geometry group and shared by its instances.
#[derive(Debug, PartialEq)]
pub struct BuiltGeometry {
    pub geometry: GeometryId,
    /// Placement the geometry was built from.
    pub primary: StableHandle,
    pub slot_count: usize,
    pub shape: ShapeInfo,
    pub mirrored: bool,
}

/// Singleton-specific data.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EntityPayload {
    #[default]
    None,
    Environment(EnvironmentSettings),
    Ground(GroundSettings),
}

/// One renderer-owned shape or light.
#[derive(Debug, Clone)]
pub struct MirrorEntity {
    /// Owning placement; `None` for singletons and default lights.
    pub owner: Option<StableHandle>,
    pub kind: EntityKind,
    pub transform: Affine3A,
    pub geometry: Option<Arc<BuiltGeometry>>,
    pub material: Option<MaterialId>,
    /// Material slot of the owning placement this entity renders.
    pub slot: u32,
    pub motion: Option<Motion>,
    pub payload: EntityPayload,
}

impl MirrorEntity {
    /// Creates an untagged entity without geometry.
    #[must_use]
    pub fn new(kind: EntityKind, transform: Affine3A) -> Self {
        Self {
            owner: None,
            kind,
            transform,
            geometry: None,
            material: None,
            slot: 0,
            motion: None,
            payload: EntityPayload::None,
        }
    }
}

/// How the renderer must treat its accumulated image after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetKind {
    /// Scene content changed: discard all accumulated samples.
    Full,
    /// Only the camera/view changed: cheap interactive restart.
    Interactive,
}

// ============================================================================
// MirrorScene
// ============================================================================

/// Mutation and query interface of the renderer's scene.
pub trait MirrorScene {
    fn attach(&mut self, entity: MirrorEntity) -> EntityKey;

    fn detach(&mut self, key: EntityKey) -> Option<MirrorEntity>;

    /// Updates the transform (and motion) of an entity in place.
    fn set_transform(&mut self, key: EntityKey, transform: Affine3A, motion: Option<Motion>) -> bool;

    /// Tags an entity with its owning placement.
    fn tag(&mut self, key: EntityKey, owner: StableHandle) -> bool;

    fn entity(&self, key: EntityKey) -> Option<&MirrorEntity>;

    fn entities_of(&self, owner: StableHandle) -> SmallVec<[EntityKey; 4]>;

    fn entities_by_class(&self, class: EntityClass) -> Vec<EntityKey>;

    /// Every owner id with at least one tagged entity.
    fn owners(&self) -> Vec<StableHandle>;

    fn digest(&self) -> Option<ChangeDigest>;

    fn set_digest(&mut self, digest: ChangeDigest);

    fn tonemap(&self) -> Option<TonemapSettings>;

    fn set_tonemap(&mut self, tonemap: Option<TonemapSettings>);

    fn alpha(&self) -> bool;

    fn set_alpha(&mut self, enabled: bool);

    /// Resets the renderer's accumulated image state.
    fn invalidate(&mut self, reset: ResetKind);
}

// ============================================================================
// MirrorHandle
// ============================================================================

/// Shared handle to a mirror scene, read by the render thread and mutated by
/// the controlling thread.
pub struct MirrorHandle<M> {
    inner: Arc<RwLock<M>>,
}

impl<M> Clone for MirrorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MirrorScene> MirrorHandle<M> {
    pub fn new(scene: M) -> Self {
        Self {
            inner: Arc::new(RwLock::new(scene)),
        }
    }

    /// Shared access, as taken by the render thread or for planning.
    pub fn read(&self) -> RwLockReadGuard<'_, M> {
        self.inner.read()
    }

    /// Exclusive access for the apply phase of a cycle or batch.
    pub fn lock_for_update(&self) -> RwLockWriteGuard<'_, M> {
        log::trace!("Acquiring mirror write lock");
        self.inner.write()
    }

    /// Holds the render thread off for the duration of host teardown.
    pub fn hold(&self) -> RwLockWriteGuard<'_, M> {
        log::debug!("Holding mirror scene for teardown");
        self.inner.write()
    }
}
