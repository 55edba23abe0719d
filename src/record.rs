//! Placement Records
//!
//! A [`NodeRecord`] is the flattened, per-placement view of the source graph
//! produced by traversal (pull mode) or on first notification (push mode).
//! Records are plain data: they are rebuilt every cycle and compared against
//! the previous cycle's records to decide what the mirror scene must do.

use glam::{Affine3A, Vec3};
use rustc_hash::FxHashMap;

use crate::identity::{GeometryId, MaterialId, StableHandle};
use crate::source::{MaterialSlots, NodeKind};

/// Map of records keyed by their stable id.
pub type RecordMap = FxHashMap<StableHandle, NodeRecord>;

/// Size and extent of an evaluated geometry, part of its construction key.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShapeInfo {
    pub vertex_count: u32,
    pub face_count: u32,
    /// Deformed bounds in object space.
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl ShapeInfo {
    #[must_use]
    pub fn new(vertex_count: u32, face_count: u32, bounds_min: Vec3, bounds_max: Vec3) -> Self {
        Self {
            vertex_count,
            face_count,
            bounds_min,
            bounds_max,
        }
    }
}

/// One scene placement.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: StableHandle,
    /// Placement that produced this record. Differs from `id` only for
    /// procedural scatter instances.
    pub origin: StableHandle,
    pub kind: NodeKind,
    /// World transform at the first time sample.
    pub transform0: Affine3A,
    /// World transform at the second time sample.
    pub transform1: Affine3A,
    pub materials: MaterialSlots,
    /// `None` for placements without geometry (lights, portals, environment).
    pub geometry: Option<GeometryId>,
    pub shape: ShapeInfo,
    pub motion_blur: bool,
    /// Last time shading of this placement was invalidated. Carried forward
    /// between cycles because traversal cannot recompute it.
    pub invalidation_timestamp: u64,
}

impl NodeRecord {
    /// Creates a record with no geometry, no materials and a static transform.
    #[must_use]
    pub fn new(id: StableHandle, kind: NodeKind, transform: Affine3A) -> Self {
        Self {
            id,
            origin: id,
            kind,
            transform0: transform,
            transform1: transform,
            materials: MaterialSlots::new(),
            geometry: None,
            shape: ShapeInfo::default(),
            motion_blur: false,
            invalidation_timestamp: 0,
        }
    }

    /// Number of material slots, at least one for geometry placements.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.materials.len().max(1)
    }

    /// Material resolved for `slot`, if any.
    #[inline]
    #[must_use]
    pub fn material(&self, slot: usize) -> Option<MaterialId> {
        self.materials.get(slot).copied().flatten()
    }

    /// Returns `true` if the placement transform flips handedness.
    #[inline]
    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        self.transform0.matrix3.determinant() < 0.0
    }

    /// Returns `true` if the entities of `previous` cannot be patched in place
    /// to represent `self`.
    #[must_use]
    pub fn needs_rebuild(&self, previous: &NodeRecord) -> bool {
        self.kind != previous.kind
            || self.materials != previous.materials
            || self.geometry != previous.geometry
            || self.shape != previous.shape
            || self.is_mirrored() != previous.is_mirrored()
            || self.invalidation_timestamp != previous.invalidation_timestamp
    }

    #[inline]
    #[must_use]
    pub fn transform_changed(&self, previous: &NodeRecord) -> bool {
        self.transform0 != previous.transform0 || self.transform1 != previous.transform1
    }

    /// Iterates over the distinct materials referenced by this record.
    pub fn material_ids(&self) -> impl Iterator<Item = MaterialId> + '_ {
        self.materials
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.filter(|mat| !self.materials[..i].contains(&Some(*mat))))
    }
}
