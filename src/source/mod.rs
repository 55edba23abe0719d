//! Source Graph Interface
//!
//! The source graph is the host-owned, continuously mutated scene description.
//! This module defines the read-only view the core needs from it:
//!
//! - Hierarchy: roots, children and externally referenced sub-graphs
//! - Per-node queries: handle, kind, flags and transform at a time sample
//! - Evaluation of a placement's backing object (which may fail)
//! - Material and geometry resolution
//! - Render globals, camera and the texture graph feeding the change digest
//!
//! Node classification happens once per placement through [`SourceGraph::kind`],
//! which returns the closed [`NodeKind`] variant instead of letting call sites
//! probe host object types.
//!
//! [`memory::MemoryGraph`] is an in-process implementation used by tests,
//! benchmarks and hosts that stage their scene in memory.

pub mod memory;

use std::fmt::Debug;
use std::hash::Hash;

use bitflags::bitflags;
use glam::Affine3A;
use smallvec::SmallVec;

use crate::errors::Result;
use crate::identity::{GeometryId, MaterialId, StableHandle};
use crate::record::ShapeInfo;
use crate::settings::{CameraState, RenderGlobals, SampleTimes};

pub use memory::{MemoryGraph, SourceKey, SourceNode};

/// Per-slot material assignment of a placement. `None` marks an empty slot.
pub type MaterialSlots = SmallVec<[Option<MaterialId>; 4]>;

bitflags! {
    /// Host display/render flags of a node.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u32 {
        const HIDDEN      = 1 << 0;
        const FROZEN      = 1 << 1;
        const RENDERABLE  = 1 << 2;
        /// Placement is selected for motion-blur velocity sampling.
        const MOTION_BLUR = 1 << 3;
    }
}

// ============================================================================
// Node classification
// ============================================================================

/// Emitter shape of an area light. Tessellation is the renderer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaShape {
    Rectangle,
    Disc,
    Sphere,
    Cylinder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Point,
    Spot,
    Directional,
    Area(AreaShape),
}

/// Host structural and helper kinds that never produce mirror content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    Group,
    Dummy,
    Bone,
    Target,
    Camera,
}

/// Closed classification of a scene placement, computed once per traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Geometry,
    Light(LightKind),
    /// A placed environment emitter (dome light).
    Environment,
    /// Light portal: shapes sampling of the environment, emits nothing itself.
    Portal,
    Helper(HelperKind),
}

impl NodeKind {
    #[inline]
    #[must_use]
    pub fn is_helper(&self) -> bool {
        matches!(self, Self::Helper(_))
    }

    /// Returns `true` if the placement counts towards the scene's light contribution.
    #[inline]
    #[must_use]
    pub fn emits_light(&self) -> bool {
        matches!(self, Self::Light(_) | Self::Environment)
    }

    #[inline]
    #[must_use]
    pub fn has_geometry(&self) -> bool {
        matches!(self, Self::Geometry)
    }
}

// ============================================================================
// Evaluation results
// ============================================================================

/// Result of evaluating a placement's backing object at one time sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluatedObject {
    /// Logical geometry identity, used for grouping.
    pub geometry: GeometryId,
    pub shape: ShapeInfo,
    /// Transient storage address of the evaluated representation. The host may
    /// free and reuse it as soon as another placement is evaluated; it is only
    /// ever logged, never compared.
    pub address: usize,
}

/// One procedural instance produced by a scatter-capable placement.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterInstance {
    /// Instance transform relative to the scatter placement.
    pub transform: Affine3A,
    pub geometry: GeometryId,
    pub shape: ShapeInfo,
    /// Per-instance materials; `None` inherits the scatter placement's.
    pub materials: Option<MaterialSlots>,
}

/// One node of the render-global texture graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureNode {
    /// Hash of the node's own parameters, excluding its inputs.
    pub content_hash: u64,
    pub inputs: SmallVec<[StableHandle; 4]>,
}

// ============================================================================
// SourceGraph
// ============================================================================

/// Read-only view of the host scene graph.
pub trait SourceGraph {
    /// Transient reference to a host node, valid for the duration of a cycle.
    type Node: Copy + Eq + Hash + Debug;

    fn roots(&self) -> Vec<Self::Node>;

    fn children(&self, node: Self::Node) -> Vec<Self::Node>;

    /// Roots of sub-graphs externally referenced by `node`.
    fn external_roots(&self, node: Self::Node) -> Vec<Self::Node>;

    /// Finds the node currently carrying `id`, if it still exists.
    fn resolve(&self, id: StableHandle) -> Option<Self::Node>;

    fn handle(&self, node: Self::Node) -> StableHandle;

    fn kind(&self, node: Self::Node) -> NodeKind;

    fn flags(&self, node: Self::Node, t: f64) -> NodeFlags;

    fn transform(&self, node: Self::Node, t: f64) -> Affine3A;

    /// Evaluates the backing object of a geometry placement at `t`.
    fn evaluate(&self, node: Self::Node, t: f64) -> Result<EvaluatedObject>;

    fn materials(&self, node: Self::Node) -> MaterialSlots;

    /// Procedural instances of `node`, if it carries a scatter capability.
    fn scatter(&self, _node: Self::Node, _t: f64) -> Option<Vec<ScatterInstance>> {
        None
    }

    fn render_globals(&self) -> RenderGlobals;

    fn camera(&self, times: SampleTimes) -> Option<CameraState>;

    /// Texture graph roots referenced by the render globals.
    fn texture_roots(&self) -> Vec<StableHandle> {
        Vec::new()
    }

    fn texture(&self, _id: StableHandle) -> Option<TextureNode> {
        None
    }
}
