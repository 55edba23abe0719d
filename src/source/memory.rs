//! In-memory Source Graph
//!
//! A self-contained [`SourceGraph`] implementation that stores nodes in a
//! `SlotMap`. Hosts that stage their scene in memory can use it directly; the
//! test-suite and benchmarks use it to script edits between cycles.
//!
//! Transforms are stored as step keyframes: the transform at `t` is the last
//! key at or before `t` (or the first key when `t` precedes all keys).

use glam::Affine3A;
use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use crate::errors::{Result, SyncError};
use crate::identity::{GeometryId, StableHandle};
use crate::record::ShapeInfo;
use crate::settings::{CameraState, RenderGlobals, SampleTimes};
use crate::source::{
    EvaluatedObject, HelperKind, MaterialSlots, NodeFlags, NodeKind, ScatterInstance, SourceGraph, TextureNode,
};

new_key_type! {
    pub struct SourceKey;
}

/// Handle reported for keys whose node was removed.
const REMOVED: StableHandle = StableHandle::from_u128(0);

/// Scripted evaluation failure of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalFailure {
    Transient(String),
    Unsupported(String),
}

/// Backing object of a geometry node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceObject {
    pub geometry: GeometryId,
    pub shape: ShapeInfo,
    /// Storage address reported on evaluation.
    pub address: usize,
}

#[derive(Debug, Clone)]
pub struct SourceNode {
    pub handle: StableHandle,
    pub name: String,
    pub kind: NodeKind,
    pub flags: NodeFlags,
    /// Step keyframes `(time, world transform)`, sorted by time.
    pub keys: Vec<(f64, Affine3A)>,
    pub object: Option<SourceObject>,
    pub materials: MaterialSlots,
    pub scatter: Vec<ScatterInstance>,
    pub failure: Option<EvalFailure>,

    parent: Option<SourceKey>,
    children: Vec<SourceKey>,
    external: Vec<SourceKey>,
}

impl SourceNode {
    /// Creates a renderable node of `kind` at the identity transform.
    #[must_use]
    pub fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            handle: StableHandle::new_random(),
            name: name.to_string(),
            kind,
            flags: NodeFlags::RENDERABLE,
            keys: vec![(0.0, Affine3A::IDENTITY)],
            object: None,
            materials: MaterialSlots::new(),
            scatter: Vec::new(),
            failure: None,
            parent: None,
            children: Vec::new(),
            external: Vec::new(),
        }
    }

    /// Creates a geometry placement of `geometry`.
    #[must_use]
    pub fn geometry(name: &str, geometry: GeometryId, shape: ShapeInfo) -> Self {
        let mut node = Self::new(name, NodeKind::Geometry);
        node.object = Some(SourceObject {
            geometry,
            shape,
            address: 0,
        });
        node
    }

    #[must_use]
    pub fn with_handle(mut self, handle: StableHandle) -> Self {
        self.handle = handle;
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Affine3A) -> Self {
        self.keys = vec![(0.0, transform)];
        self
    }

    #[must_use]
    pub fn with_materials(mut self, materials: MaterialSlots) -> Self {
        self.materials = materials;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: usize) -> Self {
        if let Some(object) = &mut self.object {
            object.address = address;
        }
        self
    }

    #[must_use]
    pub fn with_scatter(mut self, instances: Vec<ScatterInstance>) -> Self {
        self.scatter = instances;
        self
    }

    #[must_use]
    pub fn with_failure(mut self, failure: EvalFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    fn transform_at(&self, t: f64) -> Affine3A {
        self.keys
            .iter()
            .take_while(|(time, _)| *time <= t)
            .last()
            .or_else(|| self.keys.first())
            .map_or(Affine3A::IDENTITY, |(_, transform)| *transform)
    }
}

/// In-memory scene graph.
pub struct MemoryGraph {
    nodes: SlotMap<SourceKey, SourceNode>,
    roots: Vec<SourceKey>,
    by_handle: FxHashMap<StableHandle, SourceKey>,

    pub globals: RenderGlobals,
    /// Camera world transform keyframes, same semantics as node keys.
    pub camera_keys: Vec<(f64, Affine3A)>,
    pub camera_fov_y: f32,
    pub textures: FxHashMap<StableHandle, TextureNode>,
    pub texture_roots: Vec<StableHandle>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            roots: Vec::new(),
            by_handle: FxHashMap::default(),
            globals: RenderGlobals::default(),
            camera_keys: Vec::new(),
            camera_fov_y: 45f32.to_radians(),
            textures: FxHashMap::default(),
            texture_roots: Vec::new(),
        }
    }

    /// Adds a node at the root level.
    pub fn add_node(&mut self, node: SourceNode) -> SourceKey {
        let handle = node.handle;
        let key = self.nodes.insert(node);
        self.by_handle.insert(handle, key);
        self.roots.push(key);
        key
    }

    /// Adds a node as the last child of `parent`.
    pub fn add_child(&mut self, parent: SourceKey, mut node: SourceNode) -> SourceKey {
        node.parent = Some(parent);
        let handle = node.handle;
        let key = self.nodes.insert(node);
        self.by_handle.insert(handle, key);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(key);
        }
        key
    }

    /// Adds a node that is reachable only as an external reference.
    pub fn add_detached(&mut self, node: SourceNode) -> SourceKey {
        let handle = node.handle;
        let key = self.nodes.insert(node);
        self.by_handle.insert(handle, key);
        key
    }

    /// Makes `target` an externally referenced sub-graph root of `owner`.
    pub fn add_external(&mut self, owner: SourceKey, target: SourceKey) {
        if let Some(node) = self.nodes.get_mut(owner) {
            node.external.push(target);
        }
    }

    /// Removes a node and its subtree.
    pub fn remove_node(&mut self, key: SourceKey) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        let children = node.children.clone();
        let parent = node.parent;

        for child in children {
            self.remove_node(child);
        }

        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|&c| c != key);
            }
        } else {
            self.roots.retain(|&r| r != key);
        }

        if let Some(node) = self.nodes.remove(key) {
            self.by_handle.remove(&node.handle);
        }
    }

    #[must_use]
    pub fn node(&self, key: SourceKey) -> Option<&SourceNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: SourceKey) -> Option<&mut SourceNode> {
        self.nodes.get_mut(key)
    }

    /// Returns the stable handle of `key`.
    ///
    /// # Panics
    /// Panics if the node was removed.
    #[must_use]
    pub fn handle_of(&self, key: SourceKey) -> StableHandle {
        self.nodes[key].handle
    }

    /// Replaces all transform keys of a node with a single static transform.
    pub fn set_transform(&mut self, key: SourceKey, transform: Affine3A) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.keys = vec![(0.0, transform)];
        }
    }

    /// Inserts or replaces the transform key at `t`.
    pub fn set_transform_key(&mut self, key: SourceKey, t: f64, transform: Affine3A) {
        if let Some(node) = self.nodes.get_mut(key) {
            match node.keys.iter().position(|(time, _)| *time >= t) {
                Some(i) if node.keys[i].0 == t => node.keys[i].1 = transform,
                Some(i) => node.keys.insert(i, (t, transform)),
                None => node.keys.push((t, transform)),
            }
        }
    }

    pub fn set_materials(&mut self, key: SourceKey, materials: MaterialSlots) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.materials = materials;
        }
    }

    pub fn set_hidden(&mut self, key: SourceKey, hidden: bool) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.flags.set(NodeFlags::HIDDEN, hidden);
        }
    }

    /// Places a static camera.
    pub fn set_camera(&mut self, world: Affine3A) {
        self.camera_keys = vec![(0.0, world)];
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn camera_at(&self, t: f64) -> Option<Affine3A> {
        self.camera_keys
            .iter()
            .take_while(|(time, _)| *time <= t)
            .last()
            .or_else(|| self.camera_keys.first())
            .map(|(_, transform)| *transform)
    }
}

impl SourceGraph for MemoryGraph {
    type Node = SourceKey;

    fn roots(&self) -> Vec<SourceKey> {
        self.roots.clone()
    }

    fn children(&self, node: SourceKey) -> Vec<SourceKey> {
        self.nodes
            .get(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn external_roots(&self, node: SourceKey) -> Vec<SourceKey> {
        self.nodes
            .get(node)
            .map(|n| n.external.clone())
            .unwrap_or_default()
    }

    fn resolve(&self, id: StableHandle) -> Option<SourceKey> {
        self.by_handle.get(&id).copied()
    }

    fn handle(&self, node: SourceKey) -> StableHandle {
        self.nodes.get(node).map_or(REMOVED, |n| n.handle)
    }

    fn kind(&self, node: SourceKey) -> NodeKind {
        self.nodes
            .get(node)
            .map_or(NodeKind::Helper(HelperKind::Group), |n| n.kind)
    }

    fn flags(&self, node: SourceKey, _t: f64) -> NodeFlags {
        self.nodes.get(node).map_or(NodeFlags::HIDDEN, |n| n.flags)
    }

    fn transform(&self, node: SourceKey, t: f64) -> Affine3A {
        self.nodes
            .get(node)
            .map_or(Affine3A::IDENTITY, |n| n.transform_at(t))
    }

    fn evaluate(&self, node: SourceKey, _t: f64) -> Result<EvaluatedObject> {
        let source = self
            .nodes
            .get(node)
            .ok_or_else(|| SyncError::transient(REMOVED, "node no longer exists"))?;
        match &source.failure {
            Some(EvalFailure::Transient(reason)) => {
                return Err(SyncError::transient(source.handle, reason.clone()));
            }
            Some(EvalFailure::Unsupported(cause)) => {
                return Err(SyncError::unsupported(source.handle, cause.clone()));
            }
            None => {}
        }

        let object = source
            .object
            .ok_or_else(|| SyncError::transient(source.handle, "node has no backing object"))?;

        Ok(EvaluatedObject {
            geometry: object.geometry,
            shape: object.shape,
            address: object.address,
        })
    }

    fn materials(&self, node: SourceKey) -> MaterialSlots {
        self.nodes
            .get(node)
            .map(|n| n.materials.clone())
            .unwrap_or_default()
    }

    fn scatter(&self, node: SourceKey, _t: f64) -> Option<Vec<ScatterInstance>> {
        let source = self.nodes.get(node)?;
        if source.scatter.is_empty() {
            None
        } else {
            Some(source.scatter.clone())
        }
    }

    fn render_globals(&self) -> RenderGlobals {
        self.globals
    }

    fn camera(&self, times: SampleTimes) -> Option<CameraState> {
        Some(CameraState {
            world0: self.camera_at(times.t0)?,
            world1: self.camera_at(times.t1)?,
            fov_y: self.camera_fov_y,
        })
    }

    fn texture_roots(&self) -> Vec<StableHandle> {
        self.texture_roots.clone()
    }

    fn texture(&self, id: StableHandle) -> Option<TextureNode> {
        self.textures.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn step_keys_pick_last_key_at_or_before_t() {
        let mut graph = MemoryGraph::new();
        let key = graph.add_node(SourceNode::new("n", NodeKind::Geometry));
        let a = Affine3A::from_translation(Vec3::X);
        let b = Affine3A::from_translation(Vec3::Y);
        graph.set_transform_key(key, 0.0, a);
        graph.set_transform_key(key, 1.0, b);

        assert_eq!(graph.transform(key, 0.5), a);
        assert_eq!(graph.transform(key, 1.0), b);
        assert_eq!(graph.transform(key, 7.0), b);
        assert_eq!(graph.transform(key, -1.0), a);
    }

    #[test]
    fn remove_node_drops_subtree_and_handles() {
        let mut graph = MemoryGraph::new();
        let parent = graph.add_node(SourceNode::new("p", NodeKind::Geometry));
        let child = graph.add_child(parent, SourceNode::new("c", NodeKind::Geometry));
        let child_handle = graph.handle_of(child);

        graph.remove_node(parent);

        assert!(graph.is_empty());
        assert!(graph.roots().is_empty());
        assert!(graph.resolve(child_handle).is_none());
    }

    #[test]
    fn removed_key_reads_as_hidden_group() {
        let mut graph = MemoryGraph::new();
        let key = graph.add_node(
            SourceNode::geometry("n", GeometryId(StableHandle::from_u128(10)), ShapeInfo::default())
                .with_transform(Affine3A::from_translation(Vec3::X)),
        );
        graph.remove_node(key);

        assert_eq!(graph.kind(key), NodeKind::Helper(HelperKind::Group));
        assert!(graph.flags(key, 0.0).contains(NodeFlags::HIDDEN));
        assert_eq!(graph.transform(key, 0.0), Affine3A::IDENTITY);
        assert!(graph.materials(key).is_empty());
        assert!(graph.scatter(key, 0.0).is_none());
        assert!(graph.children(key).is_empty());
        assert!(graph.evaluate(key, 0.0).is_err());
    }
}
