//! Pull-mode Reconciliation Tests
//!
//! Tests for:
//! - Digest-based cycle skipping and idempotence
//! - Diff minimality (transform-only vs. rebuild)
//! - Geometry instancing across placements and material slots
//! - Identity stability under storage address reuse
//! - Failure containment (evaluation failures, builder failures, id collisions)
//! - Render-global singletons and the default-light crossover
//! - Motion-blur velocities and scatter expansion

use std::sync::Arc;

use glam::{Affine3A, Vec3};
use parking_lot::Mutex;
use smallvec::smallvec;

use mirror_sync::diagnostics::{Diagnostics, StatusSink, SyncPhase};
use mirror_sync::errors::{Result, SyncError};
use mirror_sync::instancing::{DescriptorBuilder, GeometryBuilder};
use mirror_sync::mirror::lights::Crossover;
use mirror_sync::mirror::memory::MirrorOp;
use mirror_sync::mirror::{BuiltGeometry, EntityClass, MemoryMirror, MirrorHandle, MirrorScene, ResetKind};
use mirror_sync::pull::{Reconciler, SyncOptions};
use mirror_sync::record::{NodeRecord, ShapeInfo};
use mirror_sync::settings::{MotionBlurSettings, SyncSettings};
use mirror_sync::source::memory::EvalFailure;
use mirror_sync::source::{LightKind, MemoryGraph, NodeFlags, NodeKind, ScatterInstance, SourceNode};
use mirror_sync::{GeometryId, MaterialId, StableHandle};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn h(n: u128) -> StableHandle {
    StableHandle::from_u128(n)
}

fn geo(n: u128) -> GeometryId {
    GeometryId(h(n))
}

fn mat(n: u128) -> MaterialId {
    MaterialId(h(n))
}

fn cube() -> ShapeInfo {
    ShapeInfo::new(8, 12, Vec3::splat(-1.0), Vec3::splat(1.0))
}

fn at(x: f32) -> Affine3A {
    Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))
}

/// Builder that counts constructions and can be told to fail one geometry.
#[derive(Default)]
struct CountingBuilder {
    builds: usize,
    fail: Option<GeometryId>,
}

impl GeometryBuilder for CountingBuilder {
    fn build(&mut self, primary: &NodeRecord, slot_count: usize) -> Result<BuiltGeometry> {
        if self.fail.is_some() && primary.geometry == self.fail {
            return Err(SyncError::Build {
                geometry: primary.geometry.unwrap_or(GeometryId(primary.id)),
                reason: "builder rejected geometry".into(),
            });
        }
        self.builds += 1;
        DescriptorBuilder.build(primary, slot_count)
    }
}

/// Status sink collecting warnings.
struct Recorder(Arc<Mutex<Vec<String>>>);

impl StatusSink for Recorder {
    fn status(&mut self, _phase: SyncPhase) {}

    fn warning(&mut self, message: &str) {
        self.0.lock().push(message.to_string());
    }
}

struct Fixture {
    graph: MemoryGraph,
    mirror: MirrorHandle<MemoryMirror>,
    reconciler: Reconciler,
    builder: CountingBuilder,
}

impl Fixture {
    fn new() -> Self {
        init_logger();
        Self {
            graph: MemoryGraph::new(),
            mirror: MirrorHandle::new(MemoryMirror::new()),
            reconciler: Reconciler::new(SyncSettings::default()),
            builder: CountingBuilder::default(),
        }
    }

    fn sync(&mut self) -> Result<mirror_sync::CycleOutcome> {
        self.sync_with(SyncOptions::default())
    }

    fn sync_with(&mut self, options: SyncOptions) -> Result<mirror_sync::CycleOutcome> {
        self.reconciler
            .sync(&self.graph, &self.mirror, &mut self.builder, options)
    }

    fn forced(&mut self) -> Result<mirror_sync::CycleOutcome> {
        self.sync_with(SyncOptions {
            force: true,
            ..Default::default()
        })
    }

    fn journal(&self) -> Vec<MirrorOp> {
        self.mirror.lock_for_update().take_journal()
    }

    fn entities_of(&self, id: StableHandle) -> usize {
        self.mirror.read().entities_of(id).len()
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn unchanged_scene_skips_second_cycle() {
    let mut fx = Fixture::new();
    fx.graph
        .add_node(SourceNode::geometry("a", geo(10), cube()).with_materials(smallvec![Some(mat(1))]));
    fx.graph
        .add_node(SourceNode::new("lamp", NodeKind::Light(LightKind::Point)));

    let first = fx.sync().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.reset, Some(ResetKind::Full));
    fx.journal();

    let second = fx.sync().unwrap();
    assert!(second.skipped);
    assert_eq!(first.digest, second.digest);
    assert!(fx.journal().is_empty(), "Skipped cycle must not touch the mirror");
}

#[test]
fn forced_cycle_without_changes_mutates_nothing() {
    let mut fx = Fixture::new();
    fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.graph.add_node(SourceNode::geometry("b", geo(11), cube()));
    fx.sync().unwrap();
    fx.journal();

    let outcome = fx.forced().unwrap();
    assert!(!outcome.skipped);
    assert_eq!(outcome.reset, None);
    assert_eq!(outcome.stats.detached + outcome.stats.transformed + outcome.stats.attached, 0);
    assert!(fx.journal().is_empty());
}

#[test]
fn node_edit_requires_mark_dirty() {
    let mut fx = Fixture::new();
    let key = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.sync().unwrap();

    fx.graph.set_transform(key, at(3.0));
    assert!(fx.sync().unwrap().skipped);

    fx.reconciler.mark_dirty();
    let outcome = fx.sync().unwrap();
    assert!(!outcome.skipped);
    assert_eq!(outcome.stats.transformed, 1);

    // The dirty flag is consumed by the cycle.
    assert!(fx.sync().unwrap().skipped);
}

// ============================================================================
// Diff Minimality
// ============================================================================

#[test]
fn transform_change_only_updates_transform() {
    let mut fx = Fixture::new();
    let key = fx.graph.add_node(
        SourceNode::geometry("a", geo(10), cube()).with_materials(smallvec![Some(mat(1)), Some(mat(2))]),
    );
    fx.graph.add_node(SourceNode::geometry("b", geo(11), cube()));
    fx.sync().unwrap();
    fx.journal();

    fx.graph.set_transform(key, at(5.0));
    fx.reconciler.mark_dirty();
    let outcome = fx.sync().unwrap();

    assert_eq!(outcome.stats.transformed, 2);
    assert_eq!(outcome.stats.detached, 0);
    assert_eq!(outcome.stats.attached, 0);
    let journal = fx.journal();
    assert!(
        journal
            .iter()
            .all(|op| matches!(op, MirrorOp::Transform { .. } | MirrorOp::Invalidate(_))),
        "Unexpected ops: {journal:?}"
    );

    let handle = fx.graph.handle_of(key);
    let scene = fx.mirror.read();
    for entity in scene.entities_of(handle) {
        assert_eq!(scene.entity(entity).map(|e| e.transform), Some(at(5.0)));
    }
}

#[test]
fn material_change_detaches_then_attaches() {
    let mut fx = Fixture::new();
    let key = fx
        .graph
        .add_node(SourceNode::geometry("a", geo(10), cube()).with_materials(smallvec![Some(mat(1))]));
    fx.sync().unwrap();
    fx.journal();

    fx.graph.set_materials(key, smallvec![Some(mat(2))]);
    fx.reconciler.mark_dirty();
    fx.sync().unwrap();

    let journal = fx.journal();
    let detach = journal.iter().position(|op| matches!(op, MirrorOp::Detach { .. }));
    let attach = journal.iter().position(|op| matches!(op, MirrorOp::Attach { .. }));
    assert!(detach.is_some() && attach.is_some());
    assert!(detach < attach, "Detach must precede attach: {journal:?}");
    assert!(!journal.iter().any(|op| matches!(op, MirrorOp::Transform { .. })));

    let handle = fx.graph.handle_of(key);
    let scene = fx.mirror.read();
    let keys = scene.entities_of(handle);
    assert_eq!(keys.len(), 1);
    assert_eq!(scene.entity(keys[0]).and_then(|e| e.material), Some(mat(2)));
}

#[test]
fn material_assigned_to_empty_slots_attaches() {
    let mut fx = Fixture::new();
    let key = fx
        .graph
        .add_node(SourceNode::geometry("a", geo(10), cube()).with_materials(smallvec![None]));
    fx.sync().unwrap();
    let handle = fx.graph.handle_of(key);
    assert_eq!(fx.entities_of(handle), 0);
    assert!(fx.reconciler.state().old.contains_key(&handle));

    fx.graph.set_materials(key, smallvec![Some(mat(1))]);
    fx.reconciler.mark_dirty();
    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.detached, 0);
    assert_eq!(outcome.stats.attached, 1);
    assert_eq!(fx.entities_of(handle), 1);
}

#[test]
fn hidden_placement_is_removed() {
    let mut fx = Fixture::new();
    let key = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.sync().unwrap();
    let handle = fx.graph.handle_of(key);
    assert_eq!(fx.entities_of(handle), 1);

    fx.graph.set_hidden(key, true);
    fx.reconciler.mark_dirty();
    fx.sync().unwrap();
    assert_eq!(fx.entities_of(handle), 0);
    assert!(!fx.reconciler.state().old.contains_key(&handle));
}

#[test]
fn shading_invalidation_rebuilds_only_that_placement() {
    let mut fx = Fixture::new();
    let a = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.graph.add_node(SourceNode::geometry("b", geo(11), cube()));
    fx.sync().unwrap();

    let handle = fx.graph.handle_of(a);
    fx.reconciler.invalidate_shading(handle);
    let outcome = fx.sync().unwrap();

    assert!(!outcome.skipped, "Pending invalidation must force the cycle");
    assert_eq!(outcome.stats.detached, 1);
    assert_eq!(outcome.stats.attached, 1);
    assert_eq!(fx.entities_of(handle), 1);
}

// ============================================================================
// Instancing & Identity
// ============================================================================

#[test]
fn instances_share_one_construction() {
    let mut fx = Fixture::new();
    let slots = smallvec![Some(mat(1)), None, Some(mat(2))];
    for i in 0..5 {
        fx.graph.add_node(
            SourceNode::geometry(&format!("inst{i}"), geo(10), cube())
                .with_transform(at(i as f32))
                .with_materials(slots.clone()),
        );
    }

    let outcome = fx.sync().unwrap();
    assert_eq!(fx.builder.builds, 1);
    assert_eq!(outcome.stats.groups, 1);
    // 5 placements x 3 slots, one slot empty.
    assert_eq!(outcome.stats.attached, 10);
    assert!(outcome.stats.attached <= 15);

    let scene = fx.mirror.read();
    let shapes = scene.entities_by_class(EntityClass::Shape);
    let first = scene.entity(shapes[0]).and_then(|e| e.geometry.clone()).unwrap();
    for key in &shapes {
        let geometry = scene.entity(*key).and_then(|e| e.geometry.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &geometry));
    }
}

#[test]
fn later_instance_reuses_mirrored_geometry() {
    let mut fx = Fixture::new();
    let a = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.sync().unwrap();

    let b = fx
        .graph
        .add_node(SourceNode::geometry("b", geo(10), cube()).with_transform(at(2.0)));
    fx.reconciler.mark_dirty();
    let outcome = fx.sync().unwrap();
    assert_eq!(fx.builder.builds, 1);
    assert_eq!(outcome.stats.builds, 0);
    assert_eq!(outcome.stats.cache_hits, 1);

    let scene = fx.mirror.read();
    let geometry_of = |key| {
        let entity = scene.entities_of(fx.graph.handle_of(key))[0];
        scene.entity(entity).and_then(|e| e.geometry.clone()).unwrap()
    };
    assert!(Arc::ptr_eq(&geometry_of(a), &geometry_of(b)));
}

#[test]
fn reused_storage_address_does_not_instance() {
    let mut fx = Fixture::new();
    let a = fx
        .graph
        .add_node(SourceNode::geometry("a", geo(10), cube()).with_address(0xdead_0000));
    let b = fx
        .graph
        .add_node(SourceNode::geometry("b", geo(11), cube()).with_address(0xdead_0000));

    let outcome = fx.sync().unwrap();
    assert_eq!(fx.builder.builds, 2);
    assert_eq!(outcome.stats.groups, 2);

    let ha = fx.graph.handle_of(a);
    let hb = fx.graph.handle_of(b);
    assert_ne!(ha, hb);
    assert_eq!(fx.entities_of(ha), 1);
    assert_eq!(fx.entities_of(hb), 1);
}

#[test]
fn scatter_instances_are_stable_across_cycles() {
    let mut fx = Fixture::new();
    let instances = (0..3)
        .map(|i| ScatterInstance {
            transform: at(i as f32),
            geometry: geo(20),
            shape: cube(),
            materials: None,
        })
        .collect();
    let parent = fx
        .graph
        .add_node(SourceNode::geometry("scatter", geo(10), cube()).with_scatter(instances));
    let handle = fx.graph.handle_of(parent);

    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.records, 3);
    assert_eq!(fx.builder.builds, 1);
    assert_eq!(fx.entities_of(handle), 0, "Scatter parent has no entity of its own");
    for i in 0..3 {
        assert_eq!(fx.entities_of(handle.scatter_instance(i)), 1);
    }
    assert_eq!(fx.reconciler.watch().owners(h(20)), vec![handle]);
    fx.journal();

    fx.forced().unwrap();
    assert!(fx.journal().is_empty());
}

// ============================================================================
// Failure Containment
// ============================================================================

#[test]
fn id_collision_aborts_before_mutation() {
    let mut fx = Fixture::new();
    fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()).with_handle(h(1)));
    fx.graph.add_node(SourceNode::geometry("b", geo(11), cube()).with_handle(h(1)));

    let err = fx.sync().unwrap_err();
    assert_eq!(err, SyncError::IdCollision { id: h(1) });
    assert!(err.is_fatal_for_cycle());
    assert!(fx.mirror.read().is_empty());
    assert!(fx.journal().is_empty());
    assert!(fx.reconciler.state().old.is_empty());
    assert_eq!(fx.builder.builds, 0);
}

#[test]
fn evaluation_failure_drops_only_that_placement() {
    let mut fx = Fixture::new();
    fx.graph.add_node(
        SourceNode::geometry("broken", geo(10), cube())
            .with_failure(EvalFailure::Transient("modifier stack failed".into())),
    );
    let ok = fx.graph.add_node(SourceNode::geometry("ok", geo(11), cube()));

    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.dropped, 1);
    assert_eq!(outcome.stats.records, 1);
    assert_eq!(fx.entities_of(fx.graph.handle_of(ok)), 1);
}

#[test]
fn unsupported_configuration_warns_once_per_session() {
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let diagnostics = Diagnostics::new(Box::new(Recorder(warnings.clone())));
    let mut fx = Fixture::new();
    fx.reconciler = Reconciler::with_diagnostics(SyncSettings::default(), diagnostics);

    for i in 0..3 {
        fx.graph.add_node(
            SourceNode::geometry(&format!("hair{i}"), geo(10 + i), cube())
                .with_failure(EvalFailure::Unsupported("hair primitives".into())),
        );
    }
    fx.sync().unwrap();
    fx.forced().unwrap();

    assert_eq!(warnings.lock().len(), 1);
    assert_eq!(fx.reconciler.diagnostics().reported_causes(), 1);
}

#[test]
fn failed_build_is_retried_next_cycle() {
    let mut fx = Fixture::new();
    let key = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.graph.add_node(SourceNode::geometry("b", geo(11), cube()));
    let handle = fx.graph.handle_of(key);

    fx.builder.fail = Some(geo(10));
    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.failed_builds, 1);
    assert_eq!(fx.entities_of(handle), 0);
    assert!(!fx.reconciler.state().old.contains_key(&handle));

    fx.builder.fail = None;
    fx.reconciler.mark_dirty();
    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.attached, 1);
    assert_eq!(fx.entities_of(handle), 1);
}

#[test]
fn cyclic_external_references_terminate() {
    let mut fx = Fixture::new();
    let a = fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    let b = fx.graph.add_detached(SourceNode::geometry("b", geo(11), cube()));
    fx.graph.add_external(a, b);
    fx.graph.add_external(b, a);

    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.stats.visited, 2);
    assert_eq!(outcome.stats.records, 2);
}

// ============================================================================
// Render Globals & Default Lights
// ============================================================================

#[test]
fn default_lights_cross_over_once_each_way() {
    let mut fx = Fixture::new();
    fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));

    let outcome = fx.sync().unwrap();
    assert_eq!(outcome.crossover, Some(Crossover::Created));
    assert_eq!(fx.mirror.read().entities_by_class(EntityClass::DefaultLight).len(), 2);

    let lamp = fx
        .graph
        .add_node(SourceNode::new("lamp", NodeKind::Light(LightKind::Point)));
    fx.reconciler.mark_dirty();
    assert_eq!(fx.sync().unwrap().crossover, Some(Crossover::Removed));

    fx.reconciler.mark_dirty();
    assert_eq!(fx.sync().unwrap().crossover, None);
    assert!(fx.mirror.read().entities_by_class(EntityClass::DefaultLight).is_empty());

    fx.graph.remove_node(lamp);
    fx.reconciler.mark_dirty();
    assert_eq!(fx.sync().unwrap().crossover, Some(Crossover::Created));
}

#[test]
fn globals_change_is_detected_by_digest() {
    let mut fx = Fixture::new();
    fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    let first = fx.sync().unwrap();

    fx.graph.globals.ground.enabled = true;
    fx.graph.globals.alpha = true;
    let second = fx.sync().unwrap();

    assert!(!second.skipped);
    assert_ne!(first.digest, second.digest);
    let scene = fx.mirror.read();
    assert_eq!(scene.entities_by_class(EntityClass::Ground).len(), 1);
    assert!(scene.alpha());
    assert_eq!(scene.digest(), Some(second.digest));
}

#[test]
fn camera_move_only_restarts_interactively() {
    let mut fx = Fixture::new();
    fx.graph.add_node(SourceNode::geometry("a", geo(10), cube()));
    fx.graph.set_camera(Affine3A::from_translation(Vec3::Z * 5.0));
    fx.sync().unwrap();
    fx.journal();

    fx.graph.set_camera(Affine3A::from_translation(Vec3::Z * 6.0));
    let outcome = fx.sync().unwrap();
    assert!(outcome.skipped);
    assert_eq!(outcome.reset, Some(ResetKind::Interactive));
    assert_eq!(fx.journal(), vec![MirrorOp::Invalidate(ResetKind::Interactive)]);
}

// ============================================================================
// Motion Blur
// ============================================================================

#[test]
fn flagged_placement_receives_velocity() {
    let mut fx = Fixture::new();
    fx.reconciler = Reconciler::new(SyncSettings {
        motion_blur: MotionBlurSettings {
            enabled: true,
            factor: 1.0,
            shutter: 0.5,
        },
        ..Default::default()
    });
    fx.graph.set_camera(Affine3A::IDENTITY);
    let moving = fx.graph.add_node(
        SourceNode::geometry("moving", geo(10), cube())
            .with_flags(NodeFlags::RENDERABLE | NodeFlags::MOTION_BLUR),
    );
    fx.graph.set_transform_key(moving, 0.5, at(1.0));
    let still = fx.graph.add_node(SourceNode::geometry("still", geo(11), cube()));

    fx.sync_with(SyncOptions {
        time: 0.0,
        frame_duration: 1.0,
        force: false,
    })
    .unwrap();

    let scene = fx.mirror.read();
    let key = scene.entities_of(fx.graph.handle_of(moving))[0];
    let motion = scene.entity(key).and_then(|e| e.motion).unwrap();
    assert!((motion.linear - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-4);
    assert!(!motion.axis.is_nan());

    let key = scene.entities_of(fx.graph.handle_of(still))[0];
    assert!(scene.entity(key).and_then(|e| e.motion).is_none());
}

#[test]
fn camera_move_refreshes_velocity() {
    let mut fx = Fixture::new();
    fx.reconciler = Reconciler::new(SyncSettings {
        motion_blur: MotionBlurSettings {
            enabled: true,
            factor: 1.0,
            shutter: 0.5,
        },
        ..Default::default()
    });
    fx.graph.set_camera(Affine3A::IDENTITY);
    let moving = fx.graph.add_node(
        SourceNode::geometry("moving", geo(10), cube())
            .with_flags(NodeFlags::RENDERABLE | NodeFlags::MOTION_BLUR),
    );
    fx.graph.set_transform_key(moving, 0.5, at(1.0));
    let options = SyncOptions {
        time: 0.0,
        frame_duration: 1.0,
        force: false,
    };
    fx.sync_with(options).unwrap();

    // The camera now follows the placement, so it no longer moves relative to it.
    fx.graph.camera_keys = vec![(0.0, Affine3A::IDENTITY), (0.5, at(1.0))];
    let outcome = fx.sync_with(options).unwrap();
    assert!(!outcome.skipped, "Camera move under motion blur must not skip");
    assert_eq!(outcome.stats.transformed, 1);

    let scene = fx.mirror.read();
    let key = scene.entities_of(fx.graph.handle_of(moving))[0];
    let motion = scene.entity(key).and_then(|e| e.motion).unwrap();
    assert!(motion.linear.length() < 1e-4, "stale velocity {:?}", motion.linear);
}
