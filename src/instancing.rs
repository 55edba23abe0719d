//! Instance Grouping & Geometry Construction
//!
//! Placements that share a [`GeometryId`] are instances of one geometry. This
//! module groups records by geometry, constructs each geometry exactly once
//! from the group's primary member, and expands every member into its mirror
//! entities.
//!
//! # Entities per placement
//!
//! A geometry placement gets one entity per material slot that resolves to a
//! material. Empty slots yield nothing. A placement without any material slot
//! gets a single entity carrying the renderer's default material.
//!
//! Lights, environment emitters and portals have no geometry and always map
//! to exactly one entity.
//!
//! # Memoisation
//!
//! Construction is memoised per cycle in a [`BuildCache`]. The key covers
//! everything the builder reads from the primary record, so a hit is always
//! safe to share. The cache can also be seeded with the geometry already
//! held by the mirror; a placement added in a later cycle then becomes an
//! instance of it instead of a second construction.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::diagnostics::Diagnostics;
use crate::errors::{Result, SyncError};
use crate::identity::{GeometryId, MaterialId, StableHandle};
use crate::mirror::ops::PreparedPlacement;
use crate::mirror::{BuiltGeometry, EntityClass, EntityKind, MirrorEntity, MirrorScene};
use crate::motion::{Motion, sample_motion};
use crate::record::{NodeRecord, ShapeInfo};
use crate::settings::SyncSnapshot;
use crate::source::NodeKind;

// ============================================================================
// GeometryBuilder
// ============================================================================

/// External geometry construction.
pub trait GeometryBuilder {
    /// Constructs the geometry of `primary` with room for `slot_count`
    /// material slots.
    fn build(&mut self, primary: &NodeRecord, slot_count: usize) -> Result<BuiltGeometry>;
}

/// Builder that records the placement data without constructing renderer
/// buffers. Used when the renderer builds lazily from the entity itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorBuilder;

impl GeometryBuilder for DescriptorBuilder {
    fn build(&mut self, primary: &NodeRecord, slot_count: usize) -> Result<BuiltGeometry> {
        let geometry = primary
            .geometry
            .ok_or_else(|| SyncError::transient(primary.id, "placement has no geometry"))?;
        Ok(BuiltGeometry {
            geometry,
            primary: primary.id,
            slot_count,
            shape: primary.shape,
            mirrored: primary.is_mirrored(),
        })
    }
}

// ============================================================================
// Grouping
// ============================================================================

/// All records sharing one geometry, in traversal order.
#[derive(Debug)]
pub struct GeometryGroup<'a> {
    pub geometry: GeometryId,
    pub members: Vec<&'a NodeRecord>,
}

impl<'a> GeometryGroup<'a> {
    /// First member in traversal order; geometry is built from it.
    #[must_use]
    pub fn primary(&self) -> &'a NodeRecord {
        self.members[0]
    }

    /// Maximum slot count across members.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.members
            .iter()
            .map(|m| m.slot_count())
            .max()
            .unwrap_or(1)
    }
}

/// Groups geometry records by [`GeometryId`], preserving first-seen order.
///
/// Records without geometry are skipped.
pub fn group_by_geometry<'a>(
    records: impl IntoIterator<Item = &'a NodeRecord>,
) -> Vec<GeometryGroup<'a>> {
    let mut index: FxHashMap<GeometryId, usize> = FxHashMap::default();
    let mut groups: Vec<GeometryGroup<'a>> = Vec::new();

    for record in records {
        let Some(geometry) = record.geometry else {
            continue;
        };
        let slot = *index.entry(geometry).or_insert_with(|| {
            groups.push(GeometryGroup {
                geometry,
                members: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].members.push(record);
    }
    groups
}

// ============================================================================
// BuildCache
// ============================================================================

/// Everything construction depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub primary: StableHandle,
    pub time_bits: u64,
    pub mirrored: bool,
    pub slot_count: usize,
    pub geometry: GeometryId,
    pub bounds_bits: [u32; 6],
    pub vertex_count: u32,
    pub face_count: u32,
}

impl BuildKey {
    #[must_use]
    pub fn new(primary: &NodeRecord, geometry: GeometryId, time: f64, slot_count: usize) -> Self {
        Self {
            primary: primary.id,
            time_bits: time.to_bits(),
            mirrored: primary.is_mirrored(),
            slot_count,
            geometry,
            bounds_bits: bounds_bits(&primary.shape),
            vertex_count: primary.shape.vertex_count,
            face_count: primary.shape.face_count,
        }
    }

    /// Returns `true` if `built` can stand in for a construction under this
    /// key: same geometry, shape and handedness, and at least as many slots.
    #[must_use]
    pub fn accepts(&self, built: &BuiltGeometry) -> bool {
        built.geometry == self.geometry
            && built.mirrored == self.mirrored
            && built.slot_count >= self.slot_count
            && built.shape.vertex_count == self.vertex_count
            && built.shape.face_count == self.face_count
            && bounds_bits(&built.shape) == self.bounds_bits
    }
}

fn bounds_bits(shape: &ShapeInfo) -> [u32; 6] {
    let (min, max) = (shape.bounds_min, shape.bounds_max);
    [
        min.x.to_bits(),
        min.y.to_bits(),
        min.z.to_bits(),
        max.x.to_bits(),
        max.y.to_bits(),
        max.z.to_bits(),
    ]
}

/// Per-cycle memo of constructed geometry.
#[derive(Debug, Default)]
pub struct BuildCache {
    entries: FxHashMap<BuildKey, Arc<BuiltGeometry>>,
    /// Geometry held by entities already in the mirror, the widest per id.
    mirrored: FxHashMap<GeometryId, Arc<BuiltGeometry>>,
    hits: usize,
    misses: usize,
}

impl BuildCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all memoised geometry and resets the counters.
    pub fn begin_cycle(&mut self) {
        self.entries.clear();
        self.mirrored.clear();
        self.hits = 0;
        self.misses = 0;
    }

    /// Offers the geometry of every shape entity in `scene` for reuse, except
    /// geometry listed in `exclude`. Per geometry the one with the most slots
    /// is kept.
    pub fn seed_from_mirror<M: MirrorScene + ?Sized>(&mut self, scene: &M, exclude: &FxHashSet<GeometryId>) {
        for key in scene.entities_by_class(EntityClass::Shape) {
            let Some(built) = scene.entity(key).and_then(|e| e.geometry.as_ref()) else {
                continue;
            };
            if exclude.contains(&built.geometry) {
                continue;
            }
            match self.mirrored.get(&built.geometry) {
                Some(current) if current.slot_count >= built.slot_count => {}
                _ => {
                    self.mirrored.insert(built.geometry, Arc::clone(built));
                }
            }
        }
        log::trace!("Seeded {} mirrored geometry(s)", self.mirrored.len());
    }

    /// Returns the memoised geometry for `key`, building it on a miss.
    /// Failures are not memoised.
    pub fn get_or_build(
        &mut self,
        key: BuildKey,
        build: impl FnOnce() -> Result<BuiltGeometry>,
    ) -> Result<Arc<BuiltGeometry>> {
        if let Some(built) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(Arc::clone(built));
        }
        if let Some(built) = self.mirrored.get(&key.geometry).filter(|b| key.accepts(b)) {
            let built = Arc::clone(built);
            self.hits += 1;
            self.entries.insert(key, Arc::clone(&built));
            return Ok(built);
        }
        let built = Arc::new(build()?);
        self.misses += 1;
        self.entries.insert(key, Arc::clone(&built));
        Ok(built)
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses
    }
}

// ============================================================================
// Preparation
// ============================================================================

/// Entities ready to attach, plus what could not be built.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub placements: Vec<PreparedPlacement>,
    /// Records whose group failed to build; they are retried next cycle.
    pub failed: Vec<StableHandle>,
    pub groups: usize,
}

impl PreparedBatch {
    /// Total number of entities across all placements.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.placements.iter().map(|p| p.entities.len()).sum()
    }
}

/// Motion of a record for this cycle, if motion blur applies to it.
#[must_use]
pub fn motion_for(record: &NodeRecord, snapshot: &SyncSnapshot) -> Option<Motion> {
    if !record.motion_blur || !snapshot.motion_enabled() {
        return None;
    }
    let camera = snapshot.camera.as_ref()?;
    Some(sample_motion(
        &record.transform0,
        &record.transform1,
        camera,
        snapshot.times.spacing(),
        snapshot.settings.motion_blur.factor,
    ))
}

/// Expands one record into its entities. `geometry` must be set for
/// geometry records.
#[must_use]
pub fn placement_entities(
    record: &NodeRecord,
    geometry: Option<&Arc<BuiltGeometry>>,
    snapshot: &SyncSnapshot,
) -> Vec<MirrorEntity> {
    let motion = motion_for(record, snapshot);
    let single = |kind| {
        let mut entity = MirrorEntity::new(kind, record.transform0);
        entity.motion = motion;
        vec![entity]
    };

    match record.kind {
        NodeKind::Light(light) => single(EntityKind::Light(light)),
        NodeKind::Environment => single(EntityKind::EnvironmentLight),
        NodeKind::Portal => single(EntityKind::Portal),
        NodeKind::Helper(_) => Vec::new(),
        NodeKind::Geometry => {
            let Some(geometry) = geometry else {
                return Vec::new();
            };
            let shape_entity = |slot: usize, material: Option<MaterialId>| {
                let mut entity = MirrorEntity::new(EntityKind::Shape, record.transform0);
                entity.geometry = Some(Arc::clone(geometry));
                entity.material = material;
                entity.slot = u32::try_from(slot).unwrap_or(u32::MAX);
                entity.motion = motion;
                entity
            };

            if record.materials.is_empty() {
                return vec![shape_entity(0, None)];
            }
            record
                .materials
                .iter()
                .enumerate()
                .filter_map(|(slot, material)| material.map(|m| shape_entity(slot, Some(m))))
                .collect()
        }
    }
}

/// Builds geometry for `records` (in traversal order) and expands every
/// record into its entities. One construction per geometry group.
pub fn prepare_placements<'a, B: GeometryBuilder + ?Sized>(
    records: impl IntoIterator<Item = &'a NodeRecord>,
    snapshot: &SyncSnapshot,
    builder: &mut B,
    cache: &mut BuildCache,
    diagnostics: &mut Diagnostics,
) -> PreparedBatch {
    let records: Vec<&NodeRecord> = records.into_iter().collect();
    let groups = group_by_geometry(records.iter().copied());
    let mut batch = PreparedBatch {
        groups: groups.len(),
        ..Default::default()
    };

    let mut built: FxHashMap<GeometryId, Arc<BuiltGeometry>> = FxHashMap::default();
    for group in &groups {
        let primary = group.primary();
        let slot_count = group.slot_count();
        let key = BuildKey::new(primary, group.geometry, snapshot.times.t0, slot_count);

        match cache.get_or_build(key, || builder.build(primary, slot_count)) {
            Ok(geometry) => {
                log::trace!(
                    "Built {} from {} for {} instance(s)",
                    group.geometry,
                    primary.id,
                    group.members.len()
                );
                built.insert(group.geometry, geometry);
            }
            Err(err) => {
                diagnostics.warn_once(&format!("build:{}", group.geometry), &err.to_string());
                batch.failed.extend(group.members.iter().map(|m| m.id));
            }
        }
    }

    for record in records {
        let geometry = match record.geometry {
            Some(id) => match built.get(&id) {
                Some(geometry) => Some(geometry),
                None => continue,
            },
            None => None,
        };
        batch.placements.push(PreparedPlacement {
            id: record.id,
            entities: placement_entities(record, geometry, snapshot),
        });
    }

    log::debug!(
        "Prepared {} placement(s) from {} group(s), {} failed",
        batch.placements.len(),
        batch.groups,
        batch.failed.len()
    );
    batch
}
