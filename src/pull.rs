//! Pull-mode Reconciliation
//!
//! One-shot resynchronisation: every cycle walks the whole source graph,
//! compares the resulting records against the previous cycle's and applies
//! the minimal set of mirror mutations.
//!
//! # Cycle
//!
//! 1. Compute the [`ChangeDigest`]; skip the cycle when it matches the stored
//!    digest and nothing forces a resync
//! 2. Traverse into the new record map, carrying invalidation timestamps forward
//! 3. [`diff`] the old and new maps against the mirror's owner tags
//! 4. Build geometry for additions without holding the render lock
//! 5. Under the write lock: detach, update transforms, attach, update the
//!    singletons, evaluate the default-light crossover, store the digest
//! 6. Swap the maps and refresh the ownership table
//!
//! An id collision aborts at step 2, before anything is mutated.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::diagnostics::{Diagnostics, SyncPhase};
use crate::digest::{ChangeDigest, TextureHasher, compute_digest};
use crate::errors::Result;
use crate::identity::{GeometryId, StableHandle};
use crate::instancing::{BuildCache, GeometryBuilder, motion_for, prepare_placements};
use crate::mirror::lights::{self, Crossover};
use crate::mirror::{MirrorHandle, MirrorScene, ResetKind, ops};
use crate::record::{NodeRecord, RecordMap};
use crate::settings::{CameraState, SyncSettings, SyncSnapshot};
use crate::source::SourceGraph;
use crate::traversal::traverse;
use crate::watch::WatchTable;

// ============================================================================
// State
// ============================================================================

/// Records of the previous and current cycle.
#[derive(Debug, Default)]
pub struct SyncState {
    pub old: RecordMap,
    pub new: RecordMap,
    /// Shader invalidations registered since the last cycle, by placement.
    pub pending_invalidation: FxHashMap<StableHandle, u64>,
}

impl SyncState {
    /// Promotes the current map to the previous one.
    fn swap(&mut self) {
        self.old = std::mem::take(&mut self.new);
        self.pending_invalidation.clear();
    }
}

/// Per-cycle inputs.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Scene time of the first sample, in seconds.
    pub time: f64,
    /// Duration of one frame, in seconds. Scales the motion-blur shutter.
    pub frame_duration: f64,
    /// Run the full cycle even if the digest is unchanged.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            time: 0.0,
            frame_duration: 1.0 / 30.0,
            force: false,
        }
    }
}

/// Counters of one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub visited: usize,
    pub records: usize,
    pub dropped: usize,
    pub detached: usize,
    pub transformed: usize,
    pub attached: usize,
    pub groups: usize,
    pub builds: usize,
    pub cache_hits: usize,
    pub failed_builds: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleOutcome {
    /// The digest matched and nothing forced the cycle.
    pub skipped: bool,
    pub digest: ChangeDigest,
    pub stats: CycleStats,
    pub reset: Option<ResetKind>,
    pub crossover: Option<Crossover>,
}

// ============================================================================
// Diff
// ============================================================================

/// Mutations required to move the mirror from `old` to `new`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffPlan {
    /// Owners whose entities are detached.
    pub detach: Vec<StableHandle>,
    /// Owners whose entities are moved in place.
    pub transform: Vec<StableHandle>,
    /// Ids added (new or rebuilt), in traversal order.
    pub add: Vec<StableHandle>,
}

impl DiffPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detach.is_empty() && self.transform.is_empty() && self.add.is_empty()
    }
}

/// Computes the mutations between two record maps.
///
/// `order` lists the ids of `new` in traversal order; `tagged` lists every
/// owner id currently present in the mirror.
///
/// A known id that owns no entity (all of its slots were empty) has nothing
/// to detach, but is re-added once it needs a rebuild.
#[must_use]
pub fn diff(old: &RecordMap, new: &RecordMap, order: &[StableHandle], tagged: &[StableHandle]) -> DiffPlan {
    let mut plan = DiffPlan::default();
    let mut rebuild: FxHashSet<StableHandle> = FxHashSet::default();

    for &id in tagged {
        match (old.get(&id), new.get(&id)) {
            (Some(previous), Some(current)) => {
                if current.needs_rebuild(previous) {
                    plan.detach.push(id);
                    rebuild.insert(id);
                } else if current.transform_changed(previous) {
                    plan.transform.push(id);
                }
            }
            _ => plan.detach.push(id),
        }
    }

    let tagged: FxHashSet<StableHandle> = tagged.iter().copied().collect();
    for id in order.iter().filter(|id| !tagged.contains(*id)) {
        if let (Some(previous), Some(current)) = (old.get(id), new.get(id))
            && current.needs_rebuild(previous)
        {
            rebuild.insert(*id);
        }
    }

    plan.add = order
        .iter()
        .filter(|id| !old.contains_key(*id) || rebuild.contains(*id))
        .copied()
        .collect();
    plan
}

// ============================================================================
// Reconciler
// ============================================================================

/// Pull-mode driver. Owns the per-session state between cycles.
#[derive(Debug)]
pub struct Reconciler {
    settings: SyncSettings,
    state: SyncState,
    watch: WatchTable,
    textures: TextureHasher,
    builds: BuildCache,
    diagnostics: Diagnostics,
    cycle: u64,
    shading_clock: u64,
    dirty: bool,
    camera: Option<CameraState>,
}

impl Reconciler {
    #[must_use]
    pub fn new(settings: SyncSettings) -> Self {
        Self::with_diagnostics(settings, Diagnostics::default())
    }

    #[must_use]
    pub fn with_diagnostics(settings: SyncSettings, diagnostics: Diagnostics) -> Self {
        Self {
            settings,
            state: SyncState::default(),
            watch: WatchTable::new(),
            textures: TextureHasher::new(),
            builds: BuildCache::new(),
            diagnostics,
            cycle: 0,
            shading_clock: 0,
            dirty: false,
            camera: None,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Replaces the settings; takes effect on the next cycle.
    pub fn set_settings(&mut self, settings: SyncSettings) {
        self.settings = settings;
    }

    #[must_use]
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    #[must_use]
    pub fn watch(&self) -> &WatchTable {
        &self.watch
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Number of cycles run so far, skipped ones included.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Forces the next cycle. Hosts call this on node-level edits, which the
    /// digest does not cover.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Registers a shading change of `id`; its entities are rebuilt next cycle.
    pub fn invalidate_shading(&mut self, id: StableHandle) {
        self.shading_clock += 1;
        self.state.pending_invalidation.insert(id, self.shading_clock);
    }

    /// Hands the session state over to a push-mode driver.
    #[must_use]
    pub fn into_parts(self) -> (SyncSettings, RecordMap, WatchTable, Diagnostics) {
        (self.settings, self.state.old, self.watch, self.diagnostics)
    }

    /// Runs one pull cycle.
    ///
    /// # Errors
    /// Returns [`SyncError::IdCollision`](crate::errors::SyncError::IdCollision)
    /// if two placements claim the same id. Neither the mirror nor the session
    /// state are touched in that case.
    pub fn sync<G, M, B>(
        &mut self,
        graph: &G,
        mirror: &MirrorHandle<M>,
        builder: &mut B,
        options: SyncOptions,
    ) -> Result<CycleOutcome>
    where
        G: SourceGraph + ?Sized,
        M: MirrorScene,
        B: GeometryBuilder + ?Sized,
    {
        self.cycle += 1;
        let snapshot = SyncSnapshot::capture(graph, &self.settings, options.time, options.frame_duration);

        self.diagnostics.phase(SyncPhase::Digest);
        self.textures.begin_cycle(self.cycle);
        let digest = compute_digest(graph, &snapshot, &mut self.textures);

        let camera_changed = snapshot.camera != self.camera;
        // Velocities are camera-relative, so a camera move under motion blur
        // cannot take the skip path.
        let forced = options.force
            || self.dirty
            || !self.state.pending_invalidation.is_empty()
            || (camera_changed && snapshot.motion_enabled());
        let stored = mirror.read().digest();

        if stored == Some(digest) && !forced {
            log::debug!("Cycle {}: digest {digest} unchanged, skipping", self.cycle);
            let reset = camera_changed.then_some(ResetKind::Interactive);
            if let Some(reset) = reset {
                mirror.lock_for_update().invalidate(reset);
                self.camera = snapshot.camera;
            }
            self.diagnostics.phase(SyncPhase::Idle);
            return Ok(CycleOutcome {
                skipped: true,
                digest,
                stats: CycleStats::default(),
                reset,
                crossover: None,
            });
        }

        self.diagnostics.phase(SyncPhase::Traversal);
        let output = traverse(graph, &snapshot, &mut self.diagnostics)?;

        let mut stats = CycleStats {
            visited: output.visited,
            records: output.records.len(),
            dropped: output.dropped.len(),
            ..Default::default()
        };

        let order: Vec<StableHandle> = output.records.iter().map(|r| r.id).collect();
        let mut new = RecordMap::default();
        for mut record in output.records {
            record.invalidation_timestamp = self.carried_timestamp(&record);
            new.insert(record.id, record);
        }

        let tagged = mirror.read().owners();
        let mut plan = diff(&self.state.old, &new, &order, &tagged);
        if camera_changed && snapshot.motion_enabled() {
            self.refresh_motion(&mut plan, &new);
        }

        self.diagnostics.phase(SyncPhase::Building);
        self.builds.begin_cycle();
        let replaced: FxHashSet<GeometryId> = plan
            .detach
            .iter()
            .filter_map(|id| self.state.old.get(id).and_then(|r| r.geometry))
            .collect();
        self.builds.seed_from_mirror(&*mirror.read(), &replaced);
        let additions: Vec<&NodeRecord> = plan.add.iter().filter_map(|id| new.get(id)).collect();
        let prepared = prepare_placements(
            additions,
            &snapshot,
            builder,
            &mut self.builds,
            &mut self.diagnostics,
        );
        stats.groups = prepared.groups;
        stats.builds = self.builds.misses();
        stats.cache_hits = self.builds.hits();
        stats.failed_builds = prepared.failed.len();

        self.diagnostics.phase(SyncPhase::Applying);
        let crossover;
        let content_changed;
        {
            let mut scene = mirror.lock_for_update();

            for &id in &plan.detach {
                stats.detached += ops::detach_owner(&mut *scene, id);
            }
            for &id in &plan.transform {
                if let Some(record) = new.get(&id) {
                    let motion = motion_for(record, &snapshot);
                    stats.transformed += ops::update_owner_transform(&mut *scene, id, record.transform0, motion);
                }
            }
            for placement in prepared.placements {
                stats.attached += ops::attach_placement(&mut *scene, placement);
            }

            let globals = &snapshot.globals;
            let mut singletons = lights::sync_environment(&mut *scene, &globals.environment);
            singletons |= lights::sync_ground(&mut *scene, &globals.ground);
            if scene.tonemap() != globals.tonemap {
                scene.set_tonemap(globals.tonemap);
                singletons = true;
            }
            if scene.alpha() != globals.alpha {
                scene.set_alpha(globals.alpha);
                singletons = true;
            }
            crossover = lights::apply_default_light_crossover(&mut *scene, globals.default_lights);

            content_changed = singletons
                || crossover.is_some()
                || stats.detached > 0
                || stats.transformed > 0
                || stats.attached > 0;

            scene.set_digest(digest);
            if content_changed {
                scene.invalidate(ResetKind::Full);
            } else if camera_changed {
                scene.invalidate(ResetKind::Interactive);
            }
        }

        for id in &prepared.failed {
            new.remove(id);
        }
        self.state.new = new;
        self.state.swap();
        self.watch.update(self.state.old.values());
        self.dirty = false;
        self.camera = snapshot.camera;
        self.diagnostics.phase(SyncPhase::Idle);

        let reset = if content_changed {
            Some(ResetKind::Full)
        } else {
            camera_changed.then_some(ResetKind::Interactive)
        };
        log::info!(
            "Cycle {}: {} records, -{} ~{} +{} entities",
            self.cycle,
            stats.records,
            stats.detached,
            stats.transformed,
            stats.attached
        );

        Ok(CycleOutcome {
            skipped: false,
            digest,
            stats,
            reset,
            crossover,
        })
    }

    /// Invalidation timestamp for `record`: a pending invalidation of its
    /// placement wins over the one carried from the previous cycle.
    fn carried_timestamp(&self, record: &NodeRecord) -> u64 {
        self.state
            .pending_invalidation
            .get(&record.origin)
            .copied()
            .or_else(|| self.state.old.get(&record.id).map(|r| r.invalidation_timestamp))
            .unwrap_or(0)
    }

    /// Motion vectors depend on the camera, so a camera move refreshes every
    /// motion-blurred placement that is not rebuilt anyway.
    fn refresh_motion(&self, plan: &mut DiffPlan, new: &RecordMap) {
        let scheduled: FxHashSet<StableHandle> =
            plan.transform.iter().chain(&plan.add).copied().collect();
        let extra: Vec<StableHandle> = new
            .values()
            .filter(|r| r.motion_blur && self.state.old.contains_key(&r.id) && !scheduled.contains(&r.id))
            .map(|r| r.id)
            .collect();
        plan.transform.extend(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{GeometryId, MaterialId};
    use crate::source::NodeKind;
    use glam::{Affine3A, Vec3};
    use smallvec::smallvec;

    fn h(n: u128) -> StableHandle {
        StableHandle::from_u128(n)
    }

    fn map(records: &[NodeRecord]) -> (RecordMap, Vec<StableHandle>) {
        let order = records.iter().map(|r| r.id).collect();
        let by_id = records.iter().map(|r| (r.id, r.clone())).collect();
        (by_id, order)
    }

    fn shape(id: u128) -> NodeRecord {
        let mut record = NodeRecord::new(h(id), NodeKind::Geometry, Affine3A::IDENTITY);
        record.geometry = Some(GeometryId(h(100)));
        record.materials = smallvec![Some(MaterialId(h(200)))];
        record
    }

    #[test]
    fn diff_classifies_each_owner() {
        let (old, _) = map(&[shape(1), shape(2), shape(3)]);

        let mut moved = shape(2);
        moved.transform0 = Affine3A::from_translation(Vec3::X);
        moved.transform1 = moved.transform0;
        let mut recoloured = shape(3);
        recoloured.materials = smallvec![Some(MaterialId(h(201)))];
        let (new, order) = map(&[moved, recoloured, shape(4)]);

        let plan = diff(&old, &new, &order, &[h(1), h(2), h(3)]);
        assert_eq!(plan.detach, vec![h(1), h(3)]);
        assert_eq!(plan.transform, vec![h(2)]);
        assert_eq!(plan.add, vec![h(3), h(4)]);
    }

    #[test]
    fn unchanged_maps_give_empty_plan() {
        let (old, order) = map(&[shape(1), shape(2)]);
        let plan = diff(&old, &old, &order, &[h(1), h(2)]);
        assert!(plan.is_empty());
    }

    #[test]
    fn untagged_known_id_is_not_re_added() {
        // A placement whose build failed never entered the old map.
        let (old, _) = map(&[shape(1)]);
        let (new, order) = map(&[shape(1), shape(2)]);
        let plan = diff(&old, &new, &order, &[h(1)]);
        assert_eq!(plan.add, vec![h(2)]);
    }

    #[test]
    fn entityless_owner_is_re_added_on_rebuild() {
        let mut empty = shape(1);
        empty.materials = smallvec![None];
        let (old, _) = map(&[empty.clone(), shape(2)]);
        let (unchanged, order) = map(&[empty, shape(2)]);
        assert!(diff(&old, &unchanged, &order, &[h(2)]).is_empty());

        let (new, order) = map(&[shape(1), shape(2)]);
        let plan = diff(&old, &new, &order, &[h(2)]);
        assert!(plan.detach.is_empty());
        assert_eq!(plan.add, vec![h(1)]);
    }
}
