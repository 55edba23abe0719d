//! Push-mode Synchronisation
//!
//! Continuous low-latency updates while the source graph is edited. Host
//! notifications are translated into coalesced [`Command`]s and applied in
//! batches on a timer tick.
//!
//! # Batches
//!
//! A batch drains the whole queue. Everything that needs the source graph
//! (records, geometry, transforms, material lists, globals) is prepared first,
//! without the write lock. The commands are then applied in category order
//! inside one write-lock critical section, followed by exactly one evaluation
//! of the default-light crossover.
//!
//! A rebuild that fails for one placement skips that placement and keeps its
//! current entities; the rest of the batch is applied.
//!
//! # Notifications
//!
//! Hosts deliver notifications either directly through [`PushSync::notify`]
//! or from any thread through a [`flume::Sender`] obtained from
//! [`PushSync::sender`]; the channel is drained at the start of every tick.

pub mod commands;
pub mod notification;
pub mod scheduler;

use std::time::Instant;

use flume::{Receiver, Sender};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::diagnostics::{Diagnostics, SyncPhase};
use crate::errors::SyncError;
use crate::identity::{GeometryId, StableHandle};
use crate::instancing::{BuildCache, GeometryBuilder, motion_for, placement_entities, prepare_placements};
use crate::mirror::lights::{self, Crossover};
use crate::mirror::ops::{self, PreparedPlacement};
use crate::mirror::{MirrorHandle, MirrorScene, ResetKind};
use crate::motion::Motion;
use crate::pull::{Reconciler, SyncOptions};
use crate::record::NodeRecord;
use crate::settings::{EnvironmentSettings, GroundSettings, RenderGlobals, SyncSettings, SyncSnapshot, TonemapSettings};
use crate::source::SourceGraph;
use crate::traversal::{collect_placement, is_degenerate, report_dropped};
use crate::watch::WatchTable;

pub use commands::{Category, Command, CommandQueue, PendingOps};
pub use notification::{ChangePart, Notification};
pub use scheduler::TickScheduler;

use notification::{globals_commands, reference_commands};

/// Counters of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub commands: usize,
    pub rebuilt: usize,
    pub removed: usize,
    /// Placements skipped because their rebuild failed.
    pub skipped: usize,
    pub detached: usize,
    pub transformed: usize,
    pub attached: usize,
    pub singletons: usize,
}

impl BatchStats {
    /// Number of mirror mutations performed.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.detached + self.transformed + self.attached + self.singletons
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Commands applied, in application order.
    pub commands: Vec<Command>,
    pub stats: BatchStats,
    pub crossover: Option<Crossover>,
    pub reset: Option<ResetKind>,
}

/// Fully prepared work for one command.
enum Step {
    /// Rebuild placeholder, resolved once all rebuilds of the batch are built.
    Pending(StableHandle),
    Replace {
        origin: StableHandle,
        records: Vec<NodeRecord>,
        placements: Vec<PreparedPlacement>,
    },
    Transform {
        record: NodeRecord,
        motion: Option<Motion>,
    },
    Remove(StableHandle),
    Environment {
        active: bool,
    },
    Tonemap(Option<TonemapSettings>),
    Alpha(bool),
    Skip,
}

enum Refresh {
    Ready(Step),
    Unchanged,
    Rebuild,
}

/// Push-mode driver.
#[derive(Debug)]
pub struct PushSync {
    settings: SyncSettings,
    queue: CommandQueue,
    scheduler: TickScheduler,
    /// Records of every mirrored placement, keyed by the placement that
    /// produced them.
    placements: FxHashMap<StableHandle, Vec<NodeRecord>>,
    watch: WatchTable,
    globals: RenderGlobals,
    diagnostics: Diagnostics,
    builds: BuildCache,
    sender: Sender<Notification>,
    receiver: Receiver<Notification>,
    shading_clock: u64,
    batches: u64,
}

impl PushSync {
    #[must_use]
    pub fn new(settings: SyncSettings) -> Self {
        Self::with_diagnostics(settings, Diagnostics::default())
    }

    #[must_use]
    pub fn with_diagnostics(settings: SyncSettings, diagnostics: Diagnostics) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            scheduler: TickScheduler::new(settings.tick_interval(), settings.rebuild_debounce()),
            settings,
            queue: CommandQueue::new(),
            placements: FxHashMap::default(),
            watch: WatchTable::new(),
            globals: RenderGlobals::default(),
            diagnostics,
            builds: BuildCache::new(),
            sender,
            receiver,
            shading_clock: 0,
            batches: 0,
        }
    }

    /// Continues a session started in pull mode, typically after the initial
    /// full synchronisation.
    #[must_use]
    pub fn adopt<G: SourceGraph + ?Sized>(reconciler: Reconciler, graph: &G) -> Self {
        let (settings, records, watch, diagnostics) = reconciler.into_parts();
        let mut push = Self::with_diagnostics(settings, diagnostics);

        for record in records.into_values() {
            push.shading_clock = push.shading_clock.max(record.invalidation_timestamp);
            push.placements.entry(record.origin).or_default().push(record);
        }
        push.watch = watch;
        push.globals = graph.render_globals();
        log::debug!("Push mode adopted {} placement(s)", push.placements.len());
        push
    }

    /// Cloneable sender for notifications from other threads.
    #[must_use]
    pub fn sender(&self) -> Sender<Notification> {
        self.sender.clone()
    }

    #[must_use]
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    #[must_use]
    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn watch(&self) -> &WatchTable {
        &self.watch
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Records currently mirrored for `origin`.
    #[must_use]
    pub fn placement(&self, origin: StableHandle) -> Option<&[NodeRecord]> {
        self.placements.get(&origin).map(Vec::as_slice)
    }

    #[must_use]
    pub fn placement_count(&self) -> usize {
        self.placements.len()
    }

    /// Number of batches applied so far.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Translates a host notification into queued commands.
    pub fn notify(&mut self, notification: Notification, now: Instant) {
        log::trace!("Notification {notification:?}");
        match notification {
            Notification::NodeAdded(id) => self.enqueue(Command::Rebuild(id), now),
            Notification::NodePreDeleted(id) => self.enqueue(Command::Delete(id), now),
            Notification::NodeHidden(id) => self.enqueue(Command::Hide(id), now),
            Notification::NodeUnhidden(id) => self.enqueue(Command::Show(id), now),
            Notification::FileSaveBegin => self.scheduler.suspend(),
            Notification::FileSaveEnd => self.scheduler.resume(now),
            Notification::ReferenceChanged { target, part } => {
                let is_placement = self.placements.contains_key(&target);
                for command in reference_commands(target, part, is_placement, &self.watch) {
                    self.enqueue(command, now);
                }
            }
            Notification::RenderGlobalsChanged(globals) => {
                for command in globals_commands(&self.globals, &globals) {
                    self.enqueue(command, now);
                }
                self.globals = globals;
            }
        }
    }

    /// Queues a command directly.
    pub fn enqueue(&mut self, command: Command, now: Instant) {
        if self.queue.push(command) {
            self.scheduler.kick(now);
            if command.category() == Category::Rebuild {
                self.scheduler.extend(now);
            }
        }
    }

    /// Runs a batch if the tick is due (or `options.force` is set and batches
    /// are not suspended) and work is pending.
    pub fn tick<G, M, B>(
        &mut self,
        now: Instant,
        graph: &G,
        mirror: &MirrorHandle<M>,
        builder: &mut B,
        options: SyncOptions,
    ) -> Option<BatchOutcome>
    where
        G: SourceGraph + ?Sized,
        M: MirrorScene,
        B: GeometryBuilder + ?Sized,
    {
        while let Ok(notification) = self.receiver.try_recv() {
            self.notify(notification, now);
        }

        let due = self.scheduler.poll(now);
        let flush = options.force && !self.scheduler.is_suspended();
        if !(due || flush) || self.queue.is_empty() {
            return None;
        }
        Some(self.run_batch(graph, mirror, builder, options))
    }

    fn run_batch<G, M, B>(
        &mut self,
        graph: &G,
        mirror: &MirrorHandle<M>,
        builder: &mut B,
        options: SyncOptions,
    ) -> BatchOutcome
    where
        G: SourceGraph + ?Sized,
        M: MirrorScene,
        B: GeometryBuilder + ?Sized,
    {
        self.batches += 1;
        let commands = self.queue.drain();
        let snapshot = SyncSnapshot::capture(graph, &self.settings, options.time, options.frame_duration);
        let mut stats = BatchStats {
            commands: commands.len(),
            ..Default::default()
        };

        // Prepare
        self.diagnostics.phase(SyncPhase::Building);
        let mut steps = self.plan_steps(&commands, graph, mirror, &snapshot);
        self.resolve_rebuilds(&mut steps, graph, mirror, builder, &snapshot, &mut stats);

        // Apply
        self.diagnostics.phase(SyncPhase::Applying);
        let mut touched = FxHashSet::default();
        let crossover;
        {
            let mut scene = mirror.lock_for_update();
            for step in steps {
                self.apply_step(&mut *scene, step, &snapshot, &mut stats, &mut touched);
            }
            crossover = lights::apply_default_light_crossover(&mut *scene, snapshot.globals.default_lights);
            if stats.mutations() > 0 || crossover.is_some() {
                scene.invalidate(ResetKind::Full);
            }
        }

        for origin in touched {
            match self.placements.get(&origin) {
                Some(records) => {
                    let watched = records.iter().flat_map(WatchTable::watched_by).collect();
                    self.watch.set_owner(origin, watched);
                }
                None => {
                    self.watch.remove_owner(origin);
                }
            }
        }
        self.diagnostics.phase(SyncPhase::Idle);

        let reset = (stats.mutations() > 0 || crossover.is_some()).then_some(ResetKind::Full);
        log::info!(
            "Batch {}: {} command(s), -{} ~{} +{} entities",
            self.batches,
            stats.commands,
            stats.detached,
            stats.transformed,
            stats.attached
        );
        BatchOutcome {
            commands,
            stats,
            crossover,
            reset,
        }
    }

    /// Turns every command into a prepared step. Rebuilds become
    /// [`Step::Pending`] placeholders.
    fn plan_steps<G, M>(
        &mut self,
        commands: &[Command],
        graph: &G,
        mirror: &MirrorHandle<M>,
        snapshot: &SyncSnapshot,
    ) -> Vec<Step>
    where
        G: SourceGraph + ?Sized,
        M: MirrorScene,
    {
        let mut steps = Vec::with_capacity(commands.len());
        let mut scheduled: FxHashSet<StableHandle> = FxHashSet::default();
        let mut rebuild = |id: StableHandle, steps: &mut Vec<Step>| {
            if scheduled.insert(id) {
                steps.push(Step::Pending(id));
            }
        };

        let scene = mirror.read();
        for command in commands {
            match *command {
                Command::Rebuild(id) | Command::Show(id) => rebuild(id, &mut steps),
                Command::AssignMaterial(id) => match self.refresh_materials(graph, id, snapshot, &*scene, false) {
                    Refresh::Ready(step) => steps.push(step),
                    Refresh::Unchanged => {}
                    Refresh::Rebuild => rebuild(id, &mut steps),
                },
                Command::Transform(id) => match self.prepare_transform(graph, id, snapshot) {
                    Some(step) => steps.push(step),
                    None => rebuild(id, &mut steps),
                },
                Command::Hide(id) | Command::Delete(id) => steps.push(Step::Remove(id)),
                Command::MaterialRebuild(material) => {
                    for owner in self.watch.owners(material.0) {
                        match self.refresh_materials(graph, owner, snapshot, &*scene, true) {
                            Refresh::Ready(step) => steps.push(step),
                            Refresh::Unchanged => {}
                            Refresh::Rebuild => rebuild(owner, &mut steps),
                        }
                    }
                }
                Command::EnvStart | Command::EnvModify => steps.push(Step::Environment { active: true }),
                Command::EnvStop => steps.push(Step::Environment { active: false }),
                Command::TonemapStart | Command::TonemapModify => {
                    steps.push(Step::Tonemap(snapshot.globals.tonemap));
                }
                Command::TonemapStop => steps.push(Step::Tonemap(None)),
                Command::AlphaEnable => steps.push(Step::Alpha(true)),
                Command::AlphaDisable => steps.push(Step::Alpha(false)),
            }
        }
        steps
    }

    /// Collects and builds every pending rebuild in one pass, so instances
    /// added in the same batch share their geometry. Geometry already in the
    /// mirror is reused unless one of the rebuilt placements owned it.
    fn resolve_rebuilds<G, M, B>(
        &mut self,
        steps: &mut [Step],
        graph: &G,
        mirror: &MirrorHandle<M>,
        builder: &mut B,
        snapshot: &SyncSnapshot,
        stats: &mut BatchStats,
    ) where
        G: SourceGraph + ?Sized,
        M: MirrorScene,
        B: GeometryBuilder + ?Sized,
    {
        let mut collected: FxHashMap<StableHandle, Vec<NodeRecord>> = FxHashMap::default();
        let mut order = Vec::new();
        for step in steps.iter() {
            if let Step::Pending(origin) = step
                && let Some(records) = self.collect(graph, *origin, snapshot)
            {
                order.push(*origin);
                collected.insert(*origin, records);
            }
        }

        self.builds.begin_cycle();
        let replaced: FxHashSet<GeometryId> = steps
            .iter()
            .filter_map(|step| match step {
                Step::Pending(origin) => self.placements.get(origin),
                _ => None,
            })
            .flatten()
            .filter_map(|r| r.geometry)
            .collect();
        self.builds.seed_from_mirror(&*mirror.read(), &replaced);
        let records = order.iter().filter_map(|o| collected.get(o)).flatten();
        let prepared = prepare_placements(records, snapshot, builder, &mut self.builds, &mut self.diagnostics);
        let failed: FxHashSet<StableHandle> = prepared.failed.iter().copied().collect();
        let mut built: FxHashMap<StableHandle, PreparedPlacement> =
            prepared.placements.into_iter().map(|p| (p.id, p)).collect();

        for step in steps.iter_mut() {
            let Step::Pending(origin) = *step else {
                continue;
            };
            *step = match collected.remove(&origin) {
                None => Step::Skip,
                Some(records) if records.iter().any(|r| failed.contains(&r.id)) => {
                    stats.skipped += 1;
                    Step::Skip
                }
                Some(records) => {
                    let placements = records.iter().filter_map(|r| built.remove(&r.id)).collect();
                    Step::Replace {
                        origin,
                        records,
                        placements,
                    }
                }
            };
        }
    }

    /// Fresh records of one placement, or `None` if it must be skipped.
    fn collect<G: SourceGraph + ?Sized>(
        &mut self,
        graph: &G,
        origin: StableHandle,
        snapshot: &SyncSnapshot,
    ) -> Option<Vec<NodeRecord>> {
        let Some(node) = graph.resolve(origin) else {
            log::debug!("{}", SyncError::StaleReference { id: origin });
            return None;
        };
        match collect_placement(graph, node, snapshot) {
            Ok(mut records) => {
                if let Some(previous) = self.placements.get(&origin) {
                    for record in &mut records {
                        if let Some(old) = previous.iter().find(|p| p.id == record.id) {
                            record.invalidation_timestamp = old.invalidation_timestamp;
                        }
                    }
                }
                Some(records)
            }
            Err(err) => {
                report_dropped(&err, &mut self.diagnostics);
                None
            }
        }
    }

    /// The single non-scatter record mirrored for `origin`, if any.
    fn simple_record(&self, origin: StableHandle) -> Option<&NodeRecord> {
        match self.placements.get(&origin)?.as_slice() {
            [record] if record.id == origin => Some(record),
            _ => None,
        }
    }

    /// New transform of a mirrored placement. `None` means the placement must
    /// be rebuilt instead (unknown, scatter, parity flip or degenerate).
    fn prepare_transform<G: SourceGraph + ?Sized>(
        &self,
        graph: &G,
        origin: StableHandle,
        snapshot: &SyncSnapshot,
    ) -> Option<Step> {
        let previous = self.simple_record(origin)?;
        let node = graph.resolve(origin)?;
        let times = snapshot.times;

        let mut record = previous.clone();
        record.transform0 = graph.transform(node, times.t0);
        record.transform1 = if times.t1 == times.t0 {
            record.transform0
        } else {
            graph.transform(node, times.t1)
        };
        if is_degenerate(&record.transform0) || record.is_mirrored() != previous.is_mirrored() {
            return None;
        }
        let motion = motion_for(&record, snapshot);
        Some(Step::Transform { record, motion })
    }

    /// New entities of a placement whose materials changed, reusing its
    /// built geometry when it has enough slots.
    fn refresh_materials<G, M>(
        &mut self,
        graph: &G,
        origin: StableHandle,
        snapshot: &SyncSnapshot,
        scene: &M,
        invalidate: bool,
    ) -> Refresh
    where
        G: SourceGraph + ?Sized,
        M: MirrorScene + ?Sized,
    {
        let Some(previous) = self.simple_record(origin) else {
            return Refresh::Rebuild;
        };
        let Some(node) = graph.resolve(origin) else {
            log::debug!("{}", SyncError::StaleReference { id: origin });
            return Refresh::Unchanged;
        };

        let materials = graph.materials(node);
        if !invalidate && materials == previous.materials {
            return Refresh::Unchanged;
        }
        let mut record = previous.clone();
        record.materials = materials;
        if invalidate {
            self.shading_clock += 1;
            record.invalidation_timestamp = self.shading_clock;
        }

        let geometry = scene
            .entities_of(origin)
            .into_iter()
            .find_map(|key| scene.entity(key).and_then(|e| e.geometry.clone()));
        let entities = match (record.geometry, geometry) {
            (None, _) => placement_entities(&record, None, snapshot),
            (Some(_), Some(built)) if built.slot_count >= record.slot_count() => {
                placement_entities(&record, Some(&built), snapshot)
            }
            _ => return Refresh::Rebuild,
        };

        Refresh::Ready(Step::Replace {
            origin,
            records: vec![record],
            placements: vec![PreparedPlacement { id: origin, entities }],
        })
    }

    fn apply_step<M: MirrorScene + ?Sized>(
        &mut self,
        scene: &mut M,
        step: Step,
        snapshot: &SyncSnapshot,
        stats: &mut BatchStats,
        touched: &mut FxHashSet<StableHandle>,
    ) {
        match step {
            Step::Pending(_) | Step::Skip => {}
            Step::Replace {
                origin,
                records,
                placements,
            } => {
                stats.detached += self.detach_placement(scene, origin);
                for placement in placements {
                    stats.attached += ops::attach_placement(scene, placement);
                }
                if !records.is_empty() {
                    self.placements.insert(origin, records);
                }
                stats.rebuilt += 1;
                touched.insert(origin);
            }
            Step::Transform { record, motion } => {
                stats.transformed += ops::update_owner_transform(scene, record.id, record.transform0, motion);
                self.placements.insert(record.origin, vec![record]);
            }
            Step::Remove(origin) => {
                stats.detached += self.detach_placement(scene, origin);
                stats.removed += 1;
                touched.insert(origin);
            }
            Step::Environment { active } => {
                let (environment, ground) = if active {
                    (snapshot.globals.environment, snapshot.globals.ground)
                } else {
                    (EnvironmentSettings::default(), GroundSettings::default())
                };
                let mut changed = lights::sync_environment(scene, &environment);
                changed |= lights::sync_ground(scene, &ground);
                stats.singletons += usize::from(changed);
            }
            Step::Tonemap(tonemap) => {
                if scene.tonemap() != tonemap {
                    scene.set_tonemap(tonemap);
                    stats.singletons += 1;
                }
            }
            Step::Alpha(enabled) => {
                if scene.alpha() != enabled {
                    scene.set_alpha(enabled);
                    stats.singletons += 1;
                }
            }
        }
    }

    /// Detaches every entity of `origin` and forgets its records.
    fn detach_placement<M: MirrorScene + ?Sized>(&mut self, scene: &mut M, origin: StableHandle) -> usize {
        let mut detached = 0;
        if let Some(records) = self.placements.remove(&origin) {
            for record in records.iter().filter(|r| r.id != origin) {
                detached += ops::detach_owner(scene, record.id);
            }
        }
        detached + ops::detach_owner(scene, origin)
    }
}

