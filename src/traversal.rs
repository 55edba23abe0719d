//! Node Traversal
//!
//! Flattens the source graph into an ordered sequence of [`NodeRecord`]s.
//!
//! # Walk
//!
//! The walk is depth-first pre-order over an explicit frontier stack. Children
//! are visited before the externally referenced sub-graphs of the same node.
//! Every node reference is recorded in a visited set before expansion, so a
//! cyclic chain of external references terminates instead of recursing.
//!
//! # Exclusions
//!
//! A node produces no records (its children are still walked) when it is
//! hidden, not renderable, frozen while `skip_frozen` is set, a helper kind, or
//! placed with a zero-determinant transform.
//!
//! # Failures
//!
//! Evaluation failures are contained to the placement: the placement is
//! dropped for this cycle and the walk continues. Only a stable id collision
//! aborts the walk, since the diff cannot be computed on ambiguous ids.

use glam::Affine3A;
use rustc_hash::FxHashSet;

use crate::diagnostics::Diagnostics;
use crate::errors::{Result, SyncError};
use crate::record::NodeRecord;
use crate::settings::SyncSnapshot;
use crate::source::{NodeFlags, NodeKind, SourceGraph};

/// Records and side results of one traversal.
#[derive(Debug, Default)]
pub struct TraversalOutput {
    /// Placement records in traversal order.
    pub records: Vec<NodeRecord>,
    /// Placements dropped for this cycle, with the reason.
    pub dropped: Vec<SyncError>,
    /// Number of distinct nodes visited.
    pub visited: usize,
}

/// Returns `true` if the transform collapses space onto a plane or line.
#[inline]
#[must_use]
pub fn is_degenerate(transform: &Affine3A) -> bool {
    transform.matrix3.determinant().abs() < f32::MIN_POSITIVE
}

/// Walks the whole graph.
///
/// Fails only with [`SyncError::IdCollision`].
pub fn traverse<G: SourceGraph + ?Sized>(
    graph: &G,
    snapshot: &SyncSnapshot,
    diagnostics: &mut Diagnostics,
) -> Result<TraversalOutput> {
    let mut output = TraversalOutput::default();
    let mut visited: FxHashSet<G::Node> = FxHashSet::default();
    let mut ids = FxHashSet::default();

    let mut frontier: Vec<G::Node> = graph.roots();
    frontier.reverse();

    while let Some(node) = frontier.pop() {
        if !visited.insert(node) {
            log::trace!("Node {node:?} already visited, skipping");
            continue;
        }

        if snapshot.settings.follow_external_refs {
            frontier.extend(graph.external_roots(node).into_iter().rev());
        }
        frontier.extend(graph.children(node).into_iter().rev());

        match collect_placement(graph, node, snapshot) {
            Ok(records) => {
                for record in records {
                    if !ids.insert(record.id) {
                        log::error!("Stable id {} is claimed by more than one placement", record.id);
                        return Err(SyncError::IdCollision { id: record.id });
                    }
                    output.records.push(record);
                }
            }
            Err(err) => {
                report_dropped(&err, diagnostics);
                output.dropped.push(err);
            }
        }
    }

    output.visited = visited.len();
    log::debug!(
        "Traversal visited {} nodes, produced {} records, dropped {}",
        output.visited,
        output.records.len(),
        output.dropped.len()
    );
    Ok(output)
}

/// Logs a dropped placement; unsupported configurations warn once per cause.
pub fn report_dropped(err: &SyncError, diagnostics: &mut Diagnostics) {
    match err {
        SyncError::UnsupportedConfiguration { cause, .. } => {
            diagnostics.warn_once(cause, &err.to_string());
        }
        _ => log::debug!("Dropping placement for this cycle: {err}"),
    }
}

/// Returns the kind of `node` if it should produce records at `snapshot`'s time.
pub fn classify<G: SourceGraph + ?Sized>(
    graph: &G,
    node: G::Node,
    snapshot: &SyncSnapshot,
) -> Option<NodeKind> {
    let kind = graph.kind(node);
    if kind.is_helper() {
        return None;
    }

    let flags = graph.flags(node, snapshot.times.t0);
    if flags.contains(NodeFlags::HIDDEN) || !flags.contains(NodeFlags::RENDERABLE) {
        return None;
    }
    if snapshot.settings.skip_frozen && flags.contains(NodeFlags::FROZEN) {
        return None;
    }

    Some(kind)
}

/// Builds the records of a single placement (several for scatter placements).
///
/// Excluded nodes yield an empty list. Evaluation failures are returned to
/// the caller, which decides how to contain them.
pub fn collect_placement<G: SourceGraph + ?Sized>(
    graph: &G,
    node: G::Node,
    snapshot: &SyncSnapshot,
) -> Result<Vec<NodeRecord>> {
    let Some(kind) = classify(graph, node, snapshot) else {
        return Ok(Vec::new());
    };

    let times = snapshot.times;
    let handle = graph.handle(node);
    let transform0 = graph.transform(node, times.t0);
    if is_degenerate(&transform0) {
        log::trace!("Skipping {handle}: degenerate transform");
        return Ok(Vec::new());
    }

    let mut base = NodeRecord::new(handle, kind, transform0);
    base.transform1 = if times.t1 == times.t0 {
        transform0
    } else {
        graph.transform(node, times.t1)
    };
    base.motion_blur = graph
        .flags(node, times.t0)
        .contains(NodeFlags::MOTION_BLUR);

    if !kind.has_geometry() {
        return Ok(vec![base]);
    }

    let object = graph.evaluate(node, times.t0)?;
    log::trace!(
        "Evaluated {handle} as {} (transient at {:#x})",
        object.geometry,
        object.address
    );
    base.materials = graph.materials(node);

    let Some(instances) = graph.scatter(node, times.t0) else {
        base.geometry = Some(object.geometry);
        base.shape = object.shape;
        return Ok(vec![base]);
    };

    let instances1 = if times.t1 == times.t0 {
        None
    } else {
        graph.scatter(node, times.t1)
    };

    let mut records = Vec::with_capacity(instances.len());
    for (index, instance) in instances.iter().enumerate() {
        let transform0 = base.transform0 * instance.transform;
        if is_degenerate(&transform0) {
            continue;
        }
        let relative1 = instances1
            .as_ref()
            .and_then(|later| later.get(index))
            .map_or(instance.transform, |later| later.transform);

        records.push(NodeRecord {
            id: handle.scatter_instance(index as u32),
            origin: handle,
            kind,
            transform0,
            transform1: base.transform1 * relative1,
            materials: instance
                .materials
                .clone()
                .unwrap_or_else(|| base.materials.clone()),
            geometry: Some(instance.geometry),
            shape: instance.shape,
            motion_blur: base.motion_blur,
            invalidation_timestamp: 0,
        });
    }
    Ok(records)
}
