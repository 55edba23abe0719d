//! Reference Ownership Table
//!
//! Tracks which external objects (geometry bases, materials) each placement
//! depends on, so a change notification on a shared object can be routed to
//! the placements that use it.
//!
//! The table is maintained by set difference: each cycle (or each push-mode
//! rebuild) supplies the complete set of watched objects per owner and the
//! table adds and removes only the difference.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::identity::{GeometryId, MaterialId, StableHandle};
use crate::record::NodeRecord;

/// An external object a placement depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Watched {
    Geometry(GeometryId),
    Material(MaterialId),
}

impl Watched {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> StableHandle {
        match self {
            Self::Geometry(g) => g.0,
            Self::Material(m) => m.0,
        }
    }
}

/// Result of a set-difference update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchDelta {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Default)]
pub struct WatchTable {
    by_owner: FxHashMap<StableHandle, FxHashSet<Watched>>,
    by_object: FxHashMap<StableHandle, (Watched, FxHashSet<StableHandle>)>,
}

impl WatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects watched on behalf of a single record.
    #[must_use]
    pub fn watched_by(record: &NodeRecord) -> SmallVec<[Watched; 4]> {
        let mut watched: SmallVec<[Watched; 4]> = SmallVec::new();
        if let Some(geometry) = record.geometry {
            watched.push(Watched::Geometry(geometry));
        }
        watched.extend(record.material_ids().map(Watched::Material));
        watched
    }

    /// Replaces the whole table with the dependencies of `records`.
    ///
    /// Records are attributed to their `origin`, so every procedural instance
    /// contributes to its scatter placement.
    pub fn update<'a>(&mut self, records: impl IntoIterator<Item = &'a NodeRecord>) -> WatchDelta {
        let mut next: FxHashMap<StableHandle, FxHashSet<Watched>> = FxHashMap::default();
        for record in records {
            next.entry(record.origin)
                .or_default()
                .extend(Self::watched_by(record));
        }

        let mut delta = WatchDelta::default();
        let stale: Vec<StableHandle> = self
            .by_owner
            .keys()
            .filter(|owner| !next.contains_key(owner))
            .copied()
            .collect();
        for owner in stale {
            delta.removed += self.remove_owner(owner);
        }
        for (owner, objects) in next {
            let d = self.set_owner(owner, objects);
            delta.added += d.added;
            delta.removed += d.removed;
        }

        if delta != WatchDelta::default() {
            log::debug!("Watch table: +{} -{}", delta.added, delta.removed);
        }
        delta
    }

    /// Replaces the watched set of one owner.
    pub fn set_owner(&mut self, owner: StableHandle, objects: FxHashSet<Watched>) -> WatchDelta {
        let previous = self.by_owner.remove(&owner).unwrap_or_default();
        let mut delta = WatchDelta::default();

        for gone in previous.difference(&objects) {
            self.unlink(owner, gone.handle());
            delta.removed += 1;
        }
        for new in objects.difference(&previous) {
            self.by_object
                .entry(new.handle())
                .or_insert_with(|| (*new, FxHashSet::default()))
                .1
                .insert(owner);
            delta.added += 1;
        }

        if !objects.is_empty() {
            self.by_owner.insert(owner, objects);
        }
        delta
    }

    /// Forgets every object watched by `owner`. Returns how many links were removed.
    pub fn remove_owner(&mut self, owner: StableHandle) -> usize {
        let Some(previous) = self.by_owner.remove(&owner) else {
            return 0;
        };
        for watched in &previous {
            self.unlink(owner, watched.handle());
        }
        previous.len()
    }

    /// What `object` is, if any placement watches it.
    #[must_use]
    pub fn lookup(&self, object: StableHandle) -> Option<Watched> {
        self.by_object.get(&object).map(|(watched, _)| *watched)
    }

    /// Placements watching `object`, in no particular order.
    #[must_use]
    pub fn owners(&self, object: StableHandle) -> Vec<StableHandle> {
        self.by_object
            .get(&object)
            .map(|(_, owners)| owners.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.by_owner.len()
    }

    fn unlink(&mut self, owner: StableHandle, object: StableHandle) {
        if let Some((_, owners)) = self.by_object.get_mut(&object) {
            owners.remove(&owner);
            if owners.is_empty() {
                self.by_object.remove(&object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NodeKind;
    use glam::Affine3A;
    use smallvec::smallvec;

    fn h(n: u128) -> StableHandle {
        StableHandle::from_u128(n)
    }

    fn record(id: u128, geometry: u128, material: u128) -> NodeRecord {
        let mut r = NodeRecord::new(h(id), NodeKind::Geometry, Affine3A::IDENTITY);
        r.geometry = Some(GeometryId(h(geometry)));
        r.materials = smallvec![Some(MaterialId(h(material)))];
        r
    }

    #[test]
    fn update_tracks_owners_by_set_difference() {
        let mut table = WatchTable::new();
        let first = [record(1, 100, 200), record(2, 100, 201)];
        let delta = table.update(&first);
        assert_eq!(delta, WatchDelta { added: 4, removed: 0 });

        let mut owners = table.owners(h(100));
        owners.sort();
        assert_eq!(owners, vec![h(1), h(2)]);
        assert_eq!(table.lookup(h(200)), Some(Watched::Material(MaterialId(h(200)))));

        // Node 2 switches material, node 1 disappears.
        let second = [record(2, 100, 200)];
        let delta = table.update(&second);
        assert_eq!(delta, WatchDelta { added: 1, removed: 3 });
        assert_eq!(table.owners(h(100)), vec![h(2)]);
        assert_eq!(table.owners(h(200)), vec![h(2)]);
        assert!(table.lookup(h(201)).is_none());
        assert_eq!(table.owner_count(), 1);
    }

    #[test]
    fn unchanged_update_is_empty() {
        let mut table = WatchTable::new();
        let records = [record(1, 100, 200)];
        table.update(&records);
        assert_eq!(table.update(&records), WatchDelta::default());
    }
}
