//! In-memory Mirror Scene
//!
//! Stores entities in a `SlotMap` with an owner index, and journals every
//! mutation so integrations can forward them to a renderer (or tests can
//! assert on them).

use glam::Affine3A;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::digest::ChangeDigest;
use crate::identity::StableHandle;
use crate::mirror::{EntityClass, EntityKey, EntityKind, MirrorEntity, MirrorScene, ResetKind};
use crate::motion::Motion;
use crate::settings::TonemapSettings;

/// One journaled mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOp {
    Attach {
        owner: Option<StableHandle>,
        kind: EntityKind,
    },
    Detach {
        owner: Option<StableHandle>,
        kind: EntityKind,
    },
    Transform {
        owner: Option<StableHandle>,
    },
    Tag {
        owner: StableHandle,
    },
    Tonemap,
    Alpha,
    Invalidate(ResetKind),
}

impl MirrorOp {
    /// Returns `true` for operations that change scene content.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Tag { .. } | Self::Invalidate(_))
    }
}

#[derive(Debug, Default)]
pub struct MemoryMirror {
    entities: SlotMap<EntityKey, MirrorEntity>,
    by_owner: FxHashMap<StableHandle, SmallVec<[EntityKey; 4]>>,
    digest: Option<ChangeDigest>,
    tonemap: Option<TonemapSettings>,
    alpha: bool,
    journal: Vec<MirrorOp>,
}

impl MemoryMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &MirrorEntity)> {
        self.entities.iter()
    }

    /// Journaled operations since the last call.
    pub fn take_journal(&mut self) -> Vec<MirrorOp> {
        std::mem::take(&mut self.journal)
    }

    #[must_use]
    pub fn journal(&self) -> &[MirrorOp] {
        &self.journal
    }

    /// Number of content mutations in the journal.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.journal.iter().filter(|op| op.is_mutation()).count()
    }

    fn index(&mut self, owner: StableHandle, key: EntityKey) {
        let keys = self.by_owner.entry(owner).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    fn unindex(&mut self, owner: StableHandle, key: EntityKey) {
        if let Some(keys) = self.by_owner.get_mut(&owner) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

impl MirrorScene for MemoryMirror {
    fn attach(&mut self, entity: MirrorEntity) -> EntityKey {
        let owner = entity.owner;
        let kind = entity.kind;
        let key = self.entities.insert(entity);
        if let Some(owner) = owner {
            self.index(owner, key);
        }
        self.journal.push(MirrorOp::Attach { owner, kind });
        key
    }

    fn detach(&mut self, key: EntityKey) -> Option<MirrorEntity> {
        let entity = self.entities.remove(key)?;
        if let Some(owner) = entity.owner {
            self.unindex(owner, key);
        }
        self.journal.push(MirrorOp::Detach {
            owner: entity.owner,
            kind: entity.kind,
        });
        Some(entity)
    }

    fn set_transform(&mut self, key: EntityKey, transform: Affine3A, motion: Option<Motion>) -> bool {
        let Some(entity) = self.entities.get_mut(key) else {
            return false;
        };
        entity.transform = transform;
        entity.motion = motion;
        let owner = entity.owner;
        self.journal.push(MirrorOp::Transform { owner });
        true
    }

    fn tag(&mut self, key: EntityKey, owner: StableHandle) -> bool {
        let Some(entity) = self.entities.get_mut(key) else {
            return false;
        };
        let previous = entity.owner.replace(owner);
        if let Some(previous) = previous.filter(|p| *p != owner) {
            self.unindex(previous, key);
        }
        self.index(owner, key);
        self.journal.push(MirrorOp::Tag { owner });
        true
    }

    fn entity(&self, key: EntityKey) -> Option<&MirrorEntity> {
        self.entities.get(key)
    }

    fn entities_of(&self, owner: StableHandle) -> SmallVec<[EntityKey; 4]> {
        self.by_owner.get(&owner).cloned().unwrap_or_default()
    }

    fn entities_by_class(&self, class: EntityClass) -> Vec<EntityKey> {
        self.entities
            .iter()
            .filter(|(_, e)| e.kind.class() == class)
            .map(|(k, _)| k)
            .collect()
    }

    fn owners(&self) -> Vec<StableHandle> {
        self.by_owner.keys().copied().collect()
    }

    fn digest(&self) -> Option<ChangeDigest> {
        self.digest
    }

    fn set_digest(&mut self, digest: ChangeDigest) {
        self.digest = Some(digest);
    }

    fn tonemap(&self) -> Option<TonemapSettings> {
        self.tonemap
    }

    fn set_tonemap(&mut self, tonemap: Option<TonemapSettings>) {
        self.tonemap = tonemap;
        self.journal.push(MirrorOp::Tonemap);
    }

    fn alpha(&self) -> bool {
        self.alpha
    }

    fn set_alpha(&mut self, enabled: bool) {
        self.alpha = enabled;
        self.journal.push(MirrorOp::Alpha);
    }

    fn invalidate(&mut self, reset: ResetKind) {
        self.journal.push(MirrorOp::Invalidate(reset));
    }
}
