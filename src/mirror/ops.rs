//! Shared Mutation Primitives
//!
//! Both reconciliation strategies mutate the mirror scene exclusively through
//! these functions, always while holding the write lock.

use glam::Affine3A;

use crate::identity::StableHandle;
use crate::mirror::{MirrorEntity, MirrorScene};
use crate::motion::Motion;

/// Fully constructed entities of one placement, ready to attach.
#[derive(Debug, Clone)]
pub struct PreparedPlacement {
    pub id: StableHandle,
    pub entities: Vec<MirrorEntity>,
}

/// Detaches every entity tagged with `owner`. Returns the number detached.
pub fn detach_owner<M: MirrorScene + ?Sized>(mirror: &mut M, owner: StableHandle) -> usize {
    let keys = mirror.entities_of(owner);
    let mut count = 0;
    for key in keys {
        if mirror.detach(key).is_some() {
            count += 1;
        }
    }
    count
}

/// Attaches the entities of a placement and tags them with its id. An entity
/// the mirror refuses to tag is detached again, since nothing could reach it
/// afterwards. Returns the number attached.
pub fn attach_placement<M: MirrorScene + ?Sized>(mirror: &mut M, placement: PreparedPlacement) -> usize {
    let mut count = 0;
    for mut entity in placement.entities {
        entity.owner = None;
        let key = mirror.attach(entity);
        if mirror.tag(key, placement.id) {
            count += 1;
        } else {
            log::warn!("Mirror refused to tag an entity of {}, detaching it", placement.id);
            mirror.detach(key);
        }
    }
    count
}

/// Moves every entity of `owner` to `transform`. Returns the number updated.
pub fn update_owner_transform<M: MirrorScene + ?Sized>(
    mirror: &mut M,
    owner: StableHandle,
    transform: Affine3A,
    motion: Option<Motion>,
) -> usize {
    let keys = mirror.entities_of(owner);
    keys.into_iter()
        .filter(|key| mirror.set_transform(*key, transform, motion))
        .count()
}
