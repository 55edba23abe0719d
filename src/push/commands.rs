//! Command Queue
//!
//! Push-mode commands are coalesced at insertion, so a burst of notifications
//! for one placement collapses to the least work that yields the same final
//! state. Draining yields the commands in a fixed category order:
//!
//! `Rebuild > AssignMaterial > Transform > Show > Hide > Delete >
//! MaterialRebuild > Environment > Tonemap > Alpha`
//!
//! Within a category, commands keep their insertion order.
//!
//! # Coalescing
//!
//! | Inserted          | Pending for the same id      | Result                    |
//! |-------------------|------------------------------|---------------------------|
//! | `Rebuild`         | `AssignMaterial`, `Transform`| both cancelled            |
//! | `Rebuild`         | `Delete`                     | `Delete` replaced         |
//! | `AssignMaterial`, `Transform` | `Rebuild`        | absorbed                  |
//! | anything but `Rebuild` | `Delete`                | dropped                   |
//! | `Delete`          | anything                     | everything else cancelled |
//! | `Show` / `Hide`   | the other one                | replaced (last one wins)  |
//! | `EnvStop`         | `EnvStart`                   | both cancelled            |
//! | `TonemapStop`     | `TonemapStart`/`Modify`      | cancels them              |
//! | `AlphaEnable` / `AlphaDisable` | the other one   | both cancelled            |

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::identity::{MaterialId, StableHandle};

/// One push-mode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Rebuild(StableHandle),
    AssignMaterial(StableHandle),
    Transform(StableHandle),
    Show(StableHandle),
    Hide(StableHandle),
    Delete(StableHandle),
    MaterialRebuild(MaterialId),
    EnvStart,
    EnvModify,
    EnvStop,
    TonemapStart,
    TonemapModify,
    TonemapStop,
    AlphaEnable,
    AlphaDisable,
}

/// Command categories, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Rebuild,
    AssignMaterial,
    Transform,
    Show,
    Hide,
    Delete,
    MaterialRebuild,
    Environment,
    Tonemap,
    Alpha,
}

impl Command {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::Rebuild(_) => Category::Rebuild,
            Self::AssignMaterial(_) => Category::AssignMaterial,
            Self::Transform(_) => Category::Transform,
            Self::Show(_) => Category::Show,
            Self::Hide(_) => Category::Hide,
            Self::Delete(_) => Category::Delete,
            Self::MaterialRebuild(_) => Category::MaterialRebuild,
            Self::EnvStart | Self::EnvModify | Self::EnvStop => Category::Environment,
            Self::TonemapStart | Self::TonemapModify | Self::TonemapStop => Category::Tonemap,
            Self::AlphaEnable | Self::AlphaDisable => Category::Alpha,
        }
    }

    /// The placement this command targets, if any.
    #[must_use]
    pub fn target(&self) -> Option<StableHandle> {
        match self {
            Self::Rebuild(id)
            | Self::AssignMaterial(id)
            | Self::Transform(id)
            | Self::Show(id)
            | Self::Hide(id)
            | Self::Delete(id) => Some(*id),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-id pending operations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PendingOps: u8 {
        const REBUILD         = 1 << 0;
        const ASSIGN_MATERIAL = 1 << 1;
        const TRANSFORM       = 1 << 2;
        const SHOW            = 1 << 3;
        const HIDE            = 1 << 4;
        const DELETE          = 1 << 5;
    }
}

/// Three-state render-global command (start / modify / stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lifecycle {
    Start,
    Modify,
    Stop,
}

/// Pending push-mode work, coalesced per id.
#[derive(Debug, Default)]
pub struct CommandQueue {
    ops: FxHashMap<StableHandle, PendingOps>,
    /// Insertion order of ids, for stable draining.
    order: Vec<StableHandle>,
    materials: Vec<MaterialId>,
    material_set: FxHashSet<MaterialId>,
    environment: Option<Lifecycle>,
    tonemap: Option<Lifecycle>,
    alpha: Option<bool>,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a command, applying the coalescing rules.
    ///
    /// Returns `true` if the queue changed.
    pub fn push(&mut self, command: Command) -> bool {
        let changed = match command {
            Command::Rebuild(id) => self.update(id, |ops| {
                ops.remove(PendingOps::ASSIGN_MATERIAL | PendingOps::TRANSFORM | PendingOps::DELETE);
                ops.insert(PendingOps::REBUILD);
            }),
            Command::AssignMaterial(id) => self.update_unless_replaced(id, PendingOps::ASSIGN_MATERIAL),
            Command::Transform(id) => self.update_unless_replaced(id, PendingOps::TRANSFORM),
            Command::Show(id) => self.toggle(id, PendingOps::SHOW, PendingOps::HIDE),
            Command::Hide(id) => self.toggle(id, PendingOps::HIDE, PendingOps::SHOW),
            Command::Delete(id) => self.update(id, |ops| *ops = PendingOps::DELETE),
            Command::MaterialRebuild(material) => {
                if self.material_set.insert(material) {
                    self.materials.push(material);
                    true
                } else {
                    false
                }
            }
            Command::EnvStart => Self::lifecycle(&mut self.environment, Lifecycle::Start),
            Command::EnvModify => Self::lifecycle(&mut self.environment, Lifecycle::Modify),
            Command::EnvStop => Self::lifecycle(&mut self.environment, Lifecycle::Stop),
            Command::TonemapStart => Self::lifecycle(&mut self.tonemap, Lifecycle::Start),
            Command::TonemapModify => Self::lifecycle(&mut self.tonemap, Lifecycle::Modify),
            Command::TonemapStop => Self::lifecycle(&mut self.tonemap, Lifecycle::Stop),
            Command::AlphaEnable => self.alpha_toggle(true),
            Command::AlphaDisable => self.alpha_toggle(false),
        };
        if changed {
            log::trace!("Queued {command:?}");
        }
        changed
    }

    /// Operations pending for `id`.
    #[must_use]
    pub fn pending(&self, id: StableHandle) -> PendingOps {
        self.ops.get(&id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
            && self.materials.is_empty()
            && self.environment.is_none()
            && self.tonemap.is_none()
            && self.alpha.is_none()
    }

    /// Number of commands a drain would yield.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.values().map(|ops| ops.bits().count_ones() as usize).sum::<usize>()
            + self.materials.len()
            + usize::from(self.environment.is_some())
            + usize::from(self.tonemap.is_some())
            + usize::from(self.alpha.is_some())
    }

    /// Removes and returns every pending command in application order.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.len());
        let order = std::mem::take(&mut self.order);
        let ops = std::mem::take(&mut self.ops);

        let by_id: [(PendingOps, fn(StableHandle) -> Command); 6] = [
            (PendingOps::REBUILD, Command::Rebuild),
            (PendingOps::ASSIGN_MATERIAL, Command::AssignMaterial),
            (PendingOps::TRANSFORM, Command::Transform),
            (PendingOps::SHOW, Command::Show),
            (PendingOps::HIDE, Command::Hide),
            (PendingOps::DELETE, Command::Delete),
        ];
        for (flag, make) in by_id {
            commands.extend(
                order
                    .iter()
                    .filter(|id| ops.get(*id).is_some_and(|pending| pending.contains(flag)))
                    .map(|id| make(*id)),
            );
        }

        commands.extend(self.materials.drain(..).map(Command::MaterialRebuild));
        self.material_set.clear();

        if let Some(env) = self.environment.take() {
            commands.push(match env {
                Lifecycle::Start => Command::EnvStart,
                Lifecycle::Modify => Command::EnvModify,
                Lifecycle::Stop => Command::EnvStop,
            });
        }
        if let Some(tonemap) = self.tonemap.take() {
            commands.push(match tonemap {
                Lifecycle::Start => Command::TonemapStart,
                Lifecycle::Modify => Command::TonemapModify,
                Lifecycle::Stop => Command::TonemapStop,
            });
        }
        if let Some(alpha) = self.alpha.take() {
            commands.push(if alpha {
                Command::AlphaEnable
            } else {
                Command::AlphaDisable
            });
        }
        commands
    }

    fn update(&mut self, id: StableHandle, f: impl FnOnce(&mut PendingOps)) -> bool {
        let before = self.pending(id);
        let mut after = before;
        f(&mut after);
        if after == before {
            return false;
        }
        if after.is_empty() {
            self.ops.remove(&id);
            self.order.retain(|o| *o != id);
        } else {
            if before.is_empty() {
                self.order.push(id);
            }
            self.ops.insert(id, after);
        }
        true
    }

    /// Adds `flag` unless a rebuild or delete is already pending.
    fn update_unless_replaced(&mut self, id: StableHandle, flag: PendingOps) -> bool {
        self.update(id, |ops| {
            if !ops.intersects(PendingOps::REBUILD | PendingOps::DELETE) {
                ops.insert(flag);
            }
        })
    }

    /// Adds `flag`, replacing a pending `opposite`.
    fn toggle(&mut self, id: StableHandle, flag: PendingOps, opposite: PendingOps) -> bool {
        self.update(id, |ops| {
            if ops.contains(PendingOps::DELETE) {
                return;
            }
            ops.remove(opposite);
            ops.insert(flag);
        })
    }

    fn lifecycle(slot: &mut Option<Lifecycle>, incoming: Lifecycle) -> bool {
        let next = match (*slot, incoming) {
            (Some(Lifecycle::Start), Lifecycle::Stop) => None,
            (Some(Lifecycle::Start), Lifecycle::Modify) => Some(Lifecycle::Start),
            (_, incoming) => Some(incoming),
        };
        let changed = next != *slot;
        *slot = next;
        changed
    }

    fn alpha_toggle(&mut self, enable: bool) -> bool {
        self.alpha = match self.alpha {
            Some(pending) if pending != enable => None,
            _ => Some(enable),
        };
        true
    }
}
