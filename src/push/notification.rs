//! Host notifications and their translation into commands.

use smallvec::SmallVec;

use crate::identity::StableHandle;
use crate::push::commands::Command;
use crate::settings::{EnvironmentMode, RenderGlobals};
use crate::watch::{WatchTable, Watched};

/// Which aspect of a referenced object changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangePart {
    Transform,
    /// Topology, modifiers or any other change requiring reconstruction.
    Structure,
    Material,
}

/// Events the host reports as they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NodeAdded(StableHandle),
    NodePreDeleted(StableHandle),
    NodeHidden(StableHandle),
    NodeUnhidden(StableHandle),
    FileSaveBegin,
    FileSaveEnd,
    ReferenceChanged {
        target: StableHandle,
        part: ChangePart,
    },
    /// The render globals changed; carries their new state.
    RenderGlobalsChanged(RenderGlobals),
}

/// Translates a change to `target`.
///
/// A known placement maps by `part`. A watched geometry maps to a rebuild of
/// every owner; a watched material maps to a material rebuild. Targets that
/// are neither are treated as placements the mirror does not know yet.
pub(crate) fn reference_commands(
    target: StableHandle,
    part: ChangePart,
    is_placement: bool,
    watch: &WatchTable,
) -> SmallVec<[Command; 4]> {
    if !is_placement {
        match watch.lookup(target) {
            Some(Watched::Geometry(_)) => {
                return watch.owners(target).into_iter().map(Command::Rebuild).collect();
            }
            Some(Watched::Material(material)) => {
                return smallvec::smallvec![Command::MaterialRebuild(material)];
            }
            None => {}
        }
    }

    smallvec::smallvec![match part {
        ChangePart::Transform => Command::Transform(target),
        ChangePart::Structure => Command::Rebuild(target),
        ChangePart::Material => Command::AssignMaterial(target),
    }]
}

/// Commands moving the mirror from `previous` to `current` render globals.
pub(crate) fn globals_commands(previous: &RenderGlobals, current: &RenderGlobals) -> SmallVec<[Command; 4]> {
    let mut commands = SmallVec::new();

    let env_active = |g: &RenderGlobals| g.environment.mode != EnvironmentMode::None || g.ground.enabled;
    match (env_active(previous), env_active(current)) {
        (false, true) => commands.push(Command::EnvStart),
        (true, false) => commands.push(Command::EnvStop),
        (true, true)
            if previous.environment != current.environment || previous.ground != current.ground =>
        {
            commands.push(Command::EnvModify);
        }
        // The fallback lights belong to the environment category.
        _ if previous.default_lights != current.default_lights => commands.push(Command::EnvModify),
        _ => {}
    }

    match (previous.tonemap, current.tonemap) {
        (None, Some(_)) => commands.push(Command::TonemapStart),
        (Some(_), None) => commands.push(Command::TonemapStop),
        (Some(a), Some(b)) if a != b => commands.push(Command::TonemapModify),
        _ => {}
    }

    if previous.alpha != current.alpha {
        commands.push(if current.alpha {
            Command::AlphaEnable
        } else {
            Command::AlphaDisable
        });
    }
    commands
}
