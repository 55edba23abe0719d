//! Render-global Singletons & Default Lights
//!
//! The environment and ground are single, owner-less mirror entities whose
//! presence follows [`RenderGlobals`](crate::settings::RenderGlobals). The
//! default lights are a fallback key/fill pair that exists only while nothing
//! else in the scene emits light.
//!
//! None of these keep state outside the mirror scene: every function finds the
//! current singletons by enumerating entities by class, so pull and push mode
//! can share them without coordinating.

use glam::{Affine3A, Vec3};

use crate::mirror::{EntityClass, EntityKind, EntityPayload, MirrorEntity, MirrorScene};
use crate::settings::{EnvironmentMode, EnvironmentSettings, GroundSettings};

/// Direction of a crossover between "scene has lights" and "scene is dark".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crossover {
    /// Fallback lights were created because no light contribution remains.
    Created,
    /// Fallback lights were removed because the scene gained a light.
    Removed,
}

/// Brings the environment singleton in line with `settings`.
///
/// Returns `true` if the mirror scene was mutated.
pub fn sync_environment<M: MirrorScene + ?Sized>(mirror: &mut M, settings: &EnvironmentSettings) -> bool {
    let wanted = (settings.mode != EnvironmentMode::None).then(|| {
        let mut entity = MirrorEntity::new(
            EntityKind::Environment,
            Affine3A::from_rotation_y(settings.rotation),
        );
        entity.payload = EntityPayload::Environment(*settings);
        entity
    });
    sync_singleton(mirror, EntityClass::Environment, wanted)
}

/// Brings the ground singleton in line with `settings`.
pub fn sync_ground<M: MirrorScene + ?Sized>(mirror: &mut M, settings: &GroundSettings) -> bool {
    let wanted = settings.enabled.then(|| {
        let mut entity = MirrorEntity::new(
            EntityKind::Ground,
            Affine3A::from_translation(Vec3::new(0.0, settings.height, 0.0)),
        );
        entity.payload = EntityPayload::Ground(*settings);
        entity
    });
    sync_singleton(mirror, EntityClass::Ground, wanted)
}

fn sync_singleton<M: MirrorScene + ?Sized>(
    mirror: &mut M,
    class: EntityClass,
    wanted: Option<MirrorEntity>,
) -> bool {
    let existing = mirror.entities_by_class(class);

    if let (Some(wanted), [key]) = (&wanted, existing.as_slice()) {
        let unchanged = mirror
            .entity(*key)
            .is_some_and(|e| e.payload == wanted.payload && e.transform == wanted.transform);
        if unchanged {
            return false;
        }
    }

    let mut mutated = false;
    for key in existing {
        mutated |= mirror.detach(key).is_some();
    }
    if let Some(wanted) = wanted {
        log::debug!("Updating {class:?} singleton");
        mirror.attach(wanted);
        mutated = true;
    }
    mutated
}

/// Number of entities contributing light: explicit lights, placed environment
/// emitters and a lit environment singleton.
#[must_use]
pub fn light_contributions<M: MirrorScene + ?Sized>(mirror: &M) -> usize {
    let explicit = mirror.entities_by_class(EntityClass::Light).len()
        + mirror.entities_by_class(EntityClass::EnvironmentLight).len();
    let environment = mirror
        .entities_by_class(EntityClass::Environment)
        .into_iter()
        .filter(|key| {
            mirror.entity(*key).is_some_and(|e| match e.payload {
                EntityPayload::Environment(env) => env.contributes_light(),
                _ => false,
            })
        })
        .count();
    explicit + environment
}

/// Creates or removes the fallback lights after a cycle or batch.
///
/// Evaluated once, after all other mutation. Because the decision depends only
/// on the mirror scene's current content, repeating it is a no-op, so each
/// direction of the crossover happens in exactly one cycle.
pub fn apply_default_light_crossover<M: MirrorScene + ?Sized>(
    mirror: &mut M,
    enabled: bool,
) -> Option<Crossover> {
    let contributions = light_contributions(mirror);
    let defaults = mirror.entities_by_class(EntityClass::DefaultLight);

    if (contributions > 0 || !enabled) && !defaults.is_empty() {
        for key in defaults {
            mirror.detach(key);
        }
        log::info!("Removed default lights ({contributions} light contributions)");
        return Some(Crossover::Removed);
    }

    if contributions == 0 && enabled && defaults.is_empty() {
        for transform in default_light_rig() {
            mirror.attach(MirrorEntity::new(EntityKind::DefaultLight, transform));
        }
        log::info!("Scene has no lights, created default lights");
        return Some(Crossover::Created);
    }

    None
}

/// Key light from above-front-left, fill light from the right.
fn default_light_rig() -> [Affine3A; 2] {
    [
        Affine3A::from_rotation_y(-0.6) * Affine3A::from_rotation_x(-0.8),
        Affine3A::from_rotation_y(1.2) * Affine3A::from_rotation_x(-0.3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryMirror;
    use crate::source::LightKind;

    #[test]
    fn crossover_is_idempotent() {
        let mut mirror = MemoryMirror::new();
        assert_eq!(apply_default_light_crossover(&mut mirror, true), Some(Crossover::Created));
        assert_eq!(apply_default_light_crossover(&mut mirror, true), None);
        assert_eq!(mirror.entities_by_class(EntityClass::DefaultLight).len(), 2);

        mirror.attach(MirrorEntity::new(EntityKind::Light(LightKind::Point), Affine3A::IDENTITY));
        assert_eq!(apply_default_light_crossover(&mut mirror, true), Some(Crossover::Removed));
        assert_eq!(apply_default_light_crossover(&mut mirror, true), None);
        assert!(mirror.entities_by_class(EntityClass::DefaultLight).is_empty());
    }

    #[test]
    fn disabled_default_lights_are_never_created() {
        let mut mirror = MemoryMirror::new();
        assert_eq!(apply_default_light_crossover(&mut mirror, false), None);
        assert!(mirror.is_empty());
    }

    #[test]
    fn lit_environment_counts_as_light() {
        let mut mirror = MemoryMirror::new();
        let env = EnvironmentSettings {
            mode: EnvironmentMode::Sky,
            ..Default::default()
        };
        assert!(sync_environment(&mut mirror, &env));
        assert!(!sync_environment(&mut mirror, &env));
        assert_eq!(light_contributions(&mirror), 1);

        assert!(sync_environment(&mut mirror, &EnvironmentSettings::default()));
        assert_eq!(light_contributions(&mirror), 0);
        assert!(mirror.is_empty());
    }

    #[test]
    fn ground_follows_settings() {
        let mut mirror = MemoryMirror::new();
        let mut ground = GroundSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(sync_ground(&mut mirror, &ground));
        ground.height = 2.0;
        assert!(sync_ground(&mut mirror, &ground));
        assert_eq!(mirror.entities_by_class(EntityClass::Ground).len(), 1);
        ground.enabled = false;
        assert!(sync_ground(&mut mirror, &ground));
        assert!(mirror.is_empty());
    }
}
