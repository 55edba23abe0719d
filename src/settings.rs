//! Synchronisation Settings & Per-cycle Snapshot
//!
//! Two kinds of configuration flow through the core:
//!
//! - [`SyncSettings`]: options owned by the integration (traversal policy,
//!   motion blur, push-mode timing). Serialisable so hosts can persist them;
//!   the core itself never touches disk.
//! - [`RenderGlobals`]: render-global scene state (environment, ground, tone
//!   mapping, alpha) read from the source graph. These inputs are not
//!   individually notified, so they are folded into the change digest.
//!
//! Both are captured once per cycle into an immutable [`SyncSnapshot`] that is
//! threaded through every component, so no component reads mutable global
//! state mid-cycle.
//!
//! ```rust,ignore
//! let settings = SyncSettings {
//!     motion_blur: MotionBlurSettings { enabled: true, ..Default::default() },
//!     ..Default::default()
//! };
//! let snapshot = SyncSnapshot::capture(&graph, &settings, 1.0, 1.0 / 24.0);
//! ```

use std::time::Duration;

use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};

use crate::identity::StableHandle;
use crate::source::SourceGraph;

// ---------------------------------------------------------------------------
// SyncSettings
// ---------------------------------------------------------------------------

/// Motion-blur sampling options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionBlurSettings {
    /// Compute per-placement velocities for flagged placements.
    pub enabled: bool,
    /// User scale applied to linear and angular velocity.
    pub factor: f32,
    /// Fraction of a frame between the two time samples.
    pub shutter: f64,
}

impl Default for MotionBlurSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 1.0,
            shutter: 0.5,
        }
    }
}

/// Options owned by the integration.
///
/// | Field                  | Description                                   | Default |
/// |------------------------|-----------------------------------------------|---------|
/// | `follow_external_refs` | Walk externally referenced sub-graphs         | `true`  |
/// | `skip_frozen`          | Exclude frozen nodes from traversal           | `false` |
/// | `motion_blur`          | Velocity sampling, see [`MotionBlurSettings`] | off     |
/// | `tick_interval_ms`     | Push-mode batch period                        | 50      |
/// | `rebuild_debounce_ms`  | Delay a batch after each rebuild request      | 200     |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub follow_external_refs: bool,
    pub skip_frozen: bool,
    pub motion_blur: MotionBlurSettings,
    pub tick_interval_ms: u64,
    pub rebuild_debounce_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            follow_external_refs: true,
            skip_frozen: false,
            motion_blur: MotionBlurSettings::default(),
            tick_interval_ms: 50,
            rebuild_debounce_ms: 200,
        }
    }
}

impl SyncSettings {
    #[inline]
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[inline]
    #[must_use]
    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }
}

// ---------------------------------------------------------------------------
// RenderGlobals
// ---------------------------------------------------------------------------

/// Background / image-based lighting source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EnvironmentMode {
    #[default]
    None,
    Color,
    Sky,
    Texture,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSettings {
    pub mode: EnvironmentMode,
    pub color: Vec3,
    pub intensity: f32,
    /// Rotation around the up axis, in radians.
    pub rotation: f32,
    /// Root of the environment texture graph when `mode` is `Texture`.
    pub texture: Option<StableHandle>,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            mode: EnvironmentMode::None,
            color: Vec3::ZERO,
            intensity: 1.0,
            rotation: 0.0,
            texture: None,
        }
    }
}

impl EnvironmentSettings {
    /// Returns `true` if the environment lights the scene.
    #[inline]
    #[must_use]
    pub fn contributes_light(&self) -> bool {
        self.mode != EnvironmentMode::None && self.intensity > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundSettings {
    pub enabled: bool,
    pub height: f32,
    pub color: Vec3,
    pub shadows_only: bool,
}

impl Default for GroundSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            height: 0.0,
            color: Vec3::splat(0.5),
            shadows_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ToneOperator {
    #[default]
    Linear,
    Reinhard,
    Filmic,
    Aces,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TonemapSettings {
    pub operator: ToneOperator,
    pub exposure: f32,
    pub gamma: f32,
}

impl Default for TonemapSettings {
    fn default() -> Self {
        Self {
            operator: ToneOperator::Linear,
            exposure: 0.0,
            gamma: 2.2,
        }
    }
}

/// Render-global state that is not individually notified by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderGlobals {
    pub environment: EnvironmentSettings,
    pub ground: GroundSettings,
    /// `None` disables tone mapping.
    pub tonemap: Option<TonemapSettings>,
    /// Render with an alpha channel.
    pub alpha: bool,
    /// Create fallback lights while the scene has no light contribution.
    pub default_lights: bool,
}

impl Default for RenderGlobals {
    fn default() -> Self {
        Self {
            environment: EnvironmentSettings::default(),
            ground: GroundSettings::default(),
            tonemap: None,
            alpha: false,
            default_lights: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Time & Camera
// ---------------------------------------------------------------------------

/// The two time samples of one cycle, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleTimes {
    pub t0: f64,
    pub t1: f64,
}

impl SampleTimes {
    #[must_use]
    pub fn new(t0: f64, t1: f64) -> Self {
        Self { t0, t1 }
    }

    /// A single sample with no motion interval.
    #[must_use]
    pub fn still(t: f64) -> Self {
        Self { t0: t, t1: t }
    }

    #[inline]
    #[must_use]
    pub fn spacing(&self) -> f32 {
        (self.t1 - self.t0) as f32
    }
}

/// Active camera state at both time samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub world0: Affine3A,
    pub world1: Affine3A,
    pub fov_y: f32,
}

// ---------------------------------------------------------------------------
// SyncSnapshot
// ---------------------------------------------------------------------------

/// Everything a cycle reads besides the per-node data, captured once.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub times: SampleTimes,
    pub settings: SyncSettings,
    pub globals: RenderGlobals,
    pub camera: Option<CameraState>,
}

impl SyncSnapshot {
    /// Captures the snapshot for a cycle at `time`.
    ///
    /// When motion blur is enabled the second sample lies `shutter` frames
    /// after `time`; otherwise both samples coincide.
    pub fn capture<G: SourceGraph + ?Sized>(
        graph: &G,
        settings: &SyncSettings,
        time: f64,
        frame_duration: f64,
    ) -> Self {
        let times = if settings.motion_blur.enabled {
            SampleTimes::new(time, time + frame_duration * settings.motion_blur.shutter)
        } else {
            SampleTimes::still(time)
        };

        Self {
            times,
            settings: settings.clone(),
            globals: graph.render_globals(),
            camera: graph.camera(times),
        }
    }

    /// Returns `true` if motion vectors should be computed this cycle.
    #[inline]
    #[must_use]
    pub fn motion_enabled(&self) -> bool {
        self.settings.motion_blur.enabled && self.camera.is_some() && self.times.spacing() > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: SyncSettings =
            serde_json::from_str(r#"{ "skip_frozen": true, "motion_blur": { "factor": 2.0 } }"#)
                .unwrap();
        assert!(settings.skip_frozen);
        assert!(settings.follow_external_refs);
        assert_eq!(settings.motion_blur.factor, 2.0);
        assert_eq!(settings.motion_blur.shutter, 0.5);
        assert_eq!(settings.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn environment_contribution_requires_mode_and_intensity() {
        let mut env = EnvironmentSettings::default();
        assert!(!env.contributes_light());
        env.mode = EnvironmentMode::Sky;
        assert!(env.contributes_light());
        env.intensity = 0.0;
        assert!(!env.contributes_light());
    }
}
