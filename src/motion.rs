//! Motion Sampling
//!
//! Per-placement velocity for motion blur. The placement is expressed in
//! camera space at both time samples, so a camera that moves with an object
//! produces no blur on it. The camera-space delta is rotated back into world
//! orientation and scaled by `factor / spacing`.

use glam::{Affine3A, Quat, Vec3};

use crate::settings::CameraState;

/// Below this magnitude the rotation axis of a quaternion is undefined.
const AXIS_EPSILON: f32 = 1e-6;

/// Linear and angular velocity of a placement, in world orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    pub linear: Vec3,
    /// Unit rotation axis.
    pub axis: Vec3,
    /// Rotation angle per unit time, in radians.
    pub angle: f32,
}

impl Motion {
    /// No translation and no rotation.
    pub const IDENTITY: Self = Self {
        linear: Vec3::ZERO,
        axis: Vec3::Z,
        angle: 0.0,
    };

    #[inline]
    #[must_use]
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for Motion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Computes the velocity of a placement between its two world transforms.
#[must_use]
pub fn sample_motion(
    transform0: &Affine3A,
    transform1: &Affine3A,
    camera: &CameraState,
    spacing: f32,
    factor: f32,
) -> Motion {
    if spacing <= 0.0 || !spacing.is_finite() {
        return Motion::IDENTITY;
    }

    let local0 = camera.world0.inverse() * *transform0;
    let local1 = camera.world1.inverse() * *transform1;

    let camera_rotation = rotation_of(&camera.world0);
    let scale = factor / spacing;

    let linear_camera = Vec3::from(local1.translation - local0.translation);
    let linear = camera_rotation * linear_camera * scale;

    let delta = rotation_of(&local1) * rotation_of(&local0).inverse();
    let (axis, angle) = match axis_angle(delta) {
        Some((axis, angle)) => ((camera_rotation * axis).normalize_or(Vec3::Z), angle * scale),
        None => (Motion::IDENTITY.axis, 0.0),
    };

    let motion = Motion {
        linear,
        axis,
        angle,
    };
    if motion.linear.is_finite() && motion.axis.is_finite() && motion.angle.is_finite() {
        motion
    } else {
        log::debug!("Non-finite motion sample, using identity");
        Motion::IDENTITY
    }
}

fn rotation_of(transform: &Affine3A) -> Quat {
    let (_, rotation, _) = transform.to_scale_rotation_translation();
    rotation.normalize()
}

/// Axis and angle of a rotation, or `None` when the axis is degenerate.
fn axis_angle(rotation: Quat) -> Option<(Vec3, f32)> {
    let rotation = if rotation.w < 0.0 { -rotation } else { rotation };
    let vector = rotation.xyz();
    let length = vector.length();
    if !length.is_finite() || length < AXIS_EPSILON {
        return None;
    }
    Some((vector / length, 2.0 * length.atan2(rotation.w)))
}
