use na::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::types::Float;

/// Torso pose in the world frame
#[derive(Clone, Debug, PartialEq, Copy, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: UnitQuaternion<Float>,
    pub translation: Vector3<Float>,
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_translation(translation: Vector3<Float>) -> Self {
        Pose {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Minimal-coordinate error `target ⊖ self`: translation difference and
    /// the rotation vector (axis * angle, world frame) taking self to target.
    pub fn error_to(&self, target: &Pose) -> (Vector3<Float>, Vector3<Float>) {
        let linear = target.translation - self.translation;
        let angular = (target.rotation * self.rotation.inverse()).scaled_axis();
        (linear, angular)
    }
}
