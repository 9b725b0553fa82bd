use na::Vector3;
use serde::{Deserialize, Serialize};

use crate::types::Float;

/// Torso velocity. Both components are expressed in the world frame, the
/// linear part being the velocity of the torso origin.
#[derive(Clone, Debug, PartialEq, Copy, Serialize, Deserialize)]
pub struct Twist {
    pub angular: Vector3<Float>,
    pub linear: Vector3<Float>,
}

impl Twist {
    pub fn zero() -> Self {
        Twist {
            angular: Vector3::zeros(),
            linear: Vector3::zeros(),
        }
    }
}

/// Torso acceleration, world frame
#[derive(Clone, Debug, PartialEq, Copy, Serialize, Deserialize)]
pub struct SpatialAcceleration {
    pub angular: Vector3<Float>,
    pub linear: Vector3<Float>,
}

impl SpatialAcceleration {
    pub fn zero() -> Self {
        SpatialAcceleration {
            angular: Vector3::zeros(),
            linear: Vector3::zeros(),
        }
    }
}
