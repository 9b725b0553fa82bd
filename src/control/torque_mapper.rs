use itertools::izip;
use na::{Matrix3, Matrix3xX};
use tracing::warn;

use crate::{
    error::ControlError,
    kinematics::Kinematics,
    robot::{FootForceSet, JointTorqueCommand, LegId, RobotState},
    types::Float,
};

/// Joint torques for one tick, and the stance legs that had to be left out
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueMap {
    pub command: JointTorqueCommand,
    pub degenerate: Vec<LegId>,
}

impl TorqueMap {
    /// The command, if every leg with a force could be mapped
    pub fn into_command(self) -> Result<JointTorqueCommand, ControlError> {
        if self.degenerate.is_empty() {
            Ok(self.command)
        } else {
            Err(ControlError::DegenerateGeometry {
                legs: self.degenerate,
            })
        }
    }
}

/// Maps ground-reaction forces to joint torques through the leg Jacobians.
///
/// A ground reaction f (world frame) is produced by the leg pushing on the
/// ground with −f, so the joint torque is τ = −Jᵀ Rᵀ f, R being the torso
/// orientation. Contributions of all legs are summed per joint.
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueMapper {
    singular_threshold: Float,
}

impl TorqueMapper {
    pub fn new(singular_threshold: Float) -> Self {
        TorqueMapper { singular_threshold }
    }

    pub fn map_to_joint_torques(
        &self,
        forces: &FootForceSet,
        state: &RobotState,
        kinematics: &dyn Kinematics,
    ) -> Result<TorqueMap, ControlError> {
        let n = kinematics.num_joints();
        if state.q.len() != n {
            return Err(ControlError::invalid_input(format!(
                "expected {} joint positions, got {}",
                n,
                state.q.len()
            )));
        }

        let world_to_body = state.pose.rotation.inverse();
        let mut command = JointTorqueCommand::zeros(n);
        let mut degenerate = vec![];

        for (leg, force) in forces.iter() {
            let J = kinematics.jacobian(&state.q, leg);
            let sigma_min = smallest_singular_value(&J);
            if !(sigma_min >= self.singular_threshold) {
                warn!(
                    "dropping {}: Jacobian smallest singular value {:e}",
                    leg, sigma_min
                );
                degenerate.push(leg);
                continue;
            }

            let contribution = -(J.transpose() * (world_to_body * *force));
            for (joint, tau) in izip!(kinematics.leg_joints(leg), contribution.iter()) {
                command.tau[joint] += tau;
            }
        }

        Ok(TorqueMap {
            command,
            degenerate,
        })
    }
}

/// σ_min of a 3 × N Jacobian, from the eigenvalues of J Jᵀ
fn smallest_singular_value(J: &Matrix3xX<Float>) -> Float {
    let JJt: Matrix3<Float> = J * J.transpose();
    let lambda_min = JJt.symmetric_eigenvalues().min();
    lambda_min.max(0.).sqrt()
}
