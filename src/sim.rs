//! Reference simulator for running the controller closed loop.
//!
//! The torso is a single rigid body; legs are massless. A stance foot is
//! pinned to a world point on the ground plane z = 0, and the joint angles of
//! a stance leg follow from inverse kinematics of that point. Joint torques
//! on a stance leg produce the ground reaction f = −R J⁻ᵀ τ, clipped to zero
//! when the leg would pull on the ground. Swing legs hold their nominal
//! posture and exert nothing.

use na::{DVector, Matrix3, UnitQuaternion, Vector3};
use tracing::warn;

use crate::{
    config::RobotConfig,
    driver::{Observation, Simulator},
    kinematics::{Kinematics, QuadrupedKinematics},
    robot::{ContactSet, FootForceSet, JointTorqueCommand, LegId, LegMap, RobotState, NUM_LEGS},
    spatial::{pose::Pose, twist::Twist},
    types::Float,
    util::quaternion_derivative,
    GRAVITY,
};

/// Which legs are in stance at a given time
pub type ContactSchedule = Box<dyn FnMut(Float) -> [bool; NUM_LEGS]>;

/// Constant external force applied at the COM over a time window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Push {
    pub start: Float,
    pub duration: Float,
    pub force: Vector3<Float>,
}

impl Push {
    fn force_at(&self, time: Float) -> Vector3<Float> {
        if time >= self.start && time < self.start + self.duration {
            self.force
        } else {
            Vector3::zeros()
        }
    }
}

pub struct CentroidalSimulator {
    mass: Float,
    inertia: Vector3<Float>,
    nominal_height: Float,
    kinematics: QuadrupedKinematics,
    pose: Pose,
    /// Linear world frame, angular body frame
    linear_velocity: Vector3<Float>,
    angular_velocity: Vector3<Float>,
    q: DVector<Float>,
    v: DVector<Float>,
    feet: LegMap<Vector3<Float>>,
    schedule: ContactSchedule,
    pushes: Vec<Push>,
    forces: FootForceSet,
    time: Float,
}

impl CentroidalSimulator {
    /// Robot standing level at its nominal height with all feet down,
    /// directly under the hips
    pub fn standing(robot: &RobotConfig) -> Self {
        let kinematics = QuadrupedKinematics::new(robot);
        let height = robot.nominal_height;
        let pose = Pose::from_translation(Vector3::new(0., 0., height));
        let feet = LegMap::from_fn(|leg| {
            pose.translation + kinematics.default_foot_position(leg, height)
        });

        let mut sim = CentroidalSimulator {
            mass: robot.mass,
            inertia: Vector3::from(robot.inertia),
            nominal_height: height,
            q: DVector::zeros(kinematics.num_joints()),
            v: DVector::zeros(kinematics.num_joints()),
            kinematics,
            pose,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            feet,
            schedule: Box::new(|_| [true; NUM_LEGS]),
            pushes: vec![],
            forces: FootForceSet::new(),
            time: 0.,
        };
        sim.q = sim.solve_joint_positions();
        sim
    }

    pub fn with_schedule(mut self, schedule: ContactSchedule) -> Self {
        self.schedule = schedule;
        self.update_contacts();
        self.q = self.solve_joint_positions();
        self
    }

    pub fn add_push(&mut self, push: Push) {
        self.pushes.push(push);
    }

    pub fn time(&self) -> Float {
        self.time
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn twist(&self) -> Twist {
        Twist {
            angular: self.pose.rotation * self.angular_velocity,
            linear: self.linear_velocity,
        }
    }

    /// Ground reactions produced by the last applied command
    pub fn ground_forces(&self) -> &FootForceSet {
        &self.forces
    }

    pub fn contacts(&self) -> ContactSet {
        let stance: Vec<LegId> = self.feet.legs().collect();
        ContactSet::from_legs(&stance, &Vector3::z())
    }

    fn state(&self) -> RobotState {
        RobotState {
            q: self.q.clone(),
            v: self.v.clone(),
            pose: self.pose,
            twist: self.twist(),
        }
    }

    /// Ground reaction on one stance leg from its joint torques
    fn ground_reaction(&self, leg: LegId, tau: &JointTorqueCommand) -> Vector3<Float> {
        let J = self.kinematics.jacobian(&self.q, leg);
        let J = Matrix3::from_iterator(J.iter().copied());
        let tau_leg = Vector3::from_iterator(
            self.kinematics
                .leg_joints(leg)
                .map(|joint| tau.tau[joint]),
        );
        let Some(Jt_inv) = J.transpose().try_inverse() else {
            return Vector3::zeros();
        };
        let f = -(self.pose.rotation * (Jt_inv * tau_leg));
        if f.z < 0. {
            Vector3::zeros()
        } else {
            f
        }
    }

    /// Joint positions of pinned stance legs from inverse kinematics, and
    /// the nominal posture for everything else. Stance feet that have become
    /// unreachable are released.
    fn solve_joint_positions(&mut self) -> DVector<Float> {
        let to_body = self.pose.rotation.inverse();
        let mut q = DVector::zeros(self.kinematics.num_joints());
        for leg in LegId::ALL {
            let nominal = self
                .kinematics
                .default_foot_position(leg, self.nominal_height);
            let angles = match self.feet.get(leg).copied() {
                Some(foot) => {
                    let body = to_body * (foot - self.pose.translation);
                    match self.kinematics.inverse_kinematics(leg, &body) {
                        Some(angles) => Some(angles),
                        None => {
                            warn!("{} foot out of reach, releasing contact", leg);
                            self.feet.remove(leg);
                            None
                        }
                    }
                }
                None => None,
            };
            let angles = angles
                .or_else(|| self.kinematics.inverse_kinematics(leg, &nominal))
                .unwrap_or_else(Vector3::zeros);
            q.rows_mut(self.kinematics.leg_joints(leg).start, 3)
                .copy_from(&angles);
        }
        q
    }

    /// Pin feet that enter stance where they currently are, on the ground
    fn update_contacts(&mut self) {
        let flags = (self.schedule)(self.time);
        for (leg, in_stance) in LegId::ALL.into_iter().zip(flags) {
            match (in_stance, self.feet.contains(leg)) {
                (true, false) => {
                    let body = self.kinematics.foot_position(&self.q, leg);
                    let mut foot = self.pose.translation + self.pose.rotation * body;
                    foot.z = 0.;
                    self.feet.insert(leg, foot);
                }
                (false, true) => {
                    self.feet.remove(leg);
                }
                _ => {}
            }
        }
    }
}

impl Simulator for CentroidalSimulator {
    fn observe(&mut self) -> Observation {
        Observation {
            state: self.state(),
            contacts: self.contacts(),
        }
    }

    fn actuate(&mut self, command: &JointTorqueCommand, dt: Float) {
        let command = if command.len() == self.kinematics.num_joints() && command.is_finite() {
            command.clone()
        } else {
            warn!("ignoring malformed torque command of length {}", command.len());
            JointTorqueCommand::zeros(self.kinematics.num_joints())
        };

        let com = self.pose.translation;
        let mut force = Vector3::new(0., 0., -self.mass * GRAVITY);
        let mut torque = Vector3::zeros();
        for push in self.pushes.iter() {
            force += push.force_at(self.time);
        }
        let mut forces = FootForceSet::new();
        let feet: Vec<(LegId, Vector3<Float>)> = self.feet.iter().map(|(l, p)| (l, *p)).collect();
        for (leg, foot) in feet {
            let f = self.ground_reaction(leg, &command);
            force += f;
            torque += (foot - com).cross(&f);
            forces.insert(leg, f);
        }
        self.forces = forces;

        // Semi-implicit Euler: velocities first, then positions with the
        // new velocities
        let rotation = self.pose.rotation;
        let w = self.angular_velocity;
        let torque_body = rotation.inverse() * torque;
        let Iw = self.inertia.component_mul(&w);
        let w_dot = (torque_body - w.cross(&Iw)).component_div(&self.inertia);
        self.angular_velocity += w_dot * dt;
        self.linear_velocity += force / self.mass * dt;

        let quaternion_dot = quaternion_derivative(&rotation, &self.angular_velocity);
        self.pose = Pose {
            rotation: UnitQuaternion::from_quaternion(rotation.quaternion() + quaternion_dot * dt),
            translation: com + self.linear_velocity * dt,
        };
        self.time += dt;

        self.update_contacts();
        let q = self.solve_joint_positions();
        self.v = (&q - &self.q) / dt;
        self.q = q;
    }
}

#[cfg(test)]
mod sim_tests {
    use crate::{assert_close, assert_vec_close};

    use super::*;

    #[test]
    fn standing_feet_are_reachable_and_on_the_ground() {
        let robot = RobotConfig::default();
        let sim = CentroidalSimulator::standing(&robot);

        assert_eq!(sim.contacts().num_stance(), NUM_LEGS);
        for (leg, foot) in sim.feet.iter() {
            let body = sim.kinematics.foot_position(&sim.q, leg);
            assert_vec_close!(&(sim.pose.translation + body), foot, 1e-9);
            assert_close!(foot.z, 0.0, 1e-12);
        }
    }

    #[test]
    fn unpowered_robot_falls() {
        // Arrange
        let robot = RobotConfig::default();
        let mut sim = CentroidalSimulator::standing(&robot);
        let zero = JointTorqueCommand::zeros(12);
        let dt = 1e-3;

        // Act
        for _ in 0..100 {
            sim.actuate(&zero, dt);
        }

        // Assert: free fall while the legs fold
        let t = 0.1;
        let expected = robot.nominal_height - 0.5 * GRAVITY * t * t;
        assert_close!(sim.pose().translation.z, expected, 5e-3);
        assert_close!(sim.twist().linear.z, -GRAVITY * t, 1e-2);
    }

    #[test]
    fn reactions_follow_from_joint_torques() {
        // Arrange: torques a balanced controller would send
        let robot = RobotConfig::default();
        let mut sim = CentroidalSimulator::standing(&robot);
        let support = Vector3::new(0., 0., robot.weight() / 4.);
        let mut tau = DVector::zeros(12);
        for leg in LegId::ALL {
            let J = sim.kinematics.jacobian(&sim.q, leg);
            let t = -(J.transpose() * support);
            tau.rows_mut(sim.kinematics.leg_joints(leg).start, 3)
                .copy_from(&t);
        }

        // Act
        sim.actuate(&JointTorqueCommand { tau }, 1e-3);

        // Assert
        for (_, f) in sim.ground_forces().iter() {
            assert_vec_close!(f, &support, 1e-9);
        }
        assert_close!(sim.twist().linear.norm(), 0.0, 1e-9);
        assert_close!(sim.twist().angular.norm(), 0.0, 1e-9);
    }

    #[test]
    fn schedule_lifts_and_replants_feet() {
        // Arrange
        let robot = RobotConfig::default();
        let schedule: ContactSchedule = Box::new(|t| {
            if (0.01..0.02).contains(&t) {
                [true, false, false, true]
            } else {
                [true; NUM_LEGS]
            }
        });
        let mut sim = CentroidalSimulator::standing(&robot).with_schedule(schedule);
        let zero = JointTorqueCommand::zeros(12);

        // Act & Assert
        let mut saw_swing = false;
        for _ in 0..30 {
            sim.actuate(&zero, 1e-3);
            let stance = sim.contacts().num_stance();
            if stance == 2 {
                saw_swing = true;
                assert!(!sim.contacts().in_stance(LegId::FrontLeft));
            }
        }
        assert!(saw_swing);
        assert_eq!(sim.contacts().num_stance(), NUM_LEGS);
    }

    #[test]
    fn push_applies_only_in_its_window() {
        let push = Push {
            start: 0.5,
            duration: 0.1,
            force: Vector3::new(10., 0., 0.),
        };

        assert_close!(push.force_at(0.4).norm(), 0.0, 1e-12);
        assert_close!(push.force_at(0.55).x, 10.0, 1e-12);
        assert_close!(push.force_at(0.6).norm(), 0.0, 1e-12);
    }
}
