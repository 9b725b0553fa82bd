use std::ops::Range;

use na::{DVector, Matrix3, Matrix3xX, Rotation3, Vector3};

use crate::{
    config::RobotConfig,
    robot::{LegId, LegMap, JOINTS_PER_LEG, NUM_JOINTS},
    types::Float,
};

/// Leg kinematics of a robot with a fixed kinematic tree.
///
/// All quantities are in the body frame, relative to the torso origin (the
/// center of mass). Implementations are pure functions of the joint
/// configuration.
pub trait Kinematics {
    /// Total number of actuated joints
    fn num_joints(&self) -> usize;

    /// Indices of the joints actuating the leg, into joint vectors
    fn leg_joints(&self, leg: LegId) -> Range<usize>;

    fn foot_position(&self, q: &DVector<Float>, leg: LegId) -> Vector3<Float>;

    /// 3×N matrix mapping the velocities of the leg's N joints to the foot
    /// linear velocity
    fn jacobian(&self, q: &DVector<Float>, leg: LegId) -> Matrix3xX<Float>;

    fn foot_positions(&self, q: &DVector<Float>) -> LegMap<Vector3<Float>> {
        LegMap::from_fn(|leg| self.foot_position(q, leg))
    }
}

/// Joint frames of one leg at a given configuration
struct LegFrames {
    abduction_origin: Vector3<Float>,
    abduction_axis: Vector3<Float>,
    hip_origin: Vector3<Float>,
    pitch_axis: Vector3<Float>,
    knee_origin: Vector3<Float>,
    foot: Vector3<Float>,
}

/// Quadruped with three revolute joints per leg:
/// abduction about the body x axis at the hip, then hip and knee pitch about
/// the abducted y axis. The leg plane is offset laterally from the abduction
/// axis by `abduction_offset`.
///
/// At zero joint angles every leg hangs straight down.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadrupedKinematics {
    pub hip_x: Float,
    pub hip_y: Float,
    pub abduction_offset: Float,
    pub l1: Float,
    pub l2: Float,
}

impl QuadrupedKinematics {
    pub fn new(robot: &RobotConfig) -> Self {
        QuadrupedKinematics {
            hip_x: robot.hip_x,
            hip_y: robot.hip_y,
            abduction_offset: robot.abduction_offset,
            l1: robot.upper_link,
            l2: robot.lower_link,
        }
    }

    /// Abduction joint location, body frame
    pub fn hip_position(&self, leg: LegId) -> Vector3<Float> {
        let sx = if leg.is_front() { 1.0 } else { -1.0 };
        let sy = if leg.is_left() { 1.0 } else { -1.0 };
        Vector3::new(sx * self.hip_x, sy * self.hip_y, 0.)
    }

    /// Signed lateral offset of the leg plane: outward on both sides
    fn lateral_offset(&self, leg: LegId) -> Float {
        if leg.is_left() {
            self.abduction_offset
        } else {
            -self.abduction_offset
        }
    }

    /// Where the foot is at zero abduction with the leg bent so the foot sits
    /// `height` below the hip. Used as the nominal standing stance.
    pub fn default_foot_position(&self, leg: LegId, height: Float) -> Vector3<Float> {
        self.hip_position(leg) + Vector3::new(0., self.lateral_offset(leg), -height)
    }

    fn leg_angles(&self, q: &DVector<Float>, leg: LegId) -> Vector3<Float> {
        assert_eq!(
            q.len(),
            NUM_JOINTS,
            "joint vector has {} entries, expected {}",
            q.len(),
            NUM_JOINTS
        );
        q.fixed_rows::<3>(leg.index() * JOINTS_PER_LEG).into()
    }

    fn leg_frames(&self, angles: &Vector3<Float>, leg: LegId) -> LegFrames {
        let abduction = Rotation3::from_axis_angle(&Vector3::x_axis(), angles[0]);
        let hip_pitch = Rotation3::from_axis_angle(&Vector3::y_axis(), angles[1]);
        let knee_pitch = Rotation3::from_axis_angle(&Vector3::y_axis(), angles[2]);

        let abduction_origin = self.hip_position(leg);
        let hip_origin =
            abduction_origin + abduction * Vector3::new(0., self.lateral_offset(leg), 0.);
        let knee_origin = hip_origin + abduction * hip_pitch * Vector3::new(0., 0., -self.l1);
        let foot = knee_origin + abduction * hip_pitch * knee_pitch * Vector3::new(0., 0., -self.l2);

        LegFrames {
            abduction_origin,
            abduction_axis: Vector3::x(),
            hip_origin,
            pitch_axis: abduction * Vector3::y(),
            knee_origin,
            foot,
        }
    }

    /// Jacobian of a single leg from its three joint angles
    pub fn leg_jacobian(&self, angles: &Vector3<Float>, leg: LegId) -> Matrix3<Float> {
        let frames = self.leg_frames(angles, leg);
        let p = frames.foot;

        // revolute joint column: axis × (foot - joint origin)
        Matrix3::from_columns(&[
            frames.abduction_axis.cross(&(p - frames.abduction_origin)),
            frames.pitch_axis.cross(&(p - frames.hip_origin)),
            frames.pitch_axis.cross(&(p - frames.knee_origin)),
        ])
    }

    /// Given a foot location in the body frame, compute the leg's joint angles.
    /// The knee bends backward. Returns None if the foot is out of reach.
    pub fn inverse_kinematics(&self, leg: LegId, foot: &Vector3<Float>) -> Option<Vector3<Float>> {
        let d = foot - self.hip_position(leg);
        let y_off = self.lateral_offset(leg);

        // Abduction: rotate the leg plane so its offset lines up with the foot
        let yz_sq = d.y * d.y + d.z * d.z;
        let plane_sq = yz_sq - y_off * y_off;
        if plane_sq < 0.0 {
            return None;
        }
        let z_plane = -plane_sq.sqrt();
        let theta0 = d.z.atan2(d.y) - z_plane.atan2(y_off);

        // Two-link planar chain, angles measured from straight down
        let u = -d.x;
        let w = -z_plane;
        let (l1, l2) = (self.l1, self.l2);
        let cos_theta2 = (u * u + w * w - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        if !(-1.0..=1.0).contains(&cos_theta2) {
            return None;
        }
        let theta2 = -cos_theta2.acos();
        let theta1 = u.atan2(w) - (l2 * theta2.sin()).atan2(l1 + l2 * theta2.cos());

        Some(Vector3::new(theta0, theta1, theta2))
    }

    /// Joint vector that places every foot at the given body-frame location
    pub fn joint_positions_for(&self, feet: &LegMap<Vector3<Float>>) -> Option<DVector<Float>> {
        let mut q = DVector::zeros(NUM_JOINTS);
        for (leg, foot) in feet.iter() {
            let angles = self.inverse_kinematics(leg, foot)?;
            q.fixed_rows_mut::<3>(leg.index() * JOINTS_PER_LEG)
                .copy_from(&angles);
        }
        Some(q)
    }

    /// Standing configuration with every foot `height` below its hip
    pub fn standing_joint_positions(&self, height: Float) -> Option<DVector<Float>> {
        let feet = LegMap::from_fn(|leg| self.default_foot_position(leg, height));
        self.joint_positions_for(&feet)
    }
}

impl Kinematics for QuadrupedKinematics {
    fn num_joints(&self) -> usize {
        NUM_JOINTS
    }

    fn leg_joints(&self, leg: LegId) -> Range<usize> {
        let start = leg.index() * JOINTS_PER_LEG;
        start..start + JOINTS_PER_LEG
    }

    fn foot_position(&self, q: &DVector<Float>, leg: LegId) -> Vector3<Float> {
        let angles = self.leg_angles(q, leg);
        self.leg_frames(&angles, leg).foot
    }

    fn jacobian(&self, q: &DVector<Float>, leg: LegId) -> Matrix3xX<Float> {
        let angles = self.leg_angles(q, leg);
        let mut J = Matrix3xX::zeros(JOINTS_PER_LEG);
        J.copy_from(&self.leg_jacobian(&angles, leg));
        J
    }
}
