use na::{Matrix3, Vector3, Vector6};

use crate::{
    config::{DerivativeMode, PidConfig, RobotConfig},
    error::ControlError,
    robot::DesiredTrajectory,
    spatial::{pose::Pose, twist::Twist, wrench::Wrench},
    types::Float,
};

/// Integral and previous-error memory of the body PID.
///
/// This is the only state carried from one tick to the next. It is owned by
/// the control loop and lent to `BodyPid` for the duration of a tick.
/// Axes are ordered x y z roll pitch yaw.
#[derive(Debug, Clone, PartialEq)]
pub struct PidState {
    integral: Vector6<Float>,
    prev_error: Option<Vector6<Float>>,
}

impl PidState {
    pub fn new() -> Self {
        PidState {
            integral: Vector6::zeros(),
            prev_error: None,
        }
    }

    /// Clear integral and derivative memory, e.g. after a discontinuous
    /// contact change
    pub fn reset(&mut self) {
        self.integral = Vector6::zeros();
        self.prev_error = None;
    }

    pub fn integral(&self) -> &Vector6<Float> {
        &self.integral
    }

    pub fn prev_error(&self) -> Option<&Vector6<Float>> {
        self.prev_error.as_ref()
    }
}

impl Default for PidState {
    fn default() -> Self {
        PidState::new()
    }
}

/// Six-axis PID on the torso pose, producing the wrench the feet should
/// apply to the torso (world frame, about the COM).
///
/// Orientation error is the rotation vector from the current to the desired
/// orientation, so no Euler-angle singularities occur.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyPid {
    kp: Vector6<Float>,
    ki: Vector6<Float>,
    kd: Vector6<Float>,
    integral_limit: Vector6<Float>,
    derivative: DerivativeMode,
    feed_forward: bool,
    mass: Float,
    inertia: Matrix3<Float>,
}

impl BodyPid {
    pub fn new(pid: &PidConfig, robot: &RobotConfig) -> Self {
        BodyPid {
            kp: Vector6::from(pid.kp),
            ki: Vector6::from(pid.ki),
            kd: Vector6::from(pid.kd),
            integral_limit: Vector6::from(pid.integral_limit),
            derivative: pid.derivative,
            feed_forward: pid.feed_forward,
            mass: robot.mass,
            inertia: robot.inertia_matrix(),
        }
    }

    /// Compute the desired body wrench for this tick.
    ///
    /// `dt` is the true elapsed time since the previous tick.
    /// output = Kp e + Ki ∫e + Kd ė (+ M a_des)
    pub fn compute_desired_wrench(
        &self,
        memory: &mut PidState,
        pose: &Pose,
        twist: &Twist,
        reference: &DesiredTrajectory,
        dt: Float,
    ) -> Result<Wrench, ControlError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(ControlError::invalid_input(format!(
                "tick duration must be positive, got {}",
                dt
            )));
        }

        let (linear_error, angular_error) = pose.error_to(&reference.pose);
        let error = stack(&linear_error, &angular_error);
        let rate_error = stack(
            &(reference.twist.linear - twist.linear),
            &(reference.twist.angular - twist.angular),
        );

        // Anti-windup: clamp the accumulated error per axis
        let integral = (memory.integral + error * dt)
            .zip_map(&self.integral_limit, |x, limit| x.clamp(-limit, limit));

        let derivative = match self.derivative {
            DerivativeMode::Velocity => rate_error,
            DerivativeMode::Difference => match memory.prev_error {
                Some(prev) => (error - prev) / dt,
                None => Vector6::zeros(),
            },
        };

        memory.integral = integral;
        memory.prev_error = Some(error);

        let output = self.kp.component_mul(&error)
            + self.ki.component_mul(&integral)
            + self.kd.component_mul(&derivative);
        let mut wrench = Wrench::from_vector(&output);

        if self.feed_forward {
            let rotation = pose.rotation.to_rotation_matrix();
            let inertia_world = rotation.matrix() * self.inertia * rotation.matrix().transpose();
            wrench.linear += self.mass * reference.acceleration.linear;
            wrench.angular += inertia_world * reference.acceleration.angular;
        }

        Ok(wrench)
    }
}

fn stack(top: &Vector3<Float>, bottom: &Vector3<Float>) -> Vector6<Float> {
    let mut v = Vector6::zeros();
    v.fixed_rows_mut::<3>(0).copy_from(top);
    v.fixed_rows_mut::<3>(3).copy_from(bottom);
    v
}

#[cfg(test)]
mod pid_tests {
    use na::{vector, UnitQuaternion};
    use rand::rng;

    use crate::{
        assert_close, assert_vec_close,
        spatial::twist::SpatialAcceleration,
        util::test_utils::{random_quaternion, random_vector},
    };

    use super::*;

    fn p_only(axis: usize, kp: Float) -> PidConfig {
        let mut config = PidConfig::zero();
        config.kp[axis] = kp;
        config
    }

    #[test]
    fn zero_gains_give_zero_wrench() {
        // Arrange
        let pid = BodyPid::new(&PidConfig::zero(), &RobotConfig::default());
        let mut memory = PidState::new();
        let mut rng = rng();

        for _ in 0..20 {
            let pose = Pose {
                rotation: random_quaternion(&mut rng, 1.0),
                translation: random_vector(&mut rng, 1.0),
            };
            let twist = Twist {
                angular: random_vector(&mut rng, 2.0),
                linear: random_vector(&mut rng, 2.0),
            };
            let reference = DesiredTrajectory {
                pose: Pose {
                    rotation: random_quaternion(&mut rng, 1.0),
                    translation: random_vector(&mut rng, 1.0),
                },
                twist: Twist::zero(),
                acceleration: SpatialAcceleration {
                    angular: random_vector(&mut rng, 5.0),
                    linear: random_vector(&mut rng, 5.0),
                },
            };

            // Act
            let wrench = pid
                .compute_desired_wrench(&mut memory, &pose, &twist, &reference, 0.002)
                .unwrap();

            // Assert
            assert_close!(wrench.to_vector().norm(), 0.0, 1e-12);
        }
    }

    #[test]
    fn proportional_term_on_height() {
        let pid = BodyPid::new(&p_only(2, 100.0), &RobotConfig::default());
        let mut memory = PidState::new();
        let pose = Pose::from_translation(vector![0., 0., 0.4]);
        let reference = DesiredTrajectory::hold(Pose::from_translation(vector![0., 0., 0.5]));

        let wrench = pid
            .compute_desired_wrench(&mut memory, &pose, &Twist::zero(), &reference, 0.01)
            .unwrap();

        assert_vec_close!(&wrench.linear, &vector![0., 0., 10.], 1e-9);
        assert_vec_close!(&wrench.angular, &Vector3::<Float>::zeros(), 1e-12);
    }

    /// A torso rolled to the left gets a restoring torque about -x
    #[test]
    fn orientation_error_produces_restoring_torque() {
        let pid = BodyPid::new(&p_only(3, 50.0), &RobotConfig::default());
        let mut memory = PidState::new();
        let pose = Pose {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.1),
            translation: Vector3::zeros(),
        };
        let reference = DesiredTrajectory::hold(Pose::identity());

        let wrench = pid
            .compute_desired_wrench(&mut memory, &pose, &Twist::zero(), &reference, 0.01)
            .unwrap();

        assert_vec_close!(&wrench.angular, &vector![-5.0, 0., 0.], 1e-9);
    }

    #[test]
    fn integral_is_clamped() {
        // Arrange
        let mut config = PidConfig::zero();
        config.ki[2] = 10.0;
        config.integral_limit[2] = 0.05;
        let pid = BodyPid::new(&config, &RobotConfig::default());
        let mut memory = PidState::new();
        let pose = Pose::from_translation(vector![0., 0., 0.3]);
        let reference = DesiredTrajectory::hold(Pose::from_translation(vector![0., 0., 0.5]));

        // Act
        let mut wrench = Wrench::zero();
        for _ in 0..1000 {
            wrench = pid
                .compute_desired_wrench(&mut memory, &pose, &Twist::zero(), &reference, 0.01)
                .unwrap();
        }

        // Assert
        assert_close!(memory.integral()[2], 0.05, 1e-12);
        assert_close!(wrench.linear.z, 0.5, 1e-9);
    }

    #[test]
    fn integral_accumulates_error_times_dt() {
        let mut config = PidConfig::zero();
        config.ki[0] = 2.0;
        let pid = BodyPid::new(&config, &RobotConfig::default());
        let mut memory = PidState::new();
        let reference = DesiredTrajectory::hold(Pose::from_translation(vector![0.01, 0., 0.]));

        for _ in 0..3 {
            pid.compute_desired_wrench(
                &mut memory,
                &Pose::identity(),
                &Twist::zero(),
                &reference,
                0.5,
            )
            .unwrap();
        }

        assert_close!(memory.integral()[0], 0.015, 1e-12);
    }

    #[test]
    fn velocity_derivative_damps_twist() {
        let mut config = PidConfig::zero();
        config.kd[1] = 20.0;
        let pid = BodyPid::new(&config, &RobotConfig::default());
        let mut memory = PidState::new();
        let twist = Twist {
            angular: Vector3::zeros(),
            linear: vector![0., 0.5, 0.],
        };

        let wrench = pid
            .compute_desired_wrench(
                &mut memory,
                &Pose::identity(),
                &twist,
                &DesiredTrajectory::hold(Pose::identity()),
                0.01,
            )
            .unwrap();

        assert_vec_close!(&wrench.linear, &vector![0., -10., 0.], 1e-9);
    }

    #[test]
    fn difference_derivative_uses_previous_error() {
        // Arrange
        let mut config = PidConfig::zero();
        config.kd[2] = 1.0;
        config.derivative = DerivativeMode::Difference;
        let pid = BodyPid::new(&config, &RobotConfig::default());
        let mut memory = PidState::new();
        let reference = DesiredTrajectory::hold(Pose::from_translation(vector![0., 0., 0.5]));
        let dt = 0.1;

        // Act
        let first = pid
            .compute_desired_wrench(
                &mut memory,
                &Pose::from_translation(vector![0., 0., 0.3]),
                &Twist::zero(),
                &reference,
                dt,
            )
            .unwrap();
        let second = pid
            .compute_desired_wrench(
                &mut memory,
                &Pose::from_translation(vector![0., 0., 0.35]),
                &Twist::zero(),
                &reference,
                dt,
            )
            .unwrap();

        // Assert
        assert_close!(first.linear.z, 0.0, 1e-12); // no history yet
        assert_close!(second.linear.z, (0.15 - 0.2) / dt, 1e-9);
    }

    #[test]
    fn feed_forward_adds_inertial_terms() {
        let robot = RobotConfig::default();
        let mut config = PidConfig::zero();
        config.feed_forward = true;
        let pid = BodyPid::new(&config, &robot);
        let mut memory = PidState::new();
        let mut reference = DesiredTrajectory::hold(Pose::identity());
        reference.acceleration = SpatialAcceleration {
            angular: vector![0., 0., 2.0],
            linear: vector![1.0, 0., 0.],
        };

        let wrench = pid
            .compute_desired_wrench(
                &mut memory,
                &Pose::identity(),
                &Twist::zero(),
                &reference,
                0.01,
            )
            .unwrap();

        assert_vec_close!(&wrench.linear, &vector![robot.mass, 0., 0.], 1e-12);
        assert_vec_close!(&wrench.angular, &vector![0., 0., 2.0 * robot.inertia[2]], 1e-12);
    }

    #[test]
    fn non_positive_dt_is_invalid_input() {
        let pid = BodyPid::new(&PidConfig::default(), &RobotConfig::default());
        let mut memory = PidState::new();
        let reference = DesiredTrajectory::hold(Pose::identity());

        for dt in [0.0, -0.01, Float::NAN] {
            let result = pid.compute_desired_wrench(
                &mut memory,
                &Pose::identity(),
                &Twist::zero(),
                &reference,
                dt,
            );
            assert!(matches!(result, Err(ControlError::InvalidInput { .. })));
        }
        assert_eq!(memory, PidState::new(), "rejected ticks leave memory untouched");
    }

    #[test]
    fn reset_clears_memory() {
        let pid = BodyPid::new(&PidConfig::default(), &RobotConfig::default());
        let mut memory = PidState::new();
        let reference = DesiredTrajectory::hold(Pose::from_translation(vector![0.1, 0., 0.5]));
        pid.compute_desired_wrench(
            &mut memory,
            &Pose::identity(),
            &Twist::zero(),
            &reference,
            0.01,
        )
        .unwrap();
        assert!(memory.prev_error().is_some());

        memory.reset();

        assert_eq!(memory, PidState::new());
    }
}
