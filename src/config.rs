//! Startup-only controller parameters.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes. Changing any parameter requires returning the control loop to
//! `Idle` (see `ControlLoop::reconfigure`).

use std::path::Path;

use na::{Matrix3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, robot::NUM_LEGS, types::Float, GRAVITY};

/// Mass properties and leg geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Total mass in kg, legs included
    pub mass: Float,
    /// Diagonal of the torso inertia about the COM, body frame
    pub inertia: [Float; 3],
    /// Hip x offset from the COM (front legs +, back legs -)
    pub hip_x: Float,
    /// Hip y offset from the COM (left legs +, right legs -)
    pub hip_y: Float,
    /// Lateral offset from the abduction axis to the leg plane
    pub abduction_offset: Float,
    pub upper_link: Float,
    pub lower_link: Float,
    /// Torso height above the ground when standing
    pub nominal_height: Float,
}

impl Default for RobotConfig {
    fn default() -> Self {
        RobotConfig {
            mass: 7.171,
            inertia: [0.0236, 0.265, 0.279],
            hip_x: 0.23,
            hip_y: 0.175,
            abduction_offset: 0.04,
            upper_link: 0.32,
            lower_link: 0.32,
            nominal_height: 0.45,
        }
    }
}

impl RobotConfig {
    pub fn inertia_matrix(&self) -> Matrix3<Float> {
        Matrix3::from_diagonal(&Vector3::from(self.inertia))
    }

    pub fn weight(&self) -> Float {
        self.mass * GRAVITY
    }
}

/// How the PID derivative term is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeMode {
    /// Use the measured twist error directly
    Velocity,
    /// Difference of successive pose errors over dt
    Difference,
}

/// Gains per axis, ordered x y z roll pitch yaw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: [Float; 6],
    pub ki: [Float; 6],
    pub kd: [Float; 6],
    /// Anti-windup bound on |∫error dt| per axis
    pub integral_limit: [Float; 6],
    pub derivative: DerivativeMode,
    /// Add mass * desired acceleration (and inertia * desired angular
    /// acceleration) to the output
    pub feed_forward: bool,
}

impl Default for PidConfig {
    fn default() -> Self {
        PidConfig {
            kp: [400., 400., 1500., 200., 200., 100.],
            ki: [20., 20., 100., 10., 10., 5.],
            kd: [40., 40., 80., 10., 10., 5.],
            integral_limit: [0.1, 0.1, 0.1, 0.2, 0.2, 0.2],
            derivative: DerivativeMode::Velocity,
            feed_forward: true,
        }
    }
}

impl PidConfig {
    /// All gains zero, feed-forward off
    pub fn zero() -> Self {
        PidConfig {
            kp: [0.; 6],
            ki: [0.; 6],
            kd: [0.; 6],
            feed_forward: false,
            ..PidConfig::default()
        }
    }
}

/// Weights and contact limits of the force allocation QP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpConfig {
    /// Diagonal of the wrench-tracking weight S, ordered fx fy fz τx τy τz
    pub s: [Float; 6],
    /// Diagonal of the per-foot force regularization R in the contact frame:
    /// tangent, tangent, normal
    pub r: [Float; 3],
    /// Per-leg scale applied to R, in leg order
    pub leg_scale: [Float; NUM_LEGS],
    /// Coulomb friction coefficient
    pub mu: Float,
    pub min_normal_force: Float,
    pub max_normal_force: Float,
}

impl Default for QpConfig {
    fn default() -> Self {
        QpConfig {
            s: [1., 1., 1., 10., 10., 10.],
            r: [1e-3, 1e-3, 1e-4],
            leg_scale: [1.; NUM_LEGS],
            mu: 0.8,
            min_normal_force: 0.0,
            max_normal_force: 133.0,
        }
    }
}

impl QpConfig {
    pub fn weight_s(&self) -> Vector6<Float> {
        Vector6::from(self.s)
    }

    pub fn weight_r(&self) -> Vector3<Float> {
        Vector3::from(self.r)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iter: u32,
    /// Hard deadline for one solve, in seconds. Keep it within one tick.
    ///
    /// The default fits release builds. An unoptimized build takes about as
    /// long as this for a four-foot solve and will fault on the deadline.
    pub time_limit: Float,
    /// Absolute and relative duality gap at which a solve counts as done.
    /// At a zero-force optimum every contact row is active with a zero
    /// multiplier, and the forces left over at stop scale with the square
    /// root of the gap.
    pub tol_gap_abs: Float,
    pub tol_gap_rel: Float,
    /// Primal and dual feasibility tolerance
    pub tol_feas: Float,
    /// Slack allowed when verifying the returned forces against the
    /// contact constraints, in newtons
    pub constraint_tolerance: Float,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iter: 50,
            time_limit: 0.002,
            tol_gap_abs: 1e-12,
            tol_gap_rel: 1e-12,
            tol_feas: 1e-10,
            constraint_tolerance: 1e-5,
        }
    }
}

/// What the control loop emits on a faulted tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    Zero,
    /// Repeat the last successful command, zero if there is none
    HoldPrevious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Control rate in Hz
    pub tick_rate: Float,
    /// Add the robot weight to the wrench the feet must produce
    pub gravity_compensation: bool,
    pub fallback: FallbackPolicy,
    /// Number of tick records kept by the telemetry log
    pub telemetry_capacity: usize,
    /// Stance legs whose Jacobian has a smallest singular value below this
    /// are treated as degenerate
    pub singular_threshold: Float,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            tick_rate: 500.0,
            gravity_compensation: true,
            fallback: FallbackPolicy::Zero,
            telemetry_capacity: 1000,
            singular_threshold: 1e-4,
        }
    }
}

impl LoopConfig {
    pub fn dt(&self) -> Float {
        1.0 / self.tick_rate
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub robot: RobotConfig,
    pub pid: PidConfig,
    pub qp: QpConfig,
    pub solver: SolverConfig,
    pub control: LoopConfig,
}

fn check_positive(field: &str, value: Float) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} must be positive", value)))
    }
}

fn check_non_negative(field: &str, value: Float) -> Result<(), ConfigError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{} must be non-negative", value),
        ))
    }
}

impl ControllerConfig {
    /// Load from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let robot = &self.robot;
        check_positive("robot.mass", robot.mass)?;
        for value in robot.inertia {
            check_positive("robot.inertia", value)?;
        }
        check_positive("robot.hip_x", robot.hip_x)?;
        check_positive("robot.hip_y", robot.hip_y)?;
        check_non_negative("robot.abduction_offset", robot.abduction_offset)?;
        check_positive("robot.upper_link", robot.upper_link)?;
        check_positive("robot.lower_link", robot.lower_link)?;
        check_positive("robot.nominal_height", robot.nominal_height)?;

        let pid = &self.pid;
        for value in pid.kp.iter().chain(pid.ki.iter()).chain(pid.kd.iter()) {
            check_non_negative("pid gains", *value)?;
        }
        for value in pid.integral_limit {
            check_non_negative("pid.integral_limit", value)?;
        }

        let qp = &self.qp;
        for value in qp.s {
            check_positive("qp.s", value)?;
        }
        for value in qp.r {
            check_positive("qp.r", value)?;
        }
        for value in qp.leg_scale {
            check_positive("qp.leg_scale", value)?;
        }
        check_non_negative("qp.mu", qp.mu)?;
        check_non_negative("qp.min_normal_force", qp.min_normal_force)?;
        check_positive("qp.max_normal_force", qp.max_normal_force)?;

        if self.solver.max_iter == 0 {
            return Err(ConfigError::invalid("solver.max_iter", "must be at least 1"));
        }
        check_positive("solver.time_limit", self.solver.time_limit)?;
        check_positive("solver.tol_gap_abs", self.solver.tol_gap_abs)?;
        check_positive("solver.tol_gap_rel", self.solver.tol_gap_rel)?;
        check_positive("solver.tol_feas", self.solver.tol_feas)?;
        check_non_negative(
            "solver.constraint_tolerance",
            self.solver.constraint_tolerance,
        )?;

        check_positive("control.tick_rate", self.control.tick_rate)?;
        check_non_negative("control.singular_threshold", self.control.singular_threshold)?;
        Ok(())
    }
}
