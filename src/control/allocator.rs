//! Distribution of a desired body wrench over the stance feet.
//!
//! Decision variables are the stacked ground-reaction forces
//! f = (f_1 ... f_k), world frame. The cost
//!     J(f) = ‖A f − W‖²_S + fᵀ R f
//! expands to ½ fᵀ [2(AᵀSA + R)] f + [−2AᵀSW]ᵀ f (constant dropped), where
//! A = [I ... I; [r_1]× ... [r_k]×] maps foot forces to the wrench about the
//! COM. Each foot carries a linearized friction pyramid in its contact frame
//! plus bounds on the normal force.

use std::time::Duration;

use itertools::izip;
use na::{DMatrix, DVector, Matrix3, Vector3, Vector6};
use tracing::{debug, trace};

use crate::{
    config::{QpConfig, SolverConfig},
    control::qp::{ClarabelSolver, Cone, QpProblem, QpSolver},
    error::ControlError,
    kinematics::Kinematics,
    robot::{ContactSet, FootForceSet, LegId, RobotState, NUM_LEGS},
    spatial::wrench::Wrench,
    types::Float,
    util::{skew_symmetric, tangent_basis},
};

/// Inequality rows per stance foot: four pyramid faces, two normal bounds
const ROWS_PER_FOOT: usize = 6;

/// Lever arms shorter than this count as a foot at the COM
const MIN_LEVER_ARM: Float = 1e-9;

/// A foot in stance, as seen by the allocator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StanceFoot {
    pub leg: LegId,
    /// Foot position relative to the COM, in world-aligned axes
    pub position: Vector3<Float>,
    /// Unit outward surface normal, world frame
    pub normal: Vector3<Float>,
}

/// Gather the stance feet of `state`, rotating body-frame foot positions into
/// world-aligned axes
pub fn stance_feet(
    kinematics: &dyn Kinematics,
    state: &RobotState,
    contacts: &ContactSet,
) -> Vec<StanceFoot> {
    let rotation = state.pose.rotation;
    LegId::ALL
        .into_iter()
        .filter_map(|leg| {
            contacts.contact(leg).map(|contact| StanceFoot {
                leg,
                position: rotation * kinematics.foot_position(&state.q, leg),
                normal: contact.normal,
            })
        })
        .collect()
}

/// Force regularization R. Axis weights are given in the contact frame
/// (tangent, tangent, normal) and scaled per leg.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceWeight {
    pub axes: Vector3<Float>,
    pub leg_scale: [Float; NUM_LEGS],
}

impl ForceWeight {
    pub fn new(qp: &QpConfig) -> Self {
        ForceWeight {
            axes: qp.weight_r(),
            leg_scale: qp.leg_scale,
        }
    }

    pub fn uniform(axes: Vector3<Float>) -> Self {
        ForceWeight {
            axes,
            leg_scale: [1.; NUM_LEGS],
        }
    }

    /// R_i = C diag(r) Cᵀ with C = [t1 t2 n]
    fn matrix(&self, foot: &StanceFoot) -> Matrix3<Float> {
        let (t1, t2) = tangent_basis(&foot.normal);
        let frame = Matrix3::from_columns(&[t1, t2, foot.normal]);
        frame * Matrix3::from_diagonal(&self.axes) * frame.transpose()
            * self.leg_scale[foot.leg.index()]
    }

    fn is_positive_definite(&self) -> bool {
        self.axes
            .iter()
            .chain(self.leg_scale.iter())
            .all(|w| *w > 0. && w.is_finite())
    }
}

/// Result of one allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub forces: FootForceSet,
    /// Wrench the allocated forces actually produce about the COM
    pub achieved_wrench: Wrench,
    pub iterations: u32,
    pub solve_time: Duration,
}

pub struct ForceAllocator {
    solver: Box<dyn QpSolver>,
    min_normal_force: Float,
    max_normal_force: Float,
    tolerance: Float,
}

impl ForceAllocator {
    pub fn new(qp: &QpConfig, solver: &SolverConfig) -> Self {
        Self::with_solver(Box::new(ClarabelSolver::new(solver)), qp, solver)
    }

    pub fn with_solver(solver: Box<dyn QpSolver>, qp: &QpConfig, config: &SolverConfig) -> Self {
        ForceAllocator {
            solver,
            min_normal_force: qp.min_normal_force,
            max_normal_force: qp.max_normal_force,
            tolerance: config.constraint_tolerance,
        }
    }

    /// Take new contact limits and solver budgets
    pub fn reconfigure(&mut self, qp: &QpConfig, config: &SolverConfig) {
        self.solver.configure(config);
        self.min_normal_force = qp.min_normal_force;
        self.max_normal_force = qp.max_normal_force;
        self.tolerance = config.constraint_tolerance;
    }

    /// Find ground-reaction forces on `stance` that best reproduce `desired`.
    ///
    /// Fails with `Infeasible` when no force set satisfies the contact
    /// constraints (including when there is no stance foot), and with
    /// `Unsolvable` when the solve does not finish within its budget or
    /// returns forces that violate the constraints.
    ///
    /// With a single stance foot, torque about the lever arm cannot be
    /// produced; that component of `desired` is weighted out of the cost.
    pub fn allocate(
        &self,
        desired: &Wrench,
        stance: &[StanceFoot],
        mu: Float,
        weight_s: &Vector6<Float>,
        weight_r: &ForceWeight,
    ) -> Result<Allocation, ControlError> {
        check_inputs(desired, stance, mu, weight_s, weight_r)?;

        if stance.is_empty() {
            return Err(ControlError::Infeasible {
                reason: "no stance feet".to_string(),
            });
        }
        if self.min_normal_force > self.max_normal_force {
            return Err(ControlError::Infeasible {
                reason: format!(
                    "min normal force {} exceeds max normal force {}",
                    self.min_normal_force, self.max_normal_force
                ),
            });
        }

        let wrench_map = wrench_map(stance);
        let S = tracking_weight(stance, weight_s);
        let problem = self.build_problem(desired, stance, mu, &wrench_map, &S, weight_r);
        trace!(
            variables = problem.num_variables(),
            constraints = problem.num_constraints(),
            "force allocation QP"
        );

        let solution = self.solver.solve(&problem)?;
        self.verify(&problem, &solution.x, stance)?;

        let mut forces = FootForceSet::new();
        for (foot, f) in izip!(stance, solution.x.as_slice().chunks_exact(3)) {
            forces.insert(foot.leg, Vector3::from_column_slice(f));
        }
        let achieved_wrench = Wrench::from_vector(&Vector6::from_iterator(
            (&wrench_map * &solution.x).iter().copied(),
        ));

        debug!(
            iterations = solution.iterations,
            solve_time_us = solution.solve_time.as_micros() as u64,
            "allocated forces on {} stance feet",
            stance.len()
        );

        Ok(Allocation {
            forces,
            achieved_wrench,
            iterations: solution.iterations,
            solve_time: solution.solve_time,
        })
    }

    fn build_problem(
        &self,
        desired: &Wrench,
        stance: &[StanceFoot],
        mu: Float,
        wrench_map: &DMatrix<Float>,
        S: &DMatrix<Float>,
        weight_r: &ForceWeight,
    ) -> QpProblem {
        let n = 3 * stance.len();
        let W = DVector::from_column_slice(desired.to_vector().as_slice());

        let mut R = DMatrix::zeros(n, n);
        for (i, foot) in stance.iter().enumerate() {
            R.fixed_view_mut::<3, 3>(3 * i, 3 * i)
                .copy_from(&weight_r.matrix(foot));
        }

        let AtS = wrench_map.transpose() * S;
        let mut P = (&AtS * wrench_map + R) * 2.0;
        // Symmetrize against round-off, only the upper triangle is read
        P = (&P + P.transpose()) * 0.5;
        let q = -(AtS * W) * 2.0;

        let m = ROWS_PER_FOOT * stance.len();
        let mut A = DMatrix::zeros(m, n);
        let mut b = DVector::zeros(m);
        for (i, foot) in stance.iter().enumerate() {
            let (t1, t2) = tangent_basis(&foot.normal);
            let nrm = foot.normal;
            let rows = [
                (t1 - mu * nrm, 0.),
                (-t1 - mu * nrm, 0.),
                (t2 - mu * nrm, 0.),
                (-t2 - mu * nrm, 0.),
                (-nrm, -self.min_normal_force),
                (nrm, self.max_normal_force),
            ];
            for (j, (row, bound)) in rows.iter().enumerate() {
                let r = ROWS_PER_FOOT * i + j;
                A.fixed_view_mut::<1, 3>(r, 3 * i)
                    .copy_from(&row.transpose());
                b[r] = *bound;
            }
        }

        QpProblem {
            P,
            q,
            A,
            b,
            cones: vec![Cone::Nonnegative(m)],
        }
    }

    /// Check the returned forces against every inequality row. The allowed
    /// slack grows with the force on that foot.
    fn verify(
        &self,
        problem: &QpProblem,
        x: &DVector<Float>,
        stance: &[StanceFoot],
    ) -> Result<(), ControlError> {
        if x.len() != problem.num_variables() {
            return Err(ControlError::Unsolvable {
                reason: format!(
                    "solver returned {} values for {} variables",
                    x.len(),
                    problem.num_variables()
                ),
            });
        }
        let residual = &problem.A * x - &problem.b;
        for (i, foot) in stance.iter().enumerate() {
            let magnitude = x.fixed_rows::<3>(3 * i).norm();
            let slack = self.tolerance * (1. + magnitude);
            let rows = residual.rows(ROWS_PER_FOOT * i, ROWS_PER_FOOT);
            if let Some(violation) = rows.iter().copied().find(|r| !(*r <= slack)) {
                return Err(ControlError::Unsolvable {
                    reason: format!(
                        "force on {} violates contact constraints by {:e}",
                        foot.leg, violation
                    ),
                });
            }
        }
        Ok(())
    }
}

fn check_inputs(
    desired: &Wrench,
    stance: &[StanceFoot],
    mu: Float,
    weight_s: &Vector6<Float>,
    weight_r: &ForceWeight,
) -> Result<(), ControlError> {
    if !desired.is_finite() {
        return Err(ControlError::invalid_input("desired wrench is not finite"));
    }
    if !(mu >= 0. && mu.is_finite()) {
        return Err(ControlError::invalid_input(format!(
            "friction coefficient must be non-negative, got {}",
            mu
        )));
    }
    if !weight_s.iter().all(|w| *w > 0. && w.is_finite()) {
        return Err(ControlError::invalid_input("S must be positive definite"));
    }
    if !weight_r.is_positive_definite() {
        return Err(ControlError::invalid_input("R must be positive definite"));
    }
    let mut seen = [false; NUM_LEGS];
    for foot in stance {
        if std::mem::replace(&mut seen[foot.leg.index()], true) {
            return Err(ControlError::invalid_input(format!(
                "leg {} listed twice in stance",
                foot.leg
            )));
        }
        let finite = foot
            .position
            .iter()
            .chain(foot.normal.iter())
            .all(|x| x.is_finite());
        if !finite || (foot.normal.norm() - 1.).abs() > 1e-6 {
            return Err(ControlError::invalid_input(format!(
                "bad contact geometry for {}",
                foot.leg
            )));
        }
    }
    Ok(())
}

/// 6 × 3k map from stacked foot forces to the wrench about the COM
fn wrench_map(stance: &[StanceFoot]) -> DMatrix<Float> {
    let mut A = DMatrix::zeros(6, 3 * stance.len());
    for (i, foot) in stance.iter().enumerate() {
        A.fixed_view_mut::<3, 3>(0, 3 * i)
            .copy_from(&Matrix3::identity());
        A.fixed_view_mut::<3, 3>(3, 3 * i)
            .copy_from(&skew_symmetric(&foot.position));
    }
    A
}

/// Block-diagonal S. With one stance foot the angular block is projected
/// onto the plane perpendicular to the lever arm, or zeroed when the foot is
/// at the COM.
fn tracking_weight(stance: &[StanceFoot], weight_s: &Vector6<Float>) -> DMatrix<Float> {
    let mut S = DMatrix::from_diagonal(&DVector::from_column_slice(weight_s.as_slice()));
    if let [foot] = stance {
        let s_angular = Matrix3::from_diagonal(&weight_s.fixed_rows::<3>(3).into_owned());
        let lever = foot.position.norm();
        let block = if lever < MIN_LEVER_ARM {
            Matrix3::zeros()
        } else {
            let axis = foot.position / lever;
            let projection = Matrix3::identity() - axis * axis.transpose();
            projection * s_angular * projection
        };
        S.fixed_view_mut::<3, 3>(3, 3).copy_from(&block);
    }
    S
}
