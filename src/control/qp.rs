//! Convex QP boundary.
//!
//! Problems are stated in Clarabel's conic form
//!     min ½ xᵀ P x + qᵀ x   s.t.   A x + s = b,  s ∈ K
//! where K is a product of zero cones (equalities) and nonnegative cones
//! (A x ≤ b), listed in the row order of A.

use std::time::{Duration, Instant};

use clarabel::{
    algebra::CscMatrix,
    solver::{
        DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
        SupportedConeT::{self, NonnegativeConeT, ZeroConeT},
    },
};
use na::{DMatrix, DVector};

use crate::{config::SolverConfig, error::QpError, types::Float};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cone {
    /// Rows constrained to equality
    Zero(usize),
    /// Rows constrained to A x ≤ b
    Nonnegative(usize),
}

impl Cone {
    pub fn dim(&self) -> usize {
        match self {
            Cone::Zero(n) | Cone::Nonnegative(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpProblem {
    /// Symmetric positive semi-definite cost matrix
    pub P: DMatrix<Float>,
    pub q: DVector<Float>,
    pub A: DMatrix<Float>,
    pub b: DVector<Float>,
    pub cones: Vec<Cone>,
}

impl QpProblem {
    pub fn unconstrained(P: DMatrix<Float>, q: DVector<Float>) -> Self {
        let n = q.len();
        QpProblem {
            P,
            q,
            A: DMatrix::zeros(0, n),
            b: DVector::zeros(0),
            cones: vec![],
        }
    }

    pub fn num_variables(&self) -> usize {
        self.q.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.b.len()
    }

    fn check(&self) -> Result<(), QpError> {
        let n = self.num_variables();
        let m = self.num_constraints();
        let bad = |reason: String| Err(QpError::BadProblem { reason });

        if self.P.shape() != (n, n) {
            return bad(format!("P is {:?}, expected ({}, {})", self.P.shape(), n, n));
        }
        if self.A.shape() != (m, n) {
            return bad(format!("A is {:?}, expected ({}, {})", self.A.shape(), m, n));
        }
        let cone_rows: usize = self.cones.iter().map(Cone::dim).sum();
        if cone_rows != m {
            return bad(format!("cones cover {} rows, A has {}", cone_rows, m));
        }
        let finite = self
            .P
            .iter()
            .chain(self.q.iter())
            .chain(self.A.iter())
            .chain(self.b.iter())
            .all(|x| x.is_finite());
        if !finite {
            return bad("non-finite problem data".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub x: DVector<Float>,
    pub iterations: u32,
    pub solve_time: Duration,
}

/// A bounded-time convex QP solver
pub trait QpSolver {
    fn solve(&self, problem: &QpProblem) -> Result<QpSolution, QpError>;

    /// Pick up new iteration and time budgets
    fn configure(&mut self, _config: &SolverConfig) {}
}

/// Interior-point solve with Clarabel, with an iteration cap and a
/// wall-clock deadline
#[derive(Debug, Clone, PartialEq)]
pub struct ClarabelSolver {
    max_iter: u32,
    time_limit: Float,
    tol_gap_abs: Float,
    tol_gap_rel: Float,
    tol_feas: Float,
}

impl ClarabelSolver {
    pub fn new(config: &SolverConfig) -> Self {
        ClarabelSolver {
            max_iter: config.max_iter,
            time_limit: config.time_limit,
            tol_gap_abs: config.tol_gap_abs,
            tol_gap_rel: config.tol_gap_rel,
            tol_feas: config.tol_feas,
        }
    }
}

impl QpSolver for ClarabelSolver {
    fn configure(&mut self, config: &SolverConfig) {
        *self = ClarabelSolver::new(config);
    }

    fn solve(&self, problem: &QpProblem) -> Result<QpSolution, QpError> {
        problem.check()?;
        let start = Instant::now();

        let P = dmatrix_to_csc_upper_tri(&problem.P);
        let A = dmatrix_to_csc(&problem.A);
        let cones: Vec<SupportedConeT<Float>> = problem
            .cones
            .iter()
            .map(|cone| match cone {
                Cone::Zero(n) => ZeroConeT(*n),
                Cone::Nonnegative(n) => NonnegativeConeT(*n),
            })
            .collect();

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iter)
            .time_limit(self.time_limit)
            .tol_gap_abs(self.tol_gap_abs)
            .tol_gap_rel(self.tol_gap_rel)
            .tol_feas(self.tol_feas)
            .verbose(false)
            .build()
            .map_err(|e| QpError::BadProblem {
                reason: format!("solver settings: {:?}", e),
            })?;

        let mut solver = DefaultSolver::new(
            &P,
            problem.q.as_slice(),
            &A,
            problem.b.as_slice(),
            &cones,
            settings,
        )
        .map_err(|e| QpError::BadProblem {
            reason: format!("{:?}", e),
        })?;
        solver.solve();

        let solution = &solver.solution;
        let status = format!("{:?}", solution.status);
        match solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {}
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                return Err(QpError::Infeasible { status });
            }
            _ => return Err(QpError::Unsolvable { status }),
        }

        let elapsed = start.elapsed();
        if elapsed.as_secs_f64() > self.time_limit {
            return Err(QpError::Unsolvable {
                status: format!("deadline exceeded after {:?}", elapsed),
            });
        }

        let x = DVector::from_column_slice(&solution.x);
        if x.iter().any(|v| !v.is_finite()) {
            return Err(QpError::Unsolvable {
                status: format!("{} with non-finite solution", status),
            });
        }

        Ok(QpSolution {
            x,
            iterations: solution.iterations,
            solve_time: elapsed,
        })
    }
}

/// Convert a dense matrix to Clarabel's compressed sparse column format
fn dmatrix_to_csc(m: &DMatrix<Float>) -> CscMatrix<Float> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = vec![];
    let mut nzval = vec![];

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0. {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Upper triangle of a symmetric matrix, which is all Clarabel reads of P
fn dmatrix_to_csc_upper_tri(m: &DMatrix<Float>) -> CscMatrix<Float> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = vec![];
    let mut nzval = vec![];

    for j in 0..ncols {
        for i in 0..nrows.min(j + 1) {
            let v = m[(i, j)];
            if v != 0. {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
