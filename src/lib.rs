//! Variable-order, variable-step multistep integrators for initial-value
//! problems: a Nordsieck-form Adams/BDF solver for ODEs `y' = f(t, y)` and a
//! fixed-leading-coefficient BDF solver for implicit DAEs `F(t, y, y') = 0`.
//!
//! Both solvers integrate optional quadrature variables alongside the state
//! and support forward sensitivity analysis in three coupling modes
//! (simultaneous corrector, staggered corrector, staggered one-at-a-time).
//! Linear algebra goes through the [`Vector`] abstraction and an opaque
//! Jacobian-solver interface; a dense finite-difference LU implementation is
//! provided as the reference backend.

pub mod dae;
pub mod error;
pub mod linear_solver;
pub mod ode;
pub mod scalar;
pub mod sens;
pub mod test_models;
pub mod tolerances;
pub mod vector;

pub use dae::{
    DaeQuadRhsFn, DaeSensResAllFn, DaeSensResFn, DaeSensResOneFn, DaeSolver, DaeStatistics,
    DaeSystem,
};
pub use error::{
    InterpolationError, LinearSolverFailure, ResidualError, SolveError, SolveStatus, Task,
};
pub use linear_solver::{
    dense::{DenseDaeSolver, DenseOdeSolver},
    DaeJacobianSolver, OdeJacobianSolver, SetupCause,
};
pub use ode::{
    Corrector, Method, OdeQuadRhsFn, OdeSensRhsAllFn, OdeSensRhsFn, OdeSensRhsOneFn, OdeSolver,
    OdeStatistics, OdeSystem,
};
pub use scalar::{IndexType, Scalar};
pub use sens::{SensErrCon, SensMethod, SensParam, SensParams};
pub use tolerances::{AbsTol, Tolerances};
pub use vector::Vector;
