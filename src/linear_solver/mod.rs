use crate::dae::DaeSystem;
use crate::error::LinearSolverFailure;
use crate::ode::OdeSystem;
use crate::{IndexType, Scalar};

pub mod dense;

/// Why the stepper is requesting a Jacobian setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupCause {
    /// First setup, or the previous corrector pass succeeded.
    NoFailure,
    /// The corrector failed with Jacobian data that may be stale.
    BadJacobian,
    /// The corrector failed for another reason (e.g. after a step-size
    /// change).
    Other,
}

/// Linear solver driving the Newton corrector of the ODE stepper. The
/// system matrix is `P ≈ I - gamma * df/dy`, refreshed on `setup` and
/// applied by `solve`.
///
/// `setup` must report whether its Jacobian data are current on return; an
/// implementation that re-evaluates the Jacobian reports `true`
/// unconditionally so the stepper cannot loop on stale-data retries.
pub trait OdeJacobianSolver<Eqn: OdeSystem> {
    fn init(&mut self, neq: IndexType) -> Result<(), LinearSolverFailure>;

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &mut self,
        eqn: &mut Eqn,
        t: Eqn::T,
        y: &Eqn::V,
        fy: &Eqn::V,
        gamma: Eqn::T,
        ewt: &Eqn::V,
        cause: SetupCause,
    ) -> Result<bool, LinearSolverFailure>;

    /// Solve `P x = b` in place.
    fn solve(
        &mut self,
        eqn: &mut Eqn,
        b: &mut Eqn::V,
        ewt: &Eqn::V,
        y: &Eqn::V,
        fy: &Eqn::V,
    ) -> Result<(), LinearSolverFailure>;
}

/// Linear solver driving the Newton corrector of the DAE stepper. The
/// system matrix is `P ≈ dF/dy + cj * dF/dy'`.
pub trait DaeJacobianSolver<Eqn: DaeSystem> {
    fn init(&mut self, neq: IndexType) -> Result<(), LinearSolverFailure>;

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &mut self,
        eqn: &mut Eqn,
        t: Eqn::T,
        y: &Eqn::V,
        yp: &Eqn::V,
        res: &Eqn::V,
        cj: Eqn::T,
        h: Eqn::T,
        ewt: &Eqn::V,
        cause: SetupCause,
    ) -> Result<bool, LinearSolverFailure>;

    /// Solve `P x = b` in place.
    #[allow(clippy::too_many_arguments)]
    fn solve(
        &mut self,
        eqn: &mut Eqn,
        b: &mut Eqn::V,
        ewt: &Eqn::V,
        y: &Eqn::V,
        yp: &Eqn::V,
        res: &Eqn::V,
    ) -> Result<(), LinearSolverFailure>;
}

/// Counters shared by the dense implementations.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LinearSolverStatistics {
    pub jacobian_evals: usize,
    pub rhs_evals: usize,
}

pub(crate) fn srur<T: Scalar>() -> T {
    T::EPSILON.sqrt()
}
