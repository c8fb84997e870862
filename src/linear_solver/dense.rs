use nalgebra::{DMatrix, DVector, Dyn};

use super::{srur, LinearSolverStatistics, SetupCause};
use crate::dae::DaeSystem;
use crate::error::{LinearSolverFailure, ResidualError};
use crate::ode::OdeSystem;
use crate::{DaeJacobianSolver, IndexType, OdeJacobianSolver, Scalar};

type Lu<T> = nalgebra::linalg::LU<T, Dyn, Dyn>;

/// Dense direct solver for the ODE Newton matrix `I - gamma * df/dy`, with
/// the Jacobian approximated column by column from forward difference
/// quotients of the right-hand side.
pub struct DenseOdeSolver<T: Scalar> {
    jac: DMatrix<T>,
    lu: Option<Lu<T>>,
    ftemp: DVector<T>,
    ytemp: DVector<T>,
    stats: LinearSolverStatistics,
}

impl<T: Scalar> Default for DenseOdeSolver<T> {
    fn default() -> Self {
        Self {
            jac: DMatrix::zeros(0, 0),
            lu: None,
            ftemp: DVector::zeros(0),
            ytemp: DVector::zeros(0),
            stats: LinearSolverStatistics::default(),
        }
    }
}

impl<T: Scalar> DenseOdeSolver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_statistics(&self) -> &LinearSolverStatistics {
        &self.stats
    }
}

impl<T: Scalar, Eqn> OdeJacobianSolver<Eqn> for DenseOdeSolver<T>
where
    Eqn: OdeSystem<T = T, V = DVector<T>>,
{
    fn init(&mut self, neq: IndexType) -> Result<(), LinearSolverFailure> {
        self.jac = DMatrix::zeros(neq, neq);
        self.ftemp = DVector::zeros(neq);
        self.ytemp = DVector::zeros(neq);
        self.lu = None;
        Ok(())
    }

    fn setup(
        &mut self,
        eqn: &mut Eqn,
        t: T,
        y: &DVector<T>,
        fy: &DVector<T>,
        gamma: T,
        ewt: &DVector<T>,
        _cause: SetupCause,
    ) -> Result<bool, LinearSolverFailure> {
        let n = y.nrows();
        let srur = srur::<T>();
        self.ytemp.copy_from(y);
        for j in 0..n {
            let yj = y[j];
            let inc = srur * yj.abs().max(T::one() / ewt[j]);
            self.ytemp[j] = yj + inc;
            eqn.rhs(t, &self.ytemp, &mut self.ftemp);
            self.stats.rhs_evals += 1;
            self.ytemp[j] = yj;
            let rinc = T::one() / inc;
            for i in 0..n {
                self.jac[(i, j)] = rinc * (self.ftemp[i] - fy[i]);
            }
        }
        self.stats.jacobian_evals += 1;

        // M = I - gamma * J
        let mut m = self.jac.clone();
        m *= -gamma;
        for i in 0..n {
            m[(i, i)] += T::one();
        }
        let lu = Lu::new(m);
        if !lu.is_invertible() {
            self.lu = None;
            return Err(LinearSolverFailure::Recoverable);
        }
        self.lu = Some(lu);
        Ok(true)
    }

    fn solve(
        &mut self,
        _eqn: &mut Eqn,
        b: &mut DVector<T>,
        _ewt: &DVector<T>,
        _y: &DVector<T>,
        _fy: &DVector<T>,
    ) -> Result<(), LinearSolverFailure> {
        match &self.lu {
            Some(lu) => {
                if lu.solve_mut(b) {
                    Ok(())
                } else {
                    Err(LinearSolverFailure::Recoverable)
                }
            }
            None => Err(LinearSolverFailure::Fatal),
        }
    }
}

/// Dense direct solver for the DAE Newton matrix `dF/dy + cj * dF/dy'`,
/// approximated by simultaneous difference-quotient perturbations of `y`
/// and `y'`.
pub struct DenseDaeSolver<T: Scalar> {
    lu: Option<Lu<T>>,
    rtemp: DVector<T>,
    ytemp: DVector<T>,
    yptemp: DVector<T>,
    stats: LinearSolverStatistics,
}

impl<T: Scalar> Default for DenseDaeSolver<T> {
    fn default() -> Self {
        Self {
            lu: None,
            rtemp: DVector::zeros(0),
            ytemp: DVector::zeros(0),
            yptemp: DVector::zeros(0),
            stats: LinearSolverStatistics::default(),
        }
    }
}

impl<T: Scalar> DenseDaeSolver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_statistics(&self) -> &LinearSolverStatistics {
        &self.stats
    }
}

impl<T: Scalar, Eqn> DaeJacobianSolver<Eqn> for DenseDaeSolver<T>
where
    Eqn: DaeSystem<T = T, V = DVector<T>>,
{
    fn init(&mut self, neq: IndexType) -> Result<(), LinearSolverFailure> {
        self.rtemp = DVector::zeros(neq);
        self.ytemp = DVector::zeros(neq);
        self.yptemp = DVector::zeros(neq);
        self.lu = None;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &mut self,
        eqn: &mut Eqn,
        t: T,
        y: &DVector<T>,
        yp: &DVector<T>,
        res: &DVector<T>,
        cj: T,
        h: T,
        ewt: &DVector<T>,
        _cause: SetupCause,
    ) -> Result<bool, LinearSolverFailure> {
        let n = y.nrows();
        let srur = srur::<T>();
        let mut m = DMatrix::<T>::zeros(n, n);
        self.ytemp.copy_from(y);
        self.yptemp.copy_from(yp);
        for j in 0..n {
            let yj = y[j];
            let ypj = yp[j];
            let mut inc = srur * yj.abs().max((h * ypj).abs().max(T::one() / ewt[j]));
            if h * ypj < T::zero() {
                inc = -inc;
            }
            inc = (yj + inc) - yj;
            self.ytemp[j] = yj + inc;
            self.yptemp[j] = ypj + cj * inc;
            let ret = eqn.residual(t, &self.ytemp, &self.yptemp, &mut self.rtemp);
            self.stats.rhs_evals += 1;
            self.ytemp[j] = yj;
            self.yptemp[j] = ypj;
            match ret {
                Ok(()) => {}
                Err(ResidualError::Recoverable) => return Err(LinearSolverFailure::Recoverable),
                Err(ResidualError::Fatal) => return Err(LinearSolverFailure::Fatal),
            }
            let rinc = T::one() / inc;
            for i in 0..n {
                m[(i, j)] = rinc * (self.rtemp[i] - res[i]);
            }
        }
        self.stats.jacobian_evals += 1;

        let lu = Lu::new(m);
        if !lu.is_invertible() {
            self.lu = None;
            return Err(LinearSolverFailure::Recoverable);
        }
        self.lu = Some(lu);
        Ok(true)
    }

    fn solve(
        &mut self,
        _eqn: &mut Eqn,
        b: &mut DVector<T>,
        _ewt: &DVector<T>,
        _y: &DVector<T>,
        _yp: &DVector<T>,
        _res: &DVector<T>,
    ) -> Result<(), LinearSolverFailure> {
        match &self.lu {
            Some(lu) => {
                if lu.solve_mut(b) {
                    Ok(())
                } else {
                    Err(LinearSolverFailure::Recoverable)
                }
            }
            None => Err(LinearSolverFailure::Fatal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector;

    type Vcpu = DVector<f64>;

    struct Decay;

    impl OdeSystem for Decay {
        type T = f64;
        type V = Vcpu;

        fn nstates(&self) -> usize {
            2
        }

        fn rhs(&mut self, _t: f64, y: &Vcpu, ydot: &mut Vcpu) {
            ydot[0] = -y[0];
            ydot[1] = -2.0 * y[1];
        }
    }

    #[test]
    fn test_dense_ode_setup_solve() {
        let mut eqn = Decay;
        let mut ls = DenseOdeSolver::<f64>::new();
        OdeJacobianSolver::<Decay>::init(&mut ls, 2).unwrap();
        let y = Vcpu::from_vec(vec![1.0, 1.0]);
        let mut fy = Vcpu::zeros(2);
        eqn.rhs(0.0, &y, &mut fy);
        let ewt = Vcpu::from_element(2, 1e6);
        let gamma = 0.1;
        let current = ls
            .setup(&mut eqn, 0.0, &y, &fy, gamma, &ewt, SetupCause::NoFailure)
            .unwrap();
        assert!(current);
        // (I - gamma J) x = b with J = diag(-1, -2)
        let mut b = Vcpu::from_vec(vec![1.1, 2.4]);
        ls.solve(&mut eqn, &mut b, &ewt, &y, &fy).unwrap();
        b.assert_eq(&Vcpu::from_vec(vec![1.0, 2.0]), 1e-6);
    }
}
