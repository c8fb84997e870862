//! Variable-order, variable-step Adams and BDF solver for ODEs
//! `y' = f(t, y)` in Nordsieck form.
//!
//! The history is the scaled-derivative array `zn[j] = h^j/j! * y^(j)(tn)`;
//! prediction is the Pascal-triangle shift and dense output is a Horner
//! evaluation in `(t - tn)/h`. The corrector is either functional iteration
//! or a modified Newton method driven by an opaque Jacobian-solver
//! interface. Quadratures and forward sensitivities ride on the same
//! stepper.

use log::{error, warn};
use nalgebra::ComplexField;
use num_traits::identities::{One, Zero};
use serde::Serialize;

use crate::error::{SolveError, SolveStatus, Task};
use crate::sens::{default_sens_tolerances, SensErrCon, SensMethod, SensParams};
use crate::tolerances::update_sens_weights;
use crate::vector::norm_update;
use crate::{
    IndexType, InterpolationError, OdeJacobianSolver, Scalar, Tolerances, Vector,
};

mod coeffs;
mod sens_rhs;
mod step;

/// Explicit system `y' = f(t, y)` advanced by [`OdeSolver`].
///
/// The right-hand side cannot fail; problems where evaluation can break
/// down belong to the DAE solver's residual form. Systems with sensitivity
/// parameters expose them through `nparams`/`param`/`set_param`.
pub trait OdeSystem {
    type T: Scalar;
    type V: Vector<T = Self::T>;

    fn nstates(&self) -> IndexType;

    fn rhs(&mut self, t: Self::T, y: &Self::V, ydot: &mut Self::V);

    fn nparams(&self) -> IndexType {
        0
    }

    fn param(&self, _i: IndexType) -> Self::T {
        Self::T::zero()
    }

    fn set_param(&mut self, _i: IndexType, _value: Self::T) {}
}

/// Multistep family. Adams-Moulton runs at orders 1..=12 for nonstiff
/// problems; BDF at orders 1..=5 for stiff ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Adams,
    Bdf,
}

impl Method {
    pub(crate) fn default_max_order(self) -> usize {
        match self {
            Method::Adams => 12,
            Method::Bdf => 5,
        }
    }
}

/// Corrector kind: fixed-point functional iteration (no linear algebra) or
/// modified Newton through a Jacobian solver.
pub enum Corrector<Eqn: OdeSystem> {
    Functional,
    Newton(Box<dyn OdeJacobianSolver<Eqn>>),
}

/// Quadrature right-hand side `q' = fQ(t, y)`.
pub type OdeQuadRhsFn<V> = Box<dyn FnMut(<V as Vector>::T, &V, &mut V)>;

/// All-at-once sensitivity right-hand side
/// `(t, y, ydot, yS[], ySdot[])`.
pub type OdeSensRhsAllFn<V> =
    Box<dyn FnMut(<V as Vector>::T, &V, &V, &[V], &mut [V])>;

/// One-at-a-time sensitivity right-hand side
/// `(t, y, ydot, is, yS, ySdot)`.
pub type OdeSensRhsOneFn<V> =
    Box<dyn FnMut(<V as Vector>::T, &V, &V, IndexType, &V, &mut V)>;

/// How sensitivity right-hand sides are produced.
pub enum OdeSensRhsFn<V: Vector> {
    All(OdeSensRhsAllFn<V>),
    One(OdeSensRhsOneFn<V>),
    /// Approximate by difference quotients of the state right-hand side.
    DiffQuotient,
}

pub(crate) struct OdeQuad<V: Vector> {
    pub rhs: OdeQuadRhsFn<V>,
    pub errcon: bool,
    pub tol: Tolerances<V>,
    pub zn: Vec<V>,
    pub acor: V,
    pub ewt: V,
    pub tempv: V,
}

pub(crate) struct OdeSens<V: Vector> {
    pub params: SensParams<V::T>,
    pub ism: SensMethod,
    pub rhs_fn: OdeSensRhsFn<V>,
    pub errcon: bool,
    pub tols: Vec<Tolerances<V>>,
    pub rhomax: V::T,
    pub maxcor: usize,
    pub zn: Vec<Vec<V>>, // indexed [order][sensitivity]
    pub y: Vec<V>,       // current iterates
    pub acor: Vec<V>,
    pub ewt: Vec<V>,
    pub sdot: Vec<V>,
    pub tempv: V,
    pub ftemp: V,
    pub ss: V::T,
    pub ss1: Vec<V::T>,
}

impl<V: Vector> OdeSens<V> {
    pub fn ns(&self) -> usize {
        self.params.ns()
    }
}

/// Cumulative counters, all monotone non-decreasing across steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OdeStatistics {
    pub num_steps: usize,
    pub num_rhs_evals: usize,
    pub num_lin_setups: usize,
    pub num_nonlin_iters: usize,
    pub num_nonlin_conv_fails: usize,
    pub num_err_test_fails: usize,
    pub num_quad_rhs_evals: usize,
    pub num_quad_err_test_fails: usize,
    pub num_sens_rhs_evals: usize,
    pub num_rhs_evals_sens: usize,
    pub num_sens_lin_setups: usize,
    pub num_sens_nonlin_iters: usize,
    pub num_sens_nonlin_conv_fails: usize,
    pub num_sens_err_test_fails: usize,
    pub num_sens_nonlin_iters_per: Vec<usize>,
    pub num_sens_nonlin_conv_fails_per: Vec<usize>,
    pub num_sens_err_test_fails_per: Vec<usize>,
    pub num_order_reductions_stab_lim: usize,
    pub initial_step_size: f64,
    pub last_step_size: f64,
    pub current_step_size: f64,
    pub last_order: usize,
    pub current_order: usize,
}

pub(crate) const DEFAULT_MXSTEP: usize = 500;
pub(crate) const MXNCF: usize = 10;
pub(crate) const MXNEF: usize = 7;
pub(crate) const MXNEF1: usize = 3;
pub(crate) const SMALL_NEF: usize = 2;
pub(crate) const SMALL_NST: usize = 10;
pub(crate) const LONG_WAIT: usize = 10;
pub(crate) const DEFAULT_MAXCOR: usize = 4;
pub(crate) const EPCON: f64 = 0.33;

/// Nordsieck-form Adams/BDF integrator for `y' = f(t, y)`.
pub struct OdeSolver<Eqn: OdeSystem> {
    pub(crate) eqn: Eqn,
    pub(crate) method: Method,
    pub(crate) corrector: Corrector<Eqn>,
    pub(crate) tol: Tolerances<Eqn::V>,

    // configuration
    pub(crate) qmax: usize,
    pub(crate) mxstep: usize,
    pub(crate) hmax_inv: Eqn::T,
    pub(crate) hmin: Eqn::T,
    pub(crate) hin: Eqn::T,
    pub(crate) tstop: Option<Eqn::T>,
    pub(crate) maxcor: usize,
    pub(crate) maxncf: usize,
    pub(crate) maxnef: usize,
    pub(crate) eps_newt: Eqn::T,
    pub(crate) toldel: Eqn::T,
    pub(crate) stab_lim_det: bool,

    // step and history state
    pub(crate) zn: Vec<Eqn::V>,
    pub(crate) tn: Eqn::T,
    pub(crate) h: Eqn::T,
    pub(crate) hprime: Eqn::T,
    pub(crate) hscale: Eqn::T,
    pub(crate) eta: Eqn::T,
    pub(crate) hu: Eqn::T,
    pub(crate) h0u: Eqn::T,
    pub(crate) q: usize,
    pub(crate) qprime: usize,
    pub(crate) qu: usize,
    pub(crate) qwait: usize,
    pub(crate) l: Vec<Eqn::T>,
    pub(crate) tau: Vec<Eqn::T>,
    pub(crate) tq: Vec<Eqn::T>,
    pub(crate) rl1: Eqn::T,
    pub(crate) gamma: Eqn::T,
    pub(crate) gammap: Eqn::T,
    pub(crate) gamrat: Eqn::T,
    pub(crate) etamax: Eqn::T,
    pub(crate) etaqm1: Eqn::T,
    pub(crate) etaq: Eqn::T,
    pub(crate) etaqp1: Eqn::T,
    pub(crate) saved_tq5: Eqn::T,
    pub(crate) jcur: bool,
    pub(crate) force_setup: bool,
    pub(crate) ss: Eqn::T,
    pub(crate) tolsf: Eqn::T,

    pub(crate) ewt: Eqn::V,
    pub(crate) y: Eqn::V,
    pub(crate) acor: Eqn::V,
    pub(crate) tempv: Eqn::V,
    pub(crate) ftemp: Eqn::V,

    pub(crate) quad: Option<OdeQuad<Eqn::V>>,
    pub(crate) sens: Option<OdeSens<Eqn::V>>,

    pub(crate) stats: OdeStatistics,
    pub(crate) tretp: Eqn::T,
    pub(crate) first_call_done: bool,
}

impl<Eqn: OdeSystem> OdeSolver<Eqn> {
    /// Allocate a solver with the given multistep family, corrector, and
    /// initial condition.
    pub fn new(
        eqn: Eqn,
        method: Method,
        mut corrector: Corrector<Eqn>,
        t0: Eqn::T,
        y0: &Eqn::V,
        tol: Tolerances<Eqn::V>,
    ) -> Result<Self, SolveError> {
        let n = eqn.nstates();
        if n == 0 {
            return Err(SolveError::IllInput("problem has no states".to_string()));
        }
        if y0.len() != n {
            return Err(SolveError::IllInput(format!(
                "initial condition has {} components but the system has {}",
                y0.len(),
                n
            )));
        }
        tol.validate(n).map_err(SolveError::IllInput)?;

        if let Corrector::Newton(ls) = &mut corrector {
            ls.init(n)
                .map_err(|_| SolveError::IllInput("linear solver init failed".to_string()))?;
        }

        let qmax = method.default_max_order();
        let zero = Eqn::V::zeros(n);
        let mut zn: Vec<Eqn::V> = (0..=qmax).map(|_| zero.clone()).collect();
        zn[0].copy_from(y0);

        let mut ewt = zero.clone();
        if !tol.update_weights(y0, &mut ewt) {
            return Err(SolveError::IllInput(
                "error weights are not strictly positive at the initial condition".to_string(),
            ));
        }

        let eps_newt = Eqn::T::from(EPCON);
        Ok(Self {
            eqn,
            method,
            corrector,
            tol,
            qmax,
            mxstep: DEFAULT_MXSTEP,
            hmax_inv: Eqn::T::zero(),
            hmin: Eqn::T::zero(),
            hin: Eqn::T::zero(),
            tstop: None,
            maxcor: DEFAULT_MAXCOR,
            maxncf: MXNCF,
            maxnef: MXNEF,
            eps_newt,
            toldel: Eqn::T::from(1e-4) * eps_newt,
            stab_lim_det: false,
            zn,
            tn: t0,
            h: Eqn::T::zero(),
            hprime: Eqn::T::zero(),
            hscale: Eqn::T::zero(),
            eta: Eqn::T::one(),
            hu: Eqn::T::zero(),
            h0u: Eqn::T::zero(),
            q: 1,
            qprime: 1,
            qu: 0,
            qwait: 2,
            l: vec![Eqn::T::zero(); qmax + 2],
            tau: vec![Eqn::T::zero(); qmax + 2],
            tq: vec![Eqn::T::zero(); 6],
            rl1: Eqn::T::one(),
            gamma: Eqn::T::zero(),
            gammap: Eqn::T::zero(),
            gamrat: Eqn::T::one(),
            etamax: Eqn::T::from(1e4),
            etaqm1: Eqn::T::zero(),
            etaq: Eqn::T::zero(),
            etaqp1: Eqn::T::zero(),
            saved_tq5: Eqn::T::one(),
            jcur: false,
            force_setup: false,
            ss: Eqn::T::from(20.0),
            tolsf: Eqn::T::one(),
            ewt,
            y: zero.clone(),
            acor: zero.clone(),
            tempv: zero.clone(),
            ftemp: zero,
            quad: None,
            sens: None,
            stats: OdeStatistics::default(),
            tretp: t0,
            first_call_done: false,
        })
    }

    /// Reinitialize for a new initial condition of the same size.
    pub fn reinit(&mut self, t0: Eqn::T, y0: &Eqn::V) -> Result<(), SolveError> {
        if y0.len() != self.eqn.nstates() {
            return Err(SolveError::IllInput(
                "reinit state size differs from the allocated size".to_string(),
            ));
        }
        for z in self.zn.iter_mut() {
            z.fill(Eqn::T::zero());
        }
        self.zn[0].copy_from(y0);
        if !self.tol.update_weights(y0, &mut self.ewt) {
            return Err(SolveError::IllInput(
                "error weights are not strictly positive at the initial condition".to_string(),
            ));
        }
        self.tn = t0;
        self.tretp = t0;
        self.h = Eqn::T::zero();
        self.hprime = Eqn::T::zero();
        self.hscale = Eqn::T::zero();
        self.eta = Eqn::T::one();
        self.hu = Eqn::T::zero();
        self.h0u = Eqn::T::zero();
        self.q = 1;
        self.qprime = 1;
        self.qu = 0;
        self.qwait = 2;
        self.etamax = Eqn::T::from(1e4);
        self.jcur = false;
        self.force_setup = false;
        self.first_call_done = false;
        let ns = self.sens.as_ref().map_or(0, |s| s.ns());
        self.stats = OdeStatistics {
            num_sens_nonlin_iters_per: vec![0; ns],
            num_sens_nonlin_conv_fails_per: vec![0; ns],
            num_sens_err_test_fails_per: vec![0; ns],
            ..OdeStatistics::default()
        };
        Ok(())
    }

    /// Attach quadrature variables `q' = fQ(t, y)` with initial value `q0`.
    pub fn enable_quadrature(
        &mut self,
        rhs: OdeQuadRhsFn<Eqn::V>,
        q0: &Eqn::V,
        errcon: SensErrCon,
        tol: Tolerances<Eqn::V>,
    ) -> Result<(), SolveError> {
        if self.first_call_done {
            return Err(SolveError::IllInput(
                "subsystems must be enabled before the first solve call".to_string(),
            ));
        }
        if q0.is_empty() {
            return Err(SolveError::IllInput(
                "quadrature initial value is empty".to_string(),
            ));
        }
        tol.validate(q0.len()).map_err(SolveError::IllInput)?;
        let zero = Eqn::V::zeros(q0.len());
        let mut zn: Vec<Eqn::V> = (0..=self.qmax).map(|_| zero.clone()).collect();
        zn[0].copy_from(q0);
        let mut ewt = zero.clone();
        if !tol.update_weights(q0, &mut ewt) {
            return Err(SolveError::IllInput(
                "quadrature error weights are not strictly positive".to_string(),
            ));
        }
        self.quad = Some(OdeQuad {
            rhs,
            errcon: errcon.is_full(),
            tol,
            zn,
            acor: zero.clone(),
            ewt,
            tempv: zero,
        });
        Ok(())
    }

    /// Reset quadrature history to a new initial value.
    pub fn reinit_quadrature(&mut self, q0: &Eqn::V) -> Result<(), SolveError> {
        let quad = self
            .quad
            .as_mut()
            .ok_or_else(|| SolveError::IllInput("quadrature not enabled".to_string()))?;
        if q0.len() != quad.acor.len() {
            return Err(SolveError::IllInput(
                "quadrature size differs from the allocated size".to_string(),
            ));
        }
        for z in quad.zn.iter_mut() {
            z.fill(Eqn::T::zero());
        }
        quad.zn[0].copy_from(q0);
        Ok(())
    }

    /// Attach forward sensitivity analysis over the selected parameters.
    /// Staggered-1 coupling requires the one-at-a-time right-hand side
    /// (the difference-quotient fallback provides it).
    #[allow(clippy::too_many_arguments)]
    pub fn enable_sensitivity(
        &mut self,
        params: SensParams<Eqn::T>,
        ism: SensMethod,
        rhs_fn: OdeSensRhsFn<Eqn::V>,
        ys0: &[Eqn::V],
        errcon: SensErrCon,
        tols: Option<Vec<Tolerances<Eqn::V>>>,
    ) -> Result<(), SolveError> {
        if self.first_call_done {
            return Err(SolveError::IllInput(
                "subsystems must be enabled before the first solve call".to_string(),
            ));
        }
        params
            .validate(self.eqn.nparams())
            .map_err(SolveError::IllInput)?;
        let ns = params.ns();
        if ys0.len() != ns {
            return Err(SolveError::IllInput(format!(
                "expected {} initial sensitivity vectors, got {}",
                ns,
                ys0.len()
            )));
        }
        let n = self.eqn.nstates();
        for v in ys0.iter() {
            if v.len() != n {
                return Err(SolveError::IllInput(
                    "sensitivity vectors must match the state size".to_string(),
                ));
            }
        }
        if ism == SensMethod::Staggered1 && matches!(rhs_fn, OdeSensRhsFn::All(_)) {
            return Err(SolveError::IllInput(
                "staggered-1 coupling requires the one-at-a-time sensitivity right-hand side"
                    .to_string(),
            ));
        }
        let tols = match tols {
            Some(tols) => {
                if tols.len() != ns {
                    return Err(SolveError::IllInput(
                        "one tolerance set per sensitivity is required".to_string(),
                    ));
                }
                for tol in &tols {
                    tol.validate(n).map_err(SolveError::IllInput)?;
                }
                tols
            }
            None => default_sens_tolerances(&self.tol, &params),
        };

        let zero = Eqn::V::zeros(n);
        let mut zn: Vec<Vec<Eqn::V>> = (0..=self.qmax)
            .map(|_| (0..ns).map(|_| zero.clone()).collect())
            .collect();
        for is in 0..ns {
            zn[0][is].copy_from(&ys0[is]);
        }
        let mut ewt: Vec<Eqn::V> = (0..ns).map(|_| zero.clone()).collect();
        if !update_sens_weights(&tols, ys0, &mut ewt) {
            return Err(SolveError::IllInput(
                "sensitivity error weights are not strictly positive".to_string(),
            ));
        }

        self.stats.num_sens_nonlin_iters_per = vec![0; ns];
        self.stats.num_sens_nonlin_conv_fails_per = vec![0; ns];
        self.stats.num_sens_err_test_fails_per = vec![0; ns];
        self.sens = Some(OdeSens {
            params,
            ism,
            rhs_fn,
            errcon: errcon.is_full(),
            tols,
            rhomax: Eqn::T::zero(),
            maxcor: DEFAULT_MAXCOR,
            zn,
            y: (0..ns).map(|_| zero.clone()).collect(),
            acor: (0..ns).map(|_| zero.clone()).collect(),
            ewt,
            sdot: (0..ns).map(|_| zero.clone()).collect(),
            tempv: zero.clone(),
            ftemp: zero,
            ss: Eqn::T::from(20.0),
            ss1: vec![Eqn::T::from(20.0); ns],
        });
        Ok(())
    }

    /// Reset sensitivity history to new initial values.
    pub fn reinit_sensitivity(&mut self, ys0: &[Eqn::V]) -> Result<(), SolveError> {
        let sens = self
            .sens
            .as_mut()
            .ok_or_else(|| SolveError::IllInput("sensitivity not enabled".to_string()))?;
        if ys0.len() != sens.ns() {
            return Err(SolveError::IllInput(
                "sensitivity count differs from the allocated count".to_string(),
            ));
        }
        for (is, y0) in ys0.iter().enumerate() {
            sens.zn[0][is].copy_from(y0);
            for j in 1..sens.zn.len() {
                sens.zn[j][is].fill(Eqn::T::zero());
            }
        }
        Ok(())
    }

    // ---- configuration -------------------------------------------------

    /// Reduce the maximum method order below the family default.
    pub fn set_max_order(&mut self, qmax: usize) -> Result<(), SolveError> {
        if qmax == 0 || qmax > self.method.default_max_order() {
            return Err(SolveError::IllInput(format!(
                "max order must be in [1, {}]",
                self.method.default_max_order()
            )));
        }
        if qmax > self.qmax {
            return Err(SolveError::IllInput(
                "max order cannot be raised after allocation".to_string(),
            ));
        }
        self.qmax = qmax;
        Ok(())
    }

    /// Per-call internal step budget (default 500).
    pub fn set_max_steps(&mut self, mxstep: usize) {
        self.mxstep = mxstep;
    }

    /// Initial step size; zero means compute one from the problem.
    pub fn set_init_step(&mut self, h0: Eqn::T) {
        self.hin = h0;
    }

    /// Upper bound on `|h|`; zero removes the bound.
    pub fn set_max_step(&mut self, hmax: Eqn::T) -> Result<(), SolveError> {
        if hmax < Eqn::T::zero() {
            return Err(SolveError::IllInput("hmax must be non-negative".to_string()));
        }
        self.hmax_inv = if hmax == Eqn::T::zero() {
            Eqn::T::zero()
        } else {
            Eqn::T::one() / hmax
        };
        Ok(())
    }

    /// Lower bound on `|h|`.
    pub fn set_min_step(&mut self, hmin: Eqn::T) -> Result<(), SolveError> {
        if hmin < Eqn::T::zero() {
            return Err(SolveError::IllInput("hmin must be non-negative".to_string()));
        }
        self.hmin = hmin;
        Ok(())
    }

    /// Hard upper bound on the internal time; used by the `*TStop` tasks.
    pub fn set_stop_time(&mut self, tstop: Eqn::T) {
        self.tstop = Some(tstop);
    }

    /// BDF stability-limit-detection flag. The order-reduction heuristic
    /// itself is not implemented; the flag is accepted and the associated
    /// counter stays at zero.
    pub fn set_stab_lim_det(&mut self, enable: bool) {
        self.stab_lim_det = enable;
    }

    /// Maximum corrector iterations for the state (default 4).
    pub fn set_max_nonlin_iters(&mut self, maxcor: usize) {
        self.maxcor = maxcor.max(1);
    }

    /// Maximum corrector iterations for the sensitivities.
    pub fn set_max_nonlin_iters_sens(&mut self, maxcor: usize) {
        if let Some(sens) = self.sens.as_mut() {
            sens.maxcor = maxcor.max(1);
        }
    }

    /// Maximum recoverable corrector failures per step (default 10).
    pub fn set_max_conv_fails(&mut self, maxncf: usize) {
        self.maxncf = maxncf.max(1);
    }

    /// Maximum error test failures per step (default 7).
    pub fn set_max_err_test_fails(&mut self, maxnef: usize) {
        self.maxnef = maxnef.max(1);
    }

    /// Newton convergence tolerance (default 0.33).
    pub fn set_nonlin_conv_coef(&mut self, epcon: Eqn::T) -> Result<(), SolveError> {
        if epcon <= Eqn::T::zero() {
            return Err(SolveError::IllInput(
                "the Newton convergence coefficient must be positive".to_string(),
            ));
        }
        self.eps_newt = epcon;
        self.toldel = Eqn::T::from(1e-4) * epcon;
        Ok(())
    }

    /// Selector for the sensitivity difference-quotient scheme.
    pub fn set_sens_dq_rhomax(&mut self, rhomax: Eqn::T) {
        if let Some(sens) = self.sens.as_mut() {
            sens.rhomax = rhomax;
        }
    }

    /// Force a Jacobian setup on the next corrector call.
    pub fn force_setup(&mut self) {
        self.force_setup = true;
    }

    // ---- getters -------------------------------------------------------

    pub fn get_statistics(&self) -> OdeStatistics {
        let mut stats = self.stats.clone();
        stats.initial_step_size = self.h0u.into();
        stats.last_step_size = self.hu.into();
        stats.current_step_size = self.hprime.into();
        stats.last_order = self.qu;
        stats.current_order = self.q;
        stats
    }

    pub fn t_current(&self) -> Eqn::T {
        self.tn
    }

    pub fn h_used(&self) -> Eqn::T {
        self.hu
    }

    pub fn h_next(&self) -> Eqn::T {
        self.hprime
    }

    pub fn order_used(&self) -> usize {
        self.qu
    }

    pub fn order_next(&self) -> usize {
        self.qprime
    }

    /// Suggested tolerance scale factor from the last accuracy check.
    pub fn tolerance_scale_factor(&self) -> Eqn::T {
        self.tolsf
    }

    pub fn system(&self) -> &Eqn {
        &self.eqn
    }

    pub fn system_mut(&mut self) -> &mut Eqn {
        &mut self.eqn
    }

    // ---- integration ---------------------------------------------------

    /// Advance the solution toward `tout` per `task`, writing the returned
    /// solution into `yret` and returning the time it corresponds to.
    pub fn solve(
        &mut self,
        tout: Eqn::T,
        yret: &mut Eqn::V,
        task: Task,
    ) -> Result<(Eqn::T, SolveStatus), SolveError> {
        if yret.len() != self.eqn.nstates() {
            return Err(SolveError::IllInput(
                "output vector must match the state size".to_string(),
            ));
        }
        if task.uses_tstop() && self.tstop.is_none() {
            return Err(SolveError::IllInput(
                "tstop task selected but no stop time is set".to_string(),
            ));
        }

        if !self.first_call_done {
            self.begin_first_call(tout, task)?;
            self.first_call_done = true;
        } else if let Some(status) = self.stop_test_before(tout, yret, task)? {
            return Ok(status);
        }

        let mut nstloc = 0usize;
        loop {
            if nstloc >= self.mxstep {
                warn!(
                    "ode: {} internal steps taken before reaching tout = {} (t = {})",
                    self.mxstep, tout, self.tn
                );
                yret.copy_from(&self.zn[0]);
                self.tretp = self.tn;
                return Err(SolveError::TooMuchWork {
                    max_steps: self.mxstep,
                    tout: tout.into(),
                });
            }

            if self.stats.num_steps > 0 && !self.refresh_weights() {
                error!("ode: error weights became non-positive at t = {}", self.tn);
                yret.copy_from(&self.zn[0]);
                self.tretp = self.tn;
                return Err(SolveError::IllInput(format!(
                    "error weights became non-positive at t = {}",
                    self.tn
                )));
            }

            let nrm = self.combined_base_norm();
            self.tolsf = Eqn::T::EPSILON * nrm;
            if self.tolsf > Eqn::T::one() {
                self.tolsf *= Eqn::T::from(10.0);
                error!(
                    "ode: requested accuracy unattainable at t = {} (scale tolerances by {})",
                    self.tn, self.tolsf
                );
                yret.copy_from(&self.zn[0]);
                self.tretp = self.tn;
                return Err(SolveError::TooMuchAccuracy {
                    t: self.tn.into(),
                    tolsf: self.tolsf.into(),
                });
            }

            if let Err(err) = self.step() {
                error!("ode: step failed at t = {}: {}", self.tn, err);
                yret.copy_from(&self.zn[0]);
                self.tretp = self.tn;
                return Err(err);
            }
            nstloc += 1;

            if let Some(status) = self.stop_test_after(tout, yret, task)? {
                return Ok(status);
            }
        }
    }

    /// Evaluate the interpolating polynomial at `t` within the last step.
    pub fn interpolate(&self, t: Eqn::T) -> Result<Eqn::V, InterpolationError> {
        self.interpolate_dky(t, 0)
    }

    /// Evaluate the `k`-th derivative of the interpolating polynomial at
    /// `t` within the last step interval, `k` in `[0, q_used]`.
    pub fn interpolate_dky(
        &self,
        t: Eqn::T,
        k: usize,
    ) -> Result<Eqn::V, InterpolationError> {
        self.check_interp(t, k)?;
        Ok(self.dky_from(&self.zn, t, k))
    }

    /// Evaluate the quadrature variables at `t` within the last step.
    pub fn interpolate_quad(&self, t: Eqn::T) -> Result<Eqn::V, InterpolationError> {
        let quad = self.quad.as_ref().ok_or(InterpolationError::NoQuad)?;
        self.check_interp(t, 0)?;
        Ok(self.dky_from(&quad.zn, t, 0))
    }

    /// Evaluate every sensitivity at `t` within the last step.
    pub fn interpolate_sens(&self, t: Eqn::T) -> Result<Vec<Eqn::V>, InterpolationError> {
        let ns = self.sens.as_ref().ok_or(InterpolationError::NoSens)?.ns();
        (0..ns).map(|is| self.interpolate_sens1(t, is)).collect()
    }

    /// Evaluate the `is`-th sensitivity at `t` within the last step.
    pub fn interpolate_sens1(
        &self,
        t: Eqn::T,
        is: usize,
    ) -> Result<Eqn::V, InterpolationError> {
        let sens = self.sens.as_ref().ok_or(InterpolationError::NoSens)?;
        if is >= sens.ns() {
            return Err(InterpolationError::BadSensIndex {
                index: is,
                ns: sens.ns(),
            });
        }
        self.check_interp(t, 0)?;
        let columns: Vec<Eqn::V> = sens.zn.iter().map(|row| row[is].clone()).collect();
        Ok(self.dky_from(&columns, t, 0))
    }

    // ---- internals -----------------------------------------------------

    fn check_interp(&self, t: Eqn::T, k: usize) -> Result<(), InterpolationError> {
        if k > self.qu.max(1) {
            return Err(InterpolationError::BadK {
                k,
                kmax: self.qu.max(1),
            });
        }
        let mut tfuzz =
            Eqn::T::from(100.0) * Eqn::T::EPSILON * (self.tn.abs() + self.hu.abs());
        if self.hu < Eqn::T::zero() {
            tfuzz = -tfuzz;
        }
        let tp = self.tn - self.hu - tfuzz;
        let tn1 = self.tn + tfuzz;
        if (t - tp) * (t - tn1) > Eqn::T::zero() {
            return Err(InterpolationError::BadT {
                t: t.into(),
                tlo: (self.tn - self.hu).into(),
                thi: self.tn.into(),
            });
        }
        Ok(())
    }

    /// Horner evaluation of the `k`-th scaled derivative from a Nordsieck
    /// array.
    fn dky_from(&self, zn: &[Eqn::V], t: Eqn::T, k: usize) -> Eqn::V {
        let one = Eqn::T::one();
        let qord = if self.qu == 0 { 1 } else { self.qu };
        let h = if self.hu == Eqn::T::zero() { one } else { self.hu };
        let s = (t - self.tn) / h;
        let mut dky = Eqn::V::zeros(zn[0].len());
        for j in (k..=qord).rev() {
            let mut c = one;
            for i in (j - k + 1)..=j {
                c *= Eqn::T::from_usize(i);
            }
            // dky = c * zn[j] + s * dky
            dky.axpy(c, &zn[j], s);
        }
        if k == 0 {
            return dky;
        }
        let r = h.powf(-Eqn::T::from_usize(k));
        dky.scale_mut(r);
        dky
    }

    pub(crate) fn refresh_weights(&mut self) -> bool {
        if !self.tol.update_weights(&self.zn[0], &mut self.ewt) {
            return false;
        }
        if let Some(quad) = self.quad.as_mut() {
            if !quad.tol.update_weights(&quad.zn[0], &mut quad.ewt) {
                return false;
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            if !update_sens_weights(&sens.tols, &sens.zn[0], &mut sens.ewt) {
                return false;
            }
        }
        true
    }

    fn combined_base_norm(&self) -> Eqn::T {
        let mut nrm = self.zn[0].wrms_norm(&self.ewt);
        if let Some(quad) = self.quad.as_ref() {
            if quad.errcon {
                nrm = norm_update(nrm, &quad.zn[0], &quad.ewt);
            }
        }
        if let Some(sens) = self.sens.as_ref() {
            if sens.errcon {
                for is in 0..sens.ns() {
                    let snrm = sens.zn[0][is].wrms_norm(&sens.ewt[is]);
                    if snrm > nrm {
                        nrm = snrm;
                    }
                }
            }
        }
        nrm
    }

    fn begin_first_call(&mut self, tout: Eqn::T, task: Task) -> Result<(), SolveError> {
        // zn[1] = y'(t0); mirrors for quadratures and sensitivities
        let (zn0, zn_rest) = self.zn.split_at_mut(1);
        self.eqn.rhs(self.tn, &zn0[0], &mut zn_rest[0]);
        self.stats.num_rhs_evals += 1;
        if let Some(quad) = self.quad.as_mut() {
            (quad.rhs)(self.tn, &zn0[0], &mut quad.zn[1]);
            self.stats.num_quad_rhs_evals += 1;
        }
        if self.sens.is_some() {
            self.ftemp.copy_from(&zn_rest[0]);
            self.sens_rhs_into_zn1();
        }

        let tdist = (tout - self.tn).abs();
        let troundoff =
            Eqn::T::from(2.0) * Eqn::T::EPSILON * (self.tn.abs() + tout.abs());
        if tdist < troundoff {
            return Err(SolveError::IllInput(format!(
                "tout = {} is too close to t0 = {}",
                tout, self.tn
            )));
        }

        self.h = self.hin;
        if self.h != Eqn::T::zero() && (tout - self.tn) * self.h < Eqn::T::zero() {
            return Err(SolveError::IllInput(
                "the initial step direction opposes the integration direction".to_string(),
            ));
        }
        if self.h == Eqn::T::zero() {
            self.h = Eqn::T::from(0.001) * tdist;
            let mut ypnorm = self.zn[1].wrms_norm(&self.ewt);
            if let Some(quad) = self.quad.as_ref() {
                if quad.errcon {
                    ypnorm = norm_update(ypnorm, &quad.zn[1], &quad.ewt);
                }
            }
            if let Some(sens) = self.sens.as_ref() {
                if sens.errcon {
                    for is in 0..sens.ns() {
                        let snrm = sens.zn[1][is].wrms_norm(&sens.ewt[is]);
                        if snrm > ypnorm {
                            ypnorm = snrm;
                        }
                    }
                }
            }
            if ypnorm > Eqn::T::from(0.5) / self.h {
                self.h = Eqn::T::from(0.5) / ypnorm;
            }
            if tout < self.tn {
                self.h = -self.h;
            }
        }

        let rh = self.h.abs() * self.hmax_inv;
        if rh > Eqn::T::one() {
            self.h /= rh;
        }

        if task.uses_tstop() {
            let tstop = self.tstop.unwrap_or(self.tn);
            if (tstop - self.tn) * self.h < Eqn::T::zero() {
                return Err(SolveError::IllInput(format!(
                    "tstop = {} is behind t0 = {}",
                    tstop, self.tn
                )));
            }
            if (self.tn + self.h - tstop) * self.h > Eqn::T::zero() {
                self.h = tstop - self.tn;
            }
        }

        self.h0u = self.h;
        self.hscale = self.h;
        self.hprime = self.h;
        self.zn[1].scale_mut(self.h);
        if let Some(quad) = self.quad.as_mut() {
            quad.zn[1].scale_mut(self.h);
        }
        if let Some(sens) = self.sens.as_mut() {
            for z in sens.zn[1].iter_mut() {
                z.scale_mut(self.h);
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn stop_test_before(
        &mut self,
        tout: Eqn::T,
        yret: &mut Eqn::V,
        task: Task,
    ) -> Result<Option<(Eqn::T, SolveStatus)>, SolveError> {
        let zero = Eqn::T::zero();

        if task.uses_tstop() {
            let tstop = self.tstop.unwrap_or(self.tn);
            if (self.tn - tstop) * self.h > zero {
                return Err(SolveError::IllInput(format!(
                    "tstop = {} is behind the current time t = {}",
                    tstop, self.tn
                )));
            }
        }

        match task {
            Task::Normal | Task::NormalTStop => {
                if tout == self.tretp {
                    self.tretp = tout;
                    return Ok(Some((tout, SolveStatus::Success)));
                }
                if (self.tn - tout) * self.h >= zero {
                    let y = self.interpolate(tout).map_err(|_| {
                        SolveError::IllInput(format!(
                            "tout = {} is outside the current step interval",
                            tout
                        ))
                    })?;
                    yret.copy_from(&y);
                    self.tretp = tout;
                    return Ok(Some((tout, SolveStatus::Success)));
                }
            }
            Task::OneStep | Task::OneStepTStop => {
                if (self.tn - self.tretp) * self.h > zero {
                    yret.copy_from(&self.zn[0]);
                    self.tretp = self.tn;
                    return Ok(Some((self.tn, SolveStatus::Success)));
                }
            }
        }

        if task.uses_tstop() {
            let tstop = self.tstop.unwrap_or(self.tn);
            let troundoff =
                Eqn::T::from(100.0) * Eqn::T::EPSILON * (self.tn.abs() + self.h.abs());
            if (self.tn - tstop).abs() <= troundoff {
                let y = self.interpolate(tstop).map_err(|_| {
                    SolveError::IllInput(format!("tstop = {} cannot be reached", tstop))
                })?;
                yret.copy_from(&y);
                self.tretp = tstop;
                return Ok(Some((tstop, SolveStatus::TStopReached)));
            }
            if (self.tn + self.hprime - tstop) * self.h > zero {
                self.hprime = tstop - self.tn;
                self.eta = self.hprime / self.h;
            }
        }

        Ok(None)
    }

    #[allow(clippy::type_complexity)]
    fn stop_test_after(
        &mut self,
        tout: Eqn::T,
        yret: &mut Eqn::V,
        task: Task,
    ) -> Result<Option<(Eqn::T, SolveStatus)>, SolveError> {
        let zero = Eqn::T::zero();

        if task.uses_tstop() {
            let tstop = self.tstop.unwrap_or(self.tn);
            let troundoff =
                Eqn::T::from(100.0) * Eqn::T::EPSILON * (self.tn.abs() + self.h.abs());
            if (self.tn - tstop).abs() <= troundoff {
                if let Ok(y) = self.interpolate(tstop) {
                    yret.copy_from(&y);
                }
                self.tretp = tstop;
                return Ok(Some((tstop, SolveStatus::TStopReached)));
            }
            if (self.tn + self.hprime - tstop) * self.h > zero {
                self.hprime = tstop - self.tn;
                self.eta = self.hprime / self.h;
            }
        }

        match task {
            Task::Normal | Task::NormalTStop => {
                if (self.tn - tout) * self.h >= zero {
                    if let Ok(y) = self.interpolate(tout) {
                        yret.copy_from(&y);
                    }
                    self.tretp = tout;
                    return Ok(Some((tout, SolveStatus::Success)));
                }
                Ok(None)
            }
            Task::OneStep | Task::OneStepTStop => {
                yret.copy_from(&self.zn[0]);
                self.tretp = self.tn;
                Ok(Some((self.tn, SolveStatus::Success)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_models::assert_close;
    use crate::test_models::exponential_decay::ExponentialDecay;
    use crate::test_models::gaussian_quadrature::{
        gaussian_quad_rhs, GaussianCarrier, INTEGRAL_TO_ONE,
    };
    use crate::test_models::logistic::Logistic;
    use crate::test_models::vanderpol::VanDerPol;
    use crate::{DenseOdeSolver, SensErrCon, SensMethod, SensParam, SensParams, SolveError, Task};
    use nalgebra::DVector;

    type Vcpu = DVector<f64>;

    fn decay_solver(
        method: Method,
        newton: bool,
        rtol: f64,
        atol: f64,
    ) -> OdeSolver<ExponentialDecay> {
        let eqn = ExponentialDecay::new();
        let y0 = Vcpu::from_element(1, eqn.y0);
        let corrector = if newton {
            Corrector::Newton(Box::new(DenseOdeSolver::new()))
        } else {
            Corrector::Functional
        };
        OdeSolver::new(
            eqn,
            method,
            corrector,
            0.0,
            &y0,
            Tolerances::scalar(rtol, atol),
        )
        .unwrap()
    }

    #[test]
    fn test_bdf_newton_exponential_decay() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        let mut y = Vcpu::zeros(1);
        let (t, _) = s.solve(10.0, &mut y, Task::Normal).unwrap();
        assert_eq!(t, 10.0);
        assert_close(y[0], (-10.0f64).exp(), 1e-6);
        let stats = s.get_statistics();
        assert!(stats.num_steps <= 200, "took {} steps", stats.num_steps);
        assert!(stats.last_order >= 3, "finished at order {}", stats.last_order);
    }

    #[test]
    fn test_adams_functional_exponential_decay() {
        let mut s = decay_solver(Method::Adams, false, 1e-6, 1e-10);
        let mut y = Vcpu::zeros(1);
        let (t, _) = s.solve(10.0, &mut y, Task::Normal).unwrap();
        assert_eq!(t, 10.0);
        assert_close(y[0], (-10.0f64).exp(), 1e-5);
    }

    #[test]
    fn test_interpolate_window() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        // before any step only t0 is legal
        s.interpolate(0.0)
            .unwrap()
            .assert_eq(&Vcpu::from_element(1, 1.0), 1e-12);
        assert!(s.interpolate(1.0).is_err());

        let mut y = Vcpu::zeros(1);
        s.solve(1.0, &mut y, Task::OneStep).unwrap();
        let tn = s.t_current();
        // the history reproduces the current state at tn
        let yn = s.interpolate(tn).unwrap();
        yn.assert_eq(&s.zn[0], 10.0 * f64::EPSILON * s.zn[0].abs().max_norm() + 1e-300);
        // derivative orders above the last used order are rejected
        assert!(matches!(
            s.interpolate_dky(tn, s.order_used() + 1),
            Err(InterpolationError::BadK { .. })
        ));
        assert!(s.interpolate_dky(tn, 0).is_ok());
        // outside the last step interval
        assert!(matches!(
            s.interpolate(tn + 1.0),
            Err(InterpolationError::BadT { .. })
        ));
    }

    #[test]
    fn test_tstop_clipping() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        s.set_stop_time(1.0);
        let mut y = Vcpu::zeros(1);
        let (t, status) = s.solve(2.0, &mut y, Task::NormalTStop).unwrap();
        assert_eq!(status, SolveStatus::TStopReached);
        assert!((t - 1.0).abs() <= 100.0 * f64::EPSILON * (1.0 + s.h_used().abs()));
        assert_close(y[0], (-1.0f64).exp(), 1e-6);
        // the internal time never passed the stop time
        assert!(s.t_current() <= 1.0 + 1e-12);
    }

    #[test]
    fn test_too_much_work() {
        let eqn = VanDerPol::stiff();
        let y0 = eqn.initial_state();
        let mut s = OdeSolver::new(
            eqn,
            Method::Bdf,
            Corrector::Newton(Box::new(DenseOdeSolver::new())),
            0.0,
            &y0,
            Tolerances::scalar(1e-6, 1e-8),
        )
        .unwrap();
        let mut y = Vcpu::zeros(2);
        match s.solve(3000.0, &mut y, Task::Normal) {
            Err(SolveError::TooMuchWork { max_steps, .. }) => assert_eq!(max_steps, 500),
            other => panic!("expected TooMuchWork, got {:?}", other.map(|r| r.0)),
        }
        // the state reached so far is observable
        assert!(s.t_current() > 0.0);
        assert!(y[0].is_finite());
    }

    #[test]
    fn test_vanderpol_stiff() {
        let eqn = VanDerPol::stiff();
        let y0 = eqn.initial_state();
        let mut s = OdeSolver::new(
            eqn,
            Method::Bdf,
            Corrector::Newton(Box::new(DenseOdeSolver::new())),
            0.0,
            &y0,
            Tolerances::scalar(1e-6, 1e-8),
        )
        .unwrap();
        s.set_max_steps(100_000);
        let mut y = Vcpu::zeros(2);
        let (t, _) = s.solve(3000.0, &mut y, Task::Normal).unwrap();
        assert_eq!(t, 3000.0);
        assert!(y[0].abs() < 3.0);
        let stats = s.get_statistics();
        assert!(
            stats.num_err_test_fails as f64 <= 0.05 * stats.num_steps as f64,
            "{} error test failures in {} steps",
            stats.num_err_test_fails,
            stats.num_steps
        );
    }

    #[test]
    fn test_quadrature_gaussian() {
        let y0 = Vcpu::from_element(1, 1.0);
        let mut s = OdeSolver::new(
            GaussianCarrier,
            Method::Bdf,
            Corrector::Newton(Box::new(DenseOdeSolver::new())),
            0.0,
            &y0,
            Tolerances::scalar(1e-10, 1e-12),
        )
        .unwrap();
        s.enable_quadrature(
            gaussian_quad_rhs(),
            &Vcpu::zeros(1),
            SensErrCon::Full,
            Tolerances::scalar(1e-10, 1e-12),
        )
        .unwrap();
        s.set_max_steps(10_000);
        let mut y = Vcpu::zeros(1);
        s.solve(1.0, &mut y, Task::Normal).unwrap();
        let q = s.interpolate_quad(1.0).unwrap();
        assert_close(q[0], INTEGRAL_TO_ONE, 1e-8);
        assert!(s.get_statistics().num_quad_rhs_evals > 0);
    }

    fn logistic_sens_at(
        ism: SensMethod,
        rhs_fn: OdeSensRhsFn<Vcpu>,
        tout: f64,
    ) -> (f64, f64) {
        let eqn = Logistic::new();
        let y0 = Vcpu::from_element(1, eqn.y0);
        let mut s = OdeSolver::new(
            eqn,
            Method::Bdf,
            Corrector::Newton(Box::new(DenseOdeSolver::new())),
            0.0,
            &y0,
            Tolerances::scalar(1e-8, 1e-10),
        )
        .unwrap();
        let params = SensParams {
            list: vec![SensParam::Dynamic(0), SensParam::Dynamic(1)],
            pbar: vec![1.0, 10.0],
        };
        let ys0 = vec![Vcpu::zeros(1), Vcpu::zeros(1)];
        s.enable_sensitivity(params, ism, rhs_fn, &ys0, SensErrCon::Full, None)
            .unwrap();
        s.set_max_steps(10_000);
        let mut y = Vcpu::zeros(1);
        s.solve(tout, &mut y, Task::Normal).unwrap();
        let sens = s.interpolate_sens(tout).unwrap();
        (sens[0][0], sens[1][0])
    }

    #[test]
    fn test_sensitivity_logistic_coupling_modes_agree() {
        let tout = 2.0;
        let sim = logistic_sens_at(SensMethod::Simultaneous, OdeSensRhsFn::All(Logistic::sens_rhs_all()), tout);
        let stg = logistic_sens_at(SensMethod::Staggered, OdeSensRhsFn::All(Logistic::sens_rhs_all()), tout);
        let stg1 = logistic_sens_at(SensMethod::Staggered1, OdeSensRhsFn::One(Logistic::sens_rhs_one()), tout);
        let dq = logistic_sens_at(SensMethod::Staggered, OdeSensRhsFn::DiffQuotient, tout);

        assert_close(sim.0, stg.0, 1e-6);
        assert_close(sim.1, stg.1, 1e-6);
        assert_close(sim.0, stg1.0, 1e-6);
        assert_close(sim.1, stg1.1, 1e-6);
        assert_close(dq.0, stg.0, 1e-4);
        assert_close(dq.1, stg.1, 1e-4);
    }

    #[test]
    fn test_order_reaches_maximum() {
        let mut s = decay_solver(Method::Bdf, true, 1e-10, 1e-14);
        s.set_max_steps(100_000);
        let mut y = Vcpu::zeros(1);
        let mut max_order = 0;
        while s.t_current() < 50.0 {
            s.solve(50.0, &mut y, Task::OneStep).unwrap();
            max_order = max_order.max(s.order_used());
        }
        assert_eq!(max_order, 5);
    }

    #[test]
    fn test_tolerance_scaling_monotonicity() {
        let mut errs = Vec::new();
        for rtol in [1e-4, 1e-8] {
            let mut s = decay_solver(Method::Bdf, true, rtol, 1e-14);
            s.set_max_steps(10_000);
            let mut y = Vcpu::zeros(1);
            s.solve(5.0, &mut y, Task::Normal).unwrap();
            errs.push((y[0] - (-5.0f64).exp()).abs());
        }
        assert!(errs[1] <= errs[0] + 1e-15);
    }

    #[test]
    fn test_step_size_bounds() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        s.set_max_step(0.1).unwrap();
        let mut y = Vcpu::zeros(1);
        while s.t_current() < 5.0 {
            s.solve(5.0, &mut y, Task::OneStep).unwrap();
            assert!(s.h_used().abs() <= 0.1 * 1.000001);
        }
    }

    #[test]
    fn test_reinit_reproduces_run() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        let mut y1 = Vcpu::zeros(1);
        s.solve(3.0, &mut y1, Task::Normal).unwrap();
        s.reinit(0.0, &Vcpu::from_element(1, 1.0)).unwrap();
        let mut y2 = Vcpu::zeros(1);
        s.solve(3.0, &mut y2, Task::Normal).unwrap();
        y1.assert_eq(&y2, 1e-12);
    }

    #[test]
    fn test_restore_inverts_prediction() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        let mut y = Vcpu::zeros(1);
        for _ in 0..8 {
            s.solve(10.0, &mut y, Task::OneStep).unwrap();
        }
        let tn = s.tn;
        let zn = s.zn.clone();

        s.predict();
        s.restore(tn);

        assert_eq!(s.tn, tn);
        for (a, b) in s.zn.iter().zip(zn.iter()) {
            a.assert_eq(b, 1e-13);
        }
    }

    #[test]
    fn test_counters_monotone() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        let mut y = Vcpu::zeros(1);
        let mut last = 0;
        for _ in 0..20 {
            s.solve(10.0, &mut y, Task::OneStep).unwrap();
            let stats = s.get_statistics();
            assert!(stats.num_steps >= last);
            assert!(stats.num_rhs_evals >= stats.num_steps);
            last = stats.num_steps;
        }
    }

    #[test]
    fn test_illegal_inputs() {
        let mut s = decay_solver(Method::Bdf, true, 1e-6, 1e-10);
        let mut y = Vcpu::zeros(1);
        // tout at t0
        assert!(matches!(
            s.solve(0.0, &mut y, Task::Normal),
            Err(SolveError::IllInput(_))
        ));
        // tstop task without a stop time
        assert!(matches!(
            s.solve(1.0, &mut y, Task::NormalTStop),
            Err(SolveError::IllInput(_))
        ));
        // quadrature and sensitivity dense output without the subsystems
        assert!(matches!(
            s.interpolate_quad(0.0),
            Err(InterpolationError::NoQuad)
        ));
        assert!(matches!(
            s.interpolate_sens(0.0),
            Err(InterpolationError::NoSens)
        ));
        // negative tolerance
        assert!(OdeSolver::new(
            ExponentialDecay::new(),
            Method::Bdf,
            Corrector::<ExponentialDecay>::Functional,
            0.0,
            &Vcpu::from_element(1, 1.0),
            Tolerances::scalar(-1e-6, 1e-10),
        )
        .is_err());
    }

    #[test]
    fn test_too_much_accuracy() {
        let mut s = decay_solver(Method::Bdf, true, 1e-30, 1e-30);
        let mut y = Vcpu::zeros(1);
        match s.solve(10.0, &mut y, Task::Normal) {
            Err(SolveError::TooMuchAccuracy { tolsf, .. }) => assert!(tolsf > 1.0),
            other => panic!("expected TooMuchAccuracy, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn test_staggered1_requires_one_form() {
        let eqn = Logistic::new();
        let y0 = Vcpu::from_element(1, eqn.y0);
        let mut s = OdeSolver::new(
            eqn,
            Method::Bdf,
            Corrector::Newton(Box::new(DenseOdeSolver::new())),
            0.0,
            &y0,
            Tolerances::scalar(1e-8, 1e-10),
        )
        .unwrap();
        let params = SensParams {
            list: vec![SensParam::Dynamic(0), SensParam::Dynamic(1)],
            pbar: vec![1.0, 10.0],
        };
        let ys0 = vec![Vcpu::zeros(1), Vcpu::zeros(1)];
        let err = s.enable_sensitivity(
            params,
            SensMethod::Staggered1,
            OdeSensRhsFn::All(Logistic::sens_rhs_all()),
            &ys0,
            SensErrCon::Full,
            None,
        );
        assert!(matches!(err, Err(SolveError::IllInput(_))));
    }
}
