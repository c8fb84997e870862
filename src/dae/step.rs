//! One internal step of the fixed-leading-coefficient BDF method: set the
//! multistep coefficients, correct the state (then quadratures, then
//! sensitivities), run the local error tests, and either commit the step or
//! restore the history and retry with adjusted order and step size.

use nalgebra::{ComplexField, RealField};
use num_traits::identities::{One, Zero};

use super::{DaeSolver, DaeSystem};
use crate::error::{ResidualError, SolveError};
use crate::linear_solver::SetupCause;
use crate::sens::SensMethod;
use crate::{LinearSolverFailure, Scalar, Vector};

const XRATE: f64 = 0.2;
const RATEMAX: f64 = 0.9;

/// Corrector-phase failure, routed to the failure handler which decides
/// between a retry with reduced step and a final error return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepFailure {
    ResRecoverable,
    ResFatal,
    LSetupRecoverable,
    LSetupFatal,
    LSolveRecoverable,
    LSolveFatal,
    NonConvergence,
    ConstraintRecoverable,
    SensDQFatal,
    ErrorTest,
}

impl StepFailure {
    fn is_recoverable(self) -> bool {
        !matches!(
            self,
            StepFailure::ResFatal
                | StepFailure::LSetupFatal
                | StepFailure::LSolveFatal
                | StepFailure::SensDQFatal
        )
    }
}

pub(crate) struct ErrEst<T> {
    pub est: T,
    pub erk: T,
    pub erkm1: T,
}

/// `dst += src` over two entries of a history array (`src = dst + 1`).
fn phi_add<V: Vector>(phi: &mut [V], dst: usize) {
    let (lo, hi) = phi.split_at_mut(dst + 1);
    lo[dst].axpy(V::T::one(), &hi[0], V::T::one());
}

impl<Eqn: DaeSystem> DaeSolver<Eqn> {
    /// Take one internal step from `tn` to `tn + hh`.
    pub(crate) fn step(&mut self) -> Result<(), SolveError> {
        let zero = Eqn::T::zero();
        let one = Eqn::T::one();
        let saved_t = self.tn;
        let mut ncf = 0usize;
        let mut nef = 0usize;

        if self.stats.num_steps == 0 {
            self.kk = 1;
            self.kused = 0;
            self.hused = zero;
            self.psi[0] = self.hh;
            self.cj = one / self.hh;
            self.phase = 0;
            self.ns = 0;
        }

        let sensi_stgr = matches!(
            self.sens.as_ref().map(|s| s.ism),
            Some(SensMethod::Staggered)
        );
        let sensi_stgr1 = matches!(
            self.sens.as_ref().map(|s| s.ism),
            Some(SensMethod::Staggered1)
        );

        let mut error_k = zero;
        let mut error_km1 = zero;

        loop {
            let ck = self.set_coeffs();

            let mut est = zero;
            let mut nflag = self.nonlinear_solve();
            if nflag.is_ok() {
                let (err, passed) = self.test_error(ck);
                error_k = err.erk;
                error_km1 = err.erkm1;
                est = err.est;
                if !passed {
                    nflag = Err(StepFailure::ErrorTest);
                }
            }
            if let Err(fail) = nflag {
                self.restore(saved_t);
                self.handle_failure(fail, &mut ncf, &mut nef, est)?;
                if self.stats.num_steps == 0 {
                    self.reset_first_step();
                }
                continue;
            }

            // advance quadrature variables: predict, then a single linear
            // implicit correction
            if self.quad.is_some() {
                self.quad_predict();
                self.quad_correct();

                let mut nflag: Result<(), StepFailure> = Ok(());
                let mut est_q = zero;
                let errcon_q = self.quad.as_ref().is_some_and(|q| q.errcon);
                if errcon_q {
                    let (err, passed) = self.quad_test_error(ck);
                    est_q = err.est;
                    if err.erk > error_k {
                        error_k = err.erk;
                    }
                    if err.erkm1 > error_km1 {
                        error_km1 = err.erkm1;
                    }
                    if !passed {
                        nflag = Err(StepFailure::ErrorTest);
                    }
                }
                if let Err(fail) = nflag {
                    self.restore(saved_t);
                    self.handle_failure(fail, &mut ncf, &mut nef, est_q)?;
                    if self.stats.num_steps == 0 {
                        self.reset_first_step();
                    }
                    continue;
                }
            }

            // advance sensitivities, staggered: one corrector pass for all of
            // them with the converged state
            if sensi_stgr {
                let mut nflag = self.refresh_state_residual();
                if nflag.is_ok() {
                    nflag = self.staggered_nonlinear_solve();
                }
                let mut est_s = zero;
                let errcon_s = self.sens.as_ref().is_some_and(|s| s.errcon);
                if nflag.is_ok() && errcon_s {
                    let (err, passed) = self.staggered_test_error(ck);
                    est_s = err.est;
                    if err.erk > error_k {
                        error_k = err.erk;
                    }
                    if err.erkm1 > error_km1 {
                        error_km1 = err.erkm1;
                    }
                    if !passed {
                        nflag = Err(StepFailure::ErrorTest);
                    }
                }
                if let Err(fail) = nflag {
                    self.restore(saved_t);
                    self.handle_failure(fail, &mut ncf, &mut nef, est_s)?;
                    if self.stats.num_steps == 0 {
                        self.reset_first_step();
                    }
                    continue;
                }
            }

            // advance sensitivities, staggered one-at-a-time
            if sensi_stgr1 {
                let mut nflag = self.refresh_state_residual();
                let mut est_s = zero;
                if nflag.is_ok() {
                    let ns = self.sens.as_ref().map_or(0, |s| s.ns());
                    let errcon_s = self.sens.as_ref().is_some_and(|s| s.errcon);
                    for is in 0..ns {
                        nflag = self.staggered1_nonlinear_solve(is);
                        if nflag.is_ok() && errcon_s {
                            let (err, passed) = self.staggered1_test_error(is, ck);
                            est_s = err.est;
                            if err.erk > error_k {
                                error_k = err.erk;
                            }
                            if err.erkm1 > error_km1 {
                                error_km1 = err.erkm1;
                            }
                            if !passed {
                                nflag = Err(StepFailure::ErrorTest);
                            }
                        }
                        if nflag.is_err() {
                            break;
                        }
                    }
                }
                if let Err(fail) = nflag {
                    self.restore(saved_t);
                    self.handle_failure(fail, &mut ncf, &mut nef, est_s)?;
                    if self.stats.num_steps == 0 {
                        self.reset_first_step();
                    }
                    continue;
                }
            }

            break;
        }

        self.complete_step(error_k, error_km1);
        Ok(())
    }

    /// Compute the multistep coefficients for the current (h, k), apply the
    /// reversible phi-star scaling, and advance `tn`. Returns the error
    /// test multiplier `ck`.
    ///
    /// `ns` counts consecutive steps at constant step size and order,
    /// capped at `k + 2`; once past `k + 1` the recurrences are already
    /// current and are skipped.
    pub(crate) fn set_coeffs(&mut self) -> Eqn::T {
        let zero = Eqn::T::zero();
        let one = Eqn::T::one();

        if self.hh != self.hused || self.kk != self.kused {
            self.ns = 0;
        }
        self.ns = (self.ns + 1).min(self.kused + 2);
        if self.kk + 1 >= self.ns {
            self.beta[0] = one;
            self.alpha[0] = one;
            self.gamma[0] = zero;
            self.sigma[0] = one;
            let mut temp1 = self.hh;
            for i in 1..=self.kk {
                let temp2 = self.psi[i - 1];
                self.psi[i - 1] = temp1;
                self.beta[i] = self.beta[i - 1] * self.psi[i - 1] / temp2;
                temp1 = temp2 + self.hh;
                self.alpha[i] = self.hh / temp1;
                self.sigma[i] = Eqn::T::from_usize(i) * self.sigma[i - 1] * self.alpha[i];
                self.gamma[i] = self.gamma[i - 1] + self.alpha[i - 1] / self.hh;
            }
            self.psi[self.kk] = temp1;
        }

        let mut alphas = zero;
        let mut alpha0 = zero;
        for i in 0..self.kk {
            alphas -= one / Eqn::T::from_usize(i + 1);
            alpha0 -= self.alpha[i];
        }

        self.cjlast = self.cj;
        self.cj = -alphas / self.hh;

        let mut ck = (self.alpha[self.kk] + alphas - alpha0).abs();
        ck = ck.max(self.alpha[self.kk]);

        // phi to phi-star
        for i in self.ns..=self.kk {
            self.phi[i].scale_mut(self.beta[i]);
        }
        if let Some(quad) = self.quad.as_mut() {
            for i in self.ns..=self.kk {
                quad.phi[i].scale_mut(self.beta[i]);
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for i in self.ns..=self.kk {
                let beta = self.beta[i];
                for p in sens.phi[i].iter_mut() {
                    p.scale_mut(beta);
                }
            }
        }

        self.tn += self.hh;
        ck
    }

    /// Predicted state: `yy = sum phi[j]`, `yp = sum gamma[j] * phi[j]`.
    fn predict(&mut self) {
        self.yy.copy_from(&self.phi[0]);
        self.yp.fill(Eqn::T::zero());
        for j in 1..=self.kk {
            self.yy.axpy(Eqn::T::one(), &self.phi[j], Eqn::T::one());
            self.yp.axpy(self.gamma[j], &self.phi[j], Eqn::T::one());
        }
    }

    fn quad_predict(&mut self) {
        if let Some(quad) = self.quad.as_mut() {
            quad.yy.copy_from(&quad.phi[0]);
            quad.yp.fill(Eqn::T::zero());
            for j in 1..=self.kk {
                quad.yy.axpy(Eqn::T::one(), &quad.phi[j], Eqn::T::one());
                quad.yp.axpy(self.gamma[j], &quad.phi[j], Eqn::T::one());
            }
        }
    }

    /// Single implicit (linear) quadrature correction:
    /// `eeQ = (fQ - ypQ_pred) / cj`, `yyQ += eeQ`.
    fn quad_correct(&mut self) {
        let cj = self.cj;
        if let Some(quad) = self.quad.as_mut() {
            (quad.rhs)(self.tn, &self.yy, &self.yp, &mut quad.ee);
            self.stats.num_quad_rhs_evals += 1;
            quad.ee.axpy(-Eqn::T::one(), &quad.yp, Eqn::T::one());
            quad.ee.scale_mut(Eqn::T::one() / cj);
            quad.yy.axpy(Eqn::T::one(), &quad.ee, Eqn::T::one());
        }
    }

    /// Predict all sensitivities into their corrector slots.
    fn sens_predict_all(&mut self) {
        let kk = self.kk;
        let gamma = &self.gamma;
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                sens.yy[is].copy_from(&sens.phi[0][is]);
                sens.yp[is].fill(Eqn::T::zero());
                for j in 1..=kk {
                    sens.yy[is].axpy(Eqn::T::one(), &sens.phi[j][is], Eqn::T::one());
                    sens.yp[is].axpy(gamma[j], &sens.phi[j][is], Eqn::T::one());
                }
            }
        }
    }

    /// Predict the `is`-th sensitivity into the staggered-1 scratch pair.
    fn sens_predict_one(&mut self, is: usize) {
        let kk = self.kk;
        let gamma = &self.gamma;
        if let Some(sens) = self.sens.as_mut() {
            sens.yy1.copy_from(&sens.phi[0][is]);
            sens.yp1.fill(Eqn::T::zero());
            for j in 1..=kk {
                sens.yy1.axpy(Eqn::T::one(), &sens.phi[j][is], Eqn::T::one());
                sens.yp1.axpy(gamma[j], &sens.phi[j][is], Eqn::T::one());
            }
        }
    }

    /// Newton convergence-rate scalars, reset to 20 after a Jacobian update
    /// and to 100 when the leading coefficient changed.
    fn set_ss(&mut self, value: Eqn::T) {
        self.ss = value;
        if let Some(sens) = self.sens.as_mut() {
            match sens.ism {
                SensMethod::Staggered => sens.ss = value,
                SensMethod::Staggered1 => {
                    for s in sens.ss1.iter_mut() {
                        *s = value;
                    }
                }
                SensMethod::Simultaneous => {}
            }
        }
    }

    /// Solve the nonlinear system for the state (and, in simultaneous mode,
    /// all sensitivities) at `tn`.
    fn nonlinear_solve(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let sensi_sim = matches!(
            self.sens.as_ref().map(|s| s.ism),
            Some(SensMethod::Simultaneous)
        );

        let mut call_setup = false;
        if self.stats.num_steps == 0 {
            self.cjold = self.cj;
            self.set_ss(Eqn::T::from(20.0));
            call_setup = true;
        }

        self.cjratio = self.cj / self.cjold;
        let xrate = Eqn::T::from(XRATE);
        let lo = (one - xrate) / (one + xrate);
        if self.cjratio < lo || self.cjratio > one / lo {
            call_setup = true;
        }
        if self.force_setup {
            call_setup = true;
        }
        if self.cj != self.cjlast {
            self.set_ss(Eqn::T::from(100.0));
        }

        // traversed at most twice; the second pass retries a recoverable
        // corrector failure after a fresh Jacobian setup
        let mut cause = SetupCause::NoFailure;
        let retval = loop {
            self.predict();
            let ret = self
                .eqn
                .residual(self.tn, &self.yy, &self.yp, &mut self.delta);
            self.stats.num_res_evals += 1;
            match ret {
                Ok(()) => {}
                Err(ResidualError::Recoverable) => break Err(StepFailure::ResRecoverable),
                Err(ResidualError::Fatal) => break Err(StepFailure::ResFatal),
            }

            if sensi_sim {
                self.sens_predict_all();
                if let Err(fail) = self.sens_residuals_all() {
                    break Err(fail);
                }
            }

            if call_setup {
                let ret = self.ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    self.cj,
                    self.hh,
                    &self.ewt,
                    cause,
                );
                self.stats.num_lin_setups += 1;
                self.force_setup = false;
                self.cjold = self.cj;
                self.cjratio = one;
                self.set_ss(Eqn::T::from(20.0));
                match ret {
                    Ok(_jac_current) => {}
                    Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        return Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.newton_iterate(sensi_sim) {
                Ok(()) => break Ok(()),
                Err(fail) if fail.is_recoverable() && !call_setup => {
                    call_setup = true;
                    cause = SetupCause::BadJacobian;
                    continue;
                }
                Err(fail) => break Err(fail),
            }
        };
        retval?;

        if self.constraints.is_some() {
            self.enforce_constraints()?;
        }
        Ok(())
    }

    /// The Newton loop for the state system. `delta` holds the predicted
    /// residual on entry; `ee` accumulates the correction.
    fn newton_iterate(&mut self, sensi_sim: bool) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();

        self.ee.fill(Eqn::T::zero());
        if sensi_sim {
            if let Some(sens) = self.sens.as_mut() {
                for e in sens.ee.iter_mut() {
                    e.fill(Eqn::T::zero());
                }
            }
        }

        loop {
            self.stats.num_nonlin_iters += 1;

            // keep the residual around for the linear solver
            self.tempv1.copy_from(&self.delta);
            match self.ls.solve(
                &mut self.eqn,
                &mut self.delta,
                &self.ewt,
                &self.yy,
                &self.yp,
                &self.tempv1,
            ) {
                Ok(()) => {}
                Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSolveFatal),
                Err(LinearSolverFailure::Recoverable) => {
                    return Err(StepFailure::LSolveRecoverable)
                }
            }

            if sensi_sim {
                if let Some(sens) = self.sens.as_mut() {
                    for is in 0..sens.params.ns() {
                        match self.ls.solve(
                            &mut self.eqn,
                            &mut sens.delta[is],
                            &sens.ewt[is],
                            &self.yy,
                            &self.yp,
                            &self.tempv1,
                        ) {
                            Ok(()) => {}
                            Err(LinearSolverFailure::Fatal) => {
                                return Err(StepFailure::LSolveFatal)
                            }
                            Err(LinearSolverFailure::Recoverable) => {
                                return Err(StepFailure::LSolveRecoverable)
                            }
                        }
                    }
                }
            }

            self.yy.axpy(-one, &self.delta, one);
            self.ee.axpy(-one, &self.delta, one);
            self.yp.axpy(-self.cj, &self.delta, one);
            let mut delnrm = self.delta.wrms_norm(&self.ewt);

            if sensi_sim {
                if let Some(sens) = self.sens.as_mut() {
                    for is in 0..sens.params.ns() {
                        sens.ee[is].axpy(-one, &sens.delta[is], one);
                        sens.yy[is].axpy(-one, &sens.delta[is], one);
                        sens.yp[is].axpy(-self.cj, &sens.delta[is], one);
                        let snrm = sens.delta[is].wrms_norm(&sens.ewt[is]);
                        if snrm > delnrm {
                            delnrm = snrm;
                        }
                    }
                }
            }

            // convergence: directly on the first iterate, then through the
            // rate estimate
            if mnewt == 0 {
                oldnrm = delnrm;
                if delnrm <= self.toldel {
                    return Ok(());
                }
            } else {
                let rate = (delnrm / oldnrm).powf(one / Eqn::T::from_usize(mnewt));
                if rate > Eqn::T::from(RATEMAX) {
                    return Err(StepFailure::NonConvergence);
                }
                self.ss = rate / (one - rate);
            }
            if self.ss * delnrm <= self.eps_newt {
                return Ok(());
            }

            mnewt += 1;
            if mnewt >= self.maxcor {
                return Err(StepFailure::NonConvergence);
            }

            let ret = self
                .eqn
                .residual(self.tn, &self.yy, &self.yp, &mut self.delta);
            self.stats.num_res_evals += 1;
            match ret {
                Ok(()) => {}
                Err(ResidualError::Recoverable) => return Err(StepFailure::ResRecoverable),
                Err(ResidualError::Fatal) => return Err(StepFailure::ResFatal),
            }

            if sensi_sim {
                self.sens_residuals_all()?;
            }
        }
    }

    /// Check and enforce the inequality constraints after a converged
    /// corrector.
    fn enforce_constraints(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let Some(constraints) = self.constraints.as_ref() else {
            return Ok(());
        };
        if constraints.constraint_mask(&self.yy, &mut self.tempv2) {
            return Ok(());
        }

        // scaled repair vector v = mm * (y - 0.1 * a * c / ewt) with a
        // selecting the strict (|c| = 2) constraints
        self.tempv1 = constraints.compare_ge(Eqn::T::from(1.5));
        self.tempv1.component_mul_assign(constraints);
        self.tempv1.component_div_assign(&self.ewt);
        self.tempv1.axpy(one, &self.yy, -Eqn::T::from(0.1));
        self.tempv1.component_mul_assign(&self.tempv2);
        let vnorm = self.tempv1.wrms_norm(&self.ewt);

        if vnorm <= self.eps_newt {
            // small violation: absorb the repair into the correction
            self.ee.axpy(-one, &self.tempv1, one);
            return Ok(());
        }
        // constraints not met: propose the next step-size ratio
        self.tempv1.linear_sum(one, &self.phi[0], -one, &self.yy);
        self.tempv1.component_mul_assign(&self.tempv2);
        self.rr = Eqn::T::from(0.9) * self.phi[0].min_quotient(&self.tempv1);
        self.rr = self.rr.max(Eqn::T::from(0.1));
        Err(StepFailure::ConstraintRecoverable)
    }

    /// Refresh the state residual at the converged state, needed by the
    /// staggered sensitivity correctors (the difference-quotient path reads
    /// it).
    fn refresh_state_residual(&mut self) -> Result<(), StepFailure> {
        let ret = self
            .eqn
            .residual(self.tn, &self.yy, &self.yp, &mut self.delta);
        self.stats.num_res_evals += 1;
        self.stats.num_res_evals_sens += 1;
        match ret {
            Ok(()) => Ok(()),
            Err(ResidualError::Recoverable) => Err(StepFailure::ResRecoverable),
            Err(ResidualError::Fatal) => Err(StepFailure::ResFatal),
        }
    }

    /// Corrector pass over all sensitivities with the converged-state
    /// Jacobian (staggered mode).
    fn staggered_nonlinear_solve(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut call_setup = false;
        let mut cause = SetupCause::NoFailure;

        let retval = loop {
            self.sens_predict_all();
            if let Err(fail) = self.sens_residuals_all() {
                break Err(fail);
            }

            if call_setup {
                let ret = self.ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    self.cj,
                    self.hh,
                    &self.ewt,
                    cause,
                );
                self.stats.num_sens_lin_setups += 1;
                self.cjold = self.cj;
                self.cjratio = one;
                self.set_ss(Eqn::T::from(20.0));
                match ret {
                    Ok(_) => {}
                    Err(LinearSolverFailure::Fatal) => break Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        break Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.staggered_newton_iterate() {
                Ok(()) => break Ok(()),
                Err(fail) if fail.is_recoverable() && !call_setup => {
                    call_setup = true;
                    cause = SetupCause::BadJacobian;
                    continue;
                }
                Err(fail) => break Err(fail),
            }
        };

        if retval.is_err() {
            self.stats.num_sens_nonlin_conv_fails += 1;
        }
        retval
    }

    fn staggered_newton_iterate(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();

        if let Some(sens) = self.sens.as_mut() {
            for e in sens.ee.iter_mut() {
                e.fill(Eqn::T::zero());
            }
        }

        loop {
            self.stats.num_sens_nonlin_iters += 1;

            let mut delnrm = Eqn::T::zero();
            if let Some(sens) = self.sens.as_mut() {
                for is in 0..sens.params.ns() {
                    match self.ls.solve(
                        &mut self.eqn,
                        &mut sens.delta[is],
                        &sens.ewt[is],
                        &self.yy,
                        &self.yp,
                        &self.delta,
                    ) {
                        Ok(()) => {}
                        Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSolveFatal),
                        Err(LinearSolverFailure::Recoverable) => {
                            return Err(StepFailure::LSolveRecoverable)
                        }
                    }
                    sens.ee[is].axpy(-one, &sens.delta[is], one);
                    sens.yy[is].axpy(-one, &sens.delta[is], one);
                    sens.yp[is].axpy(-self.cj, &sens.delta[is], one);
                    let snrm = sens.delta[is].wrms_norm(&sens.ewt[is]);
                    if snrm > delnrm {
                        delnrm = snrm;
                    }
                }
            }

            let ss = if mnewt == 0 {
                if delnrm <= self.toldel {
                    return Ok(());
                }
                oldnrm = delnrm;
                self.sens.as_ref().map_or(Eqn::T::zero(), |s| s.ss)
            } else {
                let rate = (delnrm / oldnrm).powf(one / Eqn::T::from_usize(mnewt));
                if rate > Eqn::T::from(RATEMAX) {
                    return Err(StepFailure::NonConvergence);
                }
                let ss = rate / (one - rate);
                if let Some(sens) = self.sens.as_mut() {
                    sens.ss = ss;
                }
                ss
            };
            if ss * delnrm <= self.eps_newt {
                return Ok(());
            }

            mnewt += 1;
            let maxcor = self.sens.as_ref().map_or(1, |s| s.maxcor);
            if mnewt >= maxcor {
                return Err(StepFailure::NonConvergence);
            }

            self.sens_residuals_all()?;
        }
    }

    /// Corrector pass for the `is`-th sensitivity alone (staggered-1 mode).
    fn staggered1_nonlinear_solve(&mut self, is: usize) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut call_setup = false;
        let mut cause = SetupCause::NoFailure;

        let retval = loop {
            self.sens_predict_one(is);
            if let Err(fail) = self.sens_residual_one(is) {
                break Err(fail);
            }

            if call_setup {
                let ret = self.ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    self.cj,
                    self.hh,
                    &self.ewt,
                    cause,
                );
                self.stats.num_sens_lin_setups += 1;
                self.cjold = self.cj;
                self.cjratio = one;
                self.set_ss(Eqn::T::from(20.0));
                match ret {
                    Ok(_) => {}
                    Err(LinearSolverFailure::Fatal) => break Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        break Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.staggered1_newton_iterate(is) {
                Ok(()) => break Ok(()),
                Err(fail) if fail.is_recoverable() && !call_setup => {
                    call_setup = true;
                    cause = SetupCause::BadJacobian;
                    continue;
                }
                Err(fail) => break Err(fail),
            }
        };

        if retval.is_err() {
            self.stats.num_sens_nonlin_conv_fails += 1;
            self.stats.num_sens_nonlin_conv_fails_per[is] += 1;
        }
        retval
    }

    fn staggered1_newton_iterate(&mut self, is: usize) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();

        if let Some(sens) = self.sens.as_mut() {
            sens.ee[is].fill(Eqn::T::zero());
        }

        loop {
            self.stats.num_sens_nonlin_iters += 1;
            self.stats.num_sens_nonlin_iters_per[is] += 1;

            let mut delnrm = Eqn::T::zero();
            if let Some(sens) = self.sens.as_mut() {
                match self.ls.solve(
                    &mut self.eqn,
                    &mut sens.delta1,
                    &sens.ewt[is],
                    &self.yy,
                    &self.yp,
                    &self.delta,
                ) {
                    Ok(()) => {}
                    Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSolveFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        return Err(StepFailure::LSolveRecoverable)
                    }
                }
                sens.ee[is].axpy(-one, &sens.delta1, one);
                sens.yy1.axpy(-one, &sens.delta1, one);
                sens.yp1.axpy(-self.cj, &sens.delta1, one);
                delnrm = sens.delta1.wrms_norm(&sens.ewt[is]);
            }

            let ss = if mnewt == 0 {
                if delnrm <= self.toldel {
                    return Ok(());
                }
                oldnrm = delnrm;
                self.sens.as_ref().map_or(Eqn::T::zero(), |s| s.ss1[is])
            } else {
                let rate = (delnrm / oldnrm).powf(one / Eqn::T::from_usize(mnewt));
                if rate > Eqn::T::from(RATEMAX) {
                    return Err(StepFailure::NonConvergence);
                }
                let ss = rate / (one - rate);
                if let Some(sens) = self.sens.as_mut() {
                    sens.ss1[is] = ss;
                }
                ss
            };
            if ss * delnrm <= self.eps_newt {
                return Ok(());
            }

            mnewt += 1;
            let maxcor = self.sens.as_ref().map_or(1, |s| s.maxcor);
            if mnewt >= maxcor {
                return Err(StepFailure::NonConvergence);
            }

            self.sens_residual_one(is)?;
        }
    }

    /// Local error estimates at orders k, k-1, k-2 and the error test.
    /// Also decides a possible order reduction for the next step (`knew`).
    fn test_error(&mut self, ck: Eqn::T) -> (ErrEst<Eqn::T>, bool) {
        let one = Eqn::T::one();
        let half = Eqn::T::from(0.5);
        let sensi_sim = self.sens.as_ref().is_some_and(|s| {
            s.ism == SensMethod::Simultaneous && s.errcon
        });

        let mut enorm_k = self.wrms_norm(&self.ee, &self.ewt, self.suppressalg);
        if sensi_sim {
            if let Some(sens) = self.sens.as_ref() {
                for is in 0..sens.params.ns() {
                    let snrm = self.wrms_norm(&sens.ee[is], &sens.ewt[is], self.suppressalg);
                    if snrm > enorm_k {
                        enorm_k = snrm;
                    }
                }
            }
        }
        let erk = self.sigma[self.kk] * enorm_k;
        let terk = Eqn::T::from_usize(self.kk + 1) * erk;

        self.knew = self.kk;
        let mut est = erk;
        let mut erkm1 = Eqn::T::zero();

        if self.kk > 1 {
            self.delta
                .linear_sum(one, &self.phi[self.kk], one, &self.ee);
            let mut enorm_km1 = self.wrms_norm(&self.delta, &self.ewt, self.suppressalg);
            if sensi_sim {
                if let Some(sens) = self.sens.as_mut() {
                    for is in 0..sens.params.ns() {
                        sens.delta[is].linear_sum(
                            one,
                            &sens.phi[self.kk][is],
                            one,
                            &sens.ee[is],
                        );
                    }
                }
                if let Some(sens) = self.sens.as_ref() {
                    for is in 0..sens.params.ns() {
                        let snrm =
                            self.wrms_norm(&sens.delta[is], &sens.ewt[is], self.suppressalg);
                        if snrm > enorm_km1 {
                            enorm_km1 = snrm;
                        }
                    }
                }
            }
            erkm1 = self.sigma[self.kk - 1] * enorm_km1;
            let terkm1 = Eqn::T::from_usize(self.kk) * erkm1;

            if self.kk == 2 && terkm1 <= half * terk {
                self.knew = self.kk - 1;
                est = erkm1;
            }

            if self.kk > 2 {
                self.delta
                    .axpy(one, &self.phi[self.kk - 1], one);
                let mut enorm_km2 = self.wrms_norm(&self.delta, &self.ewt, self.suppressalg);
                if sensi_sim {
                    if let Some(sens) = self.sens.as_mut() {
                        for is in 0..sens.params.ns() {
                            sens.delta[is].axpy(one, &sens.phi[self.kk - 1][is], one);
                        }
                    }
                    if let Some(sens) = self.sens.as_ref() {
                        for is in 0..sens.params.ns() {
                            let snrm =
                                self.wrms_norm(&sens.delta[is], &sens.ewt[is], self.suppressalg);
                            if snrm > enorm_km2 {
                                enorm_km2 = snrm;
                            }
                        }
                    }
                }
                let erkm2 = self.sigma[self.kk - 2] * enorm_km2;
                let terkm2 = Eqn::T::from_usize(self.kk - 1) * erkm2;
                if terkm1.max(terkm2) <= terk {
                    self.knew = self.kk - 1;
                    est = erkm1;
                }
            }
        }

        let passed = ck * enorm_k <= one;
        (ErrEst { est, erk, erkm1 }, passed)
    }

    /// Quadrature error estimates, possibly lowering the order decision,
    /// and the quadrature error test.
    fn quad_test_error(&mut self, ck: Eqn::T) -> (ErrEst<Eqn::T>, bool) {
        let one = Eqn::T::one();
        let half = Eqn::T::from(0.5);
        let kk = self.kk;
        let sigma_k = self.sigma[kk];
        let sigma_km1 = if kk > 1 { self.sigma[kk - 1] } else { one };
        let sigma_km2 = if kk > 2 { self.sigma[kk - 2] } else { one };
        let mut knew = self.knew;

        let (est, erk, erkm1, failed) = {
            let Some(quad) = self.quad.as_mut() else {
                return (
                    ErrEst {
                        est: Eqn::T::zero(),
                        erk: Eqn::T::zero(),
                        erkm1: Eqn::T::zero(),
                    },
                    true,
                );
            };
            let enorm_q = quad.ee.wrms_norm(&quad.ewt);
            let er_qk = sigma_k * enorm_q;
            let ter_qk = Eqn::T::from_usize(kk + 1) * er_qk;
            let mut est_q = er_qk;
            let mut er_qkm1 = Eqn::T::zero();

            if kk > 1 {
                // use ypQ as scratch
                quad.yp.linear_sum(one, &quad.phi[kk], one, &quad.ee);
                er_qkm1 = sigma_km1 * quad.yp.wrms_norm(&quad.ewt);
                let ter_qkm1 = Eqn::T::from_usize(kk) * er_qkm1;

                if knew != kk {
                    // order reduction already decided; just track the
                    // estimate
                    est_q = er_qkm1;
                } else {
                    if kk == 2 && ter_qkm1 <= half * ter_qk {
                        knew = kk - 1;
                        est_q = er_qkm1;
                    }
                    if kk > 2 {
                        quad.yp.axpy(one, &quad.phi[kk - 1], one);
                        let er_qkm2 = sigma_km2 * quad.yp.wrms_norm(&quad.ewt);
                        let ter_qkm2 = Eqn::T::from_usize(kk - 1) * er_qkm2;
                        if ter_qkm1.max(ter_qkm2) <= ter_qk {
                            knew = kk - 1;
                            est_q = er_qkm1;
                        }
                    }
                }
            }
            (est_q, er_qk, er_qkm1, ck * enorm_q > one)
        };
        self.knew = knew;
        if failed {
            self.stats.num_quad_err_test_fails += 1;
        }
        (ErrEst { est, erk, erkm1 }, !failed)
    }

    /// Sensitivity error estimates for the staggered corrector.
    fn staggered_test_error(&mut self, ck: Eqn::T) -> (ErrEst<Eqn::T>, bool) {
        let one = Eqn::T::one();
        let half = Eqn::T::from(0.5);
        let kk = self.kk;

        let mut enorm_k = Eqn::T::zero();
        if let Some(sens) = self.sens.as_ref() {
            for is in 0..sens.params.ns() {
                let snrm = self.wrms_norm(&sens.ee[is], &sens.ewt[is], self.suppressalg);
                if snrm > enorm_k {
                    enorm_k = snrm;
                }
            }
        }
        let erk = self.sigma[kk] * enorm_k;
        let terk = Eqn::T::from_usize(kk + 1) * erk;
        let mut est = erk;
        let mut erkm1 = Eqn::T::zero();

        if kk > 1 {
            if let Some(sens) = self.sens.as_mut() {
                for is in 0..sens.params.ns() {
                    sens.delta[is].linear_sum(one, &sens.phi[kk][is], one, &sens.ee[is]);
                }
            }
            let mut enorm_km1 = Eqn::T::zero();
            if let Some(sens) = self.sens.as_ref() {
                for is in 0..sens.params.ns() {
                    let snrm = self.wrms_norm(&sens.delta[is], &sens.ewt[is], self.suppressalg);
                    if snrm > enorm_km1 {
                        enorm_km1 = snrm;
                    }
                }
            }
            erkm1 = self.sigma[kk - 1] * enorm_km1;
            let terkm1 = Eqn::T::from_usize(kk) * erkm1;

            if self.knew != kk {
                est = erkm1;
            } else {
                if kk == 2 && terkm1 <= half * terk {
                    self.knew = kk - 1;
                    est = erkm1;
                }
                if kk > 2 {
                    if let Some(sens) = self.sens.as_mut() {
                        for is in 0..sens.params.ns() {
                            sens.delta[is].axpy(one, &sens.phi[kk - 1][is], one);
                        }
                    }
                    let mut enorm_km2 = Eqn::T::zero();
                    if let Some(sens) = self.sens.as_ref() {
                        for is in 0..sens.params.ns() {
                            let snrm =
                                self.wrms_norm(&sens.delta[is], &sens.ewt[is], self.suppressalg);
                            if snrm > enorm_km2 {
                                enorm_km2 = snrm;
                            }
                        }
                    }
                    let erkm2 = self.sigma[kk - 2] * enorm_km2;
                    let terkm2 = Eqn::T::from_usize(kk - 1) * erkm2;
                    if terkm1.max(terkm2) <= terk {
                        self.knew = kk - 1;
                        est = erkm1;
                    }
                }
            }
        }

        let failed = ck * enorm_k > one;
        if failed {
            self.stats.num_sens_err_test_fails += 1;
        }
        (ErrEst { est, erk, erkm1 }, !failed)
    }

    /// Error estimates and test for the `is`-th sensitivity (staggered-1).
    fn staggered1_test_error(&mut self, is: usize, ck: Eqn::T) -> (ErrEst<Eqn::T>, bool) {
        let one = Eqn::T::one();
        let half = Eqn::T::from(0.5);
        let kk = self.kk;

        let mut enorm_k = Eqn::T::zero();
        if let Some(sens) = self.sens.as_ref() {
            enorm_k = self.wrms_norm(&sens.ee[is], &sens.ewt[is], self.suppressalg);
        }
        let erk = self.sigma[kk] * enorm_k;
        let terk = Eqn::T::from_usize(kk + 1) * erk;
        let mut est = erk;
        let mut erkm1 = Eqn::T::zero();

        if kk > 1 {
            if let Some(sens) = self.sens.as_mut() {
                sens.delta1
                    .linear_sum(one, &sens.phi[kk][is], one, &sens.ee[is]);
            }
            let mut enorm_km1 = Eqn::T::zero();
            if let Some(sens) = self.sens.as_ref() {
                enorm_km1 = self.wrms_norm(&sens.delta1, &sens.ewt[is], self.suppressalg);
            }
            erkm1 = self.sigma[kk - 1] * enorm_km1;
            let terkm1 = Eqn::T::from_usize(kk) * erkm1;

            if self.knew != kk {
                est = erkm1;
            } else {
                if kk == 2 && terkm1 <= half * terk {
                    self.knew = kk - 1;
                    est = erkm1;
                }
                if kk > 2 {
                    if let Some(sens) = self.sens.as_mut() {
                        sens.delta1.axpy(one, &sens.phi[kk - 1][is], one);
                    }
                    let mut enorm_km2 = Eqn::T::zero();
                    if let Some(sens) = self.sens.as_ref() {
                        enorm_km2 =
                            self.wrms_norm(&sens.delta1, &sens.ewt[is], self.suppressalg);
                    }
                    let erkm2 = self.sigma[kk - 2] * enorm_km2;
                    let terkm2 = Eqn::T::from_usize(kk - 1) * erkm2;
                    if terkm1.max(terkm2) <= terk {
                        self.knew = kk - 1;
                        est = erkm1;
                    }
                }
            }
        }

        let failed = ck * enorm_k > one;
        if failed {
            self.stats.num_sens_err_test_fails += 1;
            self.stats.num_sens_err_test_fails_per[is] += 1;
        }
        (ErrEst { est, erk, erkm1 }, !failed)
    }

    /// Undo the phi-star scaling and the `tn`/`psi` advance of a failed
    /// step attempt. After this the history is bit-identical to its
    /// pre-step state.
    pub(crate) fn restore(&mut self, saved_t: Eqn::T) {
        let one = Eqn::T::one();
        self.tn = saved_t;
        for j in 1..=self.kk {
            self.psi[j - 1] = self.psi[j] - self.hh;
        }
        for j in self.ns..=self.kk {
            self.phi[j].scale_mut(one / self.beta[j]);
        }
        if let Some(quad) = self.quad.as_mut() {
            for j in self.ns..=self.kk {
                quad.phi[j].scale_mut(one / self.beta[j]);
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for j in self.ns..=self.kk {
                let rbeta = one / self.beta[j];
                for p in sens.phi[j].iter_mut() {
                    p.scale_mut(rbeta);
                }
            }
        }
    }

    /// Decide between a retry (`Ok`) and a final failure (`Err`) after a
    /// restored step, adjusting step size and order on the way.
    fn handle_failure(
        &mut self,
        nflag: StepFailure,
        ncf: &mut usize,
        nef: &mut usize,
        est: Eqn::T,
    ) -> Result<(), SolveError> {
        let one = Eqn::T::one();
        let quarter = Eqn::T::from(0.25);
        self.phase = 1;

        if nflag != StepFailure::ErrorTest {
            self.stats.num_nonlin_conv_fails += 1;

            match nflag {
                StepFailure::ResFatal => {
                    return Err(SolveError::ResidualFailure { t: self.tn.into() })
                }
                StepFailure::LSetupFatal => {
                    return Err(SolveError::LinearSetupFailure { t: self.tn.into() })
                }
                StepFailure::LSolveFatal => {
                    return Err(SolveError::LinearSolveFailure { t: self.tn.into() })
                }
                StepFailure::SensDQFatal => {
                    return Err(SolveError::SensDQFailed { t: self.tn.into() })
                }
                _ => {}
            }

            *ncf += 1;
            let at_hmin = self.hmin > Eqn::T::zero()
                && self.hh.abs() <= self.hmin * (one + Eqn::T::EPSILON);
            if nflag != StepFailure::ConstraintRecoverable {
                self.rr = quarter;
            }
            self.hh *= self.rr;

            if *ncf < self.maxncf && !at_hmin {
                return Ok(());
            }
            return Err(match nflag {
                StepFailure::ResRecoverable => {
                    SolveError::RepeatedResidualError { t: self.tn.into() }
                }
                StepFailure::ConstraintRecoverable => {
                    SolveError::ConstraintFailure { t: self.tn.into() }
                }
                _ => SolveError::ConvergenceFailure {
                    t: self.tn.into(),
                    h: self.hh.into(),
                },
            });
        }

        // error test failed
        *nef += 1;
        self.stats.num_err_test_fails += 1;
        let at_hmin =
            self.hmin > Eqn::T::zero() && self.hh.abs() <= self.hmin * (one + Eqn::T::EPSILON);

        if *nef == 1 {
            // keep or lower the order, step ratio from the error estimate
            self.kk = self.knew;
            self.rr = Eqn::T::from(0.9)
                * (Eqn::T::from(2.0) * est + Eqn::T::from(1e-4))
                    .powf(-one / Eqn::T::from_usize(self.kk + 1));
            self.rr = self.rr.max(quarter).min(Eqn::T::from(0.9));
        } else if *nef == 2 {
            self.kk = self.knew;
            self.rr = quarter;
        } else if *nef < self.maxnef {
            self.kk = 1;
            self.rr = quarter;
        } else {
            return Err(SolveError::ErrorTestFailure {
                t: self.tn.into(),
                h: self.hh.into(),
            });
        }
        if at_hmin {
            return Err(SolveError::ErrorTestFailure {
                t: self.tn.into(),
                h: self.hh.into(),
            });
        }
        self.hh *= self.rr;
        Ok(())
    }

    /// Retrying the very first step: the first-order history column was
    /// built from `h`, so it must follow the step-size reduction.
    fn reset_first_step(&mut self) {
        self.psi[0] = self.hh;
        self.phi[1].scale_mut(self.rr);
        if let Some(quad) = self.quad.as_mut() {
            quad.phi[1].scale_mut(self.rr);
        }
        if let Some(sens) = self.sens.as_mut() {
            for p in sens.phi[1].iter_mut() {
                p.scale_mut(self.rr);
            }
        }
    }

    /// Commit a successful step: update counters and the history arrays,
    /// and choose the order and step size for the next step.
    fn complete_step(&mut self, error_k: Eqn::T, error_km1: Eqn::T) {
        let one = Eqn::T::one();
        let two = Eqn::T::from(2.0);

        self.stats.num_steps += 1;
        let kdiff = self.kk as i64 - self.kused as i64;
        self.kused = self.kk;
        self.hused = self.hh;

        if self.knew + 1 == self.kk || self.kk == self.maxord {
            self.phase = 1;
        }

        if self.phase == 0 {
            // raise order and double the step until the usual controller
            // takes over; after the first step only, since the needed
            // history is not there yet
            if self.stats.num_steps > 1 {
                self.kk += 1;
                let mut hnew = two * self.hh;
                let temp = hnew.abs() * self.hmax_inv;
                if temp > one {
                    hnew /= temp;
                }
                self.hh = hnew;
            }
        } else {
            #[derive(PartialEq)]
            enum Action {
                Lower,
                Maintain,
                Raise,
            }

            let mut error_kp1 = Eqn::T::zero();
            let action = if self.knew + 1 == self.kk {
                Action::Lower
            } else if self.kk == self.maxord || self.kk + 1 >= self.ns || kdiff == 1 {
                Action::Maintain
            } else {
                // estimate the error at order k+1, then choose among
                // k-1, k, k+1 from the truncation error norms
                self.tempv1
                    .linear_sum(one, &self.ee, -one, &self.phi[self.kk + 1]);
                let temp = self.wrms_norm(&self.tempv1, &self.ewt, self.suppressalg);
                error_kp1 = temp / Eqn::T::from_usize(self.kk + 2);

                if let Some(quad) = self.quad.as_mut() {
                    if quad.errcon {
                        quad.yp
                            .linear_sum(one, &quad.ee, -one, &quad.phi[self.kk + 1]);
                        let er_qkp1 =
                            quad.yp.wrms_norm(&quad.ewt) / Eqn::T::from_usize(self.kk + 2);
                        if er_qkp1 > error_kp1 {
                            error_kp1 = er_qkp1;
                        }
                    }
                }
                if self.sens.as_ref().is_some_and(|s| s.errcon) {
                    let mut er_skp1 = Eqn::T::zero();
                    if let Some(sens) = self.sens.as_mut() {
                        for is in 0..sens.params.ns() {
                            sens.delta1.linear_sum(
                                one,
                                &sens.ee[is],
                                -one,
                                &sens.phi[self.kk + 1][is],
                            );
                            let snrm = match (&self.id, self.suppressalg) {
                                (Some(id), true) => {
                                    sens.delta1.wrms_norm_masked(&sens.ewt[is], id)
                                }
                                _ => sens.delta1.wrms_norm(&sens.ewt[is]),
                            };
                            let er = snrm / Eqn::T::from_usize(self.kk + 2);
                            if er > er_skp1 {
                                er_skp1 = er;
                            }
                        }
                    }
                    if er_skp1 > error_kp1 {
                        error_kp1 = er_skp1;
                    }
                }

                let terk = Eqn::T::from_usize(self.kk + 1) * error_k;
                let terkp1 = Eqn::T::from_usize(self.kk + 2) * error_kp1;
                if self.kk == 1 {
                    if terkp1 >= Eqn::T::from(0.5) * terk {
                        Action::Maintain
                    } else {
                        Action::Raise
                    }
                } else {
                    let terkm1 = Eqn::T::from_usize(self.kk) * error_km1;
                    if terkm1 <= terk.min(terkp1) {
                        Action::Lower
                    } else if terkp1 >= terk {
                        Action::Maintain
                    } else {
                        Action::Raise
                    }
                }
            };

            let est = match action {
                Action::Raise => {
                    self.kk += 1;
                    error_kp1
                }
                Action::Lower => {
                    self.kk -= 1;
                    error_km1
                }
                Action::Maintain => error_k,
            };

            // rr = tentative h_new / h; double when rr >= 2, shrink into
            // [0.5, 0.9] when rr <= 1, keep h otherwise
            let mut hnew = self.hh;
            self.rr = (two * est + Eqn::T::from(1e-4))
                .powf(-one / Eqn::T::from_usize(self.kk + 1));
            if self.rr >= two {
                hnew = two * self.hh;
                let temp = hnew.abs() * self.hmax_inv;
                if temp > one {
                    hnew /= temp;
                }
            } else if self.rr <= one {
                self.rr = self.rr.max(Eqn::T::from(0.5)).min(Eqn::T::from(0.9));
                hnew = self.hh * self.rr;
            }
            self.hh = hnew;
        }

        // save the correction for a possible order raise later on
        if self.kused < self.maxord {
            self.phi[self.kused + 1].copy_from(&self.ee);
            if let Some(quad) = self.quad.as_mut() {
                if quad.errcon {
                    quad.phi[self.kused + 1].copy_from(&quad.ee);
                }
            }
            if let Some(sens) = self.sens.as_mut() {
                if sens.errcon {
                    for is in 0..sens.params.ns() {
                        sens.phi[self.kused + 1][is].copy_from(&sens.ee[is]);
                    }
                }
            }
        }

        // fold the correction into the history
        self.phi[self.kused].axpy(one, &self.ee, one);
        for j in (0..self.kused).rev() {
            phi_add(&mut self.phi, j);
        }
        if let Some(quad) = self.quad.as_mut() {
            quad.phi[self.kused].axpy(one, &quad.ee, one);
            for j in (0..self.kused).rev() {
                phi_add(&mut quad.phi, j);
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                sens.phi[self.kused][is].axpy(one, &sens.ee[is], one);
                for j in (0..self.kused).rev() {
                    let (lo, hi) = sens.phi.split_at_mut(j + 1);
                    lo[j][is].axpy(one, &hi[0][is], one);
                }
            }
        }
    }
}
