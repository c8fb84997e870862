//! One internal step of the Nordsieck stepper: predict by the Pascal
//! shift, correct by functional or Newton iteration, run the weighted local
//! error test, and commit or restore. Step size and order for the next
//! step come from bias-weighted error estimates at orders q-1, q, q+1.

use nalgebra::{ComplexField, RealField};
use num_traits::identities::{One, Zero};

use super::{
    Corrector, Method, OdeSolver, OdeSystem, LONG_WAIT, MXNEF1, SMALL_NEF, SMALL_NST,
};
use crate::error::SolveError;
use crate::linear_solver::SetupCause;
use crate::sens::SensMethod;
use crate::{LinearSolverFailure, Scalar, Vector};

const RATEMAX: f64 = 0.9;
const DGMAX: f64 = 0.25;
const ETAMX2: f64 = 10.0;
const ETAMX3: f64 = 10.0;
const ETAMXF: f64 = 0.2;
const ETAMIN: f64 = 0.1;
const ETACF: f64 = 0.25;
const ADDON: f64 = 1e-6;
const BIAS1: f64 = 6.0;
const BIAS2: f64 = 6.0;
const BIAS3: f64 = 10.0;
const ONEPSM: f64 = 1.000001;
const THRESH: f64 = 1.5;

/// Corrector-phase failure of the ODE stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepFailure {
    LSetupRecoverable,
    LSetupFatal,
    LSolveRecoverable,
    LSolveFatal,
    NonConvergence,
}

impl StepFailure {
    fn is_recoverable(self) -> bool {
        !matches!(self, StepFailure::LSetupFatal | StepFailure::LSolveFatal)
    }
}

impl<Eqn: OdeSystem> OdeSolver<Eqn> {
    /// Take one internal step from `tn` to `tn + h`.
    pub(crate) fn step(&mut self) -> Result<(), SolveError> {
        let one = Eqn::T::one();
        let saved_t = self.tn;
        let mut ncf = 0usize;
        let mut nef = 0usize;

        if self.stats.num_steps > 0 && self.hprime != self.h {
            self.adjust_params();
        }

        let sensi_stgr = matches!(
            self.sens.as_ref().map(|s| s.ism),
            Some(SensMethod::Staggered)
        );
        let sensi_stgr1 = matches!(
            self.sens.as_ref().map(|s| s.ism),
            Some(SensMethod::Staggered1)
        );

        let mut prev_conv_fail = false;
        let mut prev_err_fail = false;
        let dsm_final: Eqn::T;

        loop {
            self.predict();
            self.set_coeffs();

            if let Err(fail) = self.nonlinear_solve(prev_conv_fail, prev_err_fail) {
                self.restore(saved_t);
                prev_conv_fail = true;
                self.handle_conv_failure(fail, &mut ncf)?;
                continue;
            }

            // local error test on the state (plus simultaneous
            // sensitivities when they are error-controlled)
            let mut acnrm = self.acor.wrms_norm(&self.ewt);
            if self.sim_sens_errcon() {
                if let Some(sens) = self.sens.as_ref() {
                    for is in 0..sens.ns() {
                        let snrm = sens.acor[is].wrms_norm(&sens.ewt[is]);
                        if snrm > acnrm {
                            acnrm = snrm;
                        }
                    }
                }
            }
            let mut dsm = acnrm * self.tq[2];
            if dsm > one {
                prev_err_fail = true;
                self.handle_etest_failure(saved_t, &mut nef, dsm)?;
                continue;
            }

            // quadrature correction and its error test
            if self.quad.is_some() {
                let acnrm_q = self.quad_correct();
                if self.quad.as_ref().is_some_and(|q| q.errcon) {
                    let dsm_q = acnrm_q * self.tq[2];
                    if dsm_q > one {
                        self.stats.num_quad_err_test_fails += 1;
                        prev_err_fail = true;
                        self.handle_etest_failure(saved_t, &mut nef, dsm_q)?;
                        continue;
                    }
                    if dsm_q > dsm {
                        dsm = dsm_q;
                    }
                }
            }

            // staggered sensitivity correction and its error test
            if sensi_stgr || sensi_stgr1 {
                let ret = if sensi_stgr {
                    self.staggered_nonlinear_solve()
                } else {
                    self.staggered1_nonlinear_solve_all()
                };
                match ret {
                    Err(fail) => {
                        self.restore(saved_t);
                        prev_conv_fail = true;
                        self.handle_conv_failure(fail, &mut ncf)?;
                        continue;
                    }
                    Ok(()) => {}
                }
                if self.sens.as_ref().is_some_and(|s| s.errcon) {
                    let mut acnrm_s = Eqn::T::zero();
                    if let Some(sens) = self.sens.as_ref() {
                        for is in 0..sens.ns() {
                            let snrm = sens.acor[is].wrms_norm(&sens.ewt[is]);
                            if snrm > acnrm_s {
                                acnrm_s = snrm;
                            }
                        }
                    }
                    let dsm_s = acnrm_s * self.tq[2];
                    if dsm_s > one {
                        self.stats.num_sens_err_test_fails += 1;
                        prev_err_fail = true;
                        self.handle_etest_failure(saved_t, &mut nef, dsm_s)?;
                        continue;
                    }
                    if dsm_s > dsm {
                        dsm = dsm_s;
                    }
                }
            }

            dsm_final = dsm;
            break;
        }

        self.complete_step();
        self.prepare_next_step(dsm_final);
        Ok(())
    }

    fn sim_sens_errcon(&self) -> bool {
        self.sens
            .as_ref()
            .is_some_and(|s| s.ism == SensMethod::Simultaneous && s.errcon)
    }

    fn sim_sens(&self) -> bool {
        self.sens
            .as_ref()
            .is_some_and(|s| s.ism == SensMethod::Simultaneous)
    }

    // ---- correctors ----------------------------------------------------

    fn nonlinear_solve(
        &mut self,
        prev_conv_fail: bool,
        prev_err_fail: bool,
    ) -> Result<(), StepFailure> {
        if self.gamrat != Eqn::T::one() {
            self.ss = Eqn::T::from(100.0);
        }
        match self.corrector {
            Corrector::Functional => self.nls_functional(),
            Corrector::Newton(_) => self.nls_newton(prev_conv_fail, prev_err_fail),
        }
    }

    /// Fixed-point iteration `y <- zn[0] + rl1 * (h * f(t, y) - zn[1])`.
    fn nls_functional(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let sensi_sim = self.sim_sens();

        self.eqn.rhs(self.tn, &self.zn[0], &mut self.tempv);
        self.stats.num_rhs_evals += 1;
        self.acor.fill(Eqn::T::zero());
        self.y.copy_from(&self.zn[0]);
        if sensi_sim {
            self.ftemp.copy_from(&self.tempv);
            self.sens_y_from_zn0();
            self.sens_rhs_all_current();
            if let Some(sens) = self.sens.as_mut() {
                for a in sens.acor.iter_mut() {
                    a.fill(Eqn::T::zero());
                }
            }
        }

        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();
        loop {
            self.stats.num_nonlin_iters += 1;

            // total correction for this iterate
            self.tempv.axpy(-one, &self.zn[1], self.h);
            self.tempv.scale_mut(self.rl1);
            self.y.linear_sum(one, &self.zn[0], one, &self.tempv);
            // ftemp = change from the previous iterate
            self.ftemp.linear_sum(one, &self.tempv, -one, &self.acor);
            let mut delnrm = self.ftemp.wrms_norm(&self.ewt);
            self.acor.copy_from(&self.tempv);

            if sensi_sim {
                if let Some(sens) = self.sens.as_mut() {
                    for is in 0..sens.params.ns() {
                        sens.tempv.copy_from(&sens.sdot[is]);
                        sens.tempv.axpy(-one, &sens.zn[1][is], self.h);
                        sens.tempv.scale_mut(self.rl1);
                        sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.tempv);
                        sens.ftemp.linear_sum(one, &sens.tempv, -one, &sens.acor[is]);
                        let snrm = sens.ftemp.wrms_norm(&sens.ewt[is]);
                        if snrm > delnrm {
                            delnrm = snrm;
                        }
                        sens.acor[is].copy_from(&sens.tempv);
                    }
                }
            }

            if self.convergence_check(&mut mnewt, &mut oldnrm, delnrm)? {
                return Ok(());
            }

            self.eqn.rhs(self.tn, &self.y, &mut self.tempv);
            self.stats.num_rhs_evals += 1;
            if sensi_sim {
                self.ftemp.copy_from(&self.tempv);
                self.sens_rhs_all_current();
            }
        }
    }

    /// Modified Newton iteration on `y - gamma f(t, y) - a_n = 0`, with
    /// the Jacobian solver refreshed per the setup policy.
    fn nls_newton(
        &mut self,
        prev_conv_fail: bool,
        prev_err_fail: bool,
    ) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let sensi_sim = self.sim_sens();

        let mut cause = if prev_conv_fail {
            SetupCause::Other
        } else {
            SetupCause::NoFailure
        };
        let mut call_setup = prev_conv_fail
            || prev_err_fail
            || self.stats.num_steps == 0
            || (self.gamrat - one).abs() > Eqn::T::from(DGMAX)
            || self.force_setup;

        loop {
            self.eqn.rhs(self.tn, &self.zn[0], &mut self.ftemp);
            self.stats.num_rhs_evals += 1;
            self.y.copy_from(&self.zn[0]);
            self.acor.fill(Eqn::T::zero());
            if sensi_sim {
                self.sens_y_from_zn0();
                self.sens_rhs_all_current();
                if let Some(sens) = self.sens.as_mut() {
                    for a in sens.acor.iter_mut() {
                        a.fill(Eqn::T::zero());
                    }
                }
            }

            self.jcur = false;
            if call_setup {
                let Corrector::Newton(ls) = &mut self.corrector else {
                    return Err(StepFailure::LSetupFatal);
                };
                let ret = ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.zn[0],
                    &self.ftemp,
                    self.gamma,
                    &self.ewt,
                    cause,
                );
                self.stats.num_lin_setups += 1;
                self.force_setup = false;
                self.gammap = self.gamma;
                self.gamrat = one;
                self.ss = Eqn::T::from(20.0);
                match ret {
                    Ok(jcur) => self.jcur = jcur,
                    Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        return Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.newton_iteration(sensi_sim) {
                Ok(()) => return Ok(()),
                Err(fail) if fail.is_recoverable() && !self.jcur && !call_setup => {
                    call_setup = true;
                    cause = SetupCause::BadJacobian;
                    continue;
                }
                Err(fail) if fail.is_recoverable() && !self.jcur && call_setup => {
                    // the solver did not refresh its Jacobian data even
                    // when asked; give up on this attempt
                    return Err(fail);
                }
                Err(fail) => return Err(fail),
            }
        }
    }

    fn newton_iteration(&mut self, sensi_sim: bool) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();

        loop {
            self.stats.num_nonlin_iters += 1;

            // residual b = gamma * f - (rl1 * zn[1] + acor)
            self.tempv.linear_sum(self.rl1, &self.zn[1], one, &self.acor);
            self.tempv.axpy(self.gamma, &self.ftemp, -one);

            {
                let Corrector::Newton(ls) = &mut self.corrector else {
                    return Err(StepFailure::LSolveFatal);
                };
                match ls.solve(&mut self.eqn, &mut self.tempv, &self.ewt, &self.y, &self.ftemp)
                {
                    Ok(()) => {}
                    Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSolveFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        return Err(StepFailure::LSolveRecoverable)
                    }
                }
            }

            let mut delnrm = self.tempv.wrms_norm(&self.ewt);
            self.acor.axpy(one, &self.tempv, one);
            self.y.linear_sum(one, &self.zn[0], one, &self.acor);

            if sensi_sim {
                if let Some(sens) = self.sens.as_mut() {
                    let Corrector::Newton(ls) = &mut self.corrector else {
                        return Err(StepFailure::LSolveFatal);
                    };
                    for is in 0..sens.params.ns() {
                        sens.tempv
                            .linear_sum(self.rl1, &sens.zn[1][is], one, &sens.acor[is]);
                        sens.tempv.axpy(self.gamma, &sens.sdot[is], -one);
                        match ls.solve(
                            &mut self.eqn,
                            &mut sens.tempv,
                            &sens.ewt[is],
                            &self.y,
                            &self.ftemp,
                        ) {
                            Ok(()) => {}
                            Err(LinearSolverFailure::Fatal) => {
                                return Err(StepFailure::LSolveFatal)
                            }
                            Err(LinearSolverFailure::Recoverable) => {
                                return Err(StepFailure::LSolveRecoverable)
                            }
                        }
                        let snrm = sens.tempv.wrms_norm(&sens.ewt[is]);
                        if snrm > delnrm {
                            delnrm = snrm;
                        }
                        sens.acor[is].axpy(one, &sens.tempv, one);
                        sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.acor[is]);
                    }
                }
            }

            if self.convergence_check(&mut mnewt, &mut oldnrm, delnrm)? {
                return Ok(());
            }

            self.eqn.rhs(self.tn, &self.y, &mut self.ftemp);
            self.stats.num_rhs_evals += 1;
            if sensi_sim {
                self.sens_rhs_all_current();
            }
        }
    }

    /// Shared rate-based convergence test: direct acceptance on a tiny
    /// first iterate, then `rate/(1-rate) * |del| <= eps_newt`.
    fn convergence_check(
        &mut self,
        mnewt: &mut usize,
        oldnrm: &mut Eqn::T,
        delnrm: Eqn::T,
    ) -> Result<bool, StepFailure> {
        let one = Eqn::T::one();
        if *mnewt == 0 {
            *oldnrm = delnrm;
            if delnrm <= self.toldel {
                return Ok(true);
            }
        } else {
            let rate = (delnrm / *oldnrm).powf(one / Eqn::T::from_usize(*mnewt));
            if rate > Eqn::T::from(RATEMAX) {
                return Err(StepFailure::NonConvergence);
            }
            self.ss = rate / (one - rate);
        }
        if self.ss * delnrm <= self.eps_newt {
            return Ok(true);
        }
        *mnewt += 1;
        if *mnewt >= self.maxcor {
            return Err(StepFailure::NonConvergence);
        }
        Ok(false)
    }

    /// Single (linear) quadrature correction after the state has
    /// converged. Returns the weighted norm of the correction.
    fn quad_correct(&mut self) -> Eqn::T {
        let one = Eqn::T::one();
        let rl1 = self.rl1;
        let h = self.h;
        let mut acnrm_q = Eqn::T::zero();
        if let Some(quad) = self.quad.as_mut() {
            (quad.rhs)(self.tn, &self.y, &mut quad.tempv);
            self.stats.num_quad_rhs_evals += 1;
            quad.acor.linear_sum(h, &quad.tempv, -one, &quad.zn[1]);
            quad.acor.scale_mut(rl1);
            acnrm_q = quad.acor.wrms_norm(&quad.ewt);
        }
        acnrm_q
    }

    /// Staggered corrector for all sensitivities with the converged state.
    fn staggered_nonlinear_solve(&mut self) -> Result<(), StepFailure> {
        // refresh the state derivative at the corrected state; the
        // difference-quotient path differentiates around it
        self.eqn.rhs(self.tn, &self.y, &mut self.ftemp);
        self.stats.num_rhs_evals += 1;
        self.stats.num_rhs_evals_sens += 1;

        let newton = matches!(self.corrector, Corrector::Newton(_));
        let mut call_setup = false;
        let mut cause = SetupCause::NoFailure;

        let retval = loop {
            self.sens_y_from_zn0();
            self.sens_rhs_all_current();
            if let Some(sens) = self.sens.as_mut() {
                for a in sens.acor.iter_mut() {
                    a.fill(Eqn::T::zero());
                }
            }

            if call_setup {
                let Corrector::Newton(ls) = &mut self.corrector else {
                    break Err(StepFailure::LSetupFatal);
                };
                let ret = ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.y,
                    &self.ftemp,
                    self.gamma,
                    &self.ewt,
                    cause,
                );
                self.stats.num_sens_lin_setups += 1;
                self.gammap = self.gamma;
                self.gamrat = Eqn::T::one();
                match ret {
                    Ok(jcur) => self.jcur = jcur,
                    Err(LinearSolverFailure::Fatal) => break Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        break Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.staggered_iteration() {
                Ok(()) => break Ok(()),
                Err(fail) if fail.is_recoverable() && newton && !call_setup => {
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

    fn staggered_iteration(&mut self) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let newton = matches!(self.corrector, Corrector::Newton(_));
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();
        let maxcor_s = self.sens.as_ref().map_or(1, |s| s.maxcor);

        loop {
            self.stats.num_sens_nonlin_iters += 1;

            let mut delnrm = Eqn::T::zero();
            if let Some(sens) = self.sens.as_mut() {
                for is in 0..sens.params.ns() {
                    if newton {
                        sens.tempv
                            .linear_sum(self.rl1, &sens.zn[1][is], one, &sens.acor[is]);
                        sens.tempv.axpy(self.gamma, &sens.sdot[is], -one);
                        let Corrector::Newton(ls) = &mut self.corrector else {
                            return Err(StepFailure::LSolveFatal);
                        };
                        match ls.solve(
                            &mut self.eqn,
                            &mut sens.tempv,
                            &sens.ewt[is],
                            &self.y,
                            &self.ftemp,
                        ) {
                            Ok(()) => {}
                            Err(LinearSolverFailure::Fatal) => {
                                return Err(StepFailure::LSolveFatal)
                            }
                            Err(LinearSolverFailure::Recoverable) => {
                                return Err(StepFailure::LSolveRecoverable)
                            }
                        }
                        let snrm = sens.tempv.wrms_norm(&sens.ewt[is]);
                        if snrm > delnrm {
                            delnrm = snrm;
                        }
                        sens.acor[is].axpy(one, &sens.tempv, one);
                        sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.acor[is]);
                    } else {
                        // functional: total correction from the last
                        // sensitivity derivative
                        sens.tempv.copy_from(&sens.sdot[is]);
                        sens.tempv.axpy(-one, &sens.zn[1][is], self.h);
                        sens.tempv.scale_mut(self.rl1);
                        sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.tempv);
                        sens.ftemp.linear_sum(one, &sens.tempv, -one, &sens.acor[is]);
                        let snrm = sens.ftemp.wrms_norm(&sens.ewt[is]);
                        if snrm > delnrm {
                            delnrm = snrm;
                        }
                        sens.acor[is].copy_from(&sens.tempv);
                    }
                }
            }

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
                if let Some(sens) = self.sens.as_mut() {
                    sens.ss = rate / (one - rate);
                }
            }
            let ss = self.sens.as_ref().map_or(Eqn::T::zero(), |s| s.ss);
            if ss * delnrm <= self.eps_newt {
                return Ok(());
            }
            mnewt += 1;
            if mnewt >= maxcor_s {
                return Err(StepFailure::NonConvergence);
            }

            self.sens_rhs_all_current();
        }
    }

    /// Staggered-1: correct each sensitivity independently in sequence.
    fn staggered1_nonlinear_solve_all(&mut self) -> Result<(), StepFailure> {
        self.eqn.rhs(self.tn, &self.y, &mut self.ftemp);
        self.stats.num_rhs_evals += 1;
        self.stats.num_rhs_evals_sens += 1;

        let ns = self.sens.as_ref().map_or(0, |s| s.ns());
        for is in 0..ns {
            let ret = self.staggered1_nonlinear_solve(is);
            if let Err(fail) = ret {
                self.stats.num_sens_nonlin_conv_fails += 1;
                self.stats.num_sens_nonlin_conv_fails_per[is] += 1;
                return Err(fail);
            }
        }
        Ok(())
    }

    fn staggered1_nonlinear_solve(&mut self, is: usize) -> Result<(), StepFailure> {
        let newton = matches!(self.corrector, Corrector::Newton(_));
        let mut call_setup = false;
        let mut cause = SetupCause::NoFailure;

        loop {
            if let Some(sens) = self.sens.as_mut() {
                sens.y[is].copy_from(&sens.zn[0][is]);
                sens.acor[is].fill(Eqn::T::zero());
            }
            self.sens_rhs_one_current(is);

            if call_setup {
                let Corrector::Newton(ls) = &mut self.corrector else {
                    return Err(StepFailure::LSetupFatal);
                };
                let ret = ls.setup(
                    &mut self.eqn,
                    self.tn,
                    &self.y,
                    &self.ftemp,
                    self.gamma,
                    &self.ewt,
                    cause,
                );
                self.stats.num_sens_lin_setups += 1;
                self.gammap = self.gamma;
                self.gamrat = Eqn::T::one();
                match ret {
                    Ok(jcur) => self.jcur = jcur,
                    Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSetupFatal),
                    Err(LinearSolverFailure::Recoverable) => {
                        return Err(StepFailure::LSetupRecoverable)
                    }
                }
            }

            match self.staggered1_iteration(is) {
                Ok(()) => return Ok(()),
                Err(fail) if fail.is_recoverable() && newton && !call_setup => {
                    call_setup = true;
                    cause = SetupCause::BadJacobian;
                    continue;
                }
                Err(fail) => return Err(fail),
            }
        }
    }

    fn staggered1_iteration(&mut self, is: usize) -> Result<(), StepFailure> {
        let one = Eqn::T::one();
        let newton = matches!(self.corrector, Corrector::Newton(_));
        let mut mnewt = 0usize;
        let mut oldnrm = Eqn::T::zero();
        let maxcor_s = self.sens.as_ref().map_or(1, |s| s.maxcor);

        loop {
            self.stats.num_sens_nonlin_iters += 1;
            self.stats.num_sens_nonlin_iters_per[is] += 1;

            let mut delnrm = Eqn::T::zero();
            if let Some(sens) = self.sens.as_mut() {
                if newton {
                    sens.tempv
                        .linear_sum(self.rl1, &sens.zn[1][is], one, &sens.acor[is]);
                    sens.tempv.axpy(self.gamma, &sens.sdot[is], -one);
                    let Corrector::Newton(ls) = &mut self.corrector else {
                        return Err(StepFailure::LSolveFatal);
                    };
                    match ls.solve(
                        &mut self.eqn,
                        &mut sens.tempv,
                        &sens.ewt[is],
                        &self.y,
                        &self.ftemp,
                    ) {
                        Ok(()) => {}
                        Err(LinearSolverFailure::Fatal) => return Err(StepFailure::LSolveFatal),
                        Err(LinearSolverFailure::Recoverable) => {
                            return Err(StepFailure::LSolveRecoverable)
                        }
                    }
                    delnrm = sens.tempv.wrms_norm(&sens.ewt[is]);
                    sens.acor[is].axpy(one, &sens.tempv, one);
                    sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.acor[is]);
                } else {
                    sens.tempv.copy_from(&sens.sdot[is]);
                    sens.tempv.axpy(-one, &sens.zn[1][is], self.h);
                    sens.tempv.scale_mut(self.rl1);
                    sens.y[is].linear_sum(one, &sens.zn[0][is], one, &sens.tempv);
                    sens.ftemp.linear_sum(one, &sens.tempv, -one, &sens.acor[is]);
                    delnrm = sens.ftemp.wrms_norm(&sens.ewt[is]);
                    sens.acor[is].copy_from(&sens.tempv);
                }
            }

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
                if let Some(sens) = self.sens.as_mut() {
                    sens.ss1[is] = rate / (one - rate);
                }
            }
            let ss = self.sens.as_ref().map_or(Eqn::T::zero(), |s| s.ss1[is]);
            if ss * delnrm <= self.eps_newt {
                return Ok(());
            }
            mnewt += 1;
            if mnewt >= maxcor_s {
                return Err(StepFailure::NonConvergence);
            }

            self.sens_rhs_one_current(is);
        }
    }

    // ---- failure handling ----------------------------------------------

    /// After a restored corrector failure: reduce the step by a factor of
    /// four and retry, within the per-step budget.
    fn handle_conv_failure(
        &mut self,
        fail: StepFailure,
        ncf: &mut usize,
    ) -> Result<(), SolveError> {
        self.stats.num_nonlin_conv_fails += 1;

        match fail {
            StepFailure::LSetupFatal => {
                return Err(SolveError::LinearSetupFailure { t: self.tn.into() })
            }
            StepFailure::LSolveFatal => {
                return Err(SolveError::LinearSolveFailure { t: self.tn.into() })
            }
            _ => {}
        }

        *ncf += 1;
        let at_hmin = self.h.abs() <= self.hmin * Eqn::T::from(ONEPSM);
        if (self.hmin > Eqn::T::zero() && at_hmin) || *ncf == self.maxncf {
            return Err(SolveError::ConvergenceFailure {
                t: self.tn.into(),
                h: self.h.into(),
            });
        }
        self.etamax = Eqn::T::one();
        self.eta = Eqn::T::from(ETACF).max(self.hmin / self.h.abs());
        self.rescale();
        Ok(())
    }

    /// After a restored error-test failure: shrink (and eventually drop
    /// the order, then rebuild the first-order history) per the failure
    /// ladder.
    fn handle_etest_failure(
        &mut self,
        saved_t: Eqn::T,
        nef: &mut usize,
        dsm: Eqn::T,
    ) -> Result<(), SolveError> {
        let one = Eqn::T::one();
        // the step attempt is undone before any adjustment
        self.restore(saved_t);

        *nef += 1;
        self.stats.num_err_test_fails += 1;

        let at_hmin = self.h.abs() <= self.hmin * Eqn::T::from(ONEPSM);
        if *nef == self.maxnef || (self.hmin > Eqn::T::zero() && at_hmin) {
            return Err(SolveError::ErrorTestFailure {
                t: self.tn.into(),
                h: self.h.into(),
            });
        }

        self.etamax = one;

        if *nef <= MXNEF1 {
            let lp1 = Eqn::T::from_usize(self.q + 1);
            self.eta = one / ((Eqn::T::from(BIAS2) * dsm).powf(one / lp1) + Eqn::T::from(ADDON));
            self.eta = self
                .eta
                .max(Eqn::T::from(ETAMIN))
                .max(self.hmin / self.h.abs());
            if *nef >= SMALL_NEF {
                self.eta = self.eta.min(Eqn::T::from(ETAMXF));
            }
            self.rescale();
            return Ok(());
        }

        if self.q > 1 {
            // force an order reduction
            self.eta = Eqn::T::from(ETAMIN).max(self.hmin / self.h.abs());
            self.adjust_order(-1);
            self.q -= 1;
            self.qwait = self.q + 1;
            self.rescale();
            return Ok(());
        }

        // already at order 1: rebuild the first-order history at the
        // reduced step size
        self.eta = Eqn::T::from(ETAMIN).max(self.hmin / self.h.abs());
        self.h *= self.eta;
        self.hscale = self.h;
        self.hprime = self.h;
        self.qwait = LONG_WAIT;

        self.eqn.rhs(self.tn, &self.zn[0], &mut self.tempv);
        self.stats.num_rhs_evals += 1;
        self.zn[1].copy_from(&self.tempv);
        self.zn[1].scale_mut(self.h);
        if let Some(quad) = self.quad.as_mut() {
            (quad.rhs)(self.tn, &self.zn[0], &mut quad.tempv);
            self.stats.num_quad_rhs_evals += 1;
            quad.zn[1].copy_from(&quad.tempv);
            quad.zn[1].scale_mut(self.h);
        }
        if self.sens.is_some() {
            self.ftemp.copy_from(&self.tempv);
            self.sens_rhs_into_zn1();
            if let Some(sens) = self.sens.as_mut() {
                for z in sens.zn[1].iter_mut() {
                    z.scale_mut(self.h);
                }
            }
        }
        Ok(())
    }

    // ---- commit and controller -----------------------------------------

    fn complete_step(&mut self) {
        let one = Eqn::T::one();
        self.stats.num_steps += 1;
        self.hu = self.h;
        self.qu = self.q;

        for i in (2..=self.q).rev() {
            self.tau[i] = self.tau[i - 1];
        }
        if self.q == 1 && self.stats.num_steps > 1 {
            self.tau[2] = self.tau[1];
        }
        self.tau[1] = self.h;

        // fold the correction into the history
        for j in 0..=self.q {
            self.zn[j].axpy(self.l[j], &self.acor, one);
        }
        if let Some(quad) = self.quad.as_mut() {
            for j in 0..=self.q {
                quad.zn[j].axpy(self.l[j], &quad.acor, one);
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                for j in 0..=self.q {
                    sens.zn[j][is].axpy(self.l[j], &sens.acor[is], one);
                }
            }
        }

        self.qwait = self.qwait.saturating_sub(1);
        if self.qwait == 1 && self.q != self.qmax {
            // stash the correction for the order-raise estimate
            let qmax = self.qmax;
            self.zn[qmax].copy_from(&self.acor);
            if let Some(quad) = self.quad.as_mut() {
                if quad.errcon {
                    quad.zn[qmax].copy_from(&quad.acor);
                }
            }
            if let Some(sens) = self.sens.as_mut() {
                if sens.errcon {
                    for is in 0..sens.params.ns() {
                        sens.zn[qmax][is].copy_from(&sens.acor[is]);
                    }
                }
            }
            self.saved_tq5 = self.tq[5];
        }
    }

    fn prepare_next_step(&mut self, dsm: Eqn::T) {
        let one = Eqn::T::one();

        if self.etamax == one {
            // a failure earlier in this step froze the step size
            self.qwait = self.qwait.max(2);
            self.qprime = self.q;
            self.hprime = self.h;
            self.eta = one;
        } else {
            let lp1 = Eqn::T::from_usize(self.q + 1);
            self.etaq =
                one / ((Eqn::T::from(BIAS2) * dsm).powf(one / lp1) + Eqn::T::from(ADDON));
            if self.qwait != 0 {
                self.eta = self.etaq;
                self.qprime = self.q;
            } else {
                self.qwait = 2;
                self.etaqm1 = self.compute_etaqm1();
                self.etaqp1 = self.compute_etaqp1();
                self.choose_eta();
            }
            self.set_eta();
        }

        self.etamax = if self.stats.num_steps <= SMALL_NST {
            Eqn::T::from(ETAMX2)
        } else {
            Eqn::T::from(ETAMX3)
        };

        // leave the scaled local error estimate behind for inspection
        self.acor.scale_mut(self.tq[2]);
    }

    fn compute_etaqm1(&mut self) -> Eqn::T {
        let one = Eqn::T::one();
        if self.q <= 1 {
            return Eqn::T::zero();
        }
        let mut ddn = self.zn[self.q].wrms_norm(&self.ewt);
        if let Some(quad) = self.quad.as_ref() {
            if quad.errcon {
                let qnrm = quad.zn[self.q].wrms_norm(&quad.ewt);
                if qnrm > ddn {
                    ddn = qnrm;
                }
            }
        }
        if let Some(sens) = self.sens.as_ref() {
            if sens.errcon {
                for is in 0..sens.ns() {
                    let snrm = sens.zn[self.q][is].wrms_norm(&sens.ewt[is]);
                    if snrm > ddn {
                        ddn = snrm;
                    }
                }
            }
        }
        ddn *= self.tq[1];
        one / ((Eqn::T::from(BIAS1) * ddn).powf(one / Eqn::T::from_usize(self.q))
            + Eqn::T::from(ADDON))
    }

    fn compute_etaqp1(&mut self) -> Eqn::T {
        let one = Eqn::T::one();
        if self.q == self.qmax || self.saved_tq5 == Eqn::T::zero() {
            return Eqn::T::zero();
        }
        let lp1 = self.q + 1;
        let cquot = (self.tq[5] / self.saved_tq5)
            * (self.h / self.tau[2]).powf(Eqn::T::from_usize(lp1));
        self.tempv
            .linear_sum(-cquot, &self.zn[self.qmax], one, &self.acor);
        let mut dup = self.tempv.wrms_norm(&self.ewt);
        if let Some(quad) = self.quad.as_mut() {
            if quad.errcon {
                quad.tempv
                    .linear_sum(-cquot, &quad.zn[self.qmax], one, &quad.acor);
                let qnrm = quad.tempv.wrms_norm(&quad.ewt);
                if qnrm > dup {
                    dup = qnrm;
                }
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            if sens.errcon {
                for is in 0..sens.params.ns() {
                    sens.tempv
                        .linear_sum(-cquot, &sens.zn[self.qmax][is], one, &sens.acor[is]);
                    let snrm = sens.tempv.wrms_norm(&sens.ewt[is]);
                    if snrm > dup {
                        dup = snrm;
                    }
                }
            }
        }
        dup *= self.tq[3];
        one / ((Eqn::T::from(BIAS3) * dup).powf(one / Eqn::T::from_usize(lp1 + 1))
            + Eqn::T::from(ADDON))
    }

    fn choose_eta(&mut self) {
        let etam = self.etaqm1.max(self.etaq).max(self.etaqp1);
        if etam < Eqn::T::from(THRESH) {
            self.eta = Eqn::T::one();
            self.qprime = self.q;
            return;
        }
        if etam == self.etaq {
            self.eta = self.etaq;
            self.qprime = self.q;
        } else if etam == self.etaqm1 {
            self.eta = self.etaqm1;
            self.qprime = self.q - 1;
        } else {
            self.eta = self.etaqp1;
            self.qprime = self.q + 1;
            if self.method == Method::Bdf {
                // the correction seeds the new column on the raise
                let qmax = self.qmax;
                self.zn[qmax].copy_from(&self.acor);
                if let Some(quad) = self.quad.as_mut() {
                    if quad.errcon {
                        quad.zn[qmax].copy_from(&quad.acor);
                    }
                }
                if let Some(sens) = self.sens.as_mut() {
                    if sens.errcon {
                        for is in 0..sens.params.ns() {
                            sens.zn[qmax][is].copy_from(&sens.acor[is]);
                        }
                    }
                }
            }
        }
    }

    fn set_eta(&mut self) {
        let one = Eqn::T::one();
        if self.eta < Eqn::T::from(THRESH) {
            self.eta = one;
            self.hprime = self.h;
        } else {
            self.eta = self.eta.min(self.etamax);
            self.eta /= one.max(self.h.abs() * self.hmax_inv * self.eta);
            self.hprime = self.h * self.eta;
        }
    }
}
