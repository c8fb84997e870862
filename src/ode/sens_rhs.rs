//! Sensitivity right-hand sides for the ODE stepper: the user-supplied
//! routine (all-at-once or one-at-a-time) or difference quotients of the
//! state right-hand side. The state derivative `ftemp` must be current at
//! every dispatch point.

use nalgebra::RealField;
use num_traits::identities::One;

use super::{OdeSensRhsFn, OdeSolver, OdeStatistics, OdeSystem};
use crate::sens::{plan_dq, DqScheme, SensParam};
use crate::Vector;

impl<Eqn: OdeSystem> OdeSolver<Eqn> {
    /// Load the predicted sensitivities into the corrector slots.
    pub(crate) fn sens_y_from_zn0(&mut self) {
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                sens.y[is].copy_from(&sens.zn[0][is]);
            }
        }
    }

    /// Evaluate all sensitivity derivatives at the current iterates
    /// `(y, yS)` into `sens.sdot`.
    pub(crate) fn sens_rhs_all_current(&mut self) {
        let Some(sens) = self.sens.as_mut() else {
            return;
        };
        match &mut sens.rhs_fn {
            OdeSensRhsFn::All(f) => {
                f(self.tn, &self.y, &self.ftemp, &sens.y, &mut sens.sdot);
                self.stats.num_sens_rhs_evals += 1;
            }
            OdeSensRhsFn::One(f) => {
                for is in 0..sens.params.ns() {
                    f(
                        self.tn,
                        &self.y,
                        &self.ftemp,
                        is,
                        &sens.y[is],
                        &mut sens.sdot[is],
                    );
                    self.stats.num_sens_rhs_evals += 1;
                }
            }
            OdeSensRhsFn::DiffQuotient => {
                let rtol = self.tol.rtol;
                for is in 0..sens.params.ns() {
                    rhs1_dq(
                        &mut self.eqn,
                        &mut self.stats,
                        rtol,
                        sens.rhomax,
                        sens.params.list[is],
                        sens.params.pbar[is],
                        self.tn,
                        &self.y,
                        &self.ftemp,
                        &sens.y[is],
                        &mut sens.sdot[is],
                        &self.ewt,
                        &mut sens.tempv,
                        &mut sens.ftemp,
                    );
                }
            }
        }
    }

    /// Evaluate the `is`-th sensitivity derivative at the current iterates
    /// into `sens.sdot[is]` (staggered-1).
    pub(crate) fn sens_rhs_one_current(&mut self, is: usize) {
        let Some(sens) = self.sens.as_mut() else {
            return;
        };
        match &mut sens.rhs_fn {
            OdeSensRhsFn::All(_) => {
                // rejected at configuration time
            }
            OdeSensRhsFn::One(f) => {
                f(
                    self.tn,
                    &self.y,
                    &self.ftemp,
                    is,
                    &sens.y[is],
                    &mut sens.sdot[is],
                );
                self.stats.num_sens_rhs_evals += 1;
            }
            OdeSensRhsFn::DiffQuotient => {
                rhs1_dq(
                    &mut self.eqn,
                    &mut self.stats,
                    self.tol.rtol,
                    sens.rhomax,
                    sens.params.list[is],
                    sens.params.pbar[is],
                    self.tn,
                    &self.y,
                    &self.ftemp,
                    &sens.y[is],
                    &mut sens.sdot[is],
                    &self.ewt,
                    &mut sens.tempv,
                    &mut sens.ftemp,
                );
            }
        }
    }

    /// Evaluate the sensitivity derivatives at the base state `zn[0]`,
    /// `znS[0]` directly into `znS[1]`, used at the first call and when
    /// the order-1 history is rebuilt. `ftemp` must hold `f(tn, zn[0])`.
    pub(crate) fn sens_rhs_into_zn1(&mut self) {
        let Some(sens) = self.sens.as_mut() else {
            return;
        };
        match &mut sens.rhs_fn {
            OdeSensRhsFn::All(f) => {
                let (zn0, zn_rest) = sens.zn.split_at_mut(1);
                f(self.tn, &self.zn[0], &self.ftemp, &zn0[0], &mut zn_rest[0]);
                self.stats.num_sens_rhs_evals += 1;
            }
            OdeSensRhsFn::One(f) => {
                let (zn0, zn_rest) = sens.zn.split_at_mut(1);
                for is in 0..sens.params.ns() {
                    f(
                        self.tn,
                        &self.zn[0],
                        &self.ftemp,
                        is,
                        &zn0[0][is],
                        &mut zn_rest[0][is],
                    );
                    self.stats.num_sens_rhs_evals += 1;
                }
            }
            OdeSensRhsFn::DiffQuotient => {
                let rtol = self.tol.rtol;
                let (zn0, zn_rest) = sens.zn.split_at_mut(1);
                for is in 0..sens.params.ns() {
                    rhs1_dq(
                        &mut self.eqn,
                        &mut self.stats,
                        rtol,
                        sens.rhomax,
                        sens.params.list[is],
                        sens.params.pbar[is],
                        self.tn,
                        &self.zn[0],
                        &self.ftemp,
                        &zn0[0][is],
                        &mut zn_rest[0][is],
                        &self.ewt,
                        &mut sens.tempv,
                        &mut sens.ftemp,
                    );
                }
            }
        }
    }
}

/// Difference-quotient approximation of one sensitivity derivative
/// `sdot = df/dy * s + df/dp_i`. The perturbed parameter is restored on
/// every exit path.
#[allow(clippy::too_many_arguments)]
fn rhs1_dq<Eqn: OdeSystem>(
    eqn: &mut Eqn,
    stats: &mut OdeStatistics,
    rtol: Eqn::T,
    rhomax: Eqn::T,
    param: SensParam,
    pbar_i: Eqn::T,
    t: Eqn::T,
    y: &Eqn::V,
    ydot: &Eqn::V,
    ys: &Eqn::V,
    sdot: &mut Eqn::V,
    ewt: &Eqn::V,
    ytemp: &mut Eqn::V,
    rtemp: &mut Eqn::V,
) {
    let one = Eqn::T::one();
    let half = Eqn::T::from(0.5);
    let which = param.index();
    let skip_fp = param.is_init_only();
    let psave = eqn.param(which);

    let plan = plan_dq::<Eqn::T, Eqn::V>(rtol, rhomax, pbar_i, ys, ewt);
    let del_p = plan.del_p;
    let del_y = plan.del_y;

    match plan.scheme {
        DqScheme::Centered1 => {
            let del = del_y.min(del_p);
            let r2del = half / del;

            ytemp.linear_sum(del, ys, one, y);
            eqn.set_param(which, psave + del);
            eqn.rhs(t, ytemp, sdot);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            ytemp.linear_sum(-del, ys, one, y);
            eqn.set_param(which, psave - del);
            eqn.rhs(t, ytemp, rtemp);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            sdot.axpy(-r2del, rtemp, r2del);
        }
        DqScheme::Centered2 => {
            let r2del_p = half / del_p;
            let r2del_y = half / del_y;

            ytemp.linear_sum(del_y, ys, one, y);
            eqn.rhs(t, ytemp, sdot);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            ytemp.linear_sum(-del_y, ys, one, y);
            eqn.rhs(t, ytemp, rtemp);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            sdot.axpy(-r2del_y, rtemp, r2del_y);

            if !skip_fp {
                eqn.set_param(which, psave + del_p);
                eqn.rhs(t, y, ytemp);
                stats.num_rhs_evals += 1;
                stats.num_rhs_evals_sens += 1;

                eqn.set_param(which, psave - del_p);
                eqn.rhs(t, y, rtemp);
                stats.num_rhs_evals += 1;
                stats.num_rhs_evals_sens += 1;

                rtemp.axpy(r2del_p, ytemp, -r2del_p);
                sdot.axpy(one, rtemp, one);
            }
        }
        DqScheme::Forward1 => {
            let del = del_y.min(del_p);
            let rdel = one / del;

            ytemp.linear_sum(del, ys, one, y);
            eqn.set_param(which, psave + del);
            eqn.rhs(t, ytemp, sdot);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            sdot.axpy(-rdel, ydot, rdel);
        }
        DqScheme::Forward2 => {
            let rdel_p = one / del_p;
            let rdel_y = one / del_y;

            ytemp.linear_sum(del_y, ys, one, y);
            eqn.rhs(t, ytemp, sdot);
            stats.num_rhs_evals += 1;
            stats.num_rhs_evals_sens += 1;

            sdot.axpy(-rdel_y, ydot, rdel_y);

            if !skip_fp {
                eqn.set_param(which, psave + del_p);
                eqn.rhs(t, y, rtemp);
                stats.num_rhs_evals += 1;
                stats.num_rhs_evals_sens += 1;

                rtemp.axpy(-rdel_p, ydot, rdel_p);
                sdot.axpy(one, rtemp, one);
            }
        }
    }

    eqn.set_param(which, psave);
}
