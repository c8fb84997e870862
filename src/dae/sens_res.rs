//! Sensitivity residual evaluation: either the user-supplied routine
//! (all-at-once or one-at-a-time) or a difference-quotient approximation
//! built from perturbed state residuals.

use nalgebra::RealField;
use num_traits::identities::One;

use super::step::StepFailure;
use super::{DaeSolver, DaeStatistics, DaeSystem};
use crate::dae::DaeSensResFn;
use crate::error::ResidualError;
use crate::sens::{plan_dq, DqScheme, SensParam};
use crate::Vector;

impl<Eqn: DaeSystem> DaeSolver<Eqn> {
    /// Evaluate all sensitivity residuals at the current iterates into
    /// `sens.delta`. The state residual `delta` must be current.
    pub(crate) fn sens_residuals_all(&mut self) -> Result<(), StepFailure> {
        let Some(sens) = self.sens.as_mut() else {
            return Ok(());
        };
        match &mut sens.res_fn {
            DaeSensResFn::All(f) => {
                let ret = f(
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    &sens.yy,
                    &sens.yp,
                    &mut sens.delta,
                );
                self.stats.num_sens_res_evals += 1;
                map_user(ret)
            }
            DaeSensResFn::One(f) => {
                for is in 0..sens.params.ns() {
                    let ret = f(
                        self.tn,
                        &self.yy,
                        &self.yp,
                        &self.delta,
                        is,
                        &sens.yy[is],
                        &sens.yp[is],
                        &mut sens.delta[is],
                    );
                    self.stats.num_sens_res_evals += 1;
                    map_user(ret)?;
                }
                Ok(())
            }
            DaeSensResFn::DiffQuotient => {
                let rtol = self.tol.rtol;
                for is in 0..sens.params.ns() {
                    let ret = res1_dq(
                        &mut self.eqn,
                        &mut self.stats,
                        rtol,
                        sens.rhomax,
                        sens.params.list[is],
                        sens.params.pbar[is],
                        self.tn,
                        &self.yy,
                        &self.yp,
                        &self.delta,
                        &sens.yy[is],
                        &sens.yp[is],
                        &mut sens.delta[is],
                        &self.ewt,
                        &mut sens.tmp1,
                        &mut sens.tmp2,
                        &mut sens.tmp3,
                    );
                    map_dq(ret)?;
                }
                Ok(())
            }
        }
    }

    /// Evaluate the `is`-th sensitivity residual at the staggered-1
    /// iterates into `sens.delta1`.
    pub(crate) fn sens_residual_one(&mut self, is: usize) -> Result<(), StepFailure> {
        let Some(sens) = self.sens.as_mut() else {
            return Ok(());
        };
        match &mut sens.res_fn {
            DaeSensResFn::All(_) => {
                // rejected at configuration time
                Err(StepFailure::ResFatal)
            }
            DaeSensResFn::One(f) => {
                let ret = f(
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    is,
                    &sens.yy1,
                    &sens.yp1,
                    &mut sens.delta1,
                );
                self.stats.num_sens_res_evals += 1;
                map_user(ret)
            }
            DaeSensResFn::DiffQuotient => {
                let ret = res1_dq(
                    &mut self.eqn,
                    &mut self.stats,
                    self.tol.rtol,
                    sens.rhomax,
                    sens.params.list[is],
                    sens.params.pbar[is],
                    self.tn,
                    &self.yy,
                    &self.yp,
                    &self.delta,
                    &sens.yy1,
                    &sens.yp1,
                    &mut sens.delta1,
                    &self.ewt,
                    &mut sens.tmp1,
                    &mut sens.tmp2,
                    &mut sens.tmp3,
                );
                map_dq(ret)
            }
        }
    }
}

fn map_user(ret: Result<(), ResidualError>) -> Result<(), StepFailure> {
    match ret {
        Ok(()) => Ok(()),
        Err(ResidualError::Recoverable) => Err(StepFailure::ResRecoverable),
        Err(ResidualError::Fatal) => Err(StepFailure::ResFatal),
    }
}

fn map_dq(ret: Result<(), ResidualError>) -> Result<(), StepFailure> {
    match ret {
        Ok(()) => Ok(()),
        Err(ResidualError::Recoverable) => Err(StepFailure::ResRecoverable),
        Err(ResidualError::Fatal) => Err(StepFailure::SensDQFatal),
    }
}

/// Difference-quotient approximation of one sensitivity residual. The
/// perturbed parameter is restored on every exit path.
#[allow(clippy::too_many_arguments)]
fn res1_dq<Eqn: DaeSystem>(
    eqn: &mut Eqn,
    stats: &mut DaeStatistics,
    rtol: Eqn::T,
    rhomax: Eqn::T,
    param: SensParam,
    pbar_i: Eqn::T,
    t: Eqn::T,
    yy: &Eqn::V,
    yp: &Eqn::V,
    resval: &Eqn::V,
    yy_s: &Eqn::V,
    yp_s: &Eqn::V,
    res_s: &mut Eqn::V,
    ewt: &Eqn::V,
    ytemp: &mut Eqn::V,
    yptemp: &mut Eqn::V,
    restemp: &mut Eqn::V,
) -> Result<(), ResidualError> {
    let which = param.index();
    let psave = eqn.param(which);
    let ret = res1_dq_inner(
        eqn, stats, rtol, rhomax, param, pbar_i, psave, t, yy, yp, resval, yy_s, yp_s, res_s,
        ewt, ytemp, yptemp, restemp,
    );
    eqn.set_param(which, psave);
    ret
}

#[allow(clippy::too_many_arguments)]
fn res1_dq_inner<Eqn: DaeSystem>(
    eqn: &mut Eqn,
    stats: &mut DaeStatistics,
    rtol: Eqn::T,
    rhomax: Eqn::T,
    param: SensParam,
    pbar_i: Eqn::T,
    psave: Eqn::T,
    t: Eqn::T,
    yy: &Eqn::V,
    yp: &Eqn::V,
    resval: &Eqn::V,
    yy_s: &Eqn::V,
    yp_s: &Eqn::V,
    res_s: &mut Eqn::V,
    ewt: &Eqn::V,
    ytemp: &mut Eqn::V,
    yptemp: &mut Eqn::V,
    restemp: &mut Eqn::V,
) -> Result<(), ResidualError> {
    let one = Eqn::T::one();
    let half = Eqn::T::from(0.5);
    let which = param.index();
    let skip_fp = param.is_init_only();

    let plan = plan_dq::<Eqn::T, Eqn::V>(rtol, rhomax, pbar_i, yy_s, ewt);
    let del_p = plan.del_p;
    let del_y = plan.del_y;

    let mut res = |eqn: &mut Eqn,
                   stats: &mut DaeStatistics,
                   t,
                   y: &Eqn::V,
                   ydot: &Eqn::V,
                   out: &mut Eqn::V| {
        let ret = eqn.residual(t, y, ydot, out);
        stats.num_res_evals += 1;
        stats.num_res_evals_sens += 1;
        ret
    };

    match plan.scheme {
        DqScheme::Centered1 => {
            let del = del_y.min(del_p);
            let r2del = half / del;

            ytemp.linear_sum(del, yy_s, one, yy);
            yptemp.linear_sum(del, yp_s, one, yp);
            eqn.set_param(which, psave + del);
            res(eqn, stats, t, ytemp, yptemp, res_s)?;

            ytemp.linear_sum(-del, yy_s, one, yy);
            yptemp.linear_sum(-del, yp_s, one, yp);
            eqn.set_param(which, psave - del);
            res(eqn, stats, t, ytemp, yptemp, restemp)?;

            res_s.axpy(-r2del, restemp, r2del);
        }
        DqScheme::Centered2 => {
            let r2del_p = half / del_p;
            let r2del_y = half / del_y;

            ytemp.linear_sum(del_y, yy_s, one, yy);
            yptemp.linear_sum(del_y, yp_s, one, yp);
            res(eqn, stats, t, ytemp, yptemp, res_s)?;

            ytemp.linear_sum(-del_y, yy_s, one, yy);
            yptemp.linear_sum(-del_y, yp_s, one, yp);
            res(eqn, stats, t, ytemp, yptemp, restemp)?;

            res_s.axpy(-r2del_y, restemp, r2del_y);

            if !skip_fp {
                eqn.set_param(which, psave + del_p);
                res(eqn, stats, t, yy, yp, ytemp)?;

                eqn.set_param(which, psave - del_p);
                res(eqn, stats, t, yy, yp, yptemp)?;

                restemp.linear_sum(r2del_p, ytemp, -r2del_p, yptemp);
                res_s.axpy(one, restemp, one);
            }
        }
        DqScheme::Forward1 => {
            let del = del_y.min(del_p);
            let rdel = one / del;

            ytemp.linear_sum(del, yy_s, one, yy);
            yptemp.linear_sum(del, yp_s, one, yp);
            eqn.set_param(which, psave + del);
            res(eqn, stats, t, ytemp, yptemp, res_s)?;

            res_s.axpy(-rdel, resval, rdel);
        }
        DqScheme::Forward2 => {
            let rdel_p = one / del_p;
            let rdel_y = one / del_y;

            ytemp.linear_sum(del_y, yy_s, one, yy);
            yptemp.linear_sum(del_y, yp_s, one, yp);
            res(eqn, stats, t, ytemp, yptemp, res_s)?;

            res_s.axpy(-rdel_y, resval, rdel_y);

            if !skip_fp {
                eqn.set_param(which, psave + del_p);
                res(eqn, stats, t, yy, yp, restemp)?;

                restemp.axpy(-rdel_p, resval, rdel_p);
                res_s.axpy(one, restemp, one);
            }
        }
    }

    Ok(())
}
