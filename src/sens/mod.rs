use nalgebra::ComplexField;
use num_traits::identities::One;

use crate::{Scalar, Tolerances, Vector};

/// Coupling strategy between the state and sensitivity correctors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensMethod {
    /// One Newton iteration over the augmented `(1 + Ns) * N` system; state
    /// and sensitivities share each linear solve.
    Simultaneous,
    /// Solve the state to convergence, then iterate all sensitivities
    /// together with the converged-state Jacobian.
    Staggered,
    /// Solve the state, then iterate each sensitivity independently in
    /// sequence. Requires the one-at-a-time sensitivity right-hand side.
    Staggered1,
}

/// Whether sensitivity (or quadrature) variables participate in the local
/// error test. They always participate in the corrector convergence test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensErrCon {
    Full,
    Partial,
}

impl SensErrCon {
    pub(crate) fn is_full(self) -> bool {
        matches!(self, SensErrCon::Full)
    }
}

/// One model parameter selected for sensitivity analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensParam {
    /// The parameter enters the dynamics (and possibly the initial
    /// condition).
    Dynamic(usize),
    /// The parameter enters only the initial condition; the
    /// difference-quotient path skips the parameter perturbation for it.
    InitOnly(usize),
}

impl SensParam {
    pub fn index(self) -> usize {
        match self {
            SensParam::Dynamic(i) | SensParam::InitOnly(i) => i,
        }
    }

    pub fn is_init_only(self) -> bool {
        matches!(self, SensParam::InitOnly(_))
    }
}

/// Parameter selection for sensitivity analysis: which parameters are
/// active and a positive magnitude scale `pbar` for each.
#[derive(Debug, Clone)]
pub struct SensParams<T: Scalar> {
    pub list: Vec<SensParam>,
    pub pbar: Vec<T>,
}

impl<T: Scalar> SensParams<T> {
    /// Select parameters `0..ns` with unit scales.
    pub fn first(ns: usize) -> Self {
        Self {
            list: (0..ns).map(SensParam::Dynamic).collect(),
            pbar: vec![T::one(); ns],
        }
    }

    pub fn ns(&self) -> usize {
        self.list.len()
    }

    pub fn validate(&self, nparams: usize) -> Result<(), String> {
        if self.list.is_empty() {
            return Err("empty sensitivity parameter list".to_string());
        }
        if self.pbar.len() != self.list.len() {
            return Err(format!(
                "pbar has {} entries for {} selected parameters",
                self.pbar.len(),
                self.list.len()
            ));
        }
        for p in &self.list {
            if p.index() >= nparams {
                return Err(format!(
                    "parameter index {} out of range (model has {})",
                    p.index(),
                    nparams
                ));
            }
        }
        for pb in &self.pbar {
            if *pb == T::zero() {
                return Err("pbar entries must be nonzero".to_string());
            }
        }
        Ok(())
    }
}

/// Difference-quotient scheme chosen per sensitivity and per step from the
/// ratio of the state and parameter perturbation sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DqScheme {
    Centered1,
    Centered2,
    Forward1,
    Forward2,
}

/// Perturbation sizes and scheme for one sensitivity. `del` is the base
/// relative perturbation `sqrt(max(rtol, uround))`.
pub(crate) struct DqPlan<T> {
    pub scheme: DqScheme,
    pub del_p: T,
    pub del_y: T,
}

pub(crate) fn plan_dq<T: Scalar, V: Vector<T = T>>(
    rtol: T,
    rhomax: T,
    pbar_i: T,
    ys: &V,
    ewt: &V,
) -> DqPlan<T> {
    let del = rtol.max(T::EPSILON).sqrt();
    let rdel = T::one() / del;
    let pbari = pbar_i.abs();

    let del_p = pbari * del;
    let norms = ys.wrms_norm(ewt) * pbari;
    let rdel_y = norms.max(rdel) / pbari;
    let del_y = T::one() / rdel_y;

    let ratio = del_y / del_p;
    let ratio_max = (T::one() / ratio).max(ratio);

    let scheme = if ratio_max <= rhomax.abs() || rhomax == T::zero() {
        if rhomax >= T::zero() {
            DqScheme::Centered1
        } else {
            DqScheme::Forward1
        }
    } else if rhomax > T::zero() {
        DqScheme::Centered2
    } else {
        DqScheme::Forward2
    };

    DqPlan {
        scheme,
        del_p,
        del_y,
    }
}

/// Default sensitivity tolerances: the state rtol with the state atol scaled
/// by `1/|pbar_i|` for each selected parameter.
pub(crate) fn default_sens_tolerances<V: Vector>(
    state_tol: &Tolerances<V>,
    params: &SensParams<V::T>,
) -> Vec<Tolerances<V>> {
    params
        .pbar
        .iter()
        .map(|pb| {
            let rpbar = V::T::one() / pb.abs();
            let atol = match &state_tol.atol {
                crate::AbsTol::Scalar(a) => crate::AbsTol::Scalar(*a * rpbar),
                crate::AbsTol::Vector(a) => {
                    let mut a = a.clone();
                    a.scale_mut(rpbar);
                    crate::AbsTol::Vector(a)
                }
            };
            Tolerances {
                rtol: state_tol.rtol,
                atol,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    type Vcpu = nalgebra::DVector<f64>;

    #[test]
    fn test_dq_scheme_selection() {
        let ys = Vcpu::zeros(2);
        let ewt = Vcpu::from_element(2, 1.0);
        // rhomax = 0 always picks the single-perturbation centered scheme
        let plan = plan_dq(1e-6, 0.0, 1.0, &ys, &ewt);
        assert_eq!(plan.scheme, DqScheme::Centered1);
        // with ys = 0 the perturbation sizes agree, so any rhomax >= 1
        // keeps the single-perturbation scheme
        let plan = plan_dq(1e-6, 1.0, 1.0, &ys, &ewt);
        assert_eq!(plan.scheme, DqScheme::Centered1);
        // negative rhomax selects forward differences
        let plan = plan_dq(1e-6, -1.0, 1.0, &ys, &ewt);
        assert_eq!(plan.scheme, DqScheme::Forward1);
    }

    #[test]
    fn test_dq_two_perturbation_split() {
        // a large sensitivity norm shrinks del_y far below del_p, which
        // forces the two-perturbation scheme for small rhomax
        let ys = Vcpu::from_element(2, 1e6);
        let ewt = Vcpu::from_element(2, 1.0);
        let plan = plan_dq(1e-6, 2.0, 1.0, &ys, &ewt);
        assert_eq!(plan.scheme, DqScheme::Centered2);
        assert!(plan.del_y < plan.del_p);
    }

    #[test]
    fn test_default_sens_tolerances() {
        let tol = Tolerances::<Vcpu>::scalar(1e-6, 1e-8);
        let params = SensParams {
            list: vec![SensParam::Dynamic(0), SensParam::InitOnly(1)],
            pbar: vec![4.0, 0.5],
        };
        let tols = default_sens_tolerances(&tol, &params);
        match tols[0].atol {
            crate::AbsTol::Scalar(a) => assert_relative_eq!(a, 2.5e-9),
            _ => panic!("expected scalar atol"),
        }
        match tols[1].atol {
            crate::AbsTol::Scalar(a) => assert_relative_eq!(a, 2e-8),
            _ => panic!("expected scalar atol"),
        }
    }
}
