use nalgebra::DVector;

use crate::ode::OdeQuadRhsFn;
use crate::OdeSystem;

/// Carrier state for the quadrature test: a trivial decay integrated while
/// the quadrature accumulates `int_0^t exp(-s^2) ds`.
pub struct GaussianCarrier;

/// `int_0^1 exp(-t^2) dt = (sqrt(pi)/2) erf(1)`
pub const INTEGRAL_TO_ONE: f64 = 0.746_824_132_812_427_2;

pub fn gaussian_quad_rhs() -> OdeQuadRhsFn<DVector<f64>> {
    Box::new(|t, _y, qdot| {
        qdot[0] = (-t * t).exp();
    })
}

impl OdeSystem for GaussianCarrier {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        1
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) {
        ydot[0] = -y[0];
    }
}
