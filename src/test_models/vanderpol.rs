use nalgebra::DVector;

use crate::OdeSystem;

/// The Van der Pol oscillator `y'' - mu (1 - y^2) y' + y = 0` as a first
/// order system. Strongly stiff for large `mu`.
pub struct VanDerPol {
    pub mu: f64,
}

impl VanDerPol {
    pub fn stiff() -> Self {
        Self { mu: 1000.0 }
    }

    pub fn initial_state(&self) -> DVector<f64> {
        DVector::from_vec(vec![2.0, 0.0])
    }
}

impl OdeSystem for VanDerPol {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        2
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) {
        ydot[0] = y[1];
        ydot[1] = self.mu * (1.0 - y[0] * y[0]) * y[1] - y[0];
    }
}
