use nalgebra::DVector;

use crate::error::ResidualError;
use crate::{DaeSystem, OdeSystem};

/// `y' = -lambda * y`, `y(0) = y0`, with solution `y0 * exp(-lambda * t)`.
/// The decay rate is exposed as a sensitivity parameter.
pub struct ExponentialDecay {
    pub lambda: f64,
    pub y0: f64,
}

impl ExponentialDecay {
    pub fn new() -> Self {
        Self {
            lambda: 1.0,
            y0: 1.0,
        }
    }

    pub fn exact(&self, t: f64) -> f64 {
        self.y0 * (-self.lambda * t).exp()
    }
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        Self::new()
    }
}

impl OdeSystem for ExponentialDecay {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        1
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) {
        ydot[0] = -self.lambda * y[0];
    }

    fn nparams(&self) -> usize {
        1
    }

    fn param(&self, _i: usize) -> f64 {
        self.lambda
    }

    fn set_param(&mut self, _i: usize, value: f64) {
        self.lambda = value;
    }
}

/// The same problem in implicit form, `F = y' + lambda * y = 0`.
pub struct ExponentialDecayDae {
    pub lambda: f64,
    pub y0: f64,
}

impl ExponentialDecayDae {
    pub fn new() -> Self {
        Self {
            lambda: 1.0,
            y0: 1.0,
        }
    }

    pub fn exact(&self, t: f64) -> f64 {
        self.y0 * (-self.lambda * t).exp()
    }
}

impl Default for ExponentialDecayDae {
    fn default() -> Self {
        Self::new()
    }
}

impl DaeSystem for ExponentialDecayDae {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        1
    }

    fn residual(
        &mut self,
        _t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        res: &mut DVector<f64>,
    ) -> Result<(), ResidualError> {
        res[0] = yp[0] + self.lambda * y[0];
        Ok(())
    }

    fn nparams(&self) -> usize {
        1
    }

    fn param(&self, _i: usize) -> f64 {
        self.lambda
    }

    fn set_param(&mut self, _i: usize, value: f64) {
        self.lambda = value;
    }
}
