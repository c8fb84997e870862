use nalgebra::DVector;

use crate::{OdeSensRhsAllFn, OdeSensRhsOneFn, OdeSystem};

/// Logistic growth `y' = r y (1 - y/K)` with parameters `p = [r, K]`,
/// used for the sensitivity tests. The sensitivity right-hand sides
/// `s_i' = (df/dy) s_i + df/dp_i` are available in closed form.
pub struct Logistic {
    pub p: [f64; 2],
    pub y0: f64,
}

impl Logistic {
    pub fn new() -> Self {
        Self {
            p: [1.0, 10.0],
            y0: 1.0,
        }
    }

    /// `y(t) = K y0 e^{rt} / (K + y0 (e^{rt} - 1))`
    pub fn exact(&self, t: f64) -> f64 {
        let (r, k) = (self.p[0], self.p[1]);
        let e = (r * t).exp();
        k * self.y0 * e / (k + self.y0 * (e - 1.0))
    }

    fn dfdy(r: f64, k: f64, y: f64) -> f64 {
        r * (1.0 - 2.0 * y / k)
    }

    fn dfdp(which: usize, r: f64, k: f64, y: f64) -> f64 {
        match which {
            0 => y * (1.0 - y / k),
            _ => r * y * y / (k * k),
        }
    }

    /// Closed-form all-at-once sensitivity right-hand side.
    pub fn sens_rhs_all() -> OdeSensRhsAllFn<DVector<f64>> {
        Box::new(|_t, y, _ydot, ys, ysdot| {
            // the closure sees the parameters through its own copies; the
            // solver perturbs parameters only on the DQ path, so the
            // nominal values are in effect here
            let (r, k) = (1.0, 10.0);
            let jac = Logistic::dfdy(r, k, y[0]);
            for (is, (s, sdot)) in ys.iter().zip(ysdot.iter_mut()).enumerate() {
                sdot[0] = jac * s[0] + Logistic::dfdp(is, r, k, y[0]);
            }
        })
    }

    /// Closed-form one-at-a-time sensitivity right-hand side.
    pub fn sens_rhs_one() -> OdeSensRhsOneFn<DVector<f64>> {
        Box::new(|_t, y, _ydot, is, s, sdot| {
            let (r, k) = (1.0, 10.0);
            let jac = Logistic::dfdy(r, k, y[0]);
            sdot[0] = jac * s[0] + Logistic::dfdp(is, r, k, y[0]);
        })
    }
}

impl Default for Logistic {
    fn default() -> Self {
        Self::new()
    }
}

impl OdeSystem for Logistic {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        1
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) {
        let (r, k) = (self.p[0], self.p[1]);
        ydot[0] = r * y[0] * (1.0 - y[0] / k);
    }

    fn nparams(&self) -> usize {
        2
    }

    fn param(&self, i: usize) -> f64 {
        self.p[i]
    }

    fn set_param(&mut self, i: usize, value: f64) {
        self.p[i] = value;
    }
}
