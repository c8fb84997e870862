use nalgebra::DVector;

use crate::error::ResidualError;
use crate::DaeSystem;

/// Semi-explicit index-1 DAE with a known solution:
/// `y' = z`, `0 = y - sin(t)`, so `y = sin(t)` and `z = cos(t)`.
/// The second component is algebraic.
pub struct SineDae;

impl SineDae {
    pub fn initial_state() -> (DVector<f64>, DVector<f64>) {
        // consistent at t = 0: y = 0, z = 1, y' = z = 1, z' = -sin(0) = 0
        let y0 = DVector::from_vec(vec![0.0, 1.0]);
        let yp0 = DVector::from_vec(vec![1.0, 0.0]);
        (y0, yp0)
    }

    pub fn id() -> DVector<f64> {
        DVector::from_vec(vec![1.0, 0.0])
    }
}

impl DaeSystem for SineDae {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        2
    }

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        res: &mut DVector<f64>,
    ) -> Result<(), ResidualError> {
        res[0] = yp[0] - y[1];
        res[1] = y[0] - t.sin();
        Ok(())
    }
}
