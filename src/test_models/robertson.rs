use nalgebra::DVector;

use crate::error::ResidualError;
use crate::test_models::Solution;
use crate::{DaeSystem, Tolerances};

/// Robertson chemical kinetics in implicit form, the classic stiff DAE
/// benchmark:
///
/// ```text
/// y1' = -0.04 y1 + 1e4 y2 y3
/// y2' =  0.04 y1 - 1e4 y2 y3 - 3e7 y2^2
/// 0   =  y1 + y2 + y3 - 1
/// ```
pub struct Robertson {
    pub p: [f64; 3],
}

impl Robertson {
    pub fn new() -> Self {
        Self {
            p: [0.04, 1.0e4, 3.0e7],
        }
    }

    pub fn initial_state() -> (DVector<f64>, DVector<f64>) {
        let y0 = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        // y1' = -0.04, y2' = 0.04, third component is algebraic
        let yp0 = DVector::from_vec(vec![-0.04, 0.04, 0.0]);
        (y0, yp0)
    }

    pub fn id() -> DVector<f64> {
        DVector::from_vec(vec![1.0, 1.0, 0.0])
    }

    pub fn tolerances() -> Tolerances<DVector<f64>> {
        Tolerances::vector(1.0e-4, DVector::from_vec(vec![1.0e-8, 1.0e-6, 1.0e-6]))
    }

    pub fn solution() -> Solution<DVector<f64>> {
        let mut soln = Solution::default();
        soln.push(0.4, DVector::from_vec(vec![9.8517e-01, 3.3864e-05, 1.4794e-02]));
        soln.push(4.0, DVector::from_vec(vec![9.0553e-01, 2.2406e-05, 9.4452e-02]));
        soln.push(40.0, DVector::from_vec(vec![7.1579e-01, 9.1838e-06, 2.8420e-01]));
        soln.push(400.0, DVector::from_vec(vec![4.5044e-01, 3.2218e-06, 5.4956e-01]));
        soln
    }
}

impl Default for Robertson {
    fn default() -> Self {
        Self::new()
    }
}

impl DaeSystem for Robertson {
    type T = f64;
    type V = DVector<f64>;

    fn nstates(&self) -> usize {
        3
    }

    fn residual(
        &mut self,
        _t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        res: &mut DVector<f64>,
    ) -> Result<(), ResidualError> {
        let [p1, p2, p3] = self.p;
        res[0] = yp[0] + p1 * y[0] - p2 * y[1] * y[2];
        res[1] = yp[1] - p1 * y[0] + p2 * y[1] * y[2] + p3 * y[1] * y[1];
        res[2] = y[0] + y[1] + y[2] - 1.0;
        Ok(())
    }

    fn nparams(&self) -> usize {
        3
    }

    fn param(&self, i: usize) -> f64 {
        self.p[i]
    }

    fn set_param(&mut self, i: usize, value: f64) {
        self.p[i] = value;
    }
}
