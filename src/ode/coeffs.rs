//! Multistep coefficient machinery for the Nordsieck stepper: the `l`
//! polynomial coefficients and test constants `tq` for Adams and BDF, the
//! history adjustments on order change, and the Pascal-shift prediction
//! with its exact inverse.

use nalgebra::ComplexField;
use num_traits::identities::{One, Zero};

use super::{Method, OdeSolver, OdeSystem};
use crate::{Scalar, Vector};

impl<Eqn: OdeSystem> OdeSolver<Eqn> {
    /// Compute the coefficients `l` and test quantities `tq` for the
    /// current order and step history, then refresh `gamma`.
    pub(crate) fn set_coeffs(&mut self) {
        match self.method {
            Method::Adams => self.set_adams(),
            Method::Bdf => self.set_bdf(),
        }
        self.rl1 = Eqn::T::one() / self.l[1];
        self.gamma = self.h * self.rl1;
        if self.stats.num_steps == 0 {
            self.gammap = self.gamma;
        }
        self.gamrat = if self.stats.num_steps > 0 {
            self.gamma / self.gammap
        } else {
            Eqn::T::one()
        };
    }

    fn set_adams(&mut self) {
        let one = Eqn::T::one();
        if self.q == 1 {
            self.l[0] = one;
            self.l[1] = one;
            self.tq[1] = one;
            self.tq[5] = one;
            self.tq[2] = Eqn::T::from(0.5);
            self.tq[3] = Eqn::T::from(1.0 / 12.0);
            return;
        }
        let mut m = vec![Eqn::T::zero(); self.q + 1];
        let hsum = self.adams_start(&mut m);
        let m0 = alt_sum(self.q - 1, &m, 1);
        let m1 = alt_sum(self.q - 1, &m, 2);
        self.adams_finish(&mut m, m0, m1, hsum);
    }

    /// Build the coefficients of `product(1 <= i <= q-1) (1 + x/xi_i)` and
    /// the order-(q-1) test constant when an order change is near.
    fn adams_start(&mut self, m: &mut [Eqn::T]) -> Eqn::T {
        let mut hsum = self.h;
        m[0] = Eqn::T::one();
        for x in m.iter_mut().skip(1) {
            *x = Eqn::T::zero();
        }
        for j in 1..self.q {
            if j == self.q - 1 && self.qwait == 1 {
                let sum = alt_sum(self.q - 2, m, 2);
                self.tq[1] = Eqn::T::from_usize(self.q) * sum / m[self.q - 2];
            }
            let xi_inv = self.h / hsum;
            for i in (1..=j).rev() {
                let prev = m[i - 1];
                m[i] += prev * xi_inv;
            }
            hsum += self.tau[j];
        }
        hsum
    }

    fn adams_finish(&mut self, m: &mut [Eqn::T], m0: Eqn::T, m1: Eqn::T, hsum: Eqn::T) {
        let one = Eqn::T::one();
        let m0_inv = one / m0;
        self.l[0] = one;
        for i in 1..=self.q {
            self.l[i] = m0_inv * (m[i - 1] / Eqn::T::from_usize(i));
        }
        let xi = hsum / self.h;
        let xi_inv = one / xi;
        self.tq[2] = m1 * m0_inv * xi_inv;
        self.tq[5] = xi / self.l[self.q];
        if self.qwait == 1 {
            for i in (1..=self.q).rev() {
                let prev = m[i - 1];
                m[i] += prev * xi_inv;
            }
            let m2 = alt_sum(self.q, m, 2);
            self.tq[3] = m2 * m0_inv / Eqn::T::from_usize(self.q + 1);
        }
    }

    fn set_bdf(&mut self) {
        let one = Eqn::T::one();
        self.l[0] = one;
        self.l[1] = one;
        let mut xi_inv = one;
        let mut xistar_inv = one;
        for i in 2..=self.q {
            self.l[i] = Eqn::T::zero();
        }
        let mut alpha0 = -one;
        let mut alpha0_hat = -one;
        let mut hsum = self.h;
        if self.q > 1 {
            for j in 2..self.q {
                hsum += self.tau[j - 1];
                xi_inv = self.h / hsum;
                alpha0 -= one / Eqn::T::from_usize(j);
                for i in (1..=j).rev() {
                    let prev = self.l[i - 1];
                    self.l[i] += prev * xi_inv;
                }
            }
            // j = q
            alpha0 -= one / Eqn::T::from_usize(self.q);
            xistar_inv = -self.l[1] - alpha0;
            hsum += self.tau[self.q - 1];
            xi_inv = self.h / hsum;
            alpha0_hat = -self.l[1] - xi_inv;
            for i in (1..=self.q).rev() {
                let prev = self.l[i - 1];
                self.l[i] += prev * xistar_inv;
            }
        }
        self.set_tq_bdf(hsum, alpha0, alpha0_hat, xi_inv, xistar_inv);
    }

    fn set_tq_bdf(
        &mut self,
        mut hsum: Eqn::T,
        alpha0: Eqn::T,
        alpha0_hat: Eqn::T,
        mut xi_inv: Eqn::T,
        xistar_inv: Eqn::T,
    ) {
        let one = Eqn::T::one();
        let a1 = one - alpha0_hat + alpha0;
        let a2 = one + Eqn::T::from_usize(self.q) * a1;
        self.tq[2] = (a1 / (alpha0 * a2)).abs();
        self.tq[5] = (a2 * xistar_inv / (self.l[self.q] * xi_inv)).abs();
        if self.qwait == 1 {
            if self.q > 1 {
                let c = xistar_inv / self.l[self.q];
                let a3 = alpha0 + one / Eqn::T::from_usize(self.q);
                let a4 = alpha0_hat + xi_inv;
                let cpinv = (one - a4 + a3) / a3;
                self.tq[1] = (c * cpinv).abs();
            } else {
                self.tq[1] = one;
            }
            hsum += self.tau[self.q];
            xi_inv = self.h / hsum;
            let a5 = alpha0 - one / Eqn::T::from_usize(self.q + 1);
            let a6 = alpha0_hat - xi_inv;
            let cppinv = (one - a6 + a5) / a2;
            self.tq[3] = (cppinv / (xi_inv * Eqn::T::from_usize(self.q + 2) * a5)).abs();
        }
    }

    /// Apply a deferred order/step change decided at the end of the
    /// previous step.
    pub(crate) fn adjust_params(&mut self) {
        if self.qprime != self.q {
            let deltaq = self.qprime as i64 - self.q as i64;
            self.adjust_order(deltaq);
            self.q = self.qprime;
            self.qwait = self.q + 1;
        }
        self.eta = self.hprime / self.h;
        self.rescale();
    }

    pub(crate) fn adjust_order(&mut self, deltaq: i64) {
        if deltaq == 0 {
            return;
        }
        match self.method {
            Method::Adams => self.adjust_adams(deltaq),
            Method::Bdf => {
                if deltaq == 1 {
                    self.increase_bdf();
                } else {
                    self.decrease_bdf();
                }
            }
        }
    }

    fn adjust_adams(&mut self, deltaq: i64) {
        let one = Eqn::T::one();
        if deltaq == 1 {
            // a new column starts from nothing
            self.zn[self.q + 1].fill(Eqn::T::zero());
            if let Some(quad) = self.quad.as_mut() {
                quad.zn[self.q + 1].fill(Eqn::T::zero());
            }
            if let Some(sens) = self.sens.as_mut() {
                for z in sens.zn[self.q + 1].iter_mut() {
                    z.fill(Eqn::T::zero());
                }
            }
            return;
        }

        // on a decrease each zn[j] loses a multiple of zn[q]; the weights
        // come from the polynomial x^2 (x + xi_1) ... (x + xi_{q-2})
        for x in self.l.iter_mut() {
            *x = Eqn::T::zero();
        }
        self.l[1] = one;
        let mut hsum = Eqn::T::zero();
        for j in 1..=self.q.saturating_sub(2) {
            hsum += self.tau[j];
            let xi = hsum / self.hscale;
            for i in (1..=j + 1).rev() {
                let prev = self.l[i - 1];
                self.l[i] = self.l[i] * xi + prev;
            }
        }
        for j in 1..=self.q.saturating_sub(2) {
            self.l[j + 1] = Eqn::T::from_usize(self.q) * (self.l[j] / Eqn::T::from_usize(j + 1));
        }
        self.subtract_highest_column();
    }

    fn increase_bdf(&mut self) {
        let one = Eqn::T::one();
        for x in self.l.iter_mut() {
            *x = Eqn::T::zero();
        }
        self.l[2] = one;
        let mut alpha1 = one;
        let mut prod = one;
        let mut xiold = one;
        let mut alpha0 = -one;
        let mut hsum = self.hscale;
        if self.q > 1 {
            for j in 1..self.q {
                hsum += self.tau[j + 1];
                let xi = hsum / self.hscale;
                prod *= xi;
                alpha0 -= one / Eqn::T::from_usize(j + 1);
                alpha1 += one / xi;
                for i in (2..=j + 2).rev() {
                    let prev = self.l[i - 1];
                    self.l[i] = self.l[i] * xiold + prev;
                }
                xiold = xi;
            }
        }
        let a1 = (-alpha0 - alpha1) / prod;

        // the saved correction from the last order-q step seeds the new
        // column
        let lq1 = self.q + 1;
        let qmax = self.qmax;
        {
            let (low, high) = self.zn.split_at_mut(qmax);
            if lq1 < qmax {
                low[lq1].copy_from(&high[0]);
                low[lq1].scale_mut(a1);
            } else {
                high[0].scale_mut(a1);
            }
        }
        for j in 2..=self.q {
            let (low, high) = self.zn.split_at_mut(lq1);
            low[j].axpy(self.l[j], &high[0], Eqn::T::one());
        }
        if let Some(quad) = self.quad.as_mut() {
            let (low, high) = quad.zn.split_at_mut(qmax);
            if lq1 < qmax {
                low[lq1].copy_from(&high[0]);
                low[lq1].scale_mut(a1);
            } else {
                high[0].scale_mut(a1);
            }
            for j in 2..=self.q {
                let (low, high) = quad.zn.split_at_mut(lq1);
                low[j].axpy(self.l[j], &high[0], Eqn::T::one());
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            let ns = sens.params.ns();
            for is in 0..ns {
                let (low, high) = sens.zn.split_at_mut(qmax);
                if lq1 < qmax {
                    low[lq1][is].copy_from(&high[0][is]);
                    low[lq1][is].scale_mut(a1);
                } else {
                    high[0][is].scale_mut(a1);
                }
                for j in 2..=self.q {
                    let (low, high) = sens.zn.split_at_mut(lq1);
                    low[j][is].axpy(self.l[j], &high[0][is], Eqn::T::one());
                }
            }
        }
    }

    fn decrease_bdf(&mut self) {
        let one = Eqn::T::one();
        for x in self.l.iter_mut() {
            *x = Eqn::T::zero();
        }
        self.l[2] = one;
        let mut hsum = Eqn::T::zero();
        for j in 1..=self.q.saturating_sub(2) {
            hsum += self.tau[j];
            let xi = hsum / self.hscale;
            for i in (2..=j + 2).rev() {
                let prev = self.l[i - 1];
                self.l[i] = self.l[i] * xi + prev;
            }
        }
        self.subtract_highest_column();
    }

    /// `zn[j] -= l[j] * zn[q]` for the middle columns, shared by the two
    /// order-decrease paths.
    fn subtract_highest_column(&mut self) {
        let one = Eqn::T::one();
        let q = self.q;
        for j in 2..q {
            let (low, high) = self.zn.split_at_mut(q);
            low[j].axpy(-self.l[j], &high[0], one);
        }
        if let Some(quad) = self.quad.as_mut() {
            for j in 2..q {
                let (low, high) = quad.zn.split_at_mut(q);
                low[j].axpy(-self.l[j], &high[0], one);
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                for j in 2..q {
                    let (low, high) = sens.zn.split_at_mut(q);
                    low[j][is].axpy(-self.l[j], &high[0][is], one);
                }
            }
        }
    }

    /// Rescale the history for the new step size `h = hscale * eta`:
    /// `zn[j] *= eta^j`.
    pub(crate) fn rescale(&mut self) {
        let mut factor = self.eta;
        for j in 1..=self.q {
            self.zn[j].scale_mut(factor);
            if let Some(quad) = self.quad.as_mut() {
                quad.zn[j].scale_mut(factor);
            }
            if let Some(sens) = self.sens.as_mut() {
                for z in sens.zn[j].iter_mut() {
                    z.scale_mut(factor);
                }
            }
            factor *= self.eta;
        }
        self.h = self.hscale * self.eta;
        self.hscale = self.h;
    }

    /// Advance the history polynomial to `tn + h` by the Pascal-triangle
    /// column sums.
    pub(crate) fn predict(&mut self) {
        self.tn += self.h;
        if let Some(tstop) = self.tstop {
            if (self.tn - tstop) * self.h > Eqn::T::zero() {
                self.tn = tstop;
            }
        }
        for k in 1..=self.q {
            for j in (k..=self.q).rev() {
                let (low, high) = self.zn.split_at_mut(j);
                low[j - 1].axpy(Eqn::T::one(), &high[0], Eqn::T::one());
            }
        }
        if let Some(quad) = self.quad.as_mut() {
            for k in 1..=self.q {
                for j in (k..=self.q).rev() {
                    let (low, high) = quad.zn.split_at_mut(j);
                    low[j - 1].axpy(Eqn::T::one(), &high[0], Eqn::T::one());
                }
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                for k in 1..=self.q {
                    for j in (k..=self.q).rev() {
                        let (low, high) = sens.zn.split_at_mut(j);
                        low[j - 1][is].axpy(Eqn::T::one(), &high[0][is], Eqn::T::one());
                    }
                }
            }
        }
    }

    /// Exact inverse of [`OdeSolver::predict`]; restores `tn` and the
    /// history after a failed attempt.
    pub(crate) fn restore(&mut self, saved_t: Eqn::T) {
        self.tn = saved_t;
        for k in 1..=self.q {
            for j in (k..=self.q).rev() {
                let (low, high) = self.zn.split_at_mut(j);
                low[j - 1].axpy(-Eqn::T::one(), &high[0], Eqn::T::one());
            }
        }
        if let Some(quad) = self.quad.as_mut() {
            for k in 1..=self.q {
                for j in (k..=self.q).rev() {
                    let (low, high) = quad.zn.split_at_mut(j);
                    low[j - 1].axpy(-Eqn::T::one(), &high[0], Eqn::T::one());
                }
            }
        }
        if let Some(sens) = self.sens.as_mut() {
            for is in 0..sens.params.ns() {
                for k in 1..=self.q {
                    for j in (k..=self.q).rev() {
                        let (low, high) = sens.zn.split_at_mut(j);
                        low[j - 1][is].axpy(-Eqn::T::one(), &high[0][is], Eqn::T::one());
                    }
                }
            }
        }
    }
}

/// `sum((-1)^i a[i] / (i + k))` for `i` in `0..=iend`.
pub(crate) fn alt_sum<T: Scalar>(iend: usize, a: &[T], k: usize) -> T {
    let mut sum = T::zero();
    let mut sign = T::one();
    for (i, ai) in a.iter().enumerate().take(iend + 1) {
        sum += sign * *ai / T::from_usize(i + k);
        sign = -sign;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::alt_sum;

    #[test]
    fn test_alt_sum() {
        // 1/1 - 1/2 = 1/2 and 1/2 - 1/3 = 1/6
        let a = [1.0, 1.0];
        assert!((alt_sum(1, &a, 1) - 0.5).abs() < 1e-15);
        assert!((alt_sum(1, &a, 2) - 1.0 / 6.0).abs() < 1e-15);
    }
}
