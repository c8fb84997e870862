use nalgebra::DVector;

use crate::{IndexType, Scalar, Vector};

impl<T: Scalar> Vector for DVector<T> {
    type T = T;

    fn zeros(n: IndexType) -> Self {
        DVector::zeros(n)
    }

    fn from_element(n: IndexType, value: T) -> Self {
        DVector::from_element(n, value)
    }

    fn from_vec(values: Vec<T>) -> Self {
        DVector::from_vec(values)
    }

    fn len(&self) -> IndexType {
        self.nrows()
    }

    fn fill(&mut self, value: T) {
        for x in self.iter_mut() {
            *x = value;
        }
    }

    fn copy_from(&mut self, other: &Self) {
        DVector::copy_from(self, other);
    }

    fn scale_mut(&mut self, c: T) {
        for x in self.iter_mut() {
            *x *= c;
        }
    }

    fn add_scalar_mut(&mut self, c: T) {
        for x in self.iter_mut() {
            *x += c;
        }
    }

    fn axpy(&mut self, alpha: T, x: &Self, beta: T) {
        nalgebra::Matrix::axpy(self, alpha, x, beta);
    }

    fn linear_sum(&mut self, a: T, x: &Self, b: T, y: &Self) {
        for i in 0..self.nrows() {
            self[i] = a * x[i] + b * y[i];
        }
    }

    fn abs(&self) -> Self {
        self.map(|x| x.abs())
    }

    fn component_mul_assign(&mut self, x: &Self) {
        for i in 0..self.nrows() {
            self[i] *= x[i];
        }
    }

    fn component_div_assign(&mut self, x: &Self) {
        for i in 0..self.nrows() {
            self[i] /= x[i];
        }
    }

    fn invert_mut(&mut self) {
        for x in self.iter_mut() {
            *x = T::one() / *x;
        }
    }

    fn wrms_norm(&self, w: &Self) -> T {
        let mut sum = T::zero();
        for i in 0..self.nrows() {
            let prod = self[i] * w[i];
            sum += prod * prod;
        }
        (sum / <T as Scalar>::from_usize(self.nrows())).sqrt()
    }

    fn wrms_norm_masked(&self, w: &Self, id: &Self) -> T {
        let mut sum = T::zero();
        for i in 0..self.nrows() {
            if id[i] > T::zero() {
                let prod = self[i] * w[i];
                sum += prod * prod;
            }
        }
        (sum / <T as Scalar>::from_usize(self.nrows())).sqrt()
    }

    fn max_norm(&self) -> T {
        let mut m = T::zero();
        for i in 0..self.nrows() {
            let a = self[i].abs();
            if a > m {
                m = a;
            }
        }
        m
    }

    fn min(&self) -> T {
        let mut m = self[0];
        for i in 1..self.nrows() {
            if self[i] < m {
                m = self[i];
            }
        }
        m
    }

    fn min_quotient(&self, denom: &Self) -> T {
        let mut m = T::from(f64::MAX);
        let mut found = false;
        for i in 0..self.nrows() {
            if denom[i] != T::zero() {
                let q = self[i] / denom[i];
                if !found || q < m {
                    m = q;
                    found = true;
                }
            }
        }
        m
    }

    fn compare_ge(&self, c: T) -> Self {
        self.map(|x| if x.abs() >= c { T::one() } else { T::zero() })
    }

    fn constraint_mask(&self, y: &Self, m: &mut Self) -> bool {
        let onept5 = T::from(1.5);
        let half = T::from(0.5);
        let mut all_ok = true;
        for i in 0..self.nrows() {
            m[i] = T::zero();
            let c = self[i];
            let violated = if c.abs() >= onept5 {
                // strict: y must have the sign of c
                y[i] * c <= T::zero()
            } else if c.abs() >= half {
                // non-strict: y must not oppose the sign of c
                y[i] * c < T::zero()
            } else {
                false
            };
            if violated {
                m[i] = T::one();
                all_ok = false;
            }
        }
        all_ok
    }
}
