use nalgebra::ComplexField;
use num_traits::identities::Zero;

use crate::Vector;

/// Absolute tolerance, either one scalar for every component or one value
/// per component.
#[derive(Debug, Clone)]
pub enum AbsTol<V: Vector> {
    Scalar(V::T),
    Vector(V),
}

/// Relative plus absolute tolerances, and the error-weight computation they
/// induce: `ewt[i] = 1 / (rtol * |y[i]| + atol[i])`.
#[derive(Debug, Clone)]
pub struct Tolerances<V: Vector> {
    pub rtol: V::T,
    pub atol: AbsTol<V>,
}

impl<V: Vector> Tolerances<V> {
    pub fn scalar(rtol: V::T, atol: V::T) -> Self {
        Self {
            rtol,
            atol: AbsTol::Scalar(atol),
        }
    }

    pub fn vector(rtol: V::T, atol: V) -> Self {
        Self {
            rtol,
            atol: AbsTol::Vector(atol),
        }
    }

    /// Validate against the problem size. Tolerances must be non-negative
    /// with a positive combined magnitude for every component.
    pub fn validate(&self, n: usize) -> Result<(), String> {
        if self.rtol < V::T::zero() {
            return Err(format!("rtol = {} is negative", self.rtol));
        }
        match &self.atol {
            AbsTol::Scalar(a) => {
                if *a < V::T::zero() {
                    return Err(format!("atol = {} is negative", a));
                }
            }
            AbsTol::Vector(a) => {
                if a.len() != n {
                    return Err(format!(
                        "atol has {} components but the state has {}",
                        a.len(),
                        n
                    ));
                }
                if a.min() < V::T::zero() {
                    return Err("atol has a negative component".to_string());
                }
            }
        }
        Ok(())
    }

    /// Recompute the weight vector from the current base state. Returns
    /// `false` if any weight would be non-positive, which is fatal for the
    /// remaining solve.
    #[must_use]
    pub fn update_weights(&self, y: &V, ewt: &mut V) -> bool {
        match &self.atol {
            AbsTol::Scalar(a) => {
                for i in 0..y.len() {
                    ewt[i] = self.rtol * y[i].abs() + *a;
                }
            }
            AbsTol::Vector(a) => {
                for i in 0..y.len() {
                    ewt[i] = self.rtol * y[i].abs() + a[i];
                }
            }
        }
        if ewt.min() <= V::T::zero() {
            return false;
        }
        ewt.invert_mut();
        true
    }
}

/// Weight update over a sensitivity vector array, one weight vector per
/// sensitivity.
#[must_use]
pub fn update_sens_weights<V: Vector>(
    tols: &[Tolerances<V>],
    ys: &[V],
    ewts: &mut [V],
) -> bool {
    for ((tol, y), ewt) in tols.iter().zip(ys.iter()).zip(ewts.iter_mut()) {
        if !tol.update_weights(y, ewt) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    type Vcpu = nalgebra::DVector<f64>;

    #[test]
    fn test_weights_scalar_atol() {
        let tol = Tolerances::<Vcpu>::scalar(1e-2, 1e-4);
        let y = Vcpu::from_vec(vec![1.0, -2.0, 0.0]);
        let mut ewt = Vcpu::zeros(3);
        assert!(tol.update_weights(&y, &mut ewt));
        assert_abs_diff_eq!(ewt[0], 1.0 / 0.0101, epsilon = 1e-9);
        assert_abs_diff_eq!(ewt[1], 1.0 / 0.0201, epsilon = 1e-9);
        assert_abs_diff_eq!(ewt[2], 1.0 / 0.0001, epsilon = 1e-9);
    }

    #[test]
    fn test_weights_reject_zero() {
        // atol = 0 and a zero component make the weight infinite
        let tol = Tolerances::<Vcpu>::scalar(1e-2, 0.0);
        let y = Vcpu::from_vec(vec![1.0, 0.0]);
        let mut ewt = Vcpu::zeros(2);
        assert!(!tol.update_weights(&y, &mut ewt));
    }

    #[test]
    fn test_validate_length_mismatch() {
        let tol = Tolerances::vector(1e-2, Vcpu::from_vec(vec![1e-4; 2]));
        assert!(tol.validate(3).is_err());
        assert!(tol.validate(2).is_ok());
    }
}
