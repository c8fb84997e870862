use std::fmt::{Debug, Display};

pub type IndexType = usize;

/// Real scalar type the solvers are generic over.
///
/// The `EPSILON` constant is the unit roundoff used in all round-off fuzz
/// computations (step-to-output comparisons, interpolation windows) and in
/// the difference-quotient perturbation sizes.
pub trait Scalar:
    nalgebra::RealField + Copy + From<f64> + Into<f64> + Display + Debug + 'static
{
    const EPSILON: Self;

    fn from_usize(n: usize) -> Self {
        Self::from(n as f64)
    }
}

impl Scalar for f64 {
    const EPSILON: f64 = f64::EPSILON;
}
