//! Utilities related to numbers.

use ieee754;
use num;
use std::fmt;

/// Floating point marker trait for easier control over trait bounds.
pub trait BFloat:
    Sync
    + Send
    + num::Float
    + num::cast::FromPrimitive
    + ieee754::Ieee754
    + Into<f64>
    + fmt::Debug
    + 'static
{
}

impl BFloat for f32 {}
impl BFloat for f64 {}

/// Whether every value produced by the given iterator is finite.
pub fn all_finite<'a, F, I>(values: I) -> bool
where
    F: BFloat,
    I: IntoIterator<Item = &'a F>,
{
    values.into_iter().all(|value| value.is_finite())
}

/// Returns the cube root of the unit in the last place of one, which balances
/// truncation and rounding error for central finite differences.
pub fn central_difference_scale<F: BFloat>() -> F {
    let ulp = F::one().ulp().unwrap_or_else(F::epsilon);
    ulp.cbrt()
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn central_difference_scale_is_cube_root_of_epsilon() {
        let scale: f64 = central_difference_scale();
        approx::assert_relative_eq!(scale, f64::EPSILON.cbrt(), max_relative = 1e-12);
    }

    #[test]
    fn non_finite_values_are_detected() {
        assert!(all_finite(&[1.0_f64, -2.0, 0.0]));
        assert!(!all_finite(&[1.0_f32, f32::NAN]));
        assert!(!all_finite(&[f64::INFINITY]));
    }
}
