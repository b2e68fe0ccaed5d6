//! Dense linear algebra helpers for the inversion.

use nalgebra::{DMatrix, Schur, SVD};

/// Tolerance used when truncating small singular values.
const PSEUDO_INVERSE_EPSILON: f64 = 1e-12;

/// Maximum number of iterations for the iterative decompositions.
const MAX_DECOMPOSITION_ITERATIONS: usize = 1000;

/// How to proceed when a matrix that should be inverted is singular.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum SingularInversePolicy {
    /// Use the SVD pseudo-inverse, and a unit scaled identity if that fails.
    PseudoInverse,
    /// Use an identity matrix scaled by the given factor divided by the
    /// mean absolute matrix element.
    ScaledIdentity(f64),
}

impl Default for SingularInversePolicy {
    fn default() -> Self {
        Self::PseudoInverse
    }
}

/// Matrix inverter applying a singular inverse policy and counting how
/// often the policy had to be applied.
#[derive(Clone, Debug)]
pub struct Inverter {
    policy: SingularInversePolicy,
    degenerate_inversions: usize,
}

impl Inverter {
    /// Creates a new inverter using the given singular inverse policy.
    pub fn new(policy: SingularInversePolicy) -> Self {
        Self {
            policy,
            degenerate_inversions: 0,
        }
    }

    /// Returns the singular inverse policy.
    pub fn policy(&self) -> SingularInversePolicy {
        self.policy
    }

    /// Returns the number of inversions so far that required the fallback.
    pub fn degenerate_inversions(&self) -> usize {
        self.degenerate_inversions
    }

    /// Records a degenerate solve performed outside of the inverter.
    pub fn record_degenerate(&mut self) {
        self.degenerate_inversions += 1;
    }

    /// Inverts the given square matrix.
    ///
    /// A singular or non-finite matrix never produces an error. Instead the
    /// fallback given by the policy is returned and the degeneracy is counted.
    ///
    /// # Parameters
    ///
    /// - `matrix`: Square matrix to invert.
    ///
    /// # Returns
    ///
    /// The inverse, or its fallback substitute.
    ///
    /// # Panics
    ///
    /// If the matrix is not square.
    pub fn invert(&mut self, matrix: &DMatrix<f64>) -> DMatrix<f64> {
        assert!(matrix.is_square(), "Cannot invert a non-square matrix");

        if is_finite(matrix) {
            if let Some(inverse) = matrix.clone().try_inverse() {
                if is_finite(&inverse) {
                    return inverse;
                }
            }
        }
        self.degenerate_inversions += 1;

        match self.policy {
            SingularInversePolicy::PseudoInverse => {
                pseudo_inverse(matrix).unwrap_or_else(|| scaled_identity(matrix, 1.0))
            }
            SingularInversePolicy::ScaledIdentity(scale) => scaled_identity(matrix, scale),
        }
    }
}

impl Default for Inverter {
    fn default() -> Self {
        Self::new(SingularInversePolicy::default())
    }
}

/// Whether all elements of the matrix are finite.
pub fn is_finite(matrix: &DMatrix<f64>) -> bool {
    matrix.iter().all(|value| value.is_finite())
}

/// Computes the SVD pseudo-inverse, or `None` if the decomposition fails or
/// produces non-finite values.
pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if !is_finite(matrix) {
        return None;
    }
    let svd = SVD::try_new(
        matrix.clone(),
        true,
        true,
        f64::EPSILON,
        MAX_DECOMPOSITION_ITERATIONS,
    )?;
    svd.pseudo_inverse(PSEUDO_INVERSE_EPSILON)
        .ok()
        .filter(is_finite)
}

fn scaled_identity(matrix: &DMatrix<f64>, scale: f64) -> DMatrix<f64> {
    let n_elements = matrix.len().max(1) as f64;
    let mean_magnitude = matrix.iter().map(|value| value.abs()).sum::<f64>() / n_elements;
    let factor = if mean_magnitude.is_finite() && mean_magnitude > 0.0 {
        scale / mean_magnitude
    } else {
        scale
    };
    DMatrix::identity(matrix.ncols(), matrix.nrows()) * factor
}

/// Computes the left pseudo-inverse `(KᵀK)⁻¹Kᵀ` of a matrix with at least as
/// many rows as columns.
pub fn left_pseudo_inverse(matrix: &DMatrix<f64>, inverter: &mut Inverter) -> DMatrix<f64> {
    let transpose = matrix.transpose();
    inverter.invert(&(&transpose * matrix)) * transpose
}

/// Computes the right pseudo-inverse `Kᵀ(KKᵀ)⁻¹` of a matrix with at least as
/// many columns as rows.
pub fn right_pseudo_inverse(matrix: &DMatrix<f64>, inverter: &mut Inverter) -> DMatrix<f64> {
    let transpose = matrix.transpose();
    &transpose * inverter.invert(&(matrix * &transpose))
}

/// Computes the Shannon information content `0.5 Σ log₂(1 + λ²)` over the
/// eigenvalues `λ` of the given averaging kernel.
///
/// Returns NaN if the kernel contains non-finite values, if the eigenvalue
/// decomposition fails to converge or if any eigenvalue is complex.
pub fn information_content(averaging_kernel: &DMatrix<f64>) -> f64 {
    if !averaging_kernel.is_square() || !is_finite(averaging_kernel) {
        return f64::NAN;
    }
    Schur::try_new(
        averaging_kernel.clone(),
        f64::EPSILON,
        MAX_DECOMPOSITION_ITERATIONS,
    )
    .and_then(|schur| schur.eigenvalues())
    .map_or(f64::NAN, |eigenvalues| {
        0.5 * eigenvalues
            .iter()
            .map(|&eigenvalue| (1.0 + eigenvalue * eigenvalue).log2())
            .sum::<f64>()
    })
}
