//! Error analysis of a completed retrieval.

use crate::linalg::{self, Inverter};
use nalgebra::{DMatrix, DVector};

/// Computes the cost `(xa - x)ᵀ Sa⁻¹ (xa - x) + rᵀ Se⁻¹ r` of a state whose
/// measurement residual is `r`.
pub fn cost(
    state: &DVector<f64>,
    residual: &DVector<f64>,
    prior: &DVector<f64>,
    prior_precision: &DMatrix<f64>,
    measurement_precision: &DMatrix<f64>,
) -> f64 {
    let prior_deviation = prior - state;
    prior_deviation.dot(&(prior_precision * &prior_deviation))
        + residual.dot(&(measurement_precision * residual))
}

/// Characterization of the retrieved state and its errors.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    /// Posterior covariance `S`.
    pub covariance: DMatrix<f64>,
    /// Gain matrix `G = S Kᵀ Se⁻¹`.
    pub gain: DMatrix<f64>,
    /// Averaging kernel `A = G K`.
    pub averaging_kernel: DMatrix<f64>,
    /// Degrees of freedom for signal, `trace(A)`.
    pub degrees_of_freedom: f64,
    /// Shannon information content in bits.
    pub information_content: f64,
    /// Retrieval noise covariance `G Se Gᵀ`.
    pub noise_covariance: DMatrix<f64>,
    /// Smoothing error covariance `(I - A) Sa (I - A)ᵀ`.
    pub smoothing_covariance: DMatrix<f64>,
}

impl Diagnostics {
    /// Computes the diagnostics for the given Jacobian at the retrieved state.
    ///
    /// # Parameters
    ///
    /// - `jacobian`: State Jacobian `K` at the retrieved state.
    /// - `prior_covariance`: Prior covariance `Sa`.
    /// - `prior_precision`: Inverse prior covariance.
    /// - `measurement_covariance`: Measurement covariance `Se`.
    /// - `measurement_precision`: Inverse measurement covariance.
    /// - `include_prior`: Whether the prior constrains the posterior covariance.
    /// - `inverter`: Inverter to use for the posterior covariance.
    pub fn compute(
        jacobian: &DMatrix<f64>,
        prior_covariance: &DMatrix<f64>,
        prior_precision: &DMatrix<f64>,
        measurement_covariance: &DMatrix<f64>,
        measurement_precision: &DMatrix<f64>,
        include_prior: bool,
        inverter: &mut Inverter,
    ) -> Self {
        let n_state = jacobian.ncols();
        let weighted_jacobian_transpose = jacobian.transpose() * measurement_precision;

        let mut precision = &weighted_jacobian_transpose * jacobian;
        if include_prior {
            precision += prior_precision;
        }
        let covariance = inverter.invert(&precision);

        let gain = &covariance * weighted_jacobian_transpose;
        let averaging_kernel = &gain * jacobian;
        let degrees_of_freedom = averaging_kernel.trace();
        let information_content = linalg::information_content(&averaging_kernel);
        let noise_covariance = &gain * measurement_covariance * gain.transpose();

        let resolution_deficit = DMatrix::identity(n_state, n_state) - &averaging_kernel;
        let smoothing_covariance =
            &resolution_deficit * prior_covariance * resolution_deficit.transpose();

        Self {
            covariance,
            gain,
            averaging_kernel,
            degrees_of_freedom,
            information_content,
            noise_covariance,
            smoothing_covariance,
        }
    }
}
