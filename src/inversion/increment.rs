//! Gauss-Newton state increments in their algebraically equivalent forms.

use crate::{
    error::RetrievalError,
    linalg::{self, Inverter},
};
use nalgebra::{DMatrix, DVector};
use std::{fmt, str::FromStr};

/// Formulation used for computing the state increment of each iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum IncrementForm {
    /// State space form with an explicit inverse of the posterior precision.
    N,
    /// State space form expressed relative to the prior.
    NA,
    /// State space form solving the linear system by LU decomposition.
    NB,
    /// State space form solving the linear system by Cholesky decomposition.
    NC,
    /// Measurement space form with an explicit inverse.
    M,
    /// Measurement space form solving by Cholesky decomposition.
    MC,
    /// Unconstrained least squares, ignoring the prior.
    LS,
    /// State space form with Levenberg-Marquardt damping.
    NLM,
}

impl IncrementForm {
    /// Returns the selector string for the form.
    pub fn selector(&self) -> &'static str {
        match self {
            Self::N => "n",
            Self::NA => "na",
            Self::NB => "nb",
            Self::NC => "nc",
            Self::M => "m",
            Self::MC => "mc",
            Self::LS => "ls",
            Self::NLM => "nlm",
        }
    }

    /// Whether the form uses Levenberg-Marquardt damping.
    pub fn is_damped(&self) -> bool {
        matches!(self, Self::NLM)
    }

    /// Whether the form ignores the prior.
    pub fn is_least_squares(&self) -> bool {
        matches!(self, Self::LS)
    }

    /// Computes the increment of one iteration.
    ///
    /// # Parameters
    ///
    /// - `problem`: Current linearized retrieval problem.
    /// - `damping`: Levenberg-Marquardt damping applied to the prior term.
    /// Only used by the damped form.
    /// - `inverter`: Inverter to use for all matrix inversions.
    ///
    /// # Returns
    ///
    /// The increment, the next state and the matching posterior covariance.
    pub fn compute(
        &self,
        problem: &LinearizedProblem,
        damping: f64,
        inverter: &mut Inverter,
    ) -> Increment {
        match self {
            Self::N => state_space_explicit(problem, 0.0, inverter),
            Self::NLM => state_space_explicit(problem, damping, inverter),
            Self::NA => state_space_relative_to_prior(problem, inverter),
            Self::NB => state_space_lu(problem, inverter),
            Self::NC => state_space_cholesky(problem, inverter),
            Self::M => measurement_space_explicit(problem, inverter),
            Self::MC => measurement_space_cholesky(problem, inverter),
            Self::LS => least_squares(problem, inverter),
        }
    }
}

impl Default for IncrementForm {
    fn default() -> Self {
        Self::N
    }
}

impl fmt::Display for IncrementForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector())
    }
}

impl FromStr for IncrementForm {
    type Err = RetrievalError;

    fn from_str(selector: &str) -> Result<Self, Self::Err> {
        match selector.to_lowercase().as_str() {
            "n" => Ok(Self::N),
            "na" => Ok(Self::NA),
            "nb" => Ok(Self::NB),
            "nc" => Ok(Self::NC),
            "m" => Ok(Self::M),
            "mc" => Ok(Self::MC),
            "ls" => Ok(Self::LS),
            "nlm" => Ok(Self::NLM),
            _ => Err(RetrievalError::UnknownIncrementForm(selector.to_string())),
        }
    }
}

/// The retrieval problem linearized around the current state.
#[derive(Clone, Debug)]
pub struct LinearizedProblem<'a> {
    /// Current state `x`.
    pub state: &'a DVector<f64>,
    /// Simulated minus observed measurement, `F(x) - y`.
    pub residual: &'a DVector<f64>,
    /// State Jacobian `K` at the current state.
    pub jacobian: &'a DMatrix<f64>,
    /// Prior state `xa`.
    pub prior: &'a DVector<f64>,
    /// Prior covariance `Sa`.
    pub prior_covariance: &'a DMatrix<f64>,
    /// Inverse prior covariance.
    pub prior_precision: &'a DMatrix<f64>,
    /// Measurement covariance `Se`.
    pub measurement_covariance: &'a DMatrix<f64>,
    /// Inverse measurement covariance.
    pub measurement_precision: &'a DMatrix<f64>,
}

impl<'a> LinearizedProblem<'a> {
    /// Computes `Kᵀ Se⁻¹`.
    fn weighted_jacobian_transpose(&self) -> DMatrix<f64> {
        self.jacobian.transpose() * self.measurement_precision
    }

    /// Computes `Kᵀ Se⁻¹ K`.
    pub fn measurement_information(&self) -> DMatrix<f64> {
        self.weighted_jacobian_transpose() * self.jacobian
    }

    /// Computes `(1 + γ) Sa⁻¹ + Kᵀ Se⁻¹ K`.
    pub fn posterior_precision(&self, damping: f64) -> DMatrix<f64> {
        self.prior_precision * (1.0 + damping) + self.measurement_information()
    }

    /// Computes `Kᵀ Se⁻¹ (F(x) - y) - Sa⁻¹ (xa - x)`.
    fn cost_gradient(&self) -> DVector<f64> {
        self.weighted_jacobian_transpose() * self.residual
            - self.prior_precision * (self.prior - self.state)
    }

    /// Computes `K (x - xa) - (F(x) - y)`.
    fn prior_relative_measurement(&self) -> DVector<f64> {
        self.jacobian * (self.state - self.prior) - self.residual
    }
}

/// Result of one increment computation.
#[derive(Clone, Debug)]
pub struct Increment {
    /// Suggested next state, before any clipping.
    pub next_state: DVector<f64>,
    /// Increment `Δx = x - x_next`.
    pub increment: DVector<f64>,
    /// Posterior precision `S⁻¹` used by the form.
    pub precision: DMatrix<f64>,
    /// Posterior covariance `S`.
    pub covariance: DMatrix<f64>,
}

impl Increment {
    fn from_increment(
        problem: &LinearizedProblem,
        increment: DVector<f64>,
        precision: DMatrix<f64>,
        covariance: DMatrix<f64>,
    ) -> Self {
        Self {
            next_state: problem.state - &increment,
            increment,
            precision,
            covariance,
        }
    }

    fn from_next_state(
        problem: &LinearizedProblem,
        next_state: DVector<f64>,
        precision: DMatrix<f64>,
        covariance: DMatrix<f64>,
    ) -> Self {
        Self {
            increment: problem.state - &next_state,
            next_state,
            precision,
            covariance,
        }
    }

    /// Computes the convergence metric `Δxᵀ S⁻¹ Δx`.
    pub fn metric(&self) -> f64 {
        self.increment.dot(&(&self.precision * &self.increment))
    }
}

fn state_space_explicit(
    problem: &LinearizedProblem,
    damping: f64,
    inverter: &mut Inverter,
) -> Increment {
    let precision = problem.posterior_precision(damping);
    let covariance = inverter.invert(&precision);
    let increment = &covariance * problem.cost_gradient();
    Increment::from_increment(problem, increment, precision, covariance)
}

fn state_space_relative_to_prior(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let precision = problem.posterior_precision(0.0);
    let covariance = inverter.invert(&precision);
    let next_state = problem.prior
        + &covariance * problem.weighted_jacobian_transpose() * problem.prior_relative_measurement();
    Increment::from_next_state(problem, next_state, precision, covariance)
}

fn state_space_lu(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let precision = problem.posterior_precision(0.0);
    let gradient = problem.cost_gradient();
    match precision
        .clone()
        .lu()
        .solve(&gradient)
        .filter(|increment| increment.iter().all(|value| value.is_finite()))
    {
        Some(increment) => {
            let covariance = inverter.invert(&precision);
            Increment::from_increment(problem, increment, precision, covariance)
        }
        None => {
            inverter.record_degenerate();
            state_space_explicit(problem, 0.0, inverter)
        }
    }
}

fn state_space_cholesky(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let precision = problem.posterior_precision(0.0);
    match precision.clone().cholesky() {
        Some(cholesky) => {
            let increment = cholesky.solve(&problem.cost_gradient());
            let covariance = cholesky.inverse();
            Increment::from_increment(problem, increment, precision, covariance)
        }
        None => state_space_lu(problem, inverter),
    }
}

fn measurement_space_explicit(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let sa_kt = problem.prior_covariance * problem.jacobian.transpose();
    let core = problem.jacobian * &sa_kt + problem.measurement_covariance;
    let gain = &sa_kt * inverter.invert(&core);
    measurement_space_increment(problem, &sa_kt, gain)
}

fn measurement_space_cholesky(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let sa_kt = problem.prior_covariance * problem.jacobian.transpose();
    let core = problem.jacobian * &sa_kt + problem.measurement_covariance;
    match core.cholesky() {
        // The core matrix and Sa are symmetric, so Sa Kᵀ core⁻¹ = (core⁻¹ K Sa)ᵀ
        Some(cholesky) => {
            let gain = cholesky.solve(&sa_kt.transpose()).transpose();
            measurement_space_increment(problem, &sa_kt, gain)
        }
        None => measurement_space_explicit(problem, inverter),
    }
}

fn measurement_space_increment(
    problem: &LinearizedProblem,
    sa_kt: &DMatrix<f64>,
    gain: DMatrix<f64>,
) -> Increment {
    let next_state = problem.prior + &gain * problem.prior_relative_measurement();
    let covariance = problem.prior_covariance - &gain * sa_kt.transpose();
    let precision = problem.posterior_precision(0.0);
    Increment::from_next_state(problem, next_state, precision, covariance)
}

fn least_squares(problem: &LinearizedProblem, inverter: &mut Inverter) -> Increment {
    let increment = linalg::left_pseudo_inverse(problem.jacobian, inverter) * problem.residual;
    let precision = problem.measurement_information();
    let covariance = inverter.invert(&precision);
    Increment::from_increment(problem, increment, precision, covariance)
}
