//! Optimal estimation inversion of forward models.

pub mod diagnostics;
pub mod increment;

use crate::{
    error::RetrievalError,
    forward::ForwardOperator,
    io::Verbosity,
    linalg::{Inverter, SingularInversePolicy},
};
use diagnostics::Diagnostics;
use increment::{Increment, IncrementForm, LinearizedProblem};
use nalgebra::{DMatrix, DVector};

/// Configuration parameters for Levenberg-Marquardt damping.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct LevenbergMarquardtConfig {
    /// Damping applied in the first iteration.
    pub initial_damping: f64,
    /// Factor dividing the damping after an accepted step and multiplying it
    /// after a rejected step.
    pub damping_factor: f64,
    /// Number of consecutive rejected steps tolerated before giving up.
    pub max_damping_increases: usize,
}

impl LevenbergMarquardtConfig {
    pub const DEFAULT_INITIAL_DAMPING: f64 = 1.0;
    pub const DEFAULT_DAMPING_FACTOR: f64 = 10.0;
    pub const DEFAULT_MAX_DAMPING_INCREASES: usize = 10;
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        LevenbergMarquardtConfig {
            initial_damping: Self::DEFAULT_INITIAL_DAMPING,
            damping_factor: Self::DEFAULT_DAMPING_FACTOR,
            max_damping_increases: Self::DEFAULT_MAX_DAMPING_INCREASES,
        }
    }
}

/// Configuration parameters for optimal estimation inversions.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimalEstimationConfig {
    /// Convergence threshold, scaled by the number of state elements.
    pub epsilon: f64,
    /// Maximum number of Gauss-Newton iterations.
    pub max_iterations: usize,
    /// Whether to clip the state to its bounds before every evaluation.
    pub clip: bool,
    /// Formulation of the state increment.
    pub form: IncrementForm,
    /// Lower state bounds, replacing those of the forward model.
    pub lower_bounds: Option<Vec<f64>>,
    /// Upper state bounds, replacing those of the forward model.
    pub upper_bounds: Option<Vec<f64>>,
    /// Damping parameters, used by the damped increment form.
    pub levenberg_marquardt: LevenbergMarquardtConfig,
    /// How singular matrices are inverted.
    pub singular_inverse_policy: SingularInversePolicy,
}

impl OptimalEstimationConfig {
    pub const DEFAULT_EPSILON: f64 = 0.01;
    pub const DEFAULT_MAX_ITERATIONS: usize = 10;
    pub const DEFAULT_CLIP: bool = true;

    /// Uses the given increment form.
    pub fn with_form(mut self, form: IncrementForm) -> Self {
        self.form = form;
        self
    }

    /// Uses the given convergence threshold.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Uses the given maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Uses the given state bounds instead of those of the forward model.
    pub fn with_bounds(mut self, lower_bounds: Vec<f64>, upper_bounds: Vec<f64>) -> Self {
        self.lower_bounds = Some(lower_bounds);
        self.upper_bounds = Some(upper_bounds);
        self
    }

    /// Checks that the parameters are usable.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let invalid = |reason: &str| Err(RetrievalError::InvalidConfig(reason.to_string()));
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return invalid("convergence threshold must be positive and finite");
        }
        if self.max_iterations == 0 {
            return invalid("maximum number of iterations must be larger than zero");
        }
        let lm = &self.levenberg_marquardt;
        if !(lm.initial_damping.is_finite() && lm.initial_damping >= 0.0) {
            return invalid("initial damping must be non-negative and finite");
        }
        if !(lm.damping_factor.is_finite() && lm.damping_factor > 1.0) {
            return invalid("damping factor must be larger than one");
        }
        if let SingularInversePolicy::ScaledIdentity(scale) = self.singular_inverse_policy {
            if !(scale.is_finite() && scale > 0.0) {
                return invalid("singular inverse scale must be positive and finite");
            }
        }
        Ok(())
    }
}

impl Default for OptimalEstimationConfig {
    fn default() -> Self {
        OptimalEstimationConfig {
            epsilon: Self::DEFAULT_EPSILON,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            clip: Self::DEFAULT_CLIP,
            form: IncrementForm::default(),
            lower_bounds: None,
            upper_bounds: None,
            levenberg_marquardt: LevenbergMarquardtConfig::default(),
            singular_inverse_policy: SingularInversePolicy::default(),
        }
    }
}

/// Outcome of an optimal estimation inversion.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Retrieval {
    /// Retrieved state.
    pub state: DVector<f64>,
    /// State Jacobian at the retrieved state.
    pub jacobian: DMatrix<f64>,
    /// Whether the convergence criterion was met.
    pub converged: bool,
    /// Number of state updates needed to reach convergence, or the maximum
    /// number of iterations if the retrieval did not converge.
    pub iterations: usize,
    /// Posterior covariance `S`.
    pub retrieval_covariance: DMatrix<f64>,
    /// Gain matrix `G`.
    pub gain: DMatrix<f64>,
    /// Averaging kernel `A`.
    pub averaging_kernel: DMatrix<f64>,
    /// Cost at the retrieved state.
    pub cost: f64,
    /// Degrees of freedom for signal.
    pub degrees_of_freedom: f64,
    /// Shannon information content in bits, NaN if it could not be computed.
    pub information_content: f64,
    /// Retrieval noise covariance.
    pub noise_covariance: DMatrix<f64>,
    /// Smoothing error covariance.
    pub smoothing_covariance: DMatrix<f64>,
    /// Simulated minus observed measurement at the retrieved state.
    pub residual: DVector<f64>,
    /// Cost of every visited state, ending with the retrieved state.
    pub cost_history: Vec<f64>,
    /// Value of `Δxᵀ S⁻¹ Δx` for the last increment.
    pub final_increment_metric: f64,
    /// Number of inversions that needed the singular fallback.
    pub degenerate_inversions: usize,
}

/// Result of computing the increment for one iteration.
enum Step {
    /// An increment was found, possibly meeting the convergence criterion.
    Advanced {
        increment: Increment,
        /// Clipped state and residual to move to, if the increment is to be applied.
        next: Option<(DVector<f64>, DVector<f64>)>,
        converged: bool,
    },
    /// No damped step reduced the cost.
    Stalled,
}

/// Solver for the maximum a posteriori state of a forward model given a
/// measurement and a prior.
#[derive(Clone, Debug)]
pub struct OptimalEstimator<M: ForwardOperator> {
    model: M,
    config: OptimalEstimationConfig,
    lower_bounds: DVector<f64>,
    upper_bounds: DVector<f64>,
    verbosity: Verbosity,
}

impl<M: ForwardOperator> OptimalEstimator<M> {
    /// Creates a new estimator for the given forward model.
    ///
    /// # Parameters
    ///
    /// - `model`: Forward model to invert.
    /// - `config`: Configuration parameters for the estimator.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the new estimator.
    /// - `Err`: The configuration is invalid or inconsistent with the model.
    ///
    /// # Type parameters
    ///
    /// - `M`: Type of forward model.
    pub fn new(model: M, config: OptimalEstimationConfig) -> Result<Self, RetrievalError> {
        config.validate()?;
        let n_state = model.n_state();
        if n_state == 0 {
            return Err(RetrievalError::InvalidConfig(
                "forward model has no state elements".to_string(),
            ));
        }

        let (default_lower, default_upper) = model.state_bounds().unwrap_or_else(|| {
            (
                DVector::from_element(n_state, f64::NEG_INFINITY),
                DVector::from_element(n_state, f64::INFINITY),
            )
        });
        let lower_bounds = resolve_bounds("lower bounds", &config.lower_bounds, default_lower)?;
        let upper_bounds = resolve_bounds("upper bounds", &config.upper_bounds, default_upper)?;
        if lower_bounds.len() != n_state || upper_bounds.len() != n_state {
            return Err(RetrievalError::vector_length(
                "state bounds",
                n_state,
                lower_bounds.len().min(upper_bounds.len()),
            ));
        }
        if lower_bounds
            .iter()
            .zip(upper_bounds.iter())
            .any(|(lower, upper)| lower.is_nan() || upper.is_nan() || lower > upper)
        {
            return Err(RetrievalError::InvalidConfig(
                "lower state bounds must not exceed upper bounds".to_string(),
            ));
        }

        Ok(Self {
            model,
            config,
            lower_bounds,
            upper_bounds,
            verbosity: Verbosity::default(),
        })
    }

    /// Reports progress according to the given verbosity.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Returns a reference to the forward model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &OptimalEstimationConfig {
        &self.config
    }

    /// Returns the lower and upper state bounds.
    pub fn bounds(&self) -> (&DVector<f64>, &DVector<f64>) {
        (&self.lower_bounds, &self.upper_bounds)
    }

    /// Returns the number of state elements.
    pub fn n_state(&self) -> usize {
        self.model.n_state()
    }

    /// Returns the number of parameter elements.
    pub fn n_parameter(&self) -> usize {
        self.model.n_parameter()
    }

    /// Returns the number of measurement elements.
    pub fn n_measurement(&self) -> usize {
        self.model.n_measurement()
    }

    /// Clips the state to the bounds if clipping is enabled.
    pub fn clip(&self, state: &DVector<f64>) -> DVector<f64> {
        if self.config.clip {
            state
                .zip_map(&self.lower_bounds, f64::max)
                .zip_map(&self.upper_bounds, f64::min)
        } else {
            state.clone()
        }
    }

    /// Retrieves the state best explaining the given measurement.
    ///
    /// # Parameters
    ///
    /// - `measurement`: Observed measurement `y`.
    /// - `measurement_covariance`: Measurement error covariance `Se`.
    /// - `prior`: Prior state `xa`.
    /// - `prior_covariance`: Prior error covariance `Sa`.
    /// - `parameter`: Fixed parameters of the forward model. May be omitted
    ///   when the model has no parameters.
    /// - `first_guess`: Initial state. The prior is used if omitted.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the retrieval, whether it converged or not.
    /// - `Err`: An input has the wrong dimensions.
    pub fn invert(
        &self,
        measurement: &DVector<f64>,
        measurement_covariance: &DMatrix<f64>,
        prior: &DVector<f64>,
        prior_covariance: &DMatrix<f64>,
        parameter: Option<&DVector<f64>>,
        first_guess: Option<&DVector<f64>>,
    ) -> Result<Retrieval, RetrievalError> {
        let n_state = self.n_state();
        let n_measurement = self.n_measurement();

        let parameter = match parameter {
            Some(parameter) => parameter.clone(),
            None => DVector::zeros(0),
        };
        check_length("parameter", self.n_parameter(), parameter.len())?;
        check_length("measurement", n_measurement, measurement.len())?;
        check_shape(
            "measurement covariance",
            (n_measurement, n_measurement),
            measurement_covariance.shape(),
        )?;
        check_length("prior", n_state, prior.len())?;
        check_shape(
            "prior covariance",
            (n_state, n_state),
            prior_covariance.shape(),
        )?;
        if let Some(first_guess) = first_guess {
            check_length("first guess", n_state, first_guess.len())?;
        }

        let mut inverter = Inverter::new(self.config.singular_inverse_policy);
        let prior_precision = inverter.invert(prior_covariance);
        let measurement_precision = inverter.invert(measurement_covariance);

        let evaluate_residual = |state: &DVector<f64>| self.model.forward(state, &parameter) - measurement;
        let evaluate_cost = |state: &DVector<f64>, residual: &DVector<f64>| {
            diagnostics::cost(state, residual, prior, &prior_precision, &measurement_precision)
        };

        let form = self.config.form;
        let lm = &self.config.levenberg_marquardt;
        let convergence_threshold = self.config.epsilon * n_state as f64;

        let mut state = self.clip(first_guess.unwrap_or(prior));
        let mut residual = evaluate_residual(&state);
        let mut damping = if form.is_damped() {
            lm.initial_damping
        } else {
            0.0
        };
        let mut converged = false;
        let mut iterations = self.config.max_iterations;
        let mut cost_history = Vec::with_capacity(self.config.max_iterations + 2);
        let mut final_increment_metric = f64::NAN;

        // The increment of iteration `i` is checked after `i` updates, so the
        // last pass only tests for convergence.
        for iteration in 0..=self.config.max_iterations {
            let jacobian = self.model.jacobian(&state, &parameter);
            let cost = evaluate_cost(&state, &residual);
            cost_history.push(cost);

            let problem = LinearizedProblem {
                state: &state,
                residual: &residual,
                jacobian: &jacobian,
                prior,
                prior_covariance,
                prior_precision: &prior_precision,
                measurement_covariance,
                measurement_precision: &measurement_precision,
            };

            let step = if form.is_damped() {
                let mut damping_increases = 0;
                loop {
                    let increment = form.compute(&problem, damping, &mut inverter);
                    let trial_state = self.clip(&increment.next_state);
                    let trial_residual = evaluate_residual(&trial_state);
                    let trial_cost = evaluate_cost(&trial_state, &trial_residual);
                    let trial_converged = increment.metric() < convergence_threshold;

                    if self.verbosity.print_messages() {
                        println!(
                            "Iteration {}: cost {:.6e} -> {:.6e} with damping {:.3e}",
                            iteration, cost, trial_cost, damping
                        );
                    }

                    if trial_cost < cost {
                        damping /= lm.damping_factor;
                        break Step::Advanced {
                            increment,
                            next: Some((trial_state, trial_residual)),
                            converged: trial_converged,
                        };
                    } else if trial_converged {
                        break Step::Advanced {
                            increment,
                            next: None,
                            converged: true,
                        };
                    }

                    damping *= lm.damping_factor;
                    damping_increases += 1;
                    if damping_increases > lm.max_damping_increases {
                        break Step::Stalled;
                    }
                }
            } else {
                let increment = form.compute(&problem, 0.0, &mut inverter);
                let step_converged = if form.is_least_squares() {
                    residual.norm_squared() / (n_measurement as f64) < self.config.epsilon
                } else {
                    increment.metric() < convergence_threshold
                };
                let next_state = self.clip(&increment.next_state);
                let next_residual = evaluate_residual(&next_state);
                Step::Advanced {
                    increment,
                    next: Some((next_state, next_residual)),
                    converged: step_converged,
                }
            };

            match step {
                Step::Advanced {
                    increment,
                    next,
                    converged: step_converged,
                } => {
                    final_increment_metric = increment.metric();
                    if self.verbosity.print_messages() {
                        println!(
                            "Iteration {}: cost {:.6e}, increment metric {:.6e}",
                            iteration, cost, final_increment_metric
                        );
                    }
                    let exhausted = iteration == self.config.max_iterations;
                    if step_converged || !exhausted {
                        if let Some((next_state, next_residual)) = next {
                            state = next_state;
                            residual = next_residual;
                        }
                    }
                    if step_converged {
                        converged = true;
                        iterations = iteration;
                        break;
                    }
                }
                Step::Stalled => {
                    if self.verbosity.print_messages() {
                        println!(
                            "Iteration {}: no damped step reduced the cost, stopping",
                            iteration
                        );
                    }
                    break;
                }
            }
        }

        let state = self.clip(&state);
        let residual = evaluate_residual(&state);
        let jacobian = self.model.jacobian(&state, &parameter);
        let cost = evaluate_cost(&state, &residual);
        cost_history.push(cost);

        let diagnostics = Diagnostics::compute(
            &jacobian,
            prior_covariance,
            &prior_precision,
            measurement_covariance,
            &measurement_precision,
            !form.is_least_squares(),
            &mut inverter,
        );

        if self.verbosity.print_messages() {
            println!(
                "{} after {} iterations with cost {:.6e} and {:.3} degrees of freedom",
                if converged {
                    "Converged"
                } else {
                    "Did not converge"
                },
                iterations,
                cost,
                diagnostics.degrees_of_freedom
            );
        }

        Ok(Retrieval {
            state,
            jacobian,
            converged,
            iterations,
            retrieval_covariance: diagnostics.covariance,
            gain: diagnostics.gain,
            averaging_kernel: diagnostics.averaging_kernel,
            cost,
            degrees_of_freedom: diagnostics.degrees_of_freedom,
            information_content: diagnostics.information_content,
            noise_covariance: diagnostics.noise_covariance,
            smoothing_covariance: diagnostics.smoothing_covariance,
            residual,
            cost_history,
            final_increment_metric,
            degenerate_inversions: inverter.degenerate_inversions(),
        })
    }
}

fn resolve_bounds(
    quantity: &'static str,
    overrides: &Option<Vec<f64>>,
    default: DVector<f64>,
) -> Result<DVector<f64>, RetrievalError> {
    match overrides {
        Some(bounds) => {
            check_length(quantity, default.len(), bounds.len())?;
            Ok(DVector::from_column_slice(bounds))
        }
        None => Ok(default),
    }
}

fn check_length(quantity: &'static str, expected: usize, actual: usize) -> Result<(), RetrievalError> {
    if expected == actual {
        Ok(())
    } else {
        Err(RetrievalError::vector_length(quantity, expected, actual))
    }
}

fn check_shape(
    quantity: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> Result<(), RetrievalError> {
    if expected == actual {
        Ok(())
    } else {
        Err(RetrievalError::matrix_shape(quantity, expected, actual))
    }
}
