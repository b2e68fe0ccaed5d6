//! Forward models mapping a state and parameter vector to simulated measurements.

pub mod lut;

use crate::num;
use nalgebra::{DMatrix, DVector};

/// Defines the properties of a forward model that can be inverted.
pub trait ForwardOperator: Sync {
    /// Returns the number of state vector elements.
    fn n_state(&self) -> usize;

    /// Returns the number of parameter vector elements.
    fn n_parameter(&self) -> usize;

    /// Returns the number of simulated measurement elements.
    fn n_measurement(&self) -> usize;

    /// Simulates the measurement for the given state and parameters.
    fn forward(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DVector<f64>;

    /// Computes the `n_measurement x n_state` Jacobian of the forward model
    /// with respect to the state.
    fn jacobian(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DMatrix<f64>;

    /// Returns the default lower and upper bounds of the state, if any.
    fn state_bounds(&self) -> Option<(DVector<f64>, DVector<f64>)> {
        None
    }
}

/// Computes a Jacobian by central finite differences.
///
/// The step for element `x` is `max(sign(x)·h, x·h)`, where `h` is the cube
/// root of the unit in the last place of one. Elements equal to zero use `h`.
///
/// # Parameters
///
/// - `function`: Function to differentiate.
/// - `point`: Point at which to evaluate the derivatives.
/// - `n_outputs`: Number of values returned by the function.
///
/// # Returns
///
/// The `n_outputs x point.len()` Jacobian matrix.
///
/// # Type parameters
///
/// - `Fw`: Function type.
pub fn numerical_jacobian<Fw>(function: Fw, point: &DVector<f64>, n_outputs: usize) -> DMatrix<f64>
where
    Fw: Fn(&DVector<f64>) -> DVector<f64>,
{
    finite_difference_jacobian(function, point, n_outputs, None)
}

/// Computes a Jacobian by finite differences without leaving the given bounds.
///
/// Elements whose central stencil would cross a bound are differentiated
/// with a one-sided difference pointing into the bounded region.
///
/// # Parameters
///
/// - `function`: Function to differentiate.
/// - `point`: Point at which to evaluate the derivatives.
/// - `n_outputs`: Number of values returned by the function.
/// - `lower`: Lower bound for each element of the point.
/// - `upper`: Upper bound for each element of the point.
///
/// # Returns
///
/// The `n_outputs x point.len()` Jacobian matrix.
///
/// # Type parameters
///
/// - `Fw`: Function type.
pub fn numerical_jacobian_within_bounds<Fw>(
    function: Fw,
    point: &DVector<f64>,
    n_outputs: usize,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> DMatrix<f64>
where
    Fw: Fn(&DVector<f64>) -> DVector<f64>,
{
    assert_eq!(lower.len(), point.len(), "Lower bounds must match point length.");
    assert_eq!(upper.len(), point.len(), "Upper bounds must match point length.");
    finite_difference_jacobian(function, point, n_outputs, Some((lower, upper)))
}

fn finite_difference_jacobian<Fw>(
    function: Fw,
    point: &DVector<f64>,
    n_outputs: usize,
    bounds: Option<(&DVector<f64>, &DVector<f64>)>,
) -> DMatrix<f64>
where
    Fw: Fn(&DVector<f64>) -> DVector<f64>,
{
    let base_step: f64 = num::central_difference_scale();
    let mut jacobian = DMatrix::zeros(n_outputs, point.len());
    let mut shifted = point.clone();

    for (column, &value) in point.iter().enumerate() {
        let step = f64::max(value.signum() * base_step, value * base_step);
        let step = if value == 0.0 || step == 0.0 {
            base_step
        } else {
            step
        };

        let (below, above) = match bounds {
            Some((lower, upper)) => (
                value - step.abs() < lower[column],
                value + step.abs() > upper[column],
            ),
            None => (false, false),
        };

        let derivative = match (below, above) {
            (true, false) => {
                let step = step.abs();
                shifted[column] = value + step;
                let forward = function(&shifted);
                shifted[column] = value;
                (forward - function(&shifted)) / step
            }
            (false, true) => {
                let step = step.abs();
                shifted[column] = value - step;
                let backward = function(&shifted);
                shifted[column] = value;
                (function(&shifted) - backward) / step
            }
            _ => {
                shifted[column] = value + step;
                let upper = function(&shifted);
                shifted[column] = value - step;
                let lower = function(&shifted);
                shifted[column] = value;
                (upper - lower) / (2.0 * step)
            }
        };
        jacobian.set_column(column, &derivative);
    }
    jacobian
}

type BoxedJacobian = Box<dyn Fn(&DVector<f64>, &DVector<f64>) -> DMatrix<f64> + Sync + Send>;

/// Forward model defined by an arbitrary function of the state and parameters.
pub struct FunctionForwardModel<Fw> {
    function: Fw,
    jacobian: Option<BoxedJacobian>,
    n_state: usize,
    n_parameter: usize,
    n_measurement: usize,
    state_bounds: Option<(DVector<f64>, DVector<f64>)>,
}

impl<Fw> FunctionForwardModel<Fw>
where
    Fw: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64> + Sync,
{
    /// Creates a new forward model whose Jacobian is computed numerically.
    ///
    /// # Parameters
    ///
    /// - `n_state`: Number of state vector elements.
    /// - `n_parameter`: Number of parameter vector elements.
    /// - `n_measurement`: Number of values returned by `function`.
    /// - `function`: Closure simulating the measurement from state and parameters.
    pub fn new(n_state: usize, n_parameter: usize, n_measurement: usize, function: Fw) -> Self {
        Self {
            function,
            jacobian: None,
            n_state,
            n_parameter,
            n_measurement,
            state_bounds: None,
        }
    }

    /// Uses the given closure to compute the state Jacobian.
    pub fn with_jacobian<J>(mut self, jacobian: J) -> Self
    where
        J: Fn(&DVector<f64>, &DVector<f64>) -> DMatrix<f64> + Sync + Send + 'static,
    {
        self.jacobian = Some(Box::new(jacobian));
        self
    }

    /// Uses the given default bounds on the state.
    pub fn with_state_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Self {
        self.state_bounds = Some((lower, upper));
        self
    }
}

impl<Fw> ForwardOperator for FunctionForwardModel<Fw>
where
    Fw: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64> + Sync,
{
    fn n_state(&self) -> usize {
        self.n_state
    }

    fn n_parameter(&self) -> usize {
        self.n_parameter
    }

    fn n_measurement(&self) -> usize {
        self.n_measurement
    }

    fn forward(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DVector<f64> {
        (self.function)(state, parameter)
    }

    fn jacobian(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DMatrix<f64> {
        match &self.jacobian {
            Some(jacobian) => jacobian(state, parameter),
            None => match &self.state_bounds {
                Some((lower, upper)) => numerical_jacobian_within_bounds(
                    |shifted| (self.function)(shifted, parameter),
                    state,
                    self.n_measurement,
                    lower,
                    upper,
                ),
                None => numerical_jacobian(
                    |shifted| (self.function)(shifted, parameter),
                    state,
                    self.n_measurement,
                ),
            },
        }
    }

    fn state_bounds(&self) -> Option<(DVector<f64>, DVector<f64>)> {
        self.state_bounds.clone()
    }
}
