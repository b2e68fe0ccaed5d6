//! Forward model backed by an interpolated lookup table.

use super::{numerical_jacobian_within_bounds, ForwardOperator};
use crate::{
    error::RetrievalError,
    grid::{fgr, LutGrid},
    interpolation::Interpolator,
    num::BFloat,
};
use nalgebra::{DMatrix, DVector};
use std::{ops::Range, sync::Arc};

/// How the state Jacobian of a lookup table forward model is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum JacobianSource {
    /// Interpolated from a separate table of precomputed Jacobians.
    Precomputed,
    /// Differentiated analytically from the interpolant.
    Analytic,
    /// Computed by central finite differences of the interpolant.
    Numerical,
}

/// A forward model that interpolates a lookup table whose leading axes are
/// the state and whose trailing axes are fixed parameters.
///
/// At least one trailing axis is always a parameter.
#[derive(Clone, Debug)]
pub struct LutForwardModel<F: BFloat, I: Interpolator> {
    grid: Arc<LutGrid<F>>,
    jacobian_grid: Option<Arc<LutGrid<F>>>,
    interpolator: I,
    state_index: usize,
    jacobian_source: JacobianSource,
}

impl<F: BFloat, I: Interpolator> LutForwardModel<F, I> {
    /// Creates a new lookup table forward model using analytic Jacobians.
    ///
    /// # Parameters
    ///
    /// - `grid`: Lookup table of simulated measurements.
    /// - `state_index`: Number of leading grid axes that make up the state.
    /// - `interpolator`: Interpolator to use for the lookup table.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the new forward model.
    /// - `Err`: The state index does not lie in `1..n_axes`.
    ///
    /// # Type parameters
    ///
    /// - `F`: Floating point type of the table values.
    /// - `I`: Type of interpolator.
    pub fn new(
        grid: Arc<LutGrid<F>>,
        state_index: usize,
        interpolator: I,
    ) -> Result<Self, RetrievalError> {
        let n_axes = grid.n_dims();
        if state_index == 0 || state_index >= n_axes {
            return Err(RetrievalError::InvalidStateIndex {
                state_index,
                n_axes,
            });
        }
        Ok(Self {
            grid,
            jacobian_grid: None,
            interpolator,
            state_index,
            jacobian_source: JacobianSource::Analytic,
        })
    }

    /// Uses a table of precomputed state Jacobians.
    ///
    /// The table must have as many axes as the measurement table and hold the
    /// row-major `n_measurement x n_state` Jacobian at every node.
    pub fn with_jacobian_grid(
        mut self,
        jacobian_grid: Arc<LutGrid<F>>,
    ) -> Result<Self, RetrievalError> {
        let lut_shape = jacobian_grid.values().shape().to_vec();
        if jacobian_grid.n_dims() != self.grid.n_dims() {
            return Err(RetrievalError::ShapeMismatch {
                lut_shape,
                reason: format!(
                    "Jacobian table has {} axes but the measurement table has {}",
                    jacobian_grid.n_dims(),
                    self.grid.n_dims()
                ),
            });
        }
        let n_jacobian_elements = self.n_measurement() * self.n_state();
        if jacobian_grid.n_outputs() != n_jacobian_elements {
            return Err(RetrievalError::ShapeMismatch {
                lut_shape,
                reason: format!(
                    "Jacobian table must hold {} values per node, not {}",
                    n_jacobian_elements,
                    jacobian_grid.n_outputs()
                ),
            });
        }
        self.jacobian_grid = Some(jacobian_grid);
        self.jacobian_source = JacobianSource::Precomputed;
        Ok(self)
    }

    /// Uses finite differences of the interpolant for Jacobians.
    ///
    /// Differences are one-sided at the edges of the table.
    pub fn with_numerical_jacobian(mut self) -> Self {
        self.jacobian_grid = None;
        self.jacobian_source = JacobianSource::Numerical;
        self
    }

    /// Returns a reference to the measurement lookup table.
    pub fn grid(&self) -> &LutGrid<F> {
        &self.grid
    }

    /// Returns a reference to the interpolator.
    pub fn interpolator(&self) -> &I {
        &self.interpolator
    }

    /// Returns the number of leading grid axes making up the state.
    pub fn state_index(&self) -> usize {
        self.state_index
    }

    /// Returns how state Jacobians are obtained.
    pub fn jacobian_source(&self) -> JacobianSource {
        self.jacobian_source
    }

    fn axis_bounds(&self, dims: Range<usize>) -> (DVector<f64>, DVector<f64>) {
        let axes = &self.grid.axes()[dims];
        (
            DVector::from_iterator(axes.len(), axes.iter().map(|axis| axis.min())),
            DVector::from_iterator(axes.len(), axes.iter().map(|axis| axis.max())),
        )
    }

    fn coords(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> Vec<fgr> {
        assert_eq!(state.len(), self.n_state(), "Wrong number of state elements");
        assert_eq!(
            parameter.len(),
            self.n_parameter(),
            "Wrong number of parameter elements"
        );
        state.iter().chain(parameter.iter()).copied().collect()
    }

    /// Simulates the measurement by interpolating the lookup table at the
    /// combined state and parameter coordinates.
    ///
    /// # Panics
    ///
    /// If the state or parameter vector has the wrong length.
    pub fn forward(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DVector<f64> {
        let coords = self.coords(state, parameter);
        DVector::from_vec(self.interpolator.interp_at_coords(&self.grid, &coords))
    }

    /// Computes the Jacobian of the interpolant with respect to all grid
    /// coordinates.
    fn full_jacobian(&self, coords: &[fgr]) -> DMatrix<f64> {
        let n_outputs = self.grid.n_outputs();
        let n_dims = self.grid.n_dims();
        let fractional_indices = self.grid.fractional_indices(coords);
        let mut values = vec![0.0; n_outputs];
        let mut jacobian = vec![0.0; n_outputs * n_dims];
        self.interpolator.interp_values_and_jacobian(
            &self.grid,
            &fractional_indices,
            &mut values,
            &mut jacobian,
        );
        DMatrix::from_row_slice(n_outputs, n_dims, &jacobian)
    }

    /// Computes the `n_measurement x n_state` Jacobian with respect to the state.
    ///
    /// # Panics
    ///
    /// If the state or parameter vector has the wrong length.
    pub fn jacobian_wrt_state(
        &self,
        state: &DVector<f64>,
        parameter: &DVector<f64>,
    ) -> DMatrix<f64> {
        let coords = self.coords(state, parameter);
        match (self.jacobian_source, &self.jacobian_grid) {
            (JacobianSource::Precomputed, Some(jacobian_grid)) => {
                let elements = self.interpolator.interp_at_coords(jacobian_grid, &coords);
                DMatrix::from_row_slice(self.n_measurement(), self.n_state(), &elements)
            }
            (JacobianSource::Numerical, _) => {
                let (lower, upper) = self.axis_bounds(0..self.state_index);
                numerical_jacobian_within_bounds(
                    |shifted| self.forward(shifted, parameter),
                    state,
                    self.n_measurement(),
                    &lower,
                    &upper,
                )
            }
            _ => self
                .full_jacobian(&coords)
                .columns(0, self.state_index)
                .into_owned(),
        }
    }

    /// Computes the `n_measurement x n_parameter` Jacobian with respect to the
    /// parameters.
    ///
    /// # Panics
    ///
    /// If the state or parameter vector has the wrong length.
    pub fn jacobian_wrt_parameter(
        &self,
        state: &DVector<f64>,
        parameter: &DVector<f64>,
    ) -> DMatrix<f64> {
        let coords = self.coords(state, parameter);
        match self.jacobian_source {
            JacobianSource::Numerical => {
                let (lower, upper) = self.axis_bounds(self.state_index..self.grid.n_dims());
                numerical_jacobian_within_bounds(
                    |shifted| self.forward(state, shifted),
                    parameter,
                    self.n_measurement(),
                    &lower,
                    &upper,
                )
            }
            _ => self
                .full_jacobian(&coords)
                .columns(self.state_index, self.n_parameter())
                .into_owned(),
        }
    }

    /// Propagates the parameter error covariance into measurement space as
    /// `Kp Sp Kpᵀ`.
    pub fn propagate_parameter_covariance(
        &self,
        state: &DVector<f64>,
        parameter: &DVector<f64>,
        parameter_covariance: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, RetrievalError> {
        let n_parameter = self.n_parameter();
        if parameter_covariance.shape() != (n_parameter, n_parameter) {
            return Err(RetrievalError::matrix_shape(
                "parameter covariance",
                (n_parameter, n_parameter),
                parameter_covariance.shape(),
            ));
        }
        let parameter_jacobian = self.jacobian_wrt_parameter(state, parameter);
        Ok(&parameter_jacobian * parameter_covariance * parameter_jacobian.transpose())
    }

    /// Computes the measurement error covariance augmented with the propagated
    /// parameter error covariance, `Se + Kp Sp Kpᵀ`.
    pub fn effective_measurement_covariance(
        &self,
        state: &DVector<f64>,
        parameter: &DVector<f64>,
        measurement_covariance: &DMatrix<f64>,
        parameter_covariance: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, RetrievalError> {
        let n_measurement = self.n_measurement();
        if measurement_covariance.shape() != (n_measurement, n_measurement) {
            return Err(RetrievalError::matrix_shape(
                "measurement covariance",
                (n_measurement, n_measurement),
                measurement_covariance.shape(),
            ));
        }
        Ok(measurement_covariance
            + self.propagate_parameter_covariance(state, parameter, parameter_covariance)?)
    }
}

impl<F: BFloat, I: Interpolator> ForwardOperator for LutForwardModel<F, I> {
    fn n_state(&self) -> usize {
        self.state_index
    }

    fn n_parameter(&self) -> usize {
        self.grid.n_dims() - self.state_index
    }

    fn n_measurement(&self) -> usize {
        self.grid.n_outputs()
    }

    fn forward(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DVector<f64> {
        LutForwardModel::forward(self, state, parameter)
    }

    fn jacobian(&self, state: &DVector<f64>, parameter: &DVector<f64>) -> DMatrix<f64> {
        self.jacobian_wrt_state(state, parameter)
    }

    /// The state is bounded by the extent of the state axes.
    fn state_bounds(&self) -> Option<(DVector<f64>, DVector<f64>)> {
        Some(self.axis_bounds(0..self.state_index))
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::{grid::axis::Axis, interpolation::multilinear::MultilinearInterpolator};
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::*;

    /// Two measurements `[2a + b - c, a·c]` over state `(a, b)` and parameter `c`.
    fn model() -> LutForwardModel<f64, MultilinearInterpolator> {
        let a = vec![0.0, 1.0, 3.0];
        let b = vec![5.0, 2.0, -1.0, -4.0];
        let c = vec![0.5, 1.0, 2.0];
        let values = Array::from_shape_fn((3, 4, 3, 2), |(i, j, k, m)| {
            if m == 0 {
                2.0 * a[i] + b[j] - c[k]
            } else {
                a[i] * c[k]
            }
        });
        let axes = Axis::from_tables(vec![a, b, c]).unwrap();
        let grid = LutGrid::new(values.into_dyn(), axes).unwrap();
        LutForwardModel::new(Arc::new(grid), 2, MultilinearInterpolator::default()).unwrap()
    }

    fn state_and_parameter() -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_vec(vec![1.5, 0.5]),
            DVector::from_vec(vec![1.5]),
        )
    }

    #[test]
    fn forward_model_interpolates_state_and_parameter() {
        let model = model();
        assert_eq!(model.n_state(), 2);
        assert_eq!(model.n_parameter(), 1);
        assert_eq!(model.n_measurement(), 2);

        let (state, parameter) = state_and_parameter();
        let measurement = model.forward(&state, &parameter);
        assert_abs_diff_eq!(measurement[0], 3.0 + 0.5 - 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(measurement[1], 1.5 * 1.5, epsilon = 1e-12);
    }

    #[test]
    fn analytic_and_numerical_jacobians_agree() {
        let analytic = model();
        let numerical = model().with_numerical_jacobian();
        assert_eq!(numerical.jacobian_source(), JacobianSource::Numerical);

        let (state, parameter) = state_and_parameter();
        let expected_state = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.5, 0.0]);
        let expected_parameter = DMatrix::from_row_slice(2, 1, &[-1.0, 1.5]);
        for model in [analytic, numerical] {
            assert_abs_diff_eq!(
                model.jacobian_wrt_state(&state, &parameter),
                expected_state,
                epsilon = 1e-8
            );
            assert_abs_diff_eq!(
                model.jacobian_wrt_parameter(&state, &parameter),
                expected_parameter,
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn numerical_jacobians_stay_inside_table_at_edges() {
        let numerical = model().with_numerical_jacobian();
        let state = DVector::from_vec(vec![3.0, -4.0]);
        let parameter = DVector::from_vec(vec![0.5]);
        assert_abs_diff_eq!(
            numerical.jacobian_wrt_state(&state, &parameter),
            DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.5, 0.0]),
            epsilon = 1e-8
        );
        assert_abs_diff_eq!(
            numerical.jacobian_wrt_parameter(&state, &parameter),
            DMatrix::from_row_slice(2, 1, &[-1.0, 3.0]),
            epsilon = 1e-8
        );
    }

    #[test]
    fn precomputed_jacobians_are_interpolated() {
        let model = model();
        let axes = model.grid().axes().to_vec();
        let jacobians = Array::from_shape_fn((3, 4, 3, 4), |(_, _, k, m)| match m {
            0 => 2.0,
            1 => 1.0,
            2 => [0.5, 1.0, 2.0][k],
            _ => 0.0,
        });
        let jacobian_grid = LutGrid::new(jacobians.into_dyn(), axes).unwrap();
        let model = model.with_jacobian_grid(Arc::new(jacobian_grid)).unwrap();
        assert_eq!(model.jacobian_source(), JacobianSource::Precomputed);

        let (state, parameter) = state_and_parameter();
        assert_abs_diff_eq!(
            model.jacobian_wrt_state(&state, &parameter),
            DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.5, 0.0]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn misshapen_jacobian_grids_are_rejected() {
        let model = model();
        let axes = model.grid().axes().to_vec();
        let jacobians = Array::<f64, _>::zeros((3, 4, 3, 3));
        let jacobian_grid = LutGrid::new(jacobians.into_dyn(), axes).unwrap();
        assert!(matches!(
            model.with_jacobian_grid(Arc::new(jacobian_grid)),
            Err(RetrievalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn state_index_must_select_leading_axes() {
        let grid = Arc::new(model().grid().clone());
        for state_index in [0, 3, 4] {
            assert_eq!(
                LutForwardModel::new(grid.clone(), state_index, MultilinearInterpolator::default())
                    .err(),
                Some(RetrievalError::InvalidStateIndex {
                    state_index,
                    n_axes: 3
                })
            );
        }
        let leading =
            LutForwardModel::new(grid, 1, MultilinearInterpolator::default()).unwrap();
        assert_eq!(leading.n_parameter(), 2);
    }

    #[test]
    fn state_bounds_follow_state_axes() {
        let (lower, upper) = model().state_bounds().unwrap();
        assert_eq!(lower.as_slice(), &[0.0, -4.0]);
        assert_eq!(upper.as_slice(), &[3.0, 5.0]);
    }

    #[test]
    fn parameter_errors_are_propagated_into_measurement_space() {
        let model = model();
        let (state, parameter) = state_and_parameter();
        let parameter_covariance = DMatrix::from_element(1, 1, 4.0);
        let measurement_covariance = DMatrix::identity(2, 2);
        let effective = model
            .effective_measurement_covariance(
                &state,
                &parameter,
                &measurement_covariance,
                &parameter_covariance,
            )
            .unwrap();
        let expected = DMatrix::from_row_slice(2, 2, &[1.0 + 4.0, -6.0, -6.0, 1.0 + 9.0]);
        assert_abs_diff_eq!(effective, expected, epsilon = 1e-10);

        assert!(model
            .propagate_parameter_covariance(&state, &parameter, &DMatrix::identity(2, 2))
            .is_err());
    }
}
