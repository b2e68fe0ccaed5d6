//! Piecewise multilinear interpolation over the enclosing grid hypercube.

use super::{fip, Interpolator};
use crate::{grid::LutGrid, num::BFloat};

/// How missing (NaN) table values are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MissingValues {
    /// Missing values propagate into any interpolation touching them.
    Propagate,
    /// Missing corners are left out and the remaining weights renormalized.
    Ignore,
}

/// Configuration parameters for multilinear interpolators.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MultilinearInterpolatorConfig {
    /// How missing table values are treated.
    pub missing_values: MissingValues,
}

impl Default for MultilinearInterpolatorConfig {
    fn default() -> Self {
        Self {
            missing_values: MissingValues::Propagate,
        }
    }
}

/// An interpolator blending the `2^n` corners of the grid cell enclosing the
/// interpolation point.
#[derive(Clone, Debug, Default)]
pub struct MultilinearInterpolator {
    config: MultilinearInterpolatorConfig,
}

impl MultilinearInterpolator {
    /// Creates a new multilinear interpolator.
    pub fn new(config: MultilinearInterpolatorConfig) -> Self {
        Self { config }
    }

    /// Creates a new multilinear interpolator that ignores missing table values.
    pub fn ignoring_missing() -> Self {
        Self::new(MultilinearInterpolatorConfig {
            missing_values: MissingValues::Ignore,
        })
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &MultilinearInterpolatorConfig {
        &self.config
    }
}

impl Interpolator for MultilinearInterpolator {
    fn interp_values<F: BFloat>(
        &self,
        grid: &LutGrid<F>,
        fractional_indices: &[fip],
        values: &mut [fip],
    ) {
        match self.config.missing_values {
            MissingValues::Propagate => super::evaluate(grid, fractional_indices, values),
            MissingValues::Ignore => {
                super::evaluate_ignoring_missing(grid, fractional_indices, values)
            }
        }
    }

    fn interp_values_and_jacobian<F: BFloat>(
        &self,
        grid: &LutGrid<F>,
        fractional_indices: &[fip],
        values: &mut [fip],
        jacobian: &mut [fip],
    ) {
        let cube = match self.config.missing_values {
            MissingValues::Propagate => {
                super::jacobian(grid, fractional_indices, values, jacobian)
            }
            MissingValues::Ignore => {
                super::jacobian_ignoring_missing(grid, fractional_indices, values, jacobian)
            }
        };
        if let Some(cube) = cube {
            super::rescale_jacobian(&cube, grid.axes(), jacobian);
        }
    }
}
