//! Lookup tables sampled on rectilinear grids.

pub mod axis;

use crate::{error::RetrievalError, num::BFloat};
use axis::Axis;
use ndarray::{prelude::*, Axis as ArrayAxis};

/// Floating-point precision to use for grid coordinates.
#[allow(non_camel_case_types)]
pub type fgr = f64;

/// Highest number of grid dimensions supported, limiting the number of
/// hypercube corners to enumerate.
pub const MAX_GRID_DIMENSIONS: usize = 24;

/// Whether each grid node holds a single value or a vector of values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum OutputLayout {
    /// One value per node; the table has one dimension per axis.
    Scalar,
    /// The given number of values per node, stored along a trailing table
    /// dimension that has no axis.
    Vector(usize),
}

/// An immutable lookup table of forward model outputs over a rectilinear grid.
#[derive(Clone, Debug)]
pub struct LutGrid<F: BFloat> {
    values: ArrayD<F>,
    axes: Vec<Axis>,
    layout: OutputLayout,
    strides: Vec<usize>,
}

impl<F: BFloat> LutGrid<F> {
    /// Creates a new lookup table grid.
    ///
    /// The layout is inferred from the dimensionality: a table with as many
    /// dimensions as there are axes is scalar, while a table with one more
    /// dimension holds a vector of outputs along its last dimension.
    ///
    /// # Parameters
    ///
    /// - `values`: Table of sampled values.
    /// - `axes`: Coordinate axis for each gridded table dimension.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the new grid.
    /// - `Err`: The table shape is inconsistent with the axes.
    ///
    /// # Type parameters
    ///
    /// - `F`: Floating point type of the table values.
    pub fn new(values: ArrayD<F>, axes: Vec<Axis>) -> Result<Self, RetrievalError> {
        let lut_shape = values.shape().to_vec();
        let mismatch = |reason: String| RetrievalError::ShapeMismatch {
            lut_shape: lut_shape.clone(),
            reason,
        };

        let n_axes = axes.len();
        if n_axes == 0 {
            return Err(mismatch("at least one axis is required".to_string()));
        }
        if n_axes > MAX_GRID_DIMENSIONS {
            return Err(mismatch(format!(
                "{} axes exceed the supported maximum of {}",
                n_axes, MAX_GRID_DIMENSIONS
            )));
        }

        let layout = if values.ndim() == n_axes {
            OutputLayout::Scalar
        } else if values.ndim() == n_axes + 1 {
            let n_outputs = lut_shape[n_axes];
            if n_outputs == 0 {
                return Err(mismatch("output dimension is empty".to_string()));
            }
            OutputLayout::Vector(n_outputs)
        } else {
            return Err(mismatch(format!(
                "{} axes require a table with {} or {} dimensions",
                n_axes,
                n_axes,
                n_axes + 1
            )));
        };

        for (dim, axis) in axes.iter().enumerate() {
            if axis.len() != lut_shape[dim] {
                return Err(mismatch(format!(
                    "axis {} has {} coordinates but the table extent is {}",
                    dim,
                    axis.len(),
                    lut_shape[dim]
                )));
            }
        }

        let values = if values.is_standard_layout() {
            values
        } else {
            values.as_standard_layout().into_owned()
        };
        let strides = standard_strides(values.shape());

        Ok(Self {
            values,
            axes,
            layout,
            strides,
        })
    }

    /// Creates a vector-valued grid by stacking scalar tables defined over
    /// the same axes, so that output component `k` comes from table `k`.
    pub fn from_scalar_luts(luts: &[ArrayD<F>], axes: Vec<Axis>) -> Result<Self, RetrievalError> {
        let first = luts.first().ok_or_else(|| RetrievalError::ShapeMismatch {
            lut_shape: Vec::new(),
            reason: "no tables to stack".to_string(),
        })?;
        if let Some(other) = luts.iter().find(|lut| lut.shape() != first.shape()) {
            return Err(RetrievalError::ShapeMismatch {
                lut_shape: other.shape().to_vec(),
                reason: format!("cannot stack with table of shape {:?}", first.shape()),
            });
        }
        let views: Vec<_> = luts.iter().map(|lut| lut.view()).collect();
        let stacked = ndarray::stack(ArrayAxis(first.ndim()), &views).map_err(|err| {
            RetrievalError::ShapeMismatch {
                lut_shape: first.shape().to_vec(),
                reason: err.to_string(),
            }
        })?;
        Self::new(stacked, axes)
    }

    /// Returns the number of gridded dimensions.
    pub fn n_dims(&self) -> usize {
        self.axes.len()
    }

    /// Returns the number of values stored per grid node.
    pub fn n_outputs(&self) -> usize {
        match self.layout {
            OutputLayout::Scalar => 1,
            OutputLayout::Vector(n_outputs) => n_outputs,
        }
    }

    /// Returns the output layout.
    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Returns the coordinate axes.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Returns the extent of the grid along each gridded dimension.
    pub fn shape(&self) -> &[usize] {
        &self.values.shape()[..self.n_dims()]
    }

    /// Returns a reference to the table of values.
    pub fn values(&self) -> &ArrayD<F> {
        &self.values
    }

    /// Returns the flat offset stride of each gridded dimension.
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.n_dims()]
    }

    /// Returns the table values in flat standard order.
    pub fn flat_values(&self) -> &[F] {
        self.values
            .as_slice()
            .expect("Table values are kept in standard layout")
    }

    /// Converts physical coordinates into fractional indices, writing them to
    /// the given buffer.
    ///
    /// # Panics
    ///
    /// If the number of coordinates or buffer length differs from the
    /// number of gridded dimensions.
    pub fn fractional_indices_into(&self, coords: &[fgr], indices: &mut [fgr]) {
        assert_eq!(coords.len(), self.n_dims(), "Wrong number of coordinates");
        assert_eq!(indices.len(), self.n_dims(), "Wrong index buffer length");
        for ((index, &coord), axis) in indices.iter_mut().zip(coords).zip(&self.axes) {
            *index = axis.fractional_index(coord);
        }
    }

    /// Converts physical coordinates into fractional indices.
    pub fn fractional_indices(&self, coords: &[fgr]) -> Vec<fgr> {
        let mut indices = vec![0.0; self.n_dims()];
        self.fractional_indices_into(coords, &mut indices);
        indices
    }
}

fn standard_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}
