//! Multilinear interpolation of lookup tables in any number of dimensions.

pub mod multilinear;

use crate::{
    grid::{axis::Axis, fgr, LutGrid},
    num::BFloat,
};

/// Floating-point precision to use for interpolation.
#[allow(non_camel_case_types)]
pub type fip = f64;

/// Defines the properties of a lookup table interpolator.
pub trait Interpolator: Clone + Sync + Send {
    /// Computes the interpolated output values at the given fractional grid indices.
    ///
    /// # Parameters
    ///
    /// - `grid`: Lookup table to interpolate.
    /// - `fractional_indices`: Position in index space, one entry per grid dimension.
    /// - `values`: Buffer receiving one value per table output.
    ///
    /// # Type parameters
    ///
    /// - `F`: Floating point type of the table values.
    fn interp_values<F: BFloat>(
        &self,
        grid: &LutGrid<F>,
        fractional_indices: &[fip],
        values: &mut [fip],
    );

    /// Computes the interpolated output values at the given fractional grid indices,
    /// together with their derivatives with respect to the physical coordinates.
    ///
    /// # Parameters
    ///
    /// - `grid`: Lookup table to interpolate.
    /// - `fractional_indices`: Position in index space, one entry per grid dimension.
    /// - `values`: Buffer receiving one value per table output.
    /// - `jacobian`: Buffer receiving the row-major `n_outputs x n_dims` Jacobian.
    ///
    /// # Type parameters
    ///
    /// - `F`: Floating point type of the table values.
    fn interp_values_and_jacobian<F: BFloat>(
        &self,
        grid: &LutGrid<F>,
        fractional_indices: &[fip],
        values: &mut [fip],
        jacobian: &mut [fip],
    );

    /// Computes the interpolated output values at the given physical coordinates.
    fn interp_at_coords<F: BFloat>(&self, grid: &LutGrid<F>, coords: &[fgr]) -> Vec<fip> {
        let fractional_indices = grid.fractional_indices(coords);
        let mut values = vec![0.0; grid.n_outputs()];
        self.interp_values(grid, &fractional_indices, &mut values);
        values
    }
}

/// Grid indices and weights bracketing a position along one dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bracket {
    pub lower: usize,
    pub upper: usize,
    pub lower_weight: fip,
    pub upper_weight: fip,
}

impl Bracket {
    fn index_and_weight(&self, use_upper: bool) -> (usize, fip) {
        if use_upper {
            (self.upper, self.upper_weight)
        } else {
            (self.lower, self.lower_weight)
        }
    }

    fn is_degenerate(&self) -> bool {
        self.lower == self.upper
    }
}

/// Finds the bracketing grid indices of a fractional index along a dimension
/// with the given number of nodes.
///
/// The fractional index is clamped into `[0, extent - 1]`, so positions
/// outside the grid take the value of the nearest boundary node.
///
/// # Returns
///
/// The lower and upper `(index, weight)` pairs. The weights sum to one.
///
/// # Panics
///
/// If `extent` is zero.
pub fn locate(fractional_index: fip, extent: usize) -> ((usize, fip), (usize, fip)) {
    assert!(extent > 0, "Cannot locate index in empty dimension");
    let last = (extent - 1) as fip;
    let clamped = fractional_index.max(0.0).min(last);
    let lower = (clamped.floor() as usize).min(extent - 1);
    let upper = (lower + 1).min(extent - 1);
    let fraction = clamped - lower as fip;
    ((lower, 1.0 - fraction), (upper, fraction))
}

/// The grid cell enclosing a position, with the brackets of every dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypercube {
    brackets: Vec<Bracket>,
}

impl Hypercube {
    /// Locates the hypercube enclosing the given fractional indices in a grid
    /// of the given shape.
    ///
    /// Returns `None` if any fractional index is NaN.
    pub fn locate(fractional_indices: &[fip], shape: &[usize]) -> Option<Self> {
        assert_eq!(
            fractional_indices.len(),
            shape.len(),
            "Number of fractional indices does not match grid dimensionality"
        );
        if fractional_indices.iter().any(|index| index.is_nan()) {
            return None;
        }
        let brackets = fractional_indices
            .iter()
            .zip(shape)
            .map(|(&index, &extent)| {
                let ((lower, lower_weight), (upper, upper_weight)) = locate(index, extent);
                Bracket {
                    lower,
                    upper,
                    lower_weight,
                    upper_weight,
                }
            })
            .collect();
        Some(Self { brackets })
    }

    /// Locates the enclosing hypercube as for `locate`, but replaces every
    /// degenerate bracket at the last node of a dimension with the last
    /// proper cell, weighted entirely towards its upper node.
    ///
    /// The interpolated value is unchanged, while derivatives across the
    /// boundary node become one-sided differences instead of zero.
    pub fn locate_for_derivatives(fractional_indices: &[fip], shape: &[usize]) -> Option<Self> {
        let mut cube = Self::locate(fractional_indices, shape)?;
        for bracket in cube.brackets.iter_mut() {
            if bracket.is_degenerate() && bracket.upper > 0 {
                *bracket = Bracket {
                    lower: bracket.upper - 1,
                    upper: bracket.upper,
                    lower_weight: 0.0,
                    upper_weight: 1.0,
                };
            }
        }
        Some(cube)
    }

    /// Returns the bracket of each dimension.
    pub fn brackets(&self) -> &[Bracket] {
        &self.brackets
    }

    /// Returns the number of dimensions.
    pub fn n_dims(&self) -> usize {
        self.brackets.len()
    }

    /// Returns the number of corners, `2^n_dims`.
    pub fn n_corners(&self) -> usize {
        1 << self.n_dims()
    }

    /// Returns the flat table offset and interpolation weight of the given
    /// corner. Bit `d` of `corner` selects the upper node along dimension `d`.
    pub fn corner(&self, corner: usize, strides: &[usize]) -> (usize, fip) {
        self.brackets.iter().zip(strides).enumerate().fold(
            (0, 1.0),
            |(offset, weight), (dim, (bracket, &stride))| {
                let (index, dim_weight) = bracket.index_and_weight(corner & (1 << dim) != 0);
                (offset + index * stride, weight * dim_weight)
            },
        )
    }

    /// Iterates over the flat table offsets and weights of all corners.
    pub fn corners<'a>(&'a self, strides: &'a [usize]) -> impl Iterator<Item = (usize, fip)> + 'a {
        (0..self.n_corners()).map(move |corner| self.corner(corner, strides))
    }

    /// Computes, for every dimension, the product of the weights of all the
    /// other dimensions at the given corner.
    fn partial_weights(&self, corner: usize, partial_weights: &mut [fip]) {
        let n_dims = self.n_dims();
        let weight_of = |dim: usize| {
            self.brackets[dim]
                .index_and_weight(corner & (1 << dim) != 0)
                .1
        };
        let mut prefix = 1.0;
        for (dim, partial_weight) in partial_weights.iter_mut().enumerate().take(n_dims) {
            *partial_weight = prefix;
            prefix *= weight_of(dim);
        }
        let mut suffix = 1.0;
        for dim in (0..n_dims).rev() {
            partial_weights[dim] *= suffix;
            suffix *= weight_of(dim);
        }
    }
}

fn fill_nan(buffer: &mut [fip]) {
    buffer.iter_mut().for_each(|value| *value = fip::NAN);
}

/// Computes the weighted blend of the hypercube corner values enclosing the
/// given fractional indices, writing one value per table output.
///
/// Missing (NaN) table values propagate into the result.
pub fn evaluate<F: BFloat>(grid: &LutGrid<F>, fractional_indices: &[fip], values: &mut [fip]) {
    let n_outputs = grid.n_outputs();
    assert_eq!(values.len(), n_outputs, "Wrong value buffer length");

    let cube = match Hypercube::locate(fractional_indices, grid.shape()) {
        Some(cube) => cube,
        None => return fill_nan(values),
    };
    let table = grid.flat_values();

    values.iter_mut().for_each(|value| *value = 0.0);
    for (offset, weight) in cube.corners(grid.strides()) {
        for (value, &table_value) in values.iter_mut().zip(&table[offset..offset + n_outputs]) {
            *value += weight * table_value.into();
        }
    }
}

/// Computes the weighted blend of the hypercube corner values enclosing the
/// given fractional indices, leaving out missing (NaN) corner values.
///
/// The remaining weights are renormalized to sum to one. If every corner with
/// non-zero weight is missing, the result is NaN.
pub fn evaluate_ignoring_missing<F: BFloat>(
    grid: &LutGrid<F>,
    fractional_indices: &[fip],
    values: &mut [fip],
) {
    let n_outputs = grid.n_outputs();
    assert_eq!(values.len(), n_outputs, "Wrong value buffer length");

    let cube = match Hypercube::locate(fractional_indices, grid.shape()) {
        Some(cube) => cube,
        None => return fill_nan(values),
    };
    let table = grid.flat_values();

    let mut normalizers = vec![0.0; n_outputs];
    values.iter_mut().for_each(|value| *value = 0.0);
    for (offset, weight) in cube.corners(grid.strides()) {
        for ((value, normalizer), &table_value) in values
            .iter_mut()
            .zip(normalizers.iter_mut())
            .zip(&table[offset..offset + n_outputs])
        {
            let table_value: fip = table_value.into();
            if !table_value.is_nan() {
                *value += weight * table_value;
                *normalizer += weight;
            }
        }
    }
    for (value, normalizer) in values.iter_mut().zip(normalizers) {
        *value = if normalizer > 0.0 {
            *value / normalizer
        } else {
            fip::NAN
        };
    }
}

/// Computes the interpolated values and their derivatives with respect to the
/// fractional index of each dimension.
///
/// The derivative along a dimension is the difference between the blend over
/// the upper face and the blend over the lower face of the enclosing
/// hypercube, each corner weighted by the weights of the remaining dimensions.
///
/// # Parameters
///
/// - `grid`: Lookup table to differentiate.
/// - `fractional_indices`: Position in index space.
/// - `values`: Buffer receiving one value per table output.
/// - `jacobian`: Buffer receiving the row-major `n_outputs x n_dims` index-space Jacobian.
///
/// # Returns
///
/// The hypercube used for the derivatives, needed to rescale them to physical
/// units with `rescale_jacobian`, or `None` if the position was NaN (in
/// which case both buffers are filled with NaN).
pub fn jacobian<F: BFloat>(
    grid: &LutGrid<F>,
    fractional_indices: &[fip],
    values: &mut [fip],
    jacobian: &mut [fip],
) -> Option<Hypercube> {
    let n_outputs = grid.n_outputs();
    let n_dims = grid.n_dims();
    assert_eq!(values.len(), n_outputs, "Wrong value buffer length");
    assert_eq!(jacobian.len(), n_outputs * n_dims, "Wrong Jacobian buffer length");

    let cube = match Hypercube::locate_for_derivatives(fractional_indices, grid.shape()) {
        Some(cube) => cube,
        None => {
            fill_nan(values);
            fill_nan(jacobian);
            return None;
        }
    };
    let table = grid.flat_values();
    let strides = grid.strides();

    values.iter_mut().for_each(|value| *value = 0.0);
    jacobian.iter_mut().for_each(|value| *value = 0.0);
    let mut partial_weights = vec![0.0; n_dims];

    for corner in 0..cube.n_corners() {
        let (offset, weight) = cube.corner(corner, strides);
        cube.partial_weights(corner, &mut partial_weights);

        for (output, &table_value) in table[offset..offset + n_outputs].iter().enumerate() {
            let table_value: fip = table_value.into();
            values[output] += weight * table_value;

            let row = &mut jacobian[output * n_dims..(output + 1) * n_dims];
            for (dim, (derivative, &partial_weight)) in
                row.iter_mut().zip(&partial_weights).enumerate()
            {
                if corner & (1 << dim) != 0 {
                    *derivative += partial_weight * table_value;
                } else {
                    *derivative -= partial_weight * table_value;
                }
            }
        }
    }
    Some(cube)
}

/// Computes the interpolated values and index-space derivatives as for
/// `jacobian`, leaving out missing (NaN) corner values.
///
/// Each face blend is renormalized over its non-missing corners. A derivative
/// is zero if either face has no usable corner.
pub fn jacobian_ignoring_missing<F: BFloat>(
    grid: &LutGrid<F>,
    fractional_indices: &[fip],
    values: &mut [fip],
    jacobian: &mut [fip],
) -> Option<Hypercube> {
    let n_outputs = grid.n_outputs();
    let n_dims = grid.n_dims();
    assert_eq!(jacobian.len(), n_outputs * n_dims, "Wrong Jacobian buffer length");

    evaluate_ignoring_missing(grid, fractional_indices, values);

    let cube = match Hypercube::locate_for_derivatives(fractional_indices, grid.shape()) {
        Some(cube) => cube,
        None => {
            fill_nan(jacobian);
            return None;
        }
    };
    let table = grid.flat_values();
    let strides = grid.strides();

    // Weighted sums and normalizers of the lower and upper face of every
    // (output, dimension) pair
    let n_entries = n_outputs * n_dims;
    let mut lower_sums = vec![0.0; n_entries];
    let mut lower_norms = vec![0.0; n_entries];
    let mut upper_sums = vec![0.0; n_entries];
    let mut upper_norms = vec![0.0; n_entries];
    let mut partial_weights = vec![0.0; n_dims];

    for corner in 0..cube.n_corners() {
        let (offset, _) = cube.corner(corner, strides);
        cube.partial_weights(corner, &mut partial_weights);

        for (output, &table_value) in table[offset..offset + n_outputs].iter().enumerate() {
            let table_value: fip = table_value.into();
            if table_value.is_nan() {
                continue;
            }
            for (dim, &partial_weight) in partial_weights.iter().enumerate() {
                let entry = output * n_dims + dim;
                if corner & (1 << dim) != 0 {
                    upper_sums[entry] += partial_weight * table_value;
                    upper_norms[entry] += partial_weight;
                } else {
                    lower_sums[entry] += partial_weight * table_value;
                    lower_norms[entry] += partial_weight;
                }
            }
        }
    }

    for (entry, derivative) in jacobian.iter_mut().enumerate() {
        *derivative = if upper_norms[entry] > 0.0 && lower_norms[entry] > 0.0 {
            upper_sums[entry] / upper_norms[entry] - lower_sums[entry] / lower_norms[entry]
        } else {
            0.0
        };
    }
    Some(cube)
}

/// Returns the signed physical coordinate step corresponding to a unit index
/// step across the given bracket.
///
/// For a degenerate bracket (lower index equal to upper index) the step of
/// the adjacent cell is used at the boundaries, and the average of the two
/// neighbouring steps in the interior.
pub fn physical_step(axis: &Axis, bracket: &Bracket) -> fgr {
    if !bracket.is_degenerate() {
        let n_steps = (bracket.upper - bracket.lower) as fgr;
        return axis.step(bracket.lower, bracket.upper) / n_steps;
    }
    let index = bracket.lower;
    let last = axis.len() - 1;
    if index == 0 {
        axis.step(0, 1)
    } else if index == last {
        axis.step(last - 1, last)
    } else {
        0.5 * (axis.step(index - 1, index) + axis.step(index, index + 1))
    }
}

/// Converts an index-space Jacobian into derivatives with respect to the
/// physical axis coordinates, in place.
///
/// # Parameters
///
/// - `cube`: Hypercube returned by the Jacobian computation.
/// - `axes`: Coordinate axes of the grid.
/// - `jacobian`: Row-major `n_outputs x n_dims` Jacobian to rescale.
pub fn rescale_jacobian(cube: &Hypercube, axes: &[Axis], jacobian: &mut [fip]) {
    let n_dims = cube.n_dims();
    assert_eq!(axes.len(), n_dims, "Wrong number of axes");
    assert_eq!(jacobian.len() % n_dims, 0, "Wrong Jacobian buffer length");

    let steps: Vec<fgr> = axes
        .iter()
        .zip(cube.brackets())
        .map(|(axis, bracket)| physical_step(axis, bracket))
        .collect();

    for row in jacobian.chunks_exact_mut(n_dims) {
        for (derivative, &step) in row.iter_mut().zip(&steps) {
            *derivative /= step;
        }
    }
}
