#![allow(dead_code)]

use lazy_static::lazy_static;
use nalgebra::DVector;
use ndarray::prelude::*;
use sextant::grid::{axis::Axis as GridAxis, fgr, LutGrid};
use std::sync::Arc;

lazy_static! {
    /// Table holding `20i + 5j + k` at index `(i, j, k)`.
    pub static ref ARANGE_GRID: Arc<LutGrid<f64>> = Arc::new(arange_grid());

    /// Three measurements over a non-uniform and a decreasing state axis.
    pub static ref TWO_TO_THREE_GRID: Arc<LutGrid<f64>> = Arc::new(two_to_three_grid());

    /// The two-to-three table scaled by `1 + p/2` along a trailing parameter axis `p`.
    pub static ref SCALED_TWO_TO_THREE_GRID: Arc<LutGrid<f64>> =
        Arc::new(scaled_two_to_three_grid());

    /// Three measurements linear in a two-element state and one parameter.
    pub static ref LINEAR_GRID: Arc<LutGrid<f64>> = Arc::new(linear_grid());
}

pub const ARANGE_AXES: [&[fgr]; 3] = [
    &[3.0, 4.0, 6.0],
    &[1.0, 4.0, 8.0, 10.0],
    &[1.0, 2.0, 4.0, 8.0, 16.0],
];

pub const TWO_TO_THREE_X: [fgr; 6] = [3.0, 4.0, 6.0, 7.0, 9.0, 15.0];
pub const TWO_TO_THREE_Y: [fgr; 4] = [15.0, 10.0, 5.0, 1.0];
pub const SCALE_PARAMETER: [fgr; 2] = [0.0, 1.0];

pub const LINEAR_AXES: [&[fgr]; 3] = [&[0.0, 1.0, 2.5, 4.0], &[-2.0, 0.0, 3.0], &[0.0, 1.0]];

fn arange_grid() -> LutGrid<f64> {
    let values = Array::range(0.0, 60.0, 1.0).into_shape_with_order((3, 4, 5)).unwrap();
    let axes = GridAxis::from_tables(ARANGE_AXES.iter().map(|table| table.to_vec())).unwrap();
    LutGrid::new(values.into_dyn(), axes).unwrap()
}

/// The three measurement functions sampled by the two-to-three table.
pub fn two_to_three_functions(x: fgr, y: fgr) -> [fgr; 3] {
    [10.0 * x + 10.0 * y, x * y, 10.0 * x - 20.0 * y]
}

fn two_to_three_grid() -> LutGrid<f64> {
    let luts: Vec<ArrayD<f64>> = (0..3)
        .map(|component| {
            Array::from_shape_fn((TWO_TO_THREE_X.len(), TWO_TO_THREE_Y.len()), |(i, j)| {
                two_to_three_functions(TWO_TO_THREE_X[i], TWO_TO_THREE_Y[j])[component]
            })
            .into_dyn()
        })
        .collect();
    let axes = GridAxis::from_tables(vec![TWO_TO_THREE_X.to_vec(), TWO_TO_THREE_Y.to_vec()])
        .unwrap();
    LutGrid::from_scalar_luts(&luts, axes).unwrap()
}

fn scaled_two_to_three_grid() -> LutGrid<f64> {
    let shape = (TWO_TO_THREE_X.len(), TWO_TO_THREE_Y.len(), SCALE_PARAMETER.len());
    let luts: Vec<ArrayD<f64>> = (0..3)
        .map(|component| {
            Array::from_shape_fn(shape, |(i, j, k)| {
                (1.0 + 0.5 * SCALE_PARAMETER[k])
                    * two_to_three_functions(TWO_TO_THREE_X[i], TWO_TO_THREE_Y[j])[component]
            })
            .into_dyn()
        })
        .collect();
    let axes = GridAxis::from_tables(vec![
        TWO_TO_THREE_X.to_vec(),
        TWO_TO_THREE_Y.to_vec(),
        SCALE_PARAMETER.to_vec(),
    ])
    .unwrap();
    LutGrid::from_scalar_luts(&luts, axes).unwrap()
}

/// The measurement functions sampled by the linear table.
pub fn linear_functions(x: fgr, y: fgr, p: fgr) -> [fgr; 3] {
    [x + 2.0 * y + p, 3.0 * x - y, 0.5 * x + y - 2.0 * p]
}

fn linear_grid() -> LutGrid<f64> {
    let shape = (LINEAR_AXES[0].len(), LINEAR_AXES[1].len(), LINEAR_AXES[2].len());
    let luts: Vec<ArrayD<f64>> = (0..3)
        .map(|component| {
            Array::from_shape_fn(shape, |(i, j, k)| {
                linear_functions(LINEAR_AXES[0][i], LINEAR_AXES[1][j], LINEAR_AXES[2][k])
                    [component]
            })
            .into_dyn()
        })
        .collect();
    let axes = GridAxis::from_tables(LINEAR_AXES.iter().map(|table| table.to_vec())).unwrap();
    LutGrid::from_scalar_luts(&luts, axes).unwrap()
}

pub fn assert_vectors_close(actual: &DVector<f64>, expected: &[f64], tolerance: f64) {
    assert_eq!(actual.len(), expected.len(), "Vector lengths differ");
    for (index, (&actual_value, &expected_value)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (actual_value - expected_value).abs() < tolerance,
            "Element {} is {} but expected {} within {}",
            index,
            actual_value,
            expected_value,
            tolerance
        );
    }
}

pub fn assert_non_increasing(values: &[f64]) {
    for (index, pair) in values.windows(2).enumerate() {
        assert!(
            pair[1] <= pair[0],
            "Value increased from {} to {} after step {}",
            pair[0],
            pair[1],
            index
        );
    }
}
