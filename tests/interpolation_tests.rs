mod common;

use approx::assert_abs_diff_eq;
use common::{ARANGE_AXES, ARANGE_GRID, TWO_TO_THREE_GRID};
use nalgebra::DVector;
use sextant::{
    batch::{BatchConfig, BatchExecutor},
    forward::{lut::LutForwardModel, ForwardOperator},
    grid::fgr,
    interpolation::{
        fip, multilinear::MultilinearInterpolator, Hypercube, Interpolator,
    },
};
use ndarray::prelude::*;

/// Blends the eight cell corners of the arange table by hand.
fn manual_trilinear(indices: [fip; 3]) -> fip {
    let grid = &*ARANGE_GRID;
    let lower: Vec<usize> = indices.iter().map(|&index| index.floor() as usize).collect();
    let mut value = 0.0;
    for corner in 0..8 {
        let mut weight = 1.0;
        let mut node = [0; 3];
        for dim in 0..3 {
            let fraction = indices[dim] - lower[dim] as fip;
            if (corner >> dim) & 1 == 1 {
                node[dim] = lower[dim] + 1;
                weight *= fraction;
            } else {
                node[dim] = lower[dim];
                weight *= 1.0 - fraction;
            }
        }
        value += weight * grid.values()[&node[..]];
    }
    value
}

#[test]
fn arange_table_is_interpolated_trilinearly() {
    let interpolator = MultilinearInterpolator::default();
    let indices = [1.5, 2.3, 3.7];
    let mut value = [0.0];
    interpolator.interp_values(&**ARANGE_GRID, &indices, &mut value);
    assert_abs_diff_eq!(value[0], manual_trilinear(indices), epsilon = 1e-12);
    assert_abs_diff_eq!(value[0], 1.5 * 20.0 + 2.3 * 5.0 + 3.7, epsilon = 1e-12);
}

#[test]
fn arange_forward_model_splits_state_and_parameter() {
    let model =
        LutForwardModel::new(ARANGE_GRID.clone(), 1, MultilinearInterpolator::default()).unwrap();
    assert_eq!(model.n_state(), 1);
    assert_eq!(model.n_parameter(), 2);

    let state = DVector::from_vec(vec![5.0]);
    let parameter = DVector::from_vec(vec![2.3, 3.7]);
    let indices = [1.5, 1.3 / 3.0, 1.85];
    let measurement = model.forward(&state, &parameter);
    assert_abs_diff_eq!(measurement[0], manual_trilinear(indices), epsilon = 1e-12);

    // One index step along the first axis spans 2 units around 5
    let jacobian = model.jacobian_wrt_state(&state, &parameter);
    assert_abs_diff_eq!(jacobian[(0, 0)], 20.0 / 2.0, epsilon = 1e-12);
    let parameter_jacobian = model.jacobian_wrt_parameter(&state, &parameter);
    assert_abs_diff_eq!(parameter_jacobian[(0, 0)], 5.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(parameter_jacobian[(0, 1)], 1.0 / 2.0, epsilon = 1e-12);
}

#[test]
fn corner_weights_sum_to_one_everywhere() {
    let shape = ARANGE_GRID.shape().to_vec();
    let strides = ARANGE_GRID.strides().to_vec();
    for i in 0..=8 {
        for j in 0..=12 {
            for k in 0..=16 {
                let indices = [i as fip * 0.25, j as fip * 0.25, k as fip * 0.25];
                let cube = Hypercube::locate(&indices, &shape).unwrap();
                let total: fip = cube.corners(&strides).map(|(_, weight)| weight).sum();
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn queries_beyond_axes_match_boundary_values() {
    let interpolator = MultilinearInterpolator::default();
    let lower: Vec<fgr> = ARANGE_AXES.iter().map(|axis| axis[0]).collect();
    let upper: Vec<fgr> = ARANGE_AXES.iter().map(|axis| axis[axis.len() - 1]).collect();
    let below: Vec<fgr> = lower.iter().map(|coord| coord - 100.0).collect();
    let above: Vec<fgr> = upper.iter().map(|coord| coord + 100.0).collect();

    assert_eq!(
        interpolator.interp_at_coords(&**ARANGE_GRID, &below),
        interpolator.interp_at_coords(&**ARANGE_GRID, &lower)
    );
    assert_eq!(
        interpolator.interp_at_coords(&**ARANGE_GRID, &above),
        interpolator.interp_at_coords(&**ARANGE_GRID, &upper)
    );
}

#[test]
fn vector_table_matches_sampled_functions_at_nodes() {
    let interpolator = MultilinearInterpolator::default();
    for &x in &common::TWO_TO_THREE_X {
        for &y in &common::TWO_TO_THREE_Y {
            let values = interpolator.interp_at_coords(&**TWO_TO_THREE_GRID, &[x, y]);
            assert_eq!(values, common::two_to_three_functions(x, y).to_vec());
        }
    }
}

#[test]
fn batch_interpolation_of_vector_table_preserves_order() {
    let coords = Array2::from_shape_fn((50, 2), |(sample, dim)| {
        if dim == 0 {
            3.0 + 0.24 * sample as fgr
        } else {
            15.0 - 0.28 * sample as fgr
        }
    });
    let interpolator = MultilinearInterpolator::default();
    let executor = BatchExecutor::new(BatchConfig {
        n_workers: 4,
        chunk_size: 7,
    })
    .unwrap();
    let values = executor
        .interpolate(&**TWO_TO_THREE_GRID, &interpolator, coords.view())
        .unwrap();
    assert_eq!(values.dim(), (50, 3));

    for (sample, point) in coords.rows().into_iter().enumerate() {
        let expected = interpolator.interp_at_coords(&**TWO_TO_THREE_GRID, &point.to_vec());
        assert_eq!(values.row(sample).to_vec(), expected);
    }
}
