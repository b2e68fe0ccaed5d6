mod common;

use common::{
    assert_non_increasing, assert_vectors_close, linear_functions, LINEAR_GRID,
    SCALED_TWO_TO_THREE_GRID,
};
use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;
use sextant::{
    batch::{BatchConfig, BatchExecutor, BatchInput},
    forward::{lut::LutForwardModel, FunctionForwardModel, ForwardOperator},
    interpolation::multilinear::MultilinearInterpolator,
    inversion::{increment::IncrementForm, OptimalEstimationConfig, OptimalEstimator},
    io::Verbosity,
};

fn two_to_three_model() -> LutForwardModel<f64, MultilinearInterpolator> {
    LutForwardModel::new(
        SCALED_TWO_TO_THREE_GRID.clone(),
        2,
        MultilinearInterpolator::default(),
    )
    .unwrap()
}

struct TwoToThreeProblem {
    parameter: DVector<f64>,
    measurement: DVector<f64>,
    measurement_covariance: DMatrix<f64>,
    prior: DVector<f64>,
    prior_covariance: DMatrix<f64>,
}

fn two_to_three_problem(truth: &[f64]) -> TwoToThreeProblem {
    let model = two_to_three_model();
    let parameter = DVector::from_vec(vec![0.0]);
    TwoToThreeProblem {
        measurement: model.forward(&DVector::from_column_slice(truth), &parameter),
        parameter,
        measurement_covariance: DMatrix::identity(3, 3),
        prior: DVector::from_vec(vec![4.0, 10.0]),
        prior_covariance: DMatrix::from_diagonal_element(2, 2, 10.0),
    }
}

#[test]
fn two_to_three_lookup_table_retrieval_recovers_truth() {
    let truth = [3.5, 11.0];
    let problem = two_to_three_problem(&truth);
    let estimator =
        OptimalEstimator::new(two_to_three_model(), OptimalEstimationConfig::default()).unwrap();
    let retrieval = estimator
        .invert(
            &problem.measurement,
            &problem.measurement_covariance,
            &problem.prior,
            &problem.prior_covariance,
            Some(&problem.parameter),
            None,
        )
        .unwrap();

    assert!(retrieval.converged);
    assert!(retrieval.iterations <= 10);
    assert_vectors_close(&retrieval.state, &truth, 5e-3);
    assert!(retrieval.degrees_of_freedom > 0.0 && retrieval.degrees_of_freedom <= 2.0);
    assert!(retrieval.information_content.is_finite());
    assert_eq!(retrieval.degenerate_inversions, 0);
}

#[test]
fn two_to_three_retrieval_agrees_across_forms() {
    let truth = [3.5, 11.0];
    let problem = two_to_three_problem(&truth);
    for form in [
        IncrementForm::N,
        IncrementForm::NA,
        IncrementForm::NB,
        IncrementForm::NC,
        IncrementForm::M,
        IncrementForm::MC,
    ] {
        let estimator = OptimalEstimator::new(
            two_to_three_model(),
            OptimalEstimationConfig::default().with_form(form),
        )
        .unwrap();
        let retrieval = estimator
            .invert(
                &problem.measurement,
                &problem.measurement_covariance,
                &problem.prior,
                &problem.prior_covariance,
                Some(&problem.parameter),
                None,
            )
            .unwrap();
        assert!(retrieval.converged, "Form {} did not converge", form);
        assert_vectors_close(&retrieval.state, &truth, 5e-3);
    }
}

#[test]
fn retrieved_state_stays_inside_lookup_table() {
    let problem = two_to_three_problem(&[14.0, 1.5]);
    let prior = DVector::from_vec(vec![20.0, -3.0]);
    let estimator =
        OptimalEstimator::new(two_to_three_model(), OptimalEstimationConfig::default()).unwrap();
    let retrieval = estimator
        .invert(
            &problem.measurement,
            &problem.measurement_covariance,
            &prior,
            &problem.prior_covariance,
            Some(&problem.parameter),
            None,
        )
        .unwrap();
    assert!((3.0..=15.0).contains(&retrieval.state[0]));
    assert!((1.0..=15.0).contains(&retrieval.state[1]));
}

fn poorly_scaled(state: &DVector<f64>, _parameter: &DVector<f64>) -> DVector<f64> {
    DVector::from_vec(vec![
        1e3 * state[0] * state[0] + state[1],
        state[1].exp(),
        1e-2 * state[0] * state[1],
    ])
}

#[test]
fn levenberg_marquardt_never_increases_cost() {
    let truth = DVector::from_vec(vec![0.3, 1.2]);
    let measurement = poorly_scaled(&truth, &DVector::zeros(0));
    let model = FunctionForwardModel::new(2, 0, 3, poorly_scaled);
    let config = OptimalEstimationConfig::default().with_form(IncrementForm::NLM);
    let max_iterations = config.max_iterations;
    let estimator = OptimalEstimator::new(model, config)
        .unwrap()
        .with_verbosity(Verbosity::Messages);

    let retrieval = estimator
        .invert(
            &measurement,
            &DMatrix::from_diagonal(&DVector::from_vec(vec![1e-2, 1.0, 1e-4])),
            &DVector::from_vec(vec![1.0, 0.0]),
            &DMatrix::from_diagonal_element(2, 2, 100.0),
            None,
            None,
        )
        .unwrap();

    assert_non_increasing(&retrieval.cost_history);
    assert!(retrieval.iterations <= max_iterations);
    assert!(retrieval.state.iter().all(|value| value.is_finite()));
    assert!(retrieval.cost < retrieval.cost_history[0]);
    assert!(retrieval.converged);
    assert_vectors_close(&retrieval.state, truth.as_slice(), 1e-2);
}

#[test]
fn exhausted_iterations_are_reported_without_convergence() {
    let truth = DVector::from_vec(vec![0.3, 1.2]);
    let measurement = poorly_scaled(&truth, &DVector::zeros(0));
    let config = OptimalEstimationConfig::default().with_max_iterations(2);
    let estimator =
        OptimalEstimator::new(FunctionForwardModel::new(2, 0, 3, poorly_scaled), config).unwrap();

    let retrieval = estimator
        .invert(
            &measurement,
            &DMatrix::from_diagonal(&DVector::from_vec(vec![1e-2, 1.0, 1e-4])),
            &DVector::from_vec(vec![1.0, 0.0]),
            &DMatrix::from_diagonal_element(2, 2, 100.0),
            None,
            None,
        )
        .unwrap();

    assert!(!retrieval.converged);
    assert_eq!(retrieval.iterations, 2);
    assert!(retrieval.final_increment_metric >= 0.01 * 2.0);
}

#[test]
fn averaging_kernel_trace_is_bounded_for_many_priors() {
    let problem = two_to_three_problem(&[5.0, 7.0]);
    let estimator =
        OptimalEstimator::new(two_to_three_model(), OptimalEstimationConfig::default()).unwrap();
    for (x, y) in [(3.5, 14.0), (8.0, 3.0), (12.0, 9.0), (6.5, 6.5)] {
        for variance in [0.01, 1.0, 100.0] {
            let retrieval = estimator
                .invert(
                    &problem.measurement,
                    &problem.measurement_covariance,
                    &DVector::from_vec(vec![x, y]),
                    &DMatrix::from_diagonal_element(2, 2, variance),
                    Some(&problem.parameter),
                    None,
                )
                .unwrap();
            assert!(retrieval.degrees_of_freedom >= 0.0);
            assert!(retrieval.degrees_of_freedom <= estimator.n_state() as f64 + 1e-12);
        }
    }
}

#[test]
fn batch_retrieval_over_lookup_table_recovers_every_truth() {
    let model = two_to_three_model();
    let truths = array![[3.5, 11.0], [5.0, 7.0], [8.0, 4.0], [12.5, 2.0], [4.2, 13.0]];
    let n_samples = truths.nrows();
    let mut measurements = Array2::zeros((n_samples, 3));
    for (truth, mut measurement) in truths.rows().into_iter().zip(measurements.rows_mut()) {
        let simulated = model.forward(
            &DVector::from_iterator(2, truth.iter().copied()),
            &DVector::from_vec(vec![0.0]),
        );
        measurement.assign(&ArrayView1::from(simulated.as_slice()));
    }
    measurements[[4, 2]] = f64::NAN;

    let measurement_covariance = Array2::<f64>::eye(3);
    let prior_covariance = Array2::<f64>::eye(2) * 100.0;
    let priors = Array2::from_shape_fn((n_samples, 2), |(_, dim)| [7.0, 8.0][dim]);
    let parameters = Array2::<f64>::zeros((n_samples, 1));
    let input = BatchInput {
        measurements: measurements.view(),
        measurement_covariances: measurement_covariance.broadcast((n_samples, 3, 3)).unwrap(),
        priors: priors.view(),
        prior_covariances: prior_covariance.broadcast((n_samples, 2, 2)).unwrap(),
        parameters: Some(parameters.view()),
        first_guesses: None,
    };

    let estimator = OptimalEstimator::new(model, OptimalEstimationConfig::default()).unwrap();
    let executor = BatchExecutor::new(BatchConfig {
        n_workers: 2,
        chunk_size: 2,
    })
    .unwrap()
    .with_verbosity(Verbosity::progress());
    let batch = executor.invert(&estimator, &input).unwrap();

    assert_eq!(batch.n_valid(), 4);
    assert!(!batch.valid[4]);
    for sample in 0..4 {
        assert!(batch.converged[sample]);
        for dim in 0..2 {
            assert!(
                (batch.states[[sample, dim]] - truths[[sample, dim]]).abs() < 0.05,
                "Sample {} retrieved {} instead of {}",
                sample,
                batch.states[[sample, dim]],
                truths[[sample, dim]]
            );
        }
    }
}

#[test]
fn linear_lookup_table_is_solved_after_one_update_by_every_criterion() {
    let model = || {
        LutForwardModel::new(LINEAR_GRID.clone(), 2, MultilinearInterpolator::default()).unwrap()
    };
    let truth = [1.7, 0.4];
    let parameter = DVector::from_vec(vec![0.3]);
    let measurement = DVector::from_row_slice(&linear_functions(truth[0], truth[1], parameter[0]));
    let measurement_covariance = DMatrix::from_diagonal_element(3, 3, 0.01);
    let prior = DVector::from_column_slice(&truth);
    let prior_covariance = DMatrix::identity(2, 2);
    let first_guess = DVector::from_vec(vec![3.0, -1.0]);

    for form in [IncrementForm::N, IncrementForm::M, IncrementForm::LS] {
        let estimator =
            OptimalEstimator::new(model(), OptimalEstimationConfig::default().with_form(form))
                .unwrap();
        let retrieval = estimator
            .invert(
                &measurement,
                &measurement_covariance,
                &prior,
                &prior_covariance,
                Some(&parameter),
                Some(&first_guess),
            )
            .unwrap();
        assert!(retrieval.converged, "Form {} did not converge", form);
        assert_eq!(retrieval.iterations, 1, "Form {} needed more updates", form);
        assert_vectors_close(&retrieval.state, &truth, 1e-9);
    }
}

#[test]
fn stalled_damping_is_reported_as_exhausted() {
    // The supplied Jacobian points the wrong way, so no damped step lowers the cost.
    let model = FunctionForwardModel::new(1, 0, 1, |state: &DVector<f64>, _: &DVector<f64>| {
        state.clone()
    })
    .with_jacobian(|_, _| DMatrix::from_element(1, 1, -1.0));
    let mut config = OptimalEstimationConfig::default().with_form(IncrementForm::NLM);
    config.levenberg_marquardt.max_damping_increases = 3;
    let max_iterations = config.max_iterations;
    let estimator = OptimalEstimator::new(model, config).unwrap();

    let retrieval = estimator
        .invert(
            &DVector::from_vec(vec![1.0]),
            &DMatrix::identity(1, 1),
            &DVector::from_vec(vec![0.0]),
            &DMatrix::from_element(1, 1, 1e12),
            None,
            None,
        )
        .unwrap();

    assert!(!retrieval.converged);
    assert_eq!(retrieval.iterations, max_iterations);
    assert_eq!(retrieval.state[0], 0.0);
    assert_non_increasing(&retrieval.cost_history);
}

#[test]
fn complex_averaging_kernel_spectrum_only_voids_information_content() {
    // A non-symmetric measurement covariance gives an averaging kernel of the
    // form `[[p, -q], [q, p]]`, whose eigenvalues are complex.
    let model = FunctionForwardModel::new(2, 0, 2, |state: &DVector<f64>, _: &DVector<f64>| {
        state.clone()
    })
    .with_jacobian(|_, _| DMatrix::identity(2, 2));
    let estimator = OptimalEstimator::new(model, OptimalEstimationConfig::default()).unwrap();

    let retrieval = estimator
        .invert(
            &DVector::from_vec(vec![1.0, 2.0]),
            &DMatrix::from_row_slice(2, 2, &[1.0, 2.0, -2.0, 1.0]),
            &DVector::zeros(2),
            &DMatrix::identity(2, 2),
            None,
            None,
        )
        .unwrap();

    assert!(retrieval.converged);
    assert!(retrieval.information_content.is_nan());
    assert!((retrieval.degrees_of_freedom - 0.5).abs() < 1e-10);
    assert!((retrieval.averaging_kernel[(1, 0)] - 0.25).abs() < 1e-10);
    for matrix in [
        &retrieval.retrieval_covariance,
        &retrieval.gain,
        &retrieval.averaging_kernel,
        &retrieval.noise_covariance,
        &retrieval.smoothing_covariance,
    ] {
        assert!(matrix.iter().all(|value| value.is_finite()));
    }
    assert!(retrieval.state.iter().all(|value| value.is_finite()));
}
