//! Parallel interpolation and inversion of many independent samples.

use crate::{
    error::RetrievalError,
    forward::ForwardOperator,
    grid::{fgr, LutGrid},
    interpolation::{fip, Interpolator},
    inversion::{OptimalEstimator, Retrieval},
    io::Verbosity,
    num::{self, BFloat},
};
use indicatif::ParallelProgressIterator;
use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;
use rayon::prelude::*;
use std::{num::NonZeroUsize, thread};

/// Configuration parameters for batch execution.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchConfig {
    /// Number of worker threads.
    pub n_workers: usize,
    /// Number of consecutive samples processed together by one worker.
    pub chunk_size: usize,
}

impl BatchConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 64;

    /// Returns the number of threads the system can run in parallel.
    pub fn available_workers() -> usize {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Creates a configuration with the given number of workers.
    pub fn with_workers(n_workers: usize) -> Self {
        Self {
            n_workers,
            ..Self::default()
        }
    }

    /// Checks that the parameters are usable.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.n_workers == 0 {
            return Err(RetrievalError::InvalidConfig(
                "number of workers must be larger than zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(RetrievalError::InvalidConfig(
                "chunk size must be larger than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            n_workers: Self::available_workers(),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Per-sample inputs for a batch of inversions.
///
/// The leading dimension of every array indexes the samples. Inputs shared
/// by all samples can be given as broadcast views.
#[derive(Clone, Debug)]
pub struct BatchInput<'a> {
    /// Observed measurements, `n_samples x n_measurement`.
    pub measurements: ArrayView2<'a, f64>,
    /// Measurement covariances, `n_samples x n_measurement x n_measurement`.
    pub measurement_covariances: ArrayView3<'a, f64>,
    /// Prior states, `n_samples x n_state`.
    pub priors: ArrayView2<'a, f64>,
    /// Prior covariances, `n_samples x n_state x n_state`.
    pub prior_covariances: ArrayView3<'a, f64>,
    /// Forward model parameters, `n_samples x n_parameter`.
    pub parameters: Option<ArrayView2<'a, f64>>,
    /// First guesses, `n_samples x n_state`. The priors are used if omitted.
    pub first_guesses: Option<ArrayView2<'a, f64>>,
}

impl<'a> BatchInput<'a> {
    /// Returns the number of samples.
    pub fn n_samples(&self) -> usize {
        self.measurements.nrows()
    }

    fn validate(
        &self,
        n_state: usize,
        n_parameter: usize,
        n_measurement: usize,
    ) -> Result<(), RetrievalError> {
        let n_samples = self.n_samples();
        let check = |quantity: &'static str, expected: &[usize], actual: &[usize]| {
            if expected == actual {
                Ok(())
            } else {
                Err(RetrievalError::DimensionMismatch {
                    quantity,
                    expected: format!("{:?}", expected),
                    actual: format!("{:?}", actual),
                })
            }
        };
        check(
            "measurements",
            &[n_samples, n_measurement],
            self.measurements.shape(),
        )?;
        check(
            "measurement covariances",
            &[n_samples, n_measurement, n_measurement],
            self.measurement_covariances.shape(),
        )?;
        check("priors", &[n_samples, n_state], self.priors.shape())?;
        check(
            "prior covariances",
            &[n_samples, n_state, n_state],
            self.prior_covariances.shape(),
        )?;
        match &self.parameters {
            Some(parameters) => check("parameters", &[n_samples, n_parameter], parameters.shape())?,
            None => check("parameters", &[n_parameter], &[0_usize])?,
        }
        if let Some(first_guesses) = &self.first_guesses {
            check("first guesses", &[n_samples, n_state], first_guesses.shape())?;
        }
        Ok(())
    }

    /// Whether every input of the given sample is finite.
    fn sample_is_finite(&self, sample: usize) -> bool {
        let finite_row = |array: &ArrayView2<f64>| num::all_finite(array.row(sample).iter());
        let finite_matrix =
            |array: &ArrayView3<f64>| num::all_finite(array.index_axis(Axis(0), sample).iter());
        finite_row(&self.measurements)
            && finite_matrix(&self.measurement_covariances)
            && finite_row(&self.priors)
            && finite_matrix(&self.prior_covariances)
            && self.parameters.as_ref().map_or(true, finite_row)
            && self.first_guesses.as_ref().map_or(true, finite_row)
    }
}

fn row_vector(array: &ArrayView2<f64>, sample: usize) -> DVector<f64> {
    DVector::from_iterator(array.ncols(), array.row(sample).iter().copied())
}

fn sample_matrix(array: &ArrayView3<f64>, sample: usize) -> DMatrix<f64> {
    let matrix = array.index_axis(Axis(0), sample);
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn matrix_array(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(matrix.shape(), |(i, j)| matrix[(i, j)])
}

/// Outcome of a batch of inversions, with one entry per sample.
///
/// Skipped samples have NaN values, zero iterations and are marked as
/// neither valid nor converged.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchRetrieval {
    pub states: Array2<f64>,
    pub valid: Array1<bool>,
    pub converged: Array1<bool>,
    pub iterations: Array1<usize>,
    pub costs: Array1<f64>,
    pub degrees_of_freedom: Array1<f64>,
    pub information_content: Array1<f64>,
    pub retrieval_covariances: Array3<f64>,
    pub averaging_kernels: Array3<f64>,
}

impl BatchRetrieval {
    fn from_retrievals(n_state: usize, retrievals: &[Option<Retrieval>]) -> Self {
        let n_samples = retrievals.len();
        let mut batch = Self {
            states: Array2::from_elem((n_samples, n_state), f64::NAN),
            valid: Array1::from_elem(n_samples, false),
            converged: Array1::from_elem(n_samples, false),
            iterations: Array1::zeros(n_samples),
            costs: Array1::from_elem(n_samples, f64::NAN),
            degrees_of_freedom: Array1::from_elem(n_samples, f64::NAN),
            information_content: Array1::from_elem(n_samples, f64::NAN),
            retrieval_covariances: Array3::from_elem((n_samples, n_state, n_state), f64::NAN),
            averaging_kernels: Array3::from_elem((n_samples, n_state, n_state), f64::NAN),
        };
        for (sample, retrieval) in retrievals.iter().enumerate() {
            if let Some(retrieval) = retrieval {
                batch
                    .states
                    .row_mut(sample)
                    .assign(&ArrayView1::from(retrieval.state.as_slice()));
                batch.valid[sample] = true;
                batch.converged[sample] = retrieval.converged;
                batch.iterations[sample] = retrieval.iterations;
                batch.costs[sample] = retrieval.cost;
                batch.degrees_of_freedom[sample] = retrieval.degrees_of_freedom;
                batch.information_content[sample] = retrieval.information_content;
                batch
                    .retrieval_covariances
                    .index_axis_mut(Axis(0), sample)
                    .assign(&matrix_array(&retrieval.retrieval_covariance));
                batch
                    .averaging_kernels
                    .index_axis_mut(Axis(0), sample)
                    .assign(&matrix_array(&retrieval.averaging_kernel));
            }
        }
        batch
    }

    /// Returns the number of samples.
    pub fn n_samples(&self) -> usize {
        self.valid.len()
    }

    /// Returns the number of samples that were inverted.
    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&valid| valid).count()
    }

    /// Returns the number of samples whose inversion converged.
    pub fn n_converged(&self) -> usize {
        self.converged.iter().filter(|&&converged| converged).count()
    }
}

/// Executor distributing independent samples over a dedicated worker pool.
#[derive(Debug)]
pub struct BatchExecutor {
    config: BatchConfig,
    pool: rayon::ThreadPool,
    verbosity: Verbosity,
}

impl BatchExecutor {
    /// Creates a new executor with its own pool of worker threads.
    ///
    /// # Parameters
    ///
    /// - `config`: Configuration parameters for the executor.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the new executor.
    /// - `Err`: The configuration is invalid or the pool could not be built.
    pub fn new(config: BatchConfig) -> Result<Self, RetrievalError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_workers)
            .build()
            .map_err(|err| RetrievalError::ThreadPool(err.to_string()))?;
        Ok(Self {
            config,
            pool,
            verbosity: Verbosity::default(),
        })
    }

    /// Reports progress according to the given verbosity.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn n_chunks(&self, n_samples: usize) -> usize {
        (n_samples + self.config.chunk_size - 1) / self.config.chunk_size
    }

    fn chunk_range(&self, chunk: usize, n_samples: usize) -> std::ops::Range<usize> {
        let start = chunk * self.config.chunk_size;
        start..usize::min(start + self.config.chunk_size, n_samples)
    }

    /// Interpolates the lookup table at many points.
    ///
    /// # Parameters
    ///
    /// - `grid`: Lookup table to interpolate.
    /// - `interpolator`: Interpolator to use.
    /// - `coords`: Physical coordinates, `n_samples x n_dims`.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the `n_samples x n_outputs` interpolated values.
    /// - `Err`: The number of coordinates per sample does not match the grid.
    ///
    /// # Type parameters
    ///
    /// - `F`: Floating point type of the table values.
    /// - `I`: Type of interpolator.
    pub fn interpolate<F, I>(
        &self,
        grid: &LutGrid<F>,
        interpolator: &I,
        coords: ArrayView2<fgr>,
    ) -> Result<Array2<fip>, RetrievalError>
    where
        F: BFloat,
        I: Interpolator,
    {
        let n_dims = grid.n_dims();
        if coords.ncols() != n_dims {
            return Err(RetrievalError::vector_length(
                "coordinates",
                n_dims,
                coords.ncols(),
            ));
        }
        let n_samples = coords.nrows();
        let n_outputs = grid.n_outputs();
        let n_chunks = self.n_chunks(n_samples);

        let chunks: Vec<Vec<fip>> = self.pool.install(|| {
            (0..n_chunks)
                .into_par_iter()
                .map(|chunk| {
                    let range = self.chunk_range(chunk, n_samples);
                    let mut values = vec![0.0; range.len() * n_outputs];
                    let mut point = vec![0.0; n_dims];
                    let mut indices = vec![0.0; n_dims];
                    for (sample, sample_values) in
                        range.zip(values.chunks_exact_mut(n_outputs))
                    {
                        for (coord, &value) in point.iter_mut().zip(coords.row(sample)) {
                            *coord = value;
                        }
                        grid.fractional_indices_into(&point, &mut indices);
                        interpolator.interp_values(grid, &indices, sample_values);
                    }
                    values
                })
                .progress_with(self.verbosity.create_progress_bar(n_chunks))
                .collect()
        });

        let flat_values: Vec<fip> = chunks.into_iter().flatten().collect();
        Array2::from_shape_vec((n_samples, n_outputs), flat_values).map_err(|err| {
            RetrievalError::ShapeMismatch {
                lut_shape: grid.values().shape().to_vec(),
                reason: err.to_string(),
            }
        })
    }

    /// Performs an optimal estimation inversion for every sample.
    ///
    /// Samples with any non-finite input are skipped.
    ///
    /// # Parameters
    ///
    /// - `estimator`: Estimator to invert each sample with.
    /// - `input`: Per-sample inputs.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the retrievals, in sample order.
    /// - `Err`: The input arrays are inconsistent with the forward model.
    ///
    /// # Type parameters
    ///
    /// - `M`: Type of forward model.
    pub fn invert<M: ForwardOperator>(
        &self,
        estimator: &OptimalEstimator<M>,
        input: &BatchInput,
    ) -> Result<BatchRetrieval, RetrievalError> {
        let n_state = estimator.n_state();
        input.validate(n_state, estimator.n_parameter(), estimator.n_measurement())?;

        let n_samples = input.n_samples();
        let n_chunks = self.n_chunks(n_samples);

        if self.verbosity.print_messages() {
            println!(
                "Inverting {} samples in {} chunks on {} workers",
                n_samples, n_chunks, self.config.n_workers
            );
        }

        let chunks: Vec<Vec<Option<Retrieval>>> = self.pool.install(|| {
            (0..n_chunks)
                .into_par_iter()
                .map(|chunk| {
                    self.chunk_range(chunk, n_samples)
                        .map(|sample| invert_sample(estimator, input, sample))
                        .collect::<Result<Vec<_>, _>>()
                })
                .progress_with(self.verbosity.create_progress_bar(n_chunks))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let retrievals: Vec<Option<Retrieval>> = chunks.into_iter().flatten().collect();
        let batch = BatchRetrieval::from_retrievals(n_state, &retrievals);

        if self.verbosity.print_messages() {
            println!(
                "Inverted {} of {} samples, {} converged",
                batch.n_valid(),
                n_samples,
                batch.n_converged()
            );
        }
        Ok(batch)
    }
}

fn invert_sample<M: ForwardOperator>(
    estimator: &OptimalEstimator<M>,
    input: &BatchInput,
    sample: usize,
) -> Result<Option<Retrieval>, RetrievalError> {
    if !input.sample_is_finite(sample) {
        return Ok(None);
    }
    let parameter = input
        .parameters
        .as_ref()
        .map(|parameters| row_vector(parameters, sample));
    let first_guess = input
        .first_guesses
        .as_ref()
        .map(|first_guesses| row_vector(first_guesses, sample));
    estimator
        .invert(
            &row_vector(&input.measurements, sample),
            &sample_matrix(&input.measurement_covariances, sample),
            &row_vector(&input.priors, sample),
            &sample_matrix(&input.prior_covariances, sample),
            parameter.as_ref(),
            first_guess.as_ref(),
        )
        .map(Some)
}
