//! Utilities for reading lookup tables from and saving results to file.

#[cfg(feature = "npy")]
use crate::{
    grid::{axis::Axis, LutGrid},
    num::BFloat,
};
#[cfg(feature = "npy")]
use ndarray::{Array1, ArrayBase, ArrayD, Data, Dimension};
#[cfg(any(feature = "json", feature = "pickle"))]
use serde::Serialize;
use std::{fs, io, path::Path};

fn invalid_data<E: ToString>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// Reads a lookup table and the coordinate tables of its axes from `.npy` files.
///
/// # Parameters
///
/// - `lut_path`: Path to the table of sampled values.
/// - `axis_paths`: Path to the 1D coordinate table of each gridded dimension.
///
/// # Returns
///
/// A `Result` which is either:
///
/// - `Ok`: Contains the lookup table grid.
/// - `Err`: A file could not be read or the tables are inconsistent.
///
/// # Type parameters
///
/// - `F`: Floating point type of the table values.
/// - `P`: Type of the axis paths.
#[cfg(feature = "npy")]
pub fn read_lut_npy<F, P>(lut_path: &Path, axis_paths: &[P]) -> io::Result<LutGrid<F>>
where
    F: BFloat + ndarray_npy::ReadableElement,
    P: AsRef<Path>,
{
    let values: ArrayD<F> = ndarray_npy::read_npy(lut_path).map_err(invalid_data)?;
    let tables = axis_paths
        .iter()
        .map(|axis_path| {
            ndarray_npy::read_npy::<_, Array1<f64>>(axis_path)
                .map(|table| table.to_vec())
                .map_err(invalid_data)
        })
        .collect::<io::Result<Vec<_>>>()?;
    let axes = Axis::from_tables(tables).map_err(invalid_data)?;
    LutGrid::new(values, axes).map_err(invalid_data)
}

/// Saves the given array in `.npy` format at the given path.
#[cfg(feature = "npy")]
pub fn save_array_as_npy<A, S, D>(file_path: &Path, array: &ArrayBase<S, D>) -> io::Result<()>
where
    A: ndarray_npy::WritableElement,
    S: Data<Elem = A>,
    D: Dimension,
{
    ndarray_npy::write_npy(file_path, array).map_err(|err| match err {
        ndarray_npy::WriteNpyError::Io(err) => err,
        err => invalid_data(err),
    })
}

/// Serializes the given data as JSON and saves it at the given path.
#[cfg(feature = "json")]
pub fn save_data_as_json<T: Serialize>(file_path: &Path, data: &T) -> io::Result<()> {
    let file = fs::File::create(file_path)?;
    serde_json::to_writer_pretty(io::BufWriter::new(file), data).map_err(io::Error::from)
}

/// Serializes the given data into protocol 3 pickle format and saves it at the given path.
#[cfg(feature = "pickle")]
pub fn save_data_as_pickle<T: Serialize>(file_path: &Path, data: &T) -> io::Result<()> {
    let mut file = fs::File::create(file_path)?;
    write_data_as_pickle(&mut file, data)
}

/// Serializes the given data into protocol 3 pickle format and writes it to the given writer.
#[cfg(feature = "pickle")]
pub fn write_data_as_pickle<W: io::Write, T: Serialize>(writer: &mut W, data: &T) -> io::Result<()> {
    match serde_pickle::to_writer(writer, data, serde_pickle::SerOptions::new()) {
        Ok(_) => Ok(()),
        Err(serde_pickle::Error::Io(err)) => Err(err),
        Err(err) => Err(invalid_data(err)),
    }
}

/// Reads the full content of the given file.
pub fn read_file(file_path: &Path) -> io::Result<Vec<u8>> {
    fs::read(file_path)
}
