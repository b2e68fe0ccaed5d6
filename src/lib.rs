//! The `sextant` crate retrieves physical state vectors from measurements by
//! optimal estimation inversion of forward models interpolated from lookup tables.
pub mod batch;
pub mod error;
pub mod forward;
pub mod grid;
pub mod interpolation;
pub mod inversion;
pub mod io;
pub mod linalg;
pub mod num;
