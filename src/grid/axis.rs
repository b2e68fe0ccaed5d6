//! Monotone coordinate tables and their conversion to fractional grid indices.

use super::fgr;
use crate::error::RetrievalError;

/// A strictly monotone 1D table of grid coordinates.
///
/// Decreasing tables are stored negated so that lookups always operate on an
/// increasing sequence.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Axis {
    coords: Vec<fgr>,
    lookup_coords: Vec<fgr>,
    is_decreasing: bool,
}

impl Axis {
    /// Creates a new axis from the given coordinates.
    ///
    /// # Parameters
    ///
    /// - `coords`: Grid coordinates, strictly increasing or strictly decreasing.
    ///
    /// # Returns
    ///
    /// A `Result` which is either:
    ///
    /// - `Ok`: Contains the new axis.
    /// - `Err`: The table has fewer than two entries, contains non-finite
    /// values or is not strictly monotone.
    pub fn new(coords: Vec<fgr>) -> Result<Self, RetrievalError> {
        Self::with_index(coords, 0)
    }

    /// Creates a new axis, reporting the given axis index in any error.
    pub fn with_index(coords: Vec<fgr>, index: usize) -> Result<Self, RetrievalError> {
        let invalid = |reason: &str| RetrievalError::InvalidAxis {
            index,
            reason: reason.to_string(),
        };

        if coords.len() < 2 {
            return Err(invalid("at least two coordinates are required"));
        }
        if !coords.iter().all(|coord| coord.is_finite()) {
            return Err(invalid("coordinates must be finite"));
        }

        let is_decreasing = coords[1] < coords[0];
        let strictly_monotone = coords.windows(2).all(|pair| {
            if is_decreasing {
                pair[1] < pair[0]
            } else {
                pair[1] > pair[0]
            }
        });
        if !strictly_monotone {
            return Err(invalid("coordinates must be strictly monotone"));
        }

        let lookup_coords = if is_decreasing {
            coords.iter().map(|&coord| -coord).collect()
        } else {
            coords.clone()
        };

        Ok(Self {
            coords,
            lookup_coords,
            is_decreasing,
        })
    }

    /// Creates a list of axes from the given coordinate tables.
    pub fn from_tables<I>(tables: I) -> Result<Vec<Self>, RetrievalError>
    where
        I: IntoIterator<Item = Vec<fgr>>,
    {
        tables
            .into_iter()
            .enumerate()
            .map(|(index, coords)| Self::with_index(coords, index))
            .collect()
    }

    /// Returns the number of coordinates.
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    /// Always false, since an axis has at least two coordinates.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Returns the coordinates in their original order.
    pub fn coords(&self) -> &[fgr] {
        &self.coords
    }

    /// Whether the coordinates are stored in decreasing order.
    pub fn is_decreasing(&self) -> bool {
        self.is_decreasing
    }

    /// Returns the smallest coordinate.
    pub fn min(&self) -> fgr {
        if self.is_decreasing {
            self.coords[self.len() - 1]
        } else {
            self.coords[0]
        }
    }

    /// Returns the largest coordinate.
    pub fn max(&self) -> fgr {
        if self.is_decreasing {
            self.coords[0]
        } else {
            self.coords[self.len() - 1]
        }
    }

    /// Returns the signed coordinate difference between the two given indices.
    pub fn step(&self, lower: usize, upper: usize) -> fgr {
        self.coords[upper] - self.coords[lower]
    }

    /// Converts a physical coordinate into a fractional index along the axis.
    ///
    /// Coordinates beyond either end are clamped to the first or last index.
    /// A NaN coordinate gives a NaN index.
    pub fn fractional_index(&self, value: fgr) -> fgr {
        if value.is_nan() {
            return fgr::NAN;
        }
        let value = if self.is_decreasing { -value } else { value };
        fractional_index_in_increasing(&self.lookup_coords, value)
    }
}

/// Finds the fractional position of `value` in an increasing table.
fn fractional_index_in_increasing(table: &[fgr], value: fgr) -> fgr {
    let last = table.len() - 1;
    if value <= table[0] {
        return 0.0;
    }
    if value >= table[last] {
        return last as fgr;
    }

    // Index of the first entry strictly larger than the value
    let upper = table.partition_point(|&coord| coord <= value);
    let lower = upper - 1;
    lower as fgr + (value - table[lower]) / (table[upper] - table[lower])
}
