//! Column-wise argmin.

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};
use num_traits::Float;

/// Maps each 1-D sample column to the index of its smallest entry. Ties
/// resolve to the smallest index.
pub struct Argmin;

impl Argmin {
    pub fn forward<T: Float>(input: &LocalMat<T>) -> Result<LocalMat<T>> {
        if input.nrows() == 0 {
            return Err(GroveError::invalid_argument(
                "argmin",
                "input must have at least one feature",
            ));
        }
        let mut output = local_mat(1, input.ncols());
        for (sample, column) in input.columns().into_iter().enumerate() {
            let mut best = 0usize;
            for (row, &v) in column.iter().enumerate() {
                if v < column[best] {
                    best = row;
                }
            }
            output[[0, sample]] = T::from(best).ok_or_else(|| {
                GroveError::invalid_argument("argmin", "index is not representable")
            })?;
        }
        Ok(output)
    }
}
