//! Column-wise argmax.

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};
use num_traits::Float;

/// Maps each 1-D sample column to the index of its largest entry. Ties
/// resolve to the smallest index.
pub struct Argmax;

impl Argmax {
    pub fn forward<T: Float>(input: &LocalMat<T>) -> Result<LocalMat<T>> {
        if input.nrows() == 0 {
            return Err(GroveError::invalid_argument(
                "argmax",
                "input must have at least one feature",
            ));
        }
        let mut output = local_mat(1, input.ncols());
        for (sample, column) in input.columns().into_iter().enumerate() {
            let mut best = 0usize;
            for (row, &v) in column.iter().enumerate() {
                if v > column[best] {
                    best = row;
                }
            }
            output[[0, sample]] = T::from(best).ok_or_else(|| {
                GroveError::invalid_argument("argmax", "index is not representable")
            })?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::matrix::local_mat_from_samples;

    #[test]
    fn picks_the_largest_entry_per_sample() {
        let input =
            local_mat_from_samples(3, 2, vec![0.0f32, 5.0, 2.0, 7.0, 1.0, -3.0]).unwrap();
        let out = Argmax::forward(&input).unwrap();
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[0, 1]], 0.0);
    }

    #[test]
    fn ties_resolve_to_the_first_index() {
        let input = local_mat_from_samples(3, 1, vec![4.0f32, 4.0, 1.0]).unwrap();
        let out = Argmax::forward(&input).unwrap();
        assert_eq!(out[[0, 0]], 0.0);
    }
}
