//! One-hot expansion.

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};
use num_traits::{Float, ToPrimitive};

/// Expands a scalar class index per sample into a one-hot vector of the
/// configured size. Indices outside `[0, size)` produce an all-zero column.
pub struct OneHot {
    size: usize,
}

impl OneHot {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forward<T: Float>(&self, input: &LocalMat<T>) -> Result<LocalMat<T>> {
        if input.nrows() != 1 {
            return Err(GroveError::shape_mismatch(
                "one_hot",
                "1 feature per sample".to_string(),
                format!("{}", input.nrows()),
            ));
        }
        let mut output = local_mat(self.size, input.ncols());
        for sample in 0..input.ncols() {
            let v = input[[0, sample]];
            if v < T::zero() {
                continue;
            }
            let index = v.floor();
            if let Some(index) = index.to_usize() {
                if index < self.size {
                    output[[index, sample]] = T::one();
                }
            }
        }
        Ok(output)
    }
}
