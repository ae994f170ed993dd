//! Local-matrix conventions.
//!
//! Layer activations and error signals are exchanged as 2-D local matrices
//! with one row per feature and one column per sample. Sample columns
//! flatten a channel-first tensor, so the block of rows belonging to one
//! channel is contiguous. Matrices are allocated in column-major order so a
//! single sample is a contiguous slice.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, ShapeBuilder};
use num_traits::{Float, Zero};

use crate::error::{GroveError, Result};

/// A local (feature x sample) matrix.
pub type LocalMat<T> = Array2<T>;

/// Allocates a zeroed local matrix with contiguous sample columns.
pub fn local_mat<T: Clone + Zero>(height: usize, width: usize) -> LocalMat<T> {
    Array2::zeros((height, width).f())
}

/// Builds a local matrix from sample-major data (all of sample 0, then all
/// of sample 1, ...).
pub fn local_mat_from_samples<T: Clone>(height: usize, width: usize, data: Vec<T>) -> Result<LocalMat<T>> {
    Array2::from_shape_vec((height, width).f(), data)
        .map_err(|e| GroveError::invalid_argument("local_mat_from_samples", e.to_string()))
}

/// True if this process holds no local data for the matrix.
pub fn is_empty<T>(mat: &LocalMat<T>) -> bool {
    mat.nrows() == 0 || mat.ncols() == 0
}

/// In-place `mat = alpha * mat`, including the `alpha == 0` overwrite case.
pub fn scale<T: Float>(alpha: T, mat: &mut Array2<T>) {
    if alpha == T::one() {
        return;
    }
    if alpha == T::zero() {
        mat.fill(T::zero());
    } else {
        mat.mapv_inplace(|v| alpha * v);
    }
}

/// Views one sample column as a (rows x cols) row-major matrix.
///
/// Fails if the column is not contiguous or `rows * cols` does not cover it.
pub fn column_matrix<T>(mat: &LocalMat<T>, col: usize, rows: usize, cols: usize) -> Result<ArrayView2<'_, T>> {
    let column = mat.column(col);
    let slice = column
        .to_slice()
        .ok_or_else(|| GroveError::invalid_argument("column_matrix", "sample column is not contiguous"))?;
    ArrayView2::from_shape((rows, cols), slice)
        .map_err(|e| GroveError::invalid_argument("column_matrix", e.to_string()))
}

/// Mutable variant of [`column_matrix`].
pub fn column_matrix_mut<T>(
    mat: &mut LocalMat<T>,
    col: usize,
    rows: usize,
    cols: usize,
) -> Result<ArrayViewMut2<'_, T>> {
    let column = mat.column_mut(col);
    let slice = column
        .into_slice()
        .ok_or_else(|| GroveError::invalid_argument("column_matrix", "sample column is not contiguous"))?;
    ArrayViewMut2::from_shape((rows, cols), slice)
        .map_err(|e| GroveError::invalid_argument("column_matrix", e.to_string()))
}
