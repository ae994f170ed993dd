//! Column-wise softmax.
//!
//! Each sample column is treated as one distribution. The forward pass
//! shifts by the column maximum before exponentiating, and entries below a
//! denormal cutoff are truncated to exact zero so downstream kernels never
//! see denormals.

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};
use ndarray::parallel::prelude::*;
use ndarray::{Axis, Zip};
use num_traits::Float;

pub struct Softmax;

impl Softmax {
    /// Truncation threshold: outputs below this are flushed to zero.
    pub fn cutoff<T: Float>() -> T {
        T::min_positive_value().sqrt()
    }

    pub fn forward<T>(input: &LocalMat<T>) -> LocalMat<T>
    where
        T: Float + Send + Sync,
    {
        let cutoff = Self::cutoff::<T>();
        let mut output = input.clone();
        output.axis_iter_mut(Axis(1)).into_par_iter().for_each(|mut column| {
            let shift = column
                .iter()
                .fold(T::neg_infinity(), |acc, &v| if v > acc { v } else { acc });
            let mut sum = T::zero();
            for v in column.iter_mut() {
                *v = (*v - shift).exp();
                sum = sum + *v;
            }
            for v in column.iter_mut() {
                let y = *v / sum;
                *v = if y < cutoff { T::zero() } else { y };
            }
        });
        output
    }

    /// `dx = y * (dy - dot(y, dy))` per column, with `y` the forward output.
    pub fn backward<T>(output: &LocalMat<T>, grad_output: &LocalMat<T>) -> Result<LocalMat<T>>
    where
        T: Float + Send + Sync,
    {
        if output.dim() != grad_output.dim() {
            return Err(GroveError::shape_mismatch(
                "softmax_backward",
                format!("{:?}", output.dim()),
                format!("{:?}", grad_output.dim()),
            ));
        }
        let mut grad_input = local_mat(output.nrows(), output.ncols());
        Zip::from(grad_input.axis_iter_mut(Axis(1)))
            .and(output.axis_iter(Axis(1)))
            .and(grad_output.axis_iter(Axis(1)))
            .par_for_each(|mut dx, y, dy| {
                let mut dot = T::zero();
                for (a, b) in y.iter().zip(dy.iter()) {
                    dot = dot + *a * *b;
                }
                for ((d, &yi), &dyi) in dx.iter_mut().zip(y.iter()).zip(dy.iter()) {
                    *d = yi * (dyi - dot);
                }
            });
        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::matrix::local_mat_from_samples;

    #[test]
    fn columns_sum_to_one() {
        let input = local_mat_from_samples(3, 2, vec![1.0f64, 2.0, 3.0, -1.0, 0.0, 1.0]).unwrap();
        let output = Softmax::forward(&input);
        for sample in 0..2 {
            let total: f64 = output.column(sample).sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
        // Larger inputs get larger probabilities.
        assert!(output[[2, 0]] > output[[1, 0]]);
    }

    #[test]
    fn max_shift_keeps_large_inputs_finite() {
        let input = local_mat_from_samples(2, 1, vec![1000.0f32, 1001.0]).unwrap();
        let output = Softmax::forward(&input);
        assert!(output.iter().all(|v| v.is_finite()));
        assert!((output[[0, 0]] + output[[1, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_probabilities_are_flushed_to_zero() {
        let input = local_mat_from_samples(2, 1, vec![0.0f32, 100.0]).unwrap();
        let output = Softmax::forward(&input);
        assert_eq!(output[[0, 0]], 0.0);
        assert!((output[[1, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn backward_of_uniform_distribution_with_uniform_gradient_is_zero() {
        let y = local_mat_from_samples(4, 1, vec![0.25f64; 4]).unwrap();
        let dy = local_mat_from_samples(4, 1, vec![1.0f64; 4]).unwrap();
        let dx = Softmax::backward(&y, &dy).unwrap();
        assert!(dx.iter().all(|v| v.abs() < 1e-12));
    }
}
