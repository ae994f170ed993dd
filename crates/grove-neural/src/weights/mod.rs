//! Named parameter tensors.
//!
//! A [`Weights`] object owns the current value matrix, an optional
//! initialization rule and an optional gradient accumulator. Layers hold
//! shared [`WeightsRef`] handles; the matrix is (leading dim x remaining
//! dims) so a convolution kernel with dims `[n, c, k1, k2]` is stored as an
//! `n x (c * k1 * k2)` matrix and every GEMM in the compute core uses it
//! without reshaping.

pub mod initializers;

use std::sync::{Arc, RwLock};

use grove_core::matrix::local_mat;
use grove_core::{GroveError, LocalMat, Result};
use num_traits::Float;
use rand::Rng;

use crate::optimizers::GradientAccumulator;
use initializers::Initializer;

pub struct Weights<T> {
    name: String,
    dims: Vec<usize>,
    values: LocalMat<T>,
    initializer: Option<Initializer>,
    optimizer: Option<GradientAccumulator<T>>,
    frozen: bool,
}

/// Shared handle to a weight tensor.
pub type WeightsRef<T> = Arc<RwLock<Weights<T>>>;

impl<T: Float> Weights<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dims: Vec::new(),
            values: local_mat(0, 0),
            initializer: None,
            optimizer: None,
            frozen: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical tensor dims; the matrix is `dims[0] x prod(dims[1..])`.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn matrix_height(&self) -> usize {
        self.values.nrows()
    }

    pub fn matrix_width(&self) -> usize {
        self.values.ncols()
    }

    /// Sets the dims and allocates zeroed storage. Rejected once storage
    /// exists with a different shape, since other layers may already hold
    /// views of this tensor's geometry.
    pub fn set_dims(&mut self, dims: Vec<usize>) -> Result<()> {
        let height = dims.first().copied().unwrap_or(0);
        let width: usize = dims.iter().skip(1).product();
        if !self.dims.is_empty() && self.dims != dims {
            return Err(GroveError::invalid_argument(
                "Weights::set_dims",
                format!(
                    "weights \"{}\" already sized as {:?}, cannot resize to {:?}",
                    self.name, self.dims, dims
                ),
            ));
        }
        if self.dims.is_empty() {
            self.dims = dims;
            self.values = local_mat(height, width);
        }
        Ok(())
    }

    pub fn values(&self) -> &LocalMat<T> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut LocalMat<T> {
        &mut self.values
    }

    pub fn set_initializer(&mut self, initializer: Initializer) {
        self.initializer = Some(initializer);
    }

    pub fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    /// Draws initial values if an initializer is attached; otherwise leaves
    /// the zeroed storage in place.
    pub fn initialize<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        if let Some(init) = &self.initializer {
            init.fill(&mut self.values, rng)?;
        }
        Ok(())
    }

    /// Attaches a gradient accumulator sized to the value matrix. A weight
    /// without one is not trainable.
    pub fn setup_optimizer(&mut self) {
        if self.optimizer.is_none() {
            self.optimizer = Some(GradientAccumulator::new(
                self.values.nrows(),
                self.values.ncols(),
            ));
        }
    }

    pub fn optimizer(&self) -> Option<&GradientAccumulator<T>> {
        self.optimizer.as_ref()
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut GradientAccumulator<T>> {
        self.optimizer.as_mut()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// The model's parameter set: every weight tensor created by any layer is
/// registered here exactly once.
pub struct WeightRegistry<T> {
    weights: Vec<WeightsRef<T>>,
}

impl<T: Float> WeightRegistry<T> {
    pub fn new() -> Self {
        Self {
            weights: Vec::new(),
        }
    }

    pub fn register(&mut self, weights: Weights<T>) -> WeightsRef<T> {
        let handle = Arc::new(RwLock::new(weights));
        self.weights.push(Arc::clone(&handle));
        handle
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightsRef<T>> {
        self.weights.iter()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl<T: Float> Default for WeightRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_determine_matrix_shape() {
        let mut w = Weights::<f32>::new("kernel");
        w.set_dims(vec![4, 2, 3, 3]).unwrap();
        assert_eq!(w.matrix_height(), 4);
        assert_eq!(w.matrix_width(), 18);
    }

    #[test]
    fn resizing_is_rejected() {
        let mut w = Weights::<f32>::new("kernel");
        w.set_dims(vec![4, 2]).unwrap();
        assert!(w.set_dims(vec![4, 2]).is_ok());
        assert!(w.set_dims(vec![8, 2]).is_err());
    }

    #[test]
    fn registry_hands_out_shared_handles() {
        let mut registry = WeightRegistry::<f32>::new();
        let handle = registry.register(Weights::new("bias"));
        let other = Arc::clone(&handle);
        other.write().unwrap().freeze();
        assert!(handle.read().unwrap().is_frozen());
        assert_eq!(registry.len(), 1);
    }
}
