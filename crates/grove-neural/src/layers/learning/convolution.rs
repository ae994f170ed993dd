//! Standard convolution layer.

use grove_core::matrix::local_mat;
use grove_core::{ComputeTarget, LocalMat, Result};
use ndarray::LinalgScalar;
use num_traits::Float;

use crate::layers::ExecutionContext;
use crate::weights::WeightRegistry;

use super::base_convolution::{BaseConvolution, ConvolutionSpec};

/// Convolution over a channel-first input tensor of arbitrary spatial rank.
pub struct Convolution<T> {
    base: BaseConvolution<T>,
}

impl<T> Convolution<T>
where
    T: Float + LinalgScalar + std::ops::AddAssign + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, spec: ConvolutionSpec, target: ComputeTarget) -> Self {
        Self {
            base: BaseConvolution::new("convolution", name, false, spec, target),
        }
    }

    pub fn base(&self) -> &BaseConvolution<T> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseConvolution<T> {
        &mut self.base
    }

    /// Output dims for the given input dims:
    /// `out = (in + 2 * pad - dilation * (kernel - 1) - 1) / stride + 1`
    /// per spatial axis, channels from the spec.
    pub fn output_dims(spec: &ConvolutionSpec, input_dims: &[usize]) -> Vec<usize> {
        let mut dims = vec![spec.out_channels];
        for (axis, &in_dim) in input_dims[1..].iter().enumerate() {
            let effective_kernel = spec.dilations[axis] * (spec.kernel_dims[axis] - 1) + 1;
            dims.push((in_dim + 2 * spec.pads[axis] - effective_kernel) / spec.strides[axis] + 1);
        }
        dims
    }

    /// Validates the configuration, fixes the geometry and provisions the
    /// weights. Runs once before the first training step.
    pub fn setup<R: rand::Rng>(
        &mut self,
        input_dims: Vec<usize>,
        registry: &mut WeightRegistry<T>,
        rng: &mut R,
    ) -> Result<()> {
        self.base.validate(&input_dims)?;
        let output_dims = Self::output_dims(self.base.spec(), &input_dims);
        self.base.setup(input_dims, output_dims)?;
        self.base.setup_data(registry, rng)
    }

    /// Forward prop over the local shard; returns the local output matrix.
    pub fn forward(&mut self, input: &LocalMat<T>) -> Result<LocalMat<T>> {
        let out_size: usize = self.base.output_dims().iter().product();
        let mut output = local_mat(out_size, input.ncols());
        self.base.apply_convolution(input, &mut output)?;
        self.base.apply_bias(&mut output)?;
        Ok(output)
    }

    /// Backward prop: deposits weight gradients and returns the gradient
    /// with respect to the input.
    pub fn backward(
        &mut self,
        input: &LocalMat<T>,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<LocalMat<T>> {
        self.base.compute_gradients(input, grad_output, context)?;
        let in_size: usize = self.base.input_dims().iter().product();
        let mut grad_input = local_mat(in_size, grad_output.ncols());
        self.base
            .apply_transposed_convolution(grad_output, &mut grad_input)?;
        Ok(grad_input)
    }
}
