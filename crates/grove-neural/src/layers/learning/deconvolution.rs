//! Transposed (deconvolution) layer.
//!
//! Runs the convolution machine through its adjoint: forward prop is the
//! transposed application, backward prop is the standard one, and the
//! kernel-gradient GEMM swaps its operands accordingly. Useful as a learned
//! upsampling layer.

use grove_core::matrix::local_mat;
use grove_core::{ComputeTarget, LocalMat, Result};
use ndarray::LinalgScalar;
use num_traits::Float;

use crate::layers::ExecutionContext;
use crate::weights::WeightRegistry;

use super::base_convolution::{BaseConvolution, ConvolutionSpec};

pub struct Deconvolution<T> {
    base: BaseConvolution<T>,
}

impl<T> Deconvolution<T>
where
    T: Float + LinalgScalar + std::ops::AddAssign + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, spec: ConvolutionSpec, target: ComputeTarget) -> Self {
        Self {
            base: BaseConvolution::new("deconvolution", name, true, spec, target),
        }
    }

    pub fn base(&self) -> &BaseConvolution<T> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseConvolution<T> {
        &mut self.base
    }

    /// Output dims for the given input dims:
    /// `out = stride * (in - 1) + dilation * (kernel - 1) + 1 - 2 * pad`
    /// per spatial axis, the inverse of the convolution formula.
    pub fn output_dims(spec: &ConvolutionSpec, input_dims: &[usize]) -> Vec<usize> {
        let mut dims = vec![spec.out_channels];
        for (axis, &in_dim) in input_dims[1..].iter().enumerate() {
            dims.push(
                spec.strides[axis] * (in_dim - 1) + spec.dilations[axis] * (spec.kernel_dims[axis] - 1)
                    + 1
                    - 2 * spec.pads[axis],
            );
        }
        dims
    }

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

    /// Forward prop is the transposed application: the layer input is the
    /// signal side of the underlying convolution.
    pub fn forward(&mut self, input: &LocalMat<T>) -> Result<LocalMat<T>> {
        let out_size: usize = self.base.output_dims().iter().product();
        let mut output = local_mat(out_size, input.ncols());
        self.base.apply_transposed_convolution(input, &mut output)?;
        self.base.apply_bias(&mut output)?;
        Ok(output)
    }

    pub fn backward(
        &mut self,
        input: &LocalMat<T>,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<LocalMat<T>> {
        self.base.compute_gradients(input, grad_output, context)?;
        let in_size: usize = self.base.input_dims().iter().product();
        let mut grad_input = local_mat(in_size, grad_output.ncols());
        self.base.apply_convolution(grad_output, &mut grad_input)?;
        Ok(grad_input)
    }
}
