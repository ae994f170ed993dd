//! The shared convolution/deconvolution compute core.
//!
//! [`BaseConvolution`] implements everything the concrete [`Convolution`]
//! and [`Deconvolution`] layers have in common: configuration validation,
//! kernel/bias provisioning, and the forward/backward kernels on both
//! execution targets. The CPU target unfolds each sample into a patch
//! matrix and reduces convolution to dense GEMMs; the accelerated target
//! drives the native compute primitives through opaque descriptors, with a
//! per-mini-batch-width memo of the selected algorithms.
//!
//! Direction handling: a deconvolution layer is the same machine run through
//! its adjoint. The "image" side of the underlying convolution is the layer
//! input for a convolution layer and the layer output for a deconvolution
//! layer; every kernel here is written against that convolution-direction
//! geometry, and the concrete layers pick which pass maps to which kernel.
//!
//! [`Convolution`]: super::convolution::Convolution
//! [`Deconvolution`]: super::deconvolution::Deconvolution

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::RwLockWriteGuard;

use grove_core::accel::{
    copy_convolution_desc, copy_filter_desc, copy_tensor_desc, select_backward_data_algorithm,
    select_backward_filter_algorithm, select_forward_algorithm, BackwardDataAlgorithm,
    BackwardFilterAlgorithm, ConvolutionDescriptor, ConvolutionMode, DataKind, FilterDescriptor,
    ForwardAlgorithm, TensorDescriptor,
};
use grove_core::im2col::{col2im, col_matrix_dims, im2col};
use grove_core::math::KahanSum;
use grove_core::matrix::{self, column_matrix, column_matrix_mut};
use grove_core::{ComputeTarget, GroveError, LocalMat, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis, LinalgScalar};
use num_traits::Float;
#[cfg(feature = "gpu")]
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::layers::ExecutionContext;
use crate::weights::initializers::{Initializer, VarianceScaling};
use crate::weights::{WeightRegistry, Weights, WeightsRef};

/// Default cap on accelerated scratch space, in bytes. Overridable per layer
/// with [`BaseConvolution::set_workspace_limit`].
pub const DEFAULT_WORKSPACE_LIMIT: usize = 1 << 28;

/// Immutable per-layer convolution configuration.
///
/// All of the per-axis sequences have one entry per spatial axis of the
/// input tensor (input rank minus the leading channel axis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvolutionSpec {
    pub out_channels: usize,
    pub kernel_dims: Vec<usize>,
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub groups: usize,
    pub bias: bool,
}

impl ConvolutionSpec {
    /// Unit-stride, unit-dilation, ungrouped spec with symmetric pads.
    pub fn simple(out_channels: usize, kernel_dims: Vec<usize>, pads: Vec<usize>, bias: bool) -> Self {
        let rank = kernel_dims.len();
        Self {
            out_channels,
            kernel_dims,
            pads,
            strides: vec![1; rank],
            dilations: vec![1; rank],
            groups: 1,
            bias,
        }
    }
}

/// State backing the accelerated target: descriptor handles and the
/// per-mini-batch-width algorithm memos.
struct AcceleratedState {
    kernel_desc: Option<FilterDescriptor>,
    conv_desc: Option<ConvolutionDescriptor>,
    bias_desc: Option<TensorDescriptor>,
    forward_algos: HashMap<usize, ForwardAlgorithm>,
    backward_data_algos: HashMap<usize, BackwardDataAlgorithm>,
    backward_filter_algos: HashMap<usize, BackwardFilterAlgorithm>,
    deterministic: bool,
    workspace_limit: usize,
}

impl AcceleratedState {
    fn new() -> Self {
        Self {
            kernel_desc: None,
            conv_desc: None,
            bias_desc: None,
            forward_algos: HashMap::new(),
            backward_data_algos: HashMap::new(),
            backward_filter_algos: HashMap::new(),
            deterministic: false,
            workspace_limit: DEFAULT_WORKSPACE_LIMIT,
        }
    }
}

impl Clone for AcceleratedState {
    // Descriptors are deep-copied handle by handle; sharing one between two
    // layer instances would double-release it.
    fn clone(&self) -> Self {
        let mut kernel_desc = None;
        let mut conv_desc = None;
        let mut bias_desc = None;
        copy_filter_desc(self.kernel_desc.as_ref(), &mut kernel_desc);
        copy_convolution_desc(self.conv_desc.as_ref(), &mut conv_desc);
        copy_tensor_desc(self.bias_desc.as_ref(), &mut bias_desc);
        Self {
            kernel_desc,
            conv_desc,
            bias_desc,
            forward_algos: self.forward_algos.clone(),
            backward_data_algos: self.backward_data_algos.clone(),
            backward_filter_algos: self.backward_filter_algos.clone(),
            deterministic: self.deterministic,
            workspace_limit: self.workspace_limit,
        }
    }
}

/// Shared convolution/deconvolution compute core.
#[derive(Clone)]
pub struct BaseConvolution<T> {
    name: String,
    layer_type: &'static str,
    transposed: bool,
    spec: ConvolutionSpec,
    target: ComputeTarget,
    bias_scaling_factor: T,
    input_dims: Vec<usize>,
    output_dims: Vec<usize>,
    kernel_weights: Option<WeightsRef<T>>,
    bias_weights: Option<WeightsRef<T>>,
    frozen: bool,
    accel: AcceleratedState,
}

impl<T> BaseConvolution<T>
where
    T: Float + LinalgScalar + std::ops::AddAssign + Send + Sync + 'static,
{
    pub fn new(
        layer_type: &'static str,
        name: impl Into<String>,
        transposed: bool,
        spec: ConvolutionSpec,
        target: ComputeTarget,
    ) -> Self {
        let bias_scaling_factor = if spec.bias { T::one() } else { T::zero() };
        Self {
            name: name.into(),
            layer_type,
            transposed,
            spec,
            target,
            bias_scaling_factor,
            input_dims: Vec::new(),
            output_dims: Vec::new(),
            kernel_weights: None,
            bias_weights: None,
            frozen: false,
            accel: AcceleratedState::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer_type(&self) -> &'static str {
        self.layer_type
    }

    pub fn spec(&self) -> &ConvolutionSpec {
        &self.spec
    }

    pub fn target(&self) -> ComputeTarget {
        self.target
    }

    pub fn input_dims(&self) -> &[usize] {
        &self.input_dims
    }

    pub fn output_dims(&self) -> &[usize] {
        &self.output_dims
    }

    pub fn kernel_weights(&self) -> Option<&WeightsRef<T>> {
        self.kernel_weights.as_ref()
    }

    pub fn bias_weights(&self) -> Option<&WeightsRef<T>> {
        self.bias_weights.as_ref()
    }

    /// Supplies an externally owned kernel weight instead of letting
    /// [`setup_data`](Self::setup_data) create one.
    pub fn set_kernel_weights(&mut self, weights: WeightsRef<T>) {
        self.kernel_weights = Some(weights);
    }

    pub fn set_bias_weights(&mut self, weights: WeightsRef<T>) {
        self.bias_weights = Some(weights);
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Restricts accelerated algorithm selection to bitwise-reproducible
    /// candidates.
    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.accel.deterministic = deterministic;
    }

    pub fn set_workspace_limit(&mut self, bytes: usize) {
        self.accel.workspace_limit = bytes;
    }

    pub fn bias_scaling_factor(&self) -> T {
        self.bias_scaling_factor
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Validates the configuration against the input tensor dims and fixes
    /// the layer geometry. Runs once at graph setup.
    pub fn setup(&mut self, input_dims: Vec<usize>, output_dims: Vec<usize>) -> Result<()> {
        self.validate(&input_dims)?;
        self.input_dims = input_dims;
        self.output_dims = output_dims;
        if self.target == ComputeTarget::Accelerated {
            self.setup_descriptors()?;
        }
        Ok(())
    }

    fn config_err(&self, reason: impl Into<String>) -> GroveError {
        GroveError::invalid_configuration(self.layer_type, &self.name, reason)
    }

    /// Checks the configuration against the input tensor dims. Wrapper
    /// layers run this before deriving their output dims, so every
    /// geometry the output-dims formulas see is already well formed.
    pub(crate) fn validate(&self, input_dims: &[usize]) -> Result<()> {
        if input_dims.len() < 2 {
            return Err(self.config_err(
                "expects an input tensor with a channel axis and at least one spatial axis",
            ));
        }
        if input_dims.iter().any(|&d| d < 1) {
            return Err(self.config_err(format!(
                "has an empty input dimension in {:?}",
                input_dims
            )));
        }
        let num_spatial = input_dims.len() - 1;
        let spec = &self.spec;
        if spec.out_channels < 1 {
            return Err(self.config_err(format!(
                "has an invalid number of output channels ({})",
                spec.out_channels
            )));
        }
        if spec.groups < 1 {
            return Err(self.config_err(format!("has an invalid number of groups ({})", spec.groups)));
        }
        let in_channels = input_dims[0];
        let out_channels = spec.out_channels;
        if in_channels % spec.groups != 0 {
            return Err(self.config_err(format!(
                "has {} input channels, not divisible by {} groups",
                in_channels, spec.groups
            )));
        }
        if out_channels % spec.groups != 0 {
            return Err(self.config_err(format!(
                "has {} output channels, not divisible by {} groups",
                out_channels, spec.groups
            )));
        }
        for (field, dims) in [
            ("kernel dims", &spec.kernel_dims),
            ("pads", &spec.pads),
            ("strides", &spec.strides),
            ("dilations", &spec.dilations),
        ] {
            if dims.len() != num_spatial {
                return Err(self.config_err(format!(
                    "has {} {field} but {num_spatial} spatial axes",
                    dims.len()
                )));
            }
        }
        if spec.kernel_dims.iter().any(|&k| k < 1) {
            return Err(self.config_err(format!("has an invalid kernel dim in {:?}", spec.kernel_dims)));
        }
        if spec.strides.iter().any(|&s| s < 1) {
            return Err(self.config_err(format!("has an invalid stride in {:?}", spec.strides)));
        }
        if spec.dilations.iter().any(|&d| d < 1) {
            return Err(self.config_err(format!("has an invalid dilation in {:?}", spec.dilations)));
        }
        for (axis, &in_dim) in input_dims[1..].iter().enumerate() {
            let effective_kernel = spec.dilations[axis] * (spec.kernel_dims[axis] - 1) + 1;
            if self.transposed {
                let extent = spec.strides[axis] * (in_dim - 1) + effective_kernel;
                if 2 * spec.pads[axis] > extent {
                    return Err(self.config_err(format!(
                        "has padding {} on spatial axis {axis}, larger than the upsampled \
                         extent of {extent}",
                        spec.pads[axis]
                    )));
                }
            } else {
                let extent = in_dim + 2 * spec.pads[axis];
                if effective_kernel > extent {
                    return Err(self.config_err(format!(
                        "has an effective kernel extent of {effective_kernel} on spatial \
                         axis {axis}, larger than the padded input extent of {extent}",
                    )));
                }
            }
        }
        if self.target == ComputeTarget::Cpu {
            // Documented limitation of the unfold engine, not a fallback.
            if spec.dilations.iter().any(|&d| d != 1) {
                return Err(GroveError::unsupported_configuration(
                    self.layer_type,
                    &self.name,
                    "cpu",
                    "non-unit dilation is not supported",
                ));
            }
            if spec.groups != 1 {
                return Err(GroveError::unsupported_configuration(
                    self.layer_type,
                    &self.name,
                    "cpu",
                    "grouped convolution is not supported",
                ));
            }
        }
        Ok(())
    }

    /// Full kernel tensor dims, leading axis first.
    ///
    /// Convolution stores `[out_channels, in_channels / groups, k...]`;
    /// deconvolution stores `[in_channels, out_channels / groups, k...]`.
    /// Either way the leading axis is the GEMM row count of the stored
    /// kernel matrix.
    pub fn kernel_tensor_dims(&self) -> Vec<usize> {
        let in_channels = self.input_dims[0];
        let out_channels = self.output_dims[0];
        let mut dims = if self.transposed {
            vec![in_channels, out_channels / self.spec.groups]
        } else {
            vec![out_channels, in_channels / self.spec.groups]
        };
        dims.extend_from_slice(&self.spec.kernel_dims);
        dims
    }

    fn setup_descriptors(&mut self) -> Result<()> {
        let kind = data_kind_of::<T>().ok_or_else(|| {
            GroveError::unsupported_configuration(
                self.layer_type,
                &self.name,
                "accelerated",
                "weight type has no accelerated data kind",
            )
        })?;
        self.accel.kernel_desc = Some(FilterDescriptor::new(kind, self.kernel_tensor_dims()));
        self.accel.conv_desc = Some(ConvolutionDescriptor::new(
            self.spec.pads.clone(),
            self.spec.strides.clone(),
            self.spec.dilations.clone(),
            ConvolutionMode::CrossCorrelation,
            kind,
            self.spec.groups,
        ));
        if self.spec.bias {
            let mut dims = vec![1, self.output_dims[0]];
            dims.extend(std::iter::repeat(1).take(self.spec.kernel_dims.len()));
            self.accel.bias_desc = Some(TensorDescriptor::new(kind, dims));
        }
        Ok(())
    }

    /// Ensures the kernel (and bias, if enabled) weight objects exist, are
    /// sized, and agree with the layer's frozen state. Newly created weights
    /// are registered with the model's parameter set and drawn from a He
    /// initializer with provisioner-set fans.
    pub fn setup_data<R: rand::Rng>(
        &mut self,
        registry: &mut WeightRegistry<T>,
        rng: &mut R,
    ) -> Result<()> {
        let kernel_dims = self.kernel_tensor_dims();
        let kernel_size: usize = kernel_dims.iter().product();
        let fan_in = kernel_size as f64 / self.output_dims[0] as f64;
        let fan_out = kernel_size as f64 / self.input_dims[0] as f64;

        if self.kernel_weights.is_none() {
            let mut weights = Weights::new(format!("{}_kernel", self.name));
            weights.set_initializer(Initializer::VarianceScaling(
                VarianceScaling::he().with_fans(fan_in, fan_out),
            ));
            weights.set_dims(kernel_dims.clone())?;
            weights.initialize(rng)?;
            self.kernel_weights = Some(registry.register(weights));
        } else if let Some(handle) = &self.kernel_weights {
            write_weights(handle)?.set_dims(kernel_dims)?;
        }

        if self.spec.bias {
            if self.bias_weights.is_none() {
                let mut weights = Weights::new(format!("{}_bias", self.name));
                weights.set_initializer(Initializer::Constant(0.0));
                weights.set_dims(vec![self.output_dims[0]])?;
                weights.initialize(rng)?;
                self.bias_weights = Some(registry.register(weights));
            } else if let Some(handle) = &self.bias_weights {
                write_weights(handle)?.set_dims(vec![self.output_dims[0]])?;
            }
        }

        for handle in [self.kernel_weights.as_ref(), self.bias_weights.as_ref()]
            .into_iter()
            .flatten()
        {
            let mut weights = write_weights(handle)?;
            weights.setup_optimizer();
            // Owned weights follow the layer's frozen flag, even when they
            // were supplied externally in the opposite state.
            if self.frozen {
                weights.freeze();
            } else {
                weights.unfreeze();
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Convolution-direction geometry
    // ---------------------------------------------------------------------

    /// Dims of the convolution-direction input tensor (the unfolded side).
    fn conv_image_dims(&self) -> &[usize] {
        if self.transposed {
            &self.output_dims
        } else {
            &self.input_dims
        }
    }

    /// Dims of the convolution-direction output tensor (the GEMM side).
    fn conv_signal_dims(&self) -> &[usize] {
        if self.transposed {
            &self.input_dims
        } else {
            &self.output_dims
        }
    }

    fn kernel_handle(&self) -> Result<&WeightsRef<T>> {
        self.kernel_weights
            .as_ref()
            .ok_or_else(|| self.config_err("has no kernel weights; setup_data has not run"))
    }

    // ---------------------------------------------------------------------
    // Public compute surface
    // ---------------------------------------------------------------------

    /// Applies convolution in its forward direction: image side in, signal
    /// side out. For a convolution layer this is forward prop; for a
    /// deconvolution layer it is backward prop.
    pub fn apply_convolution(
        &mut self,
        image: &LocalMat<T>,
        signal: &mut LocalMat<T>,
    ) -> Result<()> {
        match self.target {
            ComputeTarget::Cpu => self.apply_convolution_unfold(image, signal),
            ComputeTarget::Accelerated => self.apply_convolution_accelerated(image, signal),
        }
    }

    /// Applies the adjoint: signal side in, image side out.
    pub fn apply_transposed_convolution(
        &mut self,
        signal: &LocalMat<T>,
        image: &mut LocalMat<T>,
    ) -> Result<()> {
        match self.target {
            ComputeTarget::Cpu => self.apply_transposed_convolution_unfold(signal, image),
            ComputeTarget::Accelerated => {
                self.apply_transposed_convolution_accelerated(signal, image)
            }
        }
    }

    /// Deposits kernel and bias gradient contributions into the optimizer
    /// buffers, scaled by the effective mini-batch size.
    pub fn compute_gradients(
        &mut self,
        input: &LocalMat<T>,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.compute_bias_gradient(grad_output, context)?;
        match self.target {
            ComputeTarget::Cpu => self.compute_kernel_gradient_unfold(input, grad_output, context),
            ComputeTarget::Accelerated => {
                self.compute_kernel_gradient_accelerated(input, grad_output, context)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Unfold engine (CPU target)
    // ---------------------------------------------------------------------

    fn apply_convolution_unfold(
        &self,
        image: &LocalMat<T>,
        signal: &mut LocalMat<T>,
    ) -> Result<()> {
        if matrix::is_empty(image) || matrix::is_empty(signal) {
            return Ok(());
        }
        let image_dims = self.conv_image_dims();
        let signal_dims = self.conv_signal_dims();
        let channels = image_dims[0];
        let (col_rows, col_cols) = col_matrix_dims(
            channels,
            &image_dims[1..],
            &self.spec.pads,
            &self.spec.kernel_dims,
            &self.spec.strides,
        );

        let handle = self.kernel_handle()?;
        let weights = read_weights(handle)?;
        let kernel = weights.values();
        let n = kernel.nrows();
        if n != signal_dims[0] || kernel.ncols() != col_rows {
            return Err(GroveError::shape_mismatch(
                "apply_convolution",
                format!("{}x{} kernel matrix", signal_dims[0], col_rows),
                format!("{}x{}", n, kernel.ncols()),
            ));
        }

        let mut col = Array2::<T>::zeros((col_rows, col_cols));
        for sample in 0..image.ncols() {
            let im = sample_slice(image, sample)?;
            im2col(
                im,
                &mut col,
                channels,
                &image_dims[1..],
                &self.spec.pads,
                &self.spec.kernel_dims,
                &self.spec.strides,
            )?;
            let mut out = column_matrix_mut(signal, sample, n, col_cols)?;
            general_mat_mul(T::one(), kernel, &col, T::zero(), &mut out);
        }
        Ok(())
    }

    fn apply_transposed_convolution_unfold(
        &self,
        signal: &LocalMat<T>,
        image: &mut LocalMat<T>,
    ) -> Result<()> {
        if matrix::is_empty(signal) || matrix::is_empty(image) {
            return Ok(());
        }
        let image_dims = self.conv_image_dims();
        let signal_dims = self.conv_signal_dims();
        let channels = image_dims[0];
        let (col_rows, col_cols) = col_matrix_dims(
            channels,
            &image_dims[1..],
            &self.spec.pads,
            &self.spec.kernel_dims,
            &self.spec.strides,
        );

        let handle = self.kernel_handle()?;
        let weights = read_weights(handle)?;
        let kernel = weights.values();
        let n = kernel.nrows();
        if n != signal_dims[0] || kernel.ncols() != col_rows {
            return Err(GroveError::shape_mismatch(
                "apply_transposed_convolution",
                format!("{}x{} kernel matrix", signal_dims[0], col_rows),
                format!("{}x{}", n, kernel.ncols()),
            ));
        }

        let mut col = Array2::<T>::zeros((col_rows, col_cols));
        for sample in 0..signal.ncols() {
            let x = column_matrix(signal, sample, n, col_cols)?;
            general_mat_mul(T::one(), &kernel.t(), &x, T::zero(), &mut col);
            let im = sample_slice_mut(image, sample)?;
            col2im(
                col.view(),
                im,
                channels,
                &image_dims[1..],
                &self.spec.pads,
                &self.spec.kernel_dims,
                &self.spec.strides,
            )?;
        }
        Ok(())
    }

    /// Adds the per-channel bias across all positions and samples. A zero
    /// bias scaling factor means bias is disabled and the call is a no-op.
    pub fn apply_bias(&self, output: &mut LocalMat<T>) -> Result<()> {
        if self.bias_scaling_factor == T::zero() || matrix::is_empty(output) {
            return Ok(());
        }
        let handle = self
            .bias_weights
            .as_ref()
            .ok_or_else(|| self.config_err("has bias enabled but no bias weights"))?;
        let weights = read_weights(handle)?;
        let bias = weights.values();
        let out_channels = self.output_dims[0];
        let spatial: usize = self.output_dims[1..].iter().product();
        if output.nrows() != out_channels * spatial || bias.nrows() != out_channels {
            return Err(GroveError::shape_mismatch(
                "apply_bias",
                format!("{} output rows", out_channels * spatial),
                format!("{}", output.nrows()),
            ));
        }
        let factor = self.bias_scaling_factor;
        if self.target == ComputeTarget::Accelerated {
            return self.apply_bias_accelerated(bias, output);
        }
        // Channel row-blocks are disjoint, so channels run in parallel.
        output
            .axis_chunks_iter_mut(Axis(0), spatial)
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, mut block)| {
                let shift = factor * bias[[channel, 0]];
                block.mapv_inplace(|v| v + shift);
            });
        Ok(())
    }

    #[cfg(feature = "gpu")]
    fn apply_bias_accelerated(&self, bias: &LocalMat<T>, output: &mut LocalMat<T>) -> Result<()> {
        use grove_core::gpu::conv;

        let unsupported = |reason: &str| {
            GroveError::unsupported_configuration(self.layer_type, &self.name, "accelerated", reason)
        };
        if data_kind_of::<T>() != Some(DataKind::F32) {
            return Err(unsupported("accelerated compute requires f32 data"));
        }
        if self.output_dims.len() != 3 {
            return Err(unsupported("accelerated compute requires rank-2 spatial dims"));
        }
        let alpha = self
            .bias_scaling_factor
            .to_f32()
            .ok_or_else(|| GroveError::device("apply_bias", "scale not representable as f32"))?;
        // The bias kernel only reads the output-side geometry, which for a
        // deconvolution layer is the image side of the convolution.
        let geometry = conv::ConvGeometry {
            batch: output.ncols() as u32,
            in_channels: self.output_dims[0] as u32,
            out_channels: self.output_dims[0] as u32,
            in_height: 1,
            in_width: 1,
            out_height: self.output_dims[1] as u32,
            out_width: self.output_dims[2] as u32,
            kernel_height: 1,
            kernel_width: 1,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
            dilation_h: 1,
            dilation_w: 1,
            groups: 1,
            alpha,
            beta: 1.0,
            _pad: [0; 2],
        };
        let bias_data = row_major_f32(bias)?;
        let mut samples = samples_f32(output)?;
        conv::add_bias(&geometry, &bias_data, &mut samples)?;
        store_samples(output, &samples)
    }

    #[cfg(not(feature = "gpu"))]
    fn apply_bias_accelerated(&self, _bias: &LocalMat<T>, _output: &mut LocalMat<T>) -> Result<()> {
        Err(self.no_accelerator())
    }

    fn compute_bias_gradient(
        &mut self,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<()> {
        if self.bias_scaling_factor == T::zero() {
            return Ok(());
        }
        let Some(handle) = self.bias_weights.as_ref() else {
            return Ok(());
        };
        let effective = effective_scale::<T>(context)?;
        let out_channels = self.output_dims[0];
        let spatial: usize = self.output_dims[1..].iter().product();
        let mut weights = write_weights(handle)?;
        let Some(optimizer) = weights.optimizer_mut() else {
            return Ok(());
        };
        let buffer = optimizer.gradient_buffer(true);
        let scale = buffer.gradient_scale / effective;
        if matrix::is_empty(grad_output) {
            // An empty shard still owes the destination scale so the
            // cross-process reduction stays well defined.
            matrix::scale(buffer.dst_scale, buffer.gradient);
            return Ok(());
        }
        for channel in 0..out_channels {
            // Compensated summation: the reduction spans every position and
            // sample of this channel.
            let mut sum = KahanSum::new();
            for sample in 0..grad_output.ncols() {
                let column = grad_output.column(sample);
                for row in channel * spatial..(channel + 1) * spatial {
                    sum.add(column[row]);
                }
            }
            let old = buffer.gradient[[channel, 0]];
            buffer.gradient[[channel, 0]] = buffer.dst_scale * old + scale * sum.value();
        }
        Ok(())
    }

    fn compute_kernel_gradient_unfold(
        &mut self,
        input: &LocalMat<T>,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<()> {
        let effective = effective_scale::<T>(context)?;
        let image_dims = self.conv_image_dims().to_vec();
        let channels = image_dims[0];
        let (col_rows, col_cols) = col_matrix_dims(
            channels,
            &image_dims[1..],
            &self.spec.pads,
            &self.spec.kernel_dims,
            &self.spec.strides,
        );
        // The unfolded side of the kernel-gradient GEMM is the
        // convolution-direction image: the forward input for convolution,
        // the output gradient for deconvolution.
        let (image_mat, gemm_mat) = if self.transposed {
            (grad_output, input)
        } else {
            (input, grad_output)
        };

        let handle = self.kernel_handle()?.clone();
        let mut weights = write_weights(&handle)?;
        let Some(optimizer) = weights.optimizer_mut() else {
            return Ok(());
        };
        let buffer = optimizer.gradient_buffer(true);
        let scale = buffer.gradient_scale / effective;
        matrix::scale(buffer.dst_scale, buffer.gradient);
        if matrix::is_empty(grad_output) {
            return Ok(());
        }

        let n = buffer.gradient.nrows();
        let mut col = Array2::<T>::zeros((col_rows, col_cols));
        for sample in 0..gemm_mat.ncols() {
            let im = sample_slice(image_mat, sample)?;
            im2col(
                im,
                &mut col,
                channels,
                &image_dims[1..],
                &self.spec.pads,
                &self.spec.kernel_dims,
                &self.spec.strides,
            )?;
            let g = column_matrix(gemm_mat, sample, n, col_cols)?;
            general_mat_mul(scale, &g, &col.t(), T::one(), buffer.gradient);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Algorithm memos (accelerated target)
    // ---------------------------------------------------------------------

    /// Looks up or selects the forward algorithm for the given local batch
    /// width. The memo is keyed only by batch width; channel and spatial
    /// geometry are fixed for the life of the layer.
    pub fn forward_algorithm(&mut self, local_width: usize) -> ForwardAlgorithm {
        if let Some(&algorithm) = self.accel.forward_algos.get(&local_width) {
            return algorithm;
        }
        let image_dims = self.conv_image_dims();
        let signal_dims = self.conv_signal_dims();
        let positions: usize = signal_dims[1..].iter().product();
        let window: usize = self.spec.kernel_dims.iter().product();
        let patch = (image_dims[0] / self.spec.groups) * window;
        let mut algorithm = select_forward_algorithm(
            self.accel.deterministic,
            &self.spec.kernel_dims,
            &self.spec.strides,
            &self.spec.dilations,
            self.spec.groups,
            patch,
            local_width,
            positions,
        );
        if algorithm == ForwardAlgorithm::Tiled
            && patch * std::mem::size_of::<f32>() > self.accel.workspace_limit
        {
            log::warn!(
                "{}: tiled staging ({} bytes) exceeds workspace limit ({} bytes), using direct",
                self.name,
                patch * std::mem::size_of::<f32>(),
                self.accel.workspace_limit
            );
            algorithm = ForwardAlgorithm::Direct;
        }
        log::debug!(
            "{}: selected forward algorithm {:?} for batch width {}",
            self.name,
            algorithm,
            local_width
        );
        self.accel.forward_algos.insert(local_width, algorithm);
        algorithm
    }

    pub fn backward_data_algorithm(&mut self, local_width: usize) -> BackwardDataAlgorithm {
        if let Some(&algorithm) = self.accel.backward_data_algos.get(&local_width) {
            return algorithm;
        }
        let algorithm = select_backward_data_algorithm(self.accel.deterministic);
        log::debug!(
            "{}: selected backward-data algorithm {:?} for batch width {}",
            self.name,
            algorithm,
            local_width
        );
        self.accel.backward_data_algos.insert(local_width, algorithm);
        algorithm
    }

    pub fn backward_filter_algorithm(&mut self, local_width: usize) -> BackwardFilterAlgorithm {
        if let Some(&algorithm) = self.accel.backward_filter_algos.get(&local_width) {
            return algorithm;
        }
        let algorithm = select_backward_filter_algorithm(self.accel.deterministic);
        log::debug!(
            "{}: selected backward-filter algorithm {:?} for batch width {}",
            self.name,
            algorithm,
            local_width
        );
        self.accel
            .backward_filter_algos
            .insert(local_width, algorithm);
        algorithm
    }

    #[cfg(test)]
    fn forward_algorithm_cache_len(&self) -> usize {
        self.accel.forward_algos.len()
    }

    // ---------------------------------------------------------------------
    // Accelerated engine
    // ---------------------------------------------------------------------

    #[cfg(feature = "gpu")]
    fn conv_geometry(&self, width: usize, alpha: f32, beta: f32) -> Result<grove_core::gpu::conv::ConvGeometry> {
        use grove_core::gpu::conv::ConvGeometry;

        let unsupported = |reason: &str| {
            GroveError::unsupported_configuration(self.layer_type, &self.name, "accelerated", reason)
        };
        if data_kind_of::<T>() != Some(DataKind::F32) {
            return Err(unsupported("accelerated compute requires f32 data"));
        }
        let image_dims = self.conv_image_dims();
        let signal_dims = self.conv_signal_dims();
        if image_dims.len() != 3 {
            return Err(unsupported("accelerated compute requires rank-2 spatial dims"));
        }
        Ok(ConvGeometry {
            batch: width as u32,
            in_channels: image_dims[0] as u32,
            out_channels: signal_dims[0] as u32,
            in_height: image_dims[1] as u32,
            in_width: image_dims[2] as u32,
            out_height: signal_dims[1] as u32,
            out_width: signal_dims[2] as u32,
            kernel_height: self.spec.kernel_dims[0] as u32,
            kernel_width: self.spec.kernel_dims[1] as u32,
            stride_h: self.spec.strides[0] as u32,
            stride_w: self.spec.strides[1] as u32,
            pad_h: self.spec.pads[0] as u32,
            pad_w: self.spec.pads[1] as u32,
            dilation_h: self.spec.dilations[0] as u32,
            dilation_w: self.spec.dilations[1] as u32,
            groups: self.spec.groups as u32,
            alpha,
            beta,
            _pad: [0; 2],
        })
    }

    #[cfg(feature = "gpu")]
    fn apply_convolution_accelerated(
        &mut self,
        image: &LocalMat<T>,
        signal: &mut LocalMat<T>,
    ) -> Result<()> {
        use grove_core::gpu::conv;

        if matrix::is_empty(image) || matrix::is_empty(signal) {
            return Ok(());
        }
        let width = image.ncols();
        let geometry = self.conv_geometry(width, 1.0, 0.0)?;
        let algorithm = self.forward_algorithm(width);

        let input = samples_f32(image)?;
        let kernel = kernel_f32(self.kernel_handle()?)?;
        let result = conv::convolution_forward(&geometry, &input, &kernel, algorithm)?;
        store_samples(signal, &result)
    }

    #[cfg(feature = "gpu")]
    fn apply_transposed_convolution_accelerated(
        &mut self,
        signal: &LocalMat<T>,
        image: &mut LocalMat<T>,
    ) -> Result<()> {
        use grove_core::gpu::conv;

        if matrix::is_empty(signal) || matrix::is_empty(image) {
            return Ok(());
        }
        let width = signal.ncols();
        let geometry = self.conv_geometry(width, 1.0, 0.0)?;
        let _ = self.backward_data_algorithm(width);

        let kernel = kernel_f32(self.kernel_handle()?)?;
        let grad = samples_f32(signal)?;
        let result = conv::convolution_backward_data(&geometry, &kernel, &grad)?;
        store_samples(image, &result)
    }

    #[cfg(feature = "gpu")]
    fn compute_kernel_gradient_accelerated(
        &mut self,
        input: &LocalMat<T>,
        grad_output: &LocalMat<T>,
        context: &ExecutionContext,
    ) -> Result<()> {
        use grove_core::gpu::conv;

        let effective = effective_scale::<T>(context)?;
        let width = grad_output.ncols();
        let (image_mat, gemm_mat) = if self.transposed {
            (grad_output, input)
        } else {
            (input, grad_output)
        };

        let handle = self.kernel_handle()?.clone();
        let has_local = !matrix::is_empty(grad_output);
        // The geometry must be built before the optimizer borrow below.
        let mut geometry = self.conv_geometry(width.max(1), 0.0, 0.0)?;
        let _ = self.backward_filter_algorithm(width);

        let mut weights = write_weights(&handle)?;
        let Some(optimizer) = weights.optimizer_mut() else {
            return Ok(());
        };
        let buffer = optimizer.gradient_buffer(true);
        let scale = buffer.gradient_scale / effective;
        if !has_local {
            matrix::scale(buffer.dst_scale, buffer.gradient);
            return Ok(());
        }
        geometry.alpha = scale
            .to_f32()
            .ok_or_else(|| GroveError::device("compute_gradients", "scale not representable as f32"))?;
        geometry.beta = buffer
            .dst_scale
            .to_f32()
            .ok_or_else(|| GroveError::device("compute_gradients", "scale not representable as f32"))?;

        let image_data = samples_f32(image_mat)?;
        let gemm_data = samples_f32(gemm_mat)?;
        let mut kernel_grad = row_major_f32(buffer.gradient)?;
        conv::convolution_backward_filter(&geometry, &image_data, &gemm_data, &mut kernel_grad)?;
        store_row_major(buffer.gradient, &kernel_grad)
    }

    #[cfg(not(feature = "gpu"))]
    fn apply_convolution_accelerated(
        &mut self,
        _image: &LocalMat<T>,
        _signal: &mut LocalMat<T>,
    ) -> Result<()> {
        Err(self.no_accelerator())
    }

    #[cfg(not(feature = "gpu"))]
    fn apply_transposed_convolution_accelerated(
        &mut self,
        _signal: &LocalMat<T>,
        _image: &mut LocalMat<T>,
    ) -> Result<()> {
        Err(self.no_accelerator())
    }

    #[cfg(not(feature = "gpu"))]
    fn compute_kernel_gradient_accelerated(
        &mut self,
        _input: &LocalMat<T>,
        _grad_output: &LocalMat<T>,
        _context: &ExecutionContext,
    ) -> Result<()> {
        Err(self.no_accelerator())
    }

    #[cfg(not(feature = "gpu"))]
    fn no_accelerator(&self) -> GroveError {
        GroveError::unsupported_configuration(
            self.layer_type,
            &self.name,
            "accelerated",
            "accelerator support is not compiled in (enable the gpu feature)",
        )
    }
}

fn data_kind_of<T: 'static>() -> Option<DataKind> {
    let id = TypeId::of::<T>();
    if id == TypeId::of::<f32>() {
        Some(DataKind::F32)
    } else if id == TypeId::of::<f64>() {
        Some(DataKind::F64)
    } else {
        None
    }
}

fn effective_scale<T: Float>(context: &ExecutionContext) -> Result<T> {
    let size = context.effective_mini_batch_size().max(1);
    T::from(size).ok_or_else(|| {
        GroveError::invalid_argument(
            "compute_gradients",
            "effective mini-batch size is not representable in the weight type",
        )
    })
}

fn read_weights<T>(handle: &WeightsRef<T>) -> Result<std::sync::RwLockReadGuard<'_, Weights<T>>> {
    handle
        .read()
        .map_err(|_| GroveError::device("weights", "weights lock poisoned"))
}

fn write_weights<T>(handle: &WeightsRef<T>) -> Result<RwLockWriteGuard<'_, Weights<T>>> {
    handle
        .write()
        .map_err(|_| GroveError::device("weights", "weights lock poisoned"))
}

fn sample_slice<T>(mat: &LocalMat<T>, sample: usize) -> Result<&[T]> {
    mat.column(sample)
        .to_slice()
        .ok_or_else(|| GroveError::invalid_argument("sample_slice", "sample column is not contiguous"))
}

fn sample_slice_mut<T>(mat: &mut LocalMat<T>, sample: usize) -> Result<&mut [T]> {
    mat.column_mut(sample)
        .into_slice()
        .ok_or_else(|| GroveError::invalid_argument("sample_slice", "sample column is not contiguous"))
}

/// Flattens a column-major local matrix into contiguous samples.
#[cfg(feature = "gpu")]
fn samples_f32<T: Float>(mat: &LocalMat<T>) -> Result<Vec<f32>> {
    let slice = mat.as_slice_memory_order().ok_or_else(|| {
        GroveError::invalid_argument("samples_f32", "local matrix is not contiguous")
    })?;
    slice
        .iter()
        .map(|v| v.to_f32())
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| GroveError::device("samples_f32", "data not representable as f32"))
}

#[cfg(feature = "gpu")]
fn store_samples<T: Float>(mat: &mut LocalMat<T>, data: &[f32]) -> Result<()> {
    let slice = mat.as_slice_memory_order_mut().ok_or_else(|| {
        GroveError::invalid_argument("store_samples", "local matrix is not contiguous")
    })?;
    if slice.len() != data.len() {
        return Err(GroveError::shape_mismatch(
            "store_samples",
            format!("{} entries", slice.len()),
            format!("{}", data.len()),
        ));
    }
    for (dst, &v) in slice.iter_mut().zip(data) {
        *dst = T::from(v)
            .ok_or_else(|| GroveError::device("store_samples", "data not representable"))?;
    }
    Ok(())
}

/// Flattens the kernel matrix in row-major (logical) order, which is the
/// `[n, c/g, k...]` layout the compute kernels index.
#[cfg(feature = "gpu")]
fn kernel_f32<T: Float>(handle: &WeightsRef<T>) -> Result<Vec<f32>> {
    let weights = read_weights(handle)?;
    weights
        .values()
        .iter()
        .map(|v| v.to_f32())
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| GroveError::device("kernel_f32", "kernel not representable as f32"))
}

#[cfg(feature = "gpu")]
fn row_major_f32<T: Float>(mat: &LocalMat<T>) -> Result<Vec<f32>> {
    mat.iter()
        .map(|v| v.to_f32())
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| GroveError::device("row_major_f32", "data not representable as f32"))
}

#[cfg(feature = "gpu")]
fn store_row_major<T: Float>(mat: &mut LocalMat<T>, data: &[f32]) -> Result<()> {
    for (dst, &v) in mat.iter_mut().zip(data) {
        *dst = T::from(v)
            .ok_or_else(|| GroveError::device("store_row_major", "data not representable"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::ComputeTarget;

    fn spec_2d(out_channels: usize, kernel: usize) -> ConvolutionSpec {
        ConvolutionSpec::simple(out_channels, vec![kernel, kernel], vec![0, 0], false)
    }

    #[test]
    fn validator_rejects_indivisible_groups() {
        let mut spec = spec_2d(6, 3);
        spec.groups = 3;
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec, ComputeTarget::Accelerated);
        let err = layer.setup(vec![8, 16, 16], vec![6, 14, 14]).unwrap_err();
        assert!(err.to_string().contains("not divisible by 3 groups"));
    }

    #[test]
    fn validator_rejects_mismatched_kernel_rank() {
        let spec = ConvolutionSpec::simple(4, vec![3], vec![0, 0], false);
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec, ComputeTarget::Cpu);
        let err = layer.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap_err();
        assert!(err.to_string().contains("spatial axes"));
    }

    #[test]
    fn validator_rejects_zero_stride() {
        let mut spec = spec_2d(4, 3);
        spec.strides = vec![0, 1];
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec, ComputeTarget::Cpu);
        assert!(layer.setup(vec![2, 8, 8], vec![4, 6, 6]).is_err());
    }

    #[test]
    fn cpu_target_rejects_dilation_and_groups() {
        let mut spec = spec_2d(4, 3);
        spec.dilations = vec![2, 2];
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec, ComputeTarget::Cpu);
        let err = layer.setup(vec![2, 8, 8], vec![4, 4, 4]).unwrap_err();
        assert!(err.to_string().contains("dilation"));

        let mut spec = spec_2d(4, 3);
        spec.groups = 2;
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec, ComputeTarget::Cpu);
        let err = layer.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap_err();
        assert!(err.to_string().contains("grouped"));
    }

    #[test]
    fn convolution_spec_deserializes_from_json() {
        let spec: ConvolutionSpec = serde_json::from_str(
            r#"{"out_channels": 8, "kernel_dims": [3, 3], "pads": [1, 1],
                "strides": [1, 1], "dilations": [1, 1], "groups": 2, "bias": true}"#,
        )
        .unwrap();
        assert_eq!(spec.out_channels, 8);
        assert_eq!(spec.groups, 2);
        assert!(spec.bias);
    }

    #[test]
    fn provisioning_forces_weights_to_the_layer_frozen_state() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut registry = WeightRegistry::<f32>::new();
        let mut rng = StdRng::seed_from_u64(0);

        // An externally frozen kernel handed to an unfrozen layer is
        // unfrozen during provisioning.
        let mut shared = Weights::new("shared_kernel");
        shared.freeze();
        let handle = registry.register(shared);
        let mut layer =
            BaseConvolution::<f32>::new("convolution", "conv1", false, spec_2d(4, 3), ComputeTarget::Cpu);
        layer.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap();
        layer.set_kernel_weights(handle.clone());
        layer.setup_data(&mut registry, &mut rng).unwrap();
        assert!(!handle.read().unwrap().is_frozen());

        // A frozen layer freezes the weights it creates.
        let mut frozen_layer =
            BaseConvolution::<f32>::new("convolution", "conv2", false, spec_2d(4, 3), ComputeTarget::Cpu);
        frozen_layer.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap();
        frozen_layer.set_frozen(true);
        frozen_layer.setup_data(&mut registry, &mut rng).unwrap();
        let kernel = frozen_layer.kernel_weights().unwrap();
        assert!(kernel.read().unwrap().is_frozen());
    }

    #[test]
    fn kernel_tensor_dims_swap_channel_axes_when_transposed() {
        let mut conv =
            BaseConvolution::<f32>::new("convolution", "c", false, spec_2d(4, 3), ComputeTarget::Cpu);
        conv.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap();
        assert_eq!(conv.kernel_tensor_dims(), vec![4, 2, 3, 3]);

        let mut deconv =
            BaseConvolution::<f32>::new("deconvolution", "d", true, spec_2d(4, 3), ComputeTarget::Cpu);
        deconv.setup(vec![2, 6, 6], vec![4, 8, 8]).unwrap();
        assert_eq!(deconv.kernel_tensor_dims(), vec![2, 4, 3, 3]);
    }

    #[test]
    fn algorithm_memo_is_keyed_by_batch_width() {
        let mut layer = BaseConvolution::<f32>::new(
            "convolution",
            "conv1",
            false,
            spec_2d(4, 3),
            ComputeTarget::Accelerated,
        );
        layer.setup(vec![2, 34, 34], vec![4, 32, 32]).unwrap();
        let a = layer.forward_algorithm(64);
        let b = layer.forward_algorithm(64);
        assert_eq!(a, b);
        assert_eq!(layer.forward_algorithm_cache_len(), 1);
        let _ = layer.forward_algorithm(3);
        assert_eq!(layer.forward_algorithm_cache_len(), 2);
    }

    #[test]
    fn deterministic_mode_survives_the_memo() {
        let mut layer = BaseConvolution::<f32>::new(
            "convolution",
            "conv1",
            false,
            spec_2d(4, 3),
            ComputeTarget::Accelerated,
        );
        layer.setup(vec![2, 34, 34], vec![4, 32, 32]).unwrap();
        layer.set_deterministic(true);
        assert!(layer.forward_algorithm(64).is_deterministic());
        assert!(layer.backward_data_algorithm(64).is_deterministic());
        assert!(layer.backward_filter_algorithm(64).is_deterministic());
    }

    #[test]
    fn tiny_workspace_limit_forces_direct() {
        let mut layer = BaseConvolution::<f32>::new(
            "convolution",
            "conv1",
            false,
            spec_2d(4, 3),
            ComputeTarget::Accelerated,
        );
        layer.setup(vec![2, 34, 34], vec![4, 32, 32]).unwrap();
        layer.set_workspace_limit(8);
        assert_eq!(layer.forward_algorithm(64), ForwardAlgorithm::Direct);
    }

    #[test]
    fn cloned_layer_has_independent_descriptors() {
        let mut layer = BaseConvolution::<f32>::new(
            "convolution",
            "conv1",
            false,
            spec_2d(4, 3),
            ComputeTarget::Accelerated,
        );
        layer.setup(vec![2, 8, 8], vec![4, 6, 6]).unwrap();
        let copy = layer.clone();
        drop(layer);
        // The copy's descriptors must survive the original's release.
        let desc = copy.accel.kernel_desc.as_ref().unwrap();
        assert_eq!(desc.dims(), &[4, 2, 3, 3]);
        let conv = copy.accel.conv_desc.as_ref().unwrap();
        assert_eq!(conv.groups(), 1);
    }
}
