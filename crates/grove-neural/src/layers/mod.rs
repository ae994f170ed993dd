//! Layer implementations.
//!
//! Every layer moves data as local (feature x sample) matrices. The forward
//! input, forward output, gradient-wrt-output and gradient-wrt-input of one
//! step are all matrices of this shape; a layer never sees more than its own
//! process's shard of the mini-batch.

pub mod activations;
pub mod learning;
pub mod misc;

pub use activations::Softmax;
pub use learning::{BaseConvolution, Convolution, ConvolutionSpec, Deconvolution};
pub use misc::{Argmax, Argmin, OneHot};

/// Per-step facts a layer needs from the surrounding execution engine.
///
/// The effective mini-batch size is the global, cross-process sample count
/// of the step, used to average gradients. It is independent of how many
/// samples landed on this process.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    effective_mini_batch_size: usize,
}

impl ExecutionContext {
    pub fn new(effective_mini_batch_size: usize) -> Self {
        Self {
            effective_mini_batch_size,
        }
    }

    pub fn effective_mini_batch_size(&self) -> usize {
        self.effective_mini_batch_size
    }
}
