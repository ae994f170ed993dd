//! Layers with trainable parameters.

pub mod base_convolution;
pub mod convolution;
pub mod deconvolution;

pub use base_convolution::{BaseConvolution, ConvolutionSpec, DEFAULT_WORKSPACE_LIMIT};
pub use convolution::Convolution;
pub use deconvolution::Deconvolution;
