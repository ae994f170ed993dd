//! Core numerics for the grove training toolkit.
//!
//! This crate holds the pieces the layer library builds on: the local
//! (feature x sample) matrix conventions, the unfold/fold kernels behind the
//! CPU convolution path, compensated summation, the accelerated-execution
//! descriptor and algorithm-selection machinery, and the command-line
//! argument utility. GPU kernel dispatch is compiled behind the `gpu`
//! feature.

pub mod accel;
pub mod error;
pub mod im2col;
pub mod math;
pub mod matrix;
pub mod utils;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use error::{GroveError, Result};
pub use matrix::LocalMat;

/// Execution targets a layer can be constructed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeTarget {
    /// Host execution through the unfold/GEMM engine.
    Cpu,
    /// Device execution through the native convolution primitives.
    Accelerated,
}

impl std::fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeTarget::Cpu => write!(f, "cpu"),
            ComputeTarget::Accelerated => write!(f, "accelerated"),
        }
    }
}
