//! Neural-network layers and parameter plumbing for grove.
//!
//! Layers exchange activations and error signals as local (feature x sample)
//! matrices from `grove-core`. Parameters live in shared [`weights::Weights`]
//! handles so several layers can reference the same tensor; gradients flow
//! through the optimizer-owned accumulation buffers in [`optimizers`].

pub mod layers;
pub mod optimizers;
pub mod weights;

pub use grove_core::{GroveError, LocalMat, Result};
pub use layers::ExecutionContext;
pub use weights::{WeightRegistry, Weights, WeightsRef};
