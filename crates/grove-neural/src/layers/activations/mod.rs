//! Activation layers.

pub mod softmax;

pub use softmax::Softmax;
