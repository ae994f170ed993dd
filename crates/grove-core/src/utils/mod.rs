//! Shared utilities.

pub mod arguments;

pub use arguments::{ArgumentError, ArgumentParser};
