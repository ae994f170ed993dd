//! Error types shared across the grove crates.
//!
//! Setup-time problems are reported as configuration errors that name the
//! offending layer and field. Compute-time failures (device primitives,
//! shape disagreements between collaborating layers) are fatal; there is no
//! retry policy anywhere in the core.

use thiserror::Error;

/// Errors raised by grove components.
#[derive(Error, Debug, Clone)]
pub enum GroveError {
    /// Invalid layer configuration, detected before any compute runs.
    #[error("{layer_type} layer \"{layer}\" has an invalid configuration: {reason}")]
    InvalidConfiguration {
        layer_type: String,
        layer: String,
        reason: String,
    },

    /// Valid configuration that the selected execution target cannot run.
    #[error("{layer_type} layer \"{layer}\" is not supported on the {target} target: {reason}")]
    UnsupportedConfiguration {
        layer_type: String,
        layer: String,
        target: String,
        reason: String,
    },

    /// Tensor shapes do not line up in an operation.
    #[error("shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    /// Bad argument passed to an operation.
    #[error("invalid argument in operation '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    /// Accelerated-device failure. Treated as unrecoverable.
    #[error("device error in operation '{operation}': {details}")]
    Device { operation: String, details: String },

    /// I/O failure while reading data.
    #[error("I/O error in operation '{operation}': {details}")]
    Io { operation: String, details: String },
}

impl GroveError {
    pub fn invalid_configuration(layer_type: &str, layer: &str, reason: impl Into<String>) -> Self {
        GroveError::InvalidConfiguration {
            layer_type: layer_type.to_string(),
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_configuration(
        layer_type: &str,
        layer: &str,
        target: &str,
        reason: impl Into<String>,
    ) -> Self {
        GroveError::UnsupportedConfiguration {
            layer_type: layer_type.to_string(),
            layer: layer.to_string(),
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(operation: &str, expected: impl Into<String>, got: impl Into<String>) -> Self {
        GroveError::ShapeMismatch {
            operation: operation.to_string(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn invalid_argument(operation: &str, reason: impl Into<String>) -> Self {
        GroveError::InvalidArgument {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn device(operation: &str, details: impl Into<String>) -> Self {
        GroveError::Device {
            operation: operation.to_string(),
            details: details.into(),
        }
    }

    pub fn io(operation: &str, details: impl Into<String>) -> Self {
        GroveError::Io {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GroveError>;
