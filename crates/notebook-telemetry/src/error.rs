//! Error types for configuration, propagation and child invocation.

use std::time::Duration;

/// Errors raised while validating or resolving telemetry configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{0} must be defined")]
    MissingField(&'static str),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Errors raised while decoding a carrier or one of its fields.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PropagationError {
    #[error("carrier is not a JSON object of strings: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("carrier has no {0} entry")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors reported by a child-invocation primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    #[error("notebook {path} did not finish within {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    #[error("notebook {0} not found")]
    NotFound(String),

    #[error("notebook {path} failed: {message}")]
    Failed { path: String, message: String },
}

/// Errors surfaced by the export path of the relay.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("parameter {0} is reserved for trace context propagation")]
    ReservedParameter(&'static str),

    #[error("failed to encode trace context carrier: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl RelayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Run(RunError::Timeout { .. }))
    }
}
