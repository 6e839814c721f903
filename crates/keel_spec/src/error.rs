//! Error types for the spec module.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for spec operations.
pub type SpecResult<T> = Result<T, SpecError>;

/// Errors that can occur while reading, validating or expanding a spec.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Unknown topology mode: {0} (expected 'isolated' or 'egress')")]
    UnknownTopology(String),

    #[error("Environment spec not found at path: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported spec file format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SpecError {
    /// Whether this error means the input itself is unusable, as opposed to
    /// an IO or parsing failure.
    pub fn is_invalid_specification(&self) -> bool {
        matches!(
            self,
            SpecError::InvalidSpecification(_) | SpecError::UnknownTopology(_)
        )
    }
}
