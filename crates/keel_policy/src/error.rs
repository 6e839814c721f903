//! Error types for policy module.

use thiserror::Error;

use keel_spec::{Peer, ResourceId};

use crate::rules::RuleViolation;

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors that can occur while composing the access matrix.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Rule {index} of {boundary} references unknown boundary {peer}")]
    UnknownPeer {
        boundary: ResourceId,
        index: usize,
        peer: Peer,
    },

    #[error("Rule {index} of {boundary} is invalid: {reason}")]
    InvalidRule {
        boundary: ResourceId,
        index: usize,
        reason: String,
    },

    #[error("{} policy violation(s): {}", .0.len(), summarize(.0))]
    Violations(Vec<RuleViolation>),

    #[error("Invalid policy configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn summarize(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("[{}] {}", v.rule_id, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PolicyError {
    /// Blocking violations carried by this error, if any.
    pub fn violations(&self) -> &[RuleViolation] {
        match self {
            PolicyError::Violations(v) => v,
            _ => &[],
        }
    }
}
