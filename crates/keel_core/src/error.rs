//! Error types for the core module.

use thiserror::Error;

use keel_spec::{ResourceId, SecretRef};

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

fn render_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors that can occur during planning and provisioning.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Cyclic dependency: {}", render_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ResourceId> },

    #[error("Creation of {resource} failed: {message}")]
    ResourceCreationFailed { resource: ResourceId, message: String },

    #[error("Backend unavailable for {resource} after {attempts} attempt(s): {message}")]
    BackendUnavailable {
        resource: ResourceId,
        attempts: u32,
        message: String,
    },

    #[error("State of {resource} is indeterminate, manual reconciliation required: {message}")]
    IndeterminateState { resource: ResourceId, message: String },

    #[error("Output {name} unresolved: {resource} {reason}")]
    UnresolvedOutput {
        name: String,
        resource: ResourceId,
        reason: String,
    },

    #[error("{resource} was created as {provider_id} but could not be tracked: {message}")]
    UntrackedResource {
        resource: ResourceId,
        provider_id: String,
        message: String,
    },

    #[error("Teardown of {resource} failed: {message}")]
    TeardownFailed { resource: ResourceId, message: String },

    #[error("Another run is already active for environment {0}")]
    EnvironmentBusy(String),

    #[error("Run cancelled before {0}")]
    Cancelled(ResourceId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(SecretRef),

    #[error("{role} may not read {secret}")]
    AccessDenied { role: ResourceId, secret: SecretRef },

    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Spec error: {0}")]
    Spec(#[from] keel_spec::SpecError),

    #[error("Policy error: {0}")]
    Policy(#[from] keel_policy::PolicyError),

    #[error("Backend error: {0}")]
    Backend(#[from] keel_backend::BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Errors raised before any backend call is made.
    pub fn is_pre_execution(&self) -> bool {
        match self {
            CoreError::InvalidSpecification(_)
            | CoreError::CyclicDependency { .. }
            | CoreError::Policy(_)
            | CoreError::EnvironmentBusy(_) => true,
            CoreError::Spec(e) => e.is_invalid_specification(),
            _ => false,
        }
    }

    /// Errors that leave live state which must be reconciled by hand.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self,
            CoreError::IndeterminateState { .. } | CoreError::UntrackedResource { .. }
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
