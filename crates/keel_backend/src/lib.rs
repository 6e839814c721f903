//! # keel_backend
//!
//! The provisioning backend seam of keel.
//!
//! The engine never talks to a cloud API directly. It hands
//! [`ProvisionRequest`]s to a [`ProvisioningBackend`] and records the
//! [`LiveHandle`]s that come back. Every call is bounded by a timeout and
//! retried with exponential backoff when the failure is transient.
//!
//! # Features
//!
//! - **Backend trait**: `create`, `delete`, `describe` and out-of-band `confirm`
//! - **Error classification**: retryable vs permanent failures
//! - **Retry**: bounded exponential backoff (backon) and per-call timeouts
//! - **Simulated backend**: in-memory resources with scripted faults, for tests and dry runs
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_backend::{ProvisionRequest, ProvisioningBackend, SimulatedBackend};
//! use keel_spec::{build_descriptors, EnvironmentSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let set = build_descriptors(&EnvironmentSpec::isolated("dev-key", "dev"))?;
//!     let backend = SimulatedBackend::new();
//!
//!     let network = set.iter().next().unwrap().clone();
//!     let handle = backend
//!         .create(&ProvisionRequest::for_resource("dev", network))
//!         .await?;
//!     println!("created {}", handle.provider_id);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod retry;
pub mod simulated;

pub use backend::{
    attrs, CreationStatus, LiveHandle, ProvisionRequest, ProvisionTarget, ProvisioningBackend,
    Purge, TargetKind,
};
pub use config::{BackendConfig, RetryConfig};
pub use error::{BackendError, BackendResult};
pub use retry::{retry_with_backoff, with_timeout, RetryOutcome};
pub use simulated::{CapturedCall, SimulatedBackend, SimulatedFault};
