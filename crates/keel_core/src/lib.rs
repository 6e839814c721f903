//! # keel_core
//!
//! Planning and execution engine for keel.
//!
//! Turns an environment spec into a dependency graph and an ordered plan,
//! provisions it through a [`keel_backend::ProvisioningBackend`], tracks
//! every live handle and tears environments down in reverse order.
//!
//! # Architecture
//!
//! ```text
//! EnvironmentSpec ──► DescriptorSet ──► DependencyGraph ──► ProvisioningPlan
//!                          │                                     │
//!                          └──► AccessMatrix ────────────────────┤
//!                                                                ▼
//!                        HandleRegistry ◄── Provisioner ──► RunReport
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_backend::SimulatedBackend;
//! use keel_core::Provisioner;
//! use keel_spec::EnvironmentSpec;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Provisioner::new(Arc::new(SimulatedBackend::new()));
//!     let spec = EnvironmentSpec::isolated("dev-key", "dev");
//!
//!     let report = engine.apply(&spec, &CancellationToken::new()).await?;
//!     println!("{}", report.render());
//!
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod outputs;
pub mod planner;
pub mod report;
pub mod secrets;

pub use engine::{EngineConfig, PreparedRun, Provisioner, RunGuard, RunLocks};
pub use error::{CoreError, CoreResult};
pub use graph::{DeferredRule, DependencyGraph, Edge, EdgeKind};
pub use lifecycle::{teardown_actions, HandleRegistry, StateLock, TeardownAction, TrackedResource};
pub use outputs::{OutputName, OutputProjector, OutputSet};
pub use planner::{PlanStep, Planner, ProvisioningPlan, StepAction};
pub use report::{FailureKind, FailureRecord, Operation, RunReport, StepRecord, StepStatus};
pub use secrets::{generated_ref, Credential, CredentialVault, InMemoryVault};
