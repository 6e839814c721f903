//! # keel_spec
//!
//! Environment specification and resource descriptor model for keel.
//!
//! An [`EnvironmentSpec`] is the only input of a provisioning run. It is
//! validated up front and expanded into an immutable [`DescriptorSet`]: one
//! descriptor per logical resource of the fixed topology (network space, two
//! access boundaries, object store, managed database, identity role and
//! compute instance).
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel_spec::{build_descriptors, EnvironmentSpec, SpecReader};
//!
//! let spec = SpecReader::read_environment("envs/dev.yaml").unwrap();
//! let descriptors = build_descriptors(&spec).unwrap();
//!
//! for descriptor in descriptors.iter() {
//!     println!("{} ({})", descriptor.id, descriptor.kind());
//! }
//!
//! // Or build a spec directly
//! let spec = EnvironmentSpec::isolated("dev-key", "dev");
//! assert!(build_descriptors(&spec).is_ok());
//! ```

pub mod descriptors;
pub mod environment;
pub mod error;
pub mod models;
pub mod reader;
pub mod validator;

pub use descriptors::{build_descriptors, ids, PRIVATE_SEGMENT, PUBLIC_SEGMENT};
pub use environment::{
    ComputeSettings, DatabaseSettings, EnvironmentSpec, NetworkSettings, StorageSettings,
    TopologyMode,
};
pub use error::{SpecError, SpecResult};
pub use models::*;
pub use reader::SpecReader;
pub use validator::{parse_cidr, SpecValidator, ValidationResult};
