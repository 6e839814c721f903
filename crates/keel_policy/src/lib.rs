//! # keel_policy
//!
//! Security policy composition for keel.
//!
//! Merges every access boundary's declared rules into one explicit,
//! minimal access matrix and enforces the network rules of the fixed
//! topology:
//!
//! - database boundaries in isolated segments never admit open ranges
//! - the database port is reachable only from compute boundaries
//! - database boundaries have no outbound rules unless declared
//! - members of isolated segments cannot reach `0.0.0.0/0`
//!
//! Open administrative ports are reported as warnings.

pub mod composer;
pub mod error;
pub mod matrix;
pub mod rules;

pub use composer::PolicyComposer;
pub use error::{PolicyError, PolicyResult};
pub use matrix::{AccessEntry, AccessMatrix, RuleOrigin};
pub use rules::{PolicyRule, RuleSet, RuleSeverity, RuleType, RuleViolation};
