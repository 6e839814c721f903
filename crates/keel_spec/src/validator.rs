//! Spec validation utilities.
//!
//! Validation collects every problem instead of stopping at the first one,
//! so a caller sees the full list before any backend call is made.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::environment::EnvironmentSpec;
use crate::error::{SpecError, SpecResult};
use crate::models::{DescriptorSet, EgressMode, ResourceSpec};

/// Validation result with details.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationResult) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Convert into an error carrying every collected message.
    pub fn into_result(self) -> SpecResult<Vec<String>> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(SpecError::InvalidSpecification(self.errors.join("; ")))
        }
    }
}

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,30}[a-z0-9]$|^[a-z]$").expect("valid pattern"))
}

fn cidr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})/(\d{1,2})$").expect("valid pattern")
    })
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").expect("valid pattern"))
}

/// Parse `a.b.c.d/n`, returning the prefix length.
pub fn parse_cidr(cidr: &str) -> Option<u8> {
    let caps = cidr_pattern().captures(cidr)?;
    for i in 1..=4 {
        let octet: u16 = caps[i].parse().ok()?;
        if octet > 255 {
            return None;
        }
    }
    let prefix: u8 = caps[5].parse().ok()?;
    (prefix <= 32).then_some(prefix)
}

/// Validator for environment specs and descriptor sets.
pub struct SpecValidator;

impl SpecValidator {
    /// Validate an environment spec.
    pub fn validate_environment(spec: &EnvironmentSpec) -> ValidationResult {
        let mut result = ValidationResult::new();

        if spec.prefix.is_empty() {
            result.add_error("Naming prefix cannot be empty");
        } else if !prefix_pattern().is_match(&spec.prefix) {
            result.add_error(format!(
                "Naming prefix '{}' must be lowercase alphanumeric or '-', start with a letter and be at most 32 characters",
                spec.prefix
            ));
        }

        if spec.keypair.trim().is_empty() {
            result.add_error("Keypair name cannot be empty");
        }

        if let Err(e) = spec.topology_mode() {
            result.add_error(e.to_string());
        }

        result.merge(Self::validate_network(spec));
        result.merge(Self::validate_database(spec));
        result.merge(Self::validate_compute(spec));

        result
    }

    fn validate_network(spec: &EnvironmentSpec) -> ValidationResult {
        let mut result = ValidationResult::new();
        let network = &spec.network;

        if !(1..=6).contains(&network.az_count) {
            result.add_error(format!(
                "AZ count must be between 1 and 6, got {}",
                network.az_count
            ));
        }

        match parse_cidr(&network.cidr) {
            None => result.add_error(format!("Invalid network CIDR: {}", network.cidr)),
            Some(prefix) if !(16..=28).contains(&prefix) => result.add_error(format!(
                "Network CIDR prefix must be between /16 and /28, got /{}",
                prefix
            )),
            Some(prefix) => {
                if network.subnet_mask <= prefix || network.subnet_mask > 28 {
                    result.add_error(format!(
                        "Subnet mask /{} must be longer than /{} and at most /28",
                        network.subnet_mask, prefix
                    ));
                } else {
                    // Two segments, one subnet per AZ each.
                    let needed = 2u32 * u32::from(network.az_count);
                    let available = 1u32 << u32::from(network.subnet_mask - prefix).min(31);
                    if needed > available {
                        result.add_error(format!(
                            "Network {} cannot hold {} subnets of /{}",
                            network.cidr, needed, network.subnet_mask
                        ));
                    }
                }
            }
        }

        result
    }

    fn validate_database(spec: &EnvironmentSpec) -> ValidationResult {
        let mut result = ValidationResult::new();
        let db = &spec.database;

        if db.allocated_storage_gb < 20 {
            result.add_error(format!(
                "Database storage must be at least 20 GiB, got {}",
                db.allocated_storage_gb
            ));
        }
        if db.port == 0 {
            result.add_error("Database port cannot be 0");
        }
        if !identifier_pattern().is_match(&db.database_name) {
            result.add_error(format!("Invalid database name: '{}'", db.database_name));
        }
        if db.credential_ref.is_none() && db.username.trim().is_empty() {
            result.add_error("Database username cannot be empty when generating credentials");
        }
        if matches!(&db.credential_ref, Some(r) if r.trim().is_empty()) {
            result.add_error("Database credential reference cannot be empty");
        }

        result
    }

    fn validate_compute(spec: &EnvironmentSpec) -> ValidationResult {
        let mut result = ValidationResult::new();
        let compute = &spec.compute;

        if compute.ssh_port == 0 || compute.app_port == 0 {
            result.add_error("Compute ports cannot be 0");
        }
        if compute.ssh_port == compute.app_port {
            result.add_error("SSH and application ports must differ");
        }
        if compute.app_port == spec.database.port {
            result.add_warning("Application port equals the database port");
        }
        if parse_cidr(&compute.ingress_cidr).is_none() {
            result.add_error(format!("Invalid ingress CIDR: {}", compute.ingress_cidr));
        }
        if compute.bootstrap.is_empty() {
            result.add_warning("Compute bootstrap script is empty");
        }
        if compute.image.trim().is_empty() {
            result.add_error("Machine image cannot be empty");
        }

        result
    }

    /// Validate a descriptor set independently of how it was built.
    pub fn validate_descriptors(set: &DescriptorSet) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut seen = HashSet::new();

        for descriptor in set.iter() {
            if !seen.insert(descriptor.id.clone()) {
                result.add_error(format!("Duplicate resource id: {}", descriptor.id));
            }

            match &descriptor.spec {
                ResourceSpec::NetworkSpace(network) => {
                    let mut names = HashSet::new();
                    for segment in &network.segments {
                        if !names.insert(segment.name.as_str()) {
                            result.add_error(format!(
                                "Duplicate segment '{}' in {}",
                                segment.name, descriptor.id
                            ));
                        }
                    }
                    let needs_nat = network
                        .segments
                        .iter()
                        .any(|s| s.egress == EgressMode::NatEgress);
                    if needs_nat && network.nat_gateways == 0 {
                        result.add_error(format!(
                            "{} has a nat-egress segment but no NAT gateways",
                            descriptor.id
                        ));
                    }
                }
                ResourceSpec::ManagedDatabase(db) => {
                    if set.segment_egress(&db.network, &db.segment).is_none() {
                        result.add_error(format!(
                            "{} is placed in unknown segment '{}'",
                            descriptor.id, db.segment
                        ));
                    }
                }
                ResourceSpec::ComputeInstance(instance) => {
                    if instance.keypair.trim().is_empty() {
                        result.add_error(format!("{} has an empty keypair name", descriptor.id));
                    }
                    if set.segment_egress(&instance.network, &instance.segment).is_none() {
                        result.add_error(format!(
                            "{} is placed in unknown segment '{}'",
                            descriptor.id, instance.segment
                        ));
                    }
                }
                _ => {}
            }
        }

        result
    }
}
