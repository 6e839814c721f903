//! Policy rules and rule sets.
//!
//! Rules are evaluated against the minimised access matrix together with the
//! descriptor set, so placement (which segment a boundary's members live in)
//! is known.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_spec::{DescriptorSet, EgressMode, Peer, ResourceId, ResourceKind};

use crate::error::{PolicyError, PolicyResult};
use crate::matrix::AccessEntry;

/// Ports that should never be open to the whole internet.
const ADMIN_PORTS: &[u16] = &[22, 3389];

/// A policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: RuleSeverity,
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Rule severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Error,
    Warning,
    Info,
}

impl RuleSeverity {
    pub fn blocks(&self) -> bool {
        matches!(self, RuleSeverity::Error)
    }
}

/// Types of rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Database boundaries in isolated segments only admit peer boundaries.
    IsolatedIngressScoped,
    /// The database port is only reachable from compute boundaries.
    DatabaseSourceRestricted,
    /// Members of isolated segments may not send arbitrary outbound traffic.
    IsolatedEgressDenied,
    /// Administrative ports open to `0.0.0.0/0`.
    OpenAdminPort,
}

impl RuleType {
    /// Network invariants of the topology, checked whatever the rule set says.
    pub fn is_enforced(&self) -> bool {
        !matches!(self, RuleType::OpenAdminPort)
    }
}

impl PolicyRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        rule_type: RuleType,
        severity: RuleSeverity,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            severity,
            rule_type,
            enabled: true,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_severity(mut self, severity: RuleSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Result of rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub severity: RuleSeverity,
    pub message: String,
    pub boundary: Option<ResourceId>,
    /// Declared rule index on the boundary, when the entry has one.
    pub rule_index: Option<usize>,
}

impl RuleViolation {
    fn for_entry(rule: &PolicyRule, entry: &AccessEntry, message: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            severity: rule.severity,
            message,
            boundary: Some(entry.boundary.clone()),
            rule_index: entry.origin.index,
        }
    }
}

/// A set of policy rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Rules that hold for every rule set. They cannot be disabled,
    /// downgraded or overridden.
    pub fn enforced() -> Vec<PolicyRule> {
        vec![
            PolicyRule::new(
                "isolated-ingress-scoped",
                "Isolated Database Ingress",
                RuleType::IsolatedIngressScoped,
                RuleSeverity::Error,
            )
            .with_description("Database boundaries in isolated segments never accept open-range ingress"),
            PolicyRule::new(
                "db-source-restricted",
                "Database Access From Compute Only",
                RuleType::DatabaseSourceRestricted,
                RuleSeverity::Error,
            )
            .with_description("The database port is reachable only from compute boundaries"),
            PolicyRule::new(
                "isolated-egress-denied",
                "No Arbitrary Egress From Isolated Segments",
                RuleType::IsolatedEgressDenied,
                RuleSeverity::Error,
            )
            .with_description("Resources in isolated segments may not reach 0.0.0.0/0"),
        ]
    }

    /// Create the standard advisory rule set.
    pub fn standard() -> Self {
        let mut rules = Self::new("Standard Network Rules");

        rules.add(
            PolicyRule::new(
                "open-admin-port",
                "Administrative Port Open To Internet",
                RuleType::OpenAdminPort,
                RuleSeverity::Warning,
            )
            .with_description("SSH or RDP reachable from 0.0.0.0/0"),
        );

        rules
    }

    /// Load a rule set from YAML.
    pub fn from_yaml(content: &str) -> PolicyResult<Self> {
        let set: RuleSet = serde_yaml::from_str(content)?;
        let mut ids = BTreeSet::new();
        for rule in &set.rules {
            if rule.rule_type.is_enforced() {
                return Err(PolicyError::InvalidConfiguration(format!(
                    "rule '{}' has type {:?}, which is always enforced and cannot be configured",
                    rule.id, rule.rule_type
                )));
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(PolicyError::InvalidConfiguration(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
        }
        Ok(set)
    }

    /// Add a rule to the set.
    pub fn add(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    pub fn get(&self, id: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Evaluate the enforced rules and every enabled advisory rule against
    /// resolved entries. Configured rules of an enforced type are ignored.
    pub fn evaluate(&self, set: &DescriptorSet, entries: &[AccessEntry]) -> Vec<RuleViolation> {
        let placement = Placement::of(set);
        let mut violations = Vec::new();

        let enforced = Self::enforced();
        let advisory = self
            .rules
            .iter()
            .filter(|r| r.enabled && !r.rule_type.is_enforced());

        for rule in enforced.iter().chain(advisory) {
            let before = violations.len();
            match rule.rule_type {
                RuleType::IsolatedIngressScoped => {
                    for entry in entries.iter().filter(|e| e.is_ingress()) {
                        if placement.isolated_db_boundaries.contains(&entry.boundary)
                            && entry.peer.is_open_range()
                        {
                            violations.push(RuleViolation::for_entry(
                                rule,
                                entry,
                                format!(
                                    "{} guards a database in an isolated segment but admits {}",
                                    entry.boundary, entry.peer
                                ),
                            ));
                        }
                    }
                }
                RuleType::DatabaseSourceRestricted => {
                    for (boundary, port) in &placement.db_ports {
                        for entry in entries.iter().filter(|e| {
                            e.is_ingress() && &e.boundary == boundary && e.covers_port(*port)
                        }) {
                            let allowed = matches!(
                                &entry.peer,
                                Peer::Boundary(peer) if placement.compute_boundaries.contains(peer)
                            );
                            if !allowed {
                                violations.push(RuleViolation::for_entry(
                                    rule,
                                    entry,
                                    format!(
                                        "database port {} on {} is reachable from {}",
                                        port, boundary, entry.peer
                                    ),
                                ));
                            }
                        }
                    }
                }
                RuleType::IsolatedEgressDenied => {
                    for entry in entries.iter().filter(|e| e.is_egress()) {
                        if placement.isolated_boundaries.contains(&entry.boundary)
                            && entry.peer == Peer::AnyIpv4
                        {
                            violations.push(RuleViolation::for_entry(
                                rule,
                                entry,
                                format!(
                                    "{} has members in an isolated segment but allows outbound to {}",
                                    entry.boundary, entry.peer
                                ),
                            ));
                        }
                    }
                }
                RuleType::OpenAdminPort => {
                    for entry in entries.iter().filter(|e| e.is_ingress()) {
                        if entry.peer != Peer::AnyIpv4 {
                            continue;
                        }
                        if let Some(port) = ADMIN_PORTS.iter().find(|p| entry.covers_port(**p)) {
                            violations.push(RuleViolation::for_entry(
                                rule,
                                entry,
                                format!("port {} on {} is open to {}", port, entry.boundary, entry.peer),
                            ));
                        }
                    }
                }
            }
            debug!(
                "Rule {} produced {} finding(s)",
                rule.id,
                violations.len() - before
            );
        }

        violations
    }
}

/// Which boundaries guard what, derived from resource placement.
struct Placement {
    /// Boundaries bound to a database placed in an isolated segment.
    isolated_db_boundaries: BTreeSet<ResourceId>,
    /// Boundaries bound to any resource placed in an isolated segment.
    isolated_boundaries: BTreeSet<ResourceId>,
    /// Database boundary with the database port it guards.
    db_ports: Vec<(ResourceId, u16)>,
    compute_boundaries: BTreeSet<ResourceId>,
}

impl Placement {
    fn of(set: &DescriptorSet) -> Self {
        let mut placement = Placement {
            isolated_db_boundaries: BTreeSet::new(),
            isolated_boundaries: BTreeSet::new(),
            db_ports: Vec::new(),
            compute_boundaries: BTreeSet::new(),
        };

        for descriptor in set.of_kind(ResourceKind::ManagedDatabase) {
            if let Some(db) = descriptor.as_database() {
                placement.db_ports.push((db.boundary.clone(), db.port));
                if set.segment_egress(&db.network, &db.segment) == Some(EgressMode::Isolated) {
                    placement.isolated_db_boundaries.insert(db.boundary.clone());
                    placement.isolated_boundaries.insert(db.boundary.clone());
                }
            }
        }

        for descriptor in set.of_kind(ResourceKind::ComputeInstance) {
            if let Some(instance) = descriptor.as_instance() {
                placement.compute_boundaries.insert(instance.boundary.clone());
                if set.segment_egress(&instance.network, &instance.segment)
                    == Some(EgressMode::Isolated)
                {
                    placement.isolated_boundaries.insert(instance.boundary.clone());
                }
            }
        }

        placement
    }
}
