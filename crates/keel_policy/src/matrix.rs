//! The composed access matrix.

use serde::{Deserialize, Serialize};

use keel_spec::{Attachment, Direction, Peer, Protocol, ResourceId, Rule};

use crate::rules::{RuleSeverity, RuleViolation};

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleOrigin {
    pub boundary: ResourceId,
    /// Index into the boundary's declared rules; `None` for implied entries
    /// such as allow-all outbound.
    pub index: Option<usize>,
}

/// One resolved allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub boundary: ResourceId,
    pub direction: Direction,
    pub protocol: Protocol,
    /// `None` means every port.
    pub port: Option<u16>,
    pub peer: Peer,
    pub description: String,
    /// Attached in its own step after both boundaries exist.
    pub deferred: bool,
    pub origin: RuleOrigin,
}

impl AccessEntry {
    pub fn is_ingress(&self) -> bool {
        self.direction == Direction::Ingress
    }

    pub fn is_egress(&self) -> bool {
        self.direction == Direction::Egress
    }

    /// Whether traffic on `port` matches this entry.
    pub fn covers_port(&self, port: u16) -> bool {
        self.port.map_or(true, |p| p == port)
    }

    /// Whether `other` admits nothing this entry does not already admit.
    pub fn covers(&self, other: &AccessEntry) -> bool {
        if self.boundary != other.boundary
            || self.direction != other.direction
            || self.deferred != other.deferred
        {
            return false;
        }
        let protocol = self.protocol == Protocol::All || self.protocol == other.protocol;
        let port = match (self.port, other.port) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        let peer = self.peer == other.peer
            || (self.peer == Peer::AnyIpv4 && matches!(other.peer, Peer::Cidr(_)));
        protocol && port && peer
    }

    /// Same traffic, ignoring description and origin.
    pub fn same_traffic(&self, other: &AccessEntry) -> bool {
        self.boundary == other.boundary
            && self.direction == other.direction
            && self.protocol == other.protocol
            && self.port == other.port
            && self.peer == other.peer
            && self.deferred == other.deferred
    }

    /// The backend-facing rule for this entry.
    pub fn to_rule(&self) -> Rule {
        Rule {
            direction: self.direction,
            protocol: self.protocol,
            port: self.port,
            peer: self.peer.clone(),
            attachment: if self.deferred {
                Attachment::Deferred
            } else {
                Attachment::Inline
            },
            description: self.description.clone(),
        }
    }
}

fn port_label(port: Option<u16>) -> String {
    port.map_or_else(|| "all".to_string(), |p| p.to_string())
}

/// The final, auditable set of access rules of one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessMatrix {
    pub environment: String,
    pub entries: Vec<AccessEntry>,
    /// Non-blocking findings.
    pub warnings: Vec<RuleViolation>,
}

impl AccessMatrix {
    pub fn for_boundary<'a>(
        &'a self,
        boundary: &'a ResourceId,
    ) -> impl Iterator<Item = &'a AccessEntry> + 'a {
        self.entries.iter().filter(move |e| &e.boundary == boundary)
    }

    /// Rules to attach when the boundary itself is created.
    pub fn inline_rules(&self, boundary: &ResourceId) -> Vec<Rule> {
        self.for_boundary(boundary)
            .filter(|e| !e.deferred)
            .map(AccessEntry::to_rule)
            .collect()
    }

    pub fn deferred(&self) -> impl Iterator<Item = &AccessEntry> {
        self.entries.iter().filter(|e| e.deferred)
    }

    /// The resolved entry for a declared rule, if it survived minimisation.
    pub fn entry_for_rule<'a>(
        &'a self,
        boundary: &'a ResourceId,
        index: usize,
    ) -> Option<&'a AccessEntry> {
        self.for_boundary(boundary)
            .find(|e| e.origin.index == Some(index))
    }

    pub fn has_open_ingress(&self, boundary: &ResourceId) -> bool {
        self.for_boundary(boundary)
            .any(|e| e.is_ingress() && e.peer.is_open_range())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generate a human-readable report.
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str(&format!("Access matrix: {}\n\n", self.environment));

        let mut current: Option<&ResourceId> = None;
        for entry in &self.entries {
            if current != Some(&entry.boundary) {
                report.push_str(&format!("{}\n", entry.boundary));
                current = Some(&entry.boundary);
            }
            let arrow = match entry.direction {
                Direction::Ingress => "<-",
                Direction::Egress => "->",
            };
            report.push_str(&format!(
                "  {} {:?}/{} {}{}{}\n",
                arrow,
                entry.protocol,
                port_label(entry.port),
                entry.peer,
                if entry.deferred { " (deferred)" } else { "" },
                if entry.description.is_empty() {
                    String::new()
                } else {
                    format!("  # {}", entry.description)
                }
            ));
        }

        if !self.warnings.is_empty() {
            report.push_str("\nWarnings:\n");
            for warning in &self.warnings {
                let marker = match warning.severity {
                    RuleSeverity::Error => "❌",
                    RuleSeverity::Warning => "⚠️",
                    RuleSeverity::Info => "ℹ️",
                };
                report.push_str(&format!("  {} {}: {}\n", marker, warning.rule_id, warning.message));
            }
        }

        report.push_str(&format!("\nSummary: {} rule(s)", self.entries.len()));
        report
    }
}
