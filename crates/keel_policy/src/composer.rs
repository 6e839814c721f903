//! Security policy composition.
//!
//! Resolves every boundary's declared rules into concrete entries, adds the
//! implied outbound entry where a boundary asks for it, drops redundant
//! entries and finally evaluates the rule set. Blocking findings abort
//! composition; warnings travel with the matrix.

use tracing::{debug, info, warn};

use keel_spec::{
    parse_cidr, DescriptorSet, Direction, Peer, Protocol, ResourceId, ResourceKind, Rule,
};

use crate::error::{PolicyError, PolicyResult};
use crate::matrix::{AccessEntry, AccessMatrix, RuleOrigin};
use crate::rules::RuleSet;

/// Builds the access matrix of an environment.
#[derive(Debug, Clone)]
pub struct PolicyComposer {
    rules: RuleSet,
}

impl Default for PolicyComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyComposer {
    /// Composer with the standard rule set.
    pub fn new() -> Self {
        Self {
            rules: RuleSet::standard(),
        }
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Compose and check the access matrix.
    pub fn compose(&self, set: &DescriptorSet) -> PolicyResult<AccessMatrix> {
        let mut entries = Vec::new();

        for descriptor in set.of_kind(ResourceKind::AccessBoundary) {
            let Some(boundary) = descriptor.as_boundary() else {
                continue;
            };

            let mut resolved = Vec::with_capacity(boundary.rules.len() + 1);
            for (index, rule) in boundary.rules.iter().enumerate() {
                resolved.push(resolve(set, &descriptor.id, index, rule)?);
            }

            if boundary.allow_all_outbound {
                resolved.push(AccessEntry {
                    boundary: descriptor.id.clone(),
                    direction: Direction::Egress,
                    protocol: Protocol::All,
                    port: None,
                    peer: Peer::AnyIpv4,
                    description: "Allow all outbound".to_string(),
                    deferred: false,
                    origin: RuleOrigin {
                        boundary: descriptor.id.clone(),
                        index: None,
                    },
                });
            }

            let before = resolved.len();
            let minimal = minimise(resolved);
            if minimal.len() < before {
                debug!(
                    "Dropped {} redundant rule(s) from {}",
                    before - minimal.len(),
                    descriptor.id
                );
            }
            entries.extend(minimal);
        }

        let findings = self.rules.evaluate(set, &entries);
        let (blocking, warnings): (Vec<_>, Vec<_>) =
            findings.into_iter().partition(|v| v.severity.blocks());

        for warning in &warnings {
            warn!("Policy warning [{}]: {}", warning.rule_id, warning.message);
        }
        if !blocking.is_empty() {
            return Err(PolicyError::Violations(blocking));
        }

        info!(
            "Composed access matrix for {}: {} rule(s), {} warning(s)",
            set.environment,
            entries.len(),
            warnings.len()
        );

        Ok(AccessMatrix {
            environment: set.environment.clone(),
            entries,
            warnings,
        })
    }
}

fn resolve(
    set: &DescriptorSet,
    boundary: &ResourceId,
    index: usize,
    rule: &Rule,
) -> PolicyResult<AccessEntry> {
    let peer = match &rule.peer {
        Peer::AnyIpv4 => Peer::AnyIpv4,
        Peer::Cidr(cidr) => match parse_cidr(cidr) {
            Some(0) => Peer::AnyIpv4,
            Some(_) => Peer::Cidr(cidr.clone()),
            None => {
                return Err(PolicyError::InvalidRule {
                    boundary: boundary.clone(),
                    index,
                    reason: format!("invalid CIDR '{}'", cidr),
                })
            }
        },
        Peer::Boundary(peer) => {
            let is_boundary = set
                .get(peer)
                .is_some_and(|d| d.kind() == ResourceKind::AccessBoundary);
            if !is_boundary {
                return Err(PolicyError::UnknownPeer {
                    boundary: boundary.clone(),
                    index,
                    peer: rule.peer.clone(),
                });
            }
            Peer::Boundary(peer.clone())
        }
    };

    if rule.port == Some(0) {
        return Err(PolicyError::InvalidRule {
            boundary: boundary.clone(),
            index,
            reason: "port 0".to_string(),
        });
    }
    if rule.is_deferred() && peer.boundary().is_none() {
        return Err(PolicyError::InvalidRule {
            boundary: boundary.clone(),
            index,
            reason: "only peer-boundary rules can be deferred".to_string(),
        });
    }

    Ok(AccessEntry {
        boundary: boundary.clone(),
        direction: rule.direction,
        protocol: rule.protocol,
        port: rule.port,
        peer,
        description: rule.description.clone(),
        deferred: rule.is_deferred(),
        origin: RuleOrigin {
            boundary: boundary.clone(),
            index: Some(index),
        },
    })
}

/// Drop duplicates and entries strictly covered by a broader one, keeping
/// declaration order.
fn minimise(entries: Vec<AccessEntry>) -> Vec<AccessEntry> {
    let mut unique: Vec<AccessEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if !unique.iter().any(|kept| kept.same_traffic(&entry)) {
            unique.push(entry);
        }
    }

    let keep: Vec<bool> = unique
        .iter()
        .map(|entry| {
            !unique
                .iter()
                .any(|other| other.covers(entry) && !entry.covers(other))
        })
        .collect();

    unique
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_spec::{build_descriptors, ids, EnvironmentSpec, ResourceSpec};

    fn boundary_mut<'a>(
        set: &'a mut DescriptorSet,
        id: &str,
    ) -> &'a mut keel_spec::AccessBoundary {
        let descriptor = set
            .descriptors
            .iter_mut()
            .find(|d| d.id.as_str() == id)
            .unwrap();
        match &mut descriptor.spec {
            ResourceSpec::AccessBoundary(b) => b,
            _ => panic!("not a boundary"),
        }
    }

    #[test]
    fn test_default_environment_composes() {
        let set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        let matrix = PolicyComposer::new().compose(&set).unwrap();

        let db = ResourceId::new(ids::DB_BOUNDARY);
        let app = ResourceId::new(ids::APP_BOUNDARY);

        let db_entries: Vec<_> = matrix.for_boundary(&db).collect();
        assert_eq!(db_entries.len(), 1);
        assert_eq!(db_entries[0].peer, Peer::Boundary(app.clone()));
        assert!(!db_entries.iter().any(|e| e.direction == Direction::Egress));

        assert_eq!(matrix.for_boundary(&app).count(), 3);
        assert_eq!(matrix.warnings.len(), 1);
        assert_eq!(matrix.warnings[0].rule_id, "open-admin-port");
    }

    #[test]
    fn test_open_range_on_isolated_db_rejected() {
        let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        boundary_mut(&mut set, ids::DB_BOUNDARY)
            .rules
            .push(Rule::ingress_tcp(5432, Peer::Cidr("10.1.0.0/16".into())));

        let err = PolicyComposer::new().compose(&set).unwrap_err();
        let rule_ids: Vec<&str> = err.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert!(rule_ids.contains(&"isolated-ingress-scoped"));
        assert!(rule_ids.contains(&"db-source-restricted"));
    }

    #[test]
    fn test_open_range_on_egress_db_still_restricted() {
        let mut set = build_descriptors(&EnvironmentSpec::egress("k1", "stg")).unwrap();
        boundary_mut(&mut set, ids::DB_BOUNDARY)
            .rules
            .push(Rule::ingress_tcp(5432, Peer::AnyIpv4));

        let err = PolicyComposer::new().compose(&set).unwrap_err();
        let rule_ids: Vec<&str> = err.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(rule_ids, vec!["db-source-restricted"]);
    }

    #[test]
    fn test_isolated_db_outbound_rejected() {
        let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        boundary_mut(&mut set, ids::DB_BOUNDARY).allow_all_outbound = true;

        let err = PolicyComposer::new().compose(&set).unwrap_err();
        assert_eq!(err.violations()[0].rule_id, "isolated-egress-denied");
    }

    #[test]
    fn test_redundant_rules_minimised() {
        let mut set = build_descriptors(&EnvironmentSpec::egress("k1", "stg")).unwrap();
        let app = boundary_mut(&mut set, ids::APP_BOUNDARY);
        app.rules.push(Rule::ingress_tcp(22, Peer::AnyIpv4));
        app.rules.push(Rule::ingress_tcp(22, Peer::Cidr("10.0.0.0/8".into())));

        let matrix = PolicyComposer::new().compose(&set).unwrap();
        let app_id = ResourceId::new(ids::APP_BOUNDARY);
        let ssh: Vec<_> = matrix
            .for_boundary(&app_id)
            .filter(|e| e.port == Some(22))
            .collect();
        assert_eq!(ssh.len(), 1);
        assert_eq!(ssh[0].origin.index, Some(0));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        boundary_mut(&mut set, ids::DB_BOUNDARY)
            .rules
            .push(Rule::ingress_tcp(5432, Peer::Boundary(ResourceId::new(ids::BUCKET))));

        assert!(matches!(
            PolicyComposer::new().compose(&set),
            Err(PolicyError::UnknownPeer { index: 1, .. })
        ));
    }

    #[test]
    fn test_deferred_entries_kept_apart() {
        let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        boundary_mut(&mut set, ids::APP_BOUNDARY).rules.push(
            Rule::ingress_tcp(8080, Peer::Boundary(ResourceId::new(ids::DB_BOUNDARY))).deferred(),
        );

        let matrix = PolicyComposer::new().compose(&set).unwrap();
        let deferred: Vec<_> = matrix.deferred().collect();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].origin.index, Some(2));
        assert_eq!(
            matrix.inline_rules(&ResourceId::new(ids::APP_BOUNDARY)).len(),
            3
        );
    }
}
