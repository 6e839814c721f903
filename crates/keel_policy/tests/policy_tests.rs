//! Integration tests for access matrix composition.

use keel_policy::{PolicyComposer, PolicyError, PolicyRule, RuleSet, RuleSeverity, RuleType};
use keel_spec::{
    build_descriptors, ids, DescriptorSet, EgressMode, EnvironmentSpec, Peer, ResourceId,
    ResourceKind, ResourceSpec, Rule,
};

fn db_boundary_rules(set: &mut DescriptorSet) -> &mut Vec<Rule> {
    let descriptor = set
        .descriptors
        .iter_mut()
        .find(|d| d.id.as_str() == ids::DB_BOUNDARY)
        .unwrap();
    match &mut descriptor.spec {
        ResourceSpec::AccessBoundary(b) => &mut b.rules,
        _ => unreachable!(),
    }
}

/// No isolated-segment database boundary ever ends up with open-range ingress,
/// whatever extra rule is declared on it.
#[test]
fn test_isolation_invariant_holds_post_composition() {
    let peers = vec![
        Peer::AnyIpv4,
        Peer::Cidr("0.0.0.0/0".into()),
        Peer::Cidr("10.0.0.0/8".into()),
        Peer::Cidr("192.168.1.10/32".into()),
        Peer::Boundary(ResourceId::new(ids::APP_BOUNDARY)),
        Peer::Boundary(ResourceId::new(ids::DB_BOUNDARY)),
    ];
    let ports = [Some(22), Some(5432), Some(8080), None];

    for peer in &peers {
        for port in ports {
            let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
            let mut rule = Rule::ingress_tcp(5432, peer.clone());
            rule.port = port;
            db_boundary_rules(&mut set).push(rule);

            let Ok(matrix) = PolicyComposer::new().compose(&set) else {
                continue;
            };

            for db in set.of_kind(ResourceKind::ManagedDatabase) {
                let db = db.as_database().unwrap();
                assert_eq!(
                    set.segment_egress(&db.network, &db.segment),
                    Some(EgressMode::Isolated)
                );
                assert!(
                    !matrix.has_open_ingress(&db.boundary),
                    "open ingress survived for peer {} port {:?}",
                    peer,
                    port
                );
            }
        }
    }
}

/// A self-referencing database rule is still not a compute source.
#[test]
fn test_db_self_reference_rejected() {
    let mut set = build_descriptors(&EnvironmentSpec::egress("k1", "stg")).unwrap();
    db_boundary_rules(&mut set).push(Rule::ingress_tcp(
        5432,
        Peer::Boundary(ResourceId::new(ids::DB_BOUNDARY)),
    ));

    let err = PolicyComposer::new().compose(&set).unwrap_err();
    assert!(matches!(err, PolicyError::Violations(ref v) if v.len() == 1));
    assert!(err.to_string().contains("db-source-restricted"));
}

/// Advisory rules follow the configured severity.
#[test]
fn test_custom_rule_set() {
    let mut rules = RuleSet::standard();
    for rule in &mut rules.rules {
        if rule.id == "open-admin-port" {
            rule.severity = RuleSeverity::Error;
        }
    }

    let set = build_descriptors(&EnvironmentSpec::egress("k1", "stg")).unwrap();
    let err = PolicyComposer::with_rules(rules).compose(&set).unwrap_err();
    assert!(!err.violations().is_empty());
    assert!(err.violations().iter().all(|v| v.rule_id == "open-admin-port"));
}

/// Network invariants hold even when the configured rule set omits,
/// disables or downgrades them.
#[test]
fn test_invariants_hold_for_any_rule_set() {
    let mut relaxed = RuleSet::new("relaxed");
    relaxed.add(
        PolicyRule::new(
            "db-source-restricted",
            "DB source",
            RuleType::DatabaseSourceRestricted,
            RuleSeverity::Info,
        )
        .disabled(),
    );
    relaxed.add(PolicyRule::new(
        "isolated-ingress-scoped",
        "Isolated ingress",
        RuleType::IsolatedIngressScoped,
        RuleSeverity::Warning,
    ));

    for rules in [RuleSet::new("empty"), relaxed] {
        let mut set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        db_boundary_rules(&mut set).push(Rule::ingress_tcp(5432, Peer::AnyIpv4));

        let err = PolicyComposer::with_rules(rules).compose(&set).unwrap_err();
        let rule_ids: Vec<&str> = err.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert!(rule_ids.contains(&"isolated-ingress-scoped"));
        assert!(rule_ids.contains(&"db-source-restricted"));
    }
}

/// The report lists every boundary and warning.
#[test]
fn test_matrix_report() {
    let set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
    let matrix = PolicyComposer::new().compose(&set).unwrap();
    let report = matrix.report();

    assert!(report.contains("Access matrix: dev"));
    assert!(report.contains(ids::APP_BOUNDARY));
    assert!(report.contains(ids::DB_BOUNDARY));
    assert!(report.contains("boundary:app-boundary"));
    assert!(report.contains("open-admin-port"));
}
