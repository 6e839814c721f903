//! Integration tests for the provisioning engine.
//!
//! Most scenarios run against the simulated backend with millisecond retry
//! delays; strict call expectations use a mockall backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use tokio_util::sync::CancellationToken;

use keel_backend::{
    BackendConfig, BackendError, BackendResult, CreationStatus, LiveHandle, ProvisionRequest,
    ProvisioningBackend, Purge, RetryConfig, SimulatedBackend, SimulatedFault,
};
use keel_core::{
    generated_ref, Credential, CoreError, CredentialVault, EngineConfig, FailureKind,
    HandleRegistry, InMemoryVault, OutputName, OutputProjector, Provisioner, RunLocks, RunReport,
    StepStatus,
};
use keel_policy::{PolicyComposer, RuleSet, RuleSeverity};
use keel_spec::{ids, EnvironmentSpec, RemovalPolicy, ResourceId};

mock! {
    pub Backend {}

    #[async_trait]
    impl ProvisioningBackend for Backend {
        async fn create(&self, request: &ProvisionRequest) -> BackendResult<LiveHandle>;
        async fn delete(&self, handle: &LiveHandle, purge: Purge) -> BackendResult<()>;
        async fn describe(&self, handle: &LiveHandle) -> BackendResult<BTreeMap<String, String>>;
        async fn confirm(&self, request: &ProvisionRequest) -> BackendResult<CreationStatus>;
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default().with_backend(
        BackendConfig::default()
            .timeout_ms(20)
            .retry(RetryConfig::default().attempts(3).delays(1, 5)),
    )
}

fn engine(backend: &SimulatedBackend) -> Provisioner {
    Provisioner::new(Arc::new(backend.clone()))
        .with_config(fast_config())
        .with_locks(RunLocks::new())
}

fn status(report: &RunReport, id: &str) -> StepStatus {
    report.step(&ResourceId::new(id)).unwrap().status
}

async fn apply(engine: &Provisioner, spec: &EnvironmentSpec, registry: &mut HandleRegistry) -> RunReport {
    engine
        .apply_with_registry(spec, registry, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_isolated_apply_publishes_outputs() {
    let backend = SimulatedBackend::new();
    let engine = engine(&backend);
    let spec = EnvironmentSpec::isolated("dev-key", "dev");
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &spec, &mut registry).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(report.completed_steps().len(), 7);
    assert_eq!(
        backend.created_order(),
        [
            ids::NETWORK,
            ids::APP_BOUNDARY,
            ids::DB_BOUNDARY,
            ids::BUCKET,
            ids::DATABASE,
            ids::INSTANCE_ROLE,
            ids::INSTANCE,
        ]
        .iter()
        .map(|id| ResourceId::new(*id))
        .collect::<Vec<_>>()
    );

    assert_eq!(report.outputs.get(OutputName::BucketName), Some("dev-bucket"));
    assert_eq!(
        report.outputs.get(OutputName::DatabaseEndpoint),
        Some("dev-db.dev.db.keel.internal")
    );
    assert_eq!(report.outputs.get(OutputName::DatabasePort), Some("5432"));
    assert!(report
        .outputs
        .get(OutputName::InstancePublicIp)
        .is_some_and(|ip| ip.starts_with("203.0.113.")));
}

#[tokio::test]
async fn test_db_boundary_receives_only_scoped_rules() {
    let backend = SimulatedBackend::new();
    let engine = engine(&backend);
    let spec = EnvironmentSpec::isolated("dev-key", "dev");

    let prepared = engine.prepare(&spec).unwrap();
    let db_step = prepared.plan.step(&ids::DB_BOUNDARY.into()).unwrap();
    assert_eq!(db_step.access.len(), 1);
    assert!(db_step.access.iter().all(|rule| !rule.peer.is_open_range()));
}

#[tokio::test]
async fn test_timeouts_exhaust_retry_budget() {
    let backend = SimulatedBackend::new().delay_create(ids::DATABASE, Duration::from_secs(1));
    let engine = engine(&backend);
    let spec = EnvironmentSpec::isolated("dev-key", "dev");
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &spec, &mut registry).await;

    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::BackendUnavailable);
    assert_eq!(failure.step.as_str(), ids::DATABASE);
    assert_eq!(failure.attempts, 3);

    let completed: Vec<&str> = report.completed_steps().iter().map(|id| id.as_str()).collect();
    assert_eq!(
        completed,
        vec![ids::NETWORK, ids::APP_BOUNDARY, ids::DB_BOUNDARY, ids::BUCKET]
    );
    assert_eq!(status(&report, ids::INSTANCE_ROLE), StepStatus::NotStarted);
    assert_eq!(status(&report, ids::INSTANCE), StepStatus::NotStarted);

    assert_eq!(backend.get_method_calls("confirm").len(), 3);
    assert_eq!(backend.live_count(), 4);
    assert_eq!(registry.live_count(), 4);
    assert!(report.outputs.is_empty());

    // Whatever was created can still be torn down.
    let teardown = engine
        .destroy_with_registry(&spec, &mut registry, &CancellationToken::new())
        .await
        .unwrap();
    assert!(teardown.succeeded(), "{}", teardown.render());
    assert_eq!(backend.live_count(), 0);
    assert_eq!(status(&teardown, ids::INSTANCE), StepStatus::Skipped);
    assert_eq!(status(&teardown, ids::DATABASE), StepStatus::Skipped);
    assert_eq!(status(&teardown, ids::NETWORK), StepStatus::Completed);
}

#[tokio::test]
async fn test_accepted_timeout_is_indeterminate() {
    let backend = SimulatedBackend::new()
        .delay_create(ids::DATABASE, Duration::from_secs(1))
        .confirm_accepted(ids::DATABASE);
    let engine = engine(&backend);
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &EnvironmentSpec::isolated("dev-key", "dev"), &mut registry).await;

    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::IndeterminateState);
    assert_eq!(failure.attempts, 1);
    assert!(report.to_error().is_some_and(|e| e.requires_reconciliation()));

    let database_creates = backend
        .get_method_calls("create")
        .into_iter()
        .filter(|c| c.resource.as_str() == ids::DATABASE)
        .count();
    assert_eq!(database_creates, 1);

    // The database may exist, so its credential stays in the vault.
    assert!(engine
        .vault()
        .contains(&generated_ref("dev", &ids::DATABASE.into())));
}

#[tokio::test]
async fn test_throttling_absorbed_by_retry() {
    let backend = SimulatedBackend::new().fail_create(ids::BUCKET, SimulatedFault::Throttled, 2);
    let engine = engine(&backend);
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &EnvironmentSpec::egress("dev-key", "stg"), &mut registry).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(report.step(&ids::BUCKET.into()).unwrap().attempts, 3);
}

#[tokio::test]
async fn test_permanent_rejection_stops_without_retry() {
    let mut backend = MockBackend::new();
    backend.expect_create().times(4).returning(|request| {
        if request.id.as_str() == ids::BUCKET {
            Err(BackendError::Rejected("bucket name taken".into()))
        } else {
            Ok(LiveHandle::new(
                request.id.clone(),
                request.kind(),
                format!("p-{}", request.id),
            ))
        }
    });
    backend.expect_confirm().never();
    backend.expect_describe().never();

    let engine = Provisioner::new(Arc::new(backend))
        .with_config(fast_config())
        .with_locks(RunLocks::new());
    let mut registry = HandleRegistry::new("dev");
    let report = apply(&engine, &EnvironmentSpec::isolated("dev-key", "dev"), &mut registry).await;

    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::ResourceCreationFailed);
    assert_eq!(failure.step.as_str(), ids::BUCKET);
    assert_eq!(failure.attempts, 1);
    assert!(failure.message.contains("bucket name taken"));
    assert_eq!(status(&report, ids::DATABASE), StepStatus::NotStarted);
    assert_eq!(registry.live_count(), 3);
}

#[tokio::test]
async fn test_late_attribute_resolved_by_describe() {
    let backend = SimulatedBackend::new().late_attribute(keel_backend::attrs::PUBLIC_IP);
    let engine = engine(&backend);
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &EnvironmentSpec::isolated("dev-key", "dev"), &mut registry).await;

    assert!(report.succeeded(), "{}", report.render());
    assert!(report.outputs.get(OutputName::InstancePublicIp).is_some());
    let describes = backend.get_method_calls("describe");
    assert_eq!(describes.len(), 1);
    assert_eq!(describes[0].resource.as_str(), ids::INSTANCE);
}

#[tokio::test]
async fn test_policy_violation_rejected_before_any_call() {
    let backend = SimulatedBackend::new();
    let mut rules = RuleSet::standard();
    for rule in &mut rules.rules {
        if rule.id == "open-admin-port" {
            rule.severity = RuleSeverity::Error;
        }
    }
    let engine = engine(&backend).with_composer(PolicyComposer::with_rules(rules));
    let mut registry = HandleRegistry::new("dev");

    let err = engine
        .apply_with_registry(
            &EnvironmentSpec::isolated("dev-key", "dev"),
            &mut registry,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Policy(_)));
    assert!(err.is_pre_execution());
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_invalid_spec_rejected_before_any_call() {
    let backend = SimulatedBackend::new();
    let engine = engine(&backend);
    let mut registry = HandleRegistry::new("dev");

    let err = engine
        .apply_with_registry(
            &EnvironmentSpec::new("hybrid", "", "dev"),
            &mut registry,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_pre_execution());
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_supplied_credential_must_exist() {
    let backend = SimulatedBackend::new();
    let mut spec = EnvironmentSpec::isolated("dev-key", "dev");
    spec.database.credential_ref = Some("secret://shared/db".to_string());

    let err = engine(&backend)
        .apply_with_registry(&spec, &mut HandleRegistry::new("dev"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidSpecification(_)));
    assert_eq!(backend.call_count(), 0);

    let vault = InMemoryVault::new().with_secret(
        "secret://shared/db",
        Credential {
            username: "app".to_string(),
            password: "s3cr3t".to_string(),
        },
    );
    let engine = engine(&backend).with_vault(Arc::new(vault.clone()));
    let mut registry = HandleRegistry::new("dev");
    let report = apply(&engine, &spec, &mut registry).await;
    assert!(report.succeeded(), "{}", report.render());

    let credential = engine
        .read_credential(&registry, &ids::DATABASE.into(), &ids::INSTANCE_ROLE.into())
        .unwrap();
    assert_eq!(credential.username, "app");
    assert_eq!(vault.len(), 1);
}

#[tokio::test]
async fn test_concurrent_run_rejected() {
    let backend = SimulatedBackend::new();
    let locks = RunLocks::new();
    let engine = engine(&backend).with_locks(locks.clone());
    let _held = locks.acquire("dev").unwrap();

    let err = engine
        .apply_with_registry(
            &EnvironmentSpec::isolated("dev-key", "dev"),
            &mut HandleRegistry::new("dev"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EnvironmentBusy(env) if env == "dev"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_retained_database_keeps_dependencies() {
    let backend = SimulatedBackend::new();
    let engine = engine(&backend);
    let mut spec = EnvironmentSpec::isolated("dev-key", "dev");
    spec.database.removal = RemovalPolicy::Retain;
    let mut registry = HandleRegistry::new("dev");

    assert!(apply(&engine, &spec, &mut registry).await.succeeded());
    let teardown = engine
        .destroy_with_registry(&spec, &mut registry, &CancellationToken::new())
        .await
        .unwrap();

    assert!(teardown.succeeded(), "{}", teardown.render());
    for id in [ids::DATABASE, ids::DB_BOUNDARY, ids::APP_BOUNDARY, ids::NETWORK] {
        assert_eq!(status(&teardown, id), StepStatus::Retained, "{}", id);
        assert!(backend.is_live(&id.into()), "{}", id);
    }
    for id in [ids::INSTANCE, ids::INSTANCE_ROLE, ids::BUCKET] {
        assert_eq!(status(&teardown, id), StepStatus::Completed, "{}", id);
    }
    assert_eq!(backend.live_count(), 4);
    assert_eq!(registry.live_count(), 0);
}

#[tokio::test]
async fn test_teardown_purges_data() {
    let backend = SimulatedBackend::new();
    let engine = engine(&backend);
    let spec = EnvironmentSpec::isolated("dev-key", "dev");
    let mut registry = HandleRegistry::new("dev");

    assert!(apply(&engine, &spec, &mut registry).await.succeeded());
    engine
        .destroy_with_registry(&spec, &mut registry, &CancellationToken::new())
        .await
        .unwrap();

    let deletes = backend.get_method_calls("delete");
    let order: Vec<&str> = deletes.iter().map(|c| c.resource.as_str()).collect();
    assert_eq!(
        order,
        vec![
            ids::INSTANCE,
            ids::INSTANCE_ROLE,
            ids::DATABASE,
            ids::BUCKET,
            ids::DB_BOUNDARY,
            ids::APP_BOUNDARY,
            ids::NETWORK,
        ]
    );
    let database = deletes.iter().find(|c| c.resource.as_str() == ids::DATABASE).unwrap();
    assert_eq!(
        database.purge,
        Some(Purge {
            data: true,
            disable_backups: true,
            delete_automated_backups: true,
        })
    );
}

#[tokio::test]
async fn test_delete_retried_on_dependency_violation() {
    let backend =
        SimulatedBackend::new().fail_delete(ids::NETWORK, SimulatedFault::DependencyViolation, 1);
    let engine = engine(&backend);
    let spec = EnvironmentSpec::egress("dev-key", "stg");
    let mut registry = HandleRegistry::new("stg");

    assert!(apply(&engine, &spec, &mut registry).await.succeeded());
    let teardown = engine
        .destroy_with_registry(&spec, &mut registry, &CancellationToken::new())
        .await
        .unwrap();

    assert!(teardown.succeeded(), "{}", teardown.render());
    assert_eq!(teardown.step(&ids::NETWORK.into()).unwrap().attempts, 2);
    assert_eq!(backend.live_count(), 0);
}

#[tokio::test]
async fn test_reapply_resumes_after_failure() {
    let backend = SimulatedBackend::new().fail_create(
        ids::DATABASE,
        SimulatedFault::Rejected("quota".into()),
        1,
    );
    let engine = engine(&backend);
    let spec = EnvironmentSpec::isolated("dev-key", "dev");
    let mut registry = HandleRegistry::new("dev");

    let first = apply(&engine, &spec, &mut registry).await;
    assert_eq!(first.failed_step().map(|id| id.as_str()), Some(ids::DATABASE));

    let second = apply(&engine, &spec, &mut registry).await;
    assert!(second.succeeded(), "{}", second.render());
    assert_eq!(registry.live_count(), 7);
    assert_eq!(backend.live_count(), 7);

    let network_creates = backend
        .created_order()
        .into_iter()
        .filter(|id| id.as_str() == ids::NETWORK)
        .count();
    assert_eq!(network_creates, 1);
}

#[tokio::test]
async fn test_concurrent_waves() {
    let backend = SimulatedBackend::new();
    let engine = Provisioner::new(Arc::new(backend.clone()))
        .with_config(fast_config().concurrent(true))
        .with_locks(RunLocks::new());
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &EnvironmentSpec::isolated("dev-key", "dev"), &mut registry).await;

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(backend.live_count(), 7);
    let created = backend.created_order();
    let position = |id: &str| created.iter().position(|c| c.as_str() == id).unwrap();
    assert!(position(ids::NETWORK) < position(ids::APP_BOUNDARY));
    assert!(position(ids::DATABASE) < position(ids::INSTANCE_ROLE));
    assert!(position(ids::INSTANCE_ROLE) < position(ids::INSTANCE));
}

#[tokio::test]
async fn test_file_backed_state_survives_engine() {
    let dir = tempfile::tempdir().unwrap();
    let backend = SimulatedBackend::new();
    let config = fast_config().with_state_dir(dir.path());
    let spec = EnvironmentSpec::isolated("dev-key", "dev");

    let first = Provisioner::new(Arc::new(backend.clone()))
        .with_config(config.clone())
        .with_locks(RunLocks::new());
    let report = first.apply(&spec, &CancellationToken::new()).await.unwrap();
    assert!(report.succeeded());
    assert!(dir.path().join("dev.state.json").exists());
    assert!(RunReport::report_path(dir.path(), &report.run_id).exists());

    let second = Provisioner::new(Arc::new(backend.clone()))
        .with_config(config)
        .with_locks(RunLocks::new());
    let teardown = second.destroy(&spec, &CancellationToken::new()).await.unwrap();
    assert!(teardown.succeeded(), "{}", teardown.render());
    assert_eq!(backend.live_count(), 0);
}

#[test]
fn test_vault_is_object_safe() {
    let vault: Arc<dyn CredentialVault> = Arc::new(InMemoryVault::new());
    let reference = vault.generate("dev", &ids::DATABASE.into(), "postgres").unwrap();
    assert!(vault.contains(&reference));
}

#[tokio::test]
async fn test_credential_reference_recorded_by_engine() {
    let mut backend = MockBackend::new();
    backend.expect_create().times(7).returning(|request| {
        Ok(LiveHandle::new(
            request.id.clone(),
            request.kind(),
            format!("p-{}", request.id),
        ))
    });
    backend.expect_confirm().never();
    backend.expect_describe().never();

    let engine = Provisioner::new(Arc::new(backend))
        .with_config(fast_config())
        .with_locks(RunLocks::new())
        .with_outputs(OutputProjector::only(Vec::new()));
    let mut registry = HandleRegistry::new("dev");
    let report = apply(&engine, &EnvironmentSpec::isolated("k1", "dev"), &mut registry).await;

    assert!(report.succeeded(), "{}", report.render());
    let database = ResourceId::new(ids::DATABASE);
    assert_eq!(
        registry.handle(&database).unwrap().credential_ref,
        Some(generated_ref("dev", &database))
    );
    let credential = engine
        .read_credential(&registry, &database, &ids::INSTANCE_ROLE.into())
        .unwrap();
    assert_eq!(credential.username, "postgres");
}

#[tokio::test]
async fn test_rejected_database_leaves_no_credential() {
    let backend = SimulatedBackend::new()
        .fail_create_always(ids::DATABASE, SimulatedFault::Rejected("quota exceeded".into()));
    let engine = engine(&backend);
    let mut registry = HandleRegistry::new("dev");

    let report = apply(&engine, &EnvironmentSpec::isolated("dev-key", "dev"), &mut registry).await;

    assert_eq!(
        report.failure.map(|f| f.kind),
        Some(FailureKind::ResourceCreationFailed)
    );
    assert!(!engine
        .vault()
        .contains(&generated_ref("dev", &ids::DATABASE.into())));
}

#[tokio::test]
async fn test_engines_in_one_process_share_run_locks() {
    let backend = SimulatedBackend::new().delay_create(ids::NETWORK, Duration::from_millis(200));
    let config = EngineConfig::default().with_backend(
        BackendConfig::default()
            .timeout_ms(5_000)
            .retry(RetryConfig::default().delays(1, 5)),
    );
    let first = Provisioner::new(Arc::new(backend.clone())).with_config(config.clone());
    let second = Provisioner::new(Arc::new(backend.clone())).with_config(config);
    let spec = EnvironmentSpec::isolated("dev-key", "shared");
    let (mut first_registry, mut second_registry) =
        (HandleRegistry::new("shared"), HandleRegistry::new("shared"));
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        first.apply_with_registry(&spec, &mut first_registry, &cancel),
        second.apply_with_registry(&spec, &mut second_registry, &cancel),
    );

    let (won, lost) = if a.is_ok() { (a, b) } else { (b, a) };
    assert!(won.unwrap().succeeded());
    assert!(matches!(lost, Err(CoreError::EnvironmentBusy(env)) if env == "shared"));

    let network_creates = backend
        .get_method_calls("create")
        .into_iter()
        .filter(|c| c.resource.as_str() == ids::NETWORK)
        .count();
    assert_eq!(network_creates, 1);
}

#[tokio::test]
async fn test_state_lock_rejects_second_run_on_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let backend = SimulatedBackend::new().delay_create(ids::NETWORK, Duration::from_millis(200));
    let config = EngineConfig::default()
        .with_backend(
            BackendConfig::default()
                .timeout_ms(5_000)
                .retry(RetryConfig::default().delays(1, 5)),
        )
        .with_state_dir(dir.path());
    // Separate lock tables stand in for separate processes.
    let first = Provisioner::new(Arc::new(backend.clone()))
        .with_config(config.clone())
        .with_locks(RunLocks::new());
    let second = Provisioner::new(Arc::new(backend.clone()))
        .with_config(config)
        .with_locks(RunLocks::new());
    let spec = EnvironmentSpec::isolated("dev-key", "dev");
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(first.apply(&spec, &cancel), second.apply(&spec, &cancel));

    let (won, lost) = if a.is_ok() { (a, b) } else { (b, a) };
    assert!(won.unwrap().succeeded());
    assert!(matches!(lost, Err(CoreError::EnvironmentBusy(_))));
    assert!(!dir.path().join("dev.lock").exists());
}
