//! Provisioning engine.
//!
//! Drives a plan against a [`ProvisioningBackend`]: every create is bounded
//! by a timeout and a retry budget, every success is recorded before the
//! next step starts, and the first failure stops the run. Nothing already
//! created is rolled back; the run report says exactly what exists.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_backend::{
    retry_with_backoff, with_timeout, BackendConfig, BackendError, CreationStatus, LiveHandle,
    ProvisionRequest, ProvisioningBackend, Purge,
};
use keel_policy::{AccessMatrix, PolicyComposer};
use keel_spec::{
    build_descriptors, CredentialSource, DescriptorSet, EnvironmentSpec, ResourceId, ResourceSpec,
    SecretRef,
};

use crate::error::{CoreError, CoreResult};
use crate::graph::DependencyGraph;
use crate::lifecycle::{teardown_actions, HandleRegistry, StateLock, TeardownAction};
use crate::outputs::OutputProjector;
use crate::planner::{PlanStep, Planner, ProvisioningPlan, StepAction};
use crate::report::{FailureKind, FailureRecord, Operation, RunReport, StepRecord, StepStatus};
use crate::secrets::{Credential, CredentialVault, InMemoryVault};

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    /// Run the steps of one wave concurrently.
    pub concurrent_waves: bool,
    /// Where registries and run reports are kept.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            concurrent_waves: false,
            state_dir: PathBuf::from(".keel/state"),
        }
    }
}

impl EngineConfig {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn concurrent(mut self, enabled: bool) -> Self {
        self.concurrent_waves = enabled;
        self
    }
}

/// Environments with a run in progress.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared by every provisioner in this process.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<RunLocks> = OnceLock::new();
        GLOBAL.get_or_init(RunLocks::new).clone()
    }

    pub fn acquire(&self, environment: &str) -> CoreResult<RunGuard> {
        if !self.active.lock().insert(environment.to_string()) {
            return Err(CoreError::EnvironmentBusy(environment.to_string()));
        }
        Ok(RunGuard {
            locks: self.clone(),
            environment: environment.to_string(),
        })
    }

    pub fn is_active(&self, environment: &str) -> bool {
        self.active.lock().contains(environment)
    }
}

/// Releases the environment when dropped.
#[derive(Debug)]
pub struct RunGuard {
    locks: RunLocks,
    environment: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.locks.active.lock().remove(&self.environment);
    }
}

/// Everything derived from a spec before any backend call.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub descriptors: DescriptorSet,
    pub graph: DependencyGraph,
    pub matrix: AccessMatrix,
    pub plan: ProvisioningPlan,
}

/// How one create attempt went wrong.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Indeterminate(String),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Backend(e) if e.is_retryable())
    }
}

struct StepOutcome {
    result: CoreResult<LiveHandle>,
    attempts: u32,
    /// Credential bound by the request, recorded on the handle.
    credential: Option<SecretRef>,
}

pub struct Provisioner {
    backend: Arc<dyn ProvisioningBackend>,
    vault: Arc<dyn CredentialVault>,
    composer: PolicyComposer,
    outputs: OutputProjector,
    config: EngineConfig,
    locks: RunLocks,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self {
            backend,
            vault: Arc::new(InMemoryVault::new()),
            composer: PolicyComposer::new(),
            outputs: OutputProjector::standard(),
            config: EngineConfig::default(),
            locks: RunLocks::global(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = vault;
        self
    }

    pub fn with_composer(mut self, composer: PolicyComposer) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_outputs(mut self, outputs: OutputProjector) -> Self {
        self.outputs = outputs;
        self
    }

    /// Use a separate lock table instead of the process-wide one.
    pub fn with_locks(mut self, locks: RunLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    /// Build descriptors, graph, access matrix and plan. No backend calls.
    pub fn prepare(&self, spec: &EnvironmentSpec) -> CoreResult<PreparedRun> {
        let descriptors = build_descriptors(spec)?;
        let graph = DependencyGraph::build(&descriptors)?;
        let matrix = self.composer.compose(&descriptors)?;
        let plan = Planner::annotate(Planner::plan(&graph, &descriptors)?, &matrix);

        debug!(
            "Prepared {}: {} descriptors, {} steps, {} access rule(s)",
            descriptors.environment,
            descriptors.len(),
            plan.len(),
            matrix.len()
        );
        Ok(PreparedRun {
            descriptors,
            graph,
            matrix,
            plan,
        })
    }

    /// Open the environment's registry under the state directory.
    pub fn open_registry(&self, spec: &EnvironmentSpec) -> CoreResult<HandleRegistry> {
        HandleRegistry::open(&self.config.state_dir, spec.environment_id())
    }

    /// Provision an environment against its file-backed registry.
    pub async fn apply(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> CoreResult<RunReport> {
        let _state = StateLock::acquire(&self.config.state_dir, spec.environment_id())?;
        let mut registry = self.open_registry(spec)?;
        self.apply_with_registry(spec, &mut registry, cancel).await
    }

    /// Provision an environment.
    ///
    /// Specification, graph and policy problems are returned as errors
    /// before anything is created. Failures during execution are carried
    /// in the returned report instead.
    pub async fn apply_with_registry(
        &self,
        spec: &EnvironmentSpec,
        registry: &mut HandleRegistry,
        cancel: &CancellationToken,
    ) -> CoreResult<RunReport> {
        let environment = spec.environment_id().to_string();
        let _guard = self.locks.acquire(&environment)?;

        let prepared = self.prepare(spec)?;
        self.check_supplied_credentials(&prepared.descriptors)?;
        let plan = prepared.plan;
        registry.attach_plan(plan.clone())?;

        info!("Applying {} ({} steps)", environment, plan.len());
        let mut report = RunReport::new(&environment, Operation::Apply);
        report.steps = plan
            .steps
            .iter()
            .map(|s| StepRecord::pending(s.id.clone(), s.kind()))
            .collect();

        let batches: Vec<Vec<&PlanStep>> = if self.config.concurrent_waves {
            plan.waves()
        } else {
            plan.steps.iter().map(|s| vec![s]).collect()
        };

        for batch in batches {
            if let Some(failure) = self
                .run_batch(&environment, &batch, registry, &mut report, cancel)
                .await
            {
                error!("Apply of {} stopped at {}: {}", environment, failure.step, failure.message);
                report.fail(failure);
                break;
            }
        }

        if report.succeeded() {
            match self.outputs.resolve(registry, self.backend.as_ref()).await {
                Ok(outputs) => report.outputs = outputs,
                Err(e) => {
                    error!("{}", e);
                    report.fail(failure_of(&e, 0, &ResourceId::new(environment.as_str())));
                }
            }
        }

        report.finish();
        self.store_report(registry, &report);
        if report.succeeded() {
            info!("Applied {}: {} step(s)", environment, report.completed_steps().len());
        }
        Ok(report)
    }

    async fn run_batch(
        &self,
        environment: &str,
        batch: &[&PlanStep],
        registry: &mut HandleRegistry,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Option<FailureRecord> {
        let Some(first) = batch.first() else {
            return None;
        };
        if cancel.is_cancelled() {
            warn!("Apply of {} cancelled before {}", environment, first.id);
            return Some(failure_of(&CoreError::Cancelled(first.id.clone()), 0, &first.id));
        }

        let mut todo = Vec::with_capacity(batch.len());
        for step in batch {
            match registry.handle(&step.id) {
                Some(handle) => {
                    if let Some(record) = report.step_mut(&step.id) {
                        record.status = StepStatus::Completed;
                        record.provider_id = Some(handle.provider_id.clone());
                        record.message = Some("already created".to_string());
                    }
                    debug!("{} already created, skipping", step.id);
                }
                None => todo.push(*step),
            }
        }

        let outcomes = {
            let registry: &HandleRegistry = registry;
            join_all(todo.iter().map(|step| self.execute_step(environment, step, registry))).await
        };

        let mut failure = None;
        for (step, outcome) in todo.into_iter().zip(outcomes) {
            if let Some(f) = self.finish_step(step, outcome, registry, report) {
                failure.get_or_insert(f);
            }
        }
        failure
    }

    async fn execute_step(
        &self,
        environment: &str,
        step: &PlanStep,
        registry: &HandleRegistry,
    ) -> StepOutcome {
        let request = match self.build_request(environment, step, registry) {
            Ok(request) => request,
            Err(e) => {
                return StepOutcome {
                    result: Err(e),
                    attempts: 0,
                    credential: None,
                }
            }
        };

        info!("Creating {} ({})", step.id, step.kind());
        let timeout = self.config.backend.timeout();
        // Set while the latest attempt timed out and could not be confirmed.
        let unconfirmed = AtomicBool::new(false);
        let (backend, request, unconfirmed_ref) = (self.backend.as_ref(), &request, &unconfirmed);

        let outcome = retry_with_backoff(
            &self.config.backend.retry,
            step.id.as_str(),
            move || async move {
                unconfirmed_ref.store(false, Ordering::SeqCst);
                match with_timeout(timeout, backend.create(request)).await {
                    Err(BackendError::Timeout(limit)) => {
                        // A lost response may still have created the resource.
                        match with_timeout(timeout, backend.confirm(request)).await {
                            Ok(CreationStatus::Accepted) => Err(AttemptError::Indeterminate(format!(
                                "create timed out after {:?} but the provider reports it accepted",
                                limit
                            ))),
                            Ok(CreationStatus::NotCreated) => Err(BackendError::Timeout(limit).into()),
                            Err(e) => {
                                warn!("Could not confirm {}: {}", request.id, e);
                                unconfirmed_ref.store(true, Ordering::SeqCst);
                                Err(BackendError::Timeout(limit).into())
                            }
                        }
                    }
                    other => other.map_err(AttemptError::from),
                }
            },
            AttemptError::is_retryable,
        )
        .await;

        let resource = step.id.clone();
        let attempts = outcome.attempts;
        let result = outcome.result.map_err(|e| match e {
            AttemptError::Indeterminate(message) => CoreError::IndeterminateState { resource, message },
            AttemptError::Backend(e) if e.is_retryable() => CoreError::BackendUnavailable {
                resource,
                attempts,
                message: e.to_string(),
            },
            AttemptError::Backend(e) => CoreError::ResourceCreationFailed {
                resource,
                message: e.to_string(),
            },
        });

        let nothing_created = match &result {
            Err(CoreError::ResourceCreationFailed { .. }) => true,
            Err(CoreError::BackendUnavailable { .. }) => !unconfirmed.load(Ordering::SeqCst),
            _ => false,
        };
        if nothing_created {
            self.discard_generated_credential(step, request.credential.as_ref());
        }

        StepOutcome {
            result,
            attempts,
            credential: request.credential.clone(),
        }
    }

    fn build_request(
        &self,
        environment: &str,
        step: &PlanStep,
        registry: &HandleRegistry,
    ) -> CoreResult<ProvisionRequest> {
        let mut dependencies = Vec::with_capacity(step.depends_on.len());
        for dependency in &step.depends_on {
            let handle = registry.handle(dependency).ok_or_else(|| CoreError::ResourceCreationFailed {
                resource: step.id.clone(),
                message: format!("dependency {} is not live", dependency),
            })?;
            dependencies.push(handle.clone());
        }

        let mut request = match &step.action {
            StepAction::Create { descriptor } => {
                let mut request = ProvisionRequest::for_resource(environment, descriptor.clone());
                if let ResourceSpec::ManagedDatabase(db) = &descriptor.spec {
                    let reference = match &db.credential {
                        CredentialSource::Generated { username } => {
                            self.vault.generate(environment, &descriptor.id, username)?
                        }
                        CredentialSource::Supplied(reference) => reference.clone(),
                    };
                    request = request.with_credential(reference);
                }
                request
            }
            StepAction::AttachRule { boundary, rule, .. } => ProvisionRequest::rule_attachment(
                environment,
                step.id.clone(),
                boundary.clone(),
                rule.clone(),
            ),
        }
        .with_access(step.access.clone());

        for handle in dependencies {
            request = request.with_dependency(handle);
        }
        Ok(request)
    }

    /// Drop a generated database credential once nothing uses it.
    fn discard_generated_credential(&self, step: &PlanStep, reference: Option<&SecretRef>) {
        let generated = step
            .descriptor()
            .and_then(|d| d.as_database())
            .is_some_and(|db| matches!(db.credential, CredentialSource::Generated { .. }));
        let Some(reference) = reference.filter(|_| generated) else {
            return;
        };
        match self.vault.remove(reference) {
            Ok(()) => debug!("Removed credential {}", reference),
            Err(e) => debug!("Credential {} not removed: {}", reference, e),
        }
    }

    fn finish_step(
        &self,
        step: &PlanStep,
        outcome: StepOutcome,
        registry: &mut HandleRegistry,
        report: &mut RunReport,
    ) -> Option<FailureRecord> {
        let StepOutcome {
            result,
            attempts,
            credential,
        } = outcome;
        let recorded = result.and_then(|mut handle| {
            if credential.is_some() {
                handle.credential_ref = credential;
            }
            let provider_id = handle.provider_id.clone();
            registry.record(handle)?;
            Ok(provider_id)
        });

        match recorded {
            Ok(provider_id) => {
                info!("Created {} as {}", step.id, provider_id);
                if let Some(record) = report.step_mut(&step.id) {
                    record.status = StepStatus::Completed;
                    record.attempts = attempts;
                    record.provider_id = Some(provider_id);
                }
                self.grant_credentials(step, registry)
                    .err()
                    .map(|e| failure_of(&e, attempts, &step.id))
            }
            Err(e) => {
                if let Some(record) = report.step_mut(&step.id) {
                    record.status = StepStatus::Failed;
                    record.attempts = attempts;
                    record.message = Some(e.to_string());
                }
                Some(failure_of(&e, attempts, &step.id))
            }
        }
    }

    /// Let a freshly created role read the credentials it was granted.
    fn grant_credentials(&self, step: &PlanStep, registry: &HandleRegistry) -> CoreResult<()> {
        let Some(role) = step.descriptor().and_then(|d| d.as_role()) else {
            return Ok(());
        };
        for database in role.credential_grants() {
            let reference = registry
                .handle(database)
                .and_then(|h| h.credential_ref.clone())
                .ok_or_else(|| CoreError::ResourceCreationFailed {
                    resource: step.id.clone(),
                    message: format!("{} has no bound credential", database),
                })?;
            self.vault.grant(&reference, &step.id).map_err(|e| {
                CoreError::ResourceCreationFailed {
                    resource: step.id.clone(),
                    message: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    fn check_supplied_credentials(&self, set: &DescriptorSet) -> CoreResult<()> {
        for descriptor in set.iter() {
            if let Some(db) = descriptor.as_database() {
                if let CredentialSource::Supplied(reference) = &db.credential {
                    if !self.vault.contains(reference) {
                        return Err(CoreError::InvalidSpecification(format!(
                            "{} uses credential {} which the vault does not hold",
                            descriptor.id, reference
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear down an environment tracked by its file-backed registry.
    pub async fn destroy(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> CoreResult<RunReport> {
        let _state = StateLock::acquire(&self.config.state_dir, spec.environment_id())?;
        let mut registry = self.open_registry(spec)?;
        self.destroy_with_registry(spec, &mut registry, cancel).await
    }

    /// Delete tracked resources in reverse creation order.
    ///
    /// Resources that were never created are skipped. Retained resources
    /// and everything they depend on are left in place and dropped from
    /// tracking.
    pub async fn destroy_with_registry(
        &self,
        spec: &EnvironmentSpec,
        registry: &mut HandleRegistry,
        cancel: &CancellationToken,
    ) -> CoreResult<RunReport> {
        let environment = spec.environment_id().to_string();
        let _guard = self.locks.acquire(&environment)?;

        let plan = match registry.plan() {
            Some(plan) => plan.clone(),
            None => self.prepare(spec)?.plan,
        };
        let actions = teardown_actions(&plan);

        info!("Destroying {} ({} live)", environment, registry.live_count());
        let mut report = RunReport::new(&environment, Operation::Destroy);
        report.steps = plan
            .teardown_order()
            .map(|s| StepRecord::pending(s.id.clone(), s.kind()))
            .collect();

        for step in plan.teardown_order() {
            if cancel.is_cancelled() {
                warn!("Destroy of {} cancelled before {}", environment, step.id);
                report.fail(failure_of(&CoreError::Cancelled(step.id.clone()), 0, &step.id));
                break;
            }

            let Some(handle) = registry.handle(&step.id).cloned() else {
                if let Some(record) = report.step_mut(&step.id) {
                    record.status = StepStatus::Skipped;
                }
                continue;
            };

            let action = actions
                .get(&step.id)
                .copied()
                .unwrap_or(TeardownAction::Delete(Purge::none()));

            let result = match action {
                TeardownAction::Retain => {
                    info!("Retaining {} ({})", step.id, handle.provider_id);
                    registry
                        .mark_retained(&step.id)
                        .map(|_| (StepStatus::Retained, 0))
                        .map_err(|e| (e, 0))
                }
                TeardownAction::Delete(purge) => self
                    .delete_step(step, &handle, purge, registry)
                    .await
                    .map(|attempts| (StepStatus::Completed, attempts)),
            };

            match result {
                Ok((status, attempts)) => {
                    if let Some(record) = report.step_mut(&step.id) {
                        record.status = status;
                        record.attempts = attempts;
                        record.provider_id = Some(handle.provider_id.clone());
                    }
                }
                Err((e, attempts)) => {
                    error!("{}", e);
                    if let Some(record) = report.step_mut(&step.id) {
                        record.status = StepStatus::Failed;
                        record.attempts = attempts;
                        record.message = Some(e.to_string());
                    }
                    report.fail(failure_of(&e, attempts, &step.id));
                    break;
                }
            }
        }

        if report.succeeded() {
            registry.clear_if_empty()?;
            info!("Destroyed {}", environment);
        }
        report.finish();
        self.store_report(registry, &report);
        Ok(report)
    }

    async fn delete_step(
        &self,
        step: &PlanStep,
        handle: &LiveHandle,
        purge: Purge,
        registry: &mut HandleRegistry,
    ) -> Result<u32, (CoreError, u32)> {
        info!("Deleting {} ({})", step.id, handle.provider_id);
        let timeout = self.config.backend.timeout();
        let backend = self.backend.as_ref();

        let outcome = retry_with_backoff(
            &self.config.backend.retry,
            step.id.as_str(),
            move || async move { with_timeout(timeout, backend.delete(handle, purge)).await },
            BackendError::is_retryable_on_delete,
        )
        .await;
        let attempts = outcome.attempts;

        let teardown_failed = |message: String| {
            (
                CoreError::TeardownFailed {
                    resource: step.id.clone(),
                    message,
                },
                attempts,
            )
        };

        match outcome.result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("{} was already gone", step.id);
            }
            Err(e) => return Err(teardown_failed(e.to_string())),
        }

        registry
            .mark_destroyed(&step.id)
            .map_err(|e| teardown_failed(e.to_string()))?;
        self.discard_generated_credential(step, handle.credential_ref.as_ref());
        Ok(attempts)
    }


    fn store_report(&self, registry: &HandleRegistry, report: &RunReport) {
        let Some(dir) = registry.path().and_then(Path::parent) else {
            return;
        };
        if let Err(e) = report.save(dir) {
            warn!("Could not save run report: {}", e);
        }
    }

    /// Read a database credential on behalf of a role.
    pub fn read_credential(
        &self,
        registry: &HandleRegistry,
        database: &ResourceId,
        role: &ResourceId,
    ) -> CoreResult<Credential> {
        let reference: SecretRef = registry
            .handle(database)
            .and_then(|h| h.credential_ref.clone())
            .ok_or_else(|| CoreError::InvalidState(format!("{} has no bound credential", database)))?;
        self.vault.read(&reference, role)
    }
}

fn failure_of(error: &CoreError, attempts: u32, step: &ResourceId) -> FailureRecord {
    FailureRecord::from_error(error, attempts).unwrap_or_else(|| FailureRecord {
        step: step.clone(),
        kind: FailureKind::ResourceCreationFailed,
        message: error.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_backend::{RetryConfig, SimulatedBackend};
    use keel_spec::ids;

    fn provisioner(backend: SimulatedBackend) -> Provisioner {
        Provisioner::new(Arc::new(backend)).with_locks(RunLocks::new()).with_config(
            EngineConfig::default()
                .with_backend(BackendConfig::default().retry(RetryConfig::default().delays(1, 5))),
        )
    }

    #[tokio::test]
    async fn test_run_locks() {
        let locks = RunLocks::new();
        let guard = locks.acquire("dev").unwrap();
        assert!(matches!(locks.acquire("dev"), Err(CoreError::EnvironmentBusy(_))));
        assert!(locks.acquire("prod").is_ok());
        drop(guard);
        assert!(!locks.is_active("dev"));
        assert!(locks.acquire("dev").is_ok());
    }

    #[tokio::test]
    async fn test_apply_then_destroy() {
        let backend = SimulatedBackend::new();
        let engine = provisioner(backend.clone());
        let spec = EnvironmentSpec::isolated("k1", "dev");
        let mut registry = HandleRegistry::new("dev");
        let cancel = CancellationToken::new();

        let report = engine
            .apply_with_registry(&spec, &mut registry, &cancel)
            .await
            .unwrap();
        assert!(report.succeeded(), "{}", report.render());
        assert_eq!(registry.live_count(), 7);
        assert_eq!(backend.live_count(), 7);

        let credential = engine
            .read_credential(&registry, &ids::DATABASE.into(), &ids::INSTANCE_ROLE.into())
            .unwrap();
        assert_eq!(credential.username, "postgres");

        let teardown = engine
            .destroy_with_registry(&spec, &mut registry, &cancel)
            .await
            .unwrap();
        assert!(teardown.succeeded(), "{}", teardown.render());
        assert_eq!(backend.live_count(), 0);
        assert_eq!(registry.live_count(), 0);
        assert!(!engine
            .vault()
            .contains(&SecretRef::new("secret://dev/database/credentials")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = SimulatedBackend::new();
        let engine = provisioner(backend.clone());
        let mut registry = HandleRegistry::new("dev");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine
            .apply_with_registry(&EnvironmentSpec::isolated("k1", "dev"), &mut registry, &cancel)
            .await
            .unwrap();
        assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::Cancelled));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        fs::write(
            &path,
            r#"
concurrent_waves = true
state_dir = "/tmp/keel"

[backend]
timeout_ms = 5000

[backend.retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(config.concurrent_waves);
        assert_eq!(config.backend.timeout_ms, 5000);
        assert_eq!(config.backend.retry.max_attempts, 5);
        assert_eq!(config.backend.retry.initial_delay_ms, 1_000);

        fs::write(&path, "concurrent_waves = 'maybe'").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(CoreError::Config(_))));
    }
}
