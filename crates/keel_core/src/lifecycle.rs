//! Live handle registry and teardown policy.
//!
//! The registry is the only record of what exists in the provider for an
//! environment. Every successful create is recorded before the next step
//! runs; when the registry is file-backed it is flushed on every change so
//! an interrupted run can still be torn down.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_backend::{LiveHandle, Purge};
use keel_spec::{LifecycleState, RemovalPolicy, ResourceId, ResourceSpec};

use crate::error::{CoreError, CoreResult};
use crate::planner::{ProvisioningPlan, StepAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedResource {
    pub handle: LiveHandle,
    pub state: LifecycleState,
}

/// Handles of everything created for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleRegistry {
    pub environment: String,
    resources: BTreeMap<ResourceId, TrackedResource>,
    /// Record order.
    order: Vec<ResourceId>,
    /// Plan of the run that created these handles.
    plan: Option<ProvisioningPlan>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl HandleRegistry {
    /// In-memory registry.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            resources: BTreeMap::new(),
            order: Vec::new(),
            plan: None,
            path: None,
        }
    }

    pub fn state_path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{}.state.json", environment))
    }

    /// Open the registry file of `environment`, creating an empty one if it
    /// does not exist yet.
    pub fn open(state_dir: &Path, environment: &str) -> CoreResult<Self> {
        let path = Self::state_path(state_dir, environment);
        let mut registry = if path.exists() {
            Self::load(&path)?
        } else {
            Self::new(environment)
        };
        registry.path = Some(path);
        Ok(registry)
    }

    /// Load a registry from disk.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut registry: Self = serde_json::from_str(&content)?;
        registry.path = Some(path.to_path_buf());
        Ok(registry)
    }

    /// Save the registry to its file, if it has one.
    pub fn save(&self) -> CoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Saved registry to {:?}", path);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Track a freshly created resource.
    ///
    /// A handle that cannot be tracked leaves an orphan in the provider, so
    /// every failure here is reported as [`CoreError::UntrackedResource`].
    pub fn record(&mut self, handle: LiveHandle) -> CoreResult<()> {
        let untracked = |handle: &LiveHandle, message: String| CoreError::UntrackedResource {
            resource: handle.resource.clone(),
            provider_id: handle.provider_id.clone(),
            message,
        };

        if handle.provider_id.is_empty() {
            return Err(untracked(&handle, "backend returned no provider id".to_string()));
        }
        if self.is_created(&handle.resource) {
            return Err(untracked(&handle, "a live handle is already recorded".to_string()));
        }

        let id = handle.resource.clone();
        debug!("Recording {} as {}", id, handle.provider_id);
        self.resources.insert(
            id.clone(),
            TrackedResource {
                handle: handle.clone(),
                state: LifecycleState::Created,
            },
        );
        self.order.retain(|known| known != &id);
        self.order.push(id);

        self.save()
            .map_err(|e| untracked(&handle, format!("state could not be persisted: {}", e)))
    }

    pub fn handle(&self, id: &ResourceId) -> Option<&LiveHandle> {
        self.resources
            .get(id)
            .filter(|r| r.state == LifecycleState::Created)
            .map(|r| &r.handle)
    }

    pub fn state(&self, id: &ResourceId) -> LifecycleState {
        self.resources.get(id).map_or(LifecycleState::Pending, |r| r.state)
    }

    pub fn is_created(&self, id: &ResourceId) -> bool {
        self.state(id) == LifecycleState::Created
    }

    /// Ids of live resources in record order.
    pub fn created_ids(&self) -> Vec<ResourceId> {
        self.order
            .iter()
            .filter(|id| self.is_created(id))
            .cloned()
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.resources
            .values()
            .filter(|r| r.state == LifecycleState::Created)
            .count()
    }

    pub fn tracked(&self) -> impl Iterator<Item = (&ResourceId, &TrackedResource)> {
        self.order
            .iter()
            .filter_map(|id| self.resources.get(id).map(|r| (id, r)))
    }

    pub fn mark_destroyed(&mut self, id: &ResourceId) -> CoreResult<()> {
        self.transition(id, LifecycleState::Destroyed)
    }

    pub fn mark_retained(&mut self, id: &ResourceId) -> CoreResult<()> {
        self.transition(id, LifecycleState::Retained)
    }

    fn transition(&mut self, id: &ResourceId, next: LifecycleState) -> CoreResult<()> {
        let tracked = self
            .resources
            .get_mut(id)
            .ok_or_else(|| CoreError::InvalidState(format!("{} is not tracked", id)))?;
        if !tracked.state.can_transition_to(&next) {
            return Err(CoreError::InvalidState(format!(
                "{} cannot move from {:?} to {:?}",
                id, tracked.state, next
            )));
        }
        tracked.state = next;
        self.save()
    }

    pub fn plan(&self) -> Option<&ProvisioningPlan> {
        self.plan.as_ref()
    }

    pub fn attach_plan(&mut self, plan: ProvisioningPlan) -> CoreResult<()> {
        self.plan = Some(plan);
        self.save()
    }

    /// Drop tombstones once nothing is live any more.
    pub fn clear_if_empty(&mut self) -> CoreResult<()> {
        if self.live_count() == 0 {
            self.resources.clear();
            self.order.clear();
            self.plan = None;
            info!("Registry for {} is empty", self.environment);
            self.save()?;
        }
        Ok(())
    }
}

/// Exclusive claim on an environment's state, held for the length of a run.
///
/// The lock file sits next to the state file, so runs in other processes
/// are turned away until it is dropped.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn lock_path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{}.lock", environment))
    }

    pub fn acquire(state_dir: &Path, environment: &str) -> CoreResult<Self> {
        fs::create_dir_all(state_dir)?;
        let path = Self::lock_path(state_dir, environment);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(
                    "{} is locked by {:?}; remove it if no run is active",
                    environment, path
                );
                return Err(CoreError::EnvironmentBusy(environment.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let lock = Self { path };
        writeln!(file, "{}", std::process::id())?;
        debug!("Locked {:?}", lock.path);
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not release {:?}: {}", self.path, e);
        }
    }
}

/// What teardown does with one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    Delete(Purge),
    /// Leave in place, together with what it needs to keep working.
    Retain,
}

/// Teardown action per plan step.
///
/// A retained resource keeps its dependencies alive, transitively; rule
/// attachments follow the boundary they are attached to.
pub fn teardown_actions(plan: &ProvisioningPlan) -> BTreeMap<ResourceId, TeardownAction> {
    let mut retained: BTreeSet<ResourceId> = BTreeSet::new();
    let mut stack: Vec<&ResourceId> = plan
        .steps
        .iter()
        .filter(|s| {
            s.descriptor()
                .is_some_and(|d| d.removal_policy() == RemovalPolicy::Retain)
        })
        .map(|s| &s.id)
        .collect();

    while let Some(id) = stack.pop() {
        if !retained.insert(id.clone()) {
            continue;
        }
        if let Some(step) = plan.step(id) {
            stack.extend(step.depends_on.iter());
        }
    }

    plan.steps
        .iter()
        .map(|step| {
            let keep = match &step.action {
                StepAction::AttachRule { boundary, .. } => retained.contains(boundary),
                StepAction::Create { .. } => retained.contains(&step.id),
            };
            let action = if keep {
                TeardownAction::Retain
            } else {
                TeardownAction::Delete(purge_for(&step.action))
            };
            (step.id.clone(), action)
        })
        .collect()
}

fn purge_for(action: &StepAction) -> Purge {
    let StepAction::Create { descriptor } = action else {
        return Purge::none();
    };
    match &descriptor.spec {
        ResourceSpec::ObjectStore(store) => Purge {
            data: store.auto_delete_objects,
            ..Purge::none()
        },
        ResourceSpec::ManagedDatabase(db) => Purge {
            data: true,
            disable_backups: true,
            delete_automated_backups: db.delete_automated_backups,
        },
        _ => Purge::none(),
    }
}
