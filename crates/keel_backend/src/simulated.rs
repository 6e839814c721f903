//! In-memory provisioning backend.
//!
//! Keeps a table of live resources, captures every call and can be scripted
//! to fail, stall or report out-of-band acceptance per resource id. Used by
//! the CLI and by engine tests in place of a real cloud API.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use keel_spec::{ResourceId, ResourceSpec};

use crate::backend::{
    attrs, CreationStatus, LiveHandle, ProvisionRequest, ProvisionTarget, ProvisioningBackend,
    Purge,
};
use crate::error::{BackendError, BackendResult};

/// A scripted misbehaviour for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedFault {
    Unavailable,
    Throttled,
    Rejected(String),
    Conflict,
    DependencyViolation,
    /// Stall before answering successfully.
    Delay(Duration),
}

impl SimulatedFault {
    fn into_error(self, id: &ResourceId) -> Option<BackendError> {
        let id = id.to_string();
        match self {
            SimulatedFault::Unavailable => Some(BackendError::Unavailable(id)),
            SimulatedFault::Throttled => Some(BackendError::Throttled(id)),
            SimulatedFault::Rejected(reason) => {
                Some(BackendError::Rejected(format!("{}: {}", id, reason)))
            }
            SimulatedFault::Conflict => Some(BackendError::Conflict(id)),
            SimulatedFault::DependencyViolation => Some(BackendError::DependencyViolation(id)),
            SimulatedFault::Delay(_) => None,
        }
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCall {
    pub method: String,
    pub resource: ResourceId,
    pub purge: Option<Purge>,
}

/// Per-id fault queues; `always` applies once the queue is drained.
#[derive(Debug, Default)]
struct FaultScript {
    queued: HashMap<ResourceId, VecDeque<SimulatedFault>>,
    always: HashMap<ResourceId, SimulatedFault>,
}

impl FaultScript {
    fn next(&mut self, id: &ResourceId) -> Option<SimulatedFault> {
        if let Some(fault) = self.queued.get_mut(id).and_then(VecDeque::pop_front) {
            return Some(fault);
        }
        self.always.get(id).cloned()
    }
}

#[derive(Clone)]
pub struct SimulatedBackend {
    /// Live resources by provider id.
    live: Arc<RwLock<BTreeMap<String, LiveHandle>>>,
    counter: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    create_faults: Arc<RwLock<FaultScript>>,
    delete_faults: Arc<RwLock<FaultScript>>,
    /// Ids whose lost creates are reported as accepted by `confirm`.
    accepted: Arc<RwLock<HashSet<ResourceId>>>,
    /// Attribute keys only visible through `describe`.
    late_attributes: Arc<RwLock<HashSet<String>>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            live: Arc::new(RwLock::new(BTreeMap::new())),
            counter: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            create_faults: Arc::new(RwLock::new(FaultScript::default())),
            delete_faults: Arc::new(RwLock::new(FaultScript::default())),
            accepted: Arc::new(RwLock::new(HashSet::new())),
            late_attributes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Fail the next `times` creates of `id`.
    pub fn fail_create(self, id: impl Into<ResourceId>, fault: SimulatedFault, times: usize) -> Self {
        self.create_faults
            .write()
            .queued
            .entry(id.into())
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
        self
    }

    /// Fail every create of `id`.
    pub fn fail_create_always(self, id: impl Into<ResourceId>, fault: SimulatedFault) -> Self {
        self.create_faults.write().always.insert(id.into(), fault);
        self
    }

    /// Stall every create of `id`.
    pub fn delay_create(self, id: impl Into<ResourceId>, delay: Duration) -> Self {
        self.fail_create_always(id, SimulatedFault::Delay(delay))
    }

    /// Fail the next `times` deletes of `id`.
    pub fn fail_delete(self, id: impl Into<ResourceId>, fault: SimulatedFault, times: usize) -> Self {
        self.delete_faults
            .write()
            .queued
            .entry(id.into())
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
        self
    }

    /// Report a create of `id` as accepted when asked out of band.
    pub fn confirm_accepted(self, id: impl Into<ResourceId>) -> Self {
        self.accepted.write().insert(id.into());
        self
    }

    /// Leave `key` out of create responses; `describe` still returns it.
    pub fn late_attribute(self, key: impl Into<String>) -> Self {
        self.late_attributes.write().insert(key.into());
        self
    }

    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.captured_calls.read().iter().any(|c| c.method == method)
    }

    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Resource ids in the order their creates were dispatched.
    pub fn created_order(&self) -> Vec<ResourceId> {
        self.get_method_calls("create")
            .into_iter()
            .map(|c| c.resource)
            .collect()
    }

    pub fn is_live(&self, id: &ResourceId) -> bool {
        self.live.read().values().any(|h| &h.resource == id)
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    fn record_call(&self, method: &str, resource: &ResourceId, purge: Option<Purge>) {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            resource: resource.clone(),
            purge,
        });
    }

    async fn apply_fault(fault: Option<SimulatedFault>, id: &ResourceId) -> BackendResult<()> {
        match fault {
            None => Ok(()),
            Some(SimulatedFault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(other) => match other.into_error(id) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn next_provider_id(&self, prefix: &str) -> (usize, String) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        (n, format!("{}-{:04}", prefix, n))
    }

    fn build_handle(&self, request: &ProvisionRequest) -> BackendResult<LiveHandle> {
        let kind = request.kind();
        let mut attributes = BTreeMap::new();

        let provider_id = match &request.target {
            ProvisionTarget::Resource { descriptor } => match &descriptor.spec {
                ResourceSpec::NetworkSpace(network) => {
                    let (_, id) = self.next_provider_id("vpc");
                    for segment in &network.segments {
                        let subnets: Vec<String> = (0..network.az_count)
                            .map(|az| format!("{}-{}-{}", id, segment.name, az))
                            .collect();
                        attributes.insert(
                            format!("{}{}", attrs::SEGMENT_PREFIX, segment.name),
                            subnets.join(","),
                        );
                    }
                    id
                }
                ResourceSpec::AccessBoundary(_) => self.next_provider_id("sg").1,
                ResourceSpec::ObjectStore(_) => {
                    attributes.insert(attrs::BUCKET_NAME.to_string(), descriptor.name.clone());
                    attributes.insert(
                        attrs::ARN.to_string(),
                        format!("arn:sim:s3:::{}", descriptor.name),
                    );
                    self.next_provider_id("bucket").1
                }
                ResourceSpec::ManagedDatabase(db) => {
                    attributes.insert(
                        attrs::ENDPOINT_ADDRESS.to_string(),
                        format!("{}.{}.db.keel.internal", descriptor.name, request.environment),
                    );
                    attributes.insert(attrs::ENDPOINT_PORT.to_string(), db.port.to_string());
                    self.next_provider_id("db").1
                }
                ResourceSpec::IdentityRole(_) => {
                    let (_, id) = self.next_provider_id("role");
                    attributes.insert(
                        attrs::ARN.to_string(),
                        format!("arn:sim:iam::role/{}", descriptor.name),
                    );
                    id
                }
                ResourceSpec::ComputeInstance(_) => {
                    let (n, id) = self.next_provider_id("i");
                    attributes.insert(attrs::PUBLIC_IP.to_string(), format!("203.0.113.{}", n % 250 + 1));
                    attributes.insert(attrs::PRIVATE_IP.to_string(), format!("10.0.0.{}", n % 250 + 1));
                    id
                }
            },
            ProvisionTarget::RuleAttachment { boundary, .. } => {
                if !request.dependencies.contains_key(boundary) {
                    return Err(BackendError::Rejected(format!(
                        "boundary {} is not live",
                        boundary
                    )));
                }
                self.next_provider_id("sgr").1
            }
        };

        let mut handle = LiveHandle::new(request.id.clone(), kind, provider_id);
        handle.attributes = attributes;
        handle.credential_ref = request.credential.clone();
        Ok(handle)
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn create(&self, request: &ProvisionRequest) -> BackendResult<LiveHandle> {
        self.record_call("create", &request.id, None);

        for dependency in request.dependencies.values() {
            if !self.live.read().contains_key(&dependency.provider_id) {
                return Err(BackendError::Rejected(format!(
                    "{} depends on {} which is not live",
                    request.id, dependency.resource
                )));
            }
        }
        if self.is_live(&request.id) {
            return Err(BackendError::Conflict(request.id.to_string()));
        }

        let fault = self.create_faults.write().next(&request.id);
        Self::apply_fault(fault, &request.id).await?;

        let mut handle = self.build_handle(request)?;
        debug!(resource = %request.id, provider_id = %handle.provider_id, "Simulated create");
        self.live
            .write()
            .insert(handle.provider_id.clone(), handle.clone());

        let late = self.late_attributes.read();
        handle.attributes.retain(|key, _| !late.contains(key));
        Ok(handle)
    }

    async fn delete(&self, handle: &LiveHandle, purge: Purge) -> BackendResult<()> {
        self.record_call("delete", &handle.resource, Some(purge));

        let fault = self.delete_faults.write().next(&handle.resource);
        Self::apply_fault(fault, &handle.resource).await?;

        match self.live.write().remove(&handle.provider_id) {
            Some(_) => {
                debug!(resource = %handle.resource, "Simulated delete");
                Ok(())
            }
            None => Err(BackendError::NotFound(handle.provider_id.clone())),
        }
    }

    async fn describe(&self, handle: &LiveHandle) -> BackendResult<BTreeMap<String, String>> {
        self.record_call("describe", &handle.resource, None);

        let live = self.live.read().get(&handle.provider_id).cloned();
        match live {
            Some(live) => Ok(live.attributes),
            None => Err(BackendError::NotFound(handle.provider_id.clone())),
        }
    }

    async fn confirm(&self, request: &ProvisionRequest) -> BackendResult<CreationStatus> {
        self.record_call("confirm", &request.id, None);

        if self.accepted.read().contains(&request.id) {
            Ok(CreationStatus::Accepted)
        } else {
            Ok(CreationStatus::NotCreated)
        }
    }
}
