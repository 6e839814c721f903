//! Provisioning backend trait and request/handle types.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_spec::{ResourceDescriptor, ResourceId, ResourceKind, Rule, SecretRef};

use crate::error::BackendResult;

/// Well-known live attribute keys.
pub mod attrs {
    pub const BUCKET_NAME: &str = "bucket_name";
    pub const ENDPOINT_ADDRESS: &str = "endpoint_address";
    pub const ENDPOINT_PORT: &str = "endpoint_port";
    pub const PUBLIC_IP: &str = "public_ip";
    pub const PRIVATE_IP: &str = "private_ip";
    pub const ARN: &str = "arn";
    /// Comma-separated provider ids of a segment's subnets, keyed `segment:<name>`.
    pub const SEGMENT_PREFIX: &str = "segment:";
}

/// What a plan step asks the backend to create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Resource(ResourceKind),
    RuleAttachment,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Resource(kind) => write!(f, "{}", kind),
            TargetKind::RuleAttachment => f.write_str("rule_attachment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionTarget {
    Resource {
        descriptor: ResourceDescriptor,
    },
    /// A peer rule attached to an already-live boundary.
    RuleAttachment { boundary: ResourceId, rule: Rule },
}

/// A single create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub environment: String,
    pub id: ResourceId,
    pub target: ProvisionTarget,
    /// Resolved access rules for boundaries.
    pub access: Vec<Rule>,
    /// Live handles of everything this step depends on.
    pub dependencies: BTreeMap<ResourceId, LiveHandle>,
    /// Credential to bind, for databases.
    pub credential: Option<SecretRef>,
}

impl ProvisionRequest {
    pub fn for_resource(environment: impl Into<String>, descriptor: ResourceDescriptor) -> Self {
        Self {
            environment: environment.into(),
            id: descriptor.id.clone(),
            target: ProvisionTarget::Resource { descriptor },
            access: Vec::new(),
            dependencies: BTreeMap::new(),
            credential: None,
        }
    }

    pub fn rule_attachment(
        environment: impl Into<String>,
        id: ResourceId,
        boundary: ResourceId,
        rule: Rule,
    ) -> Self {
        Self {
            environment: environment.into(),
            id,
            target: ProvisionTarget::RuleAttachment { boundary, rule },
            access: Vec::new(),
            dependencies: BTreeMap::new(),
            credential: None,
        }
    }

    pub fn with_access(mut self, access: Vec<Rule>) -> Self {
        self.access = access;
        self
    }

    pub fn with_dependency(mut self, handle: LiveHandle) -> Self {
        self.dependencies.insert(handle.resource.clone(), handle);
        self
    }

    pub fn with_credential(mut self, credential: SecretRef) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn kind(&self) -> TargetKind {
        match &self.target {
            ProvisionTarget::Resource { descriptor } => TargetKind::Resource(descriptor.kind()),
            ProvisionTarget::RuleAttachment { .. } => TargetKind::RuleAttachment,
        }
    }

    pub fn descriptor(&self) -> Option<&ResourceDescriptor> {
        match &self.target {
            ProvisionTarget::Resource { descriptor } => Some(descriptor),
            ProvisionTarget::RuleAttachment { .. } => None,
        }
    }
}

/// Provider-returned identifiers and attributes of a created resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveHandle {
    pub resource: ResourceId,
    pub kind: TargetKind,
    pub provider_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Vault reference of the bound credential. Never the secret itself.
    #[serde(default)]
    pub credential_ref: Option<SecretRef>,
    pub created_at: DateTime<Utc>,
}

impl LiveHandle {
    pub fn new(resource: ResourceId, kind: TargetKind, provider_id: impl Into<String>) -> Self {
        Self {
            resource,
            kind,
            provider_id: provider_id.into(),
            attributes: BTreeMap::new(),
            credential_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Data handling requested on delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Purge {
    /// Remove stored data (bucket objects, database contents) first.
    pub data: bool,
    /// Turn off automated backups before deleting.
    pub disable_backups: bool,
    /// Also delete backups already taken.
    pub delete_automated_backups: bool,
}

impl Purge {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Out-of-band answer to "did that create go through?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStatus {
    NotCreated,
    Accepted,
}

/// Cloud resource API consumed by the engine.
///
/// Implementations may be slow and fail partially; the engine wraps every
/// call in a timeout and a bounded retry.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Create a resource or attach a rule, returning its live handle.
    async fn create(&self, request: &ProvisionRequest) -> BackendResult<LiveHandle>;

    /// Delete a previously created resource.
    async fn delete(&self, handle: &LiveHandle, purge: Purge) -> BackendResult<()>;

    /// Read the current live attributes of a resource.
    async fn describe(&self, handle: &LiveHandle) -> BackendResult<BTreeMap<String, String>>;

    /// Ask whether a create whose response was lost was nevertheless accepted.
    async fn confirm(&self, _request: &ProvisionRequest) -> BackendResult<CreationStatus> {
        Ok(CreationStatus::NotCreated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_spec::{build_descriptors, ids, EnvironmentSpec, Peer};

    #[test]
    fn test_request_kind() {
        let set = build_descriptors(&EnvironmentSpec::isolated("k1", "dev")).unwrap();
        let bucket = set.get(&ids::BUCKET.into()).unwrap().clone();

        let request = ProvisionRequest::for_resource("dev", bucket);
        assert_eq!(request.kind(), TargetKind::Resource(ResourceKind::ObjectStore));
        assert_eq!(request.id.as_str(), ids::BUCKET);

        let boundary = ResourceId::new(ids::DB_BOUNDARY);
        let attach = ProvisionRequest::rule_attachment(
            "dev",
            ResourceId::rule_of(&boundary, 0),
            boundary,
            Rule::ingress_tcp(5432, Peer::AnyIpv4),
        );
        assert_eq!(attach.kind(), TargetKind::RuleAttachment);
        assert!(attach.descriptor().is_none());
    }

    #[test]
    fn test_handle_serialization() {
        let handle = LiveHandle::new(
            ResourceId::new(ids::DATABASE),
            TargetKind::Resource(ResourceKind::ManagedDatabase),
            "db-0001",
        )
        .with_attribute(attrs::ENDPOINT_PORT, "5432");

        let json = serde_json::to_string(&handle).unwrap();
        let back: LiveHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
        assert_eq!(back.attribute(attrs::ENDPOINT_PORT), Some("5432"));
    }
}
