//! Resource descriptor model.
//!
//! Descriptors are immutable once built. Cross-resource references are
//! expressed as [`ResourceId`]s so the graph builder can derive edges from
//! them without any construction-order side effects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical identity of a descriptor within one environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity of the `index`-th rule of a boundary when it is attached as
    /// its own plan step.
    pub fn rule_of(boundary: &ResourceId, index: usize) -> Self {
        Self(format!("{}/rule-{}", boundary.0, index))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The fixed set of resource kinds the engine knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    NetworkSpace,
    AccessBoundary,
    ObjectStore,
    ManagedDatabase,
    IdentityRole,
    ComputeInstance,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::NetworkSpace => "network_space",
            ResourceKind::AccessBoundary => "access_boundary",
            ResourceKind::ObjectStore => "object_store",
            ResourceKind::ManagedDatabase => "managed_database",
            ResourceKind::IdentityRole => "identity_role",
            ResourceKind::ComputeInstance => "compute_instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internet reachability of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EgressMode {
    /// No route in or out of the network space.
    Isolated,
    /// Outbound only, through a NAT gateway.
    NatEgress,
    /// Routed through an internet gateway.
    Public,
}

impl EgressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressMode::Isolated => "isolated",
            EgressMode::NatEgress => "nat-egress",
            EgressMode::Public => "public",
        }
    }
}

impl fmt::Display for EgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subnet group, spread over every availability zone of its network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub egress: EgressMode,
    /// Prefix length of each per-AZ subnet.
    pub cidr_mask: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpace {
    pub cidr: String,
    pub az_count: u8,
    pub nat_gateways: u8,
    pub segments: Vec<Segment>,
}

impl NetworkSpace {
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    All,
}

/// The other side of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    /// `0.0.0.0/0`.
    AnyIpv4,
    /// A literal address range.
    Cidr(String),
    /// Members of another access boundary.
    Boundary(ResourceId),
}

impl Peer {
    /// Open ranges are anything that is not scoped to a boundary.
    pub fn is_open_range(&self) -> bool {
        !matches!(self, Peer::Boundary(_))
    }

    pub fn boundary(&self) -> Option<&ResourceId> {
        match self {
            Peer::Boundary(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::AnyIpv4 => f.write_str("0.0.0.0/0"),
            Peer::Cidr(cidr) => f.write_str(cidr),
            Peer::Boundary(id) => write!(f, "boundary:{}", id),
        }
    }
}

/// How a peer-boundary rule is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    /// Attached when the owning boundary is created; the peer must exist first.
    #[default]
    Inline,
    /// Attached in its own step once both boundaries are live.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,
    pub protocol: Protocol,
    /// `None` means every port.
    pub port: Option<u16>,
    pub peer: Peer,
    #[serde(default)]
    pub attachment: Attachment,
    #[serde(default)]
    pub description: String,
}

impl Rule {
    pub fn ingress_tcp(port: u16, peer: Peer) -> Self {
        Self {
            direction: Direction::Ingress,
            protocol: Protocol::Tcp,
            port: Some(port),
            peer,
            attachment: Attachment::Inline,
            description: String::new(),
        }
    }

    pub fn egress_all(peer: Peer) -> Self {
        Self {
            direction: Direction::Egress,
            protocol: Protocol::All,
            port: None,
            peer,
            attachment: Attachment::Inline,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn deferred(mut self) -> Self {
        self.attachment = Attachment::Deferred;
        self
    }

    pub fn is_deferred(&self) -> bool {
        self.attachment == Attachment::Deferred
    }
}

/// A security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessBoundary {
    pub network: ResourceId,
    pub description: String,
    pub allow_all_outbound: bool,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    Retain,
    #[default]
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsRule {
    pub allowed_methods: Vec<HttpMethod>,
    pub allowed_origins: Vec<String>,
    pub allowed_headers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStore {
    pub versioned: bool,
    pub block_public_access: bool,
    pub removal: RemovalPolicy,
    /// Empty the bucket before deleting it on teardown.
    pub auto_delete_objects: bool,
    pub cors: Vec<CorsRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEngine {
    pub name: String,
    pub version: String,
}

/// Opaque handle to a credential held by the secret vault.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Generate a password for `username` when the database is created.
    Generated { username: String },
    /// Use a credential already held by the vault.
    Supplied(SecretRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDatabase {
    pub engine: DatabaseEngine,
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub database_name: String,
    pub port: u16,
    pub network: ResourceId,
    pub segment: String,
    pub boundary: ResourceId,
    pub credential: CredentialSource,
    pub delete_automated_backups: bool,
    pub removal: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ObjectStoreRead(ResourceId),
    ObjectStoreReadWrite(ResourceId),
    DatabaseCredentialRead(ResourceId),
    DatabaseDescribe(ResourceId),
    StackMetadataRead,
}

impl Permission {
    /// The resource this permission is scoped to, if any.
    pub fn target(&self) -> Option<&ResourceId> {
        match self {
            Permission::ObjectStoreRead(id)
            | Permission::ObjectStoreReadWrite(id)
            | Permission::DatabaseCredentialRead(id)
            | Permission::DatabaseDescribe(id) => Some(id),
            Permission::StackMetadataRead => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRole {
    pub assumed_by: Principal,
    pub grants: Vec<Permission>,
}

impl IdentityRole {
    /// Databases whose credential this role may read.
    pub fn credential_grants(&self) -> impl Iterator<Item = &ResourceId> {
        self.grants.iter().filter_map(|p| match p {
            Permission::DatabaseCredentialRead(id) => Some(id),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub instance_type: String,
    pub image: String,
    pub keypair: String,
    pub network: ResourceId,
    pub segment: String,
    pub boundary: ResourceId,
    pub role: ResourceId,
    /// Shell commands handed verbatim to the instance.
    pub bootstrap: Vec<String>,
}

/// Kind-specific configuration of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    NetworkSpace(NetworkSpace),
    AccessBoundary(AccessBoundary),
    ObjectStore(ObjectStore),
    ManagedDatabase(ManagedDatabase),
    IdentityRole(IdentityRole),
    ComputeInstance(ComputeInstance),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    /// Physical name, derived from the naming prefix.
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub spec: ResourceSpec,
}

impl ResourceDescriptor {
    pub fn kind(&self) -> ResourceKind {
        match &self.spec {
            ResourceSpec::NetworkSpace(_) => ResourceKind::NetworkSpace,
            ResourceSpec::AccessBoundary(_) => ResourceKind::AccessBoundary,
            ResourceSpec::ObjectStore(_) => ResourceKind::ObjectStore,
            ResourceSpec::ManagedDatabase(_) => ResourceKind::ManagedDatabase,
            ResourceSpec::IdentityRole(_) => ResourceKind::IdentityRole,
            ResourceSpec::ComputeInstance(_) => ResourceKind::ComputeInstance,
        }
    }

    /// Removal policy applied on teardown. Only stores and databases can be
    /// retained.
    pub fn removal_policy(&self) -> RemovalPolicy {
        match &self.spec {
            ResourceSpec::ObjectStore(store) => store.removal,
            ResourceSpec::ManagedDatabase(db) => db.removal,
            _ => RemovalPolicy::Destroy,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkSpace> {
        match &self.spec {
            ResourceSpec::NetworkSpace(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_boundary(&self) -> Option<&AccessBoundary> {
        match &self.spec {
            ResourceSpec::AccessBoundary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_database(&self) -> Option<&ManagedDatabase> {
        match &self.spec {
            ResourceSpec::ManagedDatabase(db) => Some(db),
            _ => None,
        }
    }

    pub fn as_role(&self) -> Option<&IdentityRole> {
        match &self.spec {
            ResourceSpec::IdentityRole(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ComputeInstance> {
        match &self.spec {
            ResourceSpec::ComputeInstance(i) => Some(i),
            _ => None,
        }
    }
}

/// All descriptors of one environment, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub environment: String,
    pub descriptors: Vec<ResourceDescriptor>,
}

impl DescriptorSet {
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|d| &d.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter().filter(move |d| d.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Egress mode of the segment a resource is placed in.
    pub fn segment_egress(&self, network: &ResourceId, segment: &str) -> Option<EgressMode> {
        self.get(network)
            .and_then(ResourceDescriptor::as_network)
            .and_then(|n| n.segment(segment))
            .map(|s| s.egress)
    }
}

/// Tracked state of a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Pending,
    Created,
    Destroyed,
    /// Left in place on teardown and no longer tracked.
    Retained,
}

impl LifecycleState {
    /// Check if transition to the given state is valid.
    pub fn can_transition_to(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Created) | (Created, Destroyed) | (Created, Retained)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed | LifecycleState::Retained)
    }
}
