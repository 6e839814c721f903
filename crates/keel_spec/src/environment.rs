//! Environment specification: the single input of a provisioning run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::models::{CorsRule, HttpMethod, RemovalPolicy};

/// Network topology variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Private segments have no route to the internet.
    Isolated,
    /// Private segments reach the internet through NAT.
    Egress,
}

impl TopologyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyMode::Isolated => "isolated",
            TopologyMode::Egress => "egress",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![TopologyMode::Isolated, TopologyMode::Egress]
    }
}

impl FromStr for TopologyMode {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "isolated" => Ok(TopologyMode::Isolated),
            "egress" => Ok(TopologyMode::Egress),
            other => Err(SpecError::UnknownTopology(other.to_string())),
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level run input.
///
/// `topology` is kept as the raw string the caller supplied so that an
/// unrecognised mode is reported as an invalid specification rather than a
/// parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Naming and tag prefix; also the environment identifier.
    pub prefix: String,
    pub keypair: String,
    pub topology: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub compute: ComputeSettings,
}

impl EnvironmentSpec {
    pub fn new(
        topology: impl Into<String>,
        keypair: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            keypair: keypair.into(),
            topology: topology.into(),
            region: None,
            tags: BTreeMap::new(),
            network: NetworkSettings::default(),
            database: DatabaseSettings::default(),
            storage: StorageSettings::default(),
            compute: ComputeSettings::default(),
        }
    }

    pub fn isolated(keypair: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(TopologyMode::Isolated.as_str(), keypair, prefix)
    }

    pub fn egress(keypair: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(TopologyMode::Egress.as_str(), keypair, prefix)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn topology_mode(&self) -> Result<TopologyMode, SpecError> {
        self.topology.parse()
    }

    /// Identifier used to serialise runs against the same environment.
    pub fn environment_id(&self) -> &str {
        &self.prefix
    }

    /// Physical resource name for a logical resource.
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.prefix, suffix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub cidr: String,
    pub az_count: u8,
    pub subnet_mask: u8,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            az_count: 2,
            subnet_mask: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub database_name: String,
    pub username: String,
    pub port: u16,
    pub delete_automated_backups: bool,
    pub removal: RemovalPolicy,
    /// Use an existing vault credential instead of generating one.
    pub credential_ref: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "postgres".to_string(),
            engine_version: "14".to_string(),
            instance_class: "burstable3.micro".to_string(),
            allocated_storage_gb: 20,
            database_name: "appdb".to_string(),
            username: "postgres".to_string(),
            port: 5432,
            delete_automated_backups: true,
            removal: RemovalPolicy::Destroy,
            credential_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub versioned: bool,
    pub block_public_access: bool,
    pub removal: RemovalPolicy,
    pub auto_delete_objects: bool,
    pub cors: Vec<CorsRule>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            versioned: false,
            block_public_access: true,
            removal: RemovalPolicy::Destroy,
            auto_delete_objects: true,
            cors: vec![CorsRule {
                allowed_methods: vec![HttpMethod::Get, HttpMethod::Put, HttpMethod::Post],
                allowed_origins: vec!["*".to_string()],
                allowed_headers: vec!["*".to_string()],
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    pub instance_type: String,
    pub image: String,
    pub ssh_port: u16,
    pub app_port: u16,
    /// Source range allowed to reach the SSH and application ports.
    pub ingress_cidr: String,
    pub bootstrap: Vec<String>,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            instance_type: "t2.micro".to_string(),
            image: "amazon-linux-2023".to_string(),
            ssh_port: 22,
            app_port: 8080,
            ingress_cidr: "0.0.0.0/0".to_string(),
            bootstrap: vec![
                "#!/bin/bash".to_string(),
                "yum update -y".to_string(),
                "yum install -y java-17-amazon-corretto".to_string(),
                "mkdir -p /opt/app".to_string(),
            ],
        }
    }
}
