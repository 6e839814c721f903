//! Environment outputs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_backend::{attrs, ProvisioningBackend};
use keel_spec::{ids, ResourceId};

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::HandleRegistry;

/// Named values published after a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutputName {
    BucketName,
    DatabaseEndpoint,
    DatabasePort,
    InstancePublicIp,
}

impl OutputName {
    pub fn all() -> [OutputName; 4] {
        [
            OutputName::BucketName,
            OutputName::DatabaseEndpoint,
            OutputName::DatabasePort,
            OutputName::InstancePublicIp,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputName::BucketName => "BucketName",
            OutputName::DatabaseEndpoint => "DatabaseEndpoint",
            OutputName::DatabasePort => "DatabasePort",
            OutputName::InstancePublicIp => "InstancePublicIp",
        }
    }

    /// Resource and live attribute an output is read from.
    pub fn source(&self) -> (ResourceId, &'static str) {
        match self {
            OutputName::BucketName => (ResourceId::new(ids::BUCKET), attrs::BUCKET_NAME),
            OutputName::DatabaseEndpoint => {
                (ResourceId::new(ids::DATABASE), attrs::ENDPOINT_ADDRESS)
            }
            OutputName::DatabasePort => (ResourceId::new(ids::DATABASE), attrs::ENDPOINT_PORT),
            OutputName::InstancePublicIp => (ResourceId::new(ids::INSTANCE), attrs::PUBLIC_IP),
        }
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSet(BTreeMap<OutputName, String>);

impl OutputSet {
    pub fn get(&self, name: OutputName) -> Option<&str> {
        self.0.get(&name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutputName, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reads outputs from live handles, asking the backend for attributes the
/// create response did not carry.
#[derive(Debug, Clone)]
pub struct OutputProjector {
    names: Vec<OutputName>,
}

impl Default for OutputProjector {
    fn default() -> Self {
        Self::standard()
    }
}

impl OutputProjector {
    pub fn standard() -> Self {
        Self {
            names: OutputName::all().to_vec(),
        }
    }

    pub fn only(names: Vec<OutputName>) -> Self {
        Self { names }
    }

    pub async fn resolve(
        &self,
        registry: &HandleRegistry,
        backend: &dyn ProvisioningBackend,
    ) -> CoreResult<OutputSet> {
        let mut described: BTreeMap<ResourceId, BTreeMap<String, String>> = BTreeMap::new();
        let mut outputs = BTreeMap::new();

        for name in &self.names {
            let (resource, attribute) = name.source();
            let unresolved = |reason: String| CoreError::UnresolvedOutput {
                name: name.to_string(),
                resource: resource.clone(),
                reason,
            };

            let handle = registry
                .handle(&resource)
                .ok_or_else(|| unresolved("was never created".to_string()))?;

            let value = match handle.attribute(attribute) {
                Some(value) => value.to_string(),
                None => {
                    if !described.contains_key(&resource) {
                        debug!("Describing {} for output {}", resource, name);
                        let attributes = backend
                            .describe(handle)
                            .await
                            .map_err(|e| unresolved(format!("could not be described: {}", e)))?;
                        described.insert(resource.clone(), attributes);
                    }
                    described
                        .get(&resource)
                        .and_then(|a| a.get(attribute))
                        .cloned()
                        .ok_or_else(|| unresolved(format!("has no attribute '{}'", attribute)))?
                }
            };
            outputs.insert(*name, value);
        }

        Ok(OutputSet(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_backend::{LiveHandle, TargetKind};
    use keel_spec::ResourceKind;

    fn registry_with(handles: Vec<LiveHandle>) -> HandleRegistry {
        let mut registry = HandleRegistry::new("dev");
        for handle in handles {
            registry.record(handle).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_missing_resource_unresolved() {
        let backend = keel_backend::SimulatedBackend::new();
        let registry = registry_with(vec![LiveHandle::new(
            ids::BUCKET.into(),
            TargetKind::Resource(ResourceKind::ObjectStore),
            "bucket-0001",
        )
        .with_attribute(attrs::BUCKET_NAME, "dev-bucket")]);

        let only_bucket = OutputProjector::only(vec![OutputName::BucketName])
            .resolve(&registry, &backend)
            .await
            .unwrap();
        assert_eq!(only_bucket.get(OutputName::BucketName), Some("dev-bucket"));

        let err = OutputProjector::standard()
            .resolve(&registry, &backend)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnresolvedOutput { ref name, .. } if name == "DatabaseEndpoint"
        ));
        assert!(err.to_string().contains("never created"));
    }

    #[test]
    fn test_output_set_serializes_by_name() {
        let mut map = BTreeMap::new();
        map.insert(OutputName::DatabasePort, "5432".to_string());
        let json = serde_json::to_string(&OutputSet(map)).unwrap();
        assert_eq!(json, r#"{"DatabasePort":"5432"}"#);
    }
}
