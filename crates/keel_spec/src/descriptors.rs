//! Pure construction of the descriptor set for an environment.

use std::collections::BTreeMap;

use tracing::debug;

use crate::environment::{EnvironmentSpec, TopologyMode};
use crate::error::{SpecError, SpecResult};
use crate::models::*;
use crate::validator::SpecValidator;

/// Logical ids of the fixed topology, in declaration order.
pub mod ids {
    pub const NETWORK: &str = "network";
    pub const APP_BOUNDARY: &str = "app-boundary";
    pub const DB_BOUNDARY: &str = "db-boundary";
    pub const BUCKET: &str = "bucket";
    pub const DATABASE: &str = "database";
    pub const INSTANCE_ROLE: &str = "instance-role";
    pub const INSTANCE: &str = "instance";
}

pub const PUBLIC_SEGMENT: &str = "public";
pub const PRIVATE_SEGMENT: &str = "private";

const INSTANCE_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Build one descriptor per logical resource of the environment.
///
/// Fails if the spec does not validate; no partial set is ever returned.
pub fn build_descriptors(spec: &EnvironmentSpec) -> SpecResult<DescriptorSet> {
    let warnings = SpecValidator::validate_environment(spec).into_result()?;
    for warning in &warnings {
        debug!("Spec warning for {}: {}", spec.prefix, warning);
    }

    let topology = spec.topology_mode()?;
    let tags = base_tags(spec, topology);

    let network = ResourceId::new(ids::NETWORK);
    let app_boundary = ResourceId::new(ids::APP_BOUNDARY);
    let db_boundary = ResourceId::new(ids::DB_BOUNDARY);
    let bucket = ResourceId::new(ids::BUCKET);
    let database = ResourceId::new(ids::DATABASE);
    let role = ResourceId::new(ids::INSTANCE_ROLE);

    let descriptor = |id: &ResourceId, suffix: &str, spec_part: ResourceSpec| ResourceDescriptor {
        id: id.clone(),
        name: spec.resource_name(suffix),
        tags: tags.clone(),
        spec: spec_part,
    };

    let descriptors = vec![
        descriptor(
            &network,
            "vpc",
            ResourceSpec::NetworkSpace(network_space(spec, topology)),
        ),
        descriptor(
            &app_boundary,
            "app-sg",
            ResourceSpec::AccessBoundary(AccessBoundary {
                network: network.clone(),
                description: "Allow HTTP and SSH access".to_string(),
                allow_all_outbound: true,
                rules: vec![
                    Rule::ingress_tcp(spec.compute.ssh_port, ingress_peer(&spec.compute.ingress_cidr))
                        .with_description("SSH"),
                    Rule::ingress_tcp(spec.compute.app_port, ingress_peer(&spec.compute.ingress_cidr))
                        .with_description("Application"),
                ],
            }),
        ),
        descriptor(
            &db_boundary,
            "db-sg",
            ResourceSpec::AccessBoundary(AccessBoundary {
                network: network.clone(),
                description: "Allow database access from app".to_string(),
                allow_all_outbound: false,
                rules: vec![Rule::ingress_tcp(
                    spec.database.port,
                    Peer::Boundary(app_boundary.clone()),
                )
                .with_description("Database only from app")],
            }),
        ),
        descriptor(
            &bucket,
            "bucket",
            ResourceSpec::ObjectStore(ObjectStore {
                versioned: spec.storage.versioned,
                block_public_access: spec.storage.block_public_access,
                removal: spec.storage.removal,
                auto_delete_objects: spec.storage.auto_delete_objects,
                cors: spec.storage.cors.clone(),
            }),
        ),
        descriptor(
            &database,
            "db",
            ResourceSpec::ManagedDatabase(ManagedDatabase {
                engine: DatabaseEngine {
                    name: spec.database.engine.clone(),
                    version: spec.database.engine_version.clone(),
                },
                instance_class: spec.database.instance_class.clone(),
                allocated_storage_gb: spec.database.allocated_storage_gb,
                database_name: spec.database.database_name.clone(),
                port: spec.database.port,
                network: network.clone(),
                segment: PRIVATE_SEGMENT.to_string(),
                boundary: db_boundary.clone(),
                credential: match &spec.database.credential_ref {
                    Some(reference) => CredentialSource::Supplied(SecretRef::new(reference.clone())),
                    None => CredentialSource::Generated {
                        username: spec.database.username.clone(),
                    },
                },
                delete_automated_backups: spec.database.delete_automated_backups,
                removal: spec.database.removal,
            }),
        ),
        descriptor(
            &role,
            "instance-role",
            ResourceSpec::IdentityRole(IdentityRole {
                assumed_by: Principal::Service(INSTANCE_PRINCIPAL.to_string()),
                grants: vec![
                    Permission::ObjectStoreReadWrite(bucket.clone()),
                    Permission::DatabaseCredentialRead(database.clone()),
                    Permission::DatabaseDescribe(database.clone()),
                    Permission::StackMetadataRead,
                ],
            }),
        ),
        descriptor(
            &ResourceId::new(ids::INSTANCE),
            "instance",
            ResourceSpec::ComputeInstance(ComputeInstance {
                instance_type: spec.compute.instance_type.clone(),
                image: spec.compute.image.clone(),
                keypair: spec.keypair.trim().to_string(),
                network: network.clone(),
                segment: PUBLIC_SEGMENT.to_string(),
                boundary: app_boundary.clone(),
                role: role.clone(),
                bootstrap: spec.compute.bootstrap.clone(),
            }),
        ),
    ];

    let set = DescriptorSet {
        environment: spec.environment_id().to_string(),
        descriptors,
    };

    let check = SpecValidator::validate_descriptors(&set);
    if !check.valid {
        return Err(SpecError::InvalidSpecification(check.errors.join("; ")));
    }

    debug!(
        "Built {} descriptors for {} ({})",
        set.len(),
        set.environment,
        topology
    );
    Ok(set)
}

fn network_space(spec: &EnvironmentSpec, topology: TopologyMode) -> NetworkSpace {
    let (private_egress, nat_gateways) = match topology {
        TopologyMode::Isolated => (EgressMode::Isolated, 0),
        TopologyMode::Egress => (EgressMode::NatEgress, 1),
    };

    NetworkSpace {
        cidr: spec.network.cidr.clone(),
        az_count: spec.network.az_count,
        nat_gateways,
        segments: vec![
            Segment {
                name: PUBLIC_SEGMENT.to_string(),
                egress: EgressMode::Public,
                cidr_mask: spec.network.subnet_mask,
            },
            Segment {
                name: PRIVATE_SEGMENT.to_string(),
                egress: private_egress,
                cidr_mask: spec.network.subnet_mask,
            },
        ],
    }
}

fn ingress_peer(cidr: &str) -> Peer {
    if cidr == "0.0.0.0/0" {
        Peer::AnyIpv4
    } else {
        Peer::Cidr(cidr.to_string())
    }
}

fn base_tags(spec: &EnvironmentSpec, topology: TopologyMode) -> BTreeMap<String, String> {
    let mut tags = spec.tags.clone();
    tags.insert("keel:environment".to_string(), spec.prefix.clone());
    tags.insert("keel:topology".to_string(), topology.to_string());
    if let Some(region) = &spec.region {
        tags.insert("keel:region".to_string(), region.clone());
    }
    tags
}
