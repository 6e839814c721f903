//! Credential vault.
//!
//! Database credentials never travel in descriptors, requests or state
//! files; only their [`SecretRef`] does. Reading a secret requires a grant
//! for the reading role.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use keel_spec::{ResourceId, SecretRef};

use crate::error::{CoreError, CoreResult};

const PASSWORD_LENGTH: usize = 32;

/// A database credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn generate(username: impl Into<String>) -> Self {
        let password = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        Self {
            username: username.into(),
            password,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Secret storage with role-scoped read access.
pub trait CredentialVault: Send + Sync {
    /// Create a credential for `database` unless one exists already.
    fn generate(&self, environment: &str, database: &ResourceId, username: &str) -> CoreResult<SecretRef>;

    /// Store a credential under a caller-chosen reference.
    fn store(&self, reference: SecretRef, credential: Credential) -> CoreResult<()>;

    fn contains(&self, reference: &SecretRef) -> bool;

    fn grant(&self, reference: &SecretRef, role: &ResourceId) -> CoreResult<()>;

    fn can_read(&self, reference: &SecretRef, role: &ResourceId) -> bool;

    /// Read a credential on behalf of `role`.
    fn read(&self, reference: &SecretRef, role: &ResourceId) -> CoreResult<Credential>;

    /// Replace the password, keeping the username. Returns the new version.
    fn rotate(&self, reference: &SecretRef) -> CoreResult<u32>;

    fn remove(&self, reference: &SecretRef) -> CoreResult<()>;
}

/// Reference under which a generated database credential is kept.
pub fn generated_ref(environment: &str, database: &ResourceId) -> SecretRef {
    SecretRef::new(format!("secret://{}/{}/credentials", environment, database))
}

#[derive(Debug)]
struct StoredSecret {
    credential: Credential,
    version: u32,
    readers: BTreeSet<ResourceId>,
}

/// Process-local vault.
#[derive(Clone, Default)]
pub struct InMemoryVault {
    secrets: Arc<RwLock<BTreeMap<SecretRef, StoredSecret>>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a supplied credential.
    pub fn with_secret(self, reference: impl Into<String>, credential: Credential) -> Self {
        self.secrets.write().insert(
            SecretRef::new(reference),
            StoredSecret {
                credential,
                version: 1,
                readers: BTreeSet::new(),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    pub fn version(&self, reference: &SecretRef) -> Option<u32> {
        self.secrets.read().get(reference).map(|s| s.version)
    }
}

impl CredentialVault for InMemoryVault {
    fn generate(&self, environment: &str, database: &ResourceId, username: &str) -> CoreResult<SecretRef> {
        let reference = generated_ref(environment, database);
        let mut secrets = self.secrets.write();
        if !secrets.contains_key(&reference) {
            secrets.insert(
                reference.clone(),
                StoredSecret {
                    credential: Credential::generate(username),
                    version: 1,
                    readers: BTreeSet::new(),
                },
            );
            info!("Generated credential {}", reference);
        }
        Ok(reference)
    }

    fn store(&self, reference: SecretRef, credential: Credential) -> CoreResult<()> {
        let mut secrets = self.secrets.write();
        let version = secrets.get(&reference).map_or(1, |s| s.version + 1);
        let readers = secrets
            .remove(&reference)
            .map(|s| s.readers)
            .unwrap_or_default();
        secrets.insert(
            reference,
            StoredSecret {
                credential,
                version,
                readers,
            },
        );
        Ok(())
    }

    fn contains(&self, reference: &SecretRef) -> bool {
        self.secrets.read().contains_key(reference)
    }

    fn grant(&self, reference: &SecretRef, role: &ResourceId) -> CoreResult<()> {
        let mut secrets = self.secrets.write();
        let secret = secrets
            .get_mut(reference)
            .ok_or_else(|| CoreError::SecretNotFound(reference.clone()))?;
        if secret.readers.insert(role.clone()) {
            debug!("Granted {} read access to {}", role, reference);
        }
        Ok(())
    }

    fn can_read(&self, reference: &SecretRef, role: &ResourceId) -> bool {
        self.secrets
            .read()
            .get(reference)
            .is_some_and(|s| s.readers.contains(role))
    }

    fn read(&self, reference: &SecretRef, role: &ResourceId) -> CoreResult<Credential> {
        let secrets = self.secrets.read();
        let secret = secrets
            .get(reference)
            .ok_or_else(|| CoreError::SecretNotFound(reference.clone()))?;
        if !secret.readers.contains(role) {
            return Err(CoreError::AccessDenied {
                role: role.clone(),
                secret: reference.clone(),
            });
        }
        Ok(secret.credential.clone())
    }

    fn rotate(&self, reference: &SecretRef) -> CoreResult<u32> {
        let mut secrets = self.secrets.write();
        let secret = secrets
            .get_mut(reference)
            .ok_or_else(|| CoreError::SecretNotFound(reference.clone()))?;
        secret.credential = Credential::generate(secret.credential.username.clone());
        secret.version += 1;
        info!("Rotated {} to version {}", reference, secret.version);
        Ok(secret.version)
    }

    fn remove(&self, reference: &SecretRef) -> CoreResult<()> {
        self.secrets
            .write()
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| CoreError::SecretNotFound(reference.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_idempotent() {
        let vault = InMemoryVault::new();
        let db = ResourceId::new("database");

        let first = vault.generate("dev", &db, "admin").unwrap();
        let second = vault.generate("dev", &db, "admin").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "secret://dev/database/credentials");
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_read_requires_grant() {
        let vault = InMemoryVault::new();
        let db = ResourceId::new("database");
        let role = ResourceId::new("instance-role");
        let reference = vault.generate("dev", &db, "admin").unwrap();

        assert!(matches!(
            vault.read(&reference, &role),
            Err(CoreError::AccessDenied { .. })
        ));

        vault.grant(&reference, &role).unwrap();
        let credential = vault.read(&reference, &role).unwrap();
        assert_eq!(credential.username, "admin");
        assert_eq!(credential.password.len(), PASSWORD_LENGTH);
        assert!(credential.password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_rotate_keeps_username_and_grants() {
        let vault = InMemoryVault::new();
        let db = ResourceId::new("database");
        let role = ResourceId::new("instance-role");
        let reference = vault.generate("dev", &db, "admin").unwrap();
        vault.grant(&reference, &role).unwrap();

        let before = vault.read(&reference, &role).unwrap();
        assert_eq!(vault.rotate(&reference).unwrap(), 2);
        let after = vault.read(&reference, &role).unwrap();

        assert_eq!(after.username, before.username);
        assert_ne!(after.password, before.password);
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential::generate("admin");
        let printed = format!("{:?}", credential);
        assert!(printed.contains("admin"));
        assert!(!printed.contains(&credential.password));
    }

    #[test]
    fn test_missing_secret() {
        let vault = InMemoryVault::new();
        let reference = SecretRef::new("secret://nope");
        assert!(!vault.contains(&reference));
        assert!(matches!(
            vault.grant(&reference, &"role".into()),
            Err(CoreError::SecretNotFound(_))
        ));
        assert!(vault.remove(&reference).is_err());
    }
}
