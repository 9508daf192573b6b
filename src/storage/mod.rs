//! # Secret storage
//!
//! Durable key/value store the signer writes CA material and serving
//! certificates to. Values are opaque string-keyed byte maps, keyed by
//! namespace and name.
//!
//! Two backends:
//! - [`InMemorySecretStore`] for tests, offline runs and local smoke tests
//! - `KubeSecretStore` (feature `kubernetes`) on top of the API server

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::domain::{SecretData, MANAGED_LABEL};
use crate::errors::Result;

pub mod memory;

#[cfg(feature = "kubernetes")]
pub mod kube;

pub use memory::InMemorySecretStore;

#[cfg(feature = "kubernetes")]
pub use self::kube::KubeSecretStore;

/// Owner of a stored secret. Deleting the owner garbage-collects the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerReference {
    pub fn service(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self { kind: "Service".to_string(), name: name.into(), uid: uid.into() }
    }
}

/// A secret as read from or written to the store.
///
/// `resource_version` is set by the store. Passing it back on update makes the
/// write conditional on nobody having changed the secret in between.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StoredSecret {
    pub namespace: String,
    pub name: String,
    pub secret_type: String,
    pub data: SecretData,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub resource_version: Option<String>,
}

impl StoredSecret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    pub fn with_type(mut self, secret_type: impl Into<String>) -> Self {
        self.secret_type = secret_type.into();
        self
    }

    pub fn with_data(mut self, data: SecretData) -> Self {
        self.data = data;
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Mark the secret as managed by the signer.
    pub fn managed(mut self) -> Self {
        self.labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        self
    }

    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_LABEL).map(|v| v == "true").unwrap_or(false)
    }

    pub fn resource(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSecret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("secret_type", &self.secret_type)
            .field("data_keys", &self.data.keys().collect::<Vec<_>>())
            .field("annotations", &self.annotations)
            .field("labels", &self.labels)
            .field("owner", &self.owner)
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

/// Trait for secret storage backends.
///
/// # Security Considerations
///
/// - Implementations MUST NOT log secret data
/// - Errors MUST NOT include secret data
///
/// # Errors
///
/// Backend failures and timeouts are reported as [`Error::Persistence`] and
/// are retried by callers. Precondition failures are [`Error::Conflict`].
///
/// [`Error::Persistence`]: crate::errors::Error::Persistence
/// [`Error::Conflict`]: crate::errors::Error::Conflict
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret. A missing secret is `Ok(None)`.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<StoredSecret>>;

    /// Create a secret.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`](crate::errors::Error::Conflict) if it already exists
    async fn create_secret(&self, secret: StoredSecret) -> Result<StoredSecret>;

    /// Replace a secret's contents.
    ///
    /// When `secret.resource_version` is set, the write only succeeds if the
    /// stored version still matches.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`](crate::errors::Error::NotFound) if the secret is gone
    /// - [`Error::Conflict`](crate::errors::Error::Conflict) on a version mismatch
    async fn update_secret(&self, secret: StoredSecret) -> Result<StoredSecret>;

    /// Delete a secret. Deleting a missing secret succeeds.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// List every secret carrying the managed label, across namespaces.
    async fn list_managed_secrets(&self) -> Result<Vec<StoredSecret>>;
}
