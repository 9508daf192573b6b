//! In-memory secret store.
//!
//! Mirrors the API server's semantics closely enough for the controllers:
//! monotonically increasing resource versions, conditional updates, and owner
//! garbage collection on request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SecretStore, StoredSecret};
use crate::errors::{Error, Result};

type SecretId = (String, String);

#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<SecretId, StoredSecret>>,
    version: AtomicU64,
    writes: AtomicUsize,
    lists: AtomicUsize,
    failures: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `list_managed_secrets` calls so far.
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls fail with a persistence error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Delete every secret owned by the object with `uid`, like the API
    /// server's garbage collector.
    pub async fn collect_owned_by(&self, uid: &str) -> usize {
        let mut secrets = self.secrets.write().await;
        let before = secrets.len();
        secrets.retain(|_, secret| secret.owner.as_ref().map(|o| o.uid.as_str()) != Some(uid));
        before - secrets.len()
    }

    fn check_injected_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::persistence("injected store failure"));
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<StoredSecret>> {
        self.check_injected_failure()?;
        let secrets = self.secrets.read().await;
        Ok(secrets.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_secret(&self, mut secret: StoredSecret) -> Result<StoredSecret> {
        self.check_injected_failure()?;
        let mut secrets = self.secrets.write().await;
        let id = (secret.namespace.clone(), secret.name.clone());
        if secrets.contains_key(&id) {
            return Err(Error::conflict(secret.resource()));
        }
        secret.resource_version = Some(self.next_version());
        secrets.insert(id, secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(secret)
    }

    async fn update_secret(&self, mut secret: StoredSecret) -> Result<StoredSecret> {
        self.check_injected_failure()?;
        let mut secrets = self.secrets.write().await;
        let id = (secret.namespace.clone(), secret.name.clone());
        let current = secrets.get(&id).ok_or_else(|| Error::not_found(secret.resource()))?;
        if let Some(expected) = &secret.resource_version {
            if current.resource_version.as_ref() != Some(expected) {
                return Err(Error::conflict(secret.resource()));
            }
        }
        secret.resource_version = Some(self.next_version());
        secrets.insert(id, secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_injected_failure()?;
        let mut secrets = self.secrets.write().await;
        secrets.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_managed_secrets(&self) -> Result<Vec<StoredSecret>> {
        self.check_injected_failure()?;
        self.lists.fetch_add(1, Ordering::SeqCst);
        let secrets = self.secrets.read().await;
        let mut managed: Vec<_> = secrets.values().filter(|s| s.is_managed()).cloned().collect();
        managed.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(managed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OwnerReference;

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = InMemorySecretStore::new();
        let created = store.create_secret(StoredSecret::new("ns1", "a")).await.unwrap();
        assert!(created.resource_version.is_some());

        let fetched = store.get_secret("ns1", "a").await.unwrap().unwrap();
        assert_eq!(fetched, created);

        store.delete_secret("ns1", "a").await.unwrap();
        store.delete_secret("ns1", "a").await.unwrap();
        assert!(store.get_secret("ns1", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let store = InMemorySecretStore::new();
        store.create_secret(StoredSecret::new("ns1", "a")).await.unwrap();

        let err = store.create_secret(StoredSecret::new("ns1", "a")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = InMemorySecretStore::new();
        let created = store.create_secret(StoredSecret::new("ns1", "a")).await.unwrap();

        let updated = store.update_secret(created.clone()).await.unwrap();
        assert_ne!(updated.resource_version, created.resource_version);

        let err = store.update_secret(created).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let err = store.update_secret(StoredSecret::new("ns1", "missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemorySecretStore::new();
        store.fail_next(2);

        assert!(matches!(store.get_secret("ns1", "a").await, Err(Error::Persistence { .. })));
        assert!(matches!(store.get_secret("ns1", "a").await, Err(Error::Persistence { .. })));
        assert!(store.get_secret("ns1", "a").await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_collection_and_managed_listing() {
        let store = InMemorySecretStore::new();
        store
            .create_secret(StoredSecret::new("ns1", "a").managed().with_owner(OwnerReference::service("web", "uid-1")))
            .await
            .unwrap();
        store.create_secret(StoredSecret::new("ns1", "b")).await.unwrap();

        assert_eq!(store.list_managed_secrets().await.unwrap().len(), 1);
        assert_eq!(store.collect_owned_by("uid-1").await, 1);
        assert!(store.list_managed_secrets().await.unwrap().is_empty());
    }
}
