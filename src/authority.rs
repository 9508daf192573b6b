//! # CA repository
//!
//! Reads and writes CA material and the versioned CA state record. Every
//! decision about which CA is active is re-derived from the store; the only
//! in-process state is the last generation seen and the last bundle
//! published, both exposed through `watch` channels.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SignerSettings;
use crate::domain::{CaStateRecord, CaStatus, CertificateAuthority, SecretData, TLS_SECRET_TYPE};
use crate::errors::{Error, Result};
use crate::pki::{decode_single, encode_chain, CrossSignedPair, TrustBundle};
use crate::retry::{retry_transient, RetryConfig};
use crate::storage::{SecretStore, StoredSecret};

pub const OPAQUE_SECRET_TYPE: &str = "Opaque";
pub const STATE_KEY: &str = "state.json";
pub const OLD_SIGNED_BY_NEW_KEY: &str = "old-signed-by-new.crt";
pub const NEW_SIGNED_BY_OLD_KEY: &str = "new-signed-by-old.crt";
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Where CA material lives in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaSecretNames {
    pub namespace: String,
    pub active: String,
    pub next: String,
    pub cross_signed: String,
    pub state: String,
    pub bundle: String,
}

impl From<&SignerSettings> for CaSecretNames {
    fn from(settings: &SignerSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            active: settings.ca_secret_name.clone(),
            next: settings.next_ca_secret_name.clone(),
            cross_signed: settings.cross_signed_secret_name.clone(),
            state: settings.state_secret_name.clone(),
            bundle: settings.bundle_secret_name.clone(),
        }
    }
}

/// State record plus the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedState {
    pub record: CaStateRecord,
    pub resource_version: Option<String>,
}

/// Everything verifiers and issuers need at one generation.
#[derive(Debug, Clone)]
pub struct TrustSnapshot {
    pub state: CaStateRecord,
    pub active: CertificateAuthority,
    pub next: Option<CertificateAuthority>,
    pub cross_signed: Option<CrossSignedPair>,
}

impl TrustSnapshot {
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Anchored on the active CA, with the cross-signed pair as intermediates
    /// while a rotation is in progress.
    pub fn trust_bundle(&self) -> TrustBundle {
        let intermediates = self
            .cross_signed
            .as_ref()
            .map(|pair| pair.certificates().into_iter().cloned().collect())
            .unwrap_or_default();
        TrustBundle::new(vec![self.active.certificate().clone()]).with_intermediates(intermediates)
    }

    /// PEM blob for injection: the active CA, then during overlap the next CA,
    /// `new_signed_by_old` and `old_signed_by_new`.
    pub fn ca_bundle_pem(&self) -> Vec<u8> {
        let mut certs = vec![self.active.certificate()];
        if let Some(next) = &self.next {
            if next.serial() != self.active.serial() {
                certs.push(next.certificate());
            }
        }
        if let Some(pair) = &self.cross_signed {
            certs.push(&pair.new_signed_by_old);
            certs.push(&pair.old_signed_by_new);
        }
        encode_chain(certs)
    }
}

pub struct CaRepository {
    store: Arc<dyn SecretStore>,
    names: CaSecretNames,
    retry: RetryConfig,
    bundle_file: Option<PathBuf>,
    generation: watch::Sender<u64>,
    bundle: watch::Sender<Vec<u8>>,
}

impl CaRepository {
    pub fn new(store: Arc<dyn SecretStore>, names: CaSecretNames, retry: RetryConfig) -> Self {
        let (generation, _) = watch::channel(0);
        let (bundle, _) = watch::channel(Vec::new());
        Self { store, names, retry, bundle_file: None, generation, bundle }
    }

    pub fn from_settings(store: Arc<dyn SecretStore>, settings: &SignerSettings, retry: RetryConfig) -> Self {
        Self::new(store, CaSecretNames::from(settings), retry).with_bundle_file(settings.ca_bundle_file.clone())
    }

    /// Mirror every published bundle to `path`.
    pub fn with_bundle_file(mut self, path: Option<PathBuf>) -> Self {
        self.bundle_file = path;
        self
    }

    pub fn names(&self) -> &CaSecretNames {
        &self.names
    }

    /// Generation changes, for controllers that re-evaluate on CA change.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Published CA bundle blob.
    pub fn subscribe_bundle(&self) -> watch::Receiver<Vec<u8>> {
        self.bundle.subscribe()
    }

    pub fn current_bundle(&self) -> Vec<u8> {
        self.bundle.borrow().clone()
    }

    fn note_generation(&self, generation: u64) {
        self.generation.send_if_modified(|current| {
            if *current != generation {
                *current = generation;
                true
            } else {
                false
            }
        });
    }

    async fn get(&self, name: &str) -> Result<Option<StoredSecret>> {
        let store = &self.store;
        let namespace = &self.names.namespace;
        retry_transient(&self.retry, "get_secret", || store.get_secret(namespace, name)).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let store = &self.store;
        let namespace = &self.names.namespace;
        retry_transient(&self.retry, "delete_secret", || store.delete_secret(namespace, name)).await
    }

    /// Create or replace `name`. The replace is conditional on the version
    /// read just before; losing that race is a `RotationConflict`.
    async fn put(&self, name: &str, secret_type: &str, data: SecretData, generation: u64) -> Result<()> {
        let current = self.get(name).await?;
        let mut secret = StoredSecret::new(&self.names.namespace, name).with_type(secret_type).with_data(data);

        let store = &self.store;
        let result = match current {
            Some(existing) => {
                secret.resource_version = existing.resource_version;
                retry_transient(&self.retry, "update_secret", || store.update_secret(secret.clone())).await
            }
            None => retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(Error::Conflict { .. }) | Err(Error::NotFound { .. }) => Err(Error::RotationConflict { generation }),
            Err(e) => Err(e),
        }
    }

    pub async fn load_state(&self) -> Result<Option<VersionedState>> {
        let Some(secret) = self.get(&self.names.state).await? else {
            return Ok(None);
        };
        let raw = secret
            .data
            .get(STATE_KEY)
            .ok_or_else(|| Error::malformed(format!("{} has no {}", secret.resource(), STATE_KEY)))?;
        let record: CaStateRecord = serde_json::from_slice(raw)
            .map_err(|e| Error::malformed(format!("invalid CA state record: {}", e)))?;
        Ok(Some(VersionedState { record, resource_version: secret.resource_version }))
    }

    pub async fn load_active(&self) -> Result<Option<CertificateAuthority>> {
        match self.get(&self.names.active).await? {
            Some(secret) => CertificateAuthority::from_secret_data(&secret.data).map(Some),
            None => Ok(None),
        }
    }

    /// Replacement CA. Undecodable material reads as absent so it gets
    /// regenerated.
    pub async fn load_next(&self) -> Result<Option<CertificateAuthority>> {
        let Some(secret) = self.get(&self.names.next).await? else {
            return Ok(None);
        };
        match CertificateAuthority::from_secret_data(&secret.data) {
            Ok(ca) => Ok(Some(ca)),
            Err(e) => {
                warn!(secret = %secret.resource(), error = %e, "Ignoring undecodable replacement CA");
                Ok(None)
            }
        }
    }

    /// Cross-signed pair. Undecodable material reads as absent.
    pub async fn load_cross_signed(&self) -> Result<Option<CrossSignedPair>> {
        let Some(secret) = self.get(&self.names.cross_signed).await? else {
            return Ok(None);
        };
        let decode = |key: &str| -> Result<_> {
            let bytes = secret.data.get(key).ok_or_else(|| Error::malformed(format!("missing {}", key)))?;
            decode_single(bytes, key).map_err(|e| Error::malformed(e.to_string()))
        };
        match (decode(OLD_SIGNED_BY_NEW_KEY), decode(NEW_SIGNED_BY_OLD_KEY)) {
            (Ok(old_signed_by_new), Ok(new_signed_by_old)) => {
                Ok(Some(CrossSignedPair { old_signed_by_new, new_signed_by_old }))
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(secret = %secret.resource(), error = %e, "Ignoring undecodable cross-signed pair");
                Ok(None)
            }
        }
    }

    /// Load the current trust snapshot.
    pub async fn snapshot(&self) -> Result<TrustSnapshot> {
        let state = self
            .load_state()
            .await?
            .ok_or_else(|| Error::not_found(format!("{}/{}", self.names.namespace, self.names.state)))?
            .record;
        let active = self
            .load_active()
            .await?
            .ok_or_else(|| Error::not_found(format!("{}/{}", self.names.namespace, self.names.active)))?;

        let (next, cross_signed) = if state.status == CaStatus::Active {
            (None, None)
        } else {
            let next = self.load_next().await?;
            let pair = self.load_cross_signed().await?;
            // Only a pair that bridges the two CAs on record counts as trust.
            let pair = match (&next, pair) {
                (Some(next), Some(pair)) if next.serial() != active.serial() => {
                    Some(pair).filter(|p| p.bridges(active.certificate(), next.certificate()))
                }
                // Already promoted: the pair must hang off the new active CA.
                (Some(_), Some(pair)) => Some(pair).filter(|p| p.old_signed_by_new.is_issued_by(active.certificate())),
                _ => None,
            };
            (next, pair)
        };

        self.note_generation(state.generation);
        Ok(TrustSnapshot { state, active, next, cross_signed })
    }

    /// Seed CA material when the store has none. Existing material always
    /// wins over `seed`.
    pub async fn bootstrap<F>(&self, seed: F, now: time::OffsetDateTime) -> Result<TrustSnapshot>
    where
        F: FnOnce() -> Result<CertificateAuthority>,
    {
        let active = match self.load_active().await? {
            Some(ca) => {
                debug!(serial = %ca.serial(), "Using stored signing CA");
                ca
            }
            None => {
                let ca = seed()?;
                let secret = StoredSecret::new(&self.names.namespace, &self.names.active)
                    .with_type(TLS_SECRET_TYPE)
                    .with_data(ca.to_secret_data()?);
                let store = &self.store;
                match retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await {
                    Ok(_) => {
                        info!(serial = %ca.serial(), subject = %ca.certificate().subject(), "Stored bootstrap signing CA");
                        ca
                    }
                    Err(Error::Conflict { .. }) => self
                        .load_active()
                        .await?
                        .ok_or_else(|| Error::internal("signing CA vanished during bootstrap"))?,
                    Err(e) => return Err(e),
                }
            }
        };

        if self.load_state().await?.is_none() {
            let record = CaStateRecord::initial(active.serial(), now);
            let secret = StoredSecret::new(&self.names.namespace, &self.names.state)
                .with_type(OPAQUE_SECRET_TYPE)
                .with_data(state_data(&record)?);
            let store = &self.store;
            match retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await {
                Ok(_) | Err(Error::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let snapshot = self.snapshot().await?;
        self.publish_bundle(&snapshot).await?;
        Ok(snapshot)
    }

    /// Replace the state record only if it is still at `current`'s version.
    pub async fn compare_and_swap(&self, current: &VersionedState, next: CaStateRecord) -> Result<VersionedState> {
        let mut secret = StoredSecret::new(&self.names.namespace, &self.names.state)
            .with_type(OPAQUE_SECRET_TYPE)
            .with_data(state_data(&next)?);
        secret.resource_version = current.resource_version.clone();

        let store = &self.store;
        match retry_transient(&self.retry, "update_secret", || store.update_secret(secret.clone())).await {
            Ok(written) => {
                debug!(
                    from = current.record.generation,
                    to = next.generation,
                    status = %next.status,
                    "CA state record updated"
                );
                self.note_generation(next.generation);
                Ok(VersionedState { record: next, resource_version: written.resource_version })
            }
            Err(Error::Conflict { .. }) | Err(Error::NotFound { .. }) => {
                Err(Error::RotationConflict { generation: current.record.generation })
            }
            Err(e) => Err(e),
        }
    }

    /// Store `ca` as the replacement CA. Only replaces an existing secret
    /// holding `stale` (or undecodable material); any other stored replacement
    /// belongs to a concurrent rotation and yields `RotationConflict`.
    pub async fn write_next(&self, ca: &CertificateAuthority, generation: u64, stale: Option<&str>) -> Result<()> {
        let mut secret = StoredSecret::new(&self.names.namespace, &self.names.next)
            .with_type(TLS_SECRET_TYPE)
            .with_data(ca.to_secret_data()?);

        let store = &self.store;
        let result = match self.get(&self.names.next).await? {
            None => retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await,
            Some(existing) => {
                if let Ok(held) = CertificateAuthority::from_secret_data(&existing.data) {
                    if Some(held.serial()) != stale {
                        debug!(serial = %held.serial(), "Replacement CA already claimed");
                        return Err(Error::RotationConflict { generation });
                    }
                }
                secret.resource_version = existing.resource_version;
                retry_transient(&self.retry, "update_secret", || store.update_secret(secret.clone())).await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(Error::Conflict { .. }) | Err(Error::NotFound { .. }) => Err(Error::RotationConflict { generation }),
            Err(e) => Err(e),
        }
    }

    pub async fn write_cross_signed(&self, pair: &CrossSignedPair, generation: u64) -> Result<()> {
        let mut data = SecretData::new();
        data.insert(OLD_SIGNED_BY_NEW_KEY.to_string(), encode_chain([&pair.old_signed_by_new]));
        data.insert(NEW_SIGNED_BY_OLD_KEY.to_string(), encode_chain([&pair.new_signed_by_old]));
        self.put(&self.names.cross_signed, OPAQUE_SECRET_TYPE, data, generation).await
    }

    /// Overwrite the active CA secret with `ca`. The old signing key is gone
    /// after this call.
    pub async fn promote(&self, ca: &CertificateAuthority, generation: u64) -> Result<()> {
        self.put(&self.names.active, TLS_SECRET_TYPE, ca.to_secret_data()?, generation).await
    }

    /// Delete the replacement CA and the cross-signed pair.
    pub async fn discard_rotation_material(&self) -> Result<()> {
        self.delete(&self.names.cross_signed).await?;
        self.delete(&self.names.next).await
    }

    /// Persist the snapshot's CA bundle, mirror it to the bundle file, and
    /// notify subscribers. Returns whether anything changed.
    pub async fn publish_bundle(&self, snapshot: &TrustSnapshot) -> Result<bool> {
        let blob = snapshot.ca_bundle_pem();

        let stored = self.get(&self.names.bundle).await?;
        let stored_blob = stored.as_ref().and_then(|s| s.data.get(CA_BUNDLE_KEY));
        let mut changed = false;
        if stored_blob != Some(&blob) {
            let mut data = SecretData::new();
            data.insert(CA_BUNDLE_KEY.to_string(), blob.clone());
            let mut secret = StoredSecret::new(&self.names.namespace, &self.names.bundle)
                .with_type(OPAQUE_SECRET_TYPE)
                .with_data(data);
            let store = &self.store;
            match stored {
                Some(existing) => {
                    secret.resource_version = existing.resource_version;
                    retry_transient(&self.retry, "update_secret", || store.update_secret(secret.clone())).await?;
                }
                None => {
                    retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await?;
                }
            }
            changed = true;
        }

        if let Some(path) = &self.bundle_file {
            let on_disk = tokio::fs::read(path).await.ok();
            if on_disk.as_deref() != Some(blob.as_slice()) {
                write_atomically(path, &blob).await?;
                changed = true;
            }
        }

        let notified = self.bundle.send_if_modified(|current| {
            if *current != blob {
                *current = blob.clone();
                true
            } else {
                false
            }
        });

        if changed || notified {
            info!(
                generation = snapshot.generation(),
                status = %snapshot.state.status,
                certificates = 1 + snapshot.next.is_some() as usize + 2 * snapshot.cross_signed.is_some() as usize,
                "Published CA bundle"
            );
        }
        Ok(changed || notified)
    }
}

fn state_data(record: &CaStateRecord) -> Result<SecretData> {
    let mut data = SecretData::new();
    data.insert(STATE_KEY.to_string(), serde_json::to_vec(record)?);
    Ok(data)
}

async fn write_atomically(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{cross_sign, KeyAlgorithm};
    use crate::storage::InMemorySecretStore;
    use time::{Duration, OffsetDateTime};

    fn repository(store: Arc<InMemorySecretStore>) -> CaRepository {
        CaRepository::from_settings(store, &SignerSettings::default(), RetryConfig::default())
    }

    fn ca(now: OffsetDateTime) -> CertificateAuthority {
        CertificateAuthority::generate("signer@1", KeyAlgorithm::EcdsaP256, Duration::days(30), now).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_once() {
        let store = Arc::new(InMemorySecretStore::new());
        let repo = repository(store.clone());
        let now = OffsetDateTime::now_utc();
        let seeded = ca(now);

        let snapshot = repo.bootstrap(|| Ok(seeded.clone()), now).await.unwrap();
        assert_eq!(snapshot.active, seeded);
        assert_eq!(snapshot.state.status, CaStatus::Active);
        assert_eq!(snapshot.state.active_serial, seeded.serial());
        assert_eq!(repo.current_generation(), 1);

        let again = repo
            .bootstrap(|| Err(Error::internal("seed must not be called")), now)
            .await
            .unwrap();
        assert_eq!(again.active, seeded);
    }

    #[tokio::test]
    async fn test_bundle_is_published() {
        let store = Arc::new(InMemorySecretStore::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle").join("ca-bundle.crt");
        let repo = repository(store.clone()).with_bundle_file(Some(path.clone()));
        let now = OffsetDateTime::now_utc();
        let seeded = ca(now);

        let snapshot = repo.bootstrap(|| Ok(seeded.clone()), now).await.unwrap();

        let expected = encode_chain([seeded.certificate()]);
        assert_eq!(repo.current_bundle(), expected);
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        let secret = store.get_secret("service-ca", "signing-cabundle").await.unwrap().unwrap();
        assert_eq!(secret.data[CA_BUNDLE_KEY], expected);

        assert!(!repo.publish_bundle(&snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_races() {
        let store = Arc::new(InMemorySecretStore::new());
        let repo = repository(store);
        let now = OffsetDateTime::now_utc();
        repo.bootstrap(|| Ok(ca(now)), now).await.unwrap();

        let read = repo.load_state().await.unwrap().unwrap();
        let winner = repo.compare_and_swap(&read, read.record.begin_rotation(now)).await.unwrap();
        assert_eq!(winner.record.status, CaStatus::Rotating);
        assert_eq!(repo.current_generation(), 2);

        let err = repo.compare_and_swap(&read, read.record.begin_rotation(now)).await.unwrap_err();
        assert!(matches!(err, Error::RotationConflict { generation: 1 }));
    }

    #[tokio::test]
    async fn test_overlap_bundle_order() {
        let now = OffsetDateTime::now_utc();
        let old = ca(now);
        let new = old.replacement(Duration::days(60), now).unwrap();
        let pair = cross_sign(old.certificate(), old.key(), new.certificate(), new.key()).unwrap();
        let snapshot = TrustSnapshot {
            state: CaStateRecord::initial(old.serial(), now).begin_rotation(now),
            active: old.clone(),
            next: Some(new.clone()),
            cross_signed: Some(pair.clone()),
        };

        let expected = encode_chain([
            old.certificate(),
            new.certificate(),
            &pair.new_signed_by_old,
            &pair.old_signed_by_new,
        ]);
        assert_eq!(snapshot.ca_bundle_pem(), expected);
        assert_eq!(snapshot.trust_bundle().intermediates().len(), 2);
    }

    #[tokio::test]
    async fn test_rotation_material_round_trip() {
        let store = Arc::new(InMemorySecretStore::new());
        let repo = repository(store);
        let now = OffsetDateTime::now_utc();
        let old = ca(now);
        repo.bootstrap(|| Ok(old.clone()), now).await.unwrap();

        let new = old.replacement(Duration::days(60), now).unwrap();
        let pair = cross_sign(old.certificate(), old.key(), new.certificate(), new.key()).unwrap();
        repo.write_next(&new, 1, None).await.unwrap();
        repo.write_cross_signed(&pair, 1).await.unwrap();

        assert_eq!(repo.load_next().await.unwrap(), Some(new));
        assert_eq!(repo.load_cross_signed().await.unwrap(), Some(pair));

        repo.discard_rotation_material().await.unwrap();
        assert_eq!(repo.load_next().await.unwrap(), None);
        assert_eq!(repo.load_cross_signed().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_next_does_not_overwrite_a_claimed_replacement() {
        let store = Arc::new(InMemorySecretStore::new());
        let repo = repository(store);
        let now = OffsetDateTime::now_utc();
        let old = ca(now);
        repo.bootstrap(|| Ok(old.clone()), now).await.unwrap();

        let first = old.replacement(Duration::days(60), now).unwrap();
        let second = old.replacement(Duration::days(60), now).unwrap();
        repo.write_next(&first, 2, None).await.unwrap();

        let err = repo.write_next(&second, 2, None).await.unwrap_err();
        assert!(matches!(err, Error::RotationConflict { generation: 2 }));
        let err = repo.write_next(&second, 2, Some(old.serial())).await.unwrap_err();
        assert!(matches!(err, Error::RotationConflict { .. }));
        assert_eq!(repo.load_next().await.unwrap(), Some(first.clone()));

        repo.write_next(&second, 2, Some(first.serial())).await.unwrap();
        assert_eq!(repo.load_next().await.unwrap(), Some(second));
    }
}
