//! Serving-certificate controller.
//!
//! Keeps one TLS Secret per annotated Service signed by a CA the cluster
//! currently trusts. Work arrives from three places: Service watch events,
//! the periodic resync, and CA generation changes. All of it funnels into a
//! de-duplicating queue drained by a pool of workers. Reconciles of the same
//! Service are serialized by a per-key lock; different Services run in
//! parallel.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::authority::{CaRepository, TrustSnapshot};
use crate::config::ControllerSettings;
use crate::domain::{
    to_chrono, ServiceIdentity, ServiceKey, ServiceRecord, ServingCertificate, EXPIRY_ANNOTATION,
    ORIGINATING_SERVICE_NAME_ANNOTATION, ORIGINATING_SERVICE_UID_ANNOTATION, TLS_SECRET_TYPE,
};
use crate::errors::Result;
use crate::issuance::{IssuanceEngine, ReissueReason};
use crate::observability::MetricsRecorder;
use crate::reconcile_span;
use crate::registry::ServiceRegistry;
use crate::retry::{retry_transient, RetryConfig};
use crate::storage::{OwnerReference, SecretStore, StoredSecret};

/// Lifecycle of one service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertState {
    Unwatched,
    Pending,
    Issued,
    Stale,
    Reissuing,
    Removed,
}

impl CertState {
    pub const ALL: [CertState; 6] = [
        CertState::Unwatched,
        CertState::Pending,
        CertState::Issued,
        CertState::Stale,
        CertState::Reissuing,
        CertState::Removed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertState::Unwatched => "unwatched",
            CertState::Pending => "pending",
            CertState::Issued => "issued",
            CertState::Stale => "stale",
            CertState::Reissuing => "reissuing",
            CertState::Removed => "removed",
        }
    }
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible condition of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityStatus {
    pub key: ServiceKey,
    pub state: CertState,
    pub secret_name: Option<String>,
    pub serial: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl IdentityStatus {
    fn new(key: ServiceKey, now: OffsetDateTime) -> Self {
        Self { key, state: CertState::Pending, secret_name: None, serial: None, last_error: None, updated_at: now }
    }
}

/// What a single reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stored certificate is still good; nothing was written.
    Unchanged,
    Issued { serial: String, reason: ReissueReason },
    /// Service or its annotation is gone; `deleted` managed secrets removed.
    Removed { deleted: usize },
    /// Target secret belongs to someone else and was left alone.
    Blocked { reason: String },
}

/// Counts from one resync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub enqueued: usize,
    pub orphans_removed: usize,
}

/// De-duplicating FIFO of service keys.
#[derive(Debug)]
struct WorkQueue {
    tx: mpsc::UnboundedSender<ServiceKey>,
    rx: Mutex<mpsc::UnboundedReceiver<ServiceKey>>,
    queued: DashSet<ServiceKey>,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx), queued: DashSet::new() }
    }

    /// Returns false when the key is already waiting.
    fn push(&self, key: ServiceKey) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        if self.tx.send(key.clone()).is_err() {
            self.queued.remove(&key);
            return false;
        }
        true
    }

    async fn pop(&self) -> Option<ServiceKey> {
        let key = self.rx.lock().await.recv().await?;
        self.queued.remove(&key);
        Some(key)
    }

    fn len(&self) -> usize {
        self.queued.len()
    }
}

pub struct ServiceCertController {
    store: Arc<dyn SecretStore>,
    registry: Arc<dyn ServiceRegistry>,
    authority: Arc<CaRepository>,
    engine: IssuanceEngine,
    cluster_domain: String,
    retry: RetryConfig,
    workers: usize,
    resync_interval: StdDuration,
    queue: Arc<WorkQueue>,
    statuses: DashMap<ServiceKey, IdentityStatus>,
    locks: DashMap<ServiceKey, Arc<Mutex<()>>>,
    attempts: DashMap<ServiceKey, u32>,
    trust: RwLock<Option<Arc<TrustSnapshot>>>,
    metrics: MetricsRecorder,
}

impl ServiceCertController {
    pub fn new(
        store: Arc<dyn SecretStore>,
        registry: Arc<dyn ServiceRegistry>,
        authority: Arc<CaRepository>,
        engine: IssuanceEngine,
        cluster_domain: impl Into<String>,
    ) -> Self {
        let settings = ControllerSettings::default();
        Self {
            store,
            registry,
            authority,
            engine,
            cluster_domain: cluster_domain.into(),
            retry: RetryConfig::from_settings(&settings),
            workers: settings.workers,
            resync_interval: settings.resync_interval(),
            queue: Arc::new(WorkQueue::new()),
            statuses: DashMap::new(),
            locks: DashMap::new(),
            attempts: DashMap::new(),
            trust: RwLock::new(None),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_controller_settings(mut self, settings: &ControllerSettings) -> Self {
        self.retry = RetryConfig::from_settings(settings);
        self.workers = settings.workers.max(1);
        self.resync_interval = settings.resync_interval();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Snapshot of every identity the controller has seen.
    pub fn status(&self) -> Vec<IdentityStatus> {
        let mut statuses: Vec<_> = self.statuses.iter().map(|entry| entry.value().clone()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    pub fn state_of(&self, key: &ServiceKey) -> CertState {
        self.statuses.get(key).map(|s| s.state).unwrap_or(CertState::Unwatched)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue `key` for reconciliation. Returns false if it is already queued.
    pub fn enqueue(&self, key: ServiceKey) -> bool {
        self.queue.push(key)
    }

    /// The CA generation moved: every issued identity must be re-checked.
    pub fn on_ca_changed(&self) -> usize {
        let mut marked = Vec::new();
        for mut entry in self.statuses.iter_mut() {
            if entry.state == CertState::Issued {
                entry.state = CertState::Stale;
                marked.push(entry.key.clone());
            }
        }
        let count = marked.len();
        for key in marked {
            self.enqueue(key);
        }
        if count > 0 {
            info!(identities = count, "CA changed; re-evaluating issued serving certificates");
        }
        count
    }

    fn lock_for(&self, key: &ServiceKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    async fn trust(&self) -> Result<Arc<TrustSnapshot>> {
        let generation = self.authority.current_generation();
        if let Some(snapshot) = self.trust.read().await.as_ref() {
            if snapshot.generation() == generation {
                return Ok(snapshot.clone());
            }
        }
        self.refresh_trust().await
    }

    async fn refresh_trust(&self) -> Result<Arc<TrustSnapshot>> {
        let snapshot = Arc::new(self.authority.snapshot().await?);
        *self.trust.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn get_service(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>> {
        let registry = &self.registry;
        retry_transient(&self.retry, "get_service", || registry.get_service(&key.namespace, &key.name)).await
    }

    /// Bring the Secret for `key` in line with its Service.
    pub async fn reconcile(&self, key: &ServiceKey, now: OffsetDateTime) -> Result<ReconcileOutcome> {
        let span = reconcile_span!(key.namespace, key.name);
        async {
            let lock = self.lock_for(key);
            let guard = lock.lock().await;

            let result = match self.reconcile_locked(key, now).await {
                Ok(outcome) => {
                    self.attempts.remove(key);
                    Ok(outcome)
                }
                Err(e) => {
                    if let Some(mut status) = self.statuses.get_mut(key) {
                        if status.state == CertState::Reissuing {
                            status.state = CertState::Stale;
                        }
                        status.last_error = Some(e.to_string());
                        status.updated_at = now;
                    }
                    self.metrics.record_error(e.kind());
                    Err(e)
                }
            };
            drop(guard);
            drop(lock);
            if matches!(result, Ok(ReconcileOutcome::Removed { .. })) {
                self.release_lock(key);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Forget the per-identity lock unless somebody holds or awaits it.
    fn release_lock(&self, key: &ServiceKey) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn reconcile_locked(&self, key: &ServiceKey, now: OffsetDateTime) -> Result<ReconcileOutcome> {
        let service = self.get_service(key).await?;
        let Some((service, secret_name)) = service
            .as_ref()
            .and_then(|s| s.serving_cert_secret().map(|name| (s, name.to_string())))
        else {
            return self.remove(key, now).await;
        };

        // Targets renamed before this process saw them are left to the resync sweep.
        let renamed = {
            let mut status = self.statuses.entry(key.clone()).or_insert_with(|| IdentityStatus::new(key.clone(), now));
            if matches!(status.state, CertState::Unwatched | CertState::Removed) {
                status.state = CertState::Pending;
                status.serial = None;
            }
            status
                .secret_name
                .replace(secret_name.clone())
                .is_some_and(|previous| previous != secret_name)
        };

        let identity = ServiceIdentity::new(&service.namespace, &service.name, &self.cluster_domain);
        identity.validate()?;

        let store = &self.store;
        let existing = retry_transient(&self.retry, "get_secret", || {
            store.get_secret(&service.namespace, &secret_name)
        })
        .await?;

        if let Some(existing) = &existing {
            if let Some(reason) = foreign_owner(existing, service) {
                warn!(secret = %existing.resource(), reason = %reason, "Not overwriting secret owned elsewhere");
                if let Some(mut status) = self.statuses.get_mut(key) {
                    status.last_error = Some(reason.clone());
                    status.updated_at = now;
                }
                return Ok(ReconcileOutcome::Blocked { reason });
            }
        }

        let trust = self.trust().await?;
        let reason =
            self.engine
                .reissue_reason(existing.as_ref().map(|s| &s.data), &identity, &trust.trust_bundle(), now);

        let Some(reason) = reason else {
            let serial = existing
                .as_ref()
                .and_then(|s| ServingCertificate::from_secret_data(&s.data).ok())
                .map(|serving| serving.certificate.serial().to_string());
            if let Some(mut status) = self.statuses.get_mut(key) {
                status.state = CertState::Issued;
                status.serial = serial;
                status.last_error = None;
                status.updated_at = now;
            }
            debug!(secret = %secret_name, "Serving certificate is current");
            if renamed {
                self.remove_stale_secrets(service, &secret_name).await?;
            }
            return Ok(ReconcileOutcome::Unchanged);
        };

        if let Some(mut status) = self.statuses.get_mut(key) {
            if matches!(status.state, CertState::Issued | CertState::Stale) {
                status.state = CertState::Reissuing;
            }
            status.updated_at = now;
        }
        debug!(secret = %secret_name, reason = %reason, "Issuing serving certificate");

        let serving = self.engine.issue(&identity, &trust.active, now)?;
        let serial = serving.certificate.serial().to_string();
        let mut secret = StoredSecret::new(&service.namespace, &secret_name)
            .with_type(TLS_SECRET_TYPE)
            .with_data(serving.to_secret_data()?)
            .with_annotation(ORIGINATING_SERVICE_NAME_ANNOTATION, &service.name)
            .with_annotation(ORIGINATING_SERVICE_UID_ANNOTATION, &service.uid)
            .with_annotation(EXPIRY_ANNOTATION, to_chrono(serving.certificate.not_after()).to_rfc3339())
            .with_owner(OwnerReference::service(&service.name, &service.uid))
            .managed();

        match existing {
            Some(existing) => {
                // Keep annotations and labels other tools put on the secret.
                let mut annotations: BTreeMap<_, _> = existing.annotations;
                annotations.extend(std::mem::take(&mut secret.annotations));
                secret.annotations = annotations;
                let mut labels: BTreeMap<_, _> = existing.labels;
                labels.extend(std::mem::take(&mut secret.labels));
                secret.labels = labels;
                secret.resource_version = existing.resource_version;
                retry_transient(&self.retry, "update_secret", || store.update_secret(secret.clone())).await?;
            }
            None => {
                retry_transient(&self.retry, "create_secret", || store.create_secret(secret.clone())).await?;
            }
        }

        self.metrics.record_issued(&service.namespace);
        self.metrics.record_reissue(reason.as_str());
        info!(
            secret = %secret_name,
            serial = %serial,
            reason = %reason,
            not_after = %serving.certificate.not_after(),
            issuer_serial = %trust.active.serial(),
            "Serving certificate written"
        );

        if let Some(mut status) = self.statuses.get_mut(key) {
            status.state = CertState::Issued;
            status.serial = Some(serial.clone());
            status.last_error = None;
            status.updated_at = now;
        }

        if renamed {
            self.remove_stale_secrets(service, &secret_name).await?;
        }
        Ok(ReconcileOutcome::Issued { serial, reason })
    }

    /// Unknown or already removed identities cost no store calls; secrets
    /// they left behind are swept by resync.
    async fn remove(&self, key: &ServiceKey, now: OffsetDateTime) -> Result<ReconcileOutcome> {
        let tracked = self.statuses.get(key).is_some_and(|status| status.state != CertState::Removed);
        if !tracked {
            return Ok(ReconcileOutcome::Removed { deleted: 0 });
        }

        let deleted = self.delete_managed_for(key, None, None).await?;
        if let Some(mut status) = self.statuses.get_mut(key) {
            status.state = CertState::Removed;
            status.serial = None;
            status.last_error = None;
            status.updated_at = now;
        }
        info!(deleted, "Service no longer requests a serving certificate");
        Ok(ReconcileOutcome::Removed { deleted })
    }

    /// Delete secrets this Service used to own under another name.
    async fn remove_stale_secrets(&self, service: &ServiceRecord, keep: &str) -> Result<usize> {
        self.delete_managed_for(&service.key(), Some(&service.uid), Some(keep)).await
    }

    async fn delete_managed_for(&self, key: &ServiceKey, uid: Option<&str>, keep: Option<&str>) -> Result<usize> {
        let store = &self.store;
        let managed = retry_transient(&self.retry, "list_managed_secrets", || store.list_managed_secrets()).await?;

        let mut deleted = 0;
        for secret in managed {
            let originates_here = secret.namespace == key.namespace
                && secret.annotations.get(ORIGINATING_SERVICE_NAME_ANNOTATION) == Some(&key.name)
                && uid.map_or(true, |uid| {
                    secret.annotations.get(ORIGINATING_SERVICE_UID_ANNOTATION).map(String::as_str) == Some(uid)
                });
            if !originates_here || keep == Some(secret.name.as_str()) {
                continue;
            }
            retry_transient(&self.retry, "delete_secret", || store.delete_secret(&secret.namespace, &secret.name))
                .await?;
            info!(secret = %secret.resource(), "Deleted serving certificate secret");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Queue every annotated Service, queue known identities whose Service
    /// vanished, and sweep managed secrets nobody asks for any more.
    #[instrument(skip(self))]
    pub async fn resync(&self, now: OffsetDateTime) -> Result<ResyncSummary> {
        self.refresh_trust().await?;

        let registry = &self.registry;
        let services = retry_transient(&self.retry, "list_services", || registry.list_services()).await?;
        let services: BTreeMap<ServiceKey, ServiceRecord> = services.into_iter().map(|s| (s.key(), s)).collect();

        let mut summary = ResyncSummary::default();
        let mut wanted = HashSet::new();
        for (key, service) in &services {
            if service.serving_cert_secret().is_some() {
                wanted.insert(key.clone());
                if self.enqueue(key.clone()) {
                    summary.enqueued += 1;
                }
            }
        }

        // Removed identities stay visible for one resync period.
        let forgotten: Vec<ServiceKey> = self
            .statuses
            .iter()
            .filter(|entry| entry.state == CertState::Removed && !wanted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &forgotten {
            self.forget(key);
        }

        let vanished: Vec<ServiceKey> = self
            .statuses
            .iter()
            .filter(|entry| entry.state != CertState::Removed && !wanted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in vanished {
            if self.enqueue(key) {
                summary.enqueued += 1;
            }
        }

        let store = &self.store;
        let managed = retry_transient(&self.retry, "list_managed_secrets", || store.list_managed_secrets()).await?;
        for secret in managed {
            let Some(service_name) = secret.annotations.get(ORIGINATING_SERVICE_NAME_ANNOTATION) else {
                warn!(secret = %secret.resource(), "Managed secret has no originating service annotation");
                continue;
            };
            let key = ServiceKey::new(&secret.namespace, service_name);
            if services.get(&key).is_some_and(|service| is_current_target(&secret, service)) {
                continue;
            }
            if self.delete_orphan(&key, &secret).await? {
                summary.orphans_removed += 1;
            }
        }

        self.publish_state_gauges();
        debug!(
            services = services.len(),
            enqueued = summary.enqueued,
            orphans_removed = summary.orphans_removed,
            forgotten = forgotten.len(),
            "Resync complete"
        );
        Ok(summary)
    }

    /// Re-check under the identity lock before deleting, so a Service created
    /// after the listing keeps its fresh secret.
    async fn delete_orphan(&self, key: &ServiceKey, secret: &StoredSecret) -> Result<bool> {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;

        let service = self.get_service(key).await?;
        if service.as_ref().is_some_and(|service| is_current_target(secret, service)) {
            return Ok(false);
        }

        let store = &self.store;
        retry_transient(&self.retry, "delete_secret", || store.delete_secret(&secret.namespace, &secret.name)).await?;
        info!(secret = %secret.resource(), "Deleted orphaned serving certificate secret");

        let wanted = service.is_some_and(|service| service.serving_cert_secret().is_some());
        if !wanted && self.statuses.get(key).map_or(true, |status| status.state == CertState::Removed) {
            self.statuses.remove(key);
            self.attempts.remove(key);
            drop(guard);
            drop(lock);
            self.release_lock(key);
        }
        Ok(true)
    }

    /// Drop all per-identity bookkeeping for `key`.
    fn forget(&self, key: &ServiceKey) {
        self.statuses.remove(key);
        self.attempts.remove(key);
        self.release_lock(key);
    }

    fn publish_state_gauges(&self) {
        for state in CertState::ALL {
            let count = self.statuses.iter().filter(|entry| entry.state == state).count();
            self.metrics.set_identity_states(state.as_str(), count);
        }
    }

    async fn process(&self, key: ServiceKey) {
        match self.reconcile(&key, OffsetDateTime::now_utc()).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                let attempt = {
                    let mut attempts = self.attempts.entry(key.clone()).or_insert(0);
                    *attempts += 1;
                    *attempts
                };
                let delay = self.retry.jittered_backoff(attempt);
                warn!(
                    service = %key,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Reconcile failed, requeueing"
                );
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.push(key);
                });
            }
            Err(e) => {
                // Not retried until the next resync or watch event.
                error!(service = %key, error = %e, kind = e.kind(), "Reconcile failed");
            }
        }
    }

    async fn worker(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id, "Serving certificate worker started");
        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => break,
                key = self.queue.pop() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key).await;
        }
        debug!(worker_id, "Serving certificate worker stopped");
    }

    /// Run workers, the Service watch, CA change notifications and the
    /// resync ticker until `shutdown` fires. Workers finish their current
    /// reconcile before exiting.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            workers = self.workers,
            resync_interval_secs = self.resync_interval.as_secs(),
            "Serving certificate controller started"
        );

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let controller = Arc::clone(&self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { controller.worker(worker_id, token).await }));
        }

        let mut events = self.registry.watch();
        let mut generation = self.authority.subscribe_generation();
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let mut watch_ended = false;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync(OffsetDateTime::now_utc()).await {
                        self.metrics.record_error(e.kind());
                        error!(error = %e, "Resync failed");
                    }
                }
                event = events.next() => match event {
                    Some(event) => {
                        self.enqueue(event.record().key());
                    }
                    None => watch_ended = true,
                },
                changed = generation.changed() => {
                    if changed.is_ok() {
                        self.on_ca_changed();
                    }
                }
            }
            if watch_ended {
                warn!("Service watch ended; restarting it");
                events = self.registry.watch();
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Serving certificate controller stopped");
    }
}

/// Why `secret` must not be overwritten on behalf of `service`, if it must not.
fn foreign_owner(secret: &StoredSecret, service: &ServiceRecord) -> Option<String> {
    match secret.annotations.get(ORIGINATING_SERVICE_UID_ANNOTATION) {
        Some(uid) if uid != &service.uid => Some(format!(
            "secret {} already belongs to service with uid {}",
            secret.resource(),
            uid
        )),
        Some(_) => None,
        None if secret.is_managed() => None,
        None => Some(format!("secret {} exists and is not managed by the signer", secret.resource())),
    }
}

fn is_current_target(secret: &StoredSecret, service: &ServiceRecord) -> bool {
    service.serving_cert_secret() == Some(secret.name.as_str())
        && secret.annotations.get(ORIGINATING_SERVICE_UID_ANNOTATION) == Some(&service.uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignerSettings;
    use crate::domain::CertificateAuthority;
    use crate::pki::KeyAlgorithm;
    use crate::registry::InMemoryServiceRegistry;
    use crate::storage::InMemorySecretStore;
    use time::Duration;

    struct Fixture {
        store: Arc<InMemorySecretStore>,
        registry: Arc<InMemoryServiceRegistry>,
        authority: Arc<CaRepository>,
        controller: ServiceCertController,
        now: OffsetDateTime,
    }

    async fn fixture() -> Fixture {
        let now = OffsetDateTime::now_utc();
        let store = Arc::new(InMemorySecretStore::new());
        let registry = Arc::new(InMemoryServiceRegistry::new());
        let retry = RetryConfig::default().with_max_attempts(1);
        let authority =
            Arc::new(CaRepository::from_settings(store.clone(), &SignerSettings::default(), retry.clone()));
        let ca = CertificateAuthority::generate("signer@1", KeyAlgorithm::EcdsaP256, Duration::days(365), now)
            .unwrap();
        authority.bootstrap(|| Ok(ca), now).await.unwrap();

        let controller = ServiceCertController::new(
            store.clone(),
            registry.clone(),
            authority.clone(),
            IssuanceEngine::new(KeyAlgorithm::EcdsaP256, Duration::days(30)),
            "cluster.local",
        )
        .with_retry(retry);
        Fixture { store, registry, authority, controller, now }
    }

    fn web() -> ServiceRecord {
        ServiceRecord::new("ns1", "web", "uid-web").with_serving_cert_secret("web-tls")
    }

    #[tokio::test]
    async fn test_issues_secret_for_annotated_service() {
        let f = fixture().await;
        f.registry.apply(web()).await;

        let outcome = f.controller.reconcile(&web().key(), f.now).await.unwrap();
        let ReconcileOutcome::Issued { serial, reason } = outcome else {
            panic!("expected issuance, got {:?}", outcome);
        };
        assert_eq!(reason, ReissueReason::Missing);

        let secret = f.store.get_secret("ns1", "web-tls").await.unwrap().unwrap();
        assert_eq!(secret.secret_type, TLS_SECRET_TYPE);
        assert!(secret.is_managed());
        assert_eq!(secret.annotations[ORIGINATING_SERVICE_UID_ANNOTATION], "uid-web");
        assert_eq!(secret.owner, Some(OwnerReference::service("web", "uid-web")));

        let serving = ServingCertificate::from_secret_data(&secret.data).unwrap();
        assert_eq!(serving.certificate.serial(), serial);
        let active = f.authority.load_active().await.unwrap().unwrap();
        assert!(serving.certificate.is_issued_by(active.certificate()));

        assert_eq!(f.controller.state_of(&web().key()), CertState::Issued);
    }

    #[tokio::test]
    async fn test_second_reconcile_is_noop() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();
        let writes = f.store.write_count();

        let outcome = f.controller.reconcile(&web().key(), f.now + Duration::hours(1)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unannotated_service_is_ignored() {
        let f = fixture().await;
        let plain = ServiceRecord::new("ns1", "plain", "uid-plain");
        f.registry.apply(plain.clone()).await;

        let outcome = f.controller.reconcile(&plain.key(), f.now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Removed { deleted: 0 });
        assert_eq!(f.controller.state_of(&plain.key()), CertState::Unwatched);
    }

    #[tokio::test]
    async fn test_annotation_removal_deletes_secret() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();

        f.registry.apply(ServiceRecord::new("ns1", "web", "uid-web")).await;
        let outcome = f.controller.reconcile(&web().key(), f.now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Removed { deleted: 1 });
        assert!(f.store.get_secret("ns1", "web-tls").await.unwrap().is_none());
        assert_eq!(f.controller.state_of(&web().key()), CertState::Removed);
    }

    #[tokio::test]
    async fn test_renamed_target_replaces_old_secret() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();

        f.registry.apply(ServiceRecord::new("ns1", "web", "uid-web").with_serving_cert_secret("web-tls-v2")).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();

        assert!(f.store.get_secret("ns1", "web-tls").await.unwrap().is_none());
        assert!(f.store.get_secret("ns1", "web-tls-v2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_secret_owned_by_other_service_is_not_overwritten() {
        let f = fixture().await;
        let foreign = StoredSecret::new("ns1", "web-tls")
            .with_annotation(ORIGINATING_SERVICE_UID_ANNOTATION, "uid-other")
            .managed();
        f.store.create_secret(foreign).await.unwrap();
        f.registry.apply(web()).await;

        let outcome = f.controller.reconcile(&web().key(), f.now).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Blocked { .. }));
        let status = &f.controller.status()[0];
        assert_eq!(status.state, CertState::Pending);
        assert!(status.last_error.as_deref().unwrap().contains("uid-other"));
    }

    #[tokio::test]
    async fn test_ca_change_marks_issued_stale() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();

        assert_eq!(f.controller.on_ca_changed(), 1);
        assert_eq!(f.controller.state_of(&web().key()), CertState::Stale);
        assert_eq!(f.controller.queue_len(), 1);

        // Still trusted, so the re-check settles without a write.
        assert_eq!(f.controller.reconcile(&web().key(), f.now).await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(f.controller.state_of(&web().key()), CertState::Issued);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_identity_pending() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.store.fail_next(1);

        let err = f.controller.reconcile(&web().key(), f.now).await.unwrap_err();
        assert!(err.is_retryable());
        let status = &f.controller.status()[0];
        assert_eq!(status.state, CertState::Pending);
        assert!(status.last_error.is_some());

        assert!(matches!(
            f.controller.reconcile(&web().key(), f.now).await.unwrap(),
            ReconcileOutcome::Issued { .. }
        ));
    }

    #[tokio::test]
    async fn test_resync_sweeps_orphans() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();
        f.registry.delete("ns1", "web").await;

        let summary = f.controller.resync(f.now).await.unwrap();
        assert_eq!(summary.orphans_removed, 1);
        assert!(f.store.get_secret("ns1", "web-tls").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let f = fixture().await;
        assert!(f.controller.enqueue(web().key()));
        assert!(!f.controller.enqueue(web().key()));
        assert_eq!(f.controller.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_steady_reconciles_do_not_list_managed_secrets() {
        let f = fixture().await;
        f.registry.apply(web()).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();
        let lists = f.store.list_count();

        for hour in 1..=5 {
            let outcome = f.controller.reconcile(&web().key(), f.now + Duration::hours(hour)).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Unchanged);
        }
        let plain = ServiceRecord::new("ns1", "plain", "uid-plain");
        f.registry.apply(plain.clone()).await;
        f.controller.reconcile(&plain.key(), f.now).await.unwrap();
        assert_eq!(f.store.list_count(), lists);

        f.registry.apply(ServiceRecord::new("ns1", "web", "uid-web").with_serving_cert_secret("web-tls-v2")).await;
        f.controller.reconcile(&web().key(), f.now).await.unwrap();
        assert_eq!(f.store.list_count(), lists + 1);
    }

    #[tokio::test]
    async fn test_removed_identities_are_forgotten() {
        let f = fixture().await;
        let services: Vec<_> = (0..20)
            .map(|i| {
                ServiceRecord::new("ns1", format!("svc{}", i), format!("uid-{}", i))
                    .with_serving_cert_secret(format!("svc{}-tls", i))
            })
            .collect();
        for service in &services {
            f.registry.apply(service.clone()).await;
            f.controller.reconcile(&service.key(), f.now).await.unwrap();
            f.controller.attempts.insert(service.key(), 3);
        }
        assert_eq!(f.controller.locks.len(), 20);

        // Half are deleted and reconciled, half vanish while nobody is looking.
        for (i, service) in services.iter().enumerate() {
            f.registry.delete("ns1", &service.name).await;
            if i % 2 == 0 {
                let outcome = f.controller.reconcile(&service.key(), f.now).await.unwrap();
                assert_eq!(outcome, ReconcileOutcome::Removed { deleted: 1 });
            }
        }
        assert_eq!(f.controller.locks.len(), 10);

        // The first resync drops removed identities and queues vanished ones.
        let summary = f.controller.resync(f.now).await.unwrap();
        assert_eq!(summary.enqueued, 10);
        assert_eq!(summary.orphans_removed, 10);
        for _ in 0..summary.enqueued {
            let key = f.controller.queue.pop().await.unwrap();
            assert_eq!(f.controller.reconcile(&key, f.now).await.unwrap(), ReconcileOutcome::Removed { deleted: 0 });
        }
        f.controller.resync(f.now).await.unwrap();

        assert!(f.controller.status().is_empty());
        assert!(f.controller.attempts.is_empty());
        assert!(f.controller.locks.is_empty());
        assert_eq!(f.controller.state_of(&services[0].key()), CertState::Unwatched);
    }
}
