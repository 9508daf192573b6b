//! Common test utilities for all integration tests.
//!
//! Builds a signer wired to in-memory backends with a controllable clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serving_cert_signer::authority::CaRepository;
use serving_cert_signer::config::SignerSettings;
use serving_cert_signer::controller::{CaRotationController, ServiceCertController};
use serving_cert_signer::domain::{CertificateAuthority, ServiceRecord, ServingCertificate};
use serving_cert_signer::issuance::IssuanceEngine;
use serving_cert_signer::pki::KeyAlgorithm;
use serving_cert_signer::registry::InMemoryServiceRegistry;
use serving_cert_signer::retry::RetryConfig;
use serving_cert_signer::storage::{InMemorySecretStore, SecretStore};
use time::{Duration, OffsetDateTime};

pub const CA_VALIDITY_DAYS: i64 = 60;
pub const OVERLAP_DAYS: i64 = 15;
pub const LEAF_VALIDITY_DAYS: i64 = 10;

pub struct Harness {
    pub store: Arc<InMemorySecretStore>,
    pub registry: Arc<InMemoryServiceRegistry>,
    pub authority: Arc<CaRepository>,
    pub service_certs: Arc<ServiceCertController>,
    pub rotation: CaRotationController,
    pub start: OffsetDateTime,
}

impl Harness {
    pub async fn new(algorithm: KeyAlgorithm) -> Self {
        let start = OffsetDateTime::now_utc();
        let store = Arc::new(InMemorySecretStore::new());
        let registry = Arc::new(InMemoryServiceRegistry::new());
        let retry = RetryConfig::default().with_max_attempts(1);

        let authority = Arc::new(CaRepository::from_settings(store.clone(), &SignerSettings::default(), retry.clone()));
        let ca = CertificateAuthority::generate("signer@1", algorithm, Duration::days(CA_VALIDITY_DAYS), start)
            .expect("generate CA");
        authority.bootstrap(|| Ok(ca), start).await.expect("bootstrap");

        let service_certs = ServiceCertController::new(
            store.clone(),
            registry.clone(),
            authority.clone(),
            IssuanceEngine::new(algorithm, Duration::days(LEAF_VALIDITY_DAYS)),
            "cluster.local",
        )
        .with_retry(retry);

        let rotation = CaRotationController::new(
            authority.clone(),
            Duration::days(CA_VALIDITY_DAYS),
            Duration::days(OVERLAP_DAYS),
            StdDuration::from_secs(60),
        );

        Self { store, registry, authority, service_certs: Arc::new(service_certs), rotation, start }
    }

    pub fn at(&self, days: i64) -> OffsetDateTime {
        self.start + Duration::days(days)
    }

    pub async fn active_ca(&self) -> CertificateAuthority {
        self.authority.load_active().await.expect("load").expect("active CA")
    }

    pub async fn serving_cert(&self, namespace: &str, secret: &str) -> Option<ServingCertificate> {
        let stored = self.store.get_secret(namespace, secret).await.expect("get secret")?;
        Some(ServingCertificate::from_secret_data(&stored.data).expect("decodable serving cert"))
    }
}

pub fn annotated_service(namespace: &str, name: &str, secret: &str) -> ServiceRecord {
    ServiceRecord::new(namespace, name, format!("uid-{}-{}", namespace, name)).with_serving_cert_secret(secret)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    false
}
