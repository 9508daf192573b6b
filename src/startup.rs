//! Startup sequence for the signer
//!
//! 1. Load configuration and initialize observability
//! 2. Pick store and registry backends
//! 3. Seed the signing CA if the store has none (from files, or generated)
//! 4. Run the serving-cert and CA rotation controllers until shutdown

use std::path::Path;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authority::{CaRepository, TrustSnapshot};
use crate::config::{AppConfig, SignerSettings};
use crate::controller::{CaRotationController, ServiceCertController};
use crate::domain::{ca_common_name, CertificateAuthority};
use crate::errors::{Error, Result};
use crate::issuance::IssuanceEngine;
use crate::observability::{init_observability, log_config_info};
use crate::registry::ServiceRegistry;
use crate::retry::RetryConfig;
use crate::storage::SecretStore;

/// Store and registry the controllers run against.
pub struct Backends {
    pub store: Arc<dyn SecretStore>,
    pub registry: Arc<dyn ServiceRegistry>,
}

impl Backends {
    /// In-process backends. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(crate::storage::InMemorySecretStore::new()),
            registry: Arc::new(crate::registry::InMemoryServiceRegistry::new()),
        }
    }

    #[cfg(feature = "kubernetes")]
    pub async fn kubernetes() -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::config(format!("Failed to create Kubernetes client: {}", e)))?;
        Ok(Self {
            store: Arc::new(crate::storage::KubeSecretStore::new(client.clone())),
            registry: Arc::new(crate::registry::KubeServiceRegistry::new(client)),
        })
    }

    /// Kubernetes when built with the `kubernetes` feature, otherwise in-memory.
    pub async fn detect() -> Result<Self> {
        #[cfg(feature = "kubernetes")]
        {
            Self::kubernetes().await
        }
        #[cfg(not(feature = "kubernetes"))]
        {
            warn!("Built without the kubernetes feature; using in-memory store and registry");
            Ok(Self::in_memory())
        }
    }
}

/// Initial CA: the configured files when set, otherwise a fresh one.
pub fn seed_ca(settings: &SignerSettings, now: OffsetDateTime) -> Result<CertificateAuthority> {
    match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let cert_pem = std::fs::read(cert_file).map_err(|e| {
                Error::config(format!("Failed to read CA certificate {}: {}", cert_file.display(), e))
            })?;
            let key_pem = std::fs::read(key_file)
                .map_err(|e| Error::config(format!("Failed to read CA key {}: {}", key_file.display(), e)))?;
            let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem)?;
            info!(serial = %ca.serial(), cert_file = %cert_file.display(), "Seeding signing CA from files");
            Ok(ca)
        }
        _ => {
            let common_name = ca_common_name(&settings.ca_subject_prefix, now);
            let ca = CertificateAuthority::generate(&common_name, settings.key_algorithm, settings.ca_validity(), now)?;
            info!(serial = %ca.serial(), subject = %common_name, "Generated signing CA");
            Ok(ca)
        }
    }
}

/// Wired controllers sharing one CA repository.
pub struct Signer {
    pub authority: Arc<CaRepository>,
    pub service_certs: Arc<ServiceCertController>,
    pub rotation: Arc<CaRotationController>,
}

impl Signer {
    /// Bootstrap CA material and build both controllers.
    pub async fn bootstrap(config: &AppConfig, backends: Backends, now: OffsetDateTime) -> Result<(Self, TrustSnapshot)> {
        let retry = RetryConfig::from_settings(&config.controller);
        let authority = Arc::new(CaRepository::from_settings(backends.store.clone(), &config.signer, retry));

        let snapshot = authority.bootstrap(|| seed_ca(&config.signer, now), now).await?;
        info!(
            generation = snapshot.generation(),
            status = %snapshot.state.status,
            serial = %snapshot.active.serial(),
            not_after = %snapshot.active.certificate().not_after(),
            "Signing CA ready"
        );

        // Leaves are signed with the CA's own algorithm.
        let algorithm = snapshot.active.algorithm();
        if algorithm != config.signer.key_algorithm {
            warn!(
                configured = %config.signer.key_algorithm,
                ca = %algorithm,
                "Configured key algorithm differs from the stored CA; issuing with the CA's algorithm"
            );
        }
        let engine = IssuanceEngine::new(algorithm, config.signer.leaf_validity());

        let service_certs = ServiceCertController::new(
            backends.store,
            backends.registry,
            authority.clone(),
            engine,
            &config.signer.cluster_domain,
        )
        .with_controller_settings(&config.controller);

        let rotation =
            CaRotationController::from_settings(authority.clone(), &config.signer, config.controller.resync_interval());

        Ok((
            Self { authority, service_certs: Arc::new(service_certs), rotation: Arc::new(rotation) },
            snapshot,
        ))
    }

    /// Run both controllers until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let rotation = self.rotation.clone();
        let rotation_token = shutdown.clone();
        let rotation_task = tokio::spawn(async move { rotation.run(rotation_token).await });

        let service_certs = self.service_certs.clone();
        let service_task = tokio::spawn(service_certs.run(shutdown));

        let (rotation_result, service_result) = tokio::join!(rotation_task, service_task);
        for (name, result) in [("ca_rotation", rotation_result), ("service_certs", service_result)] {
            if let Err(e) = result {
                error!(controller = name, error = %e, "Controller task panicked");
                return Err(Error::internal(format!("{} controller task failed: {}", name, e)));
            }
        }
        Ok(())
    }
}

/// Entry point for `serving-cert-signer run`.
pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    init_observability(&config.observability)?;
    log_config_info(&config);

    let backends = Backends::detect().await?;
    let (signer, _) = Signer::bootstrap(&config, backends, OffsetDateTime::now_utc()).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    signer.run(shutdown).await?;
    info!("Signer shutdown completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CaStatus;
    use crate::pki::{encode_key, KeyAlgorithm};
    use time::Duration;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.signer.key_algorithm = KeyAlgorithm::EcdsaP256;
        config
    }

    #[tokio::test]
    async fn test_bootstrap_generates_ca() {
        let now = OffsetDateTime::now_utc();
        let (signer, snapshot) = Signer::bootstrap(&config(), Backends::in_memory(), now).await.unwrap();

        assert_eq!(snapshot.state.status, CaStatus::Active);
        assert!(snapshot.active.certificate().subject().contains("serving-cert-signer@"));
        assert_eq!(signer.authority.current_generation(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_from_files() {
        let now = OffsetDateTime::now_utc();
        let ca = CertificateAuthority::generate("files@1", KeyAlgorithm::EcdsaP256, Duration::days(90), now).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("ca.crt");
        let key_file = dir.path().join("ca.key");
        std::fs::write(&cert_file, ca.certificate().to_pem()).unwrap();
        std::fs::write(&key_file, encode_key(ca.key()).unwrap().as_slice()).unwrap();

        let mut config = config();
        config.signer.cert_file = Some(cert_file);
        config.signer.key_file = Some(key_file);

        let (_, snapshot) = Signer::bootstrap(&config, Backends::in_memory(), now).await.unwrap();
        assert_eq!(snapshot.active, ca);
    }

    #[test]
    fn test_seed_ca_reports_missing_files() {
        let mut settings = SignerSettings::default();
        settings.cert_file = Some("/nonexistent/ca.crt".into());
        settings.key_file = Some("/nonexistent/ca.key".into());

        let err = seed_ca(&settings, OffsetDateTime::now_utc()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let now = OffsetDateTime::now_utc();
        let (signer, _) = Signer::bootstrap(&config(), Backends::in_memory(), now).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), signer.run(shutdown))
            .await
            .unwrap()
            .unwrap();
    }
}
