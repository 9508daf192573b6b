//! # Configuration Settings
//!
//! Defines the configuration structure for the serving certificate signer.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::pki::KeyAlgorithm;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// CA material, certificate shape and naming
    #[validate(nested)]
    pub signer: SignerSettings,

    /// Reconciliation loop tuning
    #[validate(nested)]
    pub controller: ControllerSettings,

    /// Logging and metrics
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Relationships between lifetimes that the validator attributes cannot
    /// express.
    ///
    /// Every leaf issued under the outgoing CA must expire or be reissued
    /// before the overlap window closes, and the overlap must fit into the
    /// half of the CA lifetime that remains once rotation starts.
    fn validate_custom(&self) -> Result<()> {
        let signer = &self.signer;

        if signer.leaf_validity_days > signer.overlap_window_days {
            return Err(Error::config(format!(
                "leaf_validity_days ({}) must not exceed overlap_window_days ({})",
                signer.leaf_validity_days, signer.overlap_window_days
            )));
        }
        if signer.overlap_window_days * 2 > signer.ca_validity_days {
            return Err(Error::config(format!(
                "overlap_window_days ({}) must not exceed half of ca_validity_days ({})",
                signer.overlap_window_days, signer.ca_validity_days
            )));
        }
        if signer.leaf_validity_days >= signer.ca_validity_days {
            return Err(Error::config("leaf_validity_days must be shorter than ca_validity_days"));
        }
        if signer.cert_file.is_some() != signer.key_file.is_some() {
            return Err(Error::config("cert_file and key_file must be set together"));
        }

        let names = [
            &signer.ca_secret_name,
            &signer.next_ca_secret_name,
            &signer.cross_signed_secret_name,
            &signer.state_secret_name,
            &signer.bundle_secret_name,
        ];
        for (index, name) in names.iter().enumerate() {
            if names[index + 1..].contains(name) {
                return Err(Error::config(format!("secret name '{}' is used twice", name)));
            }
        }

        if self.controller.max_backoff_seconds * 1000 < self.controller.initial_backoff_ms {
            return Err(Error::config("max_backoff_seconds must be >= initial_backoff_ms"));
        }

        Ok(())
    }
}

/// Signer configuration: where CA material lives and what certificates look like
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct SignerSettings {
    /// Namespace holding the CA secrets
    #[validate(length(min = 1, message = "Signer namespace cannot be empty"))]
    pub namespace: String,

    /// Active CA secret (`tls.crt` / `tls.key`)
    #[validate(length(min = 1, message = "CA secret name cannot be empty"))]
    pub ca_secret_name: String,

    /// Replacement CA secret written during rotation
    #[validate(length(min = 1, message = "Next CA secret name cannot be empty"))]
    pub next_ca_secret_name: String,

    /// Cross-signed bridging certificates
    #[validate(length(min = 1, message = "Cross-signed secret name cannot be empty"))]
    pub cross_signed_secret_name: String,

    /// Versioned CA state record
    #[validate(length(min = 1, message = "State secret name cannot be empty"))]
    pub state_secret_name: String,

    /// Published CA bundle
    #[validate(length(min = 1, message = "Bundle secret name cannot be empty"))]
    pub bundle_secret_name: String,

    /// Bootstrap CA certificate file
    pub cert_file: Option<PathBuf>,

    /// Bootstrap CA private key file
    pub key_file: Option<PathBuf>,

    /// File the CA bundle is mirrored to
    pub ca_bundle_file: Option<PathBuf>,

    /// Key algorithm for every generated key
    pub key_algorithm: KeyAlgorithm,

    /// CA common name prefix; the subject is `<prefix>@<unix-seconds>`
    #[validate(length(min = 1, message = "CA subject prefix cannot be empty"))]
    pub ca_subject_prefix: String,

    /// CA certificate lifetime in days
    #[validate(range(min = 2, max = 36500, message = "CA validity must be between 2 and 36500 days"))]
    pub ca_validity_days: u64,

    /// Serving certificate lifetime in days
    #[validate(range(min = 1, max = 3650, message = "Leaf validity must be between 1 and 3650 days"))]
    pub leaf_validity_days: u64,

    /// How long both CAs stay trusted after rotation starts
    #[validate(range(min = 1, max = 18250, message = "Overlap window must be between 1 and 18250 days"))]
    pub overlap_window_days: u64,

    /// Cluster DNS domain appended to `<svc>.<ns>.svc`
    #[validate(length(min = 1, message = "Cluster domain cannot be empty"))]
    pub cluster_domain: String,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            namespace: "service-ca".to_string(),
            ca_secret_name: "signing-key".to_string(),
            next_ca_secret_name: "next-signing-key".to_string(),
            cross_signed_secret_name: "signing-cross-signed".to_string(),
            state_secret_name: "signing-state".to_string(),
            bundle_secret_name: "signing-cabundle".to_string(),
            cert_file: None,
            key_file: None,
            ca_bundle_file: None,
            key_algorithm: KeyAlgorithm::Rsa2048,
            ca_subject_prefix: "serving-cert-signer".to_string(),
            ca_validity_days: 730,
            leaf_validity_days: 90,
            overlap_window_days: 180,
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl SignerSettings {
    pub fn ca_validity(&self) -> time::Duration {
        days(self.ca_validity_days)
    }

    pub fn leaf_validity(&self) -> time::Duration {
        days(self.leaf_validity_days)
    }

    pub fn overlap_window(&self) -> time::Duration {
        days(self.overlap_window_days)
    }
}

fn days(count: u64) -> time::Duration {
    time::Duration::days(i64::try_from(count).unwrap_or(i64::MAX / 86_400))
}

/// Controller loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ControllerSettings {
    /// Bounded interval at which every identity and the CA are re-evaluated
    #[validate(range(min = 1, max = 86400, message = "Resync interval must be between 1 and 86400 seconds"))]
    pub resync_interval_seconds: u64,

    /// Concurrent serving-cert workers
    #[validate(range(min = 1, max = 64, message = "Workers must be between 1 and 64"))]
    pub workers: usize,

    /// Timeout for a single store call
    #[validate(range(min = 1, max = 300, message = "Persistence timeout must be between 1 and 300 seconds"))]
    pub persistence_timeout_seconds: u64,

    /// First retry delay after a persistence failure
    #[validate(range(min = 1, max = 60000, message = "Initial backoff must be between 1 and 60000 ms"))]
    pub initial_backoff_ms: u64,

    /// Retry delay cap
    #[validate(range(min = 1, max = 3600, message = "Max backoff must be between 1 and 3600 seconds"))]
    pub max_backoff_seconds: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            resync_interval_seconds: 60,
            workers: 5,
            persistence_timeout_seconds: 10,
            initial_backoff_ms: 200,
            max_backoff_seconds: 60,
        }
    }
}

impl ControllerSettings {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_seconds)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port
    #[validate(range(min = 1, max = 65535, message = "Metrics port must be between 1 and 65535"))]
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address
    pub fn metrics_bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.metrics_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leaf_longer_than_overlap_is_rejected() {
        let mut config = AppConfig::default();
        config.signer.leaf_validity_days = 200;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap_window_days"));
    }

    #[test]
    fn test_overlap_longer_than_half_life_is_rejected() {
        let mut config = AppConfig::default();
        config.signer.overlap_window_days = 400;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_range_validation() {
        let mut config = AppConfig::default();
        config.controller.workers = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.signer.cluster_domain = String::new();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_secret_names_are_rejected() {
        let mut config = AppConfig::default();
        config.signer.next_ca_secret_name = config.signer.ca_secret_name.clone();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bootstrap_files_go_together() {
        let mut config = AppConfig::default();
        config.signer.cert_file = Some(PathBuf::from("/etc/ca/tls.crt"));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.signer.key_file = Some(PathBuf::from("/etc/ca/tls.key"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let settings = SignerSettings::default();
        assert_eq!(settings.leaf_validity(), time::Duration::days(90));
        assert_eq!(ControllerSettings::default().initial_backoff(), Duration::from_millis(200));
    }
}
