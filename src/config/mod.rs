//! # Configuration Management
//!
//! Configuration is read from an optional YAML file, then overridden by
//! `SERVING_CERT_*` environment variables (a `.env` file is loaded first when
//! present), then validated.

use std::path::Path;
use std::str::FromStr;

use crate::errors::{Error, Result};

pub mod settings;

pub use settings::{AppConfig, ControllerSettings, ObservabilityConfig, SignerSettings};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SERVING_CERT_";

impl AppConfig {
    /// Load configuration from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Missing .env is the normal case.
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::config(format!("Invalid config YAML: {}", e)))
    }

    /// Apply `SERVING_CERT_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let signer = &mut self.signer;

        env.string("NAMESPACE", &mut signer.namespace);
        env.string("CA_SECRET_NAME", &mut signer.ca_secret_name);
        env.string("NEXT_CA_SECRET_NAME", &mut signer.next_ca_secret_name);
        env.string("CROSS_SIGNED_SECRET_NAME", &mut signer.cross_signed_secret_name);
        env.string("STATE_SECRET_NAME", &mut signer.state_secret_name);
        env.string("BUNDLE_SECRET_NAME", &mut signer.bundle_secret_name);
        env.path("CERT_FILE", &mut signer.cert_file);
        env.path("KEY_FILE", &mut signer.key_file);
        env.path("CA_BUNDLE_FILE", &mut signer.ca_bundle_file);
        env.parsed("KEY_ALGORITHM", &mut signer.key_algorithm)?;
        env.string("CA_SUBJECT_PREFIX", &mut signer.ca_subject_prefix);
        env.parsed("CA_VALIDITY_DAYS", &mut signer.ca_validity_days)?;
        env.parsed("LEAF_VALIDITY_DAYS", &mut signer.leaf_validity_days)?;
        env.parsed("OVERLAP_WINDOW_DAYS", &mut signer.overlap_window_days)?;
        env.string("CLUSTER_DOMAIN", &mut signer.cluster_domain);

        let controller = &mut self.controller;
        env.parsed("RESYNC_INTERVAL_SECONDS", &mut controller.resync_interval_seconds)?;
        env.parsed("WORKERS", &mut controller.workers)?;
        env.parsed("PERSISTENCE_TIMEOUT_SECONDS", &mut controller.persistence_timeout_seconds)?;
        env.parsed("INITIAL_BACKOFF_MS", &mut controller.initial_backoff_ms)?;
        env.parsed("MAX_BACKOFF_SECONDS", &mut controller.max_backoff_seconds)?;

        let observability = &mut self.observability;
        env.string("LOG_LEVEL", &mut observability.log_level);
        env.flag("JSON_LOGGING", &mut observability.json_logging);
        env.flag("ENABLE_METRICS", &mut observability.enable_metrics);
        env.parsed("METRICS_PORT", &mut observability.metrics_port)?;

        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, suffix: &str) -> Option<(String, String)> {
        let name = format!("{}{}", ENV_PREFIX, suffix);
        (self.lookup)(&name).map(|value| (name, value))
    }

    fn string(&self, suffix: &str, target: &mut String) {
        if let Some((_, value)) = self.get(suffix) {
            *target = value;
        }
    }

    fn path(&self, suffix: &str, target: &mut Option<std::path::PathBuf>) {
        if let Some((_, value)) = self.get(suffix) {
            *target = if value.is_empty() { None } else { Some(value.into()) };
        }
    }

    fn flag(&self, suffix: &str, target: &mut bool) {
        if let Some((_, value)) = self.get(suffix) {
            *target = value.eq_ignore_ascii_case("true") || value == "1";
        }
    }

    fn parsed<T>(&self, suffix: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some((name, value)) = self.get(suffix) {
            *target = value
                .parse()
                .map_err(|e| Error::config(format!("Invalid {}: {}", name, e)))?;
        }
        Ok(())
    }
}
