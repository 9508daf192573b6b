//! # Structured Logging
//!
//! Logging setup and span macros built on the tracing ecosystem.
//!
//! In JSON mode every event carries the fields of its enclosing spans, so a
//! reconcile's `namespace`/`service` show up on each line it logs.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Error, Result};

/// Create a tracing span for one serving-cert reconciliation.
///
/// ```rust,ignore
/// let span = reconcile_span!(key.namespace, key.name);
/// let span = reconcile_span!(key.namespace, key.name, secret = "web-tls");
/// ```
#[macro_export]
macro_rules! reconcile_span {
    ($namespace:expr, $service:expr) => {
        tracing::info_span!(
            "reconcile_service",
            namespace = %$namespace,
            service = %$service,
            reconcile_id = %uuid::Uuid::new_v4()
        )
    };
    ($namespace:expr, $service:expr, $($field:tt)*) => {
        tracing::info_span!(
            "reconcile_service",
            namespace = %$namespace,
            service = %$service,
            reconcile_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one CA rotation step.
#[macro_export]
macro_rules! rotation_span {
    ($generation:expr, $status:expr) => {
        tracing::info_span!(
            "ca_rotation",
            generation = $generation,
            status = %$status,
            rotation_id = %uuid::Uuid::new_v4()
        )
    };
    ($generation:expr, $status:expr, $($field:tt)*) => {
        tracing::info_span!(
            "ca_rotation",
            generation = $generation,
            status = %$status,
            rotation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true).with_span_list(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        namespace = %config.signer.namespace,
        ca_secret = %config.signer.ca_secret_name,
        key_algorithm = %config.signer.key_algorithm,
        ca_validity_days = config.signer.ca_validity_days,
        leaf_validity_days = config.signer.leaf_validity_days,
        overlap_window_days = config.signer.overlap_window_days,
        cluster_domain = %config.signer.cluster_domain,
        workers = config.controller.workers,
        resync_interval_seconds = config.controller.resync_interval_seconds,
        metrics_enabled = config.observability.enable_metrics,
        "Serving certificate signer configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = reconcile_span!("ns1", "web");
        let _span = reconcile_span!("ns1", "web", secret = "web-tls");
        let _span = rotation_span!(3u64, "rotating");
        let _span = rotation_span!(3u64, "rotating", next_serial = "0a1b");
    }

    #[test]
    fn test_log_config_info() {
        // This should not panic
        log_config_info(&AppConfig::default());
    }
}
