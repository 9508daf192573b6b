//! # Metrics Collection
//!
//! Prometheus metrics for certificate issuance and CA rotation. The recorder
//! is a zero-sized handle; without an installed exporter every call is a
//! no-op, so controllers always record.

use std::net::SocketAddr;

use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Metrics recorder that tracks signer metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a serving certificate written to its Secret
    pub fn record_issued(&self, namespace: &str) {
        let labels = [("namespace", namespace.to_string())];
        counter!("serving_certs_issued_total", &labels).increment(1);
    }

    /// Record why a serving certificate was replaced
    pub fn record_reissue(&self, reason: &str) {
        let labels = [("reason", reason.to_string())];
        counter!("serving_cert_reissues_total", &labels).increment(1);
    }

    /// Record a failed reconciliation by error kind
    pub fn record_error(&self, kind: &str) {
        let labels = [("kind", kind.to_string())];
        counter!("serving_cert_errors_total", &labels).increment(1);
    }

    /// Record a CA rotation phase transition
    pub fn record_rotation_phase(&self, phase: &str) {
        let labels = [("phase", phase.to_string())];
        counter!("ca_rotations_total", &labels).increment(1);
    }

    /// Update the active CA expiry gauge
    pub fn set_ca_not_after(&self, unix_seconds: i64) {
        gauge!("ca_not_after_seconds").set(unix_seconds as f64);
    }

    /// Update the gauge of identities per controller state
    pub fn set_identity_states(&self, state: &str, count: usize) {
        let labels = [("state", state.to_string())];
        gauge!("serving_cert_identities", &labels).set(count as f64);
    }

    /// Register metric descriptions so exports appear before events occur.
    pub fn register_signer_metrics(&self) {
        describe_counter!(
            "serving_certs_issued_total",
            Unit::Count,
            "Serving certificates issued and persisted"
        );
        describe_counter!(
            "serving_cert_reissues_total",
            Unit::Count,
            "Serving certificate replacements grouped by reason"
        );
        describe_counter!(
            "serving_cert_errors_total",
            Unit::Count,
            "Failed serving certificate reconciliations grouped by error kind"
        );
        describe_counter!("ca_rotations_total", Unit::Count, "CA rotation phase transitions");
        describe_gauge!(
            "ca_not_after_seconds",
            Unit::Seconds,
            "NotAfter of the active signing CA as a unix timestamp"
        );
        describe_gauge!(
            "serving_cert_identities",
            Unit::Count,
            "Tracked service identities grouped by state"
        );

        for phase in ["started", "overlap", "retiring", "completed"] {
            counter!("ca_rotations_total", "phase" => phase).absolute(0);
        }
    }
}

/// Initialize metrics collection and Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = config.metrics_bind_address();
    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", "serving-cert-signer")
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_signer_metrics();

    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}
