//! # serving-cert-signer
//!
//! Issues TLS serving certificates for Services that opt in through an
//! annotation, and rotates the signing CA without breaking clients that
//! still trust the old one.
//!
//! ## Architecture
//!
//! ```text
//! ServiceRegistry ─events─▶ ServiceCertController ─┐
//!                                                  ├─▶ SecretStore
//! CaRotationController ──▶ CaRepository ───────────┘
//!                               │
//!                               └─▶ CA bundle (watch channel, file)
//! ```
//!
//! ## Core Components
//!
//! - **pki**: key generation, certificate building, cross-signing, chain verification
//! - **issuance**: maps a Service identity to a signed serving certificate
//! - **authority**: CA material and the versioned CA state record
//! - **controller**: serving-cert and CA rotation reconcile loops
//! - **storage** / **registry**: store and Service-source seams, in-memory and Kubernetes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use serving_cert_signer::config::AppConfig;
//! use serving_cert_signer::startup::{Backends, Signer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> serving_cert_signer::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let (signer, _) = Signer::bootstrap(&config, Backends::in_memory(), time::OffsetDateTime::now_utc()).await?;
//!     signer.run(CancellationToken::new()).await
//! }
//! ```

pub mod authority;
pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod errors;
pub mod issuance;
pub mod observability;
pub mod pki;
pub mod registry;
pub mod retry;
pub mod startup;
pub mod storage;

pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "serving-cert-signer");
    }
}
