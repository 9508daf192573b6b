//! `cert` subcommands: issue serving certificates from a CA on disk.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Subcommand;
use time::{Duration, OffsetDateTime};

use super::ca::load_ca;
use super::output::write_file;
use crate::domain::{CertificateAuthority, ServiceIdentity, ServingCertificate, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use crate::issuance::IssuanceEngine;
use crate::pki::{encode_chain, encode_key};

#[derive(Subcommand)]
pub enum CertCommands {
    /// Issue a serving certificate for a Service
    Issue {
        #[arg(long)]
        ca_cert: PathBuf,
        #[arg(long)]
        ca_key: PathBuf,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        service: String,

        /// Directory to write tls.crt and tls.key to
        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long, default_value = "cluster.local")]
        cluster_domain: String,

        /// Validity in days, capped at the CA's own expiry
        #[arg(long, default_value_t = 90)]
        validity_days: u32,
    },
}

pub fn handle_cert_command(command: CertCommands) -> Result<()> {
    match command {
        CertCommands::Issue { ca_cert, ca_key, namespace, service, out_dir, cluster_domain, validity_days } => {
            let ca = load_ca(&ca_cert, &ca_key)?;
            let identity = ServiceIdentity::new(namespace, service, cluster_domain);
            let serving = issue_to_dir(
                &ca,
                &identity,
                Duration::days(validity_days.into()),
                &out_dir,
                OffsetDateTime::now_utc(),
            )?;
            println!(
                "Issued {} (serial {}, expires {})",
                identity.dns_names().join(", "),
                serving.certificate.serial(),
                serving.certificate.not_after()
            );
            println!("  {}", out_dir.join(TLS_CERT_KEY).display());
            println!("  {}", out_dir.join(TLS_PRIVATE_KEY_KEY).display());
        }
    }
    Ok(())
}

pub fn issue_to_dir(
    ca: &CertificateAuthority,
    identity: &ServiceIdentity,
    validity: Duration,
    out_dir: &Path,
    now: OffsetDateTime,
) -> Result<ServingCertificate> {
    let engine = IssuanceEngine::new(ca.algorithm(), validity);
    let serving = engine.issue(identity, ca, now)?;
    write_file(out_dir, TLS_CERT_KEY, &encode_chain([&serving.certificate]), false)?;
    write_file(out_dir, TLS_PRIVATE_KEY_KEY, &encode_key(&serving.key)?, true)?;
    Ok(serving)
}
