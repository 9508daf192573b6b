//! `ca` subcommands: create, cross-sign and inspect CA certificates offline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::output::{print_json, print_yaml, read_file, render_fields, write_file, OutputFormat};
use crate::authority::{NEW_SIGNED_BY_OLD_KEY, OLD_SIGNED_BY_NEW_KEY};
use crate::domain::{ca_common_name, to_chrono, CertificateAuthority};
use crate::pki::{cross_sign, decode_chain, encode_chain, encode_key, is_rotation_due, rotation_threshold, KeyAlgorithm};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_BUNDLE_FILE: &str = "ca-bundle.crt";

#[derive(Subcommand)]
pub enum CaCommands {
    /// Create a self-signed signing CA
    Init {
        /// Directory to write ca.crt and ca.key to
        #[arg(long)]
        out_dir: PathBuf,

        /// Key algorithm (rsa-2048 or ecdsa-p256)
        #[arg(long, default_value = "rsa-2048")]
        algorithm: KeyAlgorithm,

        /// Validity in days
        #[arg(long, default_value_t = 730)]
        validity_days: u32,

        /// Common name prefix; the CN is `<prefix>@<unix-seconds>`
        #[arg(long, default_value = "serving-cert-signer")]
        subject_prefix: String,
    },

    /// Cross-sign an outgoing CA and its replacement
    CrossSign {
        #[arg(long)]
        old_cert: PathBuf,
        #[arg(long)]
        old_key: PathBuf,
        #[arg(long)]
        new_cert: PathBuf,
        #[arg(long)]
        new_key: PathBuf,

        /// Directory to write the bridging certificates and bundle to
        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Show a certificate's identity, validity and rotation status
    Inspect {
        #[arg(long)]
        cert: PathBuf,

        /// Evaluate rotation at this RFC 3339 instant instead of now
        #[arg(long)]
        now: Option<String>,

        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
}

pub fn handle_ca_command(command: CaCommands) -> Result<()> {
    match command {
        CaCommands::Init { out_dir, algorithm, validity_days, subject_prefix } => {
            let now = OffsetDateTime::now_utc();
            let ca = init_ca(&out_dir, algorithm, Duration::days(validity_days.into()), &subject_prefix, now)?;
            println!("Created CA {} (serial {})", ca.certificate().subject(), ca.serial());
            println!("  {}", out_dir.join(CA_CERT_FILE).display());
            println!("  {}", out_dir.join(CA_KEY_FILE).display());
        }
        CaCommands::CrossSign { old_cert, old_key, new_cert, new_key, out_dir } => {
            let old = load_ca(&old_cert, &old_key)?;
            let new = load_ca(&new_cert, &new_key)?;
            cross_sign_files(&old, &new, &out_dir)?;
            println!("Cross-signed {} <-> {}", old.serial(), new.serial());
            for name in [OLD_SIGNED_BY_NEW_KEY, NEW_SIGNED_BY_OLD_KEY, CA_BUNDLE_FILE] {
                println!("  {}", out_dir.join(name).display());
            }
        }
        CaCommands::Inspect { cert, now, output } => {
            let now = match now {
                Some(raw) => parse_instant(&raw)?,
                None => OffsetDateTime::now_utc(),
            };
            let reports = inspect(&read_file(&cert)?, now)?;
            match output {
                OutputFormat::Json => print_json(&reports)?,
                OutputFormat::Yaml => print_yaml(&reports)?,
                OutputFormat::Text => {
                    let rendered: Vec<String> = reports.iter().map(CertificateReport::render).collect();
                    println!("{}", rendered.join("\n\n"));
                }
            }
        }
    }
    Ok(())
}

pub fn load_ca(cert: &Path, key: &Path) -> Result<CertificateAuthority> {
    CertificateAuthority::from_pem(&read_file(cert)?, &read_file(key)?)
        .with_context(|| format!("Failed to load CA from {} and {}", cert.display(), key.display()))
}

pub fn init_ca(
    out_dir: &Path,
    algorithm: KeyAlgorithm,
    validity: Duration,
    subject_prefix: &str,
    now: OffsetDateTime,
) -> Result<CertificateAuthority> {
    let ca = CertificateAuthority::generate(&ca_common_name(subject_prefix, now), algorithm, validity, now)?;
    write_file(out_dir, CA_CERT_FILE, ca.certificate().to_pem().as_bytes(), false)?;
    write_file(out_dir, CA_KEY_FILE, &encode_key(ca.key())?, true)?;
    Ok(ca)
}

/// Write both bridging certificates and the overlap bundle.
pub fn cross_sign_files(old: &CertificateAuthority, new: &CertificateAuthority, out_dir: &Path) -> Result<()> {
    let pair = cross_sign(old.certificate(), old.key(), new.certificate(), new.key())?;
    write_file(out_dir, OLD_SIGNED_BY_NEW_KEY, &encode_chain([&pair.old_signed_by_new]), false)?;
    write_file(out_dir, NEW_SIGNED_BY_OLD_KEY, &encode_chain([&pair.new_signed_by_old]), false)?;
    let bundle = encode_chain([
        old.certificate(),
        new.certificate(),
        &pair.new_signed_by_old,
        &pair.old_signed_by_new,
    ]);
    write_file(out_dir, CA_BUNDLE_FILE, &bundle, false)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub dns_names: Vec<String>,
    pub is_ca: bool,
    pub rotation_at: String,
    pub rotation_due: bool,
    pub expired: bool,
}

impl CertificateReport {
    fn render(&self) -> String {
        let mut fields = vec![
            ("subject", self.subject.clone()),
            ("issuer", self.issuer.clone()),
            ("serial", self.serial.clone()),
            ("not before", self.not_before.clone()),
            ("not after", self.not_after.clone()),
            ("ca", self.is_ca.to_string()),
            ("rotation at", self.rotation_at.clone()),
            ("rotation due", self.rotation_due.to_string()),
            ("expired", self.expired.to_string()),
        ];
        if !self.dns_names.is_empty() {
            fields.push(("dns names", self.dns_names.join(", ")));
        }
        render_fields(&fields)
    }
}

/// One report per certificate in `pem`.
pub fn inspect(pem: &[u8], now: OffsetDateTime) -> Result<Vec<CertificateReport>> {
    let certs = decode_chain(pem)?;
    Ok(certs
        .iter()
        .map(|cert| {
            let info = cert.info();
            CertificateReport {
                subject: info.subject.clone(),
                issuer: info.issuer.clone(),
                serial: info.serial.clone(),
                not_before: to_chrono(info.not_before).to_rfc3339(),
                not_after: to_chrono(info.not_after).to_rfc3339(),
                dns_names: info.dns_names.clone(),
                is_ca: info.is_ca,
                rotation_at: to_chrono(rotation_threshold(info.not_before, info.not_after)).to_rfc3339(),
                rotation_due: is_rotation_due(info.not_before, info.not_after, now),
                expired: now >= info.not_after,
            }
        })
        .collect())
}

fn parse_instant(raw: &str) -> Result<OffsetDateTime> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid --now value '{}', expected RFC 3339", raw))?;
    Ok(crate::domain::from_chrono(parsed.with_timezone(&chrono::Utc)))
}
