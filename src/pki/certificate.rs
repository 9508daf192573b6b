//! Owned, parsed X.509 certificate.
//!
//! `Certificate` keeps the DER bytes and the handful of facts the signer
//! reasons about, extracted once with `x509-parser`. Signature checks re-parse
//! the DER on demand.

use std::fmt;

use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::errors::{Error, Result};
use crate::pki::keys::PrivateKey;

/// Facts extracted from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub subject_raw: Vec<u8>,
    pub issuer: String,
    pub issuer_raw: Vec<u8>,
    /// Lowercase hex of the raw serial bytes
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub dns_names: Vec<String>,
    pub is_ca: bool,
    pub can_sign_certificates: bool,
    pub public_key_bits: Vec<u8>,
}

#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    info: CertificateInfo,
}

impl Certificate {
    /// Parse a single DER certificate. Trailing bytes are rejected.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let info = {
            let cert = parse(&der)?;
            extract_info(&cert)?
        };
        Ok(Self { der, info })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    pub fn subject(&self) -> &str {
        &self.info.subject
    }

    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.info.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.info.not_after
    }

    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.info.not_before <= at && at <= self.info.not_after
    }

    pub fn is_self_issued(&self) -> bool {
        names_match(&self.info.issuer_raw, &self.info.issuer, &self.info.subject_raw, &self.info.subject)
    }

    /// Single `CERTIFICATE` PEM block.
    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new(crate::pki::pem::CERTIFICATE_TAG, self.der.clone()))
    }

    /// Whether `key` is the private half of this certificate's public key.
    pub fn matches_key(&self, key: &PrivateKey) -> bool {
        key.public_key_bits().map(|bits| bits == self.info.public_key_bits).unwrap_or(false)
    }

    /// Verify this certificate's signature with `issuer`'s public key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let child = parse(&self.der)?;
        let parent = parse(&issuer.der)?;
        child.verify_signature(Some(parent.public_key())).map_err(|e| {
            Error::signing(format!(
                "certificate {} is not signed by {} ({}): {}",
                self.info.serial, issuer.info.subject, issuer.info.serial, e
            ))
        })
    }

    /// Issuer name equals `issuer`'s subject and the signature verifies.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        names_match(
            &self.info.issuer_raw,
            &self.info.issuer,
            &issuer.info.subject_raw,
            &issuer.info.subject,
        ) && self.verify_signed_by(issuer).is_ok()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.info.subject)
            .field("issuer", &self.info.issuer)
            .field("serial", &self.info.serial)
            .field("not_after", &self.info.not_after)
            .finish()
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::malformed(format!("invalid certificate DER: {}", e)))?;
    if !rest.is_empty() {
        return Err(Error::malformed(format!("{} trailing bytes after certificate", rest.len())));
    }
    Ok(cert)
}

fn names_match(raw_a: &[u8], text_a: &str, raw_b: &[u8], text_b: &str) -> bool {
    raw_a == raw_b || (!text_a.is_empty() && text_a == text_b)
}

fn extract_info(cert: &X509Certificate<'_>) -> Result<CertificateInfo> {
    let malformed = |what: &str, e: x509_parser::error::X509Error| {
        Error::malformed(format!("invalid {} extension: {}", what, e))
    };

    let dns_names = cert
        .subject_alternative_name()
        .map_err(|e| malformed("subjectAltName", e))?
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let is_ca = cert
        .basic_constraints()
        .map_err(|e| malformed("basicConstraints", e))?
        .map(|ext| ext.value.ca)
        .unwrap_or(false);

    let can_sign_certificates = cert
        .key_usage()
        .map_err(|e| malformed("keyUsage", e))?
        .map(|ext| ext.value.key_cert_sign())
        .unwrap_or(false);

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        subject_raw: cert.subject().as_raw().to_vec(),
        issuer: cert.issuer().to_string(),
        issuer_raw: cert.issuer().as_raw().to_vec(),
        serial: hex::encode(cert.raw_serial()),
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
        dns_names,
        is_ca,
        can_sign_certificates,
        public_key_bits: cert.public_key().subject_public_key.data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::builder::{self_sign, sign_leaf, CertTemplate};
    use crate::pki::keys::{generate_key_pair, KeyAlgorithm};
    use time::Duration;

    fn ca(name: &str) -> (Certificate, PrivateKey) {
        let now = OffsetDateTime::now_utc();
        let key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let template =
            CertTemplate::ca(name, now, now + Duration::days(30), KeyAlgorithm::EcdsaP256);
        (self_sign(&template, &key).unwrap(), key)
    }

    #[test]
    fn test_extracted_ca_facts() {
        let (cert, key) = ca("test-ca@1");

        assert_eq!(cert.subject(), "CN=test-ca@1");
        assert!(cert.info().is_ca);
        assert!(cert.info().can_sign_certificates);
        assert!(cert.is_self_issued());
        assert!(cert.matches_key(&key));
        assert_eq!(cert.serial().len(), 32);
    }

    #[test]
    fn test_leaf_signature_verification() {
        let (issuer, issuer_key) = ca("issuer@1");
        let (other, _) = ca("other@1");
        let now = OffsetDateTime::now_utc();
        let leaf_key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let template = CertTemplate::serving(
            vec!["web.ns1.svc".to_string()],
            now,
            now + Duration::days(1),
            KeyAlgorithm::EcdsaP256,
        );
        let leaf = sign_leaf(&template, &leaf_key, &issuer, &issuer_key).unwrap();

        assert!(leaf.is_issued_by(&issuer));
        assert!(!leaf.is_issued_by(&other));
        assert!(matches!(leaf.verify_signed_by(&other), Err(Error::Signing(_))));
        assert!(!leaf.matches_key(&issuer_key));
        assert_eq!(leaf.info().dns_names, vec!["web.ns1.svc".to_string()]);
        assert!(!leaf.info().is_ca);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (cert, _) = ca("trailing@1");
        let mut der = cert.der().to_vec();
        der.extend_from_slice(&[0, 0]);

        assert!(matches!(Certificate::from_der(der), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_validity_window() {
        let (cert, _) = ca("window@1");
        assert!(cert.is_valid_at(cert.not_before()));
        assert!(cert.is_valid_at(cert.not_after()));
        assert!(!cert.is_valid_at(cert.not_after() + Duration::seconds(1)));
    }
}
