//! # Domain model
//!
//! Service identities, certificate authorities, the versioned CA state record
//! and the serving certificate stored per service.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::errors::{Error, Result};
use crate::pki::{
    decode_chain, decode_key, encode_chain, encode_key, generate_key_pair, self_sign, CertTemplate,
    Certificate, KeyAlgorithm, PrivateKey,
};

/// Service annotation naming the Secret that receives the serving certificate.
pub const SERVING_CERT_SECRET_ANNOTATION: &str =
    "service.alpha.openshift.io/serving-cert-secret-name";
pub const ORIGINATING_SERVICE_NAME_ANNOTATION: &str =
    "service.alpha.openshift.io/originating-service-name";
pub const ORIGINATING_SERVICE_UID_ANNOTATION: &str =
    "service.alpha.openshift.io/originating-service-uid";
pub const EXPIRY_ANNOTATION: &str = "service.alpha.openshift.io/expiry";
pub const MANAGED_LABEL: &str = "serving-cert-signer.io/managed";

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Opaque string-keyed byte map stored in a Secret.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Namespace/name key for a Service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A Service as observed through the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub annotations: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), uid: uid.into(), annotations: BTreeMap::new() }
    }

    /// Builder-style helper that sets the serving-cert annotation.
    pub fn with_serving_cert_secret(mut self, secret_name: impl Into<String>) -> Self {
        self.annotations.insert(SERVING_CERT_SECRET_ANNOTATION.to_string(), secret_name.into());
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.name)
    }

    /// Target Secret name, when the Service opts in.
    pub fn serving_cert_secret(&self) -> Option<&str> {
        self.annotations
            .get(SERVING_CERT_SECRET_ANNOTATION)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// (namespace, service) pair plus the DNS names its certificate must cover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub namespace: String,
    pub service: String,
    pub cluster_domain: String,
}

impl ServiceIdentity {
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self { namespace: namespace.into(), service: service.into(), cluster_domain: cluster_domain.into() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::invalid_identity(format!("service '{}' has no namespace", self.service)));
        }
        if self.service.trim().is_empty() {
            return Err(Error::invalid_identity(format!(
                "service in namespace '{}' has no name",
                self.namespace
            )));
        }
        Ok(())
    }

    /// `<service>.<namespace>.svc` and `<service>.<namespace>.svc.<clusterDomain>`.
    pub fn dns_names(&self) -> Vec<String> {
        let short = format!("{}.{}.svc", self.service, self.namespace);
        let domain = self.cluster_domain.trim_matches('.');
        if domain.is_empty() {
            return vec![short];
        }
        let qualified = format!("{}.{}", short, domain);
        vec![short, qualified]
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.service)
    }
}

/// A signing key and its self-signed certificate. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    certificate: Certificate,
    key: PrivateKey,
}

impl CertificateAuthority {
    pub fn new(certificate: Certificate, key: PrivateKey) -> Result<Self> {
        if !certificate.info().is_ca || !certificate.info().can_sign_certificates {
            return Err(Error::malformed(format!(
                "certificate {} is not a signing CA",
                certificate.subject()
            )));
        }
        if !certificate.matches_key(&key) {
            return Err(Error::malformed(format!(
                "private key does not match CA certificate {}",
                certificate.subject()
            )));
        }
        Ok(Self { certificate, key })
    }

    /// Generate a fresh self-signed CA.
    pub fn generate(
        common_name: &str,
        algorithm: KeyAlgorithm,
        validity: Duration,
        now: OffsetDateTime,
    ) -> Result<Self> {
        let key = generate_key_pair(algorithm)?;
        let template = CertTemplate::ca(common_name, now, now + validity, algorithm);
        let certificate = self_sign(&template, &key)?;
        Ok(Self { certificate, key })
    }

    /// New CA with a new key that carries forward this CA's subject.
    pub fn replacement(&self, validity: Duration, now: OffsetDateTime) -> Result<Self> {
        let algorithm = self.key.algorithm();
        let key = generate_key_pair(algorithm)?;
        let template = CertTemplate::ca(self.certificate.subject(), now, now + validity, algorithm)
            .with_subject_of(&self.certificate)?;
        let certificate = self_sign(&template, &key)?;
        Ok(Self { certificate, key })
    }

    /// Load from PEM (`tls.crt` may hold a chain; the first certificate is the CA).
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certificate = decode_chain(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::malformed("CA certificate PEM is empty"))?;
        let key = decode_key(key_pem)?;
        Self::new(certificate, key)
    }

    pub fn to_secret_data(&self) -> Result<SecretData> {
        let mut data = SecretData::new();
        data.insert(TLS_CERT_KEY.to_string(), encode_chain([&self.certificate]));
        data.insert(TLS_PRIVATE_KEY_KEY.to_string(), encode_key(&self.key)?.to_vec());
        Ok(data)
    }

    pub fn from_secret_data(data: &SecretData) -> Result<Self> {
        let cert = data
            .get(TLS_CERT_KEY)
            .ok_or_else(|| Error::malformed(format!("missing {}", TLS_CERT_KEY)))?;
        let key = data
            .get(TLS_PRIVATE_KEY_KEY)
            .ok_or_else(|| Error::malformed(format!("missing {}", TLS_PRIVATE_KEY_KEY)))?;
        Self::from_pem(cert, key)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn serial(&self) -> &str {
        self.certificate.serial()
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.key.algorithm()
    }
}

/// CA subject for a newly bootstrapped signer: `<prefix>@<unix-seconds>`.
pub fn ca_common_name(prefix: &str, now: OffsetDateTime) -> String {
    format!("{}@{}", prefix, now.unix_timestamp())
}

/// Rotation status of the signing CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    Active,
    Rotating,
    Retiring,
}

impl CaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Retiring => "retiring",
        }
    }
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned "which CA is active" record. Only ever replaced through a
/// compare-and-swap on the store's resource version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaStateRecord {
    pub generation: u64,
    pub status: CaStatus,
    pub active_serial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CaStateRecord {
    pub fn initial(active_serial: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            generation: 1,
            status: CaStatus::Active,
            active_serial: active_serial.into(),
            next_serial: None,
            overlap_ends_at: None,
            updated_at: to_chrono(now),
        }
    }

    /// Copy with the generation bumped and `updated_at` set.
    fn advance(&self, now: OffsetDateTime) -> Self {
        Self { generation: self.generation + 1, updated_at: to_chrono(now), ..self.clone() }
    }

    pub fn begin_rotation(&self, now: OffsetDateTime) -> Self {
        Self { status: CaStatus::Rotating, next_serial: None, overlap_ends_at: None, ..self.advance(now) }
    }

    pub fn with_overlap(&self, next_serial: impl Into<String>, ends_at: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            next_serial: Some(next_serial.into()),
            overlap_ends_at: Some(to_chrono(ends_at)),
            ..self.advance(now)
        }
    }

    pub fn begin_retirement(&self, now: OffsetDateTime) -> Self {
        Self { status: CaStatus::Retiring, ..self.advance(now) }
    }

    pub fn complete_rotation(&self, new_active_serial: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            status: CaStatus::Active,
            active_serial: new_active_serial.into(),
            next_serial: None,
            overlap_ends_at: None,
            ..self.advance(now)
        }
    }

    pub fn overlap_ends_at(&self) -> Option<OffsetDateTime> {
        self.overlap_ends_at.map(from_chrono)
    }
}

/// Leaf certificate and private key for one service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingCertificate {
    pub certificate: Certificate,
    pub key: PrivateKey,
}

impl ServingCertificate {
    pub fn to_secret_data(&self) -> Result<SecretData> {
        let mut data = SecretData::new();
        data.insert(TLS_CERT_KEY.to_string(), encode_chain([&self.certificate]));
        data.insert(TLS_PRIVATE_KEY_KEY.to_string(), encode_key(&self.key)?.to_vec());
        Ok(data)
    }

    /// Decode `tls.crt` / `tls.key`. Missing keys and bad PEM are
    /// `MalformedInput`.
    pub fn from_secret_data(data: &SecretData) -> Result<Self> {
        let cert = data
            .get(TLS_CERT_KEY)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| Error::malformed(format!("missing {}", TLS_CERT_KEY)))?;
        let key = data
            .get(TLS_PRIVATE_KEY_KEY)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| Error::malformed(format!("missing {}", TLS_PRIVATE_KEY_KEY)))?;

        let certificate = decode_chain(cert)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::malformed("serving certificate PEM is empty"))?;
        let key = decode_key(key).map_err(|e| match e {
            Error::UnsupportedKeyType(msg) => Error::malformed(format!("unsupported key: {}", msg)),
            other => other,
        })?;
        Ok(Self { certificate, key })
    }
}

pub fn to_chrono(at: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(at.unix_timestamp(), at.nanosecond()).unwrap_or_default()
}

pub fn from_chrono(at: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(at.timestamp_nanos_opt().unwrap_or_default()))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
