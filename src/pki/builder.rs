//! Certificate templates and signing.
//!
//! Signing goes through rcgen. Issuers are rebuilt from their stored PEM with
//! `CertificateParams::from_ca_cert_pem`, so the issuer name written into a
//! child certificate is the issuer's own encoded subject.

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;

use crate::errors::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::pki::keys::{KeyAlgorithm, PrivateKey};

const SERIAL_LEN: usize = 16;

/// Key usage bits the signer sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    CertSign,
}

impl KeyUsage {
    fn to_rcgen(self) -> KeyUsagePurpose {
        match self {
            Self::DigitalSignature => KeyUsagePurpose::DigitalSignature,
            Self::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
            Self::CertSign => KeyUsagePurpose::KeyCertSign,
        }
    }
}

/// Description of a certificate to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertTemplate {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
    pub key_usages: Vec<KeyUsage>,
    pub server_auth: bool,
    pub algorithm: KeyAlgorithm,
    /// Full subject to encode instead of a bare `CN=common_name`.
    pub subject: Option<DistinguishedName>,
}

impl CertTemplate {
    /// CA template: keyEncipherment, digitalSignature and certSign with CA=true.
    pub fn ca(
        common_name: impl Into<String>,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        algorithm: KeyAlgorithm,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            dns_names: Vec::new(),
            not_before,
            not_after,
            is_ca: true,
            key_usages: vec![KeyUsage::KeyEncipherment, KeyUsage::DigitalSignature, KeyUsage::CertSign],
            server_auth: false,
            algorithm,
            subject: None,
        }
    }

    /// Serving certificate template. The first DNS name becomes the common name.
    pub fn serving(
        dns_names: Vec<String>,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
        algorithm: KeyAlgorithm,
    ) -> Self {
        Self {
            common_name: dns_names.first().cloned().unwrap_or_default(),
            dns_names,
            not_before,
            not_after,
            is_ca: false,
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            server_auth: true,
            algorithm,
            subject: None,
        }
    }

    /// Encode `previous`'s subject exactly as stored, every attribute kept.
    pub fn with_subject_of(mut self, previous: &Certificate) -> Result<Self> {
        let params = CertificateParams::from_ca_cert_pem(&previous.to_pem())
            .map_err(|e| Error::malformed(format!("cannot parse subject of {}: {}", previous.subject(), e)))?;
        self.subject = Some(params.distinguished_name);
        Ok(self)
    }

    /// Reject templates whose constraints contradict each other.
    pub fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(Error::template("subject common name is empty"));
        }
        if self.not_after <= self.not_before {
            return Err(Error::template(format!(
                "validity window is empty: not_before {} is not before not_after {}",
                self.not_before, self.not_after
            )));
        }
        let cert_sign = self.key_usages.contains(&KeyUsage::CertSign);
        if self.is_ca && !cert_sign {
            return Err(Error::template("CA=true requires the certSign key usage"));
        }
        if cert_sign && !self.is_ca {
            return Err(Error::template("certSign key usage requires CA=true"));
        }
        if self.is_ca && self.server_auth {
            return Err(Error::template("CA certificates must not carry serverAuth"));
        }
        Ok(())
    }

    fn to_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();

        params.distinguished_name = match &self.subject {
            Some(subject) => subject.clone(),
            None => {
                let mut name = DistinguishedName::new();
                name.push(DnType::CommonName, self.common_name.as_str());
                name
            }
        };

        for dns in &self.dns_names {
            let san = dns
                .clone()
                .try_into()
                .map_err(|e| Error::template(format!("invalid DNS name '{}': {}", dns, e)))?;
            params.subject_alt_names.push(SanType::DnsName(san));
        }

        params.serial_number = Some(random_serial());
        params.not_before = self.not_before;
        params.not_after = self.not_after;
        params.is_ca = if self.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::ExplicitNoCa
        };
        params.key_usages = self.key_usages.iter().map(|usage| usage.to_rcgen()).collect();
        if self.server_auth {
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
        Ok(params)
    }
}

/// 16 bytes from the OS CSPRNG with the top bit cleared so the DER integer
/// stays positive. Never zero.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    SerialNumber::from_slice(&bytes)
}

/// Rebuild an rcgen issuer from a stored CA certificate and its key.
pub(crate) fn load_issuer(
    cert: &Certificate,
    key: &PrivateKey,
) -> Result<(rcgen::Certificate, rcgen::KeyPair)> {
    if !cert.info().is_ca || !cert.info().can_sign_certificates {
        return Err(Error::signing(format!(
            "issuer {} is not a CA allowed to sign certificates",
            cert.subject()
        )));
    }
    if !cert.matches_key(key) {
        return Err(Error::signing(format!(
            "issuer key does not match certificate {}",
            cert.subject()
        )));
    }

    let key_pair = key.to_key_pair()?;
    let issuer = CertificateParams::from_ca_cert_pem(&cert.to_pem())
        .map_err(|e| Error::signing(format!("cannot load issuer {}: {}", cert.subject(), e)))?
        .self_signed(&key_pair)
        .map_err(|e| Error::signing(format!("cannot load issuer {}: {}", cert.subject(), e)))?;
    Ok((issuer, key_pair))
}

/// Produce a self-signed CA certificate.
pub fn self_sign(template: &CertTemplate, key: &PrivateKey) -> Result<Certificate> {
    template.validate()?;
    if !template.is_ca {
        return Err(Error::template("self-signed certificates are CA certificates"));
    }
    if template.algorithm != key.algorithm() {
        return Err(Error::template(format!(
            "template algorithm {} does not match {} key",
            template.algorithm,
            key.algorithm()
        )));
    }

    let key_pair = key.to_key_pair()?;
    let cert = template
        .to_params()?
        .self_signed(&key_pair)
        .map_err(|e| Error::signing(format!("self-signing {} failed: {}", template.common_name, e)))?;
    Certificate::from_der(cert.der().to_vec())
}

/// Produce a leaf certificate for `subject_key` chained to `issuer_cert`.
///
/// Fails with `Signing` when the template's key type differs from the
/// issuer's, or when the issuer cannot sign.
pub fn sign_leaf(
    template: &CertTemplate,
    subject_key: &PrivateKey,
    issuer_cert: &Certificate,
    issuer_key: &PrivateKey,
) -> Result<Certificate> {
    template.validate()?;
    if template.is_ca {
        return Err(Error::template("leaf templates must not be CA certificates"));
    }
    if template.algorithm != issuer_key.algorithm() {
        return Err(Error::signing(format!(
            "issuer {} key cannot sign a {} template",
            issuer_key.algorithm(),
            template.algorithm
        )));
    }
    if subject_key.algorithm() != template.algorithm {
        return Err(Error::template(format!(
            "subject key is {}, template asks for {}",
            subject_key.algorithm(),
            template.algorithm
        )));
    }

    let (issuer, issuer_pair) = load_issuer(issuer_cert, issuer_key)?;
    let subject_pair = subject_key.to_key_pair()?;
    let cert = template
        .to_params()?
        .signed_by(&subject_pair, &issuer, &issuer_pair)
        .map_err(|e| Error::signing(format!("signing {} failed: {}", template.common_name, e)))?;
    Certificate::from_der(cert.der().to_vec())
}

/// Re-issue `subject_cert` (same subject and public key) under a different
/// CA. Used to build cross-signed bridging certificates.
///
/// The result is a CA certificate with certSign and digitalSignature usage,
/// a fresh serial, and `subject_cert`'s validity clipped to the issuer's.
pub fn sign_with_subject_key(
    subject_cert: &Certificate,
    subject_key: &PrivateKey,
    issuer_cert: &Certificate,
    issuer_key: &PrivateKey,
) -> Result<Certificate> {
    if !subject_cert.matches_key(subject_key) {
        return Err(Error::signing(format!(
            "subject key does not match certificate {}",
            subject_cert.subject()
        )));
    }

    let mut params = CertificateParams::from_ca_cert_pem(&subject_cert.to_pem())
        .map_err(|e| Error::signing(format!("cannot load {}: {}", subject_cert.subject(), e)))?;
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = Vec::new();
    params.not_before = subject_cert.not_before().max(issuer_cert.not_before());
    params.not_after = subject_cert.not_after().min(issuer_cert.not_after());
    if params.not_after <= params.not_before {
        return Err(Error::signing(format!(
            "{} and {} have no overlapping validity",
            subject_cert.subject(),
            issuer_cert.subject()
        )));
    }

    let (issuer, issuer_pair) = load_issuer(issuer_cert, issuer_key)?;
    let subject_pair = subject_key.to_key_pair()?;
    let cert = params
        .signed_by(&subject_pair, &issuer, &issuer_pair)
        .map_err(|e| Error::signing(format!("cross-signing {} failed: {}", subject_cert.subject(), e)))?;
    Certificate::from_der(cert.der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::keys::generate_key_pair;
    use time::Duration;

    fn window() -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now, now + Duration::days(10))
    }

    #[test]
    fn test_self_sign_ca() {
        let (nb, na) = window();
        let key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let cert = self_sign(&CertTemplate::ca("root@1", nb, na, KeyAlgorithm::EcdsaP256), &key).unwrap();

        assert!(cert.info().is_ca);
        assert!(cert.info().can_sign_certificates);
        assert!(cert.is_issued_by(&cert));
        assert_eq!(cert.not_after().unix_timestamp(), na.unix_timestamp());
    }

    #[test]
    fn test_ca_without_cert_sign_is_rejected() {
        let (nb, na) = window();
        let key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let mut template = CertTemplate::ca("root@1", nb, na, KeyAlgorithm::EcdsaP256);
        template.key_usages.retain(|usage| *usage != KeyUsage::CertSign);

        assert!(matches!(self_sign(&template, &key), Err(Error::Template(_))));
    }

    #[test]
    fn test_cert_sign_without_ca_is_rejected() {
        let (nb, na) = window();
        let mut template = CertTemplate::serving(vec!["a.b.svc".into()], nb, na, KeyAlgorithm::EcdsaP256);
        template.key_usages.push(KeyUsage::CertSign);

        assert!(matches!(template.validate(), Err(Error::Template(_))));
    }

    #[test]
    fn test_empty_window_is_rejected() {
        let (nb, _) = window();
        let template = CertTemplate::ca("root@1", nb, nb, KeyAlgorithm::EcdsaP256);
        assert!(matches!(template.validate(), Err(Error::Template(_))));
    }

    #[test]
    fn test_sign_leaf_key_type_mismatch() {
        let (nb, na) = window();
        let ca_key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let ca = self_sign(&CertTemplate::ca("root@1", nb, na, KeyAlgorithm::EcdsaP256), &ca_key).unwrap();
        let leaf_key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let template = CertTemplate::serving(vec!["web.ns1.svc".into()], nb, na, KeyAlgorithm::Rsa2048);

        let err = sign_leaf(&template, &leaf_key, &ca, &ca_key).unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[test]
    fn test_sign_leaf_with_wrong_issuer_key() {
        let (nb, na) = window();
        let ca_key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let stranger = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let ca = self_sign(&CertTemplate::ca("root@1", nb, na, KeyAlgorithm::EcdsaP256), &ca_key).unwrap();
        let leaf_key = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let template = CertTemplate::serving(vec!["web.ns1.svc".into()], nb, na, KeyAlgorithm::EcdsaP256);

        let err = sign_leaf(&template, &leaf_key, &ca, &stranger).unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[test]
    fn test_rsa_leaf_under_rsa_ca() {
        let (nb, na) = window();
        let ca_key = generate_key_pair(KeyAlgorithm::Rsa2048).unwrap();
        let ca = self_sign(&CertTemplate::ca("rsa-root@1", nb, na, KeyAlgorithm::Rsa2048), &ca_key).unwrap();
        let leaf_key = generate_key_pair(KeyAlgorithm::Rsa2048).unwrap();
        let template = CertTemplate::serving(vec!["web.ns1.svc".into()], nb, na, KeyAlgorithm::Rsa2048);

        let leaf = sign_leaf(&template, &leaf_key, &ca, &ca_key).unwrap();
        assert!(leaf.is_issued_by(&ca));
        assert!(leaf.matches_key(&leaf_key));
    }

    #[test]
    fn test_serials_are_positive_and_distinct() {
        let a = random_serial();
        let b = random_serial();
        assert_ne!(a, b);
        let bytes = a.to_bytes();
        assert_eq!(bytes.len(), SERIAL_LEN);
        assert_eq!(bytes[0] & 0x80, 0);
        assert_ne!(bytes[0], 0);
    }
}
