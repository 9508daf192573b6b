//! # Issuance
//!
//! Maps a service identity to a signed serving certificate and decides when a
//! stored certificate has to be replaced.

use std::collections::BTreeSet;
use std::fmt;

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::domain::{CertificateAuthority, SecretData, ServiceIdentity, ServingCertificate};
use crate::errors::Result;
use crate::pki::{generate_key_pair, is_rotation_due, sign_leaf, CertTemplate, KeyAlgorithm, TrustBundle};

/// Backdating applied to `NotBefore` to absorb clock skew between nodes.
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::seconds(1);

/// Why a stored serving certificate must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReissueReason {
    /// No secret, or no certificate material in it
    Missing,
    /// Certificate or key does not decode
    Malformed,
    /// `tls.key` is not the certificate's private key
    KeyMismatch,
    /// DNS names differ from the identity's expected set
    SanMismatch,
    /// Issuer is neither the active CA nor covered by an in-progress rotation
    UntrustedIssuer,
    /// Leaf has crossed its own rotation threshold
    RotationDue,
}

impl ReissueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::KeyMismatch => "key_mismatch",
            Self::SanMismatch => "san_mismatch",
            Self::UntrustedIssuer => "untrusted_issuer",
            Self::RotationDue => "rotation_due",
        }
    }
}

impl fmt::Display for ReissueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct IssuanceEngine {
    algorithm: KeyAlgorithm,
    leaf_validity: Duration,
}

impl IssuanceEngine {
    pub fn new(algorithm: KeyAlgorithm, leaf_validity: Duration) -> Self {
        Self { algorithm, leaf_validity }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn leaf_validity(&self) -> Duration {
        self.leaf_validity
    }

    /// Sign a serving certificate for `identity` with the active CA.
    ///
    /// Every call generates a fresh key pair. `NotAfter` never extends past the
    /// CA's own `NotAfter`.
    pub fn issue(
        &self,
        identity: &ServiceIdentity,
        active_ca: &CertificateAuthority,
        now: OffsetDateTime,
    ) -> Result<ServingCertificate> {
        identity.validate()?;

        let not_before = now - CLOCK_SKEW_ALLOWANCE;
        let not_after = (now + self.leaf_validity).min(active_ca.certificate().not_after());
        let template = CertTemplate::serving(identity.dns_names(), not_before, not_after, self.algorithm);

        let key = generate_key_pair(self.algorithm)?;
        let certificate = sign_leaf(&template, &key, active_ca.certificate(), active_ca.key())?;
        debug!(
            namespace = %identity.namespace,
            service = %identity.service,
            serial = %certificate.serial(),
            not_after = %certificate.not_after(),
            "Signed serving certificate"
        );
        Ok(ServingCertificate { certificate, key })
    }

    /// Decide whether `existing` must be replaced, and why.
    ///
    /// `trust` anchors on the active CA and carries the cross-signed pair while
    /// a rotation is in progress, so leaves from either CA of the rotation are
    /// still accepted.
    pub fn reissue_reason(
        &self,
        existing: Option<&SecretData>,
        identity: &ServiceIdentity,
        trust: &TrustBundle,
        now: OffsetDateTime,
    ) -> Option<ReissueReason> {
        let Some(data) = existing else {
            return Some(ReissueReason::Missing);
        };
        if data.is_empty() {
            return Some(ReissueReason::Missing);
        }

        let serving = match ServingCertificate::from_secret_data(data) {
            Ok(serving) => serving,
            Err(e) => {
                debug!(service = %identity.key(), error = %e, "Stored serving certificate does not decode");
                return Some(ReissueReason::Malformed);
            }
        };
        let leaf = &serving.certificate;

        if !leaf.matches_key(&serving.key) {
            return Some(ReissueReason::KeyMismatch);
        }

        let expected: BTreeSet<String> = identity.dns_names().into_iter().collect();
        let actual: BTreeSet<String> = leaf.info().dns_names.iter().cloned().collect();
        if expected != actual {
            return Some(ReissueReason::SanMismatch);
        }

        if !trust.is_trusted(leaf, now) {
            return Some(ReissueReason::UntrustedIssuer);
        }

        if is_rotation_due(leaf.not_before(), leaf.not_after(), now) {
            return Some(ReissueReason::RotationDue);
        }

        None
    }

    pub fn needs_reissue(
        &self,
        existing: Option<&SecretData>,
        identity: &ServiceIdentity,
        trust: &TrustBundle,
        now: OffsetDateTime,
    ) -> bool {
        self.reissue_reason(existing, identity, trust, now).is_some()
    }
}
