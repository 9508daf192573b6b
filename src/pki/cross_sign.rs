//! Cross-signing protocol used to hand trust from one CA to the next.
//!
//! Given the outgoing and incoming CA, produce:
//!
//! - `old_signed_by_new`: old CA subject and key, signed by the new CA, so a
//!   verifier anchored on the new CA accepts leaves issued by the old one.
//! - `new_signed_by_old`: the reverse, so verifiers that still only trust the
//!   old CA accept leaves issued by the new one.

use crate::errors::{Error, Result};
use crate::pki::builder::sign_with_subject_key;
use crate::pki::certificate::Certificate;
use crate::pki::keys::PrivateKey;
use crate::pki::pem::{decode_chain, encode_chain};

/// The two bridging certificates published during a rotation overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossSignedPair {
    pub old_signed_by_new: Certificate,
    pub new_signed_by_old: Certificate,
}

impl CrossSignedPair {
    /// Whether this pair bridges exactly `old` and `new`.
    pub fn bridges(&self, old: &Certificate, new: &Certificate) -> bool {
        self.old_signed_by_new.info().public_key_bits == old.info().public_key_bits
            && self.new_signed_by_old.info().public_key_bits == new.info().public_key_bits
            && self.old_signed_by_new.is_issued_by(new)
            && self.new_signed_by_old.is_issued_by(old)
    }

    pub fn certificates(&self) -> [&Certificate; 2] {
        [&self.new_signed_by_old, &self.old_signed_by_new]
    }
}

/// Run the cross-signing protocol for `old` -> `new`.
pub fn cross_sign(
    old_cert: &Certificate,
    old_key: &PrivateKey,
    new_cert: &Certificate,
    new_key: &PrivateKey,
) -> Result<CrossSignedPair> {
    let old_signed_by_new = sign_with_subject_key(old_cert, old_key, new_cert, new_key)?;
    let new_signed_by_old = sign_with_subject_key(new_cert, new_key, old_cert, old_key)?;

    Ok(CrossSignedPair {
        old_signed_by_new: exactly_one(&old_signed_by_new, "old-signed-by-new")?,
        new_signed_by_old: exactly_one(&new_signed_by_old, "new-signed-by-old")?,
    })
}

/// Decode `encoded` PEM and require a single certificate.
pub fn decode_single(encoded: &[u8], what: &str) -> Result<Certificate> {
    let mut certs = decode_chain(encoded)?;
    match certs.len() {
        1 => Ok(certs.remove(0)),
        n => Err(Error::signing(format!("{} decoded to {} certificates, expected 1", what, n))),
    }
}

fn exactly_one(cert: &Certificate, what: &str) -> Result<Certificate> {
    decode_single(&encode_chain([cert]), what)
}
