//! # PKI primitives
//!
//! Stateless certificate construction: key generation, PEM encoding,
//! self-signed CAs, leaf signing, the rotation threshold, cross-signing and
//! chain verification against a trust bundle.

pub mod builder;
pub mod certificate;
pub mod cross_sign;
pub mod expiry;
pub mod keys;
pub mod pem;
pub mod trust;

pub use builder::{self_sign, sign_leaf, sign_with_subject_key, CertTemplate, KeyUsage};
pub use certificate::{Certificate, CertificateInfo};
pub use cross_sign::{cross_sign, decode_single, CrossSignedPair};
pub use expiry::{is_rotation_due, rotation_threshold};
pub use keys::{decode_key, encode_key, generate_key_pair, KeyAlgorithm, PrivateKey};
pub use pem::{decode_chain, encode_chain};
pub use trust::TrustBundle;
