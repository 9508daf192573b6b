//! Trust bundles and chain verification.
//!
//! A bundle is a set of anchors plus bridging intermediates. During a CA
//! rotation the intermediates are the cross-signed pair, which is what lets a
//! verifier anchored on one CA accept leaves issued by the other.

use time::OffsetDateTime;

use crate::errors::{Error, Result};
use crate::pki::certificate::Certificate;
use crate::pki::pem::{decode_chain, encode_chain};

const MAX_CHAIN_DEPTH: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustBundle {
    anchors: Vec<Certificate>,
    intermediates: Vec<Certificate>,
}

impl TrustBundle {
    pub fn new(anchors: Vec<Certificate>) -> Self {
        Self { anchors, intermediates: Vec::new() }
    }

    pub fn with_intermediates(mut self, intermediates: Vec<Certificate>) -> Self {
        self.intermediates = intermediates;
        self
    }

    /// Treat every certificate in a PEM bundle as a candidate: self-issued
    /// ones become anchors, the rest intermediates.
    pub fn from_pem(bytes: &[u8]) -> Result<Self> {
        let (anchors, intermediates) =
            decode_chain(bytes)?.into_iter().partition(|cert| cert.is_self_issued() && cert.is_issued_by(cert));
        Ok(Self { anchors, intermediates })
    }

    pub fn anchors(&self) -> &[Certificate] {
        &self.anchors
    }

    pub fn intermediates(&self) -> &[Certificate] {
        &self.intermediates
    }

    /// PEM blob: anchors first, then intermediates.
    pub fn to_pem(&self) -> Vec<u8> {
        encode_chain(self.anchors.iter().chain(self.intermediates.iter()))
    }

    /// Build a verified chain from `leaf` to one of the anchors.
    ///
    /// Every certificate on the chain must be valid at `at`. Returns the chain
    /// leaf-first, ending with the anchor.
    pub fn verify(&self, leaf: &Certificate, at: OffsetDateTime) -> Result<Vec<Certificate>> {
        if !leaf.is_valid_at(at) {
            return Err(Error::signing(format!(
                "certificate {} is outside its validity window at {}",
                leaf.serial(),
                at
            )));
        }

        let mut used = Vec::new();
        match self.chain_from(leaf, at, &mut used, 0) {
            Some(mut rest) => {
                rest.insert(0, leaf.clone());
                Ok(rest)
            }
            None => Err(Error::signing(format!(
                "no trusted chain for certificate {} issued by {}",
                leaf.serial(),
                leaf.info().issuer
            ))),
        }
    }

    pub fn is_trusted(&self, leaf: &Certificate, at: OffsetDateTime) -> bool {
        self.verify(leaf, at).is_ok()
    }

    fn chain_from(
        &self,
        cert: &Certificate,
        at: OffsetDateTime,
        used: &mut Vec<usize>,
        depth: usize,
    ) -> Option<Vec<Certificate>> {
        if let Some(anchor) = self
            .anchors
            .iter()
            .find(|anchor| anchor.info().is_ca && anchor.is_valid_at(at) && cert.is_issued_by(anchor))
        {
            return Some(vec![anchor.clone()]);
        }
        if depth >= MAX_CHAIN_DEPTH {
            return None;
        }

        for (index, intermediate) in self.intermediates.iter().enumerate() {
            if used.contains(&index)
                || !intermediate.info().is_ca
                || !intermediate.is_valid_at(at)
                || !cert.is_issued_by(intermediate)
            {
                continue;
            }
            used.push(index);
            if let Some(mut rest) = self.chain_from(intermediate, at, used, depth + 1) {
                rest.insert(0, intermediate.clone());
                return Some(rest);
            }
            used.pop();
        }
        None
    }
}
