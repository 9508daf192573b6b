//! Certificate chain PEM encoding.

use crate::errors::{Error, Result};
use crate::pki::certificate::Certificate;

pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

const BEGIN_MARKER: &str = "-----BEGIN ";

/// Concatenate certificates as `CERTIFICATE` PEM blocks, preserving order.
pub fn encode_chain<'a, I>(certs: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Certificate>,
{
    let mut out = String::new();
    for cert in certs {
        out.push_str(&cert.to_pem());
    }
    out.into_bytes()
}

/// Decode every `CERTIFICATE` block in `bytes`, in order.
///
/// Fails with `MalformedInput` on input with no PEM blocks, on a block that
/// was opened but never closed, on blocks with any other label, and on
/// certificates whose DER does not parse.
pub fn decode_chain(bytes: &[u8]) -> Result<Vec<Certificate>> {
    let blocks = ::pem::parse_many(bytes)
        .map_err(|e| Error::malformed(format!("invalid PEM: {}", e)))?;
    if blocks.is_empty() {
        return Err(Error::malformed("no PEM blocks found"));
    }

    let opened = count_begin_markers(bytes);
    if opened != blocks.len() {
        return Err(Error::malformed(format!(
            "truncated PEM: {} blocks opened, {} complete",
            opened,
            blocks.len()
        )));
    }

    blocks
        .into_iter()
        .enumerate()
        .map(|(index, block)| {
            if block.tag() != CERTIFICATE_TAG {
                return Err(Error::malformed(format!(
                    "block {} is '{}', expected {}",
                    index,
                    block.tag(),
                    CERTIFICATE_TAG
                )));
            }
            Certificate::from_der(block.into_contents())
        })
        .collect()
}

fn count_begin_markers(bytes: &[u8]) -> usize {
    let marker = BEGIN_MARKER.as_bytes();
    bytes.windows(marker.len()).filter(|window| *window == marker).count()
}
