//! # Identities and the XOR metric
//!
//! Two types anchor the node's view of the network:
//!
//! - [`Destination`]: an opaque overlay address as handed to the transport.
//!   Serialized form is a 384-byte public key block followed by a certificate
//!   (1-byte type, 2-byte big-endian length, payload). The certificate length
//!   makes the encoding self-delimiting, which version-5 peer lists rely on;
//!   version-4 peer lists carry only the key block and the reader appends the
//!   3-byte null certificate.
//! - [`IdentityHash`]: the SHA-256 digest of a destination's serialized
//!   bytes. It is the routing-table key and the operand of the XOR distance.
//!
//! ## Invariants
//!
//! - `Destination::hash` is a pure function of the serialized bytes.
//! - XOR distance is a metric: `d(a,b)=0 ⇔ a=b`, symmetric, and satisfies
//!   the triangle inequality when distances are compared as big-endian
//!   unsigned integers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the fixed public key block at the front of every destination.
pub const KEY_BLOCK_LEN: usize = 384;

/// Certificate header: 1-byte type, 2-byte big-endian payload length.
pub const CERT_HEADER_LEN: usize = 3;

/// Minimum serialized destination: key block plus a null certificate.
pub const MIN_DESTINATION_LEN: usize = KEY_BLOCK_LEN + CERT_HEADER_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("destination truncated: {0} bytes")]
    Truncated(usize),
    #[error("certificate length {0} exceeds buffer")]
    CertificateOverrun(usize),
    #[error("invalid base64 destination")]
    Base64,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityHash([u8; 32]);

impl IdentityHash {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Byte-wise XOR distance to another hash.
    #[inline]
    pub fn xor_distance(&self, other: &IdentityHash) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_base64(self) -> String {
        BASE64.encode(self.0)
    }
}

impl std::fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityHash({})", &hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl From<[u8; 32]> for IdentityHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// An opaque overlay address.
///
/// The node never inspects key material; it only needs the serialized length
/// discipline (for peer-list codecs) and the identity hash.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    bytes: Vec<u8>,
}

impl Destination {
    /// Parse one self-delimiting destination from the front of `buf`.
    /// Returns the destination and the number of bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), IdentityError> {
        if buf.len() < MIN_DESTINATION_LEN {
            return Err(IdentityError::Truncated(buf.len()));
        }
        let cert_len =
            u16::from_be_bytes([buf[KEY_BLOCK_LEN + 1], buf[KEY_BLOCK_LEN + 2]]) as usize;
        let total = MIN_DESTINATION_LEN + cert_len;
        if buf.len() < total {
            return Err(IdentityError::CertificateOverrun(cert_len));
        }
        Ok((
            Self {
                bytes: buf[..total].to_vec(),
            },
            total,
        ))
    }

    /// Build a destination from a bare 384-byte key block (version-4 peer
    /// lists). The legacy encoding drops the certificate, so a null
    /// certificate is appended before parsing.
    pub fn from_key_block(block: &[u8]) -> Result<Self, IdentityError> {
        if block.len() < KEY_BLOCK_LEN {
            return Err(IdentityError::Truncated(block.len()));
        }
        let mut bytes = block[..KEY_BLOCK_LEN].to_vec();
        bytes.extend_from_slice(&[0u8; CERT_HEADER_LEN]);
        let (dest, consumed) = Self::from_bytes(&bytes)?;
        debug_assert_eq!(consumed, bytes.len());
        Ok(dest)
    }

    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        let bytes = BASE64.decode(s.trim()).map_err(|_| IdentityError::Base64)?;
        let (dest, consumed) = Self::from_bytes(&bytes)?;
        if consumed != bytes.len() {
            return Err(IdentityError::Truncated(bytes.len()));
        }
        Ok(dest)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The fixed key block, as emitted into version-4 peer lists.
    #[inline]
    pub fn key_block(&self) -> &[u8] {
        &self.bytes[..KEY_BLOCK_LEN]
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// SHA-256 of the serialized destination; the routing-table key.
    pub fn hash(&self) -> IdentityHash {
        let digest = Sha256::digest(&self.bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        IdentityHash(out)
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Destination({}, {} bytes)",
            &hex::encode(&self.hash().0[..8]),
            self.bytes.len()
        )
    }
}

/// Deterministic destination for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_destination(seed: u8) -> Destination {
    let mut block = vec![seed; KEY_BLOCK_LEN];
    block[0] = seed.wrapping_add(1);
    Destination::from_key_block(&block).unwrap()
}
