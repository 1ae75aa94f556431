//! Integrity digests for outbound records.
//!
//! A [`RecordDigest`] is a SHA-256 over a record's canonical pre-noise
//! content. It identifies a record for tamper and duplicate detection and
//! carries no confidentiality guarantee.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Fixed-length one-way digest of a record's canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordDigest([u8; DIGEST_LEN]);

/// Errors from parsing a hex-encoded digest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseDigestError {
    #[error("digest must be {expected} hex characters, got {len}")]
    InvalidLength { expected: usize, len: usize },

    #[error("invalid hex digit at position {position}")]
    InvalidHex { position: usize },
}

impl RecordDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RecordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordDigest({})", self.to_hex())
    }
}

impl fmt::Display for RecordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for RecordDigest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(ParseDigestError::InvalidLength {
                expected: DIGEST_LEN * 2,
                len: s.len(),
            });
        }

        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { index, .. } => {
                ParseDigestError::InvalidHex { position: index }
            }
            _ => {
                ParseDigestError::InvalidLength {
                    expected: DIGEST_LEN * 2,
                    len: s.len(),
                }
            }
        })?;

        Ok(Self(bytes))
    }
}

impl Serialize for RecordDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecordDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Computes the SHA-256 digest of canonical bytes.
pub fn digest(canonical: &[u8]) -> RecordDigest {
    let out = Sha256::digest(canonical);
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&out);
    RecordDigest(bytes)
}

/// Builder for unambiguous canonical byte strings.
///
/// Every variable-length field is length-prefixed and every number has a
/// fixed-width big-endian encoding, so distinct field sequences never
/// produce the same bytes.
#[derive(Debug, Clone)]
pub struct CanonicalBytes {
    buf: Vec<u8>,
}

impl CanonicalBytes {
    /// Starts a canonical encoding with a domain-separation tag.
    pub fn new(domain: &str) -> Self {
        let mut this = Self {
            buf: Vec::with_capacity(128),
        };
        this.str(domain);
        this
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Encodes the IEEE-754 bit pattern, so `-0.0` and `0.0` differ.
    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn digest(&self) -> RecordDigest {
        digest(&self.buf)
    }
}
