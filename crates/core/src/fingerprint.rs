use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Length in bytes of a [`Fingerprint`].
pub const FINGERPRINT_LEN: usize = 20;

/// A 160-bit content digest, rendered as 40 lowercase hex characters.
///
/// Fingerprints identify blocks (by their canonical serialization) and table
/// states (by the canonical serialization of the materialized table). The
/// all-zero fingerprint is not a digest of anything; it denotes "no ancestor"
/// and is written [`Fingerprint::ZERO`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// The null fingerprint, `0000…0000`.
    pub const ZERO: Self = Self([0; FINGERPRINT_LEN]);

    /// Digest an entire byte sequence in one call.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish()
    }

    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Whether this is the null fingerprint.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Error parsing a [`Fingerprint`] from its hex rendering.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected 40 hex characters")]
pub struct ParseFingerprintError;

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseFingerprintError)?;
        Ok(Self(bytes))
    }
}

/// Incremental fingerprint computation over a canonical byte sequence.
pub struct Hasher(Sha1);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
