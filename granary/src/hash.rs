//! Content digests.
//!
//! Every byte sequence the proxy stores is addressed by its SHA-256
//! digest, and the same 32 bytes surface in different spellings
//! depending on where they appear: bare hexadecimal for chunk file
//! names and object keys, `sha256:<base32>` (Nix's base-32 alphabet)
//! for manifest fields. On input both spellings are accepted, since
//! caches in the wild render manifest hashes either way.

use displaydoc::Display;
use sha2::{Digest, Sha256};

use crate::error::GranaryResult;

/// Rendered length of a base16 digest.
const HEX_LEN: usize = 64;

/// Rendered length of a base32 digest.
const BASE32_LEN: usize = 52;

/// A SHA-256 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

/// A digest parsing error.
#[derive(Debug, Display)]
pub enum Error {
    /// Digest lacks the "sha256:" prefix.
    MissingPrefix,

    /// Digest is {0} characters long; expected 64 (base16) or 52 (base32).
    BadLength(usize),

    /// Invalid base16 digest.
    InvalidBase16,

    /// Invalid base32 digest.
    InvalidBase32,
}

impl ContentHash {
    /// Digests a byte slice.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Parses the typed form used in manifests, `sha256:<digest>`.
    pub fn parse_typed(s: &str) -> GranaryResult<Self> {
        let digest = s.strip_prefix("sha256:").ok_or(Error::MissingPrefix)?;

        Self::parse_digest(digest)
    }

    /// Parses a bare digest, choosing the spelling by length.
    ///
    /// Chunk file names go through this when the store directories are
    /// walked.
    pub fn parse_digest(s: &str) -> GranaryResult<Self> {
        let bytes = match s.len() {
            HEX_LEN => hex::decode(s).map_err(|_| Error::InvalidBase16)?,
            BASE32_LEN => nix_base32::from_nix_base32(s).ok_or(Error::InvalidBase32)?,
            other => return Err(Error::BadLength(other).into()),
        };

        Ok(Self(bytes.try_into().expect("digest is 32 bytes")))
    }

    /// Renders the bare hexadecimal form.
    ///
    /// This is the canonical on-disk and object-key name of a chunk.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Renders the typed manifest form, `sha256:<base32>`.
    pub fn to_typed_base32(&self) -> String {
        format!("sha256:{}", nix_base32::to_nix_base32(&self.0))
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
