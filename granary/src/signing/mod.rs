//! Manifest signing and verification.
//!
//! Nix signs NAR manifests with Ed25519. All signing-related strings
//! (keypairs, public keys, signatures) share one canonical format:
//!
//! ```text
//! {keyName}:{base64Payload}
//! ```
//!
//! We follow the same format, so keys generated with `nix-store
//! --generate-binary-cache-key` work unchanged. The payload of a keypair
//! is the 64-byte libsodium secret key (seed followed by the public
//! key), the payload of a public key is 32 bytes, and the payload of a
//! signature is 64 bytes.


use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::{DecodeError, Engine};
use displaydoc::Display;
use ed25519_compact::{
    Error as SignatureError, KeyPair, PublicKey as RawPublicKey, Signature as RawSignature,
};

use crate::error::GranaryResult;

/// An ed25519 keypair for signing.
#[derive(Debug)]
pub struct Keypair {
    /// Name of this key.
    name: String,

    /// The keypair.
    keypair: KeyPair,
}

/// An ed25519 public key for verification.
#[derive(Debug, Clone)]
pub struct PublicKey {
    /// Name of this key.
    name: String,

    /// The public key.
    public: RawPublicKey,
}

/// A detached signature in the canonical format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Name of the key that claims to have produced the signature.
    name: String,

    /// The raw signature bytes.
    bytes: [u8; RawSignature::BYTES],
}

/// A signing error.
#[derive(Debug, Display)]
#[ignore_extra_doc_attributes]
pub enum Error {
    /// Signature error: {0}
    SignatureError(SignatureError),

    /// The string has a wrong key name attached to it: Our name is "{our_name}" and the string has "{string_name}"
    WrongKeyName {
        our_name: String,
        string_name: String,
    },

    /// The string lacks a colon separator.
    NoColonSeparator,

    /// The name portion of the string is blank.
    BlankKeyName,

    /// Base64 decode error: {0}
    Base64DecodeError(DecodeError),

    /// Invalid base64 payload length: Expected {expected} ({usage}), got {actual}
    InvalidPayloadLength {
        expected: usize,
        actual: usize,
        usage: &'static str,
    },

    /// Invalid signing key name "{0}".
    ///
    /// A valid name cannot be empty and must not contain colons (:).
    InvalidSigningKeyName(String),
}

impl Keypair {
    /// Generates a new keypair.
    pub fn generate(name: &str) -> GranaryResult<Self> {
        let keypair = KeyPair::generate();

        validate_name(name)?;

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Imports an existing keypair from its canonical representation.
    pub fn from_str(keypair: &str) -> GranaryResult<Self> {
        let (name, bytes) = decode_string(keypair, "keypair", KeyPair::BYTES, None)?;

        let keypair = KeyPair::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Returns the name of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the canonical representation of the keypair.
    pub fn export_keypair(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair))
    }

    /// Returns the canonical representation of the public key.
    ///
    /// For example, it can look like:
    ///     granary-test:C929acssgtJoINkUtLbc81GFJPUW9maR77TxEu9ZpRw=
    pub fn export_public_key(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair.pk))
    }

    /// Returns the public key portion of the keypair.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            public: self.keypair.pk,
        }
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let bytes = self.keypair.sk.sign(message, None);
        Signature {
            name: self.name.clone(),
            bytes: *bytes,
        }
    }

    /// Verifies a message signed by this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> GranaryResult<()> {
        self.to_public_key().verify(message, signature)
    }
}

impl PublicKey {
    /// Imports an existing public key from its canonical representation.
    pub fn from_str(public_key: &str) -> GranaryResult<Self> {
        let (name, bytes) = decode_string(public_key, "public key", RawPublicKey::BYTES, None)?;

        let public = RawPublicKey::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            public,
        })
    }

    /// Returns the name of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the Nix-compatible textual representation of the public key.
    pub fn export(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.public))
    }

    /// Verifies a message.
    ///
    /// The signature must have been produced under the same key name.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> GranaryResult<()> {
        if signature.name != self.name {
            return Err(Error::WrongKeyName {
                our_name: self.name.clone(),
                string_name: signature.name.clone(),
            }
            .into());
        }

        let raw = RawSignature::new(signature.bytes);

        self.public
            .verify(message, &raw)
            .map_err(|e| Error::SignatureError(e).into())
    }
}

impl Signature {
    /// Parses a signature from its canonical representation.
    pub fn parse(signature: &str) -> GranaryResult<Self> {
        let (name, bytes) = decode_string(signature, "signature", RawSignature::BYTES, None)?;

        Ok(Self {
            name: name.to_string(),
            bytes: bytes.try_into().unwrap(),
        })
    }

    /// Returns the name of the key that claims this signature.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Signature {
    /// Formats the signature in its canonical representation.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64_STANDARD.encode(self.bytes))
    }
}

/// Validates the name/label of a signing key.
///
/// A valid name cannot be empty and must not contain colons (:).
fn validate_name(name: &str) -> GranaryResult<()> {
    if name.is_empty() || name.find(':').is_some() {
        Err(Error::InvalidSigningKeyName(name.to_string()).into())
    } else {
        Ok(())
    }
}

/// Decodes a colon-delimited string containing a key name and a base64 payload.
fn decode_string<'s>(
    s: &'s str,
    usage: &'static str,
    expected_payload_length: usize,
    expected_name: Option<&str>,
) -> GranaryResult<(&'s str, Vec<u8>)> {
    let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

    let (name, colon_and_payload) = s.split_at(colon);

    validate_name(name)?;

    // don't bother decoding base64 if the name doesn't match
    if let Some(expected_name) = expected_name {
        if expected_name != name {
            return Err(Error::WrongKeyName {
                our_name: expected_name.to_string(),
                string_name: name.to_string(),
            }
            .into());
        }
    }

    let bytes = BASE64_STANDARD
        .decode(&colon_and_payload[1..])
        .map_err(Error::Base64DecodeError)?;

    if bytes.len() != expected_payload_length {
        return Err(Error::InvalidPayloadLength {
            actual: bytes.len(),
            expected: expected_payload_length,
            usage,
        }
        .into());
    }

    Ok((name, bytes))
}
