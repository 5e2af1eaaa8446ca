//! NAR info manifests.
//!
//! ## `.narinfo` format
//!
//! An example of [a valid
//! .narinfo](https://cache.nixos.org/p4pclmv1gyja5kzc26npqpia1qqxrf0l.narinfo)
//! signed by https://cache.nixos.org:
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
//! Compression: xz
//! FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
//! FileSize: 4029176
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3 ...
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```
//!
//! The format is line-oriented `Key: Value` pairs. We parse strictly:
//! unknown keys and duplicated single-valued keys are errors, and every
//! field is validated against the grammar it must satisfy. `Sig` may
//! repeat. A missing `Compression` means `bzip2`, which is what Nix
//! assumes.
//!
//! ## Canonicalization
//!
//! Before a manifest is persisted it goes through two rewrites:
//!
//! - [`NarInfo::sanitize_nar`] points the manifest at the uncompressed
//!   NAR. The proxy stores NARs uncompressed and cannot promise to
//!   reproduce an upstream's exact compressed bytes, so recording the
//!   upstream `FileHash`/`FileSize` would assert something we cannot
//!   serve.
//! - [`NarInfo::sanitize_signatures`] keeps only signatures that verify
//!   under a trusted key and drops the rest. If nothing remains, the
//!   manifest is re-signed with the namespace key.
//!
//! ## Fingerprint
//!
//! The signed message ("fingerprint") contains the full store path, the
//! NAR hash, the NAR size, and the comma-delimited full paths of the
//! references:
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
//! ```


use std::fmt;
use std::str::FromStr;

use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;

use granary::hash::ContentHash;
use granary::signing::{Keypair, PublicKey, Signature};
use granary::store_path::{StorePath, ARCHIVE_HASH_REGEX_FRAGMENT, STORE_DIR};

lazy_static! {
    static ref URL_REGEX: Regex = Regex::new(&format!(
        r"^nar/{}\.nar(\.[a-z0-9]+)?$",
        ARCHIVE_HASH_REGEX_FRAGMENT
    ))
    .unwrap();
    static ref REFERENCE_REGEX: Regex =
        Regex::new(r"^[0123456789abcdfghijklmnpqrsvwxyz]{32}-[A-Za-z0-9+-._?=]+$").unwrap();
}

pub type Result<T> = std::result::Result<T, Error>;

/// NAR information.
#[derive(Debug, Clone)]
pub struct NarInfo {
    /// The full store path being cached.
    ///
    /// Part of the fingerprint.
    pub store_path: StorePath,

    /// The URL to fetch the archive, relative to the cache root.
    ///
    /// Example: `nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz`
    pub url: String,

    /// Compression of the archive behind `url`.
    pub compression: Compression,

    /// The hash of the file behind `url` (the compressed form).
    pub file_hash: Option<ContentHash>,

    /// The size of the file behind `url`.
    pub file_size: Option<u64>,

    /// The hash of the uncompressed NAR.
    ///
    /// Part of the fingerprint.
    pub nar_hash: ContentHash,

    /// The size of the uncompressed NAR.
    ///
    /// Part of the fingerprint.
    pub nar_size: u64,

    /// Base names of store paths directly referenced by the contents.
    ///
    /// Part of the fingerprint.
    pub references: Vec<String>,

    /// The derivation that produced this object, as a base name.
    pub deriver: Option<String>,

    /// Signatures over the fingerprint.
    pub sigs: Vec<Signature>,

    /// The content address of the object.
    pub ca: Option<String>,
}

/// NAR compression type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Bzip2,
    Brotli,
    Zstd,
}

/// A manifest error.
#[derive(Debug, Display)]
pub enum Error {
    /// Invalid line: {0}
    InvalidLine(String),

    /// Unknown field: {0}
    UnknownField(String),

    /// Duplicate field: {0}
    DuplicateField(&'static str),

    /// Missing field: {0}
    MissingField(&'static str),

    /// Invalid store path: {0}
    InvalidStorePath(String),

    /// Invalid URL: {0}
    InvalidUrl(String),

    /// Invalid compression type "{0}".
    InvalidCompression(String),

    /// Invalid hash in {field}: {value}
    InvalidHash { field: &'static str, value: String },

    /// Invalid integer in {field}: {value}
    InvalidInteger { field: &'static str, value: String },

    /// {0} must be positive.
    NotPositive(&'static str),

    /// Invalid reference "{0}"
    InvalidReference(String),

    /// Invalid deriver "{0}"
    InvalidDeriver(String),

    /// Field {0} may not be empty.
    EmptyField(&'static str),
}

impl std::error::Error for Error {}

impl NarInfo {
    /// Parses and validates a manifest.
    pub fn from_str(manifest: &str) -> Result<Self> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = None;
        let mut deriver = None;
        let mut sigs: Vec<Signature> = Vec::new();
        let mut ca = None;

        for line in manifest.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let (key, rest) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            let value = rest
                .strip_prefix(' ')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            match key {
                "StorePath" => {
                    let path = StorePath::from_full_path(value)
                        .map_err(|_| Error::InvalidStorePath(value.to_string()))?;

                    if store_path.replace(path).is_some() {
                        return Err(Error::DuplicateField("StorePath"));
                    }
                }
                "URL" => {
                    if !URL_REGEX.is_match(value) {
                        return Err(Error::InvalidUrl(value.to_string()));
                    }

                    if url.replace(value.to_string()).is_some() {
                        return Err(Error::DuplicateField("URL"));
                    }
                }
                "Compression" => {
                    let parsed = value.parse()?;

                    if compression.replace(parsed).is_some() {
                        return Err(Error::DuplicateField("Compression"));
                    }
                }
                "FileHash" => {
                    let hash = parse_hash("FileHash", value)?;

                    if file_hash.replace(hash).is_some() {
                        return Err(Error::DuplicateField("FileHash"));
                    }
                }
                "FileSize" => {
                    let size = parse_size("FileSize", value)?;

                    if file_size.replace(size).is_some() {
                        return Err(Error::DuplicateField("FileSize"));
                    }
                }
                "NarHash" => {
                    let hash = parse_hash("NarHash", value)?;

                    if nar_hash.replace(hash).is_some() {
                        return Err(Error::DuplicateField("NarHash"));
                    }
                }
                "NarSize" => {
                    let size = parse_size("NarSize", value)?;

                    if nar_size.replace(size).is_some() {
                        return Err(Error::DuplicateField("NarSize"));
                    }
                }
                "References" => {
                    let refs: Vec<String> = if value.is_empty() {
                        Vec::new()
                    } else {
                        value
                            .split(' ')
                            .map(|r| {
                                if REFERENCE_REGEX.is_match(r) {
                                    Ok(r.to_string())
                                } else {
                                    Err(Error::InvalidReference(r.to_string()))
                                }
                            })
                            .collect::<Result<_>>()?
                    };

                    if references.replace(refs).is_some() {
                        return Err(Error::DuplicateField("References"));
                    }
                }
                "Deriver" => {
                    let parsed = match value {
                        "unknown-deriver" => None,
                        _ => {
                            let valid = value
                                .strip_suffix(".drv")
                                .map(|v| REFERENCE_REGEX.is_match(v))
                                .unwrap_or(false);

                            if !valid {
                                return Err(Error::InvalidDeriver(value.to_string()));
                            }

                            Some(value.to_string())
                        }
                    };

                    if deriver.is_some() {
                        return Err(Error::DuplicateField("Deriver"));
                    }
                    deriver = parsed;
                }
                "Sig" => {
                    // Malformed signatures are dropped, not fatal; they
                    // would be stripped during sanitization anyway.
                    if let Ok(sig) = Signature::parse(value) {
                        sigs.push(sig);
                    }
                }
                "CA" => {
                    if value.is_empty() {
                        return Err(Error::EmptyField("CA"));
                    }

                    if ca.replace(value.to_string()).is_some() {
                        return Err(Error::DuplicateField("CA"));
                    }
                }
                _ => {
                    return Err(Error::UnknownField(key.to_string()));
                }
            }
        }

        Ok(Self {
            store_path: store_path.ok_or(Error::MissingField("StorePath"))?,
            url: url.ok_or(Error::MissingField("URL"))?,
            compression: compression.unwrap_or(Compression::Bzip2),
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or(Error::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(Error::MissingField("NarSize"))?,
            references: references.ok_or(Error::MissingField("References"))?,
            deriver,
            sigs,
            ca,
        })
    }

    /// Rewrites the manifest to reference the uncompressed NAR.
    ///
    /// The proxy persists NARs uncompressed, so the file-level fields
    /// become aliases of the NAR-level ones and the URL loses its
    /// compression extension.
    pub fn sanitize_nar(&mut self) {
        self.compression = Compression::None;
        self.file_hash = Some(self.nar_hash);
        self.file_size = Some(self.nar_size);

        // validated in from_str, ".nar" is always present
        if let Some(pos) = self.url.find(".nar") {
            self.url.truncate(pos + ".nar".len());
        }
    }

    /// Keeps only signatures that verify under one of the trusted keys.
    ///
    /// Everything else is dropped silently.
    pub fn sanitize_signatures(&mut self, trusted_keys: &[PublicKey]) {
        let fingerprint = self.fingerprint();

        self.sigs.retain(|sig| {
            trusted_keys
                .iter()
                .any(|key| key.verify(&fingerprint, sig).is_ok())
        });
    }

    /// Signs the manifest and adds the signature to it.
    pub fn sign(&mut self, keypair: &Keypair) {
        let fingerprint = self.fingerprint();
        self.sigs.push(keypair.sign(&fingerprint));
    }

    /// Returns the fingerprint of the object.
    pub fn fingerprint(&self) -> Vec<u8> {
        // 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
        let mut fingerprint = b"1;".to_vec();

        fingerprint.extend(self.store_path.to_string().as_bytes());
        fingerprint.extend(b";");

        fingerprint.extend(self.nar_hash.to_typed_base32().as_bytes());
        fingerprint.extend(b";");

        fingerprint.extend(self.nar_size.to_string().as_bytes());
        fingerprint.extend(b";");

        let mut iter = self.references.iter().peekable();
        while let Some(reference) = iter.next() {
            fingerprint.extend(STORE_DIR.as_bytes());
            fingerprint.extend(b"/");
            fingerprint.extend(reference.as_bytes());

            if iter.peek().is_some() {
                fingerprint.extend(b",");
            }
        }

        fingerprint
    }
}

impl fmt::Display for NarInfo {
    /// Serializes the manifest.
    ///
    /// Fields are emitted in a fixed order and signatures are sorted,
    /// so equal manifests always serialize identically.
    fn fmt(&self, w: &mut fmt::Formatter) -> fmt::Result {
        writeln!(w, "StorePath: {}", self.store_path)?;
        writeln!(w, "URL: {}", self.url)?;
        writeln!(w, "Compression: {}", self.compression.as_str())?;

        if let Some(file_hash) = &self.file_hash {
            writeln!(w, "FileHash: {}", file_hash.to_typed_base32())?;
        }

        if let Some(file_size) = self.file_size {
            writeln!(w, "FileSize: {}", file_size)?;
        }

        writeln!(w, "NarHash: {}", self.nar_hash.to_typed_base32())?;
        writeln!(w, "NarSize: {}", self.nar_size)?;

        write!(w, "References:")?;
        if self.references.is_empty() {
            write!(w, " ")?;
        } else {
            for reference in &self.references {
                write!(w, " {}", reference)?;
            }
        }
        writeln!(w)?;

        if let Some(deriver) = &self.deriver {
            writeln!(w, "Deriver: {}", deriver)?;
        }

        let mut sigs: Vec<String> = self.sigs.iter().map(|s| s.to_string()).collect();
        sigs.sort();
        for sig in sigs {
            writeln!(w, "Sig: {}", sig)?;
        }

        if let Some(ca) = &self.ca {
            writeln!(w, "CA: {}", ca)?;
        }

        Ok(())
    }
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "xz" => Ok(Self::Xz),
            "bzip2" => Ok(Self::Bzip2),
            "br" => Ok(Self::Brotli),
            "zst" | "zstd" => Ok(Self::Zstd),
            _ => Err(Error::InvalidCompression(s.to_string())),
        }
    }
}

fn parse_hash(field: &'static str, value: &str) -> Result<ContentHash> {
    ContentHash::parse_typed(value).map_err(|_| Error::InvalidHash {
        field,
        value: value.to_string(),
    })
}

fn parse_size(field: &'static str, value: &str) -> Result<u64> {
    let size: u64 = value.parse().map_err(|_| Error::InvalidInteger {
        field,
        value: value.to_string(),
    })?;

    if size == 0 {
        return Err(Error::NotPositive(field));
    }

    Ok(size)
}
