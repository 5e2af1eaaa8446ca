//! Store path formats.
//!
//! The proxy never touches a real Nix store, but almost every name that
//! crosses its HTTP surface derives from one: narinfo requests carry
//! the 32-character store path hash, NAR requests carry the 52-character
//! archive hash, and manifests reference store paths by base name.
//!
//! Both hash alphabets are Nix's base-32 set, which omits the letters
//! 'e', 'o', 'u' and 't'.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{GranaryError, GranaryResult};

/// The only store directory we accept in manifests.
pub const STORE_DIR: &str = "/nix/store";

/// Length of the hash in a store path.
pub const STORE_PATH_HASH_LEN: usize = 32;

/// Length of the hash naming a NAR file.
pub const ARCHIVE_HASH_LEN: usize = 52;

/// Regex that matches a store path hash, without anchors.
pub const STORE_PATH_HASH_REGEX_FRAGMENT: &str = "[0123456789abcdfghijklmnpqrsvwxyz]{32}";

/// Regex that matches an archive hash, without anchors.
pub const ARCHIVE_HASH_REGEX_FRAGMENT: &str = "[0123456789abcdfghijklmnpqrsvwxyz]{52}";

lazy_static! {
    /// Regex for a valid store path hash.
    static ref STORE_PATH_HASH_REGEX: Regex =
        Regex::new(&format!("^{}$", STORE_PATH_HASH_REGEX_FRAGMENT)).unwrap();

    /// Regex for a valid archive hash.
    static ref ARCHIVE_HASH_REGEX: Regex =
        Regex::new(&format!("^{}$", ARCHIVE_HASH_REGEX_FRAGMENT)).unwrap();

    /// Regex for a valid store base name.
    ///
    /// A base name consists of two parts: A hash and a human-readable
    /// label/name. The human-readable name can only contain the
    /// following characters:
    ///
    /// - A-Za-z0-9
    /// - `+-._?=`
    ///
    /// See the Nix implementation in `src/libstore/path.cc`.
    static ref STORE_BASE_NAME_REGEX: Regex =
        Regex::new(r"^[0123456789abcdfghijklmnpqrsvwxyz]{32}-[A-Za-z0-9+-._?=]+$").unwrap();
}

/// A path in a Nix store.
///
/// This must be a direct child of the store. This path may or
/// may not actually exist.
///
/// This guarantees that the base name is of valid format.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StorePath {
    /// Base name of the store path.
    ///
    /// For example, for `/nix/store/ia70ss13m22znbl8khrf2hq72qmh5drr-ruby-2.7.5`,
    /// this would be `ia70ss13m22znbl8khrf2hq72qmh5drr-ruby-2.7.5`.
    base_name: String,
}

/// A fixed-length store path hash.
///
/// For example, for `/nix/store/ia70ss13m22znbl8khrf2hq72qmh5drr-ruby-2.7.5`,
/// this would be `ia70ss13m22znbl8khrf2hq72qmh5drr`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct StorePathHash(String);

/// A fixed-length hash naming a NAR file, as in `nar/{hash}.nar`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct ArchiveHash(String);

impl StorePath {
    /// Creates a StorePath from a base name.
    pub fn from_base_name(base_name: &str) -> GranaryResult<Self> {
        if !STORE_BASE_NAME_REGEX.is_match(base_name) {
            return Err(GranaryError::InvalidStorePathName {
                base_name: base_name.to_owned(),
                reason: "Name is of invalid format",
            });
        }

        Ok(Self {
            base_name: base_name.to_owned(),
        })
    }

    /// Creates a StorePath from a full store path.
    ///
    /// The path must be a direct child of `/nix/store`.
    pub fn from_full_path(path: &str) -> GranaryResult<Self> {
        let base_name = path
            .strip_prefix(STORE_DIR)
            .and_then(|p| p.strip_prefix('/'))
            .ok_or_else(|| GranaryError::InvalidStorePath {
                path: path.to_owned(),
                reason: "Path is not in the Nix store",
            })?;

        if base_name.contains('/') {
            return Err(GranaryError::InvalidStorePath {
                path: path.to_owned(),
                reason: "Path is not a direct child of the store",
            });
        }

        Self::from_base_name(base_name)
    }

    /// Gets the hash portion of the store path.
    pub fn to_hash(&self) -> StorePathHash {
        // already validated against STORE_BASE_NAME_REGEX
        StorePathHash(self.base_name[..STORE_PATH_HASH_LEN].to_string())
    }

    /// Returns the base name of the store path.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Returns the human-readable name portion of the store path.
    pub fn name(&self) -> &str {
        &self.base_name[STORE_PATH_HASH_LEN + 1..]
    }
}

impl fmt::Display for StorePath {
    /// Formats the full store path.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", STORE_DIR, self.base_name)
    }
}

impl StorePathHash {
    /// Creates a StorePathHash, validating the format.
    pub fn new(hash: String) -> GranaryResult<Self> {
        if !STORE_PATH_HASH_REGEX.is_match(&hash) {
            return Err(GranaryError::InvalidStorePathHash {
                hash,
                reason: "Hash is of invalid format",
            });
        }

        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for StorePathHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer)
            .and_then(|s| Self::new(s).map_err(|e| Error::custom(e.to_string())))
    }
}

impl ArchiveHash {
    /// Creates an ArchiveHash, validating the format.
    pub fn new(hash: String) -> GranaryResult<Self> {
        if !ARCHIVE_HASH_REGEX.is_match(&hash) {
            return Err(GranaryError::InvalidArchiveHash {
                hash,
                reason: "Hash is of invalid format",
            });
        }

        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
