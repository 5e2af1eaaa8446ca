//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type GranaryResult<T> = Result<T, GranaryError>;

/// An error.
#[derive(Debug, Display)]
pub enum GranaryError {
    /// Invalid store path "{path}": {reason}
    InvalidStorePath { path: String, reason: &'static str },

    /// Invalid store path base name "{base_name}": {reason}
    InvalidStorePathName {
        base_name: String,
        reason: &'static str,
    },

    /// Invalid store path hash "{hash}": {reason}
    InvalidStorePathHash { hash: String, reason: &'static str },

    /// Invalid archive hash "{hash}": {reason}
    InvalidArchiveHash { hash: String, reason: &'static str },

    /// Invalid namespace "{name}"
    InvalidNamespace { name: String },

    /// Invalid chunker parameters: {reason}
    InvalidChunkerParams { reason: &'static str },

    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}
    IoError { error: io::Error },
}

impl GranaryError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidStorePath { .. } => "InvalidStorePath",
            Self::InvalidStorePathName { .. } => "InvalidStorePathName",
            Self::InvalidStorePathHash { .. } => "InvalidStorePathHash",
            Self::InvalidArchiveHash { .. } => "InvalidArchiveHash",
            Self::InvalidNamespace { .. } => "InvalidNamespace",
            Self::InvalidChunkerParams { .. } => "InvalidChunkerParams",
            Self::SigningError(_) => "SigningError",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for GranaryError {}

impl From<io::Error> for GranaryError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::signing::Error> for GranaryError {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}

impl From<super::hash::Error> for GranaryError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
