//! Error handling.

use std::error::Error as StdError;
use std::io;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use granary::GranaryError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
#[ignore_extra_doc_attributes]
pub enum ServerError {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// The requested namespace does not exist.
    NoSuchNamespace,

    /// Invalid compression type "{name}".
    InvalidCompressionType { name: String },

    /// Unsupported compression type "{name}".
    ///
    /// The compression format is recognized but deliberately not
    /// supported (e.g., lzip).
    UnsupportedCompressionType { name: String },

    /// No upstream produced the requested artifact.
    UpstreamUnavailable,

    /// Storage error: {0}
    StorageError(AnyError),

    /// Integrity error: {0}
    IntegrityError(AnyError),

    /// Manifest error: {0}
    ManifestError(crate::narinfo::Error),

    /// Signing error: {0}
    SigningError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components.
    GranaryError(GranaryError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn integrity_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::IntegrityError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InternalServerError => "InternalServerError",

            Self::NoSuchNamespace => "NoSuchNamespace",
            Self::InvalidCompressionType { .. } => "InvalidCompressionType",
            Self::UnsupportedCompressionType { .. } => "UnsupportedCompressionType",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::StorageError(_) => "StorageError",
            Self::IntegrityError(_) => "IntegrityError",
            Self::ManifestError(_) => "ManifestError",
            Self::SigningError(_) => "SigningError",
            Self::RequestError(_) => "RequestError",
            Self::GranaryError(e) => e.name(),
        }
    }

    /// Returns a version of this error for clients.
    ///
    /// Internal details are collapsed, and an upstream miss is
    /// indistinguishable from a plain 404.
    fn into_clients(self) -> Self {
        match self {
            Self::StorageError(_) => Self::InternalServerError,
            Self::IntegrityError(_) => Self::InternalServerError,
            Self::SigningError(_) => Self::InternalServerError,
            Self::UpstreamUnavailable => Self::NotFound,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::NoSuchNamespace => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable => StatusCode::NOT_FOUND,
            Self::InvalidCompressionType { .. } => StatusCode::BAD_REQUEST,
            Self::UnsupportedCompressionType { .. } => StatusCode::BAD_REQUEST,
            Self::ManifestError(_) => StatusCode::BAD_REQUEST,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::GranaryError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<GranaryError> for ServerError {
    fn from(error: GranaryError) -> Self {
        Self::GranaryError(error)
    }
}

impl From<crate::narinfo::Error> for ServerError {
    fn from(error: crate::narinfo::Error) -> Self {
        Self::ManifestError(error)
    }
}

impl From<ServerError> for io::Error {
    /// Converts a server error into an I/O error for use inside
    /// streaming bodies.
    fn from(error: ServerError) -> Self {
        io::Error::new(io::ErrorKind::Other, error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::StorageError(_) | Self::IntegrityError(_) | Self::SigningError(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
