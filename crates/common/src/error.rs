//! Common error types shared across crates.

use thiserror::Error;

/// User-facing error taxonomy for every cleanroom operation.
///
/// Each variant carries enough context for an operator to act on it without
/// reading logs. None of them ever contain key material.
#[derive(Debug, Error)]
pub enum CleanroomError {
    /// Local setup is incomplete or inconsistent (missing KEK entry, missing
    /// datastore key, stale KEK). A setup step must be run first.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No approved clean room policy is available for the contract.
    #[error("policy missing: {0}")]
    PolicyMissing(String),

    /// A policy document could not be patched (marker or digest-count mismatch).
    #[error("policy mismatch: {0}")]
    PolicyMismatch(String),

    /// A version or digest could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// A remote collaborator answered with a non-success status.
    #[error("{method} {url} failed with status: {status} response: {body}")]
    RemoteService {
        /// HTTP method of the failed request.
        method: String,
        /// Full request URL.
        url: String,
        /// HTTP status code (0 when no response was received).
        status: u16,
        /// Response body, or the transport error text.
        body: String,
    },

    /// More than one local entry matched a name that must be unique.
    #[error("duplicate entry: found more than one key entry with name '{0}'")]
    DuplicateEntry(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A structured document did not have the expected shape.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A cryptographic primitive failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Local filesystem failure.
    #[error("i/o failure on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CleanroomError {
    /// Short machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            CleanroomError::Configuration(_) => "ConfigurationError",
            CleanroomError::PolicyMissing(_) => "PolicyMissing",
            CleanroomError::PolicyMismatch(_) => "PolicyMismatchError",
            CleanroomError::NotFound(_) => "NotFoundError",
            CleanroomError::RemoteService { .. } => "RemoteServiceError",
            CleanroomError::DuplicateEntry(_) => "DuplicateEntryError",
            CleanroomError::Conflict(_) => "ConflictError",
            CleanroomError::InvalidDocument(_) => "InvalidDocument",
            CleanroomError::Crypto(_) => "CryptoError",
            CleanroomError::Io { .. } => "IoError",
        }
    }

    /// Whether the caller may reasonably retry the whole operation.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            CleanroomError::RemoteService { status, .. } => *status == 0 || *status >= 500,
            CleanroomError::Io { .. } | CleanroomError::Conflict(_) => true,
            _ => false,
        }
    }

    /// Helper for wrapping an [`std::io::Error`] with the offending path.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        CleanroomError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Convenience alias used throughout the cleanroom crates.
pub type Result<T> = std::result::Result<T, CleanroomError>;
