//! Unified error types for the vkgate workspace.

use thiserror::Error;

/// Enumerates all error kinds that can occur across vkgate crates.
///
/// Expected routing outcomes (a pending virtual key, a missing BYOK profile)
/// are not errors; they are variants of [`crate::Resolution`].
#[derive(Debug, Error)]
pub enum GateError {
    /// No enabled system profile is configured for the scope.
    #[error("no enabled system profile for scope: {0}")]
    MissingSystemProfile(String),

    /// The scope cannot be mapped to a tier or profile.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistent storage (`SQLite`) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or decryption of a stored secret failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// No virtual key row exists with the given id.
    #[error("virtual key not found: {0}")]
    KeyNotFound(i64),

    /// A persisted enum column holds a value this build does not know.
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// The remote key service failed.
    #[error("key service error: {0}")]
    KeyService(#[from] KeyServiceError),
}

/// Errors returned by a [`crate::KeyService`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyServiceError {
    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote service returned a non-success status.
    #[error("upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The service refused the request without an HTTP status (used by fakes).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl KeyServiceError {
    /// Returns `true` if the failure is likely to clear up on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            Self::Http(_) | Self::Timeout => true,
            Self::Decode(_) | Self::Rejected(_) => false,
        }
    }
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for KeyServiceError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs can carry a virtual key in the query string.
        let e = e.without_url();
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for GateError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl GateError {
    /// Returns `true` if retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::KeyService(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GateError>;
