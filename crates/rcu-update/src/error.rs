//! Error types for update sessions

use std::io;
use std::time::Duration;

use rcu_image::ImageError;
use thiserror::Error;

/// Errors raised by the session manager and its collaborators
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A configuration field failed validation; the previous value is kept
    #[error("Invalid configuration field '{field}': {reason}")]
    ConfigFieldInvalid {
        /// Configuration key
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// No session matches the controller, image or session id given
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Both active session slots are taken
    #[error("Session limit reached, retry after {retry_after:?}")]
    SessionBusy {
        /// Suggested delay before asking again
        retry_after: Duration,
    },

    /// A read reached past the end of the image
    #[error("Read of {length} bytes at offset {offset} exceeds image size {size}")]
    OffsetOutOfRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: usize,
        /// Image size
        size: u64,
    },

    /// A buffer could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Image id is not in the catalog
    #[error("Image not found: {0}")]
    ImageNotFound(usize),

    /// Catalog error
    #[error(transparent)]
    Image(#[from] ImageError),

    /// File I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The session store failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The update service is not running
    #[error("Update service stopped")]
    ServiceStopped,
}

impl UpdateError {
    /// Create a configuration field error
    pub fn config_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigFieldInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a session-not-found error
    pub fn session_not_found(what: impl Into<String>) -> Self {
        Self::SessionNotFound(what.into())
    }

    /// Wrap a store failure, keeping its context chain
    pub fn persistence(err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    /// Whether the caller should simply ask again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionBusy { .. } | Self::ResourceExhausted(_))
    }
}

/// Result alias for update operations
pub type UpdateResult<T> = Result<T, UpdateError>;
