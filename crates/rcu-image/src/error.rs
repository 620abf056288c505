//! Error types for image catalog operations

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while cataloging or matching update images
#[derive(Error, Debug)]
pub enum ImageError {
    /// Descriptor is missing a required field or carries an out-of-range value.
    /// The archive is skipped; scanning continues.
    #[error("Invalid image descriptor in {}: {reason}", path.display())]
    DescriptorInvalid {
        /// Archive or descriptor that was rejected
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Descriptor names an image type this manager does not serve
    #[error("Unsupported image type: {0}")]
    UnsupportedImageType(String),

    /// Version text could not be parsed or a component is out of range
    #[error("Invalid version '{text}': {reason}")]
    InvalidVersion {
        /// The offending text
        text: String,
        /// Parse failure detail
        reason: String,
    },

    /// Entry cannot be replaced while sessions are still reading it
    #[error("Image {id} is in use by {readers} session(s)")]
    ImageInUse {
        /// Catalog id
        id: usize,
        /// Current reader count
        readers: u32,
    },

    /// Explicit id too far past the end of the catalog
    #[error("Image id {id} is beyond the catalog limit {limit}")]
    ImageIdOutOfRange {
        /// Requested id
        id: usize,
        /// Highest id a push may use right now
        limit: usize,
    },

    /// No catalog entry at this id
    #[error("Image not found: {0}")]
    ImageNotFound(usize),

    /// I/O error while extracting or reading an archive
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageError {
    /// Create a descriptor-invalid error.
    #[must_use]
    pub fn descriptor_invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DescriptorInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-version error.
    #[must_use]
    pub fn invalid_version(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersion {
            text: text.into(),
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for image catalog operations.
pub type ImageResult<T> = std::result::Result<T, ImageError>;
