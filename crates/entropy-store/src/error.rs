use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An update found the state in a shape that atomic updates should make
    /// impossible (e.g. completing an attachment twice).
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// Blob could not be written or read.
    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    /// Blob exceeds the configured maximum.
    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    /// No blob stored under the requested file id.
    #[error("Blob not found: {0}")]
    BlobNotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
