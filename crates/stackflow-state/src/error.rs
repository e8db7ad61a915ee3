//! State store error types

use thiserror::Error;

/// State persistence and secret codec errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State store unavailable ({backend}): {message}")]
    StoreIo {
        backend: &'static str,
        message: String,
    },

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Invalid state path: {0}")]
    InvalidPath(String),

    #[error("Record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;
