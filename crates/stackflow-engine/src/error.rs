//! Engine error types

use crate::provider::ProviderError;
use stackflow_config::ConfigError;
use stackflow_state::StateError;
use thiserror::Error;

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Provider not found for resource type: {0}")]
    ProviderNotFound(String),

    #[error("{path}: {source}")]
    Provider {
        path: String,
        #[source]
        source: ProviderError,
    },

    #[error("Conflict at {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("State store error: {0}")]
    Store(StateError),

    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("{} member(s) of a parallel group failed: {}", .0.len(), join_errors(.0))]
    GroupFailed(Vec<EngineError>),

    #[error("Run did not complete, finalize skipped. Failed resources: {}", .0.join(", "))]
    RunIncomplete(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Errors that must abort the whole run
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Decryption(_) | EngineError::Store(_) | EngineError::Config(_) => true,
            EngineError::GroupFailed(errors) => errors.iter().any(EngineError::is_fatal),
            _ => false,
        }
    }

    /// Resource path the error is about, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            EngineError::Provider { path, .. } | EngineError::Conflict { path, .. } => Some(path),
            EngineError::NotFound(path) => Some(path),
            _ => None,
        }
    }
}

impl From<StateError> for EngineError {
    fn from(error: StateError) -> Self {
        match error {
            StateError::Decryption(message) => EngineError::Decryption(message),
            StateError::InvalidPath(message) | StateError::InvalidSecret(message) => {
                EngineError::InvalidDeclaration(message)
            }
            other => EngineError::Store(other),
        }
    }
}

fn join_errors(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
