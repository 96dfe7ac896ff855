//! Git error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by workspace git operations.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git reference not found during {operation}: {message}")]
    ReferenceNotFound { operation: String, message: String },

    #[error("Git {operation} rejected as non-fast-forward: {message}")]
    NonFastForward { operation: String, message: String },

    #[error("Git network error during {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("Git authentication failed during {operation}: {message}")]
    AuthFailed { operation: String, message: String },

    #[error("Git {operation} failed: {message}")]
    Command { operation: String, message: String },

    #[error("Failed to run git for {operation}: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create workspace '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write key file '{path}': {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("Invalid workspace name: {0}")]
    InvalidName(String),
}

impl GitError {
    pub fn is_reference_not_found(&self) -> bool {
        matches!(self, GitError::ReferenceNotFound { .. })
    }

    pub fn is_non_fast_forward(&self) -> bool {
        matches!(self, GitError::NonFastForward { .. })
    }

    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitError::Network { .. } | GitError::Spawn { .. })
    }
}

/// Result type for git workspace operations.
pub type Result<T> = std::result::Result<T, GitError>;
