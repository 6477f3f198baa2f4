//! Storage error types.

use std::sync::Arc;

use thiserror::Error;

/// Storage error types
///
/// Errors are `Clone` so a writer can hand the same failure back on every
/// call after the first one.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Object not found. Always carries the path the caller asked for.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Local IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Network, auth or SDK failure from a remote backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// A writer failed to finalize its object
    #[error("Write to {path} failed: {source}")]
    WriteFailure {
        path: String,
        #[source]
        source: Box<StorageError>,
    },

    /// A walk visitor's own error
    #[error("Walk aborted: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Writer used after a successful close
    #[error("Writer already closed: {0}")]
    Closed(String),

    /// Path rejected by the backend
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// Configuration that cannot be turned into a store
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Wrap a visitor error so it can abort a walk.
    pub fn callback<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StorageError::Callback(Arc::new(err))
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        StorageError::Transport(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Map an IO error, translating `NotFound` to the caller's path.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(Arc::new(err))
        }
    }

    /// Rewrite the path carried by a `NotFound`, leaving other errors alone.
    pub(crate) fn with_path(self, path: &str) -> Self {
        match self {
            StorageError::NotFound(_) => StorageError::NotFound(path.to_string()),
            other => other,
        }
    }

    /// Convert into an IO error for `AsyncRead` implementations.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            StorageError::Io(e) => std::io::Error::new(e.kind(), e.to_string()),
            // Interrupted would make read loops retry, so cancellation stays `Other`.
            other => std::io::Error::other(other),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        // Errors produced by `into_io` carry the original StorageError.
        if e.get_ref().is_some_and(|inner| inner.is::<StorageError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(storage) = inner.downcast::<StorageError>() {
                    return *storage;
                }
            }
            return StorageError::Transport("unrecoverable IO error".to_string());
        }
        StorageError::Io(Arc::new(e))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
