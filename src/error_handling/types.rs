use std::path::PathBuf;

use thiserror::Error;

use crate::network::types::ConnectionToken;
use crate::session_management::ConnectionState;

/// Bootstrap failures. All of them end the process before the engine starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Directory error: {0}")]
    DirectoryDoesNotExist(String),
    #[error("Directory not writable: {path}: {source}")]
    DirectoryNotWritable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Capture file not found: {0}")]
    CaptureFileMissing(String),
}

/// Payload sink failures. The engine recovers from these locally.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path} for writing: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Storage query `{operation}` failed: {reason}")]
    QueryFailed {
        operation: &'static str,
        reason: String,
    },
    #[error("Storage record not found: {what}")]
    NotFound { what: String },
    #[error("{field} of record {id} is already set")]
    WriteOnceViolation { field: &'static str, id: i64 },
}

impl StorageError {
    pub(crate) fn query(operation: &'static str, err: impl std::fmt::Display) -> Self {
        StorageError::QueryFailed {
            operation,
            reason: err.to_string(),
        }
    }
}

/// Event source failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("malformed capture: {0}")]
    Malformed(String),
}

/// Errors returned by the correlation engine to its driver. Every variant is fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("persistence failure during {operation}: {source}")]
    PersistenceFailure {
        operation: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("no flow record bound to connection {0}")]
    UnknownConnection(ConnectionToken),
    #[error("connection {token}: `{event}` is not valid in state {from:?}")]
    InvalidTransition {
        token: ConnectionToken,
        from: ConnectionState,
        event: &'static str,
    },
}

impl EngineError {
    pub(crate) fn persistence(operation: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| EngineError::PersistenceFailure { operation, source }
    }
}
