//! Error types for the sync layer.

use crate::types::DocumentPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure code reported by the document store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCode {
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Unavailable,
    DeadlineExceeded,
    Aborted,
    InvalidArgument,
    Internal,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCode::PermissionDenied => "permission-denied",
            FailureCode::NotFound => "not-found",
            FailureCode::AlreadyExists => "already-exists",
            FailureCode::Unavailable => "unavailable",
            FailureCode::DeadlineExceeded => "deadline-exceeded",
            FailureCode::Aborted => "aborted",
            FailureCode::InvalidArgument => "invalid-argument",
            FailureCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A rejection coming back from the document store.
///
/// `path` is the document the store blames, when it says. Compound writes use
/// it to work out which sub-write actually failed.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StoreFailure {
    pub code: FailureCode,
    pub message: String,
    pub path: Option<DocumentPath>,
}

impl StoreFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    /// Authorization rejection against `path`.
    pub fn permission_denied(path: &DocumentPath) -> Self {
        Self {
            code: FailureCode::PermissionDenied,
            message: "Missing or insufficient permissions.".to_string(),
            path: Some(path.clone()),
        }
    }

    pub fn at(mut self, path: &DocumentPath) -> Self {
        self.path = Some(path.clone());
        self
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code == FailureCode::PermissionDenied
    }
}

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store rejected request: {0}")]
    Store(#[from] StoreFailure),

    #[error("No signed-in principal")]
    NotSignedIn,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Project idea generation failed: {0}")]
    Generation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// The store failure behind this error, if any.
    pub fn store_failure(&self) -> Option<&StoreFailure> {
        match self {
            SyncError::Store(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.store_failure()
            .is_some_and(StoreFailure::is_permission_denied)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
