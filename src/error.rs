// src/error.rs

use std::io;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::HostError;
use crate::validation::ValidationError;

/// Result alias used across the core
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Error classification shared by the store, applier and recovery reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A descriptor failed its invariants
    Validation,

    /// A descriptor or tenant is absent
    NotFound,

    /// A unique identifier is already taken
    AlreadyExists,

    /// A filesystem syscall failed
    Io,

    /// A child process failed
    OsExec,

    /// A child process exceeded its deadline
    OsExecTimeout,

    /// An on-disk file exists but cannot be trusted
    Corrupt,

    /// Cancellation was requested
    Aborted,

    /// A config template failed to render
    Render,
}

/// Errors produced by the state store, applier and recovery pipeline
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Command {program} failed (exit code {code:?}): {stderr}")]
    OsExec {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command {program} did not finish within {timeout_secs}s")]
    OsExecTimeout {
        program: String,
        timeout_secs: u64,
    },

    #[error("Corrupt file {path}: {reason}")]
    Corrupt {
        path: PathBuf,
        reason: String,
    },

    #[error("Operation aborted")]
    Aborted,

    #[error("Failed to render template {template}: {message}")]
    Render {
        template: String,
        message: String,
    },
}

impl CoreError {
    /// Wraps an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        CoreError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Builds a corruption error for a file
    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        CoreError::Corrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Returns the classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CoreError::Io { .. } => ErrorKind::Io,
            CoreError::OsExec { .. } => ErrorKind::OsExec,
            CoreError::OsExecTimeout { .. } => ErrorKind::OsExecTimeout,
            CoreError::Corrupt { .. } => ErrorKind::Corrupt,
            CoreError::Aborted => ErrorKind::Aborted,
            CoreError::Render { .. } => ErrorKind::Render,
        }
    }

    /// Whether the error means the target simply is not there
    pub fn is_not_found(&self) -> bool {
        match self {
            CoreError::NotFound(_) => true,
            CoreError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<HostError> for CoreError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Spawn { program, source } => CoreError::OsExec {
                program,
                code: None,
                stderr: source.to_string(),
            },
            HostError::Timeout { program, timeout_secs } => CoreError::OsExecTimeout {
                program,
                timeout_secs,
            },
        }
    }
}
