//! Error types for the watch registry.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a low-level watch facility.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("path rejected by the watch facility: {0}")]
    Rejected(#[from] io::Error),

    #[error("per-process watch limit reached")]
    LimitReached,

    #[error("watch context is closed")]
    Closed,
}

impl BackendError {
    /// True when the path disappeared before it could be watched.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Rejected(err) if err.kind() == io::ErrorKind::NotFound)
    }
}

/// Errors surfaced to callers of the watch API.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("Watch limit exceeded while installing {path}")]
    WatchLimitExceeded { path: PathBuf },

    #[error("Low-level watch context unavailable: {reason}")]
    ContextUnavailable { reason: String },

    #[error("Watch on {root} was stopped before installation finished")]
    Cancelled { root: PathBuf },

    #[error("Control worker for {root} exited without replying")]
    ControlWorkerGone { root: PathBuf },

    #[error("Listener failed handling {kind} for {path}: {reason}")]
    CallbackFailure {
        kind: String,
        path: PathBuf,
        reason: String,
    },
}
