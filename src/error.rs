// ABOUTME: Defines all error types for the colony library using thiserror.
// ABOUTME: Each subsystem has its own error enum, unified under ColonyError.

use std::path::PathBuf;

/// Top-level error type for the colony library.
#[derive(Debug, thiserror::Error)]
pub enum ColonyError {
    #[error("Nest error: {0}")]
    Nest(#[from] NestError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("No resumable colony under {0}")]
    NothingToResume(PathBuf),
}

/// Errors from the on-disk coordination store.
#[derive(Debug, thiserror::Error)]
pub enum NestError {
    #[error("Lock {path} held by pid {holder_pid:?}, gave up after {waited_ms}ms")]
    LockTimeout {
        path: PathBuf,
        holder_pid: Option<u32>,
        waited_ms: u64,
    },

    #[error("Colony not found: {0}")]
    ColonyNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NestError {
    /// Whether the error is a lock timeout, which callers retry later.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, NestError::LockTimeout { .. })
    }
}

/// Errors from launching or supervising a worker process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to launch '{program}': {message}")]
    Launch { program: String, message: String },

    #[error("Worker pipe unavailable: {0}")]
    Pipe(&'static str),

    #[error("Prompt file error: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
