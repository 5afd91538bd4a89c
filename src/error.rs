use std::path::PathBuf;
use thiserror::Error;

use crate::workflow::WorkflowStatus;

/// Errors raised by the browser-automation driver
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The browser engine or its context could not be started
    #[error("failed to launch browser context: {0}")]
    Launch(String),

    /// The underlying browser context or window is gone
    #[error("browser context closed: {0}")]
    ContextClosed(String),

    /// Navigation failed for a reason other than a dead context
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// Any other driver command failure
    #[error("browser command failed: {0}")]
    Command(String),
}

impl DriverError {
    /// Whether this error means the session is dead and must be recreated
    pub fn is_context_closed(&self) -> bool {
        matches!(self, DriverError::ContextClosed(_))
    }
}

/// Errors raised by the browser session pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Admission control: the pool is at its concurrency ceiling
    #[error("session limit exceeded: {max} concurrent sessions already live")]
    SessionLimitExceeded { max: usize },

    #[error("no session registered under key '{0}'")]
    SessionNotFound(String),

    /// A session is already registered under this key
    #[error("a session already exists under key '{0}'")]
    DuplicateKey(String),

    #[error("browser pool has been shut down")]
    ShutDown,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors raised while reading or writing checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The file is not a complete, well-formed checkpoint
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The checkpoint was written with a schema this build does not understand
    #[error("unsupported checkpoint schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Structural workflow errors. Per-task failures are never reported this way.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot {operation} while workflow is {status}")]
    InvalidState {
        operation: &'static str,
        status: WorkflowStatus,
    },

    #[error("workflow has no page tasks")]
    NoTasks,

    #[error("page URLs have already been added to this workflow")]
    TasksAlreadyAdded,

    #[error("invalid page URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("project directory error: {0}")]
    Io(#[from] std::io::Error),
}
