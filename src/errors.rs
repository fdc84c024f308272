use std::path::PathBuf;
use thiserror::Error;

/// The central error type for the taskstack runtime.
///
/// Each subsystem gets its own enum so callers can route recovery
/// programmatically: aborts terminate the streaming loop, transient API
/// errors retry with backoff, checkpoint errors surface to the caller.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task {task_id} aborted")]
    Aborted { task_id: String },

    #[error("Task {task_id} aborted during retry countdown")]
    AbortedDuringRetryCountdown { task_id: String },

    #[error("In-flight request for task {task_id} was cancelled")]
    RequestCancelled { task_id: String },

    #[error("No task is currently active")]
    NoActiveTask,

    #[error("Task {task_id} not found")]
    NotFound { task_id: String },
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Rate limit exceeded. Retry after {retry_after_secs:?} seconds")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("API returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Context window exceeded: {0}")]
    ContextWindowExceeded(String),

    #[error("Failed to parse API response: {0}")]
    Parse(String),

    #[error("API request timed out")]
    Timeout,

    #[error("Stream ended before any chunk arrived")]
    EmptyStream,
}

impl ApiError {
    /// Transient errors are retried with exponential backoff up to the
    /// provider-configured attempt ceiling.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimit { .. } | ApiError::Network(_) | ApiError::Timeout => true,
            ApiError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Context-window failures get their own bounded retry path with a
    /// forced context reduction, distinct from generic transient retry.
    pub fn is_context_window_exceeded(&self) -> bool {
        matches!(self, ApiError::ContextWindowExceeded(_))
    }

    /// HTTP status code, where one applies.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            ApiError::RateLimit { .. } => Some(429),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error(
        "Checkpoints are disabled because a nested git repository was detected at: {path}. \
         Remove or relocate nested git repositories to use checkpoints."
    )]
    NestedGitRepo { path: PathBuf },

    #[error("Shadow repo belongs to a different workspace: {actual} != {expected}")]
    WorktreeMismatch { expected: PathBuf, actual: PathBuf },

    #[error("Cannot use checkpoints in protected directory {path}")]
    ProtectedWorkspace { path: PathBuf },

    #[error("Shadow git repo not initialized")]
    NotInitialized,

    #[error("Shadow git repo already initialized")]
    AlreadyInitialized,

    #[error("Base hash was not set during initialization")]
    BaseHashMissing,

    #[error("Branch {branch} does not exist")]
    BranchNotFound { branch: String },

    #[error("Timed out waiting for branch switch to {branch}")]
    BranchSwitchTimeout { branch: String },

    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("Checkpoint storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Check whether an error is a deliberate interruption: a task abort or
/// a cancelled in-flight request. The streaming loop uses this to tell
/// "terminate promptly" apart from "retry or surface".
pub fn is_abort_error(e: &RuntimeError) -> bool {
    matches!(
        e,
        RuntimeError::Task(TaskError::Aborted { .. })
            | RuntimeError::Task(TaskError::AbortedDuringRetryCountdown { .. })
            | RuntimeError::Task(TaskError::RequestCancelled { .. })
    )
}
