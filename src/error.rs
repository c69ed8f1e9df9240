//! Core error types — the sentinel error kinds shared by every subsystem.
//!
//! A single [`CoreError`] enum covers the task API, the event history
//! pipeline and the replay service. Background components that must fan a
//! result out to several waiters (the async history flusher) rely on the
//! enum being `Clone`.

// ---------------------------------------------------------------------------
// CoreError enum
// ---------------------------------------------------------------------------

/// Unified error type for the orchestration core.
///
/// Each variant carries a human-readable message describing the specific
/// failure. Errors from injected collaborators (the agent executor, inner
/// history stores, the journal reader) are mapped onto these kinds at the
/// seam where they enter the core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// A task, session history, or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state — cancelling a terminal
    /// task, or a lease held by another owner.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required collaborator is unset or a resource gate timed out
    /// (admission, unconfigured state store).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Malformed or missing input — empty session id, blank description.
    #[error("validation: {0}")]
    Validation(String),

    /// The async history ingress queue stayed full for the whole append
    /// timeout.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A deadline elapsed before the operation finished.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Unexpected I/O or decode failure.
    #[error("internal: {0}")]
    Internal(String),
}

/// Convenience result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a `Validation` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a `QueueFull` error.
    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::QueueFull(message.into())
    }

    /// Create a `Cancelled` error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a `DeadlineExceeded` error.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded(message.into())
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error was caused by cancellation or a deadline.
    ///
    /// The execution service uses this to classify a worker's termination
    /// reason: deadlines map to `timeout`, other cancellation to
    /// `cancelled`.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CoreError::Cancelled(_) | CoreError::DeadlineExceeded(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {}", err))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(format!("io: {}", err))
    }
}
