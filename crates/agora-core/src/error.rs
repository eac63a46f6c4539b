//! Error types for the coordination layer, with retryable/terminal
//! classification.
//!
//! The store boundary reports failures through [`StoreError`], whose variants
//! mirror the structured error kinds of the consumed store contract. The
//! retry layer never inspects message text for kinded errors; only
//! [`StoreError::Backend`] (a store client that lost the structured kind)
//! falls back to [`classify_backend_message`], which exists as a
//! compatibility shim and nothing more.

use thiserror::Error;

/// Classification of an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Error is transient contention and can be retried.
    Retryable,
    /// Error is permanent and must propagate immediately.
    Terminal,
}

/// Errors surfaced by a document store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A transaction was aborted because a document it read changed before
    /// commit.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// An optimistic version precondition did not hold.
    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    /// The store is temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The store reported an internal fault.
    #[error("internal store error: {0}")]
    Internal(String),

    /// The caller is not authorized for this operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The addressed document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// A document value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A backend failure that carries no structured kind. Classified by
    /// message text as a fallback.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Classify the error as retryable or terminal.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Aborted(_)
            | Self::FailedPrecondition(_)
            | Self::Unavailable(_)
            | Self::DeadlineExceeded(_)
            | Self::Internal(_) => ErrorClass::Retryable,

            Self::PermissionDenied(_)
            | Self::InvalidArgument(_)
            | Self::NotFound(_)
            | Self::Serialization(_) => ErrorClass::Terminal,

            Self::Backend(msg) => classify_backend_message(msg),
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Classify an unkinded backend error from its message text.
///
/// Compatibility shim for store clients that report failures as bare
/// strings. Unrecognized messages classify terminal so that unknown
/// failures propagate rather than spin in the retry loop.
#[must_use]
pub fn classify_backend_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    let terminal_patterns = [
        "permission denied",
        "access denied",
        "not authorized",
        "unauthenticated",
        "authentication failed",
        "invalid argument",
        "malformed",
        "corrupt",
        "parse error",
        "no such",
        "not found",
        "does not exist",
    ];

    let retryable_patterns = [
        "version mismatch",
        "stored version",
        "aborted",
        "contention",
        "conflict",
        "precondition",
        "deadline exceeded",
        "unavailable",
        "timeout",
        "timed out",
        "try again",
        "transient",
        "database is locked",
        "sqlite_busy",
        "busy",
        "connection reset",
        "connection refused",
        "rate limit",
        "internal error",
    ];

    for pattern in &terminal_patterns {
        if lower.contains(pattern) {
            return ErrorClass::Terminal;
        }
    }

    for pattern in &retryable_patterns {
        if lower.contains(pattern) {
            return ErrorClass::Retryable;
        }
    }

    ErrorClass::Terminal
}

/// Top-level error type for coordination operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A store failure, permanent or transient.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A retryable operation ran out of attempts. Wraps the last transient
    /// failure together with the attempt budget it exhausted.
    #[error("operation '{operation}' exhausted {attempts} attempts: {source}")]
    RetryExhausted {
        /// Name of the operation, as passed to the retry layer.
        operation: String,
        /// The attempt budget that was exhausted.
        attempts: u32,
        /// The last transient failure observed.
        source: StoreError,
    },

    /// A lock operation was attempted by an agent that does not hold the
    /// lock.
    #[error("lock '{resource}' is not held by '{holder}'")]
    NotLockHolder {
        /// The locked resource name.
        resource: String,
        /// The agent that attempted the operation.
        holder: String,
    },
}

impl Error {
    /// Classify the error as retryable or terminal.
    ///
    /// Only in-flight store contention is retryable; exhaustion and lock
    /// ownership failures are terminal by construction.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Store(err) => err.classify(),
            Self::RetryExhausted { .. } | Self::NotLockHolder { .. } => ErrorClass::Terminal,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
