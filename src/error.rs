//! The orchestrator's caller-facing error taxonomy.
//!
//! Internals are free to use `anyhow` for context-rich plumbing; anything
//! that crosses the Façade boundary is converted into one of these variants
//! so callers can match on a stable kind instead of parsing message text.

use thiserror::Error;

/// Errors surfaced by the Session Orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Empty session id, missing user context, or an unsupported language.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session belongs to a different owner than the caller.
    #[error("session belongs to another user")]
    AccessDenied,

    /// The requested package is not in the configured allowlist.
    #[error("package not allowed: {0}")]
    PackageNotAllowed(String),

    /// Execution exceeded `execution_timeout_seconds`. The session remains
    /// usable for the next call.
    #[error("execution timed out")]
    Timeout,

    /// The backend driver failed to start.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend driver raised during a call and could not recover in
    /// place.
    #[error("backend crashed: {0}")]
    BackendCrashed(String),

    /// A file I/O operation targeted a path that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A package install failed after passing the allowlist check.
    #[error("install failed: {0}")]
    InstallFailed(String),
}

impl OrchestratorError {
    /// Best-effort classification of an opaque internal error into the
    /// nearest caller-visible kind. Used at the boundary between driver
    /// internals (which speak `anyhow`) and the Façade (which speaks this
    /// enum).
    pub fn from_driver_error(context: &str, err: anyhow::Error) -> Self {
        let message = err.to_string();
        if message.contains("timed out") || message.contains("timeout") {
            Self::Timeout
        } else if message.contains("not found") || message.contains("No such file") {
            Self::NotFound(message)
        } else {
            Self::BackendCrashed(format!("{context}: {message}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
