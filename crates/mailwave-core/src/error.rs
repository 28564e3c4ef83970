//! Workspace-wide error type.

use thiserror::Error;

/// Result alias used across all Mailwave crates.
pub type Result<T> = std::result::Result<T, MailwaveError>;

/// Error type shared by every Mailwave crate.
#[derive(Debug, Error)]
pub enum MailwaveError {
    /// Configuration file missing, unreadable, or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// Input rejected at creation time (never reaches the dispatcher).
    #[error("validation error: {0}")]
    Validation(String),

    /// A state transition was refused, e.g. a second trigger of the same
    /// campaign or a stop on a campaign that is not sending.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// SQLite or filesystem failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Email transport failure surfaced past the per-delivery retry loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// Recipient source (spreadsheet) failure.
    #[error("recipient source error: {0}")]
    Source(String),

    /// Task queue failure.
    #[error("task queue error: {0}")]
    Queue(String),
}

impl From<std::io::Error> for MailwaveError {
    fn from(e: std::io::Error) -> Self {
        MailwaveError::Storage(e.to_string())
    }
}
