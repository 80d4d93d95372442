//! Error taxonomy for the relay.
//!
//! Every handler-level failure is a [`RelayError`]. The session boundary turns
//! it into a structured response frame, so the `Display` text of each variant
//! is exactly what the client sees in `error` fields.
//!
//! # Connect Failure Classification
//!
//! The SSH layer reports connect failures as strings. They are split into two
//! categories with a keyword table:
//!
//! 1. **Authentication failures**: credentials or permissions were rejected.
//!    The client must supply different credentials.
//! 2. **Connection errors**: everything else (refused, unreachable, protocol
//!    errors). The same request may succeed later.
//!
//! Authentication keywords take precedence: "connection closed after
//! authentication failed" is an authentication failure.

use std::time::Duration;

use thiserror::Error;

use super::safety::BlockReason;

/// Authentication error patterns that indicate rejected credentials.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "failed to decode private key",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The admission ceiling is reached
    #[error("Server at maximum capacity")]
    AdmissionRejected,

    /// The registry stopped admitting sessions
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Not authenticated. Connect first.")]
    NotAuthenticated,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("{0}")]
    Connection(String),

    #[error("Connection timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{}", safety_message(.0))]
    SafetyViolation(BlockReason),

    /// A command is already running on this connector
    #[error("A command is already running")]
    Busy,

    #[error("Command timeout after {}s", .0.as_secs())]
    ExecutionTimeout(Duration),

    #[error("Output size exceeded limit of {0} bytes")]
    OutputTooLarge(usize),

    #[error("{0}")]
    Transfer(String),

    /// The SSH connection went away underneath the session
    #[error("SSH connection closed")]
    ShellClosed,

    #[error("Command cancelled by disconnect")]
    Cancelled,

    #[error("{0}")]
    Channel(String),

    /// Malformed or unknown frame
    #[error("{0}")]
    Protocol(String),
}

fn safety_message(reason: &BlockReason) -> String {
    match reason {
        BlockReason::Dangerous(fragment) => format!("Dangerous command blocked: {}", fragment),
        BlockReason::Suspicious(_) => format!("Dangerous command blocked: {}", reason),
    }
}

impl RelayError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        RelayError::InvalidRequest(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        RelayError::Transfer(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        RelayError::Channel(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Whether the SSH side of the session is gone after this error.
    pub fn invalidates_shell(&self) -> bool {
        matches!(self, RelayError::ShellClosed)
    }
}

/// Determines if a connect failure message describes rejected credentials.
pub(crate) fn is_authentication_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    AUTH_ERRORS.iter().any(|pattern| error_lower.contains(pattern))
}

/// Classify a connect failure message into the relay taxonomy.
pub(crate) fn classify_connect_failure(error: impl Into<String>) -> RelayError {
    let error = error.into();
    if is_authentication_error(&error) {
        RelayError::AuthenticationFailed(error)
    } else {
        RelayError::Connection(error)
    }
}
