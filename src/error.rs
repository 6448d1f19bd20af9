//! Agent Bridge error types

use thiserror::Error;

/// Agent Bridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller-supplied session id is not usable as a transport path segment
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    /// No live session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A turn was dispatched to a session that is not ready
    #[error("Session {0} is not ready for a new turn")]
    SessionBusy(String),

    /// Agent binary missing or failed to start
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Agent process exited before the caller's operation completed
    #[error("Agent process exited (code: {code:?})")]
    ProcessExited { code: Option<i32> },

    /// Session did not reach `ready` in time
    #[error("Timed out waiting for session {0} to become ready")]
    ReadinessTimeout(String),

    /// No terminal result arrived in time
    #[error("Timed out waiting for the turn result of session {0}")]
    TurnTimeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The agent reported the turn as failed
    #[error("Agent error: {0}")]
    Agent(String),

    /// Outbound queue limit reached
    #[error("Outbound queue full for session {0}")]
    QueueFull(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, surfaced to HTTP callers
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::InvalidSessionId(_) => "invalid_request_error",
            Error::SessionNotFound(_) => "not_found_error",
            Error::SessionBusy(_) => "session_busy_error",
            Error::Spawn(_) => "spawn_error",
            Error::ProcessExited { .. } => "process_exited_error",
            Error::ReadinessTimeout(_) => "readiness_timeout_error",
            Error::TurnTimeout(_) => "turn_timeout_error",
            Error::Transport(_) => "transport_error",
            Error::Agent(_) => "agent_error",
            Error::QueueFull(_) => "overloaded_error",
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => "api_error",
        }
    }
}

/// Result type alias for Agent Bridge operations
pub type Result<T> = std::result::Result<T, Error>;
