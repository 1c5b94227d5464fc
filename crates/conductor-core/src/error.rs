//! Error types for Conductor Core

use thiserror::Error;

/// Result type alias using Conductor Error
pub type Result<T> = std::result::Result<T, Error>;

/// Conductor error types
#[derive(Error, Debug)]
pub enum Error {
    /// Raised by the engine while a turn (or a single engine call) was executing
    #[error("Engine error: {0}")]
    Engine(String),

    /// An engine call crashed or never returned a result
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// The confirmation prompt failed to produce a decision
    #[error("Confirmation escalation failed: {0}")]
    Escalation(String),

    #[error("Failed to prepare session {target}: {reason}")]
    SwitchPreparation { target: String, reason: String },

    /// A caller asked for something that would break a coordinator invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is busy running a turn")]
    SessionBusy(String),

    #[error("A session switch is already in progress")]
    SwitchInProgress,

    #[error("No session switch is awaiting confirmation")]
    NoPendingSwitch,

    #[error("No active session")]
    NoActiveSession,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Coordinator control loop is not running")]
    ControlLoopClosed,
}
