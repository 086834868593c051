//! Error kinds shared across the crate.
//!
//! `BotCommandError` is deliberately not one of these arms: per the design
//! notes in the spec, a command handler's user-facing failure is modeled as
//! data (`CommandOutcome::UserFacing`), not as an error that could
//! accidentally propagate past the chat-command engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeemError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("user store failed to initialize: {0}")]
    StoreInit(String),
    #[error("duplicate row for key {0}")]
    Duplicate(String),
    #[error("no row found for key {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no query ID available")]
    QueueFull,
    #[error("rate limited")]
    RateLimited,
}

/// Outcome of a single dispatched chat command. Anything other than
/// `UserFacing` never reaches the chat; it is logged and swallowed by the
/// caller, per the spec's error-propagation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    UserFacing(String),
}

impl From<String> for CommandOutcome {
    fn from(msg: String) -> Self {
        CommandOutcome::UserFacing(msg)
    }
}
