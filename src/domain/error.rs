use thiserror::Error;

/// Errors crossing the adapter boundary.
///
/// Every sensor, actuator and task call resolves to `Ok(value)` or one of
/// these. Transient and timeout failures are skipped for the tick and count
/// toward sanitisation; protocol failures discard the value and treat the
/// adapter as unreachable for the tick.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AdapterError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Task registration failures
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("task {0} is already registered")]
    Duplicate(String),

    #[error("task {task} claims channel key {key} already owned by {owner}")]
    KeyConflict {
        task: String,
        key: String,
        owner: String,
    },
}
