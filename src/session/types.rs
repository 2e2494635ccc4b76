#![forbid(unsafe_code)]

// Error types for registry operations and per-recipient delivery

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Transport closed for session {0}")]
    Closed(String),

    #[error("Transport buffer full for session {0}")]
    Full(String),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Why a transport refused a payload
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport closed")]
    Closed,

    #[error("transport buffer full")]
    Full,
}

/// Per-recipient failures collected during a broadcast. Siblings were still attempted.
#[derive(Error, Debug)]
#[error("Broadcast failed for {} of {attempted} recipients", failures.len())]
pub struct BroadcastError {
    pub attempted: usize,
    pub failures: Vec<(String, SessionError)>,
}

impl BroadcastError {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(id, _)| id.as_str())
    }
}
