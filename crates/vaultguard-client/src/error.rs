use std::fmt;

use vaultguard_core::{EngineError, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    InvalidRequest(String),
    Cancelled,
    Timeout,
    Connection(String),
    Unavailable(String),
    Rejected(String),
    Unauthorized(String),
    Internal(String),
    CircuitOpen,
    RateLimited,
}

impl ClientError {
    /// Whether the failure came from talking to the engine, as opposed to a
    /// bad request or a local refusal. Only these mark the engine unhealthy.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout
                | ClientError::Connection(_)
                | ClientError::Unavailable(_)
                | ClientError::Unauthorized(_)
                | ClientError::Internal(_)
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ClientError::Cancelled => write!(f, "request cancelled"),
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Connection(msg) => write!(f, "connection error: {msg}"),
            ClientError::Unavailable(msg) => write!(f, "policy engine unavailable: {msg}"),
            ClientError::Rejected(msg) => write!(f, "policy engine rejected request: {msg}"),
            ClientError::Unauthorized(msg) => write!(f, "policy engine refused credentials: {msg}"),
            ClientError::Internal(msg) => write!(f, "internal error: {msg}"),
            ClientError::CircuitOpen => write!(f, "circuit breaker is open"),
            ClientError::RateLimited => write!(f, "client rate limit exceeded"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Connection(msg) => ClientError::Connection(msg),
            EngineError::Unavailable(msg) => ClientError::Unavailable(msg),
            EngineError::Timeout => ClientError::Timeout,
            EngineError::InvalidArgument(msg) => ClientError::Rejected(msg),
            EngineError::NotFound(msg) => ClientError::Rejected(format!("not found: {msg}")),
            EngineError::Unauthorized(msg) => ClientError::Unauthorized(msg),
            EngineError::Internal(msg) => ClientError::Internal(msg),
        }
    }
}

impl From<ValidationError> for ClientError {
    fn from(err: ValidationError) -> Self {
        ClientError::InvalidRequest(err.to_string())
    }
}
