use std::time::Duration;

use thiserror::Error;

/// Coarse failure shape reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Platform flood control; `retry_after` carries the required wait
    FloodWait,
    /// Message entities / formatting were rejected
    EntityBounds,
    /// Connection-level failure (timeouts, resets)
    Network,
    /// Any other API rejection
    Api,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn flood_wait(seconds: u64) -> Self {
        Self {
            kind: TransportErrorKind::FloodWait,
            message: format!("FLOOD_WAIT_{}", seconds),
            retry_after: Some(Duration::from_secs(seconds)),
        }
    }

    pub fn entity_bounds(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::EntityBounds, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Api, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
