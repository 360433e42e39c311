// src/errors.rs

use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the correlation queue, the pumps and the dispatcher.
///
/// The type is `Clone` because a single connection failure is fanned out to
/// every call still parked on that connection.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection was superseded by a newer connection from the same peer")]
    Superseded,

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("handshake error: {0}")]
    Handshake(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, BridgeError::TransportFailure(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, BridgeError::ProtocolViolation(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(error: std::io::Error) -> Self {
        BridgeError::TransportFailure(error.to_string())
    }
}

impl From<SerdeError> for BridgeError {
    fn from(error: SerdeError) -> Self {
        BridgeError::Serialization(error.to_string())
    }
}
