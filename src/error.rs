//! Error types for session operations

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::transport::TransportError;
use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Failures surfaced by blocking session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("timed out waiting for {0}")]
    OperationTimeout(&'static str),

    #[error("another session operation is already in flight")]
    OperationAlreadyPending,

    #[error("broker refused the connection: {0}")]
    ConnectionRefused(String),

    #[error("connection lost while waiting for an acknowledgment")]
    ConnectionLost,

    #[error("session is not connected")]
    NotConnected,

    #[error("session was already started")]
    AlreadyStarted,

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
