//! Transport layer errors

use thiserror::Error;

use super::autel::PassThruError;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{operation} failed: {error}")]
    PassThru {
        operation: &'static str,
        error: PassThruError,
    },
}

impl TransportError {
    /// True for failures caused by the physical link rather than the peer's answer
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionFailed(_) | Self::ConnectionLost
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
            || matches!(
                self,
                Self::PassThru {
                    error: PassThruError::Timeout,
                    ..
                }
            )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Self::ConnectionLost,
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::ReceiveFailed(err.to_string()),
        }
    }
}
