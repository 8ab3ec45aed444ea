//! Crate-level error taxonomy
//!
//! Each layer keeps its own error type with full context. [`DiagError`]
//! folds them into the six kinds a caller (CLI, UI) actually branches on.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::control::ControlError;
use crate::scanner::ScanError;
use crate::security::SecurityError;
use crate::transport::TransportError;
use crate::uds::{service_id, NegativeResponseCode, UdsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Protocol,
    NegativeResponse,
    SecurityDenied,
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection error",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol error",
            Self::NegativeResponse => "negative response",
            Self::SecurityDenied => "security denied",
            Self::Unsupported => "unsupported operation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone)]
pub enum DiagError {
    /// Not connected, or the link dropped
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unparseable bytes
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service 0x{service_id:02X} rejected: {nrc} (0x{nrc:02X})")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// Key rejected or no algorithm available
    #[error("Security access denied: {message}")]
    SecurityDenied {
        message: String,
        nrc: Option<NegativeResponseCode>,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, DiagError>;

impl DiagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::NegativeResponse { .. } => ErrorKind::NegativeResponse,
            Self::SecurityDenied { .. } => ErrorKind::SecurityDenied,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            Self::SecurityDenied { nrc, .. } => *nrc,
            _ => None,
        }
    }
}

impl From<TransportError> for DiagError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => Self::Timeout(msg),
            TransportError::Unsupported(msg) => Self::Unsupported(msg),
            TransportError::Protocol(msg) => Self::Protocol(msg),
            e @ TransportError::PassThru { .. } => Self::Protocol(e.to_string()),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<UdsError> for DiagError {
    fn from(err: UdsError) -> Self {
        match err {
            UdsError::NegativeResponse { service_id: sid, nrc }
                if sid == service_id::SECURITY_ACCESS && nrc.is_security_rejection() =>
            {
                Self::SecurityDenied {
                    message: nrc.to_string(),
                    nrc: Some(nrc),
                }
            }
            UdsError::NegativeResponse { service_id, nrc } => {
                Self::NegativeResponse { service_id, nrc }
            }
            UdsError::NoResponse => Self::Timeout("no response from module".to_string()),
            UdsError::Timeout(msg) => Self::Timeout(msg),
            UdsError::InvalidResponse(msg) => Self::Protocol(msg),
            UdsError::Transport(e) => e.into(),
        }
    }
}

impl From<SecurityError> for DiagError {
    fn from(err: SecurityError) -> Self {
        match err {
            e @ SecurityError::NoResponse { .. } => Self::Timeout(e.to_string()),
            e @ SecurityError::Rejected { .. } => Self::SecurityDenied {
                nrc: e.nrc(),
                message: e.to_string(),
            },
            e @ SecurityError::NoAlgorithm(_) => Self::SecurityDenied {
                message: e.to_string(),
                nrc: None,
            },
            SecurityError::InvalidSeed(msg) => Self::Protocol(format!("invalid seed: {}", msg)),
            SecurityError::Uds(e) => e.into(),
        }
    }
}

impl From<ControlError> for DiagError {
    fn from(err: ControlError) -> Self {
        match err {
            e @ ControlError::NoResponse { .. } => Self::Timeout(e.to_string()),
            ControlError::Rejected { service_id, nrc } => {
                Self::NegativeResponse { service_id, nrc }
            }
            ControlError::Timeout(msg) => Self::Timeout(msg),
            ControlError::Security(e) => e.into(),
            ControlError::InvalidResponse(msg) => Self::Protocol(msg),
            ControlError::Uds(e) => e.into(),
        }
    }
}

impl From<ScanError> for DiagError {
    fn from(err: ScanError) -> Self {
        match err {
            e @ ScanError::AlreadyRunning => Self::Unsupported(e.to_string()),
            ScanError::Transport(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityStage;
    use rstest::rstest;

    #[rstest]
    #[case(TransportError::NotConnected, ErrorKind::Connection)]
    #[case(TransportError::ConnectionLost, ErrorKind::Connection)]
    #[case(TransportError::Timeout("ATZ".into()), ErrorKind::Timeout)]
    #[case(TransportError::Unsupported("AT commands".into()), ErrorKind::Unsupported)]
    #[case(TransportError::Protocol("bad CRC".into()), ErrorKind::Protocol)]
    fn test_transport_kinds(#[case] err: TransportError, #[case] kind: ErrorKind) {
        assert_eq!(DiagError::from(err).kind(), kind);
    }

    #[test]
    fn test_negative_response_keeps_nrc() {
        let err = DiagError::from(UdsError::NegativeResponse {
            service_id: 0x22,
            nrc: NegativeResponseCode::RequestOutOfRange,
        });
        assert_eq!(err.kind(), ErrorKind::NegativeResponse);
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));
    }

    #[test]
    fn test_invalid_key_is_security_denied() {
        let err = DiagError::from(UdsError::NegativeResponse {
            service_id: 0x27,
            nrc: NegativeResponseCode::InvalidKey,
        });
        assert_eq!(err.kind(), ErrorKind::SecurityDenied);

        let err = DiagError::from(SecurityError::Rejected {
            stage: SecurityStage::SendKey,
            nrc: NegativeResponseCode::InvalidKey,
            seed: vec![0x12, 0x34],
            key: vec![0x56, 0x78],
        });
        assert_eq!(err.kind(), ErrorKind::SecurityDenied);
        assert_eq!(err.nrc(), Some(NegativeResponseCode::InvalidKey));

        let err = DiagError::from(SecurityError::NoAlgorithm("vendor-x".into()));
        assert_eq!(err.kind(), ErrorKind::SecurityDenied);
    }

    #[test]
    fn test_nested_transport_error() {
        let err = DiagError::from(ControlError::Uds(UdsError::Transport(
            TransportError::ConnectionLost,
        )));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(
            DiagError::from(UdsError::NoResponse).kind(),
            ErrorKind::Timeout
        );
    }
}
