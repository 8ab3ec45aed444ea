//! UDS request errors

use thiserror::Error;

use super::NegativeResponseCode;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No response from module")]
    NoResponse,

    #[error("Response timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl UdsError {
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}

impl From<TransportError> for UdsError {
    fn from(err: TransportError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}
