//! Seed-key security access and diagnostic session transitions

mod algorithms;
mod manager;

pub use algorithms::{
    AdditiveAlgorithm, AlgorithmRegistry, ByteSwapXorAlgorithm, Crc16Algorithm, FnAlgorithm,
    KeyAlgorithm, Lfsr24Algorithm, XorAlgorithm,
};
pub use manager::{KeyOptions, SecurityAccessManager, SecurityAccessOutcome};

use std::fmt;

use thiserror::Error;

use crate::uds::{NegativeResponseCode, UdsError};

/// Step of the security handshake that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStage {
    RequestSeed,
    SendKey,
    SessionControl,
}

impl fmt::Display for SecurityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestSeed => f.write_str("seed request"),
            Self::SendKey => f.write_str("key"),
            Self::SessionControl => f.write_str("session change"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum SecurityError {
    #[error("No response from module 0x{address:03X}")]
    NoResponse { address: u32 },

    /// The ECU refused a step; seed and key are kept for diagnostics
    #[error("Security access {stage} rejected: {nrc} (0x{nrc:02X})")]
    Rejected {
        stage: SecurityStage,
        nrc: NegativeResponseCode,
        seed: Vec<u8>,
        key: Vec<u8>,
    },

    #[error("No key algorithm available: {0}")]
    NoAlgorithm(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("UDS error: {0}")]
    Uds(UdsError),
}

impl SecurityError {
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::Rejected { nrc, .. } => Some(*nrc),
            Self::Uds(err) => err.nrc(),
            _ => None,
        }
    }

    /// Map a UDS failure at `stage`, keeping seed/key context
    pub(crate) fn from_uds(
        err: UdsError,
        stage: SecurityStage,
        address: u32,
        seed: &[u8],
        key: &[u8],
    ) -> Self {
        match err {
            UdsError::NoResponse => Self::NoResponse { address },
            UdsError::NegativeResponse { nrc, .. } => Self::Rejected {
                stage,
                nrc,
                seed: seed.to_vec(),
                key: key.to_vec(),
            },
            other => Self::Uds(other),
        }
    }
}
