//! UDS (Unified Diagnostic Services) protocol layer
//!
//! [`codec`] is the stateless byte-level encoder/decoder, [`UdsClient`] adds
//! per-request retry semantics on top of a [`crate::transport::Transport`].

mod client;
pub mod codec;
pub mod dtc;
mod error;
mod nrc;

pub use client::{RequestPolicy, UdsClient};
pub use codec::{decode, encode, UdsRequest, UdsResponse};
pub use dtc::{
    dtc_group, status_bit as dtc_status_bit, Dtc, DtcCategory, DtcCount, DtcStatus,
};
pub use error::UdsError;
pub use nrc::NegativeResponseCode;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// Shared sub-function bits
pub mod sub_function {
    /// Bit 7: the ECU must not send a positive response
    pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
}

/// InputOutputControlByIdentifier (0x2F) control parameters
pub mod io_control_option {
    /// Release tester control
    pub const RETURN_CONTROL_TO_ECU: u8 = 0x00;
    pub const RESET_TO_DEFAULT: u8 = 0x01;
    pub const FREEZE_CURRENT_STATE: u8 = 0x02;
    /// Drive the output to the supplied control state
    pub const SHORT_TERM_ADJUSTMENT: u8 = 0x03;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Data identifiers used by the probes and the demo vehicle
pub mod standard_did {
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    pub const VIN: u16 = 0xF190;
}
