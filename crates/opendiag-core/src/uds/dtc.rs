//! DTC (Diagnostic Trouble Code) handling for ReadDTCInformation (0x19)

use std::fmt;

use serde::Serialize;

use super::UdsError;

/// Sub-function codes for ReadDTCInformation (0x19)
pub mod sub_function {
    /// Report number of DTCs matching a status mask
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    /// Report DTCs matching a status mask
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
}

/// DTC group addresses for ClearDiagnosticInformation (0x14)
pub mod dtc_group {
    pub const ALL: u32 = 0xFFFFFF;
    pub const POWERTRAIN: u32 = 0x000000;
    pub const CHASSIS: u32 = 0x400000;
    pub const BODY: u32 = 0x800000;
    pub const NETWORK: u32 = 0xC00000;
}

/// DTC status byte bits (ISO 14229-1 D.2)
pub mod status_bit {
    pub const TEST_FAILED: u8 = 0x01;
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;

    /// Test failed and confirmed
    pub const ACTIVE_MASK: u8 = TEST_FAILED | CONFIRMED_DTC;
    pub const CONFIRMED_MASK: u8 = CONFIRMED_DTC;
    pub const PENDING_MASK: u8 = PENDING_DTC;
    pub const ALL_MASK: u8 = 0xFF;
}

/// Bytes before the first DTC record: sub-function echo + availability mask
const RECORD_HEADER_LEN: usize = 2;
/// 3-byte DTC number + status byte
const RECORD_LEN: usize = 4;

/// System letter taken from the two top bits of the DTC high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P codes
    Powertrain,
    /// C codes
    Chassis,
    /// B codes
    Body,
    /// U codes
    Network,
}

impl DtcCategory {
    pub fn from_dtc_high_byte(high_byte: u8) -> Self {
        match (high_byte >> 6) & 0x03 {
            0 => Self::Powertrain,
            1 => Self::Chassis,
            2 => Self::Body,
            _ => Self::Network,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }
}

impl fmt::Display for DtcCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Powertrain => "powertrain",
            Self::Chassis => "chassis",
            Self::Body => "body",
            Self::Network => "network",
        };
        f.write_str(s)
    }
}

/// Status byte decoded into flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DtcStatus {
    pub test_failed: bool,
    pub test_failed_this_operation_cycle: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub test_not_completed_since_last_clear: bool,
    pub test_failed_since_last_clear: bool,
    pub test_not_completed_this_operation_cycle: bool,
    /// MIL requested
    pub warning_indicator_requested: bool,
    pub raw: u8,
}

impl DtcStatus {
    pub fn from_byte(status: u8) -> Self {
        let bit = |mask: u8| status & mask != 0;
        Self {
            test_failed: bit(status_bit::TEST_FAILED),
            test_failed_this_operation_cycle: bit(status_bit::TEST_FAILED_THIS_OPERATION_CYCLE),
            pending: bit(status_bit::PENDING_DTC),
            confirmed: bit(status_bit::CONFIRMED_DTC),
            test_not_completed_since_last_clear: bit(
                status_bit::TEST_NOT_COMPLETED_SINCE_LAST_CLEAR,
            ),
            test_failed_since_last_clear: bit(status_bit::TEST_FAILED_SINCE_LAST_CLEAR),
            test_not_completed_this_operation_cycle: bit(
                status_bit::TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE,
            ),
            warning_indicator_requested: bit(status_bit::WARNING_INDICATOR_REQUESTED),
            raw: status,
        }
    }

    pub fn is_active(&self) -> bool {
        self.test_failed && self.confirmed
    }

    pub fn matches_mask(&self, mask: u8) -> bool {
        self.raw & mask != 0
    }
}

/// A DTC with its status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dtc {
    /// Display form, e.g. `P0101`
    pub code: String,
    /// 24-bit DTC number
    pub number: u32,
    pub category: DtcCategory,
    pub status: DtcStatus,
}

impl Dtc {
    pub fn new(high: u8, mid: u8, low: u8, status: u8) -> Self {
        let category = DtcCategory::from_dtc_high_byte(high);
        let code = format!(
            "{}{:01X}{:01X}{:01X}{:01X}",
            category.prefix(),
            (high >> 4) & 0x03,
            high & 0x0F,
            mid >> 4,
            mid & 0x0F
        );
        Self {
            code,
            number: u32::from_be_bytes([0, high, mid, low]),
            category,
            status: DtcStatus::from_byte(status),
        }
    }

    /// Failure type byte (third DTC byte)
    pub fn failure_type(&self) -> u8 {
        (self.number & 0xFF) as u8
    }

    /// Six hex digits of the DTC number
    pub fn to_id(&self) -> String {
        format!("{:06X}", self.number)
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02X}", self.code, self.failure_type())
    }
}

/// Walk DTC records in a ReadDTCInformation positive payload
///
/// `data` is the payload after the response service id. The sub-function
/// echo and status availability mask are skipped, then each 4-byte group is
/// one DTC; all-zero DTC numbers are padding and dropped, as is a trailing
/// partial group.
pub fn parse_dtc_records(data: &[u8]) -> Vec<Dtc> {
    data.get(RECORD_HEADER_LEN..)
        .unwrap_or_default()
        .chunks_exact(RECORD_LEN)
        .filter(|record| record[..3] != [0, 0, 0])
        .map(|record| Dtc::new(record[0], record[1], record[2], record[3]))
        .collect()
}

/// Answer to reportNumberOfDTCByStatusMask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DtcCount {
    pub status_availability_mask: u8,
    pub format_identifier: u8,
    pub count: u16,
}

/// Parse a reportNumberOfDTCByStatusMask payload (after the response sid)
pub fn parse_dtc_count(data: &[u8]) -> Result<DtcCount, UdsError> {
    match data {
        [sub, mask, format, hi, lo, ..] if *sub == sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK => {
            Ok(DtcCount {
                status_availability_mask: *mask,
                format_identifier: *format,
                count: u16::from_be_bytes([*hi, *lo]),
            })
        }
        [sub, ..] if *sub != sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK => Err(
            UdsError::InvalidResponse(format!("unexpected sub-function 0x{:02X}", sub)),
        ),
        _ => Err(UdsError::InvalidResponse(format!(
            "DTC count response too short: {} bytes",
            data.len()
        ))),
    }
}
