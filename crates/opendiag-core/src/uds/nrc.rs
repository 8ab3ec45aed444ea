//! Negative response codes (ISO 14229-1 Annex A)

use std::fmt;

use serde::{Serialize, Serializer};

use self::NegativeResponseCode as Nrc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnet,
    FailurePreventsExecution,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    RpmTooHigh,
    RpmTooLow,
    EngineRunning,
    EngineNotRunning,
    TemperatureTooHigh,
    TemperatureTooLow,
    VehicleSpeedTooHigh,
    VehicleSpeedTooLow,
    ThrottleTooHigh,
    ThrottleTooLow,
    TransmissionNotInNeutral,
    TransmissionNotInGear,
    BrakeSwitchNotClosed,
    ShifterNotInPark,
    VoltageTooHigh,
    VoltageTooLow,
    /// Reserved or manufacturer-specific code
    Unknown(u8),
}

/// (code, variant, description)
const TABLE: &[(u8, NegativeResponseCode, &str)] = &[
    (0x10, Nrc::GeneralReject, "General reject"),
    (0x11, Nrc::ServiceNotSupported, "Service not supported"),
    (0x12, Nrc::SubFunctionNotSupported, "Sub-function not supported"),
    (0x13, Nrc::IncorrectMessageLengthOrFormat, "Incorrect message length or invalid format"),
    (0x14, Nrc::ResponseTooLong, "Response too long"),
    (0x21, Nrc::BusyRepeatRequest, "Busy, repeat request"),
    (0x22, Nrc::ConditionsNotCorrect, "Conditions not correct"),
    (0x24, Nrc::RequestSequenceError, "Request sequence error"),
    (0x25, Nrc::NoResponseFromSubnet, "No response from sub-net component"),
    (0x26, Nrc::FailurePreventsExecution, "Failure prevents execution of requested action"),
    (0x31, Nrc::RequestOutOfRange, "Request out of range"),
    (0x33, Nrc::SecurityAccessDenied, "Security access denied"),
    (0x35, Nrc::InvalidKey, "Invalid key"),
    (0x36, Nrc::ExceededNumberOfAttempts, "Exceeded number of attempts"),
    (0x37, Nrc::RequiredTimeDelayNotExpired, "Required time delay not expired"),
    (0x70, Nrc::UploadDownloadNotAccepted, "Upload/download not accepted"),
    (0x71, Nrc::TransferDataSuspended, "Transfer data suspended"),
    (0x72, Nrc::GeneralProgrammingFailure, "General programming failure"),
    (0x73, Nrc::WrongBlockSequenceCounter, "Wrong block sequence counter"),
    (0x78, Nrc::ResponsePending, "Request correctly received, response pending"),
    (0x7E, Nrc::SubFunctionNotSupportedInActiveSession, "Sub-function not supported in active session"),
    (0x7F, Nrc::ServiceNotSupportedInActiveSession, "Service not supported in active session"),
    (0x81, Nrc::RpmTooHigh, "RPM too high"),
    (0x82, Nrc::RpmTooLow, "RPM too low"),
    (0x83, Nrc::EngineRunning, "Engine is running"),
    (0x84, Nrc::EngineNotRunning, "Engine is not running"),
    (0x86, Nrc::TemperatureTooHigh, "Temperature too high"),
    (0x87, Nrc::TemperatureTooLow, "Temperature too low"),
    (0x88, Nrc::VehicleSpeedTooHigh, "Vehicle speed too high"),
    (0x89, Nrc::VehicleSpeedTooLow, "Vehicle speed too low"),
    (0x8A, Nrc::ThrottleTooHigh, "Throttle/pedal too high"),
    (0x8B, Nrc::ThrottleTooLow, "Throttle/pedal too low"),
    (0x8C, Nrc::TransmissionNotInNeutral, "Transmission range not in neutral"),
    (0x8D, Nrc::TransmissionNotInGear, "Transmission range not in gear"),
    (0x8F, Nrc::BrakeSwitchNotClosed, "Brake switch not closed"),
    (0x90, Nrc::ShifterNotInPark, "Shifter lever not in park"),
    (0x92, Nrc::VoltageTooHigh, "Voltage too high"),
    (0x93, Nrc::VoltageTooLow, "Voltage too low"),
];

impl NegativeResponseCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown(code) => code,
            known => TABLE
                .iter()
                .find(|(_, nrc, _)| *nrc == known)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    /// Human-readable explanation for user-facing diagnostics
    pub fn description(self) -> &'static str {
        match self {
            Self::Unknown(code) if (0x38..=0x4F).contains(&code) => {
                "Reserved by extended data link security"
            }
            Self::Unknown(code) if code >= 0xF0 => "Manufacturer-specific condition not correct",
            Self::Unknown(_) => "Unknown negative response",
            known => TABLE
                .iter()
                .find(|(_, nrc, _)| *nrc == known)
                .map(|(_, _, text)| *text)
                .unwrap_or("Unknown negative response"),
        }
    }

    /// The ECU accepted the request and will answer later
    pub fn is_response_pending(self) -> bool {
        self == Self::ResponsePending
    }

    /// The ECU is temporarily busy; the same request may be repeated
    pub fn is_busy(self) -> bool {
        self == Self::BusyRepeatRequest
    }

    /// Security access was refused for this key or attempt
    pub fn is_security_rejection(self) -> bool {
        matches!(
            self,
            Self::SecurityAccessDenied
                | Self::InvalidKey
                | Self::ExceededNumberOfAttempts
                | Self::RequiredTimeDelayNotExpired
        )
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        TABLE
            .iter()
            .find(|(code, _, _)| *code == value)
            .map(|(_, nrc, _)| *nrc)
            .unwrap_or(Self::Unknown(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc.code()
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.code(), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl Serialize for NegativeResponseCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip_through_table() {
        for (code, nrc, _) in TABLE {
            assert_eq!(NegativeResponseCode::from(*code), *nrc);
            assert_eq!(nrc.code(), *code);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let nrc = NegativeResponseCode::from(0xF3);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0xF3));
        assert_eq!(u8::from(nrc), 0xF3);
        assert_eq!(format!("{:02X}", nrc), "F3");
    }

    #[test]
    fn test_predicates() {
        assert!(NegativeResponseCode::from(0x78).is_response_pending());
        assert!(NegativeResponseCode::from(0x21).is_busy());
        assert!(NegativeResponseCode::from(0x35).is_security_rejection());
        assert!(!NegativeResponseCode::from(0x31).is_busy());
        assert_eq!(
            NegativeResponseCode::ConditionsNotCorrect.to_string(),
            "Conditions not correct"
        );
    }
}
