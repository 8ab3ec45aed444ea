//! Stateless UDS request/response codec

use std::fmt;

use serde::Serialize;

use super::{NegativeResponseCode, UdsError};

/// Response service id marking a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Offset between request and positive-response service ids
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Lowest DID accepted as a boundary when splitting multi-DID answers
pub const DID_BOUNDARY_MIN: u16 = 0xF100;

/// A UDS request: service id plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    pub service_id: u8,
    pub data: Vec<u8>,
}

impl UdsRequest {
    pub fn new(service_id: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            service_id,
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.service_id, &self.data)
    }
}

/// Decoded UDS response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UdsResponse {
    Positive { service_id: u8, data: Vec<u8> },
    Negative {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsResponse {
    /// Request service id this response answers
    pub fn service_id(&self) -> u8 {
        match self {
            Self::Positive { service_id, .. } | Self::Negative { service_id, .. } => *service_id,
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }

    /// NRC 0x78: the exchange is still in progress
    pub fn is_pending(&self) -> bool {
        self.nrc().is_some_and(NegativeResponseCode::is_response_pending)
    }

    /// NRC 0x21: the request may be repeated
    pub fn is_busy(&self) -> bool {
        self.nrc().is_some_and(NegativeResponseCode::is_busy)
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::Negative { nrc, .. } => Some(*nrc),
            Self::Positive { .. } => None,
        }
    }

    /// Payload after the response service id; empty for negative responses
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Positive { data, .. } => data,
            Self::Negative { .. } => &[],
        }
    }

    /// Positive payload, or the negative response as an error
    pub fn into_result(self) -> Result<Vec<u8>, UdsError> {
        match self {
            Self::Positive { data, .. } => Ok(data),
            Self::Negative { service_id, nrc } => Err(UdsError::NegativeResponse { service_id, nrc }),
        }
    }
}

impl fmt::Display for UdsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive { service_id, data } => {
                write!(f, "positive 0x{:02X} [{}]", service_id, hex::encode_upper(data))
            }
            Self::Negative { service_id, nrc } => {
                write!(f, "negative 0x{:02X}: {} (0x{:02X})", service_id, nrc, nrc)
            }
        }
    }
}

/// Prepend the service id to the payload
pub fn encode(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + data.len());
    bytes.push(service_id);
    bytes.extend_from_slice(data);
    bytes
}

/// Decode a raw UDS response
///
/// Never fails: no bytes at all is reported as a general reject, and a
/// truncated negative response defaults its missing fields the same way.
pub fn decode(bytes: &[u8]) -> UdsResponse {
    match bytes {
        [] => UdsResponse::Negative {
            service_id: 0,
            nrc: NegativeResponseCode::GeneralReject,
        },
        [NEGATIVE_RESPONSE_SID, rest @ ..] => UdsResponse::Negative {
            service_id: rest.first().copied().unwrap_or(0),
            nrc: rest
                .get(1)
                .map(|&code| NegativeResponseCode::from(code))
                .unwrap_or(NegativeResponseCode::GeneralReject),
        },
        [sid, data @ ..] => UdsResponse::Positive {
            service_id: sid.wrapping_sub(POSITIVE_RESPONSE_OFFSET),
            data: data.to_vec(),
        },
    }
}

/// Seed bytes from a positive SecurityAccess requestSeed payload
///
/// `data` is the payload after the response service id; the first byte
/// echoes the sub-function.
pub fn extract_seed(data: &[u8]) -> &[u8] {
    data.get(1..).unwrap_or_default()
}

/// Split a ReadDataByIdentifier payload into `(did, value)` pairs
///
/// `data` starts at the first DID. A single requested DID owns the whole
/// remainder. With several, the next boundary is the first big-endian u16 at
/// or above 0xF100 that is one of the requested DIDs; when `expected` is empty
/// the range alone decides. This is best effort: value bytes that happen to
/// look like a requested DID will split early.
pub fn split_did_values(data: &[u8], expected: &[u16]) -> Vec<(u16, Vec<u8>)> {
    let is_boundary = |did: u16| {
        did >= DID_BOUNDARY_MIN && (expected.is_empty() || expected.contains(&did))
    };

    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let did = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let start = pos + 2;
        let end = if expected.len() == 1 {
            data.len()
        } else {
            (start..data.len().saturating_sub(1))
                .find(|&i| is_boundary(u16::from_be_bytes([data[i], data[i + 1]])))
                .unwrap_or(data.len())
        };
        values.push((did, data[start..end].to_vec()));
        pos = end;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_encode_prepends_service_id() {
        assert_eq!(encode(0x22, &[0xF1, 0x90]), vec![0x22, 0xF1, 0x90]);
        assert_eq!(UdsRequest::new(0x3E, [0x00]).to_bytes(), vec![0x3E, 0x00]);
    }

    #[test]
    fn test_echoed_request_decodes_positive() {
        let mut echoed = encode(0x31, &[0x01, 0xFF, 0x00, 0x07]);
        echoed[0] += 0x40;
        assert_eq!(
            decode(&echoed),
            UdsResponse::Positive {
                service_id: 0x31,
                data: vec![0x01, 0xFF, 0x00, 0x07],
            }
        );
    }

    #[rstest]
    #[case(&[0x7F, 0x22, 0x31], 0x22, NegativeResponseCode::RequestOutOfRange)]
    #[case(&[0x7F, 0x31, 0x78], 0x31, NegativeResponseCode::ResponsePending)]
    #[case(&[0x7F, 0x27, 0xF2], 0x27, NegativeResponseCode::Unknown(0xF2))]
    #[case(&[0x7F, 0x10], 0x10, NegativeResponseCode::GeneralReject)]
    #[case(&[0x7F], 0x00, NegativeResponseCode::GeneralReject)]
    #[case(&[], 0x00, NegativeResponseCode::GeneralReject)]
    fn test_decode_negative(#[case] bytes: &[u8], #[case] sid: u8, #[case] nrc: NegativeResponseCode) {
        assert_eq!(decode(bytes), UdsResponse::Negative { service_id: sid, nrc });
    }

    #[test]
    fn test_decode_positive_for_every_service() {
        // 0x3F + 0x40 would collide with the negative marker
        for sid in 0x00..=0x3Eu8 {
            let bytes = encode(sid + POSITIVE_RESPONSE_OFFSET, &[0xAA, sid]);
            let response = decode(&bytes);
            assert!(response.is_positive());
            assert_eq!(response.service_id(), sid);
            assert_eq!(response.data(), &[0xAA, sid]);
        }
    }

    #[test]
    fn test_echoed_request_reconstructs_payload() {
        let request = encode(0x31, &[0x01, 0x02, 0x03]);
        let mut echoed = request.clone();
        echoed[0] += POSITIVE_RESPONSE_OFFSET;
        assert_eq!(
            decode(&echoed),
            UdsResponse::Positive {
                service_id: 0x31,
                data: vec![0x01, 0x02, 0x03]
            }
        );
    }

    #[test]
    fn test_pending_and_busy_predicates() {
        assert!(decode(&[0x7F, 0x2F, 0x78]).is_pending());
        assert!(decode(&[0x7F, 0x2F, 0x21]).is_busy());
        assert!(!decode(&[0x6F, 0x01]).is_pending());
        assert!(decode(&[]).nrc().is_some());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(decode(&[0x62, 0xF1, 0x90, 0x41]).into_result().unwrap(), vec![0xF1, 0x90, 0x41]);
        let err = decode(&[0x7F, 0x2E, 0x33]).into_result().unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::SecurityAccessDenied));
    }

    #[test]
    fn test_extract_seed() {
        assert_eq!(extract_seed(&[0x01, 0x12, 0x34]), &[0x12, 0x34]);
        assert!(extract_seed(&[0x01]).is_empty());
        assert!(extract_seed(&[]).is_empty());
    }

    #[test]
    fn test_split_single_did_takes_everything() {
        // The value contains bytes that look like a DID
        let data = [0xF1, 0x90, 0xF1, 0x86, 0x41];
        assert_eq!(
            split_did_values(&data, &[0xF190]),
            vec![(0xF190, vec![0xF1, 0x86, 0x41])]
        );
    }

    #[test]
    fn test_split_multiple_dids() {
        let data = [0xF1, 0x90, 0x41, 0x42, 0xF1, 0x86, 0x03];
        assert_eq!(
            split_did_values(&data, &[0xF190, 0xF186]),
            vec![(0xF190, vec![0x41, 0x42]), (0xF186, vec![0x03])]
        );
    }

    #[test]
    fn test_split_ignores_values_outside_expected_set() {
        let data = [0xF1, 0x90, 0xF2, 0x00, 0x42, 0xF1, 0x86, 0x03];
        assert_eq!(
            split_did_values(&data, &[0xF190, 0xF186]),
            vec![(0xF190, vec![0xF2, 0x00, 0x42]), (0xF186, vec![0x03])]
        );
    }

    #[test]
    fn test_split_by_range_when_nothing_expected() {
        let data = [0x01, 0x00, 0x07, 0xF1, 0x86, 0x03];
        assert_eq!(
            split_did_values(&data, &[]),
            vec![(0x0100, vec![0x07]), (0xF186, vec![0x03])]
        );
    }
}
