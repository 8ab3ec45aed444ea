//! Per-module UDS request/response over a [`Transport`]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::codec::{self, UdsResponse};
use super::dtc::{self, Dtc, DtcCount};
use super::{service_id, sub_function, UdsError};
use crate::config::SessionConfig;
use crate::transport::Transport;

/// Timing and retry rules applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Per-send transport timeout
    pub timeout: Duration,
    /// Overall budget while the ECU keeps answering "response pending"
    pub pending_timeout: Duration,
    /// Delay between listens while a request is pending
    pub pending_poll: Duration,
    pub busy_retry_limit: u32,
    pub busy_retry_delay: Duration,
}

impl RequestPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.request_timeout_ms),
            pending_timeout: Duration::from_millis(config.pending_timeout_ms),
            pending_poll: Duration::from_millis(config.pending_poll_ms),
            busy_retry_limit: config.busy_retry_limit,
            busy_retry_delay: Duration::from_millis(config.busy_retry_delay_ms),
        }
    }
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// UDS requests against one transport
///
/// Response pending (NRC 0x78) is never returned: the client keeps listening
/// for the final answer to the same request, without sending it again, until
/// `pending_timeout` runs out. Busy (NRC 0x21) is retried up to
/// `busy_retry_limit` times, then surfaced.
#[derive(Clone)]
pub struct UdsClient {
    transport: Arc<dyn Transport>,
    policy: RequestPolicy,
}

impl UdsClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RequestPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `request` and return the final decoded response
    ///
    /// An empty transport answer is [`UdsError::NoResponse`].
    pub async fn request(&self, address: u32, request: &[u8]) -> Result<UdsResponse, UdsError> {
        let Some(&request_sid) = request.first() else {
            return Err(UdsError::InvalidResponse("empty request".to_string()));
        };
        let deadline = Instant::now() + self.policy.pending_timeout;
        let mut busy_retries = 0;

        let mut raw = self
            .transport
            .send_uds(address, request, self.policy.timeout)
            .await?;
        loop {
            if raw.is_empty() {
                return Err(UdsError::NoResponse);
            }

            let response = codec::decode(&raw);
            if response.is_pending() {
                if Instant::now() + self.policy.pending_poll >= deadline {
                    return Err(UdsError::Timeout(format!(
                        "service 0x{:02X} still pending after {:?}",
                        request_sid, self.policy.pending_timeout
                    )));
                }
                debug!(
                    address = format!("0x{:03X}", address),
                    service = format!("0x{:02X}", request_sid),
                    "Response pending, waiting for the final answer"
                );
                tokio::time::sleep(self.policy.pending_poll).await;
                // Listen only; the request is not repeated while pending
                let window = deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.policy.timeout);
                let next = self.transport.receive_uds(address, window).await?;
                // Nothing yet: still pending
                if !next.is_empty() {
                    raw = next;
                }
                continue;
            }

            if response.is_busy() && busy_retries < self.policy.busy_retry_limit {
                busy_retries += 1;
                debug!(
                    address = format!("0x{:03X}", address),
                    attempt = busy_retries,
                    "Module busy, repeating request"
                );
                tokio::time::sleep(self.policy.busy_retry_delay).await;
                raw = self
                    .transport
                    .send_uds(address, request, self.policy.timeout)
                    .await?;
                continue;
            }

            if response.service_id() != request_sid {
                warn!(
                    address = format!("0x{:03X}", address),
                    expected = format!("0x{:02X}", request_sid),
                    got = format!("0x{:02X}", response.service_id()),
                    "Response for a different service"
                );
                return Err(UdsError::InvalidResponse(format!(
                    "expected answer to 0x{:02X}, got {}",
                    request_sid, response
                )));
            }

            return Ok(response);
        }
    }

    /// Send `request` and return the positive payload after the response sid
    pub async fn request_positive(&self, address: u32, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.request(address, request).await?.into_result()
    }

    /// DiagnosticSessionControl (0x10)
    pub async fn diagnostic_session_control(
        &self,
        address: u32,
        session_type: u8,
    ) -> Result<Vec<u8>, UdsError> {
        self.request_positive(address, &[service_id::DIAGNOSTIC_SESSION_CONTROL, session_type])
            .await
    }

    /// TesterPresent (0x3E); the suppressed form is sent without waiting
    pub async fn tester_present(&self, address: u32, suppress_response: bool) -> Result<(), UdsError> {
        if suppress_response {
            let request = [service_id::TESTER_PRESENT, sub_function::SUPPRESS_POSITIVE_RESPONSE];
            self.transport.send_uds_oneway(address, &request).await?;
        } else {
            self.request_positive(address, &[service_id::TESTER_PRESENT, 0x00])
                .await?;
        }
        Ok(())
    }

    /// SecurityAccess requestSeed; `level` is the odd sub-function
    pub async fn security_access_request_seed(
        &self,
        address: u32,
        level: u8,
    ) -> Result<Vec<u8>, UdsError> {
        let data = self
            .request_positive(address, &[service_id::SECURITY_ACCESS, level])
            .await?;
        Ok(codec::extract_seed(&data).to_vec())
    }

    /// SecurityAccess sendKey at `level + 1`
    pub async fn security_access_send_key(
        &self,
        address: u32,
        level: u8,
        key: &[u8],
    ) -> Result<(), UdsError> {
        let mut request = vec![service_id::SECURITY_ACCESS, level.wrapping_add(1)];
        request.extend_from_slice(key);
        self.request_positive(address, &request).await?;
        Ok(())
    }

    /// ReadDataByIdentifier (0x22) for one or more DIDs
    ///
    /// Multi-DID answers are split heuristically; prefer [`Self::read_did`].
    pub async fn read_data_by_id(
        &self,
        address: u32,
        dids: &[u16],
    ) -> Result<Vec<(u16, Vec<u8>)>, UdsError> {
        let mut request = vec![service_id::READ_DATA_BY_ID];
        for did in dids {
            request.extend_from_slice(&did.to_be_bytes());
        }
        let data = self.request_positive(address, &request).await?;
        Ok(codec::split_did_values(&data, dids))
    }

    /// Value of a single DID
    pub async fn read_did(&self, address: u32, did: u16) -> Result<Vec<u8>, UdsError> {
        let mut values = self.read_data_by_id(address, &[did]).await?;
        match values.pop() {
            Some((echoed, value)) if echoed == did => Ok(value),
            Some((echoed, _)) => Err(UdsError::InvalidResponse(format!(
                "requested DID 0x{:04X}, got 0x{:04X}",
                did, echoed
            ))),
            None => Err(UdsError::InvalidResponse(format!(
                "no value for DID 0x{:04X}",
                did
            ))),
        }
    }

    /// WriteDataByIdentifier (0x2E)
    pub async fn write_data_by_id(&self, address: u32, did: u16, value: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![service_id::WRITE_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        request.extend_from_slice(value);
        let data = self.request_positive(address, &request).await?;
        if data.get(..2) != Some(&did.to_be_bytes()[..]) {
            return Err(UdsError::InvalidResponse(format!(
                "write of DID 0x{:04X} acknowledged with [{}]",
                did,
                hex::encode_upper(&data)
            )));
        }
        Ok(())
    }

    /// InputOutputControlByIdentifier (0x2F)
    ///
    /// Returns the payload after the response sid: DID echo, control
    /// parameter echo and the ECU's control status record.
    pub async fn io_control(
        &self,
        address: u32,
        did: u16,
        control_parameter: u8,
        control_state: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::IO_CONTROL_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        request.push(control_parameter);
        request.extend_from_slice(control_state);
        self.request_positive(address, &request).await
    }

    /// RoutineControl (0x31)
    ///
    /// Returns the payload after the response sid: control type echo,
    /// routine id echo and the status record.
    pub async fn routine_control(
        &self,
        address: u32,
        control_type: u8,
        routine_id: u16,
        option_record: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::ROUTINE_CONTROL, control_type];
        request.extend_from_slice(&routine_id.to_be_bytes());
        request.extend_from_slice(option_record);
        self.request_positive(address, &request).await
    }

    /// ReadDTCInformation reportNumberOfDTCByStatusMask
    pub async fn read_dtc_count(&self, address: u32, status_mask: u8) -> Result<DtcCount, UdsError> {
        let request = [
            service_id::READ_DTC_INFO,
            dtc::sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK,
            status_mask,
        ];
        let data = self.request_positive(address, &request).await?;
        dtc::parse_dtc_count(&data)
    }

    /// ReadDTCInformation reportDTCByStatusMask
    pub async fn read_dtcs(&self, address: u32, status_mask: u8) -> Result<Vec<Dtc>, UdsError> {
        let request = [
            service_id::READ_DTC_INFO,
            dtc::sub_function::REPORT_DTC_BY_STATUS_MASK,
            status_mask,
        ];
        let data = self.request_positive(address, &request).await?;
        Ok(dtc::parse_dtc_records(&data))
    }

    /// ClearDiagnosticInformation (0x14) for a DTC group
    pub async fn clear_dtcs(&self, address: u32, group: u32) -> Result<(), UdsError> {
        let [_, high, mid, low] = group.to_be_bytes();
        self.request_positive(address, &[service_id::CLEAR_DIAGNOSTIC_INFO, high, mid, low])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockTransport;
    use crate::uds::NegativeResponseCode;
    use pretty_assertions::assert_eq;

    const ECU: u32 = 0x7E0;

    async fn setup() -> (Arc<MockTransport>, UdsClient) {
        let mock = Arc::new(MockTransport::new(&MockConfig::default()));
        mock.add_module(ECU);
        let device = mock.scan(Duration::ZERO).await.unwrap().remove(0);
        mock.connect(&device).await.unwrap();
        let client = UdsClient::new(mock.clone(), RequestPolicy::default());
        (mock, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_is_never_final() {
        let (mock, client) = setup().await;
        mock.add_sequence(
            Some(ECU),
            vec![0x31, 0x01, 0x02, 0x03],
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0x02, 0x03, 0x00],
            ],
        );

        let data = client.routine_control(ECU, 0x01, 0x0203, &[]).await.unwrap();
        assert_eq!(data, vec![0x01, 0x02, 0x03, 0x00]);
        // Waited on the same exchange: the routine was started once
        assert_eq!(mock.sent_with_service(ECU, 0x31).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out() {
        let (mock, client) = setup().await;
        mock.add_response(Some(ECU), vec![0x2F], vec![0x7F, 0x2F, 0x78]);

        let err = client.io_control(ECU, 0x4A10, 0x03, &[0x01]).await.unwrap_err();
        assert!(matches!(err, UdsError::Timeout(_)));
        assert!(err.nrc().is_none());
        assert_eq!(mock.sent_with_service(ECU, 0x2F).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_retried_then_surfaced() {
        let (mock, client) = setup().await;
        mock.add_sequence(
            Some(ECU),
            vec![0x22, 0xF1, 0x90],
            vec![vec![0x7F, 0x22, 0x21], vec![0x62, 0xF1, 0x90, 0x41]],
        );
        assert_eq!(client.read_did(ECU, 0xF190).await.unwrap(), vec![0x41]);

        mock.add_response(Some(ECU), vec![0x22, 0xF1, 0x91], vec![0x7F, 0x22, 0x21]);
        let err = client.read_did(ECU, 0xF191).await.unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::BusyRepeatRequest));
        // First attempt plus the configured retries
        let limit = client.policy().busy_retry_limit as usize;
        let sent = mock
            .sent_with_service(ECU, 0x22)
            .into_iter()
            .filter(|r| r[..] == [0x22, 0xF1, 0x91])
            .count();
        assert_eq!(sent, 1 + limit);
    }

    #[tokio::test]
    async fn test_no_answer_is_no_response() {
        let (_mock, client) = setup().await;
        let err = client.diagnostic_session_control(0x7E5, 0x03).await.unwrap_err();
        assert!(matches!(err, UdsError::NoResponse));
    }

    #[tokio::test]
    async fn test_negative_response_carries_nrc() {
        let (mock, client) = setup().await;
        mock.add_response(Some(ECU), vec![0x2E], vec![0x7F, 0x2E, 0x33]);
        let err = client.write_data_by_id(ECU, 0xF190, b"X").await.unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::SecurityAccessDenied));
    }

    #[tokio::test]
    async fn test_mismatched_service_rejected() {
        let (mock, client) = setup().await;
        mock.add_response(Some(ECU), vec![0x10, 0x03], vec![0x62, 0xF1, 0x90]);
        let err = client.diagnostic_session_control(ECU, 0x03).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_seed_and_key() {
        let (mock, client) = setup().await;
        mock.add_response(Some(ECU), vec![0x27, 0x01], vec![0x67, 0x01, 0xAB, 0xCD]);
        let seed = client.security_access_request_seed(ECU, 0x01).await.unwrap();
        assert_eq!(seed, vec![0xAB, 0xCD]);

        client.security_access_send_key(ECU, 0x01, &[0x11, 0x22]).await.unwrap();
        assert_eq!(
            mock.sent_with_service(ECU, 0x27).last().unwrap(),
            &vec![0x27, 0x02, 0x11, 0x22]
        );
    }

    #[tokio::test]
    async fn test_suppressed_tester_present_is_oneway() {
        let (mock, client) = setup().await;
        client.tester_present(ECU, true).await.unwrap();
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].oneway);
        assert_eq!(sent[0].data, vec![0x3E, 0x80]);
    }

    #[tokio::test]
    async fn test_dtc_helpers() {
        let (mock, client) = setup().await;
        mock.add_response(
            Some(ECU),
            vec![0x19, 0x02],
            vec![0x59, 0x02, 0xFF, 0x01, 0x01, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00],
        );
        mock.add_response(
            Some(ECU),
            vec![0x19, 0x01],
            vec![0x59, 0x01, 0xFF, 0x01, 0x00, 0x01],
        );

        let dtcs = client.read_dtcs(ECU, 0xFF).await.unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, "P0101");
        assert_eq!(client.read_dtc_count(ECU, 0xFF).await.unwrap().count, 1);

        client.clear_dtcs(ECU, dtc::dtc_group::ALL).await.unwrap();
        assert_eq!(
            mock.sent_with_service(ECU, 0x14),
            vec![vec![0x14, 0xFF, 0xFF, 0xFF]]
        );
    }
}
