//! Scripted transport for tests and offline demos

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::link::LinkState;
use super::{
    DeviceClass, DeviceDescriptor, RawChunk, Transport, TransportError, TransportKind,
    TransportState,
};
use crate::config::MockConfig;

/// Scripted answer for requests starting with `request`
struct Rule {
    /// `None` applies to every responding module
    address: Option<u32>,
    request: Vec<u8>,
    /// Served in order; the last answer repeats
    responses: VecDeque<Vec<u8>>,
}

impl Rule {
    fn matches(&self, address: u32, request: &[u8], exact: bool) -> bool {
        let address_ok = self.address.map_or(true, |a| a == address);
        let request_ok = if exact {
            self.request == request
        } else {
            request.starts_with(&self.request)
        };
        address_ok && request_ok
    }

    fn next(&mut self) -> Vec<u8> {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap_or_default()
        } else {
            self.responses.front().cloned().unwrap_or_default()
        }
    }
}

/// A request observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub address: u32,
    pub data: Vec<u8>,
    pub oneway: bool,
}

/// Transport double answering from a rule table
///
/// Only addresses registered with [`MockTransport::add_module`] answer;
/// everything else behaves like an empty bus position.
pub struct MockTransport {
    config: MockConfig,
    state: LinkState,
    modules: RwLock<HashSet<u32>>,
    rules: Mutex<Vec<Rule>>,
    sent: Mutex<Vec<SentRequest>>,
    /// Last request per module, answered further by `receive_uds`
    outstanding: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MockTransport {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            config: config.clone(),
            state: LinkState::new("mock"),
            modules: RwLock::new(HashSet::new()),
            rules: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// A mock with a handful of modules and typical answers
    pub fn with_demo_vehicle(config: &MockConfig) -> Self {
        let mock = Self::new(config);
        for address in [0x7E0, 0x7E1, 0x760, 0x726] {
            mock.add_module(address);
        }
        for (request, response) in Self::default_responses() {
            mock.add_response(None, request, response);
        }
        mock.add_response(
            Some(0x7E0),
            vec![0x19, 0x02],
            vec![
                0x59, 0x02, 0xFF, // sub-function + status availability mask
                0x01, 0x23, 0x45, 0x09, // P0123-45, testFailed + confirmed
                0x46, 0x78, 0x90, 0x28, // C0678-90, confirmed + testFailedSinceLastClear
            ],
        );
        mock
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (vec![0x10, 0x01], vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]),
            (vec![0x10, 0x03], vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]),
            (vec![0x3E, 0x00], vec![0x7E, 0x00]),
            (vec![0x22, 0xF1, 0x90], {
                let mut resp = vec![0x62, 0xF1, 0x90];
                resp.extend_from_slice(b"1HGCM82633A123456");
                resp
            }),
            (vec![0x22, 0xF1, 0x86], vec![0x62, 0xF1, 0x86, 0x01]),
            (vec![0x19, 0x02], vec![0x59, 0x02, 0xFF]),
            (vec![0x14, 0xFF, 0xFF, 0xFF], vec![0x54]),
            (vec![0x27, 0x01], vec![0x67, 0x01, 0x12, 0x34, 0x56, 0x78]),
            (vec![0x27, 0x02], vec![0x67, 0x02]),
            (vec![0x27, 0x03], vec![0x67, 0x03, 0x9A, 0xBC, 0xDE, 0xF0]),
            (vec![0x27, 0x04], vec![0x67, 0x04]),
        ]
    }

    /// Make `address` answer requests
    pub fn add_module(&self, address: u32) {
        self.modules.write().insert(address);
    }

    /// Add a fixed answer; `address = None` applies to every module
    pub fn add_response(&self, address: Option<u32>, request: Vec<u8>, response: Vec<u8>) {
        self.add_sequence(address, request, vec![response]);
    }

    /// Add answers served one per matching request; the last one repeats
    pub fn add_sequence(&self, address: Option<u32>, request: Vec<u8>, responses: Vec<Vec<u8>>) {
        // Newer rules shadow older ones
        self.rules.lock().insert(
            0,
            Rule {
                address,
                request,
                responses: responses.into(),
            },
        );
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    /// Requests sent to `address` whose first byte is `service_id`
    pub fn sent_with_service(&self, address: u32, service_id: u8) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.address == address && r.data.first() == Some(&service_id))
            .map(|r| r.data.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Drop the link as if the adapter vanished
    pub fn simulate_link_loss(&self) {
        self.state.fail();
    }

    async fn latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn record(&self, address: u32, data: &[u8], oneway: bool) {
        self.sent.lock().push(SentRequest {
            address,
            data: data.to_vec(),
            oneway,
        });
    }

    fn find_response(&self, address: u32, request: &[u8]) -> Vec<u8> {
        if !self.modules.read().contains(&address) {
            return Vec::new();
        }
        let mut rules = self.rules.lock();
        for exact in [true, false] {
            if let Some(rule) = rules
                .iter_mut()
                .find(|rule| rule.matches(address, request, exact))
            {
                return rule.next();
            }
        }
        Self::generic_positive(request)
    }

    /// Positive response echoing the request's sub-function or identifier
    fn generic_positive(request: &[u8]) -> Vec<u8> {
        let Some(&service_id) = request.first() else {
            return Vec::new();
        };
        let echo_len = match service_id {
            0x10 | 0x11 | 0x19 | 0x27 | 0x28 | 0x3E | 0x85 => 1,
            0x22 | 0x2E => 2,
            0x2F | 0x31 => 3,
            _ => 0,
        };
        let end = (1 + echo_len).min(request.len());
        let mut response = vec![service_id.wrapping_add(0x40)];
        response.extend_from_slice(&request[1..end]);
        response
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<TransportState> {
        self.state.subscribe_state()
    }

    fn subscribe_raw(&self) -> broadcast::Receiver<RawChunk> {
        self.state.subscribe_raw()
    }

    async fn scan(&self, _timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(vec![DeviceDescriptor {
            id: "mock".to_string(),
            name: "Mock adapter".to_string(),
            class: DeviceClass::Unclassified,
            signal_quality: None,
            description: "In-process scripted transport".to_string(),
        }])
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        self.state.set(TransportState::Connecting);
        self.latency().await;
        debug!(device = %device.id, "Mock transport connected");
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.set(TransportState::Disconnected);
        Ok(())
    }

    async fn send_raw(&self, data: &[u8], _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.state.ensure_connected()?;
        self.latency().await;
        let response = b"OK\r\r>".to_vec();
        self.state.publish_inbound(&response);
        debug!(len = data.len(), "Mock transport: raw write");
        Ok(response)
    }

    async fn send_text(&self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
        self.state.ensure_connected()?;
        self.latency().await;
        let answer = match command.trim().to_ascii_uppercase().as_str() {
            "ATI" => "ELM327 v1.5 (mock)",
            "ATRV" => "12.6V",
            "ATDP" => "ISO 15765-4 (CAN 11/500)",
            _ => "OK",
        };
        self.state.publish_inbound(answer.as_bytes());
        Ok(answer.to_string())
    }

    async fn send_uds(
        &self,
        address: u32,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.state.ensure_connected()?;
        self.latency().await;
        self.record(address, request, false);
        self.outstanding.lock().insert(address, request.to_vec());
        let response = self.find_response(address, request);
        self.state.publish_inbound(&response);
        Ok(response)
    }

    async fn receive_uds(&self, address: u32, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.state.ensure_connected()?;
        self.latency().await;
        let Some(request) = self.outstanding.lock().get(&address).cloned() else {
            return Ok(Vec::new());
        };
        // The next scripted answer to the outstanding request, nothing recorded as sent
        let response = self.find_response(address, &request);
        self.state.publish_inbound(&response);
        Ok(response)
    }

    async fn send_uds_oneway(&self, address: u32, request: &[u8]) -> Result<(), TransportError> {
        self.state.ensure_connected()?;
        self.record(address, request, true);
        debug!(address = format!("0x{:X}", address), ?request, "Mock transport: one-way send");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> MockTransport {
        let mock = MockTransport::new(&MockConfig::default());
        let device = mock.scan(Duration::ZERO).await.unwrap().remove(0);
        mock.connect(&device).await.unwrap();
        mock
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mock = MockTransport::new(&MockConfig::default());
        let result = mock.send_uds(0x7E0, &[0x3E, 0x00], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_unknown_address_is_silent() {
        let mock = connected().await;
        let response = mock
            .send_uds(0x7E5, &[0x3E, 0x00], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_sequence_then_repeat() {
        let mock = connected().await;
        mock.add_module(0x7E0);
        mock.add_sequence(
            Some(0x7E0),
            vec![0x31, 0x01],
            vec![vec![0x7F, 0x31, 0x78], vec![0x71, 0x01, 0x02, 0x03]],
        );

        let timeout = Duration::from_secs(1);
        let req = [0x31, 0x01, 0x02, 0x03];
        assert_eq!(mock.send_uds(0x7E0, &req, timeout).await.unwrap(), vec![0x7F, 0x31, 0x78]);
        assert_eq!(mock.send_uds(0x7E0, &req, timeout).await.unwrap()[0], 0x71);
        assert_eq!(mock.send_uds(0x7E0, &req, timeout).await.unwrap()[0], 0x71);
        assert_eq!(mock.sent_with_service(0x7E0, 0x31).len(), 3);
    }

    #[tokio::test]
    async fn test_receive_serves_next_answer_without_sending() {
        let mock = connected().await;
        mock.add_module(0x7E0);
        mock.add_sequence(
            Some(0x7E0),
            vec![0x31, 0x01],
            vec![vec![0x7F, 0x31, 0x78], vec![0x71, 0x01, 0x02, 0x03]],
        );

        let timeout = Duration::from_secs(1);
        assert!(mock.receive_uds(0x7E0, timeout).await.unwrap().is_empty());
        let req = [0x31, 0x01, 0x02, 0x03];
        assert_eq!(mock.send_uds(0x7E0, &req, timeout).await.unwrap(), vec![0x7F, 0x31, 0x78]);
        assert_eq!(mock.receive_uds(0x7E0, timeout).await.unwrap()[0], 0x71);
        assert_eq!(mock.sent_with_service(0x7E0, 0x31).len(), 1);
    }

    #[tokio::test]
    async fn test_generic_positive_echo() {
        let mock = connected().await;
        mock.add_module(0x760);
        let response = mock
            .send_uds(0x760, &[0x2F, 0x4A, 0x10, 0x03, 0x01], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![0x6F, 0x4A, 0x10, 0x03]);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let mock = connected().await;
        mock.disconnect().await.unwrap();
        mock.disconnect().await.unwrap();
        assert_eq!(mock.state(), TransportState::Disconnected);
    }
}
