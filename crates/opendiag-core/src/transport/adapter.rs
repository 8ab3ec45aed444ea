//! Transport contract and the types it exchanges

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use super::TransportError;

/// Connection state of a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What kind of adapter sits at the other end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Vendor VCI speaking a proprietary framing (Autel)
    ProprietaryVci,
    /// ELM327 or clone speaking AT commands
    ElmCompatible,
    Unclassified,
}

/// A device found during a scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    /// Transport-unique identifier (socket address, MAC, port name)
    pub id: String,
    pub name: String,
    pub class: DeviceClass,
    /// Signal quality in dBm for radios, `None` where the medium has no notion of it
    pub signal_quality: Option<i16>,
    pub description: String,
}

/// The closed set of transport implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Elm327,
    Autel,
    Mock,
}

/// A chunk of bytes received from the physical link
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub timestamp: Instant,
    pub data: Vec<u8>,
}

/// Capability interface implemented by every physical link
///
/// Every operation fails with [`TransportError::NotConnected`] unless the
/// transport is in [`TransportState::Connected`]. Implementations serialize
/// `send_raw`/`send_uds` internally so concurrent callers never interleave
/// partial frames on the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Current connection state
    fn state(&self) -> TransportState;

    /// Subscribe to connection-state transitions
    fn subscribe_state(&self) -> broadcast::Receiver<TransportState>;

    /// Subscribe to every inbound byte chunk, consumed or not
    fn subscribe_raw(&self) -> broadcast::Receiver<RawChunk>;

    /// Discover reachable devices
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError>;

    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), TransportError>;

    /// Tear down the link. Calling this while already disconnected is a no-op.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write bytes verbatim and return what the adapter answers
    async fn send_raw(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Send an AT-style text command and return the textual answer
    async fn send_text(&self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Send a UDS request to the module at `address` and return the raw response bytes
    ///
    /// An empty vector means the module did not answer.
    async fn send_uds(
        &self,
        address: u32,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a UDS request for which no response is expected
    async fn send_uds_oneway(&self, address: u32, request: &[u8]) -> Result<(), TransportError>;

    /// Wait for a further answer from `address` without sending anything
    ///
    /// Follows a "response pending" answer to the request last sent to that
    /// module. An empty vector means nothing arrived within `timeout`.
    /// Links that can only listen while a request is outstanding return
    /// [`TransportError::Unsupported`].
    async fn receive_uds(&self, address: u32, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let _ = (address, timeout);
        Err(TransportError::Unsupported(format!(
            "{:?} transport cannot listen without a request",
            self.kind()
        )))
    }

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}
