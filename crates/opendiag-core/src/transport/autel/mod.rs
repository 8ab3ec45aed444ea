//! Autel VCI transport
//!
//! The adapter speaks a framed binary protocol over a Bluetooth SPP link
//! (reached here through a TCP bridge). Each frame carries a session id;
//! the J2534 Pass-Thru calls in [`AutelLink`] are request/response pairs
//! correlated by that id. UDS requests are tunnelled as ISO 15765
//! messages on a channel whose CAN ids are derived from the module
//! address by [`CanAddressing`].

pub mod addressing;
pub mod link;
pub mod packet;
pub mod passthru;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use addressing::CanAddressing;
pub use link::AutelLink;
pub use packet::{AutelCommand, AutelPacket, FrameParser, PacketBuilder};
pub use passthru::{PassThruError, PassThruMsg, VersionInfo};

use super::link::{connect_tcp, probe_endpoints, LinkState};
use super::{
    DeviceClass, DeviceDescriptor, RawChunk, Transport, TransportError, TransportKind,
    TransportState,
};
use crate::config::AutelConfig;
use passthru::{FILTER_FLOW_CONTROL, PROTOCOL_ISO15765};

const NEGATIVE_RESPONSE: u8 = 0x7F;
const NRC_BUSY_REPEAT_REQUEST: u8 = 0x21;
const NRC_RESPONSE_PENDING: u8 = 0x78;

/// Poll interval for `PassThruReadMsgs` while waiting for a UDS answer
const READ_POLL: Duration = Duration::from_millis(100);

/// An open ISO 15765 channel bound to one module's identifiers
#[derive(Debug, Clone, Copy)]
struct ChannelState {
    channel_id: u32,
    filter_id: u32,
    addressing: CanAddressing,
}

pub struct AutelTransport {
    config: AutelConfig,
    state: Arc<LinkState>,
    link: Mutex<Option<Arc<AutelLink>>>,
    device_id: Mutex<Option<u32>>,
    /// Held for the whole of a UDS exchange
    channel: tokio::sync::Mutex<Option<ChannelState>>,
}

impl AutelTransport {
    pub fn new(config: AutelConfig) -> Self {
        Self {
            config,
            state: Arc::new(LinkState::new("autel")),
            link: Mutex::new(None),
            device_id: Mutex::new(None),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// The attached link, for direct Pass-Thru calls
    pub fn link(&self) -> Result<Arc<AutelLink>, TransportError> {
        self.state.ensure_connected()?;
        self.link.lock().clone().ok_or(TransportError::NotConnected)
    }

    pub fn device_id(&self) -> Option<u32> {
        *self.device_id.lock()
    }

    /// Take over an already-open byte stream and open the Pass-Thru device
    pub async fn attach<S>(&self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.state.set(TransportState::Connecting);
        // Channel and device ids from an earlier link are dead on this one
        *self.channel.lock().await = None;
        *self.device_id.lock() = None;
        let stale = self.link.lock().take();
        if let Some(stale) = stale {
            stale.close().await;
        }
        let link = Arc::new(AutelLink::attach(stream, &self.config, self.state.clone()));

        match link.identify().await {
            Ok(id) => info!(identity = %id, "VCI identified"),
            Err(e) if e.is_timeout() => warn!("VCI did not answer identify, continuing"),
            Err(e) => {
                link.close().await;
                self.state.fail();
                return Err(e);
            }
        }

        let device_id = match link.pass_thru_open("").await {
            Ok(id) => id,
            Err(e) => {
                link.close().await;
                self.state.fail();
                return Err(e);
            }
        };

        *self.device_id.lock() = Some(device_id);
        *self.link.lock() = Some(link);
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn close_channel(link: &AutelLink, channel: ChannelState) {
        if let Err(e) = link
            .pass_thru_stop_msg_filter(channel.channel_id, channel.filter_id)
            .await
        {
            debug!(error = %e, "Stopping filter failed");
        }
        if let Err(e) = link.pass_thru_disconnect(channel.channel_id).await {
            debug!(error = %e, "Channel disconnect failed");
        }
    }

    /// Open an ISO 15765 channel with a flow-control filter for `addressing`
    async fn open_channel(
        &self,
        link: &AutelLink,
        addressing: CanAddressing,
    ) -> Result<ChannelState, TransportError> {
        let device_id = self.device_id().ok_or(TransportError::NotConnected)?;
        let mut last_error = TransportError::InvalidConfig("no bit rates configured".into());
        let mut channel_id = None;

        for &bit_rate in &self.config.bit_rates {
            match link
                .pass_thru_connect(
                    device_id,
                    PROTOCOL_ISO15765,
                    addressing.connect_flags(),
                    bit_rate,
                )
                .await
            {
                Ok(id) => {
                    debug!(channel_id = id, bit_rate, "ISO 15765 channel connected");
                    channel_id = Some(id);
                    break;
                }
                Err(e) => {
                    warn!(bit_rate, error = %e, "Channel connect failed");
                    last_error = e;
                }
            }
        }
        let channel_id = channel_id.ok_or(last_error)?;

        let (mask, pattern, flow) = addressing.flow_control_filter();
        let filter_id = match link
            .pass_thru_start_msg_filter(channel_id, FILTER_FLOW_CONTROL, &mask, &pattern, Some(&flow))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = link.pass_thru_disconnect(channel_id).await;
                return Err(e);
            }
        };

        Ok(ChannelState {
            channel_id,
            filter_id,
            addressing,
        })
    }

    /// Make sure the open channel targets `addressing`, reopening if needed
    async fn ensure_channel(
        &self,
        link: &AutelLink,
        current: &mut Option<ChannelState>,
        addressing: CanAddressing,
    ) -> Result<ChannelState, TransportError> {
        if let Some(channel) = *current {
            if channel.addressing == addressing {
                return Ok(channel);
            }
            Self::close_channel(link, channel).await;
            *current = None;
        }
        let channel = self.open_channel(link, addressing).await?;
        debug!(
            tx_id = format!("0x{:X}", addressing.tx_id),
            rx_id = format!("0x{:X}", addressing.rx_id),
            "Channel bound to module"
        );
        *current = Some(channel);
        Ok(channel)
    }

    async fn write_request(
        link: &AutelLink,
        channel: &ChannelState,
        request: &[u8],
    ) -> Result<(), TransportError> {
        let addressing = channel.addressing;
        let msg = PassThruMsg::iso15765(addressing.tx_id, request, addressing.tx_flags());
        let written = link
            .pass_thru_write_msgs(channel.channel_id, &[msg], Duration::from_millis(100))
            .await?;
        if written == 0 {
            return Err(TransportError::SendFailed("adapter accepted no messages".into()));
        }
        Ok(())
    }

    /// Read messages until the module gives a final answer or `deadline` passes
    ///
    /// Pending answers are skipped. With `request` given, one busy answer
    /// repeats it. Empty when nothing arrived.
    async fn collect_answer(
        link: &AutelLink,
        channel: &ChannelState,
        address: u32,
        request: Option<&[u8]>,
        deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let addressing = channel.addressing;
        let mut resent = request.is_none();
        let mut pending_seen = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let msgs = link
                .pass_thru_read_msgs(channel.channel_id, 8, remaining.min(READ_POLL))
                .await?;

            for msg in msgs {
                if msg.is_tx_echo() || msg.is_indication() {
                    continue;
                }
                match msg.can_id() {
                    Some(id) if addressing.matches_rx(id) => {}
                    _ => continue,
                }
                let payload = msg.payload();
                if payload.is_empty() {
                    continue;
                }

                if payload.len() >= 3 && payload[0] == NEGATIVE_RESPONSE {
                    match (payload[2], request) {
                        (NRC_RESPONSE_PENDING, _) => {
                            debug!(address = format!("0x{:X}", address), "Response pending");
                            pending_seen = true;
                            continue;
                        }
                        (NRC_BUSY_REPEAT_REQUEST, Some(request)) if !resent => {
                            debug!(address = format!("0x{:X}", address), "Busy, repeating request");
                            resent = true;
                            Self::write_request(link, channel, request).await?;
                            continue;
                        }
                        _ => {}
                    }
                }
                return Ok(payload.to_vec());
            }
        }

        if pending_seen {
            Err(TransportError::Timeout(format!(
                "module 0x{:X} still pending at deadline",
                address
            )))
        } else {
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl Transport for AutelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Autel
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

    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let previous = self.state.get();
        if previous == TransportState::Disconnected {
            self.state.set(TransportState::Scanning);
        }
        let found = probe_endpoints(
            &self.config.endpoints,
            timeout,
            DeviceClass::ProprietaryVci,
            "Autel VCI",
        )
        .await;
        if previous == TransportState::Disconnected {
            self.state.set(TransportState::Disconnected);
        }
        Ok(found)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        if self.state.get() == TransportState::Connected {
            return Ok(());
        }
        self.state.set(TransportState::Connecting);
        let stream = match connect_tcp(
            &device.id,
            Duration::from_millis(self.config.connect_timeout_ms),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.state.fail();
                return Err(e);
            }
        };
        info!(endpoint = %device.id, "Connected to VCI");
        self.attach(stream).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = self.link.lock().take();
        let device_id = self.device_id.lock().take();

        if let Some(link) = link {
            if !link.is_closed() {
                if let Some(channel) = self.channel.lock().await.take() {
                    Self::close_channel(&link, channel).await;
                }
                if let Some(device_id) = device_id {
                    if let Err(e) = link.pass_thru_close(device_id).await {
                        debug!(error = %e, "Pass-Thru close failed");
                    }
                }
            }
            link.close().await;
        }
        *self.channel.lock().await = None;
        self.state.set(TransportState::Disconnected);
        Ok(())
    }

    /// Write bytes verbatim and return the next inbound chunk
    async fn send_raw(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let link = self.link()?;
        let mut rx = self.state.subscribe_raw();
        link.write_raw(data).await?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(chunk)) => Ok(chunk.data),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => Err(TransportError::Timeout("raw response".into())),
        }
    }

    async fn send_text(&self, _command: &str, _timeout: Duration) -> Result<String, TransportError> {
        Err(TransportError::Unsupported(
            "AT commands are not available on the Autel VCI".into(),
        ))
    }

    async fn send_uds(
        &self,
        address: u32,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let link = self.link()?;
        let mut current = self.channel.lock().await;
        let addressing = CanAddressing::for_module(address);
        let channel = self.ensure_channel(&link, &mut current, addressing).await?;

        let deadline = Instant::now() + timeout;
        Self::write_request(&link, &channel, request).await?;
        Self::collect_answer(&link, &channel, address, Some(request), deadline).await
    }

    async fn send_uds_oneway(&self, address: u32, request: &[u8]) -> Result<(), TransportError> {
        let link = self.link()?;
        let mut current = self.channel.lock().await;
        let channel = self
            .ensure_channel(&link, &mut current, CanAddressing::for_module(address))
            .await?;
        Self::write_request(&link, &channel, request).await
    }

    async fn receive_uds(&self, address: u32, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let link = self.link()?;
        let current = self.channel.lock().await;
        // Only the module the channel is bound to can still be answering
        let Some(channel) = *current else {
            return Ok(Vec::new());
        };
        if channel.addressing != CanAddressing::for_module(address) {
            return Ok(Vec::new());
        }
        Self::collect_answer(&link, &channel, address, None, Instant::now() + timeout).await
    }
}
