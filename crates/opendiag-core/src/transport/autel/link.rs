//! Frame exchange over one VCI byte stream and the Pass-Thru calls built on it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::packet::{AutelCommand, AutelPacket, FrameParser, PacketBuilder};
use super::passthru::{
    ascii_fields, PassThruError, PassThruMsg, PayloadReader, PayloadWriter, VersionInfo,
    IOCTL_READ_VBATT,
};
use crate::config::AutelConfig;
use crate::transport::link::LinkState;
use crate::transport::TransportError;

type Waiter = oneshot::Sender<Result<AutelPacket, TransportError>>;

/// Waiters keyed by session id
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<HashMap<u32, Waiter>>,
}

impl PendingTable {
    fn insert(&self, session_id: u32, waiter: Waiter) {
        self.waiters.lock().insert(session_id, waiter);
    }

    fn remove(&self, session_id: u32) -> Option<Waiter> {
        self.waiters.lock().remove(&session_id)
    }

    fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Complete every waiter with `ConnectionLost`
    fn drain(&self) {
        let waiters: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), "Failing pending requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::ConnectionLost));
        }
    }
}

/// One attached VCI stream
///
/// Any number of requests may be in flight; each is matched to its
/// response by session id. Frame writes are serialized.
pub struct AutelLink {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    builder: PacketBuilder,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    frame_timeout: Duration,
}

impl AutelLink {
    /// Split `stream` and start the reader task
    ///
    /// Inbound chunks are published on `state`; if the stream ends the
    /// pending table is drained and `state` is failed.
    pub fn attach<S>(stream: S, config: &AutelConfig, state: Arc<LinkState>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(PendingTable::default());
        let closed = Arc::new(AtomicBool::new(false));
        let parser = FrameParser::new(config.verify_crc, config.resync_window);

        let reader = tokio::spawn(read_loop(
            read_half,
            parser,
            pending.clone(),
            closed.clone(),
            state,
        ));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            builder: PacketBuilder::new(),
            pending,
            closed,
            reader: Mutex::new(Some(reader)),
            frame_timeout: Duration::from_millis(config.frame_timeout_ms),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop the reader, fail every waiter and shut the write side
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.drain();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Error shutting down VCI stream");
        }
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                TransportError::ConnectionLost
            }
            _ => TransportError::SendFailed(e.to_string()),
        })?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Write bytes verbatim, bypassing framing
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionLost);
        }
        self.write_frame(bytes).await
    }

    /// Send one request frame and wait for the frame with the same session id
    pub async fn exchange(
        &self,
        command: AutelCommand,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<AutelPacket, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionLost);
        }

        let packet = self.builder.build(command, payload);
        let session_id = packet.session_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(session_id, tx);

        trace!(
            session_id,
            command = command.name(),
            len = packet.payload.len(),
            "Sending frame"
        );
        if let Err(e) = self.write_frame(&packet.encode()).await {
            self.pending.remove(session_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                // A late response must not find a waiter
                self.pending.remove(session_id);
                Err(TransportError::Timeout(format!(
                    "{} (session {})",
                    command.name(),
                    session_id
                )))
            }
        }
    }

    /// Exchange and translate a non-zero status into an error naming the call
    async fn call(
        &self,
        command: AutelCommand,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let response = self.exchange(command, payload, timeout).await?;
        match PassThruError::from_code(response.status()) {
            None => Ok(response.payload),
            Some(error) => {
                debug!(operation = command.name(), %error, "Pass-Thru call failed");
                Err(TransportError::PassThru {
                    operation: command.name(),
                    error,
                })
            }
        }
    }

    fn u32_result(command: AutelCommand, payload: &[u8]) -> Result<u32, TransportError> {
        PayloadReader::new(payload).u32(command.name())
    }

    /// Identification string reported by the adapter
    pub async fn identify(&self) -> Result<String, TransportError> {
        let payload = self
            .call(AutelCommand::Identify, Vec::new(), self.frame_timeout)
            .await?;
        Ok(ascii_fields(&payload).join(" "))
    }

    pub async fn firmware_version(&self) -> Result<String, TransportError> {
        let payload = self
            .call(AutelCommand::GetFirmwareVersion, Vec::new(), self.frame_timeout)
            .await?;
        Ok(ascii_fields(&payload).join(" "))
    }

    pub async fn pass_thru_open(&self, name: &str) -> Result<u32, TransportError> {
        let payload = PayloadWriter::new().bytes(name.as_bytes()).finish();
        let response = self
            .call(AutelCommand::PassThruOpen, payload, self.frame_timeout)
            .await?;
        let device_id = Self::u32_result(AutelCommand::PassThruOpen, &response)?;
        info!(device_id, "Pass-Thru device opened");
        Ok(device_id)
    }

    pub async fn pass_thru_close(&self, device_id: u32) -> Result<(), TransportError> {
        let payload = PayloadWriter::new().u32(device_id).finish();
        self.call(AutelCommand::PassThruClose, payload, self.frame_timeout)
            .await?;
        Ok(())
    }

    pub async fn pass_thru_connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baud_rate: u32,
    ) -> Result<u32, TransportError> {
        let payload = PayloadWriter::new()
            .u32(device_id)
            .u32(protocol_id)
            .u32(flags)
            .u32(baud_rate)
            .finish();
        let response = self
            .call(AutelCommand::Connect, payload, self.frame_timeout)
            .await?;
        Self::u32_result(AutelCommand::Connect, &response)
    }

    pub async fn pass_thru_disconnect(&self, channel_id: u32) -> Result<(), TransportError> {
        let payload = PayloadWriter::new().u32(channel_id).finish();
        self.call(AutelCommand::Disconnect, payload, self.frame_timeout)
            .await?;
        Ok(())
    }

    /// Read up to `max` messages, waiting at most `wait` on the adapter side
    ///
    /// An empty receive queue yields an empty vector.
    pub async fn pass_thru_read_msgs(
        &self,
        channel_id: u32,
        max: u32,
        wait: Duration,
    ) -> Result<Vec<PassThruMsg>, TransportError> {
        let payload = PayloadWriter::new()
            .u32(channel_id)
            .u32(max)
            .u32(wait.as_millis() as u32)
            .finish();
        let response = match self
            .call(AutelCommand::ReadMsgs, payload, wait + self.frame_timeout)
            .await
        {
            Ok(response) => response,
            Err(TransportError::PassThru {
                error: PassThruError::BufferEmpty,
                ..
            }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut reader = PayloadReader::new(&response);
        let count = reader.u32("message count")? as usize;
        // The count is adapter-supplied; the payload bounds what can follow
        let mut msgs = Vec::with_capacity(count.min(reader.rest().len() / PassThruMsg::HEADER_LEN));
        for _ in 0..count {
            msgs.push(reader.msg()?);
        }
        Ok(msgs)
    }

    /// Queue messages for transmission, returning how many were accepted
    pub async fn pass_thru_write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        wait: Duration,
    ) -> Result<u32, TransportError> {
        let mut writer = PayloadWriter::new()
            .u32(channel_id)
            .u32(wait.as_millis() as u32)
            .u32(msgs.len() as u32);
        for msg in msgs {
            writer = writer.msg(msg);
        }
        let response = self
            .call(AutelCommand::WriteMsgs, writer.finish(), wait + self.frame_timeout)
            .await?;
        Self::u32_result(AutelCommand::WriteMsgs, &response)
    }

    pub async fn pass_thru_start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: u32,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, TransportError> {
        let mut writer = PayloadWriter::new()
            .u32(channel_id)
            .u32(filter_type)
            .msg(mask)
            .msg(pattern)
            .u32(u32::from(flow_control.is_some()));
        if let Some(flow) = flow_control {
            writer = writer.msg(flow);
        }
        let response = self
            .call(AutelCommand::StartMsgFilter, writer.finish(), self.frame_timeout)
            .await?;
        Self::u32_result(AutelCommand::StartMsgFilter, &response)
    }

    pub async fn pass_thru_stop_msg_filter(
        &self,
        channel_id: u32,
        filter_id: u32,
    ) -> Result<(), TransportError> {
        let payload = PayloadWriter::new().u32(channel_id).u32(filter_id).finish();
        self.call(AutelCommand::StopMsgFilter, payload, self.frame_timeout)
            .await?;
        Ok(())
    }

    pub async fn pass_thru_set_programming_voltage(
        &self,
        device_id: u32,
        pin: u32,
        millivolts: u32,
    ) -> Result<(), TransportError> {
        let payload = PayloadWriter::new()
            .u32(device_id)
            .u32(pin)
            .u32(millivolts)
            .finish();
        self.call(AutelCommand::SetProgrammingVoltage, payload, self.frame_timeout)
            .await?;
        Ok(())
    }

    pub async fn pass_thru_ioctl(
        &self,
        target_id: u32,
        ioctl_id: u32,
        input: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let payload = PayloadWriter::new()
            .u32(target_id)
            .u32(ioctl_id)
            .bytes(input)
            .finish();
        self.call(AutelCommand::Ioctl, payload, self.frame_timeout)
            .await
    }

    pub async fn read_version(&self, device_id: u32) -> Result<VersionInfo, TransportError> {
        let payload = PayloadWriter::new().u32(device_id).finish();
        let response = self
            .call(AutelCommand::ReadVersion, payload, self.frame_timeout)
            .await?;
        Ok(VersionInfo::from_payload(&response))
    }

    /// Vehicle battery voltage in millivolts
    pub async fn read_battery_voltage(&self, device_id: u32) -> Result<u32, TransportError> {
        let response = self.pass_thru_ioctl(device_id, IOCTL_READ_VBATT, &[]).await?;
        Self::u32_result(AutelCommand::Ioctl, &response)
    }
}

impl Drop for AutelLink {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut parser: FrameParser,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    state: Arc<LinkState>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!("VCI stream closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "VCI read error");
                break;
            }
        };

        state.publish_inbound(&buf[..n]);
        parser.push(&buf[..n]);

        while let Some(packet) = parser.next_packet() {
            match pending.remove(packet.session_id) {
                Some(waiter) => {
                    trace!(session_id = packet.session_id, status = packet.status(), "Frame matched");
                    let _ = waiter.send(Ok(packet));
                }
                None => debug!(
                    session_id = packet.session_id,
                    "Dropping frame with no waiting request"
                ),
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.drain();
    state.fail();
}
