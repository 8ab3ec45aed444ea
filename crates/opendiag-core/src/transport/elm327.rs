//! ELM327 transport
//!
//! Text protocol: each command ends with `\r`, each answer ends with the
//! `>` prompt. UDS requests are sent as hex after the CAN header and
//! receive filter have been pointed at the target module.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::autel::CanAddressing;
use super::link::{connect_tcp, probe_endpoints, LinkState};
use super::{
    DeviceClass, DeviceDescriptor, RawChunk, Transport, TransportError, TransportKind,
    TransportState,
};
use crate::config::Elm327Config;

const PROMPT: u8 = b'>';

/// Delay before re-sending a request answered with "response pending"
const PENDING_POLL: Duration = Duration::from_millis(100);

/// Longest wait for the prompt of a command that already timed out
const RESYNC_WAIT: Duration = Duration::from_secs(1);

const ERROR_WORDS: &[&str] = &[
    "CAN ERROR",
    "BUS INIT: ERROR",
    "BUS INIT: ...ERROR",
    "UNABLE TO CONNECT",
    "BUFFER FULL",
    "BUS BUSY",
    "FB ERROR",
    "DATA ERROR",
    "ERROR",
];

trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Exclusive access to the adapter's byte stream
struct ElmIo {
    stream: Box<dyn ByteStream>,
    buf: Vec<u8>,
    /// Module the header and receive filter currently point at
    target: Option<u32>,
    /// A timed-out command may still print its answer and prompt
    resync: bool,
}

pub struct Elm327Transport {
    config: Elm327Config,
    state: Arc<LinkState>,
    io: tokio::sync::Mutex<Option<ElmIo>>,
}

impl Elm327Transport {
    pub fn new(config: Elm327Config) -> Self {
        Self {
            config,
            state: Arc::new(LinkState::new("elm327")),
            io: tokio::sync::Mutex::new(None),
        }
    }

    /// Take over an open byte stream and run the initialisation sequence
    ///
    /// Init commands that time out or are rejected are logged and skipped.
    pub async fn attach<S>(&self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.state.set(TransportState::Connecting);
        let mut io = ElmIo {
            stream: Box::new(stream),
            buf: Vec::with_capacity(256),
            target: None,
            resync: false,
        };

        let init_timeout = Duration::from_millis(self.config.init_timeout_ms);
        for command in &self.config.init_commands {
            match self.command(&mut io, command, init_timeout).await {
                Ok(lines) => debug!(%command, answer = ?lines, "Init command accepted"),
                Err(e) if e.is_connection() => {
                    self.state.fail();
                    return Err(e);
                }
                Err(e) => warn!(%command, error = %e, "Init command failed, continuing"),
            }
        }

        *self.io.lock().await = Some(io);
        self.state.set(TransportState::Connected);
        Ok(())
    }

    /// Adapter identification string (`ATI`)
    pub async fn identify(&self) -> Result<String, TransportError> {
        self.send_text("ATI", Duration::from_secs(2)).await
    }

    /// Battery voltage measured at the OBD connector (`ATRV`)
    pub async fn battery_voltage(&self) -> Result<f32, TransportError> {
        let answer = self.send_text("ATRV", Duration::from_secs(2)).await?;
        answer
            .trim()
            .trim_end_matches(['V', 'v'])
            .parse::<f32>()
            .map_err(|_| TransportError::Protocol(format!("unexpected ATRV answer: {}", answer)))
    }

    /// Write `data` and collect bytes up to the prompt
    async fn exchange(
        &self,
        io: &mut ElmIo,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if io.resync {
            self.resync(io, timeout).await?;
        }
        io.buf.clear();
        if let Err(e) = Self::write_all(io, data).await {
            if e.is_connection() {
                self.state.fail();
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, self.read_until_prompt(io)).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => {
                if e.is_connection() {
                    self.state.fail();
                }
                Err(e)
            }
            Err(_) => {
                io.resync = true;
                Err(TransportError::Timeout(format!(
                    "no prompt after {}",
                    String::from_utf8_lossy(data).trim()
                )))
            }
        }
    }

    /// Discard a late answer up to its prompt so it cannot pass for the next one
    async fn resync(&self, io: &mut ElmIo, timeout: Duration) -> Result<(), TransportError> {
        io.resync = false;
        match tokio::time::timeout(timeout.min(RESYNC_WAIT), self.read_until_prompt(io)).await {
            Ok(Ok(stale)) => debug!(
                discarded = %String::from_utf8_lossy(&stale).trim(),
                "Dropped late adapter answer"
            ),
            Ok(Err(e)) => {
                if e.is_connection() {
                    self.state.fail();
                }
                return Err(e);
            }
            Err(_) => debug!("No late adapter answer to discard"),
        }
        Ok(())
    }

    async fn write_all(io: &mut ElmIo, data: &[u8]) -> Result<(), TransportError> {
        io.stream.write_all(data).await?;
        io.stream.flush().await?;
        Ok(())
    }

    async fn read_until_prompt(&self, io: &mut ElmIo) -> Result<Vec<u8>, TransportError> {
        let mut chunk = [0u8; 512];
        loop {
            let n = io.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportError::ConnectionLost);
            }
            self.state.publish_inbound(&chunk[..n]);
            io.buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = io.buf.iter().position(|&b| b == PROMPT) {
                let answer = io.buf[..pos].to_vec();
                io.buf.drain(..=pos);
                return Ok(answer);
            }
        }
    }

    /// Send a text command and return its cleaned answer lines
    async fn command(
        &self,
        io: &mut ElmIo,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, TransportError> {
        let mut data = command.trim().as_bytes().to_vec();
        data.push(b'\r');
        let answer = self.exchange(io, &data, timeout).await?;
        let lines = clean_lines(&String::from_utf8_lossy(&answer), command);
        if lines.iter().any(|l| l == "?") {
            return Err(TransportError::Protocol(format!(
                "adapter rejected {}",
                command.trim()
            )));
        }
        Ok(lines)
    }

    /// Point the header and receive filter at `address` if not already there
    async fn select_target(
        &self,
        io: &mut ElmIo,
        address: u32,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if io.target == Some(address) {
            return Ok(());
        }
        let addressing = CanAddressing::for_module(address);
        let mut commands = Vec::with_capacity(3);
        if addressing.extended {
            commands.push(format!("ATCP{:02X}", (addressing.tx_id >> 24) & 0x1F));
            commands.push(format!("ATSH{:06X}", addressing.tx_id & 0x00FF_FFFF));
        } else {
            commands.push(format!("ATSH{:03X}", addressing.tx_id));
        }
        if addressing.rx_mask == 0x7FF || addressing.rx_mask == 0x1FFF_FFFF {
            if addressing.extended {
                commands.push(format!("ATCRA{:08X}", addressing.rx_id));
            } else {
                commands.push(format!("ATCRA{:03X}", addressing.rx_id));
            }
        } else {
            commands.push("ATAR".to_string());
        }

        for command in &commands {
            self.command(io, command, timeout).await?;
        }
        debug!(
            address = format!("0x{:X}", address),
            rx_id = format!("0x{:X}", addressing.rx_id),
            "ELM327 header set"
        );
        io.target = Some(address);
        Ok(())
    }

    fn io_missing() -> TransportError {
        TransportError::NotConnected
    }
}

/// Split an answer into trimmed lines without echo, blanks or search notices
pub fn clean_lines(answer: &str, command: &str) -> Vec<String> {
    let echo: String = command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    answer
        .split(['\r', '\n'])
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .filter(|line| !line.to_ascii_uppercase().starts_with("SEARCHING"))
        .filter(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            compact.to_ascii_uppercase() != echo
        })
        .map(|line| line.to_string())
        .collect()
}

fn decode_hex_line(line: &str) -> Result<Vec<u8>, TransportError> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|_| TransportError::Protocol(format!("unexpected adapter output: {}", line)))
}

fn is_length_line(line: &str) -> bool {
    line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit())
}

/// `N:` indexed continuation line, returning the data part
fn indexed_line(line: &str) -> Option<&str> {
    let (index, data) = line.split_once(':')?;
    let index = index.trim();
    (!index.is_empty() && index.chars().all(|c| c.is_ascii_hexdigit())).then_some(data)
}

/// Decode answer lines into UDS messages
///
/// Handles single-line answers and ISO-TP multi-line answers (a 3-digit
/// length line followed by `0:`, `1:`, ... lines). `NO DATA` yields no
/// messages; adapter error words are protocol errors.
pub fn decode_uds_lines(lines: &[String]) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut messages = Vec::new();
    let mut multi: Option<(usize, Vec<u8>)> = None;

    for line in lines {
        let upper = line.to_ascii_uppercase();
        if upper.contains("NO DATA") || upper == "OK" || upper == "STOPPED" {
            continue;
        }
        if upper.starts_with("BUS INIT") && !upper.contains("ERROR") {
            continue;
        }
        if let Some(word) = ERROR_WORDS.iter().find(|w| upper.contains(**w)) {
            return Err(TransportError::Protocol(format!("adapter reported {}", word)));
        }
        if upper == "?" {
            return Err(TransportError::Protocol("adapter rejected request".into()));
        }

        if is_length_line(&upper) {
            if let Some((_, data)) = multi.take() {
                messages.push(data);
            }
            let len = usize::from_str_radix(&upper, 16).unwrap_or(0);
            multi = Some((len, Vec::with_capacity(len)));
            continue;
        }

        if let Some(data) = indexed_line(&upper) {
            let bytes = decode_hex_line(data)?;
            if let Some((len, ref mut collected)) = multi {
                collected.extend_from_slice(&bytes);
                if collected.len() >= len {
                    collected.truncate(len);
                    if let Some((_, data)) = multi.take() {
                        messages.push(data);
                    }
                }
            } else {
                messages.push(bytes);
            }
            continue;
        }

        if let Some((_, data)) = multi.take() {
            messages.push(data);
        }
        messages.push(decode_hex_line(&upper)?);
    }

    if let Some((_, data)) = multi.take() {
        messages.push(data);
    }
    Ok(messages)
}

fn is_pending(message: &[u8]) -> bool {
    message.len() >= 3 && message[0] == 0x7F && message[2] == 0x78
}

#[async_trait]
impl Transport for Elm327Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::Elm327
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
            DeviceClass::ElmCompatible,
            "ELM327",
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
        info!(endpoint = %device.id, "Connected to ELM327 adapter");
        self.attach(stream).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(mut io) = self.io.lock().await.take() {
            if let Err(e) = io.stream.shutdown().await {
                debug!(error = %e, "Error closing ELM327 stream");
            }
        }
        self.state.set(TransportState::Disconnected);
        Ok(())
    }

    async fn send_raw(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.state.ensure_connected()?;
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(Self::io_missing)?;
        self.exchange(io, data, timeout).await
    }

    async fn send_text(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.state.ensure_connected()?;
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(Self::io_missing)?;
        // Header commands issued by hand invalidate the cached target
        if command.trim().to_ascii_uppercase().starts_with("AT") {
            io.target = None;
        }
        let lines = self.command(io, command, timeout).await?;
        Ok(lines.join("\n"))
    }

    async fn send_uds(
        &self,
        address: u32,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.state.ensure_connected()?;
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(Self::io_missing)?;

        let deadline = Instant::now() + timeout;
        self.select_target(io, address, timeout).await?;

        let command = hex::encode_upper(request);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(format!(
                    "module 0x{:X} still pending at deadline",
                    address
                )));
            }
            let lines = self.command(io, &command, remaining).await?;
            let messages = decode_uds_lines(&lines)?;

            if let Some(last) = messages.iter().rev().find(|m| !is_pending(m)) {
                return Ok(last.clone());
            }
            if messages.is_empty() {
                return Ok(Vec::new());
            }

            debug!(address = format!("0x{:X}", address), "Response pending, polling again");
            tokio::time::sleep(PENDING_POLL.min(remaining)).await;
        }
    }

    async fn send_uds_oneway(&self, address: u32, request: &[u8]) -> Result<(), TransportError> {
        self.state.ensure_connected()?;
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(Self::io_missing)?;
        let timeout = Duration::from_millis(self.config.init_timeout_ms);
        self.select_target(io, address, timeout).await?;
        // The adapter still prints NO DATA and a prompt
        let command = hex::encode_upper(request);
        self.command(io, &command, timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(answer: &str, command: &str) -> Vec<String> {
        clean_lines(answer, command)
    }

    #[tokio::test]
    async fn test_scripted_uds_exchange() {
        let stream = tokio_test::io::Builder::new()
            .write(b"ATE0\r")
            .read(b"ATE0\rOK\r\r>")
            .write(b"ATSH7E0\r")
            .read(b"OK\r\r>")
            .write(b"ATCRA7E8\r")
            .read(b"OK\r\r>")
            .write(b"22F186\r")
            .read(b"62 F1 86 03\r\r>")
            .build();
        let transport = Elm327Transport::new(Elm327Config {
            init_commands: vec!["ATE0".to_string()],
            ..Elm327Config::default()
        });

        transport.attach(stream).await.unwrap();
        assert!(transport.is_connected());
        let response = transport
            .send_uds(0x7E0, &[0x22, 0xF1, 0x86], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![0x62, 0xF1, 0x86, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_is_not_taken_for_next_request() {
        let stream = tokio_test::io::Builder::new()
            .write(b"ATSH7E0\r")
            .read(b"OK\r\r>")
            .write(b"ATCRA7E8\r")
            .read(b"OK\r\r>")
            .write(b"22F190\r")
            .wait(Duration::from_millis(300))
            .read(b"62 F1 90 41\r\r>")
            .write(b"22F186\r")
            .read(b"62 F1 86 03\r\r>")
            .build();
        let transport = Elm327Transport::new(Elm327Config {
            init_commands: Vec::new(),
            ..Elm327Config::default()
        });
        transport.attach(stream).await.unwrap();

        let err = transport
            .send_uds(0x7E0, &[0x22, 0xF1, 0x90], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        let response = transport
            .send_uds(0x7E0, &[0x22, 0xF1, 0x86], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![0x62, 0xF1, 0x86, 0x03]);
    }

    #[test]
    fn test_clean_lines_strips_echo_and_searching() {
        let out = lines("0100\rSEARCHING...\r41 00 BE 3F A8 13\r\r", "0100");
        assert_eq!(out, vec!["41 00 BE 3F A8 13".to_string()]);
    }

    #[test]
    fn test_single_line() {
        let msgs = decode_uds_lines(&lines("62 F1 86 03\r", "22F186")).unwrap();
        assert_eq!(msgs, vec![vec![0x62, 0xF1, 0x86, 0x03]]);
    }

    #[test]
    fn test_multi_line_isotp() {
        let answer = "014\r0: 62 F1 90 31 48 47\r1: 43 4D 38 32 36 33 33\r2: 41 31 32 33 34 35 36\r";
        let msgs = decode_uds_lines(&lines(answer, "22F190")).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].len(), 0x14);
        assert_eq!(&msgs[0][..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&msgs[0][3..], b"1HGCM82633A123456");
    }

    #[test]
    fn test_pending_then_final() {
        let answer = "7F 31 78\r71 01 02 03 00\r";
        let msgs = decode_uds_lines(&lines(answer, "31010203")).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(is_pending(&msgs[0]));
        assert!(!is_pending(&msgs[1]));
    }

    #[test]
    fn test_no_data_is_empty() {
        assert!(decode_uds_lines(&lines("NO DATA\r", "3E00")).unwrap().is_empty());
    }

    #[test]
    fn test_error_words() {
        for answer in ["CAN ERROR\r", "BUS INIT: ERROR\r", "UNABLE TO CONNECT\r", "?\r"] {
            assert!(matches!(
                decode_uds_lines(&lines(answer, "1003")),
                Err(TransportError::Protocol(_))
            ));
        }
    }
}
