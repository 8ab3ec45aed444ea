//! Fake adapters speaking the ELM327 text protocol and the Autel VCI framing
//! over in-memory duplex streams.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use opendiag_core::transport::autel::passthru::{PassThruError, PayloadReader, PayloadWriter, TX_MSG_TYPE};
use opendiag_core::transport::autel::{AutelCommand, AutelPacket, FrameParser, PassThruMsg};

// =============================================================================
// ELM327
// =============================================================================

/// How the fake ELM answers one command line
pub enum Reply {
    /// Built-in behaviour: `OK` for AT commands, `NO DATA` otherwise
    Default,
    /// No answer and no prompt
    Silent,
    Text(String),
}

/// Spawn a fake ELM327 on `stream`
///
/// `respond` gets the current `ATSH` header and the upper-cased command.
/// Returns the command log and the adapter task.
pub fn spawn_elm<F>(mut stream: DuplexStream, respond: F) -> (Arc<Mutex<Vec<String>>>, JoinHandle<()>)
where
    F: Fn(&str, &str) -> Reply + Send + 'static,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = tokio::spawn({
        let log = log.clone();
        async move {
            let mut header = String::from("7DF");
            let mut echo = true;
            let mut pending = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
                    let line = String::from_utf8_lossy(&pending[..pos]).trim().to_ascii_uppercase();
                    pending.drain(..=pos);
                    log.lock().push(line.clone());

                    if let Some(h) = line.strip_prefix("ATSH") {
                        header = h.to_string();
                    }
                    if line == "ATE0" {
                        echo = false;
                    }

                    let reply = match respond(&header, &line) {
                        Reply::Silent => continue,
                        Reply::Text(text) => text,
                        Reply::Default if line == "ATI" => "ELM327 v1.5".to_string(),
                        Reply::Default if line.starts_with("AT") => "OK".to_string(),
                        Reply::Default => "NO DATA".to_string(),
                    };
                    let mut out = String::new();
                    if echo {
                        out.push_str(&line);
                        out.push('\r');
                    }
                    out.push_str(&reply);
                    out.push_str("\r\r>");
                    if stream.write_all(out.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    (log, handle)
}

// =============================================================================
// Autel VCI
// =============================================================================

pub const DEVICE_ID: u32 = 1;
pub const CHANNEL_ID: u32 = 7;
pub const FILTER_ID: u32 = 9;

/// What the fake VCI observed
#[derive(Debug, Default)]
pub struct VciLog {
    pub commands: Vec<AutelCommand>,
    /// (pattern id, flow-control id) of each flow-control filter
    pub filters: Vec<(u32, u32)>,
    /// (CAN id, UDS bytes) of every transmitted message
    pub writes: Vec<(u32, Vec<u8>)>,
    /// Bit rate of each channel connect attempt
    pub bit_rates: Vec<u32>,
}

/// Fake VCI behaviour knobs
#[derive(Debug, Default, Clone)]
pub struct VciOptions {
    /// Bit rates whose connect is refused with `ERR_INVALID_BAUDRATE`
    pub rejected_bit_rates: Vec<u32>,
}

impl VciLog {
    pub fn count(&self, command: AutelCommand) -> usize {
        self.commands.iter().filter(|c| **c == command).count()
    }
}

/// Spawn a fake Autel VCI on `stream`
///
/// `ecu` maps (CAN id, request) to the answers the ECU sends, in order; each
/// answer is delivered by a separate `PassThruReadMsgs`. Answers come from
/// the request id + 8.
pub fn spawn_vci<F>(stream: DuplexStream, ecu: F) -> (Arc<Mutex<VciLog>>, JoinHandle<()>)
where
    F: Fn(u32, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    spawn_vci_with(stream, VciOptions::default(), ecu)
}

pub fn spawn_vci_with<F>(
    mut stream: DuplexStream,
    options: VciOptions,
    ecu: F,
) -> (Arc<Mutex<VciLog>>, JoinHandle<()>)
where
    F: Fn(u32, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let log = Arc::new(Mutex::new(VciLog::default()));
    let handle = tokio::spawn({
        let log = log.clone();
        async move {
            let mut parser = FrameParser::new(true, 4096);
            let mut inbox: VecDeque<PassThruMsg> = VecDeque::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                parser.push(&chunk[..n]);
                while let Some(request) = parser.next_packet() {
                    let Some(command) = AutelCommand::from_code(request.command, request.parameter)
                    else {
                        continue;
                    };
                    log.lock().commands.push(command);
                    let (status, payload) =
                        handle_vci(command, &request.payload, &mut inbox, &log, &options, &ecu);
                    if status == PassThruError::BufferEmpty.code() {
                        // A real VCI waits out the read timeout
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    let response = AutelPacket::response_to(&request, status, payload);
                    if stream.write_all(&response.encode()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    (log, handle)
}

fn handle_vci<F>(
    command: AutelCommand,
    payload: &[u8],
    inbox: &mut VecDeque<PassThruMsg>,
    log: &Mutex<VciLog>,
    options: &VciOptions,
    ecu: &F,
) -> (u32, Vec<u8>)
where
    F: Fn(u32, &[u8]) -> Vec<Vec<u8>>,
{
    let mut reader = PayloadReader::new(payload);
    match command {
        AutelCommand::Identify => (0, b"MaxiVCI V200".to_vec()),
        AutelCommand::PassThruOpen => (0, PayloadWriter::new().u32(DEVICE_ID).finish()),
        AutelCommand::Connect => {
            let _device = reader.u32("device");
            let _protocol = reader.u32("protocol");
            let _flags = reader.u32("flags");
            let bit_rate = reader.u32("bit rate").unwrap_or_default();
            log.lock().bit_rates.push(bit_rate);
            if options.rejected_bit_rates.contains(&bit_rate) {
                (PassThruError::InvalidBaudrate.code(), Vec::new())
            } else {
                (0, PayloadWriter::new().u32(CHANNEL_ID).finish())
            }
        }
        AutelCommand::StartMsgFilter => {
            let _channel = reader.u32("channel");
            let _kind = reader.u32("filter type");
            let mask = reader.msg();
            let pattern = reader.msg();
            let _has_flow = reader.u32("flow flag");
            let flow = reader.msg();
            if let (Ok(_), Ok(pattern), Ok(flow)) = (mask, pattern, flow) {
                log.lock().filters.push((
                    pattern.can_id().unwrap_or_default(),
                    flow.can_id().unwrap_or_default(),
                ));
            }
            (0, PayloadWriter::new().u32(FILTER_ID).finish())
        }
        AutelCommand::WriteMsgs => {
            let _channel = reader.u32("channel");
            let _timeout = reader.u32("timeout");
            let count = reader.u32("count").unwrap_or(0);
            for _ in 0..count {
                let Ok(msg) = reader.msg() else { break };
                let can_id = msg.can_id().unwrap_or_default();
                let request = msg.payload().to_vec();
                log.lock().writes.push((can_id, request.clone()));

                let mut echo = PassThruMsg::iso15765(can_id, &request, 0);
                echo.rx_status = TX_MSG_TYPE;
                inbox.push_back(echo);
                for answer in ecu(can_id, &request) {
                    inbox.push_back(PassThruMsg::iso15765(can_id + 0x08, &answer, 0));
                }
            }
            (0, PayloadWriter::new().u32(count).finish())
        }
        AutelCommand::ReadMsgs => match inbox.pop_front() {
            Some(msg) => (0, PayloadWriter::new().u32(1).msg(&msg).finish()),
            None => (PassThruError::BufferEmpty.code(), Vec::new()),
        },
        _ => (0, Vec::new()),
    }
}
