//! Autel VCI frame encoding and stream reassembly
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     magic 55 55 AA AA
//! 4       4     total length (bytes after the magic, CRC included)
//! 8       4     session id
//! 12      4     message counter
//! 16      4     payload length
//! 20      4     session id (repeated)
//! 24      4     flags (FF FF FF FF)
//! 28      4     command / status
//! 32      4     parameter
//! 36      N     payload
//! 36+N    4     CRC-32 over bytes 0..36+N
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, warn};

pub const MAGIC: [u8; 4] = [0x55, 0x55, 0xAA, 0xAA];

/// Magic plus eight header words
pub const HEADER_LEN: usize = 36;

pub const CRC_LEN: usize = 4;

/// Smallest valid `total length` field: eight header words plus the CRC
pub const MIN_TOTAL_LEN: u32 = (HEADER_LEN - MAGIC.len() + CRC_LEN) as u32;

/// Largest `total length` accepted before the header is treated as corrupt
pub const MAX_TOTAL_LEN: u32 = 64 * 1024;

/// End of the repeated session id word
const SESSION_REPEAT_END: usize = 24;

pub const DEFAULT_FLAGS: u32 = 0xFFFF_FFFF;

/// Status word of a successful response
pub const STATUS_OK: u32 = 0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Known request commands as (command, parameter) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutelCommand {
    Identify,
    PassThruOpen,
    PassThruClose,
    ReadMsgs,
    WriteMsgs,
    StartMsgFilter,
    StopMsgFilter,
    SetProgrammingVoltage,
    Connect,
    Disconnect,
    Ioctl,
    ReadVersion,
    GetFirmwareVersion,
}

impl AutelCommand {
    pub const ALL: [AutelCommand; 13] = [
        Self::Identify,
        Self::PassThruOpen,
        Self::PassThruClose,
        Self::ReadMsgs,
        Self::WriteMsgs,
        Self::StartMsgFilter,
        Self::StopMsgFilter,
        Self::SetProgrammingVoltage,
        Self::Connect,
        Self::Disconnect,
        Self::Ioctl,
        Self::ReadVersion,
        Self::GetFirmwareVersion,
    ];

    pub fn code(self) -> (u32, u32) {
        match self {
            Self::Identify => (0x00, 0x00),
            Self::PassThruOpen => (0x01, 0x04),
            Self::PassThruClose => (0x01, 0x03),
            Self::ReadMsgs => (0x02, 0x01),
            Self::WriteMsgs => (0x02, 0x02),
            Self::StartMsgFilter => (0x02, 0x03),
            Self::StopMsgFilter => (0x02, 0x8003),
            Self::SetProgrammingVoltage => (0x02, 0x8005),
            Self::Connect => (0x05, 0x00),
            Self::Disconnect => (0x05, 0x8000_0001),
            Self::Ioctl => (0x08, 0x01),
            Self::ReadVersion => (0x08, 0x03),
            Self::GetFirmwareVersion => (0x0B, 0x00),
        }
    }

    pub fn from_code(command: u32, parameter: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.code() == (command, parameter))
    }

    /// J2534-style operation name used in errors and logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Identify => "Identify",
            Self::PassThruOpen => "PassThruOpen",
            Self::PassThruClose => "PassThruClose",
            Self::ReadMsgs => "PassThruReadMsgs",
            Self::WriteMsgs => "PassThruWriteMsgs",
            Self::StartMsgFilter => "PassThruStartMsgFilter",
            Self::StopMsgFilter => "PassThruStopMsgFilter",
            Self::SetProgrammingVoltage => "PassThruSetProgrammingVoltage",
            Self::Connect => "PassThruConnect",
            Self::Disconnect => "PassThruDisconnect",
            Self::Ioctl => "PassThruIoctl",
            Self::ReadVersion => "PassThruReadVersion",
            Self::GetFirmwareVersion => "GetFirmwareVersion",
        }
    }
}

/// One decoded frame
///
/// In requests `command`/`parameter` select the operation; in responses
/// `command` carries the J2534 status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutelPacket {
    pub session_id: u32,
    pub counter: u32,
    pub flags: u32,
    pub command: u32,
    pub parameter: u32,
    pub payload: Vec<u8>,
}

impl AutelPacket {
    pub fn request(session_id: u32, counter: u32, command: AutelCommand, payload: Vec<u8>) -> Self {
        let (command, parameter) = command.code();
        Self {
            session_id,
            counter,
            flags: DEFAULT_FLAGS,
            command,
            parameter,
            payload,
        }
    }

    /// Build the response to `request` with the given status
    pub fn response_to(request: &AutelPacket, status: u32, payload: Vec<u8>) -> Self {
        Self {
            session_id: request.session_id,
            counter: request.counter,
            flags: DEFAULT_FLAGS,
            command: status,
            parameter: request.parameter,
            payload,
        }
    }

    pub fn status(&self) -> u32 {
        self.command
    }

    /// Value of the `total length` header field
    pub fn total_len(&self) -> u32 {
        (HEADER_LEN - MAGIC.len() + self.payload.len() + CRC_LEN) as u32
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.total_len());
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.counter);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.command);
        buf.put_u32_le(self.parameter);
        buf.put_slice(&self.payload);
        let crc = CRC32.checksum(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    /// Decode one complete frame starting at the magic
    fn decode_frame(frame: &[u8], verify_crc: bool) -> Result<Self, &'static str> {
        if frame.len() < HEADER_LEN + CRC_LEN {
            return Err("frame shorter than header");
        }
        let body_end = frame.len() - CRC_LEN;
        if verify_crc {
            let mut trailer = &frame[body_end..];
            let expected = trailer.get_u32_le();
            if CRC32.checksum(&frame[..body_end]) != expected {
                return Err("CRC mismatch");
            }
        }

        let mut header = &frame[MAGIC.len() + 4..HEADER_LEN];
        let session_id = header.get_u32_le();
        let counter = header.get_u32_le();
        let payload_len = header.get_u32_le() as usize;
        let session_repeat = header.get_u32_le();
        let flags = header.get_u32_le();
        let command = header.get_u32_le();
        let parameter = header.get_u32_le();

        if session_repeat != session_id {
            return Err("session id fields disagree");
        }
        let payload = frame[HEADER_LEN..body_end].to_vec();
        if payload.len() != payload_len {
            debug!(
                declared = payload_len,
                actual = payload.len(),
                "Payload length field disagrees with frame length"
            );
        }

        Ok(Self {
            session_id,
            counter,
            flags,
            command,
            parameter,
            payload,
        })
    }
}

/// Allocates session ids and message counters for outgoing requests
#[derive(Debug)]
pub struct PacketBuilder {
    next_session: AtomicU32,
    counter: AtomicU32,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU32::new(1),
            counter: AtomicU32::new(0),
        }
    }

    /// Next session id; monotonically increasing, never zero
    pub fn new_session(&self) -> u32 {
        loop {
            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Build a request with a fresh session id
    pub fn build(&self, command: AutelCommand, payload: Vec<u8>) -> AutelPacket {
        let session_id = self.new_session();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        AutelPacket::request(session_id, counter, command, payload)
    }
}

/// Reassembles frames from an unreliable byte stream
///
/// Bytes before the next magic marker are discarded. A frame whose
/// declared length is not yet fully buffered is left untouched until more
/// bytes arrive.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    verify_crc: bool,
    resync_window: usize,
    discarded: usize,
}

impl FrameParser {
    pub fn new(verify_crc: bool, resync_window: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            verify_crc,
            resync_window: resync_window.max(MAGIC.len()),
            discarded: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes thrown away while resynchronising
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn discard(&mut self, count: usize) {
        self.buf.advance(count);
        self.discarded += count;
    }

    /// Extract the next complete frame, or `None` if more bytes are needed
    pub fn next_packet(&mut self) -> Option<AutelPacket> {
        loop {
            if !self.buf.starts_with(&MAGIC) {
                let limit = self.buf.len().min(self.resync_window);
                match self.buf[..limit]
                    .windows(MAGIC.len())
                    .position(|w| w == MAGIC)
                {
                    Some(pos) => {
                        debug!(skipped = pos, "Discarding bytes before frame marker");
                        self.discard(pos);
                    }
                    None => {
                        // Keep a tail that could be the start of a split marker
                        let drop = limit.saturating_sub(MAGIC.len() - 1);
                        if drop == 0 {
                            return None;
                        }
                        debug!(skipped = drop, "No frame marker in lookahead window");
                        self.discard(drop);
                        continue;
                    }
                }
            }

            if self.buf.len() < MAGIC.len() + 4 {
                return None;
            }
            let total_len = (&self.buf[MAGIC.len()..MAGIC.len() + 4]).get_u32_le();
            if total_len > MAX_TOTAL_LEN {
                warn!(total_len, "Implausible frame length, resynchronising");
                self.discard(1);
                continue;
            }

            // A real header repeats its session id; anything else is a stray marker
            if self.buf.len() >= SESSION_REPEAT_END {
                let mut words = &self.buf[MAGIC.len() + 4..SESSION_REPEAT_END];
                let session_id = words.get_u32_le();
                words.advance(8);
                if words.get_u32_le() != session_id {
                    debug!(total_len, "Session id fields disagree, resynchronising");
                    self.discard(1);
                    continue;
                }
            }

            let frame_len = MAGIC.len() + total_len as usize;
            if self.buf.len() < frame_len {
                return None;
            }

            if total_len < MIN_TOTAL_LEN {
                warn!(total_len, "Frame too short for header, resynchronising");
                self.discard(1);
                continue;
            }

            let frame = self.buf.split_to(frame_len);
            match AutelPacket::decode_frame(&frame, self.verify_crc) {
                Ok(packet) => return Some(packet),
                Err(reason) => {
                    warn!(reason, bytes = frame_len, "Dropping malformed frame");
                    self.discarded += frame_len;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(session_id: u32) -> AutelPacket {
        AutelPacket::request(session_id, 7, AutelCommand::ReadMsgs, vec![1, 2, 3, 4, 5])
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample(0x11223344).encode();
        assert_eq!(&bytes[..4], &MAGIC);
        assert_eq!(&bytes[4..8], &(32u32 + 5 + 4).to_le_bytes());
        assert_eq!(&bytes[8..12], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[16..20], &5u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &bytes[8..12]);
        assert_eq!(&bytes[24..28], &[0xFF; 4]);
        assert_eq!(&bytes[28..32], &2u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &1u32.to_le_bytes());
        assert_eq!(&bytes[36..41], &[1, 2, 3, 4, 5]);
        assert_eq!(bytes.len(), 45);
    }

    #[test]
    fn test_parse_after_garbage() {
        let packet = sample(9);
        let mut parser = FrameParser::new(true, 4096);
        parser.push(&[0x00, 0x13, 0x37]);
        parser.push(&packet.encode());

        assert_eq!(parser.next_packet(), Some(packet));
        assert_eq!(parser.discarded(), 3);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_waits_for_declared_length() {
        let mut parser = FrameParser::new(true, 4096);
        parser.push(b"noise");
        parser.push(&MAGIC);
        parser.push(&20u32.to_le_bytes());
        parser.push(&[0xAB; 6]);

        assert_eq!(parser.next_packet(), None);
        // Garbage gone, partial frame (4 magic + 10 following bytes) kept intact
        assert_eq!(parser.buffered(), 14);
        assert_eq!(parser.discarded(), 5);

        parser.push(&[0xAB; 9]);
        assert_eq!(parser.next_packet(), None);
        assert_eq!(parser.buffered(), 23);
    }

    #[test]
    fn test_stray_marker_does_not_stall_next_frame() {
        let packet = sample(5);
        let mut parser = FrameParser::new(true, 4096);
        // Marker and a plausible length, but the session words disagree
        parser.push(&MAGIC);
        parser.push(&60_000u32.to_le_bytes());
        parser.push(&[0x01; 4]);
        parser.push(&[0x00; 8]);
        parser.push(&[0x02; 4]);
        parser.push(&packet.encode());

        assert_eq!(parser.next_packet(), Some(packet));
        assert_eq!(parser.discarded(), 24);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_split_delivery() {
        let packet = sample(3);
        let bytes = packet.encode();
        let mut parser = FrameParser::new(true, 4096);

        for chunk in bytes.chunks(7) {
            assert_eq!(parser.next_packet(), None);
            parser.push(chunk);
        }
        assert_eq!(parser.next_packet(), Some(packet));
    }

    #[test]
    fn test_crc_mismatch_dropped() {
        let mut bad = sample(1).encode();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = sample(2);

        let mut parser = FrameParser::new(true, 4096);
        parser.push(&bad);
        parser.push(&good.encode());
        assert_eq!(parser.next_packet(), Some(good));

        let mut lenient = FrameParser::new(false, 4096);
        lenient.push(&bad);
        assert_eq!(lenient.next_packet().map(|p| p.session_id), Some(1));
    }

    #[test]
    fn test_marker_split_across_pushes() {
        let packet = sample(5);
        let bytes = packet.encode();
        let mut parser = FrameParser::new(true, 16);
        parser.push(&[0xEE; 40]);
        parser.push(&bytes[..2]);
        assert_eq!(parser.next_packet(), None);
        parser.push(&bytes[2..]);
        assert_eq!(parser.next_packet(), Some(packet));
    }

    #[test]
    fn test_session_ids_monotonic() {
        let builder = PacketBuilder::new();
        let a = builder.build(AutelCommand::Identify, Vec::new());
        let b = builder.build(AutelCommand::Identify, Vec::new());
        assert!(b.session_id > a.session_id);
        assert_ne!(a.session_id, 0);
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn test_command_table() {
        for command in AutelCommand::ALL {
            let (cmd, param) = command.code();
            assert_eq!(AutelCommand::from_code(cmd, param), Some(command));
        }
        assert_eq!(AutelCommand::Disconnect.code(), (0x05, 0x8000_0001));
        assert_eq!(AutelCommand::from_code(0x7F, 0x7F), None);
    }
}
