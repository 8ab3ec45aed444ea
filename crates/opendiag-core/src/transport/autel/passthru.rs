//! J2534 Pass-Thru message model carried inside Autel frames
//!
//! Request and response payloads are sequences of little-endian `u32`
//! words followed by optional variable data. Messages are encoded as
//! `protocol_id, rx_status, tx_flags, timestamp, data_size,
//! extra_data_index, data[data_size]`.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::transport::TransportError;

pub const PROTOCOL_CAN: u32 = 5;
pub const PROTOCOL_ISO15765: u32 = 6;

pub const FILTER_PASS: u32 = 1;
pub const FILTER_BLOCK: u32 = 2;
pub const FILTER_FLOW_CONTROL: u32 = 3;

/// Connect and tx flags
pub const CAN_29BIT_ID: u32 = 0x0100;
pub const ISO15765_FRAME_PAD: u32 = 0x0040;

/// Rx status bits
pub const TX_MSG_TYPE: u32 = 0x0001;
pub const START_OF_MESSAGE: u32 = 0x0002;
pub const TX_INDICATION: u32 = 0x0008;

/// Ioctl ids
pub const IOCTL_GET_CONFIG: u32 = 0x01;
pub const IOCTL_SET_CONFIG: u32 = 0x02;
pub const IOCTL_READ_VBATT: u32 = 0x03;
pub const IOCTL_CLEAR_TX_BUFFER: u32 = 0x07;
pub const IOCTL_CLEAR_RX_BUFFER: u32 = 0x08;

/// J2534 status codes other than `STATUS_NOERROR`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PassThruError {
    #[error("option not supported")]
    NotSupported,
    #[error("invalid channel id")]
    InvalidChannelId,
    #[error("invalid protocol id")]
    InvalidProtocolId,
    #[error("NULL was incorrectly passed as a parameter")]
    NullParameter,
    #[error("invalid ioctl parameter")]
    InvalidIoctlValue,
    #[error("invalid flags")]
    InvalidFlags,
    #[error("unspecified error")]
    Failed,
    #[error("device not connected")]
    DeviceNotConnected,
    #[error("timed out")]
    Timeout,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid time interval")]
    InvalidTimeInterval,
    #[error("exceeded message limit")]
    ExceededLimit,
    #[error("invalid message id")]
    InvalidMessageId,
    #[error("device in use")]
    DeviceInUse,
    #[error("invalid ioctl id")]
    InvalidIoctlId,
    #[error("no messages available")]
    BufferEmpty,
    #[error("transmit queue full")]
    BufferFull,
    #[error("receive buffer overflowed")]
    BufferOverflow,
    #[error("unknown pin number or resource in use")]
    PinInvalid,
    #[error("channel already in use")]
    ChannelInUse,
    #[error("message protocol does not match channel protocol")]
    MessageProtocolId,
    #[error("invalid filter id")]
    InvalidFilterId,
    #[error("no flow control filter matches outgoing message")]
    NoFlowControl,
    #[error("filter already exists")]
    NotUnique,
    #[error("unsupported baud rate")]
    InvalidBaudrate,
    #[error("invalid device id")]
    InvalidDeviceId,
    #[error("unknown status code 0x{0:02X}")]
    Unknown(u32),
}

impl PassThruError {
    /// Map a status word; `None` for success
    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            0x00 => return None,
            0x01 => Self::NotSupported,
            0x02 => Self::InvalidChannelId,
            0x03 => Self::InvalidProtocolId,
            0x04 => Self::NullParameter,
            0x05 => Self::InvalidIoctlValue,
            0x06 => Self::InvalidFlags,
            0x07 => Self::Failed,
            0x08 => Self::DeviceNotConnected,
            0x09 => Self::Timeout,
            0x0A => Self::InvalidMessage,
            0x0B => Self::InvalidTimeInterval,
            0x0C => Self::ExceededLimit,
            0x0D => Self::InvalidMessageId,
            0x0E => Self::DeviceInUse,
            0x0F => Self::InvalidIoctlId,
            0x10 => Self::BufferEmpty,
            0x11 => Self::BufferFull,
            0x12 => Self::BufferOverflow,
            0x13 => Self::PinInvalid,
            0x14 => Self::ChannelInUse,
            0x15 => Self::MessageProtocolId,
            0x16 => Self::InvalidFilterId,
            0x17 => Self::NoFlowControl,
            0x18 => Self::NotUnique,
            0x19 => Self::InvalidBaudrate,
            0x1A => Self::InvalidDeviceId,
            other => Self::Unknown(other),
        };
        Some(err)
    }

    pub fn code(self) -> u32 {
        match self {
            Self::NotSupported => 0x01,
            Self::InvalidChannelId => 0x02,
            Self::InvalidProtocolId => 0x03,
            Self::NullParameter => 0x04,
            Self::InvalidIoctlValue => 0x05,
            Self::InvalidFlags => 0x06,
            Self::Failed => 0x07,
            Self::DeviceNotConnected => 0x08,
            Self::Timeout => 0x09,
            Self::InvalidMessage => 0x0A,
            Self::InvalidTimeInterval => 0x0B,
            Self::ExceededLimit => 0x0C,
            Self::InvalidMessageId => 0x0D,
            Self::DeviceInUse => 0x0E,
            Self::InvalidIoctlId => 0x0F,
            Self::BufferEmpty => 0x10,
            Self::BufferFull => 0x11,
            Self::BufferOverflow => 0x12,
            Self::PinInvalid => 0x13,
            Self::ChannelInUse => 0x14,
            Self::MessageProtocolId => 0x15,
            Self::InvalidFilterId => 0x16,
            Self::NoFlowControl => 0x17,
            Self::NotUnique => 0x18,
            Self::InvalidBaudrate => 0x19,
            Self::InvalidDeviceId => 0x1A,
            Self::Unknown(code) => code,
        }
    }
}

/// A Pass-Thru message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThruMsg {
    pub protocol_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub extra_data_index: u32,
    pub data: Vec<u8>,
}

impl PassThruMsg {
    /// Encoded size of a message with no data bytes
    pub const HEADER_LEN: usize = 24;

    /// ISO 15765 message: 4-byte big-endian CAN id followed by the payload
    pub fn iso15765(can_id: u32, payload: &[u8], tx_flags: u32) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self {
            protocol_id: PROTOCOL_ISO15765,
            rx_status: 0,
            tx_flags,
            timestamp: 0,
            extra_data_index: data.len() as u32,
            data,
        }
    }

    pub fn can_id(&self) -> Option<u32> {
        let id = self.data.get(..4)?;
        Some(u32::from_be_bytes([id[0], id[1], id[2], id[3]]))
    }

    /// Bytes after the CAN id
    pub fn payload(&self) -> &[u8] {
        self.data.get(4..).unwrap_or(&[])
    }

    /// Loopback copy of something we transmitted
    pub fn is_tx_echo(&self) -> bool {
        self.rx_status & TX_MSG_TYPE != 0
    }

    /// First-frame or transmit-done indication carrying no complete payload
    pub fn is_indication(&self) -> bool {
        self.rx_status & (START_OF_MESSAGE | TX_INDICATION) != 0
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.protocol_id);
        buf.put_u32_le(self.rx_status);
        buf.put_u32_le(self.tx_flags);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u32_le(self.extra_data_index);
        buf.put_slice(&self.data);
    }

    pub fn decode_from(buf: &mut &[u8]) -> Result<Self, TransportError> {
        let mut reader = PayloadReader::new(*buf);
        let protocol_id = reader.u32("protocol_id")?;
        let rx_status = reader.u32("rx_status")?;
        let tx_flags = reader.u32("tx_flags")?;
        let timestamp = reader.u32("timestamp")?;
        let data_size = reader.u32("data_size")? as usize;
        let extra_data_index = reader.u32("extra_data_index")?;
        let data = reader.bytes("data", data_size)?.to_vec();
        *buf = reader.rest();
        Ok(Self {
            protocol_id,
            rx_status,
            tx_flags,
            timestamp,
            extra_data_index,
            data,
        })
    }
}

/// Little-endian word writer for request payloads
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    pub fn msg(mut self, msg: &PassThruMsg) -> Self {
        msg.encode_into(&mut self.buf);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Bounds-checked reader for response payloads
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn u32(&mut self, field: &str) -> Result<u32, TransportError> {
        if self.buf.remaining() < 4 {
            return Err(TransportError::Protocol(format!(
                "payload truncated reading {}",
                field
            )));
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn bytes(&mut self, field: &str, len: usize) -> Result<&'a [u8], TransportError> {
        if self.buf.len() < len {
            return Err(TransportError::Protocol(format!(
                "payload truncated reading {} ({} of {} bytes)",
                field,
                self.buf.len(),
                len
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn msg(&mut self) -> Result<PassThruMsg, TransportError> {
        let mut rest = self.buf;
        let msg = PassThruMsg::decode_from(&mut rest)?;
        self.buf = rest;
        Ok(msg)
    }

    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

/// Split NUL-separated ASCII fields, dropping empty ones
pub fn ascii_fields(payload: &[u8]) -> Vec<String> {
    payload
        .split(|&b| b == 0)
        .filter(|field| !field.is_empty())
        .map(|field| String::from_utf8_lossy(field).trim().to_string())
        .filter(|field| !field.is_empty())
        .collect()
}

/// Version strings returned by `PassThruReadVersion`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub firmware_version: String,
    pub dll_version: String,
    pub api_version: String,
}

impl VersionInfo {
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut fields = ascii_fields(payload).into_iter();
        Self {
            firmware_version: fields.next().unwrap_or_default(),
            dll_version: fields.next().unwrap_or_default(),
            api_version: fields.next().unwrap_or_default(),
        }
    }
}
