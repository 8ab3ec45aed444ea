//! CAN identifier derivation for ISO 15765 exchanges through the VCI

use super::passthru::{PassThruMsg, CAN_29BIT_ID, ISO15765_FRAME_PAD};

/// OBD functional broadcast request id (11-bit)
pub const FUNCTIONAL_11BIT: u32 = 0x7DF;

/// OBD functional broadcast request id (29-bit)
pub const FUNCTIONAL_29BIT: u32 = 0x18DB_33F1;

/// Tester source address used on 29-bit physical addressing
pub const TESTER_ADDRESS: u32 = 0xF1;

const MASK_11BIT: u32 = 0x7FF;
const MASK_29BIT: u32 = 0x1FFF_FFFF;

/// Request/response identifiers for one target module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanAddressing {
    pub tx_id: u32,
    pub rx_id: u32,
    pub rx_mask: u32,
    pub extended: bool,
}

impl CanAddressing {
    /// Derive identifiers from a module address
    ///
    /// - `0x7DF` functional broadcast answers on `0x7E8`
    /// - `0x7E0..=0x7E7` and `0x7C0..=0x7C7` answer on `+0x08`
    /// - `0x700..=0x77F` answer on `+0x08` when the low nibble is below 8, `+0x10` otherwise
    /// - `0x18DA<ta><sa>` answers on `0x18DA<sa><ta>`
    /// - `0x18DB33F1` answers on any `0x18DAF1xx`
    /// - any other 29-bit value is read as a target address in its low byte
    /// - any other 11-bit value answers on `+0x08`
    pub fn for_module(address: u32) -> Self {
        if address == FUNCTIONAL_11BIT {
            return Self::standard(address, 0x7E8);
        }
        if address == FUNCTIONAL_29BIT {
            return Self {
                tx_id: address,
                rx_id: 0x18DA_0000 | (TESTER_ADDRESS << 8),
                rx_mask: 0x1FFF_FF00,
                extended: true,
            };
        }
        if address > MASK_11BIT {
            if address & 0x1FFF_0000 == 0x18DA_0000 {
                let target = (address >> 8) & 0xFF;
                let source = address & 0xFF;
                return Self::extended(address, 0x18DA_0000 | (source << 8) | target);
            }
            let target = address & 0xFF;
            return Self::extended(
                0x18DA_0000 | (target << 8) | TESTER_ADDRESS,
                0x18DA_0000 | (TESTER_ADDRESS << 8) | target,
            );
        }

        let rx_id = match address {
            0x7E0..=0x7E7 | 0x7C0..=0x7C7 => address + 0x08,
            0x700..=0x77F if address & 0x0F < 0x08 => address + 0x08,
            0x700..=0x77F => address + 0x10,
            _ => address + 0x08,
        };
        Self::standard(address, rx_id)
    }

    fn standard(tx_id: u32, rx_id: u32) -> Self {
        Self {
            tx_id,
            rx_id,
            rx_mask: MASK_11BIT,
            extended: false,
        }
    }

    fn extended(tx_id: u32, rx_id: u32) -> Self {
        Self {
            tx_id,
            rx_id,
            rx_mask: MASK_29BIT,
            extended: true,
        }
    }

    /// Flags for `PassThruConnect` and outgoing messages
    pub fn connect_flags(&self) -> u32 {
        if self.extended {
            CAN_29BIT_ID
        } else {
            0
        }
    }

    pub fn tx_flags(&self) -> u32 {
        self.connect_flags() | ISO15765_FRAME_PAD
    }

    /// Mask, pattern and flow-control messages for a flow-control filter
    pub fn flow_control_filter(&self) -> (PassThruMsg, PassThruMsg, PassThruMsg) {
        let flags = self.tx_flags();
        (
            PassThruMsg::iso15765(self.rx_mask, &[], flags),
            PassThruMsg::iso15765(self.rx_id, &[], flags),
            PassThruMsg::iso15765(self.tx_id, &[], flags),
        )
    }

    /// True if a received id belongs to this exchange
    pub fn matches_rx(&self, can_id: u32) -> bool {
        can_id & self.rx_mask == self.rx_id & self.rx_mask
    }
}
