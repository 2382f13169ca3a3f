//! Frame construction and address encoding.
//!
//! A forward frame is an address byte followed by an opcode (or DAPC level)
//! byte. The address byte packs the addressing mode and a selector bit:
//!
//! | target      | command           | DAPC            |
//! |-------------|-------------------|-----------------|
//! | short `a`   | `(a << 1) \| 1`   | `a << 1`        |
//! | group `g`   | `0x80 \| (g << 1) \| 1` | `0x80 \| (g << 1)` |
//! | broadcast   | `0xFF`            | `0xFE`          |
//!
//! Special commands carry a reserved opcode in the address byte and their
//! argument in the second byte.

use serde::{Deserialize, Serialize};

pub const MAX_SHORT_ADDRESS: u8 = 63;
pub const MAX_GROUP: u8 = 15;

const GROUP_FLAG: u8 = 0x80;
const SELECTOR_BIT: u8 = 0x01;
const BROADCAST_DAPC: u8 = 0xFE;
const BROADCAST_COMMAND: u8 = 0xFF;

/// Standard gear command opcodes (second byte of a forward frame with the
/// selector bit set).
pub mod opcode {
    pub const OFF: u8 = 0x00;
    pub const UP: u8 = 0x01;
    pub const DOWN: u8 = 0x02;
    pub const STEP_UP: u8 = 0x03;
    pub const STEP_DOWN: u8 = 0x04;
    pub const RECALL_MAX_LEVEL: u8 = 0x05;
    pub const RECALL_MIN_LEVEL: u8 = 0x06;
    pub const GO_TO_SCENE: u8 = 0x10;
    pub const RESET: u8 = 0x20;
    pub const STORE_ACTUAL_LEVEL_IN_DTR0: u8 = 0x21;
    pub const ADD_TO_GROUP: u8 = 0x60;
    pub const REMOVE_FROM_GROUP: u8 = 0x70;
    pub const STORE_SHORT_ADDRESS: u8 = 0x80;
    pub const QUERY_STATUS: u8 = 0x90;
    pub const QUERY_CONTROL_GEAR: u8 = 0x91;
    pub const QUERY_LAMP_FAILURE: u8 = 0x92;
    pub const QUERY_LAMP_POWER_ON: u8 = 0x93;
    pub const QUERY_ACTUAL_LEVEL: u8 = 0xA0;
    pub const QUERY_MAX_LEVEL: u8 = 0xA1;
    pub const QUERY_MIN_LEVEL: u8 = 0xA2;
    pub const QUERY_GROUPS_0_7: u8 = 0xC0;
    pub const QUERY_GROUPS_8_15: u8 = 0xC1;

    /// Configuration commands only take effect when received twice within
    /// 100 ms.
    pub fn is_config_command(op: u8) -> bool {
        (RESET..=STORE_SHORT_ADDRESS).contains(&op)
    }

    pub fn is_query(op: u8) -> bool {
        (QUERY_STATUS..=0xC5).contains(&op)
    }
}

/// Reserved address-byte opcodes for special commands.
pub mod special {
    pub const TERMINATE: u8 = 0xA1;
    pub const DTR0: u8 = 0xA3;
    pub const INITIALISE: u8 = 0xA5;
    pub const RANDOMISE: u8 = 0xA7;
    pub const COMPARE: u8 = 0xA9;
    pub const WITHDRAW: u8 = 0xAB;
    pub const PING: u8 = 0xAF;
    pub const SEARCH_ADDR_H: u8 = 0xB1;
    pub const SEARCH_ADDR_M: u8 = 0xB3;
    pub const SEARCH_ADDR_L: u8 = 0xB5;
    pub const PROGRAM_SHORT_ADDRESS: u8 = 0xB7;
    pub const VERIFY_SHORT_ADDRESS: u8 = 0xB9;
    pub const QUERY_SHORT_ADDRESS: u8 = 0xBB;
    pub const PHYSICAL_SELECTION: u8 = 0xBD;
    pub const ENABLE_DEVICE_TYPE: u8 = 0xC1;
    pub const DTR1: u8 = 0xC3;
    pub const DTR2: u8 = 0xC5;
    pub const WRITE_MEMORY_LOCATION: u8 = 0xC7;
    pub const WRITE_MEMORY_LOCATION_NO_REPLY: u8 = 0xC9;

    pub fn is_special(op: u8) -> bool {
        (TERMINATE..=WRITE_MEMORY_LOCATION_NO_REPLY).contains(&op) && op & 0x01 == 1
    }

    /// INITIALISE and RANDOMISE must be sent twice to take effect.
    pub fn requires_repeat(op: u8) -> bool {
        matches!(op, INITIALISE | RANDOMISE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Short,
    Group,
    Broadcast,
    Special,
}

impl core::fmt::Display for AddressType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AddressType::Short => write!(f, "short"),
            AddressType::Group => write!(f, "group"),
            AddressType::Broadcast => write!(f, "broadcast"),
            AddressType::Special => write!(f, "special"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameLength {
    /// Gear reply.
    Backward8,
    /// Controller to gear.
    Forward16,
    /// Controller to control device.
    Forward24,
}

impl FrameLength {
    pub const fn bits(self) -> u8 {
        match self {
            FrameLength::Backward8 => 8,
            FrameLength::Forward16 => 16,
            FrameLength::Forward24 => 24,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(FrameLength::Backward8),
            16 => Some(FrameLength::Forward16),
            24 => Some(FrameLength::Forward24),
            _ => None,
        }
    }

    const fn mask(self) -> u32 {
        (1u32 << self.bits()) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("short address {0} out of range (0..=63)")]
    ShortOutOfRange(u8),
    #[error("group {0} out of range (0..=15)")]
    GroupOutOfRange(u8),
    #[error("opcode 0x{0:02X} is not a special command")]
    NotSpecial(u8),
}

/// Selector bit of the address byte: cleared for direct arc power control,
/// set for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Dapc,
    Command,
}

/// Build the first byte of a forward frame.
///
/// For [`AddressType::Special`] the `address` is the reserved opcode itself
/// and the selector is ignored.
pub fn address_byte(
    address_type: AddressType,
    address: u8,
    selector: Selector,
) -> Result<u8, AddressError> {
    let selector_bit = match selector {
        Selector::Dapc => 0,
        Selector::Command => SELECTOR_BIT,
    };
    match address_type {
        AddressType::Short => {
            if address > MAX_SHORT_ADDRESS {
                return Err(AddressError::ShortOutOfRange(address));
            }
            Ok((address << 1) | selector_bit)
        }
        AddressType::Group => {
            if address > MAX_GROUP {
                return Err(AddressError::GroupOutOfRange(address));
            }
            Ok(GROUP_FLAG | (address << 1) | selector_bit)
        }
        AddressType::Broadcast => Ok(match selector {
            Selector::Dapc => BROADCAST_DAPC,
            Selector::Command => BROADCAST_COMMAND,
        }),
        AddressType::Special => {
            if !special::is_special(address) {
                return Err(AddressError::NotSpecial(address));
            }
            Ok(address)
        }
    }
}

/// An immutable logical frame. Data is right-aligned and sent MSB first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    data: u32,
    length: FrameLength,
}

impl Frame {
    /// Bits of `data` above `length` are discarded.
    pub fn new(data: u32, length: FrameLength) -> Self {
        Self {
            data: data & length.mask(),
            length,
        }
    }

    pub fn backward(reply: u8) -> Self {
        Self::new(u32::from(reply), FrameLength::Backward8)
    }

    pub fn forward(address_byte: u8, second: u8) -> Self {
        Self::new(
            (u32::from(address_byte) << 8) | u32::from(second),
            FrameLength::Forward16,
        )
    }

    /// Standard command to a short address, group or broadcast.
    pub fn command(
        address_type: AddressType,
        address: u8,
        command: u8,
    ) -> Result<Self, AddressError> {
        if address_type == AddressType::Special {
            // Special frames put the opcode first; `address` is the argument.
            return Self::special(command, address);
        }
        let addr = address_byte(address_type, address, Selector::Command)?;
        Ok(Self::forward(addr, command))
    }

    /// Direct arc power control: the second byte is the level.
    pub fn dapc(address_type: AddressType, address: u8, level: u8) -> Result<Self, AddressError> {
        let addr = address_byte(address_type, address, Selector::Dapc)?;
        Ok(Self::forward(addr, level))
    }

    pub fn special(opcode: u8, data: u8) -> Result<Self, AddressError> {
        let addr = address_byte(AddressType::Special, opcode, Selector::Command)?;
        Ok(Self::forward(addr, data))
    }

    /// 24-bit control device frame: address, instance, opcode.
    pub fn device_command(address: u8, instance: u8, opcode: u8) -> Self {
        Self::new(
            (u32::from(address) << 16) | (u32::from(instance) << 8) | u32::from(opcode),
            FrameLength::Forward24,
        )
    }

    pub fn data(&self) -> u32 {
        self.data
    }

    pub fn length(&self) -> FrameLength {
        self.length
    }

    pub fn bit_length(&self) -> u8 {
        self.length.bits()
    }

    /// Address byte and second byte of a 16-bit forward frame.
    pub fn forward_bytes(&self) -> Option<(u8, u8)> {
        match self.length {
            FrameLength::Forward16 => Some(((self.data >> 8) as u8, self.data as u8)),
            _ => None,
        }
    }
}

impl core::fmt::Display for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.length {
            FrameLength::Backward8 => write!(f, "{:02X}", self.data),
            FrameLength::Forward16 => write!(f, "{:04X}", self.data),
            FrameLength::Forward24 => write!(f, "{:06X}", self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_address_bytes() {
        assert_eq!(address_byte(AddressType::Short, 5, Selector::Command), Ok(0x0B));
        assert_eq!(address_byte(AddressType::Short, 5, Selector::Dapc), Ok(0x0A));
        assert_eq!(address_byte(AddressType::Short, 63, Selector::Command), Ok(0x7F));
        assert_eq!(
            address_byte(AddressType::Short, 64, Selector::Command),
            Err(AddressError::ShortOutOfRange(64))
        );
    }

    #[test]
    fn test_group_and_broadcast_bytes() {
        assert_eq!(address_byte(AddressType::Group, 0, Selector::Command), Ok(0x81));
        assert_eq!(address_byte(AddressType::Group, 15, Selector::Command), Ok(0x9F));
        assert_eq!(address_byte(AddressType::Group, 3, Selector::Dapc), Ok(0x86));
        assert!(address_byte(AddressType::Group, 16, Selector::Command).is_err());
        assert_eq!(address_byte(AddressType::Broadcast, 0, Selector::Command), Ok(0xFF));
        assert_eq!(address_byte(AddressType::Broadcast, 0, Selector::Dapc), Ok(0xFE));
    }

    #[test]
    fn test_special_frame_layout() {
        let frame = Frame::special(special::DTR0, 0x42).unwrap();
        assert_eq!(frame.forward_bytes(), Some((0xA3, 0x42)));

        // Routed through `command`, the address is the data byte
        let frame = Frame::command(AddressType::Special, 0x10, special::TERMINATE).unwrap();
        assert_eq!(frame.data(), 0xA110);

        assert_eq!(Frame::special(0xA2, 0), Err(AddressError::NotSpecial(0xA2)));
    }

    #[test]
    fn test_frame_masks_data_to_length() {
        let frame = Frame::new(0x1_2345, FrameLength::Forward16);
        assert_eq!(frame.data(), 0x2345);
        assert_eq!(frame.bit_length(), 16);

        let frame = Frame::device_command(0xFE, 0x01, 0x30);
        assert_eq!(frame.data(), 0xFE0130);
        assert_eq!(frame.forward_bytes(), None);
        assert_eq!(frame.to_string(), "FE0130");
    }

    #[test]
    fn test_command_classification() {
        assert!(opcode::is_config_command(opcode::ADD_TO_GROUP + 3));
        assert!(!opcode::is_config_command(opcode::RECALL_MAX_LEVEL));
        assert!(opcode::is_query(opcode::QUERY_ACTUAL_LEVEL));
        assert!(special::requires_repeat(special::INITIALISE));
        assert!(!special::requires_repeat(special::DTR0));
    }
}
