use crate::constants::{BROADCAST_ADDRESS, COMMAND_WORD_SIZE, WIDE_COMMAND_SIZE};
use crate::error::BusError;
use crate::hamming;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

/// Payload of the first command word, before Hamming encoding.
///
/// Only the low 11 bits survive the codec, so the address takes a full byte
/// (broadcast is 0xAA) and the opcode the next three bits.
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWord {
    pub address: u8,
    pub opcode: B3,
    #[skip]
    unused: B5,
}

impl CommandWord {
    pub fn to_u16(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }

    pub fn from_u16(value: u16) -> Self {
        CommandWord::from_bytes(value.to_le_bytes())
    }
}

/// Command opcodes. The numbering is fixed by deployed module firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    #[strum(to_string = "GETDATA")]
    GetData = 0x0,
    #[strum(to_string = "SETADDR")]
    SetAddress = 0x1,
    #[strum(to_string = "SHUNTON")]
    ShuntOn = 0x2,
    #[strum(to_string = "VERSION")]
    Version = 0x3,
    #[strum(to_string = "ADDRMODE")]
    AddressMode = 0x5,
    #[strum(to_string = "BREAK")]
    Break = 0x6,
    #[strum(to_string = "BOOT")]
    Boot = 0x7,
}

impl Opcode {
    /// Opcodes whose argument travels in a second Hamming word
    pub fn is_wide(&self) -> bool {
        matches!(self, Opcode::ShuntOn)
    }
}

/// A decoded bus command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub address: u8,
    pub opcode: Opcode,
    /// 11-bit argument, present only for wide opcodes
    pub argument: Option<u16>,
}

impl Command {
    pub fn new(address: u8, opcode: Opcode) -> Self {
        Self {
            address,
            opcode,
            argument: None,
        }
    }

    pub fn get_data(address: u8) -> Self {
        Self::new(address, Opcode::GetData)
    }

    /// Offers address `slot` to the next unaddressed module
    pub fn set_address(slot: u8) -> Self {
        Self::new(slot, Opcode::SetAddress)
    }

    pub fn shunt_on(address: u8, mask: u16) -> Self {
        Self {
            address,
            opcode: Opcode::ShuntOn,
            argument: Some(mask & 0x7FF),
        }
    }

    pub fn version(address: u8) -> Self {
        Self::new(address, Opcode::Version)
    }

    pub fn address_mode() -> Self {
        Self::new(BROADCAST_ADDRESS, Opcode::AddressMode)
    }

    pub fn send_break() -> Self {
        Self::new(BROADCAST_ADDRESS, Opcode::Break)
    }

    pub fn boot() -> Self {
        Self::new(BROADCAST_ADDRESS, Opcode::Boot)
    }

    pub fn is_broadcast(&self) -> bool {
        self.address == BROADCAST_ADDRESS
    }

    /// Hamming-encoded first word
    pub fn encoded_word(&self) -> u16 {
        let word = CommandWord::new()
            .with_address(self.address)
            .with_opcode(self.opcode.into());
        hamming::encode(word.to_u16())
    }

    /// Wire bytes: one or two little-endian Hamming words
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(WIDE_COMMAND_SIZE);
        buf.put_u16_le(self.encoded_word());
        if let Some(arg) = self.argument {
            buf.put_u16_le(hamming::encode(arg));
        }
        buf.freeze()
    }

    /// Decodes only the first word of a frame.
    pub fn decode_word(code: u16) -> Result<Self, BusError> {
        let word = CommandWord::from_u16(hamming::decode(code)?);
        let opcode = Opcode::try_from(word.opcode()).map_err(|e| BusError::UnknownOpcode(e.number))?;
        Ok(Self::new(word.address(), opcode))
    }

    /// Decodes a 2 or 4 byte frame. The argument word is decoded when present.
    pub fn decode(frame: &[u8]) -> Result<Self, BusError> {
        if frame.len() < COMMAND_WORD_SIZE {
            return Err(BusError::InsufficientData {
                expected: COMMAND_WORD_SIZE,
                actual: frame.len(),
            });
        }
        let mut command = Self::decode_word(LittleEndian::read_u16(&frame[..COMMAND_WORD_SIZE]))?;
        if frame.len() >= WIDE_COMMAND_SIZE {
            let arg = LittleEndian::read_u16(&frame[COMMAND_WORD_SIZE..WIDE_COMMAND_SIZE]);
            command.argument = Some(hamming::decode(arg)?);
        }
        Ok(command)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "{} -> broadcast", self.opcode)?;
        } else {
            write!(f, "{} -> {}", self.opcode, self.address)?;
        }
        if let Some(arg) = self.argument {
            write!(f, " arg={:#05x}", arg)?;
        }
        Ok(())
    }
}
