use crate::constants::{
    MEASUREMENT_BLOCK_SIZE, NUM_INPUTS, NUM_VALUES, PAGE_BYTES, PAGE_FRAME_SIZE, PAGE_WORDS, TEMP_INDEX,
    VERSION_BLOCK_SIZE,
};
use crate::crc::crc16_xmodem;
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MeasurementBlockRaw {
    pub address: u8,
    pub values: [U16; NUM_VALUES], // 4 cell inputs (mV), then temperature
    pub crc: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct VersionBlockRaw {
    pub sw: [u8; 4], // major, minor, patch, release letter
    pub hw: [u8; 2], // revision, variant letter
    pub serial: U32,
    pub crc: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PageBufferRaw {
    pub page: u8,
    pub data: [U16; PAGE_WORDS],
    pub crc: U16,
}

/// Checks the little-endian CRC trailer of a complete block
fn verify_trailer(bytes: &[u8]) -> Result<(), BusError> {
    if bytes.len() < 2 {
        return Err(BusError::InsufficientData {
            expected: 2,
            actual: bytes.len(),
        });
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let actual = crc16_xmodem(body);
    if expected != actual {
        return Err(BusError::CrcMismatch { expected, actual });
    }
    Ok(())
}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), BusError> {
    if bytes.len() != expected {
        return Err(BusError::InsufficientData {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// One module's measurement reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementBlock {
    pub address: u8,
    pub values: [u16; NUM_VALUES],
}

impl MeasurementBlock {
    pub fn new(address: u8, values: [u16; NUM_VALUES]) -> Self {
        Self { address, values }
    }

    pub fn cell_voltages(&self) -> [u16; NUM_INPUTS] {
        let mut cells = [0u16; NUM_INPUTS];
        cells.copy_from_slice(&self.values[..NUM_INPUTS]);
        cells
    }

    /// Temperature in °C, carried signed in the low byte of the last channel
    pub fn temperature_c(&self) -> i8 {
        self.values[TEMP_INDEX] as u8 as i8
    }

    pub fn to_raw(&self) -> MeasurementBlockRaw {
        let mut raw = MeasurementBlockRaw {
            address: self.address,
            values: self.values.map(U16::new),
            crc: U16::new(0),
        };
        raw.crc = U16::new(crc16_xmodem(&raw.as_bytes()[..MEASUREMENT_BLOCK_SIZE - 2]));
        raw
    }

    /// Serialized block including the CRC trailer
    pub fn to_bytes(&self) -> [u8; MEASUREMENT_BLOCK_SIZE] {
        let mut out = [0u8; MEASUREMENT_BLOCK_SIZE];
        out.copy_from_slice(self.to_raw().as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, BusError> {
        check_len(bytes, MEASUREMENT_BLOCK_SIZE)?;
        verify_trailer(bytes)?;
        let raw = MeasurementBlockRaw::ref_from_bytes(bytes).map_err(|_| BusError::InsufficientData {
            expected: MEASUREMENT_BLOCK_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::from(*raw))
    }
}

impl From<MeasurementBlockRaw> for MeasurementBlock {
    fn from(raw: MeasurementBlockRaw) -> Self {
        Self {
            address: raw.address,
            values: raw.values.map(|v| v.get()),
        }
    }
}

/// Firmware and hardware identification of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub sw_major: u8,
    pub sw_minor: u8,
    pub sw_patch: u8,
    pub sw_release: char,
    pub hw_revision: u8,
    pub hw_variant: char,
    pub serial: u32,
}

impl VersionInfo {
    /// Software version as `A.B.C<letter>`
    pub fn software(&self) -> String {
        format!("{}.{}.{}{}", self.sw_major, self.sw_minor, self.sw_patch, self.sw_release)
    }

    /// Hardware version as `A<letter>`
    pub fn hardware(&self) -> String {
        format!("{}{}", self.hw_revision, self.hw_variant)
    }

    pub fn to_raw(&self) -> VersionBlockRaw {
        let mut raw = VersionBlockRaw {
            sw: [self.sw_major, self.sw_minor, self.sw_patch, self.sw_release as u8],
            hw: [self.hw_revision, self.hw_variant as u8],
            serial: U32::new(self.serial),
            crc: U16::new(0),
        };
        raw.crc = U16::new(crc16_xmodem(&raw.as_bytes()[..VERSION_BLOCK_SIZE - 2]));
        raw
    }

    pub fn to_bytes(&self) -> [u8; VERSION_BLOCK_SIZE] {
        let mut out = [0u8; VERSION_BLOCK_SIZE];
        out.copy_from_slice(self.to_raw().as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, BusError> {
        check_len(bytes, VERSION_BLOCK_SIZE)?;
        verify_trailer(bytes)?;
        let raw = VersionBlockRaw::ref_from_bytes(bytes).map_err(|_| BusError::InsufficientData {
            expected: VERSION_BLOCK_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::from(*raw))
    }
}

impl From<VersionBlockRaw> for VersionInfo {
    fn from(raw: VersionBlockRaw) -> Self {
        Self {
            sw_major: raw.sw[0],
            sw_minor: raw.sw[1],
            sw_patch: raw.sw[2],
            sw_release: raw.sw[3] as char,
            hw_revision: raw.hw[0],
            hw_variant: raw.hw[1] as char,
            serial: raw.serial.get(),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SW {} HW {} serial {:08X}",
            self.software(),
            self.hardware(),
            self.serial
        )
    }
}

/// One firmware page as sent to the module updater
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBuffer {
    pub page: u8,
    pub data: [u8; PAGE_BYTES],
}

impl PageBuffer {
    pub fn new(page: u8, data: [u8; PAGE_BYTES]) -> Self {
        Self { page, data }
    }

    pub fn to_bytes(&self) -> [u8; PAGE_FRAME_SIZE] {
        let mut out = [0u8; PAGE_FRAME_SIZE];
        out[0] = self.page;
        out[1..=PAGE_BYTES].copy_from_slice(&self.data);
        let crc = crc16_xmodem(&out[..PAGE_FRAME_SIZE - 2]);
        out[PAGE_FRAME_SIZE - 2..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parses a received page frame. The length check comes before the CRC
    /// check so callers can tell a short frame from a corrupted one.
    pub fn parse(bytes: &[u8]) -> Result<Self, BusError> {
        check_len(bytes, PAGE_FRAME_SIZE)?;
        verify_trailer(bytes)?;
        let raw = PageBufferRaw::ref_from_bytes(bytes).map_err(|_| BusError::InsufficientData {
            expected: PAGE_FRAME_SIZE,
            actual: bytes.len(),
        })?;
        let mut data = [0u8; PAGE_BYTES];
        data.copy_from_slice(raw.data.as_bytes());
        Ok(Self { page: raw.page, data })
    }

    /// Page contents as little-endian flash words
    pub fn words(&self) -> impl Iterator<Item = u16> + '_ {
        self.data.chunks_exact(2).map(|w| u16::from_le_bytes([w[0], w[1]]))
    }
}
