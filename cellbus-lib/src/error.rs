use std::io;
use thiserror::Error;

/// The primary error type for the `cellbus` library.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Uncorrectable Hamming codeword 0x{codeword:04X}")]
    Uncorrectable { codeword: u16 },

    #[error("CRC mismatch: block carries 0x{expected:04X}, computed 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("Module address {0} is outside 1..=63")]
    AddressOutOfRange(u8),

    #[error("Firmware image of {size} bytes exceeds {max} bytes")]
    FirmwareTooLarge { size: usize, max: usize },

    #[error("Configuration error: invalid {parameter} = {value}")]
    Configuration { parameter: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;
