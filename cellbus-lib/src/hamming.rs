//! Extended Hamming(16,11) code protecting every command word on the bus.
//!
//! Code bits 0..=14 form a Hamming(15,11) code with parity at the positions
//! whose 1-based index is a power of two (bits 0, 1, 3 and 7). Bit 15 carries
//! the overall parity of the word, which turns single error correction into
//! single error correction plus double error detection.

use crate::error::BusError;

const CODE_BITS: u32 = 16;
const HAMMING_BITS: u32 = 15;
const DATA_BITS: u32 = 11;
const PARITY_BITS: u32 = HAMMING_BITS - DATA_BITS;
const DATA_MASK: u16 = (1 << DATA_BITS) - 1;

/// Outcome of checking a received codeword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Syndrome and parity are both zero
    Valid,
    /// A single flipped bit was located and repaired
    Corrected { bit: u8 },
    /// The pattern cannot be repaired
    Uncorrectable,
}

fn is_parity_position(cbit: u32) -> bool {
    (cbit + 1).is_power_of_two()
}

/// XOR parity of all 16 bits
pub fn parity(code: u16) -> u8 {
    (code.count_ones() & 1) as u8
}

/// 4-bit Hamming syndrome over code bits 0..=14
pub fn syndrome(code: u16) -> u8 {
    (0..HAMMING_BITS)
        .filter(|cbit| code & (1 << cbit) != 0)
        .fold(0u8, |acc, cbit| acc ^ (cbit + 1) as u8)
}

fn data_to_code(data: u16) -> u16 {
    let mut code = 0u16;
    let mut dbit = DATA_BITS;

    // Most significant data bit lands in the lowest data position
    for cbit in (0..HAMMING_BITS).filter(|&c| !is_parity_position(c)) {
        dbit -= 1;
        code |= ((data >> dbit) & 1) << cbit;
    }
    code
}

fn data_from_code(code: u16) -> u16 {
    let mut data = 0u16;
    let mut dbit = DATA_BITS;

    for cbit in (0..HAMMING_BITS).filter(|&c| !is_parity_position(c)) {
        dbit -= 1;
        data |= ((code >> cbit) & 1) << dbit;
    }
    data
}

/// Encodes the low 11 bits of `data` into an extended Hamming codeword.
pub fn encode(data: u16) -> u16 {
    let mut code = data_to_code(data & DATA_MASK);

    for pbit in 0..PARITY_BITS {
        let mask = 1u32 << pbit;
        let covered = (0..HAMMING_BITS)
            .filter(|&cbit| !is_parity_position(cbit) && (cbit + 1) & mask != 0)
            .fold(0u16, |acc, cbit| acc ^ ((code >> cbit) & 1));
        code |= covered << (mask - 1);
    }

    code | (parity(code) as u16) << (CODE_BITS - 1)
}

/// Checks a codeword without extracting data.
pub fn classify(code: u16) -> DecodeStatus {
    match (syndrome(code), parity(code)) {
        (0, 0) => DecodeStatus::Valid,
        (s, 1) if s > 0 => DecodeStatus::Corrected { bit: s - 1 },
        _ => DecodeStatus::Uncorrectable,
    }
}

/// Decodes a codeword, repairing a single bit error.
///
/// A lone flip of the overall parity bit (syndrome 0, parity 1) is reported
/// as uncorrectable like every other pattern outside the single error case.
pub fn decode(code: u16) -> Result<u16, BusError> {
    match classify(code) {
        DecodeStatus::Valid => Ok(data_from_code(code)),
        DecodeStatus::Corrected { bit } => Ok(data_from_code(code ^ (1 << bit))),
        DecodeStatus::Uncorrectable => Err(BusError::Uncorrectable { codeword: code }),
    }
}
