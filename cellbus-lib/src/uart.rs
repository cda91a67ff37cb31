//! Master side line coding at bit-slot resolution.
//!
//! The master uses a regular UART at 10 kbps with two stop bits. A break is
//! ten zero bits followed by the two stop bits. On reception a break shows up
//! as a 0x00 byte, which is what a DMA driven UART stores for it.

use crate::constants::{BREAK_BITS, MASTER_STOP_BITS};
use crate::line::Polarity;

/// Physical line levels, one per bit slot, for an optional break and `payload`.
pub fn encode_levels(payload: &[u8], with_break: bool, polarity: Polarity) -> Vec<bool> {
    let mut bits = Vec::with_capacity((payload.len() + 1) * (1 + 8 + MASTER_STOP_BITS));

    if with_break {
        bits.extend(std::iter::repeat_n(false, BREAK_BITS));
        bits.extend(std::iter::repeat_n(true, MASTER_STOP_BITS));
    }
    for &byte in payload {
        bits.push(false);
        bits.extend((0..8).map(|i| (byte >> i) & 1 != 0));
        bits.extend(std::iter::repeat_n(true, MASTER_STOP_BITS));
    }

    bits.into_iter().map(|bit| polarity.to_physical(bit)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Idle,
    Data { bit: u8, shift: u8 },
    /// After a break or framing error, wait for the line to return high
    AwaitIdle,
}

/// Samples one level per bit slot and reassembles bytes
#[derive(Debug, Clone)]
pub struct LevelDecoder {
    polarity: Polarity,
    state: DecoderState,
    framing_errors: usize,
}

impl LevelDecoder {
    pub fn new(polarity: Polarity) -> Self {
        Self {
            polarity,
            state: DecoderState::Idle,
            framing_errors: 0,
        }
    }

    pub fn framing_errors(&self) -> usize {
        self.framing_errors
    }

    /// Feeds the level of one bit slot. Returns a byte when its stop bit has
    /// been sampled.
    pub fn feed(&mut self, level: bool) -> Option<u8> {
        let bit = self.polarity.to_logical(level);

        match self.state {
            DecoderState::Idle => {
                if !bit {
                    self.state = DecoderState::Data { bit: 1, shift: 0 };
                }
                None
            }
            DecoderState::Data { bit: n @ 1..=8, mut shift } => {
                if bit {
                    shift |= 1 << (n - 1);
                }
                self.state = DecoderState::Data { bit: n + 1, shift };
                None
            }
            DecoderState::Data { shift, .. } => {
                if bit {
                    self.state = DecoderState::Idle;
                    Some(shift)
                } else if shift == 0 {
                    self.state = DecoderState::AwaitIdle;
                    Some(0x00)
                } else {
                    self.framing_errors += 1;
                    self.state = DecoderState::AwaitIdle;
                    None
                }
            }
            DecoderState::AwaitIdle => {
                if bit {
                    self.state = DecoderState::Idle;
                }
                None
            }
        }
    }

    pub fn decode(&mut self, levels: &[bool]) -> Vec<u8> {
        levels.iter().filter_map(|&level| self.feed(level)).collect()
    }
}
