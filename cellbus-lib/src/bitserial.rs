//! Module side bit transceiver.
//!
//! Reception is edge triggered: an edge on an idle line starts the bit timer
//! half a bit later, so every tick samples the middle of a bit slot. Slot 0 is
//! the start bit, slots 1..=8 the data bits (LSB first) and slot 9 the stop
//! bit. The edge interrupt is re-armed in slot 10 and the receiver reports
//! idle after slot 12 if no new start bit arrived.
//!
//! Transmission shares the bit timer. Every symbol takes `SYMBOL_TICKS` ticks
//! and the receiver is re-armed once the queue is empty.

use crate::constants::{BREAK_BITS, PAGE_FRAME_SIZE, SYMBOL_TICKS};
use crate::line::{LineDriver, Polarity};

/// Byte counter value meaning "drop everything until the next break"
pub const DISCARD: u8 = 0xFF;

const TX_QUEUE_LEN: usize = 16;
const STOP_BIT: u8 = 9;
const REARM_BIT: u8 = 10;
const IDLE_BIT: u8 = 12;

/// One unit of transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    Byte(u8),
    /// Ten zero bits; resets every receiver's byte counter
    Break,
    /// A single zero bit, read by a UART as 0xFF
    Pulse,
}

impl Symbol {
    /// Logical level of bit slot `slot` of this symbol
    pub fn level(self, slot: u8) -> bool {
        match self {
            Symbol::Byte(byte) => match slot {
                0 => false,
                1..=8 => (byte >> (slot - 1)) & 1 != 0,
                _ => true,
            },
            Symbol::Break => slot >= BREAK_BITS as u8,
            Symbol::Pulse => slot != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitStart,
    Receiving { bit: u8, shift: u8 },
    Transmitting { slot: u8 },
    Asleep,
}

pub struct BitSerial<L: LineDriver> {
    line: L,
    polarity: Polarity,
    state: State,
    buf: [u8; PAGE_FRAME_SIZE],
    count: u8,
    idle: bool,
    woke: bool,
    tx: [Symbol; TX_QUEUE_LEN],
    tx_len: usize,
    tx_pos: usize,
}

impl<L: LineDriver> BitSerial<L> {
    /// Takes over the line. The idle level decides the initial polarity.
    pub fn new(mut line: L) -> Self {
        let polarity = Polarity::from_idle_level(line.sample());
        line.arm_edge(true);
        Self {
            line,
            polarity,
            state: State::WaitStart,
            buf: [0; PAGE_FRAME_SIZE],
            count: 0,
            idle: true,
            woke: false,
            tx: [Symbol::Break; TX_QUEUE_LEN],
            tx_len: 0,
            tx_pos: 0,
        }
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    /// Edge interrupt entry point
    pub fn on_edge(&mut self) {
        match self.state {
            State::WaitStart | State::Receiving { .. } => {
                self.polarity = Polarity::from_start_level(self.line.sample());
                self.line.arm_edge(false);
                self.idle = false;
                self.state = State::Receiving { bit: 0, shift: 0 };
                self.line.start_ticks();
            }
            State::Asleep => {
                // The waking edge is consumed; poll() decides what happens next
                self.line.arm_edge(false);
                self.woke = true;
            }
            State::Transmitting { .. } => {}
        }
    }

    /// Bit timer entry point
    pub fn on_tick(&mut self) {
        match self.state {
            State::Receiving { bit, shift } => self.receive_bit(bit, shift),
            State::Transmitting { slot } => self.transmit_slot(slot),
            State::WaitStart | State::Asleep => self.line.stop_ticks(),
        }
    }

    fn receive_bit(&mut self, bit: u8, mut shift: u8) {
        let value = self.polarity.to_logical(self.line.sample());

        match bit {
            0 if value => {
                // Spurious start
                self.line.stop_ticks();
                self.line.arm_edge(true);
                self.idle = true;
                self.state = State::WaitStart;
                return;
            }
            1..=8 => {
                if value {
                    shift |= 1 << (bit - 1);
                }
            }
            STOP_BIT => {
                if shift == 0 && !value {
                    self.count = 0;
                } else if self.count != DISCARD {
                    if let Some(slot) = self.buf.get_mut(self.count as usize) {
                        *slot = shift;
                    }
                    self.count = (self.count + 1).min(DISCARD - 1);
                }
            }
            REARM_BIT => self.line.arm_edge(true),
            IDLE_BIT => {
                self.line.stop_ticks();
                self.idle = true;
                self.state = State::WaitStart;
                return;
            }
            _ => {}
        }
        self.state = State::Receiving { bit: bit + 1, shift };
    }

    fn transmit_slot(&mut self, slot: u8) {
        let symbol = self.tx[self.tx_pos];
        self.line.drive(self.polarity.to_physical(symbol.level(slot)));

        if slot + 1 < SYMBOL_TICKS {
            self.state = State::Transmitting { slot: slot + 1 };
            return;
        }

        self.tx_pos += 1;
        if self.tx_pos < self.tx_len {
            self.state = State::Transmitting { slot: 0 };
        } else {
            self.line.release();
            self.line.stop_ticks();
            self.tx_len = 0;
            self.tx_pos = 0;
            self.state = State::WaitStart;
            self.rearm();
        }
    }

    /// Number of bytes of the last frame, once the line has gone idle.
    pub fn frame_len(&self) -> Option<usize> {
        if self.idle && self.state == State::WaitStart && self.count != 0 && self.count != DISCARD {
            Some(self.count as usize)
        } else {
            None
        }
    }

    /// Received bytes that fit the buffer
    pub fn frame(&self) -> &[u8] {
        let len = (self.count as usize).min(self.buf.len());
        if self.count == DISCARD { &[] } else { &self.buf[..len] }
    }

    /// Clears the byte counter and listens for the next frame
    pub fn rearm(&mut self) {
        self.count = 0;
        self.idle = true;
        if !self.is_transmitting() {
            self.state = State::WaitStart;
            self.line.arm_edge(true);
        }
    }

    /// Ignores received bytes until a break arrives
    pub fn discard_until_break(&mut self) {
        self.count = DISCARD;
    }

    /// Stops the timer and waits for any edge
    pub fn sleep(&mut self) {
        self.line.stop_ticks();
        self.line.arm_edge(true);
        self.woke = false;
        self.state = State::Asleep;
    }

    /// Returns true once after an edge woke a sleeping receiver
    pub fn take_wake(&mut self) -> bool {
        std::mem::take(&mut self.woke)
    }

    pub fn is_asleep(&self) -> bool {
        self.state == State::Asleep
    }

    pub fn is_transmitting(&self) -> bool {
        matches!(self.state, State::Transmitting { .. })
    }

    fn queue(&mut self, symbols: impl ExactSizeIterator<Item = Symbol>) -> bool {
        if self.tx_len + symbols.len() > TX_QUEUE_LEN {
            return false;
        }
        for symbol in symbols {
            self.tx[self.tx_len] = symbol;
            self.tx_len += 1;
        }
        if !self.is_transmitting() {
            self.line.arm_edge(false);
            self.tx_pos = 0;
            self.state = State::Transmitting { slot: 0 };
            self.line.start_ticks();
        }
        true
    }

    /// Queues bytes for transmission. Returns false if they do not fit.
    pub fn send(&mut self, bytes: &[u8]) -> bool {
        self.queue(bytes.iter().map(|&b| Symbol::Byte(b)))
    }

    pub fn send_break(&mut self) -> bool {
        self.queue(std::iter::once(Symbol::Break))
    }

    pub fn send_pulse(&mut self) -> bool {
        self.queue(std::iter::once(Symbol::Pulse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimLine, deliver_levels, drain_transmitter};
    use crate::uart::encode_levels;

    fn receiver(polarity: Polarity) -> BitSerial<SimLine> {
        BitSerial::new(SimLine::new(polarity.idle_level()))
    }

    #[test]
    fn test_symbol_levels() {
        let byte: Vec<bool> = (0..SYMBOL_TICKS).map(|s| Symbol::Byte(0x01).level(s)).collect();
        assert_eq!(
            byte,
            [false, true, false, false, false, false, false, false, false, true, true]
        );
        assert_eq!((0..SYMBOL_TICKS).filter(|&s| !Symbol::Break.level(s)).count(), 10);
        assert_eq!((0..SYMBOL_TICKS).filter(|&s| !Symbol::Pulse.level(s)).count(), 1);
    }

    #[test]
    fn test_receives_frame_after_break() {
        let mut rx = receiver(Polarity::Normal);
        deliver_levels(&mut rx, &encode_levels(&[0xa1, 0x40], true, Polarity::Normal));

        assert_eq!(rx.frame_len(), Some(2));
        assert_eq!(rx.frame(), &[0xa1, 0x40]);
        assert_eq!(rx.polarity(), Polarity::Normal);
    }

    #[test]
    fn test_break_resets_counter() {
        let mut rx = receiver(Polarity::Normal);
        deliver_levels(&mut rx, &encode_levels(&[0x11, 0x22, 0x33], false, Polarity::Normal));
        assert_eq!(rx.frame_len(), Some(3));

        deliver_levels(&mut rx, &encode_levels(&[0x44], true, Polarity::Normal));
        assert_eq!(rx.frame(), &[0x44]);
    }

    #[test]
    fn test_detects_inverted_line() {
        let mut rx = receiver(Polarity::Inverted);
        assert_eq!(rx.polarity(), Polarity::Inverted);

        deliver_levels(&mut rx, &encode_levels(&[0x02, 0xd0], true, Polarity::Inverted));
        assert_eq!(rx.frame(), &[0x02, 0xd0]);
        assert_eq!(rx.polarity(), Polarity::Inverted);
    }

    #[test]
    fn test_rejects_spurious_start() {
        let mut rx = receiver(Polarity::Normal);
        // A glitch shorter than half a bit reads high in the middle of the slot
        rx.line_mut().set_level(false);
        rx.on_edge();
        rx.line_mut().set_level(true);
        rx.on_tick();

        assert!(!rx.line().is_ticking());
        assert!(rx.line().is_edge_armed());
        assert_eq!(rx.frame_len(), None);

        deliver_levels(&mut rx, &encode_levels(&[0x5a], true, Polarity::Normal));
        assert_eq!(rx.frame(), &[0x5a]);
    }

    #[test]
    fn test_discard_until_break() {
        let mut rx = receiver(Polarity::Normal);
        rx.discard_until_break();
        deliver_levels(&mut rx, &encode_levels(&[0x01, 0x02], false, Polarity::Normal));
        assert_eq!(rx.frame_len(), None);

        deliver_levels(&mut rx, &encode_levels(&[0x03], true, Polarity::Normal));
        assert_eq!(rx.frame_len(), Some(1));
        assert_eq!(rx.frame(), &[0x03]);
    }

    #[test]
    fn test_transmit_and_rearm() {
        let mut tx = receiver(Polarity::Normal);
        assert!(tx.send_break());
        assert!(tx.send(&[0xa1, 0x40]));
        assert!(tx.is_transmitting());

        let levels = drain_transmitter(&mut tx);
        assert_eq!(levels.len(), 3 * SYMBOL_TICKS as usize);
        assert!(!tx.is_transmitting());
        assert!(tx.line().is_edge_armed());

        let mut rx = receiver(Polarity::Normal);
        deliver_levels(&mut rx, &levels);
        assert_eq!(rx.frame(), &[0xa1, 0x40]);
    }

    #[test]
    fn test_transmit_queue_limit() {
        let mut tx = receiver(Polarity::Normal);
        assert!(tx.send(&[0u8; TX_QUEUE_LEN]));
        assert!(!tx.send_pulse());
    }

    #[test]
    fn test_sleep_consumes_waking_edge() {
        let mut rx = receiver(Polarity::Normal);
        rx.sleep();
        deliver_levels(&mut rx, &encode_levels(&[0x12, 0x34], true, Polarity::Normal));

        assert!(rx.take_wake());
        assert!(!rx.take_wake());
        assert_eq!(rx.frame_len(), None);
    }
}
