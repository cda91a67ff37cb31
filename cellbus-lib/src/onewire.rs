//! Master side bus access.
//!
//! Every transmission is preceded by a break, so all listening modules start
//! counting bytes from zero. Replies are captured into a ring buffer that is
//! cleared when the next transmission starts; readers always take the most
//! recent bytes, which skips breaks and echoes recorded before the reply.

use crate::constants::RX_RING_SIZE;
use crate::line::Polarity;
use bytes::Bytes;
use tracing::trace;

/// Hardware seam of the master UART
pub trait BusPort {
    /// Send a break followed by `payload`
    fn transmit(&mut self, payload: &[u8]);

    /// Move every byte captured since the last call into `ring`
    fn drain_received(&mut self, ring: &mut RxRing);

    /// Select default or remapped (inverted) line levels
    fn set_polarity(&mut self, polarity: Polarity);

    /// False while a transmission is still in progress
    fn is_receiving(&self) -> bool;
}

/// Circular capture buffer
pub struct RxRing {
    buf: [u8; RX_RING_SIZE],
    head: usize,
    len: usize,
}

impl Default for RxRing {
    fn default() -> Self {
        Self {
            buf: [0; RX_RING_SIZE],
            head: 0,
            len: 0,
        }
    }
}

impl RxRing {
    pub fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % RX_RING_SIZE;
        self.len = (self.len + 1).min(RX_RING_SIZE);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The last `n` captured bytes in arrival order
    pub fn latest(&self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        let start = (self.head + RX_RING_SIZE - n) % RX_RING_SIZE;
        let bytes: Vec<u8> = (0..n).map(|i| self.buf[(start + i) % RX_RING_SIZE]).collect();
        Some(Bytes::from(bytes))
    }
}

/// Owner of the master bus port and its receive window
pub struct OneWire<P: BusPort> {
    port: P,
    ring: RxRing,
    polarity: Polarity,
}

impl<P: BusPort> OneWire<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            ring: RxRing::default(),
            polarity: Polarity::Normal,
        }
    }

    /// Opens a new receive window and sends break + `payload`
    pub fn send(&mut self, payload: &[u8]) {
        self.ring.clear();
        trace!("TX {} bytes: {:02x?}", payload.len(), payload);
        self.port.transmit(payload);
    }

    /// Exactly the latest `n` bytes of the current window, if that many arrived
    pub fn received(&mut self, n: usize) -> Option<Bytes> {
        self.port.drain_received(&mut self.ring);
        let data = self.ring.latest(n);
        if let Some(data) = &data {
            trace!("RX {:02x?}", data.as_ref());
        }
        data
    }

    /// Bytes captured in the current window so far
    pub fn pending(&mut self) -> usize {
        self.port.drain_received(&mut self.ring);
        self.ring.len()
    }

    pub fn set_polarity(&mut self, polarity: Polarity) {
        self.polarity = polarity;
        self.port.set_polarity(polarity);
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn is_receiving(&self) -> bool {
        self.port.is_receiving()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct LoopbackPort {
        sent: Vec<Vec<u8>>,
        reply: Vec<u8>,
        polarity: Polarity,
    }

    impl BusPort for LoopbackPort {
        fn transmit(&mut self, payload: &[u8]) {
            self.sent.push(payload.to_vec());
        }

        fn drain_received(&mut self, ring: &mut RxRing) {
            ring.extend_from_slice(&self.reply);
            self.reply.clear();
        }

        fn set_polarity(&mut self, polarity: Polarity) {
            self.polarity = polarity;
        }

        fn is_receiving(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_ring_latest() {
        let mut ring = RxRing::default();
        ring.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(ring.latest(2).unwrap().as_ref(), &[3, 4]);
        assert_eq!(ring.latest(4).unwrap().as_ref(), &[1, 2, 3, 4]);
        assert!(ring.latest(5).is_none());
    }

    #[test]
    fn test_ring_wraps() {
        let mut ring = RxRing::default();
        for i in 0..(RX_RING_SIZE + 3) {
            ring.push(i as u8);
        }
        assert_eq!(ring.len(), RX_RING_SIZE);
        let last = ring.latest(3).unwrap();
        assert_eq!(last.as_ref(), &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_send_opens_new_window() {
        let mut bus = OneWire::new(LoopbackPort::default());
        bus.port_mut().reply = vec![0x00, 0xa1, 0x40];
        assert_eq!(bus.received(2).unwrap().as_ref(), &[0xa1, 0x40]);

        bus.send(&[0x02, 0xd0]);
        assert!(bus.received(1).is_none());
        assert_eq!(bus.port().sent, vec![vec![0x02, 0xd0]]);
    }

    #[test]
    fn test_polarity_reaches_port() {
        let mut bus = OneWire::new(LoopbackPort::default());
        bus.set_polarity(Polarity::Inverted);
        assert_eq!(bus.port().polarity, Polarity::Inverted);
    }
}
