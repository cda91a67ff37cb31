//! Bit-slot accurate simulation of a module chain.
//!
//! Time advances in bit slots. In every slot the line takes its new level,
//! an armed edge interrupt fires on a level change, and a running bit timer
//! ticks once in the middle of the slot. The master side sees the chain
//! through [`SimBus`], which implements [`BusPort`].
//!
//! Topology: the master drives module 0. Every module repeats its input to
//! the next one while its propagation gate is enabled, and drives the
//! downstream line itself when transmitting. All module transmissions also
//! reach the master's receiver over the shared return path, which may invert
//! the levels. The master's polarity setting selects how its receiver maps
//! levels to bits; the forward line always idles high.

use crate::bitserial::BitSerial;
use crate::config::ModuleConfig;
use crate::constants::{NUM_INPUTS, NUM_VALUES, PAGE_BYTES, SYMBOL_TICKS};
use crate::line::{LineDriver, Polarity};
use crate::module::{ModuleHal, ModuleSession};
use crate::onewire::{BusPort, RxRing};
use crate::uart::{LevelDecoder, encode_levels};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Idle slots appended to every burst so receivers can finish the last byte
const IDLE_SLOTS: usize = 4;

/// Level mapping of the forward line driven by the master
const LINE_POLARITY: Polarity = Polarity::Normal;

/// Upper bound of main loop passes after one master transmission
const MAX_CASCADE_PASSES: usize = 8;

/// Simulated receive pin, transmit pin and bit timer of one module
#[derive(Debug, Clone, Default)]
pub struct SimLine {
    level: bool,
    edge_armed: bool,
    ticking: bool,
    driven: Vec<bool>,
}

impl SimLine {
    pub fn new(idle_level: bool) -> Self {
        Self {
            level: idle_level,
            ..Default::default()
        }
    }

    /// Sets the receive level. Returns true if an armed edge interrupt fires.
    pub fn set_level(&mut self, level: bool) -> bool {
        let edge = level != self.level;
        self.level = level;
        edge && self.edge_armed
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    pub fn is_edge_armed(&self) -> bool {
        self.edge_armed
    }

    /// Levels driven since the last call, one per tick
    pub fn take_driven(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.driven)
    }
}

impl LineDriver for SimLine {
    fn sample(&self) -> bool {
        self.level
    }

    fn drive(&mut self, level: bool) {
        self.driven.push(level);
    }

    fn release(&mut self) {}

    fn start_ticks(&mut self) {
        self.ticking = true;
    }

    fn stop_ticks(&mut self) {
        self.ticking = false;
    }

    fn arm_edge(&mut self, armed: bool) {
        self.edge_armed = armed;
    }
}

/// Plays `levels` into a receiver, followed by idle slots at the last level.
pub fn deliver_levels(rx: &mut BitSerial<SimLine>, levels: &[bool]) {
    let Some(&last) = levels.last() else {
        return;
    };
    for &level in levels.iter().chain(std::iter::repeat_n(&last, IDLE_SLOTS)) {
        if rx.line_mut().set_level(level) {
            rx.on_edge();
        }
        if rx.line().is_ticking() {
            rx.on_tick();
        }
    }
}

/// Runs the bit timer until the transmit queue is empty and returns the
/// driven levels.
pub fn drain_transmitter(rx: &mut BitSerial<SimLine>) -> Vec<bool> {
    // Bounded by the queue size; each symbol takes SYMBOL_TICKS ticks
    let mut budget = 64 * SYMBOL_TICKS as usize;
    while rx.is_transmitting() && budget > 0 {
        rx.on_tick();
        budget -= 1;
    }
    rx.line_mut().take_driven()
}

/// Simulated module board
#[derive(Debug, Clone, Default)]
pub struct SimHal {
    propagation: bool,
    shunts: u8,
    serial: u32,
    delay_ms: u32,
    flash: BTreeMap<u8, [u8; PAGE_BYTES]>,
    pages_written: usize,
}

impl SimHal {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            ..Default::default()
        }
    }

    pub fn propagation(&self) -> bool {
        self.propagation
    }

    pub fn shunts(&self) -> u8 {
        self.shunts
    }

    pub fn total_delay_ms(&self) -> u32 {
        self.delay_ms
    }

    pub fn flash_page(&self, page: u8) -> Option<&[u8; PAGE_BYTES]> {
        self.flash.get(&page)
    }

    /// Page writes including rewrites
    pub fn pages_written(&self) -> usize {
        self.pages_written
    }
}

impl ModuleHal for SimHal {
    fn set_propagation(&mut self, enabled: bool) {
        self.propagation = enabled;
    }

    fn set_shunts(&mut self, mask: u8) {
        self.shunts = mask;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_ms += ms;
    }

    fn serial_number(&self) -> u32 {
        self.serial
    }

    fn write_page(&mut self, page: u8, data: &[u8; PAGE_BYTES]) {
        self.flash.insert(page, *data);
        self.pages_written += 1;
    }
}

pub type SimModule = ModuleSession<SimLine, SimHal>;

/// Measurements a fresh simulated module reports
pub fn default_measurements(index: usize) -> [u16; NUM_VALUES] {
    let mut values = [0u16; NUM_VALUES];
    for (cell, value) in values.iter_mut().take(NUM_INPUTS).enumerate() {
        *value = 3300 + (index * NUM_INPUTS + cell) as u16;
    }
    values[NUM_INPUTS] = 25;
    values
}

/// Master view of a simulated module chain
pub struct SimBus {
    modules: Vec<SimModule>,
    failed: Vec<bool>,
    master_polarity: Polarity,
    return_polarity: Polarity,
    received: Vec<u8>,
    corrupt_next: Option<(usize, u8)>,
    corrupt_all: Option<(usize, u8)>,
    transmissions: u64,
}

impl SimBus {
    pub fn new(count: usize, config: ModuleConfig) -> Self {
        let modules = (0..count)
            .map(|i| {
                let mut module = ModuleSession::new(
                    SimLine::new(LINE_POLARITY.idle_level()),
                    SimHal::new(0x1000 + i as u32),
                    config.clone(),
                );
                module.set_measurements(default_measurements(i));
                module
            })
            .collect();
        Self {
            modules,
            failed: vec![false; count],
            master_polarity: Polarity::Normal,
            return_polarity: Polarity::Normal,
            received: Vec::new(),
            corrupt_next: None,
            corrupt_all: None,
            transmissions: 0,
        }
    }

    /// Installs an inverting stage on the path from the modules to the master
    pub fn with_inverted_return(mut self) -> Self {
        self.return_polarity = Polarity::Inverted;
        self
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, index: usize) -> &SimModule {
        &self.modules[index]
    }

    pub fn module_mut(&mut self, index: usize) -> &mut SimModule {
        &mut self.modules[index]
    }

    pub fn modules(&self) -> &[SimModule] {
        &self.modules
    }

    /// Replies of a failed module never reach the master
    pub fn fail_module(&mut self, index: usize) {
        self.failed[index] = true;
    }

    pub fn restore_module(&mut self, index: usize) {
        self.failed[index] = false;
    }

    /// XORs `mask` into byte `index` of the next master transmission
    pub fn corrupt_next_transmit(&mut self, index: usize, mask: u8) {
        self.corrupt_next = Some((index, mask));
    }

    /// XORs `mask` into byte `index` of every master transmission until
    /// cleared with `None`
    pub fn corrupt_transmits(&mut self, corruption: Option<(usize, u8)>) {
        self.corrupt_all = corruption;
    }

    pub fn transmissions(&self) -> u64 {
        self.transmissions
    }

    /// Plays a burst into module `first` and every module downstream of it
    /// that is reachable through enabled propagation gates.
    fn propagate(&mut self, first: usize, levels: &[bool]) {
        for module in self.modules.iter_mut().skip(first) {
            deliver_levels(module.transceiver_mut(), levels);
            if !module.hal().propagation() {
                break;
            }
        }
    }

    /// Main loop passes until no module has anything left to send.
    pub fn run_modules(&mut self) {
        for _ in 0..MAX_CASCADE_PASSES {
            let mut active = false;

            for i in 0..self.modules.len() {
                self.modules[i].poll();
                if !self.modules[i].transceiver().is_transmitting() {
                    continue;
                }
                active = true;

                let levels = drain_transmitter(self.modules[i].transceiver_mut());
                if !self.failed[i] {
                    let at_master: Vec<bool> = levels
                        .iter()
                        .map(|&l| self.return_polarity.to_logical(l))
                        .collect();
                    let bytes = LevelDecoder::new(self.master_polarity).decode(&at_master);
                    trace!("Module {} -> master {:02x?}", i, bytes);
                    self.received.extend_from_slice(&bytes);
                }
                self.propagate(i + 1, &levels);
            }

            if !active {
                break;
            }
        }
    }
}

impl BusPort for SimBus {
    fn transmit(&mut self, payload: &[u8]) {
        let mut bytes = payload.to_vec();
        if let Some((index, mask)) = self.corrupt_next.take().or(self.corrupt_all) {
            if let Some(byte) = bytes.get_mut(index) {
                debug!("Corrupting byte {} with mask {:#04x}", index, mask);
                *byte ^= mask;
            }
        }
        self.transmissions += 1;

        let levels = encode_levels(&bytes, true, LINE_POLARITY);
        self.propagate(0, &levels);
        self.run_modules();
    }

    fn drain_received(&mut self, ring: &mut RxRing) {
        ring.extend_from_slice(&self.received);
        self.received.clear();
    }

    fn set_polarity(&mut self, polarity: Polarity) {
        debug!("Master receiver polarity {}", polarity);
        self.master_polarity = polarity;
        self.received.clear();
    }

    fn is_receiving(&self) -> bool {
        true
    }
}
