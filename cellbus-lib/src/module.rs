//! Cell module firmware logic: command handling, addressing, sleep and the
//! updater mode, on top of the bit transceiver.

use crate::bitserial::BitSerial;
use crate::blocks::{MeasurementBlock, VersionInfo};
use crate::command::{Command, Opcode};
use crate::config::ModuleConfig;
use crate::constants::{
    COMMAND_WORD_SIZE, MAX_ADDRESS, MIN_ADDRESS, NUM_SHUNTS, NUM_VALUES, PAGE_BYTES, PAGE_FRAME_SIZE,
    WIDE_COMMAND_SIZE,
};
use crate::hamming;
use crate::line::LineDriver;
use crate::updater::{PageOutcome, Updater};
use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Board functions the protocol needs besides the bus line
pub trait ModuleHal {
    /// Gate that repeats the upstream signal to the next module
    fn set_propagation(&mut self, enabled: bool);

    /// Switch balancing shunts; bit i drives shunt i
    fn set_shunts(&mut self, mask: u8);

    fn delay_ms(&mut self, ms: u32);

    fn serial_number(&self) -> u32;

    fn write_page(&mut self, page: u8, data: &[u8; PAGE_BYTES]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ModuleMode {
    #[strum(to_string = "wait address")]
    WaitAddr,
    #[strum(to_string = "run")]
    Run,
    #[strum(to_string = "sleep")]
    Sleep,
    #[strum(to_string = "updater")]
    Updater,
}

pub struct ModuleSession<L: LineDriver, H: ModuleHal> {
    rx: BitSerial<L>,
    hal: H,
    config: ModuleConfig,
    mode: ModuleMode,
    address: u8,
    values: [u16; NUM_VALUES],
    empty_cycles: u32,
    shunt_mask: u8,
    shunt_timer: u32,
    blink_counter: u32,
    led: u8,
    updater: Updater,
}

impl<L: LineDriver, H: ModuleHal> ModuleSession<L, H> {
    pub fn new(line: L, mut hal: H, config: ModuleConfig) -> Self {
        hal.set_propagation(false);
        let updater = Updater::new(config.max_pages);
        Self {
            rx: BitSerial::new(line),
            hal,
            config,
            mode: ModuleMode::WaitAddr,
            address: 0,
            values: [0; NUM_VALUES],
            empty_cycles: 0,
            shunt_mask: 0,
            shunt_timer: 0,
            blink_counter: 0,
            led: 0,
            updater,
        }
    }

    pub fn on_edge(&mut self) {
        self.rx.on_edge();
    }

    pub fn on_tick(&mut self) {
        self.rx.on_tick();
    }

    pub fn transceiver(&self) -> &BitSerial<L> {
        &self.rx
    }

    pub fn transceiver_mut(&mut self) -> &mut BitSerial<L> {
        &mut self.rx
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn mode(&self) -> ModuleMode {
        self.mode
    }

    /// Claimed bus address, 0 while unaddressed
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn shunt_mask(&self) -> u8 {
        self.shunt_mask
    }

    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    /// Latest ADC results: four cell voltages in mV, then the temperature
    pub fn set_measurements(&mut self, values: [u16; NUM_VALUES]) {
        self.values = values;
    }

    /// One main loop iteration
    pub fn poll(&mut self) {
        match self.mode {
            ModuleMode::Sleep => {
                if self.rx.take_wake() {
                    self.wake();
                }
                return;
            }
            ModuleMode::Updater => {
                self.poll_updater();
                return;
            }
            ModuleMode::WaitAddr | ModuleMode::Run => self.check_command(),
        }

        match self.mode {
            ModuleMode::WaitAddr => self.blink(),
            ModuleMode::Run => {
                if self.shunt_timer == 0 {
                    if self.shunt_mask != 0 {
                        debug!("Shunt timeout, module {}", self.address);
                        self.set_shunts(0);
                    }
                } else {
                    self.shunt_timer -= 1;
                }

                if self.empty_cycles >= self.config.max_empty_cycles {
                    self.go_to_sleep();
                }
            }
            ModuleMode::Sleep | ModuleMode::Updater => {}
        }
    }

    fn check_command(&mut self) {
        let len = match self.rx.frame_len() {
            Some(len @ (COMMAND_WORD_SIZE | WIDE_COMMAND_SIZE)) => len,
            _ => {
                self.empty_cycles = self.empty_cycles.saturating_add(1);
                return;
            }
        };

        let mut frame = [0u8; WIDE_COMMAND_SIZE];
        frame[..len].copy_from_slice(&self.rx.frame()[..len]);
        self.rx.rearm();

        match Command::decode_word(u16::from_le_bytes([frame[0], frame[1]])) {
            Ok(command) => {
                self.empty_cycles = 0;
                self.execute(command, &frame[..len]);
            }
            Err(e) => debug!("Dropping command frame {:02x?}: {}", &frame[..len], e),
        }
    }

    fn execute(&mut self, command: Command, frame: &[u8]) {
        if self.address != 0 && command.address == self.address {
            match command.opcode {
                Opcode::GetData => self.reply_measurements(),
                Opcode::Version => self.reply_version(),
                Opcode::ShuntOn if frame.len() == WIDE_COMMAND_SIZE => {
                    self.apply_shunts([frame[2], frame[3]]);
                }
                _ => {}
            }
        }

        match command.opcode {
            Opcode::Boot if command.is_broadcast() => self.enter_updater(),
            Opcode::AddressMode if command.is_broadcast() => self.enter_address_mode(),
            Opcode::SetAddress if self.mode == ModuleMode::WaitAddr => self.claim_address(command.address),
            _ => {}
        }
    }

    fn reply_measurements(&mut self) {
        // Flash the status LED unless a shunt is active
        if self.shunt_mask == 0 {
            self.led = (self.led + 1) % NUM_SHUNTS as u8;
            self.hal.set_shunts(1 << self.led);
            self.hal.set_shunts(0);
        }
        let block = MeasurementBlock::new(self.address, self.values).to_bytes();
        self.transmit(&block);
    }

    fn reply_version(&mut self) {
        let info = VersionInfo {
            serial: self.hal.serial_number(),
            ..self.config.version
        };
        self.transmit(&info.to_bytes());
    }

    fn apply_shunts(&mut self, raw: [u8; COMMAND_WORD_SIZE]) {
        match hamming::decode(u16::from_le_bytes(raw)) {
            Ok(mask) => {
                self.set_shunts((mask & ((1 << NUM_SHUNTS) - 1)) as u8);
                self.shunt_timer = self.config.shunt_timeout_cycles;
                debug!("Module {} shunts {:04b}", self.address, self.shunt_mask);
            }
            Err(e) => debug!("Module {} shunt argument dropped: {}", self.address, e),
        }
        // The raw argument word is echoed even when it could not be decoded
        self.transmit(&raw);
    }

    fn claim_address(&mut self, slot: u8) {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&slot) {
            warn!("Refusing address {}", slot);
            return;
        }

        self.hal.set_propagation(true);
        self.hal.delay_ms(self.config.settle_delay_ms);
        self.address = slot;
        self.mode = ModuleMode::Run;
        self.set_shunts(0);

        let next = Command::set_address(slot + 1).encode();
        if !(self.rx.send_break() && self.rx.send(&next)) {
            warn!("Module {} could not forward the address", slot);
        }
        info!("Module claimed address {}", slot);
    }

    fn enter_address_mode(&mut self) {
        debug!("Module {} entering address mode", self.address);
        self.address = 0;
        self.mode = ModuleMode::WaitAddr;
        self.blink_counter = 0;
        self.set_shunts(0);
        self.hal.set_propagation(false);
    }

    fn enter_updater(&mut self) {
        info!("Module {} entering updater", self.address);
        self.updater = Updater::new(self.config.max_pages);
        self.set_shunts(0);
        self.mode = ModuleMode::Updater;
    }

    fn poll_updater(&mut self) {
        let Some(len) = self.rx.frame_len() else {
            return;
        };
        if len != PAGE_FRAME_SIZE {
            self.rx.rearm();
            return;
        }

        let mut frame = [0u8; PAGE_FRAME_SIZE];
        frame.copy_from_slice(self.rx.frame());
        self.rx.rearm();

        match self.updater.handle_frame(&frame, &mut self.hal) {
            PageOutcome::CrcError => {
                if !self.rx.send_pulse() {
                    warn!("Could not signal page CRC error");
                }
            }
            PageOutcome::Complete => {
                info!("Firmware update complete, restarting application");
                self.address = 0;
                self.mode = ModuleMode::WaitAddr;
                self.blink_counter = 0;
                self.hal.set_propagation(false);
            }
            PageOutcome::Written(page) => debug!("Wrote page {}", page),
            PageOutcome::Ignored => {}
        }
    }

    fn blink(&mut self) {
        self.blink_counter += 1;
        if self.blink_counter >= self.config.blink_cycles {
            self.blink_counter = 0;
            self.led = (self.led + 1) % NUM_SHUNTS as u8;
            self.hal.set_shunts(1 << self.led);
        }
    }

    fn go_to_sleep(&mut self) {
        info!("Module {} idle for {} cycles, sleeping", self.address, self.empty_cycles);
        self.set_shunts(0);
        self.hal.set_propagation(false);
        self.rx.sleep();
        self.mode = ModuleMode::Sleep;
    }

    fn wake(&mut self) {
        debug!("Module {} woke up", self.address);
        self.empty_cycles = 0;
        self.hal.set_propagation(true);
        self.rx.rearm();
        self.rx.discard_until_break();
        self.mode = ModuleMode::Run;
    }

    fn set_shunts(&mut self, mask: u8) {
        self.shunt_mask = mask;
        self.hal.set_shunts(mask);
    }

    fn transmit(&mut self, bytes: &[u8]) {
        if !self.rx.send(bytes) {
            warn!("Module {} transmit queue full", self.address);
        }
    }
}
