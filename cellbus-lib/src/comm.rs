//! Master side command/reply layer. Holds the latest values of every module.

use crate::blocks::{MeasurementBlock, VersionInfo};
use crate::command::{Command, Opcode};
use crate::constants::{
    COMMAND_WORD_SIZE, IMPLAUSIBLE_CELL_MV, MAX_MODULES, MEASUREMENT_BLOCK_SIZE, NUM_INPUTS, VERSION_BLOCK_SIZE,
};
use crate::line::Polarity;
use crate::onewire::{BusPort, OneWire};
use crate::updater::FirmwareImage;
use tracing::{debug, info, warn};

struct UpdateSession {
    image: FirmwareImage,
    next_page: u8,
    resends: u32,
    max_resends: u32,
    abandoned: bool,
}

pub struct BmsComm<P: BusPort> {
    bus: OneWire<P>,
    voltages: [u16; MAX_MODULES * NUM_INPUTS],
    temperatures: [i8; MAX_MODULES],
    versions: [Option<VersionInfo>; MAX_MODULES],
    update: Option<UpdateSession>,
}

fn module_index(module: u8) -> Option<usize> {
    let index = (module as usize).checked_sub(1)?;
    (index < MAX_MODULES).then_some(index)
}

impl<P: BusPort> BmsComm<P> {
    pub fn new(port: P) -> Self {
        Self {
            bus: OneWire::new(port),
            voltages: [0; MAX_MODULES * NUM_INPUTS],
            temperatures: [0; MAX_MODULES],
            versions: [None; MAX_MODULES],
            update: None,
        }
    }

    pub fn bus(&self) -> &OneWire<P> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut OneWire<P> {
        &mut self.bus
    }

    pub fn set_polarity(&mut self, polarity: Polarity) {
        self.bus.set_polarity(polarity);
    }

    pub fn send_command(&mut self, command: &Command) {
        debug!("Sending {}", command);
        self.bus.send(&command.encode());
    }

    /// Starts the address chain at slot 1
    pub fn set_address(&mut self) {
        self.send_command(&Command::set_address(1));
    }

    /// Sends every module back to address mode
    pub fn reset_address(&mut self) {
        self.send_command(&Command::address_mode());
    }

    /// Reads the address chain result: the last module forwards SETADDR(n+1).
    pub fn poll_module_count(&mut self) -> Option<u8> {
        let word = self.bus.received(COMMAND_WORD_SIZE)?;
        let command = match Command::decode(&word) {
            Ok(command) => command,
            Err(e) => {
                debug!("No module count in {:02x?}: {}", word.as_ref(), e);
                return None;
            }
        };
        if command.opcode != Opcode::SetAddress || command.address as usize > MAX_MODULES {
            return None;
        }
        command.address.checked_sub(1)
    }

    pub fn start_acquisition(&mut self, module: u8) {
        self.send_command(&Command::get_data(module));
    }

    /// Evaluates the measurement reply of `module`. Returns false if it is
    /// missing, has the wrong length, fails the CRC or names another module.
    pub fn acquire(&mut self, module: u8) -> bool {
        let Some(index) = module_index(module) else {
            return false;
        };
        let Some(data) = self.bus.received(MEASUREMENT_BLOCK_SIZE) else {
            debug!("Module {} did not answer", module);
            return false;
        };
        let block = match MeasurementBlock::parse(&data) {
            Ok(block) => block,
            Err(e) => {
                debug!("Module {} reply dropped: {}", module, e);
                return false;
            }
        };
        if block.address != module {
            debug!("Expected module {}, block from {}", module, block.address);
            return false;
        }

        let offset = index * NUM_INPUTS;
        self.voltages[offset..offset + NUM_INPUTS].copy_from_slice(&block.cell_voltages());
        self.temperatures[index] = block.temperature_c();
        true
    }

    pub fn start_version_acquisition(&mut self, module: u8) {
        self.send_command(&Command::version(module));
    }

    pub fn acquire_version(&mut self, module: u8) -> bool {
        let Some(index) = module_index(module) else {
            return false;
        };
        let Some(data) = self.bus.received(VERSION_BLOCK_SIZE) else {
            return false;
        };
        match VersionInfo::parse(&data) {
            Ok(info) => {
                self.versions[index] = Some(info);
                true
            }
            Err(e) => {
                debug!("Module {} version dropped: {}", module, e);
                false
            }
        }
    }

    /// Switches on the shunts of every cell of `module` above `target_mv`.
    /// Returns the mask that was sent.
    pub fn set_shunt(&mut self, module: u8, target_mv: u16) -> u16 {
        let Some(index) = module_index(module) else {
            return 0;
        };
        let cells = &self.voltages[index * NUM_INPUTS..(index + 1) * NUM_INPUTS];
        let mask = cells
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v > target_mv && v < IMPLAUSIBLE_CELL_MV)
            .fold(0u16, |mask, (i, _)| mask | (1 << i));

        self.send_command(&Command::shunt_on(module, mask));
        mask
    }

    /// Broadcasts BOOT and prepares to stream `image`. The update is
    /// abandoned when a module reports an error after `max_resends` repeats.
    pub fn start_update(&mut self, image: FirmwareImage, max_resends: u32) {
        info!("Starting firmware update, {} pages", image.max_pages());
        self.update = Some(UpdateSession {
            image,
            next_page: 0,
            resends: 0,
            max_resends,
            abandoned: false,
        });
        self.send_command(&Command::boot());
    }

    /// Sends the next page, or repeats the previous one if a module reported
    /// an error after it. Returns the number of the page to send next.
    pub fn update_next_page(&mut self) -> u8 {
        let Some(update) = self.update.as_mut() else {
            return 0;
        };
        if update.abandoned {
            return update.next_page;
        }

        if self.bus.is_receiving() && update.next_page > 0 {
            if let Some(reply) = self.bus.received(1) {
                if reply[0] != 0 && update.resends >= update.max_resends {
                    warn!(
                        "Module reported error 0x{:02X} on page {} after {} resends, abandoning update",
                        reply[0],
                        update.next_page - 1,
                        update.resends
                    );
                    update.abandoned = true;
                    return update.next_page;
                }
                if reply[0] != 0 {
                    update.next_page -= 1;
                    update.resends += 1;
                    warn!("Module reported error 0x{:02X}, resending page {}", reply[0], update.next_page);
                }
            }
        }

        if update.next_page < update.image.total_pages() && self.bus.is_receiving() {
            let frame = update.image.page(update.next_page).to_bytes();
            debug!("Sending page {}", update.next_page);
            self.bus.send(&frame);
            update.next_page += 1;
        }
        update.next_page
    }

    pub fn update_finished(&self) -> bool {
        self.update
            .as_ref()
            .is_some_and(|u| u.next_page >= u.image.total_pages())
    }

    /// True once the resend limit was exceeded; no more pages are sent
    pub fn update_abandoned(&self) -> bool {
        self.update.as_ref().is_some_and(|u| u.abandoned)
    }

    pub fn update_resends(&self) -> u32 {
        self.update.as_ref().map_or(0, |u| u.resends)
    }

    pub fn voltages(&self) -> &[u16] {
        &self.voltages
    }

    pub fn module_voltages(&self, module: u8) -> Option<&[u16]> {
        let index = module_index(module)?;
        Some(&self.voltages[index * NUM_INPUTS..(index + 1) * NUM_INPUTS])
    }

    pub fn temperatures(&self) -> &[i8] {
        &self.temperatures
    }

    pub fn versions(&self) -> &[Option<VersionInfo>] {
        &self.versions
    }
}
