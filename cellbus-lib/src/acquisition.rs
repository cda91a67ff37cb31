//! Master acquisition state machine.
//!
//! One [`Acquisition::tick`] per scheduler period. Replies are read on the
//! tick after their request, so every state that waits for a module keeps
//! track of the request it has in flight.

use crate::blocks::VersionInfo;
use crate::calc::{BmsCalculation, PackStats, aggregate_voltages, temperature_average};
use crate::comm::BmsComm;
use crate::config::BmsConfig;
use crate::constants::NUM_INPUTS;
use crate::error::BusResult;
use crate::line::Polarity;
use crate::onewire::BusPort;
use crate::updater::FirmwareImage;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum MasterState {
    Start = 0,
    ResetAddress = 1,
    SetAddress = 2,
    WaitAddress = 3,
    WaitReady = 4,
    GetVersion = 5,
    Run = 6,
    Shunt = 7,
    Standby = 8,
    #[strum(to_string = "SWUpgrade")]
    SwUpgrade = 9,
}

/// Operator request, checked on every module visit in Run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
pub enum CellModuleOp {
    #[default]
    None,
    AssignAddress,
    /// Holds the machine in Standby until cleared
    StopAcq,
    FwUpgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Data(u8),
    Version(u8),
}

/// Latest values of one module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub address: u8,
    pub voltages: Vec<u16>,
    pub temperature: i8,
    pub version: Option<VersionInfo>,
}

/// Snapshot for display and logging
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionStatus {
    pub state: MasterState,
    pub polarity: Polarity,
    pub num_modules: u8,
    pub comm_quality: u8,
    pub rounds: u64,
    pub ticks: u64,
    pub stats: Option<PackStats>,
    pub temperature_avg: Option<f64>,
    pub soc: f64,
    pub modules: Vec<ModuleStatus>,
}

pub struct Acquisition<P: BusPort> {
    comm: BmsComm<P>,
    calc: BmsCalculation,
    config: BmsConfig,
    state: MasterState,
    timeout: u32,
    stable_polls: u32,
    num_modules: u8,
    current_module: u8,
    shunt_module: u8,
    pending: Pending,
    round_ok: bool,
    quality_steps: u8,
    rounds: u64,
    ticks: u64,
    page_timer: u32,
    operation: CellModuleOp,
    firmware: Option<FirmwareImage>,
    stats: Option<PackStats>,
    temperature_avg: Option<f64>,
}

impl<P: BusPort> Acquisition<P> {
    pub fn new(port: P, config: BmsConfig) -> BusResult<Self> {
        config.validate()?;
        Ok(Self {
            comm: BmsComm::new(port),
            calc: BmsCalculation::new(config.soc_table, config.capacity_ah),
            state: MasterState::Start,
            timeout: config.start_ticks,
            stable_polls: 0,
            num_modules: 0,
            current_module: 1,
            shunt_module: 1,
            pending: Pending::None,
            round_ok: true,
            quality_steps: config.comm_quality_steps,
            rounds: 0,
            ticks: 0,
            page_timer: 0,
            operation: CellModuleOp::None,
            firmware: None,
            stats: None,
            temperature_avg: None,
            config,
        })
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn comm(&self) -> &BmsComm<P> {
        &self.comm
    }

    pub fn comm_mut(&mut self) -> &mut BmsComm<P> {
        &mut self.comm
    }

    pub fn calc(&self) -> &BmsCalculation {
        &self.calc
    }

    pub fn calc_mut(&mut self) -> &mut BmsCalculation {
        &mut self.calc
    }

    pub fn config(&self) -> &BmsConfig {
        &self.config
    }

    pub fn operation(&self) -> CellModuleOp {
        self.operation
    }

    pub fn set_operation(&mut self, operation: CellModuleOp) {
        info!("Operator request {}", operation);
        self.operation = operation;
    }

    /// Percentage of recent rounds that completed without a missing reply
    pub fn comm_quality(&self) -> u8 {
        self.quality_steps.saturating_mul(10)
    }

    pub fn stats(&self) -> Option<PackStats> {
        self.stats
    }

    pub fn temperature_avg(&self) -> Option<f64> {
        self.temperature_avg
    }

    pub fn num_modules(&self) -> u8 {
        self.num_modules
    }

    pub fn polarity(&self) -> Polarity {
        self.comm.bus().polarity()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Completed acquisition rounds
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Stores the image streamed by the next FwUpgrade request
    pub fn load_firmware(&mut self, image: &[u8]) -> BusResult<()> {
        let image = FirmwareImage::new(image, self.config.max_pages)?;
        info!("Firmware image loaded, {} pages", image.max_pages());
        self.firmware = Some(image);
        Ok(())
    }

    /// Re-seeds the SoC from the average cell voltage of the last round
    pub fn estimate_soc(&mut self) -> Option<f64> {
        let stats = self.stats?;
        let soc = self.calc.estimator().estimate(stats.avg_mv) as f64;
        self.calc.set_soc_estimate(soc);
        Some(soc)
    }

    pub fn status(&self) -> AcquisitionStatus {
        let modules = (1..=self.num_modules)
            .map(|address| {
                let index = address as usize - 1;
                ModuleStatus {
                    address,
                    voltages: self.comm.voltages()[index * NUM_INPUTS..(index + 1) * NUM_INPUTS].to_vec(),
                    temperature: self.comm.temperatures()[index],
                    version: self.comm.versions()[index],
                }
            })
            .collect();

        AcquisitionStatus {
            state: self.state,
            polarity: self.polarity(),
            num_modules: self.num_modules,
            comm_quality: self.comm_quality(),
            rounds: self.rounds,
            ticks: self.ticks,
            stats: self.stats,
            temperature_avg: self.temperature_avg,
            soc: self.calc.soc(),
            modules,
        }
    }

    /// Advances the machine by one scheduler period
    pub fn tick(&mut self) {
        self.ticks += 1;
        let before = self.state;

        match self.state {
            MasterState::Start => {
                // Any edge wakes sleeping modules
                self.comm.start_version_acquisition(1);
                self.timeout = self.timeout.saturating_sub(1);
                if self.timeout == 0 {
                    self.state = MasterState::ResetAddress;
                }
            }
            MasterState::ResetAddress => {
                self.comm.reset_address();
                self.num_modules = 0;
                self.pending = Pending::None;
                self.state = MasterState::SetAddress;
            }
            MasterState::SetAddress => {
                self.comm.set_address();
                self.timeout = self.config.address_timeout_ticks;
                self.stable_polls = 0;
                self.state = MasterState::WaitAddress;
            }
            MasterState::WaitAddress => self.wait_address(),
            MasterState::WaitReady => {
                self.timeout = self.timeout.saturating_sub(1);
                if self.timeout == 0 {
                    self.current_module = 1;
                    self.timeout = self.config.version_timeout_ticks;
                    self.state = MasterState::GetVersion;
                }
            }
            MasterState::GetVersion => self.get_version(),
            MasterState::Run => self.run(),
            MasterState::Shunt => self.shunt(),
            MasterState::Standby => {
                if self.operation != CellModuleOp::StopAcq {
                    self.state = MasterState::Run;
                }
            }
            MasterState::SwUpgrade => self.upgrade(),
        }

        if self.state != before {
            debug!("Master state {} -> {}", before, self.state);
        }
    }

    fn wait_address(&mut self) {
        let count = self.comm.poll_module_count();
        if count == Some(self.config.expected_modules) {
            self.stable_polls += 1;
        } else {
            self.stable_polls = 0;
        }

        if self.stable_polls >= self.config.address_stable_polls {
            info!("{} modules addressed", self.config.expected_modules);
            self.num_modules = self.config.expected_modules;
            self.timeout = self.config.ready_ticks;
            self.state = MasterState::WaitReady;
            return;
        }

        self.timeout = self.timeout.saturating_sub(1);
        if self.timeout == 0 {
            let polarity = self.comm.bus().polarity().toggled();
            warn!(
                "Addressing timed out (last count {:?}, expected {}), switching to {} polarity",
                count, self.config.expected_modules, polarity
            );
            self.comm.set_polarity(polarity);
            self.state = MasterState::ResetAddress;
        }
    }

    fn get_version(&mut self) {
        if let Pending::Version(module) = std::mem::replace(&mut self.pending, Pending::None) {
            if self.comm.acquire_version(module) {
                self.timeout = self.config.version_retry_ticks;
                if module >= self.num_modules {
                    self.enter_run();
                    return;
                }
                self.current_module = module + 1;
            }
        }

        if self.timeout == 0 {
            warn!("Module {} did not report its version", self.current_module);
            self.state = MasterState::ResetAddress;
            return;
        }
        self.timeout -= 1;
        self.comm.start_version_acquisition(self.current_module);
        self.pending = Pending::Version(self.current_module);
    }

    fn enter_run(&mut self) {
        info!("Acquisition running with {} modules", self.num_modules);
        self.current_module = 1;
        self.shunt_module = 1;
        self.round_ok = true;
        self.timeout = self.config.shunt_interval_ticks;
        self.state = MasterState::Run;
    }

    fn run(&mut self) {
        self.evaluate_pending();

        match self.operation {
            CellModuleOp::FwUpgrade => {
                self.operation = CellModuleOp::None;
                self.begin_upgrade();
                return;
            }
            CellModuleOp::AssignAddress => {
                self.operation = CellModuleOp::None;
                self.state = MasterState::ResetAddress;
                return;
            }
            CellModuleOp::StopAcq => {
                self.state = MasterState::Standby;
                return;
            }
            CellModuleOp::None => {}
        }

        if self.timeout == 0 {
            self.timeout = self.config.shunt_interval_ticks;
            self.shunt_module = 1;
            self.state = MasterState::Shunt;
            return;
        }
        self.timeout -= 1;

        let module = self.current_module;
        self.comm.start_acquisition(module);
        self.pending = Pending::Data(module);
        self.current_module = if module >= self.num_modules { 1 } else { module + 1 };
    }

    fn evaluate_pending(&mut self) {
        let Pending::Data(module) = std::mem::replace(&mut self.pending, Pending::None) else {
            return;
        };
        if !self.comm.acquire(module) {
            debug!("No valid data from module {} this round", module);
            self.round_ok = false;
        }
        if module >= self.num_modules {
            self.finish_round();
        }
    }

    fn finish_round(&mut self) {
        if self.round_ok {
            self.quality_steps = self.config.comm_quality_steps;
        } else {
            self.quality_steps = self.quality_steps.saturating_sub(1);
            debug!("Round incomplete, comm quality {}", self.comm_quality());
        }
        self.round_ok = true;
        self.rounds += 1;

        let count = self.num_modules as usize;
        self.stats = aggregate_voltages(&self.comm.voltages()[..count * NUM_INPUTS]);
        self.temperature_avg = temperature_average(&self.comm.temperatures()[..count]);
        if let Some(stats) = self.stats {
            self.calc.update_soc(stats.avg_mv);
        }
    }

    fn shunt(&mut self) {
        let module = self.shunt_module;
        let mask = self.comm.set_shunt(module, self.config.shunt_target_mv);
        if mask != 0 {
            debug!("Module {} balancing mask {:04b}", module, mask);
        }
        if module >= self.num_modules {
            // Run picks up the interrupted round at `current_module`
            self.state = MasterState::Run;
        } else {
            self.shunt_module = module + 1;
        }
    }

    fn begin_upgrade(&mut self) {
        let Some(image) = self.firmware.clone() else {
            warn!("Firmware upgrade requested without an image");
            return;
        };
        self.comm.start_update(image, self.config.max_page_resends);
        self.page_timer = self.config.page_interval_ticks;
        self.state = MasterState::SwUpgrade;
    }

    fn upgrade(&mut self) {
        self.page_timer = self.page_timer.saturating_sub(1);
        if self.page_timer > 0 {
            return;
        }
        self.page_timer = self.config.page_interval_ticks;

        let page = self.comm.update_next_page();
        if self.comm.update_abandoned() {
            warn!(
                "Firmware upgrade abandoned at page {} after {} resends",
                page,
                self.comm.update_resends()
            );
            self.state = MasterState::ResetAddress;
        } else if self.comm.update_finished() {
            info!(
                "Firmware upgrade finished after {} pages, {} resends",
                page,
                self.comm.update_resends()
            );
            self.state = MasterState::ResetAddress;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::sim::SimBus;

    fn config(modules: u8) -> BmsConfig {
        BmsConfig {
            expected_modules: modules,
            start_ticks: 2,
            ready_ticks: 2,
            ..Default::default()
        }
    }

    fn run_until(acq: &mut Acquisition<SimBus>, state: MasterState, limit: usize) -> bool {
        for _ in 0..limit {
            if acq.state() == state {
                return true;
            }
            acq.tick();
        }
        acq.state() == state
    }

    #[test]
    fn test_state_numbering() {
        assert_eq!(MasterState::try_from(6).unwrap(), MasterState::Run);
        assert_eq!(u8::from(MasterState::SwUpgrade), 9);
        assert_eq!(MasterState::SwUpgrade.to_string(), "SWUpgrade");
    }

    #[test]
    fn test_startup_sequence() {
        let mut acq = Acquisition::new(SimBus::new(2, ModuleConfig::default()), config(2)).unwrap();
        let mut states = vec![acq.state()];
        for _ in 0..20 {
            acq.tick();
            if states.last() != Some(&acq.state()) {
                states.push(acq.state());
            }
        }
        assert_eq!(
            states,
            vec![
                MasterState::Start,
                MasterState::ResetAddress,
                MasterState::SetAddress,
                MasterState::WaitAddress,
                MasterState::WaitReady,
                MasterState::GetVersion,
                MasterState::Run,
            ]
        );
        assert_eq!(acq.num_modules(), 2);
        assert_eq!(acq.comm().versions()[1].unwrap().serial, 0x1001);
    }

    #[test]
    fn test_round_statistics() {
        let mut acq = Acquisition::new(SimBus::new(2, ModuleConfig::default()), config(2)).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        for _ in 0..3 {
            acq.tick();
        }
        assert_eq!(acq.rounds(), 1);
        let stats = acq.stats().unwrap();
        assert_eq!(stats.cells, 8);
        assert_eq!(stats.min_mv, 3300);
        assert_eq!(stats.max_mv, 3307);
        assert_eq!(acq.temperature_avg(), Some(25.0));
        assert_eq!(acq.comm_quality(), 100);
    }

    #[test]
    fn test_wrong_module_count_times_out() {
        let cfg = BmsConfig {
            address_timeout_ticks: 3,
            ..config(3)
        };
        let mut acq = Acquisition::new(SimBus::new(2, ModuleConfig::default()), cfg).unwrap();
        assert!(run_until(&mut acq, MasterState::WaitAddress, 10));
        for _ in 0..3 {
            acq.tick();
        }
        assert_eq!(acq.state(), MasterState::ResetAddress);
        assert_eq!(acq.polarity(), Polarity::Inverted);
    }

    #[test]
    fn test_stop_acquisition() {
        let mut acq = Acquisition::new(SimBus::new(1, ModuleConfig::default()), config(1)).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        acq.set_operation(CellModuleOp::StopAcq);
        acq.tick();
        assert_eq!(acq.state(), MasterState::Standby);
        acq.tick();
        assert_eq!(acq.state(), MasterState::Standby);

        acq.set_operation(CellModuleOp::None);
        acq.tick();
        assert_eq!(acq.state(), MasterState::Run);
    }

    #[test]
    fn test_assign_address_request_is_consumed() {
        let mut acq = Acquisition::new(SimBus::new(1, ModuleConfig::default()), config(1)).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        acq.set_operation(CellModuleOp::AssignAddress);
        acq.tick();
        assert_eq!(acq.state(), MasterState::ResetAddress);
        assert_eq!(acq.operation(), CellModuleOp::None);
        assert!(run_until(&mut acq, MasterState::Run, 40));
    }

    #[test]
    fn test_upgrade_without_image_stays_in_run() {
        let mut acq = Acquisition::new(SimBus::new(1, ModuleConfig::default()), config(1)).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        acq.set_operation(CellModuleOp::FwUpgrade);
        acq.tick();
        assert_eq!(acq.state(), MasterState::Run);
        assert_eq!(acq.operation(), CellModuleOp::None);
    }

    #[test]
    fn test_shunt_pass() {
        let cfg = BmsConfig {
            shunt_interval_ticks: 4,
            shunt_target_mv: 3305,
            ..config(2)
        };
        let mut acq = Acquisition::new(SimBus::new(2, ModuleConfig::default()), cfg).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        assert!(run_until(&mut acq, MasterState::Shunt, 10));
        acq.tick();
        acq.tick();
        assert_eq!(acq.state(), MasterState::Run);

        // module 2 reads 3304..3307 mV
        let bus = acq.comm().bus().port();
        assert_eq!(bus.module(0).shunt_mask(), 0);
        assert_eq!(bus.module(1).shunt_mask(), 0b1100);
    }

    #[test]
    fn test_round_continues_after_shunt_pass() {
        let cfg = BmsConfig {
            shunt_interval_ticks: 4,
            ..config(3)
        };
        let mut acq = Acquisition::new(SimBus::new(3, ModuleConfig::default()), cfg).unwrap();
        assert!(run_until(&mut acq, MasterState::Run, 40));
        // the interval runs out one visit into the second round
        assert!(run_until(&mut acq, MasterState::Shunt, 10));
        assert_eq!(acq.rounds(), 1);
        assert!(run_until(&mut acq, MasterState::Run, 5));

        // modules 2 and 3 are still due, then the round closes
        acq.tick();
        acq.tick();
        assert_eq!(acq.rounds(), 1);
        acq.tick();
        assert_eq!(acq.rounds(), 2);
        assert_eq!(acq.comm_quality(), 100);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = BmsConfig {
            expected_modules: 0,
            ..Default::default()
        };
        assert!(Acquisition::new(SimBus::new(0, ModuleConfig::default()), cfg).is_err());
    }
}
