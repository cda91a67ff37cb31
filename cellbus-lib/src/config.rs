use crate::blocks::VersionInfo;
use crate::constants::{IMPLAUSIBLE_CELL_MV, MAX_ADDRESS, MAX_APPLICATION_PAGES, MIN_ADDRESS};
use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Voltage (mV) at 0 %, 10 %, ... 100 % state of charge of an LFP cell
pub const LFP_SOC_TABLE: [u16; 11] = [2700, 3223, 3257, 3283, 3292, 3295, 3302, 3323, 3331, 3334, 3357];

/// Master controller settings. Durations are counted in scheduler ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmsConfig {
    /// Number of cell modules installed on the bus
    pub expected_modules: u8,
    /// Cells above this voltage (mV) get their shunt switched on
    pub shunt_target_mv: u16,
    /// Wake-up broadcasts sent before addressing starts
    pub start_ticks: u32,
    /// Time allowed for the address chain to complete
    pub address_timeout_ticks: u32,
    /// Consecutive polls that must report the expected module count
    pub address_stable_polls: u32,
    /// Settle time between addressing and the first version request
    pub ready_ticks: u32,
    /// Time allowed for the first version reply
    pub version_timeout_ticks: u32,
    /// Time allowed for each further version reply
    pub version_retry_ticks: u32,
    /// Run time between two shunt passes
    pub shunt_interval_ticks: u32,
    /// Time between two firmware pages
    pub page_interval_ticks: u32,
    /// Page repeats tolerated in one firmware update before it is abandoned
    pub max_page_resends: u32,
    /// Bad rounds tolerated before comm quality reaches zero
    pub comm_quality_steps: u8,
    /// Voltage to state of charge lookup, 0 % to 100 % in 10 % steps
    pub soc_table: [u16; 11],
    /// Nominal pack capacity in Ah
    pub capacity_ah: f64,
    /// Scheduler period in milliseconds
    pub tick_period_ms: u64,
    /// Application pages of the module flash
    pub max_pages: u8,
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            expected_modules: 1,
            shunt_target_mv: 4200,
            start_ticks: 10,
            address_timeout_ticks: 30,
            address_stable_polls: 2,
            ready_ticks: 20,
            version_timeout_ticks: 20,
            version_retry_ticks: 10,
            shunt_interval_ticks: 300,
            page_interval_ticks: 4,
            max_page_resends: 20,
            comm_quality_steps: 10,
            soc_table: LFP_SOC_TABLE,
            capacity_ah: 100.0,
            tick_period_ms: 40,
            max_pages: MAX_APPLICATION_PAGES,
        }
    }
}

fn invalid(parameter: &str, value: impl ToString) -> BusError {
    BusError::Configuration {
        parameter: parameter.to_string(),
        value: value.to_string(),
    }
}

fn require_nonzero(parameter: &str, value: u32) -> BusResult<()> {
    if value == 0 {
        return Err(invalid(parameter, value));
    }
    Ok(())
}

fn validate_max_pages(max_pages: u8) -> BusResult<()> {
    if max_pages == 0 || max_pages > MAX_APPLICATION_PAGES {
        return Err(invalid("max_pages", max_pages));
    }
    Ok(())
}

impl BmsConfig {
    pub fn validate(&self) -> BusResult<()> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&self.expected_modules) {
            return Err(invalid("expected_modules", self.expected_modules));
        }
        if self.shunt_target_mv >= IMPLAUSIBLE_CELL_MV {
            return Err(invalid("shunt_target_mv", self.shunt_target_mv));
        }
        require_nonzero("start_ticks", self.start_ticks)?;
        require_nonzero("address_timeout_ticks", self.address_timeout_ticks)?;
        require_nonzero("address_stable_polls", self.address_stable_polls)?;
        require_nonzero("ready_ticks", self.ready_ticks)?;
        require_nonzero("version_timeout_ticks", self.version_timeout_ticks)?;
        require_nonzero("version_retry_ticks", self.version_retry_ticks)?;
        require_nonzero("shunt_interval_ticks", self.shunt_interval_ticks)?;
        require_nonzero("page_interval_ticks", self.page_interval_ticks)?;
        require_nonzero("max_page_resends", self.max_page_resends)?;
        if self.comm_quality_steps == 0 || self.comm_quality_steps > 10 {
            return Err(invalid("comm_quality_steps", self.comm_quality_steps));
        }
        if self.soc_table.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("soc_table", format!("{:?}", self.soc_table)));
        }
        if !(self.capacity_ah.is_finite() && self.capacity_ah > 0.0) {
            return Err(invalid("capacity_ah", self.capacity_ah));
        }
        if self.tick_period_ms == 0 {
            return Err(invalid("tick_period_ms", self.tick_period_ms));
        }
        validate_max_pages(self.max_pages)
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> BusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> BusResult<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> BusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Cell module firmware settings. Durations are counted in main loop cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Delay after enabling propagation before forwarding the next address
    pub settle_delay_ms: u32,
    /// Cycles without a valid command before the module goes to sleep
    pub max_empty_cycles: u32,
    /// Cycles a shunt stays on after the last SHUNTON
    pub shunt_timeout_cycles: u32,
    /// Cycles between two status LED steps while unaddressed
    pub blink_cycles: u32,
    /// Application pages the updater must receive
    pub max_pages: u8,
    /// Reported firmware version; the serial number comes from the hardware
    pub version: VersionInfo,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 10,
            max_empty_cycles: 65535,
            shunt_timeout_cycles: 65535,
            blink_cycles: 1000,
            max_pages: MAX_APPLICATION_PAGES,
            version: VersionInfo {
                sw_major: 2,
                sw_minor: 0,
                sw_patch: 13,
                sw_release: 'R',
                hw_revision: 1,
                hw_variant: 'A',
                serial: 0,
            },
        }
    }
}

impl ModuleConfig {
    pub fn validate(&self) -> BusResult<()> {
        require_nonzero("max_empty_cycles", self.max_empty_cycles)?;
        require_nonzero("blink_cycles", self.blink_cycles)?;
        validate_max_pages(self.max_pages)
    }

    pub fn from_json_str(json: &str) -> BusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
