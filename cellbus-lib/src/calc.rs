//! Pack level values derived from the per-module stores.

use crate::config::LFP_SOC_TABLE;
use crate::constants::{IMPLAUSIBLE_CELL_MV, MIN_PLAUSIBLE_CELL_MV};
use serde::Serialize;

/// Currents below this magnitude (A) count as idle
pub const IDLE_CURRENT_A: f64 = 0.8;

/// Rest time after which the voltage based SoC estimate is trusted
pub const SOC_REST_MS: u64 = 3_600_000;

/// Aggregate of all plausible cell voltages
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackStats {
    pub min_mv: u16,
    pub max_mv: u16,
    pub avg_mv: u16,
    /// Sum of all plausible cells in volts
    pub pack_v: f64,
    pub cells: usize,
}

/// Min, max, average and sum over cells reading strictly between 50 and
/// 5000 mV. Unused channels read outside that range. Returns `None` when no
/// channel is plausible.
pub fn aggregate_voltages(voltages: &[u16]) -> Option<PackStats> {
    let plausible = voltages
        .iter()
        .copied()
        .filter(|&v| v > MIN_PLAUSIBLE_CELL_MV && v < IMPLAUSIBLE_CELL_MV);

    let mut min = u16::MAX;
    let mut max = 0;
    let mut sum: u64 = 0;
    let mut cells = 0;
    for v in plausible {
        min = min.min(v);
        max = max.max(v);
        sum += v as u64;
        cells += 1;
    }

    if cells == 0 {
        return None;
    }
    Some(PackStats {
        min_mv: min,
        max_mv: max,
        avg_mv: (sum / cells as u64) as u16,
        pack_v: sum as f64 / 1000.0,
        cells,
    })
}

pub fn temperature_average(temperatures: &[i8]) -> Option<f64> {
    if temperatures.is_empty() {
        return None;
    }
    let sum: i32 = temperatures.iter().map(|&t| t as i32).sum();
    Some(sum as f64 / temperatures.len() as f64)
}

/// Lookup of state of charge from a resting cell voltage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocEstimator {
    table: [u16; 11],
}

impl Default for SocEstimator {
    fn default() -> Self {
        Self::new(LFP_SOC_TABLE)
    }
}

impl SocEstimator {
    /// `table[i]` is the voltage at `i * 10` percent; must be increasing
    pub fn new(table: [u16; 11]) -> Self {
        Self { table }
    }

    /// Linear interpolation between table points, in percent
    pub fn estimate(&self, mv: u16) -> u8 {
        for (i, &point) in self.table.iter().enumerate() {
            if mv <= point {
                if i == 0 {
                    return 0;
                }
                let lower = self.table[i - 1] as u32;
                let span = (point as u32).saturating_sub(lower).max(1);
                let fraction = 10 * (mv as u32 - lower) / span;
                return ((i as u32 - 1) * 10 + fraction) as u8;
            }
        }
        100
    }
}

/// Coulomb counter fed with current samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChargeCounter {
    /// Charge into the pack in ampere seconds
    pub charge_in_as: f64,
    /// Charge out of the pack in ampere seconds
    pub charge_out_as: f64,
    /// Time the current has been below the idle threshold
    pub idle_ms: u64,
}

impl ChargeCounter {
    /// Integrates `current_a` (positive = charging) over `elapsed_ms`.
    pub fn record(&mut self, current_a: f64, elapsed_ms: u64) {
        let charge = current_a.abs() * elapsed_ms as f64 / 1000.0;
        if current_a > IDLE_CURRENT_A {
            self.charge_in_as += charge;
            self.idle_ms = 0;
        } else if current_a < -IDLE_CURRENT_A {
            self.charge_out_as += charge;
            self.idle_ms = 0;
        } else {
            self.idle_ms = self.idle_ms.saturating_add(elapsed_ms);
        }
    }

    pub fn reset_charge(&mut self) {
        self.charge_in_as = 0.0;
        self.charge_out_as = 0.0;
    }

    pub fn is_rested(&self) -> bool {
        self.idle_ms > SOC_REST_MS
    }
}

/// State of charge bookkeeping of the master
#[derive(Debug, Clone)]
pub struct BmsCalculation {
    estimator: SocEstimator,
    capacity_ah: f64,
    counter: ChargeCounter,
    soc_estimate: f64,
    soc: f64,
}

impl BmsCalculation {
    pub fn new(soc_table: [u16; 11], capacity_ah: f64) -> Self {
        Self {
            estimator: SocEstimator::new(soc_table),
            capacity_ah,
            counter: ChargeCounter::default(),
            soc_estimate: 0.0,
            soc: 0.0,
        }
    }

    pub fn record_current(&mut self, current_a: f64, elapsed_ms: u64) {
        self.counter.record(current_a, elapsed_ms);
    }

    pub fn counter(&self) -> &ChargeCounter {
        &self.counter
    }

    pub fn estimator(&self) -> &SocEstimator {
        &self.estimator
    }

    /// Seeds the SoC, e.g. from a value saved before power down
    pub fn set_soc_estimate(&mut self, soc: f64) {
        self.soc_estimate = soc;
        self.soc = soc;
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    pub fn soc_estimate(&self) -> f64 {
        self.soc_estimate
    }

    /// Updates the SoC after an acquisition round. A rested pack is
    /// re-estimated from `avg_mv` and the charge counters restart; otherwise
    /// the counted charge is applied to the last estimate.
    pub fn update_soc(&mut self, avg_mv: u16) -> f64 {
        if self.counter.is_rested() {
            self.soc_estimate = self.estimator.estimate(avg_mv) as f64;
            self.soc = self.soc_estimate;
            self.counter.reset_charge();
        } else {
            // As / 36 = Ah * 100, so dividing by Ah gives percent
            let delta = (self.counter.charge_in_as - self.counter.charge_out_as) / 36.0;
            self.soc = self.soc_estimate + delta / self.capacity_ah;
        }
        self.soc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_ignores_unused_channels() {
        let stats = aggregate_voltages(&[3300, 3310, 0, 65535, 3290, 50, 5000]).unwrap();
        assert_eq!(stats.min_mv, 3290);
        assert_eq!(stats.max_mv, 3310);
        assert_eq!(stats.avg_mv, 3300);
        assert_eq!(stats.cells, 3);
        assert!((stats.pack_v - 9.9).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_without_cells() {
        assert!(aggregate_voltages(&[0, 0, 6000]).is_none());
    }

    #[test]
    fn test_temperature_average() {
        assert_eq!(temperature_average(&[20, 30, -5, 15]), Some(15.0));
        assert_eq!(temperature_average(&[]), None);
    }

    #[test]
    fn test_soc_lookup() {
        let est = SocEstimator::default();
        assert_eq!(est.estimate(2500), 0);
        assert_eq!(est.estimate(2700), 0);
        assert_eq!(est.estimate(3223), 10);
        assert_eq!(est.estimate(3300), 57);
        assert_eq!(est.estimate(3357), 100);
        assert_eq!(est.estimate(3600), 100);
    }

    #[test]
    fn test_charge_counting() {
        let mut counter = ChargeCounter::default();
        counter.record(10.0, 1000);
        counter.record(-5.0, 2000);
        counter.record(0.5, 4000);
        assert_eq!(counter.charge_in_as, 10.0);
        assert_eq!(counter.charge_out_as, 10.0);
        assert_eq!(counter.idle_ms, 4000);
        assert!(!counter.is_rested());
    }

    #[test]
    fn test_soc_integration() {
        let mut calc = BmsCalculation::new(LFP_SOC_TABLE, 100.0);
        calc.set_soc_estimate(50.0);
        // 36 As into a 1 Ah pack would be 1 %; here 3600 As into 100 Ah is 1 %
        calc.record_current(36.0, 100_000);
        assert!((calc.update_soc(3300) - 51.0).abs() < 1e-9);
        assert_eq!(calc.soc_estimate(), 50.0);
    }

    #[test]
    fn test_soc_reestimated_after_rest() {
        let mut calc = BmsCalculation::new(LFP_SOC_TABLE, 100.0);
        calc.record_current(20.0, 1000);
        calc.record_current(0.0, SOC_REST_MS + 1);
        assert_eq!(calc.update_soc(3223), 10.0);
        assert_eq!(calc.counter().charge_in_as, 0.0);
    }
}
