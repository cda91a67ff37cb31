//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use cellbus_lib::acquisition::{Acquisition, CellModuleOp, MasterState};
#[allow(unused_imports)]
pub use cellbus_lib::command::{Command, Opcode};
#[allow(unused_imports)]
pub use cellbus_lib::config::{BmsConfig, ModuleConfig};
#[allow(unused_imports)]
pub use cellbus_lib::error::BusError;
#[allow(unused_imports)]
pub use cellbus_lib::line::Polarity;
#[allow(unused_imports)]
pub use cellbus_lib::module::ModuleMode;
#[allow(unused_imports)]
pub use cellbus_lib::sim::SimBus;
#[allow(unused_imports)]
pub use hex;

/// Routes library logs to the test output; `RUST_LOG=debug` shows bus traffic
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Measurement block of module 1 reading 3300, 3301, 3302, 3303 mV and 25 °C
#[allow(dead_code)]
pub const MODULE_1_BLOCK: &str = "01e40ce50ce60ce70c19001c91";

/// Master configuration with short start and settle phases
#[allow(dead_code)]
pub fn quick_config(modules: u8) -> BmsConfig {
    BmsConfig {
        expected_modules: modules,
        start_ticks: 2,
        ready_ticks: 2,
        ..Default::default()
    }
}

/// Master on a simulated chain of `modules` modules
#[allow(dead_code)]
pub fn master(modules: usize) -> Acquisition<SimBus> {
    init_tracing();
    Acquisition::new(SimBus::new(modules, ModuleConfig::default()), quick_config(modules as u8))
        .expect("valid configuration")
}

/// Ticks until `state` is reached; panics after `limit` ticks
#[allow(dead_code)]
pub fn run_until(acq: &mut Acquisition<SimBus>, state: MasterState, limit: usize) {
    for _ in 0..limit {
        if acq.state() == state {
            return;
        }
        acq.tick();
    }
    assert_eq!(acq.state(), state, "state not reached after {} ticks", limit);
}

/// Ticks until one more acquisition round has completed
#[allow(dead_code)]
pub fn run_round(acq: &mut Acquisition<SimBus>) {
    let target = acq.rounds() + 1;
    for _ in 0..1000 {
        if acq.rounds() >= target {
            return;
        }
        acq.tick();
    }
    panic!("round {} did not complete", target);
}
