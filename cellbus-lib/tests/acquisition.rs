//! Round-robin acquisition against simulated modules

mod common;

use cellbus_lib::blocks::MeasurementBlock;
use cellbus_lib::comm::BmsComm;
use common::*;

#[test]
fn test_module_reply_on_the_wire() {
    let mut comm = BmsComm::new(SimBus::new(1, ModuleConfig::default()));
    comm.reset_address();
    comm.set_address();
    comm.start_acquisition(1);

    let reply = comm.bus_mut().received(13).expect("measurement block");
    assert_eq!(hex::encode(&reply), MODULE_1_BLOCK);
}

#[test]
fn test_fixture_block_parses() {
    let block = MeasurementBlock::parse(&hex_to_bytes(MODULE_1_BLOCK)).unwrap();
    assert_eq!(block.address, 1);
    assert_eq!(block.cell_voltages(), [3300, 3301, 3302, 3303]);
    assert_eq!(block.temperature_c(), 25);
}

#[test]
fn test_round_fills_pack_values() {
    let mut acq = master(3);
    run_until(&mut acq, MasterState::Run, 40);
    run_round(&mut acq);

    let stats = acq.stats().unwrap();
    assert_eq!(stats.cells, 12);
    assert_eq!(stats.min_mv, 3300);
    assert_eq!(stats.max_mv, 3311);
    assert_eq!(stats.avg_mv, 3305);
    assert_eq!(&acq.comm().voltages()[8..12], &[3308, 3309, 3310, 3311]);

    let status = acq.status();
    assert_eq!(status.modules.len(), 3);
    assert_eq!(status.modules[2].voltages, vec![3308, 3309, 3310, 3311]);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "Run");
    assert_eq!(json["comm_quality"], 100);
}

#[test]
fn test_comm_quality_drops_and_recovers() {
    let mut acq = master(3);
    run_until(&mut acq, MasterState::Run, 40);
    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 100);

    acq.comm_mut().bus_mut().port_mut().fail_module(1);
    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 90);
    assert_eq!(acq.state(), MasterState::Run);

    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 80);

    acq.comm_mut().bus_mut().port_mut().restore_module(1);
    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 100);
}

#[test]
fn test_stale_values_survive_a_missed_reply() {
    let mut acq = master(2);
    run_until(&mut acq, MasterState::Run, 40);
    run_round(&mut acq);

    let port = acq.comm_mut().bus_mut().port_mut();
    port.module_mut(0).set_measurements([3400, 3400, 3400, 3400, 30]);
    port.fail_module(0);
    run_round(&mut acq);
    assert_eq!(acq.comm().module_voltages(1).unwrap(), &[3300, 3301, 3302, 3303]);

    // the first visit after the restore was requested while still failed
    acq.comm_mut().bus_mut().port_mut().restore_module(0);
    run_round(&mut acq);
    run_round(&mut acq);
    assert_eq!(acq.comm().module_voltages(1).unwrap(), &[3400, 3400, 3400, 3400]);
    assert_eq!(acq.comm().temperatures()[0], 30);
}

#[test]
fn test_balancing_pass() {
    let config = BmsConfig {
        shunt_interval_ticks: 6,
        shunt_target_mv: 3306,
        ..quick_config(2)
    };
    let mut acq = Acquisition::new(SimBus::new(2, ModuleConfig::default()), config).unwrap();
    run_until(&mut acq, MasterState::Shunt, 60);
    run_until(&mut acq, MasterState::Run, 5);

    let bus = acq.comm().bus().port();
    assert_eq!(bus.module(0).shunt_mask(), 0);
    // 3307 mV on the last cell of module 2
    assert_eq!(bus.module(1).shunt_mask(), 0b1000);
    assert_eq!(bus.module(1).hal().shunts(), 0b1000);
}

#[test]
fn test_soc_follows_counted_charge() {
    let mut acq = master(1);
    run_until(&mut acq, MasterState::Run, 40);
    run_round(&mut acq);
    assert_eq!(acq.estimate_soc(), Some(58.0));

    // 100 Ah pack: 3600 As is one percent
    acq.calc_mut().record_current(-36.0, 100_000);
    run_round(&mut acq);
    assert!((acq.calc().soc() - 57.0).abs() < 1e-9);
}

#[test]
fn test_fifth_module_lands_at_its_offset() {
    let mut acq = master(5);
    acq.comm_mut()
        .bus_mut()
        .port_mut()
        .module_mut(4)
        .set_measurements([3350, 3351, 3352, 3353, (-7i8) as u8 as u16]);
    run_until(&mut acq, MasterState::Run, 60);
    run_round(&mut acq);

    // module 5 owns cells 16..20 and temperature slot 4
    assert_eq!(&acq.comm().voltages()[16..20], &[3350, 3351, 3352, 3353]);
    assert_eq!(acq.comm().temperatures()[4], -7);
    assert_eq!(acq.comm().module_voltages(5).unwrap(), &[3350, 3351, 3352, 3353]);
    assert_eq!(&acq.comm().voltages()[12..16], &[3312, 3313, 3314, 3315]);
    assert_eq!(acq.status().modules[4].address, 5);
}
