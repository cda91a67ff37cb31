//! Bit errors injected on the simulated wire

mod common;

use common::*;

fn running(modules: usize) -> Acquisition<SimBus> {
    let mut acq = master(modules);
    run_until(&mut acq, MasterState::Run, 40);
    run_round(&mut acq);
    acq
}

#[test]
fn test_single_bit_error_is_corrected_by_the_module() {
    let mut acq = running(2);
    let before = acq.comm().bus().port().transmissions();

    acq.comm_mut().bus_mut().port_mut().corrupt_next_transmit(1, 0x20);
    run_round(&mut acq);
    run_round(&mut acq);

    assert!(acq.comm().bus().port().transmissions() > before);
    assert_eq!(acq.comm_quality(), 100);
}

#[test]
fn test_double_bit_error_costs_one_step() {
    let mut acq = running(2);

    // the next request goes to module 2
    acq.comm_mut().bus_mut().port_mut().corrupt_next_transmit(0, 0x05);
    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 90);

    run_round(&mut acq);
    assert_eq!(acq.comm_quality(), 100);
}

#[test]
fn test_corrupted_argument_word_is_echoed() {
    let mut comm = cellbus_lib::comm::BmsComm::new(SimBus::new(1, ModuleConfig::default()));
    comm.reset_address();
    comm.set_address();

    let mut frame = Command::shunt_on(1, 0b0011).encode().to_vec();
    frame[2] ^= 0x81;
    comm.bus_mut().send(&frame);

    assert_eq!(comm.bus().port().module(0).shunt_mask(), 0);
    let echo = comm.bus_mut().received(2).unwrap();
    assert_eq!(echo.as_ref(), &frame[2..]);
}
