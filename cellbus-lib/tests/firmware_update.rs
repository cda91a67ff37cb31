//! Firmware streaming from the master to updater mode modules

mod common;

use cellbus_lib::module::ModuleSession;
use cellbus_lib::sim::{SimHal, SimLine};
use cellbus_lib::updater::FirmwareImage;
use common::*;

const PAGES: u8 = 4;

fn image_bytes() -> Vec<u8> {
    (0..200u32).map(|i| (i * 7) as u8).collect()
}

fn update_master(modules: usize) -> Acquisition<SimBus> {
    init_tracing();
    let module_config = ModuleConfig {
        max_pages: PAGES,
        ..Default::default()
    };
    let config = BmsConfig {
        max_pages: PAGES,
        ..quick_config(modules as u8)
    };
    let mut acq = Acquisition::new(SimBus::new(modules, module_config), config).unwrap();
    acq.load_firmware(&image_bytes()).unwrap();
    acq
}

fn flashed(module: &ModuleSession<SimLine, SimHal>, image: &FirmwareImage) -> bool {
    (0..PAGES).all(|page| module.hal().flash_page(page) == Some(&image.page(page).data))
}

#[test]
fn test_update_reaches_every_module() {
    let mut acq = update_master(2);
    run_until(&mut acq, MasterState::Run, 40);

    acq.set_operation(CellModuleOp::FwUpgrade);
    acq.tick();
    assert_eq!(acq.state(), MasterState::SwUpgrade);
    assert!(
        acq.comm()
            .bus()
            .port()
            .modules()
            .iter()
            .all(|m| m.mode() == ModuleMode::Updater)
    );

    run_until(&mut acq, MasterState::ResetAddress, 100);
    assert!(acq.comm().update_finished());
    assert_eq!(acq.comm().update_resends(), 0);

    let image = FirmwareImage::new(&image_bytes(), PAGES).unwrap();
    let bus = acq.comm().bus().port();
    for module in bus.modules() {
        assert!(flashed(module, &image));
        assert_eq!(module.hal().pages_written(), PAGES as usize);
        assert_eq!(module.mode(), ModuleMode::WaitAddr);
    }

    // the restarted modules are addressed again
    run_until(&mut acq, MasterState::Run, 40);
    assert_eq!(acq.num_modules(), 2);
}

#[test]
fn test_corrupted_page_is_sent_again() {
    let mut acq = update_master(2);
    run_until(&mut acq, MasterState::Run, 40);
    acq.set_operation(CellModuleOp::FwUpgrade);
    acq.tick();

    // page 0: byte 10 of the frame flipped on the wire
    acq.comm_mut().bus_mut().port_mut().corrupt_next_transmit(10, 0x04);
    run_until(&mut acq, MasterState::ResetAddress, 100);

    assert_eq!(acq.comm().update_resends(), 1);
    let image = FirmwareImage::new(&image_bytes(), PAGES).unwrap();
    for module in acq.comm().bus().port().modules() {
        assert!(flashed(module, &image));
        assert_eq!(module.hal().pages_written(), PAGES as usize);
    }
}

#[test]
fn test_update_is_abandoned_when_pages_keep_failing() {
    init_tracing();
    let module_config = ModuleConfig {
        max_pages: PAGES,
        ..Default::default()
    };
    let config = BmsConfig {
        max_pages: PAGES,
        max_page_resends: 3,
        ..quick_config(2)
    };
    let mut acq = Acquisition::new(SimBus::new(2, module_config), config).unwrap();
    acq.load_firmware(&image_bytes()).unwrap();
    run_until(&mut acq, MasterState::Run, 40);

    acq.set_operation(CellModuleOp::FwUpgrade);
    acq.tick();
    // every page frame arrives with a broken CRC
    acq.comm_mut().bus_mut().port_mut().corrupt_transmits(Some((10, 0x04)));
    run_until(&mut acq, MasterState::ResetAddress, 100);

    assert!(acq.comm().update_abandoned());
    assert!(!acq.comm().update_finished());
    assert_eq!(acq.comm().update_resends(), 3);
    for module in acq.comm().bus().port().modules() {
        assert_eq!(module.hal().pages_written(), 0);
        assert_eq!(module.updater().expected_page(), 0);
    }
}

#[test]
fn test_oversized_image_is_rejected() {
    let mut acq = update_master(1);
    let err = acq.load_firmware(&vec![0u8; PAGES as usize * 64 + 1]).unwrap_err();
    assert!(matches!(err, BusError::FirmwareTooLarge { size: 257, max: 256 }));
}
