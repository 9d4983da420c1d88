//! Integration test: device queries.
//!
//! Run with: cargo test -p rocdrv-driver --test devices -- --nocapture

mod common;

use common::{sim_driver, sim_driver_with};
use rocdrv_core::config::{SimConfig, SimDeviceConfig};
use rocdrv_driver::{Dim3, ErrorKind};

#[test]
fn test_enumerate_devices() {
    let driver = sim_driver();
    assert_eq!(driver.get_device_count().expect("count"), 2);
    assert_eq!(driver.get_driver_version().expect("version"), 60_000_000);

    for ordinal in 0..2 {
        let props = driver.get_device_properties(ordinal).expect("properties");
        println!("{:#?}", props);
        assert_eq!(props.ordinal, ordinal);
        assert_eq!(props.name, "Simulated gfx90a");
        assert_eq!((props.compute_capability_major, props.compute_capability_minor), (9, 0));
        assert_eq!(props.multiprocessor_count, 104);
        assert_eq!(props.warp_size, 64);
        assert_eq!(props.max_threads_per_block, 1024);
        assert_eq!(props.max_grid_dims, Dim3::new(i32::MAX as u32, 65536, 65536));
        assert_eq!(props.total_memory, 1 << 30);
        assert!(!props.ecc_enabled);
        assert!(props.pci_bus_id.is_some());
    }
}

#[test]
fn test_individual_queries_match_configuration() {
    let mut device = SimDeviceConfig::named("Simulated MI-test");
    device.multiprocessors = 8;
    device.ecc_enabled = true;
    device.pci_bus_id = Some("0000:C1:00.0".into());
    let driver = sim_driver_with(SimConfig {
        devices: vec![device],
        ..SimConfig::default()
    });

    let dev = driver.get_device(0).expect("device");
    assert_eq!(driver.get_device_name(dev).expect("name"), "Simulated MI-test");
    assert_eq!(driver.get_multiprocessor_count(dev).expect("sms"), 8);
    assert!(driver.is_ecc_enabled(dev).expect("ecc"));
    assert_eq!(driver.get_pci_bus_id(dev).expect("pci"), "0000:c1:00.0");
    assert_eq!(driver.get_max_shared_memory_per_block(dev).expect("smem"), 65536);
    assert_eq!(driver.get_max_shared_memory_per_core(dev).expect("smem/sm"), 65536);
    assert_eq!(driver.get_max_registers_per_block(dev).expect("regs"), 65536);
    assert_eq!(driver.get_max_threads_per_multiprocessor(dev).expect("threads/sm"), 2048);
    assert_eq!(driver.get_grid_limits(dev).expect("grid").y, 65536);
}

#[test]
fn test_unknown_ordinal_is_invalid_argument() {
    let driver = sim_driver();
    let err = driver.get_device(5).expect_err("no such device");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(driver.get_device_properties(-1).is_err());
}
