//! Integration test: peer access between contexts.
//!
//! Run with: cargo test -p rocdrv-driver --test peer_access -- --nocapture

mod common;

use common::{context_on, sim_driver_with};
use rocdrv_core::config::{SimConfig, SimDeviceConfig};
use rocdrv_core::native::HipStatus;
use rocdrv_driver::{Driver, ErrorKind};

/// Devices 0 and 1 share a peer group, device 2 stands alone.
fn topology() -> Driver {
    let mut isolated = SimDeviceConfig::named("Simulated isolated device");
    isolated.peer_group = None;
    sim_driver_with(SimConfig {
        devices: vec![
            SimDeviceConfig::named("Simulated device A"),
            SimDeviceConfig::named("Simulated device B"),
            isolated,
        ],
        ..SimConfig::default()
    })
}

#[test]
fn test_context_can_always_access_itself() {
    let driver = topology();
    let a = context_on(&driver, 2);
    assert!(driver.can_enable_peer_access(&a, &a));
    driver.enable_peer_access(&a, &a).expect("self access");
}

#[test]
fn test_enable_is_idempotent() {
    let driver = topology();
    let a = context_on(&driver, 0);
    let b = context_on(&driver, 1);

    assert!(driver.can_enable_peer_access(&a, &b));
    driver.enable_peer_access(&a, &b).expect("first grant");
    driver.enable_peer_access(&a, &b).expect("second grant");
    driver.enable_peer_access(&b, &a).expect("reverse grant");
}

#[test]
fn test_unsupported_peer_access_fails() {
    let driver = topology();
    let a = context_on(&driver, 0);
    let c = context_on(&driver, 2);

    for (from, to) in [(&a, &c), (&c, &a)] {
        assert!(!driver.can_enable_peer_access(from, to));
        let err = driver.enable_peer_access(from, to).expect_err("unsupported");
        println!("{}", err);
        assert_eq!(err.native_status(), Some(HipStatus::ERROR_PEER_ACCESS_UNSUPPORTED));
    }
}

#[test]
fn test_contexts_on_the_same_device_can_access_each_other() {
    let driver = topology();
    let a = context_on(&driver, 0);
    let b = context_on(&driver, 0);
    assert_ne!(a.id(), b.id());

    assert!(driver.can_enable_peer_access(&a, &b));
    assert!(driver.can_enable_peer_access(&b, &a));
    driver.enable_peer_access(&a, &b).expect("same device");
    driver.enable_peer_access(&b, &a).expect("same device, reversed");
}

#[test]
fn test_destroyed_context_is_rejected_even_against_itself() {
    let driver = topology();
    let mut a = context_on(&driver, 0);
    let b = context_on(&driver, 1);
    driver.destroy_context(&mut a).expect("destroy");

    assert!(!driver.can_enable_peer_access(&a, &a));
    let err = driver.enable_peer_access(&a, &a).expect_err("destroyed context");
    println!("{}", err);
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    assert!(!driver.can_enable_peer_access(&b, &a));
    let err = driver.enable_peer_access(&b, &a).expect_err("destroyed peer");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}

#[test]
fn test_context_from_another_driver_is_rejected() {
    let driver = topology();
    let other = topology();
    let foreign = context_on(&other, 0);

    assert!(!driver.can_enable_peer_access(&foreign, &foreign));
    let err = driver.enable_peer_access(&foreign, &foreign).expect_err("foreign context");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}
