//! Integration test: injected initialization failure.
//!
//! Lives in its own test binary because the injection flag is process-wide.

use rocdrv_driver::{set_inject_init_error, Driver, DriverConfig, ErrorKind};

#[test]
fn test_injected_init_failure_is_cached() {
    rocdrv_common::logging::try_init_logging();

    set_inject_init_error(true);
    let driver = Driver::new(DriverConfig::simulated()).expect("driver");
    let err = driver.init().expect_err("injected failure");
    assert_eq!(err.kind(), ErrorKind::InitFailed);

    // The outcome of the first attempt sticks.
    set_inject_init_error(false);
    assert_eq!(driver.init().map_err(|e| e.kind()), Err(ErrorKind::InitFailed));
    let err = driver.get_device_count().expect_err("uninitialized driver");
    assert_eq!(err.kind(), ErrorKind::InitFailed);

    let fresh = Driver::new(DriverConfig::simulated()).expect("driver");
    fresh.init().expect("init without injection");
    assert_eq!(fresh.get_device_count().expect("count"), 2);
}
