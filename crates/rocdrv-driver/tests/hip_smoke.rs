//! Smoke test against the real HIP runtime. Skips when the runtime or a
//! device is unavailable.
//!
//! Run with: cargo test -p rocdrv-driver --test hip_smoke -- --nocapture

use rocdrv_driver::hip_driver::HipDriver;
use rocdrv_driver::{ContextFlags, Driver, DriverConfig};

#[test]
fn test_hip_device_round_trip() {
    rocdrv_common::logging::try_init_logging();

    let hip = match HipDriver::load(None) {
        Ok(hip) => hip,
        Err(e) => {
            println!("skipping: {}", e);
            return;
        }
    };
    let driver = Driver::from_native(hip, DriverConfig::default());
    if let Err(e) = driver.init() {
        println!("skipping: {}", e);
        return;
    }
    let count = driver.get_device_count().expect("count");
    if count == 0 {
        println!("skipping: no devices");
        return;
    }

    let props = driver.get_device_properties(0).expect("properties");
    println!("{:#?}", props);

    let device = driver.get_device(0).expect("device");
    let mut ctx = driver.create_context(device, ContextFlags::SCHEDULE_AUTO).expect("context");
    let mut ptr = driver.device_allocate(&ctx, 4096).expect("alloc");
    let input: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    driver.memcpy_h2d(&ctx, ptr, &input).expect("h2d");
    let mut output = vec![0u8; 4096];
    driver.memcpy_d2h(&ctx, &mut output, ptr).expect("d2h");
    assert_eq!(input, output);

    driver.device_deallocate(&ctx, &mut ptr).expect("free");
    driver.destroy_context(&mut ctx).expect("destroy");
}
