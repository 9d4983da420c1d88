//! Shared setup for the driver integration tests.
#![allow(dead_code)]

use rocdrv_core::config::{SimConfig, SimDeviceConfig};
use rocdrv_driver::{Context, ContextFlags, Driver, DriverConfig};

/// Code object declaring the kernels the simulated device ships with.
pub const KERNELS: &str = r#"
.version 7.0
.target gfx90a
.global .align 4 .u32 launch_count;

.visible .entry identity(
    .param .u64 input,
    .param .u64 output,
    .param .u32 n
)
.maxntid 256, 1, 1
{
    ret;
}

.visible .entry fill_u32(
    .param .u64 output,
    .param .u32 value,
    .param .u32 n
)
{
    ret;
}
"#;

pub fn sim_driver() -> Driver {
    sim_driver_with(SimConfig::default())
}

pub fn sim_driver_with(sim: SimConfig) -> Driver {
    rocdrv_common::logging::try_init_logging();
    let mut config = DriverConfig::simulated();
    config.sim = sim;
    let driver = Driver::new(config).expect("simulated driver");
    driver.init().expect("init");
    driver
}

/// A driver whose single device has `memory_bytes` of memory.
pub fn small_sim_driver(memory_bytes: u64) -> Driver {
    let mut device = SimDeviceConfig::named("Simulated small device");
    device.memory_bytes = memory_bytes;
    sim_driver_with(SimConfig {
        devices: vec![device],
        ..SimConfig::default()
    })
}

pub fn context_on(driver: &Driver, ordinal: i32) -> Context {
    let device = driver.get_device(ordinal).expect("device");
    driver
        .create_context(device, ContextFlags::SCHEDULE_AUTO)
        .expect("context")
}
