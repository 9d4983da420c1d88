//! Exercises the simulated backend through the raw `NativeDriver` surface.

use std::ffi::c_void;
use std::sync::mpsc;
use std::time::Duration;

use rocdrv_core::config::{SimConfig, SimDeviceConfig};
use rocdrv_core::native::*;
use rocdrv_sim::SimDriver;

const MODULE: &str = r#"
.version 7.0
.global .align 4 .u32 counter;
.visible .entry identity(
    .param .u64 input,
    .param .u64 output,
    .param .u32 n
)
.maxntid 256, 1, 1
{
}
.entry scale(
    .param .u64 data,
    .param .f32 factor,
    .param .u32 n
)
{
}
"#;

fn driver() -> SimDriver {
    let sim = SimDriver::new(SimConfig::default());
    sim.init(0).expect("init");
    sim
}

#[test]
fn calls_before_init_fail() {
    let sim = SimDriver::default();
    assert_eq!(sim.device_get_count(), Err(HipStatus::ERROR_NOT_INITIALIZED));
    assert!(sim.driver_get_version().is_ok());
    sim.init(0).expect("init");
    assert_eq!(sim.device_get_count(), Ok(2));
}

#[test]
fn init_without_devices_reports_no_device() {
    let sim = SimDriver::new(SimConfig { driver_version: 1, devices: Vec::new() });
    assert_eq!(sim.init(0), Err(HipStatus::ERROR_NO_DEVICE));
}

#[test]
fn context_creation_makes_it_current_on_this_thread_only() {
    let sim = driver();
    assert!(sim.ctx_get_current().expect("current").is_null());
    let ctx = sim.ctx_create(0, 0).expect("ctx");
    assert_eq!(sim.ctx_get_current(), Ok(ctx));

    std::thread::scope(|s| {
        s.spawn(|| {
            assert!(sim.ctx_get_current().expect("current").is_null());
            assert_eq!(sim.mem_alloc(16), Err(HipStatus::ERROR_INVALID_CONTEXT));
        });
    });

    sim.ctx_destroy(ctx).expect("destroy");
    assert!(sim.ctx_get_current().expect("current").is_null());
    assert_eq!(sim.ctx_set_current(ctx), Err(HipStatus::ERROR_INVALID_CONTEXT));
}

#[test]
fn invalid_context_flags_are_rejected() {
    let sim = driver();
    let both = (ContextFlags::SCHEDULE_SPIN | ContextFlags::SCHEDULE_YIELD).bits();
    assert_eq!(sim.ctx_create(both, 0), Err(HipStatus::ERROR_INVALID_VALUE));
    assert_eq!(sim.ctx_create(0, 7), Err(HipStatus::ERROR_INVALID_DEVICE));
}

#[test]
fn device_memory_budget_is_enforced() {
    let mut device = SimDeviceConfig::named("tiny");
    device.memory_bytes = 4096;
    let sim = SimDriver::new(SimConfig { driver_version: 1, devices: vec![device] });
    sim.init(0).expect("init");
    sim.ctx_create(0, 0).expect("ctx");

    let a = sim.mem_alloc(4000).expect("fits");
    assert_eq!(sim.mem_alloc(200), Err(HipStatus::ERROR_OUT_OF_MEMORY));
    assert_eq!(sim.mem_get_info(), Ok((96, 4096)));
    sim.mem_free(a).expect("free");
    assert_eq!(sim.mem_free(a), Err(HipStatus::ERROR_INVALID_VALUE));
}

#[test]
fn callbacks_fire_after_prior_work_in_order() {
    let sim = driver();
    sim.ctx_create(0, 0).expect("ctx");
    let stream = sim.stream_create(0).expect("stream");
    let ptr = sim.mem_alloc(64).expect("alloc");

    let (tx, rx) = mpsc::channel();
    for i in 0..4u8 {
        sim.memset_d8_async(ptr, i, 64, stream).expect("memset");
        let tx = tx.clone();
        sim.stream_add_callback(stream, Box::new(move |status| {
            tx.send((i, status)).expect("send");
        }))
        .expect("callback");
    }
    let order: Vec<u8> = (0..4)
        .map(|_| {
            let (i, status) = rx.recv_timeout(Duration::from_secs(5)).expect("callback fired");
            assert!(status.is_success());
            i
        })
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);

    sim.stream_synchronize(stream).expect("sync");
    let mut out = [0u8; 64];
    unsafe { sim.memcpy_dtoh(out.as_mut_ptr().cast::<c_void>(), ptr, 64) }.expect("d2h");
    assert!(out.iter().all(|&b| b == 3));
    sim.stream_destroy(stream).expect("destroy stream");
}

#[test]
fn peer_access_follows_peer_groups() {
    let mut isolated = SimDeviceConfig::named("isolated");
    isolated.peer_group = None;
    let sim = SimDriver::new(SimConfig {
        driver_version: 1,
        devices: vec![SimDeviceConfig::named("a"), SimDeviceConfig::named("b"), isolated],
    });
    sim.init(0).expect("init");

    assert_eq!(sim.device_can_access_peer(0, 1), Ok(true));
    assert_eq!(sim.device_can_access_peer(0, 0), Ok(false));
    assert_eq!(sim.device_can_access_peer(0, 2), Ok(false));

    let c0 = sim.ctx_create(0, 0).expect("c0");
    let c1 = sim.ctx_create(0, 1).expect("c1");
    let c2 = sim.ctx_create(0, 2).expect("c2");
    sim.ctx_set_current(c0).expect("set");
    assert!(sim.ctx_enable_peer_access(c1, 0).is_ok());
    assert_eq!(sim.ctx_enable_peer_access(c1, 0), Err(HipStatus::ERROR_PEER_ACCESS_ALREADY_ENABLED));
    assert_eq!(sim.ctx_enable_peer_access(c2, 0), Err(HipStatus::ERROR_PEER_ACCESS_UNSUPPORTED));
}

#[test]
fn module_load_reports_parse_errors_in_the_log() {
    let sim = driver();
    sim.ctx_create(0, 0).expect("ctx");

    let mut log = String::new();
    let err = sim.module_load_data_ex(b".entry broken(\n .param x\n)\n{}", &mut log);
    assert_eq!(err, Err(HipStatus::ERROR_INVALID_IMAGE));
    assert!(log.contains("line 2"), "log was: {log}");

    assert_eq!(sim.module_load_data(b"\x7fELF\x02\x01"), Err(HipStatus::ERROR_NO_BINARY_FOR_GPU));

    let module = sim.module_load_data(MODULE.as_bytes()).expect("load");
    let (global, size) = sim.module_get_global(module, "counter").expect("global");
    assert_eq!(size, 4);
    assert!(!global.is_null());
    assert_eq!(sim.module_get_function(module, "missing"), Err(HipStatus::ERROR_NOT_FOUND));

    let f = sim.module_get_function(module, "identity").expect("function");
    assert_eq!(sim.module_get_function(module, "identity"), Ok(f));
    assert_eq!(sim.func_get_attribute(FunctionAttribute::MaxThreadsPerBlock, f), Ok(256));
    assert_eq!(sim.func_get_attribute(FunctionAttribute::PtxVersion, f), Ok(70));

    sim.module_unload(module).expect("unload");
    assert_eq!(sim.func_get_attribute(FunctionAttribute::NumRegs, f), Err(HipStatus::ERROR_INVALID_HANDLE));
    assert_eq!(sim.pointer_get_info(global).map(|_| ()), Err(HipStatus::ERROR_INVALID_VALUE));
}

#[test]
fn packed_arguments_follow_natural_alignment() {
    let sim = driver();
    sim.ctx_create(0, 0).expect("ctx");
    sim.register_kernel("scale", |inv| {
        let data = inv.ptr_param(0)?;
        let factor = inv.param::<f32>(1)?;
        let n = inv.param::<u32>(2)? as usize;
        let values: Vec<f32> = inv.read(data, n)?;
        let scaled: Vec<f32> = values.iter().map(|v| v * factor).collect();
        inv.write(data, &scaled)
    });

    let module = sim.module_load_data(MODULE.as_bytes()).expect("load");
    let f = sim.module_get_function(module, "scale").expect("scale");
    let data = sim.mem_alloc(16).expect("alloc");
    let input = [1.0f32, 2.0, 3.0, 4.0];
    unsafe { sim.memcpy_htod(data, input.as_ptr().cast(), 16) }.expect("h2d");

    // u64 at 0, f32 at 8, u32 at 12
    let mut packed = Vec::new();
    packed.extend_from_slice(&data.0.to_ne_bytes());
    packed.extend_from_slice(&2.5f32.to_ne_bytes());
    packed.extend_from_slice(&4u32.to_ne_bytes());
    let mut size = packed.len();
    let mut extra = [
        LAUNCH_PARAM_BUFFER_POINTER as *mut c_void,
        packed.as_mut_ptr().cast(),
        LAUNCH_PARAM_BUFFER_SIZE as *mut c_void,
        (&mut size as *mut usize).cast(),
        LAUNCH_PARAM_END as *mut c_void,
    ];
    unsafe {
        sim.launch_kernel(
            f,
            Dim3::new(1, 1, 1),
            Dim3::new(4, 1, 1),
            0,
            RawStream::NULL,
            std::ptr::null_mut(),
            extra.as_mut_ptr(),
        )
    }
    .expect("launch");

    let mut out = [0f32; 4];
    unsafe { sim.memcpy_dtoh(out.as_mut_ptr().cast(), data, 16) }.expect("d2h");
    assert_eq!(out, [2.5, 5.0, 7.5, 10.0]);
}

#[test]
fn launches_validate_geometry_and_bodies() {
    let sim = driver();
    sim.ctx_create(0, 0).expect("ctx");
    let module = sim
        .module_load_data(b".entry nobody() {}")
        .expect("load");
    let f = sim.module_get_function(module, "nobody").expect("function");
    let launch = |grid: Dim3, block: Dim3| unsafe {
        let mut params: [*mut c_void; 0] = [];
        sim.launch_kernel(f, grid, block, 0, RawStream::NULL, params.as_mut_ptr(), std::ptr::null_mut())
    };
    assert_eq!(launch(Dim3::new(0, 1, 1), Dim3::new(1, 1, 1)), Err(HipStatus::ERROR_INVALID_VALUE));
    assert_eq!(launch(Dim3::new(1, 1, 1), Dim3::new(2048, 1, 1)), Err(HipStatus::ERROR_INVALID_VALUE));
    assert_eq!(
        launch(Dim3::new(1, 1, 1), Dim3::new(64, 1, 1)),
        Err(HipStatus::ERROR_INVALID_DEVICE_FUNCTION)
    );
}

#[test]
fn event_timing_requires_timing_events() {
    let sim = driver();
    sim.ctx_create(0, 0).expect("ctx");
    let stream = sim.stream_create(0).expect("stream");
    let start = sim.event_create(EVENT_DEFAULT).expect("start");
    let stop = sim.event_create(EVENT_DEFAULT).expect("stop");
    let untimed = sim.event_create(EVENT_DISABLE_TIMING).expect("untimed");

    assert_eq!(sim.event_elapsed_time(start, stop), Err(HipStatus::ERROR_INVALID_HANDLE));
    sim.event_record(start, stream).expect("record start");
    sim.memset_d8_async(sim.mem_alloc(1024).expect("alloc"), 1, 1024, stream).expect("memset");
    sim.event_record(stop, stream).expect("record stop");
    sim.event_record(untimed, stream).expect("record untimed");
    sim.event_synchronize(stop).expect("sync stop");

    let ms = sim.event_elapsed_time(start, stop).expect("elapsed");
    assert!(ms >= 0.0);
    assert_eq!(sim.event_elapsed_time(start, untimed), Err(HipStatus::ERROR_INVALID_HANDLE));
}
