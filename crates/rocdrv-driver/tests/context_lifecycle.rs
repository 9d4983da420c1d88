//! Integration test: context creation, destruction and activation.
//!
//! Run with: cargo test -p rocdrv-driver --test context_lifecycle -- --nocapture

mod common;

use common::{context_on, sim_driver};
use rocdrv_driver::{ContextFlags, ErrorKind, ScopedActivateContext, SharedMemConfig};

#[test]
fn test_context_ids_strictly_increase() {
    let driver = sim_driver();
    let mut contexts: Vec<_> = (0..4).map(|i| context_on(&driver, i % 2)).collect();

    for pair in contexts.windows(2) {
        assert!(pair[0].id() > 0);
        assert!(pair[1].id() > pair[0].id(), "{} !> {}", pair[1].id(), pair[0].id());
    }
    println!("context ids: {:?}", contexts.iter().map(|c| c.id()).collect::<Vec<_>>());

    for ctx in contexts.iter_mut() {
        driver.destroy_context(ctx).expect("destroy");
        assert!(ctx.is_null());
    }

    let later = context_on(&driver, 0);
    assert!(later.id() > contexts[3].id());
}

#[test]
fn test_destroyed_context_is_rejected() {
    let driver = sim_driver();
    let mut ctx = context_on(&driver, 0);
    driver.destroy_context(&mut ctx).expect("destroy");

    let err = driver.create_stream(&ctx).expect_err("stream on destroyed context");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    let err = driver.destroy_context(&mut ctx).expect_err("double destroy");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}

#[test]
fn test_destroy_refuses_context_with_live_handles() {
    let driver = sim_driver();
    let mut ctx = context_on(&driver, 0);
    let mut stream = driver.create_stream(&ctx).expect("stream");
    let mut ptr = driver.device_allocate(&ctx, 64).expect("alloc");

    match driver.destroy_context(&mut ctx) {
        Err(e) => {
            println!("refused: {}", e);
            assert_eq!(e.kind(), ErrorKind::ContextInUse);
        }
        Ok(()) => panic!("context with live handles was destroyed"),
    }
    assert!(!ctx.is_null());

    driver.destroy_stream(&ctx, &mut stream).expect("destroy stream");
    driver.device_deallocate(&ctx, &mut ptr).expect("free");
    driver.destroy_context(&mut ctx).expect("destroy");
}

#[test]
fn test_conflicting_schedule_flags_are_rejected() {
    let driver = sim_driver();
    let device = driver.get_device(0).expect("device");
    let err = driver
        .create_context(device, ContextFlags::SCHEDULE_SPIN | ContextFlags::SCHEDULE_YIELD)
        .expect_err("two schedules");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut ctx = driver
        .create_context(device, ContextFlags::SCHEDULE_BLOCKING_SYNC | ContextFlags::MAP_HOST)
        .expect("blocking sync + map host");
    driver.destroy_context(&mut ctx).expect("destroy");
}

#[test]
fn test_create_context_restores_previous_current() {
    let driver = sim_driver();
    assert_eq!(driver.current_context().expect("current"), None);

    let a = context_on(&driver, 0);
    assert_eq!(driver.current_context().expect("current"), None);

    let guard = ScopedActivateContext::new(&driver, &a).expect("activate a");
    let b = context_on(&driver, 1);
    assert_eq!(driver.current_context().expect("current"), Some(a.id()));
    drop(guard);
    assert_ne!(a.id(), b.id());
}

#[test]
fn test_activating_active_context_is_noop() {
    let driver = sim_driver();
    let a = context_on(&driver, 0);
    let b = context_on(&driver, 0);

    let outer = ScopedActivateContext::new(&driver, &a).expect("outer");
    assert_eq!(driver.current_context().expect("current"), Some(a.id()));
    {
        let _same = ScopedActivateContext::new(&driver, &a).expect("same");
        assert_eq!(driver.current_context().expect("current"), Some(a.id()));
    }
    assert_eq!(driver.current_context().expect("current"), Some(a.id()));

    {
        let _other = ScopedActivateContext::new(&driver, &b).expect("other");
        assert_eq!(driver.current_context().expect("current"), Some(b.id()));
    }
    assert_eq!(driver.current_context().expect("current"), Some(a.id()));
    drop(outer);

    // The outermost guard leaves its context active.
    assert_eq!(driver.current_context().expect("current"), Some(a.id()));
}

#[test]
fn test_context_can_be_used_from_another_thread() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 1);

    let mut stream = std::thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(driver.current_context().expect("current"), None);
            let stream = driver.create_stream(&ctx).expect("stream from worker");
            assert_eq!(driver.current_context().expect("current"), Some(ctx.id()));
            stream
        })
        .join()
        .expect("worker")
    });

    assert_eq!(stream.context_id(), ctx.id());
    driver.destroy_stream(&ctx, &mut stream).expect("destroy stream");
    assert!(stream.is_null());
}

#[test]
fn test_device_from_context_and_shared_mem_config() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 1);

    let device = driver.device_from_context(&ctx).expect("device");
    assert_eq!(device.ordinal(), 1);
    assert_eq!(device, ctx.device());

    assert_eq!(
        driver.context_get_shared_mem_config(&ctx).expect("get"),
        SharedMemConfig::BankSizeDefault
    );
    driver
        .context_set_shared_mem_config(&ctx, SharedMemConfig::BankSizeEightByte)
        .expect("set");
    assert_eq!(
        driver.context_get_shared_mem_config(&ctx).expect("get"),
        SharedMemConfig::BankSizeEightByte
    );
}

#[test]
fn test_sync_around_driver_calls() {
    rocdrv_common::logging::try_init_logging();
    let mut config = rocdrv_driver::DriverConfig::simulated();
    config.driver.sync_around_driver_calls = true;
    let driver = rocdrv_driver::Driver::new(config).expect("driver");
    driver.init().expect("init");

    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    let ptr = driver.device_allocate(&ctx, 4096).expect("alloc");
    driver.memset_u8_async(&ctx, ptr, 7, 4096, &stream).expect("memset");

    // Every guard synchronizes on exit, so the stream has drained already.
    assert!(driver.is_stream_idle(&ctx, &stream));
}
