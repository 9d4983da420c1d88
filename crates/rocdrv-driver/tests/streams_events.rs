//! Integration test: streams, events and stream callbacks.
//!
//! Run with: cargo test -p rocdrv-driver --test streams_events -- --nocapture

mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::{context_on, sim_driver};
use rocdrv_driver::{ErrorKind, EventFlags, EventStatus};

#[test]
fn test_event_pending_until_recorded_and_synchronized() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let mut stream = driver.create_stream(&ctx).expect("stream");
    let mut event = driver.create_event(&ctx, EventFlags::Default).expect("event");

    assert_eq!(driver.query_event(&ctx, &event).expect("query"), EventStatus::Pending);

    let ptr = driver.device_allocate(&ctx, 1 << 16).expect("alloc");
    driver.memset_u8_async(&ctx, ptr, 0xAB, 1 << 16, &stream).expect("memset");
    driver.record_event(&ctx, &event, &stream).expect("record");
    driver.synchronize_stream(&ctx, &stream).expect("sync");
    assert_eq!(driver.query_event(&ctx, &event).expect("query"), EventStatus::Complete);

    driver.destroy_event(&ctx, &mut event).expect("destroy event");
    assert!(event.is_null());
    driver.destroy_event(&ctx, &mut event).expect("destroying a null event is a no-op");
    driver.destroy_stream(&ctx, &mut stream).expect("destroy stream");
    assert!(stream.is_null());
}

#[test]
fn test_elapsed_time_requires_timing_events() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    let start = driver.create_event(&ctx, EventFlags::Default).expect("start");
    let stop = driver.create_event(&ctx, EventFlags::Default).expect("stop");
    let untimed = driver.create_event(&ctx, EventFlags::DisableTiming).expect("untimed");

    let err = driver
        .get_event_elapsed_time(&ctx, &start, &stop)
        .expect_err("unrecorded events");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let ptr = driver.device_allocate(&ctx, 1 << 20).expect("alloc");
    driver.record_event(&ctx, &start, &stream).expect("record start");
    driver.memset_u32_async(&ctx, ptr, 0xDEAD_BEEF, 1 << 18, &stream).expect("memset");
    driver.record_event(&ctx, &stop, &stream).expect("record stop");
    driver.record_event(&ctx, &untimed, &stream).expect("record untimed");

    let ms = driver.get_event_elapsed_time(&ctx, &start, &stop).expect("elapsed");
    println!("memset took {:.3} ms", ms);
    assert!(ms >= 0.0);

    let err = driver
        .get_event_elapsed_time(&ctx, &start, &untimed)
        .expect_err("timing disabled");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_callbacks_fire_after_prior_work_in_stream_order() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    let ptr = driver.device_allocate(&ctx, 256).expect("alloc");

    let (tx, rx) = mpsc::channel();
    for i in 0..5u8 {
        driver.memset_u8_async(&ctx, ptr, i, 256, &stream).expect("memset");
        let tx = tx.clone();
        driver
            .add_stream_callback(&ctx, &stream, move |status| {
                tx.send((i, status.is_ok())).expect("send");
            })
            .expect("add callback");
    }

    let fired: Vec<(u8, bool)> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("callback fired"))
        .collect();
    println!("callbacks: {:?}", fired);
    assert_eq!(fired, (0..5).map(|i| (i, true)).collect::<Vec<_>>());

    let mut out = [0u8; 256];
    driver.memcpy_d2h(&ctx, &mut out, ptr).expect("d2h");
    assert!(out.iter().all(|&b| b == 4));
}

#[test]
fn test_callback_cannot_reenter_driver() {
    let driver = Arc::new(sim_driver());
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");

    let (tx, rx) = mpsc::channel();
    let inner = Arc::clone(&driver);
    driver
        .add_stream_callback(&ctx, &stream, move |_| {
            let result = inner.get_device_count();
            tx.send(result.map_err(|e| e.kind())).expect("send");
        })
        .expect("add callback");

    let result = rx.recv_timeout(Duration::from_secs(5)).expect("callback fired");
    assert_eq!(result, Err(ErrorKind::CallbackReentrancy));

    // The caller's own thread is unaffected.
    assert_eq!(driver.get_device_count().expect("count"), 2);
}

#[test]
fn test_handles_are_scoped_to_their_context() {
    let driver = sim_driver();
    let a = context_on(&driver, 0);
    let b = context_on(&driver, 0);
    let stream = driver.create_stream(&a).expect("stream");
    let event = driver.create_event(&a, EventFlags::Default).expect("event");

    let err = driver.synchronize_stream(&b, &stream).expect_err("foreign stream");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    let err = driver.query_event(&b, &event).expect_err("foreign event");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    driver.synchronize_stream(&a, &stream).expect("own stream");
}

#[test]
fn test_stream_waits_on_event_from_another_stream() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let producer = driver.create_stream(&ctx).expect("producer");
    let consumer = driver.create_stream(&ctx).expect("consumer");
    let ready = driver.create_event(&ctx, EventFlags::DisableTiming).expect("event");

    let src = driver.device_allocate(&ctx, 4096).expect("src");
    let dst = driver.device_allocate(&ctx, 4096).expect("dst");
    driver.memset_u8_async(&ctx, src, 0x5A, 4096, &producer).expect("memset");
    driver.record_event(&ctx, &ready, &producer).expect("record");
    driver.wait_stream_on_event(&ctx, &consumer, &ready).expect("wait");
    driver.memcpy_d2d_async(&ctx, dst, src, 4096, &consumer).expect("copy");

    driver.synchronize_stream(&ctx, &consumer).expect("sync consumer");
    let mut out = vec![0u8; 4096];
    driver.memcpy_d2h(&ctx, &mut out, dst).expect("d2h");
    assert!(out.iter().all(|&b| b == 0x5A));
}

#[test]
fn test_idle_stream_and_context_synchronize() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    assert!(driver.is_stream_idle(&ctx, &stream));

    let ptr = driver.device_allocate(&ctx, 1 << 20).expect("alloc");
    driver.memset_u8_async(&ctx, ptr, 1, 1 << 20, &stream).expect("memset");
    driver.synchronize_context(&ctx).expect("sync context");
    assert!(driver.is_stream_idle(&ctx, &stream));
}
