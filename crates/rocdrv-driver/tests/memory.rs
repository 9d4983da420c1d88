//! Integration test: allocation, copies, memsets and pointer queries.
//!
//! Run with: cargo test -p rocdrv-driver --test memory -- --nocapture

mod common;

use std::ffi::c_void;

use common::{context_on, sim_driver, small_sim_driver};
use rocdrv_driver::{memory_space_string, DevicePtr, ErrorKind, MemorySpace};

#[test]
fn test_h2d_then_d2h_round_trips() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let input: Vec<u32> = (0..1024).map(|i| i * 7 + 3).collect();
    let mut ptr = driver.device_allocate(&ctx, input.len() * 4).expect("alloc");

    driver.memcpy_h2d(&ctx, ptr, &input).expect("h2d");
    let mut output = vec![0u32; input.len()];
    driver.memcpy_d2h(&ctx, &mut output, ptr).expect("d2h");
    assert_eq!(input, output);

    driver.device_deallocate(&ctx, &mut ptr).expect("free");
    assert!(ptr.is_null());
}

#[test]
fn test_async_memset_fills_every_byte() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    let ptr = driver.device_allocate(&ctx, 1024).expect("alloc");

    driver.memset_u8_async(&ctx, ptr, 0xFF, 1024, &stream).expect("memset");
    driver.synchronize_stream(&ctx, &stream).expect("sync");

    let mut out = [0u8; 1024];
    driver.memcpy_d2h(&ctx, &mut out, ptr).expect("d2h");
    assert!(out.iter().all(|&b| b == 0xFF));
}

#[test]
fn test_memset_u32_requires_alignment() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let ptr = driver.device_allocate(&ctx, 64).expect("alloc");

    let err = driver
        .memset_u32(&ctx, ptr.offset(2), 1, 4)
        .expect_err("misaligned");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    driver.memset_u32(&ctx, ptr.offset(4), 0x0102_0304, 15).expect("memset");
    let mut words = [0u32; 16];
    driver.memcpy_d2h(&ctx, &mut words, ptr).expect("d2h");
    assert_eq!(words[0], 0);
    assert!(words[1..].iter().all(|&w| w == 0x0102_0304));
}

#[test]
fn test_device_to_device_copy() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let a = driver.device_allocate(&ctx, 128).expect("a");
    let b = driver.device_allocate(&ctx, 128).expect("b");
    let pattern: Vec<u8> = (0..128).collect();

    driver.memcpy_h2d(&ctx, a, &pattern).expect("h2d");
    driver.memcpy_d2d(&ctx, b, a, 128).expect("d2d");
    let mut out = vec![0u8; 128];
    driver.memcpy_d2h(&ctx, &mut out, b).expect("d2h");
    assert_eq!(out, pattern);
}

#[test]
fn test_zero_byte_allocation_is_null() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let mut ptr = driver.device_allocate(&ctx, 0).expect("alloc");
    assert!(ptr.is_null());
    driver.device_deallocate(&ctx, &mut ptr).expect("freeing null");
}

#[test]
fn test_allocation_beyond_device_memory_is_exhaustion() {
    let driver = small_sim_driver(1 << 16);
    let ctx = context_on(&driver, 0);

    let err = driver.device_allocate(&ctx, 1 << 20).expect_err("too large");
    println!("{}", err);
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    let mut ptr = driver.device_allocate(&ctx, 1 << 12).expect("fits");
    let (free, total) = driver.get_device_memory_info(&ctx).expect("info");
    assert_eq!(total, 1 << 16);
    assert_eq!(free, (1 << 16) - (1 << 12));
    driver.device_deallocate(&ctx, &mut ptr).expect("free");
}

#[test]
fn test_pointer_introspection() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 1);
    let ptr = driver.device_allocate(&ctx, 256).expect("alloc");

    assert_eq!(driver.get_pointer_context(ptr).expect("context"), ctx.id());
    assert_eq!(driver.get_pointer_device(ptr).expect("device").ordinal(), 1);
    assert_eq!(driver.get_pointer_memory_space(ptr).expect("space"), MemorySpace::Device);
    assert_eq!(
        driver.get_pointer_address_range(ptr.offset(16)).expect("range"),
        (ptr, 256)
    );

    let mut host = driver.host_allocate(&ctx, 512).expect("pinned");
    let host_ptr = DevicePtr::from_host(host.as_ptr());
    assert_eq!(driver.get_pointer_memory_space(host_ptr).expect("space"), MemorySpace::Host);
    assert_eq!(driver.get_pointer_context(host_ptr).expect("context"), ctx.id());
    driver.host_deallocate(&ctx, &mut host).expect("free pinned");
    assert!(host.is_null());

    assert!(driver.get_pointer_context(DevicePtr(0x1234)).is_err());
    assert!(driver.get_pointer_address_range(DevicePtr(0x1234)).is_err());
}

#[test]
fn test_async_copies_through_pinned_memory() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let stream = driver.create_stream(&ctx).expect("stream");
    let ptr = driver.device_allocate(&ctx, 4096).expect("alloc");

    let mut upload = driver.host_allocate(&ctx, 4096).expect("upload");
    let mut download = driver.host_allocate(&ctx, 4096).expect("download");
    for (i, b) in upload.as_mut_slice().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    unsafe {
        driver
            .memcpy_h2d_async(&ctx, ptr, upload.as_ptr().cast(), 4096, &stream)
            .expect("h2d async");
        driver
            .memcpy_d2h_async(&ctx, download.as_mut_ptr().cast(), ptr, 4096, &stream)
            .expect("d2h async");
    }
    driver.synchronize_stream(&ctx, &stream).expect("sync");
    assert_eq!(upload.as_slice(), download.as_slice());

    driver.host_deallocate(&ctx, &mut upload).expect("free upload");
    driver.host_deallocate(&ctx, &mut download).expect("free download");
}

#[test]
fn test_host_registration() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let mut buffer = vec![0u8; 8192];
    let raw = buffer.as_mut_ptr().cast::<c_void>();

    let err = driver.host_unregister(&ctx, raw).expect_err("never registered");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    unsafe { driver.host_register(&ctx, raw, buffer.len()) }.expect("register");
    assert_eq!(
        driver.get_pointer_memory_space(DevicePtr::from_host(buffer.as_ptr())).expect("space"),
        MemorySpace::Host
    );
    driver.host_unregister(&ctx, raw).expect("unregister");
    assert!(driver.host_unregister(&ctx, raw).is_err());
}

#[test]
fn test_overlapping_host_registration_is_rejected() {
    let driver = sim_driver();
    let ctx = context_on(&driver, 0);
    let mut buffer = vec![0u8; 16384];
    let base = buffer.as_mut_ptr();
    let first = base.cast::<c_void>();
    let inside = base.wrapping_add(4096).cast::<c_void>();
    let after = base.wrapping_add(8192).cast::<c_void>();

    unsafe { driver.host_register(&ctx, first, 8192) }.expect("register first half");
    let err = unsafe { driver.host_register(&ctx, inside, 8192) }.expect_err("overlap");
    println!("{}", err);
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Adjacent ranges do not overlap.
    unsafe { driver.host_register(&ctx, after, 8192) }.expect("register second half");
    driver.host_unregister(&ctx, first).expect("unregister first");
    driver.host_unregister(&ctx, after).expect("unregister second");
    assert!(driver.host_unregister(&ctx, inside).is_err());
}

#[test]
fn test_memory_space_names() {
    assert_eq!(memory_space_string(MemorySpace::Host), "host");
    assert_eq!(memory_space_string(MemorySpace::Device), "device");
    assert_eq!(MemorySpace::Device.to_string(), "device");
}
