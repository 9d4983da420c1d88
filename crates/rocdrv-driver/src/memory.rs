//! Device, pinned-host and registered-host memory, copies, memsets and
//! pointer introspection.

use std::ffi::c_void;
use std::fmt;

use bytemuck::Pod;
use tracing::{debug, error};

use rocdrv_core::handle_map::{HandleKind, HandleRecord};
use rocdrv_core::native::{NativeMemoryType, HOST_MALLOC_PORTABLE, HOST_REGISTER_PORTABLE};
use rocdrv_core::{DevicePtr, DriverError, Status, StatusOr};

use crate::context::{Context, Device};
use crate::driver::{check, Driver};
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device,
}

pub fn memory_space_string(space: MemorySpace) -> &'static str {
    match space {
        MemorySpace::Host => "host",
        MemorySpace::Device => "device",
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(memory_space_string(*self))
    }
}

/// Page-locked host memory allocated through the driver.
///
/// Stays valid until passed to [`Driver::host_deallocate`]; it is not freed on drop.
#[derive(Debug)]
pub struct HostMemory {
    ptr: *mut u8,
    len: usize,
    context_id: i64,
}

// SAFETY: HostMemory exclusively owns its allocation, and mutation goes through
// `&mut self`.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    /// Host-visible bytes. Asynchronous copies into this memory must be
    /// synchronized before reading.
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: `ptr` points to `len` bytes owned by this value until deallocation.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.ptr.is_null() {
            return &mut [];
        }
        // SAFETY: as for `as_slice`, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Driver {
    // ── Device memory ─────────────────────────────────────────────

    /// Allocates `bytes` of device memory. A zero-byte request yields the null pointer.
    pub fn device_allocate(&self, context: &Context, bytes: usize) -> StatusOr<DevicePtr> {
        if bytes == 0 {
            return Ok(DevicePtr::NULL);
        }
        let _guard = self.activate(context, "device_allocate")?;
        let ptr = check("hipMalloc", self.native().mem_alloc(bytes), || {
            format!("context={} bytes={}", context.id(), bytes)
        })?;
        self.handles.insert(
            ptr.0,
            HandleRecord::new(HandleKind::DeviceMemory, Some(context.id())).with_size(bytes),
        );
        debug!("allocated {} bytes at {} in context {}", bytes, ptr, context.id());
        Ok(ptr)
    }

    /// Frees device memory and nulls the caller's pointer. Freeing null does nothing.
    pub fn device_deallocate(&self, context: &Context, ptr: &mut DevicePtr) -> Status {
        if ptr.is_null() {
            return Ok(());
        }
        let _guard = self.activate(context, "device_deallocate")?;
        self.owned(HandleKind::DeviceMemory, ptr.0, context)?;
        check("hipFree", self.native().mem_free(*ptr), || {
            format!("context={} ptr={}", context.id(), ptr)
        })?;
        self.handles.remove(HandleKind::DeviceMemory, ptr.0);
        debug!("freed {} in context {}", ptr, context.id());
        *ptr = DevicePtr::NULL;
        Ok(())
    }

    // ── Host memory ───────────────────────────────────────────────

    pub fn host_allocate(&self, context: &Context, bytes: usize) -> StatusOr<HostMemory> {
        if bytes == 0 {
            return Err(DriverError::InvalidArgument("host_allocate of zero bytes".into()));
        }
        let _guard = self.activate(context, "host_allocate")?;
        let ptr = check("hipHostMalloc", self.native().mem_alloc_host(bytes, HOST_MALLOC_PORTABLE), || {
            format!("context={} bytes={}", context.id(), bytes)
        })?;
        self.handles.insert(
            ptr as usize as u64,
            HandleRecord::new(HandleKind::HostMemory, Some(context.id())).with_size(bytes),
        );
        Ok(HostMemory {
            ptr: ptr.cast(),
            len: bytes,
            context_id: context.id(),
        })
    }

    pub fn host_deallocate(&self, context: &Context, memory: &mut HostMemory) -> Status {
        if memory.is_null() {
            return Ok(());
        }
        let _guard = self.activate(context, "host_deallocate")?;
        let key = memory.ptr as usize as u64;
        self.owned(HandleKind::HostMemory, key, context)?;
        check("hipHostFree", self.native().mem_free_host(memory.ptr.cast()), || {
            format!("context={} ptr=0x{:x}", context.id(), key)
        })?;
        self.handles.remove(HandleKind::HostMemory, key);
        memory.ptr = std::ptr::null_mut();
        memory.len = 0;
        Ok(())
    }

    /// Page-locks an existing host range so the device can access it directly.
    /// A range overlapping one already registered is rejected.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `bytes` bytes until it is
    /// passed to [`Driver::host_unregister`].
    pub unsafe fn host_register(&self, context: &Context, ptr: *mut c_void, bytes: usize) -> Status {
        let _guard = self.activate(context, "host_register")?;
        let key = ptr as usize as u64;
        if let Some((base, existing)) = self.handles.find_overlapping(HandleKind::HostRegistration, key, bytes) {
            error!(
                "host_register: 0x{:x}+{} overlaps registration 0x{:x}+{} (context={})",
                key,
                bytes,
                base,
                existing.size,
                context.id()
            );
            return Err(DriverError::InvalidArgument(format!(
                "host range 0x{key:x}+{bytes} overlaps the registered range 0x{base:x}+{}",
                existing.size
            )));
        }
        check("hipHostRegister", self.native().mem_host_register(ptr, bytes, HOST_REGISTER_PORTABLE), || {
            format!("context={} ptr=0x{:x} bytes={}", context.id(), key, bytes)
        })?;
        self.handles.insert(
            key,
            HandleRecord::new(HandleKind::HostRegistration, Some(context.id())).with_size(bytes),
        );
        Ok(())
    }

    /// Reverses [`Driver::host_register`]. Unregistering memory that was never
    /// registered through this driver is an error.
    pub fn host_unregister(&self, context: &Context, ptr: *mut c_void) -> Status {
        let _guard = self.activate(context, "host_unregister")?;
        let key = ptr as usize as u64;
        if !self.handles.contains(HandleKind::HostRegistration, key) {
            error!("host_unregister: 0x{:x} was never registered (context={})", key, context.id());
            return Err(DriverError::InvalidArgument(format!(
                "host memory 0x{key:x} is not registered"
            )));
        }
        self.owned(HandleKind::HostRegistration, key, context)?;
        check("hipHostUnregister", self.native().mem_host_unregister(ptr), || {
            format!("context={} ptr=0x{:x}", context.id(), key)
        })?;
        self.handles.remove(HandleKind::HostRegistration, key);
        Ok(())
    }

    // ── Synchronous copies ────────────────────────────────────────

    pub fn memcpy_d2h<T: Pod>(&self, context: &Context, dst: &mut [T], src: DevicePtr) -> Status {
        let bytes = std::mem::size_of_val(dst);
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.activate(context, "memcpy_d2h")?;
        // SAFETY: `dst` is a live, exclusively borrowed host buffer of `bytes` bytes.
        let res = unsafe { self.native().memcpy_dtoh(dst.as_mut_ptr().cast(), src, bytes) };
        check("hipMemcpyDtoH", res, || {
            format!("context={} src={} bytes={}", context.id(), src, bytes)
        })
    }

    pub fn memcpy_h2d<T: Pod>(&self, context: &Context, dst: DevicePtr, src: &[T]) -> Status {
        let bytes = std::mem::size_of_val(src);
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.activate(context, "memcpy_h2d")?;
        // SAFETY: `src` is a live host buffer of `bytes` bytes.
        let res = unsafe { self.native().memcpy_htod(dst, src.as_ptr().cast(), bytes) };
        check("hipMemcpyHtoD", res, || {
            format!("context={} dst={} bytes={}", context.id(), dst, bytes)
        })
    }

    pub fn memcpy_d2d(&self, context: &Context, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Status {
        if bytes == 0 {
            return Ok(());
        }
        let _guard = self.activate(context, "memcpy_d2d")?;
        check("hipMemcpyDtoD", self.native().memcpy_dtod(dst, src, bytes), || {
            format!("context={} dst={} src={} bytes={}", context.id(), dst, src, bytes)
        })
    }

    // ── Asynchronous copies ───────────────────────────────────────

    /// Enqueues a device-to-host copy on `stream`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `bytes` bytes until the copy completes,
    /// and must not be read or written by the host before then.
    pub unsafe fn memcpy_d2h_async(
        &self,
        context: &Context,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Status {
        let _guard = self.activate(context, "memcpy_d2h_async")?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;
        // SAFETY: upheld by the caller.
        let res = unsafe { self.native().memcpy_dtoh_async(dst, src, bytes, stream.raw()) };
        check("hipMemcpyDtoHAsync", res, || {
            format!("context={} src={} bytes={} stream=0x{:x}", context.id(), src, bytes, stream.raw().0)
        })
    }

    /// Enqueues a host-to-device copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `bytes` bytes and must not be modified
    /// until the copy completes.
    pub unsafe fn memcpy_h2d_async(
        &self,
        context: &Context,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: &Stream,
    ) -> Status {
        let _guard = self.activate(context, "memcpy_h2d_async")?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;
        // SAFETY: upheld by the caller.
        let res = unsafe { self.native().memcpy_htod_async(dst, src, bytes, stream.raw()) };
        check("hipMemcpyHtoDAsync", res, || {
            format!("context={} dst={} bytes={} stream=0x{:x}", context.id(), dst, bytes, stream.raw().0)
        })
    }

    pub fn memcpy_d2d_async(
        &self,
        context: &Context,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Status {
        let _guard = self.activate(context, "memcpy_d2d_async")?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;
        check("hipMemcpyDtoDAsync", self.native().memcpy_dtod_async(dst, src, bytes, stream.raw()), || {
            format!(
                "context={} dst={} src={} bytes={} stream=0x{:x}",
                context.id(),
                dst,
                src,
                bytes,
                stream.raw().0
            )
        })
    }

    // ── Memset ────────────────────────────────────────────────────

    pub fn memset_u8(&self, context: &Context, dst: DevicePtr, value: u8, count: usize) -> Status {
        let _guard = self.activate(context, "memset_u8")?;
        check("hipMemsetD8", self.native().memset_d8(dst, value, count), || {
            format!("context={} dst={} value=0x{:02x} count={}", context.id(), dst, value, count)
        })
    }

    /// Fills `count` 32-bit words. `dst` must be 4-byte aligned.
    pub fn memset_u32(&self, context: &Context, dst: DevicePtr, value: u32, count: usize) -> Status {
        check_word_aligned(dst)?;
        let _guard = self.activate(context, "memset_u32")?;
        check("hipMemsetD32", self.native().memset_d32(dst, value, count), || {
            format!("context={} dst={} value=0x{:08x} count={}", context.id(), dst, value, count)
        })
    }

    pub fn memset_u8_async(&self, context: &Context, dst: DevicePtr, value: u8, count: usize, stream: &Stream) -> Status {
        let _guard = self.activate(context, "memset_u8_async")?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;
        check("hipMemsetD8Async", self.native().memset_d8_async(dst, value, count, stream.raw()), || {
            format!(
                "context={} dst={} value=0x{:02x} count={} stream=0x{:x}",
                context.id(),
                dst,
                value,
                count,
                stream.raw().0
            )
        })
    }

    pub fn memset_u32_async(
        &self,
        context: &Context,
        dst: DevicePtr,
        value: u32,
        count: usize,
        stream: &Stream,
    ) -> Status {
        check_word_aligned(dst)?;
        let _guard = self.activate(context, "memset_u32_async")?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;
        check("hipMemsetD32Async", self.native().memset_d32_async(dst, value, count, stream.raw()), || {
            format!(
                "context={} dst={} value=0x{:08x} count={} stream=0x{:x}",
                context.id(),
                dst,
                value,
                count,
                stream.raw().0
            )
        })
    }

    // ── Introspection ─────────────────────────────────────────────

    /// Free and total bytes on the context's device.
    pub fn get_device_memory_info(&self, context: &Context) -> StatusOr<(u64, u64)> {
        let _guard = self.activate(context, "get_device_memory_info")?;
        let (free, total) = check("hipMemGetInfo", self.native().mem_get_info(), || {
            format!("context={}", context.id())
        })?;
        Ok((free as u64, total as u64))
    }

    /// Id of the context that owns the allocation containing `ptr`.
    pub fn get_pointer_context(&self, ptr: DevicePtr) -> StatusOr<i64> {
        self.enter("get_pointer_context")?;
        let info = check("hipPointerGetAttribute", self.native().pointer_get_info(ptr), || {
            format!("ptr={ptr}")
        })?;
        self.contexts
            .iter()
            .find(|e| e.raw == info.context)
            .map(|e| *e.key())
            .ok_or_else(|| {
                error!("get_pointer_context: {} belongs to an unknown context", ptr);
                DriverError::InvalidHandle(format!("{ptr} belongs to a context not created by this driver"))
            })
    }

    pub fn get_pointer_device(&self, ptr: DevicePtr) -> StatusOr<Device> {
        self.enter("get_pointer_device")?;
        let info = check("hipPointerGetAttribute", self.native().pointer_get_info(ptr), || {
            format!("ptr={ptr}")
        })?;
        let raw = check("hipDeviceGet", self.native().device_get(info.device_ordinal), || {
            format!("ordinal={}", info.device_ordinal)
        })?;
        Ok(Device::new(raw, info.device_ordinal))
    }

    pub fn get_pointer_memory_space(&self, ptr: DevicePtr) -> StatusOr<MemorySpace> {
        self.enter("get_pointer_memory_space")?;
        let info = check("hipPointerGetAttribute", self.native().pointer_get_info(ptr), || {
            format!("ptr={ptr}")
        })?;
        Ok(match info.memory_type {
            NativeMemoryType::Host => MemorySpace::Host,
            NativeMemoryType::Device | NativeMemoryType::Managed => MemorySpace::Device,
        })
    }

    /// Base and size of the allocation containing `ptr`.
    pub fn get_pointer_address_range(&self, ptr: DevicePtr) -> StatusOr<(DevicePtr, usize)> {
        self.enter("get_pointer_address_range")?;
        check("hipMemGetAddressRange", self.native().mem_get_address_range(ptr), || {
            format!("ptr={ptr}")
        })
    }
}

fn check_word_aligned(dst: DevicePtr) -> Status {
    if dst.0 % 4 != 0 {
        error!("32-bit memset destination {} is not 4-byte aligned", dst);
        return Err(DriverError::InvalidArgument(format!(
            "32-bit memset destination {dst} is not 4-byte aligned"
        )));
    }
    Ok(())
}
