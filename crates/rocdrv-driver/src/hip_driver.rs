//! Dynamic loading of the real HIP runtime library.
//!
//! Uses `libloading` to load `amdhip64.dll` (Windows) or `libamdhip64.so` (Linux)
//! and forwards the `NativeDriver` surface to the raw HIP module API.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::sync::{Arc, OnceLock};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use rocdrv_core::native::*;

/// HIP result type (hipError_t).
pub type HipError = c_int;

/// HIP device type.
pub type HipDevice = c_int;

/// Opaque HIP types (represented as pointers).
pub type HipCtx = *mut c_void;
pub type HipModule = *mut c_void;
pub type HipFunction = *mut c_void;
pub type HipDeviceptr = *mut c_void;
pub type HipStream = *mut c_void;
pub type HipEvent = *mut c_void;

type HipStreamCallback = unsafe extern "C" fn(stream: HipStream, status: HipError, user_data: *mut c_void);

const HIP_POINTER_ATTRIBUTE_CONTEXT: c_int = 1;
const HIP_POINTER_ATTRIBUTE_MEMORY_TYPE: c_int = 2;
const HIP_POINTER_ATTRIBUTE_DEVICE_ORDINAL: c_int = 9;

// hipMemoryType was renumbered in ROCm 6.0: 0 became "unregistered" and the
// rest shifted up by one. Runtimes older than this report the 5.x values.
const HIP_MEMORY_TYPE_RENUMBERED_VERSION: i32 = 60_000_000;

const HIP_MEMORY_TYPE_HOST: c_uint = 1;
const HIP_MEMORY_TYPE_DEVICE: c_uint = 2;
const HIP_MEMORY_TYPE_MANAGED: c_uint = 3;

const HIP5_MEMORY_TYPE_HOST: c_uint = 0;
const HIP5_MEMORY_TYPE_DEVICE: c_uint = 1;
const HIP5_MEMORY_TYPE_UNIFIED: c_uint = 3;
const HIP5_MEMORY_TYPE_MANAGED: c_uint = 4;

/// Decodes a `HIP_POINTER_ATTRIBUTE_MEMORY_TYPE` value for a runtime reporting
/// `runtime_version` from `hipDriverGetVersion`.
fn decode_memory_type(raw: c_uint, runtime_version: i32) -> Option<NativeMemoryType> {
    if runtime_version >= HIP_MEMORY_TYPE_RENUMBERED_VERSION {
        match raw {
            HIP_MEMORY_TYPE_HOST => Some(NativeMemoryType::Host),
            HIP_MEMORY_TYPE_DEVICE => Some(NativeMemoryType::Device),
            HIP_MEMORY_TYPE_MANAGED => Some(NativeMemoryType::Managed),
            _ => None,
        }
    } else {
        match raw {
            HIP5_MEMORY_TYPE_HOST => Some(NativeMemoryType::Host),
            HIP5_MEMORY_TYPE_DEVICE => Some(NativeMemoryType::Device),
            HIP5_MEMORY_TYPE_UNIFIED | HIP5_MEMORY_TYPE_MANAGED => Some(NativeMemoryType::Managed),
            _ => None,
        }
    }
}

const HIP_JIT_OPTION_ERROR_LOG_BUFFER: c_int = 5;
const HIP_JIT_OPTION_ERROR_LOG_BUFFER_SIZE_BYTES: c_int = 6;
const JIT_LOG_SIZE: usize = 8192;

// Initialization
type FnHipInit = unsafe extern "C" fn(flags: c_uint) -> HipError;
type FnHipDriverGetVersion = unsafe extern "C" fn(version: *mut c_int) -> HipError;

// Device management
type FnHipGetDeviceCount = unsafe extern "C" fn(count: *mut c_int) -> HipError;
type FnHipDeviceGet = unsafe extern "C" fn(device: *mut HipDevice, ordinal: c_int) -> HipError;
type FnHipDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: HipDevice) -> HipError;
type FnHipDeviceGetAttribute =
    unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, dev: HipDevice) -> HipError;
type FnHipDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: HipDevice) -> HipError;
type FnHipDeviceComputeCapability =
    unsafe extern "C" fn(major: *mut c_int, minor: *mut c_int, dev: HipDevice) -> HipError;
type FnHipDeviceGetPCIBusId =
    unsafe extern "C" fn(pci_bus_id: *mut c_char, len: c_int, dev: HipDevice) -> HipError;
type FnHipDeviceCanAccessPeer =
    unsafe extern "C" fn(can_access: *mut c_int, dev: HipDevice, peer_dev: HipDevice) -> HipError;

// Context management
type FnHipCtxCreate = unsafe extern "C" fn(pctx: *mut HipCtx, flags: c_uint, dev: HipDevice) -> HipError;
type FnHipCtxDestroy = unsafe extern "C" fn(ctx: HipCtx) -> HipError;
type FnHipCtxSetCurrent = unsafe extern "C" fn(ctx: HipCtx) -> HipError;
type FnHipCtxGetCurrent = unsafe extern "C" fn(pctx: *mut HipCtx) -> HipError;
type FnHipCtxGetDevice = unsafe extern "C" fn(device: *mut HipDevice) -> HipError;
type FnHipCtxSynchronize = unsafe extern "C" fn() -> HipError;
type FnHipCtxGetSharedMemConfig = unsafe extern "C" fn(config: *mut c_int) -> HipError;
type FnHipCtxSetSharedMemConfig = unsafe extern "C" fn(config: c_int) -> HipError;
type FnHipCtxEnablePeerAccess = unsafe extern "C" fn(peer_ctx: HipCtx, flags: c_uint) -> HipError;

// Stream management
type FnHipStreamCreateWithFlags = unsafe extern "C" fn(stream: *mut HipStream, flags: c_uint) -> HipError;
type FnHipStreamDestroy = unsafe extern "C" fn(stream: HipStream) -> HipError;
type FnHipStreamQuery = unsafe extern "C" fn(stream: HipStream) -> HipError;
type FnHipStreamSynchronize = unsafe extern "C" fn(stream: HipStream) -> HipError;
type FnHipStreamWaitEvent = unsafe extern "C" fn(stream: HipStream, event: HipEvent, flags: c_uint) -> HipError;
type FnHipStreamAddCallback = unsafe extern "C" fn(
    stream: HipStream,
    callback: HipStreamCallback,
    user_data: *mut c_void,
    flags: c_uint,
) -> HipError;

// Event management
type FnHipEventCreateWithFlags = unsafe extern "C" fn(event: *mut HipEvent, flags: c_uint) -> HipError;
type FnHipEventDestroy = unsafe extern "C" fn(event: HipEvent) -> HipError;
type FnHipEventRecord = unsafe extern "C" fn(event: HipEvent, stream: HipStream) -> HipError;
type FnHipEventQuery = unsafe extern "C" fn(event: HipEvent) -> HipError;
type FnHipEventSynchronize = unsafe extern "C" fn(event: HipEvent) -> HipError;
type FnHipEventElapsedTime = unsafe extern "C" fn(ms: *mut f32, start: HipEvent, stop: HipEvent) -> HipError;

// Memory management
type FnHipMalloc = unsafe extern "C" fn(ptr: *mut HipDeviceptr, size: usize) -> HipError;
type FnHipFree = unsafe extern "C" fn(ptr: HipDeviceptr) -> HipError;
type FnHipHostMalloc = unsafe extern "C" fn(ptr: *mut *mut c_void, size: usize, flags: c_uint) -> HipError;
type FnHipHostFree = unsafe extern "C" fn(ptr: *mut c_void) -> HipError;
type FnHipHostRegister = unsafe extern "C" fn(ptr: *mut c_void, size: usize, flags: c_uint) -> HipError;
type FnHipHostUnregister = unsafe extern "C" fn(ptr: *mut c_void) -> HipError;
type FnHipMemcpyHtoD = unsafe extern "C" fn(dst: HipDeviceptr, src: *const c_void, bytes: usize) -> HipError;
type FnHipMemcpyDtoH = unsafe extern "C" fn(dst: *mut c_void, src: HipDeviceptr, bytes: usize) -> HipError;
type FnHipMemcpyDtoD = unsafe extern "C" fn(dst: HipDeviceptr, src: HipDeviceptr, bytes: usize) -> HipError;
type FnHipMemcpyHtoDAsync =
    unsafe extern "C" fn(dst: HipDeviceptr, src: *const c_void, bytes: usize, stream: HipStream) -> HipError;
type FnHipMemcpyDtoHAsync =
    unsafe extern "C" fn(dst: *mut c_void, src: HipDeviceptr, bytes: usize, stream: HipStream) -> HipError;
type FnHipMemcpyDtoDAsync =
    unsafe extern "C" fn(dst: HipDeviceptr, src: HipDeviceptr, bytes: usize, stream: HipStream) -> HipError;
type FnHipMemsetD8 = unsafe extern "C" fn(dst: HipDeviceptr, value: u8, count: usize) -> HipError;
type FnHipMemsetD32 = unsafe extern "C" fn(dst: HipDeviceptr, value: c_int, count: usize) -> HipError;
type FnHipMemsetD8Async =
    unsafe extern "C" fn(dst: HipDeviceptr, value: u8, count: usize, stream: HipStream) -> HipError;
type FnHipMemsetD32Async =
    unsafe extern "C" fn(dst: HipDeviceptr, value: c_int, count: usize, stream: HipStream) -> HipError;
type FnHipMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> HipError;
type FnHipMemGetAddressRange =
    unsafe extern "C" fn(base: *mut HipDeviceptr, size: *mut usize, ptr: HipDeviceptr) -> HipError;
type FnHipPointerGetAttribute =
    unsafe extern "C" fn(data: *mut c_void, attribute: c_int, ptr: HipDeviceptr) -> HipError;

// Module management
type FnHipModuleLoadData = unsafe extern "C" fn(module: *mut HipModule, image: *const c_void) -> HipError;
type FnHipModuleLoadDataEx = unsafe extern "C" fn(
    module: *mut HipModule,
    image: *const c_void,
    num_options: c_uint,
    options: *mut c_int,
    option_values: *mut *mut c_void,
) -> HipError;
type FnHipModuleUnload = unsafe extern "C" fn(module: HipModule) -> HipError;
type FnHipModuleGetFunction =
    unsafe extern "C" fn(function: *mut HipFunction, module: HipModule, name: *const c_char) -> HipError;
type FnHipModuleGetGlobal = unsafe extern "C" fn(
    dptr: *mut HipDeviceptr,
    bytes: *mut usize,
    module: HipModule,
    name: *const c_char,
) -> HipError;

// Execution
type FnHipModuleLaunchKernel = unsafe extern "C" fn(
    f: HipFunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    stream: HipStream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> HipError;
type FnHipFuncGetAttribute = unsafe extern "C" fn(value: *mut c_int, attrib: c_int, func: HipFunction) -> HipError;
type FnHipFuncSetCacheConfig = unsafe extern "C" fn(func: *const c_void, config: c_int) -> HipError;
type FnHipModuleOccupancyMaxActiveBlocksPerMultiprocessor = unsafe extern "C" fn(
    num_blocks: *mut c_int,
    func: HipFunction,
    block_size: c_int,
    dynamic_smem_size: usize,
) -> HipError;

fn to_ptr(raw: u64) -> *mut c_void {
    raw as usize as *mut c_void
}

fn from_ptr(ptr: *mut c_void) -> u64 {
    ptr as usize as u64
}

fn check(res: HipError) -> HipResult<()> {
    HipStatus(res).check()
}

fn c_name(name: &str) -> HipResult<CString> {
    CString::new(name).map_err(|_| HipStatus::ERROR_INVALID_VALUE)
}

/// Receives completion notifications from the runtime's callback thread.
unsafe extern "C" fn stream_callback_trampoline(_stream: HipStream, status: HipError, user_data: *mut c_void) {
    // SAFETY: `user_data` is the `Box<NativeCallback>` leaked in `stream_add_callback`,
    // and the runtime invokes each callback exactly once.
    let callback = unsafe { Box::from_raw(user_data as *mut NativeCallback) };
    callback(HipStatus(status));
}

/// Dynamically loaded HIP runtime library with function pointers.
pub struct HipDriver {
    _lib: Library,
    // Initialization
    hip_init: FnHipInit,
    hip_driver_get_version: FnHipDriverGetVersion,
    runtime_version: OnceLock<i32>,
    // Device management
    hip_get_device_count: FnHipGetDeviceCount,
    hip_device_get: FnHipDeviceGet,
    hip_device_get_name: FnHipDeviceGetName,
    hip_device_get_attribute: FnHipDeviceGetAttribute,
    hip_device_total_mem: FnHipDeviceTotalMem,
    hip_device_compute_capability: Option<FnHipDeviceComputeCapability>,
    hip_device_get_pci_bus_id: Option<FnHipDeviceGetPCIBusId>,
    hip_device_can_access_peer: Option<FnHipDeviceCanAccessPeer>,
    // Context management
    hip_ctx_create: FnHipCtxCreate,
    hip_ctx_destroy: FnHipCtxDestroy,
    hip_ctx_set_current: FnHipCtxSetCurrent,
    hip_ctx_get_current: FnHipCtxGetCurrent,
    hip_ctx_get_device: FnHipCtxGetDevice,
    hip_ctx_synchronize: FnHipCtxSynchronize,
    hip_ctx_get_shared_mem_config: Option<FnHipCtxGetSharedMemConfig>,
    hip_ctx_set_shared_mem_config: Option<FnHipCtxSetSharedMemConfig>,
    hip_ctx_enable_peer_access: Option<FnHipCtxEnablePeerAccess>,
    // Stream management
    hip_stream_create_with_flags: FnHipStreamCreateWithFlags,
    hip_stream_destroy: FnHipStreamDestroy,
    hip_stream_query: FnHipStreamQuery,
    hip_stream_synchronize: FnHipStreamSynchronize,
    hip_stream_wait_event: Option<FnHipStreamWaitEvent>,
    hip_stream_add_callback: Option<FnHipStreamAddCallback>,
    // Event management
    hip_event_create_with_flags: FnHipEventCreateWithFlags,
    hip_event_destroy: FnHipEventDestroy,
    hip_event_record: FnHipEventRecord,
    hip_event_query: FnHipEventQuery,
    hip_event_synchronize: FnHipEventSynchronize,
    hip_event_elapsed_time: FnHipEventElapsedTime,
    // Memory management
    hip_malloc: FnHipMalloc,
    hip_free: FnHipFree,
    hip_host_malloc: Option<FnHipHostMalloc>,
    hip_host_free: Option<FnHipHostFree>,
    hip_host_register: Option<FnHipHostRegister>,
    hip_host_unregister: Option<FnHipHostUnregister>,
    hip_memcpy_htod: FnHipMemcpyHtoD,
    hip_memcpy_dtoh: FnHipMemcpyDtoH,
    hip_memcpy_dtod: FnHipMemcpyDtoD,
    hip_memcpy_htod_async: Option<FnHipMemcpyHtoDAsync>,
    hip_memcpy_dtoh_async: Option<FnHipMemcpyDtoHAsync>,
    hip_memcpy_dtod_async: Option<FnHipMemcpyDtoDAsync>,
    hip_memset_d8: FnHipMemsetD8,
    hip_memset_d32: FnHipMemsetD32,
    hip_memset_d8_async: Option<FnHipMemsetD8Async>,
    hip_memset_d32_async: Option<FnHipMemsetD32Async>,
    hip_mem_get_info: Option<FnHipMemGetInfo>,
    hip_mem_get_address_range: Option<FnHipMemGetAddressRange>,
    hip_pointer_get_attribute: Option<FnHipPointerGetAttribute>,
    // Module management
    hip_module_load_data: FnHipModuleLoadData,
    hip_module_load_data_ex: Option<FnHipModuleLoadDataEx>,
    hip_module_unload: FnHipModuleUnload,
    hip_module_get_function: FnHipModuleGetFunction,
    hip_module_get_global: FnHipModuleGetGlobal,
    // Execution
    hip_module_launch_kernel: FnHipModuleLaunchKernel,
    hip_func_get_attribute: Option<FnHipFuncGetAttribute>,
    hip_func_set_cache_config: Option<FnHipFuncSetCacheConfig>,
    hip_module_occupancy_max_active_blocks: Option<FnHipModuleOccupancyMaxActiveBlocksPerMultiprocessor>,
}

// SAFETY: The HIP runtime library handles are valid from any thread.
// The runtime itself handles thread safety via its per-thread context slot.
unsafe impl Send for HipDriver {}
unsafe impl Sync for HipDriver {}

impl HipDriver {
    /// Load the HIP runtime and resolve all function pointers. `library_path`
    /// overrides platform discovery.
    pub fn load(library_path: Option<&str>) -> Result<Arc<Self>, String> {
        let lib = Self::load_library(library_path)?;

        unsafe {
            let driver = Self {
                hip_init: Self::load_fn(&lib, "hipInit")?,
                hip_driver_get_version: Self::load_fn(&lib, "hipDriverGetVersion")?,
                runtime_version: OnceLock::new(),
                hip_get_device_count: Self::load_fn(&lib, "hipGetDeviceCount")?,
                hip_device_get: Self::load_fn(&lib, "hipDeviceGet")?,
                hip_device_get_name: Self::load_fn(&lib, "hipDeviceGetName")?,
                hip_device_get_attribute: Self::load_fn(&lib, "hipDeviceGetAttribute")?,
                hip_device_total_mem: Self::load_fn(&lib, "hipDeviceTotalMem")?,
                hip_device_compute_capability: Self::load_fn_opt(&lib, "hipDeviceComputeCapability"),
                hip_device_get_pci_bus_id: Self::load_fn_opt(&lib, "hipDeviceGetPCIBusId"),
                hip_device_can_access_peer: Self::load_fn_opt(&lib, "hipDeviceCanAccessPeer"),
                hip_ctx_create: Self::load_fn(&lib, "hipCtxCreate")?,
                hip_ctx_destroy: Self::load_fn(&lib, "hipCtxDestroy")?,
                hip_ctx_set_current: Self::load_fn(&lib, "hipCtxSetCurrent")?,
                hip_ctx_get_current: Self::load_fn(&lib, "hipCtxGetCurrent")?,
                hip_ctx_get_device: Self::load_fn(&lib, "hipCtxGetDevice")?,
                hip_ctx_synchronize: Self::load_fn(&lib, "hipCtxSynchronize")
                    .or_else(|_| Self::load_fn(&lib, "hipDeviceSynchronize"))?,
                hip_ctx_get_shared_mem_config: Self::load_fn_opt(&lib, "hipCtxGetSharedMemConfig"),
                hip_ctx_set_shared_mem_config: Self::load_fn_opt(&lib, "hipCtxSetSharedMemConfig"),
                hip_ctx_enable_peer_access: Self::load_fn_opt(&lib, "hipCtxEnablePeerAccess"),
                hip_stream_create_with_flags: Self::load_fn(&lib, "hipStreamCreateWithFlags")?,
                hip_stream_destroy: Self::load_fn(&lib, "hipStreamDestroy")?,
                hip_stream_query: Self::load_fn(&lib, "hipStreamQuery")?,
                hip_stream_synchronize: Self::load_fn(&lib, "hipStreamSynchronize")?,
                hip_stream_wait_event: Self::load_fn_opt(&lib, "hipStreamWaitEvent"),
                hip_stream_add_callback: Self::load_fn_opt(&lib, "hipStreamAddCallback"),
                hip_event_create_with_flags: Self::load_fn(&lib, "hipEventCreateWithFlags")?,
                hip_event_destroy: Self::load_fn(&lib, "hipEventDestroy")?,
                hip_event_record: Self::load_fn(&lib, "hipEventRecord")?,
                hip_event_query: Self::load_fn(&lib, "hipEventQuery")?,
                hip_event_synchronize: Self::load_fn(&lib, "hipEventSynchronize")?,
                hip_event_elapsed_time: Self::load_fn(&lib, "hipEventElapsedTime")?,
                hip_malloc: Self::load_fn(&lib, "hipMalloc")?,
                hip_free: Self::load_fn(&lib, "hipFree")?,
                hip_host_malloc: Self::load_fn_opt(&lib, "hipHostMalloc")
                    .or_else(|| Self::load_fn_opt(&lib, "hipExtHostAlloc")),
                hip_host_free: Self::load_fn_opt(&lib, "hipHostFree"),
                hip_host_register: Self::load_fn_opt(&lib, "hipHostRegister"),
                hip_host_unregister: Self::load_fn_opt(&lib, "hipHostUnregister"),
                hip_memcpy_htod: Self::load_fn(&lib, "hipMemcpyHtoD")?,
                hip_memcpy_dtoh: Self::load_fn(&lib, "hipMemcpyDtoH")?,
                hip_memcpy_dtod: Self::load_fn(&lib, "hipMemcpyDtoD")?,
                hip_memcpy_htod_async: Self::load_fn_opt(&lib, "hipMemcpyHtoDAsync"),
                hip_memcpy_dtoh_async: Self::load_fn_opt(&lib, "hipMemcpyDtoHAsync"),
                hip_memcpy_dtod_async: Self::load_fn_opt(&lib, "hipMemcpyDtoDAsync"),
                hip_memset_d8: Self::load_fn(&lib, "hipMemsetD8")?,
                hip_memset_d32: Self::load_fn(&lib, "hipMemsetD32")?,
                hip_memset_d8_async: Self::load_fn_opt(&lib, "hipMemsetD8Async"),
                hip_memset_d32_async: Self::load_fn_opt(&lib, "hipMemsetD32Async"),
                hip_mem_get_info: Self::load_fn_opt(&lib, "hipMemGetInfo"),
                hip_mem_get_address_range: Self::load_fn_opt(&lib, "hipMemGetAddressRange"),
                hip_pointer_get_attribute: Self::load_fn_opt(&lib, "hipPointerGetAttribute"),
                hip_module_load_data: Self::load_fn(&lib, "hipModuleLoadData")?,
                hip_module_load_data_ex: Self::load_fn_opt(&lib, "hipModuleLoadDataEx"),
                hip_module_unload: Self::load_fn(&lib, "hipModuleUnload")?,
                hip_module_get_function: Self::load_fn(&lib, "hipModuleGetFunction")?,
                hip_module_get_global: Self::load_fn(&lib, "hipModuleGetGlobal")?,
                hip_module_launch_kernel: Self::load_fn(&lib, "hipModuleLaunchKernel")?,
                hip_func_get_attribute: Self::load_fn_opt(&lib, "hipFuncGetAttribute"),
                hip_func_set_cache_config: Self::load_fn_opt(&lib, "hipFuncSetCacheConfig"),
                hip_module_occupancy_max_active_blocks: Self::load_fn_opt(
                    &lib,
                    "hipModuleOccupancyMaxActiveBlocksPerMultiprocessor",
                ),
                _lib: lib,
            };

            info!("HIP runtime loaded successfully");
            Ok(Arc::new(driver))
        }
    }

    fn load_library(library_path: Option<&str>) -> Result<Library, String> {
        let candidates: Vec<&str> = match library_path {
            Some(path) => vec![path],
            None => rocdrv_common::platform::hip_library_candidates().to_vec(),
        };
        if candidates.is_empty() {
            return Err(format!(
                "no HIP runtime library known for platform {}",
                rocdrv_common::platform::platform_name()
            ));
        }

        let mut last_err = String::new();
        for name in candidates {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded HIP runtime from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(format!("failed to load HIP runtime library: {}", last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        // SAFETY: the caller picks `F` to match the exported symbol's signature.
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        // SAFETY: as for `load_fn`.
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    fn pointer_attribute<T: Default>(&self, attribute: c_int, ptr: DevicePtr) -> HipResult<T> {
        let func = self.hip_pointer_get_attribute.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut value = T::default();
        check(unsafe { func((&mut value as *mut T).cast(), attribute, ptr.as_raw()) })?;
        Ok(value)
    }
}

impl NativeDriver for HipDriver {
    fn backend_name(&self) -> &'static str {
        "hip"
    }

    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> HipResult<()> {
        check(unsafe { (self.hip_init)(flags as c_uint) })
    }

    fn driver_get_version(&self) -> HipResult<i32> {
        let mut version: c_int = 0;
        check(unsafe { (self.hip_driver_get_version)(&mut version) })?;
        Ok(version)
    }

    // ── Devices ───────────────────────────────────────────────────

    fn device_get_count(&self) -> HipResult<i32> {
        let mut count: c_int = 0;
        check(unsafe { (self.hip_get_device_count)(&mut count) })?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> HipResult<RawDevice> {
        let mut device: HipDevice = 0;
        check(unsafe { (self.hip_device_get)(&mut device, ordinal) })?;
        Ok(device)
    }

    fn device_get_name(&self, device: RawDevice) -> HipResult<String> {
        let mut buf = [0u8; 256];
        check(unsafe { (self.hip_device_get_name)(buf.as_mut_ptr() as *mut c_char, 256, device) })?;
        let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const c_char) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn device_get_attribute(&self, attribute: DeviceAttribute, device: RawDevice) -> HipResult<i32> {
        let mut value: c_int = 0;
        check(unsafe { (self.hip_device_get_attribute)(&mut value, attribute as c_int, device) })?;
        Ok(value)
    }

    fn device_total_mem(&self, device: RawDevice) -> HipResult<usize> {
        let mut bytes: usize = 0;
        check(unsafe { (self.hip_device_total_mem)(&mut bytes, device) })?;
        Ok(bytes)
    }

    fn device_compute_capability(&self, device: RawDevice) -> HipResult<(i32, i32)> {
        if let Some(func) = self.hip_device_compute_capability {
            let mut major: c_int = 0;
            let mut minor: c_int = 0;
            check(unsafe { func(&mut major, &mut minor, device) })?;
            Ok((major, minor))
        } else {
            let major = self.device_get_attribute(DeviceAttribute::ComputeCapabilityMajor, device)?;
            let minor = self.device_get_attribute(DeviceAttribute::ComputeCapabilityMinor, device)?;
            Ok((major, minor))
        }
    }

    fn device_get_pci_bus_id(&self, device: RawDevice) -> HipResult<String> {
        let func = self.hip_device_get_pci_bus_id.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut buf = [0u8; 64];
        check(unsafe { func(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, device) })?;
        let id = unsafe { CStr::from_ptr(buf.as_ptr() as *const c_char) };
        Ok(id.to_string_lossy().into_owned())
    }

    fn device_can_access_peer(&self, device: RawDevice, peer: RawDevice) -> HipResult<bool> {
        let func = self.hip_device_can_access_peer.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut can_access: c_int = 0;
        check(unsafe { func(&mut can_access, device, peer) })?;
        Ok(can_access != 0)
    }

    // ── Contexts ──────────────────────────────────────────────────

    fn ctx_create(&self, flags: u32, device: RawDevice) -> HipResult<RawContext> {
        let mut ctx: HipCtx = std::ptr::null_mut();
        check(unsafe { (self.hip_ctx_create)(&mut ctx, flags as c_uint, device) })?;
        Ok(RawContext(from_ptr(ctx)))
    }

    fn ctx_destroy(&self, ctx: RawContext) -> HipResult<()> {
        check(unsafe { (self.hip_ctx_destroy)(to_ptr(ctx.0)) })
    }

    fn ctx_set_current(&self, ctx: RawContext) -> HipResult<()> {
        check(unsafe { (self.hip_ctx_set_current)(to_ptr(ctx.0)) })
    }

    fn ctx_get_current(&self) -> HipResult<RawContext> {
        let mut ctx: HipCtx = std::ptr::null_mut();
        check(unsafe { (self.hip_ctx_get_current)(&mut ctx) })?;
        Ok(RawContext(from_ptr(ctx)))
    }

    fn ctx_get_device(&self) -> HipResult<RawDevice> {
        let mut device: HipDevice = 0;
        check(unsafe { (self.hip_ctx_get_device)(&mut device) })?;
        Ok(device)
    }

    fn ctx_synchronize(&self) -> HipResult<()> {
        check(unsafe { (self.hip_ctx_synchronize)() })
    }

    fn ctx_get_shared_mem_config(&self) -> HipResult<SharedMemConfig> {
        let func = self.hip_ctx_get_shared_mem_config.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut config: c_int = 0;
        check(unsafe { func(&mut config) })?;
        SharedMemConfig::from_raw(config).ok_or(HipStatus::ERROR_UNKNOWN)
    }

    fn ctx_set_shared_mem_config(&self, config: SharedMemConfig) -> HipResult<()> {
        let func = self.hip_ctx_set_shared_mem_config.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(config as c_int) })
    }

    fn ctx_enable_peer_access(&self, peer: RawContext, flags: u32) -> HipResult<()> {
        let func = self.hip_ctx_enable_peer_access.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(to_ptr(peer.0), flags as c_uint) })
    }

    // ── Streams ───────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> HipResult<RawStream> {
        let mut stream: HipStream = std::ptr::null_mut();
        check(unsafe { (self.hip_stream_create_with_flags)(&mut stream, flags as c_uint) })?;
        Ok(RawStream(from_ptr(stream)))
    }

    fn stream_destroy(&self, stream: RawStream) -> HipResult<()> {
        check(unsafe { (self.hip_stream_destroy)(to_ptr(stream.0)) })
    }

    fn stream_query(&self, stream: RawStream) -> HipResult<()> {
        check(unsafe { (self.hip_stream_query)(to_ptr(stream.0)) })
    }

    fn stream_synchronize(&self, stream: RawStream) -> HipResult<()> {
        check(unsafe { (self.hip_stream_synchronize)(to_ptr(stream.0)) })
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent, flags: u32) -> HipResult<()> {
        let func = self.hip_stream_wait_event.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(to_ptr(stream.0), to_ptr(event.0), flags as c_uint) })
    }

    fn stream_add_callback(&self, stream: RawStream, callback: NativeCallback) -> HipResult<()> {
        let func = self.hip_stream_add_callback.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let user_data = Box::into_raw(Box::new(callback)) as *mut c_void;
        let res = unsafe { func(to_ptr(stream.0), stream_callback_trampoline, user_data, 0) };
        if res != 0 {
            // The runtime rejected the callback and will never call it.
            drop(unsafe { Box::from_raw(user_data as *mut NativeCallback) });
        }
        check(res)
    }

    // ── Events ────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> HipResult<RawEvent> {
        let mut event: HipEvent = std::ptr::null_mut();
        check(unsafe { (self.hip_event_create_with_flags)(&mut event, flags as c_uint) })?;
        Ok(RawEvent(from_ptr(event)))
    }

    fn event_destroy(&self, event: RawEvent) -> HipResult<()> {
        check(unsafe { (self.hip_event_destroy)(to_ptr(event.0)) })
    }

    fn event_record(&self, event: RawEvent, stream: RawStream) -> HipResult<()> {
        check(unsafe { (self.hip_event_record)(to_ptr(event.0), to_ptr(stream.0)) })
    }

    fn event_query(&self, event: RawEvent) -> HipResult<()> {
        check(unsafe { (self.hip_event_query)(to_ptr(event.0)) })
    }

    fn event_synchronize(&self, event: RawEvent) -> HipResult<()> {
        check(unsafe { (self.hip_event_synchronize)(to_ptr(event.0)) })
    }

    fn event_elapsed_time(&self, start: RawEvent, stop: RawEvent) -> HipResult<f32> {
        let mut ms: f32 = 0.0;
        check(unsafe { (self.hip_event_elapsed_time)(&mut ms, to_ptr(start.0), to_ptr(stop.0)) })?;
        Ok(ms)
    }

    // ── Memory ────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: usize) -> HipResult<DevicePtr> {
        let mut ptr: HipDeviceptr = std::ptr::null_mut();
        check(unsafe { (self.hip_malloc)(&mut ptr, bytes) })?;
        Ok(DevicePtr(from_ptr(ptr)))
    }

    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()> {
        check(unsafe { (self.hip_free)(ptr.as_raw()) })
    }

    fn mem_alloc_host(&self, bytes: usize, flags: u32) -> HipResult<*mut c_void> {
        let func = self.hip_host_malloc.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        check(unsafe { func(&mut ptr, bytes, flags as c_uint) })?;
        Ok(ptr)
    }

    fn mem_free_host(&self, ptr: *mut c_void) -> HipResult<()> {
        let func = self.hip_host_free.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(ptr) })
    }

    fn mem_host_register(&self, ptr: *mut c_void, bytes: usize, flags: u32) -> HipResult<()> {
        let func = self.hip_host_register.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(ptr, bytes, flags as c_uint) })
    }

    fn mem_host_unregister(&self, ptr: *mut c_void) -> HipResult<()> {
        let func = self.hip_host_unregister.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(ptr) })
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: *const c_void, bytes: usize) -> HipResult<()> {
        check(unsafe { (self.hip_memcpy_htod)(dst.as_raw(), src, bytes) })
    }

    unsafe fn memcpy_dtoh(&self, dst: *mut c_void, src: DevicePtr, bytes: usize) -> HipResult<()> {
        check(unsafe { (self.hip_memcpy_dtoh)(dst, src.as_raw(), bytes) })
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> HipResult<()> {
        check(unsafe { (self.hip_memcpy_dtod)(dst.as_raw(), src.as_raw(), bytes) })
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()> {
        let func = self.hip_memcpy_htod_async.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(dst.as_raw(), src, bytes, to_ptr(stream.0)) })
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()> {
        let func = self.hip_memcpy_dtoh_async.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(dst, src.as_raw(), bytes, to_ptr(stream.0)) })
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, stream: RawStream) -> HipResult<()> {
        let func = self.hip_memcpy_dtod_async.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(dst.as_raw(), src.as_raw(), bytes, to_ptr(stream.0)) })
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> HipResult<()> {
        check(unsafe { (self.hip_memset_d8)(dst.as_raw(), value, count) })
    }

    fn memset_d32(&self, dst: DevicePtr, value: u32, count: usize) -> HipResult<()> {
        check(unsafe { (self.hip_memset_d32)(dst.as_raw(), value as c_int, count) })
    }

    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: usize, stream: RawStream) -> HipResult<()> {
        let func = self.hip_memset_d8_async.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(dst.as_raw(), value, count, to_ptr(stream.0)) })
    }

    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: usize, stream: RawStream) -> HipResult<()> {
        let func = self.hip_memset_d32_async.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(dst.as_raw(), value as c_int, count, to_ptr(stream.0)) })
    }

    fn mem_get_info(&self) -> HipResult<(usize, usize)> {
        let func = self.hip_mem_get_info.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        check(unsafe { func(&mut free, &mut total) })?;
        Ok((free, total))
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> HipResult<(DevicePtr, usize)> {
        let func = self.hip_mem_get_address_range.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut base: HipDeviceptr = std::ptr::null_mut();
        let mut size: usize = 0;
        check(unsafe { func(&mut base, &mut size, ptr.as_raw()) })?;
        Ok((DevicePtr(from_ptr(base)), size))
    }

    fn pointer_get_info(&self, ptr: DevicePtr) -> HipResult<PointerInfo> {
        let context: usize = self.pointer_attribute(HIP_POINTER_ATTRIBUTE_CONTEXT, ptr)?;
        let memory_type: c_uint = self.pointer_attribute(HIP_POINTER_ATTRIBUTE_MEMORY_TYPE, ptr)?;
        let device_ordinal: c_int = self.pointer_attribute(HIP_POINTER_ATTRIBUTE_DEVICE_ORDINAL, ptr)?;
        let version = *self
            .runtime_version
            .get_or_init(|| self.driver_get_version().unwrap_or(HIP_MEMORY_TYPE_RENUMBERED_VERSION));
        let memory_type = decode_memory_type(memory_type, version).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        Ok(PointerInfo {
            context: RawContext(context as u64),
            memory_type,
            device_ordinal,
        })
    }

    // ── Modules & execution ───────────────────────────────────────

    fn module_load_data(&self, image: &[u8]) -> HipResult<RawModule> {
        let mut module: HipModule = std::ptr::null_mut();
        check(unsafe { (self.hip_module_load_data)(&mut module, image.as_ptr() as *const c_void) })?;
        Ok(RawModule(from_ptr(module)))
    }

    fn module_load_data_ex(&self, image: &[u8], error_log: &mut String) -> HipResult<RawModule> {
        let Some(func) = self.hip_module_load_data_ex else {
            return self.module_load_data(image);
        };
        let mut log = vec![0u8; JIT_LOG_SIZE];
        let mut options = [HIP_JIT_OPTION_ERROR_LOG_BUFFER, HIP_JIT_OPTION_ERROR_LOG_BUFFER_SIZE_BYTES];
        let mut values = [log.as_mut_ptr() as *mut c_void, JIT_LOG_SIZE as *mut c_void];
        let mut module: HipModule = std::ptr::null_mut();
        let res = unsafe {
            func(
                &mut module,
                image.as_ptr() as *const c_void,
                options.len() as c_uint,
                options.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        };
        let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
        *error_log = String::from_utf8_lossy(&log[..end]).into_owned();
        check(res)?;
        Ok(RawModule(from_ptr(module)))
    }

    fn module_unload(&self, module: RawModule) -> HipResult<()> {
        check(unsafe { (self.hip_module_unload)(to_ptr(module.0)) })
    }

    fn module_get_function(&self, module: RawModule, name: &str) -> HipResult<RawFunction> {
        let c_name = c_name(name)?;
        let mut func: HipFunction = std::ptr::null_mut();
        check(unsafe { (self.hip_module_get_function)(&mut func, to_ptr(module.0), c_name.as_ptr()) })?;
        Ok(RawFunction(from_ptr(func)))
    }

    fn module_get_global(&self, module: RawModule, name: &str) -> HipResult<(DevicePtr, usize)> {
        let c_name = c_name(name)?;
        let mut dptr: HipDeviceptr = std::ptr::null_mut();
        let mut size: usize = 0;
        check(unsafe { (self.hip_module_get_global)(&mut dptr, &mut size, to_ptr(module.0), c_name.as_ptr()) })?;
        Ok((DevicePtr(from_ptr(dptr)), size))
    }

    unsafe fn launch_kernel(
        &self,
        function: RawFunction,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: RawStream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> HipResult<()> {
        check(unsafe {
            (self.hip_module_launch_kernel)(
                to_ptr(function.0),
                grid.x,
                grid.y,
                grid.z,
                block.x,
                block.y,
                block.z,
                shared_mem_bytes,
                to_ptr(stream.0),
                kernel_params,
                extra,
            )
        })
    }

    fn func_get_attribute(&self, attribute: FunctionAttribute, function: RawFunction) -> HipResult<i32> {
        let func = self.hip_func_get_attribute.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut value: c_int = 0;
        check(unsafe { func(&mut value, attribute as c_int, to_ptr(function.0)) })?;
        Ok(value)
    }

    fn func_set_cache_config(&self, function: RawFunction, config: CacheConfig) -> HipResult<()> {
        let func = self.hip_func_set_cache_config.ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        check(unsafe { func(to_ptr(function.0) as *const c_void, config as c_int) })
    }

    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        function: RawFunction,
        block_size: i32,
        dynamic_smem_bytes: usize,
    ) -> HipResult<i32> {
        let func = self
            .hip_module_occupancy_max_active_blocks
            .ok_or(HipStatus::ERROR_NOT_SUPPORTED)?;
        let mut blocks: c_int = 0;
        check(unsafe { func(&mut blocks, to_ptr(function.0), block_size, dynamic_smem_bytes) })?;
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_follows_runtime_numbering() {
        assert_eq!(decode_memory_type(1, 60_032_830), Some(NativeMemoryType::Host));
        assert_eq!(decode_memory_type(2, 60_032_830), Some(NativeMemoryType::Device));
        assert_eq!(decode_memory_type(3, 60_032_830), Some(NativeMemoryType::Managed));
        assert_eq!(decode_memory_type(0, 60_032_830), None);

        assert_eq!(decode_memory_type(0, 50_422_803), Some(NativeMemoryType::Host));
        assert_eq!(decode_memory_type(1, 50_422_803), Some(NativeMemoryType::Device));
        assert_eq!(decode_memory_type(4, 50_422_803), Some(NativeMemoryType::Managed));
        assert_eq!(decode_memory_type(2, 50_422_803), None);
    }
}
