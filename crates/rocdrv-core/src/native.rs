//! The native driver ABI seam.
//!
//! `NativeDriver` mirrors the HIP driver-style ("module") API one call at a time:
//! opaque integer handles in, `HipResult` out. The dynamically loaded HIP runtime
//! and the simulated device both implement it, and everything above this trait
//! is backend-agnostic.

use std::ffi::c_void;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Raw `hipError_t` value returned by every native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HipStatus(pub i32);

pub type HipResult<T> = Result<T, HipStatus>;

impl HipStatus {
    pub const SUCCESS: Self = Self(0);
    pub const ERROR_INVALID_VALUE: Self = Self(1);
    pub const ERROR_OUT_OF_MEMORY: Self = Self(2);
    pub const ERROR_NOT_INITIALIZED: Self = Self(3);
    pub const ERROR_DEINITIALIZED: Self = Self(4);
    pub const ERROR_INVALID_DEVICE_POINTER: Self = Self(17);
    pub const ERROR_INSUFFICIENT_DRIVER: Self = Self(35);
    pub const ERROR_INVALID_DEVICE_FUNCTION: Self = Self(98);
    pub const ERROR_NO_DEVICE: Self = Self(100);
    pub const ERROR_INVALID_DEVICE: Self = Self(101);
    pub const ERROR_INVALID_IMAGE: Self = Self(200);
    pub const ERROR_INVALID_CONTEXT: Self = Self(201);
    pub const ERROR_NO_BINARY_FOR_GPU: Self = Self(209);
    pub const ERROR_PEER_ACCESS_UNSUPPORTED: Self = Self(217);
    pub const ERROR_INVALID_KERNEL_FILE: Self = Self(218);
    pub const ERROR_SHARED_OBJECT_SYMBOL_NOT_FOUND: Self = Self(302);
    pub const ERROR_SHARED_OBJECT_INIT_FAILED: Self = Self(303);
    pub const ERROR_INVALID_HANDLE: Self = Self(400);
    pub const ERROR_NOT_FOUND: Self = Self(500);
    pub const ERROR_NOT_READY: Self = Self(600);
    pub const ERROR_ILLEGAL_ADDRESS: Self = Self(700);
    pub const ERROR_LAUNCH_OUT_OF_RESOURCES: Self = Self(701);
    pub const ERROR_PEER_ACCESS_ALREADY_ENABLED: Self = Self(704);
    pub const ERROR_PEER_ACCESS_NOT_ENABLED: Self = Self(705);
    pub const ERROR_CONTEXT_IS_DESTROYED: Self = Self(709);
    pub const ERROR_HOST_MEMORY_ALREADY_REGISTERED: Self = Self(712);
    pub const ERROR_HOST_MEMORY_NOT_REGISTERED: Self = Self(713);
    pub const ERROR_LAUNCH_FAILURE: Self = Self(719);
    pub const ERROR_NOT_SUPPORTED: Self = Self(801);
    pub const ERROR_UNKNOWN: Self = Self(999);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Converts the status into a `HipResult`, mapping success to `Ok(())`.
    pub fn check(self) -> HipResult<()> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }

    /// Symbolic name, e.g. `hipErrorOutOfMemory`.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "hipSuccess",
            1 => "hipErrorInvalidValue",
            2 => "hipErrorOutOfMemory",
            3 => "hipErrorNotInitialized",
            4 => "hipErrorDeinitialized",
            17 => "hipErrorInvalidDevicePointer",
            35 => "hipErrorInsufficientDriver",
            98 => "hipErrorInvalidDeviceFunction",
            100 => "hipErrorNoDevice",
            101 => "hipErrorInvalidDevice",
            200 => "hipErrorInvalidImage",
            201 => "hipErrorInvalidContext",
            209 => "hipErrorNoBinaryForGpu",
            217 => "hipErrorPeerAccessUnsupported",
            218 => "hipErrorInvalidKernelFile",
            302 => "hipErrorSharedObjectSymbolNotFound",
            303 => "hipErrorSharedObjectInitFailed",
            400 => "hipErrorInvalidHandle",
            500 => "hipErrorNotFound",
            600 => "hipErrorNotReady",
            700 => "hipErrorIllegalAddress",
            701 => "hipErrorLaunchOutOfResources",
            704 => "hipErrorPeerAccessAlreadyEnabled",
            705 => "hipErrorPeerAccessNotEnabled",
            709 => "hipErrorContextIsDestroyed",
            712 => "hipErrorHostMemoryAlreadyRegistered",
            713 => "hipErrorHostMemoryNotRegistered",
            719 => "hipErrorLaunchFailure",
            801 => "hipErrorNotSupported",
            _ => "hipErrorUnknown",
        }
    }

    /// Human-readable description, as `hipGetErrorString` would report it.
    pub fn description(self) -> &'static str {
        match self.0 {
            0 => "no error",
            1 => "invalid argument",
            2 => "out of memory",
            3 => "driver not initialized",
            4 => "driver deinitialized",
            17 => "invalid device pointer",
            35 => "driver version is insufficient for runtime version",
            98 => "invalid device function",
            100 => "no ROCm-capable device is detected",
            101 => "invalid device ordinal",
            200 => "device kernel image is invalid",
            201 => "invalid device context",
            209 => "no kernel image is available for execution on the device",
            217 => "peer access is not supported between these two devices",
            218 => "invalid kernel file",
            302 => "shared object symbol not found",
            303 => "shared object initialization failed",
            400 => "invalid resource handle",
            500 => "named symbol not found",
            600 => "device not ready",
            700 => "an illegal memory access was encountered",
            701 => "too many resources requested for launch",
            704 => "peer access is already enabled",
            705 => "peer access has not been enabled",
            709 => "context is destroyed",
            712 => "part or all of the requested memory range is already mapped",
            713 => "pointer does not correspond to a registered memory region",
            719 => "unspecified launch failure",
            801 => "operation not supported",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for HipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// `hipDevice_t` is a plain ordinal-like integer.
pub type RawDevice = i32;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

raw_handle!(
    /// `hipCtx_t`
    RawContext
);
raw_handle!(
    /// `hipStream_t`. The null value names the per-context default stream.
    RawStream
);
raw_handle!(
    /// `hipEvent_t`
    RawEvent
);
raw_handle!(
    /// `hipModule_t`
    RawModule
);
raw_handle!(
    /// `hipFunction_t`
    RawFunction
);

/// A device virtual address (`hipDeviceptr_t`).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
         bytemuck::Pod, bytemuck::Zeroable)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Names a host address in the unified address space, for pointer queries.
    pub fn from_host<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Grid or block geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// `hipDeviceAttribute_t` values used by this layer (ROCm 6 numbering).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    EccEnabled = 0,
    ClockRate = 5,
    ConcurrentKernels = 8,
    Integrated = 16,
    L2CacheSize = 19,
    ComputeCapabilityMajor = 23,
    MaxBlocksPerMultiprocessor = 25,
    MaxBlockDimX = 26,
    MaxBlockDimY = 27,
    MaxBlockDimZ = 28,
    MaxGridDimX = 29,
    MaxGridDimY = 30,
    MaxGridDimZ = 31,
    MaxThreadsPerBlock = 56,
    MaxThreadsPerMultiprocessor = 57,
    ComputeCapabilityMinor = 61,
    MultiprocessorCount = 63,
    PciBusId = 67,
    PciDeviceId = 68,
    PciDomainId = 69,
    MaxRegistersPerBlock = 71,
    MaxRegistersPerMultiprocessor = 72,
    MaxSharedMemoryPerBlock = 74,
    MaxSharedMemoryPerMultiprocessor = 76,
    UnifiedAddressing = 85,
    WarpSize = 87,
}

/// `hipFunction_attribute`
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionAttribute {
    MaxThreadsPerBlock = 0,
    SharedSizeBytes = 1,
    ConstSizeBytes = 2,
    LocalSizeBytes = 3,
    NumRegs = 4,
    PtxVersion = 5,
    BinaryVersion = 6,
    CacheModeCa = 7,
    MaxDynamicSharedSizeBytes = 8,
    PreferredSharedMemoryCarveout = 9,
}

/// `hipFuncCache_t`
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheConfig {
    #[default]
    PreferNone = 0,
    PreferShared = 1,
    PreferL1 = 2,
    PreferEqual = 3,
}

/// `hipSharedMemConfig`
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharedMemConfig {
    #[default]
    BankSizeDefault = 0,
    BankSizeFourByte = 1,
    BankSizeEightByte = 2,
}

impl SharedMemConfig {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::BankSizeDefault),
            1 => Some(Self::BankSizeFourByte),
            2 => Some(Self::BankSizeEightByte),
            _ => None,
        }
    }
}

/// Where the driver says a pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeMemoryType {
    Host,
    Device,
    Managed,
}

/// Decoded result of the pointer-attribute queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    pub context: RawContext,
    pub memory_type: NativeMemoryType,
    pub device_ordinal: i32,
}

bitflags! {
    /// Context creation flags (`hipDeviceSchedule*`, `hipDeviceMapHost`, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ContextFlags: u32 {
        const SCHEDULE_AUTO = 0x0;
        const SCHEDULE_SPIN = 0x1;
        const SCHEDULE_YIELD = 0x2;
        const SCHEDULE_BLOCKING_SYNC = 0x4;
        const MAP_HOST = 0x8;
        const LMEM_RESIZE_TO_MAX = 0x10;
    }
}

impl ContextFlags {
    const SCHEDULE_MASK: u32 = 0x7;

    /// Only one scheduling policy may be requested at a time.
    pub fn is_valid(&self) -> bool {
        (self.bits() & Self::SCHEDULE_MASK).count_ones() <= 1
    }
}

pub const EVENT_DEFAULT: u32 = 0x0;
pub const EVENT_BLOCKING_SYNC: u32 = 0x1;
pub const EVENT_DISABLE_TIMING: u32 = 0x2;

pub const STREAM_DEFAULT: u32 = 0x0;
pub const STREAM_NON_BLOCKING: u32 = 0x1;

pub const HOST_MALLOC_DEFAULT: u32 = 0x0;
pub const HOST_MALLOC_PORTABLE: u32 = 0x1;

pub const HOST_REGISTER_DEFAULT: u32 = 0x0;
pub const HOST_REGISTER_PORTABLE: u32 = 0x1;

/// Markers for the packed `extra` launch-argument convention.
pub const LAUNCH_PARAM_BUFFER_POINTER: usize = 0x01;
pub const LAUNCH_PARAM_BUFFER_SIZE: usize = 0x02;
pub const LAUNCH_PARAM_END: usize = 0x03;

/// Host function enqueued behind stream work. It runs on a driver-owned thread
/// and receives the stream's status at the time it fires.
pub type NativeCallback = Box<dyn FnOnce(HipStatus) + Send + 'static>;

/// One-to-one view of the native driver entry points this layer uses.
///
/// Calls documented by the vendor as acting on "the current context" do so here
/// too; callers are expected to activate the right context first.
pub trait NativeDriver: Send + Sync {
    /// Short backend identifier for logs ("hip", "sim").
    fn backend_name(&self) -> &'static str;

    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> HipResult<()>;
    fn driver_get_version(&self) -> HipResult<i32>;

    // ── Devices ───────────────────────────────────────────────────

    fn device_get_count(&self) -> HipResult<i32>;
    fn device_get(&self, ordinal: i32) -> HipResult<RawDevice>;
    fn device_get_name(&self, device: RawDevice) -> HipResult<String>;
    fn device_get_attribute(&self, attribute: DeviceAttribute, device: RawDevice) -> HipResult<i32>;
    fn device_total_mem(&self, device: RawDevice) -> HipResult<usize>;
    fn device_compute_capability(&self, device: RawDevice) -> HipResult<(i32, i32)>;
    fn device_get_pci_bus_id(&self, device: RawDevice) -> HipResult<String>;
    fn device_can_access_peer(&self, device: RawDevice, peer: RawDevice) -> HipResult<bool>;

    // ── Contexts ──────────────────────────────────────────────────

    /// Creates a context and makes it current on the calling thread.
    fn ctx_create(&self, flags: u32, device: RawDevice) -> HipResult<RawContext>;
    fn ctx_destroy(&self, ctx: RawContext) -> HipResult<()>;
    fn ctx_set_current(&self, ctx: RawContext) -> HipResult<()>;
    /// Returns `RawContext::NULL` when no context is current.
    fn ctx_get_current(&self) -> HipResult<RawContext>;
    fn ctx_get_device(&self) -> HipResult<RawDevice>;
    fn ctx_synchronize(&self) -> HipResult<()>;
    fn ctx_get_shared_mem_config(&self) -> HipResult<SharedMemConfig>;
    fn ctx_set_shared_mem_config(&self, config: SharedMemConfig) -> HipResult<()>;
    fn ctx_enable_peer_access(&self, peer: RawContext, flags: u32) -> HipResult<()>;

    // ── Streams ───────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> HipResult<RawStream>;
    fn stream_destroy(&self, stream: RawStream) -> HipResult<()>;
    /// `Err(ERROR_NOT_READY)` while work is outstanding.
    fn stream_query(&self, stream: RawStream) -> HipResult<()>;
    fn stream_synchronize(&self, stream: RawStream) -> HipResult<()>;
    fn stream_wait_event(&self, stream: RawStream, event: RawEvent, flags: u32) -> HipResult<()>;
    fn stream_add_callback(&self, stream: RawStream, callback: NativeCallback) -> HipResult<()>;

    // ── Events ────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> HipResult<RawEvent>;
    fn event_destroy(&self, event: RawEvent) -> HipResult<()>;
    fn event_record(&self, event: RawEvent, stream: RawStream) -> HipResult<()>;
    /// `Err(ERROR_NOT_READY)` while the recorded work is outstanding.
    fn event_query(&self, event: RawEvent) -> HipResult<()>;
    fn event_synchronize(&self, event: RawEvent) -> HipResult<()>;
    fn event_elapsed_time(&self, start: RawEvent, stop: RawEvent) -> HipResult<f32>;

    // ── Memory ────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: usize) -> HipResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()>;
    fn mem_alloc_host(&self, bytes: usize, flags: u32) -> HipResult<*mut c_void>;
    fn mem_free_host(&self, ptr: *mut c_void) -> HipResult<()>;
    fn mem_host_register(&self, ptr: *mut c_void, bytes: usize, flags: u32) -> HipResult<()>;
    fn mem_host_unregister(&self, ptr: *mut c_void) -> HipResult<()>;

    /// # Safety
    /// `src` must be readable for `bytes` bytes.
    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: *const c_void, bytes: usize) -> HipResult<()>;
    /// # Safety
    /// `dst` must be writable for `bytes` bytes.
    unsafe fn memcpy_dtoh(&self, dst: *mut c_void, src: DevicePtr, bytes: usize) -> HipResult<()>;
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> HipResult<()>;

    /// # Safety
    /// `src` must stay readable for `bytes` bytes until the stream reaches the copy.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()>;
    /// # Safety
    /// `dst` must stay writable for `bytes` bytes until the stream reaches the copy.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()>;
    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, stream: RawStream) -> HipResult<()>;

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> HipResult<()>;
    fn memset_d32(&self, dst: DevicePtr, value: u32, count: usize) -> HipResult<()>;
    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: usize, stream: RawStream) -> HipResult<()>;
    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: usize, stream: RawStream) -> HipResult<()>;

    /// `(free, total)` for the current context's device.
    fn mem_get_info(&self) -> HipResult<(usize, usize)>;
    fn mem_get_address_range(&self, ptr: DevicePtr) -> HipResult<(DevicePtr, usize)>;
    fn pointer_get_info(&self, ptr: DevicePtr) -> HipResult<PointerInfo>;

    // ── Modules & execution ───────────────────────────────────────

    fn module_load_data(&self, image: &[u8]) -> HipResult<RawModule>;
    /// Like `module_load_data`, capturing the loader's error log on failure.
    fn module_load_data_ex(&self, image: &[u8], error_log: &mut String) -> HipResult<RawModule>;
    fn module_unload(&self, module: RawModule) -> HipResult<()>;
    fn module_get_function(&self, module: RawModule, name: &str) -> HipResult<RawFunction>;
    fn module_get_global(&self, module: RawModule, name: &str) -> HipResult<(DevicePtr, usize)>;

    /// # Safety
    /// Exactly one of `kernel_params` / `extra` is non-null and describes
    /// arguments matching the kernel's signature; every pointer in it stays
    /// valid for the duration of the call.
    #[allow(clippy::too_many_arguments)]
    unsafe fn launch_kernel(
        &self,
        function: RawFunction,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: RawStream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> HipResult<()>;

    fn func_get_attribute(&self, attribute: FunctionAttribute, function: RawFunction) -> HipResult<i32>;
    fn func_set_cache_config(&self, function: RawFunction, config: CacheConfig) -> HipResult<()>;
    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        function: RawFunction,
        block_size: i32,
        dynamic_smem_bytes: usize,
    ) -> HipResult<i32>;
}
