//! Safe resource-management layer over the ROCm/HIP module API.
//!
//! [`Driver`] owns a [`NativeDriver`] backend (the dynamically loaded HIP
//! runtime or the simulated device) and exposes context, stream, event,
//! memory, peer-access and module operations that convert every native
//! status into a [`DriverError`].

mod activation;
mod callback;
pub mod context;
pub mod device;
mod driver;
pub mod hip_driver;
pub mod memory;
pub mod module;
mod peer;
pub mod stream;

pub use activation::ScopedActivateContext;
pub use context::{Context, Device};
pub use device::DeviceProperties;
pub use driver::{set_inject_init_error, Driver};
pub use memory::{memory_space_string, HostMemory, MemorySpace};
pub use module::{Function, KernelArg, LaunchParams, Module};
pub use stream::{Event, EventFlags, EventStatus, Stream};

pub use rocdrv_core::{
    CacheConfig, ContextFlags, DevicePtr, Dim3, DriverConfig, DriverError, ErrorKind, FunctionAttribute,
    NativeDriver, SharedMemConfig, Status, StatusOr,
};
