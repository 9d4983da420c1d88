pub mod config;
pub mod error;
pub mod handle_map;
pub mod native;

pub use config::DriverConfig;
pub use error::{CoreError, DriverError, ErrorKind, Status, StatusOr};
pub use native::{
    CacheConfig, ContextFlags, DeviceAttribute, DevicePtr, Dim3, FunctionAttribute, HipResult,
    HipStatus, NativeDriver, SharedMemConfig,
};
