//! Simulated ROCm device.
//!
//! Implements [`rocdrv_core::NativeDriver`] entirely on the CPU so the driver
//! layer can be exercised without a GPU.

pub mod code_object;
mod driver;
pub mod kernel;
mod memory;
mod stream;

pub use driver::SimDriver;
pub use kernel::{KernelInvocation, KernelRegistry};
