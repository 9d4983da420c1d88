//! Host-side kernel bodies for the simulated device.
//!
//! A code object only declares entry points; what a launch actually does is a
//! closure registered under the entry name. The closure sees the whole launch
//! at once (grid, block, decoded arguments) plus typed access to device memory.

use std::sync::Arc;

use bytemuck::Pod;
use dashmap::DashMap;
use parking_lot::Mutex;

use rocdrv_core::config::SimDeviceConfig;
use rocdrv_core::native::{DevicePtr, Dim3, HipResult, HipStatus};

use crate::code_object::EntryInfo;
use crate::memory::AddressSpace;

pub type KernelFn = dyn Fn(&mut KernelInvocation<'_>) -> HipResult<()> + Send + Sync + 'static;

/// Registered kernel bodies, keyed by entry name.
pub struct KernelRegistry {
    kernels: DashMap<String, Arc<KernelFn>>,
}

impl KernelRegistry {
    /// A registry preloaded with the built-in kernels (`identity`, `fill_u32`).
    pub fn with_builtins() -> Self {
        let registry = Self { kernels: DashMap::new() };
        registry.register("identity", identity);
        registry.register("fill_u32", fill_u32);
        registry
    }

    pub fn register<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut KernelInvocation<'_>) -> HipResult<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(body));
    }

    pub fn get(&self, name: &str) -> Option<Arc<KernelFn>> {
        self.kernels.get(name).map(|k| Arc::clone(k.value()))
    }
}

/// One kernel launch as seen by its host body.
pub struct KernelInvocation<'a> {
    pub(crate) grid: Dim3,
    pub(crate) block: Dim3,
    pub(crate) shared_mem_bytes: u32,
    pub(crate) args: &'a [Vec<u8>],
    pub(crate) memory: &'a Mutex<AddressSpace>,
}

impl KernelInvocation<'_> {
    pub fn grid(&self) -> Dim3 {
        self.grid
    }

    pub fn block(&self) -> Dim3 {
        self.block
    }

    pub fn dynamic_shared_mem_bytes(&self) -> u32 {
        self.shared_mem_bytes
    }

    /// Total number of threads in the launch.
    pub fn thread_count(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Argument `index` reinterpreted as `T`; its size must match exactly.
    pub fn param<T: Pod>(&self, index: usize) -> HipResult<T> {
        let bytes = self.args.get(index).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn ptr_param(&self, index: usize) -> HipResult<DevicePtr> {
        self.param::<u64>(index).map(DevicePtr)
    }

    /// Read `count` elements of device memory. Out-of-bounds access faults.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, count: usize) -> HipResult<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.memory
            .lock()
            .read(ptr, bytemuck::cast_slice_mut(&mut out))
            .map_err(|_| HipStatus::ERROR_ILLEGAL_ADDRESS)?;
        Ok(out)
    }

    pub fn write<T: Pod>(&self, ptr: DevicePtr, values: &[T]) -> HipResult<()> {
        self.memory
            .lock()
            .write(ptr, bytemuck::cast_slice(values))
            .map_err(|_| HipStatus::ERROR_ILLEGAL_ADDRESS)
    }
}

/// `identity(const u32* input, u32* output, u32 n)`: one thread per word.
fn identity(inv: &mut KernelInvocation<'_>) -> HipResult<()> {
    let input = inv.ptr_param(0)?;
    let output = inv.ptr_param(1)?;
    let n = inv.param::<u32>(2)? as u64;
    let count = n.min(inv.thread_count()) as usize;
    let words = inv.read::<u32>(input, count)?;
    inv.write(output, &words)
}

/// `fill_u32(u32* output, u32 value, u32 n)`
fn fill_u32(inv: &mut KernelInvocation<'_>) -> HipResult<()> {
    let output = inv.ptr_param(0)?;
    let value = inv.param::<u32>(1)?;
    let n = inv.param::<u32>(2)? as u64;
    let count = n.min(inv.thread_count()) as usize;
    inv.write(output, &vec![value; count])
}

/// Registers per thread assumed when the code object gives no `.maxnreg`.
pub const DEFAULT_REGISTERS_PER_THREAD: u32 = 32;

/// Resident blocks per multiprocessor for `entry` at `block_size` threads.
pub fn max_active_blocks(device: &SimDeviceConfig, entry: &EntryInfo, block_size: i32, dynamic_smem: usize) -> i32 {
    if block_size <= 0 {
        return 0;
    }
    let entry_limit = entry.max_threads.map_or(i32::MAX, |t| t as i32);
    if block_size > device.max_threads_per_block || block_size > entry_limit {
        return 0;
    }

    let warp = device.warp_size.max(1);
    let warps = (block_size + warp - 1) / warp;
    let threads_rounded = warps * warp;

    let by_blocks = device.max_blocks_per_multiprocessor;
    let by_threads = device.max_threads_per_multiprocessor / threads_rounded;

    let smem = entry.static_shared_bytes + dynamic_smem;
    if smem > device.max_shared_memory_per_block as usize {
        return 0;
    }
    let by_smem = if smem == 0 {
        i32::MAX
    } else {
        (device.max_shared_memory_per_multiprocessor as usize / smem) as i32
    };

    let regs = entry.max_registers.unwrap_or(DEFAULT_REGISTERS_PER_THREAD) as i32;
    let regs_per_block = regs * threads_rounded;
    let by_regs = if regs_per_block == 0 {
        i32::MAX
    } else {
        device.max_registers_per_block / regs_per_block
    };

    by_blocks.min(by_threads).min(by_smem).min(by_regs).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_object::ParamInfo;

    fn entry(shared: usize, regs: Option<u32>) -> EntryInfo {
        EntryInfo {
            name: "k".into(),
            params: vec![ParamInfo { size: 8, align: 8 }],
            static_shared_bytes: shared,
            max_threads: None,
            max_registers: regs,
        }
    }

    #[test]
    fn occupancy_is_thread_limited_for_light_kernels() {
        let device = SimDeviceConfig::named("test");
        // 2048 threads / 256 = 8; 65536 regs / (32 * 256) = 8
        assert_eq!(max_active_blocks(&device, &entry(0, None), 256, 0), 8);
        assert_eq!(max_active_blocks(&device, &entry(0, Some(16)), 128, 0), 16);
    }

    #[test]
    fn occupancy_respects_shared_memory() {
        let device = SimDeviceConfig::named("test");
        assert_eq!(max_active_blocks(&device, &entry(16384, Some(8)), 64, 16384), 2);
        assert_eq!(max_active_blocks(&device, &entry(65536, None), 64, 1), 0);
    }

    #[test]
    fn oversized_blocks_have_no_occupancy() {
        let device = SimDeviceConfig::named("test");
        assert_eq!(max_active_blocks(&device, &entry(0, None), 2048, 0), 0);
        assert_eq!(max_active_blocks(&device, &entry(0, None), 0, 0), 0);
    }

    #[test]
    fn identity_copies_one_word_per_thread() {
        let memory = Mutex::new(AddressSpace::new(vec![1 << 20]));
        let (input, output) = {
            let mut space = memory.lock();
            let ctx = rocdrv_core::native::RawContext(1);
            let input = space.alloc_device(0, ctx, 64, crate::memory::RegionKind::Device).expect("in");
            let output = space.alloc_device(0, ctx, 64, crate::memory::RegionKind::Device).expect("out");
            let words: Vec<u32> = (0..16).collect();
            space.write(input, bytemuck::cast_slice(&words)).expect("seed");
            (input, output)
        };

        let args = vec![
            input.0.to_ne_bytes().to_vec(),
            output.0.to_ne_bytes().to_vec(),
            8u32.to_ne_bytes().to_vec(),
        ];
        let mut inv = KernelInvocation {
            grid: Dim3::new(1, 1, 1),
            block: Dim3::new(16, 1, 1),
            shared_mem_bytes: 0,
            args: &args,
            memory: &memory,
        };
        identity(&mut inv).expect("launch");

        let copied = inv.read::<u32>(output, 16).expect("read back");
        assert_eq!(&copied[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(copied[8..].iter().all(|&w| w == 0));
    }
}
