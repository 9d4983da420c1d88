//! Module loading, symbol resolution and kernel launch.

use std::ffi::c_void;
use std::marker::PhantomData;

use bytemuck::Pod;
use tracing::{debug, error, info};

use rocdrv_core::handle_map::{HandleKind, HandleRecord};
use rocdrv_core::native::{
    RawFunction, RawModule, LAUNCH_PARAM_BUFFER_POINTER, LAUNCH_PARAM_BUFFER_SIZE, LAUNCH_PARAM_END,
};
use rocdrv_core::{CacheConfig, DevicePtr, Dim3, DriverError, FunctionAttribute, Status, StatusOr};

use crate::context::Context;
use crate::driver::{check, Driver};
use crate::stream::Stream;

/// Loaded device code. Valid until unloaded or its context is destroyed.
#[derive(Debug)]
pub struct Module {
    raw: RawModule,
    context_id: i64,
}

impl Module {
    pub fn raw(&self) -> RawModule {
        self.raw
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

/// A kernel entry point resolved from a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    raw: RawFunction,
    context_id: i64,
    module: RawModule,
}

impl Function {
    pub fn raw(&self) -> RawFunction {
        self.raw
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }
}

/// One kernel argument, borrowed for the duration of the launch call.
#[derive(Debug, Clone, Copy)]
pub struct KernelArg<'a> {
    ptr: *const c_void,
    size: usize,
    _value: PhantomData<&'a ()>,
}

impl<'a> KernelArg<'a> {
    pub fn new<T: Pod>(value: &'a T) -> Self {
        Self {
            ptr: (value as *const T).cast(),
            size: std::mem::size_of::<T>(),
            _value: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl<'a, T: Pod> From<&'a T> for KernelArg<'a> {
    fn from(value: &'a T) -> Self {
        Self::new(value)
    }
}

/// How kernel parameters are passed to a launch.
#[derive(Debug, Clone, Copy)]
pub enum LaunchParams<'a> {
    /// One pointer per kernel parameter.
    Args(&'a [KernelArg<'a>]),
    /// All parameters packed into one buffer with their natural alignment.
    Packed(&'a [u8]),
}

impl Driver {
    /// Loads a text code object. The loader's diagnostic log is captured and
    /// logged when loading fails.
    pub fn load_ptx(&self, context: &Context, text: &str) -> StatusOr<Module> {
        let _guard = self.activate(context, "load_ptx")?;
        let mut image = Vec::with_capacity(text.len() + 1);
        image.extend_from_slice(text.as_bytes());
        image.push(0);

        let mut log = String::new();
        let res = self.native().module_load_data_ex(&image, &mut log);
        let raw = match res {
            Ok(raw) => {
                if !log.is_empty() {
                    debug!("module loader log for context {}: {}", context.id(), log);
                }
                raw
            }
            Err(status) => {
                error!("failed to load text module in context {}: {}; loader log: {}", context.id(), status, log);
                return Err(DriverError::from_native(
                    "hipModuleLoadDataEx",
                    status,
                    format!("context={} log: {}", context.id(), log),
                ));
            }
        };
        Ok(self.track_module(context, raw))
    }

    /// Loads a binary code object.
    pub fn load_cubin(&self, context: &Context, image: &[u8]) -> StatusOr<Module> {
        let _guard = self.activate(context, "load_cubin")?;
        let raw = check("hipModuleLoadData", self.native().module_load_data(image), || {
            format!("context={} bytes={}", context.id(), image.len())
        })?;
        Ok(self.track_module(context, raw))
    }

    fn track_module(&self, context: &Context, raw: RawModule) -> Module {
        self.handles
            .insert(raw.0, HandleRecord::new(HandleKind::Module, Some(context.id())));
        info!("loaded module 0x{:x} into context {}", raw.0, context.id());
        Module {
            raw,
            context_id: context.id(),
        }
    }

    /// Unloads `module` and nulls it. Functions resolved from it become invalid.
    pub fn unload_module(&self, context: &Context, module: &mut Module) -> Status {
        if module.is_null() {
            return Ok(());
        }
        let _guard = self.activate(context, "unload_module")?;
        self.owned(HandleKind::Module, module.raw.0, context)?;
        check("hipModuleUnload", self.native().module_unload(module.raw), || {
            format!("context={} module=0x{:x}", context.id(), module.raw.0)
        })?;
        self.handles.remove(HandleKind::Module, module.raw.0);
        let dropped = self.handles.remove_children(module.raw.0);
        debug!(
            "unloaded module 0x{:x} from context {} ({} function handle(s) invalidated)",
            module.raw.0,
            context.id(),
            dropped
        );
        module.raw = RawModule::NULL;
        Ok(())
    }

    pub fn get_module_function(&self, context: &Context, module: &Module, name: &str) -> StatusOr<Function> {
        let _guard = self.activate(context, "get_module_function")?;
        self.owned(HandleKind::Module, module.raw.0, context)?;
        let raw = check("hipModuleGetFunction", self.native().module_get_function(module.raw, name), || {
            format!("context={} module=0x{:x} name={}", context.id(), module.raw.0, name)
        })?;
        self.handles.insert(
            raw.0,
            HandleRecord::new(HandleKind::Function, Some(context.id())).with_parent(module.raw.0),
        );
        Ok(Function {
            raw,
            context_id: context.id(),
            module: module.raw,
        })
    }

    /// Address and size of the global named `name`.
    pub fn get_module_symbol(&self, context: &Context, module: &Module, name: &str) -> StatusOr<(DevicePtr, usize)> {
        let _guard = self.activate(context, "get_module_symbol")?;
        self.owned(HandleKind::Module, module.raw.0, context)?;
        check("hipModuleGetGlobal", self.native().module_get_global(module.raw, name), || {
            format!("context={} module=0x{:x} name={}", context.id(), module.raw.0, name)
        })
    }

    /// Launches `function` on `stream`.
    ///
    /// # Safety
    ///
    /// `params` must match the kernel's parameter list in count, size and
    /// order, and every device pointer passed must be valid for the accesses
    /// the kernel performs. The kernel runs with the device's full access to
    /// any host memory mapped into the context.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn launch_kernel(
        &self,
        context: &Context,
        function: &Function,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: &Stream,
        params: LaunchParams<'_>,
    ) -> Status {
        if grid.volume() == 0 || block.volume() == 0 {
            error!("launch_kernel: empty geometry grid={} block={}", grid, block);
            return Err(DriverError::InvalidArgument(format!(
                "grid {grid} and block {block} must have non-zero dimensions"
            )));
        }
        let _guard = self.activate(context, "launch_kernel")?;
        self.owned(HandleKind::Function, function.raw.0, context)?;
        self.owned(HandleKind::Stream, stream.raw().0, context)?;

        let native = self.native();
        let res = match params {
            LaunchParams::Args(args) => {
                let mut pointers: Vec<*mut c_void> = args.iter().map(|a| a.ptr as *mut c_void).collect();
                // SAFETY: each pointer refers to a live Pod value; the caller vouches
                // that the list matches the kernel signature.
                unsafe {
                    native.launch_kernel(
                        function.raw,
                        grid,
                        block,
                        shared_mem_bytes,
                        stream.raw(),
                        pointers.as_mut_ptr(),
                        std::ptr::null_mut(),
                    )
                }
            }
            LaunchParams::Packed(bytes) => {
                let mut buffer = bytes.to_vec();
                let mut size = buffer.len();
                let mut extra = [
                    LAUNCH_PARAM_BUFFER_POINTER as *mut c_void,
                    buffer.as_mut_ptr().cast(),
                    LAUNCH_PARAM_BUFFER_SIZE as *mut c_void,
                    (&mut size as *mut usize).cast(),
                    LAUNCH_PARAM_END as *mut c_void,
                ];
                // SAFETY: `buffer` and `size` outlive the call; the caller vouches for
                // the buffer layout.
                unsafe {
                    native.launch_kernel(
                        function.raw,
                        grid,
                        block,
                        shared_mem_bytes,
                        stream.raw(),
                        std::ptr::null_mut(),
                        extra.as_mut_ptr(),
                    )
                }
            }
        };
        check("hipModuleLaunchKernel", res, || {
            format!(
                "context={} function=0x{:x} grid={} block={} shared_mem={} stream=0x{:x}",
                context.id(),
                function.raw.0,
                grid,
                block,
                shared_mem_bytes,
                stream.raw().0
            )
        })
    }

    /// Upper bound on resident blocks per multiprocessor for `function`.
    pub fn get_max_occupied_blocks_per_core(
        &self,
        context: &Context,
        function: &Function,
        threads_per_block: u32,
        dynamic_shared_memory_bytes: usize,
    ) -> StatusOr<u32> {
        let _guard = self.activate(context, "get_max_occupied_blocks_per_core")?;
        self.owned(HandleKind::Function, function.raw.0, context)?;
        let block_size = i32::try_from(threads_per_block)
            .map_err(|_| DriverError::InvalidArgument(format!("block size {threads_per_block} is too large")))?;
        let blocks = check(
            "hipModuleOccupancyMaxActiveBlocksPerMultiprocessor",
            self.native()
                .occupancy_max_active_blocks_per_multiprocessor(function.raw, block_size, dynamic_shared_memory_bytes),
            || {
                format!(
                    "context={} function=0x{:x} threads={} dynamic_smem={}",
                    context.id(),
                    function.raw.0,
                    threads_per_block,
                    dynamic_shared_memory_bytes
                )
            },
        )?;
        Ok(blocks.max(0) as u32)
    }

    pub fn func_get_attribute(&self, function: &Function, attribute: FunctionAttribute) -> StatusOr<i32> {
        let _guard = self.activate_id(function.context_id, "func_get_attribute")?;
        self.live_function(function)?;
        check("hipFuncGetAttribute", self.native().func_get_attribute(attribute, function.raw), || {
            format!("function=0x{:x} attribute={:?}", function.raw.0, attribute)
        })
    }

    pub fn func_set_cache_config(&self, function: &Function, config: CacheConfig) -> Status {
        let _guard = self.activate_id(function.context_id, "func_set_cache_config")?;
        self.live_function(function)?;
        check("hipFuncSetCacheConfig", self.native().func_set_cache_config(function.raw, config), || {
            format!("function=0x{:x} config={:?}", function.raw.0, config)
        })
    }

    fn live_function(&self, function: &Function) -> StatusOr<()> {
        match self.handles.get(HandleKind::Function, function.raw.0) {
            Some(record) if record.parent == Some(function.module.0) => Ok(()),
            _ => {
                error!("function 0x{:x} is no longer loaded", function.raw.0);
                Err(DriverError::InvalidHandle(format!(
                    "function 0x{:x} belongs to an unloaded module",
                    function.raw.0
                )))
            }
        }
    }
}
