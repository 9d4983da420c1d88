use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use rocdrv_core::config::{SimConfig, SimDeviceConfig};
use rocdrv_core::native::*;

use crate::code_object::{self, CodeObject, EntryInfo};
use crate::kernel::{self, KernelInvocation, KernelRegistry, DEFAULT_REGISTERS_PER_THREAD};
use crate::memory::{AddressSpace, RegionKind};
use crate::stream::{self, SimEvent, SimStream, Work};

const HOST_ALIGN: usize = 4096;
const MAX_BLOCK_DIM_Z: u32 = 1024;
const ELF_MAGIC: &[u8] = b"\x7fELF";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current context per simulator instance, mirroring the driver's per-thread slot.
    static CURRENT: RefCell<HashMap<u64, RawContext>> = RefCell::new(HashMap::new());
}

struct SimContext {
    device: i32,
    flags: u32,
    shared_mem_config: Mutex<SharedMemConfig>,
    /// Contexts this one may access.
    peers: Mutex<HashSet<u64>>,
}

struct SimModule {
    ctx: RawContext,
    code: CodeObject,
    globals: HashMap<String, (DevicePtr, usize)>,
    functions: Mutex<HashMap<String, RawFunction>>,
}

struct SimFunction {
    ctx: RawContext,
    module: RawModule,
    entry: EntryInfo,
    ptx_version: i32,
    cache_config: Mutex<CacheConfig>,
}

/// A CPU-backed implementation of the native driver.
///
/// Devices come from [`SimConfig`]; device memory is host memory behind fake
/// addresses; streams are worker threads; kernel bodies are closures registered
/// by entry name. Used for tests and as the fallback when no HIP runtime is
/// installed.
pub struct SimDriver {
    instance: u64,
    config: SimConfig,
    initialized: AtomicBool,
    next_handle: AtomicU64,
    contexts: DashMap<u64, Arc<SimContext>>,
    streams: DashMap<u64, Arc<SimStream>>,
    events: DashMap<u64, Arc<SimEvent>>,
    modules: DashMap<u64, Arc<SimModule>>,
    functions: DashMap<u64, Arc<SimFunction>>,
    memory: Arc<Mutex<AddressSpace>>,
    kernels: KernelRegistry,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let budgets = config.devices.iter().map(|d| d.memory_bytes).collect();
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        info!(
            "simulated driver #{} created with {} device(s)",
            instance,
            config.devices.len()
        );
        Self {
            instance,
            config,
            initialized: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            contexts: DashMap::new(),
            streams: DashMap::new(),
            events: DashMap::new(),
            modules: DashMap::new(),
            functions: DashMap::new(),
            memory: Arc::new(Mutex::new(AddressSpace::new(budgets))),
            kernels: KernelRegistry::with_builtins(),
        }
    }

    /// Registers (or replaces) the host body executed for kernels named `name`.
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut KernelInvocation<'_>) -> HipResult<()> + Send + Sync + 'static,
    {
        self.kernels.register(name, body);
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_init(&self) -> HipResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HipStatus::ERROR_NOT_INITIALIZED)
        }
    }

    fn tls_current(&self) -> RawContext {
        CURRENT.with(|c| c.borrow().get(&self.instance).copied().unwrap_or_default())
    }

    fn tls_set_current(&self, ctx: RawContext) {
        CURRENT.with(|c| {
            c.borrow_mut().insert(self.instance, ctx);
        });
    }

    /// The calling thread's current context, which must be live.
    fn current(&self) -> HipResult<(RawContext, Arc<SimContext>)> {
        self.ensure_init()?;
        let raw = self.tls_current();
        if raw.is_null() {
            return Err(HipStatus::ERROR_INVALID_CONTEXT);
        }
        let ctx = self
            .contexts
            .get(&raw.0)
            .map(|c| Arc::clone(c.value()))
            .ok_or(HipStatus::ERROR_INVALID_CONTEXT)?;
        Ok((raw, ctx))
    }

    fn device_config(&self, device: RawDevice) -> HipResult<&SimDeviceConfig> {
        self.ensure_init()?;
        usize::try_from(device)
            .ok()
            .and_then(|ordinal| self.config.devices.get(ordinal))
            .ok_or(HipStatus::ERROR_INVALID_DEVICE)
    }

    /// Resolve a stream handle for `ctx`; `None` is the null stream.
    fn stream_for(&self, stream: RawStream, ctx: RawContext) -> HipResult<Option<Arc<SimStream>>> {
        if stream.is_null() {
            return Ok(None);
        }
        let s = self
            .streams
            .get(&stream.0)
            .map(|s| Arc::clone(s.value()))
            .ok_or(HipStatus::ERROR_INVALID_HANDLE)?;
        if s.ctx != ctx {
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        }
        Ok(Some(s))
    }

    fn event(&self, event: RawEvent) -> HipResult<Arc<SimEvent>> {
        self.events
            .get(&event.0)
            .map(|e| Arc::clone(e.value()))
            .ok_or(HipStatus::ERROR_INVALID_HANDLE)
    }

    fn function(&self, function: RawFunction) -> HipResult<Arc<SimFunction>> {
        self.ensure_init()?;
        self.functions
            .get(&function.0)
            .map(|f| Arc::clone(f.value()))
            .ok_or(HipStatus::ERROR_INVALID_HANDLE)
    }

    /// Execute `work` on `stream` of the current context, or inline for the null stream.
    fn submit(&self, stream: RawStream, work: Work) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        match self.stream_for(stream, ctx)? {
            Some(s) => s.enqueue(work),
            None => work(),
        }
    }

    fn context_streams(&self, ctx: RawContext) -> Vec<Arc<SimStream>> {
        self.streams
            .iter()
            .filter(|s| s.ctx == ctx)
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    fn synchronize_context(&self, ctx: RawContext) -> HipResult<()> {
        let mut first_error = None;
        for s in self.context_streams(ctx) {
            if let Err(status) = s.synchronize() {
                first_error.get_or_insert(status);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn pci_bus_id(&self, device: RawDevice) -> HipResult<String> {
        let cfg = self.device_config(device)?;
        Ok(cfg
            .pci_bus_id
            .clone()
            .unwrap_or_else(|| format!("0000:{:02x}:00.0", device + 3)))
    }

    /// (domain, bus, device) parsed from `dddd:bb:dd.f`.
    fn pci_location(&self, device: RawDevice) -> HipResult<(i32, i32, i32)> {
        let id = self.pci_bus_id(device)?;
        let mut parts = id.split(':');
        let domain = parts.next().and_then(|p| i32::from_str_radix(p, 16).ok()).unwrap_or(0);
        let bus = parts.next().and_then(|p| i32::from_str_radix(p, 16).ok()).unwrap_or(0);
        let dev = parts
            .next()
            .and_then(|p| p.split('.').next())
            .and_then(|p| i32::from_str_radix(p, 16).ok())
            .unwrap_or(0);
        Ok((domain, bus, dev))
    }

    fn load_module(&self, image: &[u8], error_log: Option<&mut String>) -> HipResult<RawModule> {
        let (ctx, sim_ctx) = self.current()?;
        if image.starts_with(ELF_MAGIC) {
            if let Some(log) = error_log {
                *log = "native ISA code objects cannot run on the simulated device".to_string();
            }
            return Err(HipStatus::ERROR_NO_BINARY_FOR_GPU);
        }
        let code = match code_object::parse(image) {
            Ok(code) => code,
            Err(e) => {
                debug!("sim: rejecting code object: {}", e);
                if let Some(log) = error_log {
                    *log = e.to_string();
                }
                return Err(HipStatus::ERROR_INVALID_IMAGE);
            }
        };

        let mut globals = HashMap::new();
        {
            let mut memory = self.memory.lock();
            for global in &code.globals {
                match memory.alloc_device(sim_ctx.device, ctx, global.size, RegionKind::ModuleGlobal) {
                    Ok(ptr) => {
                        globals.insert(global.name.clone(), (ptr, global.size));
                    }
                    Err(status) => {
                        for (ptr, _) in globals.values() {
                            memory.remove(ptr.0, RegionKind::ModuleGlobal);
                        }
                        return Err(status);
                    }
                }
            }
        }

        let raw = self.next_handle();
        debug!(
            "sim: loaded module 0x{:x} ({} entries, {} globals)",
            raw,
            code.entries.len(),
            code.globals.len()
        );
        self.modules.insert(
            raw,
            Arc::new(SimModule {
                ctx,
                code,
                globals,
                functions: Mutex::new(HashMap::new()),
            }),
        );
        Ok(RawModule(raw))
    }

    fn release_module(&self, module: &SimModule) {
        let mut memory = self.memory.lock();
        for (ptr, _) in module.globals.values() {
            memory.remove(ptr.0, RegionKind::ModuleGlobal);
        }
        for function in module.functions.lock().values() {
            self.functions.remove(&function.0);
        }
    }

    /// Copy the launch arguments out of caller memory.
    ///
    /// # Safety
    /// See [`NativeDriver::launch_kernel`].
    unsafe fn decode_args(
        entry: &EntryInfo,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> HipResult<Vec<Vec<u8>>> {
        match (kernel_params.is_null(), extra.is_null()) {
            (false, false) => Err(HipStatus::ERROR_INVALID_VALUE),
            (true, true) if entry.params.is_empty() => Ok(Vec::new()),
            (true, true) => Err(HipStatus::ERROR_INVALID_VALUE),
            (false, true) => {
                let mut args = Vec::with_capacity(entry.params.len());
                for (i, param) in entry.params.iter().enumerate() {
                    // SAFETY: the caller provides one pointer per declared parameter.
                    let slot = unsafe { *kernel_params.add(i) };
                    if slot.is_null() {
                        return Err(HipStatus::ERROR_INVALID_VALUE);
                    }
                    // SAFETY: each slot points at a value of the declared size.
                    let bytes = unsafe { std::slice::from_raw_parts(slot as *const u8, param.size) };
                    args.push(bytes.to_vec());
                }
                Ok(args)
            }
            (true, false) => {
                let mut buffer: *const u8 = std::ptr::null();
                let mut size = None;
                let mut i = 0;
                loop {
                    // SAFETY: `extra` is a key/value list terminated by LAUNCH_PARAM_END.
                    let key = unsafe { *extra.add(i) } as usize;
                    match key {
                        LAUNCH_PARAM_END => break,
                        LAUNCH_PARAM_BUFFER_POINTER => {
                            buffer = unsafe { *extra.add(i + 1) } as *const u8;
                        }
                        LAUNCH_PARAM_BUFFER_SIZE => {
                            let size_ptr = unsafe { *extra.add(i + 1) } as *const usize;
                            if size_ptr.is_null() {
                                return Err(HipStatus::ERROR_INVALID_VALUE);
                            }
                            // SAFETY: BUFFER_SIZE's value points at a usize.
                            size = Some(unsafe { *size_ptr });
                        }
                        _ => return Err(HipStatus::ERROR_INVALID_VALUE),
                    }
                    i += 2;
                }

                let (offsets, total) = entry.packed_layout();
                let Some(size) = size else {
                    return Err(HipStatus::ERROR_INVALID_VALUE);
                };
                if (buffer.is_null() && total > 0) || size < total {
                    return Err(HipStatus::ERROR_INVALID_VALUE);
                }
                if total == 0 {
                    return Ok(Vec::new());
                }
                // SAFETY: BUFFER_POINTER references `size` readable bytes.
                let packed = unsafe { std::slice::from_raw_parts(buffer, size) };
                Ok(offsets
                    .iter()
                    .zip(&entry.params)
                    .map(|(&offset, param)| packed[offset..offset + param.size].to_vec())
                    .collect())
            }
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl NativeDriver for SimDriver {
    fn backend_name(&self) -> &'static str {
        "sim"
    }

    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> HipResult<()> {
        if flags != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        if self.config.devices.is_empty() {
            return Err(HipStatus::ERROR_NO_DEVICE);
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn driver_get_version(&self) -> HipResult<i32> {
        Ok(self.config.driver_version)
    }

    // ── Devices ───────────────────────────────────────────────────

    fn device_get_count(&self) -> HipResult<i32> {
        self.ensure_init()?;
        Ok(self.config.devices.len() as i32)
    }

    fn device_get(&self, ordinal: i32) -> HipResult<RawDevice> {
        self.device_config(ordinal).map(|_| ordinal)
    }

    fn device_get_name(&self, device: RawDevice) -> HipResult<String> {
        self.device_config(device).map(|d| d.name.clone())
    }

    fn device_get_attribute(&self, attribute: DeviceAttribute, device: RawDevice) -> HipResult<i32> {
        let d = self.device_config(device)?;
        let value = match attribute {
            DeviceAttribute::EccEnabled => d.ecc_enabled as i32,
            DeviceAttribute::ClockRate => 1_700_000,
            DeviceAttribute::ConcurrentKernels => 1,
            DeviceAttribute::Integrated => 0,
            DeviceAttribute::L2CacheSize => 8 << 20,
            DeviceAttribute::ComputeCapabilityMajor => d.compute_capability[0],
            DeviceAttribute::ComputeCapabilityMinor => d.compute_capability[1],
            DeviceAttribute::MaxBlocksPerMultiprocessor => d.max_blocks_per_multiprocessor,
            DeviceAttribute::MaxBlockDimX | DeviceAttribute::MaxBlockDimY => d.max_threads_per_block,
            DeviceAttribute::MaxBlockDimZ => MAX_BLOCK_DIM_Z as i32,
            DeviceAttribute::MaxGridDimX => d.max_grid_dims[0],
            DeviceAttribute::MaxGridDimY => d.max_grid_dims[1],
            DeviceAttribute::MaxGridDimZ => d.max_grid_dims[2],
            DeviceAttribute::MaxThreadsPerBlock => d.max_threads_per_block,
            DeviceAttribute::MaxThreadsPerMultiprocessor => d.max_threads_per_multiprocessor,
            DeviceAttribute::MultiprocessorCount => d.multiprocessors,
            DeviceAttribute::PciDomainId => self.pci_location(device)?.0,
            DeviceAttribute::PciBusId => self.pci_location(device)?.1,
            DeviceAttribute::PciDeviceId => self.pci_location(device)?.2,
            DeviceAttribute::MaxRegistersPerBlock | DeviceAttribute::MaxRegistersPerMultiprocessor => {
                d.max_registers_per_block
            }
            DeviceAttribute::MaxSharedMemoryPerBlock => d.max_shared_memory_per_block,
            DeviceAttribute::MaxSharedMemoryPerMultiprocessor => d.max_shared_memory_per_multiprocessor,
            DeviceAttribute::UnifiedAddressing => 1,
            DeviceAttribute::WarpSize => d.warp_size,
        };
        Ok(value)
    }

    fn device_total_mem(&self, device: RawDevice) -> HipResult<usize> {
        self.device_config(device).map(|d| d.memory_bytes as usize)
    }

    fn device_compute_capability(&self, device: RawDevice) -> HipResult<(i32, i32)> {
        self.device_config(device)
            .map(|d| (d.compute_capability[0], d.compute_capability[1]))
    }

    fn device_get_pci_bus_id(&self, device: RawDevice) -> HipResult<String> {
        self.pci_bus_id(device)
    }

    fn device_can_access_peer(&self, device: RawDevice, peer: RawDevice) -> HipResult<bool> {
        let a = self.device_config(device)?;
        let b = self.device_config(peer)?;
        Ok(device != peer && a.peer_group.is_some() && a.peer_group == b.peer_group)
    }

    // ── Contexts ──────────────────────────────────────────────────

    fn ctx_create(&self, flags: u32, device: RawDevice) -> HipResult<RawContext> {
        self.device_config(device)?;
        let valid = ContextFlags::from_bits(flags).is_some_and(|f| f.is_valid());
        if !valid {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let raw = RawContext(self.next_handle());
        self.contexts.insert(
            raw.0,
            Arc::new(SimContext {
                device,
                flags,
                shared_mem_config: Mutex::new(SharedMemConfig::default()),
                peers: Mutex::new(HashSet::new()),
            }),
        );
        self.tls_set_current(raw);
        debug!("sim: created context 0x{:x} on device {} (flags=0x{:x})", raw.0, device, flags);
        Ok(raw)
    }

    fn ctx_destroy(&self, ctx: RawContext) -> HipResult<()> {
        self.ensure_init()?;
        let (_, sim_ctx) = self.contexts.remove(&ctx.0).ok_or(HipStatus::ERROR_INVALID_CONTEXT)?;

        let streams: Vec<u64> = self.streams.iter().filter(|s| s.ctx == ctx).map(|s| *s.key()).collect();
        for raw in streams {
            if let Some((_, s)) = self.streams.remove(&raw) {
                s.shutdown();
            }
        }
        self.events.retain(|_, e| e.ctx != ctx);
        let modules: Vec<u64> = self.modules.iter().filter(|m| m.ctx == ctx).map(|m| *m.key()).collect();
        for raw in modules {
            if let Some((_, m)) = self.modules.remove(&raw) {
                self.release_module(&m);
            }
        }
        let pinned = self.memory.lock().remove_context(ctx);
        for (addr, size) in pinned {
            if let Ok(layout) = Layout::from_size_align(size.max(1), HOST_ALIGN) {
                // SAFETY: pinned ranges were allocated with this layout in mem_alloc_host.
                unsafe { alloc::dealloc(addr as usize as *mut u8, layout) };
            }
        }
        for other in self.contexts.iter() {
            other.peers.lock().remove(&ctx.0);
        }

        if self.tls_current() == ctx {
            self.tls_set_current(RawContext::NULL);
        }
        debug!(
            "sim: destroyed context 0x{:x} (device {}, flags=0x{:x})",
            ctx.0, sim_ctx.device, sim_ctx.flags
        );
        Ok(())
    }

    fn ctx_set_current(&self, ctx: RawContext) -> HipResult<()> {
        self.ensure_init()?;
        if !ctx.is_null() && !self.contexts.contains_key(&ctx.0) {
            return Err(HipStatus::ERROR_INVALID_CONTEXT);
        }
        self.tls_set_current(ctx);
        Ok(())
    }

    fn ctx_get_current(&self) -> HipResult<RawContext> {
        self.ensure_init()?;
        Ok(self.tls_current())
    }

    fn ctx_get_device(&self) -> HipResult<RawDevice> {
        self.current().map(|(_, c)| c.device)
    }

    fn ctx_synchronize(&self) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        self.synchronize_context(ctx)
    }

    fn ctx_get_shared_mem_config(&self) -> HipResult<SharedMemConfig> {
        self.current().map(|(_, c)| *c.shared_mem_config.lock())
    }

    fn ctx_set_shared_mem_config(&self, config: SharedMemConfig) -> HipResult<()> {
        let (_, c) = self.current()?;
        *c.shared_mem_config.lock() = config;
        Ok(())
    }

    fn ctx_enable_peer_access(&self, peer: RawContext, flags: u32) -> HipResult<()> {
        let (ctx, sim_ctx) = self.current()?;
        if flags != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let peer_ctx = self
            .contexts
            .get(&peer.0)
            .map(|c| Arc::clone(c.value()))
            .ok_or(HipStatus::ERROR_INVALID_CONTEXT)?;
        if peer == ctx {
            return Err(HipStatus::ERROR_INVALID_DEVICE);
        }
        if !self.device_can_access_peer(sim_ctx.device, peer_ctx.device)? {
            return Err(HipStatus::ERROR_PEER_ACCESS_UNSUPPORTED);
        }
        if !sim_ctx.peers.lock().insert(peer.0) {
            return Err(HipStatus::ERROR_PEER_ACCESS_ALREADY_ENABLED);
        }
        Ok(())
    }

    // ── Streams ───────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> HipResult<RawStream> {
        let (ctx, _) = self.current()?;
        if flags & !STREAM_NON_BLOCKING != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let raw = self.next_handle();
        let s = SimStream::spawn(raw, ctx, flags)?;
        self.streams.insert(raw, Arc::new(s));
        Ok(RawStream(raw))
    }

    fn stream_destroy(&self, stream: RawStream) -> HipResult<()> {
        self.ensure_init()?;
        let (_, s) = self.streams.remove(&stream.0).ok_or(HipStatus::ERROR_INVALID_HANDLE)?;
        s.shutdown();
        Ok(())
    }

    fn stream_query(&self, stream: RawStream) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        match self.stream_for(stream, ctx)? {
            Some(s) => s.query(),
            None => Ok(()),
        }
    }

    fn stream_synchronize(&self, stream: RawStream) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        match self.stream_for(stream, ctx)? {
            Some(s) => s.synchronize(),
            None => self.synchronize_context(ctx),
        }
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent, flags: u32) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        if flags != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let ev = self.event(event)?;
        match self.stream_for(stream, ctx)? {
            Some(s) => s.wait_event(&ev),
            None => {
                stream::wait_inline(&ev);
                Ok(())
            }
        }
    }

    fn stream_add_callback(&self, stream: RawStream, callback: NativeCallback) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        match self.stream_for(stream, ctx)? {
            Some(s) => s.add_callback(callback),
            None => {
                callback(HipStatus::SUCCESS);
                Ok(())
            }
        }
    }

    // ── Events ────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> HipResult<RawEvent> {
        let (ctx, _) = self.current()?;
        if flags & !(EVENT_BLOCKING_SYNC | EVENT_DISABLE_TIMING) != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let raw = self.next_handle();
        self.events.insert(raw, Arc::new(SimEvent::new(ctx, flags)));
        Ok(RawEvent(raw))
    }

    fn event_destroy(&self, event: RawEvent) -> HipResult<()> {
        self.ensure_init()?;
        self.events
            .remove(&event.0)
            .map(|_| ())
            .ok_or(HipStatus::ERROR_INVALID_HANDLE)
    }

    fn event_record(&self, event: RawEvent, stream: RawStream) -> HipResult<()> {
        let (ctx, _) = self.current()?;
        let ev = self.event(event)?;
        if ev.ctx != ctx {
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        }
        match self.stream_for(stream, ctx)? {
            Some(s) => s.record(&ev),
            None => {
                stream::record_inline(&ev);
                Ok(())
            }
        }
    }

    fn event_query(&self, event: RawEvent) -> HipResult<()> {
        self.ensure_init()?;
        if self.event(event)?.is_complete() {
            Ok(())
        } else {
            Err(HipStatus::ERROR_NOT_READY)
        }
    }

    fn event_synchronize(&self, event: RawEvent) -> HipResult<()> {
        self.ensure_init()?;
        self.event(event)?.synchronize();
        Ok(())
    }

    fn event_elapsed_time(&self, start: RawEvent, stop: RawEvent) -> HipResult<f32> {
        self.ensure_init()?;
        let start = self.event(start)?;
        let stop = self.event(stop)?;
        if !start.timing_enabled() || !stop.timing_enabled() {
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        }
        if !start.was_recorded() || !stop.was_recorded() {
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        }
        let (Some(t0), Some(t1)) = (start.timestamp(), stop.timestamp()) else {
            return Err(HipStatus::ERROR_NOT_READY);
        };
        let ms = match t1.checked_duration_since(t0) {
            Some(d) => d.as_secs_f32() * 1000.0,
            None => -(t0.duration_since(t1).as_secs_f32() * 1000.0),
        };
        Ok(ms)
    }

    // ── Memory ────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: usize) -> HipResult<DevicePtr> {
        let (ctx, sim_ctx) = self.current()?;
        self.memory
            .lock()
            .alloc_device(sim_ctx.device, ctx, bytes, RegionKind::Device)
    }

    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()> {
        self.ensure_init()?;
        if ptr.is_null() {
            return Ok(());
        }
        self.memory
            .lock()
            .remove(ptr.0, RegionKind::Device)
            .map(|_| ())
            .ok_or(HipStatus::ERROR_INVALID_VALUE)
    }

    fn mem_alloc_host(&self, bytes: usize, flags: u32) -> HipResult<*mut c_void> {
        let (ctx, sim_ctx) = self.current()?;
        if flags & !HOST_MALLOC_PORTABLE != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let layout = Layout::from_size_align(bytes.max(1), HOST_ALIGN).map_err(|_| HipStatus::ERROR_INVALID_VALUE)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HipStatus::ERROR_OUT_OF_MEMORY);
        }
        if let Err(status) = self
            .memory
            .lock()
            .insert_host(ptr as usize as u64, bytes, ctx, sim_ctx.device, RegionKind::HostPinned)
        {
            // SAFETY: allocated just above with the same layout.
            unsafe { alloc::dealloc(ptr, layout) };
            return Err(status);
        }
        Ok(ptr.cast())
    }

    fn mem_free_host(&self, ptr: *mut c_void) -> HipResult<()> {
        self.ensure_init()?;
        if ptr.is_null() {
            return Ok(());
        }
        let region = self
            .memory
            .lock()
            .remove(ptr as usize as u64, RegionKind::HostPinned)
            .ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        let layout =
            Layout::from_size_align(region.size.max(1), HOST_ALIGN).map_err(|_| HipStatus::ERROR_INVALID_VALUE)?;
        // SAFETY: the region was produced by mem_alloc_host with this layout.
        unsafe { alloc::dealloc(ptr.cast(), layout) };
        Ok(())
    }

    fn mem_host_register(&self, ptr: *mut c_void, bytes: usize, flags: u32) -> HipResult<()> {
        let (ctx, sim_ctx) = self.current()?;
        if ptr.is_null() || bytes == 0 || flags & !HOST_REGISTER_PORTABLE != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        self.memory
            .lock()
            .insert_host(ptr as usize as u64, bytes, ctx, sim_ctx.device, RegionKind::HostRegistered)
    }

    fn mem_host_unregister(&self, ptr: *mut c_void) -> HipResult<()> {
        self.ensure_init()?;
        self.memory
            .lock()
            .remove(ptr as usize as u64, RegionKind::HostRegistered)
            .map(|_| ())
            .ok_or(HipStatus::ERROR_HOST_MEMORY_NOT_REGISTERED)
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: *const c_void, bytes: usize) -> HipResult<()> {
        self.current()?;
        if bytes == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees `src` is readable for `bytes`.
        let host = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };
        self.memory.lock().write(dst, host)
    }

    unsafe fn memcpy_dtoh(&self, dst: *mut c_void, src: DevicePtr, bytes: usize) -> HipResult<()> {
        self.current()?;
        if bytes == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees `dst` is writable for `bytes`.
        let host = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, bytes) };
        self.memory.lock().read(src, host)
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> HipResult<()> {
        self.current()?;
        if bytes == 0 {
            return Ok(());
        }
        self.memory.lock().copy(dst, src, bytes)
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const c_void,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()> {
        if bytes == 0 {
            return self.current().map(|_| ());
        }
        self.memory.lock().check_device_range(dst, bytes)?;
        let memory = Arc::clone(&self.memory);
        let src = src as usize;
        self.submit(
            stream,
            Box::new(move || {
                // SAFETY: the caller keeps `src` alive until the stream reaches this copy.
                let host = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };
                memory.lock().write(dst, host)
            }),
        )
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: DevicePtr,
        bytes: usize,
        stream: RawStream,
    ) -> HipResult<()> {
        if bytes == 0 {
            return self.current().map(|_| ());
        }
        self.memory.lock().check_device_range(src, bytes)?;
        let memory = Arc::clone(&self.memory);
        let dst = dst as usize;
        self.submit(
            stream,
            Box::new(move || {
                // SAFETY: the caller keeps `dst` alive until the stream reaches this copy.
                let host = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, bytes) };
                memory.lock().read(src, host)
            }),
        )
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, stream: RawStream) -> HipResult<()> {
        if bytes == 0 {
            return self.current().map(|_| ());
        }
        {
            let memory = self.memory.lock();
            memory.check_device_range(src, bytes)?;
            memory.check_device_range(dst, bytes)?;
        }
        let memory = Arc::clone(&self.memory);
        self.submit(stream, Box::new(move || memory.lock().copy(dst, src, bytes)))
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: usize) -> HipResult<()> {
        self.current()?;
        self.memory.lock().fill(dst, &[value], count)
    }

    fn memset_d32(&self, dst: DevicePtr, value: u32, count: usize) -> HipResult<()> {
        self.current()?;
        if dst.0 % 4 != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        self.memory.lock().fill(dst, &value.to_ne_bytes(), count)
    }

    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: usize, stream: RawStream) -> HipResult<()> {
        self.memory.lock().check_device_range(dst, count)?;
        let memory = Arc::clone(&self.memory);
        self.submit(stream, Box::new(move || memory.lock().fill(dst, &[value], count)))
    }

    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: usize, stream: RawStream) -> HipResult<()> {
        if dst.0 % 4 != 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        self.memory.lock().check_device_range(dst, count * 4)?;
        let memory = Arc::clone(&self.memory);
        self.submit(
            stream,
            Box::new(move || memory.lock().fill(dst, &value.to_ne_bytes(), count)),
        )
    }

    fn mem_get_info(&self) -> HipResult<(usize, usize)> {
        let (_, c) = self.current()?;
        self.memory.lock().info(c.device)
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> HipResult<(DevicePtr, usize)> {
        self.ensure_init()?;
        self.memory
            .lock()
            .find(ptr.0)
            .map(|(base, region)| (DevicePtr(base), region.size))
            .ok_or(HipStatus::ERROR_NOT_FOUND)
    }

    fn pointer_get_info(&self, ptr: DevicePtr) -> HipResult<PointerInfo> {
        self.ensure_init()?;
        let memory = self.memory.lock();
        let (_, region) = memory.find(ptr.0).ok_or(HipStatus::ERROR_INVALID_VALUE)?;
        let memory_type = if region.kind.is_device() {
            NativeMemoryType::Device
        } else {
            NativeMemoryType::Host
        };
        Ok(PointerInfo {
            context: region.ctx,
            memory_type,
            device_ordinal: region.device,
        })
    }

    // ── Modules & execution ───────────────────────────────────────

    fn module_load_data(&self, image: &[u8]) -> HipResult<RawModule> {
        self.load_module(image, None)
    }

    fn module_load_data_ex(&self, image: &[u8], error_log: &mut String) -> HipResult<RawModule> {
        self.load_module(image, Some(error_log))
    }

    fn module_unload(&self, module: RawModule) -> HipResult<()> {
        self.ensure_init()?;
        let (_, m) = self.modules.remove(&module.0).ok_or(HipStatus::ERROR_INVALID_HANDLE)?;
        self.release_module(&m);
        Ok(())
    }

    fn module_get_function(&self, module: RawModule, name: &str) -> HipResult<RawFunction> {
        self.ensure_init()?;
        let m = self
            .modules
            .get(&module.0)
            .map(|m| Arc::clone(m.value()))
            .ok_or(HipStatus::ERROR_INVALID_HANDLE)?;
        let entry = m.code.entry(name).ok_or(HipStatus::ERROR_NOT_FOUND)?;

        let mut functions = m.functions.lock();
        if let Some(existing) = functions.get(name) {
            return Ok(*existing);
        }
        let raw = RawFunction(self.next_handle());
        self.functions.insert(
            raw.0,
            Arc::new(SimFunction {
                ctx: m.ctx,
                module,
                entry: entry.clone(),
                ptx_version: m.code.version,
                cache_config: Mutex::new(CacheConfig::default()),
            }),
        );
        functions.insert(name.to_string(), raw);
        Ok(raw)
    }

    fn module_get_global(&self, module: RawModule, name: &str) -> HipResult<(DevicePtr, usize)> {
        self.ensure_init()?;
        let m = self.modules.get(&module.0).ok_or(HipStatus::ERROR_INVALID_HANDLE)?;
        m.globals.get(name).copied().ok_or(HipStatus::ERROR_NOT_FOUND)
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
        let (ctx, sim_ctx) = self.current()?;
        let f = self.function(function)?;
        if f.ctx != ctx {
            return Err(HipStatus::ERROR_INVALID_CONTEXT);
        }
        let target = self.stream_for(stream, ctx)?;
        let dev = self.device_config(sim_ctx.device)?;

        if grid.volume() == 0 || block.volume() == 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let max_block = dev.max_threads_per_block as u32;
        if block.x > max_block || block.y > max_block || block.z > MAX_BLOCK_DIM_Z || block.volume() > max_block as u64 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let max_grid = dev.max_grid_dims;
        if grid.x > max_grid[0] as u32 || grid.y > max_grid[1] as u32 || grid.z > max_grid[2] as u32 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        if f.entry.static_shared_bytes + shared_mem_bytes as usize > dev.max_shared_memory_per_block as usize {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        if f.entry.max_threads.is_some_and(|t| block.volume() > t as u64) {
            return Err(HipStatus::ERROR_LAUNCH_OUT_OF_RESOURCES);
        }
        let regs = f.entry.max_registers.unwrap_or(DEFAULT_REGISTERS_PER_THREAD) as u64;
        if regs * block.volume() > dev.max_registers_per_block as u64 {
            return Err(HipStatus::ERROR_LAUNCH_OUT_OF_RESOURCES);
        }

        // SAFETY: forwarded from the caller's contract.
        let args = unsafe { Self::decode_args(&f.entry, kernel_params, extra)? };
        let body = self
            .kernels
            .get(&f.entry.name)
            .ok_or(HipStatus::ERROR_INVALID_DEVICE_FUNCTION)?;

        let memory = Arc::clone(&self.memory);
        let name = f.entry.name.clone();
        let work: Work = Box::new(move || {
            let mut invocation = KernelInvocation {
                grid,
                block,
                shared_mem_bytes,
                args: &args,
                memory: &*memory,
            };
            body(&mut invocation).inspect_err(|status| {
                debug!("sim: kernel '{}' failed: {}", name, status);
            })
        });
        match target {
            Some(s) => s.enqueue(work),
            None => work(),
        }
    }

    fn func_get_attribute(&self, attribute: FunctionAttribute, function: RawFunction) -> HipResult<i32> {
        let f = self.function(function)?;
        let device = self
            .contexts
            .get(&f.ctx.0)
            .map(|c| c.device)
            .ok_or(HipStatus::ERROR_CONTEXT_IS_DESTROYED)?;
        let dev = self.device_config(device)?;
        let value = match attribute {
            FunctionAttribute::MaxThreadsPerBlock => f
                .entry
                .max_threads
                .map_or(dev.max_threads_per_block, |t| (t as i32).min(dev.max_threads_per_block)),
            FunctionAttribute::SharedSizeBytes => f.entry.static_shared_bytes as i32,
            FunctionAttribute::ConstSizeBytes | FunctionAttribute::LocalSizeBytes => 0,
            FunctionAttribute::NumRegs => f.entry.max_registers.unwrap_or(DEFAULT_REGISTERS_PER_THREAD) as i32,
            FunctionAttribute::PtxVersion => f.ptx_version,
            FunctionAttribute::BinaryVersion => dev.compute_capability[0] * 10 + dev.compute_capability[1],
            FunctionAttribute::CacheModeCa => 0,
            FunctionAttribute::MaxDynamicSharedSizeBytes => {
                dev.max_shared_memory_per_block - f.entry.static_shared_bytes as i32
            }
            FunctionAttribute::PreferredSharedMemoryCarveout => match *f.cache_config.lock() {
                CacheConfig::PreferShared => 100,
                CacheConfig::PreferL1 => 0,
                CacheConfig::PreferEqual => 50,
                CacheConfig::PreferNone => -1,
            },
        };
        Ok(value)
    }

    fn func_set_cache_config(&self, function: RawFunction, config: CacheConfig) -> HipResult<()> {
        let f = self.function(function)?;
        *f.cache_config.lock() = config;
        debug!("sim: function 0x{:x} of module 0x{:x} cache config {:?}", function.0, f.module.0, config);
        Ok(())
    }

    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        function: RawFunction,
        block_size: i32,
        dynamic_smem_bytes: usize,
    ) -> HipResult<i32> {
        let f = self.function(function)?;
        if block_size <= 0 {
            return Err(HipStatus::ERROR_INVALID_VALUE);
        }
        let device = self
            .contexts
            .get(&f.ctx.0)
            .map(|c| c.device)
            .ok_or(HipStatus::ERROR_CONTEXT_IS_DESTROYED)?;
        let dev = self.device_config(device)?;
        Ok(kernel::max_active_blocks(dev, &f.entry, block_size, dynamic_smem_bytes))
    }
}
