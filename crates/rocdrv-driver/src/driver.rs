use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{error, info, warn};

use rocdrv_core::config::BackendKind;
use rocdrv_core::handle_map::{HandleKind, HandleRecord, HandleRegistry};
use rocdrv_core::native::RawContext;
use rocdrv_core::{DriverConfig, DriverError, HipResult, NativeDriver, Status, StatusOr};
use rocdrv_sim::SimDriver;

use crate::activation::ScopedActivateContext;
use crate::callback::{self, CallbackDispatcher};
use crate::context::{Context, Device};
use crate::hip_driver::HipDriver;

/// Forces the next first-time [`Driver::init`] in this process to fail.
static INJECT_INIT_ERROR: AtomicBool = AtomicBool::new(false);

/// Context ids are process-wide and never reused.
static NEXT_CONTEXT_ID: AtomicI64 = AtomicI64::new(1);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Makes driver initialization fail for drivers that have not initialized yet.
/// Intended for tests of the failure path.
pub fn set_inject_init_error(inject: bool) {
    INJECT_INIT_ERROR.store(inject, Ordering::SeqCst);
}

pub(crate) fn next_context_id() -> i64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Converts a native result, logging failures with the operation and its arguments.
pub(crate) fn check<T>(operation: &'static str, res: HipResult<T>, detail: impl FnOnce() -> String) -> StatusOr<T> {
    res.map_err(|status| {
        let detail = detail();
        error!("{} failed: {} ({})", operation, status, detail);
        DriverError::from_native(operation, status, detail)
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextEntry {
    pub raw: RawContext,
    pub device: Device,
}

/// Entry point of the layer.
///
/// A `Driver` is `Send + Sync`; contexts, streams and other handles it hands
/// out are plain values that must be passed back to the driver that created them.
pub struct Driver {
    native: Arc<dyn NativeDriver>,
    config: DriverConfig,
    instance: u64,
    init: OnceLock<Status>,
    pub(crate) handles: HandleRegistry,
    pub(crate) contexts: DashMap<i64, ContextEntry>,
    pub(crate) callbacks: CallbackDispatcher,
}

impl Driver {
    /// Builds a driver for the backend selected in `config`. `auto` prefers the
    /// HIP runtime and falls back to the simulated device when it cannot be loaded.
    pub fn new(config: DriverConfig) -> StatusOr<Self> {
        let library_path = config.driver.library_path.as_deref();
        let native: Arc<dyn NativeDriver> = match config.driver.backend {
            BackendKind::Sim => Arc::new(SimDriver::new(config.sim.clone())),
            BackendKind::Hip => HipDriver::load(library_path).map_err(|e| {
                error!("HIP backend requested but unavailable: {}", e);
                DriverError::InitFailed(e)
            })?,
            BackendKind::Auto => match HipDriver::load(library_path) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!("HIP runtime unavailable ({}), using the simulated device", e);
                    Arc::new(SimDriver::new(config.sim.clone()))
                }
            },
        };
        Ok(Self::from_native(native, config))
    }

    /// Wraps an already constructed backend.
    pub fn from_native(native: Arc<dyn NativeDriver>, config: DriverConfig) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        info!("driver #{} using the {} backend", instance, native.backend_name());
        Self {
            native,
            config,
            instance,
            init: OnceLock::new(),
            handles: HandleRegistry::new(),
            contexts: DashMap::new(),
            callbacks: CallbackDispatcher::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.native.backend_name()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Initializes the native driver once. Later calls return the cached outcome,
    /// including a cached failure.
    pub fn init(&self) -> Status {
        self.init
            .get_or_init(|| {
                if INJECT_INIT_ERROR.load(Ordering::SeqCst) {
                    error!("driver initialization failed: injected failure");
                    return Err(DriverError::InitFailed("injected initialization failure".into()));
                }
                let flags = self.config.driver.init_flags;
                match self.native.init(flags) {
                    Ok(()) => {
                        info!("{} driver initialized (flags=0x{:x})", self.native.backend_name(), flags);
                        Ok(())
                    }
                    Err(status) => {
                        error!("hipInit(0x{:x}) failed: {}", flags, status);
                        Err(DriverError::InitFailed(format!("hipInit(0x{flags:x}): {status}")))
                    }
                }
            })
            .clone()
    }

    pub(crate) fn native(&self) -> &dyn NativeDriver {
        self.native.as_ref()
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// Common prologue of every public operation.
    pub(crate) fn enter(&self, operation: &'static str) -> Status {
        callback::check_reentrancy(operation)?;
        self.init()
    }

    pub(crate) fn context_entry(&self, context: &Context) -> StatusOr<ContextEntry> {
        if context.is_null() {
            return Err(DriverError::InvalidHandle(format!(
                "context {} has been destroyed",
                context.id()
            )));
        }
        match self.contexts.get(&context.id()) {
            Some(entry) if entry.raw == context.raw() => Ok(*entry),
            _ => Err(DriverError::InvalidHandle(format!(
                "context {} is not owned by this driver",
                context.id()
            ))),
        }
    }

    /// Activates `context` for a context-scoped operation.
    pub(crate) fn activate(&self, context: &Context, operation: &'static str) -> StatusOr<ScopedActivateContext<'_>> {
        self.enter(operation)?;
        ScopedActivateContext::new(self, context)
    }

    /// Activates the context with id `context_id`, for operations that only
    /// receive a handle derived from it.
    pub(crate) fn activate_id(&self, context_id: i64, operation: &'static str) -> StatusOr<ScopedActivateContext<'_>> {
        self.enter(operation)?;
        let raw = self
            .contexts
            .get(&context_id)
            .map(|e| e.raw)
            .ok_or_else(|| DriverError::InvalidHandle(format!("context {context_id} has been destroyed")))?;
        ScopedActivateContext::activate(self, context_id, raw)
    }

    /// Checks that a handle belongs to `context`.
    pub(crate) fn owned(&self, kind: HandleKind, raw: u64, context: &Context) -> StatusOr<HandleRecord> {
        self.handles.lookup_owned(kind, raw, context.id()).inspect_err(|e| {
            error!("{}", e);
        })
    }
}
