//! Devices and execution contexts.

use tracing::{debug, error, info};

use rocdrv_core::native::{RawContext, RawDevice};
use rocdrv_core::{ContextFlags, DriverError, SharedMemConfig, Status, StatusOr};

use crate::activation;
use crate::driver::{check, next_context_id, ContextEntry, Driver};

/// A physical device. Owned by the native driver for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    raw: RawDevice,
    ordinal: i32,
}

impl Device {
    pub(crate) fn new(raw: RawDevice, ordinal: i32) -> Self {
        Self { raw, ordinal }
    }

    pub fn raw(&self) -> RawDevice {
        self.raw
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }
}

/// An execution context on one device.
///
/// Exclusively owned by its creator and borrowed by every operation issued
/// against it. The id is positive and unique for the life of the process.
#[derive(Debug)]
pub struct Context {
    raw: RawContext,
    id: i64,
    device: Device,
}

impl Context {
    pub fn raw(&self) -> RawContext {
        self.raw
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// True once the context has been destroyed.
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

impl Driver {
    /// Creates a context on `device`. The thread's previously current context is
    /// current again when this returns.
    pub fn create_context(&self, device: Device, flags: ContextFlags) -> StatusOr<Context> {
        self.enter("create_context")?;
        if !flags.is_valid() {
            error!("create_context: conflicting scheduling flags {:?}", flags);
            return Err(DriverError::InvalidArgument(format!(
                "at most one scheduling policy may be set, got {flags:?}"
            )));
        }

        let native = self.native();
        let previous = check("hipCtxGetCurrent", native.ctx_get_current(), String::new)?;
        let raw = check("hipCtxCreate", native.ctx_create(flags.bits(), device.raw), || {
            format!("device={} flags={:?}", device.ordinal, flags)
        })?;
        check("hipCtxSetCurrent", native.ctx_set_current(previous), || {
            format!("restoring 0x{:x} after creating a context on device {}", previous.0, device.ordinal)
        })?;

        let id = next_context_id();
        self.contexts.insert(id, ContextEntry { raw, device });
        info!("created context {} on device {} (flags={:?})", id, device.ordinal, flags);
        Ok(Context { raw, id, device })
    }

    /// Creates a context with the scheduling policy from the configuration.
    pub fn create_default_context(&self, device: Device) -> StatusOr<Context> {
        self.create_context(device, self.config().context.flags())
    }

    /// Destroys `context` and nulls it. Refused while the context still owns
    /// streams, events, modules or memory.
    pub fn destroy_context(&self, context: &mut Context) -> Status {
        self.enter("destroy_context")?;
        let entry = self.context_entry(context)?;
        let live = self.handles.live_count(context.id);
        if live > 0 {
            error!("destroy_context: context {} still owns {} handle(s)", context.id, live);
            return Err(DriverError::ContextInUse { id: context.id, live });
        }

        check("hipCtxDestroy", self.native().ctx_destroy(entry.raw), || {
            format!("context={}", context.id)
        })?;
        self.contexts.remove(&context.id);
        activation::forget(self.instance(), entry.raw);
        info!("destroyed context {}", context.id);
        context.raw = RawContext::NULL;
        Ok(())
    }

    /// Asks the driver which device `context` was created on.
    pub fn device_from_context(&self, context: &Context) -> StatusOr<Device> {
        let _guard = self.activate(context, "device_from_context")?;
        let raw = check("hipCtxGetDevice", self.native().ctx_get_device(), || {
            format!("context={}", context.id)
        })?;
        Ok(Device::new(raw, raw))
    }

    /// The id of the context the driver reports as current on this thread,
    /// or `None` when no context is current.
    pub fn current_context(&self) -> StatusOr<Option<i64>> {
        self.enter("current_context")?;
        let raw = check("hipCtxGetCurrent", self.native().ctx_get_current(), String::new)?;
        if raw.is_null() {
            return Ok(None);
        }
        self.contexts
            .iter()
            .find(|e| e.raw == raw)
            .map(|e| Some(*e.key()))
            .ok_or_else(|| DriverError::InvalidHandle(format!("current context 0x{:x} was not created by this driver", raw.0)))
    }

    pub fn context_get_shared_mem_config(&self, context: &Context) -> StatusOr<SharedMemConfig> {
        let _guard = self.activate(context, "context_get_shared_mem_config")?;
        check("hipCtxGetSharedMemConfig", self.native().ctx_get_shared_mem_config(), || {
            format!("context={}", context.id)
        })
    }

    pub fn context_set_shared_mem_config(&self, context: &Context, config: SharedMemConfig) -> Status {
        let _guard = self.activate(context, "context_set_shared_mem_config")?;
        check("hipCtxSetSharedMemConfig", self.native().ctx_set_shared_mem_config(config), || {
            format!("context={} config={:?}", context.id, config)
        })?;
        debug!("context {} shared memory config set to {:?}", context.id, config);
        Ok(())
    }
}
