use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use tracing::{debug, error};

use rocdrv_core::native::RawContext;
use rocdrv_core::StatusOr;

use crate::context::Context;
use crate::driver::{check, Driver};

/// Per-thread view of which context the layer has made current.
#[derive(Debug, Clone, Copy, Default)]
struct ActiveSlot {
    depth: usize,
    id: i64,
    raw: RawContext,
}

thread_local! {
    /// Keyed by driver instance so independent drivers do not share bookkeeping.
    static ACTIVE: RefCell<HashMap<u64, ActiveSlot>> = RefCell::new(HashMap::new());
}

fn load(instance: u64) -> ActiveSlot {
    ACTIVE.with(|a| a.borrow().get(&instance).copied().unwrap_or_default())
}

fn store(instance: u64, slot: ActiveSlot) {
    ACTIVE.with(|a| {
        a.borrow_mut().insert(instance, slot);
    });
}

/// Forgets `raw` as the thread's active context after it has been destroyed.
pub(crate) fn forget(instance: u64, raw: RawContext) {
    let mut slot = load(instance);
    if slot.raw == raw {
        slot.id = 0;
        slot.raw = RawContext::NULL;
        store(instance, slot);
    }
}

/// Makes a context current on the calling thread for the guard's lifetime.
///
/// The outermost guard on a thread always sets the native current context
/// and leaves it in place on drop. Nested guards for a different context
/// switch to it and switch back on drop; nested guards for the same context
/// only re-check the native state.
///
/// On drop the native current context must match the layer's bookkeeping.
/// A mismatch means something bypassed the guard and the process is aborted.
///
/// The guard is tied to its thread and is not `Send`.
pub struct ScopedActivateContext<'a> {
    driver: &'a Driver,
    to_restore: Option<(i64, RawContext)>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopedActivateContext<'a> {
    pub fn new(driver: &'a Driver, context: &Context) -> StatusOr<Self> {
        let entry = driver.context_entry(context)?;
        Self::activate(driver, context.id(), entry.raw)
    }

    pub(crate) fn activate(driver: &'a Driver, id: i64, raw: RawContext) -> StatusOr<Self> {
        let instance = driver.instance();
        let slot = load(instance);

        let to_restore = if slot.depth == 0 {
            debug!("activating context {} (outermost)", id);
            set_current(driver, id, raw)?;
            None
        } else if slot.id == id {
            verify(driver, raw);
            store(instance, ActiveSlot { depth: slot.depth + 1, ..slot });
            return Ok(Self::guard(driver, None));
        } else {
            debug!("switching context {} -> {}", slot.id, id);
            set_current(driver, id, raw)?;
            Some((slot.id, slot.raw))
        };
        store(instance, ActiveSlot { depth: slot.depth + 1, id, raw });

        let guard = Self::guard(driver, to_restore);
        if driver.config().driver.sync_around_driver_calls {
            check("hipCtxSynchronize", driver.native().ctx_synchronize(), || format!("context={id} (on entry)"))?;
        }
        Ok(guard)
    }

    fn guard(driver: &'a Driver, to_restore: Option<(i64, RawContext)>) -> Self {
        Self {
            driver,
            to_restore,
            _not_send: PhantomData,
        }
    }
}

fn set_current(driver: &Driver, id: i64, raw: RawContext) -> StatusOr<()> {
    check("hipCtxSetCurrent", driver.native().ctx_set_current(raw), || format!("context={id}"))
}

/// Aborts when the native current context differs from `expected`.
fn verify(driver: &Driver, expected: RawContext) {
    match driver.native().ctx_get_current() {
        Ok(current) if current == expected => {}
        Ok(current) => {
            error!(
                "context activation out of sync: native current is 0x{:x}, expected 0x{:x}",
                current.0, expected.0
            );
            std::process::abort();
        }
        Err(status) => {
            error!("hipCtxGetCurrent failed while verifying activation: {}", status);
            std::process::abort();
        }
    }
}

impl Drop for ScopedActivateContext<'_> {
    fn drop(&mut self) {
        let instance = self.driver.instance();
        let mut slot = load(instance);

        if self.driver.config().driver.sync_around_driver_calls {
            if let Err(status) = self.driver.native().ctx_synchronize() {
                error!("hipCtxSynchronize failed on exit of context {}: {}", slot.id, status);
            }
        }
        verify(self.driver, slot.raw);

        slot.depth = slot.depth.saturating_sub(1);
        if let Some((id, raw)) = self.to_restore {
            if let Err(status) = self.driver.native().ctx_set_current(raw) {
                error!("failed to restore context {}: {}", id, status);
                std::process::abort();
            }
            slot.id = id;
            slot.raw = raw;
        }
        store(instance, slot);
    }
}
