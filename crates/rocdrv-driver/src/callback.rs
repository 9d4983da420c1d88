//! Delivery of stream callbacks on a layer-owned thread.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use rocdrv_core::{DriverError, Status, StatusOr};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Fails when called from the callback thread.
pub(crate) fn check_reentrancy(operation: &'static str) -> Status {
    if IN_CALLBACK.with(Cell::get) {
        error!("{} called from a stream callback", operation);
        return Err(DriverError::CallbackReentrancy(format!(
            "{operation} may not be called from a stream callback"
        )));
    }
    Ok(())
}

/// Owns the sending half of the notification channel. The worker thread is
/// started on first use and exits once the dispatcher and every pending
/// native callback have dropped their senders.
pub(crate) struct CallbackDispatcher {
    sender: Mutex<Option<Sender<Job>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> StatusOr<Sender<Job>> {
        let mut slot = self.sender.lock();
        if let Some(tx) = slot.as_ref() {
            return Ok(tx.clone());
        }
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        std::thread::Builder::new()
            .name("rocdrv-callbacks".into())
            .spawn(move || run(rx))
            .map_err(|e| DriverError::ResourceExhausted(format!("failed to spawn callback thread: {e}")))?;
        *slot = Some(tx.clone());
        Ok(tx)
    }
}

fn run(rx: Receiver<Job>) {
    IN_CALLBACK.with(|flag| flag.set(true));
    for job in rx {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("stream callback panicked");
        }
    }
    debug!("callback thread exiting");
}
