//! Stream workers and events.
//!
//! Every simulated stream owns a worker thread that drains a FIFO of queued
//! operations, so same-stream work is ordered and different streams overlap.
//! Events carry a record generation; a stream waiting on an event blocks its
//! worker until the generation it captured has completed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use rocdrv_core::native::{HipResult, HipStatus, NativeCallback, RawContext, EVENT_DISABLE_TIMING};

pub type Work = Box<dyn FnOnce() -> HipResult<()> + Send + 'static>;

enum StreamOp {
    Run(Work),
    Record(Arc<SimEvent>, u64),
    Wait(Arc<SimEvent>, u64),
    Callback(NativeCallback),
}

#[derive(Default)]
struct EventInner {
    recorded: u64,
    completed: u64,
    timestamp: Option<Instant>,
}

pub struct SimEvent {
    pub ctx: RawContext,
    pub flags: u32,
    inner: Mutex<EventInner>,
    done: Condvar,
}

impl SimEvent {
    pub fn new(ctx: RawContext, flags: u32) -> Self {
        Self {
            ctx,
            flags,
            inner: Mutex::new(EventInner::default()),
            done: Condvar::new(),
        }
    }

    pub fn timing_enabled(&self) -> bool {
        self.flags & EVENT_DISABLE_TIMING == 0
    }

    /// Start a new recording and return its generation.
    fn begin_record(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.recorded += 1;
        inner.recorded
    }

    fn complete(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation > inner.completed {
            inner.completed = generation;
            inner.timestamp = Some(Instant::now());
        }
        self.done.notify_all();
    }

    fn wait_for(&self, generation: u64) {
        let mut inner = self.inner.lock();
        while inner.completed < generation {
            self.done.wait(&mut inner);
        }
    }

    /// The generation a waiter should block on right now.
    pub fn latest(&self) -> u64 {
        self.inner.lock().recorded
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed >= inner.recorded
    }

    pub fn synchronize(&self) {
        let target = self.latest();
        self.wait_for(target);
    }

    /// Completion time of the latest recording, if it finished.
    pub fn timestamp(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        if inner.recorded > 0 && inner.completed >= inner.recorded {
            inner.timestamp
        } else {
            None
        }
    }

    pub fn was_recorded(&self) -> bool {
        self.inner.lock().recorded > 0
    }
}

#[derive(Default)]
struct Progress {
    pending: usize,
    /// First failure since the last synchronize.
    error: Option<HipStatus>,
}

struct StreamShared {
    progress: Mutex<Progress>,
    idle: Condvar,
}

impl StreamShared {
    fn finish(&self, result: HipResult<()>) {
        let mut progress = self.progress.lock();
        if let Err(status) = result {
            progress.error.get_or_insert(status);
        }
        progress.pending -= 1;
        if progress.pending == 0 {
            self.idle.notify_all();
        }
    }

    fn status(&self) -> HipStatus {
        self.progress.lock().error.unwrap_or(HipStatus::SUCCESS)
    }
}

pub struct SimStream {
    pub ctx: RawContext,
    pub flags: u32,
    sender: Mutex<Option<Sender<StreamOp>>>,
    shared: Arc<StreamShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimStream {
    pub fn spawn(raw: u64, ctx: RawContext, flags: u32) -> HipResult<Self> {
        let (tx, rx) = unbounded::<StreamOp>();
        let shared = Arc::new(StreamShared {
            progress: Mutex::new(Progress::default()),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("sim-stream-{raw:x}"))
            .spawn(move || {
                for op in rx {
                    let result = match op {
                        StreamOp::Run(work) => work(),
                        StreamOp::Record(event, generation) => {
                            event.complete(generation);
                            Ok(())
                        }
                        StreamOp::Wait(event, generation) => {
                            event.wait_for(generation);
                            Ok(())
                        }
                        StreamOp::Callback(callback) => {
                            callback(worker_shared.status());
                            Ok(())
                        }
                    };
                    if let Err(status) = result {
                        warn!("sim stream 0x{:x}: queued work failed: {}", raw, status);
                    }
                    worker_shared.finish(result);
                }
                debug!("sim stream 0x{:x} worker exiting", raw);
            })
            .map_err(|e| {
                error!("failed to spawn sim stream worker: {}", e);
                HipStatus::ERROR_OUT_OF_MEMORY
            })?;

        Ok(Self {
            ctx,
            flags,
            sender: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn submit(&self, op: StreamOp) -> HipResult<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        };
        self.shared.progress.lock().pending += 1;
        if tx.send(op).is_err() {
            self.shared.finish(Ok(()));
            return Err(HipStatus::ERROR_INVALID_HANDLE);
        }
        Ok(())
    }

    pub fn enqueue(&self, work: Work) -> HipResult<()> {
        self.submit(StreamOp::Run(work))
    }

    pub fn record(&self, event: &Arc<SimEvent>) -> HipResult<()> {
        let generation = event.begin_record();
        self.submit(StreamOp::Record(Arc::clone(event), generation))
    }

    pub fn wait_event(&self, event: &Arc<SimEvent>) -> HipResult<()> {
        let generation = event.latest();
        if generation == 0 {
            return Ok(());
        }
        self.submit(StreamOp::Wait(Arc::clone(event), generation))
    }

    pub fn add_callback(&self, callback: NativeCallback) -> HipResult<()> {
        self.submit(StreamOp::Callback(callback))
    }

    /// `Err(NOT_READY)` while work is queued; otherwise the sticky error, if any.
    pub fn query(&self) -> HipResult<()> {
        let progress = self.progress_snapshot();
        if progress.0 > 0 {
            return Err(HipStatus::ERROR_NOT_READY);
        }
        progress.1.map_or(Ok(()), Err)
    }

    fn progress_snapshot(&self) -> (usize, Option<HipStatus>) {
        let progress = self.shared.progress.lock();
        (progress.pending, progress.error)
    }

    /// Block until the queue drains; reports and clears the first failure.
    pub fn synchronize(&self) -> HipResult<()> {
        let mut progress = self.shared.progress.lock();
        while progress.pending > 0 {
            self.shared.idle.wait(&mut progress);
        }
        progress.error.take().map_or(Ok(()), Err)
    }

    /// Drain outstanding work and stop the worker.
    pub fn shutdown(&self) {
        // Dropping the sender ends the worker's receive loop after the queue drains.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("sim stream worker panicked");
            }
        }
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs null-stream operations inline on the calling thread.
pub fn record_inline(event: &SimEvent) {
    let generation = event.begin_record();
    event.complete(generation);
}

pub fn wait_inline(event: &SimEvent) {
    event.synchronize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn work_runs_in_submission_order() {
        let stream = SimStream::spawn(1, RawContext(1), 0).expect("spawn");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .enqueue(Box::new(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .expect("enqueue");
        }
        stream.synchronize().expect("sync");
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
        assert!(stream.query().is_ok());
    }

    #[test]
    fn errors_are_sticky_until_synchronize() {
        let stream = SimStream::spawn(2, RawContext(1), 0).expect("spawn");
        stream
            .enqueue(Box::new(|| Err(HipStatus::ERROR_LAUNCH_FAILURE)))
            .expect("enqueue");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        stream
            .add_callback(Box::new(move |status| {
                seen_cb.store(status.0 as usize, Ordering::SeqCst);
            }))
            .expect("callback");
        assert_eq!(stream.synchronize(), Err(HipStatus::ERROR_LAUNCH_FAILURE));
        assert_eq!(seen.load(Ordering::SeqCst), HipStatus::ERROR_LAUNCH_FAILURE.0 as usize);
        assert!(stream.synchronize().is_ok());
    }

    #[test]
    fn waiting_stream_blocks_on_event() {
        let producer = SimStream::spawn(3, RawContext(1), 0).expect("spawn");
        let consumer = SimStream::spawn(4, RawContext(1), 0).expect("spawn");
        let event = Arc::new(SimEvent::new(RawContext(1), 0));
        let value = Arc::new(AtomicUsize::new(0));

        let v = Arc::clone(&value);
        producer
            .enqueue(Box::new(move || {
                std::thread::sleep(Duration::from_millis(20));
                v.store(7, Ordering::SeqCst);
                Ok(())
            }))
            .expect("enqueue");
        producer.record(&event).expect("record");
        consumer.wait_event(&event).expect("wait");

        let v = Arc::clone(&value);
        let observed = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&observed);
        consumer
            .enqueue(Box::new(move || {
                o.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            }))
            .expect("enqueue");
        consumer.synchronize().expect("sync");
        assert_eq!(observed.load(Ordering::SeqCst), 7);
        assert!(event.is_complete());
        assert!(event.timestamp().is_some());
    }
}
