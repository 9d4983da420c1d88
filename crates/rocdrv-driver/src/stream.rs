//! Streams, events and stream callbacks.

use tracing::{debug, error, warn};

use rocdrv_core::handle_map::{HandleKind, HandleRecord};
use rocdrv_core::native::{
    HipStatus, NativeCallback, RawEvent, RawStream, EVENT_DEFAULT, EVENT_DISABLE_TIMING, STREAM_DEFAULT,
};
use rocdrv_core::{DriverError, Status, StatusOr};

use crate::context::Context;
use crate::driver::{check, Driver};

/// An asynchronous command queue owned by one context.
#[derive(Debug)]
pub struct Stream {
    raw: RawStream,
    context_id: i64,
}

impl Stream {
    pub fn raw(&self) -> RawStream {
        self.raw
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFlags {
    #[default]
    Default,
    DisableTiming,
}

impl EventFlags {
    fn bits(self) -> u32 {
        match self {
            EventFlags::Default => EVENT_DEFAULT,
            EventFlags::DisableTiming => EVENT_DISABLE_TIMING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Pending,
    Complete,
}

/// A marker recorded into a stream.
#[derive(Debug)]
pub struct Event {
    raw: RawEvent,
    context_id: i64,
    flags: EventFlags,
}

impl Event {
    pub fn raw(&self) -> RawEvent {
        self.raw
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

impl Driver {
    // ── Streams ───────────────────────────────────────────────────

    pub fn create_stream(&self, context: &Context) -> StatusOr<Stream> {
        let _guard = self.activate(context, "create_stream")?;
        let raw = check("hipStreamCreateWithFlags", self.native().stream_create(STREAM_DEFAULT), || {
            format!("context={}", context.id())
        })?;
        self.handles
            .insert(raw.0, HandleRecord::new(HandleKind::Stream, Some(context.id())));
        debug!("created stream 0x{:x} in context {}", raw.0, context.id());
        Ok(Stream {
            raw,
            context_id: context.id(),
        })
    }

    /// Destroys `stream` and nulls it. Destroying a null stream does nothing.
    pub fn destroy_stream(&self, context: &Context, stream: &mut Stream) -> Status {
        if stream.is_null() {
            return Ok(());
        }
        let _guard = self.activate(context, "destroy_stream")?;
        self.owned(HandleKind::Stream, stream.raw.0, context)?;
        check("hipStreamDestroy", self.native().stream_destroy(stream.raw), || {
            format!("context={} stream=0x{:x}", context.id(), stream.raw.0)
        })?;
        self.handles.remove(HandleKind::Stream, stream.raw.0);
        debug!("destroyed stream 0x{:x} in context {}", stream.raw.0, context.id());
        stream.raw = RawStream::NULL;
        Ok(())
    }

    pub fn synchronize_stream(&self, context: &Context, stream: &Stream) -> Status {
        let _guard = self.activate(context, "synchronize_stream")?;
        self.owned(HandleKind::Stream, stream.raw.0, context)?;
        check("hipStreamSynchronize", self.native().stream_synchronize(stream.raw), || {
            format!("context={} stream=0x{:x}", context.id(), stream.raw.0)
        })
    }

    /// Blocks until all work in the context has finished.
    pub fn synchronize_context(&self, context: &Context) -> Status {
        let _guard = self.activate(context, "synchronize_context")?;
        check("hipCtxSynchronize", self.native().ctx_synchronize(), || {
            format!("context={}", context.id())
        })
    }

    /// Snapshot of whether `stream` has drained. Racy by nature; errors read as busy.
    pub fn is_stream_idle(&self, context: &Context, stream: &Stream) -> bool {
        let Ok(_guard) = self.activate(context, "is_stream_idle") else {
            return false;
        };
        if self.owned(HandleKind::Stream, stream.raw.0, context).is_err() {
            return false;
        }
        match self.native().stream_query(stream.raw) {
            Ok(()) => true,
            Err(HipStatus::ERROR_NOT_READY) => false,
            Err(status) => {
                error!(
                    "hipStreamQuery failed: {} (context={} stream=0x{:x})",
                    status,
                    context.id(),
                    stream.raw.0
                );
                false
            }
        }
    }

    /// Makes future work on `stream` wait for `event`. Does not block the host.
    pub fn wait_stream_on_event(&self, context: &Context, stream: &Stream, event: &Event) -> Status {
        let _guard = self.activate(context, "wait_stream_on_event")?;
        self.owned(HandleKind::Stream, stream.raw.0, context)?;
        self.owned(HandleKind::Event, event.raw.0, context)?;
        check("hipStreamWaitEvent", self.native().stream_wait_event(stream.raw, event.raw, 0), || {
            format!(
                "context={} stream=0x{:x} event=0x{:x}",
                context.id(),
                stream.raw.0,
                event.raw.0
            )
        })
    }

    /// Runs `callback` on the layer's notification thread once all work enqueued
    /// on `stream` so far has completed. The callback receives the stream's
    /// status and must not call back into the driver.
    pub fn add_stream_callback<F>(&self, context: &Context, stream: &Stream, callback: F) -> Status
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let _guard = self.activate(context, "add_stream_callback")?;
        self.owned(HandleKind::Stream, stream.raw.0, context)?;
        let tx = self.callbacks.sender()?;
        let context_id = context.id();
        let native_callback: NativeCallback = Box::new(move |status| {
            let result = check("stream callback", status.check(), || format!("context={context_id}"));
            if tx.send(Box::new(move || callback(result))).is_err() {
                warn!("stream callback dropped: notification thread is gone");
            }
        });
        check("hipStreamAddCallback", self.native().stream_add_callback(stream.raw, native_callback), || {
            format!("context={} stream=0x{:x}", context.id(), stream.raw.0)
        })
    }

    // ── Events ────────────────────────────────────────────────────

    pub fn create_event(&self, context: &Context, flags: EventFlags) -> StatusOr<Event> {
        let _guard = self.activate(context, "create_event")?;
        let raw = check("hipEventCreateWithFlags", self.native().event_create(flags.bits()), || {
            format!("context={} flags={:?}", context.id(), flags)
        })?;
        self.handles.insert(
            raw.0,
            HandleRecord::new(HandleKind::Event, Some(context.id())).with_flags(flags.bits()),
        );
        Ok(Event {
            raw,
            context_id: context.id(),
            flags,
        })
    }

    /// Destroys `event` and nulls it. Destroying a null event does nothing.
    pub fn destroy_event(&self, context: &Context, event: &mut Event) -> Status {
        if event.is_null() {
            return Ok(());
        }
        let _guard = self.activate(context, "destroy_event")?;
        self.owned(HandleKind::Event, event.raw.0, context)?;
        check("hipEventDestroy", self.native().event_destroy(event.raw), || {
            format!("context={} event=0x{:x}", context.id(), event.raw.0)
        })?;
        self.handles.remove(HandleKind::Event, event.raw.0);
        event.raw = RawEvent::NULL;
        Ok(())
    }

    pub fn record_event(&self, context: &Context, event: &Event, stream: &Stream) -> Status {
        let _guard = self.activate(context, "record_event")?;
        self.owned(HandleKind::Event, event.raw.0, context)?;
        self.owned(HandleKind::Stream, stream.raw.0, context)?;
        check("hipEventRecord", self.native().event_record(event.raw, stream.raw), || {
            format!(
                "context={} event=0x{:x} stream=0x{:x}",
                context.id(),
                event.raw.0,
                stream.raw.0
            )
        })?;
        self.handles
            .update(HandleKind::Event, event.raw.0, |record| record.recorded = true);
        Ok(())
    }

    /// Polls `event` without blocking. An event that was never recorded is pending.
    pub fn query_event(&self, context: &Context, event: &Event) -> StatusOr<EventStatus> {
        let _guard = self.activate(context, "query_event")?;
        let record = self.owned(HandleKind::Event, event.raw.0, context)?;
        if !record.recorded {
            return Ok(EventStatus::Pending);
        }
        match self.native().event_query(event.raw) {
            Ok(()) => Ok(EventStatus::Complete),
            Err(HipStatus::ERROR_NOT_READY) => Ok(EventStatus::Pending),
            Err(status) => check("hipEventQuery", Err(status), || {
                format!("context={} event=0x{:x}", context.id(), event.raw.0)
            }),
        }
    }

    /// Milliseconds between two recorded timing events. Waits for `stop` first.
    pub fn get_event_elapsed_time(&self, context: &Context, start: &Event, stop: &Event) -> StatusOr<f32> {
        let _guard = self.activate(context, "get_event_elapsed_time")?;
        for event in [start, stop] {
            let record = self.owned(HandleKind::Event, event.raw.0, context)?;
            if record.flags & EVENT_DISABLE_TIMING != 0 {
                error!("get_event_elapsed_time: event 0x{:x} was created without timing", event.raw.0);
                return Err(DriverError::InvalidArgument(format!(
                    "event 0x{:x} was created with timing disabled",
                    event.raw.0
                )));
            }
            if !record.recorded {
                error!("get_event_elapsed_time: event 0x{:x} was never recorded", event.raw.0);
                return Err(DriverError::InvalidArgument(format!(
                    "event 0x{:x} has not been recorded",
                    event.raw.0
                )));
            }
        }
        let detail = || {
            format!(
                "context={} start=0x{:x} stop=0x{:x}",
                context.id(),
                start.raw.0,
                stop.raw.0
            )
        };
        check("hipEventSynchronize", self.native().event_synchronize(stop.raw), detail)?;
        check("hipEventElapsedTime", self.native().event_elapsed_time(start.raw, stop.raw), detail)
    }
}
