use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// A telemetry record (transaction, span, error) handed over by a producer.
///
/// The reporter never looks inside a record; it only asks the configured
/// serializer to render it. Every `Serialize + Debug` type qualifies.
pub trait Record: fmt::Debug + Send + Sync {
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl<T> Record for T
where
    T: Serialize + fmt::Debug + Send + Sync,
{
    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Opaque handle to the data carried by a record event.
#[derive(Debug, Clone)]
pub enum Payload {
    Transaction(Arc<dyn Record>),
    Span(Arc<dyn Record>),
    Error(Arc<dyn Record>),
    /// A metric set already rendered as ndjson.
    Metrics(Bytes),
    /// Pre-serialized ndjson, written to the request verbatim.
    Bytes(Bytes),
}

impl Payload {
    pub fn transaction(record: impl Record + 'static) -> Self {
        Self::Transaction(Arc::new(record))
    }

    pub fn span(record: impl Record + 'static) -> Self {
        Self::Span(Arc::new(record))
    }

    pub fn error(record: impl Record + 'static) -> Self {
        Self::Error(Arc::new(record))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Transaction(_) => EventKind::Transaction,
            Payload::Span(_) => EventKind::Span,
            Payload::Error(_) => EventKind::Error,
            Payload::Metrics(_) => EventKind::Metrics,
            Payload::Bytes(_) => EventKind::Bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Transaction,
    Span,
    Error,
    Metrics,
    Bytes,
    Flush,
    MakeFlushRequest,
    Shutdown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::Span => "span",
            EventKind::Error => "error",
            EventKind::Metrics => "metrics",
            EventKind::Bytes => "bytes",
            EventKind::Flush => "flush",
            EventKind::MakeFlushRequest => "make_flush_request",
            EventKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry of the event queue.
///
/// Events move by value from the producer into the queue and from the queue
/// into the dispatcher, so a consumed slot never keeps a payload alive.
#[derive(Debug)]
pub enum Event {
    Record(Payload),
    /// End the current request once every earlier event has been handled.
    Flush(FlushTicket),
    /// End the current request and ask the collector to flush its own buffers.
    MakeFlushRequest,
    /// Flush once, then stop the dispatcher for good.
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Record(payload) => payload.kind(),
            Event::Flush(_) => EventKind::Flush,
            Event::MakeFlushRequest => EventKind::MakeFlushRequest,
            Event::Shutdown => EventKind::Shutdown,
        }
    }
}

impl From<Payload> for Event {
    fn from(payload: Payload) -> Self {
        Event::Record(payload)
    }
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared state of one flush request.
///
/// Whoever wins the transition out of `PENDING` decides: the dispatcher
/// starting the flush, or the caller abandoning it.
#[derive(Debug, Clone)]
pub struct FlushTicket {
    state: Arc<AtomicU8>,
}

impl FlushTicket {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Claims the flush for processing. Returns `false` if it was cancelled first.
    pub fn start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Abandons the flush. Returns `false` once the dispatcher has started it.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl Default for FlushTicket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct TestSpan {
        id: &'static str,
        duration_ms: f64,
    }

    #[test]
    fn test_record_renders_through_serde() {
        let payload = Payload::span(TestSpan {
            id: "abc",
            duration_ms: 1.5,
        });
        let Payload::Span(record) = &payload else {
            panic!("expected span payload");
        };
        let json = record.to_json().unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(payload.kind(), EventKind::Span);
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(Event::Shutdown.kind(), EventKind::Shutdown);
        assert_eq!(Event::MakeFlushRequest.kind(), EventKind::MakeFlushRequest);
        assert_eq!(Event::Flush(FlushTicket::new()).kind(), EventKind::Flush);
        let event: Event = Payload::Bytes(Bytes::from_static(b"{}\n")).into();
        assert_eq!(event.kind(), EventKind::Bytes);
    }

    #[test]
    fn test_cancel_before_start_wins() {
        let ticket = FlushTicket::new();
        assert!(ticket.cancel());
        assert!(ticket.is_cancelled());
        assert!(!ticket.start());
    }

    #[test]
    fn test_cancel_after_start_is_noop() {
        let ticket = FlushTicket::new();
        let dispatcher_side = ticket.clone();
        assert!(dispatcher_side.start());
        assert!(!ticket.cancel());
        assert!(!ticket.is_cancelled());
    }
}
