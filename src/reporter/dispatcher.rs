use crate::buffer::{EventConsumer, Sequenced};
use crate::domain::{Event, Payload};
use crate::reliability::Backoff;
use crate::sender::{
    EndpointClient, FinishedRequest, PayloadSerializer, ReporterStats, SessionOptions,
    UploadSession,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Events,
    ServerFlush,
}

/// The single consumer of the event queue.
///
/// Owns the open upload (if any) and moves between two states: idle with no
/// session, and open with a session collecting records. A request ends on an
/// explicit flush, when it grows past the size limit, or when its deadline
/// passes.
pub(crate) struct Dispatcher {
    consumer: EventConsumer,
    client: Arc<EndpointClient>,
    serializer: Arc<dyn PayloadSerializer>,
    options: SessionOptions,
    session: Option<UploadSession>,
    inflight: u64,
    scratch: Vec<u8>,
    stats: Arc<ReporterStats>,
    backoff: Backoff,
    progress: watch::Sender<u64>,
    shut_down: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        consumer: EventConsumer,
        client: Arc<EndpointClient>,
        serializer: Arc<dyn PayloadSerializer>,
        options: SessionOptions,
        stats: Arc<ReporterStats>,
        backoff: Backoff,
        progress: watch::Sender<u64>,
    ) -> Self {
        Self {
            consumer,
            client,
            serializer,
            options,
            session: None,
            inflight: 0,
            scratch: Vec::with_capacity(4096),
            stats,
            backoff,
            progress,
            shut_down: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Event dispatcher started");
        while !self.shut_down {
            if !self.step().await {
                break;
            }
        }
        self.drain_after_shutdown().await;
        info!("Event dispatcher stopped");
    }

    /// Handles one event. `false` once the queue has no producers left.
    async fn step(&mut self) -> bool {
        match self.next_event().await {
            Some(Sequenced { sequence, event }) => {
                self.handle(event).await;
                self.progress.send_replace(sequence);
                true
            }
            None => {
                debug!("Event queue closed");
                self.end_request().await;
                self.shut_down = true;
                false
            }
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    #[cfg(test)]
    fn inflight(&self) -> u64 {
        self.inflight
    }

    async fn next_event(&mut self) -> Option<Sequenced> {
        loop {
            let Some(deadline) = self.session.as_ref().map(UploadSession::deadline) else {
                return self.consumer.dequeue().await;
            };
            if Instant::now() < deadline {
                tokio::select! {
                    biased;
                    next = self.consumer.dequeue() => return next,
                    () = sleep_until(deadline) => {}
                }
            }
            debug!("Request time limit reached, ending request");
            self.end_request().await;
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Record(payload) => self.handle_record(payload).await,
            Event::Flush(ticket) => {
                if ticket.start() {
                    self.end_request().await;
                } else {
                    debug!("Skipping cancelled flush");
                }
            }
            Event::MakeFlushRequest => {
                self.end_request().await;
                if self.start_request(RequestKind::ServerFlush).await {
                    self.end_request().await;
                }
            }
            Event::Shutdown => {
                info!("Shutdown requested, ending current request");
                self.end_request().await;
                self.shut_down = true;
            }
        }
    }

    async fn handle_record(&mut self, payload: Payload) {
        if self.shut_down {
            self.stats.add_dropped(1);
            return;
        }

        // Serialize up front so a bad record never reaches the request body.
        self.scratch.clear();
        if let Err(e) = self.serializer.write_payload(&payload, &mut self.scratch) {
            warn!("Failed to serialize {}, dropping it: {}", payload.kind(), e);
            self.stats.add_dropped(1);
            return;
        }

        if self.session.is_none() && !self.start_request(RequestKind::Events).await {
            self.stats.add_dropped(1);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.stats.add_dropped(1);
            return;
        };

        self.inflight += 1;
        match session.write_record(&self.scratch).await {
            Ok(()) => {
                if session.should_flush() {
                    debug!("Request size limit reached, ending request");
                    self.end_request().await;
                }
            }
            Err(e) => {
                warn!("Failed to write {} to {}: {}", payload.kind(), session.url(), e);
                self.end_request_exceptionally().await;
            }
        }
    }

    async fn start_request(&mut self, kind: RequestKind) -> bool {
        let Some(endpoint) = self.client.registry().current_endpoint() else {
            debug!("No collector endpoint configured");
            return false;
        };

        let mut preamble = Vec::new();
        if let Err(e) = self.serializer.write_metadata(&mut preamble) {
            warn!("Failed to serialize metadata: {}", e);
            return false;
        }

        let paths = self.client.paths();
        let path = match kind {
            RequestKind::Events => paths.events.as_str(),
            RequestKind::ServerFlush => paths.flush_events.as_str(),
        };
        let opened = self
            .client
            .open_session(&endpoint, path, &preamble, &self.options)
            .await;
        match opened {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                warn!("Failed to start request to {}: {}", endpoint, e);
                self.on_failure(true).await;
                false
            }
        }
    }

    /// Finishes the open request, if any, and settles the in-flight count.
    async fn end_request(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let inflight = std::mem::take(&mut self.inflight);
        let FinishedRequest {
            outcome,
            bytes_streamed,
            records,
        } = session.finish().await;

        if outcome.is_success() {
            debug!(
                "Request completed: {} records, {} bytes",
                records, bytes_streamed
            );
            self.stats.add_reported(inflight);
            self.stats.record_request(true, bytes_streamed);
            self.backoff.reset();
            return;
        }

        let accepted = outcome.accepted().unwrap_or(0).min(inflight);
        self.stats.add_reported(accepted);
        self.stats.add_dropped(inflight - accepted);
        self.stats.record_request(false, bytes_streamed);
        self.on_failure(outcome.is_transport_failure()).await;
    }

    /// Abandons the open request; everything in flight is lost.
    async fn end_request_exceptionally(&mut self) {
        if let Some(session) = self.session.take() {
            self.stats.record_request(false, session.bytes_streamed());
            session.abort();
        }
        let inflight = std::mem::take(&mut self.inflight);
        self.stats.add_dropped(inflight);
        self.on_failure(true).await;
    }

    async fn on_failure(&mut self, rotate: bool) {
        if rotate {
            self.client.registry().on_connection_error();
        }
        if self.backoff.on_failure().await.is_err() {
            info!("Backoff interrupted, reporter is closing");
        }
    }

    /// Settles everything published after shutdown, including events from
    /// producers that reserved a slot before the queue closed.
    async fn drain_after_shutdown(&mut self) {
        self.consumer.close();
        while let Some(Sequenced { sequence, event }) = self.consumer.dequeue().await {
            if let Event::Record(payload) = event {
                debug!("Dropping {} reported after shutdown", payload.kind());
                self.stats.add_dropped(1);
            }
            self.progress.send_replace(sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventProducer, QueueConfig, event_queue};
    use crate::domain::FlushTicket;
    use crate::reliability::BackoffConfig;
    use crate::sender::serialization::MockPayloadSerializer;
    use crate::sender::{ClientConfig, SerializationError};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(body: &'static str) -> Event {
        Event::Record(Payload::Bytes(Bytes::from_static(body.as_bytes())))
    }

    fn passthrough_serializer() -> MockPayloadSerializer {
        let mut serializer = MockPayloadSerializer::new();
        serializer.expect_write_metadata().returning(|out| {
            out.extend_from_slice(b"{\"metadata\":{}}\n");
            Ok(())
        });
        serializer.expect_write_payload().returning(|payload, out| match payload {
            Payload::Bytes(bytes) => {
                out.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(SerializationError::EmptyPayload),
        });
        serializer
    }

    fn dispatcher(
        server: &MockServer,
        serializer: MockPayloadSerializer,
    ) -> (EventProducer, Dispatcher, Arc<ReporterStats>) {
        let (producer, consumer) = event_queue(&QueueConfig::default());
        let client = Arc::new(EndpointClient::new(ClientConfig::default()).unwrap());
        client
            .registry()
            .set_endpoints_ordered(vec![Url::parse(&server.uri()).unwrap()]);
        let stats = Arc::new(ReporterStats::new());
        let (progress, _) = watch::channel(0);
        let backoff = Backoff::new(BackoffConfig::default(), CancellationToken::new());
        let options = SessionOptions {
            max_request_time: Duration::from_secs(30),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            consumer,
            client,
            Arc::new(serializer),
            options,
            Arc::clone(&stats),
            backoff,
            progress,
        );
        (producer, dispatcher, stats)
    }

    #[tokio::test]
    async fn test_flush_ends_request_before_later_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/intake/v2/events"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let (producer, mut dispatcher, stats) = dispatcher(&server, passthrough_serializer());

        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        producer
            .enqueue(Event::Flush(FlushTicket::new()))
            .await
            .unwrap();
        producer.enqueue(record("{\"e\":2}\n")).await.unwrap();

        assert!(dispatcher.step().await);
        assert!(dispatcher.is_open());
        assert_eq!(dispatcher.inflight(), 1);

        assert!(dispatcher.step().await);
        assert!(!dispatcher.is_open());
        assert_eq!(stats.reported(), 1);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.contains("{\"e\":1}"));
        assert!(!body.contains("{\"e\":2}"));
    }

    #[tokio::test]
    async fn test_cancelled_flush_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let (producer, mut dispatcher, stats) = dispatcher(&server, passthrough_serializer());

        let ticket = FlushTicket::new();
        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        producer.enqueue(Event::Flush(ticket.clone())).await.unwrap();
        assert!(ticket.cancel());

        dispatcher.step().await;
        dispatcher.step().await;
        assert!(dispatcher.is_open());
        assert_eq!(stats.reported(), 0);
    }

    #[tokio::test]
    async fn test_serialization_failure_drops_only_that_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let (producer, mut dispatcher, stats) = dispatcher(&server, passthrough_serializer());

        producer
            .enqueue(Event::Record(Payload::Metrics(Bytes::from_static(b"{}"))))
            .await
            .unwrap();
        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        producer.enqueue(Event::Shutdown).await.unwrap();

        dispatcher.run().await;
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.reported(), 1);
    }

    #[tokio::test]
    async fn test_records_without_endpoint_are_dropped() {
        let (producer, consumer) = event_queue(&QueueConfig::default());
        let client = Arc::new(EndpointClient::new(ClientConfig::default()).unwrap());
        let stats = Arc::new(ReporterStats::new());
        let (progress, _) = watch::channel(0);
        let mut dispatcher = Dispatcher::new(
            consumer,
            client,
            Arc::new(passthrough_serializer()),
            SessionOptions::default(),
            Arc::clone(&stats),
            Backoff::new(BackoffConfig::default(), CancellationToken::new()),
            progress,
        );

        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        dispatcher.step().await;
        assert!(!dispatcher.is_open());
        assert_eq!(stats.dropped(), 1);
    }

    #[tokio::test]
    async fn test_request_deadline_ends_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let (producer, mut dispatcher, stats) = dispatcher(&server, passthrough_serializer());
        dispatcher.options.max_request_time = Duration::from_millis(50);

        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        dispatcher.step().await;
        assert!(dispatcher.is_open());

        // Nothing else is queued: the next step only returns once the
        // deadline has closed the request and a new event arrives.
        let later = producer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            later.enqueue(Event::Flush(FlushTicket::new())).await.unwrap();
        });
        dispatcher.step().await;
        assert_eq!(stats.reported(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drain_waits_for_reserved_slots() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let (producer, dispatcher, stats) = dispatcher(&server, passthrough_serializer());

        // A report that won its slot before the queue closed.
        let permit = producer.sender().reserve().await.unwrap();
        producer.enqueue(Event::Shutdown).await.unwrap();
        let running = tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());

        permit.send(Sequenced {
            sequence: 2,
            event: record("{\"e\":1}\n"),
        });
        running.await.unwrap();
        assert_eq!(stats.reported() + stats.dropped(), 1);
        assert_eq!(stats.dropped(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_and_flush_complete_request_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/intake/v2/events"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let (producer, mut dispatcher, stats) = dispatcher(&server, passthrough_serializer());
        dispatcher.options.max_request_time = Duration::ZERO;

        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        producer
            .enqueue(Event::Flush(FlushTicket::new()))
            .await
            .unwrap();

        assert!(dispatcher.step().await);
        assert!(dispatcher.is_open());
        // The deadline has already passed when the flush is dequeued.
        assert!(dispatcher.step().await);
        assert!(!dispatcher.is_open());

        assert_eq!(stats.reported(), 1);
        assert_eq!(stats.dropped(), 0);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_records_after_shutdown_are_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let (producer, dispatcher, stats) = dispatcher(&server, passthrough_serializer());

        producer.enqueue(record("{\"e\":1}\n")).await.unwrap();
        producer.enqueue(Event::Shutdown).await.unwrap();
        producer.enqueue(record("{\"e\":2}\n")).await.unwrap();

        dispatcher.run().await;
        assert_eq!(stats.reported(), 1);
        assert_eq!(stats.dropped(), 1);
        assert!(producer.enqueue(record("{\"e\":3}\n")).await.is_err());
    }
}
