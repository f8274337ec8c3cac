//! Public reporting API.
//!
//! A [`Reporter`] accepts records from any number of tasks and hands them to
//! a single dispatcher task through a bounded queue. The dispatcher streams
//! them to the current collector endpoint, rotating endpoints and backing off
//! when collectors fail.

mod dispatcher;
mod flush;

pub use flush::FlushHandle;

use crate::buffer::{EventProducer, QueueConfig, QueueError, event_queue};
use crate::domain::{Event, FlushTicket, Payload, ReporterError};
use crate::reliability::{Backoff, BackoffConfig, BackoffState, ServerVersion};
use crate::sender::{
    ClientConfig, ClientError, EndpointClient, NDJSON_CONTENT_TYPE, PayloadSerializer,
    ReporterStats, SessionOptions, StatsSnapshot,
};
use bytes::Bytes;
use dispatcher::Dispatcher;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const PARTIAL_RECORD_CONTENT_TYPE: &str = "application/vnd.elastic.apm.transaction+ndjson";
pub const EXECUTION_ID_HEADER: &str = "x-elastic-aws-request-id";

/// Extra time granted to the dispatcher task after the close deadline.
const JOIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub client: ClientConfig,
    pub queue: QueueConfig,
    pub backoff: BackoffConfig,
    /// Compressed bytes after which a request is ended.
    pub api_request_size: u64,
    /// Maximum time a request stays open.
    pub api_request_time: Duration,
    /// Flush after every report.
    pub report_sync: bool,
    /// How long `close` waits for the final request.
    pub close_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
            api_request_size: 768 * 1024,
            api_request_time: Duration::from_secs(10),
            report_sync: false,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ReporterConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            compress: self.client.compress,
            max_request_size: self.api_request_size,
            max_request_time: self.api_request_time,
            server_timeout: self.client.server_timeout,
        }
    }
}

pub struct Reporter {
    config: ReporterConfig,
    producer: EventProducer,
    client: Arc<EndpointClient>,
    serializer: Arc<dyn PayloadSerializer>,
    stats: Arc<ReporterStats>,
    backoff: Arc<BackoffState>,
    progress: watch::Receiver<u64>,
    token: CancellationToken,
    /// Cancelled once the first `close` has finished.
    close_done: CancellationToken,
    dispatcher: Mutex<Option<Dispatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Reporter {
    pub fn new(
        config: ReporterConfig,
        serializer: Arc<dyn PayloadSerializer>,
    ) -> Result<Self, ReporterError> {
        let client = Arc::new(EndpointClient::new(config.client.clone())?);
        let (producer, consumer) = event_queue(&config.queue);
        let stats = Arc::new(ReporterStats::new());
        let token = CancellationToken::new();
        let backoff = Backoff::new(config.backoff, token.clone());
        let backoff_state = backoff.state();
        let (progress_tx, progress) = watch::channel(0);

        let dispatcher = Dispatcher::new(
            consumer,
            Arc::clone(&client),
            Arc::clone(&serializer),
            config.session_options(),
            Arc::clone(&stats),
            backoff,
            progress_tx,
        );

        Ok(Self {
            config,
            producer,
            client,
            serializer,
            stats,
            backoff: backoff_state,
            progress,
            token,
            close_done: CancellationToken::new(),
            dispatcher: Mutex::new(Some(dispatcher)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Installs the configured endpoints and spawns the dispatcher task.
    pub fn start(&self) -> Result<(), ReporterError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReporterError::NoRuntime)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ReporterError::Closed);
        }
        let dispatcher = self
            .dispatcher
            .lock()
            .take()
            .ok_or(ReporterError::AlreadyStarted)?;

        self.client.start();
        let task = runtime.spawn(dispatcher.run());
        *self.task.lock() = Some(task);
        info!(
            "Reporter started (queue capacity {}, {:?} when full)",
            self.producer.capacity(),
            self.producer.policy()
        );
        Ok(())
    }

    /// Queues a record. Returns `false` if it was not accepted.
    pub async fn report(&self, payload: Payload) -> bool {
        let kind = payload.kind();
        if self.closed.load(Ordering::Acquire) {
            debug!("Reporter closed, rejecting {}", kind);
            return false;
        }

        match self.producer.enqueue(Event::Record(payload)).await {
            Ok(_) => {
                if self.config.report_sync {
                    self.flush().await;
                }
                true
            }
            Err(QueueError::Full) => {
                self.stats.add_dropped(1);
                debug!("Queue full, dropping {}", kind);
                false
            }
            Err(e) => {
                debug!("Could not queue {}: {}", kind, e);
                false
            }
        }
    }

    /// Queues pre-serialized ndjson. Empty input is ignored.
    pub async fn report_bytes(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return false;
        }
        self.report(Payload::Bytes(bytes)).await
    }

    /// Queues a flush without waiting for it.
    ///
    /// Flush events are admitted even under the drop policy; `deadline`
    /// bounds the wait for a free slot.
    pub async fn request_flush(
        &self,
        deadline: Option<Instant>,
    ) -> Result<FlushHandle, ReporterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReporterError::Closed);
        }
        let ticket = FlushTicket::new();
        let sequence = self.enqueue_control(Event::Flush(ticket.clone()), deadline).await?;
        Ok(FlushHandle::new(
            sequence,
            ticket,
            self.progress.clone(),
            Arc::clone(&self.backoff),
        ))
    }

    /// Ends the current request and waits until every record queued before
    /// this call has been handled. `false` while backing off or before
    /// [`Reporter::start`].
    pub async fn flush(&self) -> bool {
        self.flush_until(None).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> bool {
        self.flush_until(Some(Instant::now() + timeout)).await
    }

    async fn flush_until(&self, deadline: Option<Instant>) -> bool {
        if self.task.lock().is_none() {
            debug!("Reporter not running, not flushing");
            return false;
        }
        if !self.backoff.is_healthy() {
            debug!("Collector currently unhealthy, not flushing");
            return false;
        }
        match self.request_flush(deadline).await {
            Ok(handle) => handle.wait(deadline).await,
            Err(e) => {
                debug!("Could not queue flush: {}", e);
                false
            }
        }
    }

    /// Ends the current request and asks the collector to flush its own
    /// buffers through the flush intake path.
    pub async fn make_flush_request(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let deadline = Instant::now() + self.config.close_timeout;
        self.enqueue_control(Event::MakeFlushRequest, Some(deadline))
            .await
            .is_ok()
    }

    async fn enqueue_control(
        &self,
        event: Event,
        deadline: Option<Instant>,
    ) -> Result<u64, QueueError> {
        match deadline {
            Some(deadline) => self.producer.enqueue_until(event, deadline).await,
            None => self.producer.enqueue_waiting(event).await,
        }
    }

    /// Flushes, stops the dispatcher and releases the open request.
    ///
    /// Later calls wait for the first one to finish; reports after close are
    /// rejected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.close_done.cancelled().await;
            return;
        }
        // Also released if this call is dropped before it completes.
        let _done = self.close_done.clone().drop_guard();
        info!("Closing reporter");
        // Wakes the dispatcher if it is sleeping in a backoff.
        self.token.cancel();

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            self.dispatcher.lock().take();
            return;
        };

        let deadline = Instant::now() + self.config.close_timeout;
        if let Err(e) = self.producer.enqueue_until(Event::Shutdown, deadline).await {
            warn!("Could not queue shutdown: {}", e);
        }
        match timeout_at(deadline + JOIN_GRACE, &mut task).await {
            Ok(Ok(())) => info!("Reporter closed"),
            Ok(Err(e)) => warn!("Event dispatcher failed: {}", e),
            Err(_) => {
                warn!("Event dispatcher did not stop in time, aborting it");
                task.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `false` while the dispatcher is backing off after collector errors.
    pub fn is_healthy(&self) -> bool {
        self.backoff.is_healthy()
    }

    pub fn reported(&self) -> u64 {
        self.stats.reported()
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.backoff.consecutive_errors())
    }

    pub fn queue_len(&self) -> usize {
        self.producer.len()
    }

    pub fn client(&self) -> &EndpointClient {
        &self.client
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.client.server_version()
    }

    /// Replaces the collector endpoints. Takes effect with the next request.
    pub fn set_endpoints(&self, urls: Vec<Url>) {
        self.client.set_endpoints(urls);
    }

    /// Registers a record that is still in progress, so the collector can
    /// report it even if the process never finishes it.
    pub async fn register_partial_record(
        &self,
        execution_id: &str,
        payload: &Payload,
    ) -> Result<u16, ReporterError> {
        let mut body = Vec::new();
        self.serializer.write_metadata(&mut body)?;
        self.serializer.write_payload(payload, &mut body)?;

        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(execution_id).map_err(|e| {
            ClientError::InvalidConfiguration(format!("Invalid execution id: {e}"))
        })?;
        headers.insert(HeaderName::from_static(EXECUTION_ID_HEADER), value);

        let status = self
            .client
            .post_oneshot(
                &self.client.paths().partial_record,
                PARTIAL_RECORD_CONTENT_TYPE,
                headers,
                Bytes::from(body),
            )
            .await?;
        Ok(status)
    }

    /// Sends pre-serialized self-monitoring data to the telemetry path.
    pub async fn send_telemetry(&self, body: Bytes) -> Result<u16, ReporterError> {
        let status = self
            .client
            .post_oneshot(
                &self.client.paths().telemetry,
                NDJSON_CONTENT_TYPE,
                HeaderMap::new(),
                body,
            )
            .await?;
        Ok(status)
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
