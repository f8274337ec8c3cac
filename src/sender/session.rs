use super::body::BodyWriter;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, HeaderMap, HeaderValue};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};
use url::{Host, Url};

/// Chunks that may sit between the session and the connection.
const BODY_CHANNEL_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum TransmissionError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Compression failed: {0}")]
    Compression(#[from] io::Error),
    #[error("Request body closed by peer")]
    BodyClosed,
    #[error("Transmission timeout")]
    Timeout,
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub compress: bool,
    pub max_request_size: u64,
    pub max_request_time: Duration,
    pub server_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            compress: true,
            max_request_size: 768 * 1024,
            max_request_time: Duration::from_secs(10),
            server_timeout: Duration::from_secs(5),
        }
    }
}

/// How a finished request went, from the dispatcher's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success {
        status: u16,
    },
    /// 4xx below 429: the collector understood and refused. No rotation.
    ClientError {
        status: u16,
        accepted: Option<u64>,
    },
    /// Anything that suggests trying another endpoint.
    TransportFailure {
        status: Option<u16>,
        accepted: Option<u64>,
        reason: String,
    },
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, RequestOutcome::TransportFailure { .. })
    }

    /// Records the collector acknowledged on a failed request.
    pub fn accepted(&self) -> Option<u64> {
        match self {
            RequestOutcome::Success { .. } => None,
            RequestOutcome::ClientError { accepted, .. }
            | RequestOutcome::TransportFailure { accepted, .. } => *accepted,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestOutcome::Success { status } | RequestOutcome::ClientError { status, .. } => {
                Some(*status)
            }
            RequestOutcome::TransportFailure { status, .. } => *status,
        }
    }

    fn transport(reason: impl ToString) -> Self {
        RequestOutcome::TransportFailure {
            status: None,
            accepted: None,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRequest {
    pub outcome: RequestOutcome,
    pub bytes_streamed: u64,
    pub records: u64,
}

/// One open streaming POST to a collector.
///
/// The request is sent as soon as the session opens; the body is fed through
/// a channel while records arrive. Dropping the session without finishing it
/// cancels the request.
pub struct UploadSession {
    url: Url,
    writer: Option<BodyWriter>,
    body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    response: JoinHandle<reqwest::Result<Response>>,
    max_request_size: u64,
    server_timeout: Duration,
    deadline: Instant,
    bytes_streamed: u64,
    records: u64,
}

impl UploadSession {
    /// Starts the request and streams `preamble` (the metadata line) right away.
    pub async fn open(
        http: &Client,
        url: Url,
        mut headers: HeaderMap,
        preamble: &[u8],
        options: &SessionOptions,
    ) -> Result<Self, TransmissionError> {
        let compress = options.compress && !is_loopback(&url);
        if compress {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
        }

        let (body_tx, body_rx) = mpsc::channel::<io::Result<Bytes>>(BODY_CHANNEL_DEPTH);
        let body = futures::stream::unfold(body_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let request = http
            .post(url.clone())
            .headers(headers)
            .body(Body::wrap_stream(body));
        let response = tokio::spawn(request.send());

        debug!("Starting new request to {}", url);
        let mut session = Self {
            url,
            writer: Some(BodyWriter::new(compress)),
            body_tx: Some(body_tx),
            response,
            max_request_size: options.max_request_size,
            server_timeout: options.server_timeout,
            deadline: Instant::now() + options.max_request_time,
            bytes_streamed: 0,
            records: 0,
        };
        session.write(preamble).await?;
        session.flush().await?;
        Ok(session)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed
    }

    pub fn is_compressed(&self) -> bool {
        self.writer.as_ref().is_some_and(BodyWriter::is_compressed)
    }

    /// Writes one serialized record.
    pub async fn write_record(&mut self, data: &[u8]) -> Result<(), TransmissionError> {
        self.write(data).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransmissionError> {
        let writer = self.writer.as_mut().ok_or(TransmissionError::BodyClosed)?;
        writer.write_all(data)?;
        for chunk in writer.take_chunks() {
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Sends whatever is buffered, even a partial chunk.
    pub async fn flush(&mut self) -> Result<(), TransmissionError> {
        let writer = self.writer.as_mut().ok_or(TransmissionError::BodyClosed)?;
        let pending = writer.flush()?;
        if !pending.is_empty() {
            self.send_chunk(pending).await?;
        }
        Ok(())
    }

    /// Streamed plus buffered output, plus input the compressor may still
    /// hold, has reached the request size limit.
    pub fn should_flush(&self) -> bool {
        let pending = self.writer.as_ref().map_or(0, |writer| {
            writer.buffered_len() as u64 + writer.pending_input()
        });
        self.bytes_streamed + pending >= self.max_request_size
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), TransmissionError> {
        let tx = self.body_tx.as_ref().ok_or(TransmissionError::BodyClosed)?;
        let len = chunk.len() as u64;
        timeout(self.server_timeout, tx.send(Ok(chunk)))
            .await
            .map_err(|_| TransmissionError::Timeout)?
            .map_err(|_| TransmissionError::BodyClosed)?;
        self.bytes_streamed += len;
        Ok(())
    }

    /// Completes the body, waits for the response and classifies it.
    pub async fn finish(mut self) -> FinishedRequest {
        let outcome = self.complete().await;
        FinishedRequest {
            outcome,
            bytes_streamed: self.bytes_streamed,
            records: self.records,
        }
    }

    async fn complete(&mut self) -> RequestOutcome {
        if let Err(e) = self.finish_body().await {
            warn!("Failed to complete request body to {}: {}", self.url, e);
            return RequestOutcome::transport(e);
        }

        match timeout(self.server_timeout, &mut self.response).await {
            Err(_) => {
                warn!("No response from {} within {:?}", self.url, self.server_timeout);
                RequestOutcome::transport(TransmissionError::Timeout)
            }
            Ok(Err(join_error)) => RequestOutcome::transport(join_error),
            Ok(Ok(Err(e))) => {
                warn!("Error sending data to collector {}: {}", self.url, e);
                RequestOutcome::transport(e)
            }
            Ok(Ok(Ok(response))) => classify(&self.url, response, self.server_timeout).await,
        }
    }

    async fn finish_body(&mut self) -> Result<(), TransmissionError> {
        if let Some(writer) = self.writer.take() {
            let tail = writer.finish()?;
            if !tail.is_empty() {
                self.send_chunk(tail).await?;
            }
        }
        // Closing the channel ends the chunked body.
        self.body_tx = None;
        Ok(())
    }

    /// Cancels the request without waiting for a response.
    pub fn abort(self) {
        debug!("Aborting request to {}", self.url);
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // An error item makes the connection reset the body instead of
        // terminating it cleanly.
        if let Some(tx) = self.body_tx.take() {
            let _ = tx.try_send(Err(io::Error::other("request aborted")));
        }
        self.response.abort();
    }
}

async fn classify(url: &Url, response: Response, server_timeout: Duration) -> RequestOutcome {
    let status = response.status().as_u16();
    if status < 400 {
        debug!("Request to {} completed with status {}", url, status);
        return RequestOutcome::Success { status };
    }

    let body = timeout(server_timeout, response.text())
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();
    let accepted = parse_accepted(&body);

    if status == 404 {
        warn!(
            "Collector {} answered 404, it is probably too old for this reporter version",
            url
        );
    }
    if status < 429 {
        warn!("Collector {} rejected request with status {}: {}", url, status, body);
        RequestOutcome::ClientError { status, accepted }
    } else {
        warn!("Collector {} unavailable, status {}: {}", url, status, body);
        RequestOutcome::TransportFailure {
            status: Some(status),
            accepted,
            reason: format!("HTTP {status}"),
        }
    }
}

#[derive(Deserialize)]
struct IntakeResponse {
    accepted: Option<u64>,
}

pub(crate) fn parse_accepted(body: &str) -> Option<u64> {
    serde_json::from_str::<IntakeResponse>(body).ok()?.accepted
}

/// Compression is skipped for collectors on the same host.
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepted() {
        let body = r#"{"accepted":3,"errors":[{"message":"bad span"}]}"#;
        assert_eq!(parse_accepted(body), Some(3));
        assert_eq!(parse_accepted(r#"{"errors":[]}"#), None);
        assert_eq!(parse_accepted("<html>"), None);
    }

    #[test]
    fn test_loopback_detection() {
        let loopback = |s: &str| is_loopback(&Url::parse(s).unwrap());
        assert!(loopback("http://localhost:8200"));
        assert!(loopback("http://127.0.0.1:8200"));
        assert!(loopback("http://[::1]:8200"));
        assert!(!loopback("https://apm.example.com"));
        assert!(!loopback("http://10.0.0.5:8200"));
    }

    #[test]
    fn test_outcome_accessors() {
        let failure = RequestOutcome::TransportFailure {
            status: Some(503),
            accepted: Some(2),
            reason: "HTTP 503".to_string(),
        };
        assert!(failure.is_transport_failure());
        assert_eq!(failure.accepted(), Some(2));
        assert_eq!(failure.status(), Some(503));

        let success = RequestOutcome::Success { status: 202 };
        assert!(success.is_success());
        assert_eq!(success.accepted(), None);
    }
}
