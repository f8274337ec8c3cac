use super::endpoints::EndpointRegistry;
use super::session::{SessionOptions, TransmissionError, UploadSession};
use crate::reliability::{EndpointHealth, ServerVersion, VersionTracker, parse_server_info};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("No collector endpoint configured")]
    NoEndpoint,
    #[error("Request timeout: {0}")]
    RequestTimeout(String),
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Collector paths, relative to each endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakePaths {
    pub events: String,
    pub flush_events: String,
    pub telemetry: String,
    pub partial_record: String,
}

impl Default for IntakePaths {
    fn default() -> Self {
        Self {
            events: "/intake/v2/events".to_string(),
            flush_events: "/intake/v2/events?flushed=true".to_string(),
            telemetry: "/telemetry".to_string(),
            partial_record: "/register/transaction".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_urls: Vec<Url>,
    pub server_timeout: Duration,
    pub verify_server_cert: bool,
    pub secret_token: Option<String>,
    pub api_key: Option<String>,
    pub service_name: String,
    pub service_version: Option<String>,
    pub compress: bool,
    pub paths: IntakePaths,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_urls: Vec::new(),
            server_timeout: Duration::from_secs(5),
            verify_server_cert: true,
            secret_token: None,
            api_key: None,
            service_name: String::new(),
            service_version: None,
            compress: true,
            paths: IntakePaths::default(),
        }
    }
}

/// HTTP access to the configured collectors.
///
/// Owns the endpoint registry and the shared connection pool. Streaming
/// uploads go through [`EndpointClient::open_session`]; one-shot requests go
/// through [`EndpointClient::execute`], which walks the endpoints in priority
/// order until one succeeds.
pub struct EndpointClient {
    http: Client,
    config: ClientConfig,
    registry: Arc<EndpointRegistry>,
    base_headers: HeaderMap,
    user_agent: String,
    versions: Arc<VersionTracker>,
}

impl EndpointClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let user_agent = user_agent(&config.service_name, config.service_version.as_deref());

        // Only the connect phase gets a client-wide timeout: uploads stay
        // open for the whole request window.
        let http = ClientBuilder::new()
            .connect_timeout(config.server_timeout)
            .danger_accept_invalid_certs(!config.verify_server_cert)
            .user_agent(&user_agent)
            .build()
            .map_err(|e| {
                ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        let base_headers = base_headers(&config)?;

        Ok(Self {
            http,
            config,
            registry: Arc::new(EndpointRegistry::new()),
            base_headers,
            user_agent,
            versions: Arc::new(VersionTracker::new()),
        })
    }

    /// Installs the configured endpoints and probes them in the background.
    pub fn start(&self) {
        self.set_endpoints(self.config.server_urls.clone());
    }

    pub fn set_endpoints(&self, urls: Vec<Url>) {
        info!("Using collector endpoints: {:?}", urls.iter().map(Url::as_str).collect::<Vec<_>>());
        self.registry.set_endpoints(urls);
        if tokio::runtime::Handle::try_current().is_ok() {
            self.spawn_health_probe();
        } else {
            debug!("No runtime available, skipping collector health probe");
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn paths(&self) -> &IntakePaths {
        &self.config.paths
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.versions.get()
    }

    pub fn is_at_least(&self, version: ServerVersion) -> bool {
        self.versions.is_at_least(version)
    }

    pub fn headers(&self, content_type: &'static str) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    /// Opens a streaming upload to `path` on `endpoint`.
    pub async fn open_session(
        &self,
        endpoint: &Url,
        path: &str,
        preamble: &[u8],
        options: &SessionOptions,
    ) -> Result<UploadSession, TransmissionError> {
        let url = append_path(endpoint, path);
        let headers = self.headers(NDJSON_CONTENT_TYPE);
        UploadSession::open(&self.http, url, headers, preamble, options).await
    }

    /// Runs `handler` against each endpoint in priority order until one
    /// succeeds, rotating the registry on every failure. Returns the last
    /// error if all of them fail.
    pub async fn execute<T, F, Fut>(&self, path: &str, handler: F) -> Result<T, ClientError>
    where
        F: Fn(Client, Url) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let endpoints = self.registry.prioritized_list();
        let mut expected = Some(self.registry.error_count());
        let mut last_error = None;

        for endpoint in endpoints {
            let url = append_path(&endpoint, path);
            match handler(self.http.clone(), url.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!("Request to {} failed: {}", url, e);
                    // Once another caller has rotated, stop counting.
                    expected = expected.and_then(|count| self.registry.increment_error_count(count));
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(ClientError::NoEndpoint))
    }

    /// Runs `handler` against every endpoint and keeps the successful results.
    pub async fn execute_for_all_urls<T, F, Fut>(&self, path: &str, handler: F) -> Vec<T>
    where
        F: Fn(Client, Url) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let endpoints = self.registry.endpoints();
        let mut results = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            let url = append_path(endpoint, path);
            match handler(self.http.clone(), url.clone()).await {
                Ok(result) => results.push(result),
                Err(e) => debug!("Request to {} failed: {}", url, e),
            }
        }
        results
    }

    /// POSTs a complete body through [`EndpointClient::execute`].
    pub async fn post_oneshot(
        &self,
        path: &str,
        content_type: &'static str,
        extra_headers: HeaderMap,
        body: Bytes,
    ) -> Result<u16, ClientError> {
        let mut headers = self.headers(content_type);
        headers.extend(extra_headers);
        let server_timeout = self.config.server_timeout;

        self.execute(path, |http, url| {
            let headers = headers.clone();
            let body = body.clone();
            async move {
                let target = url.to_string();
                let response = timeout(
                    server_timeout,
                    http.post(url).headers(headers).body(body).send(),
                )
                .await
                .map_err(|_| ClientError::RequestTimeout(target))??;

                let status = response.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else {
                    Err(ClientError::HttpError {
                        status: status.as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    })
                }
            }
        })
        .await
    }

    /// Probes every installed endpoint and records the lowest collector version.
    pub fn spawn_health_probe(&self) -> JoinHandle<Option<ServerVersion>> {
        let http = self.http.clone();
        let headers = self.base_headers.clone();
        let endpoints = self.registry.endpoints();
        let versions = Arc::clone(&self.versions);
        let server_timeout = self.config.server_timeout;

        tokio::spawn(async move {
            versions.clear();
            for endpoint in endpoints.iter() {
                match probe_endpoint(&http, endpoint, headers.clone(), server_timeout).await {
                    EndpointHealth::Available(Some(version)) => {
                        debug!("Collector {} is available, version {}", endpoint, version);
                        versions.record(version);
                    }
                    EndpointHealth::Available(None) => {
                        debug!("Collector {} is available, version unknown", endpoint);
                    }
                    EndpointHealth::Unavailable(reason) => {
                        warn!("Collector {} is not available: {}", endpoint, reason);
                    }
                }
            }
            versions.get()
        })
    }
}

/// GET on the endpoint root. Any 2xx counts as available.
pub async fn probe_endpoint(
    http: &Client,
    endpoint: &Url,
    headers: HeaderMap,
    server_timeout: Duration,
) -> EndpointHealth {
    let request = http.get(endpoint.clone()).headers(headers).send();
    let response = match timeout(server_timeout, request).await {
        Err(_) => return EndpointHealth::Unavailable("health check timed out".to_string()),
        Ok(Err(e)) => return EndpointHealth::Unavailable(e.to_string()),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        return EndpointHealth::Unavailable(format!("HTTP {status}"));
    }
    let body = timeout(server_timeout, response.text())
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();
    EndpointHealth::Available(parse_server_info(&body))
}

fn base_headers(config: &ClientConfig) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let authorization = match (&config.api_key, &config.secret_token) {
        (Some(api_key), _) if !api_key.is_empty() => Some(format!("ApiKey {api_key}")),
        (_, Some(token)) if !token.is_empty() => Some(format!("Bearer {token}")),
        _ => None,
    };
    if let Some(value) = authorization {
        let mut value = HeaderValue::from_str(&value).map_err(|e| {
            ClientError::InvalidConfiguration(format!("Invalid authorization value: {e}"))
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// `<agent>/<version> (<service> <service version>)`
pub fn user_agent(service_name: &str, service_version: Option<&str>) -> String {
    let mut agent = format!("{}/{}", env!("CARGO_PKG_NAME"), crate::VERSION);
    if !service_name.is_empty() {
        agent.push_str(" (");
        agent.push_str(&escape_header_comment(service_name));
        if let Some(version) = service_version.filter(|v| !v.is_empty()) {
            agent.push(' ');
            agent.push_str(&escape_header_comment(version));
        }
        agent.push(')');
    }
    agent
}

/// Replaces characters that are not allowed inside an HTTP header comment.
pub fn escape_header_comment(value: &str) -> String {
    value
        .chars()
        .map(|c| match c as u32 {
            0x09 | 0x20..=0x27 | 0x2a..=0x5b | 0x5d..=0x7e | 0x80..=0xff => c,
            _ => '_',
        })
        .collect()
}

/// Appends `path` (optionally carrying a query) to the endpoint's own path.
pub fn append_path(base: &Url, path: &str) -> Url {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    url
}
