pub mod config;
pub mod logging_system;
pub mod shutdown;

pub use config::{Config, ConfigError, LogLevel};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging_safe};

use crate::reporter::Reporter;
use crate::sender::{Metadata, NdjsonSerializer};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Line summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub lines_read: u64,
    pub lines_rejected: u64,
    pub reported: u64,
    pub dropped: u64,
}

/// Forwards ndjson lines from an input stream to the collectors.
pub struct App {
    config: Config,
    reporter: Reporter,
    shutdown: CancellationToken,
}

impl App {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args_and_env(args)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let metadata = Metadata::detect(&config.service_name, config.service_version.as_deref());
        let serializer = Arc::new(NdjsonSerializer::new(&metadata)?);
        let reporter = Reporter::new(config.to_reporter_config()?, serializer)?;

        Ok(Self {
            config,
            reporter,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Cancelling this token stops [`App::run`] after the current line.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reports stdin until EOF or a shutdown signal, then closes the reporter.
    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let listener = shutdown::spawn_signal_listener(self.shutdown.clone());
        let summary = self.run_with_input(BufReader::new(tokio::io::stdin())).await;
        listener.abort();
        summary
    }

    pub async fn run_with_input<R>(self, input: R) -> anyhow::Result<RunSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        self.reporter.start()?;
        info!(
            "Starting {} v{} for service '{}'",
            env!("CARGO_PKG_NAME"),
            crate::VERSION,
            self.config.service_name
        );

        let mut summary = RunSummary::default();
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested, closing reporter");
                    break;
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    summary.lines_read += 1;
                    if !self.reporter.report_bytes(Bytes::copy_from_slice(line.as_bytes())).await {
                        summary.lines_rejected += 1;
                    }
                }
                Ok(None) => {
                    info!("Input closed, flushing");
                    if !self.reporter.flush_timeout(self.config.close_timeout).await {
                        warn!("Final flush did not complete");
                    }
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }

        self.reporter.close().await;
        summary.reported = self.reporter.reported();
        summary.dropped = self.reporter.dropped();
        info!(
            "Reporter stopped: {} lines read, {} reported, {} dropped",
            summary.lines_read, summary.reported, summary.dropped
        );
        Ok(summary)
    }
}

/// Binary entry point.
pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_args_and_env(std::env::args_os())?;
    if let Err(e) = setup_logging_safe(config.log_level) {
        eprintln!("Logging unavailable: {e}");
    }

    let app = App::from_config(config)?;
    let summary = app.run().await?;
    if summary.dropped > 0 {
        warn!("{} records were dropped", summary.dropped);
    }
    Ok(())
}
