use super::groups::PathsConfig;
use super::serde_helpers::{load_env_list, load_env_string, load_env_string_opt, load_env_var};
use super::{ConfigError, LogLevel};
use crate::buffer::{AdmissionPolicy, QueueConfig};
use crate::reliability::BackoffConfig;
use crate::reporter::ReporterConfig;
use crate::sender::ClientConfig;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Inline TOML used as the base configuration when set.
pub const INLINE_CONFIG_ENV: &str = "REPORTER_CONFIG";

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Collector URLs, comma separated
    #[arg(
        long = "server-url",
        env = "REPORTER_SERVER_URLS",
        value_delimiter = ',',
        default_value = "http://localhost:8200"
    )]
    pub server_urls: Vec<String>,

    /// Timeout for connecting and for each collector response, in milliseconds
    #[arg(long, env = "REPORTER_SERVER_TIMEOUT_MS", default_value = "5000")]
    pub server_timeout_ms: u64,

    /// Maximum number of queued events (rounded up to a power of two)
    #[arg(long, env = "REPORTER_MAX_QUEUE_SIZE", default_value = "512")]
    pub max_queue_size: usize,

    /// Compressed bytes after which a request is ended
    #[arg(long, env = "REPORTER_API_REQUEST_SIZE", default_value = "786432")]
    pub api_request_size: u64,

    /// Maximum time a request stays open, in milliseconds
    #[arg(long, env = "REPORTER_API_REQUEST_TIME_MS", default_value = "10000")]
    pub api_request_time_ms: u64,

    /// Verify the collector's TLS certificate
    #[arg(
        long,
        env = "REPORTER_VERIFY_SERVER_CERT",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub verify_server_cert: bool,

    /// Secret token sent as a bearer token
    #[arg(long, env = "REPORTER_SECRET_TOKEN", hide_env_values = true)]
    pub secret_token: Option<String>,

    /// API key, takes precedence over the secret token
    #[arg(long, env = "REPORTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Wait for a flush after every report
    #[arg(long, env = "REPORTER_REPORT_SYNC")]
    pub report_sync: bool,

    /// Drop events instead of waiting when the queue is full
    #[arg(long, env = "REPORTER_DROP_EVENTS_IF_QUEUE_FULL")]
    pub drop_events_if_queue_full: bool,

    /// Compress request bodies (never applied to loopback collectors)
    #[arg(
        long,
        env = "REPORTER_COMPRESS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub compress: bool,

    /// How long close waits for the final request, in milliseconds
    #[arg(long, env = "REPORTER_CLOSE_TIMEOUT_MS", default_value = "5000")]
    pub close_timeout_ms: u64,

    /// Service name reported in the metadata
    #[arg(long, env = "REPORTER_SERVICE_NAME", default_value = "unknown-service")]
    pub service_name: String,

    /// Service version reported in the metadata
    #[arg(long, env = "REPORTER_SERVICE_VERSION")]
    pub service_version: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (optional)
    #[arg(long, env = "REPORTER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Collector paths (file or inline TOML only)
    #[arg(skip)]
    pub paths: PathsConfig,

    /// Backoff tuning (file or inline TOML only)
    #[arg(skip)]
    pub backoff: BackoffConfig,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub server_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub api_request_time: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_urls: vec!["http://localhost:8200".to_string()],
            server_timeout_ms: 5000,
            max_queue_size: 512,
            api_request_size: 768 * 1024,
            api_request_time_ms: 10_000,
            verify_server_cert: true,
            secret_token: None,
            api_key: None,
            report_sync: false,
            drop_events_if_queue_full: false,
            compress: true,
            close_timeout_ms: 5000,
            service_name: "unknown-service".to_string(),
            service_version: None,
            log_level: LogLevel::Info,
            config_file: None,
            paths: PathsConfig::default(),
            backoff: BackoffConfig::default(),
            server_timeout: Duration::from_millis(5000),
            api_request_time: Duration::from_millis(10_000),
            close_timeout: Duration::from_millis(5000),
        }
    }
}

/// Takes `base`'s value for every listed field the CLI left at its default.
macro_rules! merge_unset {
    ($config:expr, $base:expr, $defaults:expr, [$($field:ident),* $(,)?]) => {
        $(
            if $config.$field == $defaults.$field && $base.$field != $defaults.$field {
                $config.$field = $base.$field.clone();
            }
        )*
    };
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(inline) = std::env::var(INLINE_CONFIG_ENV) {
            return Self::from_toml_str(&inline);
        }

        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI arguments (with their env fallbacks) on top of a base taken from
    /// the config file or the inline TOML variable.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);

        let base = if let Some(path) = &config.config_file {
            Some(Self::read_file(path)?)
        } else if let Ok(inline) = std::env::var(INLINE_CONFIG_ENV) {
            Some(toml::from_str::<Config>(&inline)?)
        } else {
            None
        };

        if let Some(base) = base {
            let defaults = Config::default();
            merge_unset!(
                config,
                base,
                defaults,
                [
                    server_urls,
                    server_timeout_ms,
                    max_queue_size,
                    api_request_size,
                    api_request_time_ms,
                    verify_server_cert,
                    secret_token,
                    api_key,
                    report_sync,
                    drop_events_if_queue_full,
                    compress,
                    close_timeout_ms,
                    service_name,
                    service_version,
                    log_level,
                ]
            );
            config.paths = base.paths;
            config.backoff = base.backoff;
        }

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path.as_ref())?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        load_env_list("REPORTER_SERVER_URLS", &mut self.server_urls);
        load_env_var("REPORTER_SERVER_TIMEOUT_MS", &mut self.server_timeout_ms)?;
        load_env_var("REPORTER_MAX_QUEUE_SIZE", &mut self.max_queue_size)?;
        load_env_var("REPORTER_API_REQUEST_SIZE", &mut self.api_request_size)?;
        load_env_var("REPORTER_API_REQUEST_TIME_MS", &mut self.api_request_time_ms)?;
        load_env_var("REPORTER_VERIFY_SERVER_CERT", &mut self.verify_server_cert)?;
        load_env_string_opt("REPORTER_SECRET_TOKEN", &mut self.secret_token);
        load_env_string_opt("REPORTER_API_KEY", &mut self.api_key);
        load_env_var("REPORTER_REPORT_SYNC", &mut self.report_sync)?;
        load_env_var(
            "REPORTER_DROP_EVENTS_IF_QUEUE_FULL",
            &mut self.drop_events_if_queue_full,
        )?;
        load_env_var("REPORTER_COMPRESS", &mut self.compress)?;
        load_env_var("REPORTER_CLOSE_TIMEOUT_MS", &mut self.close_timeout_ms)?;
        load_env_string("REPORTER_SERVICE_NAME", &mut self.service_name);
        load_env_string_opt("REPORTER_SERVICE_VERSION", &mut self.service_version);
        load_env_var("LOG_LEVEL", &mut self.log_level)?;
        Ok(())
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.server_timeout = Duration::from_millis(self.server_timeout_ms);
        self.api_request_time = Duration::from_millis(self.api_request_time_ms);
        self.close_timeout = Duration::from_millis(self.close_timeout_ms);
        self.server_urls.retain(|url| !url.trim().is_empty());
        Ok(())
    }

    pub fn parsed_server_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.server_urls
            .iter()
            .map(|raw| {
                Url::parse(raw.trim())
                    .map_err(|e| ConfigError::InvalidUrl(format!("Invalid server URL '{raw}': {e}")))
            })
            .collect()
    }

    pub fn to_reporter_config(&self) -> Result<ReporterConfig, ConfigError> {
        Ok(ReporterConfig {
            client: ClientConfig {
                server_urls: self.parsed_server_urls()?,
                server_timeout: self.server_timeout,
                verify_server_cert: self.verify_server_cert,
                secret_token: self.secret_token.clone(),
                api_key: self.api_key.clone(),
                service_name: self.service_name.clone(),
                service_version: self.service_version.clone(),
                compress: self.compress,
                paths: self.paths.clone().into(),
            },
            queue: QueueConfig {
                max_queue_size: self.max_queue_size,
                policy: AdmissionPolicy::from_drop_flag(self.drop_events_if_queue_full),
            },
            backoff: self.backoff,
            api_request_size: self.api_request_size,
            api_request_time: self.api_request_time,
            report_sync: self.report_sync,
            close_timeout: self.close_timeout,
        })
    }
}
