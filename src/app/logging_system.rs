use super::config::LogLevel;
use parking_lot::RwLock;
use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },
    #[error("Failed to initialize tracing: {0}")]
    InitFailed(String),
}

/// Crates whose debug output drowns the reporter's own.
const QUIET_TARGETS: &[(&str, LogLevel)] = &[
    ("hyper", LogLevel::Warn),
    ("hyper_util", LogLevel::Warn),
    ("reqwest", LogLevel::Warn),
    ("h2", LogLevel::Warn),
    ("rustls", LogLevel::Warn),
];

/// Builds the `EnvFilter` for the global subscriber.
pub struct LoggingSystem {
    directives: RwLock<Vec<String>>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: RwLock::new(Vec::new()),
        }
    }

    /// Adds a `target=level` directive. Malformed directives are rejected.
    pub fn add_directive(&self, directive: &str) -> Result<(), LoggingError> {
        let trimmed = directive.trim();
        if trimmed.is_empty() || trimmed.starts_with('=') {
            return Err(LoggingError::InvalidDirective {
                directive: directive.to_string(),
                reason: "missing target".to_string(),
            });
        }
        trimmed
            .parse::<Directive>()
            .map_err(|e| LoggingError::InvalidDirective {
                directive: directive.to_string(),
                reason: e.to_string(),
            })?;

        self.directives.write().push(trimmed.to_string());
        Ok(())
    }

    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for (target, level) in QUIET_TARGETS {
            directives.push(format!("{}={}", target, level.as_str()));
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        std::iter::once(default_level.as_str().to_string())
            .chain(directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }

    /// Installs the global subscriber. `RUST_LOG`, when set, wins over the
    /// configured level.
    pub fn initialize_tracing(&self, default_level: LogLevel) -> Result<(), LoggingError> {
        let filter_string = self.build_filter_string(default_level);
        let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(from_env) if !from_env.trim().is_empty() => EnvFilter::try_new(from_env),
            _ => EnvFilter::try_new(&filter_string),
        }
        .map_err(|e| LoggingError::InitFailed(format!("bad filter '{filter_string}': {e}")))?;

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        );

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::InitFailed(e.to_string()))
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes logging once per process. Later calls return the first
/// outcome.
pub fn setup_logging_safe(level: LogLevel) -> Result<(), LoggingError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    INIT.get_or_init(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        logging_system
            .initialize_tracing(level)
            .map_err(|e| e.to_string())
    })
    .clone()
    .map_err(LoggingError::InitFailed)
}
