use super::{Config, ConfigError};

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_urls.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one server URL is required".to_string(),
            ));
        }
        for url in self.parsed_server_urls()? {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUrl(format!(
                    "Unsupported scheme in server URL '{url}'"
                )));
            }
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max queue size must be greater than 0".to_string(),
            ));
        }
        if self.api_request_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "API request size must be greater than 0".to_string(),
            ));
        }
        if self.api_request_time_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "API request time must be greater than 0".to_string(),
            ));
        }
        if self.server_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Server timeout must be greater than 0".to_string(),
            ));
        }

        if self.service_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Service name must not be empty".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigError::InvalidConfig(format!(
                "Backoff jitter ratio must be in [0, 1), got {}",
                self.backoff.jitter_ratio
            )));
        }

        for (name, path) in [
            ("events", &self.paths.events),
            ("flush_events", &self.paths.flush_events),
            ("telemetry", &self.paths.telemetry),
            ("partial_record", &self.paths.partial_record),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidConfig(format!(
                    "Path '{name}' must start with '/', got '{path}'"
                )));
            }
        }

        Ok(())
    }
}
