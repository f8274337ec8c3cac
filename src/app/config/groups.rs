use crate::sender::IntakePaths;
use serde::{Deserialize, Serialize};

/// Collector paths, appended to every server URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub events: String,
    pub flush_events: String,
    pub telemetry: String,
    pub partial_record: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let paths = IntakePaths::default();
        Self {
            events: paths.events,
            flush_events: paths.flush_events,
            telemetry: paths.telemetry,
            partial_record: paths.partial_record,
        }
    }
}

impl From<PathsConfig> for IntakePaths {
    fn from(paths: PathsConfig) -> Self {
        IntakePaths {
            events: paths.events,
            flush_events: paths.flush_events,
            telemetry: paths.telemetry,
            partial_record: paths.partial_record,
        }
    }
}
