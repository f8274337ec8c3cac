use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid server version '{0}'")]
pub struct VersionParseError(pub String);

/// Collector version as reported by the endpoint root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ServerVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "8.1.0-SNAPSHOT" and "7.9" are both accepted.
        let core = s.trim().split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = || -> Result<u32, VersionParseError> {
            match parts.next() {
                None => Ok(0),
                Some(part) => part.parse().map_err(|_| VersionParseError(s.to_string())),
            }
        };
        Ok(Self::new(next()?, next()?, next()?))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Deserialize)]
struct ServerInfo {
    version: Option<String>,
}

/// Extracts the version from a health probe response body.
pub fn parse_server_info(body: &str) -> Option<ServerVersion> {
    let info: ServerInfo = serde_json::from_str(body).ok()?;
    info.version?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointHealth {
    Available(Option<ServerVersion>),
    Unavailable(String),
}

/// Lowest collector version seen across all probed endpoints.
#[derive(Debug, Default)]
pub struct VersionTracker {
    lowest: RwLock<Option<ServerVersion>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, version: ServerVersion) {
        let mut lowest = self.lowest.write();
        match *lowest {
            Some(current) if current <= version => {}
            _ => *lowest = Some(version),
        }
    }

    pub fn clear(&self) {
        *self.lowest.write() = None;
    }

    pub fn get(&self) -> Option<ServerVersion> {
        *self.lowest.read()
    }

    /// `false` while the version is unknown.
    pub fn is_at_least(&self, version: ServerVersion) -> bool {
        self.get().is_some_and(|lowest| lowest >= version)
    }
}
