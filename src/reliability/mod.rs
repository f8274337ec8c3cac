pub mod backoff;
pub mod health;

pub use backoff::{Backoff, BackoffConfig, BackoffState, Interrupted};
pub use health::{
    EndpointHealth, ServerVersion, VersionParseError, VersionTracker, parse_server_info,
};
