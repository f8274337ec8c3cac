pub mod body;
pub mod client;
pub mod endpoints;
pub mod serialization;
pub mod session;
pub mod stats;

pub use body::{BodyWriter, CHUNK_SIZE};
pub use client::{
    ClientConfig, ClientError, EndpointClient, IntakePaths, NDJSON_CONTENT_TYPE, append_path,
    escape_header_comment, user_agent,
};
pub use endpoints::EndpointRegistry;
pub use serialization::{Metadata, NdjsonSerializer, PayloadSerializer, SerializationError};
pub use session::{
    FinishedRequest, RequestOutcome, SessionOptions, TransmissionError, UploadSession,
    is_loopback,
};
pub use stats::{ReporterStats, StatsSnapshot};
