use crate::domain::Payload;
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Payload is empty")]
    EmptyPayload,
}

/// Renders records into the intake wire format.
///
/// Both methods append to `out`; a failed call may leave partial output
/// behind, so callers serialize into scratch space first.
#[cfg_attr(test, automock)]
pub trait PayloadSerializer: Send + Sync {
    /// The metadata line that opens every request body.
    fn write_metadata(&self, out: &mut Vec<u8>) -> Result<(), SerializationError>;

    fn write_payload(&self, payload: &Payload, out: &mut Vec<u8>) -> Result<(), SerializationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetadata {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub agent: AgentMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetadata {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub service: ServiceMetadata,
    pub process: ProcessMetadata,
    pub system: SystemMetadata,
}

impl Metadata {
    pub fn detect(service_name: &str, service_version: Option<&str>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());
        Self {
            service: ServiceMetadata {
                name: service_name.to_string(),
                version: service_version.map(str::to_string),
                agent: AgentMetadata {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: crate::VERSION.to_string(),
                },
            },
            process: ProcessMetadata {
                pid: std::process::id(),
            },
            system: SystemMetadata { hostname },
        }
    }
}

#[derive(Serialize)]
struct MetadataLine<'a> {
    metadata: &'a Metadata,
}

/// Newline-delimited JSON, one `{"<kind>": {...}}` object per record.
#[derive(Debug, Clone)]
pub struct NdjsonSerializer {
    metadata_line: Vec<u8>,
}

impl NdjsonSerializer {
    pub fn new(metadata: &Metadata) -> Result<Self, SerializationError> {
        let mut metadata_line = serde_json::to_vec(&MetadataLine { metadata })?;
        metadata_line.push(b'\n');
        Ok(Self { metadata_line })
    }

    fn write_record(
        out: &mut Vec<u8>,
        key: &str,
        record: &dyn crate::domain::Record,
    ) -> Result<(), SerializationError> {
        let value = record.to_json()?;
        write!(out, "{{\"{key}\":")?;
        serde_json::to_writer(&mut *out, &value)?;
        out.write_all(b"}\n")?;
        Ok(())
    }

    fn write_raw(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), SerializationError> {
        if bytes.is_empty() {
            return Err(SerializationError::EmptyPayload);
        }
        out.write_all(bytes)?;
        if !bytes.ends_with(b"\n") {
            out.push(b'\n');
        }
        Ok(())
    }
}

impl PayloadSerializer for NdjsonSerializer {
    fn write_metadata(&self, out: &mut Vec<u8>) -> Result<(), SerializationError> {
        out.extend_from_slice(&self.metadata_line);
        Ok(())
    }

    fn write_payload(&self, payload: &Payload, out: &mut Vec<u8>) -> Result<(), SerializationError> {
        match payload {
            Payload::Transaction(record) => Self::write_record(out, "transaction", record.as_ref()),
            Payload::Span(record) => Self::write_record(out, "span", record.as_ref()),
            Payload::Error(record) => Self::write_record(out, "error", record.as_ref()),
            Payload::Metrics(bytes) | Payload::Bytes(bytes) => Self::write_raw(out, bytes),
        }
    }
}
