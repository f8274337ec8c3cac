//! Domain layer for telemetry-reporter.
//!
//! Contains the canonical types shared across all modules:
//! - `Event`: what travels through the queue to the dispatcher
//! - `Payload` / `Record`: opaque handles to the reported telemetry
//! - `ReporterError`: Top-level error type

pub mod error;
pub mod event;

pub use error::ReporterError;
pub use event::{Event, EventKind, FlushTicket, Payload, Record};
