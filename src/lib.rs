#![deny(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Durations and sizes stay far below the limits
    clippy::cast_possible_wrap,       // Jitter math on small millisecond values
    clippy::cast_precision_loss,      // Acceptable for ratios
    clippy::cast_sign_loss,           // Clamped to non-negative before casting
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. QueueError in buffer module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

pub mod app;
pub mod buffer;
pub mod domain;
pub mod reliability;
pub mod reporter;
pub mod sender;

// Re-export main types for easy access
pub use app::{App, Config};
pub use domain::{Event, EventKind, Payload, Record, ReporterError};
pub use reporter::{FlushHandle, Reporter, ReporterConfig};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
