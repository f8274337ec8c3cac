pub mod error;
pub mod metrics;
pub mod queue;

pub use error::QueueError;
pub use metrics::{QueueMetrics, QueueMetricsCollector};
pub use queue::{
    AdmissionPolicy, EventConsumer, EventProducer, QueueConfig, Sequenced, event_queue,
};
