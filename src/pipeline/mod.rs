//! Forwarding pipeline: ingestion fans inbound messages out into a bounded
//! queue that a fixed pool of workers drains through the rate limiter.

pub mod ingest;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod worker;

pub use ingest::IngestHandler;
pub use queue::{Claimed, DeliveryItem, ForwardQueue};
pub use retry::RetryPolicy;
pub use stats::{PipelineSnapshot, PipelineStats};
pub use worker::{DeliveryContext, WorkerConfig, WorkerPool};
