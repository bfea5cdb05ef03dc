//! # sensor-ingest-ports
//!
//! Port traits for the sensor-ingest hexagonal architecture.
//!
//! This crate defines the interfaces between the ingest use cases and the
//! broker, store, and observability adapters. It depends only on `domain` and
//! `shared`.

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by port traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Returns the ports crate version.
#[must_use]
pub const fn ports_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub mod logger;
pub mod metric_store;
pub mod subscription;
pub mod supervisor;
pub mod telemetry;

pub use logger::*;
pub use metric_store::*;
pub use subscription::*;
pub use supervisor::*;
pub use telemetry::*;

// Re-export domain types used in port signatures, so adapter crates can
// implement ports without directly depending on `sensor-ingest-domain`.
pub use sensor_ingest_domain::{MetricRecord, MetricTime, TableName, TopicFilter};
