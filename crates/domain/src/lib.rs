//! # sensor-ingest-domain
//!
//! Domain model for the ingest pipeline:
//!
//! - **Metric** - `MetricRecord`, `MetricTime`
//! - **Topic** - `TopicFilter` with MQTT wildcard matching
//! - **Table** - `TableName`, a store identifier that is safe to quote into SQL
//!
//! ## Dependency Rules
//!
//! - Depends only on `shared` crate
//! - No infrastructure or adapter dependencies
//! - Pure domain logic with no I/O

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub use sensor_ingest_shared::shared_crate_version;

pub mod metric;
pub mod table;
pub mod topic;

pub use metric::{EPOCH_MILLIS_THRESHOLD, MetricRecord, MetricTime};
pub use table::{DEFAULT_TABLE_NAME, MAX_IDENTIFIER_LEN, TableName, TableNameError};
pub use topic::{DEFAULT_TOPIC_FILTER, TopicFilter, TopicFilterError};

/// Returns the domain crate version.
#[must_use]
pub const fn domain_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
