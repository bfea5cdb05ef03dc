//! # sensor-ingest-adapters
//!
//! Adapter implementations for ports: the MQTT session, the `PostgreSQL` pool,
//! the supervisor bus, and the JSON logger/telemetry sinks.
//! This crate depends on `ports`, `shared`, `config`, and `domain`.

pub mod log_sink;
pub mod logger;
pub mod mqtt;
pub mod postgres;
pub mod supervisor_bus;
pub mod telemetry;

pub use log_sink::{LogSink, MemoryLogSink, StderrLogSink};
pub use logger::{JsonLogger, log_level_from_config};
pub use mqtt::{MqttSubscription, generated_client_id, mqtt_options};
pub use postgres::PostgresConnectionPool;
pub use supervisor_bus::{BroadcastSupervisorBus, BusForwardingLogger, DEFAULT_BUS_CAPACITY};
pub use telemetry::{JsonTelemetry, TaggedTelemetry};

/// Returns the adapters crate version.
#[must_use]
pub const fn adapters_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
