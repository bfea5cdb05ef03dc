//! Logger, telemetry, and supervisor bus wiring for the service.

use sensor_ingest_adapters::{
    BroadcastSupervisorBus, BusForwardingLogger, JsonLogger, JsonTelemetry, LogSink,
};
use sensor_ingest_config::ValidatedIngestConfig;
use sensor_ingest_ports::{LogFields, LoggerPort, SupervisorBusPort, TelemetryPort, TelemetryTags};
use sensor_ingest_shared::RequestContext;
use serde_json::Value;
use std::sync::Arc;

/// Service name attached to every log line and metric.
pub const SERVICE_NAME: &str = "sensor-ingest";

/// Observability handles shared by every component of one service run.
#[derive(Clone)]
pub struct Observability {
    /// Logger for use cases and adapters; error events also reach the bus.
    pub logger: Arc<dyn LoggerPort>,
    /// Logger that writes only to the sink (used by the bus listener).
    pub direct_logger: Arc<dyn LoggerPort>,
    /// Optional metric sink.
    pub telemetry: Option<Arc<dyn TelemetryPort>>,
    /// Process-health bus.
    pub bus: Arc<dyn SupervisorBusPort>,
}

/// Build observability from config, writing to `sink`.
pub fn build_observability(config: &ValidatedIngestConfig, sink: &Arc<dyn LogSink>) -> Observability {
    let bus: Arc<dyn SupervisorBusPort> = Arc::new(BroadcastSupervisorBus::default());

    let mut base_fields = LogFields::new();
    base_fields.insert("service".into(), Value::String(SERVICE_NAME.to_owned()));
    let direct_logger: Arc<dyn LoggerPort> = Arc::new(
        JsonLogger::from_config(Arc::clone(sink), &config.logging).with_base_fields(base_fields),
    );
    let logger: Arc<dyn LoggerPort> = Arc::new(BusForwardingLogger::new(
        Arc::clone(&direct_logger),
        Arc::clone(&bus),
    ));

    let telemetry: Option<Arc<dyn TelemetryPort>> = if config.telemetry.enabled {
        let mut tags = TelemetryTags::new();
        tags.insert("service".into(), SERVICE_NAME.into());
        Some(Arc::new(JsonTelemetry::new(Arc::clone(sink)).with_base_tags(tags)))
    } else {
        None
    };

    Observability {
        logger,
        direct_logger,
        telemetry,
        bus,
    }
}

/// Child logger carrying the run's correlation id.
pub fn scope_logger(logger: &Arc<dyn LoggerPort>, ctx: &RequestContext) -> Arc<dyn LoggerPort> {
    let mut fields = LogFields::new();
    fields.insert(
        "runId".into(),
        Value::String(ctx.correlation_id().as_str().to_owned()),
    );
    Arc::from(logger.child(fields))
}
