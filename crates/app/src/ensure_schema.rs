//! Optional startup bootstrap of the metric table.

use sensor_ingest_domain::TableName;
use sensor_ingest_ports::{ConnectionPoolPort, LogEvent, LogFields, LogLevel, LoggerPort, SchemaStatus};
use sensor_ingest_shared::{RequestContext, Result, timeout_with_context};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Dependencies required by ensure-schema.
#[derive(Clone)]
pub struct EnsureSchemaDeps {
    /// Store connection pool.
    pub pool: Arc<dyn ConnectionPoolPort>,
    /// Table to create.
    pub table: TableName,
    /// Bound on the whole bootstrap.
    pub timeout: Duration,
    /// Optional logger.
    pub logger: Option<Arc<dyn LoggerPort>>,
}

/// Create the table if missing and try to make it a hypertable.
///
/// A failed hypertable conversion is a warning; a failed create is an error.
/// Neither is fatal to the caller, which keeps serving either way.
pub async fn ensure_schema(ctx: &RequestContext, deps: &EnsureSchemaDeps) -> Result<SchemaStatus> {
    let result = timeout_with_context(
        ctx,
        deps.timeout,
        "store.ensure_schema",
        deps.pool.ensure_schema(ctx, &deps.table),
    )
    .await;

    let Some(logger) = deps.logger.as_ref() else {
        return result;
    };
    let mut fields = LogFields::new();
    fields.insert("table".into(), Value::String(deps.table.to_string()));

    match &result {
        Ok(SchemaStatus::Hypertable) => {
            logger.info("store.schema.ready", "metric hypertable ready", Some(fields));
        },
        Ok(SchemaStatus::PlainTable { reason }) => {
            fields.insert("reason".into(), Value::String(reason.to_string()));
            logger.warn(
                "store.schema.hypertable_failed",
                "table ready, but hypertable conversion failed",
                Some(fields),
            );
        },
        Err(error) => {
            let mut event = LogEvent::new(
                LogLevel::Error,
                "store.schema.failed",
                "could not create the metric table",
                Some(fields),
            );
            if let Ok(value) = serde_json::to_value(error) {
                event = event.with_error(value);
            }
            logger.log(event);
        },
    }
    result
}
