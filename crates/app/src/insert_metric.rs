//! Persist one metric record with a per-call connection lease.
//!
//! Every failure ends the attempt for this record: it is logged, counted, and
//! returned to the caller, which drops it. Nothing is retried.

use sensor_ingest_domain::{MetricRecord, TableName};
use sensor_ingest_ports::{
    ConnectionLease, ConnectionPoolPort, LogEvent, LogFields, LogLevel, LoggerPort, TelemetryPort,
    TelemetryTags,
};
use sensor_ingest_shared::{ErrorEnvelope, RequestContext, timeout_with_context};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Timeouts and commit mode for store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSettings {
    /// Bound on connection acquisition.
    pub acquire_timeout: Duration,
    /// Bound on each statement round trip.
    pub statement_timeout: Duration,
    /// Wrap the insert in `BEGIN`/`COMMIT`.
    pub transactional: bool,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(3_000),
            statement_timeout: Duration::from_millis(5_000),
            transactional: false,
        }
    }
}

/// Dependencies required by insert-metric.
#[derive(Clone)]
pub struct InsertMetricDeps {
    /// Store connection pool.
    pub pool: Arc<dyn ConnectionPoolPort>,
    /// Target table.
    pub table: TableName,
    /// Timeouts and commit mode.
    pub settings: WriteSettings,
    /// Optional logger.
    pub logger: Option<Arc<dyn LoggerPort>>,
    /// Optional telemetry sink.
    pub telemetry: Option<Arc<dyn TelemetryPort>>,
}

/// How the insert was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Autocommit connection; nothing to commit.
    Autocommit,
    /// Explicit transaction committed.
    Committed,
    /// Explicit commit failed. Logged and counted as a failed write, but
    /// returned as `Ok` so the caller keeps consuming.
    CommitFailed,
}

/// Result of a successful insert call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows reported by the store.
    pub rows_affected: u64,
    /// Commit handling.
    pub commit: CommitStatus,
}

impl InsertOutcome {
    /// The store reported something other than exactly one row.
    #[must_use]
    pub const fn is_row_count_anomaly(&self) -> bool {
        self.rows_affected != 1
    }
}

/// A write attempt that lost its record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// No connection could be leased.
    #[error("connection acquisition failed: {0}")]
    Acquire(ErrorEnvelope),
    /// The insert statement (or its `BEGIN`) failed or timed out.
    #[error("insert failed: {0}")]
    Insert(ErrorEnvelope),
}

impl WriteError {
    /// Underlying envelope.
    #[must_use]
    pub const fn envelope(&self) -> &ErrorEnvelope {
        match self {
            Self::Acquire(error) | Self::Insert(error) => error,
        }
    }

    const fn stage(&self) -> &'static str {
        match self {
            Self::Acquire(_) => "acquire",
            Self::Insert(_) => "insert",
        }
    }
}

impl From<WriteError> for ErrorEnvelope {
    fn from(error: WriteError) -> Self {
        let stage = error.stage();
        match error {
            WriteError::Acquire(envelope) | WriteError::Insert(envelope) => {
                envelope.with_metadata("stage", stage)
            },
        }
    }
}

/// Insert one record into the configured table.
///
/// The connection lease is released on every exit path.
#[tracing::instrument(level = "debug", skip_all, fields(path = record.path()))]
pub async fn insert_metric(
    ctx: &RequestContext,
    deps: &InsertMetricDeps,
    record: &MetricRecord,
) -> Result<InsertOutcome, WriteError> {
    let total_timer = deps
        .telemetry
        .as_ref()
        .map(|telemetry| telemetry.start_timer("ingest.write.total", Some(&table_tags(deps))));

    let result = write_with_lease(ctx, deps, record).await;

    if let Some(timer) = total_timer.as_ref() {
        timer.stop();
    }

    match &result {
        Ok(outcome) if outcome.commit == CommitStatus::CommitFailed => {
            // Already logged at error level; the row is not stored.
            increment(deps, "ingest.write.failed");
            increment(deps, "ingest.write.commit_failed");
        },
        Ok(outcome) => {
            increment(deps, "ingest.write.succeeded");
            if outcome.is_row_count_anomaly() {
                increment(deps, "ingest.write.row_count_anomaly");
                log(
                    deps,
                    LogLevel::Warn,
                    "ingest.write.row_count_anomaly",
                    "insert affected an unexpected number of rows",
                    log_fields_rows(ctx, deps, record, outcome.rows_affected),
                    None,
                );
            } else {
                log(
                    deps,
                    LogLevel::Debug,
                    "ingest.write.succeeded",
                    "metric stored",
                    log_fields_record(ctx, deps, record),
                    None,
                );
            }
        },
        Err(error) => {
            increment(deps, "ingest.write.failed");
            let (event, message) = match error {
                WriteError::Acquire(_) => (
                    "ingest.write.acquire_failed",
                    "could not acquire a store connection; metric dropped",
                ),
                WriteError::Insert(_) => ("ingest.write.insert_failed", "insert failed; metric dropped"),
            };
            log(
                deps,
                LogLevel::Error,
                event,
                message,
                log_fields_record(ctx, deps, record),
                Some(error.envelope()),
            );
        },
    }

    result
}

async fn write_with_lease(
    ctx: &RequestContext,
    deps: &InsertMetricDeps,
    record: &MetricRecord,
) -> Result<InsertOutcome, WriteError> {
    let settings = deps.settings;
    let mut lease: ConnectionLease = timeout_with_context(
        ctx,
        settings.acquire_timeout,
        "store.acquire",
        deps.pool.acquire(ctx),
    )
    .await
    .map_err(WriteError::Acquire)?;

    let connection = lease.connection().map_err(WriteError::Insert)?;

    if settings.transactional {
        timeout_with_context(
            ctx,
            settings.statement_timeout,
            "store.begin",
            connection.begin(ctx),
        )
        .await
        .map_err(WriteError::Insert)?;
    }

    let inserted = timeout_with_context(
        ctx,
        settings.statement_timeout,
        "store.insert",
        connection.insert_metric(ctx, &deps.table, record),
    )
    .await;

    let rows_affected = match inserted {
        Ok(rows) => rows,
        Err(error) => {
            if settings.transactional {
                let rolled_back = timeout_with_context(
                    ctx,
                    settings.statement_timeout,
                    "store.rollback",
                    connection.rollback(ctx),
                )
                .await;
                if let Err(rollback_error) = rolled_back {
                    log(
                        deps,
                        LogLevel::Debug,
                        "ingest.write.rollback_failed",
                        "rollback after insert failure failed",
                        log_fields_record(ctx, deps, record),
                        Some(&rollback_error),
                    );
                }
            }
            return Err(WriteError::Insert(error));
        },
    };

    let commit = if settings.transactional {
        let committed = timeout_with_context(
            ctx,
            settings.statement_timeout,
            "store.commit",
            connection.commit(ctx),
        )
        .await;
        match committed {
            Ok(()) => CommitStatus::Committed,
            Err(error) => {
                log(
                    deps,
                    LogLevel::Error,
                    "ingest.write.commit_failed",
                    "commit failed; metric may be lost",
                    log_fields_record(ctx, deps, record),
                    Some(&error),
                );
                CommitStatus::CommitFailed
            },
        }
    } else {
        CommitStatus::Autocommit
    };

    lease.release();
    Ok(InsertOutcome {
        rows_affected,
        commit,
    })
}

fn increment(deps: &InsertMetricDeps, name: &str) {
    if let Some(telemetry) = deps.telemetry.as_ref() {
        telemetry.increment_counter(name, 1, Some(&table_tags(deps)));
    }
}

fn log(
    deps: &InsertMetricDeps,
    level: LogLevel,
    event: &str,
    message: &str,
    fields: LogFields,
    error: Option<&ErrorEnvelope>,
) {
    let Some(logger) = deps.logger.as_ref() else {
        return;
    };
    let mut log_event = LogEvent::new(level, event, message, Some(fields));
    if let Some(error) = error
        && let Ok(value) = serde_json::to_value(error)
    {
        log_event = log_event.with_error(value);
    }
    logger.log(log_event);
}

fn table_tags(deps: &InsertMetricDeps) -> TelemetryTags {
    let mut tags = TelemetryTags::new();
    tags.insert("table".into(), deps.table.to_string().into());
    tags
}

fn log_fields_record(ctx: &RequestContext, deps: &InsertMetricDeps, record: &MetricRecord) -> LogFields {
    let mut fields = LogFields::new();
    fields.insert(
        "correlationId".into(),
        Value::String(ctx.correlation_id().as_str().to_owned()),
    );
    fields.insert("table".into(), Value::String(deps.table.to_string()));
    fields.insert("deviceId".into(), Value::String(record.device_id().to_owned()));
    fields.insert("path".into(), Value::String(record.path().to_owned()));
    fields.insert("time".into(), record.time().to_json());
    fields
}

fn log_fields_rows(
    ctx: &RequestContext,
    deps: &InsertMetricDeps,
    record: &MetricRecord,
    rows_affected: u64,
) -> LogFields {
    let mut fields = log_fields_record(ctx, deps, record);
    fields.insert("rowCount".into(), Value::from(rows_affected));
    fields
}
