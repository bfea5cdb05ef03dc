//! Service composition and lifecycle: build adapters, run until shutdown.

use crate::observability::{Observability, build_observability, scope_logger};
use crate::panic_hook::install_panic_hook;
use crate::{InfraError, InfraResult};
use sensor_ingest_adapters::{
    LogSink, MqttSubscription, PostgresConnectionPool, StderrLogSink, TaggedTelemetry,
};
use sensor_ingest_app::{
    EnsureSchemaDeps, InsertMetricDeps, SubscriptionDeps, SubscriptionSummary, WriteSettings,
    ensure_schema, run_subscription, run_supervisor_listener,
};
use sensor_ingest_config::{SaturationMode, ValidatedIngestConfig};
use sensor_ingest_ports::{
    ConnectionPoolPort, LogFields, SchemaStatus, SubscriptionPort, TelemetryPort, TelemetryTags,
};
use sensor_ingest_shared::{
    CorrelationId, ErrorCode, ErrorEnvelope, RequestContext, SaturationPolicy, WriteLimiter,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Time the supervisor listener gets to log the final session events.
const LISTENER_GRACE: Duration = Duration::from_millis(50);

/// External collaborators of one service run.
pub struct ServiceParts {
    /// Store connection pool.
    pub pool: Arc<dyn ConnectionPoolPort>,
    /// Subscribed broker session.
    pub session: Box<dyn SubscriptionPort>,
}

/// What happened during one service run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    /// Message counts from the subscription loop.
    pub summary: SubscriptionSummary,
    /// Schema bootstrap result, when it ran and succeeded.
    pub schema: Option<SchemaStatus>,
    /// Events the supervisor listener logged.
    pub supervisor_events: u64,
}

/// Store write settings derived from validated limits.
pub fn write_settings(config: &ValidatedIngestConfig) -> WriteSettings {
    let limits = config.limits();
    WriteSettings {
        acquire_timeout: Duration::from_millis(limits.store_acquire_timeout_ms.get()),
        statement_timeout: Duration::from_millis(limits.store_statement_timeout_ms.get()),
        transactional: config.store.transactional,
    }
}

/// Write limiter sized and configured from the `pipeline` section.
pub fn write_limiter(config: &ValidatedIngestConfig) -> InfraResult<WriteLimiter> {
    let max_in_flight = usize::try_from(config.limits().pipeline_max_in_flight_writes.get())
        .map_err(|_| {
            ErrorEnvelope::expected(
                ErrorCode::invalid_input(),
                "max in-flight writes does not fit this platform",
            )
        })?;
    let policy = match config.pipeline.on_saturation {
        SaturationMode::Wait => SaturationPolicy::Wait,
        SaturationMode::Drop => SaturationPolicy::Drop,
    };
    WriteLimiter::new(max_in_flight, policy)
}

/// Build the Postgres pool and MQTT session from config.
///
/// Neither connects yet: the pool opens connections lazily and the session
/// connects on its first poll.
pub fn build_service_parts(
    config: &ValidatedIngestConfig,
    observability: &Observability,
) -> InfraResult<ServiceParts> {
    let pool = PostgresConnectionPool::from_config(&config.store, config.limits())?;
    let session = MqttSubscription::new(
        &config.broker,
        config.limits(),
        &config.store.effective_database(),
    )
    .with_supervisor_bus(Arc::clone(&observability.bus));
    Ok(ServiceParts {
        pool: Arc::new(pool),
        session: Box::new(session),
    })
}

/// Run the ingest service over `parts` until the session closes or `ctx` is cancelled.
#[tracing::instrument(level = "debug", skip_all, fields(run_id = ctx.correlation_id().as_str()))]
pub async fn run_service_with(
    ctx: &RequestContext,
    config: &ValidatedIngestConfig,
    observability: &Observability,
    parts: ServiceParts,
) -> InfraResult<ServiceReport> {
    let ServiceParts { pool, mut session } = parts;

    let listener_ctx = RequestContext::new(CorrelationId::new_request_id());
    let listener = tokio::spawn({
        let events = observability.bus.subscribe();
        let logger = Arc::clone(&observability.direct_logger);
        let listener_ctx = listener_ctx.clone();
        async move { run_supervisor_listener(&listener_ctx, events, logger).await }
    });

    let logger = scope_logger(&observability.logger, ctx);
    logger.info(
        "service.started",
        "sensor ingest service started",
        Some(fields_started(config)),
    );

    let schema = if config.store.ensure_schema {
        let deps = EnsureSchemaDeps {
            pool: Arc::clone(&pool),
            table: config.store.table.clone(),
            timeout: schema_timeout(config),
            logger: Some(Arc::clone(&logger)),
        };
        // Failures are logged inside; the service keeps running either way.
        ensure_schema(ctx, &deps).await.ok()
    } else {
        None
    };

    let writer = InsertMetricDeps {
        pool: Arc::clone(&pool),
        table: config.store.table.clone(),
        settings: write_settings(config),
        logger: Some(Arc::clone(&logger)),
        telemetry: observability
            .telemetry
            .as_ref()
            .map(|inner| table_telemetry(inner, config)),
    };
    let deps = SubscriptionDeps {
        topic: config.broker.topic.clone(),
        writer: Arc::new(writer),
        limiter: write_limiter(config)?,
        drain_timeout: Duration::from_millis(config.limits().pipeline_drain_timeout_ms.get()),
        log_payloads: config.logging.log_payloads,
        logger: Some(Arc::clone(&logger)),
        telemetry: observability.telemetry.clone(),
    };

    let summary = run_subscription(ctx, deps, session.as_mut()).await;
    pool.close().await;

    tokio::time::sleep(LISTENER_GRACE).await;
    listener_ctx.cancel();
    let supervisor_events = listener.await.unwrap_or_else(|error| {
        logger.warn(
            "service.listener_failed",
            &format!("supervisor listener task failed: {error}"),
            None,
        );
        0
    });

    let summary = summary?;
    logger.info(
        "service.stopped",
        "sensor ingest service stopped",
        Some(fields_stopped(&summary)),
    );
    Ok(ServiceReport {
        summary,
        schema,
        supervisor_events,
    })
}

fn table_telemetry(
    inner: &Arc<dyn TelemetryPort>,
    config: &ValidatedIngestConfig,
) -> Arc<dyn TelemetryPort> {
    let mut tags = TelemetryTags::new();
    tags.insert("table".into(), config.store.table.to_string().into());
    Arc::new(TaggedTelemetry::new(Arc::clone(inner), tags))
}

/// Build real adapters, install the panic hook, and run until SIGINT/SIGTERM.
///
/// Owns the tokio runtime; call from a synchronous `main`.
pub fn run_until_shutdown(config: ValidatedIngestConfig) -> InfraResult<ServiceReport> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sensor-ingest")
        .build()
        .map_err(InfraError::from)?;

    runtime.block_on(async move {
        let sink: Arc<dyn LogSink> = Arc::new(StderrLogSink);
        let observability = build_observability(&config, &sink);
        install_panic_hook(Arc::clone(&observability.bus));

        let ctx = RequestContext::new_request();
        let signal_watcher = tokio::spawn({
            let ctx = ctx.clone();
            let logger = Arc::clone(&observability.logger);
            async move {
                tokio::select! {
                    () = ctx.cancelled() => {},
                    () = shutdown_signal() => {
                        logger.info(
                            "service.shutdown_requested",
                            "shutdown signal received; draining",
                            None,
                        );
                        ctx.cancel();
                    },
                }
            }
        });

        let parts = build_service_parts(&config, &observability)?;
        let report = run_service_with(&ctx, &config, &observability, parts).await;
        ctx.cancel();
        let _ = signal_watcher.await;
        report
    })
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(error) => {
                tracing::warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn schema_timeout(config: &ValidatedIngestConfig) -> Duration {
    let limits = config.limits();
    Duration::from_millis(
        limits
            .store_acquire_timeout_ms
            .get()
            .saturating_add(limits.store_statement_timeout_ms.get().saturating_mul(2)),
    )
}

fn fields_started(config: &ValidatedIngestConfig) -> LogFields {
    let mut fields = LogFields::new();
    fields.insert("brokerHost".into(), Value::String(config.broker.host.to_string()));
    fields.insert("brokerPort".into(), Value::from(config.broker.port));
    fields.insert(
        "topic".into(),
        Value::String(config.broker.topic.as_str().to_owned()),
    );
    fields.insert(
        "database".into(),
        Value::String(config.store.effective_database().to_string()),
    );
    fields.insert("table".into(), Value::String(config.store.table.to_string()));
    fields.insert(
        "valueColumn".into(),
        Value::String(config.store.value_column.as_str().to_owned()),
    );
    fields.insert(
        "maxInFlightWrites".into(),
        Value::from(config.limits().pipeline_max_in_flight_writes.get()),
    );
    fields.insert(
        "onSaturation".into(),
        Value::String(config.pipeline.on_saturation.as_str().to_owned()),
    );
    fields.insert(
        "transactional".into(),
        Value::Bool(config.store.transactional),
    );
    fields
}

fn fields_stopped(summary: &SubscriptionSummary) -> LogFields {
    let mut fields = LogFields::new();
    fields.insert("received".into(), Value::from(summary.received));
    fields.insert("dispatched".into(), Value::from(summary.dispatched));
    fields.insert("rejected".into(), Value::from(summary.rejected));
    fields.insert("dropped".into(), Value::from(summary.dropped));
    fields.insert("abandonedWrites".into(), Value::from(summary.abandoned_writes));
    fields
}
