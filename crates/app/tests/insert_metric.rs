//! Store-write use case against the in-memory pool.

use sensor_ingest_app::{
    CommitStatus, InsertMetricDeps, WriteError, WriteSettings, insert_metric,
};
use sensor_ingest_domain::{MetricRecord, MetricTime, TableName};
use sensor_ingest_ports::LogLevel;
use sensor_ingest_shared::{ErrorEnvelope, RequestContext};
use sensor_ingest_testkit::errors::{commit_failed_error, insert_rejected_error, pool_timeout_error};
use sensor_ingest_testkit::in_memory::{InMemoryConnectionPool, RecordingLogger, RecordingTelemetry};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    pool: InMemoryConnectionPool,
    logger: RecordingLogger,
    telemetry: RecordingTelemetry,
    deps: InsertMetricDeps,
}

fn harness(settings: WriteSettings) -> Harness {
    let pool = InMemoryConnectionPool::new();
    let logger = RecordingLogger::new();
    let telemetry = RecordingTelemetry::new();
    let deps = InsertMetricDeps {
        pool: Arc::new(pool.clone()),
        table: TableName::default(),
        settings,
        logger: Some(Arc::new(logger.clone())),
        telemetry: Some(Arc::new(telemetry.clone())),
    };
    Harness {
        pool,
        logger,
        telemetry,
        deps,
    }
}

fn transactional() -> WriteSettings {
    WriteSettings {
        transactional: true,
        ..WriteSettings::default()
    }
}

fn record(path: &str) -> MetricRecord {
    MetricRecord::new(
        MetricTime::Iso("2024-05-01T12:00:00.000Z".into()),
        "vessels.self",
        path,
        json!(3.85),
    )
}

#[tokio::test]
async fn one_record_becomes_exactly_one_row() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings::default());
    let ctx = RequestContext::new_request();

    let outcome = insert_metric(&ctx, &h.deps, &record("navigation.speedOverGround")).await?;

    assert_eq!(outcome.rows_affected, 1);
    assert_eq!(outcome.commit, CommitStatus::Autocommit);
    assert_eq!(h.pool.records(), vec![record("navigation.speedOverGround")]);
    assert_eq!(h.pool.acquired(), 1);
    assert_eq!(h.pool.released(), 1);
    assert_eq!(h.telemetry.counter("ingest.write.succeeded"), 1);
    assert_eq!(h.telemetry.timers(), vec!["ingest.write.total".to_owned()]);
    assert_eq!(h.logger.count("ingest.write.succeeded"), 1);
    Ok(())
}

#[tokio::test]
async fn each_record_is_written_on_its_own_lease() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings::default());
    let ctx = RequestContext::new_request();

    for index in 0..5 {
        insert_metric(&ctx, &h.deps, &record(&format!("sensors.s{index}"))).await?;
    }

    assert_eq!(h.pool.records().len(), 5);
    assert_eq!(h.pool.acquired(), 5);
    assert_eq!(h.pool.outstanding(), 0);
    Ok(())
}

#[tokio::test]
async fn acquire_failure_drops_the_record_without_holding_a_lease() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings::default());
    h.pool.fail_next_acquire(pool_timeout_error());
    let ctx = RequestContext::new_request();

    let error = insert_metric(&ctx, &h.deps, &record("a"))
        .await
        .err()
        .ok_or("expected an acquire failure")?;

    assert!(matches!(error, WriteError::Acquire(_)));
    assert_eq!(h.pool.acquired(), 0);
    assert!(h.pool.records().is_empty());
    assert_eq!(h.telemetry.counter("ingest.write.failed"), 1);

    let logged = h
        .logger
        .find("ingest.write.acquire_failed")
        .ok_or("missing acquire_failed log")?;
    assert_eq!(logged.level, LogLevel::Error);
    assert!(logged.error.is_some());

    let envelope = ErrorEnvelope::from(error);
    assert_eq!(envelope.metadata.get("stage").map(String::as_str), Some("acquire"));
    Ok(())
}

#[tokio::test]
async fn insert_failure_rolls_back_and_releases_once() -> Result<(), Box<dyn Error>> {
    let h = harness(transactional());
    h.pool.fail_next_insert(insert_rejected_error());
    let ctx = RequestContext::new_request();

    let error = insert_metric(&ctx, &h.deps, &record("a"))
        .await
        .err()
        .ok_or("expected an insert failure")?;

    assert!(matches!(error, WriteError::Insert(_)));
    assert_eq!(h.pool.begins(), 1);
    assert_eq!(h.pool.rollbacks(), 1);
    assert_eq!(h.pool.released(), 1);
    assert!(h.pool.records().is_empty());
    assert_eq!(h.logger.count("ingest.write.insert_failed"), 1);
    Ok(())
}

#[tokio::test]
async fn commit_failure_is_logged_but_not_surfaced() -> Result<(), Box<dyn Error>> {
    let h = harness(transactional());
    h.pool.fail_next_commit(commit_failed_error());
    let ctx = RequestContext::new_request();

    let outcome = insert_metric(&ctx, &h.deps, &record("a")).await?;

    assert_eq!(outcome.commit, CommitStatus::CommitFailed);
    assert!(h.pool.records().is_empty());
    assert_eq!(h.pool.released(), 1);
    let logged = h
        .logger
        .find("ingest.write.commit_failed")
        .ok_or("missing commit_failed log")?;
    assert_eq!(logged.level, LogLevel::Error);
    assert_eq!(h.logger.count_level(LogLevel::Error), 1);
    assert_eq!(h.logger.count("ingest.write.succeeded"), 0);
    assert_eq!(h.telemetry.counter("ingest.write.succeeded"), 0);
    assert_eq!(h.telemetry.counter("ingest.write.failed"), 1);
    assert_eq!(h.telemetry.counter("ingest.write.commit_failed"), 1);
    Ok(())
}

#[tokio::test]
async fn transactional_success_commits() -> Result<(), Box<dyn Error>> {
    let h = harness(transactional());
    let ctx = RequestContext::new_request();

    let outcome = insert_metric(&ctx, &h.deps, &record("a")).await?;

    assert_eq!(outcome.commit, CommitStatus::Committed);
    assert_eq!(h.pool.commits(), 1);
    assert_eq!(h.pool.records().len(), 1);
    Ok(())
}

#[tokio::test]
async fn unexpected_row_count_warns_but_succeeds() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings::default());
    h.pool.report_rows_affected(0);
    let ctx = RequestContext::new_request();

    let outcome = insert_metric(&ctx, &h.deps, &record("a")).await?;

    assert!(outcome.is_row_count_anomaly());
    let logged = h
        .logger
        .find("ingest.write.row_count_anomaly")
        .ok_or("missing row_count_anomaly log")?;
    assert_eq!(logged.level, LogLevel::Warn);
    assert_eq!(
        logged.fields.as_ref().and_then(|fields| fields.get("rowCount")),
        Some(&json!(0))
    );
    assert_eq!(h.telemetry.counter("ingest.write.row_count_anomaly"), 1);
    assert_eq!(h.logger.count("ingest.write.succeeded"), 0);
    Ok(())
}

#[tokio::test]
async fn slow_insert_times_out_and_releases_the_lease() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings {
        statement_timeout: Duration::from_millis(50),
        ..WriteSettings::default()
    });
    h.pool.hold_inserts();
    let ctx = RequestContext::new_request();

    let error = insert_metric(&ctx, &h.deps, &record("a"))
        .await
        .err()
        .ok_or("expected a statement timeout")?;

    assert!(error.envelope().is_timeout());
    assert_eq!(h.pool.outstanding(), 0);
    assert!(h.pool.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn logs_carry_the_message_correlation_id() -> Result<(), Box<dyn Error>> {
    let h = harness(WriteSettings::default());
    let ctx = RequestContext::new_request();

    insert_metric(&ctx, &h.deps, &record("a")).await?;

    let logged = h
        .logger
        .find("ingest.write.succeeded")
        .ok_or("missing succeeded log")?;
    let fields = logged.fields.ok_or("missing fields")?;
    assert_eq!(
        fields.get("correlationId"),
        Some(&json!(ctx.correlation_id().as_str()))
    );
    assert_eq!(fields.get("deviceId"), Some(&json!("vessels.self")));
    Ok(())
}
