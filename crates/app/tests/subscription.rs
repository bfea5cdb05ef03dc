//! Subscription controller: filtering, decode containment, dispatch, shutdown.

use sensor_ingest_app::{
    InsertMetricDeps, MessageDisposition, SubscriptionController, SubscriptionDeps, WriteSettings,
    run_subscription,
};
use sensor_ingest_domain::{TableName, TopicFilter};
use sensor_ingest_ports::{InboundMessage, LogLevel, SessionEvent};
use sensor_ingest_shared::{DrainOutcome, RequestContext, SaturationPolicy, WriteLimiter};
use sensor_ingest_testkit::errors::subscribe_refused_error;
use sensor_ingest_testkit::fixtures::read_fixture_bytes;
use sensor_ingest_testkit::in_memory::{
    InMemoryConnectionPool, RecordingLogger, ScriptEnd, ScriptedSubscription,
};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "boat/signalk/delta";

struct Harness {
    pool: InMemoryConnectionPool,
    logger: RecordingLogger,
    limiter: WriteLimiter,
    deps: SubscriptionDeps,
}

fn harness(max_in_flight: usize, policy: SaturationPolicy) -> Result<Harness, Box<dyn Error>> {
    let pool = InMemoryConnectionPool::new();
    let logger = RecordingLogger::new();
    let limiter = WriteLimiter::new(max_in_flight, policy)?;
    let writer = InsertMetricDeps {
        pool: Arc::new(pool.clone()),
        table: TableName::default(),
        settings: WriteSettings::default(),
        logger: Some(Arc::new(logger.clone())),
        telemetry: None,
    };
    let deps = SubscriptionDeps {
        topic: TopicFilter::default(),
        writer: Arc::new(writer),
        limiter: limiter.clone(),
        drain_timeout: Duration::from_secs(2),
        log_payloads: false,
        logger: Some(Arc::new(logger.clone())),
        telemetry: None,
    };
    Ok(Harness {
        pool,
        logger,
        limiter,
        deps,
    })
}

fn delta(path: &str, value: f64) -> InboundMessage {
    let payload = json!({
        "time": "2024-05-01T12:00:00.000Z",
        "context": "vessels.self",
        "path": path,
        "value": value,
    });
    InboundMessage {
        topic: TOPIC.into(),
        payload: payload.to_string().into_bytes(),
    }
}

fn raw(payload: &[u8]) -> InboundMessage {
    InboundMessage {
        topic: TOPIC.into(),
        payload: payload.to_vec(),
    }
}

#[tokio::test]
async fn malformed_payload_does_not_stop_the_stream() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    let mut session = ScriptedSubscription::new([
        SessionEvent::Message(delta("navigation.speedOverGround", 3.85)),
        SessionEvent::Message(raw(b"{not json")),
        SessionEvent::Message(raw(&read_fixture_bytes(
            "payloads/signalk-delta.missing-path.json",
        ))),
        SessionEvent::Message(delta("navigation.headingTrue", 1.2)),
    ]);
    let ctx = RequestContext::new_request();

    let summary = run_subscription(&ctx, h.deps, &mut session).await?;

    assert_eq!(summary.received, 4);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(h.pool.records().len(), 2);
    assert_eq!(h.logger.count("ingest.decode.failed"), 2);
    let logged = h
        .logger
        .find("ingest.decode.failed")
        .ok_or("missing decode log")?;
    assert_eq!(logged.level, LogLevel::Warn);
    Ok(())
}

#[tokio::test]
async fn fixture_payload_is_stored() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    let mut session = ScriptedSubscription::new([SessionEvent::Message(raw(&read_fixture_bytes(
        "payloads/signalk-delta.object-value.json",
    )))]);
    let ctx = RequestContext::new_request();

    run_subscription(&ctx, h.deps, &mut session).await?;

    let records = h.pool.records();
    let stored = records.first().ok_or("no record stored")?;
    assert_eq!(stored.path(), "navigation.position");
    assert_eq!(stored.value()["latitude"], json!(60.1699));
    Ok(())
}

#[tokio::test]
async fn dispatch_returns_before_the_write_finishes() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    h.pool.hold_inserts();
    let controller = SubscriptionController::new(h.deps);
    let ctx = RequestContext::new_request();

    for index in 0..3 {
        let disposition = tokio::time::timeout(
            Duration::from_secs(1),
            controller.handle_message(&ctx, delta(&format!("sensors.s{index}"), 1.0)),
        )
        .await?;
        assert_eq!(disposition, MessageDisposition::Dispatched);
    }
    assert_eq!(controller.in_flight_writes(), 3);
    assert!(h.pool.records().is_empty());

    h.pool.open_inserts();
    assert_eq!(
        h.limiter.drain(Duration::from_secs(2)).await,
        DrainOutcome::Drained
    );
    assert_eq!(h.pool.records().len(), 3);
    assert_eq!(h.pool.outstanding(), 0);
    Ok(())
}

#[tokio::test]
async fn saturated_limiter_drops_with_a_warning() -> Result<(), Box<dyn Error>> {
    let h = harness(1, SaturationPolicy::Drop)?;
    h.pool.hold_inserts();
    let controller = SubscriptionController::new(h.deps);
    let ctx = RequestContext::new_request();

    let first = controller.handle_message(&ctx, delta("a", 1.0)).await;
    let second = controller.handle_message(&ctx, delta("b", 2.0)).await;

    assert_eq!(first, MessageDisposition::Dispatched);
    assert_eq!(second, MessageDisposition::Dropped);
    assert_eq!(controller.summary().dropped, 1);
    let logged = h
        .logger
        .find("ingest.dispatch.dropped")
        .ok_or("missing dropped log")?;
    assert_eq!(logged.level, LogLevel::Warn);
    assert_eq!(
        logged.fields.as_ref().and_then(|fields| fields.get("reason")),
        Some(&json!("saturated"))
    );

    h.pool.open_inserts();
    h.limiter.drain(Duration::from_secs(2)).await;
    assert_eq!(h.pool.records().len(), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_writes() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    h.pool.delay_inserts(Duration::from_millis(50));
    let mut session = ScriptedSubscription::new([
        SessionEvent::Message(delta("a", 1.0)),
        SessionEvent::Message(delta("b", 2.0)),
        SessionEvent::Message(delta("c", 3.0)),
    ])
    .then(ScriptEnd::WaitForCancel);
    let ctx = RequestContext::new_request();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let summary = run_subscription(&ctx, h.deps, &mut session).await?;

    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.abandoned_writes, 0);
    assert_eq!(h.pool.records().len(), 3);
    assert_eq!(session.disconnects(), 1);
    assert_eq!(h.logger.count("ingest.subscription.stopped"), 1);
    Ok(())
}

#[tokio::test]
async fn drain_timeout_reports_abandoned_writes() -> Result<(), Box<dyn Error>> {
    let mut h = harness(8, SaturationPolicy::Wait)?;
    h.deps.drain_timeout = Duration::from_millis(50);
    h.pool.hold_inserts();
    let mut session = ScriptedSubscription::new([SessionEvent::Message(delta("a", 1.0))]);
    let ctx = RequestContext::new_request();

    let summary = run_subscription(&ctx, h.deps, &mut session).await?;

    assert_eq!(summary.abandoned_writes, 1);
    assert_eq!(h.logger.count("ingest.drain.timed_out"), 1);
    h.pool.open_inserts();
    Ok(())
}

#[tokio::test]
async fn topics_outside_the_filter_are_ignored() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    let mut outside = delta("a", 1.0);
    outside.topic = "boat/signalk/other".into();
    let mut session = ScriptedSubscription::new([
        SessionEvent::Message(outside),
        SessionEvent::Message(delta("b", 2.0)),
    ]);
    let ctx = RequestContext::new_request();

    let summary = run_subscription(&ctx, h.deps, &mut session).await?;

    assert_eq!(summary.ignored, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(h.pool.records().len(), 1);
    Ok(())
}

#[tokio::test]
async fn session_events_are_logged_and_errors_do_not_end_the_run() -> Result<(), Box<dyn Error>> {
    let h = harness(8, SaturationPolicy::Wait)?;
    let mut session = ScriptedSubscription::new([
        SessionEvent::Connected {
            session_present: false,
        },
        SessionEvent::Reconnecting {
            attempt: 1,
            reason: "connection refused".into(),
            delay_ms: 1_000,
        },
    ]);
    session.push_error(subscribe_refused_error());
    session.push_event(SessionEvent::Message(delta("a", 1.0)));
    let ctx = RequestContext::new_request();

    let summary = run_subscription(&ctx, h.deps, &mut session).await?;

    assert_eq!(summary.dispatched, 1);
    assert_eq!(h.logger.count("broker.connected"), 1);
    assert_eq!(h.logger.count("broker.reconnecting"), 1);
    assert_eq!(h.logger.count("broker.session_failed"), 1);
    assert_eq!(h.logger.count("broker.closed"), 1);
    Ok(())
}

#[tokio::test]
async fn payload_logging_is_opt_in() -> Result<(), Box<dyn Error>> {
    let mut h = harness(8, SaturationPolicy::Wait)?;
    h.deps.log_payloads = true;
    let mut session = ScriptedSubscription::new([SessionEvent::Message(delta("a", 1.0))]);
    let ctx = RequestContext::new_request();

    run_subscription(&ctx, h.deps, &mut session).await?;

    let logged = h
        .logger
        .find("ingest.message.received")
        .ok_or("missing payload log")?;
    assert_eq!(logged.level, LogLevel::Debug);
    assert!(
        logged
            .fields
            .as_ref()
            .and_then(|fields| fields.get("payload"))
            .is_some()
    );
    Ok(())
}
