//! Route broker messages through the decoder to background store writes.

use crate::decode_metric::decode_metric;
use crate::insert_metric::{InsertMetricDeps, insert_metric};
use sensor_ingest_domain::TopicFilter;
use sensor_ingest_ports::{
    InboundMessage, LogEvent, LogFields, LogLevel, LoggerPort, SessionEvent, SubscriptionPort,
    TelemetryPort,
};
use sensor_ingest_shared::{
    CorrelationId, Dispatch, DrainOutcome, ErrorEnvelope, RequestContext, Result, WriteLimiter,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Dependencies required by the subscription controller.
#[derive(Clone)]
pub struct SubscriptionDeps {
    /// Topic filter messages must match.
    pub topic: TopicFilter,
    /// Store writer dependencies, shared by every write task.
    pub writer: Arc<InsertMetricDeps>,
    /// Bound on in-flight write tasks.
    pub limiter: WriteLimiter,
    /// How long shutdown waits for in-flight writes.
    pub drain_timeout: Duration,
    /// Log topic and payload of every message at debug level.
    pub log_payloads: bool,
    /// Optional logger.
    pub logger: Option<Arc<dyn LoggerPort>>,
    /// Optional telemetry sink.
    pub telemetry: Option<Arc<dyn TelemetryPort>>,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Topic outside the filter.
    Ignored,
    /// Payload failed to decode.
    Rejected,
    /// A write task was spawned.
    Dispatched,
    /// Decoded, but no write slot was available (or shutdown began).
    Dropped,
}

/// Message counts for one subscription run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionSummary {
    /// Messages delivered by the session.
    pub received: u64,
    /// Messages outside the topic filter.
    pub ignored: u64,
    /// Messages decoded into records.
    pub decoded: u64,
    /// Messages that failed to decode.
    pub rejected: u64,
    /// Records handed to a write task.
    pub dispatched: u64,
    /// Records dropped before a write was attempted.
    pub dropped: u64,
    /// Write tasks still running when the drain timeout expired.
    pub abandoned_writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    ignored: AtomicU64,
    decoded: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SubscriptionSummary {
        SubscriptionSummary {
            received: self.received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned_writes: 0,
        }
    }
}

/// Owns the message loop for one broker session.
///
/// The controller never awaits a write: each decoded record becomes its own
/// task on the [`WriteLimiter`], and the loop moves on to the next message.
pub struct SubscriptionController {
    deps: SubscriptionDeps,
    counters: Counters,
}

impl SubscriptionController {
    /// Create a controller.
    #[must_use]
    pub fn new(deps: SubscriptionDeps) -> Self {
        Self {
            deps,
            counters: Counters::default(),
        }
    }

    /// Counts so far.
    #[must_use]
    pub fn summary(&self) -> SubscriptionSummary {
        self.counters.snapshot()
    }

    /// Write tasks currently running.
    #[must_use]
    pub fn in_flight_writes(&self) -> usize {
        self.deps.limiter.in_flight()
    }

    /// Handle one inbound message: filter, decode, dispatch.
    pub async fn handle_message(
        &self,
        ctx: &RequestContext,
        message: InboundMessage,
    ) -> MessageDisposition {
        Counters::bump(&self.counters.received);
        self.increment("ingest.messages.received");

        if !self.deps.topic.matches(&message.topic) {
            Counters::bump(&self.counters.ignored);
            self.log(
                LogLevel::Debug,
                "ingest.message.ignored",
                "topic does not match the subscription filter",
                Some(self.fields_topic(&message.topic)),
                None,
            );
            return MessageDisposition::Ignored;
        }

        if self.deps.log_payloads {
            let mut fields = self.fields_topic(&message.topic);
            fields.insert(
                "payload".into(),
                Value::String(String::from_utf8_lossy(&message.payload).into_owned()),
            );
            self.log(
                LogLevel::Debug,
                "ingest.message.received",
                "message received",
                Some(fields),
                None,
            );
        }

        let record = match decode_metric(&message.payload) {
            Ok(record) => record,
            Err(error) => {
                Counters::bump(&self.counters.rejected);
                self.increment("ingest.decode.failed");
                self.log(
                    LogLevel::Warn,
                    "ingest.decode.failed",
                    "message payload rejected",
                    Some(self.fields_topic(&message.topic)),
                    Some(&ErrorEnvelope::from(error)),
                );
                return MessageDisposition::Rejected;
            },
        };
        Counters::bump(&self.counters.decoded);

        // Writes run on a fresh context: shutdown stops intake, then drains them.
        let write_ctx = RequestContext::new(CorrelationId::new_message_id());
        let writer = Arc::clone(&self.deps.writer);
        let task = async move {
            // Failures are logged and counted inside the use case.
            let _outcome = insert_metric(&write_ctx, &writer, &record).await;
        };

        let dispatch = tokio::select! {
            () = ctx.cancelled() => Dispatch::Closed,
            dispatch = self.deps.limiter.spawn(task) => dispatch,
        };

        match dispatch {
            Dispatch::Spawned => {
                Counters::bump(&self.counters.dispatched);
                MessageDisposition::Dispatched
            },
            Dispatch::Dropped | Dispatch::Closed => {
                Counters::bump(&self.counters.dropped);
                self.increment("ingest.dispatch.dropped");
                self.log(
                    LogLevel::Warn,
                    "ingest.dispatch.dropped",
                    "no write slot available; metric dropped",
                    Some(self.fields_dispatch(&message.topic, dispatch)),
                    None,
                );
                MessageDisposition::Dropped
            },
        }
    }

    /// Drive `session` until it closes or `ctx` is cancelled, then drain.
    #[tracing::instrument(level = "debug", skip_all, fields(topic = self.deps.topic.as_str()))]
    pub async fn run(
        &self,
        ctx: &RequestContext,
        session: &mut dyn SubscriptionPort,
    ) -> Result<SubscriptionSummary> {
        self.log(
            LogLevel::Info,
            "ingest.subscription.started",
            "subscription started",
            Some(self.fields_topic(self.deps.topic.as_str())),
            None,
        );

        loop {
            match session.next_event(ctx).await {
                Ok(SessionEvent::Message(message)) => {
                    self.handle_message(ctx, message).await;
                },
                Ok(SessionEvent::Connected { session_present }) => {
                    let mut fields = self.fields_topic(self.deps.topic.as_str());
                    fields.insert("sessionPresent".into(), Value::Bool(session_present));
                    self.log(
                        LogLevel::Info,
                        "broker.connected",
                        "connected to broker and subscribed",
                        Some(fields),
                        None,
                    );
                },
                Ok(SessionEvent::Reconnecting {
                    attempt,
                    reason,
                    delay_ms,
                }) => {
                    let mut fields = LogFields::new();
                    fields.insert("attempt".into(), Value::from(attempt));
                    fields.insert("reason".into(), Value::String(reason.into()));
                    fields.insert("delayMs".into(), Value::from(delay_ms));
                    self.log(
                        LogLevel::Warn,
                        "broker.reconnecting",
                        "broker connection lost; reconnecting",
                        Some(fields),
                        None,
                    );
                },
                Ok(SessionEvent::Closed { reason }) => {
                    let mut fields = LogFields::new();
                    fields.insert("reason".into(), Value::String(reason.into()));
                    self.log(
                        LogLevel::Info,
                        "broker.closed",
                        "broker session closed",
                        Some(fields),
                        None,
                    );
                    break;
                },
                Err(error) if error.is_cancelled() => break,
                Err(error) => {
                    self.log(
                        LogLevel::Error,
                        "broker.session_failed",
                        "broker session error",
                        Some(self.fields_topic(self.deps.topic.as_str())),
                        Some(&error),
                    );
                },
            }
        }

        self.shutdown(ctx, session).await
    }

    async fn shutdown(
        &self,
        ctx: &RequestContext,
        session: &mut dyn SubscriptionPort,
    ) -> Result<SubscriptionSummary> {
        if let Err(error) = session.disconnect(ctx).await {
            self.log(
                LogLevel::Warn,
                "broker.disconnect_failed",
                "broker disconnect failed",
                None,
                Some(&error),
            );
        }

        let mut summary = self.summary();
        match self.deps.limiter.drain(self.deps.drain_timeout).await {
            DrainOutcome::Drained => {},
            DrainOutcome::TimedOut { remaining } => {
                summary.abandoned_writes = u64::try_from(remaining).unwrap_or(u64::MAX);
                let mut fields = LogFields::new();
                fields.insert("remaining".into(), Value::from(summary.abandoned_writes));
                fields.insert(
                    "drainTimeoutMs".into(),
                    Value::from(u64::try_from(self.deps.drain_timeout.as_millis()).unwrap_or(u64::MAX)),
                );
                self.log(
                    LogLevel::Warn,
                    "ingest.drain.timed_out",
                    "in-flight writes still running at shutdown",
                    Some(fields),
                    None,
                );
            },
        }

        self.log(
            LogLevel::Info,
            "ingest.subscription.stopped",
            "subscription stopped",
            Some(fields_summary(&summary)),
            None,
        );
        Ok(summary)
    }

    fn increment(&self, name: &str) {
        if let Some(telemetry) = self.deps.telemetry.as_ref() {
            telemetry.increment_counter(name, 1, None);
        }
    }

    fn log(
        &self,
        level: LogLevel,
        event: &str,
        message: &str,
        fields: Option<LogFields>,
        error: Option<&ErrorEnvelope>,
    ) {
        let Some(logger) = self.deps.logger.as_ref() else {
            return;
        };
        let mut log_event = LogEvent::new(level, event, message, fields);
        if let Some(error) = error
            && let Ok(value) = serde_json::to_value(error)
        {
            log_event = log_event.with_error(value);
        }
        logger.log(log_event);
    }

    fn fields_topic(&self, topic: &str) -> LogFields {
        let mut fields = LogFields::new();
        fields.insert("topic".into(), Value::String(topic.to_owned()));
        fields.insert(
            "filter".into(),
            Value::String(self.deps.topic.as_str().to_owned()),
        );
        fields
    }

    fn fields_dispatch(&self, topic: &str, dispatch: Dispatch) -> LogFields {
        let mut fields = self.fields_topic(topic);
        let reason = match dispatch {
            Dispatch::Dropped => "saturated",
            Dispatch::Closed | Dispatch::Spawned => "shutting_down",
        };
        fields.insert("reason".into(), Value::String(reason.to_owned()));
        fields.insert(
            "inFlight".into(),
            Value::from(u64::try_from(self.deps.limiter.in_flight()).unwrap_or(u64::MAX)),
        );
        fields
    }
}

fn fields_summary(summary: &SubscriptionSummary) -> LogFields {
    let mut fields = LogFields::new();
    fields.insert("received".into(), Value::from(summary.received));
    fields.insert("ignored".into(), Value::from(summary.ignored));
    fields.insert("decoded".into(), Value::from(summary.decoded));
    fields.insert("rejected".into(), Value::from(summary.rejected));
    fields.insert("dispatched".into(), Value::from(summary.dispatched));
    fields.insert("dropped".into(), Value::from(summary.dropped));
    fields.insert("abandonedWrites".into(), Value::from(summary.abandoned_writes));
    fields
}

/// Run a controller built from `deps` over `session`.
pub async fn run_subscription(
    ctx: &RequestContext,
    deps: SubscriptionDeps,
    session: &mut dyn SubscriptionPort,
) -> Result<SubscriptionSummary> {
    SubscriptionController::new(deps).run(ctx, session).await
}
