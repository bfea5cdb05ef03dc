//! In-memory adapter implementations for port contracts.
//!
//! These implementations are intended for:
//! - Use-case tests in `app` without a broker or a database
//! - Deterministic contract tests for the ports layer
//! - Scripting failure paths (acquire, insert, commit) that are hard to hit live

use sensor_ingest_domain::{MetricRecord, TableName};
use sensor_ingest_ports::{
    BoxFuture, ConnectionLease, ConnectionPoolPort, LogEvent, LogFields, LogLevel, LoggerPort,
    PooledConnection, SchemaStatus, SessionEvent, SubscriptionPort, SupervisorEvent,
    SupervisorEventStream, TelemetryPort, TelemetryTags, TelemetryTimer,
};
use sensor_ingest_shared::{ErrorCode, ErrorEnvelope, RequestContext, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A no-op logger implementation.
#[derive(Debug, Default)]
pub struct NoopLogger;

impl LoggerPort for NoopLogger {
    fn log(&self, _event: LogEvent) {}

    fn child(&self, _fields: LogFields) -> Box<dyn LoggerPort> {
        Box::new(Self)
    }
}

/// A no-op telemetry timer.
#[derive(Debug, Default)]
pub struct NoopTimer;

impl TelemetryTimer for NoopTimer {
    fn stop(&self) {}
}

/// A no-op telemetry implementation.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetryPort for NoopTelemetry {
    fn increment_counter(&self, _name: &str, _value: u64, _tags: Option<&TelemetryTags>) {}

    fn record_timer_ms(&self, _name: &str, _duration_ms: u64, _tags: Option<&TelemetryTags>) {}

    fn start_timer(&self, _name: &str, _tags: Option<&TelemetryTags>) -> Box<dyn TelemetryTimer> {
        Box::new(NoopTimer)
    }
}

/// Logger that keeps every event for later assertions.
///
/// Children share storage with their parent and merge their base fields
/// into each event, so assertions see exactly what a real sink would.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    events: Arc<Mutex<Vec<LogEvent>>>,
    base_fields: LogFields,
}

impl RecordingLogger {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, in emission order.
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events with the given name.
    pub fn events_named(&self, event: &str) -> Vec<LogEvent> {
        self.events()
            .into_iter()
            .filter(|recorded| recorded.event.as_ref() == event)
            .collect()
    }

    /// First event with the given name.
    pub fn find(&self, event: &str) -> Option<LogEvent> {
        self.events_named(event).into_iter().next()
    }

    /// Number of events with the given name.
    pub fn count(&self, event: &str) -> usize {
        self.events_named(event).len()
    }

    /// Number of events at the given level.
    pub fn count_level(&self, level: LogLevel) -> usize {
        self.events()
            .iter()
            .filter(|recorded| recorded.level == level)
            .count()
    }

    /// Drop every recorded event.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl LoggerPort for RecordingLogger {
    fn log(&self, mut event: LogEvent) {
        if !self.base_fields.is_empty() {
            let mut merged = self.base_fields.clone();
            if let Some(fields) = event.fields.take() {
                merged.extend(fields);
            }
            event.fields = Some(merged);
        }
        self.events.lock().unwrap().push(event);
    }

    fn child(&self, fields: LogFields) -> Box<dyn LoggerPort> {
        let mut base_fields = self.base_fields.clone();
        base_fields.extend(fields);
        Box::new(Self {
            events: Arc::clone(&self.events),
            base_fields,
        })
    }
}

/// Telemetry sink that sums counters and keeps timer names.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    counters: Arc<Mutex<BTreeMap<String, u64>>>,
    timers: Arc<Mutex<Vec<String>>>,
}

impl RecordingTelemetry {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all increments recorded for `name`.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Names of recorded timers, in order.
    pub fn timers(&self) -> Vec<String> {
        self.timers.lock().unwrap().clone()
    }
}

struct RecordingTimer {
    name: String,
    timers: Arc<Mutex<Vec<String>>>,
    stopped: AtomicBool,
}

impl TelemetryTimer for RecordingTimer {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.timers.lock().unwrap().push(self.name.clone());
        }
    }
}

impl TelemetryPort for RecordingTelemetry {
    fn increment_counter(&self, name: &str, value: u64, _tags: Option<&TelemetryTags>) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_insert(0) += value;
    }

    fn record_timer_ms(&self, name: &str, _duration_ms: u64, _tags: Option<&TelemetryTags>) {
        self.timers.lock().unwrap().push(name.to_owned());
    }

    fn start_timer(&self, name: &str, _tags: Option<&TelemetryTags>) -> Box<dyn TelemetryTimer> {
        Box::new(RecordingTimer {
            name: name.to_owned(),
            timers: Arc::clone(&self.timers),
            stopped: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct PoolScript {
    acquire_failures: VecDeque<ErrorEnvelope>,
    insert_failures: VecDeque<ErrorEnvelope>,
    commit_failures: VecDeque<ErrorEnvelope>,
    rows_affected: Option<u64>,
    insert_delay: Option<Duration>,
    schema: Option<Result<SchemaStatus>>,
}

struct PoolState {
    script: Mutex<PoolScript>,
    records: Mutex<Vec<MetricRecord>>,
    gate: watch::Sender<bool>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    inserts_started: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    schema_calls: AtomicUsize,
    closed: AtomicBool,
}

/// Pool double that stores records in memory and follows a failure script.
///
/// Scripted failures are consumed in order, one per matching call. Every
/// lease is counted on acquire and on release so tests can assert that
/// nothing leaks.
#[derive(Clone)]
pub struct InMemoryConnectionPool {
    state: Arc<PoolState>,
}

impl Default for InMemoryConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnectionPool {
    /// Create a pool whose inserts succeed with one affected row.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(PoolState {
                script: Mutex::new(PoolScript::default()),
                records: Mutex::new(Vec::new()),
                gate,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                inserts_started: AtomicUsize::new(0),
                begins: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                schema_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Fail the next acquire with `error`.
    pub fn fail_next_acquire(&self, error: ErrorEnvelope) -> &Self {
        self.script().acquire_failures.push_back(error);
        self
    }

    /// Fail the next insert with `error`.
    pub fn fail_next_insert(&self, error: ErrorEnvelope) -> &Self {
        self.script().insert_failures.push_back(error);
        self
    }

    /// Fail the next commit with `error`.
    pub fn fail_next_commit(&self, error: ErrorEnvelope) -> &Self {
        self.script().commit_failures.push_back(error);
        self
    }

    /// Report `rows` from every insert instead of 1.
    pub fn report_rows_affected(&self, rows: u64) -> &Self {
        self.script().rows_affected = Some(rows);
        self
    }

    /// Sleep for `delay` inside every insert.
    pub fn delay_inserts(&self, delay: Duration) -> &Self {
        self.script().insert_delay = Some(delay);
        self
    }

    /// Answer ensure-schema with `result`.
    pub fn respond_to_ensure_schema(&self, result: Result<SchemaStatus>) -> &Self {
        self.script().schema = Some(result);
        self
    }

    /// Park every insert until [`Self::open_inserts`] is called.
    pub fn hold_inserts(&self) -> &Self {
        self.state.gate.send_replace(false);
        self
    }

    /// Let parked and future inserts proceed.
    pub fn open_inserts(&self) -> &Self {
        self.state.gate.send_replace(true);
        self
    }

    /// Records stored so far (autocommitted or committed).
    pub fn records(&self) -> Vec<MetricRecord> {
        self.state.records.lock().unwrap().clone()
    }

    /// Leases handed out.
    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    /// Leases returned.
    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    /// Leases currently held.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    /// Inserts that reached the connection (including parked ones).
    pub fn inserts_started(&self) -> usize {
        self.state.inserts_started.load(Ordering::SeqCst)
    }

    /// `BEGIN` calls.
    pub fn begins(&self) -> usize {
        self.state.begins.load(Ordering::SeqCst)
    }

    /// Successful `COMMIT` calls.
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// `ROLLBACK` calls.
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Ensure-schema calls.
    pub fn schema_calls(&self) -> usize {
        self.state.schema_calls.load(Ordering::SeqCst)
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, PoolScript> {
        self.state.script.lock().unwrap()
    }
}

impl ConnectionPoolPort for InMemoryConnectionPool {
    fn acquire(&self, ctx: &RequestContext) -> BoxFuture<'_, Result<ConnectionLease>> {
        let ctx = ctx.clone();
        Box::pin(async move {
            ctx.ensure_not_cancelled("store.acquire")?;
            if self.is_closed() {
                return Err(ErrorEnvelope::expected(
                    ErrorCode::new("store", "pool_closed"),
                    "pool is closed",
                ));
            }
            if let Some(error) = self.script().acquire_failures.pop_front() {
                return Err(error);
            }
            self.state.acquired.fetch_add(1, Ordering::SeqCst);
            let connection = InMemoryConnection {
                state: Arc::clone(&self.state),
                pending: None,
            };
            Ok(ConnectionLease::new(Box::new(connection)))
        })
    }

    fn ensure_schema(
        &self,
        _ctx: &RequestContext,
        _table: &TableName,
    ) -> BoxFuture<'_, Result<SchemaStatus>> {
        Box::pin(async move {
            self.state.schema_calls.fetch_add(1, Ordering::SeqCst);
            self.script()
                .schema
                .clone()
                .unwrap_or(Ok(SchemaStatus::Hypertable))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.closed.store(true, Ordering::SeqCst);
        })
    }
}

struct InMemoryConnection {
    state: Arc<PoolState>,
    pending: Option<Vec<MetricRecord>>,
}

impl InMemoryConnection {
    fn script(&self) -> std::sync::MutexGuard<'_, PoolScript> {
        self.state.script.lock().unwrap()
    }
}

impl PooledConnection for InMemoryConnection {
    fn insert_metric<'a>(
        &'a mut self,
        _ctx: &'a RequestContext,
        _table: &'a TableName,
        record: &'a MetricRecord,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.state.inserts_started.fetch_add(1, Ordering::SeqCst);
            let mut gate = self.state.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;

            let delay = self.script().insert_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let (failure, rows) = {
                let mut script = self.script();
                (script.insert_failures.pop_front(), script.rows_affected)
            };
            if let Some(error) = failure {
                return Err(error);
            }

            match self.pending.as_mut() {
                Some(pending) => pending.push(record.clone()),
                None => self.state.records.lock().unwrap().push(record.clone()),
            }
            Ok(rows.unwrap_or(1))
        })
    }

    fn begin<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.begins.fetch_add(1, Ordering::SeqCst);
            self.pending = Some(Vec::new());
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pending = self.pending.take().unwrap_or_default();
            if let Some(error) = self.script().commit_failures.pop_front() {
                return Err(error);
            }
            self.state.commits.fetch_add(1, Ordering::SeqCst);
            self.state.records.lock().unwrap().extend(pending);
            Ok(())
        })
    }

    fn rollback<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.pending = None;
            Ok(())
        })
    }

    fn release(self: Box<Self>) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a [`ScriptedSubscription`] does after its script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptEnd {
    /// Report `Closed` (the broker went away).
    #[default]
    Close,
    /// Idle until the caller cancels, like a quiet live session.
    WaitForCancel,
}

/// Broker session double that replays a fixed list of events.
#[derive(Debug, Default)]
pub struct ScriptedSubscription {
    script: VecDeque<Result<SessionEvent>>,
    end: ScriptEnd,
    delivered: u64,
    disconnects: usize,
}

impl ScriptedSubscription {
    /// Replay `events`, then close.
    pub fn new(events: impl IntoIterator<Item = SessionEvent>) -> Self {
        Self {
            script: events.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    /// Choose what happens after the script runs out.
    pub fn then(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Append an error to the script.
    pub fn push_error(&mut self, error: ErrorEnvelope) {
        self.script.push_back(Err(error));
    }

    /// Append an event to the script.
    pub fn push_event(&mut self, event: SessionEvent) {
        self.script.push_back(Ok(event));
    }

    /// Scripted entries handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Number of `disconnect` calls.
    pub fn disconnects(&self) -> usize {
        self.disconnects
    }
}

impl SubscriptionPort for ScriptedSubscription {
    fn next_event<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<SessionEvent>> {
        Box::pin(async move {
            ctx.ensure_not_cancelled("broker.next_event")?;
            if let Some(next) = self.script.pop_front() {
                self.delivered += 1;
                return next;
            }
            match self.end {
                ScriptEnd::Close => Ok(SessionEvent::Closed {
                    reason: "script exhausted".into(),
                }),
                ScriptEnd::WaitForCancel => {
                    ctx.cancelled().await;
                    Err(ErrorEnvelope::cancelled("broker session cancelled"))
                },
            }
        })
    }

    fn disconnect<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.disconnects += 1;
            Ok(())
        })
    }
}

/// Supervisor stream double that yields a fixed list, then ends or idles.
#[derive(Debug, Default)]
pub struct ScriptedEventStream {
    events: VecDeque<SupervisorEvent>,
    idle_when_empty: bool,
}

impl ScriptedEventStream {
    /// Yield `events`, then report the bus closed.
    pub fn new(events: impl IntoIterator<Item = SupervisorEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            idle_when_empty: false,
        }
    }

    /// Never report the bus closed; wait forever once empty.
    pub fn idle_when_empty(mut self) -> Self {
        self.idle_when_empty = true;
        self
    }
}

impl SupervisorEventStream for ScriptedEventStream {
    fn next_event(&mut self) -> BoxFuture<'_, Option<SupervisorEvent>> {
        Box::pin(async move {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.idle_when_empty {
                std::future::pending::<()>().await;
            }
            None
        })
    }
}
