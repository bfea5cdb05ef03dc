//! Log process-health events from the supervisor bus.

use sensor_ingest_ports::{
    LogEvent, LogFields, LogLevel, LoggerPort, SupervisorEvent, SupervisorEventStream,
};
use sensor_ingest_shared::RequestContext;
use serde_json::Value;
use std::sync::Arc;

/// Log every bus event until the bus closes or `ctx` is cancelled.
///
/// Returns the number of events observed. Forwarded log errors are logged at
/// warn level so a bus-forwarding logger never feeds them back.
pub async fn run_supervisor_listener(
    ctx: &RequestContext,
    mut events: Box<dyn SupervisorEventStream>,
    logger: Arc<dyn LoggerPort>,
) -> u64 {
    let mut observed = 0_u64;
    loop {
        let next = tokio::select! {
            () = ctx.cancelled() => None,
            next = events.next_event() => next,
        };
        let Some(event) = next else {
            break;
        };
        observed = observed.saturating_add(1);
        log_event(logger.as_ref(), &event);
    }
    observed
}

fn log_event(logger: &dyn LoggerPort, event: &SupervisorEvent) {
    let name = format!("supervisor.{}", event.name());
    let mut fields = LogFields::new();
    let (level, message) = match event {
        SupervisorEvent::Exception { message, location } => {
            fields.insert("panicMessage".into(), Value::String(message.to_string()));
            if let Some(location) = location {
                fields.insert("location".into(), Value::String(location.to_string()));
            }
            (LogLevel::Error, "unhandled panic")
        },
        SupervisorEvent::LogError { event, message } => {
            fields.insert("sourceEvent".into(), Value::String(event.to_string()));
            fields.insert("sourceMessage".into(), Value::String(message.to_string()));
            (LogLevel::Warn, "error logged")
        },
        SupervisorEvent::ReconnectAttempt { attempt, reason } => {
            fields.insert("attempt".into(), Value::from(*attempt));
            fields.insert("reason".into(), Value::String(reason.to_string()));
            (LogLevel::Warn, "broker reconnect attempt")
        },
        SupervisorEvent::Closed { reason } => {
            fields.insert("reason".into(), Value::String(reason.to_string()));
            (LogLevel::Info, "broker session closed")
        },
        SupervisorEvent::Lagged { skipped } => {
            fields.insert("skipped".into(), Value::from(*skipped));
            (LogLevel::Warn, "supervisor listener fell behind")
        },
    };
    logger.log(LogEvent::new(
        level,
        &name,
        message,
        Some(fields),
    ));
}
