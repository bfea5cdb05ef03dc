//! JSON telemetry adapter (counters and timers).

use crate::log_sink::LogSink;
use sensor_ingest_ports::{TelemetryPort, TelemetryTags, TelemetryTimer};
use sensor_ingest_shared::redaction::{REDACTED, is_secret_key};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Telemetry adapter that emits one JSON metric line per observation.
#[derive(Clone)]
pub struct JsonTelemetry {
    sink: Arc<dyn LogSink>,
    base_tags: TelemetryTags,
}

impl JsonTelemetry {
    /// Create a telemetry adapter backed by the provided sink.
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            base_tags: TelemetryTags::new(),
        }
    }

    /// Set base tags applied to every metric.
    #[must_use]
    pub fn with_base_tags(mut self, tags: TelemetryTags) -> Self {
        self.base_tags = tags;
        self
    }
}

impl TelemetryPort for JsonTelemetry {
    fn increment_counter(&self, name: &str, value: u64, tags: Option<&TelemetryTags>) {
        let tags = merge_tags(&self.base_tags, tags);
        self.sink
            .write_line(&metric_line("counter", name, value, None, &tags));
    }

    fn record_timer_ms(&self, name: &str, duration_ms: u64, tags: Option<&TelemetryTags>) {
        let tags = merge_tags(&self.base_tags, tags);
        self.sink
            .write_line(&metric_line("timer", name, duration_ms, Some("ms"), &tags));
    }

    fn start_timer(&self, name: &str, tags: Option<&TelemetryTags>) -> Box<dyn TelemetryTimer> {
        Box::new(JsonTelemetryTimer {
            sink: Arc::clone(&self.sink),
            name: name.into(),
            tags: merge_tags(&self.base_tags, tags),
            started_at: Instant::now(),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Telemetry adapter that applies base tags to an inner telemetry sink.
#[derive(Clone)]
pub struct TaggedTelemetry {
    inner: Arc<dyn TelemetryPort>,
    tags: TelemetryTags,
}

impl TaggedTelemetry {
    /// Wrap a telemetry sink with base tags.
    #[must_use]
    pub fn new(inner: Arc<dyn TelemetryPort>, tags: TelemetryTags) -> Self {
        Self { inner, tags }
    }
}

impl TelemetryPort for TaggedTelemetry {
    fn increment_counter(&self, name: &str, value: u64, tags: Option<&TelemetryTags>) {
        let merged = merge_tags(&self.tags, tags);
        self.inner.increment_counter(name, value, Some(&merged));
    }

    fn record_timer_ms(&self, name: &str, duration_ms: u64, tags: Option<&TelemetryTags>) {
        let merged = merge_tags(&self.tags, tags);
        self.inner.record_timer_ms(name, duration_ms, Some(&merged));
    }

    fn start_timer(&self, name: &str, tags: Option<&TelemetryTags>) -> Box<dyn TelemetryTimer> {
        let merged = merge_tags(&self.tags, tags);
        self.inner.start_timer(name, Some(&merged))
    }
}

struct JsonTelemetryTimer {
    sink: Arc<dyn LogSink>,
    name: Box<str>,
    tags: TelemetryTags,
    started_at: Instant,
    stopped: AtomicBool,
}

impl TelemetryTimer for JsonTelemetryTimer {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let duration_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.sink.write_line(&metric_line(
            "timer",
            &self.name,
            duration_ms,
            Some("ms"),
            &self.tags,
        ));
    }
}

fn metric_line(
    metric_type: &str,
    name: &str,
    value: u64,
    unit: Option<&str>,
    tags: &TelemetryTags,
) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert("type".to_owned(), Value::String("metric".to_owned()));
    payload.insert("timestampMs".to_owned(), Value::from(now_epoch_ms()));
    payload.insert(
        "metricType".to_owned(),
        Value::String(metric_type.to_owned()),
    );
    payload.insert("name".to_owned(), Value::String(name.to_owned()));
    payload.insert("value".to_owned(), Value::from(value));
    if let Some(unit) = unit {
        payload.insert("unit".to_owned(), Value::String(unit.to_owned()));
    }
    if !tags.is_empty() {
        let tags = tags
            .iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        payload.insert("tags".to_owned(), Value::Object(tags));
    }

    serde_json::to_string(&Value::Object(payload)).map_or_else(
        |_| {
            "{\"type\":\"metric\",\"metricType\":\"error\",\"name\":\"telemetry.serialize_failed\",\"value\":1}\n"
                .to_owned()
        },
        |mut encoded| {
            encoded.push('\n');
            encoded
        },
    )
}

fn merge_tags(base: &TelemetryTags, extra: Option<&TelemetryTags>) -> TelemetryTags {
    let mut merged = base.clone();
    if let Some(extra) = extra {
        merged.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    for (key, value) in &mut merged {
        if is_secret_key(key) {
            *value = REDACTED.into();
        }
    }
    merged
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::MemoryLogSink;
    use serde_json::json;
    use std::sync::Mutex;

    fn parse_lines(sink: &MemoryLogSink) -> Result<Vec<Value>, serde_json::Error> {
        sink.take()
            .iter()
            .map(|line| serde_json::from_str(line.trim()))
            .collect()
    }

    #[test]
    fn telemetry_emits_counter_and_timer() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(MemoryLogSink::new());
        let telemetry = JsonTelemetry::new(sink.clone());

        telemetry.increment_counter("ingest.messages.received", 2, None);
        let timer = telemetry.start_timer("ingest.write.total", None);
        timer.stop();
        timer.stop();

        let lines = parse_lines(&sink)?;
        assert_eq!(lines.len(), 2);

        let counter = lines
            .iter()
            .find(|value| value["metricType"] == json!("counter"))
            .ok_or("missing counter")?;
        assert_eq!(counter["name"], json!("ingest.messages.received"));
        assert_eq!(counter["value"], json!(2));

        let timer = lines
            .iter()
            .find(|value| value["metricType"] == json!("timer"))
            .ok_or("missing timer")?;
        assert_eq!(timer["name"], json!("ingest.write.total"));
        assert_eq!(timer["unit"], json!("ms"));
        Ok(())
    }

    #[test]
    fn secret_tags_are_redacted() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(MemoryLogSink::new());
        let mut base = TelemetryTags::new();
        base.insert("table".into(), "sensor_metrics".into());
        base.insert("dbPassword".into(), "nope".into());
        let telemetry = JsonTelemetry::new(sink.clone()).with_base_tags(base);

        telemetry.record_timer_ms("ingest.write.total", 12, None);

        let lines = parse_lines(&sink)?;
        let line = lines.first().ok_or("missing line")?;
        assert_eq!(line["tags"]["table"], json!("sensor_metrics"));
        assert_eq!(line["tags"]["dbPassword"], json!(REDACTED));
        Ok(())
    }

    #[test]
    fn tagged_telemetry_merges_tags() -> Result<(), Box<dyn std::error::Error>> {
        struct CaptureTelemetry {
            tags: Mutex<Option<TelemetryTags>>,
        }

        impl TelemetryPort for CaptureTelemetry {
            fn increment_counter(&self, _name: &str, _value: u64, tags: Option<&TelemetryTags>) {
                if let Ok(mut guard) = self.tags.lock() {
                    *guard = tags.cloned();
                }
            }

            fn record_timer_ms(&self, _name: &str, _duration_ms: u64, _tags: Option<&TelemetryTags>) {}

            fn start_timer(
                &self,
                _name: &str,
                _tags: Option<&TelemetryTags>,
            ) -> Box<dyn TelemetryTimer> {
                struct NoopTimer;
                impl TelemetryTimer for NoopTimer {
                    fn stop(&self) {}
                }
                Box::new(NoopTimer)
            }
        }

        let base = Arc::new(CaptureTelemetry {
            tags: Mutex::new(None),
        });
        let mut tags = TelemetryTags::new();
        tags.insert("topic".into(), "+/signalk/delta".into());
        let telemetry = TaggedTelemetry::new(base.clone(), tags);

        let mut extra = TelemetryTags::new();
        extra.insert("table".into(), "sensor_metrics".into());
        telemetry.increment_counter("ingest.decode.failed", 1, Some(&extra));

        let captured = base
            .tags
            .lock()
            .map_err(|_| "tags lock poisoned")?
            .clone()
            .ok_or("tags missing")?;
        assert_eq!(captured.get("topic").map(|value| &**value), Some("+/signalk/delta"));
        assert_eq!(captured.get("table").map(|value| &**value), Some("sensor_metrics"));
        Ok(())
    }
}
