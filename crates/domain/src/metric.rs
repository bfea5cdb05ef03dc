//! Metric records decoded from Signal K delta messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Epoch magnitudes at or above this value are read as milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Source-supplied timestamp, kept as the token the publisher sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricTime {
    /// ISO-8601 text (cast by the store).
    Iso(Box<str>),
    /// Numeric epoch (seconds, or milliseconds for large magnitudes).
    Epoch(Number),
}

impl MetricTime {
    /// Build from a JSON value when it is a string or a number.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::Iso(text.as_str().into())),
            Value::Number(number) => Some(Self::Epoch(number.clone())),
            _ => None,
        }
    }

    /// Project back to the JSON token.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Iso(text) => Value::String(text.to_string()),
            Self::Epoch(number) => Value::Number(number.clone()),
        }
    }

    /// Epoch time in seconds, if this is a numeric time.
    ///
    /// Values whose magnitude is at least [`EPOCH_MILLIS_THRESHOLD`] are read as
    /// milliseconds.
    #[must_use]
    pub fn epoch_seconds(&self) -> Option<f64> {
        let Self::Epoch(number) = self else {
            return None;
        };
        let raw = number.as_f64()?;
        if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
            Some(raw / 1000.0)
        } else {
            Some(raw)
        }
    }
}

impl fmt::Display for MetricTime {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iso(text) => formatter.write_str(text),
            Self::Epoch(number) => write!(formatter, "{number}"),
        }
    }
}

/// One measurement from one device, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    time: MetricTime,
    device_id: Box<str>,
    path: Box<str>,
    value: Value,
}

impl MetricRecord {
    /// Assemble a record from already-decoded parts.
    #[must_use]
    pub fn new(
        time: MetricTime,
        device_id: impl Into<Box<str>>,
        path: impl Into<Box<str>>,
        value: Value,
    ) -> Self {
        Self {
            time,
            device_id: device_id.into(),
            path: path.into(),
            value,
        }
    }

    /// Source timestamp.
    #[must_use]
    pub const fn time(&self) -> &MetricTime {
        &self.time
    }

    /// Originating device (the payload `context`).
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Dotted signal path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Measured value, untouched.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Project back to a `{time, context, path, value}` object.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut object = Map::with_capacity(4);
        object.insert("time".to_owned(), self.time.to_json());
        object.insert("context".to_owned(), Value::String(self.device_id.to_string()));
        object.insert("path".to_owned(), Value::String(self.path.to_string()));
        object.insert("value".to_owned(), self.value.clone());
        Value::Object(object)
    }
}
