//! Decode Signal K delta payloads into metric records.

use sensor_ingest_domain::{MetricRecord, MetricTime};
use sensor_ingest_shared::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value};

/// Required payload keys, in the order they are checked.
pub const REQUIRED_FIELDS: [&str; 4] = ["time", "context", "path", "value"];

/// Why a payload could not be turned into a metric record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Bytes are not UTF-8 JSON.
    #[error("payload is not valid JSON: {reason}")]
    InvalidJson {
        /// Parser message.
        reason: Box<str>,
    },
    /// JSON parsed, but the top level is not an object.
    #[error("payload is not a JSON object (found {found})")]
    NotAnObject {
        /// JSON type found instead.
        found: &'static str,
    },
    /// A required key is absent.
    #[error("payload is missing `{field}`")]
    MissingField {
        /// Missing key.
        field: &'static str,
    },
    /// A required key has the wrong JSON type.
    #[error("payload field `{field}` must be {expected}")]
    InvalidFieldType {
        /// Offending key.
        field: &'static str,
        /// Accepted JSON types.
        expected: &'static str,
    },
}

impl DecodeError {
    const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => "invalid_json",
            Self::NotAnObject { .. } => "not_an_object",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidFieldType { .. } => "invalid_field_type",
        }
    }
}

impl From<DecodeError> for ErrorEnvelope {
    fn from(error: DecodeError) -> Self {
        let mut envelope = Self::expected(ErrorCode::new("ingest", "decode_failed"), error.to_string())
            .with_metadata("reason", error.error_code());
        match &error {
            DecodeError::MissingField { field } | DecodeError::InvalidFieldType { field, .. } => {
                envelope = envelope.with_metadata("field", *field);
            },
            DecodeError::NotAnObject { found } => {
                envelope = envelope.with_metadata("found", *found);
            },
            DecodeError::InvalidJson { .. } => {},
        }
        envelope
    }
}

/// Decode one raw payload.
///
/// Only presence and JSON shape are checked: `context` and `path` must be
/// strings, `time` a string or a number; `value` is taken as-is, `null`
/// included. Nothing is coerced.
pub fn decode_metric(payload: &[u8]) -> Result<MetricRecord, DecodeError> {
    let parsed: Value = serde_json::from_slice(payload).map_err(|error| DecodeError::InvalidJson {
        reason: error.to_string().into(),
    })?;
    let mut object = match parsed {
        Value::Object(object) => object,
        other => {
            return Err(DecodeError::NotAnObject {
                found: json_type_name(&other),
            });
        },
    };

    for field in REQUIRED_FIELDS {
        if !object.contains_key(field) {
            return Err(DecodeError::MissingField { field });
        }
    }

    let time = object
        .get("time")
        .and_then(MetricTime::from_json)
        .ok_or(DecodeError::InvalidFieldType {
            field: "time",
            expected: "a string or a number",
        })?;
    let context = take_string(&mut object, "context")?;
    let path = take_string(&mut object, "path")?;
    let value = object.remove("value").unwrap_or(Value::Null);

    Ok(MetricRecord::new(time, context, path, value))
}

fn take_string(object: &mut Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match object.remove(field) {
        Some(Value::String(text)) => Ok(text),
        Some(_) => Err(DecodeError::InvalidFieldType {
            field,
            expected: "a string",
        }),
        None => Err(DecodeError::MissingField { field }),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decodes_a_signalk_delta() -> Result<(), DecodeError> {
        let payload = br#"{"time":"2024-05-01T12:00:00.000Z","context":"vessels.self","path":"navigation.speedOverGround","value":3.85}"#;
        let record = decode_metric(payload)?;
        assert_eq!(record.device_id(), "vessels.self");
        assert_eq!(record.path(), "navigation.speedOverGround");
        assert_eq!(record.value(), &json!(3.85));
        assert_eq!(
            record.time(),
            &MetricTime::Iso("2024-05-01T12:00:00.000Z".into())
        );
        Ok(())
    }

    #[test]
    fn null_and_structured_values_are_kept() -> Result<(), DecodeError> {
        let null = decode_metric(br#"{"time":1,"context":"c","path":"p","value":null}"#)?;
        assert_eq!(null.value(), &Value::Null);

        let object = decode_metric(
            br#"{"time":1714564800000,"context":"c","path":"navigation.position","value":{"latitude":60.1}}"#,
        )?;
        assert_eq!(object.value(), &json!({ "latitude": 60.1 }));
        assert_eq!(object.time().to_json(), json!(1_714_564_800_000_u64));
        Ok(())
    }

    #[test]
    fn malformed_payloads_are_classified() {
        assert!(matches!(
            decode_metric(b"not json"),
            Err(DecodeError::InvalidJson { .. })
        ));
        assert_eq!(
            decode_metric(b"[1,2]"),
            Err(DecodeError::NotAnObject { found: "array" })
        );
        assert_eq!(
            decode_metric(br#"{"time":"t","context":"c","value":1}"#),
            Err(DecodeError::MissingField { field: "path" })
        );
        assert_eq!(
            decode_metric(br#"{"time":true,"context":"c","path":"p","value":1}"#),
            Err(DecodeError::InvalidFieldType {
                field: "time",
                expected: "a string or a number",
            })
        );
        assert_eq!(
            decode_metric(br#"{"time":"t","context":7,"path":"p","value":1}"#),
            Err(DecodeError::InvalidFieldType {
                field: "context",
                expected: "a string",
            })
        );
    }

    #[test]
    fn decode_errors_map_to_envelopes() {
        let envelope = ErrorEnvelope::from(DecodeError::MissingField { field: "value" });
        assert_eq!(envelope.code, ErrorCode::new("ingest", "decode_failed"));
        assert_eq!(
            envelope.metadata.get("field").map(String::as_str),
            Some("value")
        );
        assert_eq!(
            envelope.metadata.get("reason").map(String::as_str),
            Some("missing_field")
        );
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ._:-]{0,16}".prop_map(Value::String),
        ]
    }

    fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    fn time_token() -> impl Strategy<Value = Value> {
        prop_oneof![
            "20[0-9]{2}-0[1-9]-1[0-9]T0[0-9]:00:00Z".prop_map(Value::String),
            (0_u64..4_000_000_000_000).prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn decode_then_project_round_trips(
            time in time_token(),
            context in "[a-z.:]{1,24}",
            path in "[a-zA-Z.]{1,32}",
            value in json_value(),
        ) {
            let payload = json!({
                "time": time,
                "context": context,
                "path": path,
                "value": value,
            });
            let bytes = serde_json::to_vec(&payload).map_err(|error| TestCaseError::fail(error.to_string()))?;
            let record = decode_metric(&bytes).map_err(|error| TestCaseError::fail(error.to_string()))?;
            prop_assert_eq!(record.to_payload(), payload);
        }
    }
}
