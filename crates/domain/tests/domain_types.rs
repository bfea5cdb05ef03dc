//! Integration coverage for domain types and their error envelopes.

use sensor_ingest_domain::{
    MetricRecord, MetricTime, TableName, TableNameError, TopicFilter, TopicFilterError,
};
use sensor_ingest_shared::ErrorEnvelope;
use serde_json::json;
use std::error::Error;

#[test]
fn domain_errors_map_into_error_envelopes() -> Result<(), TableNameError> {
    let Err(error) = TableName::parse("bad-name") else {
        return Err(TableNameError::InvalidIdentifier {
            input: "bad-name".to_owned(),
        });
    };

    let envelope: ErrorEnvelope = error.into();
    assert_eq!(envelope.code.namespace(), "domain");
    assert_eq!(envelope.code.code(), "invalid_table_name");
    assert_eq!(envelope.metadata.get("input"), Some(&"bad-name".to_owned()));

    let envelope: ErrorEnvelope = TopicFilterError::Empty.into();
    assert_eq!(envelope.code.code(), "empty_topic_filter");
    Ok(())
}

#[test]
fn identifiers_deserialize_through_validation() -> Result<(), Box<dyn Error>> {
    let table: TableName = serde_json::from_value(json!("public.sensor_metrics"))?;
    assert_eq!(table.quoted(), "\"public\".\"sensor_metrics\"");
    assert!(serde_json::from_value::<TableName>(json!("x;y")).is_err());

    let filter: TopicFilter = serde_json::from_value(json!("+/signalk/delta"))?;
    assert!(filter.matches("self/signalk/delta"));
    assert!(serde_json::from_value::<TopicFilter>(json!("a/#/b")).is_err());

    assert_eq!(serde_json::to_value(&filter)?, json!("+/signalk/delta"));
    Ok(())
}

#[test]
fn record_payload_is_stable() {
    let record = MetricRecord::new(
        MetricTime::Iso("2024-05-01T00:00:00Z".into()),
        "vessels.self",
        "environment.wind.speedApparent",
        json!(null),
    );
    assert_eq!(record.value(), &json!(null));
    assert_eq!(record.device_id(), "vessels.self");
    assert_eq!(
        record.to_payload().get("time"),
        Some(&json!("2024-05-01T00:00:00Z"))
    );
}
