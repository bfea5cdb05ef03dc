//! Integration tests for parsing config fixtures from the workspace testkit.

use sensor_ingest_config::{
    CURRENT_CONFIG_VERSION, IngestEnv, LogLevelName, SaturationMode, ValueColumn,
    load_ingest_config_from_path, parse_ingest_config_json, parse_ingest_config_toml,
};
use sensor_ingest_shared::ErrorCode;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_dir.to_path_buf())
}

fn fixture_path(relative: &str) -> PathBuf {
    workspace_root()
        .join("crates")
        .join("testkit")
        .join("fixtures")
        .join(relative)
}

fn read_fixture(relative: &str) -> Result<String, Box<dyn Error>> {
    Ok(fs::read_to_string(fixture_path(relative))?)
}

#[test]
fn parses_valid_fixture_and_normalizes() -> Result<(), Box<dyn Error>> {
    let contents = read_fixture("config/ingest-config.valid.json")?;
    let config = parse_ingest_config_json(&contents)?;

    assert_eq!(config.version, CURRENT_CONFIG_VERSION);
    assert_eq!(&*config.broker.host, "broker.marina.local", "host should be trimmed");
    assert_eq!(config.broker.client_id, None, "blank client id should be dropped");
    assert_eq!(config.broker.qos, 1);
    assert_eq!(config.limits().broker_keep_alive_secs.get(), 30);

    assert_eq!(config.store.table.schema(), Some("public"));
    assert_eq!(config.store.value_column, ValueColumn::Double);
    assert!(config.store.ensure_schema);
    assert_eq!(&*config.store.effective_database(), "telemetry");

    assert_eq!(config.pipeline.on_saturation, SaturationMode::Drop);
    assert_eq!(config.limits().pipeline_max_in_flight_writes.get(), 32);
    assert_eq!(config.logging.level, LogLevelName::Debug);
    assert!(config.telemetry.enabled);

    Ok(())
}

#[test]
fn parses_default_toml_fixture() -> Result<(), Box<dyn Error>> {
    let contents = read_fixture("config/ingest-config.default.toml")?;
    let config = parse_ingest_config_toml(&contents)?;
    let defaults = parse_ingest_config_json("{}")?;

    assert_eq!(config.as_ref(), defaults.as_ref());
    Ok(())
}

#[test]
fn invalid_fixture_reports_error_code() -> Result<(), Box<dyn Error>> {
    let contents = read_fixture("config/ingest-config.invalid.json")?;
    let error = parse_ingest_config_json(&contents)
        .err()
        .ok_or_else(|| std::io::Error::other("expected invalid fixture error"))?;

    assert_eq!(error.code, ErrorCode::new("config", "invalid_timeout"));
    assert_eq!(
        error.metadata.get("section").map(String::as_str),
        Some("broker")
    );
    assert_eq!(
        error.metadata.get("field").map(String::as_str),
        Some("reconnectDelayMs")
    );

    Ok(())
}

#[test]
fn loads_fixture_from_path_by_extension() -> Result<(), Box<dyn Error>> {
    let env = IngestEnv::default();
    let from_toml = load_ingest_config_from_path(
        Some(&fixture_path("config/ingest-config.default.toml")),
        None,
        &env,
    )?;
    assert_eq!(from_toml.store.max_connections, 10);

    let from_json = load_ingest_config_from_path(
        Some(&fixture_path("config/ingest-config.valid.json")),
        Some(r#"{ "pipeline": { "maxInFlightWrites": 2 } }"#),
        &env,
    )?;
    assert_eq!(from_json.pipeline.max_in_flight_writes, 2);
    Ok(())
}

#[test]
fn missing_config_file_reports_path() -> Result<(), Box<dyn Error>> {
    let missing = fixture_path("config/does-not-exist.json");
    let error = load_ingest_config_from_path(Some(&missing), None, &IngestEnv::default())
        .err()
        .ok_or_else(|| std::io::Error::other("expected missing file error"))?;

    assert_eq!(error.code, ErrorCode::new("config", "config_file_not_found"));
    assert!(error.metadata.contains_key("path"));
    Ok(())
}
