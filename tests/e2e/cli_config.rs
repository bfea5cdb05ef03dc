//! `sensor-ingest config` end-to-end tests.

use sensor_ingest_testkit::fixtures::fixture_path;
use std::io;
use std::process::{Command, Output};

fn sensor_ingest(args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sensor-ingest"));
    command
        .args(args)
        .env_remove("DATABASE_URL")
        .env_remove("SENSOR_INGEST_STORE_URL")
        .env_remove("SENSOR_INGEST_BROKER_TOPIC")
        .env_remove("SENSOR_INGEST_BROKER_PORT");
    command
}

fn stdout_json(output: &Output) -> io::Result<serde_json::Value> {
    serde_json::from_slice(&output.stdout).map_err(io::Error::other)
}

#[test]
fn config_check_accepts_valid_config() -> io::Result<()> {
    let valid_config = fixture_path("config/ingest-config.valid.json");

    let output = sensor_ingest(&["--json", "config", "check", "--config"])
        .arg(&valid_config)
        .output()?;
    assert!(output.status.success());

    let value = stdout_json(&output)?;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["effectiveConfig"]["broker"]["port"], 1884);

    let output = sensor_ingest(&["config", "check", "--config"])
        .arg(&valid_config)
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("status: ok\n"));
    Ok(())
}

#[test]
fn config_check_rejects_invalid_config() -> io::Result<()> {
    let invalid_config = fixture_path("config/ingest-config.invalid.json");

    let output = sensor_ingest(&["--json", "config", "check", "--config"])
        .arg(&invalid_config)
        .output()?;
    assert_eq!(output.status.code(), Some(2));

    let value = stdout_json(&output)?;
    assert_eq!(value["status"], "error");
    let code = value["error"]["code"]
        .as_str()
        .ok_or_else(|| io::Error::other("missing error code"))?;
    assert!(code.starts_with("config:"), "unexpected code {code}");
    Ok(())
}

#[test]
fn config_show_renders_toml_without_secrets() -> io::Result<()> {
    let valid_config = fixture_path("config/ingest-config.valid.json");

    let output = sensor_ingest(&["config", "show", "--format", "toml", "--config"])
        .arg(&valid_config)
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[broker]"));
    assert!(stdout.contains("[store]"));
    assert!(!stdout.contains("mqtt-password"));
    assert!(!stdout.contains("pg-password"));
    Ok(())
}

#[test]
fn environment_overrides_config_file() -> io::Result<()> {
    let valid_config = fixture_path("config/ingest-config.valid.json");

    let output = sensor_ingest(&["--json", "config", "show", "--config"])
        .arg(&valid_config)
        .env("SENSOR_INGEST_BROKER_TOPIC", "vessels/self/delta")
        .output()?;
    assert!(output.status.success());

    let value = stdout_json(&output)?;
    assert_eq!(
        value["effectiveConfig"]["broker"]["topic"],
        "vessels/self/delta"
    );
    Ok(())
}
