//! `sensor-ingest run` end-to-end tests that stop before any network I/O.

use sensor_ingest_testkit::fixtures::fixture_path;
use std::io;
use std::process::Command;

#[test]
fn run_with_invalid_config_exits_before_connecting() -> io::Result<()> {
    let invalid_config = fixture_path("config/ingest-config.invalid.json");

    let output = Command::new(env!("CARGO_BIN_EXE_sensor-ingest"))
        .args(["--json", "run", "--config"])
        .arg(&invalid_config)
        .env_remove("DATABASE_URL")
        .output()?;
    assert_eq!(output.status.code(), Some(2));

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).map_err(io::Error::other)?;
    assert_eq!(value["status"], "error");
    Ok(())
}

#[test]
fn default_command_rejects_malformed_environment() -> io::Result<()> {
    let output = Command::new(env!("CARGO_BIN_EXE_sensor-ingest"))
        .env("SENSOR_INGEST_BROKER_PORT", "not-a-port")
        .env_remove("DATABASE_URL")
        .output()?;
    assert_eq!(output.status.code(), Some(2));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("status: error\n"));
    Ok(())
}
