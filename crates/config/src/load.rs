//! Config loading helpers (env + file + overrides).
//!
//! The loader is responsible for deterministic merge order and surfacing
//! user-facing errors as typed `ErrorEnvelope`s.

use crate::env::{set_box_str, set_clone, set_opt_box_str, set_value};
use crate::{
    IngestConfig, IngestEnv, LogLevelName, SaturationMode, ValidatedIngestConfig, ValueColumn,
    apply_env_overrides,
};
use sensor_ingest_domain::{TableName, TopicFilter};
use sensor_ingest_shared::{ErrorClass, ErrorCode, ErrorEnvelope, REDACTED};
use serde::Deserialize;
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

/// Load the ingest config from sources using a deterministic precedence order.
///
/// Precedence (highest wins):
/// - env overrides (`IngestEnv`)
/// - overrides JSON (partial config)
/// - config JSON (file content)
/// - defaults (`IngestConfig::default()`)
pub fn load_ingest_config_from_sources(
    config_json: Option<&str>,
    overrides_json: Option<&str>,
    env: &IngestEnv,
) -> Result<ValidatedIngestConfig, ErrorEnvelope> {
    let mut config = match config_json {
        None => IngestConfig::default(),
        Some(input) => parse_config_unvalidated(input, ConfigFormat::Json)?,
    };

    if let Some(input) = overrides_json {
        let overrides = parse_overrides_json(input)?;
        apply_overrides(&mut config, &overrides);
    }

    // env is applied last and also validates/normalizes the resulting config.
    apply_env_overrides(config, env)
}

/// Load the ingest config from an optional file path.
pub fn load_ingest_config_from_path(
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
    env: &IngestEnv,
) -> Result<ValidatedIngestConfig, ErrorEnvelope> {
    let mut config = match config_path {
        None => IngestConfig::default(),
        Some(path) => {
            let config_text = read_config_file(path)?;
            let format = detect_config_format(path)?;
            parse_config_unvalidated(&config_text, format)?
        },
    };

    if let Some(input) = overrides_json {
        let overrides = parse_overrides_json(input)?;
        apply_overrides(&mut config, &overrides);
    }

    apply_env_overrides(config, env)
}

/// Load the ingest config from std env and an optional file path.
pub fn load_ingest_config_std_env(
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<ValidatedIngestConfig, ErrorEnvelope> {
    let env = IngestEnv::from_std_env().map_err(ErrorEnvelope::from)?;
    load_ingest_config_from_path(config_path, overrides_json, &env)
}

/// Serialize the config as deterministic pretty JSON (with trailing newline).
///
/// Passwords and URL credentials are replaced with a placeholder.
pub fn to_pretty_json(config: &IngestConfig) -> Result<String, ErrorEnvelope> {
    let mut output = serde_json::to_string_pretty(&redact_secrets(config)).map_err(|error| {
        ErrorEnvelope::unexpected(
            ErrorCode::new("core", "internal"),
            format!("failed to serialize config: {error}"),
            ErrorClass::NonRetriable,
        )
    })?;
    output.push('\n');
    Ok(output)
}

/// Serialize the config as deterministic pretty TOML (with trailing newline).
///
/// Passwords and URL credentials are replaced with a placeholder.
pub fn to_pretty_toml(config: &IngestConfig) -> Result<String, ErrorEnvelope> {
    let mut output = toml::to_string_pretty(&redact_secrets(config)).map_err(|error| {
        ErrorEnvelope::unexpected(
            ErrorCode::new("config", "serialize_toml"),
            format!("failed to serialize config TOML: {error}"),
            ErrorClass::NonRetriable,
        )
    })?;
    output.push('\n');
    Ok(output)
}

fn redact_secrets(config: &IngestConfig) -> IngestConfig {
    let mut redacted = config.clone();
    if redacted.broker.password.is_some() {
        redacted.broker.password = Some(REDACTED.into());
    }
    if redacted.store.password.is_some() {
        redacted.store.password = Some(REDACTED.into());
    }
    redacted.store.url = redacted.store.url.as_deref().map(redact_url_password);
    redacted
}

fn redact_url_password(raw: &str) -> Box<str> {
    let Ok(mut parsed) = Url::parse(raw) else {
        return REDACTED.into();
    };
    if parsed.password().is_some() && parsed.set_password(Some("REDACTED")).is_err() {
        return REDACTED.into();
    }
    parsed.as_str().into()
}

fn parse_config_unvalidated(
    input: &str,
    format: ConfigFormat,
) -> Result<IngestConfig, ErrorEnvelope> {
    match format {
        ConfigFormat::Json => serde_json::from_str(input).map_err(|error| {
            ErrorEnvelope::expected(
                ErrorCode::new("config", "invalid_json"),
                format!("invalid config JSON: {error}"),
            )
            .with_metadata("source", "config")
        }),
        ConfigFormat::Toml => toml::from_str(input).map_err(|error| {
            ErrorEnvelope::expected(
                ErrorCode::new("config", "invalid_toml"),
                format!("invalid config TOML: {error}"),
            )
            .with_metadata("source", "config")
        }),
    }
}

fn parse_overrides_json(input: &str) -> Result<IngestConfigOverrides, ErrorEnvelope> {
    serde_json::from_str(input).map_err(|error| {
        ErrorEnvelope::expected(
            ErrorCode::new("config", "invalid_json"),
            format!("invalid overrides JSON: {error}"),
        )
        .with_metadata("source", "overrides")
    })
}

fn read_config_file(path: &Path) -> Result<String, ErrorEnvelope> {
    std::fs::read_to_string(path).map_err(|error| {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::new("config", "config_file_not_found"),
            std::io::ErrorKind::PermissionDenied => {
                ErrorCode::new("config", "config_file_permission_denied")
            },
            _ => ErrorCode::new("config", "config_file_io"),
        };

        ErrorEnvelope::expected(code, format!("failed to read config file: {error}"))
            .with_metadata("path", path.to_string_lossy().to_string())
    })
}

fn detect_config_format(path: &Path) -> Result<ConfigFormat, ErrorEnvelope> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        None | Some("json") => Ok(ConfigFormat::Json),
        Some("toml") => Ok(ConfigFormat::Toml),
        Some(other) => Err(ErrorEnvelope::expected(
            ErrorCode::new("config", "unsupported_format"),
            "unsupported config format; use .json or .toml",
        )
        .with_metadata("extension", other.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct IngestConfigOverrides {
    version: Option<u32>,
    broker: BrokerConfigOverrides,
    store: StoreConfigOverrides,
    pipeline: PipelineConfigOverrides,
    logging: LoggingConfigOverrides,
    telemetry: TelemetryConfigOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct BrokerConfigOverrides {
    host: Option<Box<str>>,
    port: Option<u16>,
    topic: Option<TopicFilter>,
    client_id: Option<Box<str>>,
    username: Option<Box<str>>,
    password: Option<Box<str>>,
    keep_alive_secs: Option<u64>,
    qos: Option<u8>,
    reconnect_delay_ms: Option<u64>,
    clean_session: Option<bool>,
    max_packet_bytes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct StoreConfigOverrides {
    url: Option<Box<str>>,
    host: Option<Box<str>>,
    port: Option<u16>,
    database: Option<Box<str>>,
    username: Option<Box<str>>,
    password: Option<Box<str>>,
    table: Option<TableName>,
    value_column: Option<ValueColumn>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    statement_timeout_ms: Option<u64>,
    ensure_schema: Option<bool>,
    transactional: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct PipelineConfigOverrides {
    max_in_flight_writes: Option<u32>,
    on_saturation: Option<SaturationMode>,
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct LoggingConfigOverrides {
    level: Option<LogLevelName>,
    log_payloads: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct TelemetryConfigOverrides {
    enabled: Option<bool>,
}

fn apply_overrides(config: &mut IngestConfig, overrides: &IngestConfigOverrides) {
    set_value(&mut config.version, overrides.version);
    apply_broker_overrides(config, &overrides.broker);
    apply_store_overrides(config, &overrides.store);

    let pipeline = &mut config.pipeline;
    set_value(
        &mut pipeline.max_in_flight_writes,
        overrides.pipeline.max_in_flight_writes,
    );
    set_value(
        &mut pipeline.on_saturation,
        overrides.pipeline.on_saturation,
    );
    set_value(
        &mut pipeline.drain_timeout_ms,
        overrides.pipeline.drain_timeout_ms,
    );

    set_value(&mut config.logging.level, overrides.logging.level);
    set_value(
        &mut config.logging.log_payloads,
        overrides.logging.log_payloads,
    );
    set_value(&mut config.telemetry.enabled, overrides.telemetry.enabled);
}

fn apply_broker_overrides(config: &mut IngestConfig, overrides: &BrokerConfigOverrides) {
    let broker = &mut config.broker;
    set_box_str(&mut broker.host, overrides.host.as_deref());
    set_value(&mut broker.port, overrides.port);
    set_clone(&mut broker.topic, overrides.topic.as_ref());
    set_opt_box_str(&mut broker.client_id, overrides.client_id.as_deref());
    set_opt_box_str(&mut broker.username, overrides.username.as_deref());
    set_opt_box_str(&mut broker.password, overrides.password.as_deref());
    set_value(&mut broker.keep_alive_secs, overrides.keep_alive_secs);
    set_value(&mut broker.qos, overrides.qos);
    set_value(&mut broker.reconnect_delay_ms, overrides.reconnect_delay_ms);
    set_value(&mut broker.clean_session, overrides.clean_session);
    set_value(&mut broker.max_packet_bytes, overrides.max_packet_bytes);
}

fn apply_store_overrides(config: &mut IngestConfig, overrides: &StoreConfigOverrides) {
    let store = &mut config.store;
    set_opt_box_str(&mut store.url, overrides.url.as_deref());
    set_box_str(&mut store.host, overrides.host.as_deref());
    set_value(&mut store.port, overrides.port);
    set_box_str(&mut store.database, overrides.database.as_deref());
    set_box_str(&mut store.username, overrides.username.as_deref());
    set_opt_box_str(&mut store.password, overrides.password.as_deref());
    set_clone(&mut store.table, overrides.table.as_ref());
    set_value(&mut store.value_column, overrides.value_column);
    set_value(&mut store.max_connections, overrides.max_connections);
    set_value(&mut store.acquire_timeout_ms, overrides.acquire_timeout_ms);
    set_value(
        &mut store.statement_timeout_ms,
        overrides.statement_timeout_ms,
    );
    set_value(&mut store.ensure_schema, overrides.ensure_schema);
    set_value(&mut store.transactional, overrides.transactional);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_precedence_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let config_json = r#"{
          "version": 1,
          "store": { "acquireTimeoutMs": 4000, "maxConnections": 4 }
        }"#;

        let overrides_json = r#"{
          "store": { "acquireTimeoutMs": 5000 }
        }"#;

        let env = IngestEnv {
            store_acquire_timeout_ms: Some(6000),
            ..IngestEnv::default()
        };

        let config =
            load_ingest_config_from_sources(Some(config_json), Some(overrides_json), &env)?;
        assert_eq!(config.store.acquire_timeout_ms, 6000);
        assert_eq!(config.store.max_connections, 4);
        Ok(())
    }

    #[test]
    fn serialization_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let env = IngestEnv::default();
        let config = load_ingest_config_from_sources(None, None, &env)?;
        let first = to_pretty_json(&config)?;
        let second = to_pretty_json(&config)?;
        assert_eq!(first, second);
        assert!(first.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn serialized_config_hides_secrets() -> Result<(), Box<dyn std::error::Error>> {
        let config_json = r#"{
          "broker": { "username": "boat", "password": "mqtt-secret" },
          "store": { "url": "postgres://ingest:pg-secret@db:5432/metrics" }
        }"#;
        let config = load_ingest_config_from_sources(Some(config_json), None, &IngestEnv::default())?;

        for rendered in [to_pretty_json(&config)?, to_pretty_toml(&config)?] {
            assert!(!rendered.contains("mqtt-secret"));
            assert!(!rendered.contains("pg-secret"));
            assert!(rendered.contains("ingest"));
        }
        Ok(())
    }

    #[test]
    fn invalid_config_value_overridden_by_valid_env_succeeds()
    -> Result<(), Box<dyn std::error::Error>> {
        // 50ms is below the 100ms floor; env replaces it before validation runs.
        let config_json = r#"{
          "version": 1,
          "store": { "statementTimeoutMs": 50 }
        }"#;

        let env = IngestEnv {
            store_statement_timeout_ms: Some(2000),
            ..IngestEnv::default()
        };

        let config = load_ingest_config_from_sources(Some(config_json), None, &env)?;
        assert_eq!(config.store.statement_timeout_ms, 2000);
        Ok(())
    }

    #[test]
    fn valid_config_with_invalid_overrides_fails() -> Result<(), Box<dyn std::error::Error>> {
        let config_json = r#"{ "version": 1 }"#;
        let overrides_json = r#"{ "store": { "acquireTimeoutMs": }"#;

        let result = load_ingest_config_from_sources(
            Some(config_json),
            Some(overrides_json),
            &IngestEnv::default(),
        );

        let error = result
            .err()
            .ok_or_else(|| std::io::Error::other("expected overrides error"))?;
        assert_eq!(error.code, ErrorCode::new("config", "invalid_json"));
        assert_eq!(
            error.metadata.get("source").map(String::as_str),
            Some("overrides")
        );
        Ok(())
    }

    #[test]
    fn env_validation_fails_with_invalid_env_value() -> Result<(), Box<dyn std::error::Error>> {
        let env = IngestEnv {
            pipeline_max_in_flight_writes: Some(0),
            ..IngestEnv::default()
        };

        let error = load_ingest_config_from_sources(None, None, &env)
            .err()
            .ok_or_else(|| std::io::Error::other("expected env validation error"))?;
        assert_eq!(error.code, ErrorCode::new("config", "invalid_limit"));
        assert_eq!(
            error.metadata.get("field").map(String::as_str),
            Some("maxInFlightWrites")
        );
        Ok(())
    }

    #[test]
    fn unknown_extension_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let error = detect_config_format(Path::new("ingest.yaml"))
            .err()
            .ok_or_else(|| std::io::Error::other("expected format error"))?;
        assert_eq!(error.code, ErrorCode::new("config", "unsupported_format"));
        assert_eq!(
            error.metadata.get("extension").map(String::as_str),
            Some("yaml")
        );
        Ok(())
    }
}
