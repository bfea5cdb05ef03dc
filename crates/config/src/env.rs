//! Environment variable parsing and env-to-config merging.
//!
//! This module keeps env parsing:
//! - strict (invalid values fail fast)
//! - safe (secret values are redacted in error metadata, URLs lose credentials)

use crate::schema::{
    IngestConfig, LogLevelName, SaturationMode, ValidatedIngestConfig, ValueColumn,
    is_postgres_url, sanitize_url_for_error,
};
use sensor_ingest_domain::{TableName, TopicFilter};
use sensor_ingest_shared::{ErrorCode, ErrorEnvelope, REDACTED_VALUE, SecretString, is_secret_key};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Env var: broker address as `mqtt://[user:pass@]host[:port]`.
pub const ENV_BROKER_URL: &str = "SENSOR_INGEST_BROKER_URL";
/// Env var: broker host.
pub const ENV_BROKER_HOST: &str = "SENSOR_INGEST_BROKER_HOST";
/// Env var: broker port.
pub const ENV_BROKER_PORT: &str = "SENSOR_INGEST_BROKER_PORT";
/// Env var: subscription topic filter.
pub const ENV_BROKER_TOPIC: &str = "SENSOR_INGEST_BROKER_TOPIC";
/// Env var: MQTT client id.
pub const ENV_BROKER_CLIENT_ID: &str = "SENSOR_INGEST_BROKER_CLIENT_ID";
/// Env var: broker username.
pub const ENV_BROKER_USERNAME: &str = "SENSOR_INGEST_BROKER_USERNAME";
/// Env var: broker password (secret).
// gitleaks:allow
pub const ENV_BROKER_PASSWORD: &str = "SENSOR_INGEST_BROKER_PASSWORD";
/// Env var: MQTT keep-alive in seconds.
pub const ENV_BROKER_KEEP_ALIVE_SECS: &str = "SENSOR_INGEST_BROKER_KEEP_ALIVE_SECS";
/// Env var: subscription QoS.
pub const ENV_BROKER_QOS: &str = "SENSOR_INGEST_BROKER_QOS";
/// Env var: reconnect delay in milliseconds.
pub const ENV_BROKER_RECONNECT_DELAY_MS: &str = "SENSOR_INGEST_BROKER_RECONNECT_DELAY_MS";
/// Env var: largest MQTT packet in bytes.
pub const ENV_BROKER_MAX_PACKET_BYTES: &str = "SENSOR_INGEST_BROKER_MAX_PACKET_BYTES";

/// Env var: store connection string.
pub const ENV_STORE_URL: &str = "SENSOR_INGEST_STORE_URL";
/// Env var: store connection string (alias).
pub const ENV_STORE_URL_ALIAS: &str = "DATABASE_URL";
/// Env var: store host.
pub const ENV_STORE_HOST: &str = "SENSOR_INGEST_STORE_HOST";
/// Env var: store port.
pub const ENV_STORE_PORT: &str = "SENSOR_INGEST_STORE_PORT";
/// Env var: store database name.
pub const ENV_STORE_DATABASE: &str = "SENSOR_INGEST_STORE_DATABASE";
/// Env var: store username.
pub const ENV_STORE_USERNAME: &str = "SENSOR_INGEST_STORE_USERNAME";
/// Env var: store password (secret).
// gitleaks:allow
pub const ENV_STORE_PASSWORD: &str = "SENSOR_INGEST_STORE_PASSWORD";
/// Env var: metric table.
pub const ENV_STORE_TABLE: &str = "SENSOR_INGEST_STORE_TABLE";
/// Env var: `value` column encoding (`json` | `double` | `text`).
pub const ENV_STORE_VALUE_COLUMN: &str = "SENSOR_INGEST_STORE_VALUE_COLUMN";
/// Env var: pool size.
pub const ENV_STORE_MAX_CONNECTIONS: &str = "SENSOR_INGEST_STORE_MAX_CONNECTIONS";
/// Env var: connection acquisition timeout in milliseconds.
pub const ENV_STORE_ACQUIRE_TIMEOUT_MS: &str = "SENSOR_INGEST_STORE_ACQUIRE_TIMEOUT_MS";
/// Env var: insert timeout in milliseconds.
pub const ENV_STORE_STATEMENT_TIMEOUT_MS: &str = "SENSOR_INGEST_STORE_STATEMENT_TIMEOUT_MS";
/// Env var: create the table at startup.
pub const ENV_STORE_ENSURE_SCHEMA: &str = "SENSOR_INGEST_STORE_ENSURE_SCHEMA";
/// Env var: wrap inserts in `BEGIN`/`COMMIT`.
pub const ENV_STORE_TRANSACTIONAL: &str = "SENSOR_INGEST_STORE_TRANSACTIONAL";

/// Env var: in-flight write cap.
pub const ENV_PIPELINE_MAX_IN_FLIGHT_WRITES: &str = "SENSOR_INGEST_PIPELINE_MAX_IN_FLIGHT_WRITES";
/// Env var: saturation behavior (`wait` | `drop`).
pub const ENV_PIPELINE_ON_SATURATION: &str = "SENSOR_INGEST_PIPELINE_ON_SATURATION";
/// Env var: shutdown drain timeout in milliseconds.
pub const ENV_PIPELINE_DRAIN_TIMEOUT_MS: &str = "SENSOR_INGEST_PIPELINE_DRAIN_TIMEOUT_MS";

/// Env var: minimum log level.
pub const ENV_LOG_LEVEL: &str = "SENSOR_INGEST_LOG_LEVEL";
/// Env var: log message payloads at debug level.
pub const ENV_LOG_PAYLOADS: &str = "SENSOR_INGEST_LOG_PAYLOADS";
/// Env var: emit telemetry lines.
pub const ENV_TELEMETRY_ENABLED: &str = "SENSOR_INGEST_TELEMETRY_ENABLED";

const KNOWN_VARS: [&str; 31] = [
    ENV_BROKER_URL,
    ENV_BROKER_HOST,
    ENV_BROKER_PORT,
    ENV_BROKER_TOPIC,
    ENV_BROKER_CLIENT_ID,
    ENV_BROKER_USERNAME,
    ENV_BROKER_PASSWORD,
    ENV_BROKER_KEEP_ALIVE_SECS,
    ENV_BROKER_QOS,
    ENV_BROKER_RECONNECT_DELAY_MS,
    ENV_BROKER_MAX_PACKET_BYTES,
    ENV_STORE_URL,
    ENV_STORE_URL_ALIAS,
    ENV_STORE_HOST,
    ENV_STORE_PORT,
    ENV_STORE_DATABASE,
    ENV_STORE_USERNAME,
    ENV_STORE_PASSWORD,
    ENV_STORE_TABLE,
    ENV_STORE_VALUE_COLUMN,
    ENV_STORE_MAX_CONNECTIONS,
    ENV_STORE_ACQUIRE_TIMEOUT_MS,
    ENV_STORE_STATEMENT_TIMEOUT_MS,
    ENV_STORE_ENSURE_SCHEMA,
    ENV_STORE_TRANSACTIONAL,
    ENV_PIPELINE_MAX_IN_FLIGHT_WRITES,
    ENV_PIPELINE_ON_SATURATION,
    ENV_PIPELINE_DRAIN_TIMEOUT_MS,
    ENV_LOG_LEVEL,
    ENV_LOG_PAYLOADS,
    ENV_TELEMETRY_ENABLED,
];

const BROKER_URL_SCHEMES: [&str; 2] = ["mqtt", "tcp"];

/// Broker address parsed from [`ENV_BROKER_URL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Broker host.
    pub host: Box<str>,
    /// Broker port, when the URL names one.
    pub port: Option<u16>,
    /// Username embedded in the URL.
    pub username: Option<Box<str>>,
    /// Password embedded in the URL.
    pub password: Option<SecretString>,
}

/// Typed env-derived overrides for `IngestConfig`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestEnv {
    /// Override for `broker.host`/`port`/`username`/`password` in one go.
    pub broker_url: Option<BrokerAddress>,
    /// Override for `broker.host`.
    pub broker_host: Option<Box<str>>,
    /// Override for `broker.port`.
    pub broker_port: Option<u16>,
    /// Override for `broker.topic`.
    pub broker_topic: Option<TopicFilter>,
    /// Override for `broker.clientId`.
    pub broker_client_id: Option<Box<str>>,
    /// Override for `broker.username`.
    pub broker_username: Option<Box<str>>,
    /// Secret: broker password.
    pub broker_password: Option<SecretString>,
    /// Override for `broker.keepAliveSecs`.
    pub broker_keep_alive_secs: Option<u64>,
    /// Override for `broker.qos`.
    pub broker_qos: Option<u8>,
    /// Override for `broker.reconnectDelayMs`.
    pub broker_reconnect_delay_ms: Option<u64>,
    /// Override for `broker.maxPacketBytes`.
    pub broker_max_packet_bytes: Option<u32>,

    /// Secret: store connection string (may embed a password).
    pub store_url: Option<SecretString>,
    /// Override for `store.host`.
    pub store_host: Option<Box<str>>,
    /// Override for `store.port`.
    pub store_port: Option<u16>,
    /// Override for `store.database`.
    pub store_database: Option<Box<str>>,
    /// Override for `store.username`.
    pub store_username: Option<Box<str>>,
    /// Secret: store password.
    pub store_password: Option<SecretString>,
    /// Override for `store.table`.
    pub store_table: Option<TableName>,
    /// Override for `store.valueColumn`.
    pub store_value_column: Option<ValueColumn>,
    /// Override for `store.maxConnections`.
    pub store_max_connections: Option<u32>,
    /// Override for `store.acquireTimeoutMs`.
    pub store_acquire_timeout_ms: Option<u64>,
    /// Override for `store.statementTimeoutMs`.
    pub store_statement_timeout_ms: Option<u64>,
    /// Override for `store.ensureSchema`.
    pub store_ensure_schema: Option<bool>,
    /// Override for `store.transactional`.
    pub store_transactional: Option<bool>,

    /// Override for `pipeline.maxInFlightWrites`.
    pub pipeline_max_in_flight_writes: Option<u32>,
    /// Override for `pipeline.onSaturation`.
    pub pipeline_on_saturation: Option<SaturationMode>,
    /// Override for `pipeline.drainTimeoutMs`.
    pub pipeline_drain_timeout_ms: Option<u64>,

    /// Override for `logging.level`.
    pub log_level: Option<LogLevelName>,
    /// Override for `logging.logPayloads`.
    pub log_payloads: Option<bool>,
    /// Override for `telemetry.enabled`.
    pub telemetry_enabled: Option<bool>,
}

impl IngestEnv {
    /// Parse env overrides from a key/value map (useful for tests and fixtures).
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, EnvParseError> {
        Ok(Self {
            broker_url: parse_optional_broker_url(map, ENV_BROKER_URL)?,
            broker_host: parse_optional_trimmed_string(map, ENV_BROKER_HOST)?,
            broker_port: parse_optional_u16(map, ENV_BROKER_PORT)?,
            broker_topic: parse_optional_topic(map, ENV_BROKER_TOPIC)?,
            broker_client_id: parse_optional_trimmed_string(map, ENV_BROKER_CLIENT_ID)?,
            broker_username: parse_optional_trimmed_string(map, ENV_BROKER_USERNAME)?,
            broker_password: parse_optional_secret(map, ENV_BROKER_PASSWORD)?,
            broker_keep_alive_secs: parse_optional_u64(map, ENV_BROKER_KEEP_ALIVE_SECS)?,
            broker_qos: parse_optional_u8(map, ENV_BROKER_QOS)?,
            broker_reconnect_delay_ms: parse_optional_u64(map, ENV_BROKER_RECONNECT_DELAY_MS)?,
            broker_max_packet_bytes: parse_optional_u32(map, ENV_BROKER_MAX_PACKET_BYTES)?,
            store_url: parse_optional_store_url_any(map, &[ENV_STORE_URL, ENV_STORE_URL_ALIAS])?,
            store_host: parse_optional_trimmed_string(map, ENV_STORE_HOST)?,
            store_port: parse_optional_u16(map, ENV_STORE_PORT)?,
            store_database: parse_optional_trimmed_string(map, ENV_STORE_DATABASE)?,
            store_username: parse_optional_trimmed_string(map, ENV_STORE_USERNAME)?,
            store_password: parse_optional_secret(map, ENV_STORE_PASSWORD)?,
            store_table: parse_optional_table(map, ENV_STORE_TABLE)?,
            store_value_column: parse_optional_enum(
                map,
                ENV_STORE_VALUE_COLUMN,
                ValueColumn::parse,
            )?,
            store_max_connections: parse_optional_u32(map, ENV_STORE_MAX_CONNECTIONS)?,
            store_acquire_timeout_ms: parse_optional_u64(map, ENV_STORE_ACQUIRE_TIMEOUT_MS)?,
            store_statement_timeout_ms: parse_optional_u64(map, ENV_STORE_STATEMENT_TIMEOUT_MS)?,
            store_ensure_schema: parse_optional_bool(map, ENV_STORE_ENSURE_SCHEMA)?,
            store_transactional: parse_optional_bool(map, ENV_STORE_TRANSACTIONAL)?,
            pipeline_max_in_flight_writes: parse_optional_u32(
                map,
                ENV_PIPELINE_MAX_IN_FLIGHT_WRITES,
            )?,
            pipeline_on_saturation: parse_optional_enum(
                map,
                ENV_PIPELINE_ON_SATURATION,
                SaturationMode::parse,
            )?,
            pipeline_drain_timeout_ms: parse_optional_u64(map, ENV_PIPELINE_DRAIN_TIMEOUT_MS)?,
            log_level: parse_optional_enum(map, ENV_LOG_LEVEL, LogLevelName::parse)?,
            log_payloads: parse_optional_bool(map, ENV_LOG_PAYLOADS)?,
            telemetry_enabled: parse_optional_bool(map, ENV_TELEMETRY_ENABLED)?,
        })
    }

    /// Parse env overrides from the current process environment.
    pub fn from_std_env() -> Result<Self, EnvParseError> {
        let mut map = BTreeMap::new();
        for name in KNOWN_VARS {
            if let Ok(value) = std::env::var(name) {
                map.insert(name.to_string(), value);
            }
        }

        Self::from_map(&map)
    }
}

/// Apply env overrides to a base config (env wins over file/default values).
///
/// `SENSOR_INGEST_BROKER_URL` is applied first so the discrete broker vars can refine it.
pub fn apply_env_overrides(
    base: IngestConfig,
    env: &IngestEnv,
) -> Result<ValidatedIngestConfig, ErrorEnvelope> {
    let mut config = base;
    apply_broker_env_overrides(&mut config, env);
    apply_store_env_overrides(&mut config, env);
    apply_pipeline_env_overrides(&mut config, env);

    set_value(&mut config.logging.level, env.log_level);
    set_value(&mut config.logging.log_payloads, env.log_payloads);
    set_value(&mut config.telemetry.enabled, env.telemetry_enabled);

    config.validate_and_normalize().map_err(Into::into)
}

fn apply_broker_env_overrides(config: &mut IngestConfig, env: &IngestEnv) {
    let broker = &mut config.broker;
    if let Some(address) = &env.broker_url {
        broker.host = address.host.clone();
        set_value(&mut broker.port, address.port);
        set_opt_box_str(&mut broker.username, address.username.as_deref());
        set_opt_box_str(
            &mut broker.password,
            address.password.as_ref().map(SecretString::expose),
        );
    }
    set_box_str(&mut broker.host, env.broker_host.as_deref());
    set_value(&mut broker.port, env.broker_port);
    set_clone(&mut broker.topic, env.broker_topic.as_ref());
    set_opt_box_str(&mut broker.client_id, env.broker_client_id.as_deref());
    set_opt_box_str(&mut broker.username, env.broker_username.as_deref());
    set_opt_box_str(
        &mut broker.password,
        env.broker_password.as_ref().map(SecretString::expose),
    );
    set_value(&mut broker.keep_alive_secs, env.broker_keep_alive_secs);
    set_value(&mut broker.qos, env.broker_qos);
    set_value(&mut broker.reconnect_delay_ms, env.broker_reconnect_delay_ms);
    set_value(&mut broker.max_packet_bytes, env.broker_max_packet_bytes);
}

fn apply_store_env_overrides(config: &mut IngestConfig, env: &IngestEnv) {
    let store = &mut config.store;
    set_opt_box_str(
        &mut store.url,
        env.store_url.as_ref().map(SecretString::expose),
    );
    set_box_str(&mut store.host, env.store_host.as_deref());
    set_value(&mut store.port, env.store_port);
    set_box_str(&mut store.database, env.store_database.as_deref());
    set_box_str(&mut store.username, env.store_username.as_deref());
    set_opt_box_str(
        &mut store.password,
        env.store_password.as_ref().map(SecretString::expose),
    );
    set_clone(&mut store.table, env.store_table.as_ref());
    set_value(&mut store.value_column, env.store_value_column);
    set_value(&mut store.max_connections, env.store_max_connections);
    set_value(&mut store.acquire_timeout_ms, env.store_acquire_timeout_ms);
    set_value(
        &mut store.statement_timeout_ms,
        env.store_statement_timeout_ms,
    );
    set_value(&mut store.ensure_schema, env.store_ensure_schema);
    set_value(&mut store.transactional, env.store_transactional);
}

fn apply_pipeline_env_overrides(config: &mut IngestConfig, env: &IngestEnv) {
    let pipeline = &mut config.pipeline;
    set_value(
        &mut pipeline.max_in_flight_writes,
        env.pipeline_max_in_flight_writes,
    );
    set_value(&mut pipeline.on_saturation, env.pipeline_on_saturation);
    set_value(&mut pipeline.drain_timeout_ms, env.pipeline_drain_timeout_ms);
}

pub(crate) fn set_value<T: Copy>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

pub(crate) fn set_clone<T: Clone>(field: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

pub(crate) fn set_box_str(field: &mut Box<str>, value: Option<&str>) {
    if let Some(value) = value {
        *field = value.into();
    }
}

pub(crate) fn set_opt_box_str(field: &mut Option<Box<str>>, value: Option<&str>) {
    if let Some(value) = value {
        *field = Some(value.into());
    }
}

/// Validation failures when parsing env variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvParseError {
    /// An env var was present but empty after trimming.
    EmptyValue {
        /// Env var name.
        var: &'static str,
    },
    /// A secret env var was present but empty after trimming.
    EmptySecret {
        /// Env var name.
        var: &'static str,
    },
    /// Boolean env var had an invalid value.
    InvalidBool {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// Integer env var had an invalid value.
    InvalidInt {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// URL env var had an invalid value.
    InvalidUrl {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// Enum env var had an invalid value.
    InvalidEnum {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// Topic filter or table name env var failed domain validation.
    InvalidIdentifier {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
        /// Validation failure message.
        reason: String,
    },
}

impl EnvParseError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::EmptyValue { .. } | Self::EmptySecret { .. } => {
                ErrorCode::new("config", "empty_env_var")
            },
            Self::InvalidBool { .. } => ErrorCode::new("config", "invalid_env_bool"),
            Self::InvalidInt { .. } => ErrorCode::new("config", "invalid_env_int"),
            Self::InvalidUrl { .. } => ErrorCode::new("config", "invalid_env_url"),
            Self::InvalidEnum { .. } => ErrorCode::new("config", "invalid_env_enum"),
            Self::InvalidIdentifier { .. } => ErrorCode::new("config", "invalid_env_identifier"),
        }
    }
}

impl fmt::Display for EnvParseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyValue { var } | Self::EmptySecret { var } => {
                write!(formatter, "{var} must be non-empty")
            },
            Self::InvalidBool { var, .. } => write!(formatter, "{var} must be a boolean"),
            Self::InvalidInt { var, .. } => write!(formatter, "{var} must be an integer"),
            Self::InvalidUrl { var, .. } => write!(formatter, "{var} must be a valid URL"),
            Self::InvalidEnum { var, .. } => write!(formatter, "{var} has an unsupported value"),
            Self::InvalidIdentifier { var, reason, .. } => write!(formatter, "{var}: {reason}"),
        }
    }
}

impl std::error::Error for EnvParseError {}

impl From<EnvParseError> for ErrorEnvelope {
    fn from(error: EnvParseError) -> Self {
        let code = error.error_code();
        let message = error.to_string();
        let envelope = Self::expected(code, message);

        match error {
            EnvParseError::EmptyValue { var } | EnvParseError::EmptySecret { var } => {
                envelope.with_metadata("env_var", var)
            },
            EnvParseError::InvalidUrl { var, value } => envelope
                .with_metadata("env_var", var)
                .with_metadata("value", sanitize_url_for_error(value.trim())),
            EnvParseError::InvalidBool { var, value }
            | EnvParseError::InvalidInt { var, value }
            | EnvParseError::InvalidEnum { var, value }
            | EnvParseError::InvalidIdentifier { var, value, .. } => envelope
                .with_metadata("env_var", var)
                .with_metadata("value", redact_value(var, &value)),
        }
    }
}

fn parse_optional_trimmed_string(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<Box<str>>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptyValue { var });
    }

    Ok(Some(trimmed.to_owned().into_boxed_str()))
}

fn parse_optional_secret(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<SecretString>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptySecret { var });
    }

    Ok(Some(SecretString::new(trimmed.to_owned())))
}

fn parse_optional_int<T: std::str::FromStr>(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<T>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptyValue { var });
    }

    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| EnvParseError::InvalidInt {
            var,
            value: raw.clone(),
        })
}

fn parse_optional_u64(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u64>, EnvParseError> {
    parse_optional_int(map, var)
}

fn parse_optional_u32(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u32>, EnvParseError> {
    parse_optional_int(map, var)
}

fn parse_optional_u16(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u16>, EnvParseError> {
    parse_optional_int(map, var)
}

fn parse_optional_u8(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u8>, EnvParseError> {
    parse_optional_int(map, var)
}

fn parse_optional_bool(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<bool>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptyValue { var });
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(EnvParseError::InvalidBool {
            var,
            value: raw.clone(),
        }),
    }
}

fn parse_optional_enum<T>(
    map: &BTreeMap<String, String>,
    var: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptyValue { var });
    }

    parse(trimmed)
        .map(Some)
        .ok_or_else(|| EnvParseError::InvalidEnum {
            var,
            value: trimmed.to_string(),
        })
}

fn parse_optional_topic(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<TopicFilter>, EnvParseError> {
    let Some(raw) = parse_optional_trimmed_string(map, var)? else {
        return Ok(None);
    };
    TopicFilter::parse(&*raw)
        .map(Some)
        .map_err(|error| EnvParseError::InvalidIdentifier {
            var,
            value: raw.into_string(),
            reason: error.to_string(),
        })
}

fn parse_optional_table(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<TableName>, EnvParseError> {
    let Some(raw) = parse_optional_trimmed_string(map, var)? else {
        return Ok(None);
    };
    TableName::parse(&*raw)
        .map(Some)
        .map_err(|error| EnvParseError::InvalidIdentifier {
            var,
            value: raw.into_string(),
            reason: error.to_string(),
        })
}

fn parse_optional_broker_url(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<BrokerAddress>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptySecret { var });
    }

    let invalid = || EnvParseError::InvalidUrl {
        var,
        value: raw.clone(),
    };
    let parsed = Url::parse(trimmed).map_err(|_| invalid())?;
    if !BROKER_URL_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid());
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(invalid)?;

    Ok(Some(BrokerAddress {
        host: host.into(),
        port: parsed.port(),
        username: Some(parsed.username())
            .filter(|name| !name.is_empty())
            .map(Into::into),
        password: parsed
            .password()
            .filter(|password| !password.is_empty())
            .map(|password| SecretString::new(password.to_owned())),
    }))
}

fn parse_optional_store_url_any(
    map: &BTreeMap<String, String>,
    vars: &[&'static str],
) -> Result<Option<SecretString>, EnvParseError> {
    for var in vars {
        let Some(raw) = map.get(*var) else {
            continue;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EnvParseError::EmptySecret { var });
        }
        if !is_postgres_url(trimmed) {
            return Err(EnvParseError::InvalidUrl {
                var,
                value: raw.clone(),
            });
        }
        return Ok(Some(SecretString::new(trimmed.to_owned())));
    }
    Ok(None)
}

fn redact_value(var: &str, value: &str) -> String {
    if is_secret_key(var) {
        REDACTED_VALUE.to_string()
    } else {
        value.to_string()
    }
}
