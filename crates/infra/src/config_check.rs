//! Config loading helpers for CLI surfaces.

use crate::InfraResult;
use sensor_ingest_config::{
    IngestEnv, ValidatedIngestConfig, load_ingest_config_from_path, to_pretty_json, to_pretty_toml,
};
use sensor_ingest_shared::{ErrorCode, ErrorEnvelope};
use std::collections::BTreeMap;
use std::path::Path;

/// Output format for the effective config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    /// Pretty JSON.
    #[default]
    Json,
    /// Pretty TOML.
    Toml,
}

impl ConfigFormat {
    /// Parse `json` or `toml` (case-insensitive).
    pub fn parse(input: &str) -> InfraResult<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            other => Err(ErrorEnvelope::expected(
                ErrorCode::invalid_input(),
                format!("unsupported config format `{other}` (expected json|toml)"),
            )
            .with_metadata("format", other)),
        }
    }
}

/// Load and validate the effective config from an env snapshot, file, and overrides.
pub fn load_effective_config(
    env: &BTreeMap<String, String>,
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> InfraResult<ValidatedIngestConfig> {
    let env = IngestEnv::from_map(env).map_err(ErrorEnvelope::from)?;
    load_ingest_config_from_path(config_path, overrides_json, &env)
}

/// Load and validate the effective config, rendered with secrets redacted.
pub fn render_effective_config(
    env: &BTreeMap<String, String>,
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
    format: ConfigFormat,
) -> InfraResult<String> {
    let config = load_effective_config(env, config_path, overrides_json)?;
    match format {
        ConfigFormat::Json => to_pretty_json(&config),
        ConfigFormat::Toml => to_pretty_toml(&config),
    }
}

/// Load and validate the effective config, returning deterministic pretty JSON.
pub fn load_effective_config_json(
    env: &BTreeMap<String, String>,
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> InfraResult<String> {
    render_effective_config(env, config_path, overrides_json, ConfigFormat::Json)
}

/// Snapshot of the process environment, restricted to the variables config reads.
pub fn std_env_snapshot() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("SENSOR_INGEST_") || key == "DATABASE_URL")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse() -> InfraResult<()> {
        assert_eq!(ConfigFormat::parse("JSON")?, ConfigFormat::Json);
        assert_eq!(ConfigFormat::parse(" toml ")?, ConfigFormat::Toml);
        assert!(ConfigFormat::parse("yaml").is_err());
        Ok(())
    }

    #[test]
    fn env_password_never_reaches_the_rendered_config() -> InfraResult<()> {
        let mut env = BTreeMap::new();
        env.insert(
            "SENSOR_INGEST_STORE_PASSWORD".to_owned(),
            "hunter2".to_owned(),
        );
        let rendered = load_effective_config_json(&env, None, None)?;
        assert!(!rendered.contains("hunter2"));
        Ok(())
    }

    #[test]
    fn env_wins_over_overrides() -> InfraResult<()> {
        let mut env = BTreeMap::new();
        env.insert(
            "SENSOR_INGEST_STORE_TABLE".to_owned(),
            "env_metrics".to_owned(),
        );
        let config = load_effective_config(
            &env,
            None,
            Some(r#"{"store":{"table":"override_metrics"}}"#),
        )?;
        assert_eq!(config.store.table.to_string(), "env_metrics");
        Ok(())
    }
}
