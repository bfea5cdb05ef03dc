//! # sensor-ingest-config
//!
//! Configuration schema, validation, env overrides, and JSON/TOML loading.
//! This crate depends on `domain` and `shared` only.

/// Environment variable parsing and merging.
pub mod env;
/// Config loading helpers (env + file + overrides).
pub mod load;
/// Configuration schema types and helpers.
pub mod schema;

pub use schema::{
    BrokerConfig, CURRENT_CONFIG_VERSION, ConfigLimits, ConfigSchemaError, IngestConfig,
    LogLevelName, LoggingConfig, PipelineConfig, SaturationMode, StoreConfig, TelemetryConfig,
    ValidatedIngestConfig, ValueColumn, parse_ingest_config_json, parse_ingest_config_toml,
};

pub use env::{BrokerAddress, EnvParseError, IngestEnv, apply_env_overrides};
pub use load::{
    load_ingest_config_from_path, load_ingest_config_from_sources, load_ingest_config_std_env,
    to_pretty_json, to_pretty_toml,
};

/// Returns the config crate version.
#[must_use]
pub const fn config_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_ingest_domain::domain_crate_version;
    use sensor_ingest_shared::shared_crate_version;

    fn workspace_deps() -> Vec<String> {
        let cargo_toml = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml"));
        let mut deps = Vec::new();
        let mut in_deps = false;

        for raw_line in cargo_toml.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                in_deps = line == "[dependencies]" || line == "[dev-dependencies]";
                continue;
            }
            if in_deps && line.starts_with("sensor-ingest-") {
                let key = line.split('=').next().unwrap_or("").trim();
                let name = key.split('.').next().unwrap_or("").trim();
                deps.push(name.to_string());
            }
        }

        deps
    }

    #[test]
    fn config_depends_only_on_domain_and_shared() {
        let deps = workspace_deps();
        let allowed = ["sensor-ingest-domain", "sensor-ingest-shared"];

        for dep in &deps {
            assert!(
                allowed.contains(&dep.as_str()),
                "unexpected dependency found: {dep}"
            );
        }
    }

    #[test]
    fn config_can_use_domain_and_shared() {
        assert!(!config_crate_version().is_empty());
        assert!(!domain_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }
}
