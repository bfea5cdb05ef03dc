//! # sensor-ingest-infra
//!
//! Infrastructure wiring and runtime composition.
//! This crate depends on `app`, `adapters`, `config`, and `shared`.

/// Config loading helpers used by CLI surfaces.
pub mod config_check;
/// Environment validation helpers used by CLI surfaces.
pub mod env_check;
/// Logger, telemetry, and bus wiring.
pub mod observability;
/// Panic reporting to the supervisor bus.
pub mod panic_hook;
/// Service composition and lifecycle.
pub mod service;

pub use config_check::{
    ConfigFormat, load_effective_config, load_effective_config_json, render_effective_config,
    std_env_snapshot,
};
pub use env_check::{InfraError, InfraResult, validate_env_parsing};
pub use observability::{Observability, SERVICE_NAME, build_observability, scope_logger};
pub use panic_hook::{install_panic_hook, reset_panic_hook};
pub use service::{
    ServiceParts, ServiceReport, build_service_parts, run_service_with, run_until_shutdown,
    shutdown_signal, write_limiter, write_settings,
};

pub use sensor_ingest_ports::SchemaStatus;

// Re-export redaction utilities for CLI boundary sanitization
pub use sensor_ingest_shared::{is_secret_key, redact_if_secret};

/// Returns the infra crate version.
#[must_use]
pub const fn infra_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_ingest_adapters::adapters_crate_version;
    use sensor_ingest_app::app_crate_version;
    use sensor_ingest_config::config_crate_version;
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
                in_deps = line == "[dependencies]";
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
    fn infra_depends_on_app_adapters_config() {
        let deps = workspace_deps();
        let required = [
            "sensor-ingest-app",
            "sensor-ingest-adapters",
            "sensor-ingest-config",
        ];

        for expected in required {
            assert!(
                deps.iter().any(|dep| dep == expected),
                "missing dependency: {expected}"
            );
        }
        assert!(
            !deps.iter().any(|dep| dep == "sensor-ingest-testkit"),
            "testkit must stay a dev-dependency"
        );
    }

    #[test]
    fn infra_can_use_app_adapters_config_shared() {
        assert!(!infra_crate_version().is_empty());
        assert!(!app_crate_version().is_empty());
        assert!(!adapters_crate_version().is_empty());
        assert!(!config_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }
}
