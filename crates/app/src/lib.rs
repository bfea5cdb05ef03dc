//! # sensor-ingest-app
//!
//! Ingest use cases: decode, store write, subscription loop, supervisor listener.
//! This crate depends on `ports`, `domain`, and `shared`.

pub mod decode_metric;
pub mod ensure_schema;
pub mod insert_metric;
pub mod subscription;
pub mod supervisor;

pub use decode_metric::{DecodeError, REQUIRED_FIELDS, decode_metric};
pub use ensure_schema::{EnsureSchemaDeps, ensure_schema};
pub use insert_metric::{
    CommitStatus, InsertMetricDeps, InsertOutcome, WriteError, WriteSettings, insert_metric,
};
pub use subscription::{
    MessageDisposition, SubscriptionController, SubscriptionDeps, SubscriptionSummary,
    run_subscription,
};
pub use supervisor::run_supervisor_listener;

/// Returns the app crate version.
#[must_use]
pub const fn app_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_ingest_domain::domain_crate_version;
    use sensor_ingest_ports::ports_crate_version;
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
    fn app_depends_only_on_inner_layers() {
        let allowed = [
            "sensor-ingest-ports",
            "sensor-ingest-domain",
            "sensor-ingest-shared",
        ];
        for dep in workspace_deps() {
            assert!(
                allowed.contains(&dep.as_str()),
                "unexpected dependency found: {dep}"
            );
        }
    }

    #[test]
    fn app_can_use_ports_domain_shared() {
        assert!(!app_crate_version().is_empty());
        assert!(!ports_crate_version().is_empty());
        assert!(!domain_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }
}
