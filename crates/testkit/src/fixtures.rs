//! Paths and readers for the shared fixture files under `crates/testkit/fixtures`.

use std::path::{Path, PathBuf};

/// Root of the fixture tree.
pub fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

/// Absolute path of a fixture, e.g. `payloads/signalk-delta.valid.json`.
pub fn fixture_path(relative: &str) -> PathBuf {
    fixtures_root().join(relative)
}

/// Read a fixture as text; panics with the path when it is missing.
pub fn read_fixture(relative: &str) -> String {
    let path = fixture_path(relative);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|error| panic!("failed to read fixture {}: {error}", path.display()))
}

/// Read a fixture as raw bytes, as a broker would deliver it.
pub fn read_fixture_bytes(relative: &str) -> Vec<u8> {
    read_fixture(relative).into_bytes()
}
