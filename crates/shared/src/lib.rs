//! # sensor-ingest-shared
//!
//! Foundational types used by every crate in the sensor-ingest workspace:
//!
//! - Result and error envelope types
//! - Request context, cancellation, and the bounded write spawner
//! - Bounded numeric invariants and secret redaction
//!
//! This crate has no workspace dependencies.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod concurrency;
pub mod errors;
pub mod invariants;
pub mod redaction;
pub mod result;
pub mod timeout;

pub use concurrency::{
    CancellationToken, CorrelationId, Dispatch, DrainOutcome, RequestContext, SaturationPolicy,
    WriteLimiter,
};
pub use errors::{
    ErrorClass, ErrorCode, ErrorEnvelope, ErrorKind, ErrorMetadata, REDACTED_VALUE,
};
pub use invariants::{BoundedU32, BoundedU64, BoundsError};
pub use redaction::{REDACTED, SecretString, is_secret_key, redact_if_secret};
pub use result::Result;
pub use timeout::timeout_with_context;

/// Returns the shared crate version.
#[must_use]
pub const fn shared_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
