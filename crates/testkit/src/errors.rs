//! Error fixtures shaped like the ones the store and broker adapters raise.

use sensor_ingest_shared::{ErrorClass, ErrorCode, ErrorEnvelope};

/// A pool acquisition timeout.
pub fn pool_timeout_error() -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("store", "acquire_failed"),
        "pool timed out while waiting for an open connection",
        ErrorClass::Retriable,
    )
    .with_metadata("cause", "pool_timed_out")
}

/// A statement rejected by the store (for example a missing table).
pub fn insert_rejected_error() -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("store", "insert_failed"),
        "relation \"sensor_metrics\" does not exist",
        ErrorClass::NonRetriable,
    )
    .with_metadata("sqlstate", "42P01")
}

/// A commit that failed after the insert succeeded.
pub fn commit_failed_error() -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("store", "commit_failed"),
        "connection reset during commit",
        ErrorClass::Retriable,
    )
}

/// A broker subscription refused by the server.
pub fn subscribe_refused_error() -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("broker", "subscribe_failed"),
        "broker refused the subscription",
        ErrorClass::NonRetriable,
    )
}
