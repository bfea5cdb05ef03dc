//! Metric store boundary contract: a connection pool and per-insert leases.

use crate::BoxFuture;
use sensor_ingest_domain::{MetricRecord, TableName};
use sensor_ingest_shared::{ErrorCode, ErrorEnvelope, RequestContext, Result};
use std::fmt;

/// One exclusively-owned store connection.
pub trait PooledConnection: Send {
    /// Insert one record and return the affected-row count.
    fn insert_metric<'a>(
        &'a mut self,
        ctx: &'a RequestContext,
        table: &'a TableName,
        record: &'a MetricRecord,
    ) -> BoxFuture<'a, Result<u64>>;

    /// Open an explicit transaction.
    fn begin<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>>;

    /// Commit the open transaction.
    fn commit<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>>;

    /// Roll back the open transaction.
    fn rollback<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>>;

    /// Return the connection to its pool.
    fn release(self: Box<Self>);
}

/// Result of the optional schema bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Table exists and is a hypertable.
    Hypertable,
    /// Table exists, hypertable conversion failed.
    PlainTable {
        /// Why the conversion failed.
        reason: Box<str>,
    },
}

/// Boundary contract for the pooled metric store.
pub trait ConnectionPoolPort: Send + Sync {
    /// Acquire a lease on one connection.
    fn acquire(&self, ctx: &RequestContext) -> BoxFuture<'_, Result<ConnectionLease>>;

    /// Create the metric table when missing and try to make it a hypertable.
    fn ensure_schema(
        &self,
        ctx: &RequestContext,
        table: &TableName,
    ) -> BoxFuture<'_, Result<SchemaStatus>>;

    /// Close the pool; outstanding leases are returned as they drop.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Exclusive handle to one pooled connection, released exactly once.
///
/// Dropping the lease releases the connection; `release` does so eagerly.
pub struct ConnectionLease {
    connection: Option<Box<dyn PooledConnection>>,
}

impl ConnectionLease {
    /// Wrap an acquired connection.
    #[must_use]
    pub fn new(connection: Box<dyn PooledConnection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    /// Borrow the leased connection.
    pub fn connection(&mut self) -> Result<&mut (dyn PooledConnection + 'static)> {
        self.connection.as_deref_mut().ok_or_else(|| {
            ErrorEnvelope::invariant(
                ErrorCode::new("store", "lease_released"),
                "connection lease used after release",
            )
        })
    }

    /// Return the connection to the pool now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release();
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConnectionLease")
            .field("held", &self.connection.is_some())
            .finish()
    }
}
