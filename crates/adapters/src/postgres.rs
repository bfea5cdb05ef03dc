//! `PostgreSQL`/`TimescaleDB` connection pool adapter.
//!
//! Built on a lazily-connecting sqlx [`PgPool`]: the pool never dials the
//! server until the first acquire, so startup does not depend on the store
//! being reachable.

use sensor_ingest_config::{ConfigLimits, StoreConfig, ValueColumn};
use sensor_ingest_ports::{
    BoxFuture, ConnectionLease, ConnectionPoolPort, MetricRecord, MetricTime, PooledConnection,
    SchemaStatus, TableName,
};
use sensor_ingest_shared::{ErrorClass, ErrorCode, ErrorEnvelope, RequestContext, Result};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, query};
use std::str::FromStr;
use std::time::Duration;

const APPLICATION_NAME: &str = "sensor-ingest";

/// Pooled `PostgreSQL` store.
#[derive(Debug, Clone)]
pub struct PostgresConnectionPool {
    pool: PgPool,
    value_column: ValueColumn,
}

impl PostgresConnectionPool {
    /// Build a lazy pool from the validated `store` section.
    pub fn from_config(store: &StoreConfig, limits: &ConfigLimits) -> Result<Self> {
        let statement_timeout_ms = limits.store_statement_timeout_ms.get();
        let options = connect_options(store)?
            .application_name(APPLICATION_NAME)
            .options([("statement_timeout", statement_timeout_ms.to_string())]);

        let pool = PgPoolOptions::new()
            .max_connections(limits.store_max_connections.get())
            .acquire_timeout(Duration::from_millis(
                limits.store_acquire_timeout_ms.get(),
            ))
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            value_column: store.value_column,
        })
    }

    /// Column mode used for the `value` column.
    #[must_use]
    pub const fn value_column(&self) -> ValueColumn {
        self.value_column
    }
}

fn connect_options(store: &StoreConfig) -> Result<PgConnectOptions> {
    if let Some(url) = store.url.as_deref() {
        // sqlx errors can echo the input, so the url stays out of the envelope.
        return PgConnectOptions::from_str(url).map_err(|_| {
            ErrorEnvelope::expected(
                ErrorCode::new("store", "connect_failed"),
                "store url could not be parsed",
            )
            .with_metadata("field", "store.url")
        });
    }

    let mut options = PgConnectOptions::new()
        .host(&store.host)
        .port(store.port)
        .database(&store.database)
        .username(&store.username);
    if let Some(password) = store.password.as_deref() {
        options = options.password(password);
    }
    Ok(options)
}

impl ConnectionPoolPort for PostgresConnectionPool {
    fn acquire(&self, ctx: &RequestContext) -> BoxFuture<'_, Result<ConnectionLease>> {
        let ctx = ctx.clone();
        Box::pin(async move {
            ctx.ensure_not_cancelled("store.acquire")?;
            let connection = self
                .pool
                .acquire()
                .await
                .map_err(|error| map_sqlx_error("acquire_failed", "store.acquire", &error))?;
            Ok(ConnectionLease::new(Box::new(PostgresConnection {
                connection,
                value_column: self.value_column,
                in_transaction: false,
            })))
        })
    }

    fn ensure_schema(
        &self,
        ctx: &RequestContext,
        table: &TableName,
    ) -> BoxFuture<'_, Result<SchemaStatus>> {
        let ctx = ctx.clone();
        let table = table.clone();
        Box::pin(async move {
            ctx.ensure_not_cancelled("store.ensure_schema")?;
            query(&create_table_sql(&table, self.value_column))
                .execute(&self.pool)
                .await
                .map_err(|error| {
                    map_sqlx_error("schema_failed", "store.create_table", &error)
                        .with_metadata("table", table.to_string())
                })?;

            match query(&create_hypertable_sql(&table))
                .execute(&self.pool)
                .await
            {
                Ok(_) => Ok(SchemaStatus::Hypertable),
                Err(error) => Ok(SchemaStatus::PlainTable {
                    reason: error.to_string().into(),
                }),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
        })
    }
}

struct PostgresConnection {
    connection: PoolConnection<Postgres>,
    value_column: ValueColumn,
    in_transaction: bool,
}

impl PostgresConnection {
    async fn execute_control(&mut self, statement: &'static str, code: &str) -> Result<()> {
        query(statement)
            .execute(&mut *self.connection)
            .await
            .map(|_| ())
            .map_err(|error| map_sqlx_error(code, statement, &error))
    }
}

impl PooledConnection for PostgresConnection {
    fn insert_metric<'a>(
        &'a mut self,
        ctx: &'a RequestContext,
        table: &'a TableName,
        record: &'a MetricRecord,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            ctx.ensure_not_cancelled("store.insert")?;
            let time = TimeBinding::from_record(record)?;
            let value = ValueBinding::new(self.value_column, record.value())?;
            let sql = insert_sql(table, &time, self.value_column);

            let statement = query(&sql);
            let statement = match time {
                TimeBinding::Iso(text) => statement.bind(text),
                TimeBinding::EpochSeconds(seconds) => statement.bind(seconds),
            };
            let statement = statement
                .bind(record.device_id().to_owned())
                .bind(record.path().to_owned());
            let statement = match value {
                ValueBinding::Text(text) => statement.bind(text),
                ValueBinding::Double(number) => statement.bind(number),
            };

            let result = statement
                .execute(&mut *self.connection)
                .await
                .map_err(|error| {
                    let envelope = map_sqlx_error("insert_failed", "store.insert", &error)
                        .with_metadata("table", table.to_string());
                    with_value_column_hint(envelope, self.value_column)
                })?;
            Ok(result.rows_affected())
        })
    }

    fn begin<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.execute_control("BEGIN", "insert_failed").await?;
            self.in_transaction = true;
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let outcome = self.execute_control("COMMIT", "commit_failed").await;
            self.in_transaction = outcome.is_err();
            outcome
        })
    }

    fn rollback<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let outcome = self.execute_control("ROLLBACK", "rollback_failed").await;
            self.in_transaction = outcome.is_err();
            outcome
        })
    }

    fn release(mut self: Box<Self>) {
        if self.in_transaction {
            // Never hand a connection with an open transaction back to the pool.
            self.connection.close_on_drop();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TimeBinding {
    Iso(String),
    EpochSeconds(f64),
}

impl TimeBinding {
    fn from_record(record: &MetricRecord) -> Result<Self> {
        match record.time() {
            MetricTime::Iso(text) => Ok(Self::Iso(text.to_string())),
            epoch @ MetricTime::Epoch(_) => epoch.epoch_seconds().map(Self::EpochSeconds).ok_or_else(
                || {
                    ErrorEnvelope::expected(
                        ErrorCode::new("store", "invalid_time"),
                        "epoch time is not representable as a float",
                    )
                    .with_metadata("time", epoch.to_string())
                },
            ),
        }
    }

    const fn placeholder(&self) -> &'static str {
        match self {
            Self::Iso(_) => "$1::timestamptz",
            Self::EpochSeconds(_) => "to_timestamp($1)",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ValueBinding {
    Text(String),
    Double(Option<f64>),
}

impl ValueBinding {
    fn new(column: ValueColumn, value: &Value) -> Result<Self> {
        match (column, value) {
            (ValueColumn::Json, value) => Ok(Self::Text(value.to_string())),
            (ValueColumn::Text, Value::String(text)) => Ok(Self::Text(text.clone())),
            (ValueColumn::Text, value) => Ok(Self::Text(value.to_string())),
            (ValueColumn::Double, Value::Null) => Ok(Self::Double(None)),
            (ValueColumn::Double, Value::Number(number)) => Ok(Self::Double(number.as_f64())),
            (ValueColumn::Double, other) => Err(ErrorEnvelope::expected(
                ErrorCode::new("store", "insert_failed"),
                "value is not a number and the value column is double",
            )
            .with_metadata("valueType", json_type_name(other))),
        }
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const fn value_placeholder(column: ValueColumn) -> &'static str {
    match column {
        ValueColumn::Json => "$4::jsonb",
        ValueColumn::Double | ValueColumn::Text => "$4",
    }
}

const fn value_sql_type(column: ValueColumn) -> &'static str {
    match column {
        ValueColumn::Json => "JSONB",
        ValueColumn::Double => "DOUBLE PRECISION",
        ValueColumn::Text => "TEXT",
    }
}

fn insert_sql(table: &TableName, time: &TimeBinding, column: ValueColumn) -> String {
    format!(
        "INSERT INTO {} (time, device_id, path, value) VALUES ({}, $2, $3, {})",
        table.quoted(),
        time.placeholder(),
        value_placeholder(column),
    )
}

fn create_table_sql(table: &TableName, column: ValueColumn) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (time TIMESTAMPTZ NOT NULL, device_id TEXT NOT NULL, path TEXT NOT NULL, value {} NULL)",
        table.quoted(),
        value_sql_type(column),
    )
}

fn create_hypertable_sql(table: &TableName) -> String {
    // `TableName` only admits `[A-Za-z0-9_]` identifiers, so literal interpolation is safe.
    format!(
        "SELECT create_hypertable('{}', 'time', if_not_exists => TRUE)",
        table.quoted()
    )
}

/// SQLSTATE `datatype_mismatch`.
const SQLSTATE_DATATYPE_MISMATCH: &str = "42804";

/// Name the configured encoding when the server rejects the `value` type.
///
/// Tables created as `value DOUBLE PRECISION` reject the default `jsonb`
/// binding; the fix is a matching `store.valueColumn`, not a retry.
fn with_value_column_hint(envelope: ErrorEnvelope, column: ValueColumn) -> ErrorEnvelope {
    if envelope.metadata.get("sqlstate").map(String::as_str) != Some(SQLSTATE_DATATYPE_MISMATCH) {
        return envelope;
    }
    envelope
        .with_metadata("valueColumn", column.as_str())
        .with_metadata(
            "hint",
            format!(
                "store.valueColumn is \"{}\"; set it to match the type of the existing value column",
                column.as_str()
            ),
        )
}

fn map_sqlx_error(code: &str, operation: &str, error: &sqlx::Error) -> ErrorEnvelope {
    let class = match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            ErrorClass::Retriable
        },
        _ => ErrorClass::NonRetriable,
    };
    let mut envelope = ErrorEnvelope::unexpected(
        ErrorCode::new("store", code),
        error.to_string(),
        class,
    )
    .with_metadata("operation", operation.to_owned());

    if let sqlx::Error::Database(database) = error
        && let Some(sqlstate) = database.code()
    {
        envelope = envelope.with_metadata("sqlstate", sqlstate.into_owned());
    }
    if matches!(error, sqlx::Error::PoolTimedOut) {
        envelope = envelope.with_metadata("cause", "pool_timed_out");
    }
    envelope
}
