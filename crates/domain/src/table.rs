//! Validated store table identifiers.

use sensor_ingest_shared::{ErrorCode, ErrorEnvelope};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Table written to when none is configured.
pub const DEFAULT_TABLE_NAME: &str = "sensor_metrics";

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validation failures for table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableNameError {
    /// Name is empty after trimming.
    Empty {
        /// Length of the raw input before trimming.
        input_length: usize,
    },
    /// A part violates `^[A-Za-z_][A-Za-z0-9_]*$`.
    InvalidIdentifier {
        /// Trimmed input that failed validation.
        input: String,
    },
    /// A part is longer than [`MAX_IDENTIFIER_LEN`].
    IdentifierTooLong {
        /// Trimmed input that failed validation.
        input: String,
        /// Length of the offending part.
        length: usize,
    },
}

impl TableNameError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Empty { .. } => ErrorCode::new("domain", "empty_table_name"),
            Self::InvalidIdentifier { .. } | Self::IdentifierTooLong { .. } => {
                ErrorCode::new("domain", "invalid_table_name")
            },
        }
    }
}

impl fmt::Display for TableNameError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { .. } => formatter.write_str("table name must be non-empty"),
            Self::InvalidIdentifier { .. } => formatter.write_str(
                "table name must be `table` or `schema.table` matching /^[A-Za-z_][A-Za-z0-9_]*$/",
            ),
            Self::IdentifierTooLong { length, .. } => write!(
                formatter,
                "table name part is {length} bytes, limit is {MAX_IDENTIFIER_LEN}"
            ),
        }
    }
}

impl std::error::Error for TableNameError {}

impl From<TableNameError> for ErrorEnvelope {
    fn from(error: TableNameError) -> Self {
        let envelope = Self::expected(error.error_code(), error.to_string());
        match error {
            TableNameError::Empty { input_length } => {
                envelope.with_metadata("input_length", input_length.to_string())
            },
            TableNameError::InvalidIdentifier { input } => envelope.with_metadata("input", input),
            TableNameError::IdentifierTooLong { input, length } => envelope
                .with_metadata("input", input)
                .with_metadata("length", length.to_string()),
        }
    }
}

/// Table identifier safe to interpolate into SQL, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: Option<Box<str>>,
    table: Box<str>,
}

impl TableName {
    /// Parse `table` or `schema.table`.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TableNameError> {
        let raw = input.as_ref();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TableNameError::Empty {
                input_length: raw.len(),
            });
        }

        let (schema, table) = match trimmed.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, trimmed),
        };

        for part in schema.into_iter().chain([table]) {
            validate_identifier(trimmed, part)?;
        }

        Ok(Self {
            schema: schema.map(Into::into),
            table: table.into(),
        })
    }

    /// Unqualified table part.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Schema part, if qualified.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Double-quoted SQL form, e.g. `"public"."sensor_metrics"`.
    #[must_use]
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.table),
            None => format!("\"{}\"", self.table),
        }
    }
}

fn validate_identifier(input: &str, part: &str) -> Result<(), TableNameError> {
    let mut chars = part.chars();
    let valid_start = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(TableNameError::InvalidIdentifier {
            input: input.to_owned(),
        });
    }
    if part.len() > MAX_IDENTIFIER_LEN {
        return Err(TableNameError::IdentifierTooLong {
            input: input.to_owned(),
            length: part.len(),
        });
    }
    Ok(())
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: None,
            table: DEFAULT_TABLE_NAME.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(formatter, "{schema}.{}", self.table),
            None => formatter.write_str(&self.table),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = TableNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.to_string()
    }
}
