//! Secret detection and redaction utilities.
//!
//! Provides consistent logic for detecting sensitive keys/variables and
//! redacting their values in error messages and logs.

/// Checks if a key/variable name likely refers to a secret.
///
/// Uses case-insensitive pattern matching to detect common secret-related
/// naming conventions.
///
/// # Examples
///
/// ```
/// use sensor_ingest_shared::is_secret_key;
///
/// assert!(is_secret_key("API_KEY"));
/// assert!(is_secret_key("password"));
/// assert!(is_secret_key("SENSOR_INGEST_STORE_PASSWORD"));
/// assert!(!is_secret_key("LOG_LEVEL"));
/// ```
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    key.contains("KEY")
        || key.contains("TOKEN")
        || key.contains("SECRET")
        || key.contains("PASSWORD")
        || key.contains("CREDENTIAL")
        || key.contains("AUTH")
}

/// Redacts a value if the key is likely a secret.
///
/// Returns `"[REDACTED]"` for secret keys, or the original value otherwise.
///
/// # Examples
///
/// ```
/// use sensor_ingest_shared::redact_if_secret;
///
/// assert_eq!(redact_if_secret("API_KEY", "sk-123"), "[REDACTED]");
/// assert_eq!(redact_if_secret("LOG_LEVEL", "debug"), "debug");
/// ```
pub fn redact_if_secret(key: &str, value: &str) -> String {
    if is_secret_key(key) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// The redacted placeholder string.
pub const REDACTED: &str = "[REDACTED]";

/// A secret string wrapper that redacts on Display/Debug.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SecretString(Box<str>);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<Box<str>>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying secret.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume and return the underlying secret.
    pub fn into_inner(self) -> Box<str> {
        self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(REDACTED)
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(REDACTED)
    }
}

impl AsRef<str> for SecretString {
    fn as_ref(&self) -> &str {
        self.expose()
    }
}

impl From<Box<str>> for SecretString {
    fn from(value: Box<str>) -> Self {
        Self(value)
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}
