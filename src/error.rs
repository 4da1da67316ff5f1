//! Error types for bind routing and session management.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Configuration and resolution errors are meant to fail loudly at startup, while
//! data errors from the driver are passed through with a suggestion attached.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Bind '{name}' not found. Check the binds configuration (configured: {available})")]
    BindNotFound { name: String, available: String },

    #[error("Bind '{bind}' is not initialized. Call initialize() before using it")]
    NotInitialized { bind: String },

    #[error("No active session scope. Enter a request, task or thread scope first")]
    NoActiveScope,

    #[error("Not found{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    NotFound { description: Option<String> },

    #[error("No row was found when one was required")]
    NoResultFound,

    #[error("Multiple rows were found when exactly one was required ({count} rows)")]
    MultipleResultsFound { count: usize },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{}", format_cleanup(.original.as_deref(), .errors))]
    Cleanup {
        original: Option<Box<DbError>>,
        errors: Vec<DbError>,
    },
}

fn format_cleanup(original: Option<&DbError>, errors: &[DbError]) -> String {
    let cleanup = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    match original {
        Some(orig) => format!("{orig} (cleanup also failed: {cleanup})"),
        None => format!("Cleanup failed: {cleanup}"),
    }
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a bind resolution error listing the configured names.
    pub fn bind_not_found<'a>(
        name: impl Into<String>,
        available: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut names: Vec<&str> = available.into_iter().collect();
        names.sort_unstable();
        Self::BindNotFound {
            name: name.into(),
            available: names.join(", "),
        }
    }

    /// Create a not-initialized error.
    pub fn not_initialized(bind: impl Into<String>) -> Self {
        Self::NotInitialized { bind: bind.into() }
    }

    /// Create a user-facing not-found error.
    pub fn not_found(description: Option<impl Into<String>>) -> Self {
        Self::NotFound {
            description: description.map(Into::into),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid request error (API misuse, wrong session state).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Combine an in-flight error with errors raised while cleaning up.
    ///
    /// Returns `Ok(())` when there is nothing to report, the original error
    /// untouched when cleanup succeeded, and a single cleanup error unwrapped.
    pub fn cleanup(original: Option<DbError>, mut errors: Vec<DbError>) -> DbResult<()> {
        match (original, errors.len()) {
            (None, 0) => Ok(()),
            (Some(orig), 0) => Err(orig),
            (None, 1) => Err(errors.remove(0)),
            (original, _) => Err(Self::Cleanup {
                original: original.map(Box::new),
                errors,
            }),
        }
    }

    /// [`DbError::cleanup`] for an error that is already in flight.
    pub fn with_cleanup(original: DbError, errors: Vec<DbError>) -> DbError {
        if errors.is_empty() {
            original
        } else {
            Self::Cleanup {
                original: Some(Box::new(original)),
                errors,
            }
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True for the "missing resource" family surfaced by the `_or_404` helpers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Database { message, .. } => {
                message.to_lowercase().contains("too many connections")
            }
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::NoResultFound,
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => DbError::connection(
                "Connection pool is closed",
                "The bind was disposed; call initialize() again",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::invalid_input(format!("JSON error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::database("Too many connections", None, "").is_retryable());
        assert!(!DbError::database("syntax error", None, "").is_retryable());
        assert!(!DbError::permission("write", "read-only").is_retryable());
    }

    #[test]
    fn test_bind_not_found_lists_configured_names() {
        let err = DbError::bind_not_found("missing", ["replica", "default"]);
        let msg = err.to_string();
        assert!(msg.contains("'missing'"));
        assert!(msg.contains("default, replica"));
    }

    #[test]
    fn test_not_found_description() {
        assert_eq!(DbError::not_found(None::<String>).to_string(), "Not found");
        assert_eq!(
            DbError::not_found(Some("no such user")).to_string(),
            "Not found: no such user"
        );
    }

    #[test]
    fn test_cleanup_keeps_original_when_cleanup_succeeded() {
        let result = DbError::cleanup(Some(DbError::invalid_input("boom")), vec![]);
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
        assert!(DbError::cleanup(None, vec![]).is_ok());
    }

    #[test]
    fn test_cleanup_aggregates_both_failures() {
        let result = DbError::cleanup(
            Some(DbError::invalid_input("boom")),
            vec![
                DbError::internal("rollback failed"),
                DbError::internal("close failed"),
            ],
        );
        match result {
            Err(DbError::Cleanup { original, errors }) => {
                assert!(original.is_some());
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_row_not_found_maps_to_no_result() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NoResultFound));
    }
}
