//! Error types for db-lease.
//!
//! All fallible operations return [`DbResult`]. Every [`DbError`] variant maps to
//! one [`ErrorKind`] so callers can branch on the category without matching the
//! individual variants. Nothing in this crate retries automatically; retry
//! policy belongs to the caller.

use thiserror::Error;

/// Broad category of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Pool cannot be built, pre-fill failed, invalid options.
    Configuration,
    /// Generic failure talking to the database.
    DatabaseAccess,
    /// Optimistic-lock conflict: the row changed since it was read.
    ConcurrentModification,
    /// A targeted update or delete affected no rows.
    NotFound,
    /// More rows were affected than the operation allows.
    InconsistentData,
    /// Programming-contract violation (misuse of leases or transactions).
    IllegalState,
    /// Persisted schema is newer than the code.
    SchemaDowngrade,
    Timeout,
    InvalidInput,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for a unique violation
        sql_state: Option<String>,
        suggestion: String,
        #[source]
        source: Option<Box<sqlx::Error>>,
    },

    #[error("Concurrent modification: {message}")]
    ConcurrentModification { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Inconsistent data: {message} ({affected} rows affected)")]
    InconsistentData { message: String, affected: u64 },

    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error(
        "Cannot issue connection for {requested} while a connection for {issued} is already issued"
    )]
    IdentityMismatch { requested: String, issued: String },

    #[error(
        "Schema '{schema}' is at version {persisted_version} in the database but the code expects version {code_version}"
    )]
    SchemaDowngrade {
        schema: String,
        persisted_version: i32,
        code_version: i32,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Data source not found: {data_source}")]
    DataSourceNotFound { data_source: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error with a helpful suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
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
            source: None,
        }
    }

    pub fn concurrent_modification(message: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn inconsistent_data(message: impl Into<String>, affected: u64) -> Self {
        Self::InconsistentData {
            message: message.into(),
            affected,
        }
    }

    /// Create an illegal state error (lease or transaction misuse).
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn identity_mismatch(requested: impl Into<String>, issued: impl Into<String>) -> Self {
        Self::IdentityMismatch {
            requested: requested.into(),
            issued: issued.into(),
        }
    }

    pub fn schema_downgrade(
        schema: impl Into<String>,
        persisted_version: i32,
        code_version: i32,
    ) -> Self {
        Self::SchemaDowngrade {
            schema: schema.into(),
            persisted_version,
            code_version,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn data_source_not_found(data_source: impl Into<String>) -> Self {
        Self::DataSourceNotFound {
            data_source: data_source.into(),
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

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Connection { .. } | Self::Database { .. } | Self::DataSourceNotFound { .. } => {
                ErrorKind::DatabaseAccess
            }
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InconsistentData { .. } => ErrorKind::InconsistentData,
            Self::IllegalState { .. } | Self::IdentityMismatch { .. } => ErrorKind::IllegalState,
            Self::SchemaDowngrade { .. } => ErrorKind::SchemaDowngrade,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE reported by the driver, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Hint for callers deciding whether to retry on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::ConcurrentModification { .. }
        )
    }

    /// True when the driver reported a unique or primary key violation.
    pub fn is_unique_violation(&self) -> bool {
        let Self::Database {
            sql_state, source, ..
        } = self
        else {
            return false;
        };
        if let Some(err) = source {
            if let sqlx::Error::Database(db_err) = err.as_ref() {
                return matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation);
            }
        }
        // PostgreSQL, MySQL, SQLite (primary key, unique)
        matches!(
            sql_state.as_deref(),
            Some("23505") | Some("23000") | Some("1555") | Some("2067")
        )
    }

    /// Classify a failed write.
    ///
    /// A unique violation is promoted to [`DbError::ConcurrentModification`]
    /// only when `versioned_target` says the written row is guarded by an
    /// optimistic lock (another writer got there first). Everything else is
    /// returned unchanged.
    pub fn classify_write(self, versioned_target: bool, what: &str) -> Self {
        if versioned_target && self.is_unique_violation() {
            return DbError::concurrent_modification(format!(
                "{} was modified by another writer: {}",
                what, self
            ));
        }
        self
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                DbError::Database {
                    message,
                    sql_state: code,
                    suggestion: "Check the SQL syntax and referenced objects".to_string(),
                    source: Some(Box::new(sqlx::Error::Database(db_err))),
                }
            }
            sqlx::Error::RowNotFound => DbError::not_found("No rows returned"),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool borrow", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Re-register the data source")
            }
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
            sqlx::Error::ColumnNotFound(col) => {
                DbError::database(format!("Column not found: {}", col), None, "Check the query")
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            other => DbError::Database {
                message: other.to_string(),
                sql_state: None,
                suggestion: "Check the database server logs".to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
