use std::time::Duration;
use thiserror::Error;

/// SQLSTATE / vendor codes that mean the supplied credentials were rejected
const INVALID_CREDENTIAL_CODES: &[&str] = &["28000", "28P01", "1017", "1045"];

/// Message markers for drivers that only surface vendor errors as text
const INVALID_CREDENTIAL_MARKERS: &[&str] = &["ORA-01017", "ORA-28000"];

/// Database driver error, classified by how the connection manager must react to it
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// Transport-level failure: the session is gone and must be rebuilt
    #[error("session closed: {0}")]
    Closed(String),
    /// The server rejected the credentials
    #[error("invalid credentials (code {code}): {message}")]
    InvalidCredentials { code: String, message: String },
    /// The operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Anything else; retried on the next tick
    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                if is_credential_failure(&code, &message) {
                    Self::InvalidCredentials { code, message }
                } else {
                    Self::Other(message)
                }
            }
            sqlx::Error::Io(e) => Self::Closed(e.to_string()),
            sqlx::Error::PoolClosed => Self::Closed("connection pool closed".to_string()),
            sqlx::Error::WorkerCrashed => Self::Closed("connection worker crashed".to_string()),
            other => {
                let message = other.to_string();
                if is_credential_failure("", &message) {
                    Self::InvalidCredentials {
                        code: String::new(),
                        message,
                    }
                } else {
                    Self::Other(message)
                }
            }
        }
    }
}

/// Decide whether a driver error code or message denotes rejected credentials
pub fn is_credential_failure(code: &str, message: &str) -> bool {
    if !code.is_empty() && INVALID_CREDENTIAL_CODES.contains(&code) {
        return true;
    }
    INVALID_CREDENTIAL_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Malformed metric definition; the definition is excluded, not the whole set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("metric '{context}' has no request; did you forget to define request?")]
    MissingRequest { context: String },
    #[error("metric '{context}' declares no output columns in metricsdesc")]
    MissingColumns { context: String },
    #[error("metric '{context}' column '{column}' is a histogram without metricsbuckets")]
    MissingBuckets { context: String, column: String },
    #[error("metric '{context}' column '{column}' has unknown type '{kind}'")]
    UnknownType {
        context: String,
        column: String,
        kind: String,
    },
    #[error("metric '{context}' label '{label}' duplicates a constant label of target '{target}'")]
    DuplicateLabel {
        context: String,
        label: String,
        target: String,
    },
    #[error("metric '{context}' has an invalid {field} '{value}': {reason}")]
    InvalidDuration {
        context: String,
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Outcome of a failed metric computation
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("no metrics found while parsing, query returned no rows")]
    ZeroResult,
    #[error("query returned {rows} row(s) but no parseable value column")]
    NoParseableValues { rows: usize },
    #[error("query failed: {0}")]
    Query(DbError),
    #[error("target '{0}' is not available")]
    TargetUnavailable(String),
}

impl ScrapeError {
    /// Whether this failure must be logged and counted.
    ///
    /// A zero-row result on a definition that tolerates it is a steady state, not a fault.
    pub fn should_report(&self, ignore_zero_result: bool) -> bool {
        !(ignore_zero_result && matches!(self, Self::ZeroResult))
    }
}

impl From<DbError> for ScrapeError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Timeout(d) => Self::Timeout(d),
            other => Self::Query(other),
        }
    }
}

/// Log tailing failure
#[derive(Debug, Error)]
pub enum TailError {
    #[error("log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("event query failed: {0}")]
    Query(DbError),
    #[error("failed to encode log record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TailError {
    /// Only upstream query failures count towards permanent tailing exclusion
    pub fn is_query_failure(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}
