//! Database session abstraction shared by the scraper and the log tailer.
//!
//! A target's session is held in a [`SessionCell`]: tasks take a cheap
//! reference with [`SessionCell::current`] and keep using it until they
//! finish, while the connection manager may install a fresh session at any
//! time without disturbing them.

use crate::config::TargetConfig;
use crate::error::DbError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// ============================================================
// Typed rows
// ============================================================

/// A single column value as read from the database
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Display-formatted value
    Value(String),
    /// SQL NULL
    Null,
}

impl Cell {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(v) => Some(v.as_str()),
            Self::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Result of looking up a numeric value in a row
#[derive(Debug, Clone, PartialEq)]
pub enum NumericCell {
    /// Parsed value; NULL is substituted by `0.0`
    Value(f64),
    /// Column not present in the result set
    Absent,
    /// Column present but the text is not a number
    Invalid(String),
}

/// One result row: an ordered, case-insensitive column → value mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Cell)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column; names are stored lower-cased
    pub fn push(&mut self, name: impl AsRef<str>, cell: Cell) {
        self.columns.push((name.as_ref().to_lowercase(), cell));
    }

    /// Builder-style append
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.push(name, Cell::Value(value.into()));
        self
    }

    pub fn with_null(mut self, name: impl AsRef<str>) -> Self {
        self.push(name, Cell::Null);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        let name = name.to_lowercase();
        self.columns
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, cell)| cell)
    }

    /// Text form of a column, with NULL and missing columns rendered as ""
    pub fn text(&self, name: &str) -> &str {
        self.get(name).and_then(Cell::as_str).unwrap_or("")
    }

    /// Parse a column as `f64`
    pub fn numeric(&self, name: &str) -> NumericCell {
        match self.get(name) {
            None => NumericCell::Absent,
            Some(Cell::Null) => NumericCell::Value(0.0),
            Some(Cell::Value(v)) => match v.trim().parse::<f64>() {
                Ok(f) => NumericCell::Value(f),
                Err(_) => NumericCell::Invalid(v.clone()),
            },
        }
    }

    /// Parse a column as an unsigned count (histogram count / bucket counters)
    pub fn count(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            Cell::Null => Some(0),
            Cell::Value(v) => v.trim().parse::<u64>().ok(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

// ============================================================
// Session traits
// ============================================================

/// A connection held out of the pool; dropping it returns the connection
pub struct Lease {
    _conn: Box<dyn Send>,
}

impl Lease {
    pub fn new<T: Send + 'static>(conn: T) -> Self {
        Self {
            _conn: Box::new(conn),
        }
    }
}

/// A pooled session against one database instance
#[async_trait]
pub trait Session: Send + Sync {
    /// Round-trip to the server
    async fn ping(&self) -> Result<(), DbError>;

    /// Run a query and return every row
    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>, DbError>;

    /// Take one connection out of the pool and hold it
    async fn lease(&self) -> Result<Lease, DbError>;
}

/// Builds sessions for targets; called once at start-up and on every reconnect
pub trait Connector: Send + Sync {
    fn open(&self, name: &str, target: &TargetConfig) -> Result<Box<dyn Session>, DbError>;
}

/// Run a session operation under a deadline
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, DbError>
where
    F: std::future::Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(deadline)),
    }
}

// ============================================================
// Swappable session holder
// ============================================================

/// Handle to a session; cloning is cheap and keeps the session alive
pub type SessionRef = Arc<Box<dyn Session>>;

pub struct SessionCell {
    inner: ArcSwap<Box<dyn Session>>,
}

impl SessionCell {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(session),
        }
    }

    /// Current session; holders keep using it even after a replacement
    pub fn current(&self) -> SessionRef {
        self.inner.load_full()
    }

    /// Install a new session; the old one is dropped once its last holder finishes
    pub fn replace(&self, session: Box<dyn Session>) {
        self.inner.store(Arc::new(session));
    }
}
