//! Production sessions backed by native sqlx pools.
//!
//! The driver is picked from the url scheme (`postgres://`, `mysql://`,
//! `sqlite:`), and each backend keeps its own typed pool so columns are
//! decoded with the driver's full type support. Every non-null column is read
//! back as text: numbers and decimals through `Display`, booleans as `1`/`0`,
//! timestamps in RFC 3339.

use crate::config::TargetConfig;
use crate::credentials;
use crate::error::DbError;
use crate::logging::mask_dsn;
use crate::session::{Cell, Connector, Lease, Row, Session};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlRow};
use sqlx::pool::PoolOptions;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::types::Decimal;
use sqlx::{Column, ColumnIndex, Connection, Database, Executor, Row as SqlxRow, TypeInfo, ValueRef};
use std::fmt::Display;
use std::time::Duration;

/// Deadline for taking a connection out of the pool
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================
// Backends
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    MySql,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self, DbError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(DbError::Other(format!("unsupported database url scheme: {:?}", other))),
        }
    }

    /// Statement that switches a fresh connection to `role`; SQLite has no roles
    pub fn set_role_sql(&self, role: &str) -> Option<String> {
        match self {
            Self::Postgres => Some(format!("SET ROLE \"{}\"", role.replace('"', "\"\""))),
            Self::MySql => Some(format!("SET ROLE '{}'", role.replace('\'', "''"))),
            Self::Sqlite => None,
        }
    }
}

enum Pool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

pub struct SqlxSession {
    pool: Pool,
}

#[async_trait]
impl Session for SqlxSession {
    async fn ping(&self) -> Result<(), DbError> {
        match &self.pool {
            Pool::Postgres(pool) => pool.acquire().await?.ping().await?,
            Pool::MySql(pool) => pool.acquire().await?.ping().await?,
            Pool::Sqlite(pool) => pool.acquire().await?.ping().await?,
        }
        Ok(())
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        match &self.pool {
            Pool::Postgres(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                convert_rows(&rows, pg_text)
            }
            Pool::MySql(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                convert_rows(&rows, mysql_text)
            }
            Pool::Sqlite(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                convert_rows(&rows, sqlite_text)
            }
        }
    }

    async fn lease(&self) -> Result<Lease, DbError> {
        let lease = match &self.pool {
            Pool::Postgres(pool) => Lease::new(pool.acquire().await?),
            Pool::MySql(pool) => Lease::new(pool.acquire().await?),
            Pool::Sqlite(pool) => Lease::new(pool.acquire().await?),
        };
        Ok(lease)
    }
}

// ============================================================
// Column decoding
// ============================================================

/// Text of the first listed type the column decodes as
macro_rules! decode_first {
    ($row:expr, $index:expr, $($ty:ty => $text:expr),+ $(,)?) => {{
        let mut text = None;
        $(
            if text.is_none() {
                if let Ok(value) = $row.try_get::<$ty, _>($index) {
                    text = Some(($text)(value));
                }
            }
        )+
        text
    }};
}

fn display<T: Display>(value: T) -> String {
    value.to_string()
}

fn flag_text(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn timestamp_text(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn pg_text(row: &PgRow, index: usize) -> Option<String> {
    decode_first!(row, index,
        String => display,
        i64 => display,
        i32 => display,
        i16 => display,
        f64 => display,
        f32 => display,
        Decimal => display,
        DateTime<Utc> => timestamp_text,
        NaiveDateTime => display,
        NaiveDate => display,
        NaiveTime => display,
        bool => flag_text,
        Oid => |oid: Oid| oid.0.to_string(),
    )
}

fn mysql_text(row: &MySqlRow, index: usize) -> Option<String> {
    decode_first!(row, index,
        String => display,
        i64 => display,
        u64 => display,
        f64 => display,
        f32 => display,
        Decimal => display,
        DateTime<Utc> => timestamp_text,
        NaiveDateTime => display,
        NaiveDate => display,
        NaiveTime => display,
        bool => flag_text,
    )
}

fn sqlite_text(row: &SqliteRow, index: usize) -> Option<String> {
    decode_first!(row, index,
        String => display,
        i64 => display,
        f64 => display,
        bool => flag_text,
    )
}

/// Undecodable columns come back as empty text, which the scraper skips
/// with a warning like any other unparseable value
fn convert_rows<R>(rows: &[R], decode: fn(&R, usize) -> Option<String>) -> Result<Vec<Row>, DbError>
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
{
    rows.iter()
        .map(|row| -> Result<Row, DbError> {
            let mut out = Row::new();
            for (index, column) in row.columns().iter().enumerate() {
                let cell = if row.try_get_raw(index)?.is_null() {
                    Cell::Null
                } else {
                    match decode(row, index) {
                        Some(text) => Cell::Value(text),
                        None => {
                            tracing::warn!(
                                column = column.name(),
                                column_type = column.type_info().name(),
                                "Unsupported column type, reading as empty text"
                            );
                            Cell::Value(String::new())
                        }
                    }
                };
                out.push(column.name(), cell);
            }
            Ok(out)
        })
        .collect()
}

// ============================================================
// Connector
// ============================================================

fn pool_options<DB: Database>(target: &TargetConfig) -> PoolOptions<DB> {
    let max = target.pool_size();
    PoolOptions::<DB>::new()
        .max_connections(max)
        .min_connections(target.pool_min_connections.min(max))
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

/// Opens lazily-connected pools; the first query or ping dials the server
#[derive(Default)]
pub struct SqlxConnector;

impl SqlxConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SqlxConnector {
    fn open(&self, name: &str, target: &TargetConfig) -> Result<Box<dyn Session>, DbError> {
        let backend = Backend::from_url(&target.url)?;
        let creds = credentials::resolve(target)?;
        let url = credentials::connection_url(&target.url, &creds)?;

        let role_sql = match target.role.as_deref() {
            Some(role) => {
                let sql = backend.set_role_sql(role);
                if sql.is_none() {
                    tracing::warn!(database = %name, role = role, "Backend has no roles, ignoring configured role");
                }
                sql
            }
            None => None,
        };

        tracing::info!(
            database = %name,
            backend = ?backend,
            url = %mask_dsn(&target.url),
            role = target.role.as_deref().unwrap_or("default"),
            max_connections = target.pool_size(),
            "Opening connection pool"
        );

        let pool = match backend {
            Backend::Postgres => {
                let mut options = pool_options::<Postgres>(target);
                if let Some(sql) = role_sql {
                    options = options.after_connect(move |conn, _meta| {
                        let sql = sql.clone();
                        Box::pin(async move {
                            conn.execute(sql.as_str()).await?;
                            Ok(())
                        })
                    });
                }
                Pool::Postgres(options.connect_lazy(&url)?)
            }
            Backend::MySql => {
                let mut options = pool_options::<MySql>(target);
                if let Some(sql) = role_sql {
                    options = options.after_connect(move |conn, _meta| {
                        let sql = sql.clone();
                        Box::pin(async move {
                            conn.execute(sql.as_str()).await?;
                            Ok(())
                        })
                    });
                }
                Pool::MySql(options.connect_lazy(&url)?)
            }
            Backend::Sqlite => Pool::Sqlite(pool_options(target).connect_lazy(&url)?),
        };

        Ok(Box::new(SqlxSession { pool }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backend_from_url() {
        assert_eq!(Backend::from_url("postgres://db:5432/app").unwrap(), Backend::Postgres);
        assert_eq!(Backend::from_url("postgresql://db/app").unwrap(), Backend::Postgres);
        assert_eq!(Backend::from_url("MySQL://db:3306/app").unwrap(), Backend::MySql);
        assert_eq!(Backend::from_url("sqlite::memory:").unwrap(), Backend::Sqlite);
        assert!(Backend::from_url("oracle://db:1521/ORCL").is_err());
    }

    #[test]
    fn test_set_role_statements() {
        assert_eq!(
            Backend::Postgres.set_role_sql("pg_monitor").as_deref(),
            Some("SET ROLE \"pg_monitor\"")
        );
        assert_eq!(
            Backend::Postgres.set_role_sql("we\"ird").as_deref(),
            Some("SET ROLE \"we\"\"ird\"")
        );
        assert_eq!(Backend::MySql.set_role_sql("o'brien").as_deref(), Some("SET ROLE 'o''brien'"));
        assert_eq!(Backend::Sqlite.set_role_sql("admin"), None);
    }

    #[test]
    fn test_value_text() {
        let at = Utc.with_ymd_and_hms(2024, 6, 6, 14, 1, 22).unwrap() + chrono::Duration::milliseconds(513);
        assert_eq!(timestamp_text(at), "2024-06-06T14:01:22.513Z");
        assert_eq!(display(Decimal::new(1250, 2)), "12.50");
        assert_eq!(flag_text(true), "1");
        assert_eq!(flag_text(false), "0");
    }

    #[test]
    fn test_unsupported_scheme_is_rejected_at_open() {
        let target = TargetConfig {
            url: "oracle://db:1521/ORCL".to_string(),
            ..Default::default()
        };
        assert!(SqlxConnector::new().open("legacy", &target).is_err());
    }
}
