use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("retention: {0}")]
    Retention(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The single relational store behind every durable row. Writers are
/// serialized by the connection mutex; transactions are short. Runtime
/// components keep their own in-memory projections and must re-read
/// after a write they did not make themselves.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    #[instrument(level = "debug", skip(path), fields(subsys = "Storage"))]
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock().unwrap();
        Ok(f(&conn)?)
    }

    /// Runs `f` inside one transaction; commit on Ok, rollback on Err.
    /// All multi-row changes belonging to a single API operation go
    /// through here.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// RFC3339 helpers; every timestamp column is UTC text.
pub mod time {
    use chrono::{DateTime, Utc};

    pub fn to_sql(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339()
    }

    pub fn opt_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
        ts.map(to_sql)
    }

    pub fn from_sql(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    pub fn opt_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
        raw.as_deref().map(from_sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", []))
            .unwrap();

        let result = db.with_tx(|tx| {
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            // duplicate key forces the whole transaction back
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }
}
