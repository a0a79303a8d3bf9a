//! SQLite storage for the inventory ledger
//!
//! ## Tables
//!
//! - `assets` - Ledger rows (inflow/outflow events, catalog entries, dividers)
//! - `asset_meta` - Aggregate counters per identity key
//! - `activities` - Sales/service activities; purchase confirmations drive the ledger
//! - `customers`, `customer_meta` - Owned products and per-type activity counters
//! - `work_requests` - Follow-up tickets produced by the escalation job
//! - `users`, `settings` - Directory and small configuration documents
//!
//! Versioned tables (`activities`, `asset_meta`, `customers`, `customer_meta`)
//! carry a `version` column that the optimistic [`txn::TransactionRunner`]
//! checks at commit.

pub mod schema;
pub mod models;
pub mod assets;
pub mod asset_meta;
pub mod activities;
pub mod customers;
pub mod work_requests;
pub mod directory;
pub mod txn;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::LedgerError;

/// SQLite database holding every ledger collection
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database
    pub fn open(storage_dir: &Path) -> Result<Self, LedgerError> {
        let db_path = storage_dir.join("ledger.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| LedgerError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // WAL keeps readers off the writer's lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LedgerError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with shared access to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, LedgerError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                row_count: count("SELECT COUNT(*) FROM assets")?,
                identity_count: count("SELECT COUNT(*) FROM asset_meta")?,
                activity_count: count("SELECT COUNT(*) FROM activities")?,
                open_request_count: count(
                    "SELECT COUNT(*) FROM work_requests WHERE status IN ('pending', 'review_requested')",
                )?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub row_count: u64,
    pub identity_count: u64,
    pub activity_count: u64,
    pub open_request_count: u64,
}

/// Map a JSON column parse failure into a rusqlite row error
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a text enum parse failure into a rusqlite row error
pub(crate) fn enum_column<T>(
    idx: usize,
    parsed: Result<T, LedgerError>,
) -> Result<T, rusqlite::Error> {
    parsed.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub use models::*;
pub use txn::{TransactionRunner, Txn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_stats() {
        let db = LedgerDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.row_count, 0);
        assert_eq!(stats.activity_count, 0);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = LedgerDb::open(dir.path()).unwrap();
        assert_eq!(db.stats().unwrap().identity_count, 0);
        assert!(dir.path().join("ledger.db").exists());
    }
}
