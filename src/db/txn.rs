//! Optimistic document transactions over SQLite
//!
//! A transaction callback reads versioned documents through [`Txn`], then
//! buffers writes. Reads are recorded with the version observed; commit
//! re-checks every recorded version under an IMMEDIATE SQLite transaction and
//! applies the buffered writes only if none moved. Otherwise the whole callback,
//! including its reads, is executed again.
//!
//! ```text
//! attempt 1: read meta(v3) ... compute delta ... commit -> meta is v4 now -> retry
//! attempt 2: read meta(v4) ... compute delta ... commit -> ok
//! ```
//!
//! All reads must happen before the first buffered write; a read after a write
//! fails with [`LedgerError::ReadAfterWrite`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use super::{activities, asset_meta, assets, customers, LedgerDb};
use super::{Activity, AssetMeta, Customer, CustomerMeta, LedgerRow};
use crate::config::TransactionConfig;
use crate::error::{LedgerError, StaleRead};
use crate::identity::IdentityKey;

/// Versioned tables the runner can guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Activities,
    AssetMeta,
    Customers,
    CustomerMeta,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Self::Activities => "activities",
            Self::AssetMeta => "asset_meta",
            Self::Customers => "customers",
            Self::CustomerMeta => "customer_meta",
        }
    }

    fn version_sql(&self) -> &'static str {
        match self {
            Self::Activities => "SELECT version FROM activities WHERE id = ?",
            Self::AssetMeta => "SELECT version FROM asset_meta WHERE key = ?",
            Self::Customers => "SELECT version FROM customers WHERE id = ?",
            Self::CustomerMeta => "SELECT version FROM customer_meta WHERE id = ?",
        }
    }
}

#[derive(Debug)]
struct ReadRecord {
    table: Table,
    id: String,
    /// None when the document did not exist
    version: Option<i64>,
}

#[derive(Debug)]
enum Write {
    PutActivity(Activity),
    DeleteActivity(String),
    PutCustomer(Customer),
    PutCustomerMeta(CustomerMeta),
    PutMeta(AssetMeta),
    InsertRow(LedgerRow),
    DeleteRow(String),
}

/// One execution of a transaction callback
pub struct Txn<'a> {
    db: &'a LedgerDb,
    attempt: u32,
    reads: Vec<ReadRecord>,
    writes: Vec<Write>,
}

impl<'a> Txn<'a> {
    fn new(db: &'a LedgerDb, attempt: u32) -> Self {
        Self {
            db,
            attempt,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// 1-based attempt number of this execution
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn guard_read(&self, what: &str) -> Result<(), LedgerError> {
        if self.writes.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::ReadAfterWrite(what.to_string()))
        }
    }

    fn record(&mut self, table: Table, id: &str, version: Option<i64>) {
        self.reads.push(ReadRecord {
            table,
            id: id.to_string(),
            version,
        });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_activity(&mut self, id: &str) -> Result<Option<Activity>, LedgerError> {
        self.guard_read(&format!("activities/{}", id))?;
        let found = self.db.with_conn(|conn| activities::get_activity_versioned(conn, id))?;
        self.record(Table::Activities, id, found.as_ref().map(|(_, v)| *v));
        Ok(found.map(|(activity, _)| activity))
    }

    pub fn get_customer(&mut self, id: &str) -> Result<Option<Customer>, LedgerError> {
        self.guard_read(&format!("customers/{}", id))?;
        let found = self.db.with_conn(|conn| customers::get_customer_versioned(conn, id))?;
        self.record(Table::Customers, id, found.as_ref().map(|(_, v)| *v));
        Ok(found.map(|(customer, _)| customer))
    }

    pub fn get_customer_meta(&mut self, id: &str) -> Result<Option<CustomerMeta>, LedgerError> {
        self.guard_read(&format!("customer_meta/{}", id))?;
        let found = self.db.with_conn(|conn| customers::get_customer_meta_versioned(conn, id))?;
        self.record(Table::CustomerMeta, id, found.as_ref().map(|(_, v)| *v));
        Ok(found.map(|(meta, _)| meta))
    }

    pub fn get_meta(&mut self, key: &IdentityKey) -> Result<Option<AssetMeta>, LedgerError> {
        self.guard_read(&format!("asset_meta/{}", key))?;
        let found = self.db.with_conn(|conn| asset_meta::get_meta_versioned(conn, key))?;
        self.record(Table::AssetMeta, key.as_str(), found.as_ref().map(|(_, v)| *v));
        Ok(found.map(|(meta, _)| meta))
    }

    // =========================================================================
    // Buffered writes
    // =========================================================================

    pub fn put_activity(&mut self, activity: Activity) {
        self.writes.push(Write::PutActivity(activity));
    }

    pub fn delete_activity(&mut self, id: &str) {
        self.writes.push(Write::DeleteActivity(id.to_string()));
    }

    pub fn put_customer(&mut self, customer: Customer) {
        self.writes.push(Write::PutCustomer(customer));
    }

    pub fn put_customer_meta(&mut self, meta: CustomerMeta) {
        self.writes.push(Write::PutCustomerMeta(meta));
    }

    pub fn put_meta(&mut self, meta: AssetMeta) {
        self.writes.push(Write::PutMeta(meta));
    }

    pub fn insert_row(&mut self, row: LedgerRow) {
        self.writes.push(Write::InsertRow(row));
    }

    pub fn delete_row(&mut self, id: &str) {
        self.writes.push(Write::DeleteRow(id.to_string()));
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Validate recorded versions and apply writes atomically
    fn commit(self, conn: &mut Connection) -> Result<Option<StaleRead>, LedgerError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for read in &self.reads {
            let current: Option<i64> = tx
                .query_row(read.table.version_sql(), params![read.id], |row| row.get(0))
                .optional()?;
            if current != read.version {
                // dropping `tx` rolls back
                return Ok(Some(StaleRead {
                    table: read.table.name(),
                    id: read.id.clone(),
                }));
            }
        }

        for write in &self.writes {
            match write {
                Write::PutActivity(activity) => activities::upsert_activity(&tx, activity)?,
                Write::DeleteActivity(id) => {
                    activities::delete_activity(&tx, id)?;
                }
                Write::PutCustomer(customer) => customers::upsert_customer(&tx, customer)?,
                Write::PutCustomerMeta(meta) => customers::upsert_customer_meta(&tx, meta)?,
                Write::PutMeta(meta) => asset_meta::upsert_meta(&tx, meta)?,
                Write::InsertRow(row) => assets::upsert_row(&tx, row)?,
                Write::DeleteRow(id) => {
                    assets::delete_row(&tx, id)?;
                }
            }
        }

        tx.commit()?;
        Ok(None)
    }
}

/// Runs transaction callbacks with retry-on-conflict
#[derive(Clone)]
pub struct TransactionRunner {
    db: Arc<LedgerDb>,
    max_attempts: u32,
    backoff_ms: u64,
}

impl TransactionRunner {
    pub fn new(db: Arc<LedgerDb>, config: &TransactionConfig) -> Self {
        Self {
            db,
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    /// Execute `callback` until it commits against unchanged reads.
    ///
    /// Errors returned by the callback abort immediately without retry.
    pub fn run<T, F>(&self, mut callback: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, LedgerError>,
    {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = self.attempt_once(attempt, &mut callback)? {
                return Ok(value);
            }
            if let Some(wait) = self.backoff() {
                std::thread::sleep(wait);
            }
        }
        Err(self.exhausted())
    }

    /// Same as [`run`](Self::run), but backs off on the Tokio timer so a
    /// conflicting retry never parks a runtime worker.
    pub async fn run_async<T, F>(&self, mut callback: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, LedgerError>,
    {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = self.attempt_once(attempt, &mut callback)? {
                return Ok(value);
            }
            if let Some(wait) = self.backoff() {
                tokio::time::sleep(wait).await;
            }
        }
        Err(self.exhausted())
    }

    /// `None` when the commit hit a stale read
    fn attempt_once<T, F>(&self, attempt: u32, callback: &mut F) -> Result<Option<T>, LedgerError>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T, LedgerError>,
    {
        let mut txn = Txn::new(&self.db, attempt);
        let value = callback(&mut txn)?;
        let writes = txn.pending_writes();

        match self.db.with_conn_mut(|conn| txn.commit(conn))? {
            None => {
                debug!(attempt, writes, "Transaction committed");
                Ok(Some(value))
            }
            Some(stale) => {
                debug!(attempt, %stale, "Transaction conflict, retrying");
                Ok(None)
            }
        }
    }

    fn exhausted(&self) -> LedgerError {
        warn!(attempts = self.max_attempts, "Transaction retries exhausted");
        LedgerError::Conflict {
            attempts: self.max_attempts,
        }
    }

    fn backoff(&self) -> Option<Duration> {
        if self.backoff_ms == 0 {
            return None;
        }
        let millis = rand::thread_rng().gen_range(0..=self.backoff_ms);
        Some(Duration::from_millis(millis))
    }
}
