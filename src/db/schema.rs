//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(ACTIVITY_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create activity tables: {}", e)))?;

    conn.execute_batch(DIRECTORY_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create directory tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Ledger rows and meta counters
const LEDGER_SCHEMA: &str = r#"
-- One inventory inflow/outflow/catalog event ("asset")
CREATE TABLE IF NOT EXISTS assets (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    master_id TEXT,
    -- Derived from master_id or normalized name+category
    identity_key TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'inventory',

    stock INTEGER NOT NULL DEFAULT 0,
    last_inflow INTEGER,
    last_outflow INTEGER,
    last_recipient TEXT NOT NULL DEFAULT '-',
    is_delivery_item INTEGER NOT NULL DEFAULT 0,
    price INTEGER,
    composition TEXT,

    -- Audit
    last_action_date TEXT,
    last_operator TEXT,
    edit_log TEXT NOT NULL DEFAULT '',
    edit_time TEXT NOT NULL DEFAULT '',
    edit_operators TEXT NOT NULL DEFAULT '',
    source_activity_id TEXT,

    order_index INTEGER,
    created_at TEXT NOT NULL
);

-- Aggregate counters, one per identity key; never deleted
CREATE TABLE IF NOT EXISTS asset_meta (
    key TEXT PRIMARY KEY NOT NULL,
    total_inflow INTEGER NOT NULL DEFAULT 0,
    total_outflow INTEGER NOT NULL DEFAULT 0,
    current_stock INTEGER NOT NULL DEFAULT 0,
    last_updated_at TEXT NOT NULL,
    last_action TEXT NOT NULL DEFAULT '',
    version INTEGER NOT NULL DEFAULT 1
);
"#;

/// Activities, customers and follow-up requests
const ACTIVITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY NOT NULL,
    customer_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    product_category TEXT NOT NULL,
    selected_products_json TEXT NOT NULL DEFAULT '[]',
    amount INTEGER NOT NULL DEFAULT 0,
    discount INTEGER NOT NULL DEFAULT 0,
    date TEXT NOT NULL,
    manager_id TEXT NOT NULL,
    manager_name TEXT NOT NULL,
    pay_method TEXT NOT NULL DEFAULT '',
    delivery_info TEXT,
    -- NULL when no invoice has been registered
    tax_invoice_json TEXT,
    modification_history_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    owned_products_json TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

-- Per-customer per-activity-type counters
CREATE TABLE IF NOT EXISTS customer_meta (
    id TEXT PRIMARY KEY NOT NULL,
    customer_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    last_sequence INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS work_requests (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    related_activity_id TEXT,
    trigger_type TEXT,
    created_at TEXT NOT NULL
);
"#;

/// Users and settings documents
const DIRECTORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'staff'
);

-- Small JSON documents keyed by name, e.g. 'work_managers'
CREATE TABLE IF NOT EXISTS settings (
    id TEXT PRIMARY KEY NOT NULL,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_assets_identity_key ON assets(identity_key);
CREATE INDEX IF NOT EXISTS idx_assets_source_activity ON assets(source_activity_id);
CREATE INDEX IF NOT EXISTS idx_assets_category_order ON assets(category, order_index);

CREATE INDEX IF NOT EXISTS idx_activities_type_pay ON activities(activity_type, pay_method);
CREATE INDEX IF NOT EXISTS idx_activities_customer ON activities(customer_id);

CREATE INDEX IF NOT EXISTS idx_work_requests_activity ON work_requests(related_activity_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
