//! Aggregate counter ("asset_meta") operations
//!
//! Writes through the transaction runner go through [`upsert_meta`] after the
//! runner has validated versions. [`overwrite_meta`] is the authoritative
//! reconciliation write; it bumps the version so any in-flight transaction that
//! read the old counters retries against the healed values.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::AssetMeta;
use crate::error::LedgerError;
use crate::identity::IdentityKey;

impl AssetMeta {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            key: row.get("key")?,
            total_inflow: row.get("total_inflow")?,
            total_outflow: row.get("total_outflow")?,
            current_stock: row.get("current_stock")?,
            last_updated_at: row.get("last_updated_at")?,
            last_action: row.get("last_action")?,
        })
    }
}

/// Get counters and their version
pub fn get_meta_versioned(
    conn: &Connection,
    key: &IdentityKey,
) -> Result<Option<(AssetMeta, i64)>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT key, total_inflow, total_outflow, current_stock, last_updated_at, last_action, version
             FROM asset_meta WHERE key = ?",
            params![key],
            |row| Ok((AssetMeta::from_row(row)?, row.get("version")?)),
        )
        .optional()?)
}

pub fn get_meta(conn: &Connection, key: &IdentityKey) -> Result<Option<AssetMeta>, LedgerError> {
    Ok(get_meta_versioned(conn, key)?.map(|(meta, _)| meta))
}

/// Insert or replace counters, bumping the version
pub fn upsert_meta(conn: &Connection, meta: &AssetMeta) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO asset_meta (key, total_inflow, total_outflow, current_stock, last_updated_at, last_action, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
         ON CONFLICT(key) DO UPDATE SET
            total_inflow = excluded.total_inflow,
            total_outflow = excluded.total_outflow,
            current_stock = excluded.current_stock,
            last_updated_at = excluded.last_updated_at,
            last_action = excluded.last_action,
            version = asset_meta.version + 1",
        params![
            meta.key,
            meta.total_inflow,
            meta.total_outflow,
            meta.current_stock,
            meta.last_updated_at,
            meta.last_action,
        ],
    )?;
    Ok(())
}

/// Canonical totals computed by reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalTotals {
    pub total_inflow: i64,
    pub total_outflow: i64,
    pub current_stock: i64,
}

/// Overwrite the three counters (merge semantics: other fields untouched
/// except the update stamp)
pub fn overwrite_meta(
    conn: &Connection,
    key: &IdentityKey,
    totals: CanonicalTotals,
    action: &str,
    now: DateTime<Utc>,
) -> Result<AssetMeta, LedgerError> {
    upsert_meta(
        conn,
        &AssetMeta {
            key: key.clone(),
            total_inflow: totals.total_inflow,
            total_outflow: totals.total_outflow,
            current_stock: totals.current_stock,
            last_updated_at: now,
            last_action: action.to_string(),
        },
    )?;

    get_meta(conn, key)?
        .ok_or_else(|| LedgerError::Internal(format!("meta {} missing after overwrite", key)))
}

/// Every meta document (for audits)
pub fn list_meta(conn: &Connection) -> Result<Vec<AssetMeta>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT key, total_inflow, total_outflow, current_stock, last_updated_at, last_action
         FROM asset_meta ORDER BY key",
    )?;
    let rows = stmt
        .query_map([], AssetMeta::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
