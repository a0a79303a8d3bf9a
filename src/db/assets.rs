//! Ledger row ("asset") operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{enum_column, AssetKind, LedgerRow};
use crate::error::LedgerError;
use crate::identity::IdentityKey;

/// Page size used when draining rows that belong to one activity
pub const SOURCE_PAGE_SIZE: u32 = 200;

const COLUMNS: &str = "id, name, category, master_id, kind, stock, last_inflow, last_outflow, \
     last_recipient, is_delivery_item, price, composition, last_action_date, last_operator, \
     edit_log, edit_time, edit_operators, source_activity_id, order_index, created_at";

impl LedgerRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let kind: String = row.get("kind")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            category: row.get("category")?,
            master_id: row.get("master_id")?,
            kind: enum_column(4, AssetKind::parse(&kind))?,
            stock: row.get("stock")?,
            last_inflow: row.get("last_inflow")?,
            last_outflow: row.get("last_outflow")?,
            last_recipient: row.get("last_recipient")?,
            is_delivery_item: row.get("is_delivery_item")?,
            price: row.get("price")?,
            composition: row.get("composition")?,
            last_action_date: row.get("last_action_date")?,
            last_operator: row.get("last_operator")?,
            edit_log: row.get("edit_log")?,
            edit_time: row.get("edit_time")?,
            edit_operators: row.get("edit_operators")?,
            source_activity_id: row.get("source_activity_id")?,
            order_index: row.get("order_index")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Get a row by ID
pub fn get_row(conn: &Connection, id: &str) -> Result<Option<LedgerRow>, LedgerError> {
    let sql = format!("SELECT {} FROM assets WHERE id = ?", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], LedgerRow::from_row)
        .optional()?)
}

/// Insert or fully replace a row
pub fn upsert_row(conn: &Connection, row: &LedgerRow) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO assets (id, name, category, master_id, identity_key, kind, stock, last_inflow,
            last_outflow, last_recipient, is_delivery_item, price, composition, last_action_date,
            last_operator, edit_log, edit_time, edit_operators, source_activity_id, order_index,
            created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            category = excluded.category,
            master_id = excluded.master_id,
            identity_key = excluded.identity_key,
            kind = excluded.kind,
            stock = excluded.stock,
            last_inflow = excluded.last_inflow,
            last_outflow = excluded.last_outflow,
            last_recipient = excluded.last_recipient,
            is_delivery_item = excluded.is_delivery_item,
            price = excluded.price,
            composition = excluded.composition,
            last_action_date = excluded.last_action_date,
            last_operator = excluded.last_operator,
            edit_log = excluded.edit_log,
            edit_time = excluded.edit_time,
            edit_operators = excluded.edit_operators,
            source_activity_id = excluded.source_activity_id,
            order_index = excluded.order_index",
        params![
            row.id,
            row.name,
            row.category,
            row.master_id,
            row.identity_key(),
            row.kind.as_str(),
            row.stock,
            row.last_inflow,
            row.last_outflow,
            row.last_recipient,
            row.is_delivery_item,
            row.price,
            row.composition,
            row.last_action_date,
            row.last_operator,
            row.edit_log,
            row.edit_time,
            row.edit_operators,
            row.source_activity_id,
            row.order_index,
            row.created_at,
        ],
    )?;
    Ok(())
}

/// Delete a row; returns whether it existed
pub fn delete_row(conn: &Connection, id: &str) -> Result<bool, LedgerError> {
    let affected = conn.execute("DELETE FROM assets WHERE id = ?", params![id])?;
    Ok(affected > 0)
}

/// All counted rows sharing an identity key
pub fn list_rows_by_identity(
    conn: &Connection,
    key: &IdentityKey,
) -> Result<Vec<LedgerRow>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM assets WHERE identity_key = ? AND kind = 'inventory' ORDER BY created_at",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![key], LedgerRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One page of rows produced by an activity
pub fn list_rows_by_source_page(
    conn: &Connection,
    activity_id: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<LedgerRow>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM assets WHERE source_activity_id = ? ORDER BY created_at, id LIMIT ? OFFSET ?",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![activity_id, limit as i64, offset as i64], LedgerRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every row produced by an activity, drained page by page
pub fn list_rows_by_source(
    conn: &Connection,
    activity_id: &str,
) -> Result<Vec<LedgerRow>, LedgerError> {
    let mut all = Vec::new();
    let mut offset = 0;
    loop {
        let page = list_rows_by_source_page(conn, activity_id, SOURCE_PAGE_SIZE, offset)?;
        let fetched = page.len() as u32;
        all.extend(page);
        if fetched < SOURCE_PAGE_SIZE {
            break;
        }
        offset += fetched;
    }
    debug!(activity_id = %activity_id, rows = all.len(), "Loaded rows for activity");
    Ok(all)
}

/// Rows of a category (or all), new unindexed rows first, then by order index
pub fn list_rows_ordered(
    conn: &Connection,
    category: Option<&str>,
) -> Result<Vec<LedgerRow>, LedgerError> {
    let mut sql = format!("SELECT {} FROM assets", COLUMNS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    if let Some(category) = category {
        sql.push_str(" WHERE category = ?");
        params.push(Box::new(category.to_string()));
    }
    sql.push_str(" ORDER BY order_index IS NOT NULL, order_index, created_at DESC");

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs.as_slice(), LedgerRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct identity keys of counted rows
pub fn list_identity_keys(conn: &Connection) -> Result<Vec<IdentityKey>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT identity_key FROM assets WHERE kind = 'inventory' ORDER BY identity_key",
    )?;
    let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// Assign dense order indexes in the given order
pub fn set_order(conn: &Connection, ids: &[String]) -> Result<(), LedgerError> {
    let mut stmt = conn.prepare("UPDATE assets SET order_index = ? WHERE id = ?")?;
    for (index, id) in ids.iter().enumerate() {
        let affected = stmt.execute(params![index as i64, id])?;
        if affected == 0 {
            return Err(LedgerError::NotFound(format!("asset {}", id)));
        }
    }
    Ok(())
}
