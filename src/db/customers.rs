//! Customer and per-customer counter operations

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{json_column, Customer, CustomerMeta};
use crate::error::LedgerError;

impl Customer {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let owned: String = row.get("owned_products_json")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            owned_products: json_column(2, &owned)?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl CustomerMeta {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            customer_id: row.get("customer_id")?,
            activity_type: row.get("activity_type")?,
            count: row.get("count")?,
            last_sequence: row.get("last_sequence")?,
        })
    }
}

pub fn get_customer_versioned(
    conn: &Connection,
    id: &str,
) -> Result<Option<(Customer, i64)>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT id, name, owned_products_json, updated_at, version FROM customers WHERE id = ?",
            params![id],
            |row| Ok((Customer::from_row(row)?, row.get("version")?)),
        )
        .optional()?)
}

pub fn get_customer(conn: &Connection, id: &str) -> Result<Option<Customer>, LedgerError> {
    Ok(get_customer_versioned(conn, id)?.map(|(customer, _)| customer))
}

pub fn upsert_customer(conn: &Connection, customer: &Customer) -> Result<(), LedgerError> {
    let owned = serde_json::to_string(&customer.owned_products)?;
    conn.execute(
        "INSERT INTO customers (id, name, owned_products_json, updated_at, version)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            owned_products_json = excluded.owned_products_json,
            updated_at = excluded.updated_at,
            version = customers.version + 1",
        params![customer.id, customer.name, owned, customer.updated_at],
    )?;
    Ok(())
}

pub fn get_customer_meta_versioned(
    conn: &Connection,
    id: &str,
) -> Result<Option<(CustomerMeta, i64)>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT id, customer_id, activity_type, count, last_sequence, version
             FROM customer_meta WHERE id = ?",
            params![id],
            |row| Ok((CustomerMeta::from_row(row)?, row.get("version")?)),
        )
        .optional()?)
}

pub fn upsert_customer_meta(conn: &Connection, meta: &CustomerMeta) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO customer_meta (id, customer_id, activity_type, count, last_sequence, version)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)
         ON CONFLICT(id) DO UPDATE SET
            count = excluded.count,
            last_sequence = excluded.last_sequence,
            version = customer_meta.version + 1",
        params![
            meta.id,
            meta.customer_id,
            meta.activity_type,
            meta.count,
            meta.last_sequence,
        ],
    )?;
    Ok(())
}
