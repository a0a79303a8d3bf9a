//! Activity CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{enum_column, json_column, Activity, FileDescriptor, ProductCategory};
use crate::error::LedgerError;

const COLUMNS: &str = "id, customer_id, activity_type, product_category, selected_products_json, \
     amount, discount, date, manager_id, manager_name, pay_method, delivery_info, tax_invoice_json, \
     modification_history_json, created_at, updated_at";

impl Activity {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let category: String = row.get("product_category")?;
        let products: String = row.get("selected_products_json")?;
        let history: String = row.get("modification_history_json")?;
        let invoice: Option<String> = row.get("tax_invoice_json")?;

        Ok(Self {
            id: row.get("id")?,
            customer_id: row.get("customer_id")?,
            activity_type: row.get("activity_type")?,
            product_category: enum_column(3, ProductCategory::parse(&category))?,
            selected_products: json_column(4, &products)?,
            amount: row.get("amount")?,
            discount: row.get("discount")?,
            date: row.get("date")?,
            manager_id: row.get("manager_id")?,
            manager_name: row.get("manager_name")?,
            pay_method: row.get("pay_method")?,
            delivery_info: row.get("delivery_info")?,
            tax_invoice: invoice
                .as_deref()
                .map(|raw| json_column::<FileDescriptor>(12, raw))
                .transpose()?,
            modification_history: json_column(13, &history)?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Get an activity and its version
pub fn get_activity_versioned(
    conn: &Connection,
    id: &str,
) -> Result<Option<(Activity, i64)>, LedgerError> {
    let sql = format!("SELECT {}, version FROM activities WHERE id = ?", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], |row| {
            Ok((Activity::from_row(row)?, row.get("version")?))
        })
        .optional()?)
}

pub fn get_activity(conn: &Connection, id: &str) -> Result<Option<Activity>, LedgerError> {
    Ok(get_activity_versioned(conn, id)?.map(|(activity, _)| activity))
}

/// Insert or replace an activity, bumping the version
pub fn upsert_activity(conn: &Connection, activity: &Activity) -> Result<(), LedgerError> {
    let products = serde_json::to_string(&activity.selected_products)?;
    let history = serde_json::to_string(&activity.modification_history)?;
    let invoice = activity
        .tax_invoice
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO activities (id, customer_id, activity_type, product_category,
            selected_products_json, amount, discount, date, manager_id, manager_name, pay_method,
            delivery_info, tax_invoice_json, modification_history_json, created_at, updated_at, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1)
         ON CONFLICT(id) DO UPDATE SET
            customer_id = excluded.customer_id,
            activity_type = excluded.activity_type,
            product_category = excluded.product_category,
            selected_products_json = excluded.selected_products_json,
            amount = excluded.amount,
            discount = excluded.discount,
            date = excluded.date,
            manager_id = excluded.manager_id,
            manager_name = excluded.manager_name,
            pay_method = excluded.pay_method,
            delivery_info = excluded.delivery_info,
            tax_invoice_json = excluded.tax_invoice_json,
            modification_history_json = excluded.modification_history_json,
            updated_at = excluded.updated_at,
            version = activities.version + 1",
        params![
            activity.id,
            activity.customer_id,
            activity.activity_type,
            activity.product_category.as_str(),
            products,
            activity.amount,
            activity.discount,
            activity.date,
            activity.manager_id,
            activity.manager_name,
            activity.pay_method,
            activity.delivery_info,
            invoice,
            history,
            activity.created_at,
            activity.updated_at,
        ],
    )?;
    Ok(())
}

pub fn delete_activity(conn: &Connection, id: &str) -> Result<bool, LedgerError> {
    let affected = conn.execute("DELETE FROM activities WHERE id = ?", params![id])?;
    Ok(affected > 0)
}

/// Activities of a type and pay method that have no registered invoice
pub fn list_missing_invoice(
    conn: &Connection,
    activity_type: &str,
    pay_method: &str,
) -> Result<Vec<Activity>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM activities
         WHERE activity_type = ? AND pay_method = ? AND tax_invoice_json IS NULL
         ORDER BY created_at",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![activity_type, pay_method], Activity::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Register (or clear) the tax invoice of an activity outside the ledger path
pub fn set_tax_invoice(
    conn: &Connection,
    id: &str,
    invoice: Option<&FileDescriptor>,
) -> Result<bool, LedgerError> {
    let invoice = invoice.map(serde_json::to_string).transpose()?;
    let affected = conn.execute(
        "UPDATE activities SET tax_invoice_json = ?, version = version + 1 WHERE id = ?",
        params![invoice, id],
    )?;
    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use crate::db::{SelectedProduct, PAY_METHOD_BANK_TRANSFER, PURCHASE_CONFIRM};
    use chrono::Utc;

    fn sample(id: &str, pay_method: &str) -> Activity {
        let now = Utc::now();
        Activity {
            id: id.to_string(),
            customer_id: "cust-1".into(),
            activity_type: PURCHASE_CONFIRM.into(),
            product_category: ProductCategory::Inventory,
            selected_products: vec![SelectedProduct {
                id: "row-1".into(),
                name: "Filter".into(),
                category: "Parts".into(),
                quantity: 2,
                master_id: None,
                price: None,
            }],
            amount: 100_000,
            discount: 0,
            date: "2025-01-06".into(),
            manager_id: "u1".into(),
            manager_name: "Kim".into(),
            pay_method: pay_method.into(),
            delivery_info: None,
            tax_invoice: None,
            modification_history: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_roundtrip_with_json_columns() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let activity = sample("a1", PAY_METHOD_BANK_TRANSFER);
        upsert_activity(&conn, &activity).unwrap();
        upsert_activity(&conn, &activity).unwrap();

        let (loaded, version) = get_activity_versioned(&conn, "a1").unwrap().unwrap();
        assert_eq!(loaded.selected_products, activity.selected_products);
        assert_eq!(version, 2);
    }

    #[test]
    fn test_missing_invoice_filter() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        upsert_activity(&conn, &sample("a1", PAY_METHOD_BANK_TRANSFER)).unwrap();
        upsert_activity(&conn, &sample("a2", "card")).unwrap();
        upsert_activity(&conn, &sample("a3", PAY_METHOD_BANK_TRANSFER)).unwrap();
        set_tax_invoice(
            &conn,
            "a3",
            Some(&FileDescriptor {
                name: "invoice.pdf".into(),
                path: "attachments/invoice.pdf".into(),
                size_bytes: 10,
                uploaded_at: Utc::now(),
            }),
        )
        .unwrap();

        let pending = list_missing_invoice(&conn, PURCHASE_CONFIRM, PAY_METHOD_BANK_TRANSFER).unwrap();
        let ids: Vec<_> = pending.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1"]);
    }
}
