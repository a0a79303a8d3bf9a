//! User directory and settings documents

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use super::{enum_column, Role, UserProfile, WorkManagers};
use crate::error::LedgerError;

/// Settings document holding the responsible parties for invoice follow-up
pub const WORK_MANAGERS_DOC: &str = "work_managers";

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<UserProfile>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT id, name, role FROM users WHERE id = ?",
            params![id],
            |row| {
                let role: String = row.get(2)?;
                Ok(UserProfile {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    role: enum_column(2, Role::parse(&role))?,
                })
            },
        )
        .optional()?)
}

pub fn upsert_user(conn: &Connection, user: &UserProfile) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, role = excluded.role",
        params![user.id, user.name, user.role.as_str()],
    )?;
    Ok(())
}

/// Display name for a user id, falling back to the id itself
pub fn display_name(conn: &Connection, id: &str) -> Result<String, LedgerError> {
    Ok(get_user(conn, id)?.map(|u| u.name).unwrap_or_else(|| id.to_string()))
}

pub fn get_setting<T: DeserializeOwned>(conn: &Connection, id: &str) -> Result<Option<T>, LedgerError> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE id = ?", params![id], |row| row.get(0))
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(LedgerError::from))
        .transpose()
}

pub fn put_setting<T: Serialize>(conn: &Connection, id: &str, value: &T) -> Result<(), LedgerError> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings (id, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![id, raw, Utc::now()],
    )?;
    Ok(())
}

/// Load and validate `settings/work_managers`
pub fn get_work_managers(conn: &Connection) -> Result<WorkManagers, LedgerError> {
    let managers: WorkManagers = get_setting(conn, WORK_MANAGERS_DOC)?
        .ok_or_else(|| LedgerError::Config(format!("settings/{} is missing", WORK_MANAGERS_DOC)))?;
    managers.validate()?;
    Ok(managers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    #[test]
    fn test_work_managers_missing_then_present() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert!(matches!(get_work_managers(&conn), Err(LedgerError::Config(_))));

        put_setting(
            &conn,
            WORK_MANAGERS_DOC,
            &WorkManagers {
                biz_registration_manager_id: "biz".into(),
                tax_invoice_manager_id: "tax".into(),
            },
        )
        .unwrap();
        let managers = get_work_managers(&conn).unwrap();
        assert_eq!(managers.biz_registration_manager_id, "biz");
    }

    #[test]
    fn test_work_managers_partial_document_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        put_setting(&conn, WORK_MANAGERS_DOC, &serde_json::json!({ "bizRegistrationManagerId": "biz" }))
            .unwrap();
        assert!(matches!(get_work_managers(&conn), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_display_name_fallback() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        upsert_user(&conn, &UserProfile { id: "u1".into(), name: "Kim".into(), role: Role::Staff }).unwrap();

        assert_eq!(display_name(&conn, "u1").unwrap(), "Kim");
        assert_eq!(display_name(&conn, "ghost").unwrap(), "ghost");
    }
}
