//! Work request operations

use rusqlite::{params, Connection, Row};

use super::{enum_column, RequestStatus, TriggerType, WorkRequest};
use crate::error::LedgerError;

const COLUMNS: &str =
    "id, title, content, sender_id, receiver_id, status, related_activity_id, trigger_type, created_at";

impl WorkRequest {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status: String = row.get("status")?;
        let trigger: Option<String> = row.get("trigger_type")?;
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            content: row.get("content")?,
            sender_id: row.get("sender_id")?,
            receiver_id: row.get("receiver_id")?,
            status: enum_column(5, RequestStatus::parse(&status))?,
            related_activity_id: row.get("related_activity_id")?,
            trigger_type: trigger.as_deref().and_then(TriggerType::parse),
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert_request(conn: &Connection, request: &WorkRequest) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO work_requests (id, title, content, sender_id, receiver_id, status,
            related_activity_id, trigger_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            request.id,
            request.title,
            request.content,
            request.sender_id,
            request.receiver_id,
            request.status.as_str(),
            request.related_activity_id,
            request.trigger_type.map(|t| t.as_str()),
            request.created_at,
        ],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, id: &str, status: RequestStatus) -> Result<bool, LedgerError> {
    let affected = conn.execute(
        "UPDATE work_requests SET status = ? WHERE id = ?",
        params![status.as_str(), id],
    )?;
    Ok(affected > 0)
}

/// Requests linked to an activity whose trigger is one of `triggers`, oldest first
pub fn list_for_activity(
    conn: &Connection,
    activity_id: &str,
    triggers: &[TriggerType],
) -> Result<Vec<WorkRequest>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM work_requests WHERE related_activity_id = ? ORDER BY created_at, id",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![activity_id], WorkRequest::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|r| r.trigger_type.map_or(false, |t| triggers.contains(&t)))
        .collect())
}
