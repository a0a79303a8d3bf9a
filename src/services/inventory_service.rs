//! Inventory service - manual ledger operations
//!
//! Stock-in, manual row edits, dividers and ordering. Meta counters move by
//! signed deltas inside a transaction like the activity path; identity changes
//! are followed by a re-key reconciliation.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::{assets, AssetKind, AssetMeta, LedgerRow, MetaDelta, TransactionRunner, UserProfile};
use crate::error::LedgerError;
use crate::identity::{IdentityKey, ItemIdentity};

use super::events::{EventBus, LedgerEvent};
use super::reconcile_service::{calculate_initial_stock, ReconcileService};

/// Manual inflow of one item
#[derive(Debug, Clone)]
pub struct StockInInput {
    pub name: String,
    pub category: String,
    pub master_id: Option<String>,
    pub quantity: i64,
    /// Business date of the inflow (YYYY-MM-DD)
    pub date: String,
}

/// Fields a manual edit may change; `None` leaves the field as is
#[derive(Debug, Clone, Default)]
pub struct RowPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub last_inflow: Option<i64>,
    pub last_outflow: Option<i64>,
    pub last_recipient: Option<String>,
}

impl RowPatch {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.last_inflow.is_none()
            && self.last_outflow.is_none()
            && self.last_recipient.is_none()
    }
}

fn contribution(row: &LedgerRow) -> MetaDelta {
    let mut delta = MetaDelta::default();
    if row.is_counted() {
        delta.add_inflow(row.last_inflow.unwrap_or(0));
        delta.add_outflow(row.last_outflow.unwrap_or(0));
    }
    delta
}

fn negate(delta: MetaDelta) -> MetaDelta {
    MetaDelta {
        stock: -delta.stock,
        inflow: -delta.inflow,
        outflow: -delta.outflow,
    }
}

fn combine(a: MetaDelta, b: MetaDelta) -> MetaDelta {
    MetaDelta {
        stock: a.stock + b.stock,
        inflow: a.inflow + b.inflow,
        outflow: a.outflow + b.outflow,
    }
}

/// Apply `patch` to a copy of `row`, returning it with the audit message
fn patched(row: &LedgerRow, patch: &RowPatch) -> Result<(LedgerRow, String), LedgerError> {
    let mut updated = row.clone();
    let mut changes = Vec::new();

    if let Some(name) = patch.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err(LedgerError::Validation("name cannot be empty".into()));
        }
        if name != row.name {
            changes.push(format!("name {} → {}", row.name, name));
            updated.name = name.to_string();
        }
    }
    if let Some(category) = patch.category.as_deref().map(str::trim) {
        if category.is_empty() {
            return Err(LedgerError::Validation("category cannot be empty".into()));
        }
        if category != row.category {
            changes.push(format!("category {} → {}", row.category, category));
            updated.category = category.to_string();
        }
    }

    if row.is_counted() {
        if let Some(inflow) = patch.last_inflow {
            if inflow < 0 {
                return Err(LedgerError::Validation("inflow cannot be negative".into()));
            }
            if Some(inflow) != row.last_inflow {
                changes.push(format!("inflow {} → {}", row.last_inflow.unwrap_or(0), inflow));
                updated.last_inflow = Some(inflow);
            }
        }
        if let Some(outflow) = patch.last_outflow {
            if outflow < 0 {
                return Err(LedgerError::Validation("outflow cannot be negative".into()));
            }
            if Some(outflow) != row.last_outflow {
                changes.push(format!("outflow {} → {}", row.last_outflow.unwrap_or(0), outflow));
                updated.last_outflow = Some(outflow);
            }
        }
        if let Some(recipient) = patch.last_recipient.as_deref().map(str::trim) {
            let recipient = if recipient.is_empty() { crate::db::NO_RECIPIENT } else { recipient };
            if recipient != row.last_recipient {
                changes.push(format!("recipient {} → {}", row.last_recipient, recipient));
                updated.last_recipient = recipient.to_string();
            }
        }
    } else if patch.last_inflow.is_some() || patch.last_outflow.is_some() {
        return Err(LedgerError::Validation(format!(
            "{} rows carry no quantities",
            row.kind.as_str()
        )));
    }

    Ok((updated, changes.join(", ")))
}

/// Business logic for manual ledger maintenance
pub struct InventoryService {
    runner: TransactionRunner,
    reconcile: Arc<ReconcileService>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(
        runner: TransactionRunner,
        reconcile: Arc<ReconcileService>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runner,
            reconcile,
            events,
            clock,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get_row(&self, id: &str) -> Result<Option<LedgerRow>, LedgerError> {
        self.runner.db().with_conn(|conn| assets::get_row(conn, id))
    }

    /// Rows of a category (or all), unindexed rows first
    pub fn list_rows(&self, category: Option<&str>) -> Result<Vec<LedgerRow>, LedgerError> {
        self.runner
            .db()
            .with_conn(|conn| assets::list_rows_ordered(conn, category))
    }

    pub fn meta(&self, key: &IdentityKey) -> Result<Option<AssetMeta>, LedgerError> {
        self.runner
            .db()
            .with_conn(|conn| crate::db::asset_meta::get_meta(conn, key))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Record a manual inflow
    pub fn stock_in(&self, input: StockInInput, actor: &UserProfile) -> Result<LedgerRow, LedgerError> {
        if input.name.trim().is_empty() || input.category.trim().is_empty() {
            return Err(LedgerError::Validation("name and category are required".into()));
        }
        if input.quantity < 1 {
            return Err(LedgerError::Validation("quantity must be at least 1".into()));
        }

        let identity = ItemIdentity::new(&input.name, &input.category, input.master_id.as_deref());
        let key = identity.key();
        let existing = self
            .runner
            .db()
            .with_conn(|conn| assets::list_rows_by_identity(conn, &key))?;
        let now = self.clock.now();

        let row = self.runner.run(|txn| {
            let current = txn.get_meta(&key)?;
            let (mut meta, inflow, message) = match current {
                Some(meta) => (meta, input.quantity, format!("stock in +{}", input.quantity)),
                None => {
                    let initial = calculate_initial_stock(&identity, &existing, input.quantity);
                    (
                        AssetMeta::empty(key.clone(), now),
                        initial,
                        format!("initial stock {}", initial),
                    )
                }
            };

            let mut delta = MetaDelta::default();
            delta.add_inflow(inflow);
            meta.apply(&delta, "stock_in", now);

            let mut row = LedgerRow::new(&identity.name, &identity.category, AssetKind::Inventory, now);
            row.master_id = identity.master_id.clone();
            row.last_inflow = Some(inflow);
            row.stock = meta.current_stock;
            row.last_action_date = Some(input.date.clone());
            row.last_operator = Some(actor.name.clone());
            row.push_audit(&message, now, &actor.name);

            txn.put_meta(meta);
            txn.insert_row(row.clone());
            Ok(row)
        })?;

        info!(key = %key, inflow = row.last_inflow.unwrap_or(0), stock = row.stock, "Stock in");
        self.events.emit(LedgerEvent::RowsChanged {
            category: Some(row.category.clone()),
            row_ids: vec![row.id.clone()],
        });
        Ok(row)
    }

    /// Manually edit a row; identity changes trigger a re-key reconciliation
    pub fn edit_row(&self, row_id: &str, patch: RowPatch, actor: &UserProfile) -> Result<LedgerRow, LedgerError> {
        if patch.is_empty() {
            return Err(LedgerError::Validation("nothing to change".into()));
        }
        let original = self
            .get_row(row_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("asset {}", row_id)))?;
        let (mut updated, message) = patched(&original, &patch)?;
        if message.is_empty() {
            return Ok(original);
        }

        let now = self.clock.now();
        updated.push_audit(&message, now, &actor.name);
        updated.last_operator = Some(actor.name.clone());

        let old_key = original.identity_key();
        let new_key = updated.identity_key();
        let counted = original.is_counted();

        self.runner.run(|txn| {
            if !counted {
                txn.insert_row(updated.clone());
                return Ok(());
            }

            let mut old_meta = txn
                .get_meta(&old_key)?
                .unwrap_or_else(|| AssetMeta::empty(old_key.clone(), now));
            let new_meta = if new_key != old_key {
                Some(
                    txn.get_meta(&new_key)?
                        .unwrap_or_else(|| AssetMeta::empty(new_key.clone(), now)),
                )
            } else {
                None
            };

            let removed = negate(contribution(&original));
            let added = contribution(&updated);
            match new_meta {
                None => {
                    old_meta.apply(&combine(removed, added), "manual_edit", now);
                    txn.put_meta(old_meta);
                }
                Some(mut new_meta) => {
                    old_meta.apply(&removed, "manual_edit", now);
                    new_meta.apply(&added, "manual_edit", now);
                    txn.put_meta(old_meta);
                    txn.put_meta(new_meta);
                }
            }
            txn.insert_row(updated.clone());
            Ok(())
        })?;

        debug!(row = %row_id, change = %message, "Edited ledger row");

        if counted {
            if old_key != new_key {
                if let Err(e) = self.reconcile.rekey(&original.identity(), &updated) {
                    warn!(row = %row_id, error = %e, "Re-key reconciliation failed");
                }
            } else {
                self.reconcile.spawn_heal(vec![new_key]);
            }
        }

        self.events.emit(LedgerEvent::RowsChanged {
            category: Some(updated.category.clone()),
            row_ids: vec![updated.id.clone()],
        });
        Ok(updated)
    }

    /// Insert a visual separator; never part of ledger math
    pub fn add_divider(&self, category: &str, label: &str) -> Result<LedgerRow, LedgerError> {
        if category.trim().is_empty() {
            return Err(LedgerError::Validation("category is required".into()));
        }
        let divider = LedgerRow::new(label, category, AssetKind::Divider, self.clock.now());
        self.runner
            .db()
            .with_conn(|conn| assets::upsert_row(conn, &divider))?;

        self.events.emit(LedgerEvent::RowsChanged {
            category: Some(divider.category.clone()),
            row_ids: vec![divider.id.clone()],
        });
        Ok(divider)
    }

    /// Delete a manual row, reversing its contribution to meta.
    ///
    /// Rows produced by an activity are removed through the activity.
    pub fn delete_row(&self, row_id: &str) -> Result<LedgerRow, LedgerError> {
        let row = self
            .get_row(row_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("asset {}", row_id)))?;
        if let Some(activity_id) = &row.source_activity_id {
            return Err(LedgerError::Validation(format!(
                "row belongs to activity {}; delete or edit the activity instead",
                activity_id
            )));
        }

        let now = self.clock.now();
        let key = row.identity_key();
        self.runner.run(|txn| {
            if row.is_counted() {
                let mut meta = txn
                    .get_meta(&key)?
                    .unwrap_or_else(|| AssetMeta::empty(key.clone(), now));
                meta.apply(&negate(contribution(&row)), "manual_delete", now);
                txn.put_meta(meta);
            }
            txn.delete_row(&row.id);
            Ok(())
        })?;

        info!(row = %row_id, kind = row.kind.as_str(), "Deleted ledger row");
        self.events.emit(LedgerEvent::RowsChanged {
            category: Some(row.category.clone()),
            row_ids: vec![row.id.clone()],
        });
        Ok(row)
    }

    /// Assign dense order indexes 0..n in the given order
    pub fn reorder(&self, ids: &[String]) -> Result<(), LedgerError> {
        self.runner.db().with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            assets::set_order(&tx, ids)?;
            tx.commit()?;
            Ok(())
        })?;

        self.events.emit(LedgerEvent::RowsChanged {
            category: None,
            row_ids: ids.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::TransactionConfig;
    use crate::db::{LedgerDb, Role};

    fn service() -> InventoryService {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let runner = TransactionRunner::new(db.clone(), &TransactionConfig::default());
        let reconcile = Arc::new(ReconcileService::new(db, events.clone(), clock.clone()));
        InventoryService::new(runner, reconcile, events, clock)
    }

    fn actor() -> UserProfile {
        UserProfile {
            id: "u-1".into(),
            name: "Kim".into(),
            role: Role::Staff,
        }
    }

    fn stock(name: &str, qty: i64) -> StockInInput {
        StockInInput {
            name: name.into(),
            category: "Parts".into(),
            master_id: None,
            quantity: qty,
            date: "2025-01-06".into(),
        }
    }

    #[test]
    fn test_stock_in_accumulates() {
        let service = service();
        let first = service.stock_in(stock("Filter", 10), &actor()).unwrap();
        let second = service.stock_in(stock(" filter ", 5), &actor()).unwrap();

        assert_eq!(first.stock, 10);
        assert_eq!(second.stock, 15);
        assert_eq!(second.audit_entries()[0].0, "stock in +5");

        let meta = service.meta(&first.identity_key()).unwrap().unwrap();
        assert_eq!(meta.total_inflow, 15);
        assert!(meta.is_balanced());
    }

    #[test]
    fn test_edit_row_adjusts_meta_by_difference() {
        let service = service();
        let row = service.stock_in(stock("Filter", 10), &actor()).unwrap();

        let patch = RowPatch {
            last_inflow: Some(7),
            ..Default::default()
        };
        let edited = service.edit_row(&row.id, patch, &actor()).unwrap();
        assert_eq!(edited.audit_entries().last().unwrap().0, "inflow 10 → 7");

        let meta = service.meta(&row.identity_key()).unwrap().unwrap();
        assert_eq!(meta.total_inflow, 7);
        assert_eq!(meta.current_stock, 7);
    }

    #[test]
    fn test_rename_moves_counts_to_new_identity() {
        let service = service();
        let row = service.stock_in(stock("Filter", 10), &actor()).unwrap();

        let patch = RowPatch {
            name: Some("Filter XL".into()),
            ..Default::default()
        };
        let edited = service.edit_row(&row.id, patch, &actor()).unwrap();

        let old = service.meta(&row.identity_key()).unwrap().unwrap();
        let new = service.meta(&edited.identity_key()).unwrap().unwrap();
        assert_eq!(old.current_stock, 0);
        assert_eq!(new.current_stock, 10);
    }

    #[test]
    fn test_dividers_and_ordering() {
        let service = service();
        let a = service.stock_in(stock("A", 1), &actor()).unwrap();
        let divider = service.add_divider("Parts", "---").unwrap();
        let b = service.stock_in(stock("B", 1), &actor()).unwrap();

        service
            .reorder(&[b.id.clone(), divider.id.clone(), a.id.clone()])
            .unwrap();
        let ids: Vec<String> = service
            .list_rows(Some("Parts"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![b.id.clone(), divider.id.clone(), a.id.clone()]);

        service.delete_row(&divider.id).unwrap();
        let err = service
            .edit_row(&a.id, RowPatch { last_outflow: Some(-1), ..Default::default() }, &actor())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_delete_reverses_contribution() {
        let service = service();
        let keep = service.stock_in(stock("Filter", 10), &actor()).unwrap();
        let drop = service.stock_in(stock("Filter", 4), &actor()).unwrap();

        service.delete_row(&drop.id).unwrap();
        let meta = service.meta(&keep.identity_key()).unwrap().unwrap();
        assert_eq!(meta.total_inflow, 10);
        assert_eq!(meta.current_stock, 10);
    }

    #[test]
    fn test_activity_rows_cannot_be_deleted_directly() {
        let service = service();
        let mut row = LedgerRow::new("Filter", "Parts", AssetKind::Inventory, chrono::Utc::now());
        row.source_activity_id = Some("act-1".into());
        service
            .runner
            .db()
            .with_conn(|conn| assets::upsert_row(conn, &row))
            .unwrap();

        let err = service.delete_row(&row.id).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
