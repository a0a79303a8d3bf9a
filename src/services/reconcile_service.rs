//! Self-healing reconciliation of meta counters
//!
//! Running totals in `asset_meta` are maintained by signed deltas inside
//! transactions. Renames, category edits or failed side effects can leave them
//! drifting from the rows. Healing recomputes the canonical totals for one
//! identity from every row that shares it and overwrites the counters.
//!
//! A heal only ever touches one identity bucket. Moving a row between
//! identities therefore needs two passes, which [`ReconcileService::rekey`]
//! wraps: the old identity without the row, the new identity with it.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::asset_meta::{self, CanonicalTotals};
use crate::db::{assets, AssetMeta, LedgerDb, LedgerRow};
use crate::error::LedgerError;
use crate::identity::{IdentityKey, ItemIdentity};

use super::events::{EventBus, LedgerEvent};

/// Canonical totals for `key` over `rows`.
///
/// `exclude_row_id` drops a row that is being removed or moved away;
/// `pending_override` stands in for a row that is being written, whether or
/// not it already appears in `rows`.
pub fn recompute(
    key: &IdentityKey,
    rows: &[LedgerRow],
    pending_override: Option<&LedgerRow>,
    exclude_row_id: Option<&str>,
) -> CanonicalTotals {
    let mut totals = CanonicalTotals::default();
    let mut override_used = false;

    let mut add = |row: &LedgerRow| {
        if row.is_counted() && &row.identity_key() == key {
            totals.total_inflow += row.last_inflow.unwrap_or(0);
            totals.total_outflow += row.last_outflow.unwrap_or(0);
        }
    };

    for row in rows {
        if Some(row.id.as_str()) == exclude_row_id {
            continue;
        }
        match pending_override {
            Some(pending) if pending.id == row.id => {
                add(pending);
                override_used = true;
            }
            _ => add(row),
        }
    }

    if let Some(pending) = pending_override {
        if !override_used && Some(pending.id.as_str()) != exclude_row_id {
            add(pending);
        }
    }

    totals.current_stock = totals.total_inflow - totals.total_outflow;
    totals
}

/// Starting inflow for an identity being created for the first time.
///
/// If rows with the same identity already exist (e.g. imported data), the
/// larger of the declared inflow and their combined stock signal wins, so a
/// re-import never undercounts.
pub fn calculate_initial_stock(
    identity: &ItemIdentity,
    existing_rows: &[LedgerRow],
    declared_inflow: i64,
) -> i64 {
    let key = identity.key();
    let matching: Vec<&LedgerRow> = existing_rows
        .iter()
        .filter(|row| row.is_counted() && row.identity_key() == key)
        .collect();

    if matching.is_empty() {
        return declared_inflow;
    }

    let existing_signal: i64 = matching
        .iter()
        .map(|row| row.last_inflow.unwrap_or(row.stock).max(0))
        .sum();

    declared_inflow.max(existing_signal)
}

/// Reconciliation engine bound to the ledger database
pub struct ReconcileService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ReconcileService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { db, events, clock }
    }

    /// Heal one identity.
    ///
    /// When `rows` is `None` every row of the identity is loaded first.
    pub fn heal(
        &self,
        identity: &ItemIdentity,
        rows: Option<&[LedgerRow]>,
        pending_override: Option<&LedgerRow>,
        exclude_row_id: Option<&str>,
    ) -> Result<AssetMeta, LedgerError> {
        self.heal_with(&identity.key(), rows, pending_override, exclude_row_id)
    }

    /// Heal by identity key, loading rows from storage
    pub fn heal_key(&self, key: &IdentityKey) -> Result<AssetMeta, LedgerError> {
        self.heal_with(key, None, None, None)
    }

    fn heal_with(
        &self,
        key: &IdentityKey,
        rows: Option<&[LedgerRow]>,
        pending_override: Option<&LedgerRow>,
        exclude_row_id: Option<&str>,
    ) -> Result<AssetMeta, LedgerError> {
        let now = self.clock.now();

        let healed = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let loaded;
            let rows = match rows {
                Some(rows) => rows,
                None => {
                    loaded = assets::list_rows_by_identity(&tx, key)?;
                    &loaded[..]
                }
            };

            let totals = recompute(key, rows, pending_override, exclude_row_id);
            let previous = asset_meta::get_meta(&tx, key)?;
            let healed = asset_meta::overwrite_meta(&tx, key, totals, "self_heal", now)?;
            tx.commit()?;

            match previous {
                Some(prev) if prev.current_stock != healed.current_stock
                    || prev.total_inflow != healed.total_inflow
                    || prev.total_outflow != healed.total_outflow =>
                {
                    info!(
                        key = %key,
                        stock_before = prev.current_stock,
                        stock_after = healed.current_stock,
                        outflow_before = prev.total_outflow,
                        outflow_after = healed.total_outflow,
                        "Corrected meta drift"
                    );
                }
                _ => debug!(key = %key, stock = healed.current_stock, "Meta already canonical"),
            }

            Ok(healed)
        })?;

        self.events.emit(LedgerEvent::MetaHealed {
            key: key.clone(),
            current_stock: healed.current_stock,
        });

        Ok(healed)
    }

    /// Move `row` from `old` to its current identity: heal the old bucket
    /// without it, then the new bucket with it.
    pub fn rekey(
        &self,
        old: &ItemIdentity,
        row: &LedgerRow,
    ) -> Result<(AssetMeta, AssetMeta), LedgerError> {
        let old_key = old.key();
        let new_key = row.identity_key();

        if old_key == new_key {
            let healed = self.heal_with(&new_key, None, Some(row), None)?;
            return Ok((healed.clone(), healed));
        }

        let old_meta = self.heal_with(&old_key, None, None, Some(&row.id))?;
        let new_meta = self.heal_with(&new_key, None, Some(row), None)?;
        info!(from = %old_key, to = %new_key, row = %row.id, "Re-keyed ledger row");
        Ok((old_meta, new_meta))
    }

    /// Heal every identity that has rows or counters
    pub fn heal_all(&self) -> Result<Vec<AssetMeta>, LedgerError> {
        let mut keys = self.db.with_conn(assets::list_identity_keys)?;
        keys.extend(
            self.db
                .with_conn(asset_meta::list_meta)?
                .into_iter()
                .map(|meta| meta.key),
        );
        keys.sort();
        keys.dedup();

        keys.iter().map(|key| self.heal_key(key)).collect()
    }

    /// Heal `keys` on a background task. Failures are logged, never returned.
    ///
    /// Outside a Tokio runtime the keys are healed inline and `None` is returned.
    pub fn spawn_heal(self: &Arc<Self>, keys: Vec<IdentityKey>) -> Option<JoinHandle<()>> {
        let service = Arc::clone(self);
        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn_blocking(move || service.heal_logged(&keys))),
            Err(_) => {
                debug!(keys = keys.len(), "No runtime, healing inline");
                service.heal_logged(&keys);
                None
            }
        }
    }

    fn heal_logged(&self, keys: &[IdentityKey]) {
        for key in keys {
            if let Err(e) = self.heal_key(key) {
                warn!(key = %key, error = %e, "Self-heal failed");
            }
        }
    }
}
