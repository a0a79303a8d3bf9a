//! Activity service - purchase confirmations and the rows they deduct
//!
//! Create, edit and delete each run as one optimistic transaction that keeps
//! the activity, its ledger rows, the affected meta counters and the
//! customer's owned products consistent:
//!
//! ```text
//! validate -> upload attachment -> pre-read rows -> txn {
//!     reads:  activity, customer, customer_meta, every touched meta
//!     writes: activity, customer, rows (delete old, insert new), metas
//! } -> detached self-heal of touched keys -> events
//! ```
//!
//! An attachment uploaded for a transaction that never commits is moved to
//! the trash before the error is returned.
//!
//! Meta updates are signed deltas against values read in the same
//! transaction, so concurrent edits of one identity serialize through the
//! runner's retry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentStore, PendingAttachment};
use crate::calendar::{EditWindow, HolidaySet};
use crate::clock::Clock;
use crate::db::{
    assets, Activity, AssetKind, AssetMeta, CustomerMeta, FileDescriptor, LedgerRow, MetaDelta,
    ModificationEntry, OwnedProduct, ProductCategory, SelectedProduct, TransactionRunner, Txn,
    UserProfile, PURCHASE_CONFIRM,
};
use crate::error::LedgerError;
use crate::holidays::{load_window_holidays, HolidaySource};
use crate::identity::IdentityKey;

use super::events::{EventBus, LedgerEvent};
use super::reconcile_service::ReconcileService;

/// Manager picked on the form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedManager {
    pub id: String,
    pub name: String,
}

/// Form data for creating or editing an activity
#[derive(Debug, Clone)]
pub struct ActivityInput {
    pub customer_id: String,
    pub activity_type: String,
    pub product_category: ProductCategory,
    pub selected_products: Vec<SelectedProduct>,
    pub amount: i64,
    pub discount: i64,
    pub date: String,
    pub pay_method: String,
    pub delivery_info: Option<String>,
    /// `None` keeps the current manager, or the actor on create
    pub manager: Option<AssignedManager>,
    /// Required on edits that change a deducted quantity
    pub edit_reason: Option<String>,
    pub attachment: Option<PendingAttachment>,
}

impl ActivityInput {
    fn drives_ledger(&self) -> bool {
        self.activity_type == PURCHASE_CONFIRM && self.product_category == ProductCategory::Inventory
    }
}

/// Result of a committed activity mutation
#[derive(Debug)]
pub struct ActivityOutcome {
    pub activity: Activity,
    pub affected_keys: Vec<IdentityKey>,
    /// Detached reconciliation of `affected_keys`; awaiting it is optional.
    /// `None` when the heal already ran inline.
    pub heal_task: Option<JoinHandle<()>>,
}

impl ActivityOutcome {
    /// Wait for the detached heal, if one is still running
    pub async fn wait_for_heal(&mut self) {
        if let Some(task) = self.heal_task.take() {
            if let Err(e) = task.await {
                warn!(activity_id = %self.activity.id, error = %e, "Self-heal task aborted");
            }
        }
    }
}

/// Merge selections that reference the same item, keeping first-seen order
pub fn aggregate_lines(products: &[SelectedProduct]) -> Vec<SelectedProduct> {
    let mut merged: Vec<SelectedProduct> = Vec::new();
    for product in products {
        match merged
            .iter_mut()
            .find(|line| line.aggregation_key() == product.aggregation_key())
        {
            Some(line) => line.quantity += product.quantity,
            None => merged.push(product.clone()),
        }
    }
    merged
}

/// Merge purchased quantities into the owned-products list by name.
///
/// With `fill_gaps_only` (edits) only names not yet owned are added; existing
/// quantities are never changed.
pub fn merge_owned_products(owned: &mut Vec<OwnedProduct>, lines: &[SelectedProduct], fill_gaps_only: bool) {
    for line in lines {
        let name = line.name.trim();
        match owned.iter_mut().find(|p| p.name == name) {
            Some(existing) if !fill_gaps_only => existing.quantity += line.quantity,
            Some(_) => {}
            None => owned.push(OwnedProduct {
                name: name.to_string(),
                quantity: line.quantity,
            }),
        }
    }
}

fn describe_products(products: &[SelectedProduct]) -> String {
    if products.is_empty() {
        return "none".to_string();
    }
    products
        .iter()
        .map(|p| format!("{} x{}", p.name, p.quantity))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_option(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "none".to_string())
}

/// Human-readable `"<label>: <old> → <new>"` lines for tracked fields
pub fn describe_changes(old: &Activity, new: &Activity) -> Vec<String> {
    let mut changes = Vec::new();
    let mut track = |label: &str, before: String, after: String| {
        if before != after {
            changes.push(format!("{}: {} → {}", label, before, after));
        }
    };

    track("Amount", old.amount.to_string(), new.amount.to_string());
    track("Discount", old.discount.to_string(), new.discount.to_string());
    track("Date", old.date.clone(), new.date.clone());
    track("Manager", old.manager_name.clone(), new.manager_name.clone());
    track(
        "Products",
        describe_products(&old.selected_products),
        describe_products(&new.selected_products),
    );
    track("Payment method", old.pay_method.clone(), new.pay_method.clone());
    track(
        "Delivery",
        describe_option(&old.delivery_info),
        describe_option(&new.delivery_info),
    );
    track(
        "Tax invoice",
        if old.tax_invoice.is_some() { "registered" } else { "none" }.to_string(),
        if new.tax_invoice.is_some() { "registered" } else { "none" }.to_string(),
    );
    changes
}

fn quantities_by_line(products: &[SelectedProduct]) -> BTreeMap<String, i64> {
    aggregate_lines(products)
        .into_iter()
        .map(|line| (line.aggregation_key(), line.quantity))
        .collect()
}

fn validate_input(input: &ActivityInput, previous: Option<&Activity>) -> Result<(), LedgerError> {
    if input.customer_id.trim().is_empty() {
        return Err(LedgerError::Validation("customer is required".into()));
    }
    if input.activity_type.trim().is_empty() {
        return Err(LedgerError::Validation("activity type is required".into()));
    }

    for (i, product) in input.selected_products.iter().enumerate() {
        if product.name.trim().is_empty() {
            return Err(LedgerError::Validation(format!("product[{}]: name is required", i)));
        }
        if product.category.trim().is_empty() {
            return Err(LedgerError::Validation(format!("product[{}]: category is required", i)));
        }
        if product.quantity < 1 {
            return Err(LedgerError::Validation(format!(
                "product[{}]: quantity must be at least 1",
                i
            )));
        }
        if input.product_category == ProductCategory::Product && product.price.is_none() {
            return Err(LedgerError::Validation(format!("product[{}]: price is required", i)));
        }
    }

    if let Some(previous) = previous {
        let quantity_changed = input.drives_ledger()
            && quantities_by_line(&previous.selected_products)
                != quantities_by_line(&input.selected_products);
        let has_reason = input
            .edit_reason
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        if quantity_changed && !has_reason {
            return Err(LedgerError::Validation(
                "an edit reason is required when quantities change".into(),
            ));
        }
    }

    Ok(())
}

/// Rows pre-read for `loaded` are stale once another edit of the activity committed
fn ensure_unchanged(current: &Activity, loaded: &Activity, attempt: u32) -> Result<(), LedgerError> {
    if current.updated_at != loaded.updated_at {
        warn!(activity_id = %current.id, "Activity changed while editing");
        return Err(LedgerError::Conflict { attempts: attempt });
    }
    Ok(())
}

/// Per-identity deltas for replacing `old_rows` with `new_lines`
#[derive(Debug, Default)]
struct LedgerPlan {
    deltas: BTreeMap<IdentityKey, MetaDelta>,
    /// Outflow previously deducted per identity, for audit messages
    previous: BTreeMap<IdentityKey, (i64, LedgerRow)>,
}

impl LedgerPlan {
    fn new(old_rows: &[LedgerRow], new_lines: &[SelectedProduct]) -> Self {
        let mut plan = Self::default();
        for row in old_rows.iter().filter(|r| r.is_counted()) {
            let key = row.identity_key();
            let outflow = row.last_outflow.unwrap_or(0);
            plan.deltas.entry(key.clone()).or_default().reverse_outflow(outflow);
            plan.previous
                .entry(key)
                .and_modify(|(qty, _)| *qty += outflow)
                .or_insert_with(|| (outflow, row.clone()));
        }
        for line in new_lines {
            plan.deltas
                .entry(line.identity().key())
                .or_default()
                .add_outflow(line.quantity);
        }
        plan
    }

    fn keys(&self) -> Vec<IdentityKey> {
        self.deltas.keys().cloned().collect()
    }
}

/// Who and what stamps the rows of one activity write
struct RowStamp<'a> {
    activity_id: &'a str,
    recipient: &'a str,
    operator: &'a str,
    date: &'a str,
    is_delivery: bool,
    initial: bool,
    action: &'static str,
    now: DateTime<Utc>,
}

fn read_metas(
    txn: &mut Txn<'_>,
    keys: &[IdentityKey],
    now: DateTime<Utc>,
) -> Result<BTreeMap<IdentityKey, AssetMeta>, LedgerError> {
    let mut metas = BTreeMap::new();
    for key in keys {
        let meta = txn
            .get_meta(key)?
            .unwrap_or_else(|| AssetMeta::empty(key.clone(), now));
        metas.insert(key.clone(), meta);
    }
    Ok(metas)
}

/// Stage row replacement and meta deltas. Callers must have finished reading.
fn stage_ledger(
    txn: &mut Txn<'_>,
    mut metas: BTreeMap<IdentityKey, AssetMeta>,
    plan: &LedgerPlan,
    old_rows: &[LedgerRow],
    new_lines: &[SelectedProduct],
    stamp: &RowStamp<'_>,
) {
    for (key, delta) in &plan.deltas {
        if let Some(meta) = metas.get_mut(key) {
            meta.apply(delta, stamp.action, stamp.now);
        }
    }

    for row in old_rows {
        txn.delete_row(&row.id);
    }

    for line in new_lines {
        let key = line.identity().key();
        let mut row = LedgerRow::new(&line.name, &line.category, AssetKind::Inventory, stamp.now);
        row.master_id = line.identity().master_id;
        row.last_outflow = Some(line.quantity);
        row.last_recipient = stamp.recipient.to_string();
        row.is_delivery_item = stamp.is_delivery;
        row.price = line.price;
        row.last_action_date = Some(stamp.date.to_string());
        row.last_operator = Some(stamp.operator.to_string());
        row.source_activity_id = Some(stamp.activity_id.to_string());
        row.stock = metas.get(&key).map(|m| m.current_stock).unwrap_or(0);

        let message = match plan.previous.get(&key) {
            _ if stamp.initial => "initial deduction".to_string(),
            None => "added new line".to_string(),
            Some((old_qty, old_row)) => {
                row.edit_log = old_row.edit_log.clone();
                row.edit_time = old_row.edit_time.clone();
                row.edit_operators = old_row.edit_operators.clone();
                row.order_index = old_row.order_index;
                if *old_qty != line.quantity {
                    format!("quantity changed from {} to {}", old_qty, line.quantity)
                } else {
                    format!("quantity unchanged ({})", line.quantity)
                }
            }
        };
        row.push_audit(&message, stamp.now, stamp.operator);
        txn.insert_row(row);
    }

    for (key, delta) in &plan.deltas {
        if delta.is_zero() {
            continue;
        }
        if let Some(meta) = metas.remove(key) {
            txn.put_meta(meta);
        }
    }
}

/// Business logic for purchase confirmations
pub struct ActivityService {
    runner: TransactionRunner,
    reconcile: Arc<ReconcileService>,
    attachments: Arc<dyn AttachmentStore>,
    holidays: Arc<dyn HolidaySource>,
    edit_window: EditWindow,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ActivityService {
    pub fn new(
        runner: TransactionRunner,
        reconcile: Arc<ReconcileService>,
        attachments: Arc<dyn AttachmentStore>,
        holidays: Arc<dyn HolidaySource>,
        edit_window: EditWindow,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runner,
            reconcile,
            attachments,
            holidays,
            edit_window,
            events,
            clock,
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Activity>, LedgerError> {
        self.runner
            .db()
            .with_conn(|conn| crate::db::activities::get_activity(conn, id))
    }

    /// Rows currently deducted by an activity
    pub fn rows(&self, id: &str) -> Result<Vec<LedgerRow>, LedgerError> {
        self.runner
            .db()
            .with_conn(|conn| assets::list_rows_by_source(conn, id))
    }

    /// Holidays relevant to the edit window; elevated actors never need them
    async fn window_holidays(&self, actor: &UserProfile, now: DateTime<Utc>) -> Result<HolidaySet, LedgerError> {
        if actor.role.is_elevated() {
            return Ok(HolidaySet::new());
        }
        let year = self.edit_window.calendar().local_date(now).year();
        load_window_holidays(self.holidays.as_ref(), year).await
    }

    async fn upload(&self, attachment: Option<PendingAttachment>) -> Result<Option<FileDescriptor>, LedgerError> {
        match attachment {
            Some(attachment) => Ok(Some(self.attachments.upload(attachment).await?)),
            None => Ok(None),
        }
    }

    async fn trash_best_effort(&self, file: &FileDescriptor, activity_id: &str) {
        if let Err(e) = self.attachments.move_to_trash(file).await {
            warn!(activity_id = %activity_id, path = %file.path, error = %e, "Failed to move attachment to trash");
        }
    }

    /// Pass `result` through, trashing `uploaded` if the write did not commit
    async fn keep_upload_if_committed<T>(
        &self,
        result: Result<T, LedgerError>,
        uploaded: Option<&FileDescriptor>,
        activity_id: &str,
    ) -> Result<T, LedgerError> {
        if result.is_err() {
            if let Some(file) = uploaded {
                debug!(activity_id = %activity_id, path = %file.path, "Discarding upload of failed write");
                self.trash_best_effort(file, activity_id).await;
            }
        }
        result
    }

    fn finish(&self, activity: Activity, affected_keys: Vec<IdentityKey>, deleted: bool) -> ActivityOutcome {
        let heal_task = self.reconcile.spawn_heal(affected_keys.clone());
        let event = if deleted {
            LedgerEvent::ActivityDeleted {
                activity_id: activity.id.clone(),
                affected_keys: affected_keys.clone(),
            }
        } else {
            LedgerEvent::ActivityCommitted {
                activity_id: activity.id.clone(),
                affected_keys: affected_keys.clone(),
            }
        };
        self.events.emit(event);
        ActivityOutcome {
            activity,
            affected_keys,
            heal_task,
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(&self, input: ActivityInput, actor: &UserProfile) -> Result<ActivityOutcome, LedgerError> {
        validate_input(&input, None)?;
        let invoice = self.upload(input.attachment.clone()).await?;

        let now = self.clock.now();
        let activity_id = uuid::Uuid::new_v4().to_string();
        let lines = if input.drives_ledger() {
            aggregate_lines(&input.selected_products)
        } else {
            Vec::new()
        };
        let plan = LedgerPlan::new(&[], &lines);
        let keys = plan.keys();

        let (manager_id, manager_name) = match &input.manager {
            Some(manager) => (manager.id.clone(), manager.name.clone()),
            None => (actor.id.clone(), actor.name.clone()),
        };

        let committed = self.runner.run_async(|txn| {
            let mut customer = txn
                .get_customer(&input.customer_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("customer {}", input.customer_id)))?;
            let counter_id = CustomerMeta::doc_id(&input.customer_id, &input.activity_type);
            let mut counter = txn
                .get_customer_meta(&counter_id)?
                .unwrap_or_else(|| CustomerMeta::empty(&input.customer_id, &input.activity_type));
            let metas = read_metas(txn, &keys, now)?;

            let activity = Activity {
                id: activity_id.clone(),
                customer_id: input.customer_id.clone(),
                activity_type: input.activity_type.clone(),
                product_category: input.product_category,
                selected_products: input.selected_products.clone(),
                amount: input.amount,
                discount: input.discount,
                date: input.date.clone(),
                manager_id: manager_id.clone(),
                manager_name: manager_name.clone(),
                pay_method: input.pay_method.clone(),
                delivery_info: input.delivery_info.clone(),
                tax_invoice: invoice.clone(),
                modification_history: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            txn.put_activity(activity.clone());

            if input.activity_type == PURCHASE_CONFIRM {
                merge_owned_products(&mut customer.owned_products, &aggregate_lines(&input.selected_products), false);
                customer.updated_at = now;
                txn.put_customer(customer.clone());
            }

            counter.count += 1;
            counter.last_sequence += 1;
            txn.put_customer_meta(counter);

            stage_ledger(
                txn,
                metas,
                &plan,
                &[],
                &lines,
                &RowStamp {
                    activity_id: &activity_id,
                    recipient: &customer.name,
                    operator: &actor.name,
                    date: &input.date,
                    is_delivery: input.delivery_info.is_some(),
                    initial: true,
                    action: "purchase_confirm_create",
                    now,
                },
            );

            Ok(activity)
        })
        .await;
        let activity = self
            .keep_upload_if_committed(committed, invoice.as_ref(), &activity_id)
            .await?;

        info!(
            activity_id = %activity.id,
            customer = %activity.customer_id,
            lines = lines.len(),
            "Created activity"
        );
        Ok(self.finish(activity, keys, false))
    }

    // =========================================================================
    // Update
    // =========================================================================

    pub async fn update(
        &self,
        activity_id: &str,
        input: ActivityInput,
        actor: &UserProfile,
    ) -> Result<ActivityOutcome, LedgerError> {
        let existing = self
            .get(activity_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("activity {}", activity_id)))?;
        validate_input(&input, Some(&existing))?;

        let now = self.clock.now();
        let holidays = self.window_holidays(actor, now).await?;
        self.edit_window
            .ensure_can_modify(existing.created_at, actor, now, &holidays)?;

        let new_invoice = self.upload(input.attachment.clone()).await?;

        // Queries cannot run inside the transaction. The snapshot is only valid
        // while the activity is unchanged, which the transaction re-checks.
        let old_rows = self.rows(activity_id)?;
        let lines = if input.drives_ledger() {
            aggregate_lines(&input.selected_products)
        } else {
            Vec::new()
        };
        let plan = LedgerPlan::new(&old_rows, &lines);
        let keys = plan.keys();

        let committed = self.runner.run_async(|txn| {
            let previous = txn
                .get_activity(activity_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("activity {}", activity_id)))?;
            ensure_unchanged(&previous, &existing, txn.attempt())?;
            self.edit_window
                .ensure_can_modify(previous.created_at, actor, now, &holidays)?;
            let mut customer = txn
                .get_customer(&input.customer_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("customer {}", input.customer_id)))?;
            let metas = read_metas(txn, &keys, now)?;

            let mut activity = Activity {
                customer_id: input.customer_id.clone(),
                activity_type: input.activity_type.clone(),
                product_category: input.product_category,
                selected_products: input.selected_products.clone(),
                amount: input.amount,
                discount: input.discount,
                date: input.date.clone(),
                manager_id: input
                    .manager
                    .as_ref()
                    .map_or_else(|| previous.manager_id.clone(), |m| m.id.clone()),
                manager_name: input
                    .manager
                    .as_ref()
                    .map_or_else(|| previous.manager_name.clone(), |m| m.name.clone()),
                pay_method: input.pay_method.clone(),
                delivery_info: input.delivery_info.clone(),
                tax_invoice: new_invoice.clone().or_else(|| previous.tax_invoice.clone()),
                updated_at: now,
                ..previous.clone()
            };

            let mut changes = describe_changes(&previous, &activity);
            if !changes.is_empty() {
                if let Some(reason) = input.edit_reason.as_deref().filter(|r| !r.trim().is_empty()) {
                    changes.push(format!("Reason: {}", reason.trim()));
                }
                activity.modification_history.push(ModificationEntry {
                    time: now,
                    manager: actor.id.clone(),
                    manager_name: actor.name.clone(),
                    content: changes.join(" / "),
                });
            }
            txn.put_activity(activity.clone());

            if input.activity_type == PURCHASE_CONFIRM {
                merge_owned_products(&mut customer.owned_products, &aggregate_lines(&input.selected_products), true);
                customer.updated_at = now;
                txn.put_customer(customer.clone());
            }

            stage_ledger(
                txn,
                metas,
                &plan,
                &old_rows,
                &lines,
                &RowStamp {
                    activity_id,
                    recipient: &customer.name,
                    operator: &actor.name,
                    date: &input.date,
                    is_delivery: input.delivery_info.is_some(),
                    initial: false,
                    action: "purchase_confirm_edit",
                    now,
                },
            );

            let replaced = match (&new_invoice, &previous.tax_invoice) {
                (Some(_), Some(old)) => Some(old.clone()),
                _ => None,
            };
            Ok((activity, replaced))
        })
        .await;
        let (activity, replaced_invoice) = self
            .keep_upload_if_committed(committed, new_invoice.as_ref(), activity_id)
            .await?;

        if let Some(old) = replaced_invoice {
            self.trash_best_effort(&old, activity_id).await;
        }

        info!(
            activity_id = %activity_id,
            removed_rows = old_rows.len(),
            lines = lines.len(),
            "Updated activity"
        );
        Ok(self.finish(activity, keys, false))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub async fn delete(&self, activity_id: &str, actor: &UserProfile) -> Result<ActivityOutcome, LedgerError> {
        let existing = self
            .get(activity_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("activity {}", activity_id)))?;

        let now = self.clock.now();
        let holidays = self.window_holidays(actor, now).await?;
        self.edit_window
            .ensure_can_modify(existing.created_at, actor, now, &holidays)?;

        let old_rows = self.rows(activity_id)?;
        let plan = LedgerPlan::new(&old_rows, &[]);
        let keys = plan.keys();

        let activity = self.runner.run_async(|txn| {
            let activity = txn
                .get_activity(activity_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("activity {}", activity_id)))?;
            ensure_unchanged(&activity, &existing, txn.attempt())?;
            self.edit_window
                .ensure_can_modify(activity.created_at, actor, now, &holidays)?;
            let counter_id = CustomerMeta::doc_id(&activity.customer_id, &activity.activity_type);
            let counter = txn.get_customer_meta(&counter_id)?;
            let metas = read_metas(txn, &keys, now)?;

            stage_ledger(
                txn,
                metas,
                &plan,
                &old_rows,
                &[],
                &RowStamp {
                    activity_id,
                    recipient: "",
                    operator: &actor.name,
                    date: &activity.date,
                    is_delivery: false,
                    initial: false,
                    action: "purchase_confirm_delete",
                    now,
                },
            );

            if let Some(mut counter) = counter {
                counter.count = (counter.count - 1).max(0);
                txn.put_customer_meta(counter);
            }
            txn.delete_activity(activity_id);
            Ok(activity)
        })
        .await?;

        if let Some(invoice) = &activity.tax_invoice {
            self.trash_best_effort(invoice, activity_id).await;
        }

        info!(activity_id = %activity_id, rows = old_rows.len(), "Deleted activity");
        Ok(self.finish(activity, keys, true))
    }

    // =========================================================================
    // Tax invoice
    // =========================================================================

    /// Attach a tax invoice; not subject to the edit window
    pub async fn register_tax_invoice(
        &self,
        activity_id: &str,
        attachment: PendingAttachment,
        actor: &UserProfile,
    ) -> Result<Activity, LedgerError> {
        if self.get(activity_id)?.is_none() {
            return Err(LedgerError::NotFound(format!("activity {}", activity_id)));
        }
        let file = self.attachments.upload(attachment).await?;
        let now = self.clock.now();

        let committed = self.runner.run_async(|txn| {
            let previous = txn
                .get_activity(activity_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("activity {}", activity_id)))?;
            let mut activity = previous.clone();
            activity.tax_invoice = Some(file.clone());
            activity.updated_at = now;
            let changes = describe_changes(&previous, &activity);
            activity.modification_history.push(ModificationEntry {
                time: now,
                manager: actor.id.clone(),
                manager_name: actor.name.clone(),
                content: if changes.is_empty() {
                    format!("Tax invoice replaced: {}", file.name)
                } else {
                    changes.join(" / ")
                },
            });
            txn.put_activity(activity.clone());
            Ok((activity, previous.tax_invoice))
        })
        .await;
        let (activity, replaced) = self
            .keep_upload_if_committed(committed, Some(&file), activity_id)
            .await?;

        if let Some(old) = replaced {
            self.trash_best_effort(&old, activity_id).await;
        }

        debug!(activity_id = %activity_id, file = %file.name, "Registered tax invoice");
        self.events.emit(LedgerEvent::ActivityCommitted {
            activity_id: activity.id.clone(),
            affected_keys: Vec::new(),
        });
        Ok(activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, name: &str, qty: i64, master: Option<&str>) -> SelectedProduct {
        SelectedProduct {
            id: id.into(),
            name: name.into(),
            category: "Parts".into(),
            quantity: qty,
            master_id: master.map(str::to_string),
            price: None,
        }
    }

    fn input(products: Vec<SelectedProduct>) -> ActivityInput {
        ActivityInput {
            customer_id: "c-1".into(),
            activity_type: PURCHASE_CONFIRM.into(),
            product_category: ProductCategory::Inventory,
            selected_products: products,
            amount: 1000,
            discount: 0,
            date: "2025-01-06".into(),
            pay_method: "card".into(),
            delivery_info: None,
            manager: None,
            edit_reason: None,
            attachment: None,
        }
    }

    #[test]
    fn test_aggregate_merges_by_master_or_id() {
        let merged = aggregate_lines(&[
            product("a", "Filter", 2, None),
            product("b", "Pump", 1, Some("m-1")),
            product("a", "Filter", 3, None),
            product("c", "Pump v2", 4, Some("m-1")),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].quantity, 5);
        assert_eq!(merged[1].quantity, 5);
    }

    #[test]
    fn test_blank_master_ids_do_not_merge_distinct_items() {
        let merged = aggregate_lines(&[
            product("a", "Filter", 2, Some("")),
            product("b", "Pump", 3, Some(" ")),
            product("a", "Filter", 1, None),
        ]);
        let lines: Vec<(&str, i64)> = merged.iter().map(|l| (l.name.as_str(), l.quantity)).collect();
        assert_eq!(lines, vec![("Filter", 3), ("Pump", 3)]);
    }

    #[test]
    fn test_owned_products_create_adds_edit_fills_gaps() {
        let mut owned = vec![OwnedProduct { name: "Filter".into(), quantity: 1 }];
        merge_owned_products(&mut owned, &[product("a", "Filter", 2, None)], false);
        assert_eq!(owned[0].quantity, 3);

        merge_owned_products(
            &mut owned,
            &[product("a", "Filter", 1, None), product("b", "Pump", 2, None)],
            true,
        );
        assert_eq!(owned[0].quantity, 3);
        assert_eq!(owned[1], OwnedProduct { name: "Pump".into(), quantity: 2 });
    }

    #[test]
    fn test_validation() {
        let err = validate_input(&input(vec![product("a", "Filter", 0, None)]), None).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let mut catalog = input(vec![product("a", "Kit", 1, None)]);
        catalog.product_category = ProductCategory::Product;
        assert!(validate_input(&catalog, None).is_err());

        assert!(validate_input(&input(vec![product("a", "Filter", 1, None)]), None).is_ok());
    }

    #[test]
    fn test_quantity_change_requires_reason() {
        let now = Utc::now();
        let previous = Activity {
            id: "act-1".into(),
            customer_id: "c-1".into(),
            activity_type: PURCHASE_CONFIRM.into(),
            product_category: ProductCategory::Inventory,
            selected_products: vec![product("a", "Filter", 5, None)],
            amount: 1000,
            discount: 0,
            date: "2025-01-06".into(),
            manager_id: "u-1".into(),
            manager_name: "Kim".into(),
            pay_method: "card".into(),
            delivery_info: None,
            tax_invoice: None,
            modification_history: vec![],
            created_at: now,
            updated_at: now,
        };

        let mut edit = input(vec![product("a", "Filter", 2, None)]);
        assert!(validate_input(&edit, Some(&previous)).is_err());
        edit.edit_reason = Some("customer returned three".into());
        assert!(validate_input(&edit, Some(&previous)).is_ok());

        // same total split over two selections is not a change
        let split = input(vec![product("a", "Filter", 2, None), product("a", "Filter", 3, None)]);
        assert!(validate_input(&split, Some(&previous)).is_ok());
    }

    #[test]
    fn test_describe_changes() {
        let now = Utc::now();
        let old = Activity {
            id: "act-1".into(),
            customer_id: "c-1".into(),
            activity_type: PURCHASE_CONFIRM.into(),
            product_category: ProductCategory::Inventory,
            selected_products: vec![product("a", "Filter", 5, None)],
            amount: 1000,
            discount: 0,
            date: "2025-01-06".into(),
            manager_id: "u-1".into(),
            manager_name: "Kim".into(),
            pay_method: "card".into(),
            delivery_info: None,
            tax_invoice: None,
            modification_history: vec![],
            created_at: now,
            updated_at: now,
        };
        let mut new = old.clone();
        new.amount = 800;
        new.selected_products[0].quantity = 2;

        let changes = describe_changes(&old, &new);
        assert_eq!(
            changes,
            vec!["Amount: 1000 → 800".to_string(), "Products: Filter x5 → Filter x2".to_string()]
        );
        assert!(describe_changes(&old, &old).is_empty());
    }

    #[test]
    fn test_plan_reverses_old_and_deducts_new() {
        let mut old = LedgerRow::new("Filter", "Parts", AssetKind::Inventory, Utc::now());
        old.last_outflow = Some(5);
        let plan = LedgerPlan::new(&[old.clone()], &[product("a", "Filter", 2, None)]);

        let delta = plan.deltas[&old.identity_key()];
        assert_eq!(delta, MetaDelta { stock: 3, inflow: 0, outflow: -3 });
        assert_eq!(plan.previous[&old.identity_key()].0, 5);
    }
}
