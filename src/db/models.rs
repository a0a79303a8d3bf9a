//! Document types persisted by the ledger
//!
//! Plain data shared by the repository layer (`db/*.rs`), the transaction
//! runner and the services. JSON-shaped sub-fields (selected products,
//! modification history, owned products) are stored as text columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::identity::{IdentityKey, ItemIdentity};

/// Activity type that drives the inventory ledger
pub const PURCHASE_CONFIRM: &str = "purchase_confirm";

/// Pay method whose invoices must be registered ("bank transfer")
pub const PAY_METHOD_BANK_TRANSFER: &str = "입금";

/// Placeholder recipient for rows without one
pub const NO_RECIPIENT: &str = "-";

// ============================================================================
// Ledger rows
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Has stock, inflow and outflow
    Inventory,
    /// Catalog entry with price/composition, never counted
    Product,
    /// Pure UI separator
    Divider,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Product => "product",
            Self::Divider => "divider",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "inventory" => Ok(Self::Inventory),
            "product" => Ok(Self::Product),
            "divider" => Ok(Self::Divider),
            other => Err(LedgerError::Validation(format!("unknown asset kind: {}", other))),
        }
    }
}

/// One inventory event ("asset" document)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub master_id: Option<String>,
    pub kind: AssetKind,
    /// On-hand quantity recorded when the row was written
    pub stock: i64,
    pub last_inflow: Option<i64>,
    pub last_outflow: Option<i64>,
    pub last_recipient: String,
    pub is_delivery_item: bool,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub composition: Option<String>,
    pub last_action_date: Option<String>,
    pub last_operator: Option<String>,
    /// Newline-joined audit histories; index i across the three describes one event
    pub edit_log: String,
    pub edit_time: String,
    pub edit_operators: String,
    pub source_activity_id: Option<String>,
    pub order_index: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl LedgerRow {
    /// Blank row of the given kind; callers fill in quantities and audit fields
    pub fn new(name: &str, category: &str, kind: AssetKind, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            category: category.trim().to_string(),
            master_id: None,
            kind,
            stock: 0,
            last_inflow: None,
            last_outflow: None,
            last_recipient: NO_RECIPIENT.to_string(),
            is_delivery_item: false,
            price: None,
            composition: None,
            last_action_date: None,
            last_operator: None,
            edit_log: String::new(),
            edit_time: String::new(),
            edit_operators: String::new(),
            source_activity_id: None,
            order_index: None,
            created_at: now,
        }
    }

    pub fn identity(&self) -> ItemIdentity {
        ItemIdentity::new(&self.name, &self.category, self.master_id.as_deref())
    }

    pub fn identity_key(&self) -> IdentityKey {
        self.identity().key()
    }

    /// Whether this row takes part in stock arithmetic
    pub fn is_counted(&self) -> bool {
        self.kind == AssetKind::Inventory
    }

    /// Append one audit event to the three parallel histories
    pub fn push_audit(&mut self, message: &str, at: DateTime<Utc>, operator: &str) {
        fn push(field: &mut String, value: &str) {
            if !field.is_empty() {
                field.push('\n');
            }
            field.push_str(&value.replace('\n', " "));
        }
        push(&mut self.edit_log, message);
        push(&mut self.edit_time, &at.to_rfc3339());
        push(&mut self.edit_operators, operator);
    }

    /// Audit events as (message, time, operator) triples
    pub fn audit_entries(&self) -> Vec<(String, String, String)> {
        if self.edit_log.is_empty() {
            return Vec::new();
        }
        let times: Vec<&str> = self.edit_time.split('\n').collect();
        let operators: Vec<&str> = self.edit_operators.split('\n').collect();
        self.edit_log
            .split('\n')
            .enumerate()
            .map(|(i, msg)| {
                (
                    msg.to_string(),
                    times.get(i).copied().unwrap_or_default().to_string(),
                    operators.get(i).copied().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

// ============================================================================
// Meta counters
// ============================================================================

/// Aggregate counters for one identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub key: IdentityKey,
    pub total_inflow: i64,
    pub total_outflow: i64,
    pub current_stock: i64,
    pub last_updated_at: DateTime<Utc>,
    pub last_action: String,
}

impl AssetMeta {
    pub fn empty(key: IdentityKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            total_inflow: 0,
            total_outflow: 0,
            current_stock: 0,
            last_updated_at: now,
            last_action: String::new(),
        }
    }

    /// Merge a signed delta into the running totals
    pub fn apply(&mut self, delta: &MetaDelta, action: &str, now: DateTime<Utc>) {
        self.total_inflow += delta.inflow;
        self.total_outflow += delta.outflow;
        self.current_stock += delta.stock;
        self.last_action = action.to_string();
        self.last_updated_at = now;
    }

    /// Whether `currentStock == totalInflow - totalOutflow`
    pub fn is_balanced(&self) -> bool {
        self.current_stock == self.total_inflow - self.total_outflow
    }
}

/// Signed change to an [`AssetMeta`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaDelta {
    pub stock: i64,
    pub inflow: i64,
    pub outflow: i64,
}

impl MetaDelta {
    /// Undo an outflow that is being removed from the ledger
    pub fn reverse_outflow(&mut self, quantity: i64) {
        self.stock += quantity;
        self.outflow -= quantity;
    }

    /// Deduct a new outflow
    pub fn add_outflow(&mut self, quantity: i64) {
        self.stock -= quantity;
        self.outflow += quantity;
    }

    pub fn add_inflow(&mut self, quantity: i64) {
        self.stock += quantity;
        self.inflow += quantity;
    }

    pub fn reverse_inflow(&mut self, quantity: i64) {
        self.stock -= quantity;
        self.inflow -= quantity;
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductCategory {
    Inventory,
    Product,
}

impl ProductCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Product => "product",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "inventory" => Ok(Self::Inventory),
            "product" => Ok(Self::Product),
            other => Err(LedgerError::Validation(format!("unknown product category: {}", other))),
        }
    }
}

/// One line item of a purchase confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedProduct {
    /// Id of the catalog/ledger row the item was picked from
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub quantity: i64,
    #[serde(default)]
    pub master_id: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
}

impl SelectedProduct {
    pub fn identity(&self) -> ItemIdentity {
        ItemIdentity::new(&self.name, &self.category, self.master_id.as_deref())
    }

    /// Key used to merge duplicate selections of one item. A blank master id
    /// counts as absent, the same way [`ItemIdentity::new`] treats it.
    pub fn aggregation_key(&self) -> String {
        self.identity().master_id.unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationEntry {
    pub time: DateTime<Utc>,
    pub manager: String,
    pub manager_name: String,
    pub content: String,
}

/// Uploaded file reference (tax invoice, receipts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub customer_id: String,
    pub activity_type: String,
    pub product_category: ProductCategory,
    pub selected_products: Vec<SelectedProduct>,
    pub amount: i64,
    pub discount: i64,
    /// Business date chosen in the form (YYYY-MM-DD)
    pub date: String,
    pub manager_id: String,
    pub manager_name: String,
    pub pay_method: String,
    pub delivery_info: Option<String>,
    pub tax_invoice: Option<FileDescriptor>,
    pub modification_history: Vec<ModificationEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    pub fn drives_ledger(&self) -> bool {
        self.activity_type == PURCHASE_CONFIRM && self.product_category == ProductCategory::Inventory
    }
}

// ============================================================================
// Customers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedProduct {
    pub name: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub owned_products: Vec<OwnedProduct>,
    pub updated_at: DateTime<Utc>,
}

/// Per-customer, per-activity-type counter document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerMeta {
    pub id: String,
    pub customer_id: String,
    pub activity_type: String,
    pub count: i64,
    /// Highest sequence handed out; never decremented
    pub last_sequence: i64,
}

impl CustomerMeta {
    pub fn doc_id(customer_id: &str, activity_type: &str) -> String {
        format!("{}_{}", customer_id, activity_type)
    }

    pub fn empty(customer_id: &str, activity_type: &str) -> Self {
        Self {
            id: Self::doc_id(customer_id, activity_type),
            customer_id: customer_id.to_string(),
            activity_type: activity_type.to_string(),
            count: 0,
            last_sequence: 0,
        }
    }
}

// ============================================================================
// Work requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    ReviewRequested,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ReviewRequested => "review_requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "review_requested" => Ok(Self::ReviewRequested),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(LedgerError::Validation(format!("unknown request status: {}", other))),
        }
    }

    /// Still waiting on a human
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::ReviewRequested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// First request to secure a business registration for the invoice
    TaxBizSecuring,
    /// System follow-up sent by the escalation job
    TaxBizDelay,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaxBizSecuring => "tax_biz_securing",
            Self::TaxBizDelay => "tax_biz_delay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tax_biz_securing" => Some(Self::TaxBizSecuring),
            "tax_biz_delay" => Some(Self::TaxBizDelay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub id: String,
    pub title: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: RequestStatus,
    pub related_activity_id: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Users and settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "staff" => Ok(Self::Staff),
            other => Err(LedgerError::Validation(format!("unknown role: {}", other))),
        }
    }

    /// Bypasses the business-day edit window
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Entry of the user directory; also used as the acting user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub role: Role,
}

/// `settings/work_managers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkManagers {
    #[serde(default)]
    pub biz_registration_manager_id: String,
    #[serde(default)]
    pub tax_invoice_manager_id: String,
}

impl WorkManagers {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.biz_registration_manager_id.trim().is_empty() {
            return Err(LedgerError::Config("bizRegistrationManagerId is not set".into()));
        }
        if self.tax_invoice_manager_id.trim().is_empty() {
            return Err(LedgerError::Config("taxInvoiceManagerId is not set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_histories_stay_parallel() {
        let now = Utc::now();
        let mut row = LedgerRow::new("Filter", "Parts", AssetKind::Inventory, now);
        row.push_audit("initial deduction", now, "kim");
        row.push_audit("quantity changed from 5 to 2\nextra", now, "lee");

        let entries = row.audit_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "initial deduction");
        assert_eq!(entries[1].0, "quantity changed from 5 to 2 extra");
        assert_eq!(entries[1].2, "lee");
    }

    #[test]
    fn test_meta_delta_reverse_then_add() {
        let mut delta = MetaDelta::default();
        delta.reverse_outflow(5);
        delta.add_outflow(2);
        assert_eq!(delta, MetaDelta { stock: 3, inflow: 0, outflow: -3 });
    }

    #[test]
    fn test_blank_master_id_falls_back_to_row_id() {
        let mut product = SelectedProduct {
            id: "p-1".into(),
            name: "Filter".into(),
            category: "Parts".into(),
            quantity: 1,
            master_id: Some("  ".into()),
            price: None,
        };
        assert_eq!(product.aggregation_key(), "p-1");

        product.master_id = Some(" m-7 ".into());
        assert_eq!(product.aggregation_key(), "m-7");
    }

    #[test]
    fn test_request_status_unresolved() {
        assert!(RequestStatus::Pending.is_unresolved());
        assert!(RequestStatus::ReviewRequested.is_unresolved());
        assert!(!RequestStatus::Approved.is_unresolved());
        assert!(!RequestStatus::Rejected.is_unresolved());
    }

    #[test]
    fn test_work_managers_require_both_ids() {
        let managers = WorkManagers {
            biz_registration_manager_id: "u1".into(),
            tax_invoice_manager_id: " ".into(),
        };
        assert!(matches!(managers.validate(), Err(LedgerError::Config(_))));
    }
}
