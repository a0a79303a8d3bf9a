//! Inventory Ledger - CRM inventory bookkeeping with self-healing counters
//!
//! Keeps per-item stock counters consistent with the purchase confirmations
//! that deduct from them.
//!
//! ## Architecture
//!
//! - **Ledger rows** (`assets`): one inflow/outflow event each
//! - **Meta counters** (`asset_meta`): running totals per item identity,
//!   moved by signed deltas inside optimistic transactions
//! - **Self-healing**: recomputes counters from rows after each commit
//! - **Escalation job**: daily follow-up for invoices still missing after
//!   the business-day threshold
//!
//! ## Storage Layout
//!
//! ```text
//! <data dir>/inventory-ledger/
//! ├── ledger.db          # SQLite database (WAL)
//! ├── attachments/       # Uploaded invoice files
//! ├── trash/             # Files of deleted activities
//! └── config.toml        # Configuration
//! ```

pub mod attachments;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod holidays;
pub mod identity;
pub mod services;

// Re-exports
pub use attachments::{AttachmentStore, LocalAttachmentStore, PendingAttachment};
pub use calendar::{BusinessCalendar, EditWindow, HolidaySet};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use db::{LedgerDb, TransactionRunner};
pub use error::LedgerError;
pub use holidays::{HolidaySource, HttpHolidaySource, StaticHolidaySource};
pub use identity::{IdentityKey, ItemIdentity};
pub use services::Services;
