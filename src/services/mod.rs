//! Service layer for inventory-ledger
//!
//! Services encapsulate business logic between callers (CLI, scheduler, a
//! future HTTP surface) and repositories. Each service wraps database
//! operations with:
//! - Input validation and the edit window
//! - Optimistic transaction boundaries
//! - Post-commit reconciliation
//! - Event emission for cache invalidation
//!
//! ## Architecture
//!
//! ```text
//! CLI / scheduler
//!     ↓
//! Service Layer (business logic)
//!     ↓
//! TransactionRunner + Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod reconcile_service;
pub mod activity_service;
pub mod inventory_service;
pub mod escalation;

// Re-exports
pub use events::{EventBus, EventListener, LedgerEvent};
pub use reconcile_service::ReconcileService;
pub use activity_service::{ActivityInput, ActivityOutcome, ActivityService, AssignedManager};
pub use inventory_service::{InventoryService, RowPatch, StockInInput};
pub use escalation::{EscalationJob, EscalationReport};

use std::sync::Arc;

use crate::attachments::AttachmentStore;
use crate::calendar::{BusinessCalendar, EditWindow};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{LedgerDb, TransactionRunner};
use crate::error::LedgerError;
use crate::holidays::HolidaySource;

/// Service container for dependency injection
///
/// Holds all services over one shared database and event bus.
pub struct Services {
    pub activities: Arc<ActivityService>,
    pub inventory: Arc<InventoryService>,
    pub reconcile: Arc<ReconcileService>,
    pub escalation: Arc<EscalationJob>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire all services from configuration and collaborators
    pub fn new(
        db: Arc<LedgerDb>,
        config: &Config,
        holidays: Arc<dyn HolidaySource>,
        attachments: Arc<dyn AttachmentStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        let events = Arc::new(EventBus::new());
        let calendar = BusinessCalendar::new(config.region_offset()?);
        let runner = TransactionRunner::new(db.clone(), &config.transactions);

        let reconcile = Arc::new(ReconcileService::new(db.clone(), events.clone(), clock.clone()));

        let activities = Arc::new(ActivityService::new(
            runner.clone(),
            reconcile.clone(),
            attachments,
            holidays.clone(),
            EditWindow::new(calendar.clone(), config.calendar.edit_window_days),
            events.clone(),
            clock.clone(),
        ));

        let inventory = Arc::new(InventoryService::new(
            runner,
            reconcile.clone(),
            events.clone(),
            clock.clone(),
        ));

        let escalation = Arc::new(EscalationJob::new(
            db,
            holidays,
            calendar,
            config.escalation.clone(),
            config.run_at()?,
            events.clone(),
            clock,
        ));

        Ok(Self {
            activities,
            inventory,
            reconcile,
            escalation,
            events,
        })
    }
}
