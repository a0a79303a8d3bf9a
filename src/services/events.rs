//! Event system for ledger operations
//!
//! Services emit events after commits. Listeners use them for:
//! - Audit logging
//! - Cache invalidation in presentation layers
//! - Follow-up notifications

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::identity::IdentityKey;

/// Ledger events emitted by services
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    ActivityCommitted {
        activity_id: String,
        affected_keys: Vec<IdentityKey>,
    },
    ActivityDeleted {
        activity_id: String,
        affected_keys: Vec<IdentityKey>,
    },
    RowsChanged {
        category: Option<String>,
        row_ids: Vec<String>,
    },
    MetaHealed {
        key: IdentityKey,
        current_stock: i64,
    },
    FollowUpCreated {
        request_id: String,
        activity_id: String,
        receiver_id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Events a slow subscriber may fall behind before it starts lagging
const EVENT_CAPACITY: usize = 1024;

/// Broadcast channel shared by every service
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish after commit; having no subscriber is not an error
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirrors ledger events into the tracing log
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::ActivityCommitted { activity_id, affected_keys } => {
                debug!(activity_id = %activity_id, keys = affected_keys.len(), "Activity committed");
            }
            LedgerEvent::ActivityDeleted { activity_id, .. } => {
                debug!(activity_id = %activity_id, "Activity deleted");
            }
            LedgerEvent::MetaHealed { key, current_stock } => {
                debug!(key = %key, current_stock, "Meta healed");
            }
            LedgerEvent::FollowUpCreated { request_id, activity_id, receiver_id } => {
                debug!(
                    request = %request_id,
                    activity = %activity_id,
                    receiver = %receiver_id,
                    "Follow-up created"
                );
            }
            _ => {
                trace!(event = ?event, "Ledger event");
            }
        }
    }
}

/// Log every event until the bus closes
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
