//! Shared harness for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use inventory_ledger::db::{
    customers, Customer, ProductCategory, Role, SelectedProduct, UserProfile, PURCHASE_CONFIRM,
};
use inventory_ledger::services::ActivityInput;
use inventory_ledger::{
    Config, FixedClock, HolidaySet, LedgerDb, LocalAttachmentStore, Services, StaticHolidaySource,
};
use tempfile::TempDir;

pub const CUSTOMER_ID: &str = "c-1";

pub struct Harness {
    pub services: Services,
    pub db: Arc<LedgerDb>,
    pub clock: Arc<FixedClock>,
    pub files: TempDir,
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

/// Services over an in-memory database, a temp attachment store and a
/// fixed clock at Monday 2025-01-06 10:00 KST
pub async fn harness() -> Harness {
    harness_with(|_| {}, HolidaySet::new()).await
}

pub async fn harness_with(configure: impl FnOnce(&mut Config), holidays_2025: HolidaySet) -> Harness {
    let files = TempDir::new().unwrap();
    let mut config = Config {
        storage_dir: files.path().to_path_buf(),
        ..Default::default()
    };
    config.escalation.jitter_min_secs = 0;
    config.escalation.jitter_max_secs = 0;
    config.transactions.retry_backoff_ms = 5;
    configure(&mut config);

    let db = Arc::new(LedgerDb::open_in_memory().unwrap());
    let attachments = Arc::new(
        LocalAttachmentStore::new(config.attachments_dir(), config.trash_dir())
            .await
            .unwrap(),
    );
    let holidays = Arc::new(StaticHolidaySource::new().with_year(2025, holidays_2025));
    let clock = Arc::new(FixedClock::new(at("2025-01-06T01:00:00Z")));

    let services = Services::new(db.clone(), &config, holidays, attachments, clock.clone()).unwrap();

    db.with_conn(|conn| {
        customers::upsert_customer(
            conn,
            &Customer {
                id: CUSTOMER_ID.into(),
                name: "Acme Clinic".into(),
                owned_products: vec![],
                updated_at: Utc::now(),
            },
        )
    })
    .unwrap();

    Harness {
        services,
        db,
        clock,
        files,
    }
}

pub fn staff() -> UserProfile {
    UserProfile {
        id: "u-staff".into(),
        name: "Lee".into(),
        role: Role::Staff,
    }
}

pub fn admin() -> UserProfile {
    UserProfile {
        id: "u-admin".into(),
        name: "Park".into(),
        role: Role::Admin,
    }
}

pub fn line(id: &str, name: &str, quantity: i64) -> SelectedProduct {
    SelectedProduct {
        id: id.into(),
        name: name.into(),
        category: "Filters".into(),
        quantity,
        master_id: None,
        price: Some(12_000),
    }
}

pub fn purchase(products: Vec<SelectedProduct>) -> ActivityInput {
    ActivityInput {
        customer_id: CUSTOMER_ID.into(),
        activity_type: PURCHASE_CONFIRM.into(),
        product_category: ProductCategory::Inventory,
        selected_products: products,
        amount: 50_000,
        discount: 0,
        date: "2025-01-06".into(),
        pay_method: "card".into(),
        delivery_info: None,
        manager: None,
        edit_reason: None,
        attachment: None,
    }
}
