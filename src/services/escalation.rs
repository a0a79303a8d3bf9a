//! Daily follow-up for bank-transfer purchases still missing a tax invoice
//!
//! Once per business day the job looks for `purchase_confirm` activities paid
//! by bank transfer whose invoice is still missing more than the threshold of
//! business days after creation, and files at most one open follow-up request
//! per activity.
//!
//! ```text
//! today (UTC+9) -> holidays -> business day? -> jitter -> work managers
//!   -> candidates -> elapsed? -> first request exists? -> open follow-up?
//!   -> insert tax_biz_delay request
//! ```
//!
//! [`EscalationJob::run`] never fails; errors are logged with
//! `outcome="error"`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use rand::Rng;
use rusqlite::TransactionBehavior;
use tracing::{debug, error, info, warn};

use crate::calendar::{is_business_day, BusinessCalendar, HolidaySet};
use crate::clock::Clock;
use crate::config::EscalationConfig;
use crate::db::{
    activities, directory, work_requests, Activity, LedgerDb, RequestStatus, TriggerType,
    WorkManagers, WorkRequest, PAY_METHOD_BANK_TRANSFER, PURCHASE_CONFIRM,
};
use crate::error::LedgerError;
use crate::holidays::{load_window_holidays, HolidaySource};

use super::events::{EventBus, LedgerEvent};

/// Outcome of one escalation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationReport {
    pub today: NaiveDate,
    pub business_day: bool,
    pub candidates: usize,
    pub sent: usize,
    pub skipped: usize,
    /// Ids of the follow-up requests created
    pub created: Vec<String>,
}

impl EscalationReport {
    fn new(today: NaiveDate) -> Self {
        Self {
            today,
            business_day: false,
            candidates: 0,
            sent: 0,
            skipped: 0,
            created: Vec::new(),
        }
    }
}

enum Decision {
    Sent(WorkRequest),
    Skipped(&'static str),
}

pub struct EscalationJob {
    db: Arc<LedgerDb>,
    holidays: Arc<dyn HolidaySource>,
    calendar: BusinessCalendar,
    config: EscalationConfig,
    run_at: NaiveTime,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl EscalationJob {
    pub fn new(
        db: Arc<LedgerDb>,
        holidays: Arc<dyn HolidaySource>,
        calendar: BusinessCalendar,
        config: EscalationConfig,
        run_at: NaiveTime,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            holidays,
            calendar,
            config,
            run_at,
            events,
            clock,
        }
    }

    /// One cycle; errors abort the cycle before any further request is written
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<EscalationReport, LedgerError> {
        let today = self.calendar.local_date(now);
        let mut report = EscalationReport::new(today);

        let holidays = load_window_holidays(self.holidays.as_ref(), today.year()).await?;
        if !is_business_day(today, &holidays) {
            info!(today = %today, "Not a business day, skipping escalation");
            return Ok(report);
        }
        report.business_day = true;

        self.jitter().await;

        let managers = self.db.with_conn(directory::get_work_managers)?;
        let candidates = self.db.with_conn(|conn| {
            activities::list_missing_invoice(conn, PURCHASE_CONFIRM, PAY_METHOD_BANK_TRANSFER)
        })?;
        report.candidates = candidates.len();

        for activity in &candidates {
            match self.evaluate(activity, &managers, &holidays, now)? {
                Decision::Sent(request) => {
                    report.sent += 1;
                    report.created.push(request.id.clone());
                    self.events.emit(LedgerEvent::FollowUpCreated {
                        request_id: request.id,
                        activity_id: activity.id.clone(),
                        receiver_id: request.receiver_id,
                    });
                }
                Decision::Skipped(reason) => {
                    debug!(activity_id = %activity.id, reason, "Skipped escalation");
                    report.skipped += 1;
                }
            }
        }

        info!(
            today = %today,
            candidates = report.candidates,
            sent = report.sent,
            skipped = report.skipped,
            outcome = "ok",
            "Escalation cycle finished"
        );
        Ok(report)
    }

    /// Never-failing wrapper around [`run_once`](Self::run_once)
    pub async fn run(&self, now: DateTime<Utc>) -> Option<EscalationReport> {
        match self.run_once(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(outcome = "error", error = %e, "escalation job failed");
                None
            }
        }
    }

    /// Run at the configured regional time every day, forever
    pub async fn run_daily(&self) {
        loop {
            let now = self.clock.now();
            let next = self.next_run_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "Escalation scheduled");
            tokio::time::sleep(wait).await;
            self.run(self.clock.now()).await;
        }
    }

    /// Next instant whose regional wall time equals the configured run time
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.calendar.offset();
        let local_today = self.calendar.local_date(now);
        let to_utc = |date: NaiveDate| {
            let local = date.and_time(self.run_at);
            Utc.from_utc_datetime(&(local - chrono::Duration::seconds(offset.local_minus_utc() as i64)))
        };

        let candidate = to_utc(local_today);
        if candidate > now {
            candidate
        } else {
            to_utc(local_today + chrono::Duration::days(1))
        }
    }

    async fn jitter(&self) {
        let max = self.config.jitter_max_secs.max(self.config.jitter_min_secs);
        if max == 0 {
            return;
        }
        let secs = rand::thread_rng().gen_range(self.config.jitter_min_secs..=max);
        debug!(secs, "Escalation jitter");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    /// Decide one candidate; the dedupe check and insert share one SQLite transaction
    fn evaluate(
        &self,
        activity: &Activity,
        managers: &WorkManagers,
        holidays: &HolidaySet,
        now: DateTime<Utc>,
    ) -> Result<Decision, LedgerError> {
        if !self.calendar.has_elapsed_business_days(
            activity.created_at,
            self.config.threshold_days,
            now,
            holidays,
        ) {
            return Ok(Decision::Skipped("within threshold"));
        }

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let related = work_requests::list_for_activity(
                &tx,
                &activity.id,
                &[TriggerType::TaxBizSecuring, TriggerType::TaxBizDelay],
            )?;

            if related.is_empty() {
                warn!(activity_id = %activity.id, "No first request on record, not escalating");
                return Ok(Decision::Skipped("no first request"));
            }
            if related
                .iter()
                .any(|r| r.trigger_type == Some(TriggerType::TaxBizDelay) && r.status.is_unresolved())
            {
                return Ok(Decision::Skipped("follow-up already open"));
            }

            let reviewed_at = related
                .iter()
                .filter(|r| r.trigger_type == Some(TriggerType::TaxBizSecuring))
                .map(|r| r.created_at)
                .min()
                .unwrap_or(activity.created_at);
            let reviewed_on = self.calendar.local_date(reviewed_at).format("%Y-%m-%d").to_string();

            let biz_name = directory::display_name(&tx, &managers.biz_registration_manager_id)?;
            let tax_name = directory::display_name(&tx, &managers.tax_invoice_manager_id)?;

            let request = WorkRequest {
                id: uuid::Uuid::new_v4().to_string(),
                title: "[Follow-up] Tax invoice still missing".to_string(),
                content: format!(
                    "The tax invoice for purchase {} (customer {}, {}) is still not registered more than \
                     {} business days after it was first requested on {}. {}: please secure the \
                     customer's business registration so {} can issue the invoice.",
                    activity.id,
                    activity.customer_id,
                    activity.date,
                    self.config.threshold_days,
                    reviewed_on,
                    biz_name,
                    tax_name,
                ),
                sender_id: managers.tax_invoice_manager_id.clone(),
                receiver_id: managers.biz_registration_manager_id.clone(),
                status: RequestStatus::Pending,
                related_activity_id: Some(activity.id.clone()),
                trigger_type: Some(TriggerType::TaxBizDelay),
                created_at: now,
            };
            work_requests::insert_request(&tx, &request)?;
            tx.commit()?;

            info!(
                activity_id = %activity.id,
                request_id = %request.id,
                receiver = %request.receiver_id,
                "Filed tax invoice follow-up"
            );
            Ok(Decision::Sent(request))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::{directory::WORK_MANAGERS_DOC, ProductCategory};
    use crate::holidays::StaticHolidaySource;
    use chrono::FixedOffset;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn job(db: Arc<LedgerDb>) -> EscalationJob {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        EscalationJob::new(
            db,
            Arc::new(StaticHolidaySource::new()),
            BusinessCalendar::new(offset),
            EscalationConfig {
                jitter_min_secs: 0,
                jitter_max_secs: 0,
                ..Default::default()
            },
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            Arc::new(EventBus::new()),
            Arc::new(FixedClock::new(at("2025-01-06T00:00:00Z"))),
        )
    }

    fn seed(db: &LedgerDb, created: DateTime<Utc>) -> Activity {
        let activity = Activity {
            id: "act-1".into(),
            customer_id: "c-1".into(),
            activity_type: PURCHASE_CONFIRM.into(),
            product_category: ProductCategory::Inventory,
            selected_products: vec![],
            amount: 10_000,
            discount: 0,
            date: "2025-01-06".into(),
            manager_id: "u-1".into(),
            manager_name: "Kim".into(),
            pay_method: PAY_METHOD_BANK_TRANSFER.into(),
            delivery_info: None,
            tax_invoice: None,
            modification_history: vec![],
            created_at: created,
            updated_at: created,
        };
        db.with_conn(|conn| {
            activities::upsert_activity(conn, &activity)?;
            directory::put_setting(
                conn,
                WORK_MANAGERS_DOC,
                &WorkManagers {
                    biz_registration_manager_id: "biz".into(),
                    tax_invoice_manager_id: "tax".into(),
                },
            )
        })
        .unwrap();
        activity
    }

    fn first_request(db: &LedgerDb, status: RequestStatus, trigger: TriggerType) {
        let request = WorkRequest {
            id: uuid::Uuid::new_v4().to_string(),
            title: "Business registration".into(),
            content: String::new(),
            sender_id: "tax".into(),
            receiver_id: "biz".into(),
            status,
            related_activity_id: Some("act-1".into()),
            trigger_type: Some(trigger),
            created_at: at("2025-01-06T02:00:00Z"),
        };
        db.with_conn(|conn| work_requests::insert_request(conn, &request))
            .unwrap();
    }

    #[test]
    fn test_next_run_uses_regional_time() {
        let job = job(Arc::new(LedgerDb::open_in_memory().unwrap()));
        // 08:00 KST -> today 09:00 KST
        assert_eq!(job.next_run_after(at("2025-01-05T23:00:00Z")), at("2025-01-06T00:00:00Z"));
        // 09:30 KST -> tomorrow 09:00 KST
        assert_eq!(job.next_run_after(at("2025-01-06T00:30:00Z")), at("2025-01-07T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_weekend_is_a_no_op() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        seed(&db, at("2024-12-30T01:00:00Z"));
        first_request(&db, RequestStatus::Pending, TriggerType::TaxBizSecuring);

        let report = job(db).run_once(at("2025-01-11T01:00:00Z")).await.unwrap();
        assert!(!report.business_day);
        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn test_missing_first_request_is_skipped() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        seed(&db, at("2024-12-30T01:00:00Z"));

        let report = job(db).run_once(at("2025-01-10T01:00:00Z")).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!((report.sent, report.skipped), (0, 1));
    }

    #[tokio::test]
    async fn test_sends_once_then_dedupes() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        seed(&db, at("2024-12-30T01:00:00Z"));
        first_request(&db, RequestStatus::Approved, TriggerType::TaxBizSecuring);
        let job = job(db.clone());

        let first = job.run_once(at("2025-01-10T01:00:00Z")).await.unwrap();
        assert_eq!(first.sent, 1);
        let second = job.run_once(at("2025-01-13T01:00:00Z")).await.unwrap();
        assert_eq!((second.sent, second.skipped), (0, 1));

        let requests = db
            .with_conn(|conn| work_requests::list_for_activity(conn, "act-1", &[TriggerType::TaxBizDelay]))
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].receiver_id, "biz");
        assert!(requests[0].content.contains("2025-01-06"));
    }

    #[tokio::test]
    async fn test_resolved_follow_up_allows_another() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        seed(&db, at("2024-12-30T01:00:00Z"));
        first_request(&db, RequestStatus::Approved, TriggerType::TaxBizSecuring);
        first_request(&db, RequestStatus::Rejected, TriggerType::TaxBizDelay);

        let report = job(db).run_once(at("2025-01-10T01:00:00Z")).await.unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn test_misconfigured_settings_never_propagate() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let job = job(db.clone());
        db.with_conn(|conn| directory::put_setting(conn, WORK_MANAGERS_DOC, &serde_json::json!({})))
            .unwrap();

        assert!(matches!(
            job.run_once(at("2025-01-10T01:00:00Z")).await,
            Err(LedgerError::Config(_))
        ));
        assert!(job.run(at("2025-01-10T01:00:00Z")).await.is_none());
    }
}
