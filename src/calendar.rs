//! Business-day calendar
//!
//! A business day is a weekday that is not in the supplied holiday set. The
//! calendar does no fetching; holidays come from a [`crate::holidays::HolidaySource`].
//!
//! Elapsed business days are counted over `(base, today]`: the base date itself
//! is day zero, and "N days have elapsed" only becomes true on the (N+1)th
//! business day after it.
//!
//! ```text
//! base = Mon 2025-01-06, N = 3, no holidays
//! Tue=1  Wed=2  Thu=3 (count > 3? no)  Fri=4 (yes)
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::db::UserProfile;
use crate::error::LedgerError;

/// Holiday dates, one or more calendar years
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidaySet {
    dates: HashSet<NaiveDate>,
}

impl HolidaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `YYYY-MM-DD` strings
    pub fn from_iso_dates<I, S>(dates: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for raw in dates {
            let raw = raw.as_ref();
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|e| LedgerError::External(format!("bad holiday date {:?}: {}", raw, e)))?;
            set.insert(date);
        }
        Ok(set)
    }

    pub fn insert(&mut self, date: NaiveDate) {
        self.dates.insert(date);
    }

    pub fn extend(&mut self, other: HolidaySet) {
        self.dates.extend(other.dates);
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Weekday and not a holiday
pub fn is_business_day(date: NaiveDate, holidays: &HolidaySet) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !holidays.contains(date)
}

/// Business days in `(base, today]`
pub fn business_days_between(base: NaiveDate, today: NaiveDate, holidays: &HolidaySet) -> u32 {
    let mut count = 0;
    let mut current = base;
    while current < today {
        current += Duration::days(1);
        if is_business_day(current, holidays) {
            count += 1;
        }
    }
    count
}

/// Strictly more than `required_days` business days since `base`
pub fn has_elapsed_business_days(
    base: NaiveDate,
    required_days: u32,
    today: NaiveDate,
    holidays: &HolidaySet,
) -> bool {
    business_days_between(base, today, holidays) > required_days
}

/// The date `days` business days after `base`
pub fn add_business_days(base: NaiveDate, days: u32, holidays: &HolidaySet) -> NaiveDate {
    let mut current = base;
    let mut remaining = days;
    while remaining > 0 {
        current += Duration::days(1);
        if is_business_day(current, holidays) {
            remaining -= 1;
        }
    }
    current
}

/// Calendar bound to the business region's fixed UTC offset
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    offset: FixedOffset,
}

impl BusinessCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Regional calendar date of an instant, independent of the host timezone
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn is_business_day(&self, at: DateTime<Utc>, holidays: &HolidaySet) -> bool {
        is_business_day(self.local_date(at), holidays)
    }

    pub fn has_elapsed_business_days(
        &self,
        base: DateTime<Utc>,
        required_days: u32,
        now: DateTime<Utc>,
        holidays: &HolidaySet,
    ) -> bool {
        has_elapsed_business_days(self.local_date(base), required_days, self.local_date(now), holidays)
    }
}

/// Edit/delete window for purchase confirmations
#[derive(Debug, Clone)]
pub struct EditWindow {
    calendar: BusinessCalendar,
    window_days: u32,
}

impl EditWindow {
    pub fn new(calendar: BusinessCalendar, window_days: u32) -> Self {
        Self {
            calendar,
            window_days,
        }
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    /// Fails once the window has passed, unless the actor is elevated
    pub fn ensure_can_modify(
        &self,
        created_at: DateTime<Utc>,
        actor: &UserProfile,
        now: DateTime<Utc>,
        holidays: &HolidaySet,
    ) -> Result<(), LedgerError> {
        if actor.role.is_elevated() {
            return Ok(());
        }
        if self
            .calendar
            .has_elapsed_business_days(created_at, self.window_days, now, holidays)
        {
            return Err(LedgerError::Unauthorized(format!(
                "edit window of {} business days has passed",
                self.window_days
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use chrono::TimeZone;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_weekend_and_holiday() {
        let holidays = HolidaySet::from_iso_dates(["2025-01-28"]).unwrap();
        assert!(is_business_day(d("2025-01-06"), &holidays)); // Monday
        assert!(!is_business_day(d("2025-01-11"), &holidays)); // Saturday
        assert!(!is_business_day(d("2025-01-12"), &holidays)); // Sunday
        assert!(!is_business_day(d("2025-01-28"), &holidays));
    }

    #[test]
    fn test_same_day_has_zero_elapsed() {
        let none = HolidaySet::new();
        let base = d("2025-01-06");
        assert!(!has_elapsed_business_days(base, 3, base, &none));
        assert!(!has_elapsed_business_days(base, 0, base, &none));
    }

    #[test]
    fn test_boundary_is_strictly_greater() {
        let none = HolidaySet::new();
        let base = d("2025-01-06");
        let plus3 = add_business_days(base, 3, &none);
        let plus4 = add_business_days(base, 4, &none);
        assert_eq!(plus3, d("2025-01-09"));
        assert_eq!(plus4, d("2025-01-10"));
        assert!(!has_elapsed_business_days(base, 3, plus3, &none));
        assert!(has_elapsed_business_days(base, 3, plus4, &none));
    }

    #[test]
    fn test_weekend_and_holidays_not_counted() {
        let holidays = HolidaySet::from_iso_dates(["2025-01-13"]).unwrap();
        let base = d("2025-01-09"); // Thursday
        // Fri=1, Mon(holiday) skipped, Tue=2, Wed=3, Thu=4
        assert_eq!(business_days_between(base, d("2025-01-15"), &holidays), 3);
        assert!(!has_elapsed_business_days(base, 3, d("2025-01-15"), &holidays));
        assert!(has_elapsed_business_days(base, 3, d("2025-01-16"), &holidays));
    }

    #[test]
    fn test_base_after_today_counts_nothing() {
        let none = HolidaySet::new();
        assert_eq!(business_days_between(d("2025-01-10"), d("2025-01-06"), &none), 0);
    }

    #[test]
    fn test_bad_holiday_string() {
        assert!(matches!(
            HolidaySet::from_iso_dates(["2025/01/01"]),
            Err(LedgerError::External(_))
        ));
    }

    #[test]
    fn test_local_date_uses_region_offset() {
        let calendar = BusinessCalendar::new(FixedOffset::east_opt(9 * 3600).unwrap());
        // 2025-01-05 20:00 UTC is already Monday morning at UTC+9
        let at = Utc.with_ymd_and_hms(2025, 1, 5, 20, 0, 0).unwrap();
        assert_eq!(calendar.local_date(at), d("2025-01-06"));
        assert!(calendar.is_business_day(at, &HolidaySet::new()));
    }

    #[test]
    fn test_edit_window_and_elevated_bypass() {
        let calendar = BusinessCalendar::new(FixedOffset::east_opt(9 * 3600).unwrap());
        let window = EditWindow::new(calendar, 3);
        let none = HolidaySet::new();
        let created = Utc.with_ymd_and_hms(2025, 1, 6, 1, 0, 0).unwrap();
        let thursday = Utc.with_ymd_and_hms(2025, 1, 9, 1, 0, 0).unwrap();
        let friday = Utc.with_ymd_and_hms(2025, 1, 10, 1, 0, 0).unwrap();

        let staff = UserProfile { id: "u1".into(), name: "Kim".into(), role: Role::Staff };
        let admin = UserProfile { id: "u2".into(), name: "Lee".into(), role: Role::Admin };

        assert!(window.ensure_can_modify(created, &staff, thursday, &none).is_ok());
        assert!(matches!(
            window.ensure_can_modify(created, &staff, friday, &none),
            Err(LedgerError::Unauthorized(_))
        ));
        assert!(window.ensure_can_modify(created, &admin, friday, &none).is_ok());
    }
}
