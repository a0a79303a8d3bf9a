//! Public holiday sources
//!
//! The escalation job and the edit window only consume a [`HolidaySet`]; where
//! it comes from is pluggable. [`HttpHolidaySource`] talks to a Nager.Date
//! compatible API:
//!
//! ```text
//! GET {base}/PublicHolidays/2025/KR
//! [{"date": "2025-01-01", "localName": "새해", ...}, ...]
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::calendar::HolidaySet;
use crate::config::HolidayConfig;
use crate::error::LedgerError;

#[async_trait]
pub trait HolidaySource: Send + Sync {
    /// Holidays of one calendar year
    async fn holidays_for_year(&self, year: i32) -> Result<HolidaySet, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct PublicHoliday {
    date: String,
}

/// Holiday API client
pub struct HttpHolidaySource {
    base_url: String,
    country_code: String,
    http_client: reqwest::Client,
}

impl HttpHolidaySource {
    pub fn new(config: &HolidayConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("inventory-ledger/0.1")
            .build()
            .unwrap_or_default();

        Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            country_code: config.country_code.clone(),
            http_client,
        }
    }

    fn url(&self, year: i32) -> String {
        format!("{}/PublicHolidays/{}/{}", self.base_url, year, self.country_code)
    }
}

#[async_trait]
impl HolidaySource for HttpHolidaySource {
    async fn holidays_for_year(&self, year: i32) -> Result<HolidaySet, LedgerError> {
        let url = self.url(year);
        debug!(url = %url, "Fetching public holidays");

        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(LedgerError::External(format!(
                "holiday API returned {} for {}",
                response.status(),
                url
            )));
        }

        let holidays: Vec<PublicHoliday> = response.json().await?;
        let set = HolidaySet::from_iso_dates(holidays.iter().map(|h| h.date.as_str()))?;
        info!(year, country = %self.country_code, count = set.len(), "Loaded public holidays");
        Ok(set)
    }
}

/// Fixed holidays per year, for tests and offline runs
#[derive(Debug, Clone, Default)]
pub struct StaticHolidaySource {
    years: HashMap<i32, HolidaySet>,
}

impl StaticHolidaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_year(mut self, year: i32, holidays: HolidaySet) -> Self {
        self.years.insert(year, holidays);
        self
    }
}

#[async_trait]
impl HolidaySource for StaticHolidaySource {
    async fn holidays_for_year(&self, year: i32) -> Result<HolidaySet, LedgerError> {
        Ok(self.years.get(&year).cloned().unwrap_or_default())
    }
}

/// Holidays of `year` and the year before, so windows that straddle
/// January 1st still skip last year's holidays
pub async fn load_window_holidays(
    source: &dyn HolidaySource,
    year: i32,
) -> Result<HolidaySet, LedgerError> {
    let mut set = source.holidays_for_year(year).await?;
    set.extend(source.holidays_for_year(year - 1).await?);
    Ok(set)
}
