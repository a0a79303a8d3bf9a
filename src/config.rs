//! Configuration for inventory-ledger

use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::LedgerError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("inventory-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and attachments
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default)]
    pub transactions: TransactionConfig,

    #[serde(default)]
    pub calendar: CalendarConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub holidays: HolidayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Times a transaction callback is executed before a conflict is reported
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound of the randomized pause between attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Offset of the business region from UTC (hours)
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    /// Business days during which purchase confirmations stay editable
    #[serde(default = "default_window_days")]
    pub edit_window_days: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset_hours(),
            edit_window_days: default_window_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Business days after which a missing invoice is escalated
    #[serde(default = "default_window_days")]
    pub threshold_days: u32,

    /// Daily run time in regional time, "HH:MM"
    #[serde(default = "default_run_at")]
    pub run_at: String,

    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: u64,

    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_window_days(),
            run_at: default_run_at(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolidayConfig {
    /// Base URL of a Nager.Date compatible public holiday API
    #[serde(default = "default_holiday_api")]
    pub api_base_url: String,

    #[serde(default = "default_country_code")]
    pub country_code: String,

    #[serde(default = "default_holiday_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HolidayConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_holiday_api(),
            country_code: default_country_code(),
            request_timeout_secs: default_holiday_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_retry_backoff_ms() -> u64 { 25 }
fn default_utc_offset_hours() -> i32 { 9 }
fn default_window_days() -> u32 { 3 }
fn default_run_at() -> String { "09:00".to_string() }
fn default_jitter_min_secs() -> u64 { 180 }
fn default_jitter_max_secs() -> u64 { 600 }
fn default_holiday_timeout() -> u64 { 10 }

fn default_holiday_api() -> String {
    "https://date.nager.at/api/v3".to_string()
}

fn default_country_code() -> String {
    "KR".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            transactions: TransactionConfig::default(),
            calendar: CalendarConfig::default(),
            escalation: EscalationConfig::default(),
            holidays: HolidayConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.storage_dir.join("attachments")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.storage_dir.join("trash")
    }

    /// Fixed regional offset used for "today" and the daily schedule
    pub fn region_offset(&self) -> Result<FixedOffset, LedgerError> {
        FixedOffset::east_opt(self.calendar.utc_offset_hours * 3600).ok_or_else(|| {
            LedgerError::Config(format!(
                "utc_offset_hours out of range: {}",
                self.calendar.utc_offset_hours
            ))
        })
    }

    /// Parsed daily run time
    pub fn run_at(&self) -> Result<NaiveTime, LedgerError> {
        NaiveTime::parse_from_str(&self.escalation.run_at, "%H:%M").map_err(|e| {
            LedgerError::Config(format!("invalid run_at {:?}: {}", self.escalation.run_at, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.calendar.utc_offset_hours, 9);
        assert_eq!(config.escalation.threshold_days, 3);
        assert_eq!(config.transactions.max_attempts, 5);
        assert_eq!(config.run_at().unwrap(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
storage_dir = "/tmp/ledger"

[escalation]
jitter_min_secs = 0
jitter_max_secs = 0
"#,
        )
        .expect("valid TOML");

        assert_eq!(config.storage_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.escalation.jitter_max_secs, 0);
        assert_eq!(config.escalation.run_at, "09:00");
        assert_eq!(config.holidays.country_code, "KR");
    }

    #[test]
    fn test_invalid_run_at() {
        let mut config = Config::default();
        config.escalation.run_at = "nine".into();
        assert!(matches!(config.run_at(), Err(LedgerError::Config(_))));
    }
}
