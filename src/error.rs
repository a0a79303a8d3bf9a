//! Error types for inventory-ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not permitted: {0}")]
    Unauthorized(String),

    #[error("Transaction conflict after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("Read after write inside transaction: {0}")]
    ReadAfterWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("External dependency error: {0}")]
    External(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Whether the caller can fix the request and try again
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Unauthorized(_))
    }
}

/// Internal marker for a commit that lost an optimistic race. Never escapes the runner.
#[derive(Debug)]
pub(crate) struct StaleRead {
    pub table: &'static str,
    pub id: String,
}

impl std::fmt::Display for StaleRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stale read of {}/{}", self.table, self.id)
    }
}
