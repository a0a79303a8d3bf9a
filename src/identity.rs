//! Item identity and the derived meta key
//!
//! Rows are grouped by master-catalog id when one is present, otherwise by
//! normalized name + category. The key doubles as the `asset_meta` primary key.
//!
//! ```text
//! master:<master id>
//! item:<category>::<name>    ':' and '%' percent-encoded in both parts
//! ```

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable grouping key for ledger rows
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-derived key (e.g. read back from storage or the CLI)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for IdentityKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for IdentityKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(Self)
    }
}

/// Name/category/master-id triple identifying one stock item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemIdentity {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub master_id: Option<String>,
}

impl ItemIdentity {
    pub fn new(name: &str, category: &str, master_id: Option<&str>) -> Self {
        Self {
            name: name.trim().to_string(),
            category: category.trim().to_string(),
            master_id: master_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        }
    }

    pub fn key(&self) -> IdentityKey {
        match &self.master_id {
            Some(id) => IdentityKey(format!("master:{}", id)),
            None => IdentityKey(format!(
                "item:{}::{}",
                escape_part(&normalize(&self.category)),
                escape_part(&normalize(&self.name))
            )),
        }
    }
}

/// Trim, collapse inner whitespace and lowercase
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Keep `::` reserved for the separator
fn escape_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3a"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_id_wins() {
        let a = ItemIdentity::new("Water Filter", "Parts", Some("m-1"));
        let b = ItemIdentity::new("Renamed Filter", "Other", Some("m-1"));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "master:m-1");
    }

    #[test]
    fn test_name_category_normalized() {
        let a = ItemIdentity::new("  Water   Filter ", "Parts", None);
        let b = ItemIdentity::new("water filter", "PARTS", None);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "item:parts::water filter");
    }

    #[test]
    fn test_blank_master_id_ignored() {
        let a = ItemIdentity::new("Filter", "Parts", Some("  "));
        assert!(a.master_id.is_none());
        assert!(a.key().as_str().starts_with("item:"));
    }

    #[test]
    fn test_category_is_part_of_key() {
        let a = ItemIdentity::new("Filter", "Parts", None);
        let b = ItemIdentity::new("Filter", "Consumables", None);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_separator_in_name_or_category_stays_unambiguous() {
        let a = ItemIdentity::new("c", "a::b", None);
        let b = ItemIdentity::new("b::c", "a", None);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "item:a%3a%3ab::c");
        assert_eq!(b.key().as_str(), "item:a::b%3a%3ac");

        let literal = ItemIdentity::new("b%3a%3ac", "a", None);
        assert_ne!(literal.key(), b.key());
    }
}
