// 🧾 Core record types - what flows through a resolution run
//
// SourceRecord is immutable once ingested. Everything downstream
// (NormalizedRecord, PairKey, scores, clusters) is derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// CANONICAL FIELD NAMES
// ============================================================================

/// Field names the engine understands. Source adapters map their own
/// column names onto these.
pub mod fields {
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const EMAIL: &str = "email";
    pub const PHONE: &str = "phone";
    pub const ADDRESS_LINE1: &str = "address_line1";
    pub const CITY: &str = "city";
    pub const STATE: &str = "state";
    pub const ZIP_CODE: &str = "zip_code";
    pub const DATE_OF_BIRTH: &str = "date_of_birth";
    pub const SSN_HASH: &str = "ssn_hash";
}

// ============================================================================
// FIELD KIND
// ============================================================================

/// How a field is normalized. Fixed set; unknown fields are `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Name,
    Email,
    Phone,
    Street,
    City,
    State,
    Zip,
    Date,
    Identifier,
    Text,
}

impl FieldKind {
    /// Default kind for a canonical field name
    pub fn for_field(name: &str) -> FieldKind {
        match name {
            fields::FIRST_NAME | fields::LAST_NAME | "middle_name" => FieldKind::Name,
            fields::EMAIL => FieldKind::Email,
            fields::PHONE => FieldKind::Phone,
            fields::ADDRESS_LINE1 | "address_line2" => FieldKind::Street,
            fields::CITY => FieldKind::City,
            fields::STATE => FieldKind::State,
            fields::ZIP_CODE => FieldKind::Zip,
            fields::SSN_HASH => FieldKind::Identifier,
            other if other.ends_with("_date") || other == fields::DATE_OF_BIRTH => {
                FieldKind::Date
            }
            _ => FieldKind::Text,
        }
    }
}

// ============================================================================
// SOURCE RECORD
// ============================================================================

/// A record as delivered by a source system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable id assigned by ingestion (unique across source systems)
    pub record_id: String,

    /// Which system the record came from (e.g. "core_banking")
    pub source_system: String,

    /// Raw field values keyed by canonical field name
    pub fields: BTreeMap<String, String>,

    /// When ingestion delivered this record
    pub ingested_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn new(
        record_id: impl Into<String>,
        source_system: impl Into<String>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        SourceRecord {
            record_id: record_id.into(),
            source_system: source_system.into(),
            fields: BTreeMap::new(),
            ingested_at,
        }
    }

    /// Builder: add a raw field value
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

// ============================================================================
// NORMALIZED RECORD
// ============================================================================

/// One blocking key produced by one strategy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockingKey {
    pub strategy: String,
    pub value: String,
}

impl fmt::Display for BlockingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.strategy, self.value)
    }
}

/// Canonical view of a SourceRecord. Missing or malformed fields are
/// simply absent from `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record_id: String,
    pub source_system: String,
    pub ingested_at: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
    pub blocking_keys: Vec<BlockingKey>,

    /// SHA-256 over source system + canonical fields; detects redelivery
    pub content_hash: String,
}

impl NormalizedRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

// ============================================================================
// PAIR KEY
// ============================================================================

/// Unordered record pair stored in canonical `a < b` order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    a: String,
    b: String,
}

impl PairKey {
    /// Build a pair in canonical order. Callers must not pass the same id twice.
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            PairKey { a: x, b: y }
        } else {
            PairKey { a: y, b: x }
        }
    }

    /// Parse the `a|b` display form
    pub fn parse(s: &str) -> Option<PairKey> {
        let (x, y) = s.split_once('|')?;
        let (x, y) = (x.trim(), y.trim());
        (!x.is_empty() && !y.is_empty() && x != y).then(|| PairKey::new(x, y))
    }

    pub fn a(&self) -> &str {
        &self.a
    }

    pub fn b(&self) -> &str {
        &self.b
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.a == record_id || self.b == record_id
    }

    /// The other member of the pair, if `record_id` is one of them
    pub fn other(&self, record_id: &str) -> Option<&str> {
        if self.a == record_id {
            Some(&self.b)
        } else if self.b == record_id {
            Some(&self.a)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_canonical_order() {
        let p1 = PairKey::new("rec-2", "rec-1");
        let p2 = PairKey::new("rec-1", "rec-2");
        assert_eq!(p1, p2);
        assert_eq!(p1.a(), "rec-1");
        assert_eq!(p1.b(), "rec-2");
        assert_eq!(p1.to_string(), "rec-1|rec-2");
        assert_eq!(PairKey::parse("rec-2|rec-1"), Some(p1.clone()));
        assert_eq!(PairKey::parse("rec-1|rec-1"), None);
        assert_eq!(p1.other("rec-1"), Some("rec-2"));
        assert_eq!(p1.other("rec-3"), None);
    }

    #[test]
    fn test_field_kind_defaults() {
        assert_eq!(FieldKind::for_field("last_name"), FieldKind::Name);
        assert_eq!(FieldKind::for_field("date_of_birth"), FieldKind::Date);
        assert_eq!(FieldKind::for_field("acquisition_date"), FieldKind::Date);
        assert_eq!(FieldKind::for_field("segment"), FieldKind::Text);
    }
}
