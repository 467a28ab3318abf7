// 🧹 Normalizer - canonical field values + blocking keys
//
// Pure functions: same SourceRecord in → same NormalizedRecord out.
// A value that cannot be normalized (bad date, 4-digit phone, ...) is
// dropped as missing. It never aborts the record or the run.

use crate::blocking::compute_blocking_keys;
use crate::config::{BlockingStrategy, ResolutionConfig};
use crate::model::{FieldKind, NormalizedRecord, SourceRecord};
use chrono::NaiveDate;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct Normalizer {
    config: ResolutionConfig,
}

impl Normalizer {
    pub fn new(config: &ResolutionConfig) -> Self {
        Normalizer {
            config: config.clone(),
        }
    }

    /// Canonicalize every field and derive blocking keys
    pub fn normalize(&self, record: &SourceRecord) -> NormalizedRecord {
        let fields: BTreeMap<String, String> = record
            .fields
            .iter()
            .filter_map(|(name, raw)| {
                normalize_value(self.config.kind_of(name), raw).map(|v| (name.clone(), v))
            })
            .collect();

        let blocking_keys = compute_blocking_keys(self.strategies(), &fields);
        let content_hash = content_hash(&record.source_system, &fields);

        NormalizedRecord {
            record_id: record.record_id.clone(),
            source_system: record.source_system.clone(),
            ingested_at: record.ingested_at,
            fields,
            blocking_keys,
            content_hash,
        }
    }

    /// Normalize a batch in parallel; output order follows input order
    pub fn normalize_all(&self, records: &[SourceRecord]) -> Vec<NormalizedRecord> {
        records.par_iter().map(|r| self.normalize(r)).collect()
    }

    fn strategies(&self) -> &[BlockingStrategy] {
        &self.config.blocking.strategies
    }
}

/// SHA-256 over source system + canonical fields (BTreeMap order is stable)
pub fn content_hash(source_system: &str, fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_system.as_bytes());
    for (name, value) in fields {
        hasher.update([0x1f]);
        hasher.update(name.as_bytes());
        hasher.update([0x1e]);
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Dispatch on field kind
pub fn normalize_value(kind: FieldKind, raw: &str) -> Option<String> {
    match kind {
        FieldKind::Name => normalize_name(raw),
        FieldKind::Email => normalize_email(raw),
        FieldKind::Phone => normalize_phone(raw),
        FieldKind::Street => normalize_street(raw),
        FieldKind::City => normalize_city(raw),
        FieldKind::State => normalize_state(raw),
        FieldKind::Zip => normalize_zip(raw),
        FieldKind::Date => normalize_date(raw),
        FieldKind::Identifier => normalize_identifier(raw),
        FieldKind::Text => normalize_text(raw),
    }
}

// ============================================================================
// FIELD RULES
// ============================================================================

/// "José  O'Brien-Smith" → "JOSE OBRIEN SMITH"
pub fn normalize_name(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let folded = transliterate(c);
        for f in folded.chars() {
            if f.is_ascii_alphanumeric() {
                out.push(f.to_ascii_uppercase());
            } else if f.is_whitespace() || f == '-' {
                out.push(' ');
            }
            // apostrophes, periods and other punctuation are dropped
        }
    }
    non_empty(collapse_whitespace(&out))
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return None;
    }
    if domain.starts_with('.') || domain.ends_with('.') || email.contains(char::is_whitespace) {
        return None;
    }
    Some(email)
}

/// Digits only, last 10 kept; fewer than 7 digits is not a phone number
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].to_string())
}

/// Uppercase, punctuation stripped, street abbreviations expanded
pub fn normalize_street(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else if c == '#' || c == ',' || c == '-' || c == '/' {
                ' '
            } else {
                '\0'
            }
        })
        .filter(|c| *c != '\0')
        .collect();

    let expanded: Vec<&str> = cleaned
        .split_whitespace()
        .map(|token| expand_street_abbreviation(token).unwrap_or(token))
        .collect();

    non_empty(expanded.join(" "))
}

pub fn normalize_city(raw: &str) -> Option<String> {
    normalize_name(raw)
}

/// Two-letter US state code; full names are mapped to their code
pub fn normalize_state(raw: &str) -> Option<String> {
    let upper = collapse_whitespace(&raw.trim().to_uppercase().replace('.', ""));
    if upper.len() == 2 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(upper);
    }
    STATE_NAMES
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, code)| code.to_string())
}

/// First five digits of a ZIP / ZIP+4
pub fn normalize_zip(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 5 {
        return None;
    }
    Some(digits[..5].to_string())
}

/// Parse common date layouts into YYYY-MM-DD
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let candidate = match trimmed.split_once('T') {
        Some((date, _)) => date,
        None => trimmed,
    };

    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

pub fn normalize_identifier(raw: &str) -> Option<String> {
    non_empty(raw.trim().to_lowercase())
}

pub fn normalize_text(raw: &str) -> Option<String> {
    non_empty(collapse_whitespace(raw.trim()))
}

// ============================================================================
// PHONETIC KEY
// ============================================================================

/// American Soundex ("ROBERT" → "R163"). None when there are no letters.
pub fn soundex(s: &str) -> Option<String> {
    let letters: Vec<char> = s
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let first = *letters.first()?;
    let mut code = String::with_capacity(4);
    code.push(first);

    let mut last = soundex_digit(first);
    for &c in &letters[1..] {
        match soundex_digit(c) {
            Some(digit) => {
                if Some(digit) != last {
                    code.push(digit);
                    if code.len() == 4 {
                        break;
                    }
                }
                last = Some(digit);
            }
            // H and W do not separate letters with the same code
            None if c == 'H' || c == 'W' => {}
            None => last = None,
        }
    }

    while code.len() < 4 {
        code.push('0');
    }
    Some(code)
}

fn soundex_digit(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Latin diacritics → ASCII
fn transliterate(c: char) -> String {
    let mapped = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
        'ç' | 'Ç' => "C",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'ñ' | 'Ñ' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
        'ý' | 'ÿ' | 'Ý' => "Y",
        'ß' => "SS",
        'æ' | 'Æ' => "AE",
        'œ' | 'Œ' => "OE",
        _ => return c.to_string(),
    };
    mapped.to_string()
}

fn expand_street_abbreviation(token: &str) -> Option<&'static str> {
    let expanded = match token {
        "ST" => "STREET",
        "AVE" | "AV" => "AVENUE",
        "BLVD" => "BOULEVARD",
        "DR" => "DRIVE",
        "LN" => "LANE",
        "CT" => "COURT",
        "RD" => "ROAD",
        "PL" => "PLACE",
        "PKWY" => "PARKWAY",
        "HWY" => "HIGHWAY",
        "CIR" => "CIRCLE",
        "TER" => "TERRACE",
        "SQ" => "SQUARE",
        "APT" => "APARTMENT",
        "STE" => "SUITE",
        "N" => "NORTH",
        "S" => "SOUTH",
        "E" => "EAST",
        "W" => "WEST",
        _ => return None,
    };
    Some(expanded)
}

const STATE_NAMES: [(&str, &str); 51] = [
    ("ALABAMA", "AL"), ("ALASKA", "AK"), ("ARIZONA", "AZ"), ("ARKANSAS", "AR"),
    ("CALIFORNIA", "CA"), ("COLORADO", "CO"), ("CONNECTICUT", "CT"), ("DELAWARE", "DE"),
    ("DISTRICT OF COLUMBIA", "DC"), ("FLORIDA", "FL"), ("GEORGIA", "GA"), ("HAWAII", "HI"),
    ("IDAHO", "ID"), ("ILLINOIS", "IL"), ("INDIANA", "IN"), ("IOWA", "IA"),
    ("KANSAS", "KS"), ("KENTUCKY", "KY"), ("LOUISIANA", "LA"), ("MAINE", "ME"),
    ("MARYLAND", "MD"), ("MASSACHUSETTS", "MA"), ("MICHIGAN", "MI"), ("MINNESOTA", "MN"),
    ("MISSISSIPPI", "MS"), ("MISSOURI", "MO"), ("MONTANA", "MT"), ("NEBRASKA", "NE"),
    ("NEVADA", "NV"), ("NEW HAMPSHIRE", "NH"), ("NEW JERSEY", "NJ"), ("NEW MEXICO", "NM"),
    ("NEW YORK", "NY"), ("NORTH CAROLINA", "NC"), ("NORTH DAKOTA", "ND"), ("OHIO", "OH"),
    ("OKLAHOMA", "OK"), ("OREGON", "OR"), ("PENNSYLVANIA", "PA"), ("RHODE ISLAND", "RI"),
    ("SOUTH CAROLINA", "SC"), ("SOUTH DAKOTA", "SD"), ("TENNESSEE", "TN"), ("TEXAS", "TX"),
    ("UTAH", "UT"), ("VERMONT", "VT"), ("VIRGINIA", "VA"), ("WASHINGTON", "WA"),
    ("WEST VIRGINIA", "WV"), ("WISCONSIN", "WI"), ("WYOMING", "WY"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn create_test_record() -> SourceRecord {
        SourceRecord::new("core_banking:CIF-00001", "core_banking", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .with_field("first_name", "José")
            .with_field("last_name", "O'Brien")
            .with_field("email", " JOBRIEN@Example.COM ")
            .with_field("phone", "+1 (555) 123-4567")
            .with_field("date_of_birth", "13/45/1980")
            .with_field("zip_code", "94107-1234")
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_name("  josé  o'brien "), Some("JOSE OBRIEN".to_string()));
        assert_eq!(normalize_name("Smith-Jones"), Some("SMITH JONES".to_string()));
        assert_eq!(normalize_name("J."), Some("J".to_string()));
        assert_eq!(normalize_name(" .. "), None);
    }

    #[test]
    fn test_email_normalization() {
        assert_eq!(normalize_email(" JSmith@X.com"), Some("jsmith@x.com".to_string()));
        assert_eq!(normalize_email("no-at-sign.com"), None);
        assert_eq!(normalize_email("a@b@c.com"), None);
        assert_eq!(normalize_email("@x.com"), None);
        assert_eq!(normalize_email("a@localhost"), None);
    }

    #[test]
    fn test_phone_keeps_last_ten_digits() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), Some("5551234567".to_string()));
        assert_eq!(normalize_phone("555-1234"), Some("5551234".to_string()));
        assert_eq!(normalize_phone("1234"), None);
    }

    #[test]
    fn test_street_abbreviation_expansion() {
        assert_eq!(normalize_street("123 Main St."), Some("123 MAIN STREET".to_string()));
        assert_eq!(normalize_street("45 N. Oak Ave, Apt 5"), Some("45 NORTH OAK AVENUE APARTMENT 5".to_string()));
    }

    #[test]
    fn test_state_and_zip() {
        assert_eq!(normalize_state("ca"), Some("CA".to_string()));
        assert_eq!(normalize_state("New York"), Some("NY".to_string()));
        assert_eq!(normalize_state("Calif"), None);
        assert_eq!(normalize_zip("94107-1234"), Some("94107".to_string()));
        assert_eq!(normalize_zip("941"), None);
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(normalize_date("1980-02-29"), Some("1980-02-29".to_string()));
        assert_eq!(normalize_date("02/29/1980"), Some("1980-02-29".to_string()));
        assert_eq!(normalize_date("19800229"), Some("1980-02-29".to_string()));
        assert_eq!(normalize_date("2024-01-05T10:30:00Z"), Some("2024-01-05".to_string()));
        assert_eq!(normalize_date("1981-02-29"), None);
    }

    #[test]
    fn test_soundex() {
        assert_eq!(soundex("Robert"), Some("R163".to_string()));
        assert_eq!(soundex("Rupert"), Some("R163".to_string()));
        assert_eq!(soundex("Ashcraft"), Some("A261".to_string()));
        assert_eq!(soundex("Tymczak"), Some("T522".to_string()));
        assert_eq!(soundex("Pfister"), Some("P236".to_string()));
        assert_eq!(soundex("Lee"), Some("L000".to_string()));
        assert_eq!(soundex("123"), None);
    }

    #[test]
    fn test_malformed_field_is_missing_not_error() {
        let normalizer = Normalizer::new(&ResolutionConfig::default());
        let normalized = normalizer.normalize(&create_test_record());

        assert_eq!(normalized.get("first_name"), Some("JOSE"));
        assert_eq!(normalized.get("last_name"), Some("OBRIEN"));
        assert_eq!(normalized.get("email"), Some("jobrien@example.com"));
        assert_eq!(normalized.get("phone"), Some("5551234567"));
        assert_eq!(normalized.get("zip_code"), Some("94107"));
        assert_eq!(normalized.get("date_of_birth"), None);
    }

    #[test]
    fn test_normalization_is_pure() {
        let normalizer = Normalizer::new(&ResolutionConfig::default());
        let record = create_test_record();

        let first = normalizer.normalize(&record);
        let second = normalizer.normalize(&record);

        assert_eq!(first, second);
        assert_eq!(first.content_hash.len(), 64);
        assert!(!first.blocking_keys.is_empty());
    }

    #[test]
    fn test_content_hash_ignores_cosmetic_differences() {
        let normalizer = Normalizer::new(&ResolutionConfig::default());
        let a = create_test_record();
        let mut b = create_test_record();
        b.fields.insert("email".to_string(), "jobrien@example.com".to_string());
        b.fields.insert("phone".to_string(), "555.123.4567".to_string());

        assert_eq!(
            normalizer.normalize(&a).content_hash,
            normalizer.normalize(&b).content_hash
        );
    }
}
