// 🔍 Pairwise Similarity - per-field comparison of two normalized records
//
// One FieldComparator per component. Every comparator is total (missing on
// either side → neutral 0.5, flagged as not compared) and symmetric.

use crate::config::{NameAlgorithm, ResolutionConfig, SimilarityConfig};
use crate::model::{fields, NormalizedRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Score used when a field is missing on either side
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Common-prefix characters that earn a boost (Winkler uses 4)
const MAX_PREFIX: usize = 4;
const PREFIX_SCALE: f64 = 0.1;

// Address sub-weights
const STREET_WEIGHT: f64 = 0.4;
const CITY_WEIGHT: f64 = 0.2;
const ZIP_WEIGHT: f64 = 0.3;
const STATE_WEIGHT: f64 = 0.1;

// ============================================================================
// COMPONENTS
// ============================================================================

/// The fixed set of scored components
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Name,
    Email,
    Phone,
    Address,
    CrossSystem,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Name,
        Component::Email,
        Component::Phone,
        Component::Address,
        Component::CrossSystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Name => "name",
            Component::Email => "email",
            Component::Phone => "phone",
            Component::Address => "address",
            Component::CrossSystem => "cross_system",
        }
    }

    /// The comparator implementing this component
    pub fn comparator(&self, settings: &SimilarityConfig) -> Box<dyn FieldComparator> {
        match self {
            Component::Name => Box::new(NameComparator::new(settings)),
            Component::Email => Box::new(EmailComparator::new(settings)),
            Component::Phone => Box::new(PhoneComparator::new(settings)),
            Component::Address => Box::new(AddressComparator),
            Component::CrossSystem => Box::new(CrossSystemComparator::new(settings)),
        }
    }
}

// ============================================================================
// FIELD SCORE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldScore {
    /// Similarity in [0,1]
    pub value: f64,

    /// False when the field was missing on either side
    pub compared: bool,
}

impl FieldScore {
    pub fn compared(value: f64) -> Self {
        FieldScore {
            value: value.clamp(0.0, 1.0),
            compared: true,
        }
    }

    pub fn not_compared() -> Self {
        FieldScore {
            value: NEUTRAL_SCORE,
            compared: false,
        }
    }
}

// ============================================================================
// COMPARATOR TRAIT
// ============================================================================

pub trait FieldComparator: Send + Sync {
    fn component(&self) -> Component;

    /// Must satisfy compare(a, b) == compare(b, a)
    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore;
}

// ============================================================================
// STRING SIMILARITY
// ============================================================================

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Normalized edit-distance similarity of two canonical strings
pub fn string_similarity(a: &str, b: &str, algorithm: NameAlgorithm) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    match algorithm {
        NameAlgorithm::PrefixWeightedLevenshtein => {
            let base = strsim::normalized_levenshtein(a, b);
            let prefix = common_prefix_len(a, b).min(MAX_PREFIX) as f64;
            base + prefix * PREFIX_SCALE * (1.0 - base)
        }
        NameAlgorithm::JaroWinkler => strsim::jaro_winkler(a, b),
    }
}

/// Name similarity with initials support ("J" vs "JOHN")
pub fn name_similarity(a: &str, b: &str, settings: &SimilarityConfig) -> f64 {
    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    if (len_a == 1) != (len_b == 1) && a.chars().next() == b.chars().next() {
        return settings.initial_match_score;
    }
    string_similarity(a, b, settings.name_algorithm)
}

/// Jaccard overlap of whitespace tokens
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Both values present: Some(pair); otherwise None
fn both<'a>(a: &'a NormalizedRecord, b: &'a NormalizedRecord, field: &str) -> Option<(&'a str, &'a str)> {
    Some((a.get(field)?, b.get(field)?))
}

// ============================================================================
// COMPARATORS
// ============================================================================

pub struct NameComparator {
    settings: SimilarityConfig,
}

impl NameComparator {
    pub fn new(settings: &SimilarityConfig) -> Self {
        NameComparator {
            settings: settings.clone(),
        }
    }
}

impl FieldComparator for NameComparator {
    fn component(&self) -> Component {
        Component::Name
    }

    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore {
        let parts: Vec<f64> = [fields::FIRST_NAME, fields::LAST_NAME]
            .iter()
            .filter_map(|field| both(a, b, field))
            .map(|(x, y)| name_similarity(x, y, &self.settings))
            .collect();

        if parts.is_empty() {
            return FieldScore::not_compared();
        }
        FieldScore::compared(parts.iter().sum::<f64>() / parts.len() as f64)
    }
}

pub struct EmailComparator {
    settings: SimilarityConfig,
}

impl EmailComparator {
    pub fn new(settings: &SimilarityConfig) -> Self {
        EmailComparator {
            settings: settings.clone(),
        }
    }
}

impl FieldComparator for EmailComparator {
    fn component(&self) -> Component {
        Component::Email
    }

    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore {
        let Some((x, y)) = both(a, b, fields::EMAIL) else {
            return FieldScore::not_compared();
        };
        if x == y {
            return FieldScore::compared(1.0);
        }

        let (local_x, domain_x) = x.rsplit_once('@').unwrap_or((x, ""));
        let (local_y, domain_y) = y.rsplit_once('@').unwrap_or((y, ""));

        let domain = if !domain_x.is_empty() && domain_x == domain_y { 1.0 } else { 0.0 };
        let local = string_similarity(local_x, local_y, self.settings.name_algorithm);
        let w = self.settings.email_domain_weight;
        let score = w * domain + (1.0 - w) * local;

        FieldScore::compared(score.min(self.settings.email_fallback_cap))
    }
}

pub struct PhoneComparator {
    digits: usize,
}

impl PhoneComparator {
    pub fn new(settings: &SimilarityConfig) -> Self {
        PhoneComparator {
            digits: settings.phone_digits,
        }
    }

    /// Last `digits` characters; a `field_kinds` override can leave non-ASCII text here
    fn tail<'a>(&self, phone: &'a str) -> &'a str {
        let skip = phone.chars().count().saturating_sub(self.digits);
        match phone.char_indices().nth(skip) {
            Some((start, _)) => &phone[start..],
            None => "",
        }
    }
}

impl FieldComparator for PhoneComparator {
    fn component(&self) -> Component {
        Component::Phone
    }

    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore {
        let Some((x, y)) = both(a, b, fields::PHONE) else {
            return FieldScore::not_compared();
        };
        let (x, y) = (self.tail(x), self.tail(y));
        if x == y {
            return FieldScore::compared(1.0);
        }

        let matching = x
            .chars()
            .rev()
            .zip(y.chars().rev())
            .take_while(|(p, q)| p == q)
            .count();
        FieldScore::compared(matching as f64 / self.digits as f64)
    }
}

pub struct AddressComparator;

impl FieldComparator for AddressComparator {
    fn component(&self) -> Component {
        Component::Address
    }

    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore {
        let sub_scores = [
            (fields::ADDRESS_LINE1, STREET_WEIGHT, true),
            (fields::CITY, CITY_WEIGHT, false),
            (fields::ZIP_CODE, ZIP_WEIGHT, false),
            (fields::STATE, STATE_WEIGHT, false),
        ];

        let mut any_compared = false;
        let mut total = 0.0;
        for (field, weight, is_street) in sub_scores {
            let score = match both(a, b, field) {
                Some((x, y)) => {
                    any_compared = true;
                    if is_street {
                        token_overlap(x, y)
                    } else if x == y {
                        1.0
                    } else {
                        0.0
                    }
                }
                None => NEUTRAL_SCORE,
            };
            total += weight * score;
        }

        if !any_compared {
            return FieldScore::not_compared();
        }
        FieldScore::compared(total)
    }
}

pub struct CrossSystemComparator {
    same_system: f64,
    cross_system: f64,
}

impl CrossSystemComparator {
    pub fn new(settings: &SimilarityConfig) -> Self {
        CrossSystemComparator {
            same_system: settings.same_system_score,
            cross_system: settings.cross_system_score,
        }
    }
}

impl FieldComparator for CrossSystemComparator {
    fn component(&self) -> Component {
        Component::CrossSystem
    }

    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> FieldScore {
        if a.source_system == b.source_system {
            FieldScore::compared(self.same_system)
        } else {
            FieldScore::compared(self.cross_system)
        }
    }
}

// ============================================================================
// SIMILARITY SCORER
// ============================================================================

/// Component scores for one pair, in `Component::ALL` order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityVector {
    pub scores: Vec<(Component, FieldScore)>,
}

impl SimilarityVector {
    pub fn get(&self, component: Component) -> Option<FieldScore> {
        self.scores
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, s)| *s)
    }
}

pub struct SimilarityScorer {
    comparators: Vec<Box<dyn FieldComparator>>,
}

impl SimilarityScorer {
    pub fn new(config: &ResolutionConfig) -> Self {
        SimilarityScorer {
            comparators: Component::ALL
                .iter()
                .map(|c| c.comparator(&config.similarity))
                .collect(),
        }
    }

    pub fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> SimilarityVector {
        SimilarityVector {
            scores: self
                .comparators
                .iter()
                .map(|c| (c.component(), c.compare(a, b)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, SourceRecord};
    use crate::normalizer::Normalizer;
    use chrono::Utc;

    fn create_test_record(id: &str, system: &str, values: &[(&str, &str)]) -> NormalizedRecord {
        let mut record = SourceRecord::new(id, system, Utc::now());
        for (field, value) in values {
            record = record.with_field(*field, *value);
        }
        Normalizer::new(&ResolutionConfig::default()).normalize(&record)
    }

    #[test]
    fn test_prefix_weighted_levenshtein() {
        let algo = NameAlgorithm::PrefixWeightedLevenshtein;
        assert_eq!(string_similarity("SMITH", "SMITH", algo), 1.0);
        assert_eq!(string_similarity("", "SMITH", algo), 0.0);

        // jsmith vs jsmith1: 1 - 1/7 plus a 4-char prefix boost
        let s = string_similarity("jsmith", "jsmith1", algo);
        assert!((s - 0.9142857).abs() < 1e-6, "got {}", s);

        // Prefix boost: SMITH/SMYTHE shares more prefix than SMITH/ZMITH
        assert!(string_similarity("SMITH", "SMYTH", algo) > string_similarity("SMITH", "ZMITH", algo));
    }

    #[test]
    fn test_initial_matches_full_name() {
        let settings = SimilarityConfig::default();
        assert_eq!(name_similarity("J", "JOHN", &settings), 0.8);
        assert_eq!(name_similarity("JOHN", "J", &settings), 0.8);
        assert!(name_similarity("K", "JOHN", &settings) < 0.5);
    }

    #[test]
    fn test_email_fallback() {
        let a = create_test_record("a", "crm", &[("email", "jsmith@x.com")]);
        let b = create_test_record("b", "crm", &[("email", "jsmith1@x.com")]);
        let c = create_test_record("c", "crm", &[("email", "jsmith@x.com")]);

        let comparator = EmailComparator::new(&SimilarityConfig::default());
        assert_eq!(comparator.compare(&a, &c).value, 1.0);

        let fallback = comparator.compare(&a, &b).value;
        assert!((fallback - 0.9485714).abs() < 1e-6, "got {}", fallback);
        assert!(fallback < 0.95);
    }

    #[test]
    fn test_phone_suffix_grading() {
        let comparator = PhoneComparator::new(&SimilarityConfig::default());
        let a = create_test_record("a", "crm", &[("phone", "555-123-4567")]);
        let b = create_test_record("b", "crm", &[("phone", "+1 (555) 123-4567")]);
        let c = create_test_record("c", "crm", &[("phone", "5559994567")]);

        assert_eq!(comparator.compare(&a, &b).value, 1.0);
        assert!((comparator.compare(&a, &c).value - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_phone_tail_counts_characters() {
        let mut config = ResolutionConfig::default();
        config.field_kinds.insert("phone".to_string(), FieldKind::Text);
        let normalizer = Normalizer::new(&config);
        let phone = |id: &str, value: &str| {
            normalizer.normalize(&SourceRecord::new(id, "crm", Utc::now()).with_field("phone", value))
        };

        // '☎' is three bytes; a byte offset would land inside it
        let a = phone("a", "☎☎☎☎ 555-1234");
        let b = phone("b", "☎☎☎☎ 555-9234");
        let comparator = PhoneComparator::new(&config.similarity);

        assert_eq!(comparator.tail("☎☎☎☎ 555-1234"), "☎ 555-1234");
        assert!((comparator.compare(&a, &b).value - 0.3).abs() < 1e-9);
        assert_eq!(comparator.compare(&a, &a).value, 1.0);
    }

    #[test]
    fn test_address_sub_weights() {
        let a = create_test_record(
            "a",
            "crm",
            &[("address_line1", "12 Oak St"), ("city", "Austin"), ("state", "TX"), ("zip_code", "78701")],
        );
        let b = create_test_record(
            "b",
            "crm",
            &[("address_line1", "12 Oak Street"), ("city", "Austin"), ("state", "Texas"), ("zip_code", "78701-1234")],
        );
        assert_eq!(AddressComparator.compare(&a, &b).value, 1.0);

        // Only state on both sides: the rest sit at neutral
        let c = create_test_record("c", "crm", &[("state", "CA")]);
        let d = create_test_record("d", "crm", &[("state", "CA")]);
        let score = AddressComparator.compare(&c, &d);
        assert!(score.compared);
        assert!((score.value - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_missing_fields_are_neutral() {
        let a = create_test_record("a", "crm", &[("last_name", "Smith")]);
        let b = create_test_record("b", "crm", &[]);
        let scorer = SimilarityScorer::new(&ResolutionConfig::default());
        let vector = scorer.compare(&a, &b);

        for component in [Component::Name, Component::Email, Component::Phone, Component::Address] {
            let score = vector.get(component).unwrap();
            assert!(!score.compared);
            assert_eq!(score.value, NEUTRAL_SCORE);
        }
        assert!(vector.get(Component::CrossSystem).unwrap().compared);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let scorer = SimilarityScorer::new(&ResolutionConfig::default());
        let records = vec![
            create_test_record("a", "core_banking", &[("first_name", "John"), ("last_name", "Smith"), ("email", "jsmith@x.com")]),
            create_test_record("b", "salesforce", &[("first_name", "J."), ("last_name", "Smyth"), ("phone", "5551234567")]),
            create_test_record("c", "fiserv", &[("first_name", "Jon"), ("email", "JON.SMITH@y.org"), ("zip_code", "94107")]),
        ];

        for x in &records {
            for y in &records {
                assert_eq!(scorer.compare(x, y), scorer.compare(y, x));
            }
        }
        println!("✅ Similarity symmetric across {} records", records.len());
    }

    #[test]
    fn test_jaro_winkler_is_symmetric_and_total() {
        let mut config = ResolutionConfig::default();
        config.similarity.name_algorithm = NameAlgorithm::JaroWinkler;
        let scorer = SimilarityScorer::new(&config);

        let records = vec![
            create_test_record("a", "core_banking", &[("first_name", "John"), ("last_name", "Smith"), ("email", "jsmith@x.com")]),
            create_test_record("b", "salesforce", &[("first_name", "J."), ("last_name", "Smyth"), ("phone", "5551234567")]),
            create_test_record("c", "fiserv", &[("first_name", "Jon"), ("email", "JON.SMITH@y.org"), ("zip_code", "94107")]),
            create_test_record("d", "fiserv", &[("first_name", "Martha"), ("last_name", "Marhta")]),
            create_test_record("e", "crm", &[]),
        ];
        for x in &records {
            for y in &records {
                let forward = scorer.compare(x, y);
                assert_eq!(forward, scorer.compare(y, x));
                for (_, score) in &forward.scores {
                    assert!((0.0..=1.0).contains(&score.value));
                }
            }
        }

        // Missing on either side stays neutral and uncompared
        let vector = scorer.compare(&records[0], &records[4]);
        for component in [Component::Name, Component::Email, Component::Phone, Component::Address] {
            let score = vector.get(component).unwrap();
            assert!(!score.compared);
            assert_eq!(score.value, NEUTRAL_SCORE);
        }

        let algo = NameAlgorithm::JaroWinkler;
        assert_eq!(string_similarity("MARTHA", "MARTHA", algo), 1.0);
        assert_eq!(string_similarity("", "MARTHA", algo), 0.0);
        assert!((string_similarity("MARTHA", "MARHTA", algo) - 0.9611111).abs() < 1e-6);
        assert_eq!(name_similarity("J", "JOHN", &config.similarity), config.similarity.initial_match_score);
    }
}
