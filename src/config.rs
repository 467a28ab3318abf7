// ⚙️ Resolution configuration - rules as data
// Weights, thresholds, trust ranking, blocking keys and survivorship rules
// are all supplied externally (JSON). Defaults are the reference values.

use crate::error::{ResolutionError, Result};
use crate::model::{fields, FieldKind};
use crate::similarity::Component;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ============================================================================
// COMPONENT WEIGHTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentWeights {
    pub name: f64,
    pub email: f64,
    pub phone: f64,
    pub address: f64,
    pub cross_system: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        ComponentWeights {
            name: 0.30,
            email: 0.25,
            phone: 0.20,
            address: 0.15,
            cross_system: 0.10,
        }
    }
}

impl ComponentWeights {
    pub fn get(&self, component: Component) -> f64 {
        match component {
            Component::Name => self.name,
            Component::Email => self.email,
            Component::Phone => self.phone,
            Component::Address => self.address,
            Component::CrossSystem => self.cross_system,
        }
    }

    pub fn sum(&self) -> f64 {
        Component::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

// ============================================================================
// TIER THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// composite >= auto_merge → merged without a steward
    pub auto_merge: f64,

    /// composite >= review → high-confidence review
    pub review: f64,

    /// composite < discard → dropped, never persisted
    pub discard: f64,

    /// Summed weight of compared components, cross-system excluded, that a
    /// pair needs before it may auto-merge. Thinner pairs go to review.
    pub min_auto_merge_evidence: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        TierThresholds {
            auto_merge: 0.92,
            review: 0.75,
            discard: 0.30,
            min_auto_merge_evidence: 0.50,
        }
    }
}

// ============================================================================
// SIMILARITY SETTINGS
// ============================================================================

/// Edit-distance family used for names and email local parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameAlgorithm {
    /// Normalized Levenshtein with a Winkler-style common-prefix boost
    PrefixWeightedLevenshtein,
    /// strsim's Jaro-Winkler
    JaroWinkler,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub name_algorithm: NameAlgorithm,

    /// Score for "J" vs "JOHN"
    pub initial_match_score: f64,

    /// Share of the email fallback score given to a matching domain
    pub email_domain_weight: f64,

    /// Non-identical emails never score above this
    pub email_fallback_cap: f64,

    /// Digits compared for phone numbers
    pub phone_digits: usize,

    pub same_system_score: f64,
    pub cross_system_score: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        SimilarityConfig {
            name_algorithm: NameAlgorithm::PrefixWeightedLevenshtein,
            initial_match_score: 0.8,
            email_domain_weight: 0.4,
            email_fallback_cap: 0.95,
            phone_digits: 10,
            same_system_score: 1.0,
            cross_system_score: 0.8,
        }
    }
}

// ============================================================================
// BLOCKING STRATEGIES
// ============================================================================

/// One component of a blocking key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyPart {
    Soundex { field: String },
    Exact { field: String },
    Prefix { field: String, len: usize },
    Suffix { field: String, len: usize },
}

impl KeyPart {
    pub fn field(&self) -> &str {
        match self {
            KeyPart::Soundex { field }
            | KeyPart::Exact { field }
            | KeyPart::Prefix { field, .. }
            | KeyPart::Suffix { field, .. } => field,
        }
    }

    pub fn soundex(field: &str) -> Self {
        KeyPart::Soundex { field: field.to_string() }
    }

    pub fn exact(field: &str) -> Self {
        KeyPart::Exact { field: field.to_string() }
    }

    pub fn prefix(field: &str, len: usize) -> Self {
        KeyPart::Prefix { field: field.to_string(), len }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingStrategy {
    pub name: String,

    /// Primary key parts, all required
    pub keys: Vec<KeyPart>,

    /// Secondary key parts used to split an oversized bucket
    #[serde(default)]
    pub sub_block: Vec<KeyPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingConfig {
    pub strategies: Vec<BlockingStrategy>,
    pub max_bucket_size: usize,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        BlockingConfig {
            strategies: vec![
                BlockingStrategy {
                    name: "name_zip".to_string(),
                    keys: vec![KeyPart::soundex(fields::LAST_NAME), KeyPart::exact(fields::ZIP_CODE)],
                    sub_block: vec![KeyPart::prefix(fields::FIRST_NAME, 1)],
                },
                BlockingStrategy {
                    name: "name_dob".to_string(),
                    keys: vec![
                        KeyPart::soundex(fields::LAST_NAME),
                        KeyPart::exact(fields::DATE_OF_BIRTH),
                    ],
                    sub_block: vec![KeyPart::prefix(fields::FIRST_NAME, 1)],
                },
                BlockingStrategy {
                    name: "email".to_string(),
                    keys: vec![KeyPart::exact(fields::EMAIL)],
                    sub_block: vec![],
                },
                BlockingStrategy {
                    name: "phone".to_string(),
                    keys: vec![KeyPart::exact(fields::PHONE)],
                    sub_block: vec![KeyPart::soundex(fields::LAST_NAME)],
                },
            ],
            max_bucket_size: 200,
        }
    }
}

// ============================================================================
// SURVIVORSHIP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorshipRule {
    MostRecentSourceWins,
    HighestTrustSourceWins,
    MostCompleteWins,
}

impl SurvivorshipRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurvivorshipRule::MostRecentSourceWins => "most_recent_source_wins",
            SurvivorshipRule::HighestTrustSourceWins => "highest_trust_source_wins",
            SurvivorshipRule::MostCompleteWins => "most_complete_wins",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurvivorshipConfig {
    pub default_rule: SurvivorshipRule,
    pub per_field: BTreeMap<String, SurvivorshipRule>,
}

impl Default for SurvivorshipConfig {
    fn default() -> Self {
        let mut per_field = BTreeMap::new();
        per_field.insert(fields::EMAIL.to_string(), SurvivorshipRule::MostRecentSourceWins);
        per_field.insert(fields::PHONE.to_string(), SurvivorshipRule::MostRecentSourceWins);
        per_field.insert(fields::FIRST_NAME.to_string(), SurvivorshipRule::MostCompleteWins);
        per_field.insert(fields::DATE_OF_BIRTH.to_string(), SurvivorshipRule::HighestTrustSourceWins);
        per_field.insert(fields::SSN_HASH.to_string(), SurvivorshipRule::HighestTrustSourceWins);

        SurvivorshipConfig {
            default_rule: SurvivorshipRule::HighestTrustSourceWins,
            per_field,
        }
    }
}

impl SurvivorshipConfig {
    pub fn rule_for(&self, field: &str) -> SurvivorshipRule {
        self.per_field.get(field).copied().unwrap_or(self.default_rule)
    }
}

// ============================================================================
// RESOLUTION CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub weights: ComponentWeights,
    pub thresholds: TierThresholds,
    pub similarity: SimilarityConfig,
    pub blocking: BlockingConfig,
    pub survivorship: SurvivorshipConfig,

    /// Source systems, most trusted first
    pub trust_ranking: Vec<String>,

    /// Fields whose disagreement blocks a transitive union
    pub contradiction_fields: Vec<String>,

    /// Overrides for FieldKind::for_field
    pub field_kinds: BTreeMap<String, FieldKind>,

    /// Attempts per cluster commit before the run fails
    pub commit_attempts: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        ResolutionConfig {
            weights: ComponentWeights::default(),
            thresholds: TierThresholds::default(),
            similarity: SimilarityConfig::default(),
            blocking: BlockingConfig::default(),
            survivorship: SurvivorshipConfig::default(),
            trust_ranking: vec![
                "core_banking".to_string(),
                "fiserv".to_string(),
                "salesforce".to_string(),
            ],
            contradiction_fields: vec![
                fields::DATE_OF_BIRTH.to_string(),
                fields::SSN_HASH.to_string(),
            ],
            field_kinds: BTreeMap::new(),
            commit_attempts: 3,
        }
    }
}

impl ResolutionConfig {
    /// Load and validate configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ResolutionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        for component in Component::ALL {
            let w = self.weights.get(component);
            if !(0.0..=1.0).contains(&w) {
                return Err(ResolutionError::Config(format!(
                    "weight for {} must be in [0,1], got {}",
                    component.as_str(),
                    w
                )));
            }
        }

        let sum = self.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ResolutionError::Config(format!(
                "component weights must sum to 1.0, got {:.6}",
                sum
            )));
        }

        let t = &self.thresholds;
        if !(0.0 <= t.discard && t.discard <= t.review && t.review <= t.auto_merge && t.auto_merge <= 1.0) {
            return Err(ResolutionError::Config(format!(
                "thresholds must satisfy 0 <= discard ({}) <= review ({}) <= auto_merge ({}) <= 1",
                t.discard, t.review, t.auto_merge
            )));
        }

        if !(0.0..=1.0).contains(&t.min_auto_merge_evidence) {
            return Err(ResolutionError::Config(format!(
                "min_auto_merge_evidence must be in [0,1], got {}",
                t.min_auto_merge_evidence
            )));
        }

        if self.blocking.strategies.is_empty() {
            return Err(ResolutionError::Config("at least one blocking strategy is required".into()));
        }
        for strategy in &self.blocking.strategies {
            if strategy.keys.is_empty() {
                return Err(ResolutionError::Config(format!(
                    "blocking strategy '{}' has no key parts",
                    strategy.name
                )));
            }
        }
        if self.blocking.max_bucket_size < 2 {
            return Err(ResolutionError::Config("max_bucket_size must be at least 2".into()));
        }

        if self.similarity.phone_digits == 0 {
            return Err(ResolutionError::Config("phone_digits must be positive".into()));
        }

        if self.commit_attempts == 0 {
            return Err(ResolutionError::Config("commit_attempts must be at least 1".into()));
        }

        Ok(())
    }

    pub fn kind_of(&self, field: &str) -> FieldKind {
        self.field_kinds
            .get(field)
            .copied()
            .unwrap_or_else(|| FieldKind::for_field(field))
    }

    /// Position in the trust ranking (0 = most trusted); unknown systems rank last
    pub fn trust_rank(&self, source_system: &str) -> usize {
        self.trust_ranking
            .iter()
            .position(|s| s == source_system)
            .unwrap_or(self.trust_ranking.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResolutionConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ResolutionConfig::from_json_str(
            r#"{ "thresholds": { "auto_merge": 0.95 }, "trust_ranking": ["fiserv"] }"#,
        )
        .unwrap();

        assert_eq!(config.thresholds.auto_merge, 0.95);
        assert_eq!(config.thresholds.review, 0.75);
        assert_eq!(config.thresholds.min_auto_merge_evidence, 0.50);
        assert_eq!(config.trust_rank("fiserv"), 0);
        assert_eq!(config.trust_rank("salesforce"), 1);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let result = ResolutionConfig::from_json_str(r#"{ "weights": { "name": 0.5 } }"#);
        assert!(matches!(result, Err(ResolutionError::Config(_))));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = ResolutionConfig::default();
        config.thresholds.review = 0.95;
        assert!(config.validate().is_err());

        let mut config = ResolutionConfig::default();
        config.thresholds.min_auto_merge_evidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blocking_strategy_json() {
        let json = r#"{
            "blocking": {
                "max_bucket_size": 10,
                "strategies": [
                    { "name": "zip", "keys": [ { "kind": "exact", "field": "zip_code" } ] },
                    { "name": "initial", "keys": [ { "kind": "prefix", "field": "last_name", "len": 2 } ],
                      "sub_block": [ { "kind": "soundex", "field": "first_name" } ] }
                ]
            }
        }"#;
        let config = ResolutionConfig::from_json_str(json).unwrap();
        assert_eq!(config.blocking.strategies.len(), 2);
        assert_eq!(config.blocking.strategies[1].keys[0], KeyPart::prefix("last_name", 2));
        assert_eq!(config.blocking.strategies[1].sub_block[0].field(), "first_name");
    }

    #[test]
    fn test_survivorship_rule_lookup() {
        let config = SurvivorshipConfig::default();
        assert_eq!(config.rule_for("email"), SurvivorshipRule::MostRecentSourceWins);
        assert_eq!(config.rule_for("city"), SurvivorshipRule::HighestTrustSourceWins);
    }
}
