// 🏆 Survivorship Resolver - one golden record per cluster
//
// Each field is resolved on its own by a configured rule. Ties always fall
// back to the lowest record_id, so the same members give the same golden
// record every time.

use crate::config::{ResolutionConfig, SurvivorshipRule};
use crate::model::NormalizedRecord;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// GOLDEN RECORD
// ============================================================================

/// A resolved value and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenField {
    pub value: String,
    pub source_record_id: String,
    pub source_system: String,
    pub rule: SurvivorshipRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenRecord {
    /// Stable for the life of the cluster (same as its cluster id)
    pub golden_id: String,
    pub member_record_ids: Vec<String>,
    pub fields: BTreeMap<String, GoldenField>,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

impl GoldenRecord {
    /// Same members and same resolved fields (timestamps and version ignored)
    pub fn same_content(&self, other: &GoldenRecord) -> bool {
        self.member_record_ids == other.member_record_ids && self.fields == other.fields
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|f| f.value.as_str())
    }
}

// ============================================================================
// POLICIES
// ============================================================================

/// One member's value for the field being resolved
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub record: &'a NormalizedRecord,
    pub value: &'a str,
    pub trust_rank: usize,
}

pub trait SurvivorshipPolicy: Send + Sync {
    fn rule(&self) -> SurvivorshipRule;

    /// Ordering where the preferred candidate sorts first
    fn prefer(&self, x: &Candidate, y: &Candidate) -> Ordering;

    fn pick<'c, 'a>(&self, candidates: &'c [Candidate<'a>]) -> Option<&'c Candidate<'a>> {
        candidates.iter().min_by(|x, y| {
            self.prefer(x, y)
                .then_with(|| x.record.record_id.cmp(&y.record.record_id))
        })
    }
}

pub struct MostRecentSourceWins;

impl SurvivorshipPolicy for MostRecentSourceWins {
    fn rule(&self) -> SurvivorshipRule {
        SurvivorshipRule::MostRecentSourceWins
    }

    fn prefer(&self, x: &Candidate, y: &Candidate) -> Ordering {
        y.record.ingested_at.cmp(&x.record.ingested_at)
    }
}

pub struct HighestTrustSourceWins;

impl SurvivorshipPolicy for HighestTrustSourceWins {
    fn rule(&self) -> SurvivorshipRule {
        SurvivorshipRule::HighestTrustSourceWins
    }

    fn prefer(&self, x: &Candidate, y: &Candidate) -> Ordering {
        x.trust_rank.cmp(&y.trust_rank)
    }
}

pub struct MostCompleteWins;

impl SurvivorshipPolicy for MostCompleteWins {
    fn rule(&self) -> SurvivorshipRule {
        SurvivorshipRule::MostCompleteWins
    }

    fn prefer(&self, x: &Candidate, y: &Candidate) -> Ordering {
        y.value.chars().count().cmp(&x.value.chars().count())
    }
}

impl SurvivorshipRule {
    pub fn policy(&self) -> &'static dyn SurvivorshipPolicy {
        match self {
            SurvivorshipRule::MostRecentSourceWins => &MostRecentSourceWins,
            SurvivorshipRule::HighestTrustSourceWins => &HighestTrustSourceWins,
            SurvivorshipRule::MostCompleteWins => &MostCompleteWins,
        }
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct SurvivorshipResolver {
    config: ResolutionConfig,
}

impl SurvivorshipResolver {
    pub fn new(config: &ResolutionConfig) -> Self {
        SurvivorshipResolver {
            config: config.clone(),
        }
    }

    /// Resolve every field present on any member. Version/created_at are
    /// filled in by `next_version`.
    pub fn resolve(&self, golden_id: &str, members: &[&NormalizedRecord]) -> GoldenRecord {
        let mut sorted: Vec<&NormalizedRecord> = members.to_vec();
        sorted.sort_by(|x, y| x.record_id.cmp(&y.record_id));

        let field_names: BTreeSet<&str> = sorted
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .collect();

        let mut fields = BTreeMap::new();
        for name in field_names {
            let candidates: Vec<Candidate> = sorted
                .iter()
                .filter_map(|record| {
                    let value = record.get(name).filter(|v| !v.is_empty())?;
                    Some(Candidate {
                        record,
                        value,
                        trust_rank: self.config.trust_rank(&record.source_system),
                    })
                })
                .collect();

            let policy = self.config.survivorship.rule_for(name).policy();
            if let Some(winner) = policy.pick(&candidates) {
                fields.insert(
                    name.to_string(),
                    GoldenField {
                        value: winner.value.to_string(),
                        source_record_id: winner.record.record_id.clone(),
                        source_system: winner.record.source_system.clone(),
                        rule: policy.rule(),
                    },
                );
            }
        }

        GoldenRecord {
            golden_id: golden_id.to_string(),
            member_record_ids: sorted.iter().map(|r| r.record_id.clone()).collect(),
            fields,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
        }
    }

    /// Resolve many clusters in parallel; output follows input order
    pub fn resolve_many(&self, clusters: &[(String, Vec<&NormalizedRecord>)]) -> Vec<GoldenRecord> {
        clusters
            .par_iter()
            .map(|(golden_id, members)| self.resolve(golden_id, members))
            .collect()
    }
}

/// Stamp a freshly resolved record as the next version, or None when it
/// matches the current version
pub fn next_version(
    current: Option<&GoldenRecord>,
    mut resolved: GoldenRecord,
    now: DateTime<Utc>,
) -> Option<GoldenRecord> {
    match current {
        Some(existing) if existing.same_content(&resolved) => None,
        Some(existing) => {
            resolved.version = existing.version + 1;
            resolved.created_at = now;
            Some(resolved)
        }
        None => {
            resolved.version = 1;
            resolved.created_at = now;
            Some(resolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceRecord;
    use crate::normalizer::Normalizer;
    use chrono::TimeZone;

    fn create_test_record(id: &str, system: &str, day: u32, values: &[(&str, &str)]) -> NormalizedRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        let mut record = SourceRecord::new(id, system, at);
        for (field, value) in values {
            record = record.with_field(*field, *value);
        }
        Normalizer::new(&ResolutionConfig::default()).normalize(&record)
    }

    fn members() -> Vec<NormalizedRecord> {
        vec![
            create_test_record(
                "salesforce:001",
                "salesforce",
                20,
                &[("first_name", "Jonathan"), ("email", "jon@new.com"), ("date_of_birth", "1980-01-02")],
            ),
            create_test_record(
                "core_banking:CIF-1",
                "core_banking",
                1,
                &[("first_name", "Jon"), ("email", "jon@old.com"), ("date_of_birth", "1980-01-01"), ("city", "Austin")],
            ),
            create_test_record("fiserv:P-9", "fiserv", 10, &[("first_name", "J."), ("phone", "5125550000")]),
        ]
    }

    #[test]
    fn test_rules_pick_expected_sources() {
        let config = ResolutionConfig::default();
        let resolver = SurvivorshipResolver::new(&config);
        let records = members();
        let refs: Vec<&NormalizedRecord> = records.iter().collect();
        let golden = resolver.resolve("g-1", &refs);

        // email: most recent wins
        assert_eq!(golden.value("email"), Some("jon@new.com"));
        assert_eq!(golden.fields["email"].source_system, "salesforce");

        // date_of_birth: highest trust wins
        assert_eq!(golden.value("date_of_birth"), Some("1980-01-01"));
        assert_eq!(golden.fields["date_of_birth"].source_record_id, "core_banking:CIF-1");

        // first_name: most complete wins
        assert_eq!(golden.value("first_name"), Some("JONATHAN"));
        assert_eq!(golden.fields["first_name"].rule, SurvivorshipRule::MostCompleteWins);

        // a field only one member has
        assert_eq!(golden.value("phone"), Some("5125550000"));
        assert_eq!(golden.member_record_ids[0], "core_banking:CIF-1");
    }

    #[test]
    fn test_tie_breaks_on_record_id() {
        let config = ResolutionConfig::default();
        let resolver = SurvivorshipResolver::new(&config);
        let b = create_test_record("b", "salesforce", 5, &[("city", "Dallas")]);
        let a = create_test_record("a", "salesforce", 5, &[("city", "Austin")]);

        // Same trust, same timestamp: lowest record id
        let golden = resolver.resolve("g", &[&b, &a]);
        assert_eq!(golden.value("city"), Some("AUSTIN"));
    }

    #[test]
    fn test_unknown_system_ranks_last() {
        let resolver = SurvivorshipResolver::new(&ResolutionConfig::default());
        let a = create_test_record("a", "legacy_mainframe", 5, &[("ssn_hash", "aaa")]);
        let b = create_test_record("b", "salesforce", 5, &[("ssn_hash", "bbb")]);
        let golden = resolver.resolve("g", &[&a, &b]);
        assert_eq!(golden.value("ssn_hash"), Some("bbb"));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let resolver = SurvivorshipResolver::new(&ResolutionConfig::default());
        let records = members();
        let forward: Vec<&NormalizedRecord> = records.iter().collect();
        let reversed: Vec<&NormalizedRecord> = records.iter().rev().collect();

        let first = serde_json::to_string(&resolver.resolve("g", &forward)).unwrap();
        let second = serde_json::to_string(&resolver.resolve("g", &reversed)).unwrap();
        assert_eq!(first, second);
        println!("✅ Golden record byte-identical across member order");
    }

    #[test]
    fn test_versioning_only_on_change() {
        let resolver = SurvivorshipResolver::new(&ResolutionConfig::default());
        let records = members();
        let refs: Vec<&NormalizedRecord> = records.iter().collect();
        let now = Utc::now();

        let v1 = next_version(None, resolver.resolve("g", &refs), now).unwrap();
        assert_eq!(v1.version, 1);

        assert!(next_version(Some(&v1), resolver.resolve("g", &refs), now).is_none());

        let v2 = next_version(Some(&v1), resolver.resolve("g", &refs[..2]), now).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.golden_id, "g");
    }
}
