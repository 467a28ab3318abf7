// 🧱 Blocking Indexer - bound the number of pairwise comparisons
//
// Every strategy buckets records by its key; pairs are emitted only inside a
// bucket. The store keeps the key index, so a run reads just the buckets its
// changed records fall in. Buckets expand in parallel and their pair sets are
// unioned, so a pair surfaced by several strategies is still scored once.

use crate::config::{BlockingStrategy, KeyPart};
use crate::model::{BlockingKey, NormalizedRecord, PairKey};
use crate::normalizer::soundex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

// ============================================================================
// KEY COMPUTATION
// ============================================================================

/// Evaluate one key part against canonical fields
pub fn key_part_value(part: &KeyPart, fields: &BTreeMap<String, String>) -> Option<String> {
    let value = fields.get(part.field())?;
    match part {
        KeyPart::Soundex { .. } => soundex(value),
        KeyPart::Exact { .. } => Some(value.clone()),
        KeyPart::Prefix { len, .. } => {
            let prefix: String = value.chars().take(*len).collect();
            (prefix.chars().count() == *len).then_some(prefix)
        }
        KeyPart::Suffix { len, .. } => {
            let count = value.chars().count();
            if count < *len {
                return None;
            }
            Some(value.chars().skip(count - len).collect())
        }
    }
}

/// Join all key parts; a missing part means no key for this strategy
fn composite_key(parts: &[KeyPart], fields: &BTreeMap<String, String>) -> Option<String> {
    let values: Option<Vec<String>> = parts.iter().map(|p| key_part_value(p, fields)).collect();
    values.map(|v| v.join("|"))
}

/// Blocking keys for one record, one per strategy that applies
pub fn compute_blocking_keys(
    strategies: &[BlockingStrategy],
    fields: &BTreeMap<String, String>,
) -> Vec<BlockingKey> {
    strategies
        .iter()
        .filter_map(|strategy| {
            composite_key(&strategy.keys, fields).map(|value| BlockingKey {
                strategy: strategy.name.clone(),
                value,
            })
        })
        .collect()
}

// ============================================================================
// BLOCKING REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockingReport {
    /// Buckets that produced at least one comparison
    pub buckets: usize,

    /// Oversized buckets that were split by a secondary key
    pub sub_blocked: Vec<String>,

    /// Buckets still oversized after sub-blocking (no pairs emitted)
    pub skipped: Vec<String>,

    /// Pairs emitted before cross-strategy deduplication
    pub raw_pairs: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Deduplicated, canonically ordered pairs
    pub pairs: Vec<PairKey>,
    pub report: BlockingReport,
}

/// One bucket gathered from the store around a changed record. `size` is the
/// stored count; `members` is empty when the bucket was not worth loading.
#[derive(Debug, Clone)]
pub struct StoredBucket<'a> {
    pub key: BlockingKey,
    pub size: usize,
    pub members: Vec<&'a NormalizedRecord>,
}

// ============================================================================
// BLOCKING INDEXER
// ============================================================================

pub struct BlockingIndexer {
    strategies: Vec<BlockingStrategy>,
    max_bucket_size: usize,
}

impl BlockingIndexer {
    pub fn new(strategies: Vec<BlockingStrategy>, max_bucket_size: usize) -> Self {
        BlockingIndexer {
            strategies,
            max_bucket_size,
        }
    }

    fn strategy(&self, name: &str) -> Option<&BlockingStrategy> {
        self.strategies.iter().find(|s| s.name == name)
    }

    /// Whether a stored bucket must be loaded to expand it. Singletons never
    /// pair and an oversized bucket without a secondary key is skipped anyway.
    pub fn needs_members(&self, key: &BlockingKey, size: usize) -> bool {
        match self.strategy(&key.strategy) {
            Some(strategy) => size >= 2 && (size <= self.max_bucket_size || !strategy.sub_block.is_empty()),
            None => false,
        }
    }

    /// Pairs with at least one changed record, drawn from the stored buckets
    /// the changed records belong to. Keys of strategies no longer configured
    /// are ignored.
    pub fn candidate_pairs_in_buckets(
        &self,
        buckets: &[StoredBucket<'_>],
        changed: &HashSet<String>,
    ) -> CandidateSet {
        let per_bucket: Vec<(Vec<PairKey>, BlockingReport)> = buckets
            .par_iter()
            .filter_map(|bucket| {
                let strategy = self.strategy(&bucket.key.strategy)?;
                Some(self.expand_bucket(strategy, bucket, changed))
            })
            .collect();
        merge(per_bucket)
    }

    fn expand_bucket(
        &self,
        strategy: &BlockingStrategy,
        bucket: &StoredBucket<'_>,
        changed: &HashSet<String>,
    ) -> (Vec<PairKey>, BlockingReport) {
        let mut report = BlockingReport::default();
        let mut pairs = Vec::new();
        let size = bucket.size;
        if size < 2 {
            return (pairs, report);
        }
        let label = bucket.key.to_string();

        if size <= self.max_bucket_size {
            report.buckets += 1;
            emit_pairs(&bucket.members, changed, &mut pairs);
            report.raw_pairs = pairs.len();
            return (pairs, report);
        }

        // Pathological key (common surname + common zip): split it
        if strategy.sub_block.is_empty() {
            warn!(
                "Bucket {} has {} records (cap {}) and no secondary key; skipped",
                label, size, self.max_bucket_size
            );
            report.skipped.push(label);
            return (pairs, report);
        }

        warn!(
            "Bucket {} has {} records (cap {}); sub-blocking",
            label, size, self.max_bucket_size
        );
        report.sub_blocked.push(label.clone());

        let mut sub_buckets: BTreeMap<String, Vec<&NormalizedRecord>> = BTreeMap::new();
        for record in bucket.members.iter().copied() {
            if let Some(sub_key) = composite_key(&strategy.sub_block, &record.fields) {
                sub_buckets.entry(sub_key).or_default().push(record);
            }
        }

        for (sub_key, sub_members) in sub_buckets {
            if sub_members.len() < 2 {
                continue;
            }
            if !sub_members.iter().any(|r| changed.contains(&r.record_id)) {
                continue;
            }
            if sub_members.len() > self.max_bucket_size {
                warn!(
                    "Sub-bucket {}/{} still has {} records; skipped",
                    label,
                    sub_key,
                    sub_members.len()
                );
                report.skipped.push(format!("{}/{}", label, sub_key));
                continue;
            }
            report.buckets += 1;
            emit_pairs(&sub_members, changed, &mut pairs);
        }

        report.raw_pairs = pairs.len();
        (pairs, report)
    }
}

/// Union per-bucket results into one deduplicated set
fn merge(parts: Vec<(Vec<PairKey>, BlockingReport)>) -> CandidateSet {
    let mut unique: BTreeSet<PairKey> = BTreeSet::new();
    let mut report = BlockingReport::default();
    for (pairs, part) in parts {
        report.buckets += part.buckets;
        report.raw_pairs += part.raw_pairs;
        report.sub_blocked.extend(part.sub_blocked);
        report.skipped.extend(part.skipped);
        unique.extend(pairs);
    }

    debug!(
        "Blocking: {} buckets, {} raw pairs, {} unique pairs",
        report.buckets,
        report.raw_pairs,
        unique.len()
    );

    CandidateSet {
        pairs: unique.into_iter().collect(),
        report,
    }
}

fn emit_pairs(members: &[&NormalizedRecord], changed: &HashSet<String>, out: &mut Vec<PairKey>) {
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let (a, b) = (&members[i].record_id, &members[j].record_id);
            if a == b {
                continue;
            }
            if !changed.contains(a) && !changed.contains(b) {
                continue;
            }
            out.push(PairKey::new(a.clone(), b.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::model::SourceRecord;
    use crate::normalizer::Normalizer;
    use chrono::Utc;

    fn create_test_record(id: &str, first: &str, last: &str, zip: &str, email: &str) -> SourceRecord {
        SourceRecord::new(id, "salesforce", Utc::now())
            .with_field("first_name", first)
            .with_field("last_name", last)
            .with_field("zip_code", zip)
            .with_field("email", email)
    }

    fn strategy(name: &str, keys: Vec<KeyPart>, sub_block: Vec<KeyPart>) -> BlockingStrategy {
        BlockingStrategy {
            name: name.to_string(),
            keys,
            sub_block,
        }
    }

    fn normalize(strategies: &[BlockingStrategy], records: &[SourceRecord]) -> Vec<NormalizedRecord> {
        let mut config = ResolutionConfig::default();
        config.blocking.strategies = strategies.to_vec();
        Normalizer::new(&config).normalize_all(records)
    }

    /// Every record counts as changed: the pairs a full run would produce
    fn all_pairs(indexer: &BlockingIndexer, records: &[NormalizedRecord]) -> CandidateSet {
        let everyone: HashSet<String> = records.iter().map(|r| r.record_id.clone()).collect();
        indexer.candidate_pairs_in_buckets(&stored_buckets(records, &everyone), &everyone)
    }

    #[test]
    fn test_key_parts() {
        let mut fields = BTreeMap::new();
        fields.insert("last_name".to_string(), "SMITH".to_string());
        fields.insert("phone".to_string(), "5551234567".to_string());

        assert_eq!(key_part_value(&KeyPart::soundex("last_name"), &fields), Some("S530".to_string()));
        assert_eq!(key_part_value(&KeyPart::prefix("last_name", 2), &fields), Some("SM".to_string()));
        assert_eq!(
            key_part_value(&KeyPart::Suffix { field: "phone".into(), len: 4 }, &fields),
            Some("4567".to_string())
        );
        assert_eq!(key_part_value(&KeyPart::exact("zip_code"), &fields), None);
    }

    #[test]
    fn test_missing_key_part_produces_no_key() {
        let strategies = vec![strategy(
            "name_zip",
            vec![KeyPart::soundex("last_name"), KeyPart::exact("zip_code")],
            vec![],
        )];
        let mut fields = BTreeMap::new();
        fields.insert("last_name".to_string(), "SMITH".to_string());

        assert!(compute_blocking_keys(&strategies, &fields).is_empty());

        fields.insert("zip_code".to_string(), "94107".to_string());
        let keys = compute_blocking_keys(&strategies, &fields);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].to_string(), "name_zip:S530|94107");
    }

    #[test]
    fn test_pairs_deduplicated_across_strategies() {
        let strategies = vec![
            strategy("name_zip", vec![KeyPart::soundex("last_name"), KeyPart::exact("zip_code")], vec![]),
            strategy("email", vec![KeyPart::exact("email")], vec![]),
        ];
        let records = normalize(
            &strategies,
            &[
                create_test_record("r2", "John", "Smith", "94107", "js@x.com"),
                create_test_record("r1", "Jon", "Smyth", "94107", "js@x.com"),
                create_test_record("r3", "Ann", "Lee", "10001", "ann@y.com"),
            ],
        );

        let indexer = BlockingIndexer::new(strategies, 50);
        let candidates = all_pairs(&indexer, &records);

        // r1/r2 surfaced by both strategies, scored once
        assert_eq!(candidates.report.raw_pairs, 2);
        assert_eq!(candidates.pairs, vec![PairKey::new("r1", "r2")]);
    }

    #[test]
    fn test_oversized_bucket_is_sub_blocked() {
        let strategies = vec![strategy(
            "zip",
            vec![KeyPart::exact("zip_code")],
            vec![KeyPart::prefix("first_name", 1)],
        )];
        let records = normalize(
            &strategies,
            &[
                create_test_record("a1", "Alice", "Smith", "94107", "a1@x.com"),
                create_test_record("a2", "Alan", "Jones", "94107", "a2@x.com"),
                create_test_record("b1", "Bob", "Brown", "94107", "b1@x.com"),
                create_test_record("b2", "Beth", "Green", "94107", "b2@x.com"),
                create_test_record("c1", "Carl", "White", "94107", "c1@x.com"),
            ],
        );

        let indexer = BlockingIndexer::new(strategies, 3);
        let candidates = all_pairs(&indexer, &records);

        assert_eq!(candidates.report.sub_blocked, vec!["zip:94107".to_string()]);
        assert!(candidates.report.skipped.is_empty());
        assert_eq!(
            candidates.pairs,
            vec![PairKey::new("a1", "a2"), PairKey::new("b1", "b2")]
        );
    }

    #[test]
    fn test_oversized_bucket_without_secondary_key_is_skipped() {
        let strategies = vec![strategy("zip", vec![KeyPart::exact("zip_code")], vec![])];
        let records = normalize(
            &strategies,
            &[
                create_test_record("a1", "Alice", "Smith", "94107", "a1@x.com"),
                create_test_record("a2", "Alan", "Jones", "94107", "a2@x.com"),
                create_test_record("a3", "Amy", "Brown", "94107", "a3@x.com"),
            ],
        );

        let candidates = all_pairs(&BlockingIndexer::new(strategies, 2), &records);
        assert!(candidates.pairs.is_empty());
        assert_eq!(candidates.report.skipped, vec!["zip:94107".to_string()]);
    }

    /// Gather stored buckets the way the engine does: every bucket a changed
    /// record carries, with its full membership
    fn stored_buckets<'a>(records: &'a [NormalizedRecord], changed: &HashSet<String>) -> Vec<StoredBucket<'a>> {
        let mut by_key: BTreeMap<BlockingKey, Vec<&NormalizedRecord>> = BTreeMap::new();
        for record in records {
            for key in &record.blocking_keys {
                by_key.entry(key.clone()).or_default().push(record);
            }
        }
        by_key
            .into_iter()
            .filter(|(_, members)| members.iter().any(|r| changed.contains(&r.record_id)))
            .map(|(key, members)| StoredBucket {
                key,
                size: members.len(),
                members,
            })
            .collect()
    }

    #[test]
    fn test_incremental_only_touches_changed_buckets() {
        let strategies = vec![strategy("zip", vec![KeyPart::exact("zip_code")], vec![])];
        let records = normalize(
            &strategies,
            &[
                create_test_record("a1", "Alice", "Smith", "94107", "a1@x.com"),
                create_test_record("a2", "Alice", "Smith", "94107", "a2@x.com"),
                create_test_record("new", "Alice", "Smith", "94107", "a3@x.com"),
                create_test_record("b1", "Bob", "Brown", "10001", "b1@x.com"),
                create_test_record("b2", "Bob", "Brown", "10001", "b2@x.com"),
            ],
        );

        let changed: HashSet<String> = ["new".to_string()].into_iter().collect();
        let buckets = stored_buckets(&records, &changed);
        assert_eq!(buckets.len(), 1);
        let candidates = BlockingIndexer::new(strategies, 50).candidate_pairs_in_buckets(&buckets, &changed);

        // a1/a2 were already compared in an earlier run; b-bucket untouched
        assert_eq!(
            candidates.pairs,
            vec![PairKey::new("a1", "new"), PairKey::new("a2", "new")]
        );
    }

    #[test]
    fn test_oversized_stored_bucket_is_skipped_without_members() {
        let strategies = vec![
            strategy("zip", vec![KeyPart::exact("zip_code")], vec![]),
            strategy("zip_sub", vec![KeyPart::exact("zip_code")], vec![KeyPart::prefix("first_name", 1)]),
        ];
        let indexer = BlockingIndexer::new(strategies, 2);
        let zip = BlockingKey {
            strategy: "zip".to_string(),
            value: "94107".to_string(),
        };
        let zip_sub = BlockingKey {
            strategy: "zip_sub".to_string(),
            value: "94107".to_string(),
        };
        let retired = BlockingKey {
            strategy: "dropped".to_string(),
            value: "94107".to_string(),
        };

        assert!(!indexer.needs_members(&zip, 1));
        assert!(indexer.needs_members(&zip, 2));
        assert!(!indexer.needs_members(&zip, 900));
        assert!(indexer.needs_members(&zip_sub, 900));
        assert!(!indexer.needs_members(&retired, 2));

        // Counted by the store, never loaded: reported as skipped from its size alone
        let changed: HashSet<String> = ["new".to_string()].into_iter().collect();
        let buckets = vec![
            StoredBucket {
                key: zip,
                size: 900,
                members: Vec::new(),
            },
            StoredBucket {
                key: retired,
                size: 2,
                members: Vec::new(),
            },
        ];
        let candidates = indexer.candidate_pairs_in_buckets(&buckets, &changed);
        assert!(candidates.pairs.is_empty());
        assert_eq!(candidates.report.skipped, vec!["zip:94107".to_string()]);
    }
}
