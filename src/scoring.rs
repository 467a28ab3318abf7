// ⚖️ Composite Scorer & Tiering
//
// composite = Σ w·s / Σ w over the components actually compared for a pair.
// Cross-system is always compared, so the denominator is never empty with
// the reference weights. Renormalizing lets a pair that shares one strong
// field look certain, so auto-merge also needs enough compared weight
// outside cross-system (`min_auto_merge_evidence`).

use crate::config::{ComponentWeights, ResolutionConfig, TierThresholds};
use crate::model::{NormalizedRecord, PairKey};
use crate::similarity::{Component, SimilarityScorer, SimilarityVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Absorbs float noise when summing weights (0.3 + 0.2 vs 0.5)
const EVIDENCE_EPSILON: f64 = 1e-9;

// ============================================================================
// TIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewConfidence {
    /// review ≤ composite < auto_merge
    High,
    /// discard ≤ composite < review
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AutoMerge,
    Review(ReviewConfidence),
    /// Below the discard threshold: never persisted
    Reject,
}

impl Tier {
    pub fn classify(composite: f64, thresholds: &TierThresholds) -> Tier {
        if composite >= thresholds.auto_merge {
            Tier::AutoMerge
        } else if composite >= thresholds.review {
            Tier::Review(ReviewConfidence::High)
        } else if composite >= thresholds.discard {
            Tier::Review(ReviewConfidence::Low)
        } else {
            Tier::Reject
        }
    }

    /// `classify`, except that a pair compared on too little evidence never
    /// auto-merges; it is held for a steward as high-confidence review
    pub fn classify_with_evidence(composite: f64, evidence: f64, thresholds: &TierThresholds) -> Tier {
        match Tier::classify(composite, thresholds) {
            Tier::AutoMerge if evidence + EVIDENCE_EPSILON < thresholds.min_auto_merge_evidence => {
                Tier::Review(ReviewConfidence::High)
            }
            tier => tier,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AutoMerge => "auto_merge",
            Tier::Review(_) => "review",
            Tier::Reject => "reject",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Review(ReviewConfidence::Low) => write!(f, "review (low confidence)"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

// ============================================================================
// MATCH SCORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub pair: PairKey,

    /// Component name → similarity in [0,1] (neutral 0.5 when not compared)
    pub component_scores: BTreeMap<String, f64>,

    /// Components missing on either side, excluded from the composite
    pub excluded: Vec<String>,

    pub composite: f64,

    /// Summed weight of compared components other than cross-system
    #[serde(default)]
    pub evidence: f64,

    pub tier: Tier,
}

/// Weighted average over compared components
pub fn composite_score(vector: &SimilarityVector, weights: &ComponentWeights) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (component, score) in &vector.scores {
        if !score.compared {
            continue;
        }
        let w = weights.get(*component);
        weighted += w * score.value;
        total_weight += w;
    }

    if total_weight <= 0.0 {
        return 0.0;
    }
    (weighted / total_weight).clamp(0.0, 1.0)
}

/// How much of the weight actually rests on compared fields. Cross-system
/// says nothing about whether two records describe the same customer.
pub fn evidence_weight(vector: &SimilarityVector, weights: &ComponentWeights) -> f64 {
    vector
        .scores
        .iter()
        .filter(|(component, score)| score.compared && *component != Component::CrossSystem)
        .map(|(component, _)| weights.get(*component))
        .sum()
}

// ============================================================================
// PAIR SCORER
// ============================================================================

/// Result of scoring a batch of candidate pairs
#[derive(Debug, Clone, Default)]
pub struct ScoredBatch {
    /// Non-discarded scores, ordered by pair
    pub scores: Vec<MatchScore>,

    /// Pairs below the discard threshold (counted only)
    pub discarded: usize,
}

pub struct PairScorer {
    similarity: SimilarityScorer,
    weights: ComponentWeights,
    thresholds: TierThresholds,
}

impl PairScorer {
    pub fn new(config: &ResolutionConfig) -> Self {
        PairScorer {
            similarity: SimilarityScorer::new(config),
            weights: config.weights.clone(),
            thresholds: config.thresholds.clone(),
        }
    }

    pub fn score(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> MatchScore {
        let vector = self.similarity.compare(a, b);
        let composite = composite_score(&vector, &self.weights);
        let evidence = evidence_weight(&vector, &self.weights);

        let mut component_scores = BTreeMap::new();
        let mut excluded = Vec::new();
        for (component, score) in &vector.scores {
            component_scores.insert(component.as_str().to_string(), score.value);
            if !score.compared {
                excluded.push(component.as_str().to_string());
            }
        }

        MatchScore {
            pair: PairKey::new(a.record_id.as_str(), b.record_id.as_str()),
            component_scores,
            excluded,
            composite,
            evidence,
            tier: Tier::classify_with_evidence(composite, evidence, &self.thresholds),
        }
    }

    /// Score pairs in parallel; pairs referencing unknown records are skipped
    pub fn score_pairs(
        &self,
        pairs: &[PairKey],
        records: &HashMap<String, NormalizedRecord>,
    ) -> ScoredBatch {
        let all: Vec<MatchScore> = pairs
            .par_iter()
            .filter_map(|pair| {
                let a = records.get(pair.a())?;
                let b = records.get(pair.b())?;
                Some(self.score(a, b))
            })
            .collect();

        let total = all.len();
        let mut scores: Vec<MatchScore> = all.into_iter().filter(|s| s.tier != Tier::Reject).collect();
        scores.sort_by(|x, y| x.pair.cmp(&y.pair));

        ScoredBatch {
            discarded: total - scores.len(),
            scores,
        }
    }
}
