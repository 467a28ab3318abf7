// 🚦 Match decisions - pending → {merged, rejected}
//
// auto_merge pairs are merged by the system as soon as they are scored.
// review pairs wait for a steward; their verdicts are kept as priors and
// override tiering on every later run.

use crate::error::{ResolutionError, Result};
use crate::model::PairKey;
use crate::scoring::{MatchScore, ReviewConfidence, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Merged,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Merged => "merged",
            Outcome::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Outcome> {
        match s {
            "pending" => Some(Outcome::Pending),
            "merged" => Some(Outcome::Merged),
            "rejected" => Some(Outcome::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who moved a decision out of pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    System,
    Steward(String),
}

impl fmt::Display for DecidedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecidedBy::System => write!(f, "system"),
            DecidedBy::Steward(id) => write!(f, "steward:{}", id),
        }
    }
}

/// What a steward can say about a pending pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StewardVerdict {
    Merge,
    Reject,
}

impl StewardVerdict {
    pub fn outcome(&self) -> Outcome {
        match self {
            StewardVerdict::Merge => Outcome::Merged,
            StewardVerdict::Reject => Outcome::Rejected,
        }
    }

    pub fn parse(s: &str) -> Option<StewardVerdict> {
        match s.to_ascii_lowercase().as_str() {
            "merge" | "merged" => Some(StewardVerdict::Merge),
            "reject" | "rejected" => Some(StewardVerdict::Reject),
            _ => None,
        }
    }
}

// ============================================================================
// MATCH DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub pair: PairKey,
    pub tier: Tier,
    pub composite: f64,
    pub outcome: Outcome,
    pub decided_by: Option<DecidedBy>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl MatchDecision {
    /// A fresh pending decision for a scored pair
    pub fn pending(score: &MatchScore) -> Self {
        MatchDecision {
            pair: score.pair.clone(),
            tier: score.tier,
            composite: score.composite,
            outcome: Outcome::Pending,
            decided_by: None,
            decided_at: None,
        }
    }

    /// Pending decision, auto-merged by the system when the tier allows it
    pub fn from_score(score: &MatchScore, now: DateTime<Utc>) -> Result<Self> {
        let mut decision = MatchDecision::pending(score);
        if score.tier == Tier::AutoMerge {
            decision.transition(Outcome::Merged, DecidedBy::System, now)?;
        }
        Ok(decision)
    }

    /// The only legal moves are pending → merged and pending → rejected
    pub fn transition(&mut self, to: Outcome, by: DecidedBy, at: DateTime<Utc>) -> Result<()> {
        let legal = self.outcome == Outcome::Pending && matches!(to, Outcome::Merged | Outcome::Rejected);
        if !legal {
            return Err(ResolutionError::InvalidTransition {
                pair: self.pair.to_string(),
                from: self.outcome.to_string(),
                to: to.to_string(),
            });
        }

        self.outcome = to;
        self.decided_by = Some(by);
        self.decided_at = Some(at);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }
}

/// A steward verdict carried forward across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StewardPrior {
    pub pair: PairKey,
    pub outcome: Outcome,
    pub steward_id: String,
    pub decided_at: DateTime<Utc>,
}

/// A review-tier pair waiting for a steward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub score: MatchScore,
    pub confidence: ReviewConfidence,
    pub run_id: String,
    pub queued_at: DateTime<Utc>,
}

impl PendingReview {
    pub fn pair(&self) -> &PairKey {
        &self.score.pair
    }
}
