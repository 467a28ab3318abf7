// MDM Entity Resolution - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod model;
pub mod config;
pub mod normalizer;     // Canonical field values + content hash
pub mod blocking;       // Candidate pair generation
pub mod similarity;     // Per-field comparators
pub mod scoring;        // Composite score + tiers
pub mod decision;       // pending → merged / rejected
pub mod cluster;        // Union-find + merge-creep guard + cluster identity
pub mod survivorship;   // Golden record resolution
pub mod audit;          // Append-only audit sink
pub mod store;          // SQLite persistence
pub mod engine;         // Run orchestration + steward operations
pub mod ingest;         // Source layout adapters

#[cfg(feature = "fixtures")]
pub mod fixtures;       // Seeded synthetic source extracts

// Re-export commonly used types
pub use error::{ResolutionError, Result};
pub use model::{fields, BlockingKey, FieldKind, NormalizedRecord, PairKey, SourceRecord};
pub use config::{
    BlockingConfig, BlockingStrategy, ComponentWeights, KeyPart, NameAlgorithm, ResolutionConfig,
    SimilarityConfig, SurvivorshipConfig, SurvivorshipRule, TierThresholds,
};
pub use normalizer::Normalizer;
pub use blocking::{compute_blocking_keys, BlockingIndexer, BlockingReport, CandidateSet, StoredBucket};
pub use similarity::{Component, FieldComparator, FieldScore, SimilarityScorer, SimilarityVector};
pub use scoring::{composite_score, evidence_weight, MatchScore, PairScorer, ReviewConfidence, ScoredBatch, Tier};
pub use decision::{DecidedBy, MatchDecision, Outcome, PendingReview, StewardPrior, StewardVerdict};
pub use cluster::{
    Cluster, ClusterBuilder, ConflictStatus, ConflictedMerge, Contradiction, EdgeOutcome, MergeEdge,
};
pub use survivorship::{GoldenField, GoldenRecord, SurvivorshipPolicy, SurvivorshipResolver};
pub use audit::{AuditAction, AuditEntry, AuditSink, AuditSubject, MemoryAuditLog, SqliteAuditLog};
pub use store::{ClusterCommit, ResolutionStore, SqliteStore, UpsertOutcome};
pub use engine::{IngestReport, ResolutionEngine, RunControl, RunReport};
pub use ingest::{read_file, read_records, write_canonical, SourceAdapter, SourceLayout};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
