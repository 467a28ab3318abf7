// 🔁 Resolution Engine - ingest, resolve, steward operations, queries
//
// A run: changed records → blocking → scoring/tiering → decisions → cluster
// rebuild of the touched clusters → survivorship → per-cluster commits.
// Every score, decision and cluster change is audited before it is acted on.

use crate::audit::{replay_merge_edges, AuditAction, AuditEntry, AuditSink, AuditSubject, ScoreSnapshot};
use crate::blocking::{BlockingIndexer, BlockingReport, CandidateSet, StoredBucket};
use crate::cluster::{
    assign_identities, edge_order, Cluster, ClusterBuilder, ConflictStatus, ConflictedMerge, EdgeOutcome,
    IdentityPlan, MergeEdge, UnionFind,
};
use crate::config::ResolutionConfig;
use crate::decision::{DecidedBy, MatchDecision, Outcome, PendingReview, StewardPrior, StewardVerdict};
use crate::error::{ResolutionError, Result};
use crate::model::{NormalizedRecord, PairKey, SourceRecord};
use crate::normalizer::Normalizer;
use crate::scoring::{PairScorer, Tier};
use crate::store::{ClusterCommit, ResolutionStore, UpsertOutcome};
use crate::survivorship::{next_version, GoldenRecord, SurvivorshipResolver};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SYSTEM_ACTOR: &str = "system";

// ============================================================================
// RUN CONTROL & REPORTS
// ============================================================================

/// Shared cancellation flag, checked between cluster commits
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag (e.g. one flipped by a signal handler)
    pub fn with_flag(flag: Arc<AtomicBool>) -> Self {
        RunControl { cancelled: flag }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    /// Redelivered with identical canonical content
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    /// Empty when there was nothing to do
    pub run_id: String,
    pub changed_records: usize,
    pub candidate_pairs: usize,
    pub scored_pairs: usize,
    pub discarded_pairs: usize,
    pub auto_merged: usize,
    pub queued_for_review: usize,
    pub priors_applied: usize,
    pub edges_dropped: usize,
    pub conflicts_held: usize,
    pub commits: usize,
    pub clusters_written: usize,
    pub clusters_retired: usize,
    pub golden_versions: usize,
    pub blocking: BlockingReport,
    pub cancelled: bool,
}

// ============================================================================
// RECLUSTER WORK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityMode {
    /// Majority rule against prior membership
    Majority,
    /// Steward split: every piece gets a new id unless nothing actually split
    FreshOnSplit,
}

/// Input to one cluster rebuild
struct Recluster {
    priors: Vec<Cluster>,
    seeds: Vec<(BTreeSet<String>, Vec<MergeEdge>)>,
    new_edges: Vec<MergeEdge>,
    forced_edges: Vec<MergeEdge>,
    vetted: HashSet<PairKey>,
    identity: IdentityMode,
}

impl Recluster {
    fn from_clusters(clusters: Vec<Cluster>) -> Self {
        let seeds = clusters
            .iter()
            .map(|c| (c.members.clone(), c.edges.clone()))
            .collect();
        let vetted = clusters
            .iter()
            .flat_map(|c| c.edges.iter().map(|e| e.pair.clone()))
            .collect();
        Recluster {
            priors: clusters,
            seeds,
            new_edges: Vec::new(),
            forced_edges: Vec::new(),
            vetted,
            identity: IdentityMode::Majority,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ResolutionEngine<S: ResolutionStore, A: AuditSink> {
    config: ResolutionConfig,
    normalizer: Normalizer,
    indexer: BlockingIndexer,
    scorer: PairScorer,
    resolver: SurvivorshipResolver,
    store: S,
    audit: A,
}

impl<S: ResolutionStore, A: AuditSink> ResolutionEngine<S, A> {
    pub fn new(config: ResolutionConfig, store: S, audit: A) -> Result<Self> {
        config.validate()?;
        Ok(ResolutionEngine {
            normalizer: Normalizer::new(&config),
            indexer: BlockingIndexer::new(config.blocking.strategies.clone(), config.blocking.max_bucket_size),
            scorer: PairScorer::new(&config),
            resolver: SurvivorshipResolver::new(&config),
            config,
            store,
            audit,
        })
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    pub fn into_parts(self) -> (S, A) {
        (self.store, self.audit)
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Store new or changed records; redelivered unchanged records are ignored
    pub fn ingest(&mut self, records: &[SourceRecord]) -> Result<IngestReport> {
        let normalized = self.normalizer.normalize_all(records);
        let batch_id = Uuid::new_v4().to_string();
        let mut report = IngestReport::default();

        for (source, norm) in records.iter().zip(&normalized) {
            let change = match self.store.upsert_record(source, norm)? {
                UpsertOutcome::Unchanged => {
                    report.unchanged += 1;
                    continue;
                }
                UpsertOutcome::Inserted => {
                    report.inserted += 1;
                    "inserted"
                }
                UpsertOutcome::Updated => {
                    report.updated += 1;
                    "updated"
                }
            };

            self.record(
                AuditEntry::new(
                    &batch_id,
                    AuditSubject::Record(source.record_id.clone()),
                    AuditAction::RecordIngested,
                    SYSTEM_ACTOR,
                )
                .with_detail(json!({
                    "source_system": source.source_system,
                    "content_hash": norm.content_hash,
                    "change": change,
                })),
            )?;
        }

        info!(
            "Ingested {} records: {} new, {} updated, {} unchanged",
            records.len(),
            report.inserted,
            report.updated,
            report.unchanged
        );
        Ok(report)
    }

    // ========================================================================
    // RESOLVE
    // ========================================================================

    /// Resolve every record changed since the last completed run
    pub fn resolve(&mut self, control: &RunControl) -> Result<RunReport> {
        let changed = self.store.changed_record_ids()?;
        if changed.is_empty() {
            info!("No changed records; nothing to resolve");
            return Ok(RunReport::default());
        }
        if control.is_cancelled() {
            return Ok(RunReport {
                changed_records: changed.len(),
                cancelled: true,
                ..Default::default()
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut report = RunReport {
            run_id: run_id.clone(),
            changed_records: changed.len(),
            ..Default::default()
        };
        info!("Run {}: resolving {} changed records", run_id, changed.len());

        let changed_set: HashSet<String> = changed.iter().cloned().collect();
        let changed_btree: BTreeSet<String> = changed.iter().cloned().collect();
        let (candidates, mut records) = self.gather_candidates(&changed_btree, &changed_set)?;
        report.candidate_pairs = candidates.pairs.len();
        report.blocking = candidates.report.clone();

        // 1. Clusters holding changed records lose their system edges to those records
        let mut touched: BTreeMap<String, Cluster> = BTreeMap::new();
        for mut cluster in self.store.active_clusters_for(&changed_btree)? {
            let (dropped, kept): (Vec<MergeEdge>, Vec<MergeEdge>) = cluster.edges.drain(..).partition(|e| {
                !e.is_steward() && (changed_set.contains(e.pair.a()) || changed_set.contains(e.pair.b()))
            });
            for edge in &dropped {
                self.record(
                    AuditEntry::new(&run_id, AuditSubject::Pair(edge.pair.clone()), AuditAction::EdgeDropped, SYSTEM_ACTOR)
                        .with_score(self.edge_snapshot(edge))
                        .with_detail(json!({ "cluster_id": cluster.cluster_id, "reason": "record_changed" })),
                )?;
            }
            report.edges_dropped += dropped.len();
            cluster.edges = kept;
            touched.insert(cluster.cluster_id.clone(), cluster);
        }

        // 2. Score and decide
        let batch = self.scorer.score_pairs(&candidates.pairs, &records);
        report.scored_pairs = batch.scores.len() + batch.discarded;
        report.discarded_pairs = batch.discarded;

        for review in self.store.pending_reviews()? {
            let pair = review.pair();
            if changed_set.contains(pair.a()) || changed_set.contains(pair.b()) {
                self.store.remove_review(pair)?;
            }
        }

        let mut new_edges = Vec::new();
        let mut forced_edges = Vec::new();
        let mut vetted: HashSet<PairKey> = HashSet::new();

        for score in &batch.scores {
            let snapshot = ScoreSnapshot::from(score);
            self.record(
                AuditEntry::new(&run_id, AuditSubject::Pair(score.pair.clone()), AuditAction::ScoreComputed, SYSTEM_ACTOR)
                    .with_score(snapshot.clone())
                    .with_detail(json!({ "excluded": score.excluded, "evidence": score.evidence })),
            )?;
            vetted.insert(score.pair.clone());

            // A steward verdict outranks the tier
            if let Some(prior) = self.store.prior(&score.pair)? {
                report.priors_applied += 1;
                let actor = DecidedBy::Steward(prior.steward_id.clone());
                let action = match prior.outcome {
                    Outcome::Merged => AuditAction::DecisionMerged,
                    _ => AuditAction::DecisionRejected,
                };
                self.record(
                    AuditEntry::new(&run_id, AuditSubject::Pair(score.pair.clone()), action, &actor.to_string())
                        .with_score(snapshot)
                        .with_detail(json!({ "source": "steward_prior" })),
                )?;

                if prior.outcome == Outcome::Merged {
                    let edge = MergeEdge {
                        pair: score.pair.clone(),
                        composite: score.composite,
                        decided_by: actor,
                    };
                    if self.is_confirmed_conflict(&score.pair)? {
                        forced_edges.push(edge);
                    } else {
                        new_edges.push(edge);
                    }
                }
                continue;
            }

            let decision = MatchDecision::from_score(score, now)?;
            match decision.outcome {
                Outcome::Merged => {
                    self.record(
                        AuditEntry::new(&run_id, AuditSubject::Pair(score.pair.clone()), AuditAction::DecisionMerged, SYSTEM_ACTOR)
                            .with_score(snapshot),
                    )?;
                    report.auto_merged += 1;
                    new_edges.push(MergeEdge {
                        pair: score.pair.clone(),
                        composite: score.composite,
                        decided_by: DecidedBy::System,
                    });
                }
                _ => {
                    let confidence = match score.tier {
                        Tier::Review(confidence) => confidence,
                        _ => continue,
                    };
                    self.store.upsert_review(&PendingReview {
                        score: score.clone(),
                        confidence,
                        run_id: run_id.clone(),
                        queued_at: now,
                    })?;
                    report.queued_for_review += 1;
                }
            }
        }

        // 3. Clusters reached through the new edges
        let endpoints: BTreeSet<String> = new_edges
            .iter()
            .chain(&forced_edges)
            .flat_map(|e| [e.pair.a().to_string(), e.pair.b().to_string()])
            .filter(|id| !touched.values().any(|c| c.contains(id)))
            .collect();
        for cluster in self.store.active_clusters_for(&endpoints)? {
            touched.entry(cluster.cluster_id.clone()).or_insert(cluster);
        }

        let mut work = Recluster::from_clusters(touched.into_values().collect());
        work.vetted.extend(vetted);
        work.vetted.extend(new_edges.iter().chain(&forced_edges).map(|e| e.pair.clone()));
        work.new_edges = new_edges;
        work.forced_edges = forced_edges;

        self.fill_records(&work, &mut records)?;
        self.recluster(&run_id, work, &records, Some(control), &mut report)?;

        if report.cancelled {
            info!("Run {} cancelled; committed clusters kept, changes will be redone", run_id);
            return Ok(report);
        }

        self.store.mark_clean(&changed)?;
        info!(
            "Run {} complete: {} scored, {} discarded, {} auto-merged, {} queued, {} conflicts, {} golden versions",
            run_id,
            report.scored_pairs,
            report.discarded_pairs,
            report.auto_merged,
            report.queued_for_review,
            report.conflicts_held,
            report.golden_versions
        );
        Ok(report)
    }

    // ========================================================================
    // STEWARD OPERATIONS
    // ========================================================================

    /// Apply a steward verdict to a pending review
    pub fn decide(&mut self, pair: &PairKey, verdict: StewardVerdict, steward_id: &str) -> Result<MatchDecision> {
        let review = self
            .store
            .pending_review(pair)?
            .ok_or_else(|| ResolutionError::NotFound(format!("pending review {}", pair)))?;

        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let by = DecidedBy::Steward(steward_id.to_string());

        let mut decision = MatchDecision::pending(&review.score);
        decision.transition(verdict.outcome(), by.clone(), now)?;

        let action = match verdict {
            StewardVerdict::Merge => AuditAction::DecisionMerged,
            StewardVerdict::Reject => AuditAction::DecisionRejected,
        };
        self.record(
            AuditEntry::new(&run_id, AuditSubject::Pair(pair.clone()), action, &by.to_string())
                .with_score(ScoreSnapshot::from(&review.score)),
        )?;

        self.store.save_prior(&StewardPrior {
            pair: pair.clone(),
            outcome: decision.outcome,
            steward_id: steward_id.to_string(),
            decided_at: now,
        })?;
        self.store.remove_review(pair)?;
        info!("Steward {} decided {} on {}", steward_id, decision.outcome, pair);

        if verdict == StewardVerdict::Merge {
            let edge = MergeEdge {
                pair: pair.clone(),
                composite: review.score.composite,
                decided_by: by,
            };
            let mut work = self.work_around(pair)?;
            work.vetted.insert(pair.clone());
            work.new_edges.push(edge);
            let records = self.load_records(&work)?;
            let mut report = RunReport::default();
            self.recluster(&run_id, work, &records, None, &mut report)?;
        }

        Ok(decision)
    }

    /// Force a held union through
    pub fn confirm_conflict(&mut self, conflict_id: &str, steward_id: &str) -> Result<ConflictedMerge> {
        let mut conflict = self.open_conflict(conflict_id, ConflictStatus::Confirmed)?;
        let run_id = Uuid::new_v4().to_string();
        let by = DecidedBy::Steward(steward_id.to_string());

        self.record(
            AuditEntry::new(&run_id, AuditSubject::Pair(conflict.edge.pair.clone()), AuditAction::ConflictConfirmed, &by.to_string())
                .with_score(self.edge_snapshot(&conflict.edge))
                .with_detail(json!({ "conflict_id": conflict.conflict_id })),
        )?;

        conflict.status = ConflictStatus::Confirmed;
        conflict.resolved_by = Some(steward_id.to_string());
        self.store.save_conflict(&conflict)?;
        self.store.save_prior(&StewardPrior {
            pair: conflict.edge.pair.clone(),
            outcome: Outcome::Merged,
            steward_id: steward_id.to_string(),
            decided_at: Utc::now(),
        })?;

        let edge = MergeEdge {
            decided_by: by,
            ..conflict.edge.clone()
        };
        let mut work = self.work_around(&edge.pair)?;
        work.forced_edges.push(edge);
        let records = self.load_records(&work)?;
        let mut report = RunReport::default();
        self.recluster(&run_id, work, &records, None, &mut report)?;

        info!("Steward {} confirmed conflict {}", steward_id, conflict_id);
        Ok(conflict)
    }

    /// Keep a held union apart for good
    pub fn reject_conflict(&mut self, conflict_id: &str, steward_id: &str) -> Result<ConflictedMerge> {
        let mut conflict = self.open_conflict(conflict_id, ConflictStatus::Rejected)?;
        let run_id = Uuid::new_v4().to_string();
        let actor = DecidedBy::Steward(steward_id.to_string()).to_string();

        self.record(
            AuditEntry::new(&run_id, AuditSubject::Pair(conflict.edge.pair.clone()), AuditAction::ConflictRejected, &actor)
                .with_score(self.edge_snapshot(&conflict.edge))
                .with_detail(json!({ "conflict_id": conflict.conflict_id })),
        )?;

        conflict.status = ConflictStatus::Rejected;
        conflict.resolved_by = Some(steward_id.to_string());
        self.store.save_conflict(&conflict)?;
        self.store.save_prior(&StewardPrior {
            pair: conflict.edge.pair.clone(),
            outcome: Outcome::Rejected,
            steward_id: steward_id.to_string(),
            decided_at: Utc::now(),
        })?;

        info!("Steward {} rejected conflict {}", steward_id, conflict_id);
        Ok(conflict)
    }

    /// Reverse one merge inside a cluster. The cluster's edges are rebuilt
    /// from the audit log; scores are not recomputed. Returns the ids of the
    /// resulting clusters.
    pub fn unmerge(&mut self, cluster_id: &str, pair: &PairKey, steward_id: &str) -> Result<Vec<String>> {
        let cluster = self
            .store
            .cluster(cluster_id)?
            .filter(|c| !c.retired)
            .ok_or_else(|| ResolutionError::NotFound(format!("active cluster {}", cluster_id)))?;

        let history = self.audit.pair_entries_among(&cluster.members)?;
        let edges = replay_merge_edges(&history, &cluster.members);
        let Some(reversed) = edges.iter().find(|e| &e.pair == pair).cloned() else {
            return Err(ResolutionError::NotFound(format!("merge {} in cluster {}", pair, cluster_id)));
        };

        let run_id = Uuid::new_v4().to_string();
        let actor = DecidedBy::Steward(steward_id.to_string()).to_string();
        self.record(
            AuditEntry::new(&run_id, AuditSubject::Pair(pair.clone()), AuditAction::MergeReversed, &actor)
                .with_score(self.edge_snapshot(&reversed))
                .with_detail(json!({ "cluster_id": cluster_id })),
        )?;
        self.store.save_prior(&StewardPrior {
            pair: pair.clone(),
            outcome: Outcome::Rejected,
            steward_id: steward_id.to_string(),
            decided_at: Utc::now(),
        })?;

        let remaining: Vec<MergeEdge> = edges.into_iter().filter(|e| &e.pair != pair).collect();
        let work = Recluster {
            vetted: remaining.iter().map(|e| e.pair.clone()).collect(),
            seeds: vec![(cluster.members.clone(), remaining)],
            priors: vec![cluster],
            new_edges: Vec::new(),
            forced_edges: Vec::new(),
            identity: IdentityMode::FreshOnSplit,
        };
        let records = self.load_records(&work)?;
        let mut report = RunReport::default();
        let ids = self.recluster(&run_id, work, &records, None, &mut report)?;

        info!("Steward {} reversed {} in {}: {} resulting clusters", steward_id, pair, cluster_id, ids.len());
        Ok(ids)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn golden(&self, golden_id: &str) -> Result<Option<GoldenRecord>> {
        self.store.golden(golden_id)
    }

    pub fn golden_for_record(&self, record_id: &str) -> Result<Option<GoldenRecord>> {
        self.store.golden_for_record(record_id)
    }

    pub fn golden_history(&self, golden_id: &str) -> Result<Vec<GoldenRecord>> {
        self.store.golden_history(golden_id)
    }

    pub fn current_goldens(&self) -> Result<Vec<GoldenRecord>> {
        self.store.current_goldens()
    }

    pub fn audit_since(&self, sequence: u64) -> Result<Vec<AuditEntry>> {
        self.audit.entries_since(sequence)
    }

    pub fn pending_reviews(&self) -> Result<Vec<PendingReview>> {
        self.store.pending_reviews()
    }

    pub fn open_conflicts(&self) -> Result<Vec<ConflictedMerge>> {
        self.store.open_conflicts()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Append to the audit sink; any sink failure is fatal
    fn record(&mut self, entry: AuditEntry) -> Result<u64> {
        self.audit.append(entry).map_err(|e| match e {
            ResolutionError::AuditUnavailable(_) => e,
            other => ResolutionError::AuditUnavailable(other.to_string()),
        })
    }

    fn edge_snapshot(&self, edge: &MergeEdge) -> ScoreSnapshot {
        ScoreSnapshot {
            composite: edge.composite,
            tier: Tier::classify(edge.composite, &self.config.thresholds),
            component_scores: BTreeMap::new(),
        }
    }

    fn is_confirmed_conflict(&self, pair: &PairKey) -> Result<bool> {
        Ok(matches!(
            self.store.conflict(&pair.to_string())?,
            Some(c) if c.status == ConflictStatus::Confirmed
        ))
    }

    fn open_conflict(&self, conflict_id: &str, target: ConflictStatus) -> Result<ConflictedMerge> {
        let conflict = self
            .store
            .conflict(conflict_id)?
            .ok_or_else(|| ResolutionError::NotFound(format!("conflict {}", conflict_id)))?;
        if conflict.status != ConflictStatus::Open {
            return Err(ResolutionError::InvalidTransition {
                pair: conflict.edge.pair.to_string(),
                from: conflict.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        Ok(conflict)
    }

    /// Rebuild input seeded with the clusters currently holding either record
    fn work_around(&self, pair: &PairKey) -> Result<Recluster> {
        let ends: BTreeSet<String> = [pair.a().to_string(), pair.b().to_string()].into_iter().collect();
        Ok(Recluster::from_clusters(self.store.active_clusters_for(&ends)?))
    }

    /// Normalized records for every record a rebuild can see
    /// Candidate pairs for the changed records. Only the stored buckets the
    /// changed records belong to are read; a bucket is loaded only when it
    /// can be expanded. Returns the pairs and every record loaded.
    fn gather_candidates(
        &self,
        changed: &BTreeSet<String>,
        changed_set: &HashSet<String>,
    ) -> Result<(CandidateSet, HashMap<String, NormalizedRecord>)> {
        let mut wanted: BTreeSet<String> = changed.clone();
        let mut memberships = Vec::new();
        for (key, size) in self.store.bucket_sizes(changed)? {
            let members = if self.indexer.needs_members(&key, size) {
                self.store.bucket_members(&key)?
            } else {
                Vec::new()
            };
            wanted.extend(members.iter().cloned());
            memberships.push((key, size, members));
        }

        let records: HashMap<String, NormalizedRecord> = self
            .store
            .normalized_records_for(&wanted)?
            .into_iter()
            .map(|r| (r.record_id.clone(), r))
            .collect();
        debug!(
            "Loaded {} records from {} buckets around {} changed records",
            records.len(),
            memberships.len(),
            changed.len()
        );

        let candidates = {
            let buckets: Vec<StoredBucket<'_>> = memberships
                .iter()
                .map(|(key, size, members)| StoredBucket {
                    key: key.clone(),
                    size: *size,
                    members: members.iter().filter_map(|id| records.get(id)).collect(),
                })
                .collect();
            self.indexer.candidate_pairs_in_buckets(&buckets, changed_set)
        };
        Ok((candidates, records))
    }

    fn load_records(&self, work: &Recluster) -> Result<HashMap<String, NormalizedRecord>> {
        let mut records = HashMap::new();
        self.fill_records(work, &mut records)?;
        Ok(records)
    }

    /// Load every record the rebuild of `work` reads that is not loaded yet
    fn fill_records(&self, work: &Recluster, records: &mut HashMap<String, NormalizedRecord>) -> Result<()> {
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for (members, edges) in &work.seeds {
            ids.extend(members.iter().map(String::as_str));
            ids.extend(edges.iter().flat_map(|e| [e.pair.a(), e.pair.b()]));
        }
        for edge in work.new_edges.iter().chain(&work.forced_edges) {
            ids.extend([edge.pair.a(), edge.pair.b()]);
        }

        for id in ids {
            if records.contains_key(id) {
                continue;
            }
            if let Some(record) = self.store.normalized_record(id)? {
                records.insert(id.to_string(), record);
            }
        }
        Ok(())
    }

    /// Rebuild the given clusters, resolve golden records and commit each
    /// cluster transition. Returns the ids of the resulting clusters.
    fn recluster(
        &mut self,
        run_id: &str,
        work: Recluster,
        records: &HashMap<String, NormalizedRecord>,
        control: Option<&RunControl>,
        report: &mut RunReport,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let contradiction_fields = self.config.contradiction_fields.clone();

        let mut builder = ClusterBuilder::new(records, &contradiction_fields, work.vetted, now);
        for (members, edges) in &work.seeds {
            builder.seed(members, edges);
        }
        for edge in work.forced_edges {
            builder.force_edge(edge);
        }
        let mut new_edges = work.new_edges;
        new_edges.sort_by(edge_order);

        let mut held = Vec::new();
        for edge in new_edges {
            if let EdgeOutcome::Held(conflict) = builder.add_edge(edge) {
                held.push(conflict);
            }
        }
        let groups = builder.finish();

        for conflict in held {
            self.hold_conflict(run_id, &conflict)?;
            report.conflicts_held += 1;
        }

        let priors = work.priors;
        let split = match work.identity {
            IdentityMode::Majority => false,
            IdentityMode::FreshOnSplit => {
                !(groups.len() == 1 && priors.len() == 1 && groups[0].members == priors[0].members)
            }
        };
        let plan: IdentityPlan = if split {
            let mut plan = assign_identities(groups, &[], || Uuid::new_v4().to_string());
            plan.retired = priors.iter().map(|p| p.cluster_id.clone()).collect();
            plan
        } else {
            assign_identities(groups, &priors, || Uuid::new_v4().to_string())
        };

        // Survivorship is independent per cluster
        let inputs: Vec<(String, Vec<&NormalizedRecord>)> = plan
            .clusters
            .iter()
            .map(|ig| {
                let members = ig.group.members.iter().filter_map(|m| records.get(m)).collect();
                (ig.cluster_id.clone(), members)
            })
            .collect();
        let mut resolved: Vec<Option<GoldenRecord>> =
            self.resolver.resolve_many(&inputs).into_iter().map(Some).collect();

        let result_ids: Vec<String> = plan.clusters.iter().map(|ig| ig.cluster_id.clone()).collect();

        for unit in commit_units(&plan, &priors) {
            let mut commit = ClusterCommit::default();
            for &i in &unit.groups {
                let ig = &plan.clusters[i];
                let cluster = Cluster {
                    cluster_id: ig.cluster_id.clone(),
                    members: ig.group.members.clone(),
                    edges: ig.group.edges.clone(),
                    retired: false,
                };
                let previous = priors.iter().find(|p| p.cluster_id == cluster.cluster_id);
                if previous.map_or(true, |p| p.members != cluster.members || p.edges != cluster.edges) {
                    commit.clusters.push(cluster);
                }

                let current = self.store.golden(&ig.cluster_id)?;
                if let Some(golden) = resolved[i].take().and_then(|r| next_version(current.as_ref(), r, now)) {
                    commit.goldens.push(golden);
                }
            }
            commit.retired_clusters = unit.retired.clone();
            commit.retired_goldens = unit.retired;

            if commit.is_empty() {
                continue;
            }
            if control.map_or(false, RunControl::is_cancelled) {
                report.cancelled = true;
                return Ok(result_ids);
            }

            self.audit_commit(run_id, &commit, &priors)?;
            self.commit_with_retry(run_id, &commit)?;

            report.commits += 1;
            report.clusters_written += commit.clusters.len();
            report.clusters_retired += commit.retired_clusters.len();
            report.golden_versions += commit.goldens.len();
        }

        Ok(result_ids)
    }

    fn hold_conflict(&mut self, run_id: &str, conflict: &ConflictedMerge) -> Result<()> {
        let reasons: Vec<String> = conflict.contradictions.iter().map(|c| c.to_string()).collect();
        self.record(
            AuditEntry::new(
                run_id,
                AuditSubject::Pair(conflict.edge.pair.clone()),
                AuditAction::ConflictHeld,
                &conflict.edge.decided_by.to_string(),
            )
            .with_score(self.edge_snapshot(&conflict.edge))
            .with_detail(json!({
                "conflict_id": conflict.conflict_id,
                "left_members": conflict.left_members,
                "right_members": conflict.right_members,
                "contradictions": reasons,
            })),
        )?;
        warn!(
            "Held merge {}: {} contradiction(s), e.g. {}",
            conflict.edge.pair,
            conflict.contradictions.len(),
            reasons.first().map(String::as_str).unwrap_or("-")
        );
        self.store.save_conflict(conflict)
    }

    fn audit_commit(&mut self, run_id: &str, commit: &ClusterCommit, priors: &[Cluster]) -> Result<()> {
        for cluster in &commit.clusters {
            let existed = priors.iter().any(|p| p.cluster_id == cluster.cluster_id);
            let action = if existed { AuditAction::ClusterUpdated } else { AuditAction::ClusterCreated };
            self.record(
                AuditEntry::new(run_id, AuditSubject::Cluster(cluster.cluster_id.clone()), action, SYSTEM_ACTOR)
                    .with_detail(json!({
                        "members": cluster.members,
                        "edges": cluster.edges.len(),
                    })),
            )?;
        }
        for id in &commit.retired_clusters {
            self.record(AuditEntry::new(run_id, AuditSubject::Cluster(id.clone()), AuditAction::ClusterRetired, SYSTEM_ACTOR))?;
        }
        for golden in &commit.goldens {
            self.record(
                AuditEntry::new(run_id, AuditSubject::Cluster(golden.golden_id.clone()), AuditAction::GoldenVersioned, SYSTEM_ACTOR)
                    .with_detail(json!({
                        "version": golden.version,
                        "members": golden.member_record_ids,
                    })),
            )?;
        }
        for id in &commit.retired_goldens {
            self.record(AuditEntry::new(run_id, AuditSubject::Cluster(id.clone()), AuditAction::GoldenRetired, SYSTEM_ACTOR))?;
        }
        Ok(())
    }

    /// The whole commit is retried as a unit
    fn commit_with_retry(&mut self, run_id: &str, commit: &ClusterCommit) -> Result<()> {
        let attempts = self.config.commit_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.commit_cluster(commit) {
                Ok(()) => {
                    debug!("Committed cluster {} on attempt {}", commit.label(), attempt);
                    return Ok(());
                }
                Err(e) if attempt < attempts && !e.is_fatal() => {
                    warn!(
                        "Commit of cluster {} failed (attempt {}/{}): {}",
                        commit.label(),
                        attempt,
                        attempts,
                        e
                    );
                }
                Err(e) => {
                    self.record(
                        AuditEntry::new(
                            run_id,
                            AuditSubject::Cluster(commit.label()),
                            AuditAction::ClusterCommitFailed,
                            SYSTEM_ACTOR,
                        )
                        .with_detail(json!({ "attempts": attempt, "error": e.to_string() })),
                    )?;
                    return Err(ResolutionError::CommitFailed {
                        cluster_id: commit.label(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

// ============================================================================
// COMMIT UNITS
// ============================================================================

/// Groups and retirements that must land in one transaction
#[derive(Debug, Default, PartialEq)]
struct CommitUnit {
    groups: Vec<usize>,
    retired: Vec<String>,
}

/// Groups sharing members with the same prior cluster are committed
/// together, along with the priors they retire. Otherwise a record could
/// briefly (or, after a cancel, permanently) sit in two clusters.
fn commit_units(plan: &IdentityPlan, priors: &[Cluster]) -> Vec<CommitUnit> {
    let mut prior_of: HashMap<&str, &str> = HashMap::new();
    for prior in priors {
        for member in &prior.members {
            prior_of.insert(member.as_str(), prior.cluster_id.as_str());
        }
    }

    let mut uf = UnionFind::new();
    for (i, ig) in plan.clusters.iter().enumerate() {
        let node = uf.insert(&format!("group:{}", i));
        if let Some(prior) = &ig.inherited_from {
            let p = uf.insert(&format!("prior:{}", prior));
            uf.union(node, p);
        }
        for member in &ig.group.members {
            if let Some(prior) = prior_of.get(member.as_str()) {
                let p = uf.insert(&format!("prior:{}", prior));
                uf.union(node, p);
            }
        }
    }
    for id in &plan.retired {
        uf.insert(&format!("prior:{}", id));
    }

    let retired: HashSet<&str> = plan.retired.iter().map(String::as_str).collect();
    let mut units: Vec<CommitUnit> = uf
        .groups()
        .into_iter()
        .map(|nodes| {
            let mut unit = CommitUnit::default();
            for node in nodes {
                if let Some(i) = node.strip_prefix("group:").and_then(|s| s.parse::<usize>().ok()) {
                    unit.groups.push(i);
                } else if let Some(id) = node.strip_prefix("prior:") {
                    if retired.contains(id) {
                        unit.retired.push(id.to_string());
                    }
                }
            }
            unit.groups.sort_unstable();
            unit
        })
        .filter(|u| !u.groups.is_empty() || !u.retired.is_empty())
        .collect();

    // Deterministic commit order: by smallest member record id
    units.sort_by_key(|u| {
        u.groups
            .iter()
            .filter_map(|&i| plan.clusters[i].group.members.iter().next().cloned())
            .min()
            .or_else(|| u.retired.first().cloned())
    });
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::cluster::{EntityGroup, IdentifiedGroup};
    use crate::store::SqliteStore;
    use chrono::TimeZone;

    fn create_test_engine() -> ResolutionEngine<SqliteStore, MemoryAuditLog> {
        ResolutionEngine::new(
            ResolutionConfig::default(),
            SqliteStore::open_in_memory().unwrap(),
            MemoryAuditLog::new(),
        )
        .unwrap()
    }

    fn create_test_record(id: &str, system: &str, values: &[(&str, &str)]) -> SourceRecord {
        let mut record = SourceRecord::new(id, system, Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        for (field, value) in values {
            record = record.with_field(*field, *value);
        }
        record
    }

    fn smith(id: &str, system: &str, email: &str) -> SourceRecord {
        create_test_record(
            id,
            system,
            &[("last_name", "Smith"), ("email", email), ("phone", "5551234567")],
        )
    }

    fn group(members: &[&str]) -> IdentifiedGroup {
        IdentifiedGroup {
            cluster_id: format!("new-{}", members[0]),
            inherited_from: None,
            group: EntityGroup {
                members: members.iter().map(|m| m.to_string()).collect(),
                edges: vec![],
            },
        }
    }

    #[test]
    fn test_run_control_flag_is_shared() {
        let control = RunControl::new();
        let flag = control.flag();
        assert!(!control.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(control.is_cancelled());
    }

    #[test]
    fn test_redelivery_does_no_work() {
        let mut engine = create_test_engine();
        let batch = vec![smith("a", "core_banking", "jsmith@x.com"), smith("b", "salesforce", "jsmith1@x.com")];

        let first = engine.ingest(&batch).unwrap();
        assert_eq!(first.inserted, 2);
        engine.resolve(&RunControl::new()).unwrap();
        let entries = engine.audit().entries().len();

        let again = engine.ingest(&batch).unwrap();
        assert_eq!(again.unchanged, 2);
        let report = engine.resolve(&RunControl::new()).unwrap();
        assert!(report.run_id.is_empty());
        assert_eq!(engine.audit().entries().len(), entries);
    }

    #[test]
    fn test_auto_merge_builds_cluster_and_golden() {
        let mut engine = create_test_engine();
        engine
            .ingest(&[smith("a", "core_banking", "jsmith@x.com"), smith("b", "salesforce", "jsmith1@x.com")])
            .unwrap();
        let report = engine.resolve(&RunControl::new()).unwrap();

        assert_eq!(report.auto_merged, 1);
        assert_eq!(report.golden_versions, 1);
        let golden = engine.golden_for_record("b").unwrap().unwrap();
        assert_eq!(golden.member_record_ids, vec!["a".to_string(), "b".to_string()]);
        // email is most-recent-wins; same timestamp → lowest record id
        assert_eq!(golden.value("email"), Some("jsmith@x.com"));
        assert_eq!(golden.version, 1);
    }

    #[test]
    fn test_decide_requires_pending_review() {
        let mut engine = create_test_engine();
        let err = engine
            .decide(&PairKey::new("x", "y"), StewardVerdict::Merge, "alice")
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound(_)));
    }

    #[test]
    fn test_commit_units_group_shared_priors() {
        let prior = Cluster {
            cluster_id: "old".to_string(),
            members: ["a", "b", "c", "d"].iter().map(|m| m.to_string()).collect(),
            edges: vec![],
            retired: false,
        };
        let plan = IdentityPlan {
            clusters: vec![group(&["a", "b"]), group(&["c", "d"]), group(&["x", "y"])],
            retired: vec!["old".to_string()],
        };

        let units = commit_units(&plan, &[prior]);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], CommitUnit { groups: vec![0, 1], retired: vec!["old".to_string()] });
        assert_eq!(units[1], CommitUnit { groups: vec![2], retired: vec![] });
    }
}
