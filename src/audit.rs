// 📜 Audit Log - append-only record of every score, decision and cluster change
//
// Entries are written before the engine acts on them. A sink that cannot
// persist an entry returns AuditUnavailable, which aborts the run.

use crate::cluster::MergeEdge;
use crate::decision::DecidedBy;
use crate::error::{ResolutionError, Result};
use crate::model::PairKey;
use crate::scoring::{MatchScore, Tier};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// ============================================================================
// ENTRY TYPES
// ============================================================================

/// What an entry is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum AuditSubject {
    Pair(PairKey),
    Cluster(String),
    Record(String),
}

impl AuditSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditSubject::Pair(_) => "pair",
            AuditSubject::Cluster(_) => "cluster",
            AuditSubject::Record(_) => "record",
        }
    }

    /// Display form used for indexing ("a|b", cluster id, record id)
    pub fn reference(&self) -> String {
        match self {
            AuditSubject::Pair(pair) => pair.to_string(),
            AuditSubject::Cluster(id) | AuditSubject::Record(id) => id.clone(),
        }
    }

    pub fn pair(&self) -> Option<&PairKey> {
        match self {
            AuditSubject::Pair(pair) => Some(pair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RecordIngested,
    ScoreComputed,
    DecisionMerged,
    DecisionRejected,
    /// A system edge removed because one of its records changed
    EdgeDropped,
    ConflictHeld,
    ConflictConfirmed,
    ConflictRejected,
    MergeReversed,
    ClusterCreated,
    ClusterUpdated,
    ClusterRetired,
    GoldenVersioned,
    GoldenRetired,
    ClusterCommitFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RecordIngested => "record_ingested",
            AuditAction::ScoreComputed => "score_computed",
            AuditAction::DecisionMerged => "decision_merged",
            AuditAction::DecisionRejected => "decision_rejected",
            AuditAction::EdgeDropped => "edge_dropped",
            AuditAction::ConflictHeld => "conflict_held",
            AuditAction::ConflictConfirmed => "conflict_confirmed",
            AuditAction::ConflictRejected => "conflict_rejected",
            AuditAction::MergeReversed => "merge_reversed",
            AuditAction::ClusterCreated => "cluster_created",
            AuditAction::ClusterUpdated => "cluster_updated",
            AuditAction::ClusterRetired => "cluster_retired",
            AuditAction::GoldenVersioned => "golden_versioned",
            AuditAction::GoldenRetired => "golden_retired",
            AuditAction::ClusterCommitFailed => "cluster_commit_failed",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// Score as it was when the entry was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub composite: f64,
    pub tier: Tier,
    pub component_scores: BTreeMap<String, f64>,
}

impl From<&MatchScore> for ScoreSnapshot {
    fn from(score: &MatchScore) -> Self {
        ScoreSnapshot {
            composite: score.composite,
            tier: score.tier,
            component_scores: score.component_scores.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,

    /// Assigned by the sink; strictly increasing
    pub sequence: u64,

    pub run_id: String,
    pub subject: AuditSubject,
    pub action: AuditAction,
    pub score: Option<ScoreSnapshot>,

    /// "system" or "steward:<id>"
    pub actor: String,

    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(run_id: &str, subject: AuditSubject, action: AuditAction, actor: &str) -> Self {
        AuditEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            run_id: run_id.to_string(),
            subject,
            action,
            score: None,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_score(mut self, score: ScoreSnapshot) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ============================================================================
// SINKS
// ============================================================================

pub trait AuditSink {
    /// Persist one entry and return its sequence number
    fn append(&mut self, entry: AuditEntry) -> Result<u64>;

    /// Entries with sequence > `after`, oldest first
    fn entries_since(&self, after: u64) -> Result<Vec<AuditEntry>>;

    fn last_sequence(&self) -> Result<u64>;

    /// Pair entries whose two records both belong to `members`, oldest first
    fn pair_entries_among(&self, members: &BTreeSet<String>) -> Result<Vec<AuditEntry>>;
}

fn pair_within(entry: &AuditEntry, members: &BTreeSet<String>) -> bool {
    entry
        .subject
        .pair()
        .is_some_and(|pair| members.contains(pair.a()) && members.contains(pair.b()))
}

/// In-memory sink for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLog {
    entries: Vec<AuditEntry>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&mut self, mut entry: AuditEntry) -> Result<u64> {
        entry.sequence = self.entries.len() as u64 + 1;
        let sequence = entry.sequence;
        self.entries.push(entry);
        Ok(sequence)
    }

    fn entries_since(&self, after: u64) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.iter().filter(|e| e.sequence > after).cloned().collect())
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.entries.len() as u64)
    }

    fn pair_entries_among(&self, members: &BTreeSet<String>) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.iter().filter(|e| pair_within(e, members)).cloned().collect())
    }
}

/// SQLite-backed sink; UPDATE and DELETE are rejected by triggers
pub struct SqliteAuditLog {
    conn: Connection,
}

impl SqliteAuditLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ResolutionError::AuditUnavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| ResolutionError::AuditUnavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_audit_schema(&conn).map_err(|e| ResolutionError::AuditUnavailable(e.to_string()))?;
        Ok(SqliteAuditLog { conn })
    }

    fn insert(&self, entry: &AuditEntry) -> rusqlite::Result<u64> {
        let subject_json = serde_json::to_string(&entry.subject)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let score_json = entry
            .score
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        self.conn.execute(
            "INSERT INTO audit_log (
                entry_id, run_id, subject_kind, subject_ref, subject, action,
                score, actor, timestamp, detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.entry_id,
                entry.run_id,
                entry.subject.kind(),
                entry.subject.reference(),
                subject_json,
                entry.action.as_str(),
                score_json,
                entry.actor,
                entry.timestamp.to_rfc3339(),
                entry.detail.to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }
}

fn setup_audit_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            subject_kind TEXT NOT NULL,
            subject_ref TEXT NOT NULL,
            subject TEXT NOT NULL,
            action TEXT NOT NULL,
            score TEXT,
            actor TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            detail TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_kind, subject_ref);
        CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END;
        CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END;",
    )
}

fn conversion_error<E: std::error::Error + Send + Sync + 'static>(column: usize, e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

const ENTRY_COLUMNS: &str = "sequence, entry_id, run_id, subject, action, score, actor, timestamp, detail";

fn row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    let subject_json: String = row.get(3)?;
    let action_str: String = row.get(4)?;
    let score_json: Option<String> = row.get(5)?;
    let timestamp_str: String = row.get(7)?;
    let detail_json: String = row.get(8)?;

    let action = AuditAction::parse(&action_str).ok_or_else(|| {
        conversion_error(4, std::io::Error::other(format!("unknown audit action {}", action_str)))
    })?;

    Ok(AuditEntry {
        sequence: row.get::<_, i64>(0)? as u64,
        entry_id: row.get(1)?,
        run_id: row.get(2)?,
        subject: serde_json::from_str(&subject_json).map_err(|e| conversion_error(3, e))?,
        action,
        score: score_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
        actor: row.get(6)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map_err(|e| conversion_error(7, e))?
            .with_timezone(&Utc),
        detail: serde_json::from_str(&detail_json).map_err(|e| conversion_error(8, e))?,
    })
}

impl AuditSink for SqliteAuditLog {
    fn append(&mut self, entry: AuditEntry) -> Result<u64> {
        self.insert(&entry)
            .map_err(|e| ResolutionError::AuditUnavailable(e.to_string()))
    }

    fn entries_since(&self, after: u64) -> Result<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_log WHERE sequence > ?1 ORDER BY sequence ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![after as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn last_sequence(&self) -> Result<u64> {
        let last: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(sequence), 0) FROM audit_log", [], |row| row.get(0))?;
        Ok(last as u64)
    }

    fn pair_entries_among(&self, members: &BTreeSet<String>) -> Result<Vec<AuditEntry>> {
        // One indexed lookup per member pair; clusters are small
        let sql = format!(
            "SELECT {} FROM audit_log WHERE subject_kind = 'pair' AND subject_ref = ?1",
            ENTRY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids: Vec<&String> = members.iter().collect();
        let mut entries = Vec::new();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let reference = PairKey::new(a.as_str(), b.as_str()).to_string();
                for entry in stmt.query_map(params![reference], row_to_entry)? {
                    entries.push(entry?);
                }
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

// ============================================================================
// REPLAY
// ============================================================================

/// Inverse of `DecidedBy`'s display form
pub fn decided_by_from_actor(actor: &str) -> DecidedBy {
    match actor.strip_prefix("steward:") {
        Some(id) => DecidedBy::Steward(id.to_string()),
        None => DecidedBy::System,
    }
}

/// Rebuild the live merge edges among `members` from the log alone.
/// Merges and confirmed conflicts add an edge; drops, reversals, held
/// unions and rejections remove it. Later entries win.
pub fn replay_merge_edges(entries: &[AuditEntry], members: &BTreeSet<String>) -> Vec<MergeEdge> {
    let mut ordered: Vec<&AuditEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    let mut live: BTreeMap<PairKey, MergeEdge> = BTreeMap::new();
    for entry in ordered {
        let Some(pair) = entry.subject.pair() else {
            continue;
        };
        if !members.contains(pair.a()) || !members.contains(pair.b()) {
            continue;
        }

        match entry.action {
            AuditAction::DecisionMerged | AuditAction::ConflictConfirmed => {
                live.insert(
                    pair.clone(),
                    MergeEdge {
                        pair: pair.clone(),
                        composite: entry.score.as_ref().map(|s| s.composite).unwrap_or(0.0),
                        decided_by: decided_by_from_actor(&entry.actor),
                    },
                );
            }
            AuditAction::EdgeDropped
            | AuditAction::MergeReversed
            | AuditAction::ConflictHeld
            | AuditAction::DecisionRejected => {
                live.remove(pair);
            }
            _ => {}
        }
    }

    live.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ReviewConfidence;

    fn snapshot(composite: f64) -> ScoreSnapshot {
        ScoreSnapshot {
            composite,
            tier: Tier::AutoMerge,
            component_scores: BTreeMap::new(),
        }
    }

    fn pair_entry(a: &str, b: &str, action: AuditAction, actor: &str) -> AuditEntry {
        AuditEntry::new("run-1", AuditSubject::Pair(PairKey::new(a, b)), action, actor).with_score(snapshot(0.95))
    }

    #[test]
    fn test_sqlite_append_and_read_back() {
        let mut log = SqliteAuditLog::open_in_memory().unwrap();
        let first = log
            .append(pair_entry("a", "b", AuditAction::ScoreComputed, "system"))
            .unwrap();
        let second = log
            .append(
                AuditEntry::new("run-1", AuditSubject::Cluster("c-1".into()), AuditAction::ClusterCreated, "system")
                    .with_detail(serde_json::json!({ "members": ["a", "b"] })),
            )
            .unwrap();
        assert!(second > first);

        let entries = log.entries_since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subject, AuditSubject::Pair(PairKey::new("a", "b")));
        assert_eq!(entries[0].score.as_ref().unwrap().composite, 0.95);
        assert_eq!(entries[1].action, AuditAction::ClusterCreated);
        assert_eq!(entries[1].detail["members"][1], "b");

        assert_eq!(log.entries_since(first).unwrap().len(), 1);
        assert_eq!(log.last_sequence().unwrap(), second);
    }

    #[test]
    fn test_sqlite_log_is_append_only() {
        let mut log = SqliteAuditLog::open_in_memory().unwrap();
        log.append(pair_entry("a", "b", AuditAction::DecisionMerged, "system")).unwrap();

        assert!(log.conn.execute("UPDATE audit_log SET actor = 'mallory'", []).is_err());
        assert!(log.conn.execute("DELETE FROM audit_log", []).is_err());
        assert_eq!(log.entries_since(0).unwrap()[0].actor, "system");
        println!("✅ Audit log rejects UPDATE and DELETE");
    }

    #[test]
    fn test_action_round_trip_names() {
        assert_eq!(AuditAction::parse("merge_reversed"), Some(AuditAction::MergeReversed));
        assert_eq!(AuditAction::parse(AuditAction::GoldenVersioned.as_str()), Some(AuditAction::GoldenVersioned));
        assert_eq!(AuditAction::parse("bogus"), None);
    }

    #[test]
    fn test_replay_rebuilds_live_edges() {
        let mut log = MemoryAuditLog::new();
        log.append(pair_entry("A", "B", AuditAction::DecisionMerged, "system")).unwrap();
        log.append(pair_entry("B", "C", AuditAction::DecisionMerged, "steward:alice")).unwrap();
        log.append(pair_entry("C", "D", AuditAction::DecisionMerged, "system")).unwrap();
        log.append(pair_entry("C", "D", AuditAction::MergeReversed, "steward:bob")).unwrap();
        log.append(pair_entry("X", "A", AuditAction::DecisionMerged, "system")).unwrap();
        log.append(
            AuditEntry::new(
                "run-2",
                AuditSubject::Pair(PairKey::new("A", "C")),
                AuditAction::ScoreComputed,
                "system",
            )
            .with_score(ScoreSnapshot {
                composite: 0.6,
                tier: Tier::Review(ReviewConfidence::Low),
                component_scores: BTreeMap::new(),
            }),
        )
        .unwrap();

        let members: BTreeSet<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        let edges = replay_merge_edges(log.entries(), &members);

        let pairs: Vec<String> = edges.iter().map(|e| e.pair.to_string()).collect();
        assert_eq!(pairs, vec!["A|B".to_string(), "B|C".to_string()]);
        assert_eq!(edges[1].decided_by, DecidedBy::Steward("alice".into()));
    }

    #[test]
    fn test_pair_entries_among_skips_outside_pairs() {
        let mut sqlite = SqliteAuditLog::open_in_memory().unwrap();
        let mut memory = MemoryAuditLog::new();
        let entries = vec![
            pair_entry("A", "B", AuditAction::DecisionMerged, "system"),
            pair_entry("X", "A", AuditAction::DecisionMerged, "system"),
            AuditEntry::new("run-1", AuditSubject::Cluster("A".into()), AuditAction::ClusterCreated, "system"),
            pair_entry("B", "C", AuditAction::DecisionMerged, "steward:alice"),
            pair_entry("A", "B", AuditAction::EdgeDropped, "system"),
            pair_entry("C", "Z", AuditAction::ScoreComputed, "system"),
        ];
        for entry in entries {
            sqlite.append(entry.clone()).unwrap();
            memory.append(entry).unwrap();
        }

        let members: BTreeSet<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        for found in [sqlite.pair_entries_among(&members).unwrap(), memory.pair_entries_among(&members).unwrap()] {
            let seen: Vec<(u64, String)> = found
                .iter()
                .map(|e| (e.sequence, e.subject.reference()))
                .collect();
            assert_eq!(
                seen,
                vec![(1, "A|B".to_string()), (4, "B|C".to_string()), (5, "A|B".to_string())]
            );

            // Same live edges as replaying the whole log
            assert_eq!(
                replay_merge_edges(&found, &members),
                replay_merge_edges(&sqlite.entries_since(0).unwrap(), &members)
            );
        }
    }
}
