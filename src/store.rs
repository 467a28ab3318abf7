// 🗄️ Resolution Store - persisted records, clusters, golden records and steward state
//
// SqliteStore keeps everything in one SQLite file (WAL mode). A ClusterCommit
// is applied inside a single transaction: readers see the whole cluster
// transition or none of it.

use crate::cluster::{Cluster, ConflictStatus, ConflictedMerge, MergeEdge};
use crate::decision::{Outcome, PendingReview, StewardPrior};
use crate::error::Result;
use crate::model::{BlockingKey, NormalizedRecord, PairKey, SourceRecord};
use crate::survivorship::GoldenRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// ============================================================================
// COMMIT UNIT
// ============================================================================

/// Everything one cluster transition writes, applied atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterCommit {
    /// New or updated clusters
    pub clusters: Vec<Cluster>,
    pub retired_clusters: Vec<String>,
    pub goldens: Vec<GoldenRecord>,
    pub retired_goldens: Vec<String>,
}

impl ClusterCommit {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
            && self.retired_clusters.is_empty()
            && self.goldens.is_empty()
            && self.retired_goldens.is_empty()
    }

    /// Id used in logs and failure entries
    pub fn label(&self) -> String {
        self.clusters
            .first()
            .map(|c| c.cluster_id.clone())
            .or_else(|| self.retired_clusters.first().cloned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same content hash as the stored record: redelivery, ignored
    Unchanged,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait ResolutionStore {
    // records
    fn upsert_record(&mut self, source: &SourceRecord, normalized: &NormalizedRecord) -> Result<UpsertOutcome>;
    fn source_record(&self, record_id: &str) -> Result<Option<SourceRecord>>;
    fn normalized_record(&self, record_id: &str) -> Result<Option<NormalizedRecord>>;
    fn normalized_records_for(&self, record_ids: &BTreeSet<String>) -> Result<Vec<NormalizedRecord>>;
    fn changed_record_ids(&self) -> Result<Vec<String>>;
    fn mark_clean(&mut self, record_ids: &[String]) -> Result<()>;

    // blocking index
    /// Every key the given records carry, with the number of stored records
    /// sharing it
    fn bucket_sizes(&self, record_ids: &BTreeSet<String>) -> Result<Vec<(BlockingKey, usize)>>;
    fn bucket_members(&self, key: &BlockingKey) -> Result<Vec<String>>;

    // clusters
    fn cluster(&self, cluster_id: &str) -> Result<Option<Cluster>>;
    fn active_clusters(&self) -> Result<Vec<Cluster>>;
    fn active_clusters_for(&self, record_ids: &BTreeSet<String>) -> Result<Vec<Cluster>>;
    fn commit_cluster(&mut self, commit: &ClusterCommit) -> Result<()>;

    // golden records
    fn golden(&self, golden_id: &str) -> Result<Option<GoldenRecord>>;
    fn golden_history(&self, golden_id: &str) -> Result<Vec<GoldenRecord>>;
    fn golden_for_record(&self, record_id: &str) -> Result<Option<GoldenRecord>>;
    fn current_goldens(&self) -> Result<Vec<GoldenRecord>>;
    fn is_golden_retired(&self, golden_id: &str) -> Result<bool>;

    // steward state
    fn save_prior(&mut self, prior: &StewardPrior) -> Result<()>;
    fn prior(&self, pair: &PairKey) -> Result<Option<StewardPrior>>;
    fn upsert_review(&mut self, review: &PendingReview) -> Result<()>;
    fn remove_review(&mut self, pair: &PairKey) -> Result<()>;
    fn pending_review(&self, pair: &PairKey) -> Result<Option<PendingReview>>;
    fn pending_reviews(&self) -> Result<Vec<PendingReview>>;
    fn save_conflict(&mut self, conflict: &ConflictedMerge) -> Result<()>;
    fn conflict(&self, conflict_id: &str) -> Result<Option<ConflictedMerge>>;
    fn open_conflicts(&self) -> Result<Vec<ConflictedMerge>>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            record_id TEXT PRIMARY KEY,
            source_system TEXT NOT NULL,
            source_fields TEXT NOT NULL,
            fields TEXT NOT NULL,
            blocking_keys TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            changed INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS clusters (
            cluster_id TEXT PRIMARY KEY,
            members TEXT NOT NULL,
            edges TEXT NOT NULL,
            retired INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_members (
            record_id TEXT PRIMARY KEY,
            cluster_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS golden_records (
            golden_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            members TEXT NOT NULL,
            fields TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (golden_id, version)
        );

        CREATE TABLE IF NOT EXISTS golden_retired (
            golden_id TEXT PRIMARY KEY,
            retired_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS steward_priors (
            pair TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_reviews (
            pair TEXT PRIMARY KEY,
            composite REAL NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conflicts (
            conflict_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blocking_keys (
            strategy TEXT NOT NULL,
            value TEXT NOT NULL,
            record_id TEXT NOT NULL,
            PRIMARY KEY (strategy, value, record_id)
        );

        CREATE INDEX IF NOT EXISTS idx_records_changed ON records(changed);
        CREATE INDEX IF NOT EXISTS idx_blocking_keys_record ON blocking_keys(record_id);
        CREATE INDEX IF NOT EXISTS idx_cluster_members_cluster ON cluster_members(cluster_id);
        CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status);",
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn time_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_normalized(row: &Row) -> rusqlite::Result<NormalizedRecord> {
    Ok(NormalizedRecord {
        record_id: row.get(0)?,
        source_system: row.get(1)?,
        fields: json_column(row, 2)?,
        blocking_keys: json_column(row, 3)?,
        ingested_at: time_column(row, 4)?,
        content_hash: row.get(5)?,
    })
}

fn row_to_cluster(row: &Row) -> rusqlite::Result<Cluster> {
    let members: BTreeSet<String> = json_column(row, 1)?;
    let edges: Vec<MergeEdge> = json_column(row, 2)?;
    Ok(Cluster {
        cluster_id: row.get(0)?,
        members,
        edges,
        retired: row.get::<_, i64>(3)? != 0,
    })
}

fn row_to_golden(row: &Row) -> rusqlite::Result<GoldenRecord> {
    Ok(GoldenRecord {
        golden_id: row.get(0)?,
        version: row.get::<_, i64>(1)? as u32,
        member_record_ids: json_column(row, 2)?,
        fields: json_column(row, 3)?,
        created_at: time_column(row, 4)?,
    })
}

const CLUSTER_COLUMNS: &str = "cluster_id, members, edges, retired";
const GOLDEN_COLUMNS: &str = "golden_id, version, members, fields, created_at";

impl ResolutionStore for SqliteStore {
    fn upsert_record(&mut self, source: &SourceRecord, normalized: &NormalizedRecord) -> Result<UpsertOutcome> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT content_hash FROM records WHERE record_id = ?1",
                params![source.record_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(hash) if hash == normalized.content_hash => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO records (
                record_id, source_system, source_fields, fields, blocking_keys,
                ingested_at, content_hash, changed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                source.record_id,
                source.source_system,
                to_json(&source.fields)?,
                to_json(&normalized.fields)?,
                to_json(&normalized.blocking_keys)?,
                source.ingested_at.to_rfc3339(),
                normalized.content_hash,
            ],
        )?;

        // An updated record may have left some of its old buckets
        tx.execute(
            "DELETE FROM blocking_keys WHERE record_id = ?1",
            params![source.record_id],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO blocking_keys (strategy, value, record_id) VALUES (?1, ?2, ?3)",
            )?;
            for key in &normalized.blocking_keys {
                insert.execute(params![key.strategy, key.value, source.record_id])?;
            }
        }
        tx.commit()?;

        Ok(outcome)
    }

    fn source_record(&self, record_id: &str) -> Result<Option<SourceRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT record_id, source_system, source_fields, ingested_at FROM records WHERE record_id = ?1",
                params![record_id],
                |row| {
                    let fields: BTreeMap<String, String> = json_column(row, 2)?;
                    Ok(SourceRecord {
                        record_id: row.get(0)?,
                        source_system: row.get(1)?,
                        fields,
                        ingested_at: time_column(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn normalized_record(&self, record_id: &str) -> Result<Option<NormalizedRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT record_id, source_system, fields, blocking_keys, ingested_at, content_hash
                 FROM records WHERE record_id = ?1",
                params![record_id],
                row_to_normalized,
            )
            .optional()?)
    }

    fn normalized_records_for(&self, record_ids: &BTreeSet<String>) -> Result<Vec<NormalizedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, source_system, fields, blocking_keys, ingested_at, content_hash
             FROM records WHERE record_id = ?1",
        )?;
        let mut records = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            if let Some(record) = stmt.query_row(params![record_id], row_to_normalized).optional()? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn changed_record_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_id FROM records WHERE changed = 1 ORDER BY record_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn mark_clean(&mut self, record_ids: &[String]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE records SET changed = 0 WHERE record_id = ?1")?;
            for id in record_ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn bucket_sizes(&self, record_ids: &BTreeSet<String>) -> Result<Vec<(BlockingKey, usize)>> {
        let mut keys: BTreeSet<BlockingKey> = BTreeSet::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT strategy, value FROM blocking_keys WHERE record_id = ?1")?;
            for record_id in record_ids {
                let rows = stmt.query_map(params![record_id], |row| {
                    Ok(BlockingKey {
                        strategy: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?;
                for key in rows {
                    keys.insert(key?);
                }
            }
        }

        let mut count = self
            .conn
            .prepare("SELECT COUNT(*) FROM blocking_keys WHERE strategy = ?1 AND value = ?2")?;
        let mut sizes = Vec::with_capacity(keys.len());
        for key in keys {
            let size: i64 = count.query_row(params![key.strategy, key.value], |row| row.get(0))?;
            sizes.push((key, size as usize));
        }
        Ok(sizes)
    }

    fn bucket_members(&self, key: &BlockingKey) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id FROM blocking_keys WHERE strategy = ?1 AND value = ?2 ORDER BY record_id",
        )?;
        let ids = stmt
            .query_map(params![key.strategy, key.value], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn cluster(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        let sql = format!("SELECT {} FROM clusters WHERE cluster_id = ?1", CLUSTER_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![cluster_id], row_to_cluster)
            .optional()?)
    }

    fn active_clusters(&self) -> Result<Vec<Cluster>> {
        let sql = format!(
            "SELECT {} FROM clusters WHERE retired = 0 ORDER BY cluster_id",
            CLUSTER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let clusters = stmt
            .query_map([], row_to_cluster)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(clusters)
    }

    fn active_clusters_for(&self, record_ids: &BTreeSet<String>) -> Result<Vec<Cluster>> {
        let mut cluster_ids = BTreeSet::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT cluster_id FROM cluster_members WHERE record_id = ?1")?;
            for id in record_ids {
                let found: Option<String> = stmt.query_row(params![id], |row| row.get(0)).optional()?;
                cluster_ids.extend(found);
            }
        }

        let mut clusters = Vec::with_capacity(cluster_ids.len());
        for id in cluster_ids {
            if let Some(cluster) = self.cluster(&id)? {
                if !cluster.retired {
                    clusters.push(cluster);
                }
            }
        }
        Ok(clusters)
    }

    fn commit_cluster(&mut self, commit: &ClusterCommit) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        for id in &commit.retired_clusters {
            tx.execute(
                "UPDATE clusters SET retired = 1, updated_at = ?2 WHERE cluster_id = ?1",
                params![id, now],
            )?;
            tx.execute("DELETE FROM cluster_members WHERE cluster_id = ?1", params![id])?;
        }

        for cluster in &commit.clusters {
            tx.execute(
                "INSERT OR REPLACE INTO clusters (cluster_id, members, edges, retired, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cluster.cluster_id,
                    to_json(&cluster.members)?,
                    to_json(&cluster.edges)?,
                    cluster.retired as i64,
                    now,
                ],
            )?;
            tx.execute(
                "DELETE FROM cluster_members WHERE cluster_id = ?1",
                params![cluster.cluster_id],
            )?;
            for member in &cluster.members {
                tx.execute(
                    "INSERT OR REPLACE INTO cluster_members (record_id, cluster_id) VALUES (?1, ?2)",
                    params![member, cluster.cluster_id],
                )?;
            }
        }

        for golden in &commit.goldens {
            tx.execute(
                "INSERT INTO golden_records (golden_id, version, members, fields, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    golden.golden_id,
                    golden.version as i64,
                    to_json(&golden.member_record_ids)?,
                    to_json(&golden.fields)?,
                    golden.created_at.to_rfc3339(),
                ],
            )?;
        }

        for id in &commit.retired_goldens {
            tx.execute(
                "INSERT OR IGNORE INTO golden_retired (golden_id, retired_at) VALUES (?1, ?2)",
                params![id, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn golden(&self, golden_id: &str) -> Result<Option<GoldenRecord>> {
        let sql = format!(
            "SELECT {} FROM golden_records WHERE golden_id = ?1 ORDER BY version DESC LIMIT 1",
            GOLDEN_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![golden_id], row_to_golden)
            .optional()?)
    }

    fn golden_history(&self, golden_id: &str) -> Result<Vec<GoldenRecord>> {
        let sql = format!(
            "SELECT {} FROM golden_records WHERE golden_id = ?1 ORDER BY version ASC",
            GOLDEN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![golden_id], row_to_golden)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn golden_for_record(&self, record_id: &str) -> Result<Option<GoldenRecord>> {
        let cluster_id: Option<String> = self
            .conn
            .query_row(
                "SELECT cluster_id FROM cluster_members WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;

        match cluster_id {
            Some(id) => self.golden(&id),
            None => Ok(None),
        }
    }

    fn current_goldens(&self) -> Result<Vec<GoldenRecord>> {
        let sql = format!(
            "SELECT {} FROM golden_records g
             WHERE version = (SELECT MAX(version) FROM golden_records WHERE golden_id = g.golden_id)
               AND golden_id NOT IN (SELECT golden_id FROM golden_retired)
             ORDER BY golden_id",
            GOLDEN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let goldens = stmt
            .query_map([], row_to_golden)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goldens)
    }

    fn is_golden_retired(&self, golden_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM golden_retired WHERE golden_id = ?1",
            params![golden_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn save_prior(&mut self, prior: &StewardPrior) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO steward_priors (pair, body) VALUES (?1, ?2)",
            params![prior.pair.to_string(), to_json(prior)?],
        )?;
        Ok(())
    }

    fn prior(&self, pair: &PairKey) -> Result<Option<StewardPrior>> {
        Ok(self
            .conn
            .query_row(
                "SELECT body FROM steward_priors WHERE pair = ?1",
                params![pair.to_string()],
                |row| json_column(row, 0),
            )
            .optional()?)
    }

    fn upsert_review(&mut self, review: &PendingReview) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_reviews (pair, composite, body) VALUES (?1, ?2, ?3)",
            params![review.score.pair.to_string(), review.score.composite, to_json(review)?],
        )?;
        Ok(())
    }

    fn remove_review(&mut self, pair: &PairKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_reviews WHERE pair = ?1",
            params![pair.to_string()],
        )?;
        Ok(())
    }

    fn pending_review(&self, pair: &PairKey) -> Result<Option<PendingReview>> {
        Ok(self
            .conn
            .query_row(
                "SELECT body FROM pending_reviews WHERE pair = ?1",
                params![pair.to_string()],
                |row| json_column(row, 0),
            )
            .optional()?)
    }

    fn pending_reviews(&self) -> Result<Vec<PendingReview>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM pending_reviews ORDER BY composite DESC, pair ASC")?;
        let reviews = stmt
            .query_map([], |row| json_column(row, 0))?
            .collect::<std::result::Result<Vec<PendingReview>, _>>()?;
        Ok(reviews)
    }

    fn save_conflict(&mut self, conflict: &ConflictedMerge) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO conflicts (conflict_id, status, body) VALUES (?1, ?2, ?3)",
            params![conflict.conflict_id, conflict.status.as_str(), to_json(conflict)?],
        )?;
        Ok(())
    }

    fn conflict(&self, conflict_id: &str) -> Result<Option<ConflictedMerge>> {
        Ok(self
            .conn
            .query_row(
                "SELECT body FROM conflicts WHERE conflict_id = ?1",
                params![conflict_id],
                |row| json_column(row, 0),
            )
            .optional()?)
    }

    fn open_conflicts(&self) -> Result<Vec<ConflictedMerge>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM conflicts WHERE status = ?1 ORDER BY conflict_id")?;
        let conflicts = stmt
            .query_map(params![ConflictStatus::Open.as_str()], |row| json_column(row, 0))?
            .collect::<std::result::Result<Vec<ConflictedMerge>, _>>()?;
        Ok(conflicts)
    }
}

/// Steward verdict recorded for a pair, if any
pub fn prior_outcome<S: ResolutionStore + ?Sized>(store: &S, pair: &PairKey) -> Result<Option<Outcome>> {
    Ok(store.prior(pair)?.map(|p| p.outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResolutionConfig, SurvivorshipRule};
    use crate::decision::DecidedBy;
    use crate::normalizer::Normalizer;
    use crate::scoring::{MatchScore, ReviewConfidence, Tier};
    use crate::survivorship::GoldenField;

    fn create_test_record(id: &str, email: &str) -> (SourceRecord, NormalizedRecord) {
        let source = SourceRecord::new(id, "salesforce", Utc::now())
            .with_field("last_name", "Smith")
            .with_field("email", email);
        let normalized = Normalizer::new(&ResolutionConfig::default()).normalize(&source);
        (source, normalized)
    }

    fn create_test_cluster(id: &str, members: &[&str]) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            edges: vec![MergeEdge {
                pair: PairKey::new(members[0], members[1]),
                composite: 0.95,
                decided_by: DecidedBy::System,
            }],
            retired: false,
        }
    }

    fn create_test_golden(id: &str, version: u32, members: &[&str]) -> GoldenRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "last_name".to_string(),
            GoldenField {
                value: "SMITH".to_string(),
                source_record_id: members[0].to_string(),
                source_system: "salesforce".to_string(),
                rule: SurvivorshipRule::HighestTrustSourceWins,
            },
        );
        GoldenRecord {
            golden_id: id.to_string(),
            member_record_ids: members.iter().map(|m| m.to_string()).collect(),
            fields,
            created_at: Utc::now(),
            version,
        }
    }

    #[test]
    fn test_redelivery_is_ignored() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let (source, normalized) = create_test_record("r1", "js@x.com");

        assert_eq!(store.upsert_record(&source, &normalized).unwrap(), UpsertOutcome::Inserted);
        store.mark_clean(&["r1".to_string()]).unwrap();

        // Cosmetically different, same canonical content
        let (again, again_norm) = create_test_record("r1", "  JS@X.COM ");
        assert_eq!(store.upsert_record(&again, &again_norm).unwrap(), UpsertOutcome::Unchanged);
        assert!(store.changed_record_ids().unwrap().is_empty());

        let (changed, changed_norm) = create_test_record("r1", "other@x.com");
        assert_eq!(store.upsert_record(&changed, &changed_norm).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.changed_record_ids().unwrap(), vec!["r1".to_string()]);
    }

    #[test]
    fn test_normalized_records_round_trip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let (source, normalized) = create_test_record("r1", "js@x.com");
        store.upsert_record(&source, &normalized).unwrap();

        let loaded = store.normalized_records_for(&["r1".to_string()].into_iter().collect()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.normalized_record("r1").unwrap().as_ref(), Some(&loaded[0]));
        assert_eq!(loaded[0].fields, normalized.fields);
        assert_eq!(loaded[0].blocking_keys, normalized.blocking_keys);
        assert_eq!(store.source_record("r1").unwrap().unwrap().field("email"), Some("js@x.com"));
    }

    #[test]
    fn test_blocking_index_follows_record_updates() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        for (id, email) in [("r1", "js@x.com"), ("r2", "js@x.com"), ("r3", "other@x.com")] {
            let (source, normalized) = create_test_record(id, email);
            store.upsert_record(&source, &normalized).unwrap();
        }
        let shared = BlockingKey {
            strategy: "email".to_string(),
            value: "js@x.com".to_string(),
        };
        let other = BlockingKey {
            strategy: "email".to_string(),
            value: "other@x.com".to_string(),
        };
        let only = |id: &str| -> BTreeSet<String> { [id.to_string()].into_iter().collect() };

        assert_eq!(store.bucket_sizes(&only("r1")).unwrap(), vec![(shared.clone(), 2)]);
        assert_eq!(store.bucket_members(&shared).unwrap(), vec!["r1".to_string(), "r2".to_string()]);

        // r2 moves buckets: its old key row is gone, the new one counted
        let (moved, moved_norm) = create_test_record("r2", "other@x.com");
        store.upsert_record(&moved, &moved_norm).unwrap();
        assert_eq!(store.bucket_sizes(&only("r1")).unwrap(), vec![(shared.clone(), 1)]);
        assert_eq!(store.bucket_sizes(&only("r2")).unwrap(), vec![(other.clone(), 2)]);
        assert_eq!(store.bucket_members(&other).unwrap(), vec!["r2".to_string(), "r3".to_string()]);

        let both: BTreeSet<String> = ["r1".to_string(), "r3".to_string()].into_iter().collect();
        assert_eq!(store.bucket_sizes(&both).unwrap(), vec![(shared, 1), (other, 2)]);

        let loaded = store.normalized_records_for(&both).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);
        assert!(store.normalized_records_for(&only("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_commit_merge_and_retire() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .commit_cluster(&ClusterCommit {
                clusters: vec![create_test_cluster("c1", &["a", "b"]), create_test_cluster("c2", &["c", "d"])],
                goldens: vec![create_test_golden("c1", 1, &["a", "b"]), create_test_golden("c2", 1, &["c", "d"])],
                ..Default::default()
            })
            .unwrap();

        // c1 absorbs c2
        let mut merged = create_test_cluster("c1", &["a", "b"]);
        merged.members.extend(["c".to_string(), "d".to_string()]);
        store
            .commit_cluster(&ClusterCommit {
                clusters: vec![merged],
                retired_clusters: vec!["c2".to_string()],
                goldens: vec![create_test_golden("c1", 2, &["a", "b", "c", "d"])],
                retired_goldens: vec!["c2".to_string()],
            })
            .unwrap();

        let active = store.active_clusters().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].members.len(), 4);
        assert!(store.cluster("c2").unwrap().unwrap().retired);

        assert_eq!(store.golden_for_record("d").unwrap().unwrap().golden_id, "c1");
        assert_eq!(store.golden_history("c1").unwrap().len(), 2);
        assert!(store.is_golden_retired("c2").unwrap());
        assert_eq!(store.current_goldens().unwrap().len(), 1);
        assert_eq!(store.current_goldens().unwrap()[0].version, 2);
    }

    #[test]
    fn test_failed_commit_is_all_or_nothing() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let golden = create_test_golden("c1", 1, &["a", "b"]);
        store
            .commit_cluster(&ClusterCommit {
                clusters: vec![create_test_cluster("c1", &["a", "b"])],
                goldens: vec![golden.clone()],
                ..Default::default()
            })
            .unwrap();

        // Duplicate golden version violates the primary key after the cluster row was written
        let mut grown = create_test_cluster("c1", &["a", "b"]);
        grown.members.insert("z".to_string());
        let result = store.commit_cluster(&ClusterCommit {
            clusters: vec![grown],
            goldens: vec![golden],
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(store.cluster("c1").unwrap().unwrap().members.len(), 2);
        assert!(store.golden_for_record("z").unwrap().is_none());
    }

    #[test]
    fn test_reviews_priors_and_conflicts() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let pair = PairKey::new("a", "b");
        let review = PendingReview {
            score: MatchScore {
                pair: pair.clone(),
                component_scores: BTreeMap::new(),
                excluded: vec![],
                composite: 0.8,
                evidence: 0.75,
                tier: Tier::Review(ReviewConfidence::High),
            },
            confidence: ReviewConfidence::High,
            run_id: "run-1".to_string(),
            queued_at: Utc::now(),
        };
        store.upsert_review(&review).unwrap();
        assert_eq!(store.pending_reviews().unwrap().len(), 1);
        store.remove_review(&pair).unwrap();
        assert!(store.pending_review(&pair).unwrap().is_none());

        store
            .save_prior(&StewardPrior {
                pair: pair.clone(),
                outcome: Outcome::Rejected,
                steward_id: "alice".to_string(),
                decided_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(prior_outcome(&store, &pair).unwrap(), Some(Outcome::Rejected));

        let mut conflict = ConflictedMerge {
            conflict_id: pair.to_string(),
            edge: MergeEdge {
                pair: pair.clone(),
                composite: 0.93,
                decided_by: DecidedBy::System,
            },
            left_members: vec!["a".into()],
            right_members: vec!["b".into()],
            contradictions: vec![],
            status: ConflictStatus::Open,
            detected_at: Utc::now(),
            resolved_by: None,
        };
        store.save_conflict(&conflict).unwrap();
        assert_eq!(store.open_conflicts().unwrap().len(), 1);

        conflict.status = ConflictStatus::Rejected;
        store.save_conflict(&conflict).unwrap();
        assert!(store.open_conflicts().unwrap().is_empty());
        assert_eq!(store.conflict("a|b").unwrap().unwrap().status, ConflictStatus::Rejected);
    }
}
