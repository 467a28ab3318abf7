// 🕸️ Cluster Builder - connected components over merged edges
//
// Single-threaded union-find. Seed it with the persisted clusters a run
// touches, then apply the run's new edges in a fixed order. An edge that
// would fuse two components whose members disagree on a contradiction field
// (and were never compared directly) is held as a ConflictedMerge.

use crate::decision::DecidedBy;
use crate::model::{NormalizedRecord, PairKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

// ============================================================================
// EDGES & CLUSTERS
// ============================================================================

/// One accepted merge between two records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEdge {
    pub pair: PairKey,
    pub composite: f64,
    pub decided_by: DecidedBy,
}

impl MergeEdge {
    pub fn is_steward(&self) -> bool {
        matches!(self.decided_by, DecidedBy::Steward(_))
    }
}

/// Strongest first, then by pair: the order new edges are applied in
pub fn edge_order(x: &MergeEdge, y: &MergeEdge) -> Ordering {
    y.composite
        .partial_cmp(&x.composite)
        .unwrap_or(Ordering::Equal)
        .then_with(|| x.pair.cmp(&y.pair))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub members: BTreeSet<String>,

    /// Sorted by pair
    pub edges: Vec<MergeEdge>,

    /// Retired ids are never reused
    pub retired: bool,
}

impl Cluster {
    pub fn contains(&self, record_id: &str) -> bool {
        self.members.contains(record_id)
    }
}

// ============================================================================
// CONFLICTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Confirmed,
    Rejected,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::Confirmed => "confirmed",
            ConflictStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ConflictStatus> {
        match s {
            "open" => Some(ConflictStatus::Open),
            "confirmed" => Some(ConflictStatus::Confirmed),
            "rejected" => Some(ConflictStatus::Rejected),
            _ => None,
        }
    }
}

/// Two members on opposite sides of a held union that disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contradiction {
    pub field: String,
    pub left_record: String,
    pub left_value: String,
    pub right_record: String,
    pub right_value: String,
}

impl fmt::Display for Contradiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}={} vs {}={}",
            self.field, self.left_record, self.left_value, self.right_record, self.right_value
        )
    }
}

/// A union held for explicit steward confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictedMerge {
    /// Same as the held edge's pair key, so a re-held edge maps to one conflict
    pub conflict_id: String,
    pub edge: MergeEdge,
    pub left_members: Vec<String>,
    pub right_members: Vec<String>,
    pub contradictions: Vec<Contradiction>,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_by: Option<String>,
}

// ============================================================================
// UNION-FIND
// ============================================================================

/// Union-find over record ids, tracking the members of each root
#[derive(Debug, Default)]
pub struct UnionFind {
    index: HashMap<String, usize>,
    ids: Vec<String>,
    parent: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.index.insert(id.to_string(), i);
        self.ids.push(id.to_string());
        self.parent.push(i);
        self.members.push(vec![i]);
        i
    }

    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Returns false when both were already in the same set
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (big, small) = if self.members[ra].len() >= self.members[rb].len() {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        let moved = std::mem::take(&mut self.members[small]);
        self.members[big].extend(moved);
        true
    }

    fn member_ids(&self, root: usize) -> Vec<&str> {
        self.members[root].iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// All sets with their member ids
    pub fn groups(&mut self) -> Vec<BTreeSet<String>> {
        let mut by_root: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for i in 0..self.ids.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().insert(self.ids[i].clone());
        }
        by_root.into_values().collect()
    }
}

// ============================================================================
// CLUSTER BUILDER
// ============================================================================

/// A connected component produced by the builder, before it has an id
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroup {
    pub members: BTreeSet<String>,
    pub edges: Vec<MergeEdge>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeOutcome {
    /// Two components became one
    Joined,
    /// Both records were already in the same component
    AlreadyJoined,
    Held(ConflictedMerge),
}

pub struct ClusterBuilder<'a> {
    records: &'a HashMap<String, NormalizedRecord>,
    contradiction_fields: &'a [String],

    /// Pairs that were compared directly; never reported as contradictions
    vetted: HashSet<PairKey>,

    uf: UnionFind,
    edges: Vec<MergeEdge>,
    now: DateTime<Utc>,
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(
        records: &'a HashMap<String, NormalizedRecord>,
        contradiction_fields: &'a [String],
        vetted: HashSet<PairKey>,
        now: DateTime<Utc>,
    ) -> Self {
        ClusterBuilder {
            records,
            contradiction_fields,
            vetted,
            uf: UnionFind::new(),
            edges: Vec::new(),
            now,
        }
    }

    /// Load a persisted cluster. Members become nodes; only the given edges
    /// connect them, so a cluster whose edges were dropped falls apart.
    pub fn seed(&mut self, members: &BTreeSet<String>, edges: &[MergeEdge]) {
        for member in members {
            self.uf.insert(member);
        }
        for edge in edges {
            self.join(edge.clone());
        }
    }

    /// Apply an edge with merge-creep detection
    pub fn add_edge(&mut self, edge: MergeEdge) -> EdgeOutcome {
        let a = self.uf.insert(edge.pair.a());
        let b = self.uf.insert(edge.pair.b());
        let (ra, rb) = (self.uf.find(a), self.uf.find(b));

        if ra == rb {
            self.edges.push(edge);
            return EdgeOutcome::AlreadyJoined;
        }

        let mut left: Vec<String> = self.uf.member_ids(ra).into_iter().map(String::from).collect();
        let mut right: Vec<String> = self.uf.member_ids(rb).into_iter().map(String::from).collect();
        left.sort();
        right.sort();

        let contradictions = self.find_contradictions(&left, &right);
        if !contradictions.is_empty() {
            return EdgeOutcome::Held(ConflictedMerge {
                conflict_id: edge.pair.to_string(),
                edge,
                left_members: left,
                right_members: right,
                contradictions,
                status: ConflictStatus::Open,
                detected_at: self.now,
                resolved_by: None,
            });
        }

        self.join(edge);
        EdgeOutcome::Joined
    }

    /// Apply an edge a steward has explicitly confirmed; no checks
    pub fn force_edge(&mut self, edge: MergeEdge) {
        self.join(edge);
    }

    fn join(&mut self, edge: MergeEdge) {
        let a = self.uf.insert(edge.pair.a());
        let b = self.uf.insert(edge.pair.b());
        self.uf.union(a, b);
        self.edges.push(edge);
    }

    fn find_contradictions(&self, left: &[String], right: &[String]) -> Vec<Contradiction> {
        let mut found = Vec::new();
        for x in left {
            for y in right {
                if self.vetted.contains(&PairKey::new(x.as_str(), y.as_str())) {
                    continue;
                }
                let (Some(rx), Some(ry)) = (self.records.get(x), self.records.get(y)) else {
                    continue;
                };
                for field in self.contradiction_fields {
                    if let (Some(vx), Some(vy)) = (rx.get(field), ry.get(field)) {
                        if vx != vy {
                            found.push(Contradiction {
                                field: field.clone(),
                                left_record: x.clone(),
                                left_value: vx.to_string(),
                                right_record: y.clone(),
                                right_value: vy.to_string(),
                            });
                        }
                    }
                }
            }
        }
        found
    }

    /// Components with at least two members, each with its own edges
    pub fn finish(mut self) -> Vec<EntityGroup> {
        let groups = self.uf.groups();
        let mut group_of: HashMap<&str, usize> = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for member in group {
                group_of.insert(member.as_str(), i);
            }
        }

        let mut edges_by_group: Vec<BTreeMap<PairKey, MergeEdge>> = vec![BTreeMap::new(); groups.len()];
        for edge in self.edges.drain(..) {
            if let Some(&g) = group_of.get(edge.pair.a()) {
                // first edge for a pair wins
                edges_by_group[g].entry(edge.pair.clone()).or_insert(edge);
            }
        }

        groups
            .into_iter()
            .zip(edges_by_group)
            .filter(|(members, _)| members.len() > 1)
            .map(|(members, edges)| EntityGroup {
                members,
                edges: edges.into_values().collect(),
            })
            .collect()
    }
}

// ============================================================================
// CLUSTER IDENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedGroup {
    pub cluster_id: String,
    /// The prior cluster whose id was kept, if any
    pub inherited_from: Option<String>,
    pub group: EntityGroup,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityPlan {
    pub clusters: Vec<IdentifiedGroup>,
    /// Prior ids that no group kept
    pub retired: Vec<String>,
}

/// A group keeps a prior cluster's id when it holds a strict majority of
/// that prior's members. Several priors claiming one group: largest overlap
/// wins, ties go to the lowest id. Everything else gets a fresh id.
pub fn assign_identities(
    groups: Vec<EntityGroup>,
    priors: &[Cluster],
    mut new_id: impl FnMut() -> String,
) -> IdentityPlan {
    // group index → (overlap, prior id)
    let mut best: HashMap<usize, (usize, &str)> = HashMap::new();

    for prior in priors.iter().filter(|p| !p.retired) {
        for (g, group) in groups.iter().enumerate() {
            let overlap = group.members.intersection(&prior.members).count();
            if overlap * 2 <= prior.members.len() {
                continue;
            }
            let better = match best.get(&g) {
                None => true,
                Some(&(o, id)) => overlap > o || (overlap == o && prior.cluster_id.as_str() < id),
            };
            if better {
                best.insert(g, (overlap, prior.cluster_id.as_str()));
            }
        }
    }

    let kept: HashSet<&str> = best.values().map(|(_, id)| *id).collect();
    let mut retired: Vec<String> = priors
        .iter()
        .filter(|p| !p.retired && !kept.contains(p.cluster_id.as_str()))
        .map(|p| p.cluster_id.clone())
        .collect();
    retired.sort();
    retired.dedup();

    let clusters = groups
        .into_iter()
        .enumerate()
        .map(|(g, group)| match best.get(&g) {
            Some((_, id)) => IdentifiedGroup {
                cluster_id: id.to_string(),
                inherited_from: Some(id.to_string()),
                group,
            },
            None => IdentifiedGroup {
                cluster_id: new_id(),
                inherited_from: None,
                group,
            },
        })
        .collect();

    IdentityPlan { clusters, retired }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::model::SourceRecord;
    use crate::normalizer::Normalizer;

    fn create_test_records(rows: &[(&str, &str)]) -> HashMap<String, NormalizedRecord> {
        let normalizer = Normalizer::new(&ResolutionConfig::default());
        rows.iter()
            .map(|(id, dob)| {
                let mut record = SourceRecord::new(*id, "core_banking", Utc::now()).with_field("last_name", "Smith");
                if !dob.is_empty() {
                    record = record.with_field("date_of_birth", *dob);
                }
                (id.to_string(), normalizer.normalize(&record))
            })
            .collect()
    }

    fn edge(a: &str, b: &str, composite: f64) -> MergeEdge {
        MergeEdge {
            pair: PairKey::new(a, b),
            composite,
            decided_by: DecidedBy::System,
        }
    }

    fn contradiction_fields() -> Vec<String> {
        vec!["date_of_birth".to_string(), "ssn_hash".to_string()]
    }

    fn cluster(id: &str, members: &[&str]) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            edges: vec![],
            retired: false,
        }
    }

    #[test]
    fn test_transitive_closure() {
        let records = create_test_records(&[("A", ""), ("B", ""), ("C", "")]);
        let fields = contradiction_fields();
        let mut builder = ClusterBuilder::new(&records, &fields, HashSet::new(), Utc::now());

        assert_eq!(builder.add_edge(edge("A", "B", 0.95)), EdgeOutcome::Joined);
        assert_eq!(builder.add_edge(edge("B", "C", 0.93)), EdgeOutcome::Joined);

        let groups = builder.finish();
        assert_eq!(groups.len(), 1);
        let members: Vec<&str> = groups[0].members.iter().map(String::as_str).collect();
        assert_eq!(members, vec!["A", "B", "C"]);
        assert_eq!(groups[0].edges.len(), 2);
    }

    #[test]
    fn test_contradiction_holds_union() {
        let records = create_test_records(&[("A", "1980-01-01"), ("B", ""), ("C", "1975-06-30")]);
        let fields = contradiction_fields();
        let vetted: HashSet<PairKey> = [PairKey::new("A", "B"), PairKey::new("B", "C")].into_iter().collect();
        let mut builder = ClusterBuilder::new(&records, &fields, vetted, Utc::now());

        assert_eq!(builder.add_edge(edge("A", "B", 0.95)), EdgeOutcome::Joined);
        match builder.add_edge(edge("B", "C", 0.93)) {
            EdgeOutcome::Held(conflict) => {
                assert_eq!(conflict.conflict_id, "B|C");
                assert_eq!(conflict.status, ConflictStatus::Open);
                assert_eq!(conflict.contradictions.len(), 1);
                assert_eq!(conflict.contradictions[0].field, "date_of_birth");
                assert_eq!(conflict.left_members, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected held union, got {:?}", other),
        }

        // C stays out; a singleton is not a cluster
        let groups = builder.finish();
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].members.contains("C"));
    }

    #[test]
    fn test_directly_compared_pair_is_not_a_contradiction() {
        let records = create_test_records(&[("A", "1980-01-01"), ("B", "1980-01-02")]);
        let fields = contradiction_fields();
        let mut builder = ClusterBuilder::new(&records, &fields, HashSet::new(), Utc::now());
        let vetted_edge = edge("A", "B", 0.97);
        builder.vetted.insert(vetted_edge.pair.clone());
        assert_eq!(builder.add_edge(vetted_edge), EdgeOutcome::Joined);
    }

    #[test]
    fn test_forced_edge_skips_checks() {
        let records = create_test_records(&[("A", "1980-01-01"), ("B", ""), ("C", "1975-06-30")]);
        let fields = contradiction_fields();
        let mut builder = ClusterBuilder::new(&records, &fields, HashSet::new(), Utc::now());
        builder.force_edge(edge("A", "B", 0.95));
        builder.force_edge(edge("B", "C", 0.80));
        assert_eq!(builder.finish()[0].members.len(), 3);
    }

    #[test]
    fn test_seed_without_edges_dissolves() {
        let records = create_test_records(&[("A", ""), ("B", ""), ("C", "")]);
        let fields = contradiction_fields();
        let mut builder = ClusterBuilder::new(&records, &fields, HashSet::new(), Utc::now());
        let members: BTreeSet<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        builder.seed(&members, &[edge("A", "B", 0.95)]);

        let groups = builder.finish();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2);
    }

    #[test]
    fn test_identity_majority_rule() {
        let group = |members: &[&str]| EntityGroup {
            members: members.iter().map(|m| m.to_string()).collect(),
            edges: vec![],
        };
        let priors = vec![cluster("c-1", &["A", "B", "C"]), cluster("c-2", &["D", "E"])];
        let mut counter = 0;
        let plan = assign_identities(
            vec![group(&["A", "B", "C", "D", "E", "F"]), group(&["X", "Y"])],
            &priors,
            || {
                counter += 1;
                format!("new-{}", counter)
            },
        );

        // Both priors claim the merged group; c-1 overlaps more
        assert_eq!(plan.clusters[0].cluster_id, "c-1");
        assert_eq!(plan.clusters[1].cluster_id, "new-1");
        assert_eq!(plan.retired, vec!["c-2".to_string()]);
    }

    #[test]
    fn test_identity_tie_goes_to_lowest_id() {
        let merged = EntityGroup {
            members: ["A", "B", "C", "D"].iter().map(|m| m.to_string()).collect(),
            edges: vec![],
        };
        let priors = vec![cluster("c-9", &["C", "D"]), cluster("c-3", &["A", "B"])];
        let plan = assign_identities(vec![merged], &priors, || "fresh".to_string());
        assert_eq!(plan.clusters[0].cluster_id, "c-3");
        assert_eq!(plan.retired, vec!["c-9".to_string()]);
    }

    #[test]
    fn test_half_split_loses_identity() {
        // Neither half holds a strict majority of the 4 prior members
        let half = |members: &[&str]| EntityGroup {
            members: members.iter().map(|m| m.to_string()).collect(),
            edges: vec![],
        };
        let priors = vec![cluster("c-1", &["A", "B", "C", "D"])];
        let mut n = 0;
        let plan = assign_identities(vec![half(&["A", "B"]), half(&["C", "D"])], &priors, || {
            n += 1;
            format!("n{}", n)
        });
        assert_eq!(plan.clusters[0].cluster_id, "n1");
        assert_eq!(plan.clusters[1].cluster_id, "n2");
        assert_eq!(plan.retired, vec!["c-1".to_string()]);
        println!("✅ Split halves get fresh ids, old id retired");
    }
}
