use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::clustering::types::{ClusterType, Opinion, RunStatus, VoterId};
use crate::clustering::DRIFT_CONSENSUS_DELTA;
use crate::db::Database;
use crate::TARGET_PIPELINE;

/// Group cluster index → member voter identities, for one run.
pub type ClusterMembers = HashMap<i64, HashSet<VoterId>>;

/// How an earlier cluster relates to its best match one run later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Continuation,
    Split,
    Merge,
    Shuffle,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Continuation => "continuation",
            TransitionKind::Split => "split",
            TransitionKind::Merge => "merge",
            TransitionKind::Shuffle => "shuffle",
        }
    }
}

/// An earlier-run cluster matched to its largest-overlap successor.
#[derive(Debug, Clone)]
pub struct ClusterTransition {
    pub from_cluster: i64,
    pub to_cluster: i64,
    /// Shared voters between the two clusters.
    pub overlap: usize,
    /// overlap / |earlier cluster ∩ common voters|
    pub from_retention: f64,
    /// overlap / |later cluster ∩ common voters|
    pub to_retention: f64,
    pub kind: TransitionKind,
}

/// Full comparison of two consecutive runs.
#[derive(Debug, Clone)]
pub struct RunComparison {
    pub from_run: i64,
    pub to_run: i64,
    pub common_voters: usize,
    pub transitions: Vec<ClusterTransition>,
    /// Overlap-weighted mean retention across matched pairs, in [0,1].
    pub stability: f64,
}

/// Derived predecessor/successor links for one cluster. Cluster ids
/// are only stable within a run; these links are inferred relations,
/// never identity.
#[derive(Debug, Clone)]
pub struct ClusterLineage {
    pub run_id: i64,
    pub cluster_index: i64,
    pub predecessors: Vec<(i64, i64)>,
    pub successors: Vec<(i64, i64)>,
}

/// A matched cluster pair changing its stance on one article.
#[derive(Debug, Clone)]
pub struct OpinionDrift {
    pub article_id: i64,
    pub from_cluster: i64,
    pub to_cluster: i64,
    pub from_majority: Opinion,
    pub to_majority: Opinion,
    pub consensus_delta: f64,
    pub significant: bool,
}

fn classify(from_retention: f64, to_retention: f64) -> TransitionKind {
    if from_retention > 0.8 && to_retention > 0.8 {
        TransitionKind::Continuation
    } else if from_retention > 0.5 && to_retention < 0.7 {
        TransitionKind::Split
    } else if from_retention < 0.7 && to_retention > 0.5 {
        TransitionKind::Merge
    } else {
        TransitionKind::Shuffle
    }
}

/// Compares group memberships of two runs. Each earlier cluster is
/// matched to the later cluster sharing the most voters; pairs with
/// overlap below `min_overlap` stay unmatched. Retention ratios are
/// taken over the voters common to both runs.
///
/// # Arguments
/// * `from_run`, `to_run` - Run ids, for labeling the comparison
/// * `from`, `to` - Group cluster memberships of each run
/// * `min_overlap` - Minimum shared voters for a match (default 5)
pub fn compare_memberships(
    from_run: i64,
    to_run: i64,
    from: &ClusterMembers,
    to: &ClusterMembers,
    min_overlap: usize,
) -> RunComparison {
    let from_voters: HashSet<&VoterId> = from.values().flatten().collect();
    let to_voters: HashSet<&VoterId> = to.values().flatten().collect();
    let common: HashSet<&VoterId> = from_voters.intersection(&to_voters).copied().collect();

    let mut transitions = Vec::new();
    let mut from_clusters: Vec<&i64> = from.keys().collect();
    from_clusters.sort();

    for &from_cluster in from_clusters {
        let from_common: HashSet<&VoterId> = from[&from_cluster]
            .iter()
            .filter(|v| common.contains(v))
            .collect();
        if from_common.is_empty() {
            continue;
        }

        // Best match: largest overlap, smallest index on ties.
        let mut best: Option<(i64, usize)> = None;
        let mut to_clusters: Vec<&i64> = to.keys().collect();
        to_clusters.sort();
        for &to_cluster in to_clusters {
            let overlap = to[&to_cluster]
                .iter()
                .filter(|v| from_common.contains(v))
                .count();
            if best.map_or(true, |(_, b)| overlap > b) {
                best = Some((to_cluster, overlap));
            }
        }

        let Some((to_cluster, overlap)) = best else {
            continue;
        };
        if overlap < min_overlap {
            continue;
        }

        let to_common = to[&to_cluster]
            .iter()
            .filter(|v| common.contains(v))
            .count();
        let from_retention = overlap as f64 / from_common.len() as f64;
        let to_retention = if to_common > 0 {
            overlap as f64 / to_common as f64
        } else {
            0.0
        };

        transitions.push(ClusterTransition {
            from_cluster,
            to_cluster,
            overlap,
            from_retention,
            to_retention,
            kind: classify(from_retention, to_retention),
        });
    }

    let weight: usize = transitions.iter().map(|t| t.overlap).sum();
    let stability = if weight > 0 {
        transitions
            .iter()
            .map(|t| t.overlap as f64 * (t.from_retention + t.to_retention) / 2.0)
            .sum::<f64>()
            / weight as f64
    } else {
        0.0
    };

    RunComparison {
        from_run,
        to_run,
        common_voters: common.len(),
        transitions,
        stability,
    }
}

/// Extends pairwise comparison across an ordered run sequence,
/// building predecessor/successor links per cluster.
pub fn track_lineage(
    sequence: &[(i64, ClusterMembers)],
    min_overlap: usize,
) -> Vec<ClusterLineage> {
    let mut lineage: HashMap<(i64, i64), ClusterLineage> = HashMap::new();
    for (run_id, members) in sequence {
        for &cluster_index in members.keys() {
            lineage.insert(
                (*run_id, cluster_index),
                ClusterLineage {
                    run_id: *run_id,
                    cluster_index,
                    predecessors: Vec::new(),
                    successors: Vec::new(),
                },
            );
        }
    }

    for pair in sequence.windows(2) {
        let (from_run, from_members) = &pair[0];
        let (to_run, to_members) = &pair[1];
        let comparison =
            compare_memberships(*from_run, *to_run, from_members, to_members, min_overlap);

        for transition in comparison.transitions {
            if let Some(entry) = lineage.get_mut(&(*from_run, transition.from_cluster)) {
                entry.successors.push((*to_run, transition.to_cluster));
            }
            if let Some(entry) = lineage.get_mut(&(*to_run, transition.to_cluster)) {
                entry.predecessors.push((*from_run, transition.from_cluster));
            }
        }
    }

    let mut result: Vec<ClusterLineage> = lineage.into_values().collect();
    result.sort_by_key(|l| (l.run_id, l.cluster_index));
    result
}

/// Compares the stance matched clusters take on the same articles
/// across two runs. Drift is significant when the majority opinion
/// flipped or the consensus score moved by more than 0.2.
///
/// # Arguments
/// * `transitions` - Matched pairs from `compare_memberships`
/// * `from_patterns`, `to_patterns` - (cluster index, article) →
///   (majority opinion, consensus score) per run
pub fn detect_drift(
    transitions: &[ClusterTransition],
    from_patterns: &HashMap<(i64, i64), (Opinion, f64)>,
    to_patterns: &HashMap<(i64, i64), (Opinion, f64)>,
) -> Vec<OpinionDrift> {
    let mut drifts = Vec::new();
    for transition in transitions {
        let mut articles: Vec<i64> = from_patterns
            .keys()
            .filter(|(cluster, _)| *cluster == transition.from_cluster)
            .map(|&(_, article)| article)
            .collect();
        articles.sort_unstable();

        for article_id in articles {
            let Some(&(from_majority, from_consensus)) =
                from_patterns.get(&(transition.from_cluster, article_id))
            else {
                continue;
            };
            let Some(&(to_majority, to_consensus)) =
                to_patterns.get(&(transition.to_cluster, article_id))
            else {
                continue;
            };

            let consensus_delta = to_consensus - from_consensus;
            let significant =
                from_majority != to_majority || consensus_delta.abs() > DRIFT_CONSENSUS_DELTA;
            drifts.push(OpinionDrift {
                article_id,
                from_cluster: transition.from_cluster,
                to_cluster: transition.to_cluster,
                from_majority,
                to_majority,
                consensus_delta,
                significant,
            });
        }
    }
    drifts
}

/// Loads one completed run's group memberships keyed by cluster index.
pub async fn load_group_members(db: &Database, run_id: i64) -> Result<ClusterMembers> {
    let run = db
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("run {} not found", run_id))?;
    if run.status != RunStatus::Completed {
        return Err(anyhow!("run {} is not completed", run_id));
    }

    let mut members: ClusterMembers = HashMap::new();
    for membership in db.memberships_for_run(run_id, ClusterType::Group).await? {
        members
            .entry(membership.cluster_index)
            .or_default()
            .insert(membership.voter);
    }
    Ok(members)
}

/// Compares two completed runs by id.
pub async fn compare_runs(
    db: &Database,
    from_run: i64,
    to_run: i64,
    min_overlap: usize,
) -> Result<RunComparison> {
    let from = load_group_members(db, from_run).await?;
    let to = load_group_members(db, to_run).await?;
    let comparison = compare_memberships(from_run, to_run, &from, &to, min_overlap);
    info!(
        target: TARGET_PIPELINE,
        "Compared runs {} -> {}: {} transitions, stability {:.3}",
        from_run,
        to_run,
        comparison.transitions.len(),
        comparison.stability
    );
    Ok(comparison)
}

/// Builds lineage links across an ordered sequence of completed runs.
pub async fn run_lineage(
    db: &Database,
    run_ids: &[i64],
    min_overlap: usize,
) -> Result<Vec<ClusterLineage>> {
    let mut sequence = Vec::with_capacity(run_ids.len());
    for &run_id in run_ids {
        sequence.push((run_id, load_group_members(db, run_id).await?));
    }
    Ok(track_lineage(&sequence, min_overlap))
}

/// Detects opinion drift between matched group clusters of two runs.
pub async fn detect_run_drift(
    db: &Database,
    from_run: i64,
    to_run: i64,
    min_overlap: usize,
) -> Result<Vec<OpinionDrift>> {
    let comparison = compare_runs(db, from_run, to_run, min_overlap).await?;
    let from_patterns = db
        .voting_patterns_for_run(from_run, ClusterType::Group)
        .await?;
    let to_patterns = db
        .voting_patterns_for_run(to_run, ClusterType::Group)
        .await?;

    let key = |patterns: Vec<(i64, crate::clustering::types::VotingPatternSnapshot)>| {
        patterns
            .into_iter()
            .map(|(cluster, p)| {
                (
                    (cluster, p.article_id),
                    (p.majority_opinion, p.consensus_score),
                )
            })
            .collect::<HashMap<_, _>>()
    };

    Ok(detect_drift(
        &comparison.transitions,
        &key(from_patterns),
        &key(to_patterns),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(clusters: &[(i64, &[i64])]) -> ClusterMembers {
        clusters
            .iter()
            .map(|&(index, users)| {
                (
                    index,
                    users.iter().map(|&u| VoterId::User(u)).collect::<HashSet<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn identical_runs_are_pure_continuation() {
        let from = members(&[(0, &[1, 2, 3, 4, 5]), (1, &[6, 7, 8, 9, 10])]);
        let to = from.clone();
        let comparison = compare_memberships(1, 2, &from, &to, 5);

        assert_eq!(comparison.common_voters, 10);
        assert_eq!(comparison.transitions.len(), 2);
        for transition in &comparison.transitions {
            assert_eq!(transition.kind, TransitionKind::Continuation);
            assert_eq!(transition.from_retention, 1.0);
            assert_eq!(transition.to_retention, 1.0);
        }
        assert_eq!(comparison.stability, 1.0);
    }

    #[test]
    fn partial_retention_classifies_as_split() {
        // 6 of cluster 0's 10 voters land together in a later cluster
        // that also absorbed 4 newcomers shared with run one.
        let from = members(&[
            (0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
            (1, &[11, 12, 13, 14]),
        ]);
        let to = members(&[
            (0, &[1, 2, 3, 4, 5, 6, 11, 12, 13, 14]),
            (1, &[7, 8, 9, 10]),
        ]);
        let comparison = compare_memberships(1, 2, &from, &to, 1);

        let first = comparison
            .transitions
            .iter()
            .find(|t| t.from_cluster == 0)
            .unwrap();
        assert_eq!(first.overlap, 6);
        assert!((first.from_retention - 0.6).abs() < 1e-9);
        assert!((first.to_retention - 0.6).abs() < 1e-9);
        assert_eq!(first.kind, TransitionKind::Split);
    }

    #[test]
    fn absorption_classifies_as_merge() {
        // Cluster 0 keeps 6 of 10 voters in a later cluster made
        // almost entirely of them.
        let from = members(&[(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), (1, &[11, 12])]);
        let to = members(&[(0, &[1, 2, 3, 4, 5, 6, 11, 12]), (1, &[7, 8, 9, 10])]);
        let comparison = compare_memberships(1, 2, &from, &to, 1);

        let first = comparison
            .transitions
            .iter()
            .find(|t| t.from_cluster == 0)
            .unwrap();
        assert!((first.from_retention - 0.6).abs() < 1e-9);
        assert!((first.to_retention - 0.75).abs() < 1e-9);
        assert_eq!(first.kind, TransitionKind::Merge);
    }

    #[test]
    fn low_overlap_pairs_stay_unmatched() {
        let from = members(&[(0, &[1, 2, 3])]);
        let to = members(&[(0, &[1, 2, 3])]);
        let comparison = compare_memberships(1, 2, &from, &to, 5);
        assert!(comparison.transitions.is_empty());
        assert_eq!(comparison.stability, 0.0);
    }

    #[test]
    fn lineage_links_run_in_both_directions() {
        let a = members(&[(0, &[1, 2, 3, 4, 5])]);
        let b = members(&[(0, &[1, 2, 3, 4, 5])]);
        let c = members(&[(0, &[1, 2, 3, 4, 5])]);
        let lineage = track_lineage(&[(1, a), (2, b), (3, c)], 5);

        assert_eq!(lineage.len(), 3);
        let middle = lineage.iter().find(|l| l.run_id == 2).unwrap();
        assert_eq!(middle.predecessors, vec![(1, 0)]);
        assert_eq!(middle.successors, vec![(3, 0)]);
    }

    #[test]
    fn drift_flags_flips_and_large_deltas() {
        let transitions = vec![ClusterTransition {
            from_cluster: 0,
            to_cluster: 0,
            overlap: 5,
            from_retention: 1.0,
            to_retention: 1.0,
            kind: TransitionKind::Continuation,
        }];
        let from_patterns: HashMap<(i64, i64), (Opinion, f64)> = [
            ((0, 10), (Opinion::Positive, 0.9)),
            ((0, 11), (Opinion::Positive, 0.8)),
            ((0, 12), (Opinion::Positive, 0.6)),
        ]
        .into();
        let to_patterns: HashMap<(i64, i64), (Opinion, f64)> = [
            ((0, 10), (Opinion::Negative, 0.9)), // majority flip
            ((0, 11), (Opinion::Positive, 0.75)), // small delta
            ((0, 12), (Opinion::Positive, 0.9)), // large delta
        ]
        .into();

        let drifts = detect_drift(&transitions, &from_patterns, &to_patterns);
        assert_eq!(drifts.len(), 3);
        assert!(drifts.iter().find(|d| d.article_id == 10).unwrap().significant);
        assert!(!drifts.iter().find(|d| d.article_id == 11).unwrap().significant);
        assert!(drifts.iter().find(|d| d.article_id == 12).unwrap().significant);
    }
}
