use anyhow::{anyhow, Result};
use tracing::debug;

use crate::clustering::kmeans::cluster_points;
use crate::clustering::metrics::silhouette_score;
use crate::clustering::MAX_SUBGROUPS;
use crate::TARGET_PIPELINE;

/// The chosen group partition: k selected by silhouette quality.
#[derive(Debug, Clone)]
pub struct GroupingResult {
    pub k: usize,
    pub silhouette: f64,
    pub assignments: Vec<usize>,
    pub centroids: Vec<[f64; 2]>,
}

/// Subgroup partition: one label per voter, globally numbered across
/// all groups, with each subgroup recording its parent group.
#[derive(Debug, Clone)]
pub struct SubgroupPartition {
    pub assignments: Vec<usize>,
    pub centroids: Vec<[f64; 2]>,
    pub parent_groups: Vec<usize>,
}

/// Clusters the full projection set at every candidate k in
/// `[k_min, k_max]` and keeps the partition with the highest
/// silhouette score. Ties favor the smallest k: the first candidate
/// attaining the maximum wins.
///
/// # Arguments
/// * `points` - Voter projections
/// * `weights` - Per-voter vote counts
/// * `k_min`, `k_max` - Group-count search range (default 2..=5)
/// * `seed` - Deterministic clustering seed
pub fn select_groups(
    points: &[[f64; 2]],
    weights: &[f64],
    k_min: usize,
    k_max: usize,
    seed: u64,
) -> Result<GroupingResult> {
    if points.len() < 2 {
        return Err(anyhow!(
            "insufficient data: {} voters cannot form groups",
            points.len()
        ));
    }
    if k_min < 2 || k_min > k_max {
        return Err(anyhow!("invalid group range {}..={}", k_min, k_max));
    }

    let k_max = k_max.min(points.len());
    let mut best: Option<GroupingResult> = None;

    for k in k_min..=k_max {
        let result = cluster_points(points, weights, k, seed.wrapping_add(k as u64))?;
        let silhouette = silhouette_score(points, &result.assignments);
        debug!(
            target: TARGET_PIPELINE,
            "group candidate k={}: silhouette {:.4}", k, silhouette
        );

        if best.as_ref().map_or(true, |b| silhouette > b.silhouette) {
            best = Some(GroupingResult {
                k,
                silhouette,
                assignments: result.assignments,
                centroids: result.centroids,
            });
        }
    }

    best.ok_or_else(|| anyhow!("group range {}..={} produced no candidates", k_min, k_max))
}

/// Re-clusters each group's members into up to three subgroups. A
/// group with fewer than two members becomes a single trivial
/// subgroup. Subgroup labels are sequential across the whole run.
pub fn split_subgroups(
    points: &[[f64; 2]],
    weights: &[f64],
    group_assignments: &[usize],
    group_count: usize,
    seed: u64,
) -> Result<SubgroupPartition> {
    let mut assignments = vec![usize::MAX; points.len()];
    let mut centroids = Vec::new();
    let mut parent_groups = Vec::new();

    for group in 0..group_count {
        let members: Vec<usize> = group_assignments
            .iter()
            .enumerate()
            .filter(|&(_, &g)| g == group)
            .map(|(i, _)| i)
            .collect();

        if members.is_empty() {
            continue;
        }

        if members.len() < 2 {
            let label = centroids.len();
            assignments[members[0]] = label;
            centroids.push(points[members[0]]);
            parent_groups.push(group);
            continue;
        }

        let member_points: Vec<[f64; 2]> = members.iter().map(|&i| points[i]).collect();
        let member_weights: Vec<f64> = members.iter().map(|&i| weights[i]).collect();
        let k = MAX_SUBGROUPS.min(members.len());
        let result = cluster_points(
            &member_points,
            &member_weights,
            k,
            seed.wrapping_add(group as u64),
        )?;

        let offset = centroids.len();
        for (local, &voter_index) in members.iter().enumerate() {
            assignments[voter_index] = offset + result.assignments[local];
        }
        for centroid in result.centroids {
            centroids.push(centroid);
            parent_groups.push(group);
        }
    }

    if assignments.iter().any(|&a| a == usize::MAX) {
        return Err(anyhow!("subgroup split left voters unassigned"));
    }

    Ok(SubgroupPartition {
        assignments,
        centroids,
        parent_groups,
    })
}
