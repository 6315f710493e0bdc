use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

use crate::clustering::grouping::{select_groups, split_subgroups};
use crate::clustering::kmeans::{cluster_points, default_base_k};
use crate::clustering::matrix::build_vote_matrix;
use crate::clustering::metrics::{
    aggregate_cluster_votes, consensus_score, euclidean_distance, OpinionCounts,
};
use crate::clustering::naming::{ClusterFacts, ClusterNamer};
use crate::clustering::projection::project_matrix;
use crate::clustering::types::{
    ClusterSnapshot, ClusterType, MembershipSnapshot, ProjectionSnapshot, RunSnapshot, Vote,
    VoterId, VotingPatternSnapshot,
};
use crate::clustering::TOP_ARTICLES_PER_CLUSTER;
use crate::db::Database;
use crate::TARGET_PIPELINE;

/// Parameters for one pipeline invocation. Scheduled runs use the
/// defaults; manual runs override them explicitly.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub window_days: i64,
    pub min_votes_per_voter: usize,
    pub min_voters: usize,
    /// Explicit base cluster count; derived from voter count when None.
    pub base_k: Option<usize>,
    pub group_k_min: usize,
    pub group_k_max: usize,
    pub seed: u64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        PipelineParams {
            window_days: 30,
            min_votes_per_voter: 7,
            min_voters: 10,
            base_k: None,
            group_k_min: 2,
            group_k_max: 5,
            seed: 0,
        }
    }
}

/// What one invocation produced. Skips are normal operation, not
/// errors: the scheduler keeps running either way.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        run_id: i64,
        voter_count: usize,
        article_count: usize,
        group_count: usize,
    },
    Skipped {
        reason: String,
    },
}

/// Runs the full clustering pipeline: vote matrix → projection → base
/// clusters → groups → subgroups → metrics, staged in memory and
/// committed as one snapshot before the run flips to completed.
///
/// Insufficient data marks the run failed with a reason and returns
/// `Skipped`. A pending or running run from a concurrent invocation
/// also yields `Skipped` without creating anything.
///
/// # Arguments
/// * `db` - Vote store and run persistence
/// * `params` - Window, thresholds and k ranges for this run
/// * `namer` - Optional naming collaborator; its failures are logged
///   and tolerated
pub async fn run_clustering(
    db: &Database,
    params: &PipelineParams,
    namer: Option<&dyn ClusterNamer>,
) -> Result<RunOutcome> {
    if db.has_active_run().await? {
        info!(target: TARGET_PIPELINE, "Skipping: another run is already in progress");
        return Ok(RunOutcome::Skipped {
            reason: "another run is already in progress".to_string(),
        });
    }

    let run_id = db
        .create_run(
            params.window_days,
            params.min_votes_per_voter as i64,
            params.min_voters as i64,
        )
        .await?;
    db.mark_run_running(run_id).await?;

    let started = Instant::now();
    match compute_run(db, run_id, params, namer).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Terminal failure; the run stays invisible to readers and
            // the whole pipeline is retryable from scratch.
            let reason = format!("{:#}", e);
            if let Err(mark_err) = db.mark_run_failed(run_id, &reason).await {
                warn!(
                    target: TARGET_PIPELINE,
                    "Could not mark run {} failed: {}", run_id, mark_err
                );
            }
            if reason.contains("insufficient data") {
                info!(
                    target: TARGET_PIPELINE,
                    "Run {} skipped after {:?}: {}",
                    run_id,
                    started.elapsed(),
                    reason
                );
                return Ok(RunOutcome::Skipped { reason });
            }
            Err(e)
        }
    }
}

async fn compute_run(
    db: &Database,
    run_id: i64,
    params: &PipelineParams,
    namer: Option<&dyn ClusterNamer>,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let cutoff = Utc::now() - Duration::days(params.window_days);
    let votes = db.votes_since(cutoff).await?;
    info!(
        target: TARGET_PIPELINE,
        "Run {}: {} votes in the last {} days", run_id, votes.len(), params.window_days
    );

    let matrix = build_vote_matrix(&votes, cutoff, params.min_votes_per_voter);
    let min_voters = params.min_voters.max(2);
    if matrix.voter_count() < min_voters {
        return Err(anyhow!(
            "insufficient data: {} qualified voters, need at least {}",
            matrix.voter_count(),
            min_voters
        ));
    }

    let projection = project_matrix(&matrix)?;
    let coords = &projection.coords;
    let weights: Vec<f64> = projection.vote_counts.iter().map(|&c| c as f64).collect();
    let voters = matrix.voters();
    let seed = params.seed ^ run_id as u64;

    // Base clusters: fine-grained partition of all voters.
    let base_k = params
        .base_k
        .unwrap_or_else(|| default_base_k(voters.len()))
        .min(voters.len());
    let base = cluster_points(coords, &weights, base_k, seed)?;
    info!(
        target: TARGET_PIPELINE,
        "Run {}: {} base clusters, inertia {:.4}", run_id, base_k, base.inertia
    );

    // Groups: silhouette-selected human-scale partition.
    let groups = select_groups(
        coords,
        &weights,
        params.group_k_min,
        params.group_k_max,
        seed.wrapping_add(1),
    )?;
    info!(
        target: TARGET_PIPELINE,
        "Run {}: selected {} groups (silhouette {:.4})", run_id, groups.k, groups.silhouette
    );

    let subgroups = split_subgroups(
        coords,
        &weights,
        &groups.assignments,
        groups.k,
        seed.wrapping_add(2),
    )?;

    // Stage the complete snapshot in memory.
    let mut snapshot = RunSnapshot::default();
    for (i, voter) in voters.iter().enumerate() {
        snapshot.projections.push(ProjectionSnapshot {
            voter: voter.clone(),
            x: coords[i][0],
            y: coords[i][1],
            vote_count: projection.vote_counts[i] as i64,
        });
    }

    stage_partition(
        &mut snapshot,
        ClusterType::Base,
        &base.assignments,
        &base.centroids,
        coords,
        voters,
        &votes,
    );
    stage_partition(
        &mut snapshot,
        ClusterType::Group,
        &groups.assignments,
        &groups.centroids,
        coords,
        voters,
        &votes,
    );
    stage_partition(
        &mut snapshot,
        ClusterType::Subgroup,
        &subgroups.assignments,
        &subgroups.centroids,
        coords,
        voters,
        &votes,
    );

    let cluster_count = snapshot.clusters.len() as i64;
    db.write_snapshot(run_id, &snapshot).await?;

    if let Some(namer) = namer {
        annotate_group_clusters(db, run_id, &snapshot, namer).await?;
    }

    let run_params = json!({
        "variance_explained": projection.explained_variance,
        "base_k": base_k,
        "base_inertia": base.inertia,
        "group_k": groups.k,
        "silhouette": groups.silhouette,
        "subgroup_count": subgroups.centroids.len(),
        "seed": seed,
    });
    db.complete_run(
        run_id,
        voters.len() as i64,
        matrix.article_count() as i64,
        cluster_count,
        started.elapsed().as_millis() as i64,
        &run_params,
    )
    .await?;

    info!(
        target: TARGET_PIPELINE,
        "Run {} completed in {:?}: {} voters, {} articles, {} groups",
        run_id,
        started.elapsed(),
        voters.len(),
        matrix.article_count(),
        groups.k
    );

    Ok(RunOutcome::Completed {
        run_id,
        voter_count: voters.len(),
        article_count: matrix.article_count(),
        group_count: groups.k,
    })
}

/// Stages clusters and memberships for one partition. Persisted
/// centroids are the plain mean of member projections, so the stored
/// invariant "centroid = mean of members" holds exactly even though
/// the iteration itself used weighted updates.
fn stage_partition(
    snapshot: &mut RunSnapshot,
    cluster_type: ClusterType,
    assignments: &[usize],
    centroids: &[[f64; 2]],
    coords: &[[f64; 2]],
    voters: &[VoterId],
    votes: &[Vote],
) {
    for (index, &fallback_centroid) in centroids.iter().enumerate() {
        let member_indices: Vec<usize> = assignments
            .iter()
            .enumerate()
            .filter(|&(_, &a)| a == index)
            .map(|(i, _)| i)
            .collect();

        let centroid = if member_indices.is_empty() {
            fallback_centroid
        } else {
            let n = member_indices.len() as f64;
            let sum = member_indices
                .iter()
                .fold([0.0, 0.0], |acc, &i| [acc[0] + coords[i][0], acc[1] + coords[i][1]]);
            [sum[0] / n, sum[1] / n]
        };

        let members: HashSet<VoterId> =
            member_indices.iter().map(|&i| voters[i].clone()).collect();
        let counts = aggregate_cluster_votes(votes, &members);
        let consensus = consensus_score(&counts);

        let mut patterns: Vec<VotingPatternSnapshot> = counts
            .iter()
            .map(|(&article_id, c)| VotingPatternSnapshot {
                article_id,
                positive_count: c.positive,
                negative_count: c.negative,
                neutral_count: c.neutral,
                majority_opinion: c.majority(),
                consensus_score: c.consensus(),
            })
            .collect();
        patterns.sort_by_key(|p| p.article_id);

        snapshot.clusters.push(ClusterSnapshot {
            cluster_type,
            index: index as i64,
            size: member_indices.len() as i64,
            centroid,
            consensus_score: consensus,
            name: None,
            description: None,
            top_positive_articles: top_articles(&counts, |c| c.positive),
            top_negative_articles: top_articles(&counts, |c| c.negative),
            patterns,
        });

        for &i in &member_indices {
            snapshot.memberships.push(MembershipSnapshot {
                voter: voters[i].clone(),
                cluster_type,
                cluster_index: index as i64,
                distance: euclidean_distance(coords[i], centroid),
            });
        }
    }
}

fn top_articles(
    counts: &std::collections::HashMap<i64, OpinionCounts>,
    key: impl Fn(&OpinionCounts) -> i64,
) -> Vec<i64> {
    let mut ranked: Vec<(i64, i64)> = counts
        .iter()
        .map(|(&article, c)| (article, key(c)))
        .filter(|&(_, count)| count > 0)
        .collect();
    ranked.sort_by_key(|&(article, count)| (std::cmp::Reverse(count), article));
    ranked
        .into_iter()
        .take(TOP_ARTICLES_PER_CLUSTER)
        .map(|(article, _)| article)
        .collect()
}

/// Asks the naming collaborator for a name and description per group
/// cluster. Failures are logged and leave the fields empty; they never
/// abort the run.
async fn annotate_group_clusters(
    db: &Database,
    run_id: i64,
    snapshot: &RunSnapshot,
    namer: &dyn ClusterNamer,
) -> Result<()> {
    let stored = db.clusters_for_run(run_id, ClusterType::Group).await?;
    for cluster in &stored {
        let Some(staged) = snapshot
            .clusters
            .iter()
            .find(|c| c.cluster_type == ClusterType::Group && c.index == cluster.index)
        else {
            continue;
        };

        let mut by_consensus: Vec<&VotingPatternSnapshot> = staged.patterns.iter().collect();
        by_consensus.sort_by(|a, b| {
            b.consensus_score
                .partial_cmp(&a.consensus_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let facts = ClusterFacts {
            cluster_index: cluster.index,
            size: staged.size,
            consensus_score: staged.consensus_score,
            top_consensus_articles: by_consensus
                .iter()
                .take(TOP_ARTICLES_PER_CLUSTER)
                .map(|p| p.article_id)
                .collect(),
            positive_articles: staged.top_positive_articles.clone(),
            negative_articles: staged.top_negative_articles.clone(),
        };

        match namer.summarize(&facts).await {
            Ok(summary) => {
                db.update_cluster_annotation(cluster.id, &summary.name, &summary.description)
                    .await?;
            }
            Err(e) => {
                warn!(
                    target: TARGET_PIPELINE,
                    "Naming failed for group cluster {} of run {}: {}",
                    cluster.index,
                    run_id,
                    e
                );
            }
        }
    }
    Ok(())
}
