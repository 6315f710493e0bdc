use anyhow::{anyhow, Result};
use chrono::Duration;
use std::collections::HashMap;
use tracing::info;

use crate::clustering::metrics::OpinionCounts;
use crate::clustering::types::{ClusterType, Opinion, RunStatus, Vote, VoterId};
use crate::clustering::{CONSENSUS_ARTICLE_THRESHOLD, POLARIZED_ARTICLE_THRESHOLD};
use crate::db::Database;
use crate::TARGET_PIPELINE;

/// One group cluster's stance on one article.
#[derive(Debug, Clone)]
pub struct ClusterShare {
    pub cluster_index: i64,
    pub counts: OpinionCounts,
    pub majority: Opinion,
    pub positive_share: f64,
}

/// Cross-cluster agreement profile for one article. Only articles with
/// at least two qualifying clusters are ever scored.
#[derive(Debug, Clone)]
pub struct ArticleAlignment {
    pub article_id: i64,
    /// Plurality vote across cluster majorities, not vote-weighted.
    pub overall_majority: Opinion,
    /// Fraction of clusters sharing the overall majority.
    pub agreement_rate: f64,
    pub consensus_score: f64,
    /// Variance of the positive proportion across clusters.
    pub polarization_score: f64,
    pub clusters: Vec<ClusterShare>,
}

/// Run-level rollup of per-article alignment scores.
#[derive(Debug, Clone, Default)]
pub struct AlignmentSummary {
    pub article_count: usize,
    pub mean_consensus: f64,
    pub mean_polarization: f64,
    pub consensus_articles: usize,
    pub polarized_articles: usize,
}

/// Scores every article by how much the group clusters agree on it.
///
/// Votes are tallied per (article, cluster); pairs with fewer than
/// `min_votes_per_cluster` votes are discarded, and an article needs
/// at least two surviving clusters to be scored at all.
///
/// # Arguments
/// * `votes` - Raw votes (later votes on the same article override)
/// * `assignments` - Voter identity → group cluster index
/// * `min_votes_per_cluster` - Qualification threshold per pair
pub fn analyze_vote_alignment(
    votes: &[Vote],
    assignments: &HashMap<VoterId, i64>,
    min_votes_per_cluster: i64,
) -> Vec<ArticleAlignment> {
    // Latest vote per (voter, article) among voters with a group.
    let mut latest: HashMap<(&VoterId, i64), &Vote> = HashMap::new();
    for vote in votes {
        if !assignments.contains_key(&vote.voter) {
            continue;
        }
        let key = (&vote.voter, vote.article_id);
        match latest.get(&key) {
            Some(seen) if seen.voted_at >= vote.voted_at => {}
            _ => {
                latest.insert(key, vote);
            }
        }
    }

    let mut per_article: HashMap<i64, HashMap<i64, OpinionCounts>> = HashMap::new();
    for vote in latest.values() {
        let cluster = assignments[&vote.voter];
        per_article
            .entry(vote.article_id)
            .or_default()
            .entry(cluster)
            .or_default()
            .add(vote.opinion);
    }

    let mut alignments = Vec::new();
    for (article_id, by_cluster) in per_article {
        let mut shares: Vec<ClusterShare> = by_cluster
            .into_iter()
            .filter(|(_, counts)| counts.total() >= min_votes_per_cluster)
            .map(|(cluster_index, counts)| ClusterShare {
                cluster_index,
                counts,
                majority: counts.majority(),
                positive_share: counts.proportion(Opinion::Positive),
            })
            .collect();

        if shares.len() < 2 {
            continue;
        }
        shares.sort_by_key(|s| s.cluster_index);

        let mut majority_votes: HashMap<Opinion, usize> = HashMap::new();
        for share in &shares {
            *majority_votes.entry(share.majority).or_default() += 1;
        }
        let overall_majority = plurality(&majority_votes);
        let agreement_rate = majority_votes[&overall_majority] as f64 / shares.len() as f64;

        let mean_positive =
            shares.iter().map(|s| s.positive_share).sum::<f64>() / shares.len() as f64;
        let polarization_score = shares
            .iter()
            .map(|s| (s.positive_share - mean_positive).powi(2))
            .sum::<f64>()
            / shares.len() as f64;

        alignments.push(ArticleAlignment {
            article_id,
            overall_majority,
            agreement_rate,
            consensus_score: agreement_rate,
            polarization_score,
            clusters: shares,
        });
    }

    alignments.sort_by_key(|a| a.article_id);
    alignments
}

/// Plurality opinion among cluster majorities; ties resolve positive,
/// negative, neutral in that order.
fn plurality(votes: &HashMap<Opinion, usize>) -> Opinion {
    let mut best = Opinion::Positive;
    let mut best_count = 0usize;
    for opinion in [Opinion::Positive, Opinion::Negative, Opinion::Neutral] {
        let count = votes.get(&opinion).copied().unwrap_or(0);
        if count > best_count {
            best = opinion;
            best_count = count;
        }
    }
    best
}

/// The `limit` most polarizing articles, highest variance first.
pub fn divisive_articles(alignments: &[ArticleAlignment], limit: usize) -> Vec<&ArticleAlignment> {
    let mut ranked: Vec<&ArticleAlignment> = alignments.iter().collect();
    ranked.sort_by(|a, b| {
        b.polarization_score
            .partial_cmp(&a.polarization_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

/// The `limit` strongest consensus articles at or above `threshold`.
pub fn consensus_articles(
    alignments: &[ArticleAlignment],
    threshold: f64,
    limit: usize,
) -> Vec<&ArticleAlignment> {
    let mut ranked: Vec<&ArticleAlignment> = alignments
        .iter()
        .filter(|a| a.consensus_score >= threshold)
        .collect();
    ranked.sort_by(|a, b| {
        b.consensus_score
            .partial_cmp(&a.consensus_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

/// Averages the per-article scores and counts articles above the fixed
/// consensus (≥ 0.7) and polarization (≥ 0.15) cutoffs.
pub fn summarize_alignment(alignments: &[ArticleAlignment]) -> AlignmentSummary {
    if alignments.is_empty() {
        return AlignmentSummary::default();
    }
    let n = alignments.len() as f64;
    AlignmentSummary {
        article_count: alignments.len(),
        mean_consensus: alignments.iter().map(|a| a.consensus_score).sum::<f64>() / n,
        mean_polarization: alignments.iter().map(|a| a.polarization_score).sum::<f64>() / n,
        consensus_articles: alignments
            .iter()
            .filter(|a| a.consensus_score >= CONSENSUS_ARTICLE_THRESHOLD)
            .count(),
        polarized_articles: alignments
            .iter()
            .filter(|a| a.polarization_score >= POLARIZED_ARTICLE_THRESHOLD)
            .count(),
    }
}

/// Loads a completed run's group memberships and window votes, then
/// scores every article across its group clusters.
pub async fn analyze_run(
    db: &Database,
    run_id: i64,
    min_votes_per_cluster: i64,
) -> Result<Vec<ArticleAlignment>> {
    let run = db
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("run {} not found", run_id))?;
    if run.status != RunStatus::Completed {
        return Err(anyhow!("run {} is not completed", run_id));
    }

    let memberships = db.memberships_for_run(run_id, ClusterType::Group).await?;
    let assignments: HashMap<VoterId, i64> = memberships
        .into_iter()
        .map(|m| (m.voter, m.cluster_index))
        .collect();

    let cutoff = run.created_at - Duration::days(run.window_days);
    let votes = db.votes_since(cutoff).await?;

    let alignments = analyze_vote_alignment(&votes, &assignments, min_votes_per_cluster);
    info!(
        target: TARGET_PIPELINE,
        "Alignment analysis for run {}: {} scorable articles", run_id, alignments.len()
    );
    Ok(alignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vote(user: i64, article_id: i64, opinion: Opinion) -> Vote {
        Vote {
            voter: VoterId::User(user),
            article_id,
            opinion,
            voted_at: Utc::now(),
        }
    }

    fn assignments(pairs: &[(i64, i64)]) -> HashMap<VoterId, i64> {
        pairs
            .iter()
            .map(|&(user, cluster)| (VoterId::User(user), cluster))
            .collect()
    }

    #[test]
    fn single_cluster_scores_nothing() {
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Negative),
        ];
        let assignments = assignments(&[(1, 0), (2, 0)]);
        assert!(analyze_vote_alignment(&votes, &assignments, 1).is_empty());
    }

    #[test]
    fn opposed_clusters_polarize() {
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Positive),
            vote(3, 10, Opinion::Negative),
            vote(4, 10, Opinion::Negative),
        ];
        let assignments = assignments(&[(1, 0), (2, 0), (3, 1), (4, 1)]);
        let alignments = analyze_vote_alignment(&votes, &assignments, 2);

        assert_eq!(alignments.len(), 1);
        let article = &alignments[0];
        // Positive shares 1.0 and 0.0: variance 0.25, majorities split.
        assert!((article.polarization_score - 0.25).abs() < 1e-9);
        assert!((article.agreement_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unanimous_clusters_agree() {
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Positive),
            vote(3, 10, Opinion::Positive),
            vote(4, 10, Opinion::Positive),
        ];
        let assignments = assignments(&[(1, 0), (2, 0), (3, 1), (4, 1)]);
        let alignments = analyze_vote_alignment(&votes, &assignments, 2);

        let article = &alignments[0];
        assert_eq!(article.overall_majority, Opinion::Positive);
        assert_eq!(article.agreement_rate, 1.0);
        assert_eq!(article.polarization_score, 0.0);
    }

    #[test]
    fn thin_cluster_pairs_are_discarded() {
        // Cluster 1 has only one vote on the article; below threshold
        // it drops out and the article loses its second cluster.
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Positive),
            vote(3, 10, Opinion::Negative),
        ];
        let assignments = assignments(&[(1, 0), (2, 0), (3, 1)]);
        assert!(analyze_vote_alignment(&votes, &assignments, 2).is_empty());
    }

    #[test]
    fn rankings_and_summary() {
        let votes = vec![
            // Article 10: consensus across clusters.
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Positive),
            vote(3, 10, Opinion::Positive),
            vote(4, 10, Opinion::Positive),
            // Article 11: fully divisive.
            vote(1, 11, Opinion::Positive),
            vote(2, 11, Opinion::Positive),
            vote(3, 11, Opinion::Negative),
            vote(4, 11, Opinion::Negative),
        ];
        let assignments = assignments(&[(1, 0), (2, 0), (3, 1), (4, 1)]);
        let alignments = analyze_vote_alignment(&votes, &assignments, 2);
        assert_eq!(alignments.len(), 2);

        let divisive = divisive_articles(&alignments, 1);
        assert_eq!(divisive[0].article_id, 11);

        let agreed = consensus_articles(&alignments, 0.7, 10);
        assert_eq!(agreed.len(), 1);
        assert_eq!(agreed[0].article_id, 10);

        let summary = summarize_alignment(&alignments);
        assert_eq!(summary.article_count, 2);
        assert_eq!(summary.consensus_articles, 1);
        assert_eq!(summary.polarized_articles, 1);
    }
}
