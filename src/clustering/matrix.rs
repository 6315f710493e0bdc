use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::clustering::types::{Opinion, Vote, VoterId};
use crate::clustering::NEUTRAL_VOTE_EPSILON;
use crate::TARGET_PIPELINE;

/// Sparse (voter × article) vote matrix. Rows are qualified voters in
/// identity order, columns are articles in id order. Stored cell
/// values: +1.0 positive, -1.0 negative, a small positive epsilon for
/// neutral so an explicit neutral is distinguishable from "no vote".
///
/// A matrix is a frozen snapshot: built once per run, never mutated.
#[derive(Debug, Clone)]
pub struct VoteMatrix {
    voters: Vec<VoterId>,
    articles: Vec<i64>,
    /// Per-row (column, value) pairs, sorted by column.
    rows: Vec<Vec<(usize, f64)>>,
}

impl VoteMatrix {
    fn empty() -> Self {
        VoteMatrix {
            voters: Vec::new(),
            articles: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn voter_count(&self) -> usize {
        self.voters.len()
    }

    pub fn article_count(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn voters(&self) -> &[VoterId] {
        &self.voters
    }

    pub fn articles(&self) -> &[i64] {
        &self.articles
    }

    /// The (column, value) pairs stored for one voter row.
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    /// Number of explicitly stored cells, including epsilon neutrals.
    pub fn stored_entries(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }

    /// Stored value for a cell, or None when the voter never voted on
    /// the article.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.rows[row]
            .binary_search_by_key(&col, |&(c, _)| c)
            .ok()
            .map(|i| self.rows[row][i].1)
    }

    /// Raw vote count per voter row, used downstream as a clustering
    /// weight and for sparsity correction.
    pub fn vote_counts(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.len()).collect()
    }
}

fn opinion_value(opinion: Opinion) -> f64 {
    match opinion {
        Opinion::Positive => 1.0,
        Opinion::Negative => -1.0,
        Opinion::Neutral => NEUTRAL_VOTE_EPSILON,
    }
}

/// Builds the sparse vote matrix for one run.
///
/// Votes older than `cutoff` are ignored; voters with fewer than
/// `min_votes_per_voter` remaining votes are dropped. When a voter
/// voted more than once on the same article only the latest vote
/// counts. Zero votes or zero qualifying voters yield a 0×0 matrix.
///
/// Pure function of its inputs: identical votes produce an identical
/// matrix, rows sorted by voter identity and columns by article id.
///
/// # Arguments
/// * `votes` - Raw votes from the vote store
/// * `cutoff` - Start of the time window
/// * `min_votes_per_voter` - Qualification threshold per voter
pub fn build_vote_matrix(
    votes: &[Vote],
    cutoff: DateTime<Utc>,
    min_votes_per_voter: usize,
) -> VoteMatrix {
    // Latest vote per (voter, article) within the window.
    let mut latest: HashMap<(VoterId, i64), (DateTime<Utc>, Opinion)> = HashMap::new();
    for vote in votes {
        if vote.voted_at < cutoff {
            continue;
        }
        let key = (vote.voter.clone(), vote.article_id);
        match latest.get(&key) {
            Some((seen, _)) if *seen >= vote.voted_at => {}
            _ => {
                latest.insert(key, (vote.voted_at, vote.opinion));
            }
        }
    }

    if latest.is_empty() {
        return VoteMatrix::empty();
    }

    let mut per_voter: HashMap<VoterId, Vec<(i64, Opinion)>> = HashMap::new();
    for ((voter, article_id), (_, opinion)) in latest {
        per_voter.entry(voter).or_default().push((article_id, opinion));
    }

    let mut voters: Vec<VoterId> = per_voter
        .iter()
        .filter(|(_, v)| v.len() >= min_votes_per_voter)
        .map(|(voter, _)| voter.clone())
        .collect();
    voters.sort();

    if voters.is_empty() {
        return VoteMatrix::empty();
    }

    let mut articles: Vec<i64> = voters
        .iter()
        .flat_map(|v| per_voter[v].iter().map(|&(a, _)| a))
        .collect();
    articles.sort_unstable();
    articles.dedup();

    let column: HashMap<i64, usize> = articles
        .iter()
        .enumerate()
        .map(|(i, &a)| (a, i))
        .collect();

    let rows = voters
        .iter()
        .map(|voter| {
            let mut row: Vec<(usize, f64)> = per_voter[voter]
                .iter()
                .map(|&(article, opinion)| (column[&article], opinion_value(opinion)))
                .collect();
            row.sort_unstable_by_key(|&(c, _)| c);
            row
        })
        .collect();

    debug!(
        target: TARGET_PIPELINE,
        "Built vote matrix: {} voters x {} articles",
        voters.len(),
        articles.len()
    );

    VoteMatrix {
        voters,
        articles,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn vote(voter: VoterId, article_id: i64, opinion: Opinion) -> Vote {
        Vote {
            voter,
            article_id,
            opinion,
            voted_at: Utc::now(),
        }
    }

    fn cutoff() -> DateTime<Utc> {
        Utc::now() - Duration::days(30)
    }

    #[test]
    fn empty_window_yields_empty_matrix() {
        let matrix = build_vote_matrix(&[], cutoff(), 1);
        assert!(matrix.is_empty());
        assert_eq!(matrix.voter_count(), 0);
        assert_eq!(matrix.article_count(), 0);
    }

    #[test]
    fn votes_before_cutoff_are_ignored() {
        let mut v = vote(VoterId::User(1), 10, Opinion::Positive);
        v.voted_at = Utc::now() - Duration::days(60);
        let matrix = build_vote_matrix(&[v], cutoff(), 1);
        assert!(matrix.is_empty());
    }

    #[test]
    fn below_threshold_voters_are_dropped() {
        let votes = vec![
            vote(VoterId::User(1), 10, Opinion::Positive),
            vote(VoterId::User(1), 11, Opinion::Negative),
            vote(VoterId::User(2), 10, Opinion::Positive),
        ];
        let matrix = build_vote_matrix(&votes, cutoff(), 2);
        assert_eq!(matrix.voter_count(), 1);
        assert_eq!(matrix.voters()[0], VoterId::User(1));
        // Articles come from surviving voters only.
        assert_eq!(matrix.article_count(), 2);
    }

    #[test]
    fn three_by_three_matrix_shape_and_storage() {
        // userA: [+,+,-], userB: [+,-,-], sessionC: three neutrals.
        let votes = vec![
            vote(VoterId::User(1), 1, Opinion::Positive),
            vote(VoterId::User(1), 2, Opinion::Positive),
            vote(VoterId::User(1), 3, Opinion::Negative),
            vote(VoterId::User(2), 1, Opinion::Positive),
            vote(VoterId::User(2), 2, Opinion::Negative),
            vote(VoterId::User(2), 3, Opinion::Negative),
            vote(VoterId::Session("c".into()), 1, Opinion::Neutral),
            vote(VoterId::Session("c".into()), 2, Opinion::Neutral),
            vote(VoterId::Session("c".into()), 3, Opinion::Neutral),
        ];
        let matrix = build_vote_matrix(&votes, cutoff(), 3);
        assert_eq!(matrix.voter_count(), 3);
        assert_eq!(matrix.article_count(), 3);
        assert_eq!(matrix.stored_entries(), 9);

        let strong: usize = (0..3)
            .map(|r| {
                matrix
                    .row(r)
                    .iter()
                    .filter(|&&(_, v)| v.abs() == 1.0)
                    .count()
            })
            .sum();
        assert_eq!(strong, 6);

        // The neutral row stores the epsilon marker, not literal zero.
        let neutral_row = matrix
            .voters()
            .iter()
            .position(|v| matches!(v, VoterId::Session(_)))
            .unwrap();
        for &(_, value) in matrix.row(neutral_row) {
            assert!(value > 0.0 && value < 1e-3);
        }
    }

    #[test]
    fn latest_vote_per_article_wins() {
        let earlier = Utc::now() - Duration::hours(2);
        let later = Utc::now() - Duration::hours(1);
        let votes = vec![
            Vote {
                voter: VoterId::User(1),
                article_id: 1,
                opinion: Opinion::Positive,
                voted_at: earlier,
            },
            Vote {
                voter: VoterId::User(1),
                article_id: 1,
                opinion: Opinion::Negative,
                voted_at: later,
            },
        ];
        let matrix = build_vote_matrix(&votes, cutoff(), 1);
        assert_eq!(matrix.get(0, 0), Some(-1.0));
    }

    #[test]
    fn rows_are_sorted_by_identity() {
        let votes = vec![
            vote(VoterId::Session("z".into()), 1, Opinion::Positive),
            vote(VoterId::User(5), 1, Opinion::Positive),
            vote(VoterId::User(2), 1, Opinion::Positive),
        ];
        let matrix = build_vote_matrix(&votes, cutoff(), 1);
        assert_eq!(
            matrix.voters(),
            &[
                VoterId::User(2),
                VoterId::User(5),
                VoterId::Session("z".into())
            ]
        );
    }
}
