use std::collections::{HashMap, HashSet};

use crate::clustering::kmeans::distance_squared;
use crate::clustering::types::{Opinion, Vote, VoterId};

/// Opinion tallies for one article within some voter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpinionCounts {
    pub positive: i64,
    pub negative: i64,
    pub neutral: i64,
}

impl OpinionCounts {
    pub fn total(&self) -> i64 {
        self.positive + self.negative + self.neutral
    }

    pub fn add(&mut self, opinion: Opinion) {
        match opinion {
            Opinion::Positive => self.positive += 1,
            Opinion::Negative => self.negative += 1,
            Opinion::Neutral => self.neutral += 1,
        }
    }

    /// The most common opinion; ties resolve positive, then negative,
    /// then neutral, so results are deterministic.
    pub fn majority(&self) -> Opinion {
        if self.positive >= self.negative && self.positive >= self.neutral {
            Opinion::Positive
        } else if self.negative >= self.neutral {
            Opinion::Negative
        } else {
            Opinion::Neutral
        }
    }

    /// Majority vote share in [0,1]. Zero total is "no data" and must
    /// be filtered out before calling; it reports 0.0 here.
    pub fn consensus(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let max = self.positive.max(self.negative).max(self.neutral);
        max as f64 / total as f64
    }

    pub fn proportion(&self, opinion: Opinion) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let count = match opinion {
            Opinion::Positive => self.positive,
            Opinion::Negative => self.negative,
            Opinion::Neutral => self.neutral,
        };
        count as f64 / total as f64
    }
}

pub fn euclidean_distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    distance_squared(a, b).sqrt()
}

/// Tallies votes per article cast by exactly the given member set.
/// Articles with zero votes from the set are omitted entirely. When a
/// member voted more than once on an article only the latest counts.
pub fn aggregate_cluster_votes(
    votes: &[Vote],
    members: &HashSet<VoterId>,
) -> HashMap<i64, OpinionCounts> {
    let mut latest: HashMap<(&VoterId, i64), &Vote> = HashMap::new();
    for vote in votes {
        if !members.contains(&vote.voter) {
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

    let mut counts: HashMap<i64, OpinionCounts> = HashMap::new();
    for vote in latest.values() {
        counts.entry(vote.article_id).or_default().add(vote.opinion);
    }
    counts
}

/// Mean majority share across voted articles: how uniformly a cluster
/// votes. Empty input (no articles with votes) yields 0.0.
pub fn consensus_score(counts_by_article: &HashMap<i64, OpinionCounts>) -> f64 {
    let scored: Vec<f64> = counts_by_article
        .values()
        .filter(|c| c.total() > 0)
        .map(|c| c.consensus())
        .collect();
    if scored.is_empty() {
        return 0.0;
    }
    scored.iter().sum::<f64>() / scored.len() as f64
}

/// Agreement rate between two voters over articles both voted on.
/// Returns NaN when they share no articles: "no overlap" is not the
/// same thing as "no agreement".
pub fn voter_similarity(a: &HashMap<i64, Opinion>, b: &HashMap<i64, Opinion>) -> f64 {
    let mut shared = 0usize;
    let mut agreements = 0usize;
    for (article, opinion) in a {
        if let Some(other) = b.get(article) {
            shared += 1;
            if opinion == other {
                agreements += 1;
            }
        }
    }
    if shared == 0 {
        return f64::NAN;
    }
    agreements as f64 / shared as f64
}

/// Mean silhouette coefficient over 2-D points, in [-1, 1]. Degenerate
/// inputs (fewer than 2 clusters, or at least as many clusters as
/// samples) report 0.0 rather than failing.
pub fn silhouette_score(points: &[[f64; 2]], labels: &[usize]) -> f64 {
    debug_assert_eq!(points.len(), labels.len());
    let n = points.len();
    let clusters: HashSet<usize> = labels.iter().copied().collect();
    let k = clusters.len();
    if k < 2 || k >= n {
        return 0.0;
    }

    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, &label) in labels.iter().enumerate() {
        members.entry(label).or_default().push(i);
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = &members[&labels[i]];
        if own.len() < 2 {
            // Singleton clusters contribute zero by convention.
            continue;
        }

        let a = own
            .iter()
            .filter(|&&j| j != i)
            .map(|&j| euclidean_distance(points[i], points[j]))
            .sum::<f64>()
            / (own.len() - 1) as f64;

        let b = members
            .iter()
            .filter(|(&label, _)| label != labels[i])
            .map(|(_, other)| {
                other
                    .iter()
                    .map(|&j| euclidean_distance(points[i], points[j]))
                    .sum::<f64>()
                    / other.len() as f64
            })
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    total / n as f64
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

    #[test]
    fn identical_voters_have_similarity_one() {
        let a: HashMap<i64, Opinion> = [(1, Opinion::Positive), (2, Opinion::Negative)].into();
        assert_eq!(voter_similarity(&a, &a.clone()), 1.0);
    }

    #[test]
    fn opposite_voters_have_similarity_zero() {
        let a: HashMap<i64, Opinion> = [(1, Opinion::Positive), (2, Opinion::Negative)].into();
        let b: HashMap<i64, Opinion> = [(1, Opinion::Negative), (2, Opinion::Positive)].into();
        assert_eq!(voter_similarity(&a, &b), 0.0);
    }

    #[test]
    fn disjoint_voters_are_undefined() {
        let a: HashMap<i64, Opinion> = [(1, Opinion::Positive)].into();
        let b: HashMap<i64, Opinion> = [(2, Opinion::Positive)].into();
        assert!(voter_similarity(&a, &b).is_nan());
    }

    #[test]
    fn aggregation_restricts_to_members_and_omits_unvoted() {
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Positive),
            vote(3, 10, Opinion::Negative), // not a member
            vote(1, 11, Opinion::Neutral),
        ];
        let members: HashSet<VoterId> = [VoterId::User(1), VoterId::User(2)].into();
        let counts = aggregate_cluster_votes(&votes, &members);

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&10].positive, 2);
        assert_eq!(counts[&10].negative, 0);
        assert_eq!(counts[&11].neutral, 1);
    }

    #[test]
    fn consensus_stays_in_unit_range() {
        let votes = vec![
            vote(1, 10, Opinion::Positive),
            vote(2, 10, Opinion::Negative),
            vote(1, 11, Opinion::Positive),
            vote(2, 11, Opinion::Positive),
        ];
        let members: HashSet<VoterId> = [VoterId::User(1), VoterId::User(2)].into();
        let counts = aggregate_cluster_votes(&votes, &members);
        let score = consensus_score(&counts);
        assert!((0.0..=1.0).contains(&score));
        // Article 10 splits 50/50, article 11 is unanimous.
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_consensus_is_zero() {
        assert_eq!(consensus_score(&HashMap::new()), 0.0);
    }

    #[test]
    fn silhouette_degenerate_cases_are_zero() {
        let points = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        assert_eq!(silhouette_score(&points, &[0, 0, 0]), 0.0);
        assert_eq!(silhouette_score(&points, &[0, 1, 2]), 0.0);
    }

    #[test]
    fn silhouette_rewards_separation() {
        let points = [
            [-5.0, 0.0],
            [-5.1, 0.1],
            [-4.9, -0.1],
            [5.0, 0.0],
            [5.1, 0.1],
            [4.9, -0.1],
        ];
        let tight = silhouette_score(&points, &[0, 0, 0, 1, 1, 1]);
        let mixed = silhouette_score(&points, &[0, 1, 0, 1, 0, 1]);
        assert!(tight > 0.9);
        assert!(tight > mixed);
    }

    #[test]
    fn majority_tie_breaks_deterministically() {
        let counts = OpinionCounts {
            positive: 2,
            negative: 2,
            neutral: 0,
        };
        assert_eq!(counts.majority(), Opinion::Positive);
    }
}
