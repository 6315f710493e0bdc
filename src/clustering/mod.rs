//! Opinion clustering over the voter/article vote matrix.
//!
//! The pipeline in [`pipeline`] ties the pieces together: recent votes
//! become a sparse matrix ([`matrix`]), voters are projected to 2-D
//! ([`projection`]), partitioned at three granularities ([`kmeans`],
//! [`grouping`]) and scored ([`metrics`]). The read side builds on
//! stored runs: cross-cluster alignment ([`consensus`]), bridge voters
//! ([`bridge`]) and run-over-run evolution ([`evolution`]).

pub mod bridge;
pub mod consensus;
pub mod evolution;
pub mod grouping;
pub mod kmeans;
pub mod matrix;
pub mod metrics;
pub mod naming;
pub mod pipeline;
pub mod projection;
pub mod types;

/// Magnitude stored for an explicit neutral vote. Small but nonzero so
/// a neutral opinion still counts as participation without pulling the
/// projection toward either pole.
pub const NEUTRAL_VOTE_EPSILON: f64 = 1e-6;

/// Lloyd iteration cap per k-means restart.
pub const KMEANS_MAX_ITERATIONS: usize = 20;

/// Seeded restarts per k-means call; the lowest-inertia result wins.
pub const KMEANS_RESTARTS: usize = 5;

/// Upper bound on subgroups split out of one group cluster.
pub const MAX_SUBGROUPS: usize = 3;

/// Agreement rate at or above which an article counts as cross-cluster
/// consensus in alignment summaries.
pub const CONSENSUS_ARTICLE_THRESHOLD: f64 = 0.7;

/// Polarization score at or above which an article counts as divisive
/// in alignment summaries.
pub const POLARIZED_ARTICLE_THRESHOLD: f64 = 0.15;

/// Consensus-score change that flags opinion drift between runs.
pub const DRIFT_CONSENSUS_DELTA: f64 = 0.2;

/// Shared voters required before two clusters from different runs are
/// considered related.
pub const DEFAULT_MIN_CLUSTER_OVERLAP: usize = 5;

/// Bridge voters reported by default in network summaries.
pub const DEFAULT_TOP_BRIDGES: usize = 50;

/// Articles kept per cluster in top-positive/top-negative lists and
/// naming prompts.
pub const TOP_ARTICLES_PER_CLUSTER: usize = 5;
