use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A voter's judgment on one article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opinion {
    Positive,
    Negative,
    Neutral,
}

impl Opinion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Opinion::Positive => "positive",
            Opinion::Negative => "negative",
            Opinion::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Opinion> {
        match s {
            "positive" => Some(Opinion::Positive),
            "negative" => Some(Opinion::Negative),
            "neutral" => Some(Opinion::Neutral),
            _ => None,
        }
    }
}

/// Identity of whoever cast a vote: an authenticated account or an
/// anonymous session. Exactly one variant applies per vote.
///
/// The derived ordering (users before sessions, then by key) is what
/// gives vote matrix rows their reproducible order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoterId {
    User(i64),
    Session(String),
}

impl VoterId {
    pub fn kind(&self) -> &'static str {
        match self {
            VoterId::User(_) => "user",
            VoterId::Session(_) => "session",
        }
    }

    pub fn key(&self) -> String {
        match self {
            VoterId::User(id) => id.to_string(),
            VoterId::Session(s) => s.clone(),
        }
    }

    /// Reconstructs a voter identity from its stored (kind, key) pair.
    pub fn from_parts(kind: &str, key: &str) -> Option<VoterId> {
        match kind {
            "user" => key.parse().ok().map(VoterId::User),
            "session" => Some(VoterId::Session(key.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoterId::User(id) => write!(f, "user:{}", id),
            VoterId::Session(s) => write!(f, "session:{}", s),
        }
    }
}

/// One immutable vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: VoterId,
    pub article_id: i64,
    pub opinion: Opinion,
    pub voted_at: DateTime<Utc>,
}

/// Granularity of a cluster within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterType {
    Base,
    Group,
    Subgroup,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Base => "base",
            ClusterType::Group => "group",
            ClusterType::Subgroup => "subgroup",
        }
    }

    pub fn parse(s: &str) -> Option<ClusterType> {
        match s {
            "base" => Some(ClusterType::Base),
            "group" => Some(ClusterType::Group),
            "subgroup" => Some(ClusterType::Subgroup),
            _ => None,
        }
    }
}

/// Lifecycle of one clustering computation attempt. Transitions are
/// monotonic; completed and failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted run row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub window_days: i64,
    pub min_votes_per_voter: i64,
    pub min_voters: i64,
    pub voter_count: i64,
    pub article_count: i64,
    pub cluster_count: i64,
    pub duration_ms: i64,
    pub params: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
}

/// Per-article opinion tallies among one cluster's members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingPatternSnapshot {
    pub article_id: i64,
    pub positive_count: i64,
    pub negative_count: i64,
    pub neutral_count: i64,
    pub majority_opinion: Opinion,
    pub consensus_score: f64,
}

/// One cluster staged for persistence. `index` is the numeric id scoped
/// to (run, cluster type); the store assigns the global row id.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub cluster_type: ClusterType,
    pub index: i64,
    pub size: i64,
    pub centroid: [f64; 2],
    pub consensus_score: f64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub top_positive_articles: Vec<i64>,
    pub top_negative_articles: Vec<i64>,
    pub patterns: Vec<VotingPatternSnapshot>,
}

/// One voter's assignment to a cluster of a given type.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    pub voter: VoterId,
    pub cluster_type: ClusterType,
    pub cluster_index: i64,
    pub distance: f64,
}

/// One voter's 2-D coordinate for a run, independent of assignment.
#[derive(Debug, Clone)]
pub struct ProjectionSnapshot {
    pub voter: VoterId,
    pub x: f64,
    pub y: f64,
    pub vote_count: i64,
}

/// Complete output of one pipeline execution, staged in memory and
/// committed as a whole so readers never observe a partial run.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub clusters: Vec<ClusterSnapshot>,
    pub memberships: Vec<MembershipSnapshot>,
    pub projections: Vec<ProjectionSnapshot>,
}

/// A cluster read back from the store.
#[derive(Debug, Clone)]
pub struct StoredCluster {
    pub id: i64,
    pub run_id: i64,
    pub cluster_type: ClusterType,
    pub index: i64,
    pub size: i64,
    pub centroid: [f64; 2],
    pub consensus_score: f64,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// A membership read back from the store.
#[derive(Debug, Clone)]
pub struct StoredMembership {
    pub voter: VoterId,
    pub cluster_index: i64,
    pub distance: f64,
}

/// A projection read back from the store.
#[derive(Debug, Clone)]
pub struct StoredProjection {
    pub voter: VoterId,
    pub x: f64,
    pub y: f64,
    pub vote_count: i64,
}
