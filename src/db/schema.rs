use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                voter_kind TEXT NOT NULL, -- 'user' or 'session'
                voter_key TEXT NOT NULL,
                article_id INTEGER NOT NULL,
                opinion TEXT NOT NULL, -- 'positive', 'negative', 'neutral'
                voted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_votes_voted_at ON votes (voted_at);
            CREATE INDEX IF NOT EXISTS idx_votes_voter ON votes (voter_kind, voter_key);
            CREATE INDEX IF NOT EXISTS idx_votes_article ON votes (article_id);

            -- One row per clustering computation attempt
            CREATE TABLE IF NOT EXISTS cluster_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL, -- pending, running, completed, failed
                created_at TEXT NOT NULL,
                completed_at TEXT,
                window_days INTEGER NOT NULL,
                min_votes_per_voter INTEGER NOT NULL,
                min_voters INTEGER NOT NULL,
                voter_count INTEGER NOT NULL DEFAULT 0,
                article_count INTEGER NOT NULL DEFAULT 0,
                cluster_count INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                params TEXT,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_cluster_runs_status ON cluster_runs (status, created_at);

            -- Clusters of all three granularities, scoped to one run
            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                cluster_type TEXT NOT NULL, -- base, group, subgroup
                cluster_index INTEGER NOT NULL,
                size INTEGER NOT NULL,
                centroid_x REAL NOT NULL,
                centroid_y REAL NOT NULL,
                consensus_score REAL NOT NULL,
                name TEXT,
                description TEXT,
                top_positive_articles TEXT NOT NULL DEFAULT '[]',
                top_negative_articles TEXT NOT NULL DEFAULT '[]',
                UNIQUE (run_id, cluster_type, cluster_index),
                FOREIGN KEY (run_id) REFERENCES cluster_runs (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_run_type ON clusters (run_id, cluster_type);

            -- One membership per voter per (run, cluster type)
            CREATE TABLE IF NOT EXISTS cluster_memberships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                cluster_id INTEGER NOT NULL,
                cluster_type TEXT NOT NULL,
                voter_kind TEXT NOT NULL,
                voter_key TEXT NOT NULL,
                distance REAL NOT NULL,
                UNIQUE (run_id, cluster_type, voter_kind, voter_key),
                FOREIGN KEY (run_id) REFERENCES cluster_runs (id) ON DELETE CASCADE,
                FOREIGN KEY (cluster_id) REFERENCES clusters (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_cluster ON cluster_memberships (cluster_id);
            CREATE INDEX IF NOT EXISTS idx_memberships_run_type ON cluster_memberships (run_id, cluster_type);

            -- One 2-D point per voter per run, independent of assignment
            CREATE TABLE IF NOT EXISTS voter_projections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                voter_kind TEXT NOT NULL,
                voter_key TEXT NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                vote_count INTEGER NOT NULL,
                UNIQUE (run_id, voter_kind, voter_key),
                FOREIGN KEY (run_id) REFERENCES cluster_runs (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_projections_run ON voter_projections (run_id);

            -- Per (cluster, article) opinion tallies
            CREATE TABLE IF NOT EXISTS voting_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                positive_count INTEGER NOT NULL,
                negative_count INTEGER NOT NULL,
                neutral_count INTEGER NOT NULL,
                majority_opinion TEXT NOT NULL,
                consensus_score REAL NOT NULL,
                UNIQUE (cluster_id, article_id),
                FOREIGN KEY (cluster_id) REFERENCES clusters (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_voting_patterns_cluster ON voting_patterns (cluster_id);
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
