use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;

use super::core::Database;
use crate::clustering::types::{
    ClusterType, Opinion, RunRecord, RunSnapshot, RunStatus, StoredCluster, StoredMembership,
    StoredProjection, VoterId, VotingPatternSnapshot,
};
use crate::TARGET_DB;

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("bad run timestamp '{}': {}", text, e))
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let status_text: String = row.get("status");
    let status = RunStatus::parse(&status_text)
        .ok_or_else(|| anyhow!("unknown run status '{}'", status_text))?;

    let created_at_text: String = row.get("created_at");
    let completed_at_text: Option<String> = row.get("completed_at");
    let params_text: Option<String> = row.get("params");

    Ok(RunRecord {
        id: row.get("id"),
        status,
        created_at: parse_timestamp(&created_at_text)?,
        completed_at: completed_at_text
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        window_days: row.get("window_days"),
        min_votes_per_voter: row.get("min_votes_per_voter"),
        min_voters: row.get("min_voters"),
        voter_count: row.get("voter_count"),
        article_count: row.get("article_count"),
        cluster_count: row.get("cluster_count"),
        duration_ms: row.get("duration_ms"),
        params: params_text
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        failure_reason: row.get("failure_reason"),
    })
}

const RUN_COLUMNS: &str = "id, status, created_at, completed_at, window_days, \
     min_votes_per_voter, min_voters, voter_count, article_count, cluster_count, \
     duration_ms, params, failure_reason";

impl Database {
    /// Creates a new run in the pending state and returns its id.
    pub async fn create_run(
        &self,
        window_days: i64,
        min_votes_per_voter: i64,
        min_voters: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO cluster_runs (status, created_at, window_days, min_votes_per_voter, min_voters)
            VALUES ('pending', ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(window_days)
        .bind(min_votes_per_voter)
        .bind(min_voters)
        .execute(self.pool())
        .await?;

        let run_id = result.last_insert_rowid();
        info!(target: TARGET_DB, "Created run {} (pending)", run_id);
        Ok(run_id)
    }

    /// True when another run is still pending or running. The external
    /// scheduler guarantees at-most-once execution; this is the no-op
    /// guard for a second invocation racing in anyway.
    pub async fn has_active_run(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cluster_runs WHERE status IN ('pending', 'running')",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn mark_run_running(&self, run_id: i64) -> Result<()> {
        sqlx::query("UPDATE cluster_runs SET status = 'running' WHERE id = ? AND status = 'pending'")
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminal failure with a descriptive reason. Failed runs are
    /// invisible to readers and safe to retry from scratch.
    pub async fn mark_run_failed(&self, run_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cluster_runs
            SET status = 'failed', completed_at = ?, failure_reason = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .bind(run_id)
        .execute(self.pool())
        .await?;
        info!(target: TARGET_DB, "Run {} failed: {}", run_id, reason);
        Ok(())
    }

    /// Writes the complete staged snapshot for a run inside one
    /// transaction. Nothing becomes visible to readers until the run
    /// is separately flipped to completed.
    pub async fn write_snapshot(&self, run_id: i64, snapshot: &RunSnapshot) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let mut cluster_ids: HashMap<(ClusterType, i64), i64> = HashMap::new();
        for cluster in &snapshot.clusters {
            let result = sqlx::query(
                r#"
                INSERT INTO clusters
                    (run_id, cluster_type, cluster_index, size, centroid_x, centroid_y,
                     consensus_score, name, description, top_positive_articles, top_negative_articles)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(cluster.cluster_type.as_str())
            .bind(cluster.index)
            .bind(cluster.size)
            .bind(cluster.centroid[0])
            .bind(cluster.centroid[1])
            .bind(cluster.consensus_score)
            .bind(&cluster.name)
            .bind(&cluster.description)
            .bind(serde_json::to_string(&cluster.top_positive_articles)?)
            .bind(serde_json::to_string(&cluster.top_negative_articles)?)
            .execute(&mut *tx)
            .await?;

            let cluster_id = result.last_insert_rowid();
            cluster_ids.insert((cluster.cluster_type, cluster.index), cluster_id);

            for pattern in &cluster.patterns {
                sqlx::query(
                    r#"
                    INSERT INTO voting_patterns
                        (cluster_id, article_id, positive_count, negative_count,
                         neutral_count, majority_opinion, consensus_score)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(cluster_id)
                .bind(pattern.article_id)
                .bind(pattern.positive_count)
                .bind(pattern.negative_count)
                .bind(pattern.neutral_count)
                .bind(pattern.majority_opinion.as_str())
                .bind(pattern.consensus_score)
                .execute(&mut *tx)
                .await?;
            }
        }

        for membership in &snapshot.memberships {
            let cluster_id = cluster_ids
                .get(&(membership.cluster_type, membership.cluster_index))
                .ok_or_else(|| {
                    anyhow!(
                        "membership references unknown cluster {:?}/{}",
                        membership.cluster_type,
                        membership.cluster_index
                    )
                })?;
            sqlx::query(
                r#"
                INSERT INTO cluster_memberships
                    (run_id, cluster_id, cluster_type, voter_kind, voter_key, distance)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(cluster_id)
            .bind(membership.cluster_type.as_str())
            .bind(membership.voter.kind())
            .bind(membership.voter.key())
            .bind(membership.distance)
            .execute(&mut *tx)
            .await?;
        }

        for projection in &snapshot.projections {
            sqlx::query(
                r#"
                INSERT INTO voter_projections (run_id, voter_kind, voter_key, x, y, vote_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(projection.voter.kind())
            .bind(projection.voter.key())
            .bind(projection.x)
            .bind(projection.y)
            .bind(projection.vote_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            target: TARGET_DB,
            "Wrote snapshot for run {}: {} clusters, {} memberships, {} projections",
            run_id,
            snapshot.clusters.len(),
            snapshot.memberships.len(),
            snapshot.projections.len()
        );
        Ok(())
    }

    /// Flips a run to completed with its summary counts. This is the
    /// single switch that makes the run visible to readers.
    pub async fn complete_run(
        &self,
        run_id: i64,
        voter_count: i64,
        article_count: i64,
        cluster_count: i64,
        duration_ms: i64,
        params: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cluster_runs
            SET status = 'completed', completed_at = ?, voter_count = ?,
                article_count = ?, cluster_count = ?, duration_ms = ?, params = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(voter_count)
        .bind(article_count)
        .bind(cluster_count)
        .bind(duration_ms)
        .bind(serde_json::to_string(params)?)
        .bind(run_id)
        .execute(self.pool())
        .await?;
        info!(target: TARGET_DB, "Run {} completed", run_id);
        Ok(())
    }

    /// Fills in the externally generated name and description for one
    /// cluster row.
    pub async fn update_cluster_annotation(
        &self,
        cluster_id: i64,
        name: &str,
        description: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE clusters SET name = ?, description = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(cluster_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM cluster_runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// The most recent completed run, if any. In-progress and failed
    /// runs are treated as absent.
    pub async fn latest_completed_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM cluster_runs WHERE status = 'completed' \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// All completed runs, oldest first.
    pub async fn list_completed_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cluster_runs WHERE status = 'completed' \
             ORDER BY created_at ASC, id ASC",
            RUN_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn clusters_for_run(
        &self,
        run_id: i64,
        cluster_type: ClusterType,
    ) -> Result<Vec<StoredCluster>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, cluster_type, cluster_index, size, centroid_x, centroid_y,
                   consensus_score, name, description
            FROM clusters
            WHERE run_id = ? AND cluster_type = ?
            ORDER BY cluster_index ASC
            "#,
        )
        .bind(run_id)
        .bind(cluster_type.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let type_text: String = row.get("cluster_type");
                let cluster_type = ClusterType::parse(&type_text)
                    .ok_or_else(|| anyhow!("unknown cluster type '{}'", type_text))?;
                Ok(StoredCluster {
                    id: row.get("id"),
                    run_id: row.get("run_id"),
                    cluster_type,
                    index: row.get("cluster_index"),
                    size: row.get("size"),
                    centroid: [row.get("centroid_x"), row.get("centroid_y")],
                    consensus_score: row.get("consensus_score"),
                    name: row.get("name"),
                    description: row.get("description"),
                })
            })
            .collect()
    }

    pub async fn memberships_for_run(
        &self,
        run_id: i64,
        cluster_type: ClusterType,
    ) -> Result<Vec<StoredMembership>> {
        let rows = sqlx::query(
            r#"
            SELECT c.cluster_index, m.voter_kind, m.voter_key, m.distance
            FROM cluster_memberships m
            JOIN clusters c ON c.id = m.cluster_id
            WHERE m.run_id = ? AND m.cluster_type = ?
            "#,
        )
        .bind(run_id)
        .bind(cluster_type.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("voter_kind");
                let key: String = row.get("voter_key");
                let voter = VoterId::from_parts(&kind, &key)
                    .ok_or_else(|| anyhow!("unknown voter kind '{}'", kind))?;
                Ok(StoredMembership {
                    voter,
                    cluster_index: row.get("cluster_index"),
                    distance: row.get("distance"),
                })
            })
            .collect()
    }

    pub async fn projections_for_run(&self, run_id: i64) -> Result<Vec<StoredProjection>> {
        let rows = sqlx::query(
            r#"
            SELECT voter_kind, voter_key, x, y, vote_count
            FROM voter_projections
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("voter_kind");
                let key: String = row.get("voter_key");
                let voter = VoterId::from_parts(&kind, &key)
                    .ok_or_else(|| anyhow!("unknown voter kind '{}'", kind))?;
                Ok(StoredProjection {
                    voter,
                    x: row.get("x"),
                    y: row.get("y"),
                    vote_count: row.get("vote_count"),
                })
            })
            .collect()
    }

    pub async fn voting_patterns_for_cluster(
        &self,
        cluster_id: i64,
    ) -> Result<Vec<VotingPatternSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT article_id, positive_count, negative_count, neutral_count,
                   majority_opinion, consensus_score
            FROM voting_patterns
            WHERE cluster_id = ?
            ORDER BY article_id ASC
            "#,
        )
        .bind(cluster_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(pattern_from_row).collect()
    }

    /// Voting patterns for every cluster of one type in a run, keyed
    /// by the per-run cluster index.
    pub async fn voting_patterns_for_run(
        &self,
        run_id: i64,
        cluster_type: ClusterType,
    ) -> Result<Vec<(i64, VotingPatternSnapshot)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.cluster_index, p.article_id, p.positive_count, p.negative_count,
                   p.neutral_count, p.majority_opinion, p.consensus_score
            FROM voting_patterns p
            JOIN clusters c ON c.id = p.cluster_id
            WHERE c.run_id = ? AND c.cluster_type = ?
            ORDER BY c.cluster_index ASC, p.article_id ASC
            "#,
        )
        .bind(run_id)
        .bind(cluster_type.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| Ok((row.get("cluster_index"), pattern_from_row(row)?)))
            .collect()
    }
}

fn pattern_from_row(row: &SqliteRow) -> Result<VotingPatternSnapshot> {
    let majority_text: String = row.get("majority_opinion");
    let majority_opinion = Opinion::parse(&majority_text)
        .ok_or_else(|| anyhow!("unknown opinion '{}' in voting_patterns", majority_text))?;
    Ok(VotingPatternSnapshot {
        article_id: row.get("article_id"),
        positive_count: row.get("positive_count"),
        negative_count: row.get("negative_count"),
        neutral_count: row.get("neutral_count"),
        majority_opinion,
        consensus_score: row.get("consensus_score"),
    })
}
