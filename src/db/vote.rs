use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::core::Database;
use crate::clustering::types::{Opinion, Vote, VoterId};

impl Database {
    /// Records one vote. Votes are append-only; a newer vote on the
    /// same article supersedes older ones at read time.
    pub async fn record_vote(&self, vote: &Vote) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO votes (voter_kind, voter_key, article_id, opinion, voted_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(vote.voter.kind())
        .bind(vote.voter.key())
        .bind(vote.article_id)
        .bind(vote.opinion.as_str())
        .bind(vote.voted_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All votes cast at or after `cutoff`, oldest first.
    pub async fn votes_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Vote>> {
        let rows = sqlx::query(
            r#"
            SELECT voter_kind, voter_key, article_id, opinion, voted_at
            FROM votes
            WHERE voted_at >= ?
            ORDER BY voted_at ASC, id ASC
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.pool())
        .await?;

        let mut votes = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("voter_kind");
            let key: String = row.get("voter_key");
            let voter = VoterId::from_parts(&kind, &key)
                .ok_or_else(|| anyhow!("unknown voter kind '{}' in votes table", kind))?;

            let opinion_text: String = row.get("opinion");
            let opinion = Opinion::parse(&opinion_text)
                .ok_or_else(|| anyhow!("unknown opinion '{}' in votes table", opinion_text))?;

            let voted_at_text: String = row.get("voted_at");
            let voted_at = DateTime::parse_from_rfc3339(&voted_at_text)
                .map_err(|e| anyhow!("bad vote timestamp '{}': {}", voted_at_text, e))?
                .with_timezone(&Utc);

            votes.push(Vote {
                voter,
                article_id: row.get("article_id"),
                opinion,
                voted_at,
            });
        }
        Ok(votes)
    }
}
