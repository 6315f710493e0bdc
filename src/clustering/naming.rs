use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use tracing::debug;

use crate::TARGET_LLM_REQUEST;

/// Everything the naming collaborator gets to see about one cluster.
#[derive(Debug, Clone)]
pub struct ClusterFacts {
    pub cluster_index: i64,
    pub size: i64,
    pub consensus_score: f64,
    /// Articles this cluster votes most uniformly on.
    pub top_consensus_articles: Vec<i64>,
    /// Articles with the most positive votes from this cluster.
    pub positive_articles: Vec<i64>,
    /// Articles with the most negative votes from this cluster.
    pub negative_articles: Vec<i64>,
}

/// A short generated name and description for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub name: String,
    pub description: String,
}

/// Injectable text-generation capability. The clustering core only
/// knows this trait; a failing implementation leaves cluster names
/// and descriptions empty, it never aborts a run.
#[async_trait]
pub trait ClusterNamer: Send + Sync {
    async fn summarize(&self, facts: &ClusterFacts) -> Result<ClusterSummary>;
}

/// Naming backend talking to a local Ollama instance.
pub struct OllamaNamer {
    client: Ollama,
    model: String,
}

impl OllamaNamer {
    pub fn new(host: String, port: u16, model: String) -> Self {
        OllamaNamer {
            client: Ollama::new(host, port),
            model,
        }
    }

    /// Reads OLLAMA_HOST / OLLAMA_PORT / OLLAMA_MODEL, with the usual
    /// local defaults.
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama2".to_string());
        OllamaNamer::new(host, port, model)
    }
}

fn build_naming_prompt(facts: &ClusterFacts) -> String {
    let list = |ids: &[i64]| {
        ids.iter()
            .map(|id| format!("#{}", id))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        r#"You are naming an opinion group discovered by clustering voters with similar voting patterns.

Group size: {} voters
Internal agreement: {:.0}% of this group's votes follow the group majority
Articles the group agrees on most: {}
Articles the group votes positively on: {}
Articles the group votes negatively on: {}

Reply with exactly two lines:
Name: a short label (at most 5 words) for this opinion group
Description: one sentence describing what unites this group"#,
        facts.size,
        facts.consensus_score * 100.0,
        list(&facts.top_consensus_articles),
        list(&facts.positive_articles),
        list(&facts.negative_articles),
    )
}

/// Extracts the name and description lines from a model response.
/// Tolerant of missing labels: the first non-empty line becomes the
/// name and the rest the description.
fn parse_summary(response: &str) -> Result<ClusterSummary> {
    let mut name = None;
    let mut description_lines = Vec::new();

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("Name:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Description:") {
            description_lines.push(rest.trim().to_string());
        } else if name.is_none() {
            name = Some(line.to_string());
        } else {
            description_lines.push(line.to_string());
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("naming response contained no usable name"))?;

    Ok(ClusterSummary {
        name,
        description: description_lines.join(" "),
    })
}

#[async_trait]
impl ClusterNamer for OllamaNamer {
    async fn summarize(&self, facts: &ClusterFacts) -> Result<ClusterSummary> {
        let prompt = build_naming_prompt(facts);
        debug!(
            target: TARGET_LLM_REQUEST,
            "Requesting name for group cluster {} ({} voters)",
            facts.cluster_index,
            facts.size
        );

        let mut request = GenerationRequest::new(self.model.clone(), prompt);
        request.options = Some(GenerationOptions::default().temperature(0.2));

        let response = self
            .client
            .generate(request)
            .await
            .map_err(|e| anyhow!("naming generation failed: {}", e))?;

        parse_summary(&response.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labeled_response() {
        let summary = parse_summary(
            "Name: Pro-transit urbanists\nDescription: Voters backing dense housing and transit coverage.",
        )
        .unwrap();
        assert_eq!(summary.name, "Pro-transit urbanists");
        assert!(summary.description.starts_with("Voters backing"));
    }

    #[test]
    fn parses_unlabeled_response() {
        let summary = parse_summary("Skeptics\nThey doubt most proposals.").unwrap();
        assert_eq!(summary.name, "Skeptics");
        assert_eq!(summary.description, "They doubt most proposals.");
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(parse_summary("   \n  ").is_err());
    }

    #[test]
    fn prompt_mentions_the_facts() {
        let facts = ClusterFacts {
            cluster_index: 2,
            size: 40,
            consensus_score: 0.85,
            top_consensus_articles: vec![7, 9],
            positive_articles: vec![7],
            negative_articles: vec![3],
        };
        let prompt = build_naming_prompt(&facts);
        assert!(prompt.contains("40 voters"));
        assert!(prompt.contains("85%"));
        assert!(prompt.contains("#7, #9"));
    }
}
