use agora::clustering::bridge::bridge_report;
use agora::clustering::consensus::{
    analyze_run, consensus_articles, divisive_articles, summarize_alignment,
};
use agora::clustering::evolution::{compare_runs, detect_run_drift};
use agora::clustering::naming::{ClusterNamer, OllamaNamer};
use agora::clustering::pipeline::{run_clustering, PipelineParams, RunOutcome};
use agora::clustering::types::{ClusterType, Opinion, RunRecord, Vote, VoterId};
use agora::clustering::{DEFAULT_MIN_CLUSTER_OVERLAP, DEFAULT_TOP_BRIDGES};
use agora::db::Database;
use anyhow::{anyhow, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row as PrettyRow, Table};
use tracing::Level;

#[derive(Parser)]
#[clap(name = "agora", about = "Opinion clustering over article votes")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the clustering pipeline over the recent vote window
    Run {
        /// Vote window in days
        #[clap(short, long, default_value = "30")]
        window_days: i64,

        /// Minimum votes a voter needs to be included
        #[clap(long, default_value = "7")]
        min_votes: usize,

        /// Minimum qualified voters needed to attempt a run
        #[clap(long, default_value = "10")]
        min_voters: usize,

        /// Base cluster count (derived from voter count if omitted)
        #[clap(long)]
        base_k: Option<usize>,

        /// Seed for reproducible runs
        #[clap(long, default_value = "0")]
        seed: u64,

        /// Name group clusters with the configured Ollama model
        #[clap(long)]
        name_clusters: bool,
    },

    /// Show the latest completed run and its group clusters
    Latest,

    /// List completed runs
    Runs {
        /// Number of runs to show
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cross-cluster consensus and divisiveness for a run
    Consensus {
        /// Run ID (defaults to the latest completed run)
        #[clap(short, long)]
        run: Option<i64>,

        /// Votes a cluster needs on an article to count
        #[clap(long, default_value = "3")]
        min_votes_per_cluster: i64,

        /// Articles to show per ranking
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Voters positioned between group clusters
    Bridges {
        /// Run ID (defaults to the latest completed run)
        #[clap(short, long)]
        run: Option<i64>,

        /// Distance within which a cluster counts as nearby
        #[clap(short, long, default_value = "1.5")]
        threshold: f64,

        /// Clusters a voter must sit near
        #[clap(long, default_value = "2")]
        min_connections: usize,

        /// Bridge voters to show
        #[clap(short, long, default_value_t = DEFAULT_TOP_BRIDGES)]
        limit: usize,
    },

    /// Compare group clusters between two runs
    Evolution {
        /// Earlier run ID (defaults to the second-latest completed run)
        #[clap(long)]
        from: Option<i64>,

        /// Later run ID (defaults to the latest completed run)
        #[clap(long)]
        to: Option<i64>,

        /// Shared voters required to relate two clusters
        #[clap(long, default_value_t = DEFAULT_MIN_CLUSTER_OVERLAP)]
        min_overlap: usize,

        /// Also report opinion drift between matched clusters
        #[clap(short, long)]
        drift: bool,
    },

    /// Record a vote (mainly for local testing)
    Vote {
        /// Authenticated user ID
        #[clap(short, long, conflicts_with = "session")]
        user: Option<i64>,

        /// Anonymous session key
        #[clap(short, long)]
        session: Option<String>,

        /// Article being voted on
        #[clap(short, long)]
        article: i64,

        /// positive, negative or neutral
        #[clap(short, long)]
        opinion: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    agora::logging::setup_logging("agora", Level::INFO)?;

    let args = Cli::parse();
    let db = Database::instance().await;

    match args.command {
        Commands::Run {
            window_days,
            min_votes,
            min_voters,
            base_k,
            seed,
            name_clusters,
        } => {
            let params = PipelineParams {
                window_days,
                min_votes_per_voter: min_votes,
                min_voters,
                base_k,
                seed,
                ..PipelineParams::default()
            };
            let namer = if name_clusters {
                Some(OllamaNamer::from_env())
            } else {
                None
            };
            run_pipeline(db, &params, namer.as_ref().map(|n| n as &dyn ClusterNamer)).await?;
        }
        Commands::Latest => {
            show_latest(db).await?;
        }
        Commands::Runs { limit } => {
            list_runs(db, limit).await?;
        }
        Commands::Consensus {
            run,
            min_votes_per_cluster,
            limit,
        } => {
            let run_id = resolve_run(db, run).await?;
            show_consensus(db, run_id, min_votes_per_cluster, limit).await?;
        }
        Commands::Bridges {
            run,
            threshold,
            min_connections,
            limit,
        } => {
            let run_id = resolve_run(db, run).await?;
            show_bridges(db, run_id, threshold, min_connections, limit).await?;
        }
        Commands::Evolution {
            from,
            to,
            min_overlap,
            drift,
        } => {
            show_evolution(db, from, to, min_overlap, drift).await?;
        }
        Commands::Vote {
            user,
            session,
            article,
            opinion,
        } => {
            record_vote(db, user, session, article, &opinion).await?;
        }
    }

    Ok(())
}

/// Resolves an explicit run ID or falls back to the latest completed run.
async fn resolve_run(db: &Database, run: Option<i64>) -> Result<i64> {
    match run {
        Some(id) => Ok(id),
        None => db
            .latest_completed_run()
            .await?
            .map(|r| r.id)
            .ok_or_else(|| anyhow!("no completed runs yet; run `agora run` first")),
    }
}

async fn run_pipeline(
    db: &Database,
    params: &PipelineParams,
    namer: Option<&dyn ClusterNamer>,
) -> Result<()> {
    match run_clustering(db, params, namer).await? {
        RunOutcome::Completed {
            run_id,
            voter_count,
            article_count,
            group_count,
        } => {
            println!(
                "Run {} completed: {} voters, {} articles, {} groups",
                run_id, voter_count, article_count, group_count
            );
        }
        RunOutcome::Skipped { reason } => {
            println!("Run skipped: {}", reason);
        }
    }
    Ok(())
}

fn run_summary_row(run: &RunRecord) -> PrettyRow {
    let created = run
        .created_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M")
        .to_string();
    PrettyRow::new(vec![
        Cell::new(&run.id.to_string()),
        Cell::new(&created),
        Cell::new(&format!("{}d", run.window_days)),
        Cell::new(&run.voter_count.to_string()),
        Cell::new(&run.article_count.to_string()),
        Cell::new(&run.cluster_count.to_string()),
        Cell::new(&format!("{}ms", run.duration_ms)),
    ])
}

async fn show_latest(db: &Database) -> Result<()> {
    let Some(run) = db.latest_completed_run().await? else {
        println!("No completed runs yet");
        return Ok(());
    };

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Run"),
        Cell::new("Created"),
        Cell::new("Window"),
        Cell::new("Voters"),
        Cell::new("Articles"),
        Cell::new("Clusters"),
        Cell::new("Duration"),
    ]));
    table.add_row(run_summary_row(&run));
    table.printstd();

    if let Some(params) = &run.params {
        println!("Parameters: {}", params);
    }

    let groups = db.clusters_for_run(run.id, ClusterType::Group).await?;
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Group"),
        Cell::new("Size"),
        Cell::new("Centroid"),
        Cell::new("Consensus"),
        Cell::new("Name"),
    ]));
    for group in &groups {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&group.index.to_string()),
            Cell::new(&group.size.to_string()),
            Cell::new(&format!("({:.3}, {:.3})", group.centroid[0], group.centroid[1])),
            Cell::new(&format!("{:.3}", group.consensus_score)),
            Cell::new(group.name.as_deref().unwrap_or("-")),
        ]));
    }
    table.printstd();

    for group in &groups {
        if let Some(description) = &group.description {
            println!("Group {}: {}", group.index, description);
        }
    }
    Ok(())
}

async fn list_runs(db: &Database, limit: usize) -> Result<()> {
    let mut runs = db.list_completed_runs().await?;
    if runs.is_empty() {
        println!("No completed runs yet");
        return Ok(());
    }
    // Stored oldest first; show the most recent ones, newest on top.
    runs.reverse();
    runs.truncate(limit);

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Run"),
        Cell::new("Created"),
        Cell::new("Window"),
        Cell::new("Voters"),
        Cell::new("Articles"),
        Cell::new("Clusters"),
        Cell::new("Duration"),
    ]));
    for run in &runs {
        table.add_row(run_summary_row(run));
    }
    table.printstd();
    Ok(())
}

async fn show_consensus(
    db: &Database,
    run_id: i64,
    min_votes_per_cluster: i64,
    limit: usize,
) -> Result<()> {
    let alignments = analyze_run(db, run_id, min_votes_per_cluster).await?;
    if alignments.is_empty() {
        println!("No articles with enough votes across clusters in run {}", run_id);
        return Ok(());
    }

    let summary = summarize_alignment(&alignments);
    println!(
        "Run {}: {} scorable articles, mean consensus {:.3}, mean polarization {:.3}",
        run_id, summary.article_count, summary.mean_consensus, summary.mean_polarization
    );
    println!(
        "{} consensus articles, {} polarized articles",
        summary.consensus_articles, summary.polarized_articles
    );

    println!("\nCross-cluster consensus:");
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Article"),
        Cell::new("Majority"),
        Cell::new("Agreement"),
        Cell::new("Consensus"),
        Cell::new("Polarization"),
    ]));
    for alignment in consensus_articles(&alignments, 0.0, limit) {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&alignment.article_id.to_string()),
            Cell::new(alignment.overall_majority.as_str()),
            Cell::new(&format!("{:.3}", alignment.agreement_rate)),
            Cell::new(&format!("{:.3}", alignment.consensus_score)),
            Cell::new(&format!("{:.3}", alignment.polarization_score)),
        ]));
    }
    table.printstd();

    println!("\nMost divisive:");
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Article"),
        Cell::new("Polarization"),
        Cell::new("Cluster majorities"),
    ]));
    for alignment in divisive_articles(&alignments, limit) {
        let majorities: Vec<String> = alignment
            .clusters
            .iter()
            .map(|c| format!("{}:{}", c.cluster_index, c.majority.as_str()))
            .collect();
        table.add_row(PrettyRow::new(vec![
            Cell::new(&alignment.article_id.to_string()),
            Cell::new(&format!("{:.3}", alignment.polarization_score)),
            Cell::new(&majorities.join(" ")),
        ]));
    }
    table.printstd();
    Ok(())
}

async fn show_bridges(
    db: &Database,
    run_id: i64,
    threshold: f64,
    min_connections: usize,
    limit: usize,
) -> Result<()> {
    let bridges = bridge_report(db, run_id, threshold, min_connections).await?;
    if bridges.is_empty() {
        println!("No bridge voters in run {} at threshold {:.2}", run_id, threshold);
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Voter"),
        Cell::new("Strength"),
        Cell::new("Position"),
        Cell::new("Nearby clusters"),
    ]));
    for bridge in bridges.iter().take(limit) {
        let nearby: Vec<String> = bridge
            .connections
            .iter()
            .map(|c| format!("{} ({:.2})", c.cluster_index, c.distance))
            .collect();
        table.add_row(PrettyRow::new(vec![
            Cell::new(&bridge.voter.to_string()),
            Cell::new(&format!("{:.3}", bridge.strength)),
            Cell::new(&format!("({:.3}, {:.3})", bridge.position[0], bridge.position[1])),
            Cell::new(&nearby.join(" ")),
        ]));
    }
    table.printstd();
    Ok(())
}

async fn show_evolution(
    db: &Database,
    from: Option<i64>,
    to: Option<i64>,
    min_overlap: usize,
    drift: bool,
) -> Result<()> {
    let (from_run, to_run) = match (from, to) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            // Default to the two most recent completed runs.
            let runs = db.list_completed_runs().await?;
            if runs.len() < 2 {
                println!("Need at least two completed runs to compare");
                return Ok(());
            }
            let latest = runs[runs.len() - 1].id;
            let previous = runs[runs.len() - 2].id;
            (from.unwrap_or(previous), to.unwrap_or(latest))
        }
    };

    let comparison = compare_runs(db, from_run, to_run, min_overlap).await?;
    println!(
        "Runs {} -> {}: {} common voters, stability {:.3}",
        from_run, to_run, comparison.common_voters, comparison.stability
    );

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("From"),
        Cell::new("To"),
        Cell::new("Overlap"),
        Cell::new("Retention"),
        Cell::new("Kind"),
    ]));
    for transition in &comparison.transitions {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&transition.from_cluster.to_string()),
            Cell::new(&transition.to_cluster.to_string()),
            Cell::new(&transition.overlap.to_string()),
            Cell::new(&format!(
                "{:.2}/{:.2}",
                transition.from_retention, transition.to_retention
            )),
            Cell::new(transition.kind.as_str()),
        ]));
    }
    table.printstd();

    if drift {
        let drifts = detect_run_drift(db, from_run, to_run, min_overlap).await?;
        let significant: Vec<_> = drifts.iter().filter(|d| d.significant).collect();
        println!("\n{} drifting articles ({} total shifts):", significant.len(), drifts.len());
        let mut table = Table::new();
        table.add_row(PrettyRow::new(vec![
            Cell::new("Article"),
            Cell::new("Clusters"),
            Cell::new("Majority"),
            Cell::new("Consensus delta"),
        ]));
        for d in significant {
            table.add_row(PrettyRow::new(vec![
                Cell::new(&d.article_id.to_string()),
                Cell::new(&format!("{} -> {}", d.from_cluster, d.to_cluster)),
                Cell::new(&format!(
                    "{} -> {}",
                    d.from_majority.as_str(),
                    d.to_majority.as_str()
                )),
                Cell::new(&format!("{:+.3}", d.consensus_delta)),
            ]));
        }
        table.printstd();
    }
    Ok(())
}

async fn record_vote(
    db: &Database,
    user: Option<i64>,
    session: Option<String>,
    article: i64,
    opinion: &str,
) -> Result<()> {
    let voter = match (user, session) {
        (Some(id), None) => VoterId::User(id),
        (None, Some(key)) => VoterId::Session(key),
        _ => return Err(anyhow!("specify exactly one of --user or --session")),
    };
    let opinion =
        Opinion::parse(opinion).ok_or_else(|| anyhow!("unknown opinion '{}'", opinion))?;

    let vote_id = db
        .record_vote(&Vote {
            voter: voter.clone(),
            article_id: article,
            opinion,
            voted_at: Utc::now(),
        })
        .await?;
    println!("Recorded vote {} by {} on article {}", vote_id, voter, article);
    Ok(())
}
