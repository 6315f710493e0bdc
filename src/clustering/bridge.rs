use anyhow::{anyhow, Result};
use std::collections::HashSet;
use tracing::info;

use crate::clustering::metrics::euclidean_distance;
use crate::clustering::types::{ClusterType, RunStatus, VoterId};
use crate::db::Database;
use crate::TARGET_PIPELINE;

/// A voter-to-centroid link within the distance threshold.
#[derive(Debug, Clone)]
pub struct BridgeConnection {
    pub cluster_index: i64,
    pub distance: f64,
}

/// A voter positioned between clusters: close to several centroids at
/// once. Strength 1.0 means sitting on top of every connected
/// centroid; 0.0 means barely inside the threshold.
#[derive(Debug, Clone)]
pub struct BridgeVoter {
    pub voter: VoterId,
    pub position: [f64; 2],
    pub strength: f64,
    pub connections: Vec<BridgeConnection>,
}

/// Cluster and bridge nodes plus weighted edges, packaged for a
/// network-graph visualization.
#[derive(Debug, Clone)]
pub struct BridgeNetwork {
    pub clusters: Vec<NetworkClusterNode>,
    pub bridges: Vec<BridgeVoter>,
    pub edges: Vec<NetworkEdge>,
}

#[derive(Debug, Clone)]
pub struct NetworkClusterNode {
    pub cluster_index: i64,
    pub position: [f64; 2],
    pub size: i64,
}

/// Edge from `bridges[bridge]` to a cluster node, weight 1 − d/threshold.
#[derive(Debug, Clone)]
pub struct NetworkEdge {
    pub bridge: usize,
    pub cluster_index: i64,
    pub weight: f64,
}

/// Finds voters whose projection lies within `threshold` of at least
/// `min_connections` group centroids. Bridge strength is
/// 1 − mean(connected distances) / threshold, clamped to [0,1], and
/// results come back strongest first.
///
/// # Arguments
/// * `voters` - (identity, projection) for voters with a group membership
/// * `centroids` - (group cluster index, centroid) pairs
/// * `threshold` - Maximum centroid distance for a connection
/// * `min_connections` - Minimum connected clusters (default 2)
pub fn identify_bridge_voters(
    voters: &[(VoterId, [f64; 2])],
    centroids: &[(i64, [f64; 2])],
    threshold: f64,
    min_connections: usize,
) -> Vec<BridgeVoter> {
    if threshold <= 0.0 {
        return Vec::new();
    }

    let mut bridges = Vec::new();
    for (voter, position) in voters {
        let connections: Vec<BridgeConnection> = centroids
            .iter()
            .map(|&(cluster_index, centroid)| BridgeConnection {
                cluster_index,
                distance: euclidean_distance(*position, centroid),
            })
            .filter(|c| c.distance <= threshold)
            .collect();

        if connections.len() < min_connections {
            continue;
        }

        let mean_distance =
            connections.iter().map(|c| c.distance).sum::<f64>() / connections.len() as f64;
        let strength = (1.0 - mean_distance / threshold).clamp(0.0, 1.0);

        bridges.push(BridgeVoter {
            voter: voter.clone(),
            position: *position,
            strength,
            connections,
        });
    }

    bridges.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    bridges
}

/// Packages cluster nodes and the `top_n` strongest bridges with
/// weighted edges for visualization.
pub fn build_bridge_network(
    voters: &[(VoterId, [f64; 2])],
    centroids: &[(i64, [f64; 2], i64)],
    threshold: f64,
    min_connections: usize,
    top_n: usize,
) -> BridgeNetwork {
    let centroid_points: Vec<(i64, [f64; 2])> =
        centroids.iter().map(|&(i, p, _)| (i, p)).collect();
    let mut bridges = identify_bridge_voters(voters, &centroid_points, threshold, min_connections);
    bridges.truncate(top_n);

    let clusters = centroids
        .iter()
        .map(|&(cluster_index, position, size)| NetworkClusterNode {
            cluster_index,
            position,
            size,
        })
        .collect();

    let mut edges = Vec::new();
    for (i, bridge) in bridges.iter().enumerate() {
        for connection in &bridge.connections {
            edges.push(NetworkEdge {
                bridge: i,
                cluster_index: connection.cluster_index,
                weight: (1.0 - connection.distance / threshold).clamp(0.0, 1.0),
            });
        }
    }

    BridgeNetwork {
        clusters,
        bridges,
        edges,
    }
}

/// How well `point` sits at the midpoint between two centroids,
/// normalized by the inter-centroid distance. Exactly at the midpoint
/// scores 1.0; detours off the segment or leaning toward one side
/// both reduce the score. Coincident centroids score 0.0.
pub fn pairwise_bridge_strength(point: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    let span = euclidean_distance(a, b);
    if span <= 0.0 {
        return 0.0;
    }
    let da = euclidean_distance(point, a);
    let db = euclidean_distance(point, b);
    let detour = (da + db - span) / span;
    let imbalance = (da - db).abs() / span;
    (1.0 - detour - imbalance).clamp(0.0, 1.0)
}

/// Loads a completed run's group clusters and projections, then ranks
/// its bridge voters.
pub async fn bridge_report(
    db: &Database,
    run_id: i64,
    threshold: f64,
    min_connections: usize,
) -> Result<Vec<BridgeVoter>> {
    let run = db
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("run {} not found", run_id))?;
    if run.status != RunStatus::Completed {
        return Err(anyhow!("run {} is not completed", run_id));
    }

    let clusters = db.clusters_for_run(run_id, ClusterType::Group).await?;
    let centroids: Vec<(i64, [f64; 2])> = clusters
        .iter()
        .map(|c| (c.index, c.centroid))
        .collect();

    let members: HashSet<VoterId> = db
        .memberships_for_run(run_id, ClusterType::Group)
        .await?
        .into_iter()
        .map(|m| m.voter)
        .collect();

    let voters: Vec<(VoterId, [f64; 2])> = db
        .projections_for_run(run_id)
        .await?
        .into_iter()
        .filter(|p| members.contains(&p.voter))
        .map(|p| (p.voter, [p.x, p.y]))
        .collect();

    let bridges = identify_bridge_voters(&voters, &centroids, threshold, min_connections);
    info!(
        target: TARGET_PIPELINE,
        "Bridge analysis for run {}: {} bridge voters", run_id, bridges.len()
    );
    Ok(bridges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, x: f64, y: f64) -> (VoterId, [f64; 2]) {
        (VoterId::User(id), [x, y])
    }

    #[test]
    fn midpoint_voter_is_a_strong_bridge() {
        // Centroids 0.2 apart, voter at the midpoint, threshold 1.0:
        // mean distance 0.1, strength 0.9.
        let centroids = vec![(0, [-0.1, 0.0]), (1, [0.1, 0.0])];
        let voters = vec![user(1, 0.0, 0.0)];
        let bridges = identify_bridge_voters(&voters, &centroids, 1.0, 2);

        assert_eq!(bridges.len(), 1);
        assert!(bridges[0].strength >= 0.8);
        assert_eq!(bridges[0].connections.len(), 2);
    }

    #[test]
    fn distant_voter_is_excluded() {
        let centroids = vec![(0, [-1.0, 0.0]), (1, [1.0, 0.0])];
        let voters = vec![user(1, 50.0, 50.0)];
        assert!(identify_bridge_voters(&voters, &centroids, 2.0, 2).is_empty());
    }

    #[test]
    fn single_connection_is_not_a_bridge() {
        let centroids = vec![(0, [0.0, 0.0]), (1, [10.0, 0.0])];
        let voters = vec![user(1, 0.1, 0.0)];
        assert!(identify_bridge_voters(&voters, &centroids, 1.0, 2).is_empty());
    }

    #[test]
    fn bridges_sort_strongest_first() {
        let centroids = vec![(0, [-1.0, 0.0]), (1, [1.0, 0.0])];
        let voters = vec![user(1, 0.0, 1.5), user(2, 0.0, 0.0)];
        let bridges = identify_bridge_voters(&voters, &centroids, 3.0, 2);

        assert_eq!(bridges.len(), 2);
        assert_eq!(bridges[0].voter, VoterId::User(2));
        assert!(bridges[0].strength > bridges[1].strength);
    }

    #[test]
    fn pairwise_midpoint_scores_one() {
        let a = [-1.0, 0.0];
        let b = [1.0, 0.0];
        assert!((pairwise_bridge_strength([0.0, 0.0], a, b) - 1.0).abs() < 1e-9);
        // Leaning toward one centroid weakens the score.
        let leaning = pairwise_bridge_strength([0.5, 0.0], a, b);
        assert!(leaning < 1.0 && leaning > 0.0);
        // Coincident centroids cannot be bridged.
        assert_eq!(pairwise_bridge_strength([0.0, 0.0], a, a), 0.0);
    }

    #[test]
    fn network_keeps_top_n_with_weighted_edges() {
        let centroids = vec![(0, [-1.0, 0.0], 5i64), (1, [1.0, 0.0], 7i64)];
        let voters = vec![user(1, 0.0, 0.0), user(2, 0.0, 0.5), user(3, 0.0, 1.0)];
        let network = build_bridge_network(&voters, &centroids, 3.0, 2, 2);

        assert_eq!(network.clusters.len(), 2);
        assert_eq!(network.bridges.len(), 2);
        assert_eq!(network.edges.len(), 4);
        for edge in &network.edges {
            assert!((0.0..=1.0).contains(&edge.weight));
        }
    }
}
