use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::clustering::{KMEANS_MAX_ITERATIONS, KMEANS_RESTARTS};
use crate::TARGET_PIPELINE;

/// Outcome of one k-means run: a label per point, k centroids, and the
/// weighted within-cluster variance.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub assignments: Vec<usize>,
    pub centroids: Vec<[f64; 2]>,
    pub inertia: f64,
}

pub fn distance_squared(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// Default base-cluster count: roughly one cluster per ten voters,
/// bounded to [10, 100] and never exceeding the voter count.
pub fn default_base_k(voter_count: usize) -> usize {
    (voter_count / 10).clamp(10, 100).min(voter_count)
}

/// Weighted Lloyd k-means over 2-D points with bounded iterations and
/// multiple seeded restarts, keeping the lowest-inertia result.
///
/// Weighting policy: assignment goes to the nearest centroid
/// regardless of weight; centroid updates and inertia are weighted, so
/// more active voters pull cluster centers toward themselves.
///
/// # Arguments
/// * `points` - One 2-D point per voter
/// * `weights` - Per-point weight (vote count); must match `points`
/// * `k` - Cluster count, 1 ≤ k ≤ points
/// * `seed` - Base seed; each restart perturbs it deterministically
pub fn cluster_points(
    points: &[[f64; 2]],
    weights: &[f64],
    k: usize,
    seed: u64,
) -> Result<KMeansResult> {
    if points.is_empty() {
        return Err(anyhow!("cannot cluster zero points"));
    }
    if weights.len() != points.len() {
        return Err(anyhow!(
            "weight count {} does not match point count {}",
            weights.len(),
            points.len()
        ));
    }
    if k == 0 || k > points.len() {
        return Err(anyhow!(
            "invalid cluster count {} for {} points",
            k,
            points.len()
        ));
    }

    let mut best: Option<KMeansResult> = None;
    for restart in 0..KMEANS_RESTARTS {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(restart as u64));
        let result = lloyd_once(points, weights, k, &mut rng);
        if best.as_ref().map_or(true, |b| result.inertia < b.inertia) {
            best = Some(result);
        }
    }

    let best = best.expect("at least one restart ran");
    debug!(
        target: TARGET_PIPELINE,
        "k-means: k={} over {} points, inertia {:.4}",
        k,
        points.len(),
        best.inertia
    );
    Ok(best)
}

fn lloyd_once(points: &[[f64; 2]], weights: &[f64], k: usize, rng: &mut StdRng) -> KMeansResult {
    let n = points.len();

    // Seed centroids from k distinct points.
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.random_range(i..n);
        indices.swap(i, j);
    }
    let mut centroids: Vec<[f64; 2]> = indices[..k].iter().map(|&i| points[i]).collect();

    let mut assignments = vec![0usize; n];
    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let nearest = nearest_centroid(*point, &centroids);
            if assignments[i] != nearest {
                assignments[i] = nearest;
                changed = true;
            }
        }

        // Weighted centroid update; a cluster left empty keeps its
        // previous centroid.
        let mut sums = vec![[0.0f64; 2]; k];
        let mut totals = vec![0.0f64; k];
        for (i, point) in points.iter().enumerate() {
            let w = weights[i].max(0.0);
            let c = assignments[i];
            sums[c][0] += point[0] * w;
            sums[c][1] += point[1] * w;
            totals[c] += w;
        }
        for c in 0..k {
            if totals[c] > 0.0 {
                centroids[c] = [sums[c][0] / totals[c], sums[c][1] / totals[c]];
            }
        }

        if !changed {
            break;
        }
    }

    let inertia = points
        .iter()
        .enumerate()
        .map(|(i, &p)| weights[i].max(0.0) * distance_squared(p, centroids[assignments[i]]))
        .sum();

    KMeansResult {
        assignments,
        centroids,
        inertia,
    }
}

fn nearest_centroid(point: [f64; 2], centroids: &[[f64; 2]]) -> usize {
    let mut nearest = 0;
    let mut best = f64::INFINITY;
    for (c, &centroid) in centroids.iter().enumerate() {
        let d = distance_squared(point, centroid);
        if d < best {
            best = d;
            nearest = c;
        }
    }
    nearest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_k_is_clamped() {
        assert_eq!(default_base_k(5), 5);
        assert_eq!(default_base_k(50), 10);
        assert_eq!(default_base_k(400), 40);
        assert_eq!(default_base_k(5000), 100);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(cluster_points(&[], &[], 1, 0).is_err());
        assert!(cluster_points(&[[0.0, 0.0]], &[1.0], 2, 0).is_err());
        assert!(cluster_points(&[[0.0, 0.0]], &[1.0, 1.0], 1, 0).is_err());
    }

    #[test]
    fn separates_two_obvious_camps() {
        let points = vec![
            [-5.0, 0.1],
            [-5.1, -0.2],
            [-4.9, 0.0],
            [5.0, 0.1],
            [5.1, -0.1],
            [4.9, 0.2],
        ];
        let weights = vec![1.0; 6];
        let result = cluster_points(&points, &weights, 2, 42).unwrap();

        let left = result.assignments[0];
        let right = result.assignments[3];
        assert_ne!(left, right);
        assert!(result.assignments[..3].iter().all(|&a| a == left));
        assert!(result.assignments[3..].iter().all(|&a| a == right));
    }

    #[test]
    fn weights_pull_centroids() {
        // One cluster of two points; the heavy point dominates the
        // centroid position.
        let points = vec![[0.0, 0.0], [1.0, 0.0]];
        let weights = vec![9.0, 1.0];
        let result = cluster_points(&points, &weights, 1, 7).unwrap();
        assert!((result.centroids[0][0] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn restarts_keep_lowest_inertia() {
        let points: Vec<[f64; 2]> = (0..20)
            .map(|i| {
                let base = if i < 10 { -3.0 } else { 3.0 };
                [base + (i % 5) as f64 * 0.01, (i % 3) as f64 * 0.01]
            })
            .collect();
        let weights = vec![1.0; 20];
        let result = cluster_points(&points, &weights, 2, 1).unwrap();
        // Optimal split keeps inertia tiny; a bad local optimum would
        // be orders of magnitude worse.
        assert!(result.inertia < 1.0);
    }
}
