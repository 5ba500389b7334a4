//! K-means clustering fitted batch by batch.
//!
//! Centroids are seeded with k-means++ then refined with Lloyd iterations.
//! Partition models are merged by pairing their closest centroids.

use std::collections::HashSet;

use rand::Rng;
use tracing::debug;

use crate::{
    config::MergeConfig,
    model::{KmeansModel, KmeansResult},
    neighbors::GetNeighborhood,
    space::{self, RealPoint},
};

/// Fits a model with `cluster_count` centroids, `None` when there are fewer points than clusters.
pub fn fit(
    points: &[RealPoint],
    cluster_count: usize,
    max_iterations: usize,
    convergence_threshold: f64,
) -> Option<KmeansModel> {
    fit_with_rng(
        points,
        cluster_count,
        max_iterations,
        convergence_threshold,
        &mut rand::thread_rng(),
    )
}

/// Same as `fit` with the given source of randomness for seeding.
pub fn fit_with_rng<R: Rng + ?Sized>(
    points: &[RealPoint],
    cluster_count: usize,
    max_iterations: usize,
    convergence_threshold: f64,
    rng: &mut R,
) -> Option<KmeansModel> {
    if cluster_count == 0 || points.len() < cluster_count {
        return None;
    }
    let centroids = initial_centroids(points, cluster_count, rng);
    Some(fit_from(points, centroids, max_iterations, convergence_threshold))
}

/// Runs Lloyd iterations starting from the given centroids.
///
/// Empty clusters keep their previous centroid. Iterations stop once every centroid
/// moved by at most `convergence_threshold`.
pub fn fit_from(
    points: &[RealPoint],
    initial: Vec<RealPoint>,
    max_iterations: usize,
    convergence_threshold: f64,
) -> KmeansModel {
    let mut centroids = initial;
    let mut counts = vec![0u64; centroids.len()];
    for iteration in 0..max_iterations {
        let assignments = assign(points, &centroids);
        let moved: Vec<RealPoint> = assignments
            .iter()
            .zip(&centroids)
            .map(|(members, previous)| {
                space::mean(members.iter().map(|&i| &points[i])).unwrap_or_else(|| previous.clone())
            })
            .collect();
        counts = assignments.iter().map(|m| m.len() as u64).collect();
        let converged = centroids
            .iter()
            .zip(&moved)
            .all(|(c1, c2)| space::euclid_dist(c1, c2) <= convergence_threshold);
        centroids = moved;
        if converged {
            debug!(iteration, "k-means converged");
            break;
        }
    }
    KmeansModel::new(centroids, counts)
}

/// Indices of the points nearest to each centroid.
fn assign(points: &[RealPoint], centroids: &[RealPoint]) -> Vec<Vec<usize>> {
    let mut assignments = vec![vec![]; centroids.len()];
    for (i, point) in points.iter().enumerate() {
        if let Some(nearest) = centroids
            .iter()
            .enumerate()
            .get_nearest(point, space::euclid_dist)
        {
            assignments[nearest.into_id()].push(i);
        }
    }
    assignments
}

/// Seeds centroids with k-means++.
///
/// The first centroid is drawn uniformly, the next ones with a probability proportional
/// to the squared distance to the nearest centroid already chosen.
pub fn initial_centroids<R: Rng + ?Sized>(
    points: &[RealPoint],
    cluster_count: usize,
    rng: &mut R,
) -> Vec<RealPoint> {
    if points.is_empty() {
        return vec![];
    }
    let mut chosen = vec![false; points.len()];
    let first = rng.gen_range(0..points.len());
    chosen[first] = true;
    let mut centroids = vec![points[first].clone()];
    while centroids.len() < cluster_count.min(points.len()) {
        let cumulative = cumulative_weights(points, &centroids, &chosen);
        let total = cumulative.last().copied().unwrap_or_default();
        let target = rng.gen::<f64>() * total;
        let index = next_unchosen(weighted_index(&cumulative, target), &chosen);
        chosen[index] = true;
        centroids.push(points[index].clone());
    }
    centroids
}

/// Running sums of the squared distances to the nearest centroid, chosen points weighing nothing.
fn cumulative_weights(points: &[RealPoint], centroids: &[RealPoint], chosen: &[bool]) -> Vec<f64> {
    let mut sum = 0.;
    points
        .iter()
        .zip(chosen)
        .map(|(point, &is_chosen)| {
            if !is_chosen {
                let nearest = centroids
                    .iter()
                    .enumerate()
                    .get_nearest(point, space::euclid_dist);
                let dx = nearest.map(|n| n.dist()).unwrap_or_default();
                sum += dx * dx;
            }
            sum
        })
        .collect()
}

/// First index whose cumulative weight reaches the target.
fn weighted_index(cumulative: &[f64], target: f64) -> usize {
    let index = cumulative.partition_point(|&w| w < target);
    index.min(cumulative.len().saturating_sub(1))
}

/// Skips forward, wrapping around, to the first point not chosen yet.
fn next_unchosen(index: usize, chosen: &[bool]) -> usize {
    (0..chosen.len())
        .map(|offset| (index + offset) % chosen.len())
        .find(|&i| !chosen[i])
        .unwrap_or(index)
}

/// Finds the nearest centroid, `None` when the model has no centroid.
pub fn classify(point: &RealPoint, model: &KmeansModel) -> Option<KmeansResult> {
    let nearest = model
        .iter_centroids()
        .get_nearest(point, space::euclid_dist)?;
    let centroid_index = *nearest.id();
    let centroid = model.centroids[centroid_index].clone()?;
    Some(KmeansResult {
        point: point.clone(),
        centroid_index,
        centroid,
        distance: nearest.dist(),
    })
}

/// Merges two models by averaging centroids paired greedily, closest pairs first.
///
/// The result has as many clusters as the smaller model.
pub fn merge_models(base: &KmeansModel, other: &KmeansModel) -> KmeansModel {
    let n = base.cluster_count().min(other.cluster_count());
    let mut pairs: Vec<(usize, usize, f64)> = base
        .iter_centroids()
        .filter(|(i, _)| *i < n)
        .flat_map(|(i, c1)| {
            other
                .iter_centroids()
                .filter(|(j, _)| *j < n)
                .map(move |(j, c2)| (i, j, space::euclid_dist(c1, c2)))
        })
        .collect();
    pairs.sort_by(|p1, p2| p1.2.total_cmp(&p2.2));
    let mut mapped_base = HashSet::new();
    let mut mapped_other = HashSet::new();
    let mut centroids = vec![None; n];
    let mut counts = vec![0u64; n];
    for (i, j, _) in pairs {
        if mapped_base.len() >= n {
            break;
        }
        if mapped_base.contains(&i) || mapped_other.contains(&j) {
            continue;
        }
        mapped_base.insert(i);
        mapped_other.insert(j);
        if let (Some(c1), Some(c2)) = (&base.centroids[i], &other.centroids[j]) {
            centroids[i] = Some(space::average(c1, c2));
        }
        counts[i] = base.counts_per_cluster.get(i).copied().unwrap_or_default()
            + other.counts_per_cluster.get(j).copied().unwrap_or_default();
    }
    KmeansModel {
        centroids,
        counts_per_cluster: counts,
    }
}

/// Merge hook for sibling partition models.
pub fn merge_state(base: &KmeansModel, other: &KmeansModel, _config: &MergeConfig) -> KmeansModel {
    merge_models(base, other)
}
