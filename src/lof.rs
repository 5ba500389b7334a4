//! Incremental local outlier factor.
//!
//! A model is either kept without index (only coordinates are meaningful) or indexed,
//! in which case every point carries its k-distance, its k nearest neighbors and its
//! local reachability density. `init_index` and `score_with_update` produce an indexed
//! model, `score_without_update` requires one, and `score_no_intermediate` works on
//! both by re-indexing a private copy.

use std::collections::HashSet;

use tracing::debug;

use crate::{
    config::MergeConfig,
    model::{LofModel, LofPoint},
    neighbors::GetNeighborhood,
    space,
};

/// The k-distance of a point and the neighbors it was computed from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KDistance {
    pub distance: f64,
    /// nearest first
    pub neighbor_ids: Vec<String>,
}

/// Computes the distance to the k-th nearest point of the model, the point itself excluded.
///
/// When the model holds fewer than `k` other points, the farthest one gives the distance.
pub fn k_distance(k: usize, point: &LofPoint, model: &LofModel) -> KDistance {
    let ranking = model
        .iter()
        .filter(|other| other.id != point.id)
        .map(|other| (other.id.as_str(), &other.coordinates))
        .get_neighborhood(&point.coordinates, k, space::euclid_dist);
    KDistance {
        distance: ranking.last().map(|n| n.dist()).unwrap_or_default(),
        neighbor_ids: ranking.into_iter().map(|n| n.into_id().to_string()).collect(),
    }
}

/// The distance from `point` to `neighbor`, bounded below by the neighbor k-distance.
pub fn reach_distance(point: &LofPoint, neighbor: &LofPoint) -> f64 {
    space::euclid_dist(&point.coordinates, &neighbor.coordinates).max(neighbor.k_distance)
}

/// Local reachability density, neighbors missing from the model being skipped.
pub fn lrd(point: &LofPoint, model: &LofModel) -> f64 {
    let (count, total) = point
        .neighbor_ids
        .iter()
        .filter_map(|id| model.get(id))
        .fold((0usize, 0.), |(count, total), neighbor| {
            (count + 1, total + reach_distance(point, neighbor))
        });
    if total == 0. {
        0.
    } else {
        count as f64 / total
    }
}

/// Local outlier factor, `0` for a point without neighbors or with a null density.
pub fn lof(point: &LofPoint, model: &LofModel) -> f64 {
    if point.lrd == 0. {
        return 0.;
    }
    let (count, total) = point
        .neighbor_ids
        .iter()
        .filter_map(|id| model.get(id))
        .fold((0usize, 0.), |(count, total), neighbor| {
            (count + 1, total + neighbor.lrd / point.lrd)
        });
    if count == 0 {
        total
    } else {
        total / count as f64
    }
}

/// Scores a point against a model that keeps no index.
///
/// The index is rebuilt on a private copy, the caller model is left untouched.
pub fn score_no_intermediate(k: usize, point: &LofPoint, model: &LofModel) -> f64 {
    let mut target = point.clone();
    set_k_distance(&mut target, k_distance(k, point, model));
    let mut indexed = model.snapshot();
    init_index(k, &mut indexed);
    target.lrd = lrd(&target, &indexed);
    lof(&target, &indexed)
}

/// Scores a point against an indexed model without modifying it.
pub fn score_without_update(k: usize, point: &LofPoint, model: &LofModel) -> f64 {
    let mut target = point.clone();
    set_k_distance(&mut target, k_distance(k, point, model));
    target.lrd = lrd(&target, model);
    lof(&target, model)
}

/// Inserts a point, evicting the oldest one when the model is full.
/// Returns the evicted identifier.
pub fn add_point(max_count: usize, point: LofPoint, model: &mut LofModel) -> Option<String> {
    let evicted = if max_count <= model.len() {
        model
            .oldest_id()
            .cloned()
            .and_then(|id| model.remove(&id))
            .map(|p| p.id)
    } else {
        None
    };
    model.add(point);
    evicted
}

/// Inserts a point in an indexed model, refreshes the index and scores the point.
///
/// Only the points whose neighborhood may have changed get a new k-distance,
/// densities are then recomputed for every point.
pub fn score_with_update(k: usize, max_count: usize, point: LofPoint, model: &mut LofModel) -> f64 {
    let added_id = point.id.clone();
    let evicted = add_point(max_count, point, model);
    let targets = update_targets(&added_id, evicted.as_deref(), model);
    debug!(
        added = %added_id,
        evicted = ?evicted,
        targets = targets.len(),
        "lof index update"
    );
    update_k_distances(k, model, |p| targets.contains(&p.id));
    update_lrds(model);
    model
        .get(&added_id)
        .map(|added| lof(added, model))
        .unwrap_or_default()
}

/// Computes k-distance and neighbors of every point, then the density of every point.
pub fn init_index(k: usize, model: &mut LofModel) {
    update_k_distances(k, model, |_| true);
    update_lrds(model);
}

/// Keeps the most recent points of both models, at most `max_count` of them.
///
/// When both models hold the same id, the most recent point wins.
/// The result carries no index.
pub fn merge_models(base: &LofModel, other: &LofModel, max_count: usize) -> LofModel {
    let mut points: Vec<&LofPoint> = base.iter().chain(other.iter()).collect();
    points.sort_by(|p1, p2| p2.timestamp.cmp(&p1.timestamp));
    let mut registered = HashSet::new();
    let mut newest = vec![];
    for point in points {
        if newest.len() >= max_count {
            break;
        }
        if registered.insert(point.id.as_str()) {
            newest.push(LofPoint::new(
                point.id.clone(),
                point.coordinates.clone(),
                point.timestamp,
            ));
        }
    }
    let mut merged = LofModel::new();
    newest.into_iter().rev().for_each(|p| merged.add(p));
    merged
}

/// Merges a sibling partition model, re-indexing the result when the index is kept.
pub fn merge_state(base: &LofModel, other: &LofModel, config: &MergeConfig) -> LofModel {
    let mut merged = merge_models(base, other, config.max_count);
    if config.has_intermediate_index {
        init_index(config.k, &mut merged);
    }
    merged
}

/// Points whose k-distance must be recomputed after `added_id` was inserted
/// and `evicted_id` removed: the added point, the points that had the evicted one
/// as neighbor and the points now closer to the added point than their k-distance.
fn update_targets(added_id: &str, evicted_id: Option<&str>, model: &LofModel) -> HashSet<String> {
    let mut targets = HashSet::new();
    targets.insert(added_id.to_string());
    let added = match model.get(added_id) {
        Some(added) => added,
        None => return targets,
    };
    for point in model.iter().filter(|p| p.id != added_id) {
        let lost_neighbor =
            evicted_id.map_or(false, |evicted| point.neighbor_ids.iter().any(|id| id == evicted));
        let closer = space::euclid_dist(&added.coordinates, &point.coordinates) < point.k_distance;
        if lost_neighbor || closer {
            targets.insert(point.id.clone());
        }
    }
    targets
}

fn set_k_distance(point: &mut LofPoint, k_distance: KDistance) {
    point.k_distance = k_distance.distance;
    point.neighbor_ids = k_distance.neighbor_ids;
}

fn update_k_distances<F>(k: usize, model: &mut LofModel, selected: F)
where
    F: Fn(&LofPoint) -> bool,
{
    let updates: Vec<_> = model
        .iter()
        .filter(|p| selected(p))
        .map(|p| (p.id.clone(), k_distance(k, p, model)))
        .collect();
    for (id, k_distance) in updates {
        if let Some(point) = model.get_mut(&id) {
            set_k_distance(point, k_distance);
        }
    }
}

/// Densities only depend on k-distances, thus they are all computed before being set.
fn update_lrds(model: &mut LofModel) {
    let updates: Vec<_> = model.iter().map(|p| (p.id.clone(), lrd(p, model))).collect();
    for (id, lrd) in updates {
        if let Some(point) = model.get_mut(&id) {
            point.lrd = lrd;
        }
    }
}
