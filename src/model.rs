use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::space::RealPoint;

/// A point of a local outlier factor model with its index fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LofPoint {
    pub id: String,
    pub coordinates: RealPoint,
    /// distance to the k-th nearest neighbor
    pub k_distance: f64,
    /// k nearest neighbors, nearest first
    pub neighbor_ids: Vec<String>,
    /// local reachability density
    pub lrd: f64,
    /// milliseconds since epoch, only used to order points when merging
    pub timestamp: u64,
}

impl LofPoint {
    /// Builds a new point without index.
    pub fn new(id: impl Into<String>, coordinates: RealPoint, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            coordinates,
            timestamp,
            ..Default::default()
        }
    }

    /// Builds a new point with a random identifier, stamped with the current time.
    pub fn generate(coordinates: RealPoint) -> Self {
        let id = format!("{:032x}", rand::random::<u128>());
        Self::new(id, coordinates, now_millis())
    }
}

/// Milliseconds elapsed since epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A bounded set of points in insertion order.
///
/// The insertion order defines the eviction order, the oldest point coming first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LofModel {
    ids: Vec<String>,
    points_by_id: HashMap<String, LofPoint>,
}

impl LofModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Identifiers, oldest first.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn oldest_id(&self) -> Option<&String> {
        self.ids.first()
    }

    pub fn get(&self, id: &str) -> Option<&LofPoint> {
        self.points_by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut LofPoint> {
        self.points_by_id.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points_by_id.contains_key(id)
    }

    /// Appends a point as the newest one. A point with the same id is replaced.
    pub fn add(&mut self, point: LofPoint) {
        if self.points_by_id.contains_key(&point.id) {
            self.ids.retain(|id| id != &point.id);
        }
        self.ids.push(point.id.clone());
        self.points_by_id.insert(point.id.clone(), point);
    }

    pub fn remove(&mut self, id: &str) -> Option<LofPoint> {
        let removed = self.points_by_id.remove(id)?;
        self.ids.retain(|i| i != id);
        Some(removed)
    }

    /// Iterates over the points, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LofPoint> + '_ {
        self.ids.iter().filter_map(|id| self.points_by_id.get(id))
    }

    /// An independent copy of the model that can be mutated freely.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

/// Centroids of a k-means model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmeansModel {
    /// one slot per cluster, `None` when never populated
    pub centroids: Vec<Option<RealPoint>>,
    /// points assigned to each cluster by the last fit
    pub counts_per_cluster: Vec<u64>,
}

impl KmeansModel {
    pub fn new(centroids: Vec<RealPoint>, counts_per_cluster: Vec<u64>) -> Self {
        Self {
            centroids: centroids.into_iter().map(Some).collect(),
            counts_per_cluster,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Whether no centroid is populated.
    pub fn is_empty(&self) -> bool {
        self.centroids.iter().all(Option::is_none)
    }

    /// Iterates over the populated centroids with their index.
    pub fn iter_centroids(&self) -> impl Iterator<Item = (usize, &RealPoint)> + '_ {
        self.centroids
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }
}

/// Local outlier factor of some point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LofResult {
    pub score: f64,
    pub point: LofPoint,
}

/// Classification of some point against a k-means model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmeansResult {
    pub point: RealPoint,
    pub centroid_index: usize,
    pub centroid: RealPoint,
    pub distance: f64,
}

#[cfg(test)]
mod tests {
    use crate::model::*;

    #[test]
    fn test_lof_model_order() {
        let mut model = LofModel::new();
        model.add(LofPoint::new("a", vec![0.], 1));
        model.add(LofPoint::new("b", vec![1.], 2));
        model.add(LofPoint::new("c", vec![2.], 3));
        assert_eq!(3, model.len());
        assert_eq!(Some(&"a".to_string()), model.oldest_id());
        let removed = model.remove("a").unwrap();
        assert_eq!(vec![0.], removed.coordinates);
        assert!(!model.contains("a"));
        let ids: Vec<_> = model.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(vec!["b", "c"], ids);
        assert!(model.remove("a").is_none());
    }

    #[test]
    fn test_lof_model_replace() {
        let mut model = LofModel::new();
        model.add(LofPoint::new("a", vec![0.], 1));
        model.add(LofPoint::new("b", vec![1.], 2));
        model.add(LofPoint::new("a", vec![5.], 3));
        assert_eq!(2, model.len());
        assert_eq!(&["b".to_string(), "a".to_string()], model.ids());
        assert_eq!(vec![5.], model.get("a").unwrap().coordinates);
    }

    #[test]
    fn test_lof_snapshot_independent() {
        let mut model = LofModel::new();
        model.add(LofPoint::new("a", vec![0.], 1));
        let mut copy = model.snapshot();
        copy.get_mut("a").unwrap().lrd = 4.;
        copy.add(LofPoint::new("b", vec![1.], 2));
        assert_eq!(0., model.get("a").unwrap().lrd);
        assert_eq!(1, model.len());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let p1 = LofPoint::generate(vec![1.]);
        let p2 = LofPoint::generate(vec![1.]);
        assert_ne!(p1.id, p2.id);
        assert_eq!(32, p1.id.len());
        assert!(p1.timestamp > 0);
    }

    #[test]
    fn test_kmeans_model_centroids() {
        let mut model = KmeansModel::new(vec![vec![0.], vec![1.]], vec![3, 4]);
        assert!(!model.is_empty());
        model.centroids[0] = None;
        let centroids: Vec<_> = model.iter_centroids().collect();
        assert_eq!(vec![(1, &vec![1.])], centroids);
        assert!(KmeansModel::default().is_empty());
    }

    #[test]
    fn test_serialize_result() {
        let result = KmeansResult {
            point: vec![1., 2.],
            centroid_index: 1,
            centroid: vec![0.5, 2.],
            distance: 0.5,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            r#"{"point":[1.0,2.0],"centroidIndex":1,"centroid":[0.5,2.0],"distance":0.5}"#,
            json
        );
    }
}
