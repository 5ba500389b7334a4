//! Operators applying a batch of inputs to a partition model.
//!
//! A batch is one transaction: the model is read from the partition state, updated by
//! every input in turn, then written back and committed.

use std::collections::HashMap;

use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    access_log::AccessSummary,
    changefinder::ChangeFinderTable,
    config::{ChangeFinderConfig, KmeansConfig, LofConfig, MergeConfig, PartitionConfig},
    error::{Error, Result},
    kmeans,
    lof,
    model::{KmeansModel, KmeansResult, LofModel, LofPoint, LofResult},
    space::RealPoint,
    state::{PartitionedStateStore, SnapshotStore},
};

pub const LOF_STATE_KEY: &str = "lof";
pub const KMEANS_STATE_KEY: &str = "kmeans";

type Merge<T> = fn(&T, &T, &MergeConfig) -> T;

/// A stage turning parsed input lines into results, one batch at a time.
pub trait Operator {
    type Input;
    type Output: Serialize;

    /// Parses one input line.
    fn parse(&self, line: &str) -> Result<Self::Input>;

    /// Processes the inputs of transaction `tx_id`.
    fn process_batch(&mut self, tx_id: u64, inputs: Vec<Self::Input>) -> Vec<Self::Output>;
}

/// Parses comma separated coordinates. Surrounding brackets are accepted, empty tokens are skipped.
pub fn parse_vector(line: &str) -> Result<RealPoint> {
    let trimmed = line.trim().trim_start_matches('[').trim_end_matches(']');
    let point = trimmed
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<f64>().map_err(|e| Error::parse(line, e)))
        .collect::<Result<RealPoint>>()?;
    if point.is_empty() {
        return Err(Error::parse(line, "no coordinate"));
    }
    Ok(point)
}

/// Scores incoming points with the local outlier factor and learns from them.
pub struct LofUpdater<S: SnapshotStore<LofModel>> {
    config: LofConfig,
    state: PartitionedStateStore<LofModel, S, Merge<LofModel>>,
    receive_count: u64,
    model: LofModel,
}

impl<S: SnapshotStore<LofModel>> LofUpdater<S> {
    /// Fails when the configuration is out of range.
    pub fn new(config: LofConfig, partition: &PartitionConfig, store: S) -> Result<Self> {
        config.validate()?;
        partition.validate()?;
        let merge_config = config.merge_config();
        Ok(Self {
            config,
            state: PartitionedStateStore::new(
                store,
                lof::merge_state as Merge<LofModel>,
                merge_config,
                partition,
            ),
            receive_count: 0,
            model: LofModel::new(),
        })
    }

    /// Replaces the clock scheduling merges with sibling partitions.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + 'static) -> Self {
        self.state = self.state.with_clock(clock);
        self
    }

    /// Number of points received so far.
    pub fn receive_count(&self) -> u64 {
        self.receive_count
    }

    /// The model as of the last processed batch.
    pub fn model(&self) -> &LofModel {
        &self.model
    }

    /// Scores coordinates against the current model without learning from them.
    ///
    /// `None` while the model is empty.
    pub fn query(&self, coordinates: RealPoint) -> Option<f64> {
        if self.model.is_empty() {
            return None;
        }
        let point = LofPoint::generate(coordinates);
        let score = if self.config.has_intermediate_index {
            lof::score_without_update(self.config.k, &point, &self.model)
        } else {
            lof::score_no_intermediate(self.config.k, &point, &self.model)
        };
        Some(score)
    }

    /// Scores a point, learning from it depending on the model fill and the update policy.
    ///
    /// While the model holds fewer than `min_data_count` points, the point is only added
    /// and scores `0`.
    fn receive_point(&self, point: LofPoint, model: &mut LofModel) -> f64 {
        let LofConfig {
            k,
            min_data_count,
            max_data_count,
            always_update_model,
            update_interval,
            has_intermediate_index,
        } = self.config;
        let count = model.len();
        if count < min_data_count {
            model.add(point);
            if has_intermediate_index {
                lof::init_index(k, model);
            }
            return 0.;
        }
        let update = always_update_model
            || count < max_data_count
            || self.receive_count % update_interval as u64 == 0;
        match (update, has_intermediate_index) {
            (true, true) => lof::score_with_update(k, max_data_count, point, model),
            (true, false) => {
                let scored = point.clone();
                lof::add_point(max_data_count, point, model);
                lof::score_no_intermediate(k, &scored, model)
            }
            (false, true) => lof::score_without_update(k, &point, model),
            (false, false) => lof::score_no_intermediate(k, &point, model),
        }
    }
}

impl<S: SnapshotStore<LofModel>> Operator for LofUpdater<S> {
    type Input = LofPoint;
    type Output = LofResult;

    fn parse(&self, line: &str) -> Result<LofPoint> {
        parse_vector(line).map(LofPoint::generate)
    }

    fn process_batch(&mut self, tx_id: u64, points: Vec<LofPoint>) -> Vec<LofResult> {
        self.state.begin_commit(tx_id);
        let mut model = self.state.get(LOF_STATE_KEY);
        let mut results = Vec::with_capacity(points.len());
        for point in points {
            self.receive_count += 1;
            let score = self.receive_point(point.clone(), &mut model);
            results.push(LofResult { score, point });
        }
        debug!(tx_id, points = results.len(), model = model.len(), "lof batch");
        self.state.put(LOF_STATE_KEY, &model);
        self.state.commit(LOF_STATE_KEY);
        self.model = model;
        results
    }
}

/// Clusters every batch and classifies its points.
pub struct KmeansUpdater<S: SnapshotStore<KmeansModel>> {
    config: KmeansConfig,
    state: PartitionedStateStore<KmeansModel, S, Merge<KmeansModel>>,
    model: KmeansModel,
    rng: StdRng,
}

impl<S: SnapshotStore<KmeansModel>> KmeansUpdater<S> {
    /// Fails when the configuration is out of range.
    pub fn new(config: KmeansConfig, partition: &PartitionConfig, store: S) -> Result<Self> {
        config.validate()?;
        partition.validate()?;
        Ok(Self {
            config,
            state: PartitionedStateStore::new(
                store,
                kmeans::merge_state as Merge<KmeansModel>,
                MergeConfig::default(),
                partition,
            ),
            model: KmeansModel::default(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Seeds the centroid initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + 'static) -> Self {
        self.state = self.state.with_clock(clock);
        self
    }

    pub fn model(&self) -> &KmeansModel {
        &self.model
    }

    /// Classifies a point against the current model, `None` without model.
    pub fn query(&self, point: &RealPoint) -> Option<KmeansResult> {
        kmeans::classify(point, &self.model)
    }
}

impl<S: SnapshotStore<KmeansModel>> Operator for KmeansUpdater<S> {
    type Input = RealPoint;
    type Output = KmeansResult;

    fn parse(&self, line: &str) -> Result<RealPoint> {
        parse_vector(line)
    }

    /// A batch too small to be clustered is classified against the current model.
    fn process_batch(&mut self, tx_id: u64, points: Vec<RealPoint>) -> Vec<KmeansResult> {
        self.state.begin_commit(tx_id);
        let current = self.state.get(KMEANS_STATE_KEY);
        let KmeansConfig {
            cluster_count,
            max_iterations,
            convergence_threshold,
        } = self.config;
        let model = kmeans::fit_with_rng(
            &points,
            cluster_count,
            max_iterations,
            convergence_threshold,
            &mut self.rng,
        )
        .unwrap_or(current);
        if model.is_empty() {
            debug!(tx_id, points = points.len(), "no k-means model yet");
            return vec![];
        }
        let results: Vec<_> = points
            .iter()
            .filter_map(|point| kmeans::classify(point, &model))
            .collect();
        self.state.put(KMEANS_STATE_KEY, &model);
        self.state.commit(KMEANS_STATE_KEY);
        self.model = model;
        results
    }
}

/// Aggregates access logs by host and scores the response time of every host.
#[derive(Debug, Default)]
pub struct ChangeFinderUpdater {
    table: ChangeFinderTable,
}

impl ChangeFinderUpdater {
    /// Fails when the configuration is out of range.
    pub fn new(config: ChangeFinderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: ChangeFinderTable::new(config),
        })
    }

    /// Number of hosts seen so far.
    pub fn host_count(&self) -> usize {
        self.table.len()
    }

    fn score(&mut self, mut summary: AccessSummary) -> AccessSummary {
        let response_time = summary.time_sum as f64;
        let score = self.table.score(&summary.key, response_time);
        debug!(host = %summary.key, response_time, score, "change finder result");
        if self.table.is_anomalous(score) {
            info!(host = %summary.key, response_time, score, "over score threshold");
        }
        summary.anomaly_score = score;
        summary
    }
}

impl Operator for ChangeFinderUpdater {
    type Input = AccessSummary;
    type Output = AccessSummary;

    fn parse(&self, line: &str) -> Result<AccessSummary> {
        AccessSummary::parse(line)
    }

    /// Records of a host are combined, hosts are emitted in order of first appearance.
    fn process_batch(&mut self, tx_id: u64, records: Vec<AccessSummary>) -> Vec<AccessSummary> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut summaries: Vec<AccessSummary> = vec![];
        for record in records {
            match positions.get(&record.key) {
                Some(&i) => {
                    let combined = std::mem::take(&mut summaries[i]).combine(&record);
                    summaries[i] = combined;
                }
                None => {
                    positions.insert(record.key.clone(), summaries.len());
                    summaries.push(AccessSummary::zero().combine(&record));
                }
            }
        }
        debug!(tx_id, hosts = summaries.len(), "access log batch");
        summaries.into_iter().map(|s| self.score(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use approx_eq::assert_approx_eq;

    use crate::{
        changefinder::ChangeFinder,
        error::StoreError,
        lof::tests::build_sample,
        state::MemoryStore,
        updater::*,
    };

    /// Accepts every snapshot and never finds one back.
    struct ForgetfulStore;

    impl<T> SnapshotStore<T> for ForgetfulStore {
        fn get(
            &self,
            _base_key: &str,
            _tx_id: Option<u64>,
            _partition_index: usize,
            _is_self: bool,
        ) -> std::result::Result<Option<T>, StoreError> {
            Ok(None)
        }

        fn put(
            &self,
            _base_key: &str,
            _tx_id: u64,
            _partition_index: usize,
            _model: &T,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        fn put_latest_tx(
            &self,
            _base_key: &str,
            _partition_index: usize,
            _tx_id: u64,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    fn lof_updater(config: LofConfig) -> LofUpdater<MemoryStore> {
        LofUpdater::new(config, &PartitionConfig::default(), MemoryStore::new(0)).unwrap()
    }

    fn lof_config(
        min_data_count: usize,
        max_data_count: usize,
        update_interval: usize,
    ) -> LofConfig {
        LofConfig {
            k: 3,
            min_data_count,
            max_data_count,
            always_update_model: false,
            update_interval,
            has_intermediate_index: true,
        }
    }

    fn sample_points() -> Vec<LofPoint> {
        let model = build_sample();
        model
            .iter()
            .cloned()
            .map(|p| LofPoint::new(p.id, p.coordinates, p.timestamp))
            .collect()
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(vec![1., 2.5, -3.], parse_vector(" 1, 2.5 ,-3 ").unwrap());
        assert_eq!(vec![1., 2.], parse_vector("1,,2,").unwrap());
        assert_eq!(vec![4., 5.], parse_vector("[4.0,5.0]").unwrap());
        assert!(matches!(parse_vector("1,a"), Err(Error::Parse { .. })));
        assert!(matches!(parse_vector(""), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_lof_accumulates_below_min_count() {
        let mut updater = lof_updater(lof_config(5, 6, 1));
        let results = updater.process_batch(1, sample_points());
        assert_eq!(5, results.len());
        assert!(results.iter().all(|r| r.score == 0.));
        assert_eq!(5, updater.model().len());
        assert_eq!(5, updater.receive_count());
        let indexed = updater.model().get("point1").unwrap();
        assert_eq!(3, indexed.neighbor_ids.len());
    }

    #[test]
    fn test_lof_scores_once_filled() {
        let mut updater = lof_updater(lof_config(5, 6, 1));
        updater.process_batch(1, sample_points());
        let results = updater.process_batch(2, vec![LofPoint::new("point6", vec![2., 2., 2.], 10)]);
        assert_approx_eq!(1.28937, results[0].score, 1E-2);
        assert_eq!(6, updater.model().len());
    }

    #[test]
    fn test_lof_score_without_update() {
        // full model, 6 received points and an interval of 4: no update
        let mut updater = lof_updater(lof_config(5, 5, 4));
        updater.process_batch(1, sample_points());
        let results = updater.process_batch(2, vec![LofPoint::new("point6", vec![2., 2., 2.], 10)]);
        assert_approx_eq!(1.05108, results[0].score, 1E-2);
        assert_eq!(5, updater.model().len());
        assert!(!updater.model().contains("point6"));
    }

    #[test]
    fn test_lof_update_on_interval() {
        // the 6th point hits the interval: the oldest point is evicted
        let mut updater = lof_updater(lof_config(5, 5, 3));
        updater.process_batch(1, sample_points());
        let results = updater.process_batch(2, vec![LofPoint::new("point6", vec![2., 2., 2.], 10)]);
        assert_approx_eq!(1.16216, results[0].score, 1E-2);
        assert!(updater.model().contains("point6"));
        assert!(!updater.model().contains("point1"));
    }

    #[test]
    fn test_lof_without_intermediate_index() {
        let mut config = lof_config(5, 6, 1);
        config.has_intermediate_index = false;
        let mut updater = lof_updater(config);
        updater.process_batch(1, sample_points());
        assert!(updater.model().iter().all(|p| p.neighbor_ids.is_empty()));
        let outlier = LofPoint::new("point6", vec![10., 10., 10.], 10);
        let results = updater.process_batch(2, vec![outlier]);
        assert_approx_eq!(5.97670, results[0].score, 1E-2);
        assert_eq!(6, updater.model().len());
    }

    #[test]
    fn test_lof_query() {
        let mut updater = lof_updater(lof_config(5, 6, 1));
        assert_eq!(None, updater.query(vec![2., 2., 2.]));
        updater.process_batch(1, sample_points());
        assert_approx_eq!(5.97670, updater.query(vec![10., 10., 10.]).unwrap(), 1E-2);
        assert_eq!(5, updater.model().len());
    }

    #[test]
    fn test_lof_model_survives_in_store() {
        let store = MemoryStore::new(0);
        let mut updater =
            LofUpdater::new(lof_config(5, 6, 1), &PartitionConfig::default(), store.clone())
                .unwrap();
        updater.process_batch(1, sample_points());
        assert_eq!(2, store.len());
        let restored: Option<LofModel> = store.get(LOF_STATE_KEY, Some(1), 0, true).unwrap();
        assert_eq!(5, restored.unwrap().len());
    }

    #[test]
    fn test_lof_model_kept_when_snapshot_lost() {
        let mut updater =
            LofUpdater::new(lof_config(5, 6, 1), &PartitionConfig::default(), ForgetfulStore)
                .unwrap();
        updater.process_batch(1, sample_points());
        let results = updater.process_batch(2, vec![LofPoint::new("point6", vec![2., 2., 2.], 10)]);
        assert_approx_eq!(1.28937, results[0].score, 1E-2);
        assert_eq!(6, updater.model().len());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = MemoryStore::new(0);
        let partition = PartitionConfig::default();
        let config = lof_config(5, 6, 0);
        assert!(matches!(
            LofUpdater::new(config, &partition, store.clone()),
            Err(Error::InvalidConfig(_))
        ));
        let outside = PartitionConfig {
            partition_index: 1,
            ..PartitionConfig::default()
        };
        assert!(matches!(
            LofUpdater::new(LofConfig::default(), &outside, store.clone()),
            Err(Error::InvalidConfig(_))
        ));
        let kmeans = KmeansConfig {
            cluster_count: 0,
            ..KmeansConfig::default()
        };
        assert!(KmeansUpdater::new(kmeans, &partition, store).is_err());
        let change_finder = ChangeFinderConfig {
            forget_factor: 0.,
            ..ChangeFinderConfig::default()
        };
        assert!(ChangeFinderUpdater::new(change_finder).is_err());
    }

    #[test]
    fn test_kmeans_batches() {
        let mut updater = KmeansUpdater::new(
            KmeansConfig {
                cluster_count: 2,
                ..KmeansConfig::default()
            },
            &PartitionConfig::default(),
            MemoryStore::new(0),
        )
        .unwrap()
        .with_seed(7);
        assert!(updater.process_batch(1, vec![vec![1., 1.]]).is_empty());
        assert!(updater.query(&vec![1., 1.]).is_none());
        let points = vec![vec![1., 1.], vec![1.2, 0.8], vec![9., 9.], vec![9.1, 8.9]];
        let results = updater.process_batch(2, points);
        assert_eq!(4, results.len());
        assert_eq!(results[0].centroid_index, results[1].centroid_index);
        assert_eq!(results[2].centroid_index, results[3].centroid_index);
        assert_ne!(results[0].centroid_index, results[2].centroid_index);
        // too few points to fit: the previous model classifies them
        let results = updater.process_batch(3, vec![vec![8.5, 8.5]]);
        assert_eq!(1, results.len());
        let expected = updater.query(&vec![9., 9.]).unwrap().centroid_index;
        assert_eq!(expected, results[0].centroid_index);
    }

    #[test]
    fn test_change_finder_combines_hosts() {
        let record = |key: &str, time_sum: u64| AccessSummary {
            key: key.into(),
            count: 1,
            time_sum,
            ..AccessSummary::zero()
        };
        let mut updater = ChangeFinderUpdater::new(ChangeFinderConfig::default()).unwrap();
        let records = vec![record("a", 10), record("b", 5), record("a", 30)];
        let results = updater.process_batch(1, records);
        assert_eq!(2, results.len());
        assert_eq!("a", results[0].key);
        assert_eq!(2, results[0].count);
        assert_eq!(40, results[0].time_sum);
        assert_eq!("b", results[1].key);
        assert_eq!(2, updater.host_count());
        let mut reference = ChangeFinder::from_config(&ChangeFinderConfig::default());
        assert_eq!(reference.score(40.), results[0].anomaly_score);
    }
}
