use std::error::Error;

use fluent_detect::{
    config::{ChangeFinderConfig, KmeansConfig, LofConfig, PartitionConfig},
    state::MemoryStore,
    streamer::*,
    updater::{ChangeFinderUpdater, KmeansUpdater, LofUpdater},
};
use serde_json::Value;

use utilities::{
    access_log, assert_lof_results, assert_pattern, get_cluster_iter, get_point_iter, steady_time,
    KMEANS_PATTERN,
};

fn collect(result: &mut Vec<String>) -> impl FnMut(String) -> Result<(), Box<dyn Error>> + '_ {
    move |line: String| {
        result.push(line);
        Ok(())
    }
}

#[test]
fn test_lof_streamer() {
    let mut updater =
        LofUpdater::new(LofConfig::default(), &PartitionConfig::default(), MemoryStore::new(0))
            .unwrap();
    let mut result: Vec<String> = vec![];
    let streamer = Streamer::new(get_point_iter(300), collect(&mut result), 10);
    match Streamer::run(streamer, &mut updater) {
        Ok(tx_count) => {
            assert_eq!(30, tx_count);
            assert_lof_results(result, 300);
        }
        Err(_) => panic!(),
    };
    assert_eq!(100, updater.model().len());
}

#[test]
fn test_kmeans_streamer() {
    let partition = PartitionConfig::default();
    let mut updater = KmeansUpdater::new(KmeansConfig::default(), &partition, MemoryStore::new(0))
        .unwrap()
        .with_seed(17);
    let mut result: Vec<String> = vec![];
    let streamer = Streamer::new(get_cluster_iter(200), collect(&mut result), 20);
    Streamer::run(streamer, &mut updater).unwrap();
    assert_eq!(200, result.len());
    assert_pattern(&result, KMEANS_PATTERN);
    let last_batch: Vec<Value> = result[180..]
        .iter()
        .map(|r| serde_json::from_str(r).unwrap())
        .collect();
    let index_of = |v: &Value| v["centroidIndex"].as_u64().unwrap();
    let low = index_of(&last_batch[0]);
    let high = index_of(&last_batch[1]);
    assert_ne!(low, high);
    for (i, r) in last_batch.iter().enumerate() {
        assert_eq!(if i % 2 == 0 { low } else { high }, index_of(r));
        assert!(r["distance"].as_f64().unwrap() < 5.);
    }
}

#[test]
fn test_changefinder_streamer() {
    let lines = (0..165).flat_map(|i| {
        let time = if i < 150 { steady_time(i) } else { steady_time(i) + 50000 };
        vec![access_log("a", time), access_log("b", steady_time(i))]
    });
    let lines = lines.map(|l| -> Result<String, Box<dyn Error>> { Ok(l) });
    let config = ChangeFinderConfig::default();
    let threshold = config.score_threshold;
    let mut updater = ChangeFinderUpdater::new(config).unwrap();
    let mut result: Vec<String> = vec![];
    let streamer = Streamer::new(lines, collect(&mut result), 2);
    assert_eq!(165, Streamer::run(streamer, &mut updater).unwrap());
    assert_eq!(330, result.len());
    assert_eq!(2, updater.host_count());
    let scores: Vec<f64> = result
        .iter()
        .step_by(2)
        .map(|r| {
            let record: Value = serde_json::from_str(r).unwrap();
            assert_eq!("a", record["key"]);
            record["anomalyScore"].as_f64().unwrap()
        })
        .collect();
    assert!(scores[75..150].iter().all(|&s| s <= threshold));
    let first_over = scores[150..].iter().position(|&s| s > threshold);
    assert!(matches!(first_over, Some(i) if i < 5));
}
