//! Typed configuration surface of the engines and operators.
//!
//! Every structure deserializes from JSON with defaults for missing fields
//! and checks its ranges with `validate`.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Two-stage change finder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeFinderConfig {
    /// Autoregression order.
    pub ar_order: usize,
    /// Moving average window.
    pub smoothing_window: usize,
    /// Discount rate in (0, 1], the higher the faster history is forgotten.
    pub forget_factor: f64,
    /// Scores above this value are reported.
    pub score_threshold: f64,
}

impl Default for ChangeFinderConfig {
    fn default() -> Self {
        Self {
            ar_order: 4,
            smoothing_window: 5,
            forget_factor: 0.05,
            score_threshold: 5.0,
        }
    }
}

impl ChangeFinderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ar_order < 1 {
            return Err(invalid("arOrder must be >= 1"));
        }
        if self.smoothing_window < 1 {
            return Err(invalid("smoothingWindow must be >= 1"));
        }
        if !(self.forget_factor > 0. && self.forget_factor <= 1.) {
            return Err(invalid("forgetFactor must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Local outlier factor operator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LofConfig {
    /// Number of neighbors.
    #[serde(alias = "kn")]
    pub k: usize,
    /// Points are only accumulated until the model holds this many.
    pub min_data_count: usize,
    /// Model capacity, the oldest points are evicted first.
    pub max_data_count: usize,
    /// Update the model with every received point.
    pub always_update_model: bool,
    /// Otherwise update it every `update_interval` received points.
    pub update_interval: usize,
    /// Keep k-distance, neighbors and lrd persistently in the model.
    #[serde(alias = "hasIntermediate")]
    pub has_intermediate_index: bool,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            k: 3,
            min_data_count: 5,
            max_data_count: 100,
            always_update_model: false,
            update_interval: 1,
            has_intermediate_index: true,
        }
    }
}

impl LofConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k < 1 {
            return Err(invalid("k must be >= 1"));
        }
        if self.update_interval < 1 {
            return Err(invalid("updateInterval must be >= 1"));
        }
        if self.max_data_count < 1 {
            return Err(invalid("maxDataCount must be >= 1"));
        }
        if self.min_data_count > self.max_data_count {
            return Err(invalid("minDataCount must be <= maxDataCount"));
        }
        Ok(())
    }

    /// The parameters needed when merging sibling models.
    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            k: self.k,
            max_count: self.max_data_count,
            has_intermediate_index: self.has_intermediate_index,
        }
    }
}

/// K-means operator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KmeansConfig {
    pub cluster_count: usize,
    pub max_iterations: usize,
    /// Lloyd iterations stop once no centroid moves farther than this.
    pub convergence_threshold: f64,
}

impl Default for KmeansConfig {
    fn default() -> Self {
        Self {
            cluster_count: 2,
            max_iterations: 100,
            convergence_threshold: 0.1,
        }
    }
}

impl KmeansConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_count < 1 {
            return Err(invalid("clusterCount must be >= 1"));
        }
        if self.max_iterations < 1 {
            return Err(invalid("maxIterations must be >= 1"));
        }
        if self.convergence_threshold < 0. {
            return Err(invalid("convergenceThreshold must be >= 0"));
        }
        Ok(())
    }
}

/// Placement of an operator instance among its siblings and merge cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartitionConfig {
    pub partition_index: usize,
    pub partition_count: usize,
    pub merge_interval_seconds: u64,
    /// Time to live of persisted snapshots, 0 keeps them forever.
    pub lifespan_seconds: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_index: 0,
            partition_count: 1,
            merge_interval_seconds: 30,
            lifespan_seconds: 600,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count < 1 {
            return Err(invalid("partitionCount must be >= 1"));
        }
        if self.partition_index >= self.partition_count {
            return Err(invalid("partitionIndex must be < partitionCount"));
        }
        Ok(())
    }
}

/// Algorithm specific parameters used at merge time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    pub k: usize,
    pub max_count: usize,
    pub has_intermediate_index: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        LofConfig::default().merge_config()
    }
}

/// Complete configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub change_finder: ChangeFinderConfig,
    pub lof: LofConfig,
    pub kmeans: KmeansConfig,
    pub partition: PartitionConfig,
}

impl Config {
    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.change_finder.validate()?;
        self.lof.validate()?;
        self.kmeans.validate()?;
        self.partition.validate()
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig(reason.into())
}
