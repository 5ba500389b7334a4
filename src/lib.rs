//! Online change point detection, local outlier factor and k-means clustering
//! for partitioned streaming pipelines.
//!
//! Engines (`changefinder`, `lof`, `kmeans`) are pure computations on models.
//! Operators (`updater`) drive them batch by batch through the partition state (`state`),
//! which persists models and merges them with sibling partitions.

pub mod access_log;
pub mod changefinder;
pub mod config;
pub mod error;
pub mod kmeans;
pub mod lof;
pub mod model;
pub mod neighbors;
pub mod service;
pub mod space;
pub mod state;
pub mod streamer;
pub mod updater;
