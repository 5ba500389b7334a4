use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fluent_detect::{
    config::Config,
    service::service,
    state::MemoryStore,
    streamer::{stdio, Streamer},
    updater::{ChangeFinderUpdater, KmeansUpdater, LofUpdater, Operator},
};

/// Streaming anomaly detection and clustering.
///
/// Reads one input per line and writes one JSON result per line.
#[derive(Debug, Parser)]
#[clap(name = "fluent_detect", version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
    /// JSON configuration file.
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Number of inputs per transaction.
    #[clap(long, global = true, default_value_t = 1)]
    batch_size: usize,
    /// Serve websockets on this address instead of using the standard streams.
    #[clap(long, global = true)]
    serve: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Local outlier factor of comma separated vectors.
    Lof {
        /// Number of neighbors.
        #[clap(short)]
        k: Option<usize>,
    },
    /// K-means classification of comma separated vectors.
    Kmeans {
        /// Number of clusters.
        #[clap(long)]
        cluster_count: Option<usize>,
    },
    /// Change point score of access log response times, one JSON record per line.
    Changefinder {
        /// Scores above this value are logged.
        #[clap(long)]
        score_threshold: Option<f64>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let store = MemoryStore::new(config.partition.lifespan_seconds);
    match cli.command {
        Command::Lof { k } => {
            config.lof.k = k.unwrap_or(config.lof.k);
            let updater = LofUpdater::new(config.lof, &config.partition, store)?;
            run(updater, cli.batch_size, cli.serve.as_deref())
        }
        Command::Kmeans { cluster_count } => {
            config.kmeans.cluster_count = cluster_count.unwrap_or(config.kmeans.cluster_count);
            let updater = KmeansUpdater::new(config.kmeans, &config.partition, store)?;
            run(updater, cli.batch_size, cli.serve.as_deref())
        }
        Command::Changefinder { score_threshold } => {
            config.change_finder.score_threshold =
                score_threshold.unwrap_or(config.change_finder.score_threshold);
            let updater = ChangeFinderUpdater::new(config.change_finder)?;
            run(updater, cli.batch_size, cli.serve.as_deref())
        }
    }
}

fn run(
    mut operator: impl Operator,
    batch_size: usize,
    serve: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    match serve {
        Some(addr) => {
            let (lines, write) = service(addr)?;
            Streamer::run(Streamer::new(lines, write, batch_size), &mut operator)?;
        }
        None => {
            let (lines, write) = stdio();
            Streamer::run(Streamer::new(lines, write, batch_size), &mut operator)?;
        }
    }
    Ok(())
}
