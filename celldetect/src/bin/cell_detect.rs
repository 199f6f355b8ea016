//! Partitioned cell detection over a dataset container
//!
//! # Usage
//!
//! ```bash
//! # Detect cells with the default configuration and 8 workers
//! cargo run --release --bin cell_detect -- detect -c /data/brain01 -w 8
//!
//! # Load a JSON config and override the tile shape
//! cargo run --release --bin cell_detect -- detect -c /data/brain01 --config run.json --tile 128x128x128
//!
//! # Show datasets and centroid-table occupancy
//! cargo run --release --bin cell_detect -- info -c /data/brain01
//! ```
//!
//! The container must already hold the probability volume as a 3-D `f32`
//! dataset (named `probability` unless the config says otherwise). The label
//! map and centroid table are replaced on every run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use celldetect::config::{LabelNumbering, RemainderPolicy, RunConfig};
use celldetect::detector::Termination;
use celldetect::orchestrator::Orchestrator;
use celldetect::store::{DatasetContainer, Dtype};
use clap::{Parser, Subcommand};
use log::info;
use ndarray::Ix2;

#[derive(Parser)]
#[command(author, version, about = "Greedy cell-body detection on partitioned probability volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection over every tile of the probability volume
    Detect(DetectArgs),
    /// Print the datasets of a container
    Info {
        /// Dataset container directory
        #[arg(short, long)]
        container: PathBuf,

        /// Name of the centroid table to summarize
        #[arg(long, default_value = "centroids")]
        centroids: String,
    },
}

#[derive(clap::Args, Debug)]
struct DetectArgs {
    /// Dataset container directory
    #[arg(short, long)]
    container: PathBuf,

    /// JSON run configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker ranks
    #[arg(short, long)]
    workers: Option<usize>,

    /// Tile shape as XxYxZ (e.g. 140x182x253)
    #[arg(short, long, value_parser = parse_shape)]
    tile: Option<[usize; 3]>,

    /// Leftover tiles: skip or process
    #[arg(long)]
    remainder: Option<RemainderPolicy>,

    /// Label numbering: per-tile or global
    #[arg(long)]
    labels: Option<LabelNumbering>,

    /// Probability threshold applied before searching
    #[arg(long)]
    threshold: Option<f64>,

    /// Minimum normalized correlation for a detection
    #[arg(long)]
    stopping: Option<f64>,

    /// Template radius in voxels (repeat for several radii)
    #[arg(short, long)]
    radius: Vec<u32>,

    /// Suppression dilation in voxels
    #[arg(long)]
    dilation: Option<u32>,

    /// Maximum detections per tile
    #[arg(short = 'n', long)]
    max_detections: Option<usize>,
}

/// Parse a shape given as `XxYxZ` or `X,Y,Z`.
fn parse_shape(s: &str) -> Result<[usize; 3], String> {
    let parts: Vec<&str> = s.split(['x', 'X', ',']).collect();
    if parts.len() != 3 {
        return Err(format!("Shape must have three extents like 140x182x253, got '{s}'"));
    }
    let mut shape = [0; 3];
    for (dst, part) in shape.iter_mut().zip(&parts) {
        *dst = part
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("Invalid extent '{part}' in shape '{s}'"))?;
    }
    Ok(shape)
}

impl DetectArgs {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(tile) = self.tile {
            config.tile_shape = tile;
        }
        if let Some(remainder) = self.remainder {
            config.remainder = remainder;
        }
        if let Some(labels) = self.labels {
            config.labels = labels;
        }
        let detection = &mut config.detection;
        if let Some(threshold) = self.threshold {
            detection.probability_threshold = threshold;
        }
        if let Some(stopping) = self.stopping {
            detection.stopping_criterion = stopping;
        }
        if !self.radius.is_empty() {
            detection.template_radii = self.radius.clone();
        }
        if let Some(dilation) = self.dilation {
            detection.dilation_margin = dilation;
        }
        if let Some(max_detections) = self.max_detections {
            detection.max_detections = max_detections;
        }
        config.validate()?;
        Ok(config)
    }
}

fn detect(args: &DetectArgs) -> Result<()> {
    let config = args.run_config()?;
    let container = DatasetContainer::open(&args.container)
        .with_context(|| format!("Failed to open container {}", args.container.display()))?;
    info!("Run configuration: {config:?}");

    let orchestrator = Orchestrator::new(config)?;
    let summary = orchestrator.run_on_container(&container)?;

    println!("Detection summary");
    println!("=================");
    println!(
        "Tiles: {} total, {} scheduled, {} skipped",
        summary.tiles_total, summary.tiles_scheduled, summary.tiles_skipped
    );
    println!("Processed tiles: {}", summary.tiles_processed());
    println!("Uncovered voxels: {}", summary.uncovered_voxels);
    println!("Cells detected: {}", summary.detections());
    println!(
        "Terminated by confidence / cap: {} / {}",
        summary.terminated_by(Termination::Confidence),
        summary.terminated_by(Termination::Cap)
    );
    for failure in &summary.failed_tiles {
        println!("Failed tile {} {:?}: {}", failure.slot, failure.tile.as_tuple(), failure.error);
    }
    if !summary.panicked_workers.is_empty() {
        println!("Panicked workers: {:?}", summary.panicked_workers);
    }

    if !summary.is_complete() {
        anyhow::bail!(
            "{} of {} tiles did not complete",
            summary.tiles_scheduled - summary.tiles_processed(),
            summary.tiles_scheduled
        );
    }
    Ok(())
}

fn show_info(container: &Path, centroids: &str) -> Result<()> {
    let container = DatasetContainer::open(container)
        .with_context(|| format!("Failed to open container {}", container.display()))?;
    println!("Container: {}", container.root().display());
    for name in container.dataset_names()? {
        let dataset = container.dataset(&name)?;
        println!("  {name}: {:?} {}", dataset.shape(), dataset.header().dtype);
    }

    if container.contains(centroids) {
        let dataset = container.dataset(centroids)?;
        if dataset.header().dtype == Dtype::F32 && dataset.shape().len() == 2 {
            let table = dataset.read_all::<f32>()?.into_dimensionality::<Ix2>()?;
            let occupied = table
                .rows()
                .into_iter()
                .filter(|row| row.iter().any(|&v| v != 0.0))
                .count();
            println!("Centroid rows: {} occupied of {}", occupied, table.nrows());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Detect(args) => detect(args),
        Commands::Info {
            container,
            centroids,
        } => show_info(container, centroids),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("140x182x253").unwrap(), [140, 182, 253]);
        assert_eq!(parse_shape("4, 5, 6").unwrap(), [4, 5, 6]);
        assert!(parse_shape("4x5").is_err());
        assert!(parse_shape("4xax6").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "cell_detect", "detect", "-c", "/tmp/c", "-w", "3", "--tile", "8x8x8", "-r", "4", "-r", "6",
            "--labels", "global", "-n", "7",
        ]);
        let Commands::Detect(args) = cli.command else {
            panic!("expected detect");
        };
        let config = args.run_config().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.tile_shape, [8, 8, 8]);
        assert_eq!(config.detection.template_radii, vec![4, 6]);
        assert_eq!(config.detection.max_detections, 7);
        assert_eq!(config.labels, LabelNumbering::Global);
        assert_eq!(config.remainder, RemainderPolicy::Skip);
    }
}
