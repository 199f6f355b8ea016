//! Run configuration for orchestrated detection.
//!
//! Configurations are plain serde structs loaded from JSON. Every field has a
//! default, so a config file only needs to name what it changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::{DetectError, DetectionParams};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid detection parameters: {0}")]
    Detection(#[from] DetectError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with tiles left over after dealing `T` tiles to `P` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Only schedule the first `P * floor(T / P)` tiles and warn about the rest.
    #[default]
    Skip,
    /// Schedule every tile; tile `t` goes to worker `t mod P`.
    Process,
}

impl FromStr for RemainderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(RemainderPolicy::Skip),
            "process" => Ok(RemainderPolicy::Process),
            _ => Err(format!(
                "Unknown remainder policy: {s}. Valid options: skip, process"
            )),
        }
    }
}

impl fmt::Display for RemainderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemainderPolicy::Skip => write!(f, "skip"),
            RemainderPolicy::Process => write!(f, "process"),
        }
    }
}

/// How tile-local labels map into the global label map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelNumbering {
    /// Labels restart at 1 in every tile.
    #[default]
    PerTile,
    /// Labels of tile slot `s` are offset by `s * max_detections`, so label
    /// `L` corresponds to centroid-table row `L - 1`.
    Global,
}

impl FromStr for LabelNumbering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "pertile" => Ok(LabelNumbering::PerTile),
            "global" => Ok(LabelNumbering::Global),
            _ => Err(format!(
                "Unknown label numbering: {s}. Valid options: per-tile, global"
            )),
        }
    }
}

impl fmt::Display for LabelNumbering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelNumbering::PerTile => write!(f, "per-tile"),
            LabelNumbering::Global => write!(f, "global"),
        }
    }
}

/// Names of the datasets a run reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetNames {
    pub probability: String,
    pub labels: String,
    pub centroids: String,
}

impl Default for DatasetNames {
    fn default() -> Self {
        Self {
            probability: "probability".to_string(),
            labels: "labels".to_string(),
            centroids: "centroids".to_string(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Everything an orchestrated run needs besides the stores themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub detection: DetectionParams,
    /// Tile extents `(x, y, z)` in voxels.
    pub tile_shape: [usize; 3],
    /// Number of worker ranks.
    pub workers: usize,
    pub remainder: RemainderPolicy,
    pub labels: LabelNumbering,
    pub datasets: DatasetNames,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            detection: DetectionParams::default(),
            tile_shape: [140, 182, 253],
            workers: default_workers(),
            remainder: RemainderPolicy::default(),
            labels: LabelNumbering::default(),
            datasets: DatasetNames::default(),
        }
    }
}

impl RunConfig {
    /// Load a JSON config; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(path, json).map_err(io_error)
    }

    /// Reject configurations that cannot run, before any processing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection.validate()?;
        if self.tile_shape.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "tile shape {:?} has a zero extent",
                self.tile_shape
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required".to_string()));
        }
        let names = [
            &self.datasets.probability,
            &self.datasets.labels,
            &self.datasets.centroids,
        ];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("dataset names must not be empty".to_string()));
        }
        if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
            return Err(ConfigError::Invalid(format!(
                "dataset names must be distinct, got {names:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.template_radii, vec![9]);
        assert_eq!(config.detection.dilation_margin, 8);
        assert_eq!(config.tile_shape, [140, 182, 253]);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "tile_shape": [64, 64, 64],
            "remainder": "process",
            "labels": "global",
            "detection": { "max_detections": 40 }
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tile_shape, [64, 64, 64]);
        assert_eq!(config.remainder, RemainderPolicy::Process);
        assert_eq!(config.labels, LabelNumbering::Global);
        assert_eq!(config.detection.max_detections, 40);
        assert_eq!(config.detection.stopping_criterion, 0.47);
        assert_eq!(config.datasets, DatasetNames::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        let config = RunConfig {
            workers: 3,
            labels: LabelNumbering::Global,
            ..RunConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            RunConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = RunConfig::default();
        config.tile_shape = [0, 10, 10];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RunConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.datasets.labels = "probability".to_string();
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.detection.probability_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Detection(_))));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Skip".parse::<RemainderPolicy>().unwrap(), RemainderPolicy::Skip);
        assert_eq!("process".parse::<RemainderPolicy>().unwrap(), RemainderPolicy::Process);
        assert!("overflow".parse::<RemainderPolicy>().is_err());
        assert_eq!("per-tile".parse::<LabelNumbering>().unwrap(), LabelNumbering::PerTile);
        assert_eq!("per_tile".parse::<LabelNumbering>().unwrap(), LabelNumbering::PerTile);
        assert_eq!(LabelNumbering::Global.to_string(), "global");
    }
}
