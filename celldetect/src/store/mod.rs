//! Storage collaborators for probability volumes and detection outputs.
//!
//! The orchestrator never resolves storage on its own: it is handed one
//! [`VolumeSource`] to read tiles from, one [`LabelMapStore`] and one
//! [`CentroidTableStore`] to write into. Writers address disjoint regions, so
//! implementations only need to support concurrent writes to non-overlapping
//! ranges.

pub mod dataset;
pub mod memory;

use std::fmt;
use std::path::PathBuf;

use ndarray::{Array3, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::SubVolume;

pub use dataset::{DatasetContainer, DatasetHandle, DatasetHeader, DatasetLabelMap, DatasetTable, DatasetVolume};
pub use memory::{MemoryCentroidTable, MemoryLabelMap, MemoryVolume};

/// Element types a dataset can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    U32,
}

impl Dtype {
    pub fn size_of(&self) -> usize {
        match self {
            Dtype::F32 => std::mem::size_of::<f32>(),
            Dtype::U32 => std::mem::size_of::<u32>(),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::F32 => write!(f, "f32"),
            Dtype::U32 => write!(f, "u32"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid dataset header {path}: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Dataset not found: {0}")]
    MissingDataset(String),
    #[error("Dataset '{name}' holds {found} elements, requested {requested}")]
    DtypeMismatch {
        name: String,
        found: Dtype,
        requested: Dtype,
    },
    #[error("Region at {origin:?} with shape {shape:?} exceeds dataset shape {dataset:?}")]
    OutOfBounds {
        origin: Vec<usize>,
        shape: Vec<usize>,
        dataset: Vec<usize>,
    },
    #[error("Data file {path} holds {actual} bytes, header declares {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("Rank mismatch: dataset has {expected} axes, got {actual}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("Output has not been created yet")]
    NotCreated,
    #[error("Store lock poisoned")]
    Poisoned,
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Read-only access to a probability volume.
pub trait VolumeSource: Send + Sync {
    /// Full `(nx, ny, nz)` extent of the volume.
    fn shape(&self) -> [usize; 3];

    /// Copy one tile out of the volume.
    fn read_region(&self, region: &SubVolume) -> Result<Array3<f32>, StoreError>;
}

/// Global label map written tile by tile.
pub trait LabelMapStore: Send + Sync {
    /// Create (or recreate) a zeroed label map of `shape`.
    fn create(&self, shape: [usize; 3]) -> Result<(), StoreError>;

    /// Write `block` with its first voxel at `origin`.
    fn write_region(&self, origin: [usize; 3], block: ArrayView3<u32>) -> Result<(), StoreError>;
}

/// Global `rows x 4` centroid table written in per-tile row blocks.
pub trait CentroidTableStore: Send + Sync {
    /// Create (or recreate) a zeroed table with `rows` rows.
    fn create(&self, rows: usize) -> Result<(), StoreError>;

    /// Write `rows` starting at row `first_row`.
    fn write_rows(&self, first_row: usize, rows: ArrayView2<f32>) -> Result<(), StoreError>;
}

/// Reject regions that do not lie inside `dataset`.
pub(crate) fn check_region(origin: &[usize], shape: &[usize], dataset: &[usize]) -> Result<(), StoreError> {
    if origin.len() != dataset.len() || shape.len() != dataset.len() {
        return Err(StoreError::RankMismatch {
            expected: dataset.len(),
            actual: origin.len().max(shape.len()),
        });
    }
    let inside = origin
        .iter()
        .zip(shape)
        .zip(dataset)
        .all(|((&o, &s), &n)| o.checked_add(s).is_some_and(|end| end <= n));
    if inside {
        Ok(())
    } else {
        Err(StoreError::OutOfBounds {
            origin: origin.to_vec(),
            shape: shape.to_vec(),
            dataset: dataset.to_vec(),
        })
    }
}
