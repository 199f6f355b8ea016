//! Cell-body detection in large 3-D probability volumes.
//!
//! This crate finds roughly spherical objects in a voxel probability map with
//! a greedy matching-pursuit detector, and scales it to volumes larger than
//! memory by tiling the volume and running tiles on a pool of worker ranks
//! that write into shared output datasets.

pub mod config;
pub mod correlate;
pub mod detector;
pub mod dictionary;
pub mod orchestrator;
pub mod partition;
pub mod placement;
pub mod store;

// Re-exports for easier access
pub use config::{LabelNumbering, RemainderPolicy, RunConfig};
pub use correlate::{correlate_same, Correlator};
pub use detector::{detect, Centroid, DetectionParams, Detections, GreedyDetector, Termination};
pub use dictionary::TemplateDictionary;
pub use orchestrator::{Orchestrator, RunSummary};
pub use partition::{partition, SubVolume};
pub use placement::place_atom;
