//! Partitioned, multi-worker detection over a shared volume.
//!
//! A run partitions the volume into whole tiles and deals them round-robin to
//! `P` worker ranks: rank `r` owns tiles `r, r + P, r + 2P, ...`. Rank 0
//! creates the output label map and centroid table, then every rank waits at
//! a single barrier before touching them. After that, ranks never coordinate:
//! each one reads its tiles, runs the greedy detector, shifts centroids by the
//! tile origin and writes its results into the output ranges it owns.
//!
//! Tile `s` of the schedule owns centroid rows `s * cap .. (s + 1) * cap`
//! (`cap` = `max_detections`) and the label-map region of its own extent, so
//! concurrent writes never overlap. A tile that fails is logged and reported
//! in the [`RunSummary`]; it does not stop the other tiles.
//!
//! Peak memory per worker is one tile plus the detector's FFT buffers, which
//! is the point of partitioning: the tile shape trades memory for parallelism
//! and does not affect which cells are found away from tile borders.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Barrier, OnceLock};
use std::thread;

use log::{error, info, warn};
use ndarray::{ArrayView2, ArrayView3};
use thiserror::Error;

use crate::config::{ConfigError, LabelNumbering, RemainderPolicy, RunConfig};
use crate::detector::{centroid_rows, Centroid, DetectError, GreedyDetector, Termination};
use crate::partition::{Partition, PartitionError, SubVolume};
use crate::store::{
    CentroidTableStore, DatasetContainer, DatasetLabelMap, DatasetTable, DatasetVolume, LabelMapStore,
    StoreError, VolumeSource,
};

/// Errors that stop a run as a whole.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("At least one worker is required")]
    NoWorkers,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("Output store error: {0}")]
    Store(#[from] StoreError),
    #[error("{rows} centroid rows exceed the range of global u32 labels")]
    LabelOverflow { rows: usize },
    #[error("Worker {0} panicked while creating the output datasets")]
    CreationAborted(usize),
}

/// Errors confined to a single tile.
#[derive(Error, Debug)]
pub enum TileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("Block shape {actual:?} does not match the owned region {expected:?}")]
    BlockShape { expected: Vec<usize>, actual: Vec<usize> },
    #[error("Global labels of slot {slot} do not fit in u32")]
    LabelOverflow { slot: usize },
}

/// One tile dealt to one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// Position in the schedule; selects the tile's centroid row block.
    pub slot: usize,
    pub rank: usize,
    pub tile: SubVolume,
}

/// Static round-robin assignment of tiles to ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    workers: usize,
    assignments: Vec<Assignment>,
    skipped: Vec<SubVolume>,
}

impl Schedule {
    /// Deal `tiles` to `workers` ranks in order.
    ///
    /// With [`RemainderPolicy::Skip`] only the first `workers * floor(T / workers)`
    /// tiles are scheduled; the rest end up in [`Schedule::skipped`].
    pub fn round_robin(
        tiles: &[SubVolume],
        workers: usize,
        policy: RemainderPolicy,
    ) -> Result<Self, OrchestratorError> {
        if workers == 0 {
            return Err(OrchestratorError::NoWorkers);
        }
        let scheduled = match policy {
            RemainderPolicy::Skip => tiles.len() / workers * workers,
            RemainderPolicy::Process => tiles.len(),
        };
        let assignments = tiles[..scheduled]
            .iter()
            .enumerate()
            .map(|(slot, &tile)| Assignment {
                slot,
                rank: slot % workers,
                tile,
            })
            .collect();
        Ok(Self {
            workers,
            assignments,
            skipped: tiles[scheduled..].to_vec(),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn skipped(&self) -> &[SubVolume] {
        &self.skipped
    }

    /// Number of scheduled tiles.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Tiles owned by `rank`, in processing order.
    pub fn for_rank(&self, rank: usize) -> impl Iterator<Item = &Assignment> + '_ {
        self.assignments.iter().filter(move |a| a.rank == rank)
    }
}

/// Partition plus schedule for one volume shape.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub partition: Partition,
    pub schedule: Schedule,
    /// Rows of the global centroid table.
    pub centroid_rows: usize,
}

/// Write access limited to the label region and centroid rows one tile owns.
pub struct TileWriter<'a> {
    labels: &'a dyn LabelMapStore,
    centroids: &'a dyn CentroidTableStore,
    tile: SubVolume,
    rows: Range<usize>,
}

impl<'a> TileWriter<'a> {
    pub fn new(
        labels: &'a dyn LabelMapStore,
        centroids: &'a dyn CentroidTableStore,
        assignment: &Assignment,
        capacity: usize,
    ) -> Self {
        let first = assignment.slot * capacity;
        Self {
            labels,
            centroids,
            tile: assignment.tile,
            rows: first..first + capacity,
        }
    }

    /// Centroid rows this writer owns.
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// Write a tile-shaped label block at the tile origin.
    pub fn write_labels(&self, block: ArrayView3<u32>) -> Result<(), TileError> {
        let expected = self.tile.shape();
        if block.shape() != expected.as_slice() {
            return Err(TileError::BlockShape {
                expected: expected.to_vec(),
                actual: block.shape().to_vec(),
            });
        }
        Ok(self.labels.write_region(self.tile.origin(), block)?)
    }

    /// Write exactly the owned centroid rows.
    pub fn write_centroids(&self, table: ArrayView2<f32>) -> Result<(), TileError> {
        let expected = [self.rows.len(), 4];
        if table.shape() != expected.as_slice() {
            return Err(TileError::BlockShape {
                expected: expected.to_vec(),
                actual: table.shape().to_vec(),
            });
        }
        Ok(self.centroids.write_rows(self.rows.start, table)?)
    }
}

/// Result of one successfully processed tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutcome {
    pub slot: usize,
    pub rank: usize,
    pub tile: SubVolume,
    /// Centroids in global coordinates.
    pub centroids: Vec<Centroid>,
    pub termination: Termination,
}

/// A tile whose results could not be produced or written.
#[derive(Debug)]
pub struct TileFailure {
    pub slot: usize,
    pub rank: usize,
    pub tile: SubVolume,
    pub error: TileError,
}

/// What a run did.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub tiles_total: usize,
    pub tiles_scheduled: usize,
    pub tiles_skipped: usize,
    /// Voxels outside every whole tile.
    pub uncovered_voxels: usize,
    pub centroid_rows: usize,
    /// Processed tiles ordered by slot.
    pub tiles: Vec<TileOutcome>,
    pub failed_tiles: Vec<TileFailure>,
    /// Ranks whose thread panicked; their remaining tiles were not processed.
    pub panicked_workers: Vec<usize>,
}

impl RunSummary {
    pub fn tiles_processed(&self) -> usize {
        self.tiles.len()
    }

    pub fn detections(&self) -> usize {
        self.tiles.iter().map(|t| t.centroids.len()).sum()
    }

    /// Tiles that ended on `termination`.
    pub fn terminated_by(&self, termination: Termination) -> usize {
        self.tiles
            .iter()
            .filter(|t| t.termination == termination)
            .count()
    }

    /// Whether every scheduled tile was processed.
    pub fn is_complete(&self) -> bool {
        self.failed_tiles.is_empty() && self.tiles.len() == self.tiles_scheduled
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    outcomes: Vec<TileOutcome>,
    failures: Vec<TileFailure>,
}

/// Runs the greedy detector over a partitioned volume with a fixed pool of ranks.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: RunConfig,
    detector: GreedyDetector,
}

impl Orchestrator {
    /// Validate `config` and build the detector every rank shares.
    pub fn new(config: RunConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let detector = GreedyDetector::new(config.detection.clone()).map_err(ConfigError::from)?;
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Partition and schedule a volume of `volume_shape`.
    pub fn plan(&self, volume_shape: [usize; 3]) -> Result<RunPlan, OrchestratorError> {
        let partition = Partition::new(volume_shape, self.config.tile_shape)?;
        let schedule = Schedule::round_robin(partition.tiles(), self.config.workers, self.config.remainder)?;
        let cap = self.config.detection.max_detections;
        let centroid_rows = schedule.len().checked_mul(cap).ok_or(OrchestratorError::LabelOverflow {
            rows: usize::MAX,
        })?;
        if self.config.labels == LabelNumbering::Global && u32::try_from(centroid_rows).is_err() {
            return Err(OrchestratorError::LabelOverflow {
                rows: centroid_rows,
            });
        }
        Ok(RunPlan {
            partition,
            schedule,
            centroid_rows,
        })
    }

    /// Run on datasets of a container, using the configured dataset names.
    pub fn run_on_container(&self, container: &DatasetContainer) -> Result<RunSummary, OrchestratorError> {
        let names = &self.config.datasets;
        let source = DatasetVolume::open(container, &names.probability)?;
        let labels = DatasetLabelMap::new(container.clone(), names.labels.clone());
        let centroids = DatasetTable::new(container.clone(), names.centroids.clone());
        self.run(&source, &labels, &centroids)
    }

    /// Detect cells in every scheduled tile of `source`.
    ///
    /// Both outputs are (re)created before any tile is written. Errors are
    /// returned only for problems that affect the whole run; per-tile
    /// problems are collected in [`RunSummary::failed_tiles`].
    pub fn run(
        &self,
        source: &dyn VolumeSource,
        labels: &dyn LabelMapStore,
        centroids: &dyn CentroidTableStore,
    ) -> Result<RunSummary, OrchestratorError> {
        let volume_shape = source.shape();
        let plan = self.plan(volume_shape)?;
        let workers = self.config.workers;

        let uncovered = plan.partition.uncovered_voxels();
        if uncovered > 0 {
            warn!(
                "{uncovered} voxels of volume {volume_shape:?} lie outside whole {:?} tiles and will not be searched",
                self.config.tile_shape
            );
        }
        if !plan.schedule.skipped().is_empty() {
            warn!(
                "Skipping {} of {} tiles that do not divide evenly among {workers} workers",
                plan.schedule.skipped().len(),
                plan.partition.len()
            );
        }
        info!(
            "Detecting cells in {volume_shape:?}: {} tiles on {workers} workers, {} centroid rows",
            plan.schedule.len(),
            plan.centroid_rows
        );

        let barrier = Barrier::new(workers);
        let creation: OnceLock<Result<(), OrchestratorError>> = OnceLock::new();

        let results: Vec<thread::Result<WorkerReport>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|rank| {
                    let (barrier, creation, plan) = (&barrier, &creation, &plan);
                    scope.spawn(move || {
                        if rank == 0 {
                            // Rank 0 must reach the barrier even if creation panics.
                            let created = panic::catch_unwind(AssertUnwindSafe(|| {
                                create_outputs(labels, centroids, volume_shape, plan.centroid_rows)
                            }))
                            .unwrap_or_else(|_| {
                                error!("Worker {rank} panicked while creating the output datasets");
                                Err(OrchestratorError::CreationAborted(rank))
                            });
                            let _ = creation.set(created);
                        }
                        barrier.wait();
                        match creation.get() {
                            Some(Ok(())) => self.run_rank(rank, &plan.schedule, source, labels, centroids),
                            _ => WorkerReport::default(),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        creation
            .into_inner()
            .unwrap_or(Err(OrchestratorError::CreationAborted(0)))?;

        let mut summary = RunSummary {
            tiles_total: plan.partition.len(),
            tiles_scheduled: plan.schedule.len(),
            tiles_skipped: plan.schedule.skipped().len(),
            uncovered_voxels: uncovered,
            centroid_rows: plan.centroid_rows,
            ..RunSummary::default()
        };
        for (rank, result) in results.into_iter().enumerate() {
            match result {
                Ok(report) => {
                    summary.tiles.extend(report.outcomes);
                    summary.failed_tiles.extend(report.failures);
                }
                Err(_) => {
                    error!("Worker {rank} panicked");
                    summary.panicked_workers.push(rank);
                }
            }
        }
        summary.tiles.sort_by_key(|t| t.slot);
        summary.failed_tiles.sort_by_key(|f| f.slot);

        info!(
            "Detection finished: {} cells in {}/{} tiles, {} failed",
            summary.detections(),
            summary.tiles_processed(),
            summary.tiles_scheduled,
            summary.failed_tiles.len()
        );
        Ok(summary)
    }

    fn run_rank(
        &self,
        rank: usize,
        schedule: &Schedule,
        source: &dyn VolumeSource,
        labels: &dyn LabelMapStore,
        centroids: &dyn CentroidTableStore,
    ) -> WorkerReport {
        let capacity = self.config.detection.max_detections;
        let mut report = WorkerReport::default();
        for assignment in schedule.for_rank(rank) {
            let writer = TileWriter::new(labels, centroids, assignment, capacity);
            match self.process_tile(assignment, source, &writer) {
                Ok(outcome) => {
                    info!(
                        "Rank {rank} tile {} {:?}: {} cells ({:?})",
                        assignment.slot,
                        assignment.tile.as_tuple(),
                        outcome.centroids.len(),
                        outcome.termination
                    );
                    report.outcomes.push(outcome);
                }
                Err(error) => {
                    error!(
                        "Rank {rank} failed tile {} {:?}: {error}",
                        assignment.slot,
                        assignment.tile.as_tuple()
                    );
                    report.failures.push(TileFailure {
                        slot: assignment.slot,
                        rank,
                        tile: assignment.tile,
                        error,
                    });
                }
            }
        }
        report
    }

    fn process_tile(
        &self,
        assignment: &Assignment,
        source: &dyn VolumeSource,
        writer: &TileWriter,
    ) -> Result<TileOutcome, TileError> {
        let capacity = self.config.detection.max_detections;
        let volume = source.read_region(&assignment.tile)?;
        let detections = self.detector.run(volume.view())?;

        let mut label_map = detections.label_map;
        if self.config.labels == LabelNumbering::Global {
            let offset = u32::try_from(assignment.slot * capacity)
                .map_err(|_| TileError::LabelOverflow {
                    slot: assignment.slot,
                })?;
            label_map.mapv_inplace(|label| if label == 0 { 0 } else { label + offset });
        }

        let origin = assignment.tile.origin();
        let global: Vec<Centroid> = detections
            .centroids
            .iter()
            .map(|c| c.translated(origin))
            .collect();

        writer.write_labels(label_map.view())?;
        writer.write_centroids(centroid_rows(&global, capacity).view())?;

        Ok(TileOutcome {
            slot: assignment.slot,
            rank: assignment.rank,
            tile: assignment.tile,
            centroids: global,
            termination: detections.termination,
        })
    }
}

fn create_outputs(
    labels: &dyn LabelMapStore,
    centroids: &dyn CentroidTableStore,
    volume_shape: [usize; 3],
    rows: usize,
) -> Result<(), OrchestratorError> {
    labels.create(volume_shape)?;
    centroids.create(rows)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectionParams;
    use crate::store::{MemoryCentroidTable, MemoryLabelMap, MemoryVolume};
    use approx::assert_relative_eq;
    use ndarray::{s, Array3};
    use test_helpers::{sphere_volume, SphereSpec};

    fn config(workers: usize, tile_shape: [usize; 3]) -> RunConfig {
        RunConfig {
            detection: DetectionParams {
                probability_threshold: 0.2,
                stopping_criterion: 0.47,
                template_radii: vec![4],
                dilation_margin: 3,
                max_detections: 3,
            },
            tile_shape,
            workers,
            ..RunConfig::default()
        }
    }

    /// Two 20³ tiles along x with one sphere each.
    fn two_tile_volume() -> Array3<f32> {
        sphere_volume(
            [40, 20, 20],
            &[
                SphereSpec::new([10, 10, 10], 4, 0.9),
                SphereSpec::new([28, 9, 11], 4, 0.8),
            ],
        )
    }

    #[test]
    fn test_round_robin_skip() {
        let tiles = Partition::new([6, 1, 1], [1, 1, 1]).unwrap().into_tiles();
        let schedule = Schedule::round_robin(&tiles[..5], 2, RemainderPolicy::Skip).unwrap();
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule.skipped(), &tiles[4..5]);

        let rank0: Vec<usize> = schedule.for_rank(0).map(|a| a.slot).collect();
        let rank1: Vec<usize> = schedule.for_rank(1).map(|a| a.slot).collect();
        assert_eq!(rank0, vec![0, 2]);
        assert_eq!(rank1, vec![1, 3]);
    }

    #[test]
    fn test_round_robin_process() {
        let tiles = Partition::new([5, 1, 1], [1, 1, 1]).unwrap().into_tiles();
        let schedule = Schedule::round_robin(&tiles, 2, RemainderPolicy::Process).unwrap();
        assert_eq!(schedule.len(), 5);
        assert!(schedule.skipped().is_empty());
        let rank0: Vec<usize> = schedule.for_rank(0).map(|a| a.slot).collect();
        assert_eq!(rank0, vec![0, 2, 4]);
        assert!(schedule.assignments().iter().all(|a| a.tile == tiles[a.slot]));
    }

    #[test]
    fn test_more_workers_than_tiles_skips_everything() {
        let tiles = Partition::new([2, 1, 1], [1, 1, 1]).unwrap().into_tiles();
        let schedule = Schedule::round_robin(&tiles, 4, RemainderPolicy::Skip).unwrap();
        assert!(schedule.is_empty());
        assert_eq!(schedule.skipped().len(), 2);
        assert!(matches!(
            Schedule::round_robin(&tiles, 0, RemainderPolicy::Skip),
            Err(OrchestratorError::NoWorkers)
        ));
    }

    #[test]
    fn test_run_remaps_and_pads() {
        let source = MemoryVolume::new(two_tile_volume());
        let labels = MemoryLabelMap::new();
        let table = MemoryCentroidTable::new();
        let orchestrator = Orchestrator::new(config(2, [20, 20, 20])).unwrap();

        let summary = orchestrator.run(&source, &labels, &table).unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.tiles_scheduled, 2);
        assert_eq!(summary.detections(), 2);
        assert_eq!(summary.centroid_rows, 6);
        assert_eq!(summary.terminated_by(Termination::Confidence), 2);

        let table = table.snapshot().unwrap().unwrap();
        assert_eq!(table.dim(), (6, 4));
        assert_eq!(table.slice(s![0, ..3]).to_vec(), vec![10.0, 10.0, 10.0]);
        assert_relative_eq!(table[[0, 3]], 0.9, epsilon = 1e-4);
        assert_eq!(table.slice(s![3, ..3]).to_vec(), vec![28.0, 9.0, 11.0]);
        assert_relative_eq!(table[[3, 3]], 0.8, epsilon = 1e-4);
        for row in [1, 2, 4, 5] {
            assert!(table.row(row).iter().all(|&v| v == 0.0), "row {row}");
        }

        let labels = labels.snapshot().unwrap().unwrap();
        assert_eq!(labels.dim(), (40, 20, 20));
        assert_eq!(labels[[10, 10, 10]], 1);
        // Per-tile numbering restarts in the second tile.
        assert_eq!(labels[[28, 9, 11]], 1);
        assert_eq!(labels[[20, 0, 0]], 0);
    }

    #[test]
    fn test_global_label_numbering() {
        let source = MemoryVolume::new(two_tile_volume());
        let labels = MemoryLabelMap::new();
        let table = MemoryCentroidTable::new();
        let mut config = config(1, [20, 20, 20]);
        config.labels = LabelNumbering::Global;

        Orchestrator::new(config)
            .unwrap()
            .run(&source, &labels, &table)
            .unwrap();

        let labels = labels.snapshot().unwrap().unwrap();
        assert_eq!(labels[[10, 10, 10]], 1);
        assert_eq!(labels[[28, 9, 11]], 4);
        let table = table.snapshot().unwrap().unwrap();
        assert_eq!(table[[4 - 1, 0]], 28.0);
    }

    #[test]
    fn test_remainder_tiles_and_edge_voxels() {
        let volume = sphere_volume([65, 20, 20], &[SphereSpec::new([10, 10, 10], 4, 0.9)]);
        let source = MemoryVolume::new(volume);

        let labels = MemoryLabelMap::new();
        let table = MemoryCentroidTable::new();
        let skip = Orchestrator::new(config(2, [20, 20, 20])).unwrap();
        let summary = skip.run(&source, &labels, &table).unwrap();
        assert_eq!(summary.tiles_total, 3);
        assert_eq!(summary.tiles_scheduled, 2);
        assert_eq!(summary.tiles_skipped, 1);
        assert_eq!(summary.uncovered_voxels, 5 * 20 * 20);
        assert_eq!(table.snapshot().unwrap().unwrap().nrows(), 6);

        let mut process = config(2, [20, 20, 20]);
        process.remainder = RemainderPolicy::Process;
        let summary = Orchestrator::new(process)
            .unwrap()
            .run(&source, &labels, &table)
            .unwrap();
        assert_eq!(summary.tiles_scheduled, 3);
        assert_eq!(summary.tiles_processed(), 3);
        assert_eq!(table.snapshot().unwrap().unwrap().nrows(), 9);
    }

    /// Volume source that refuses to read one tile.
    struct FailingVolume {
        inner: MemoryVolume,
        broken_x0: usize,
    }

    impl VolumeSource for FailingVolume {
        fn shape(&self) -> [usize; 3] {
            self.inner.shape()
        }

        fn read_region(&self, region: &SubVolume) -> Result<Array3<f32>, StoreError> {
            if region.x0 == self.broken_x0 {
                return Err(StoreError::MissingDataset("broken tile".to_string()));
            }
            self.inner.read_region(region)
        }
    }

    #[test]
    fn test_tile_failure_does_not_abort_run() {
        let source = FailingVolume {
            inner: MemoryVolume::new(two_tile_volume()),
            broken_x0: 20,
        };
        let labels = MemoryLabelMap::new();
        let table = MemoryCentroidTable::new();
        let summary = Orchestrator::new(config(2, [20, 20, 20]))
            .unwrap()
            .run(&source, &labels, &table)
            .unwrap();

        assert!(!summary.is_complete());
        assert_eq!(summary.tiles_processed(), 1);
        assert_eq!(summary.failed_tiles.len(), 1);
        assert_eq!(summary.failed_tiles[0].slot, 1);
        assert!(matches!(summary.failed_tiles[0].error, TileError::Store(_)));

        let table = table.snapshot().unwrap().unwrap();
        assert_eq!(table[[0, 0]], 10.0);
        assert!(table.row(3).iter().all(|&v| v == 0.0));
    }

    /// Label store that cannot create its dataset.
    struct ReadOnlyLabels;

    impl LabelMapStore for ReadOnlyLabels {
        fn create(&self, _shape: [usize; 3]) -> Result<(), StoreError> {
            Err(StoreError::io(
                "labels",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        }

        fn write_region(&self, _origin: [usize; 3], _block: ArrayView3<u32>) -> Result<(), StoreError> {
            Err(StoreError::NotCreated)
        }
    }

    #[test]
    fn test_creation_failure_aborts_run() {
        let source = MemoryVolume::new(two_tile_volume());
        let table = MemoryCentroidTable::new();
        let result = Orchestrator::new(config(3, [20, 20, 20]))
            .unwrap()
            .run(&source, &ReadOnlyLabels, &table);
        assert!(matches!(result, Err(OrchestratorError::Store(StoreError::Io { .. }))));
    }

    /// Label store whose creation panics.
    struct PanickingLabels;

    impl LabelMapStore for PanickingLabels {
        fn create(&self, shape: [usize; 3]) -> Result<(), StoreError> {
            panic!("cannot allocate label map of {shape:?}");
        }

        fn write_region(&self, _origin: [usize; 3], _block: ArrayView3<u32>) -> Result<(), StoreError> {
            Err(StoreError::NotCreated)
        }
    }

    #[test]
    fn test_creation_panic_releases_all_workers() {
        let source = MemoryVolume::new(two_tile_volume());
        let table = MemoryCentroidTable::new();
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = Orchestrator::new(config(2, [20, 20, 20]))
                .unwrap()
                .run(&source, &PanickingLabels, &table);
            let _ = done.send(result.map(|summary| summary.tiles_processed()));
        });

        let result = finished
            .recv_timeout(std::time::Duration::from_secs(60))
            .expect("run returned");
        assert!(matches!(result, Err(OrchestratorError::CreationAborted(0))));
    }

    #[test]
    fn test_tile_writer_rejects_foreign_shapes() {
        let labels = MemoryLabelMap::new();
        let table = MemoryCentroidTable::new();
        labels.create([8, 8, 8]).unwrap();
        table.create(6).unwrap();

        let assignment = Assignment {
            slot: 1,
            rank: 0,
            tile: SubVolume::from_origin([4, 0, 0], [4, 8, 8]),
        };
        let writer = TileWriter::new(&labels, &table, &assignment, 3);
        assert_eq!(writer.rows(), 3..6);
        assert!(matches!(
            writer.write_labels(Array3::zeros((8, 8, 8)).view()),
            Err(TileError::BlockShape { .. })
        ));
        assert!(matches!(
            writer.write_centroids(ndarray::Array2::zeros((4, 4)).view()),
            Err(TileError::BlockShape { .. })
        ));
        writer
            .write_labels(Array3::from_elem((4, 8, 8), 2).view())
            .unwrap();
        let data = labels.snapshot().unwrap().unwrap();
        assert_eq!(data[[3, 0, 0]], 0);
        assert_eq!(data[[4, 0, 0]], 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(2, [20, 20, 20]);
        bad.detection.stopping_criterion = 0.0;
        assert!(matches!(
            Orchestrator::new(bad),
            Err(OrchestratorError::Config(ConfigError::Detection(_)))
        ));
    }
}
