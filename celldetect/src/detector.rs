//! Greedy matching-pursuit detection of spherical objects.
//!
//! The detector thresholds a probability volume into a residual, then
//! repeatedly correlates the residual with every detection atom, takes the
//! strongest atom/location pair and, if its normalized correlation clears the
//! stopping criterion, records a centroid, labels the atom's support and
//! zeroes a dilated region of the residual around it.
//!
//! # States
//!
//! - `INIT`: parameters validated, dictionaries built, residual thresholded.
//! - `SEARCHING`: one iteration per candidate, at most `max_detections` times.
//! - [`Termination::Confidence`]: the best candidate fell below the stopping
//!   criterion and was discarded.
//! - [`Termination::Cap`]: `max_detections` candidates were accepted.
//!
//! Both terminal states return everything accepted so far. Invalid input is
//! rejected before the first iteration, so no partial state escapes on error.
//!
//! This is a greedy heuristic: touching objects are separated only as far as
//! suppression allows, object size is not estimated beyond the template
//! radii, and the result is not a globally optimal sparse decomposition.

use log::debug;
use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlate::{CorrelateError, Correlator, Peak};
use crate::dictionary::{DictionaryError, TemplateDictionary};
use crate::placement::{unravel_index, AtomFootprint};

/// Errors that reject a detection run before it starts.
#[derive(Error, Debug, PartialEq)]
pub enum DetectError {
    #[error("invalid {name}: {value} (expected {expected})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
    #[error(
        "detection and suppression dictionaries are not aligned \
         (box {detection_box} vs {suppression_box}, atoms {detection_atoms} vs {suppression_atoms})"
    )]
    DictionaryMismatch {
        detection_box: usize,
        suppression_box: usize,
        detection_atoms: usize,
        suppression_atoms: usize,
    },
    #[error("volume has an empty axis: {0:?}")]
    EmptyVolume([usize; 3]),
    #[error(transparent)]
    Correlate(#[from] CorrelateError),
}

/// Parameters of one greedy detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Voxels with probability at or below this value are zeroed before searching.
    pub probability_threshold: f64,
    /// Minimum normalized correlation for a candidate to be accepted.
    pub stopping_criterion: f64,
    /// Radii (voxels) of the detection templates.
    pub template_radii: Vec<u32>,
    /// Extra radius (voxels) of the suppression templates.
    pub dilation_margin: u32,
    /// Upper bound on accepted detections.
    pub max_detections: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            probability_threshold: 0.2,
            stopping_criterion: 0.47,
            template_radii: vec![9],
            dilation_margin: 8,
            max_detections: 2,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), DetectError> {
        // Written as negated ranges so NaN fails too.
        if !(0.0..1.0).contains(&self.probability_threshold) {
            return Err(DetectError::InvalidParameter {
                name: "probability_threshold",
                value: self.probability_threshold,
                expected: "a value in [0, 1)",
            });
        }
        if !(self.stopping_criterion > 0.0 && self.stopping_criterion <= 1.0) {
            return Err(DetectError::InvalidParameter {
                name: "stopping_criterion",
                value: self.stopping_criterion,
                expected: "a value in (0, 1]",
            });
        }
        if self.dilation_margin == 0 {
            return Err(DetectError::InvalidParameter {
                name: "dilation_margin",
                value: 0.0,
                expected: "a positive voxel count",
            });
        }
        TemplateDictionary::box_radius_for(&self.template_radii)?;
        Ok(())
    }

    /// Radii of the suppression templates, index-aligned with `template_radii`.
    pub fn suppression_radii(&self) -> Vec<u32> {
        self.template_radii
            .iter()
            .map(|r| r.saturating_add(self.dilation_margin))
            .collect()
    }
}

/// Why a detection run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The best remaining candidate fell below the stopping criterion.
    Confidence,
    /// `max_detections` candidates were accepted.
    Cap,
}

/// One detected object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    /// Normalized correlation at detection time, in (0, 1].
    pub confidence: f64,
}

impl Centroid {
    /// The same centroid shifted by a tile origin `(x0, y0, z0)`.
    pub fn translated(&self, origin: [usize; 3]) -> Self {
        Self {
            x: self.x + origin[0],
            y: self.y + origin[1],
            z: self.z + origin[2],
            confidence: self.confidence,
        }
    }

    /// `(x, y, z, confidence)` row as stored in centroid tables.
    pub fn to_row(&self) -> [f32; 4] {
        [
            self.x as f32,
            self.y as f32,
            self.z as f32,
            self.confidence as f32,
        ]
    }
}

/// Bookkeeping for one `SEARCHING` iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    /// Index of the winning atom.
    pub atom: usize,
    /// Raw correlation value of the winning atom.
    pub peak: f64,
    /// `peak` divided by the winning atom's mass.
    pub confidence: f64,
    /// Whether the candidate was accepted.
    pub accepted: bool,
    /// Nonzero residual voxels after this iteration.
    pub residual_nonzero: usize,
}

/// Output of a detection run.
#[derive(Debug, Clone)]
pub struct Detections {
    /// Accepted centroids in detection order.
    pub centroids: Vec<Centroid>,
    /// Label `k` marks the support of the `k`-th detection; 0 is background.
    pub label_map: Array3<u32>,
    pub termination: Termination,
    pub trace: Vec<IterationStats>,
}

impl Detections {
    /// Centroids as an `N x 4` table.
    pub fn centroid_table(&self) -> Array2<f32> {
        self.padded_centroid_table(self.centroids.len())
    }

    /// Centroids as a `capacity x 4` table, zero rows after the last detection.
    ///
    /// Centroids beyond `capacity` are dropped; the detector never produces
    /// more than its `max_detections`.
    pub fn padded_centroid_table(&self, capacity: usize) -> Array2<f32> {
        centroid_rows(&self.centroids, capacity)
    }
}

/// `capacity x 4` table of `centroids`, zero-padded after the last one.
pub fn centroid_rows(centroids: &[Centroid], capacity: usize) -> Array2<f32> {
    let mut table = Array2::zeros((capacity, 4));
    for (mut row, centroid) in table.rows_mut().into_iter().zip(centroids) {
        for (dst, value) in row.iter_mut().zip(centroid.to_row()) {
            *dst = value;
        }
    }
    table
}

/// Reusable detector: validated parameters plus the two aligned dictionaries.
#[derive(Debug, Clone)]
pub struct GreedyDetector {
    params: DetectionParams,
    detection: TemplateDictionary,
    suppression: TemplateDictionary,
}

impl GreedyDetector {
    /// Validate `params` and build both dictionaries over a shared box.
    pub fn new(params: DetectionParams) -> Result<Self, DetectError> {
        params.validate()?;
        let detection = TemplateDictionary::for_radii(&params.template_radii)?;
        let suppression =
            TemplateDictionary::build(&params.suppression_radii(), detection.box_radius())?;
        Self::with_dictionaries(params, detection, suppression)
    }

    /// Use prebuilt dictionaries; they must be index-aligned.
    pub fn with_dictionaries(
        params: DetectionParams,
        detection: TemplateDictionary,
        suppression: TemplateDictionary,
    ) -> Result<Self, DetectError> {
        params.validate()?;
        if !detection.is_aligned_with(&suppression) {
            return Err(DetectError::DictionaryMismatch {
                detection_box: detection.box_length(),
                suppression_box: suppression.box_length(),
                detection_atoms: detection.len(),
                suppression_atoms: suppression.len(),
            });
        }
        Ok(Self {
            params,
            detection,
            suppression,
        })
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    pub fn detection_dictionary(&self) -> &TemplateDictionary {
        &self.detection
    }

    pub fn suppression_dictionary(&self) -> &TemplateDictionary {
        &self.suppression
    }

    /// Run greedy detection on one probability volume.
    pub fn run(&self, volume: ArrayView3<f32>) -> Result<Detections, DetectError> {
        let (nx, ny, nz) = volume.dim();
        let shape = [nx, ny, nz];
        if shape.contains(&0) {
            return Err(DetectError::EmptyVolume(shape));
        }

        // Strict comparison; NaN voxels compare false and are dropped too.
        let threshold = self.params.probability_threshold;
        let mut residual = volume.mapv(|p| {
            let p = p as f64;
            if p > threshold {
                p
            } else {
                0.0
            }
        });
        let mut residual_nonzero = residual.iter().filter(|&&v| v != 0.0).count();
        let mut label_map = Array3::<u32>::zeros((nx, ny, nz));
        let mut centroids = Vec::new();
        let mut trace = Vec::new();

        let max_detections = self.params.max_detections;
        if max_detections == 0 {
            return Ok(Detections {
                centroids,
                label_map,
                termination: Termination::Cap,
                trace,
            });
        }

        let mut correlator = Correlator::new(shape, &self.detection);
        debug!(
            "Correlating {shape:?} in {:?} buffers ({} MiB)",
            correlator.padded_shape(),
            correlator.buffer_bytes() >> 20
        );

        for iteration in 0..max_detections {
            correlator.load_volume(residual.view())?;
            let (atom, peak) = self.best_candidate(&mut correlator)?;
            let confidence = peak.value / self.detection.mass(atom);

            if confidence < self.params.stopping_criterion {
                trace.push(IterationStats {
                    atom,
                    peak: peak.value,
                    confidence,
                    accepted: false,
                    residual_nonzero,
                });
                debug!(
                    "Detection stopped: confidence {confidence:.4} below {:.4} after {} cells",
                    self.params.stopping_criterion,
                    centroids.len()
                );
                return Ok(Detections {
                    centroids,
                    label_map,
                    termination: Termination::Confidence,
                    trace,
                });
            }

            let center = unravel_index(peak.flat_index, shape);

            for (voxel, _) in AtomFootprint::new(self.suppression.atom_cube(atom), center, shape).iter() {
                let value = &mut residual[voxel];
                if *value != 0.0 {
                    *value = 0.0;
                    residual_nonzero -= 1;
                }
            }

            let label = centroids.len() as u32 + 1;
            for (voxel, _) in AtomFootprint::new(self.detection.atom_cube(atom), center, shape).iter() {
                label_map[voxel] = label;
            }

            centroids.push(Centroid {
                x: center[0],
                y: center[1],
                z: center[2],
                confidence,
            });
            trace.push(IterationStats {
                atom,
                peak: peak.value,
                confidence,
                accepted: true,
                residual_nonzero,
            });
            debug!(
                "Iterations remaining = {}, correlation = {confidence:.4} at {center:?}",
                max_detections - iteration - 1
            );
        }

        Ok(Detections {
            centroids,
            label_map,
            termination: Termination::Cap,
            trace,
        })
    }

    /// Strongest atom for the loaded residual; ties keep the earlier atom.
    fn best_candidate(&self, correlator: &mut Correlator) -> Result<(usize, Peak), DetectError> {
        let mut best: Option<(usize, Peak)> = None;
        for atom in 0..self.detection.len() {
            let peak = correlator.peak(atom)?;
            match best {
                Some((_, current)) if current.value >= peak.value => {}
                _ => best = Some((atom, peak)),
            }
        }
        // Dictionaries are never empty once validated.
        best.ok_or(DetectError::Dictionary(DictionaryError::NoRadii))
    }
}

/// Detect spheres of a single radius in `volume`.
///
/// Thin entry point over [`GreedyDetector`] for one-off calls.
///
/// # Arguments
/// * `volume` - Probability volume, values in [0, 1]
/// * `probability_threshold` - Voxels at or below this are ignored
/// * `stopping_criterion` - Minimum normalized correlation for a detection
/// * `template_radius` - Sphere radius in voxels
/// * `dilation_margin` - Extra suppression radius in voxels
/// * `max_detections` - Maximum number of detections
pub fn detect(
    volume: ArrayView3<f32>,
    probability_threshold: f64,
    stopping_criterion: f64,
    template_radius: u32,
    dilation_margin: u32,
    max_detections: usize,
) -> Result<Detections, DetectError> {
    GreedyDetector::new(DetectionParams {
        probability_threshold,
        stopping_criterion,
        template_radii: vec![template_radius],
        dilation_margin,
        max_detections,
    })?
    .run(volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_helpers::{ball_voxel_count, sphere_volume, SphereSpec};

    fn two_sphere_volume() -> Array3<f32> {
        sphere_volume(
            [48, 40, 36],
            &[
                SphereSpec::new([12, 10, 10], 4, 0.9),
                SphereSpec::new([34, 26, 24], 4, 0.6),
            ],
        )
    }

    fn small_params(max_detections: usize) -> DetectionParams {
        DetectionParams {
            probability_threshold: 0.2,
            stopping_criterion: 0.47,
            template_radii: vec![4],
            dilation_margin: 3,
            max_detections,
        }
    }

    #[test]
    fn test_single_sphere_scenario() {
        let volume = sphere_volume([100, 100, 100], &[SphereSpec::new([50, 50, 50], 9, 1.0)]);
        let detections = detect(volume.view(), 0.2, 0.47, 9, 8, 5).unwrap();

        assert_eq!(detections.centroids.len(), 1);
        let c = detections.centroids[0];
        assert_eq!((c.x, c.y, c.z), (50, 50, 50));
        assert_relative_eq!(c.confidence, 1.0, epsilon = 1e-4);

        assert_eq!(detections.termination, Termination::Confidence);
        assert_eq!(detections.trace.len(), 2);
        assert!(!detections.trace[1].accepted);
        assert_eq!(detections.trace[1].residual_nonzero, 0);
    }

    #[test]
    fn test_zero_cap_is_empty() {
        let volume = two_sphere_volume();
        let detections = GreedyDetector::new(small_params(0))
            .unwrap()
            .run(volume.view())
            .unwrap();

        assert!(detections.centroids.is_empty());
        assert!(detections.label_map.iter().all(|&l| l == 0));
        assert_eq!(detections.label_map.dim(), volume.dim());
        assert!(detections.trace.is_empty());
    }

    #[test]
    fn test_two_spheres_in_confidence_order() {
        let volume = two_sphere_volume();
        let detections = GreedyDetector::new(small_params(5))
            .unwrap()
            .run(volume.view())
            .unwrap();

        assert_eq!(detections.termination, Termination::Confidence);
        assert_eq!(detections.centroids.len(), 2);

        let first = detections.centroids[0];
        let second = detections.centroids[1];
        assert_eq!((first.x, first.y, first.z), (12, 10, 10));
        assert_eq!((second.x, second.y, second.z), (34, 26, 24));
        assert_relative_eq!(first.confidence, 0.9, epsilon = 1e-4);
        assert_relative_eq!(second.confidence, 0.6, epsilon = 1e-4);
        assert!(first.confidence >= second.confidence);

        let ball = ball_voxel_count(4);
        let count = |label: u32| detections.label_map.iter().filter(|&&l| l == label).count();
        assert_eq!(count(1), ball);
        assert_eq!(count(2), ball);
        assert_eq!(detections.label_map[[12, 10, 10]], 1);
        assert_eq!(detections.label_map[[34, 26, 24]], 2);
        assert_eq!(detections.label_map[[0, 0, 0]], 0);
    }

    #[test]
    fn test_cap_terminates_early() {
        let volume = two_sphere_volume();
        let detections = GreedyDetector::new(small_params(1))
            .unwrap()
            .run(volume.view())
            .unwrap();

        assert_eq!(detections.termination, Termination::Cap);
        assert_eq!(detections.centroids.len(), 1);
        assert_eq!(detections.trace.len(), 1);
    }

    #[test]
    fn test_suppression_is_monotonic() {
        let volume = sphere_volume(
            [40, 40, 40],
            &[
                SphereSpec::new([10, 10, 10], 4, 1.0),
                SphereSpec::new([28, 12, 26], 4, 0.8),
                SphereSpec::new([14, 30, 20], 4, 0.7),
            ],
        );
        let initial = volume.iter().filter(|&&p| p > 0.2).count();
        let detections = GreedyDetector::new(small_params(10))
            .unwrap()
            .run(volume.view())
            .unwrap();

        assert_eq!(detections.centroids.len(), 3);
        let mut previous = initial;
        for stats in &detections.trace {
            assert!(stats.residual_nonzero <= previous);
            if stats.accepted {
                assert!(stats.residual_nonzero < previous);
            }
            previous = stats.residual_nonzero;
        }
        assert!(detections.trace.len() <= 10);
    }

    #[test]
    fn test_below_threshold_volume_terminates_immediately() {
        let volume = Array3::<f32>::from_elem((20, 20, 20), 0.1);
        let detections = GreedyDetector::new(small_params(4))
            .unwrap()
            .run(volume.view())
            .unwrap();
        assert!(detections.centroids.is_empty());
        assert_eq!(detections.termination, Termination::Confidence);
        assert_eq!(detections.trace.len(), 1);
    }

    #[test]
    fn test_padded_centroid_table() {
        let volume = two_sphere_volume();
        let detections = GreedyDetector::new(small_params(5))
            .unwrap()
            .run(volume.view())
            .unwrap();
        let table = detections.padded_centroid_table(5);
        assert_eq!(table.dim(), (5, 4));
        assert_eq!(table[[0, 0]], 12.0);
        assert_eq!(table[[1, 2]], 24.0);
        assert!(table.row(2).iter().all(|&v| v == 0.0));
        assert!(table.row(4).iter().all(|&v| v == 0.0));
        assert_eq!(detections.centroid_table().dim(), (2, 4));
    }

    #[test]
    fn test_translated_centroid() {
        let local = Centroid {
            x: 5,
            y: 5,
            z: 5,
            confidence: 0.8,
        };
        let global = local.translated([140, 0, 0]);
        assert_eq!((global.x, global.y, global.z), (145, 5, 5));
        assert_eq!(global.confidence, 0.8);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut params = small_params(3);
        params.probability_threshold = -0.1;
        assert!(matches!(
            GreedyDetector::new(params),
            Err(DetectError::InvalidParameter {
                name: "probability_threshold",
                ..
            })
        ));

        let mut params = small_params(3);
        params.stopping_criterion = f64::NAN;
        assert!(GreedyDetector::new(params).is_err());

        let mut params = small_params(3);
        params.template_radii = vec![];
        assert_eq!(
            GreedyDetector::new(params).unwrap_err(),
            DetectError::Dictionary(DictionaryError::NoRadii)
        );

        let mut params = small_params(3);
        params.template_radii = vec![0];
        assert_eq!(
            GreedyDetector::new(params).unwrap_err(),
            DetectError::Dictionary(DictionaryError::ZeroRadius)
        );

        let mut params = small_params(3);
        params.dilation_margin = 0;
        assert!(GreedyDetector::new(params).is_err());
    }

    #[test]
    fn test_misaligned_dictionaries_rejected() {
        let detection = TemplateDictionary::for_radii(&[4]).unwrap();
        let suppression = TemplateDictionary::for_radii(&[7]).unwrap();
        let err = GreedyDetector::with_dictionaries(small_params(2), detection, suppression)
            .unwrap_err();
        assert!(matches!(err, DetectError::DictionaryMismatch { .. }));
    }

    #[test]
    fn test_empty_volume_rejected() {
        let volume = Array3::<f32>::zeros((0, 4, 4));
        let err = GreedyDetector::new(small_params(2))
            .unwrap()
            .run(volume.view())
            .unwrap_err();
        assert_eq!(err, DetectError::EmptyVolume([0, 4, 4]));
    }

    #[test]
    fn test_multiple_radii_pick_matching_atom() {
        let volume = sphere_volume([40, 40, 40], &[SphereSpec::new([20, 20, 20], 6, 1.0)]);
        let params = DetectionParams {
            template_radii: vec![3, 6],
            ..small_params(1)
        };
        let detections = GreedyDetector::new(params).unwrap().run(volume.view()).unwrap();
        assert_eq!(detections.trace[0].atom, 1);
        let c = detections.centroids[0];
        assert_eq!((c.x, c.y, c.z), (20, 20, 20));
        assert_relative_eq!(c.confidence, 1.0, epsilon = 1e-4);
    }
}
