//! Frequency-domain correlation of volumes with small templates.
//!
//! Both operands are zero-padded to a power of two per axis (at least the sum
//! of the two extents, so the circular product never wraps), transformed,
//! multiplied and transformed back. The product is a convolution; dictionary
//! atoms are point-symmetric, so it equals their cross-correlation.
//!
//! Only the window of full overlap is kept: along each axis it starts at
//! `ceil((template - 1) / 2)` and spans the volume extent, giving a
//! correlation map with the same shape as the volume. Imaginary residue from
//! floating-point noise is discarded.
//!
//! Spectra are single precision. Inputs are `f32` probabilities to begin
//! with, and a `Complex64` buffer for a default tile (256x256x512) would take
//! 512 MiB on its own; every atom spectrum plus the volume and work buffers
//! are held at once per worker.

use std::sync::Arc;

use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use thiserror::Error;

use crate::dictionary::TemplateDictionary;
use crate::placement::ravel_index;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelateError {
    #[error("volume shape {actual:?} does not match correlator shape {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("atom {index} out of range for a dictionary of {len} atoms")]
    AtomOutOfRange { index: usize, len: usize },
}

/// Transform length along one axis: smallest power of two >= `volume + template`.
pub fn padded_extent(volume: usize, template: usize) -> usize {
    (volume + template).next_power_of_two()
}

/// Start of the full-overlap window along one axis (`ceil((template - 1) / 2)`).
fn window_start(template: usize) -> usize {
    template / 2
}

fn dim3<T>(array: &ArrayView3<T>) -> [usize; 3] {
    let (a, b, c) = array.dim();
    [a, b, c]
}

/// Cached forward and inverse plans for one padded 3-D shape.
struct Fft3d {
    shape: [usize; 3],
    forward: [Arc<dyn Fft<f32>>; 3],
    inverse: [Arc<dyn Fft<f32>>; 3],
}

impl Fft3d {
    fn new(shape: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();
        let forward = shape.map(|n| planner.plan_fft_forward(n));
        let inverse = shape.map(|n| planner.plan_fft_inverse(n));
        Self {
            shape,
            forward,
            inverse,
        }
    }

    fn zeros(&self) -> Array3<Complex32> {
        Array3::zeros((self.shape[0], self.shape[1], self.shape[2]))
    }

    fn forward(&self, buffer: &mut Array3<Complex32>) {
        for (axis, plan) in self.forward.iter().enumerate() {
            transform_axis(buffer, axis, plan.as_ref());
        }
    }

    /// Inverse transform including the `1/N` normalization rustfft leaves out.
    fn inverse(&self, buffer: &mut Array3<Complex32>) {
        for (axis, plan) in self.inverse.iter().enumerate() {
            transform_axis(buffer, axis, plan.as_ref());
        }
        let scale = 1.0 / buffer.len() as f32;
        buffer.par_mapv_inplace(|v| v * scale);
    }

    /// Zero-pad `source` into a fresh buffer and transform it.
    fn spectrum_of(&self, source: ArrayView3<f64>) -> Array3<Complex32> {
        let mut buffer = self.zeros();
        load_padded(&mut buffer, source);
        self.forward(&mut buffer);
        buffer
    }
}

/// Overwrite `buffer` with `source` in its leading corner and zeros elsewhere.
fn load_padded(buffer: &mut Array3<Complex32>, source: ArrayView3<f64>) {
    let [nx, ny, nz] = dim3(&source);
    buffer.fill(Complex32::default());
    buffer
        .slice_mut(s![..nx, ..ny, ..nz])
        .zip_mut_with(&source, |dst, &value| *dst = Complex32::new(value as f32, 0.0));
}

/// One 1-D transform per lane along `axis`, slabs in parallel.
fn transform_axis(buffer: &mut Array3<Complex32>, axis: usize, plan: &dyn Fft<f32>) {
    // Split along an axis other than the transformed one.
    let outer = if axis == 0 { 2 } else { 0 };
    let local = if axis > outer { axis - 1 } else { axis };
    let len = buffer.len_of(Axis(axis));

    buffer
        .axis_iter_mut(Axis(outer))
        .into_par_iter()
        .for_each(|mut slab| {
            let mut line = vec![Complex32::default(); len];
            let mut scratch = vec![Complex32::default(); plan.get_inplace_scratch_len()];
            for mut lane in slab.lanes_mut(Axis(local)) {
                for (dst, src) in line.iter_mut().zip(lane.iter()) {
                    *dst = *src;
                }
                plan.process_with_scratch(&mut line, &mut scratch);
                for (dst, src) in lane.iter_mut().zip(line.iter()) {
                    *dst = *src;
                }
            }
        });
}

/// Same-size correlation map of `volume` with an arbitrary `template`.
///
/// One-shot convenience; repeated correlations of one volume shape against a
/// fixed dictionary should go through [`Correlator`].
pub fn correlate_same(volume: ArrayView3<f64>, template: ArrayView3<f64>) -> Array3<f64> {
    let shape_a = dim3(&volume);
    let shape_b = dim3(&template);
    let padded = [0, 1, 2].map(|i| padded_extent(shape_a[i], shape_b[i]));
    let fft = Fft3d::new(padded);

    let mut product = fft.spectrum_of(volume);
    let kernel = fft.spectrum_of(template);
    Zip::from(&mut product)
        .and(&kernel)
        .par_for_each(|p, &k| *p *= k);
    fft.inverse(&mut product);

    let start = shape_b.map(window_start);
    product
        .slice(s![
            start[0]..start[0] + shape_a[0],
            start[1]..start[1] + shape_a[1],
            start[2]..start[2] + shape_a[2]
        ])
        .mapv(|c| f64::from(c.re))
}

/// Location and value of a correlation maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Real part of the correlation at the peak.
    pub value: f64,
    /// Column-major flat index of the peak voxel.
    pub flat_index: usize,
}

impl Peak {
    /// True when `self` should replace `other`: larger value, ties to the lower index.
    fn beats(&self, other: &Peak) -> bool {
        self.value > other.value || (self.value == other.value && self.flat_index < other.flat_index)
    }

    fn floor() -> Self {
        Self {
            value: f64::NEG_INFINITY,
            flat_index: usize::MAX,
        }
    }
}

/// Correlates one volume shape against every atom of a dictionary.
///
/// Plans, atom spectra and the work buffer are sized once at construction;
/// each call to [`Correlator::load_volume`] transforms the volume once, and
/// each atom then costs one product and one inverse transform.
pub struct Correlator {
    volume_shape: [usize; 3],
    box_length: usize,
    fft: Fft3d,
    atom_spectra: Vec<Array3<Complex32>>,
    volume_spectrum: Array3<Complex32>,
    work: Array3<Complex32>,
}

impl Correlator {
    pub fn new(volume_shape: [usize; 3], dictionary: &TemplateDictionary) -> Self {
        let box_length = dictionary.box_length();
        let fft = Fft3d::new(volume_shape.map(|n| padded_extent(n, box_length)));
        let atom_spectra = (0..dictionary.len())
            .map(|i| fft.spectrum_of(dictionary.atom_cube(i)))
            .collect();
        let volume_spectrum = fft.zeros();
        let work = fft.zeros();

        Self {
            volume_shape,
            box_length,
            fft,
            atom_spectra,
            volume_spectrum,
            work,
        }
    }

    pub fn volume_shape(&self) -> [usize; 3] {
        self.volume_shape
    }

    /// Shape of the zero-padded transform buffers.
    pub fn padded_shape(&self) -> [usize; 3] {
        self.fft.shape
    }

    /// Bytes held by spectra and work buffers.
    pub fn buffer_bytes(&self) -> usize {
        let buffers = self.atom_spectra.len() + 2;
        buffers * self.work.len() * std::mem::size_of::<Complex32>()
    }

    /// Transform a new volume; subsequent peaks and maps refer to it.
    pub fn load_volume(&mut self, volume: ArrayView3<f64>) -> Result<(), CorrelateError> {
        let actual = dim3(&volume);
        if actual != self.volume_shape {
            return Err(CorrelateError::ShapeMismatch {
                expected: self.volume_shape,
                actual,
            });
        }
        load_padded(&mut self.volume_spectrum, volume);
        self.fft.forward(&mut self.volume_spectrum);
        Ok(())
    }

    /// Inverse-transform the product with atom `atom` into the work buffer.
    fn correlate_into_work(&mut self, atom: usize) -> Result<(), CorrelateError> {
        let spectrum = self
            .atom_spectra
            .get(atom)
            .ok_or(CorrelateError::AtomOutOfRange {
                index: atom,
                len: self.atom_spectra.len(),
            })?;
        Zip::from(&mut self.work)
            .and(&self.volume_spectrum)
            .and(spectrum)
            .par_for_each(|w, &v, &a| *w = v * a);
        self.fft.inverse(&mut self.work);
        Ok(())
    }

    fn window(&self) -> ArrayView3<'_, Complex32> {
        let start = window_start(self.box_length);
        let [nx, ny, nz] = self.volume_shape;
        self.work
            .slice(s![start..start + nx, start..start + ny, start..start + nz])
    }

    /// Same-size correlation map of the loaded volume with atom `atom`.
    pub fn correlation_map(&mut self, atom: usize) -> Result<Array3<f64>, CorrelateError> {
        self.correlate_into_work(atom)?;
        Ok(self.window().mapv(|c| f64::from(c.re)))
    }

    /// Maximum of the correlation map with atom `atom`.
    ///
    /// Ties resolve to the lowest column-major flat index, independent of
    /// how the scan is split across threads.
    pub fn peak(&mut self, atom: usize) -> Result<Peak, CorrelateError> {
        self.correlate_into_work(atom)?;
        let shape = self.volume_shape;
        let peak = self
            .window()
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(x, plane)| {
                let mut best = Peak::floor();
                for ((y, z), c) in plane.indexed_iter() {
                    let candidate = Peak {
                        value: f64::from(c.re),
                        flat_index: ravel_index([x, y, z], shape),
                    };
                    if candidate.beats(&best) {
                        best = candidate;
                    }
                }
                best
            })
            .reduce(Peak::floor, |a, b| if b.beats(&a) { b } else { a });
        Ok(peak)
    }
}
