//! Placement of dictionary atoms into full-size volumes.
//!
//! An atom is a flattened `box_length³` template. Placing it "at" a voxel means
//! centering the reshaped cube on that voxel and cropping whatever falls
//! outside the target volume.
//!
//! # Index convention
//!
//! Flat voxel indices are column-major over the `(X, Y, Z)` axes of a volume:
//! `flat = x + nx * (y + ny * z)`. X is the fastest-varying (column) axis, Y
//! the row axis and Z the depth axis. Every flat index produced or consumed
//! by this crate follows that layout, independent of how ndarray stores the
//! elements in memory.
//!
//! # Centering
//!
//! The first template voxel along each axis lands at
//! `center - round_half_up(box_length / 2) + 1`. For odd box lengths
//! `2R + 1` that is `center - R`, so the cube is exactly centered. Banker's
//! rounding would turn `10.5` into `10` and shift every placement by one
//! voxel, which is why [`round_half_up`] exists.

use ndarray::{indices, s, Array3, ArrayView1, ArrayView3};
use thiserror::Error;

/// Errors raised when an atom cannot be placed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlacementError {
    #[error("atom has {actual} elements, expected box_length³ = {expected}")]
    AtomLength { expected: usize, actual: usize },
    #[error("flat index {index} is outside a volume of {len} voxels")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Round to the nearest integer with halves going up (`12.5 -> 13`).
///
/// Only defined for non-negative inputs, which is all placement needs.
pub fn round_half_up(value: f64) -> usize {
    debug_assert!(value >= 0.0, "round_half_up called with {value}");
    (value + 0.5).floor() as usize
}

/// Column-major flat index of `index` in a volume of `shape`.
pub fn ravel_index(index: [usize; 3], shape: [usize; 3]) -> usize {
    index[0] + shape[0] * (index[1] + shape[1] * index[2])
}

/// Inverse of [`ravel_index`].
pub fn unravel_index(flat: usize, shape: [usize; 3]) -> [usize; 3] {
    debug_assert!(shape.iter().all(|&n| n > 0), "empty shape {shape:?}");
    let x = flat % shape[0];
    let rest = flat / shape[0];
    [x, rest % shape[1], rest / shape[1]]
}

/// Offset from a placement center to the first voxel of the template cube.
fn leading_offset(box_length: usize) -> usize {
    round_half_up(box_length as f64 / 2.0) - 1
}

/// Place a flattened atom centered at `flat_index` inside a zero volume of `shape`.
///
/// Pads the target by `box_length` on every side, writes the whole cube into
/// the padded frame, then crops the padding off again. The margin equals the
/// box length, so the cube never leaves the padded frame regardless of where
/// the center sits.
///
/// # Arguments
/// * `atom` - Flattened template of `box_length³` elements (C order over the cube)
/// * `box_length` - Side length of the template cube
/// * `flat_index` - Column-major index of the center voxel
/// * `shape` - Target volume shape `(nx, ny, nz)`
pub fn place_atom(
    atom: ArrayView1<f64>,
    box_length: usize,
    flat_index: usize,
    shape: [usize; 3],
) -> Result<Array3<f64>, PlacementError> {
    let expected = box_length.pow(3);
    if atom.len() != expected {
        return Err(PlacementError::AtomLength {
            expected,
            actual: atom.len(),
        });
    }
    let len = shape.iter().product::<usize>();
    if flat_index >= len {
        return Err(PlacementError::IndexOutOfBounds {
            index: flat_index,
            len,
        });
    }

    let pad = box_length;
    let [nx, ny, nz] = shape;
    let mut padded = Array3::<f64>::zeros((nx + 2 * pad, ny + 2 * pad, nz + 2 * pad));

    // Marker voxel in the padded frame, then the cube's leading corner.
    let marker = unravel_index(flat_index, shape).map(|c| c + pad);
    let start = marker.map(|c| c - leading_offset(box_length));

    let cube = Array3::from_shape_fn((box_length, box_length, box_length), |(i, j, k)| {
        atom[(i * box_length + j) * box_length + k]
    });
    padded
        .slice_mut(s![
            start[0]..start[0] + box_length,
            start[1]..start[1] + box_length,
            start[2]..start[2] + box_length
        ])
        .assign(&cube);

    Ok(padded
        .slice(s![pad..pad + nx, pad..pad + ny, pad..pad + nz])
        .to_owned())
}

/// In-bounds, nonzero voxels of an atom cube centered on a voxel.
///
/// Same geometry as [`place_atom`] without materializing a full volume; the
/// detector uses it to label and suppress in place.
#[derive(Debug, Clone)]
pub struct AtomFootprint<'a> {
    cube: ArrayView3<'a, f64>,
    start: [isize; 3],
    shape: [usize; 3],
}

impl<'a> AtomFootprint<'a> {
    pub fn new(cube: ArrayView3<'a, f64>, center: [usize; 3], shape: [usize; 3]) -> Self {
        let (box_length, _, _) = cube.dim();
        let offset = leading_offset(box_length) as isize;
        Self {
            cube,
            start: center.map(|c| c as isize - offset),
            shape,
        }
    }

    /// Iterate `(voxel, template value)` pairs that fall inside the volume.
    ///
    /// The iterator borrows the atom cube, not the footprint.
    pub fn iter(&self) -> impl Iterator<Item = ([usize; 3], f64)> + 'a {
        let cube = self.cube;
        let (start, shape) = (self.start, self.shape);
        indices(cube.dim()).into_iter().filter_map(move |(i, j, k)| {
            let value = cube[[i, j, k]];
            if value == 0.0 {
                return None;
            }
            let voxel = [
                start[0] + i as isize,
                start[1] + j as isize,
                start[2] + k as isize,
            ];
            let inside = voxel
                .iter()
                .zip(shape.iter())
                .all(|(&v, &n)| v >= 0 && (v as usize) < n);
            inside.then(|| (voxel.map(|v| v as usize), value))
        })
    }
}
