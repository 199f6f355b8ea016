//! Dictionaries of normalized spherical templates ("atoms").
//!
//! Each atom is the indicator of a discretized ball (voxels whose distance
//! from the cube center is at most the radius) inside a cube of side
//! `2 * box_radius + 1`, scaled to unit L2 norm. Balls larger than the box are
//! clipped to it, which is how suppression atoms share the detection box.
//!
//! A detection run builds two dictionaries over the same box, one from the
//! nominal radii and one from radii grown by a dilation margin, so atom `i`
//! of one corresponds to atom `i` of the other.

use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use thiserror::Error;

/// Errors raised while building a dictionary.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DictionaryError {
    #[error("template radius must be positive, got 0")]
    ZeroRadius,
    #[error("at least one template radius is required")]
    NoRadii,
}

/// Ordered collection of unit-norm sphere templates sharing one bounding box.
#[derive(Debug, Clone)]
pub struct TemplateDictionary {
    radii: Vec<u32>,
    box_radius: usize,
    /// Atom cubes stacked along axis 0: `(atoms, L, L, L)`.
    cubes: Array4<f64>,
    /// Sum of each normalized atom (`sqrt` of its support size).
    masses: Vec<f64>,
}

impl TemplateDictionary {
    /// Box radius that contains the largest ball of `radii` plus one empty shell.
    pub fn box_radius_for(radii: &[u32]) -> Result<usize, DictionaryError> {
        validate_radii(radii)?;
        let largest = radii.iter().copied().max().unwrap_or(0);
        Ok(largest as usize + 1)
    }

    /// Build a dictionary whose box is sized for `radii` themselves.
    pub fn for_radii(radii: &[u32]) -> Result<Self, DictionaryError> {
        let box_radius = Self::box_radius_for(radii)?;
        Self::build(radii, box_radius)
    }

    /// Build one atom per radius inside a cube of side `2 * box_radius + 1`.
    pub fn build(radii: &[u32], box_radius: usize) -> Result<Self, DictionaryError> {
        validate_radii(radii)?;

        let box_length = 2 * box_radius + 1;
        let mut cubes = Array4::<f64>::zeros((radii.len(), box_length, box_length, box_length));
        let mut masses = Vec::with_capacity(radii.len());

        for (mut cube, &radius) in cubes.axis_iter_mut(Axis(0)).zip(radii) {
            let ball = ball_indicator(radius, box_radius);
            let support = ball.sum();
            let norm = support.sqrt();
            cube.assign(&(ball / norm));
            masses.push(support / norm);
        }

        Ok(Self {
            radii: radii.to_vec(),
            box_radius,
            cubes,
            masses,
        })
    }

    /// Radii in atom order.
    pub fn radii(&self) -> &[u32] {
        &self.radii
    }

    pub fn box_radius(&self) -> usize {
        self.box_radius
    }

    /// Side length of the template cube (`2 * box_radius + 1`).
    pub fn box_length(&self) -> usize {
        2 * self.box_radius + 1
    }

    pub fn len(&self) -> usize {
        self.radii.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radii.is_empty()
    }

    /// Atom `index` reshaped to its cube.
    pub fn atom_cube(&self, index: usize) -> ArrayView3<'_, f64> {
        self.cubes.index_axis(Axis(0), index)
    }

    /// Atom `index` flattened in C order over its cube.
    pub fn atom(&self, index: usize) -> Array1<f64> {
        self.atom_cube(index).iter().copied().collect()
    }

    /// Sum of the elements of atom `index`; divides raw correlation peaks into confidences.
    pub fn mass(&self, index: usize) -> f64 {
        self.masses[index]
    }

    /// All atoms as columns of a `(box_length³, atoms)` matrix.
    pub fn matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.box_length().pow(3), self.len()));
        for (column, cube) in self.cubes.outer_iter().enumerate() {
            for (row, &value) in cube.iter().enumerate() {
                matrix[[row, column]] = value;
            }
        }
        matrix
    }

    /// Whether atoms of `self` and `other` can be used index-for-index.
    pub fn is_aligned_with(&self, other: &TemplateDictionary) -> bool {
        self.box_length() == other.box_length() && self.len() == other.len()
    }
}

fn validate_radii(radii: &[u32]) -> Result<(), DictionaryError> {
    if radii.is_empty() {
        return Err(DictionaryError::NoRadii);
    }
    if radii.contains(&0) {
        return Err(DictionaryError::ZeroRadius);
    }
    Ok(())
}

/// Binary ball of `radius` centered in a cube of side `2 * box_radius + 1`.
fn ball_indicator(radius: u32, box_radius: usize) -> Array3<f64> {
    let box_length = 2 * box_radius + 1;
    let center = box_radius as i64;
    let limit = (radius as i64).pow(2);
    Array3::from_shape_fn((box_length, box_length, box_length), |(i, j, k)| {
        let d2 = (i as i64 - center).pow(2) + (j as i64 - center).pow(2) + (k as i64 - center).pow(2);
        if d2 <= limit {
            1.0
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ball_voxel_count(radius: i64) -> usize {
        let mut count = 0;
        for i in -radius..=radius {
            for j in -radius..=radius {
                for k in -radius..=radius {
                    if i * i + j * j + k * k <= radius * radius {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    #[test]
    fn test_atoms_have_unit_norm() {
        let dict = TemplateDictionary::for_radii(&[2, 5, 9]).unwrap();
        for i in 0..dict.len() {
            let norm = dict.atom(i).mapv(|v| v * v).sum().sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_support_is_centered_ball() {
        let dict = TemplateDictionary::for_radii(&[4]).unwrap();
        assert_eq!(dict.box_radius(), 5);
        assert_eq!(dict.box_length(), 11);

        let cube = dict.atom_cube(0);
        for ((i, j, k), &value) in cube.indexed_iter() {
            let d2 = (i as i64 - 5).pow(2) + (j as i64 - 5).pow(2) + (k as i64 - 5).pow(2);
            assert_eq!(value != 0.0, d2 <= 16, "voxel ({i}, {j}, {k})");
        }
        let support = cube.iter().filter(|&&v| v != 0.0).count();
        assert_eq!(support, ball_voxel_count(4));
    }

    #[test]
    fn test_mass_is_sqrt_of_support() {
        let dict = TemplateDictionary::for_radii(&[3]).unwrap();
        let support = ball_voxel_count(3) as f64;
        assert_relative_eq!(dict.mass(0), support.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(dict.mass(0), dict.atom(0).sum(), epsilon = 1e-12);
    }

    #[test]
    fn test_suppression_atoms_are_clipped_to_shared_box() {
        let detection = TemplateDictionary::for_radii(&[3]).unwrap();
        let suppression = TemplateDictionary::build(&[11], detection.box_radius()).unwrap();

        assert!(detection.is_aligned_with(&suppression));
        // Corners of the 9³ box sit at sqrt(48) < 11, so the clipped ball fills it.
        let support = suppression.atom_cube(0).iter().filter(|&&v| v != 0.0).count();
        assert_eq!(support, 9 * 9 * 9);
    }

    #[test]
    fn test_matrix_layout() {
        let dict = TemplateDictionary::build(&[1, 2], 2).unwrap();
        let matrix = dict.matrix();
        assert_eq!(matrix.dim(), (125, 2));
        assert_eq!(matrix.column(1).to_owned(), dict.atom(1));
    }

    #[test]
    fn test_invalid_radii_rejected() {
        assert_eq!(
            TemplateDictionary::for_radii(&[]).unwrap_err(),
            DictionaryError::NoRadii
        );
        assert_eq!(
            TemplateDictionary::build(&[3, 0], 4).unwrap_err(),
            DictionaryError::ZeroRadius
        );
    }
}
