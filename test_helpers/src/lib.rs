//! Test helpers for celldetect
//!
//! Synthetic probability volumes with spheres at known positions, so tests
//! can check detections against exact ground truth.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One sphere to embed in a synthetic volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereSpec {
    pub center: [usize; 3],
    pub radius: u32,
    /// Probability assigned to every voxel of the sphere.
    pub value: f32,
}

impl SphereSpec {
    pub fn new(center: [usize; 3], radius: u32, value: f32) -> Self {
        Self {
            center,
            radius,
            value,
        }
    }

    /// Whether voxel `(i, j, k)` lies in the sphere (distance <= radius).
    pub fn contains(&self, i: usize, j: usize, k: usize) -> bool {
        let d2: i64 = [i, j, k]
            .iter()
            .zip(self.center.iter())
            .map(|(&v, &c)| (v as i64 - c as i64).pow(2))
            .sum();
        d2 <= (self.radius as i64).pow(2)
    }
}

/// Zero volume of `shape` with each sphere filled with its value.
///
/// Where spheres overlap the larger value wins.
pub fn sphere_volume(shape: [usize; 3], spheres: &[SphereSpec]) -> Array3<f32> {
    Array3::from_shape_fn(shape, |(i, j, k)| {
        spheres
            .iter()
            .filter(|s| s.contains(i, j, k))
            .map(|s| s.value)
            .fold(0.0, f32::max)
    })
}

/// Number of voxels in a discretized ball of `radius`.
pub fn ball_voxel_count(radius: u32) -> usize {
    let r = radius as i64;
    let mut count = 0;
    for i in -r..=r {
        for j in -r..=r {
            for k in -r..=r {
                if i * i + j * j + k * k <= r * r {
                    count += 1;
                }
            }
        }
    }
    count
}

/// Add uniform noise in `[0, amplitude)` to every voxel, clamped to 1.
pub fn add_uniform_noise(volume: &mut Array3<f32>, amplitude: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    volume.mapv_inplace(|v| (v + rng.gen_range(0.0..amplitude)).min(1.0));
}

/// Up to `count` spheres of `radius` placed at random, fully inside `shape`,
/// with centers at least `min_separation` voxels apart.
///
/// Values are drawn from `[0.6, 1.0)`. Placement gives up after a bounded
/// number of attempts, so crowded requests may return fewer spheres.
pub fn scattered_spheres(
    shape: [usize; 3],
    count: usize,
    radius: u32,
    min_separation: f64,
    seed: u64,
) -> Vec<SphereSpec> {
    let mut rng = StdRng::seed_from_u64(seed);
    let margin = radius as usize;
    let mut spheres: Vec<SphereSpec> = Vec::with_capacity(count);
    if shape.iter().any(|&n| n <= 2 * margin) {
        return spheres;
    }

    for _ in 0..count * 100 {
        if spheres.len() == count {
            break;
        }
        let center = shape.map(|n| rng.gen_range(margin..n - margin));
        let far_enough = spheres.iter().all(|s| {
            let d2: f64 = s
                .center
                .iter()
                .zip(center.iter())
                .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
                .sum();
            d2.sqrt() >= min_separation
        });
        if far_enough {
            spheres.push(SphereSpec::new(center, radius, rng.gen_range(0.6..1.0)));
        }
    }
    spheres
}
