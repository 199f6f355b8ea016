//! Tiling of a volume's index space into fixed-size sub-volumes.
//!
//! Only whole tiles are produced: an axis of extent `n` with tile size `t`
//! yields `n / t` tiles and the last `n % t` voxels along it belong to no
//! tile. [`Partition`] keeps the count of those voxels so callers can report
//! them instead of losing them silently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("tile shape {0:?} has a zero extent")]
    ZeroTile([usize; 3]),
}

/// Half-open voxel ranges `[x0, x1) x [y0, y1) x [z0, z1)` of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubVolume {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
    pub z0: usize,
    pub z1: usize,
}

impl SubVolume {
    /// Tile starting at `origin` with extents `shape`.
    pub fn from_origin(origin: [usize; 3], shape: [usize; 3]) -> Self {
        Self {
            x0: origin[0],
            x1: origin[0] + shape[0],
            y0: origin[1],
            y1: origin[1] + shape[1],
            z0: origin[2],
            z1: origin[2] + shape[2],
        }
    }

    pub fn origin(&self) -> [usize; 3] {
        [self.x0, self.y0, self.z0]
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.x1 - self.x0, self.y1 - self.y0, self.z1 - self.z0]
    }

    /// Number of voxels in the tile.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the tile lies entirely inside a volume of `shape`.
    pub fn fits_within(&self, shape: [usize; 3]) -> bool {
        self.x1 <= shape[0] && self.y1 <= shape[1] && self.z1 <= shape[2]
    }

    /// Whether the two tiles share at least one voxel.
    pub fn overlaps(&self, other: &SubVolume) -> bool {
        self.x0 < other.x1
            && other.x0 < self.x1
            && self.y0 < other.y1
            && other.y0 < self.y1
            && self.z0 < other.z1
            && other.z0 < self.z1
    }

    /// The tuple form `(x0, x1, y0, y1, z0, z1)`.
    pub fn as_tuple(&self) -> (usize, usize, usize, usize, usize, usize) {
        (self.x0, self.x1, self.y0, self.y1, self.z0, self.z1)
    }
}

/// Whole-tile grid over a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    volume_shape: [usize; 3],
    tile_shape: [usize; 3],
    grid: [usize; 3],
    tiles: Vec<SubVolume>,
}

impl Partition {
    pub fn new(volume_shape: [usize; 3], tile_shape: [usize; 3]) -> Result<Self, PartitionError> {
        if tile_shape.contains(&0) {
            return Err(PartitionError::ZeroTile(tile_shape));
        }

        let grid = [0, 1, 2].map(|i| volume_shape[i] / tile_shape[i]);
        let mut tiles = Vec::with_capacity(grid.iter().product());
        for i in 0..grid[0] {
            for j in 0..grid[1] {
                for k in 0..grid[2] {
                    let origin = [i * tile_shape[0], j * tile_shape[1], k * tile_shape[2]];
                    tiles.push(SubVolume::from_origin(origin, tile_shape));
                }
            }
        }

        Ok(Self {
            volume_shape,
            tile_shape,
            grid,
            tiles,
        })
    }

    pub fn volume_shape(&self) -> [usize; 3] {
        self.volume_shape
    }

    pub fn tile_shape(&self) -> [usize; 3] {
        self.tile_shape
    }

    /// Tiles per axis.
    pub fn grid(&self) -> [usize; 3] {
        self.grid
    }

    /// Tiles in x-major order (x outermost, z innermost).
    pub fn tiles(&self) -> &[SubVolume] {
        &self.tiles
    }

    pub fn into_tiles(self) -> Vec<SubVolume> {
        self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Voxels covered by some tile.
    pub fn covered_voxels(&self) -> usize {
        self.tiles.len() * self.tile_shape.iter().product::<usize>()
    }

    /// Voxels of the volume that fall outside every tile.
    pub fn uncovered_voxels(&self) -> usize {
        self.volume_shape.iter().product::<usize>() - self.covered_voxels()
    }
}

/// Whole tiles of `tile_shape` covering `shape`, x-major.
pub fn partition(shape: [usize; 3], tile_shape: [usize; 3]) -> Result<Vec<SubVolume>, PartitionError> {
    Ok(Partition::new(shape, tile_shape)?.into_tiles())
}
