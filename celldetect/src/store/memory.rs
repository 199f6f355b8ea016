//! In-memory stores for tests and for embedding the orchestrator in a process
//! that already holds the whole volume.

use std::sync::{Mutex, MutexGuard};

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};

use super::{check_region, CentroidTableStore, LabelMapStore, StoreError, VolumeSource};
use crate::partition::SubVolume;

/// Probability volume held in memory.
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    data: Array3<f32>,
}

impl MemoryVolume {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }
}

impl VolumeSource for MemoryVolume {
    fn shape(&self) -> [usize; 3] {
        let (nx, ny, nz) = self.data.dim();
        [nx, ny, nz]
    }

    fn read_region(&self, region: &SubVolume) -> Result<Array3<f32>, StoreError> {
        check_region(&region.origin(), &region.shape(), &self.shape())?;
        Ok(self
            .data
            .slice(s![region.x0..region.x1, region.y0..region.y1, region.z0..region.z1])
            .to_owned())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::Poisoned)
}

/// Label map held in memory.
#[derive(Debug, Default)]
pub struct MemoryLabelMap {
    data: Mutex<Option<Array3<u32>>>,
}

impl MemoryLabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents, `None` before `create`.
    pub fn snapshot(&self) -> Result<Option<Array3<u32>>, StoreError> {
        Ok(lock(&self.data)?.clone())
    }
}

impl LabelMapStore for MemoryLabelMap {
    fn create(&self, shape: [usize; 3]) -> Result<(), StoreError> {
        *lock(&self.data)? = Some(Array3::zeros(shape));
        Ok(())
    }

    fn write_region(&self, origin: [usize; 3], block: ArrayView3<u32>) -> Result<(), StoreError> {
        let mut guard = lock(&self.data)?;
        let data = guard.as_mut().ok_or(StoreError::NotCreated)?;
        check_region(&origin, block.shape(), data.shape())?;
        let (bx, by, bz) = block.dim();
        let [x, y, z] = origin;
        data.slice_mut(s![x..x + bx, y..y + by, z..z + bz]).assign(&block);
        Ok(())
    }
}

/// Centroid table held in memory.
#[derive(Debug, Default)]
pub struct MemoryCentroidTable {
    data: Mutex<Option<Array2<f32>>>,
}

impl MemoryCentroidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Option<Array2<f32>>, StoreError> {
        Ok(lock(&self.data)?.clone())
    }
}

impl CentroidTableStore for MemoryCentroidTable {
    fn create(&self, rows: usize) -> Result<(), StoreError> {
        *lock(&self.data)? = Some(Array2::zeros((rows, 4)));
        Ok(())
    }

    fn write_rows(&self, first_row: usize, rows: ArrayView2<f32>) -> Result<(), StoreError> {
        let mut guard = lock(&self.data)?;
        let data = guard.as_mut().ok_or(StoreError::NotCreated)?;
        check_region(&[first_row, 0], rows.shape(), data.shape())?;
        let (count, columns) = rows.dim();
        data.slice_mut(s![first_row..first_row + count, ..columns])
            .assign(&rows);
        Ok(())
    }
}
