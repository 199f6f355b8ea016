//! Directory-backed dataset container.
//!
//! A container is a directory; each dataset `name` in it is a JSON header
//! `name.json` (shape and element type) next to a raw data file `name.bin`
//! holding native-endian elements in C order. Data files are created at full
//! size up front and zero-filled by the filesystem, after which any number of
//! writers may fill disjoint regions concurrently: every region access opens
//! its own file handle and only touches the bytes of that region.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use log::debug;
use ndarray::{Array3, ArrayD, ArrayView, ArrayView2, ArrayView3, Dimension, Ix3, IxDyn};
use serde::{Deserialize, Serialize};

use super::{check_region, CentroidTableStore, Dtype, LabelMapStore, StoreError, VolumeSource};
use crate::partition::SubVolume;

/// Element types that can be stored in a dataset.
pub trait Element: Pod + Send + Sync {
    const DTYPE: Dtype;
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;
}

impl Element for u32 {
    const DTYPE: Dtype = Dtype::U32;
}

/// Contents of a dataset's `.json` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHeader {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl DatasetHeader {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the data file in bytes.
    pub fn byte_len(&self) -> u64 {
        (self.len() * self.dtype.size_of()) as u64
    }
}

/// A directory holding named datasets.
#[derive(Debug, Clone)]
pub struct DatasetContainer {
    root: PathBuf,
}

impl DatasetContainer {
    /// Open `root`, creating the directory if needed.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Open an existing container directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "container directory not found"),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn header_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.bin"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.header_path(name).is_file()
    }

    /// Names of all datasets, sorted.
    pub fn dataset_names(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.root, e))?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete dataset `name`. Returns whether it existed.
    pub fn remove_dataset(&self, name: &str) -> Result<bool, StoreError> {
        let mut existed = false;
        for path in [self.header_path(name), self.data_path(name)] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                existed = true;
            }
        }
        Ok(existed)
    }

    /// Create a zero-filled dataset, replacing any dataset of the same name.
    pub fn create_dataset(
        &self,
        name: &str,
        shape: &[usize],
        dtype: Dtype,
    ) -> Result<DatasetHandle, StoreError> {
        if shape.is_empty() {
            return Err(StoreError::RankMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if self.remove_dataset(name)? {
            debug!("Replaced existing dataset '{name}'");
        }

        let header = DatasetHeader {
            shape: shape.to_vec(),
            dtype,
        };
        let data_path = self.data_path(name);
        let file = File::create(&data_path).map_err(|e| StoreError::io(&data_path, e))?;
        file.set_len(header.byte_len())
            .map_err(|e| StoreError::io(&data_path, e))?;

        // The header goes last: a dataset exists once its header does.
        let header_path = self.header_path(name);
        let json = serde_json::to_string_pretty(&header).map_err(|source| StoreError::Header {
            path: header_path.clone(),
            source,
        })?;
        fs::write(&header_path, json).map_err(|e| StoreError::io(&header_path, e))?;

        debug!("Created dataset '{name}' {shape:?} {dtype}");
        Ok(DatasetHandle {
            name: name.to_string(),
            data_path,
            header,
        })
    }

    /// Open dataset `name`.
    ///
    /// Fails if the data file does not hold exactly the bytes its header declares.
    pub fn dataset(&self, name: &str) -> Result<DatasetHandle, StoreError> {
        let header_path = self.header_path(name);
        if !header_path.is_file() {
            return Err(StoreError::MissingDataset(name.to_string()));
        }
        let json = fs::read_to_string(&header_path).map_err(|e| StoreError::io(&header_path, e))?;
        let header: DatasetHeader =
            serde_json::from_str(&json).map_err(|source| StoreError::Header {
                path: header_path.clone(),
                source,
            })?;

        let data_path = self.data_path(name);
        let actual = fs::metadata(&data_path)
            .map_err(|e| StoreError::io(&data_path, e))?
            .len();
        if actual != header.byte_len() {
            return Err(StoreError::SizeMismatch {
                path: data_path,
                expected: header.byte_len(),
                actual,
            });
        }
        Ok(DatasetHandle {
            name: name.to_string(),
            data_path,
            header,
        })
    }

    /// Create dataset `name` with the shape of `array` and fill it.
    pub fn write_dataset<T: Element, D: Dimension>(
        &self,
        name: &str,
        array: ArrayView<T, D>,
    ) -> Result<DatasetHandle, StoreError> {
        let handle = self.create_dataset(name, array.shape(), T::DTYPE)?;
        let origin = vec![0; array.ndim()];
        handle.write_region(&origin, array)?;
        Ok(handle)
    }
}

/// An opened dataset: its name, header and data file location.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    name: String,
    data_path: PathBuf,
    header: DatasetHeader,
}

impl DatasetHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    pub fn shape(&self) -> &[usize] {
        &self.header.shape
    }

    fn check_dtype<T: Element>(&self) -> Result<(), StoreError> {
        if T::DTYPE != self.header.dtype {
            return Err(StoreError::DtypeMismatch {
                name: self.name.clone(),
                found: self.header.dtype,
                requested: T::DTYPE,
            });
        }
        Ok(())
    }

    /// Element offsets of each contiguous innermost-axis run of a region, in C order.
    fn run_offsets<'a>(&'a self, origin: &'a [usize], shape: &[usize]) -> impl Iterator<Item = usize> + 'a {
        let dims = &self.header.shape;
        let last = dims.len() - 1;
        let mut strides = vec![1; dims.len()];
        for axis in (0..last).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }
        ndarray::indices(IxDyn(&shape[..last])).into_iter().map(move |prefix| {
            let leading: usize = (0..last)
                .map(|axis| (origin[axis] + prefix[axis]) * strides[axis])
                .sum();
            leading + origin[last]
        })
    }

    /// Read the block of `shape` whose first element sits at `origin`.
    pub fn read_region<T: Element>(&self, origin: &[usize], shape: &[usize]) -> Result<ArrayD<T>, StoreError> {
        self.check_dtype::<T>()?;
        check_region(origin, shape, &self.header.shape)?;

        let total: usize = shape.iter().product();
        let mut data = Vec::with_capacity(total);
        if total > 0 {
            let run = shape[shape.len() - 1];
            let mut buffer = vec![<T as Zeroable>::zeroed(); run];
            let mut file = File::open(&self.data_path).map_err(|e| StoreError::io(&self.data_path, e))?;
            for offset in self.run_offsets(origin, shape) {
                file.seek(SeekFrom::Start((offset * std::mem::size_of::<T>()) as u64))
                    .and_then(|_| file.read_exact(bytemuck::cast_slice_mut(&mut buffer)))
                    .map_err(|e| StoreError::io(&self.data_path, e))?;
                data.extend_from_slice(&buffer);
            }
        }
        Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
    }

    /// Read the whole dataset.
    pub fn read_all<T: Element>(&self) -> Result<ArrayD<T>, StoreError> {
        let origin = vec![0; self.header.shape.len()];
        let shape = self.header.shape.clone();
        self.read_region(&origin, &shape)
    }

    /// Write `block` with its first element at `origin`.
    pub fn write_region<T: Element, D: Dimension>(
        &self,
        origin: &[usize],
        block: ArrayView<T, D>,
    ) -> Result<(), StoreError> {
        self.check_dtype::<T>()?;
        let shape = block.shape().to_vec();
        check_region(origin, &shape, &self.header.shape)?;
        if block.is_empty() {
            return Ok(());
        }

        let run = shape[shape.len() - 1];
        let elements: Vec<T> = block.iter().copied().collect();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.data_path)
            .map_err(|e| StoreError::io(&self.data_path, e))?;
        for (offset, chunk) in self.run_offsets(origin, &shape).zip(elements.chunks_exact(run)) {
            file.seek(SeekFrom::Start((offset * std::mem::size_of::<T>()) as u64))
                .and_then(|_| file.write_all(bytemuck::cast_slice(chunk)))
                .map_err(|e| StoreError::io(&self.data_path, e))?;
        }
        file.flush().map_err(|e| StoreError::io(&self.data_path, e))?;
        Ok(())
    }
}

/// Probability volume stored as a 3-D `f32` dataset.
#[derive(Debug, Clone)]
pub struct DatasetVolume {
    handle: DatasetHandle,
    shape: [usize; 3],
}

impl DatasetVolume {
    pub fn open(container: &DatasetContainer, name: &str) -> Result<Self, StoreError> {
        let handle = container.dataset(name)?;
        handle.check_dtype::<f32>()?;
        let shape: [usize; 3] = handle
            .shape()
            .try_into()
            .map_err(|_| StoreError::RankMismatch {
                expected: 3,
                actual: handle.shape().len(),
            })?;
        Ok(Self { handle, shape })
    }

    pub fn handle(&self) -> &DatasetHandle {
        &self.handle
    }
}

impl VolumeSource for DatasetVolume {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn read_region(&self, region: &SubVolume) -> Result<Array3<f32>, StoreError> {
        let block = self.handle.read_region::<f32>(&region.origin(), &region.shape())?;
        Ok(block.into_dimensionality::<Ix3>()?)
    }
}

/// Label map stored as a 3-D `u32` dataset.
#[derive(Debug, Clone)]
pub struct DatasetLabelMap {
    container: DatasetContainer,
    name: String,
}

impl DatasetLabelMap {
    pub fn new(container: DatasetContainer, name: impl Into<String>) -> Self {
        Self {
            container,
            name: name.into(),
        }
    }
}

impl LabelMapStore for DatasetLabelMap {
    fn create(&self, shape: [usize; 3]) -> Result<(), StoreError> {
        self.container.create_dataset(&self.name, &shape, Dtype::U32)?;
        Ok(())
    }

    fn write_region(&self, origin: [usize; 3], block: ArrayView3<u32>) -> Result<(), StoreError> {
        self.container.dataset(&self.name)?.write_region(&origin, block)
    }
}

/// Centroid table stored as an `(rows, 4)` `f32` dataset.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    container: DatasetContainer,
    name: String,
}

impl DatasetTable {
    pub fn new(container: DatasetContainer, name: impl Into<String>) -> Self {
        Self {
            container,
            name: name.into(),
        }
    }
}

impl CentroidTableStore for DatasetTable {
    fn create(&self, rows: usize) -> Result<(), StoreError> {
        self.container.create_dataset(&self.name, &[rows, 4], Dtype::F32)?;
        Ok(())
    }

    fn write_rows(&self, first_row: usize, rows: ArrayView2<f32>) -> Result<(), StoreError> {
        self.container.dataset(&self.name)?.write_region(&[first_row, 0], rows)
    }
}
