//! Dense voxel blocks
//!
//! A [`VoxelBlock`] holds raw little-endian voxels in `[t][z][y][x]` C order. Cuboids are
//! blocks with `t = 1` and the configured cube shape; cutout requests and responses are
//! blocks of arbitrary shape. Carving and overlay work on an `ndarray` view whose last
//! axis is measured in bytes, so they are independent of the scalar type.

use crate::error::{BossError, ErrorCode, Result};
use crate::layout::CubeSize;
use crate::types::{DataType, Voxel};
use crate::utils::{bytes_to_voxels, voxels_to_bytes};
use ndarray::{s, Array4, ArrayView4, ArrayViewMut4};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelBlock {
    dtype: DataType,
    /// `(t, z, y, x)`
    shape: [usize; 4],
    data: Vec<u8>,
}

impl VoxelBlock {
    pub fn zeros(dtype: DataType, shape: [usize; 4]) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Empty cuboid for one time sample
    pub fn zero_cube(dtype: DataType, cube: &CubeSize) -> Self {
        let (z, y, x) = cube.shape_zyx();
        Self::zeros(dtype, [1, z, y, x])
    }

    pub fn from_bytes(dtype: DataType, shape: [usize; 4], data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(BossError::validation_with(
                ErrorCode::DataDimensionMismatch,
                format!(
                    "Data length {} does not match shape {:?} of {} ({} bytes)",
                    data.len(),
                    shape,
                    dtype,
                    expected
                ),
            ));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_typed<T: Voxel>(array: &Array4<T>) -> Self {
        let dim = array.dim();
        let values: Vec<T> = array.iter().copied().collect();
        Self {
            dtype: T::DATA_TYPE,
            shape: [dim.0, dim.1, dim.2, dim.3],
            data: voxels_to_bytes(&values),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn num_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    fn byte_shape(&self) -> (usize, usize, usize, usize) {
        let [t, z, y, x] = self.shape;
        (t, z, y, x * self.dtype.size_in_bytes())
    }

    fn view(&self) -> Result<ArrayView4<'_, u8>> {
        ArrayView4::from_shape(self.byte_shape(), &self.data)
            .map_err(|e| BossError::Internal(format!("voxel block shape: {}", e)))
    }

    fn view_mut(&mut self) -> Result<ArrayViewMut4<'_, u8>> {
        let shape = self.byte_shape();
        ArrayViewMut4::from_shape(shape, &mut self.data)
            .map_err(|e| BossError::Internal(format!("voxel block shape: {}", e)))
    }

    /// Typed copy of the block
    pub fn typed<T: Voxel>(&self) -> Result<Array4<T>> {
        if T::DATA_TYPE != self.dtype {
            return Err(BossError::validation_with(
                ErrorCode::DatatypeDoesNotMatch,
                format!("Expected {} data, found {}", T::DATA_TYPE, self.dtype),
            ));
        }
        let values = bytes_to_voxels::<T>(&self.data)?;
        let [t, z, y, x] = self.shape;
        Array4::from_shape_vec((t, z, y, x), values)
            .map_err(|e| BossError::Internal(format!("voxel block shape: {}", e)))
    }

    /// Copy a region of `src` into this block
    ///
    /// Regions are given per axis as `[x, y, z]` voxel ranges of equal extent in both
    /// blocks; `t_dst` and `t_src` select the time sample.
    pub fn copy_region(
        &mut self,
        t_dst: usize,
        dst: &[Range<usize>; 3],
        src: &VoxelBlock,
        t_src: usize,
        from: &[Range<usize>; 3],
    ) -> Result<()> {
        if src.dtype != self.dtype {
            return Err(BossError::validation_with(
                ErrorCode::DatatypeDoesNotMatch,
                format!("Cannot copy {} voxels into a {} block", src.dtype, self.dtype),
            ));
        }
        if dst.iter().zip(from.iter()).any(|(d, f)| d.len() != f.len()) {
            return Err(BossError::validation_with(
                ErrorCode::DataDimensionMismatch,
                "Source and destination regions differ in extent",
            ));
        }
        let width = self.dtype.size_in_bytes();
        let source = src.view()?;
        let source = source.slice(s![
            t_src,
            from[2].clone(),
            from[1].clone(),
            from[0].start * width..from[0].end * width
        ]);
        let mut target = self.view_mut()?;
        target
            .slice_mut(s![
                t_dst,
                dst[2].clone(),
                dst[1].clone(),
                dst[0].start * width..dst[0].end * width
            ])
            .assign(&source);
        Ok(())
    }

    fn labels(&self) -> impl Iterator<Item = u64> + '_ {
        let width = self.dtype.size_in_bytes();
        self.data.chunks_exact(width).map(move |chunk| {
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(chunk);
            u64::from_le_bytes(buf)
        })
    }

    /// Sorted set of non-zero labels
    pub fn unique_labels(&self) -> BTreeSet<u64> {
        self.labels().filter(|v| *v != 0).collect()
    }

    /// Zero every voxel whose label is not in `keep`
    pub fn filter_ids(&mut self, keep: &HashSet<u64>) {
        let width = self.dtype.size_in_bytes();
        for chunk in self.data.chunks_exact_mut(width) {
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(chunk);
            if !keep.contains(&u64::from_le_bytes(buf)) {
                chunk.fill(0);
            }
        }
    }

    /// Voxel-space bounds `[x, y, z]` of `id` within time sample `t`
    pub fn bounds_of(&self, t: usize, id: u64) -> Option<[Range<usize>; 3]> {
        let [_, nz, ny, nx] = self.shape;
        let per_t = nz * ny * nx;
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut found = false;
        for (i, label) in self.labels().skip(t * per_t).take(per_t).enumerate() {
            if label != id {
                continue;
            }
            found = true;
            let coord = [i % nx, (i / nx) % ny, i / (nx * ny)];
            for axis in 0..3 {
                lo[axis] = lo[axis].min(coord[axis]);
                hi[axis] = hi[axis].max(coord[axis] + 1);
            }
        }
        found.then(|| [lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]])
    }
}
