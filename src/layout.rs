//! Cuboid layout - how a channel's volume is divided into fixed-size cuboids,
//! and how the resolution hierarchy scales it

use crate::error::{BossError, ErrorCode, Result};
use crate::types::{Box3D, HierarchyMethod};
use crate::utils::ceil_div;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Size of a cuboid in voxels along X, Y, Z
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeSize {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl CubeSize {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    /// Voxels in one time sample of a cuboid
    pub fn voxels(&self) -> u64 {
        self.x * self.y * self.z
    }

    /// C-ordered shape `(z, y, x)`
    pub fn shape_zyx(&self) -> (usize, usize, usize) {
        (self.z as usize, self.y as usize, self.x as usize)
    }

    /// Cube index of a voxel
    pub fn cube_of(&self, x: u64, y: u64, z: u64) -> [u64; 3] {
        [x / self.x, y / self.y, z / self.z]
    }

    /// Voxel box covered by a cube
    pub fn cube_box(&self, cube: [u64; 3]) -> Box3D {
        Box3D {
            x: cube[0] * self.x..(cube[0] + 1) * self.x,
            y: cube[1] * self.y..(cube[1] + 1) * self.y,
            z: cube[2] * self.z..(cube[2] + 1) * self.z,
        }
    }

    /// Cube index range along each axis covering a box
    pub fn cube_ranges(&self, b: &Box3D) -> [Range<u64>; 3] {
        [
            b.x.start / self.x..ceil_div(b.x.end, self.x),
            b.y.start / self.y..ceil_div(b.y.end, self.y),
            b.z.start / self.z..ceil_div(b.z.end, self.z),
        ]
    }

    /// Covering set of a box: every cube it touches, with the overlap expressed
    /// both in cube-local and request-local coordinates
    pub fn covering_spans(&self, b: &Box3D) -> Vec<CubeSpan> {
        let [rx, ry, rz] = self.cube_ranges(b);
        let mut spans = Vec::new();
        for cz in rz.clone() {
            for cy in ry.clone() {
                for cx in rx.clone() {
                    let cube = [cx, cy, cz];
                    let cube_box = self.cube_box(cube);
                    if let Some(overlap) = cube_box.intersection(b) {
                        spans.push(CubeSpan::new(cube, &cube_box, b, &overlap));
                    }
                }
            }
        }
        spans
    }
}

impl Default for CubeSize {
    fn default() -> Self {
        Self::new(512, 512, 16)
    }
}

/// Intersection of one cube with a request box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeSpan {
    /// Cube index `(cx, cy, cz)`
    pub cube: [u64; 3],
    /// Overlap in cube-local voxel coordinates, per axis x, y, z
    pub in_cube: [Range<usize>; 3],
    /// Overlap in request-local voxel coordinates, per axis x, y, z
    pub in_request: [Range<usize>; 3],
    /// Whether the request covers the whole cube
    pub full: bool,
}

impl CubeSpan {
    fn new(cube: [u64; 3], cube_box: &Box3D, request: &Box3D, overlap: &Box3D) -> Self {
        let local = |r: &Range<u64>, origin: u64| (r.start - origin) as usize..(r.end - origin) as usize;
        let in_cube = [
            local(&overlap.x, cube_box.x.start),
            local(&overlap.y, cube_box.y.start),
            local(&overlap.z, cube_box.z.start),
        ];
        let in_request = [
            local(&overlap.x, request.x.start),
            local(&overlap.y, request.y.start),
            local(&overlap.z, request.z.start),
        ];
        Self {
            cube,
            in_cube,
            in_request,
            full: overlap == cube_box,
        }
    }
}

/// Coordinate frame of an experiment at base resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateFrame {
    pub x_start: u64,
    pub x_stop: u64,
    pub y_start: u64,
    pub y_stop: u64,
    pub z_start: u64,
    pub z_stop: u64,
    pub x_voxel_size: f64,
    pub y_voxel_size: f64,
    pub z_voxel_size: f64,
    pub voxel_unit: String,
    pub time_step: Option<f64>,
}

impl CoordinateFrame {
    pub fn new(x: Range<u64>, y: Range<u64>, z: Range<u64>, voxel_size: [f64; 3]) -> Result<Self> {
        let frame = Self {
            x_start: x.start,
            x_stop: x.end,
            y_start: y.start,
            y_stop: y.end,
            z_start: z.start,
            z_stop: z.end,
            x_voxel_size: voxel_size[0],
            y_voxel_size: voxel_size[1],
            z_voxel_size: voxel_size[2],
            voxel_unit: "nanometers".to_string(),
            time_step: None,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<()> {
        if self.x_stop <= self.x_start || self.y_stop <= self.y_start || self.z_stop <= self.z_start
        {
            return Err(BossError::validation(
                "Coordinate frame stop must be greater than start on all axes",
            ));
        }
        if !(self.x_voxel_size > 0.0 && self.y_voxel_size > 0.0 && self.z_voxel_size > 0.0) {
            return Err(BossError::validation("Voxel sizes must be positive"));
        }
        Ok(())
    }

    pub fn base_box(&self) -> Box3D {
        Box3D {
            x: self.x_start..self.x_stop,
            y: self.y_start..self.y_stop,
            z: self.z_start..self.z_stop,
        }
    }

    pub fn voxel_size(&self) -> [f64; 3] {
        [self.x_voxel_size, self.y_voxel_size, self.z_voxel_size]
    }
}

/// Per-level scale factors of a channel's resolution hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub method: HierarchyMethod,
    pub num_levels: u32,
    /// Resolution at which voxel sizes along all axes become equal
    pub iso_level: u32,
}

impl Hierarchy {
    pub fn new(method: HierarchyMethod, num_levels: u32, frame: &CoordinateFrame) -> Self {
        let iso_level = isotropic_level(method, num_levels, frame);
        Self {
            method,
            num_levels,
            iso_level,
        }
    }

    /// Cumulative scale factor `(sx, sy, sz)` from base resolution to `res`
    pub fn scale(&self, res: u32, iso: bool) -> [u64; 3] {
        let xy = 1u64 << res;
        let z = match self.method {
            HierarchyMethod::Slice => 1,
            HierarchyMethod::Iso => xy,
            HierarchyMethod::NearIso => {
                if iso && res > self.iso_level {
                    1u64 << (res - self.iso_level)
                } else {
                    1
                }
            }
        };
        [xy, xy, z]
    }

    /// Aggregation step from `res` to `res + 1`
    pub fn step(&self, res: u32, iso: bool) -> [u64; 3] {
        let here = self.scale(res, iso);
        let next = self.scale(res + 1, iso);
        [next[0] / here[0], next[1] / here[1], next[2] / here[2]]
    }

    /// Whether `iso=true` is a meaningful request at `res`
    pub fn check_iso(&self, res: u32, iso: bool) -> Result<()> {
        if iso && self.method == HierarchyMethod::NearIso && res < self.iso_level {
            return Err(BossError::validation_with(
                ErrorCode::InvalidCutoutArgs,
                format!(
                    "iso=true is only valid at or above the isotropic level {}",
                    self.iso_level
                ),
            ));
        }
        Ok(())
    }

    /// Whether a key at `res` lives in the isotropic namespace
    pub fn uses_iso_namespace(&self, res: u32, iso: bool) -> bool {
        iso && self.method == HierarchyMethod::NearIso && res > self.iso_level
    }

    /// Voxel size at `res`
    pub fn voxel_size(&self, frame: &CoordinateFrame, res: u32, iso: bool) -> [f64; 3] {
        let s = self.scale(res, iso);
        [
            frame.x_voxel_size * s[0] as f64,
            frame.y_voxel_size * s[1] as f64,
            frame.z_voxel_size * s[2] as f64,
        ]
    }

    /// Frame box expressed at `res`
    pub fn frame_box(&self, frame: &CoordinateFrame, res: u32, iso: bool) -> Box3D {
        let s = self.scale(res, iso);
        Box3D {
            x: frame.x_start / s[0]..ceil_div(frame.x_stop, s[0]),
            y: frame.y_start / s[1]..ceil_div(frame.y_stop, s[1]),
            z: frame.z_start / s[2]..ceil_div(frame.z_stop, s[2]),
        }
    }

    /// Extent `(x, y, z)` of the frame at `res`
    pub fn extent(&self, frame: &CoordinateFrame, res: u32, iso: bool) -> [u64; 3] {
        self.frame_box(frame, res, iso).extent()
    }
}

fn isotropic_level(method: HierarchyMethod, num_levels: u32, frame: &CoordinateFrame) -> u32 {
    if method == HierarchyMethod::Iso {
        return 0;
    }
    let max_level = num_levels.saturating_sub(1);
    (0..=max_level)
        .find(|res| frame.x_voxel_size * (1u64 << res) as f64 >= frame.z_voxel_size)
        .unwrap_or(max_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> CoordinateFrame {
        CoordinateFrame::new(0..2048, 0..2048, 0..64, [4.0, 4.0, 35.0]).unwrap()
    }

    #[test]
    fn test_cube_of() {
        let cube = CubeSize::default();
        assert_eq!(cube.cube_of(0, 0, 0), [0, 0, 0]);
        assert_eq!(cube.cube_of(511, 512, 16), [0, 1, 1]);
        assert_eq!(cube.cube_box([1, 0, 2]).x, 512..1024);
    }

    #[test]
    fn test_covering_spans_aligned() {
        let cube = CubeSize::default();
        let request = Box3D::new(0..128, 0..128, 0..16).unwrap();
        let spans = cube.covering_spans(&request);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].cube, [0, 0, 0]);
        assert_eq!(spans[0].in_cube, [0..128, 0..128, 0..16]);
        assert!(!spans[0].full);
    }

    #[test]
    fn test_covering_spans_straddle() {
        let cube = CubeSize::default();
        let request = Box3D::new(0..516, 0..516, 0..18).unwrap();
        let spans = cube.covering_spans(&request);
        assert_eq!(spans.len(), 2 * 2 * 2);

        let last = spans.last().unwrap();
        assert_eq!(last.cube, [1, 1, 1]);
        assert_eq!(last.in_cube, [0..4, 0..4, 0..2]);
        assert_eq!(last.in_request, [512..516, 512..516, 16..18]);

        let first = &spans[0];
        assert!(first.full);
    }

    #[test]
    fn test_covering_spans_offset() {
        let cube = CubeSize::new(10, 10, 10);
        let request = Box3D::new(5..15, 0..10, 0..10).unwrap();
        let spans = cube.covering_spans(&request);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].in_cube[0], 5..10);
        assert_eq!(spans[0].in_request[0], 0..5);
        assert_eq!(spans[1].in_cube[0], 0..5);
        assert_eq!(spans[1].in_request[0], 5..10);
    }

    #[test]
    fn test_frame_validation() {
        assert!(CoordinateFrame::new(10..10, 0..1, 0..1, [1.0, 1.0, 1.0]).is_err());
        assert!(CoordinateFrame::new(0..10, 0..1, 0..1, [1.0, 0.0, 1.0]).is_err());
    }

    #[test]
    fn test_isotropic_level() {
        let h = Hierarchy::new(HierarchyMethod::NearIso, 6, &frame());
        // 4 * 2^3 = 32 < 35, 4 * 2^4 = 64 >= 35
        assert_eq!(h.iso_level, 4);

        let h = Hierarchy::new(HierarchyMethod::Iso, 6, &frame());
        assert_eq!(h.iso_level, 0);
    }

    #[test]
    fn test_slice_scaling() {
        let h = Hierarchy::new(HierarchyMethod::Slice, 4, &frame());
        assert_eq!(h.step(0, false), [2, 2, 1]);
        assert_eq!(h.extent(&frame(), 2, false), [512, 512, 64]);
        assert_eq!(h.voxel_size(&frame(), 1, false), [8.0, 8.0, 35.0]);
    }

    #[test]
    fn test_iso_scaling() {
        let h = Hierarchy::new(HierarchyMethod::Iso, 4, &frame());
        assert_eq!(h.step(0, false), [2, 2, 2]);
        assert_eq!(h.extent(&frame(), 1, false), [1024, 1024, 32]);
    }

    #[test]
    fn test_near_iso_tracks() {
        let h = Hierarchy::new(HierarchyMethod::NearIso, 7, &frame());
        assert_eq!(h.step(3, true), [2, 2, 1]);
        assert_eq!(h.step(4, true), [2, 2, 2]);
        assert_eq!(h.step(4, false), [2, 2, 1]);
        assert_eq!(h.extent(&frame(), 5, true), [64, 64, 32]);
        assert!(h.check_iso(2, true).is_err());
        assert!(h.check_iso(4, true).is_ok());
        assert!(!h.uses_iso_namespace(4, true));
        assert!(h.uses_iso_namespace(5, true));
    }
}
