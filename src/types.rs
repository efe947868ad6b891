//! Core data types for the cuboid store

use crate::error::{BossError, Result};
use num_traits::{PrimInt, Unsigned};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Voxel scalar types a channel may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    #[serde(rename = "uint8")]
    U8 = 1,
    /// Unsigned 16-bit integer
    #[serde(rename = "uint16")]
    U16 = 2,
    /// Unsigned 32-bit integer
    #[serde(rename = "uint32")]
    U32 = 3,
    /// Unsigned 64-bit integer (annotation labels)
    #[serde(rename = "uint64")]
    U64 = 4,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::U64 => 8,
        }
    }

    pub fn bit_depth(&self) -> usize {
        self.size_in_bytes() * 8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(DataType::U8),
            "uint16" | "u16" => Ok(DataType::U16),
            "uint32" | "u32" => Ok(DataType::U32),
            "uint64" | "u64" => Ok(DataType::U64),
            other => Err(BossError::validation(format!(
                "Unsupported data type: {}",
                other
            ))),
        }
    }
}

/// Unsigned scalar stored in a cuboid, read and written little-endian
pub trait Voxel: PrimInt + Unsigned + Default + Send + Sync + fmt::Debug + 'static {
    const DATA_TYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_voxel {
    ($t:ty, $dt:expr) => {
        impl Voxel for $t {
            const DATA_TYPE: DataType = $dt;

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }

            fn write_le(self, out: &mut [u8]) {
                out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_voxel!(u8, DataType::U8);
impl_voxel!(u16, DataType::U16);
impl_voxel!(u32, DataType::U32);
impl_voxel!(u64, DataType::U64);

/// Channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Image,
    Annotation,
}

/// Downsample status tracked on the channel row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownsampleStatus {
    NotDownsampled,
    Queued,
    InProgress,
    Downsampled,
    Failed,
}

impl DownsampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownsampleStatus::NotDownsampled => "NOT_DOWNSAMPLED",
            DownsampleStatus::Queued => "QUEUED",
            DownsampleStatus::InProgress => "IN_PROGRESS",
            DownsampleStatus::Downsampled => "DOWNSAMPLED",
            DownsampleStatus::Failed => "FAILED",
        }
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        matches!(self, DownsampleStatus::Queued | DownsampleStatus::InProgress)
    }
}

impl fmt::Display for DownsampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How successive resolutions relate geometrically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyMethod {
    /// 2x2x1 per level
    Slice,
    /// 2x2x2 per level
    Iso,
    /// Anisotropic until the isotropic level, then isotropic
    NearIso,
}

impl FromStr for HierarchyMethod {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slice" | "anisotropic" => Ok(HierarchyMethod::Slice),
            "iso" | "isotropic" => Ok(HierarchyMethod::Iso),
            "near_iso" => Ok(HierarchyMethod::NearIso),
            other => Err(BossError::validation(format!(
                "Unknown hierarchy method: {}",
                other
            ))),
        }
    }
}

/// Where a cutout read is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Read through the tier-1 overlay
    #[default]
    Cache,
    /// Bypass tier 1 on read but populate it afterwards
    NoCache,
    /// Read from the blob store only; never populate tier 1
    Raw,
}

impl FromStr for AccessMode {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cache" => Ok(AccessMode::Cache),
            "no_cache" => Ok(AccessMode::NoCache),
            "raw" => Ok(AccessMode::Raw),
            other => Err(BossError::validation(format!(
                "Invalid access-mode: {}. Valid options are cache, no_cache or raw",
                other
            ))),
        }
    }
}

/// Axis-aligned half-open voxel box `[x0,x1) x [y0,y1) x [z0,z1)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Box3D {
    pub x: Range<u64>,
    pub y: Range<u64>,
    pub z: Range<u64>,
}

impl Box3D {
    pub fn new(x: Range<u64>, y: Range<u64>, z: Range<u64>) -> Result<Self> {
        let b = Self { x, y, z };
        b.validate()?;
        Ok(b)
    }

    /// Box from a corner and extent
    pub fn from_corner(corner: [u64; 3], extent: [u64; 3]) -> Result<Self> {
        Self::new(
            corner[0]..corner[0] + extent[0],
            corner[1]..corner[1] + extent[1],
            corner[2]..corner[2] + extent[2],
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.x.start >= self.x.end || self.y.start >= self.y.end || self.z.start >= self.z.end {
            return Err(BossError::validation_with(
                crate::error::ErrorCode::InvalidCutoutArgs,
                "Range start must be less than range stop on every axis",
            ));
        }
        Ok(())
    }

    pub fn corner(&self) -> [u64; 3] {
        [self.x.start, self.y.start, self.z.start]
    }

    pub fn extent(&self) -> [u64; 3] {
        [
            self.x.end - self.x.start,
            self.y.end - self.y.start,
            self.z.end - self.z.start,
        ]
    }

    pub fn num_voxels(&self) -> u64 {
        self.extent().iter().product()
    }

    /// Smallest box containing both
    pub fn union(&self, other: &Box3D) -> Box3D {
        Box3D {
            x: self.x.start.min(other.x.start)..self.x.end.max(other.x.end),
            y: self.y.start.min(other.y.start)..self.y.end.max(other.y.end),
            z: self.z.start.min(other.z.start)..self.z.end.max(other.z.end),
        }
    }

    /// Overlap of two boxes, if any
    pub fn intersection(&self, other: &Box3D) -> Option<Box3D> {
        let x = self.x.start.max(other.x.start)..self.x.end.min(other.x.end);
        let y = self.y.start.max(other.y.start)..self.y.end.min(other.y.end);
        let z = self.z.start.max(other.z.start)..self.z.end.min(other.z.end);
        if x.start < x.end && y.start < y.end && z.start < z.end {
            Some(Box3D { x, y, z })
        } else {
            None
        }
    }
}

/// Bounding box answer for an annotation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_range: [u64; 2],
    pub y_range: [u64; 2],
    pub z_range: [u64; 2],
    pub t_range: [u64; 2],
}

impl BoundingBox {
    pub fn from_box(b: &Box3D, t: Range<u64>) -> Self {
        Self {
            x_range: [b.x.start, b.x.end],
            y_range: [b.y.start, b.y.end],
            z_range: [b.z.start, b.z.end],
            t_range: [t.start, t.end],
        }
    }
}

/// Kind of bounding box computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundingBoxKind {
    Loose,
    Tight,
}

impl FromStr for BoundingBoxKind {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loose" => Ok(BoundingBoxKind::Loose),
            "tight" => Ok(BoundingBoxKind::Tight),
            other => Err(BossError::validation(format!(
                "Invalid option for bounding box type {}. The valid options are : loose or tight",
                other
            ))),
        }
    }
}
