//! Cutout read/write path
//!
//! A cutout is an axis-aligned box at one resolution over a range of time samples. Reads
//! carve the box out of every covering cuboid; writes overlay it, doing a
//! read-modify-write under the cuboid's advisory lock when a cuboid is only partly
//! covered.

use crate::context::CoreContext;
use crate::cuboid::VoxelBlock;
use crate::directory::ResourceDescriptor;
use crate::downsample;
use crate::error::{BossError, ErrorCode, Result};
use crate::executor::CancelToken;
use crate::keys::CuboidKey;
use crate::layout::CubeSpan;
use crate::store::TieredStore;
use crate::types::{AccessMode, Box3D};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Region addressed by a cutout, in the channel's world coordinates at `res`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cutout {
    pub res: u32,
    pub bbox: Box3D,
    pub t: Range<u64>,
    pub iso: bool,
}

impl Cutout {
    pub fn new(res: u32, bbox: Box3D) -> Self {
        Self {
            res,
            bbox,
            t: 0..1,
            iso: false,
        }
    }

    pub fn with_time(mut self, t: Range<u64>) -> Self {
        self.t = t;
        self
    }

    pub fn with_iso(mut self, iso: bool) -> Self {
        self.iso = iso;
        self
    }

    /// `(t, z, y, x)` shape of the voxel block this cutout reads or writes
    pub fn shape(&self) -> [usize; 4] {
        let [x, y, z] = self.bbox.extent();
        [
            (self.t.end - self.t.start) as usize,
            z as usize,
            y as usize,
            x as usize,
        ]
    }
}

fn invalid_args(message: impl Into<String>) -> BossError {
    BossError::validation_with(ErrorCode::InvalidCutoutArgs, message)
}

#[derive(Clone)]
pub struct CutoutEngine {
    store: TieredStore,
}

impl CutoutEngine {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            store: TieredStore::new(ctx),
        }
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    fn ctx(&self) -> &Arc<CoreContext> {
        self.store.context()
    }

    /// Check a cutout against the channel and translate it into cuboid-index space
    fn prepare(&self, resource: &ResourceDescriptor, cutout: &Cutout) -> Result<Box3D> {
        let hierarchy = resource.hierarchy();
        if cutout.res >= hierarchy.num_levels {
            return Err(invalid_args(format!(
                "Resolution {} is out of range; the channel has {} levels",
                cutout.res, hierarchy.num_levels
            )));
        }
        hierarchy.check_iso(cutout.res, cutout.iso)?;
        cutout.bbox.validate()?;
        if cutout.t.end <= cutout.t.start {
            return Err(invalid_args("Time range must not be empty"));
        }
        if cutout.t.end > resource.experiment.num_time_samples {
            return Err(invalid_args(format!(
                "Time range {}:{} exceeds the {} time samples of the experiment",
                cutout.t.start, cutout.t.end, resource.experiment.num_time_samples
            )));
        }

        let frame = hierarchy.frame_box(&resource.frame, cutout.res, cutout.iso);
        let b = &cutout.bbox;
        let within = |r: &Range<u64>, f: &Range<u64>| r.start >= f.start && r.end <= f.end;
        if !(within(&b.x, &frame.x) && within(&b.y, &frame.y) && within(&b.z, &frame.z)) {
            return Err(invalid_args(format!(
                "Cutout {:?} lies outside the coordinate frame {:?} at resolution {}",
                b, frame, cutout.res
            )));
        }

        let bytes = cutout.bbox.num_voxels()
            * (cutout.t.end - cutout.t.start)
            * resource.dtype().size_in_bytes() as u64;
        if bytes > self.ctx().config.cutout.max_uncompressed_bytes {
            return Err(BossError::RequestTooLarge(format!(
                "Cutout is {} uncompressed; the limit is {}",
                crate::utils::format_bytes(bytes),
                crate::utils::format_bytes(self.ctx().config.cutout.max_uncompressed_bytes)
            )));
        }

        // cuboids are indexed from the frame origin
        Ok(Box3D {
            x: b.x.start - frame.x.start..b.x.end - frame.x.start,
            y: b.y.start - frame.y.start..b.y.end - frame.y.start,
            z: b.z.start - frame.z.start..b.z.end - frame.z.start,
        })
    }

    fn cube_key(&self, resource: &ResourceDescriptor, cutout: &Cutout, span: &CubeSpan, t: u64) -> CuboidKey {
        let iso = resource
            .hierarchy()
            .uses_iso_namespace(cutout.res, cutout.iso);
        CuboidKey::new(resource.lookup, cutout.res, span.cube, t).with_iso(iso)
    }

    /// Read a cutout, optionally keeping only the labels in `filter_ids`
    pub async fn read(
        &self,
        resource: &ResourceDescriptor,
        cutout: &Cutout,
        mode: AccessMode,
        filter_ids: Option<&[u64]>,
    ) -> Result<VoxelBlock> {
        if filter_ids.is_some() && !resource.is_annotation() {
            return Err(invalid_args("filter is only supported on annotation channels"));
        }
        let local = self.prepare(resource, cutout)?;
        let deadline = Duration::from_millis(self.ctx().config.cutout.read_deadline_ms);
        let token = CancelToken::new();
        let mut block =
            match tokio::time::timeout(deadline, self.assemble(resource, cutout, &local, mode, &token))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    token.cancel();
                    warn!(resource = %resource.boss_key(), "cutout read exceeded its deadline");
                    return Err(BossError::Timeout(format!(
                        "cutout read did not finish within {} ms",
                        deadline.as_millis()
                    )));
                }
            };
        if let Some(ids) = filter_ids {
            let keep: HashSet<u64> = ids.iter().copied().collect();
            block.filter_ids(&keep);
        }
        Ok(block)
    }

    async fn assemble(
        &self,
        resource: &ResourceDescriptor,
        cutout: &Cutout,
        local: &Box3D,
        mode: AccessMode,
        token: &CancelToken,
    ) -> Result<VoxelBlock> {
        let dtype = resource.dtype();
        let spans = self.ctx().config.cuboid.cube_size.covering_spans(local);
        let mut out = VoxelBlock::zeros(dtype, cutout.shape());
        for (t_idx, t) in cutout.t.clone().enumerate() {
            let keys: Vec<CuboidKey> = spans
                .iter()
                .map(|span| self.cube_key(resource, cutout, span, t))
                .collect();
            let payloads = self.store.get_cubes(resource, &keys, mode, token).await?;
            for (span, payload) in spans.iter().zip(payloads) {
                let Some(payload) = payload else { continue };
                let cube = self.store.decode_cube(dtype, &payload)?;
                out.copy_region(t_idx, &span.in_request, &cube, 0, &span.in_cube)?;
            }
        }
        debug!(
            resource = %resource.boss_key(),
            res = cutout.res,
            cuboids = spans.len() * cutout.t.clone().count(),
            "cutout read"
        );
        Ok(out)
    }

    /// Write a cutout; `data` must have the cutout's shape and the channel's data type
    pub async fn write(
        &self,
        resource: &ResourceDescriptor,
        cutout: &Cutout,
        data: &VoxelBlock,
    ) -> Result<()> {
        let dtype = resource.dtype();
        if data.dtype() != dtype {
            return Err(BossError::validation_with(
                ErrorCode::DatatypeDoesNotMatch,
                format!("Datatype does not match channel: expected {}, got {}", dtype, data.dtype()),
            ));
        }
        if data.shape() != cutout.shape() {
            return Err(BossError::validation_with(
                ErrorCode::DataDimensionMismatch,
                format!(
                    "Data dimensions {:?} do not match the cutout {:?}",
                    data.shape(),
                    cutout.shape()
                ),
            ));
        }
        let local = self.prepare(resource, cutout)?;
        let cube_size = self.ctx().config.cuboid.cube_size;
        let spans = cube_size.covering_spans(&local);

        for (t_idx, t) in cutout.t.clone().enumerate() {
            for span in &spans {
                let key = self.cube_key(resource, cutout, span, t);
                let lock = self.store.lock(&key).await?;
                let mut cube = if span.full {
                    VoxelBlock::zero_cube(dtype, &cube_size)
                } else {
                    self.store
                        .read_cube(&key, dtype, AccessMode::Cache)
                        .await?
                        .unwrap_or_else(|| VoxelBlock::zero_cube(dtype, &cube_size))
                };
                cube.copy_region(0, &span.in_cube, data, t_idx, &span.in_request)?;
                let payload = self.store.encode_cube(&cube)?;
                self.store
                    .put_locked(&lock, &key, payload, resource.is_annotation())
                    .await?;
            }
        }
        debug!(
            resource = %resource.boss_key(),
            res = cutout.res,
            cuboids = spans.len() * cutout.t.clone().count(),
            "cutout written"
        );

        if cutout.res == 0 {
            downsample::invalidate(self.ctx(), resource).await?;
        }
        Ok(())
    }
}
