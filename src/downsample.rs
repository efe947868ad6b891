//! Downsample pipeline
//!
//! Starting a downsample moves the channel to QUEUED and places a job on the downsample
//! queue. A single coordinator pulls jobs, moves the channel to IN_PROGRESS and builds
//! each coarser level from the one below it, writing through the tiered store so every
//! output cuboid is persisted with a fresh version. Base-resolution writes and explicit
//! cancels stop a running coordinator at its next cuboid.

use crate::context::{CoreContext, DOWNSAMPLE_QUEUE};
use crate::cuboid::VoxelBlock;
use crate::directory::{Principal, ResourceDescriptor};
use crate::error::{BossError, Result};
use crate::executor::{CancelToken, ExecutionState, OrderedExecutor};
use crate::keys::{CuboidKey, LookupKey};
use crate::layout::Hierarchy;
use crate::store::TieredStore;
use crate::throttle::{MetricType, MetricUnits, ThrottleEngine};
use crate::types::{AccessMode, Box3D, DataType, DownsampleStatus, Voxel};
use crate::utils::ceil_div;
use chrono::{DateTime, Utc};
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const COORDINATOR_WORKER: &str = "downsample-coordinator";

/// Body of a downsample queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampleJob {
    pub channel_id: u64,
    pub lookup: LookupKey,
    /// Base-resolution region to downsample, in frame coordinates
    pub frame: Box3D,
    pub queued_at: DateTime<Utc>,
}

/// Answer to a downsample status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampleInfo {
    pub status: DownsampleStatus,
    pub num_hierarchy_levels: u32,
    pub voxel_size: BTreeMap<String, [f64; 3]>,
    pub extent: BTreeMap<String, [u64; 3]>,
    pub cuboid_size: BTreeMap<String, [u64; 3]>,
}

/// Mean of a window, truncated
fn mean<T: Voxel>(values: impl Iterator<Item = T>) -> T {
    let (sum, n) = values.fold((0u128, 0u128), |(sum, n), v| {
        (sum + v.to_u128().unwrap_or(0), n + 1)
    });
    if n == 0 {
        return T::zero();
    }
    num_traits::cast(sum / n).unwrap_or_else(T::zero)
}

/// Most frequent non-zero label; ties go to the smallest label
fn mode<T: Voxel>(values: impl Iterator<Item = T>) -> T {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for v in values.filter(|v| !v.is_zero()) {
        *counts.entry(v).or_default() += 1;
    }
    let mut best = (T::zero(), 0);
    for (label, count) in counts {
        if count > best.1 {
            best = (label, count);
        }
    }
    best.0
}

fn reduce_typed<T: Voxel>(src: &Array4<T>, step: [usize; 3], annotation: bool) -> Array4<T> {
    let [sx, sy, sz] = step;
    let (_, nz, ny, nx) = src.dim();
    Array4::from_shape_fn((1, nz / sz, ny / sy, nx / sx), |(_, z, y, x)| {
        let window = src.slice(s![
            0,
            z * sz..(z + 1) * sz,
            y * sy..(y + 1) * sy,
            x * sx..(x + 1) * sx
        ]);
        if annotation {
            mode(window.iter().copied())
        } else {
            mean(window.iter().copied())
        }
    })
}

/// Shrink a block by `step` along x, y, z: mean for images, mode for annotations
pub fn reduce(block: &VoxelBlock, step: [u64; 3], annotation: bool) -> Result<VoxelBlock> {
    let step = step.map(|s| s as usize);
    Ok(match block.dtype() {
        DataType::U8 => VoxelBlock::from_typed(&reduce_typed(&block.typed::<u8>()?, step, annotation)),
        DataType::U16 => VoxelBlock::from_typed(&reduce_typed(&block.typed::<u16>()?, step, annotation)),
        DataType::U32 => VoxelBlock::from_typed(&reduce_typed(&block.typed::<u32>()?, step, annotation)),
        DataType::U64 => VoxelBlock::from_typed(&reduce_typed(&block.typed::<u64>()?, step, annotation)),
    })
}

/// Region of `frame` at `res`, in cuboid-index space of that level
fn local_region(resource: &ResourceDescriptor, frame: &Box3D, res: u32, iso: bool) -> Option<Box3D> {
    let hierarchy = resource.hierarchy();
    let scale = hierarchy.scale(res, iso);
    let bounds = hierarchy.frame_box(&resource.frame, res, iso);
    let scaled = Box3D {
        x: frame.x.start / scale[0]..ceil_div(frame.x.end, scale[0]),
        y: frame.y.start / scale[1]..ceil_div(frame.y.end, scale[1]),
        z: frame.z.start / scale[2]..ceil_div(frame.z.end, scale[2]),
    };
    let b = scaled.intersection(&bounds)?;
    Some(Box3D {
        x: b.x.start - bounds.x.start..b.x.end - bounds.x.start,
        y: b.y.start - bounds.y.start..b.y.end - bounds.y.start,
        z: b.z.start - bounds.z.start..b.z.end - bounds.z.start,
    })
}

/// Return a channel to NOT_DOWNSAMPLED after its base resolution changed, stopping any
/// running coordinator
pub async fn invalidate(ctx: &Arc<CoreContext>, resource: &ResourceDescriptor) -> Result<()> {
    let current = ctx.directory.resolve(&resource.lookup).await?;
    let status = current.channel.downsample_status;
    if status == DownsampleStatus::NotDownsampled {
        return Ok(());
    }
    if let Some(arn) = &current.channel.downsample_arn {
        ctx.executions.cancel(arn);
    }
    ctx.directory
        .cas_downsample_status(current.channel.id, status, DownsampleStatus::NotDownsampled)
        .await?;
    ctx.directory
        .update_downsample_arn(current.channel.id, None)
        .await?;
    info!(resource = %resource.boss_key(), previous = %status, "downsample invalidated by base write");
    Ok(())
}

#[derive(Clone)]
pub struct DownsampleManager {
    store: TieredStore,
}

impl DownsampleManager {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            store: TieredStore::new(ctx),
        }
    }

    fn ctx(&self) -> &Arc<CoreContext> {
        self.store.context()
    }

    fn visibility(&self) -> Duration {
        Duration::from_secs(self.ctx().config.downsample.queue_visibility_secs)
    }

    async fn refresh(&self, resource: &ResourceDescriptor) -> Result<ResourceDescriptor> {
        self.ctx().directory.resolve(&resource.lookup).await
    }

    /// Current status with per-level geometry; a finished or lost coordinator is
    /// reconciled first
    pub async fn status(&self, resource: &ResourceDescriptor, iso: bool) -> Result<DownsampleInfo> {
        let mut resource = self.refresh(resource).await?;
        if resource.channel.downsample_status == DownsampleStatus::InProgress {
            let state = resource
                .channel
                .downsample_arn
                .as_deref()
                .and_then(|arn| self.ctx().executions.state(arn));
            let next = match state {
                Some(ExecutionState::Succeeded) => Some(DownsampleStatus::Downsampled),
                Some(ExecutionState::Failed) | None => Some(DownsampleStatus::Failed),
                Some(ExecutionState::Running) | Some(ExecutionState::Cancelled) => None,
            };
            if let Some(next) = next {
                let swapped = self
                    .ctx()
                    .directory
                    .cas_downsample_status(resource.channel.id, DownsampleStatus::InProgress, next)
                    .await?;
                if swapped && next == DownsampleStatus::Downsampled {
                    self.store.clear_cached(&resource.lookup).await?;
                }
                info!(resource = %resource.boss_key(), status = %next, "downsample status reconciled");
                resource = self.refresh(&resource).await?;
            }
        }

        let hierarchy = resource.hierarchy();
        let cube = self.ctx().config.cuboid.cube_size;
        let mut info = DownsampleInfo {
            status: resource.channel.downsample_status,
            num_hierarchy_levels: hierarchy.num_levels,
            voxel_size: BTreeMap::new(),
            extent: BTreeMap::new(),
            cuboid_size: BTreeMap::new(),
        };
        for res in 0..hierarchy.num_levels {
            let key = res.to_string();
            info.voxel_size
                .insert(key.clone(), hierarchy.voxel_size(&resource.frame, res, iso));
            info.extent
                .insert(key.clone(), hierarchy.extent(&resource.frame, res, iso));
            info.cuboid_size.insert(key, [cube.x, cube.y, cube.z]);
        }
        Ok(info)
    }

    /// Queue a downsample of `resource`; admins may restrict it to `frame`
    pub async fn start(
        &self,
        resource: &ResourceDescriptor,
        principal: &Principal,
        frame: Option<Box3D>,
    ) -> Result<DownsampleStatus> {
        let resource = self.refresh(resource).await?;
        let status = resource.channel.downsample_status;
        if status.is_active() {
            return Err(BossError::invalid_state(
                status,
                "Channel is already waiting for or undergoing a downsample",
            ));
        }
        if status == DownsampleStatus::Downsampled && !principal.is_admin {
            return Err(BossError::invalid_state(status, "Channel is already downsampled"));
        }
        let frame = match frame {
            Some(frame) if principal.is_admin => {
                frame.validate()?;
                frame
            }
            Some(_) => {
                return Err(BossError::Permission(
                    "Only admins may override the downsample frame".to_string(),
                ))
            }
            None => resource.frame.base_box(),
        };
        let voxels = frame.num_voxels();
        if !principal.is_admin && voxels > self.ctx().config.downsample.downsample_max_size {
            return Err(BossError::RequestTooLarge(format!(
                "Downsample of {} voxels exceeds the limit of {}; ask an admin to start it",
                voxels,
                self.ctx().config.downsample.downsample_max_size
            )));
        }

        let cube = self.ctx().config.cuboid.cube_size;
        let [rx, ry, rz] = cube.cube_ranges(&frame);
        let cuboids = (rx.end - rx.start)
            * (ry.end - ry.start)
            * (rz.end - rz.start)
            * resource.experiment.num_time_samples;
        ThrottleEngine::from_context(self.ctx())
            .check(
                "downsample",
                MetricType::Compute,
                &principal.username,
                cuboids as i64,
                MetricUnits::Cuboids,
            )
            .await?;

        let queued = self
            .ctx()
            .directory
            .cas_downsample_status(resource.channel.id, status, DownsampleStatus::Queued)
            .await?;
        if !queued {
            return Err(BossError::Conflict(format!(
                "Downsample status of {} changed concurrently",
                resource.boss_key()
            )));
        }

        let job = DownsampleJob {
            channel_id: resource.channel.id,
            lookup: resource.lookup,
            frame,
            queued_at: self.ctx().clock.now(),
        };
        let queue = self.ctx().queues.create(DOWNSAMPLE_QUEUE).await?;
        queue.send(serde_json::to_string(&job)?).await?;
        info!(resource = %resource.boss_key(), cuboids, "downsample queued");

        if self.ctx().config.downsample.launch_coordinator {
            self.start_coordinator();
        }
        Ok(DownsampleStatus::Queued)
    }

    /// Launch the coordinator unless one is running; true if launched
    pub fn start_coordinator(&self) -> bool {
        let manager = self.clone();
        let poll = Duration::from_millis(self.ctx().config.downsample.poll_interval_ms);
        self.ctx().ensure_worker(COORDINATOR_WORKER, move |token| async move {
            while !token.is_cancelled() {
                match manager.run_pending().await {
                    Ok(n) if n > 0 => continue,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "downsample coordinator poll failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = token.cancelled() => break,
                }
            }
            debug!("downsample coordinator exiting");
        })
    }

    /// Stop a queued or running downsample
    pub async fn cancel(&self, resource: &ResourceDescriptor) -> Result<()> {
        let resource = self.refresh(resource).await?;
        match resource.channel.downsample_status {
            DownsampleStatus::Queued => {
                let queue = self.ctx().queues.create(DOWNSAMPLE_QUEUE).await?;
                let mut held = Vec::new();
                loop {
                    let batch = queue.receive(10, self.visibility()).await?;
                    if batch.is_empty() {
                        break;
                    }
                    held.extend(batch);
                }
                let mut removed = false;
                for message in held {
                    let ours = serde_json::from_str::<DownsampleJob>(&message.body)
                        .map(|job| job.channel_id == resource.channel.id)
                        .unwrap_or(false);
                    if ours && !removed {
                        queue.delete(&message.receipt).await?;
                        removed = true;
                    } else {
                        queue
                            .change_visibility(&message.receipt, Duration::ZERO)
                            .await?;
                    }
                }
                if !removed {
                    return Err(BossError::Conflict(format!(
                        "No queued downsample job found for {}",
                        resource.boss_key()
                    )));
                }
                self.ctx()
                    .directory
                    .cas_downsample_status(
                        resource.channel.id,
                        DownsampleStatus::Queued,
                        DownsampleStatus::NotDownsampled,
                    )
                    .await?;
            }
            DownsampleStatus::InProgress => {
                if let Some(arn) = &resource.channel.downsample_arn {
                    self.ctx().executions.cancel(arn);
                }
                self.ctx()
                    .directory
                    .cas_downsample_status(
                        resource.channel.id,
                        DownsampleStatus::InProgress,
                        DownsampleStatus::NotDownsampled,
                    )
                    .await?;
                self.ctx()
                    .directory
                    .update_downsample_arn(resource.channel.id, None)
                    .await?;
            }
            other => {
                return Err(BossError::Conflict(format!(
                    "Channel {} has no downsample to cancel ({})",
                    resource.boss_key(),
                    other
                )))
            }
        }
        info!(resource = %resource.boss_key(), "downsample cancelled");
        Ok(())
    }

    /// Run every queued job to completion; returns how many messages were handled
    pub async fn run_pending(&self) -> Result<usize> {
        let queue = self.ctx().queues.create(DOWNSAMPLE_QUEUE).await?;
        let mut handled = 0;
        loop {
            let messages = queue.receive(1, self.visibility()).await?;
            let Some(message) = messages.into_iter().next() else {
                break;
            };
            match serde_json::from_str::<DownsampleJob>(&message.body) {
                Ok(job) => self.run_job(job).await?,
                Err(e) => error!(error = %e, body = %message.body, "dropping malformed downsample job"),
            }
            queue.delete(&message.receipt).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn run_job(&self, job: DownsampleJob) -> Result<()> {
        let ctx = self.ctx();
        let resource = ctx.directory.resolve(&job.lookup).await?;
        if resource.channel.downsample_status != DownsampleStatus::Queued {
            debug!(resource = %resource.boss_key(), "downsample job no longer queued, dropped");
            return Ok(());
        }
        let (arn, token) = ctx.executions.start("downsample");
        ctx.directory
            .update_downsample_arn(resource.channel.id, Some(arn.clone()))
            .await?;
        let started = ctx
            .directory
            .cas_downsample_status(
                resource.channel.id,
                DownsampleStatus::Queued,
                DownsampleStatus::InProgress,
            )
            .await?;
        if !started {
            ctx.executions.finish(&arn, ExecutionState::Cancelled);
            return Ok(());
        }
        info!(resource = %resource.boss_key(), arn = %arn, "downsample started");

        match self.downsample(&resource, &job.frame, &token).await {
            Ok(written) => {
                ctx.executions.finish(&arn, ExecutionState::Succeeded);
                let current = ctx.directory.resolve(&job.lookup).await?;
                if current.channel.downsample_arn.as_deref() == Some(arn.as_str())
                    && ctx
                        .directory
                        .cas_downsample_status(
                            resource.channel.id,
                            DownsampleStatus::InProgress,
                            DownsampleStatus::Downsampled,
                        )
                        .await?
                {
                    self.store.clear_cached(&resource.lookup).await?;
                }
                info!(resource = %resource.boss_key(), cuboids = written, "downsample finished");
            }
            Err(_) if token.is_cancelled() => {
                ctx.executions.finish(&arn, ExecutionState::Cancelled);
                info!(resource = %resource.boss_key(), "downsample stopped after cancel");
            }
            Err(e) => {
                ctx.executions.finish(&arn, ExecutionState::Failed);
                ctx.directory
                    .cas_downsample_status(
                        resource.channel.id,
                        DownsampleStatus::InProgress,
                        DownsampleStatus::Failed,
                    )
                    .await?;
                error!(resource = %resource.boss_key(), error = %e, "downsample failed");
            }
        }
        Ok(())
    }

    /// Build every level above the base resolution; returns the cuboids written
    async fn downsample(
        &self,
        resource: &ResourceDescriptor,
        frame: &Box3D,
        token: &CancelToken,
    ) -> Result<usize> {
        let hierarchy = resource.hierarchy();
        let base = resource.channel.base_resolution;
        let top = hierarchy.num_levels.saturating_sub(1);
        let mut stages: Vec<(u32, bool)> = (base..top).map(|r| (r, false)).collect();
        if hierarchy.method == crate::types::HierarchyMethod::NearIso {
            stages.extend((base.max(hierarchy.iso_level)..top).map(|r| (r, true)));
        }

        let mut written = 0;
        for (res, iso) in stages {
            token.check()?;
            let n = self.stage(resource, &hierarchy, frame, res, iso, token).await?;
            debug!(resource = %resource.boss_key(), res, iso, cuboids = n, "downsample stage done");
            written += n;
        }
        Ok(written)
    }

    /// Build level `res + 1` from level `res`
    async fn stage(
        &self,
        resource: &ResourceDescriptor,
        hierarchy: &Hierarchy,
        frame: &Box3D,
        res: u32,
        iso: bool,
        token: &CancelToken,
    ) -> Result<usize> {
        let Some(target) = local_region(resource, frame, res + 1, iso) else {
            return Ok(0);
        };
        let cube = self.ctx().config.cuboid.cube_size;
        let step = hierarchy.step(res, iso);
        let [rx, ry, rz] = cube.cube_ranges(&target);

        let mut targets = Vec::new();
        for t in 0..resource.experiment.num_time_samples {
            for cz in rz.clone() {
                for cy in ry.clone() {
                    for cx in rx.clone() {
                        targets.push((t, [cx, cy, cz]));
                    }
                }
            }
        }
        let executor = OrderedExecutor::new(self.ctx().config.downsample.fan_out);
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(t, target)| self.build_cube(resource, hierarchy, res, iso, step, target, t))
            .collect();
        let results = executor.run(tasks, token).await?;
        Ok(results.into_iter().filter(|w| *w).count())
    }

    /// Aggregate the source cuboids under one target cuboid; false if all were empty
    #[allow(clippy::too_many_arguments)]
    async fn build_cube(
        &self,
        resource: &ResourceDescriptor,
        hierarchy: &Hierarchy,
        res: u32,
        iso: bool,
        step: [u64; 3],
        target: [u64; 3],
        t: u64,
    ) -> Result<bool> {
        let cube = self.ctx().config.cuboid.cube_size;
        let dtype = resource.dtype();
        let source_iso = hierarchy.uses_iso_namespace(res, iso);
        let (cz, cy, cx) = cube.shape_zyx();
        let [sx, sy, sz] = step.map(|s| s as usize);
        let mut combined = VoxelBlock::zeros(dtype, [1, cz * sz, cy * sy, cx * sx]);
        let mut any = false;
        for dz in 0..sz {
            for dy in 0..sy {
                for dx in 0..sx {
                    let source = [
                        target[0] * step[0] + dx as u64,
                        target[1] * step[1] + dy as u64,
                        target[2] * step[2] + dz as u64,
                    ];
                    let key = CuboidKey::new(resource.lookup, res, source, t).with_iso(source_iso);
                    let Some(block) = self.store.read_cube(&key, dtype, AccessMode::Cache).await? else {
                        continue;
                    };
                    any = true;
                    combined.copy_region(
                        0,
                        &[dx * cx..(dx + 1) * cx, dy * cy..(dy + 1) * cy, dz * cz..(dz + 1) * cz],
                        &block,
                        0,
                        &[0..cx, 0..cy, 0..cz],
                    )?;
                }
            }
        }
        if !any {
            return Ok(false);
        }

        let reduced = reduce(&combined, step, resource.is_annotation())?;
        let key = CuboidKey::new(resource.lookup, res + 1, target, t)
            .with_iso(hierarchy.uses_iso_namespace(res + 1, iso));
        let payload = self.store.encode_cube(&reduced)?;
        let lock = self.store.lock(&key).await?;
        self.store
            .put_locked(&lock, &key, payload, resource.is_annotation())
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::cutout::{Cutout, CutoutEngine};
    use crate::directory::{ChannelSpec, MemoryDirectory};
    use crate::flush::FlushEngine;
    use crate::layout::{CoordinateFrame, CubeSize};
    use crate::types::HierarchyMethod;

    struct Fixture {
        ctx: Arc<CoreContext>,
        manager: DownsampleManager,
        cutout: CutoutEngine,
    }

    fn channel(directory: &MemoryDirectory, name: &str) -> ResourceDescriptor {
        let frame = CoordinateFrame::new(0..64, 0..64, 0..8, [4.0, 4.0, 4.0]).unwrap();
        directory
            .create_channel(
                ChannelSpec::image("col1", "exp1", name, frame)
                    .with_hierarchy(HierarchyMethod::Slice, 3),
            )
            .unwrap()
    }

    fn fixture_with(names: &[&str]) -> (Fixture, Vec<ResourceDescriptor>) {
        let directory = Arc::new(MemoryDirectory::new());
        let resources = names
            .iter()
            .map(|n| channel(&directory, n))
            .collect();
        let mut config = CoreConfig::default();
        config.cuboid.cube_size = CubeSize::new(16, 16, 4);
        config.downsample.launch_coordinator = false;
        let ctx = CoreContext::builder(config).directory(directory).build().unwrap();
        let f = Fixture {
            manager: DownsampleManager::new(ctx.clone()),
            cutout: CutoutEngine::new(ctx.clone()),
            ctx,
        };
        (f, resources)
    }

    #[test]
    fn test_mean_and_mode() {
        assert_eq!(mean([10u8, 12, 14, 17].into_iter()), 13);
        assert_eq!(mean([u64::MAX, u64::MAX].into_iter()), u64::MAX);
        assert_eq!(mode([0u64, 5, 5, 3].into_iter()), 5);
        assert_eq!(mode([0u64, 0, 0, 0].into_iter()), 0);
        // tie goes to the smaller label
        assert_eq!(mode([9u64, 4, 9, 4].into_iter()), 4);
    }

    #[test]
    fn test_reduce_shape() {
        let block = VoxelBlock::zeros(DataType::U16, [1, 8, 32, 32]);
        assert_eq!(reduce(&block, [2, 2, 1], false).unwrap().shape(), [1, 8, 16, 16]);
        assert_eq!(reduce(&block, [2, 2, 2], true).unwrap().shape(), [1, 4, 16, 16]);
    }

    #[tokio::test]
    async fn test_fresh_channel_status() {
        let (f, resources) = fixture_with(&["chan1"]);
        let info = f.manager.status(&resources[0], false).await.unwrap();
        assert_eq!(info.status, DownsampleStatus::NotDownsampled);
        assert_eq!(info.num_hierarchy_levels, 3);
        assert_eq!(info.extent["1"], [32, 32, 8]);
        assert_eq!(info.voxel_size["2"], [16.0, 16.0, 4.0]);
        assert_eq!(info.cuboid_size["0"], [16, 16, 4]);
    }

    #[tokio::test]
    async fn test_start_then_cancel_queued() {
        let (f, resources) = fixture_with(&["chan1", "chan2"]);
        let user = Principal::user("alice");
        assert_eq!(
            f.manager.start(&resources[1], &user, None).await.unwrap(),
            DownsampleStatus::Queued
        );
        f.manager.start(&resources[0], &user, None).await.unwrap();
        let err = f.manager.start(&resources[0], &user, None).await.unwrap_err();
        assert_eq!(err.http_status(), 400);

        f.manager.cancel(&resources[0]).await.unwrap();
        let info = f.manager.status(&resources[0], false).await.unwrap();
        assert_eq!(info.status, DownsampleStatus::NotDownsampled);

        // the other channel's job is back on the queue
        let queue = f.ctx.queues.create(DOWNSAMPLE_QUEUE).await.unwrap();
        assert_eq!(queue.approximate_len().await.unwrap(), 1);

        let err = f.manager.cancel(&resources[0]).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn test_frame_override_needs_admin() {
        let (f, resources) = fixture_with(&["chan1"]);
        let region = Box3D::new(0..32, 0..32, 0..4).unwrap();
        let err = f
            .manager
            .start(&resources[0], &Principal::user("alice"), Some(region.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
        f.manager
            .start(&resources[0], &Principal::admin("root"), Some(region))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_image_levels_are_means() {
        let (f, resources) = fixture_with(&["chan1"]);
        let resource = &resources[0];
        let cutout = Cutout::new(0, Box3D::new(0..32, 0..32, 0..4).unwrap());
        let data = Array4::from_shape_fn((1, 4, 32, 32), |(_, _, y, x)| {
            10 + 2 * (x % 2) as u8 + 4 * (y % 2) as u8
        });
        f.cutout
            .write(resource, &cutout, &VoxelBlock::from_typed(&data))
            .await
            .unwrap();

        f.manager.start(resource, &Principal::user("alice"), None).await.unwrap();
        assert_eq!(f.manager.run_pending().await.unwrap(), 1);
        let info = f.manager.status(resource, false).await.unwrap();
        assert_eq!(info.status, DownsampleStatus::Downsampled);

        let level1 = Cutout::new(1, Box3D::new(0..16, 0..16, 0..4).unwrap());
        let block = f
            .cutout
            .read(resource, &level1, AccessMode::Cache, None)
            .await
            .unwrap();
        assert!(block.typed::<u8>().unwrap().iter().all(|v| *v == 13));

        // persisted under its own version once flushed
        FlushEngine::new(f.ctx.clone()).flush_pending().await.unwrap();
        let raw = f
            .cutout
            .read(resource, &level1, AccessMode::Raw, None)
            .await
            .unwrap();
        assert_eq!(raw, block);
        let key = CuboidKey::new(resource.lookup, 1, [0, 0, 0], 0);
        assert!(f.ctx.index.latest(&key).await.unwrap().unwrap().version >= 1);

        // level 2 comes from level 1: one 8x8 corner of 13s
        let level2 = Cutout::new(2, Box3D::new(0..16, 0..16, 0..4).unwrap());
        let top = f
            .cutout
            .read(resource, &level2, AccessMode::Cache, None)
            .await
            .unwrap()
            .typed::<u8>()
            .unwrap();
        assert_eq!(top[[0, 0, 7, 7]], 13);
        assert_eq!(top[[0, 0, 8, 8]], 0);
    }

    #[tokio::test]
    async fn test_cancel_in_progress_signals_coordinator() {
        let (f, resources) = fixture_with(&["chan1"]);
        let resource = &resources[0];
        let (arn, token) = f.ctx.executions.start("downsample");
        f.ctx
            .directory
            .update_downsample_arn(resource.channel.id, Some(arn.clone()))
            .await
            .unwrap();
        f.ctx
            .directory
            .cas_downsample_status(
                resource.channel.id,
                DownsampleStatus::NotDownsampled,
                DownsampleStatus::InProgress,
            )
            .await
            .unwrap();

        f.manager.cancel(resource).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(f.ctx.executions.state(&arn), Some(ExecutionState::Cancelled));
        let info = f.manager.status(resource, false).await.unwrap();
        assert_eq!(info.status, DownsampleStatus::NotDownsampled);
    }

    #[tokio::test]
    async fn test_lost_coordinator_reconciles_to_failed() {
        let (f, resources) = fixture_with(&["chan1"]);
        let resource = &resources[0];
        f.ctx
            .directory
            .update_downsample_arn(resource.channel.id, Some("downsample:gone".to_string()))
            .await
            .unwrap();
        f.ctx
            .directory
            .cas_downsample_status(
                resource.channel.id,
                DownsampleStatus::NotDownsampled,
                DownsampleStatus::InProgress,
            )
            .await
            .unwrap();
        let info = f.manager.status(resource, false).await.unwrap();
        assert_eq!(info.status, DownsampleStatus::Failed);
    }
}
