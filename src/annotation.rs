//! Annotation channel services
//!
//! ID reservation against the channel counter, the label -> cuboid reverse index that
//! the flush engine maintains, bounding boxes derived from that index, and the sweeper
//! that replays index updates parked on the dead-letter queue.

use crate::context::{CoreContext, INDEX_DEAD_LETTER_QUEUE};
use crate::cutout::{Cutout, CutoutEngine};
use crate::directory::ResourceDescriptor;
use crate::error::{BossError, Result};
use crate::keys::{parse_cuboid_key, CuboidKey, LookupKey};
use crate::store::TieredStore;
use crate::types::{AccessMode, BoundingBox, BoundingBoxKind, Box3D, DataType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SWEEPER_WORKER: &str = "id-index-sweeper";

/// Range of ids handed out by one reservation, `[start_id, start_id + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedIds {
    pub start_id: u64,
    pub count: u64,
}

/// Index update parked after its retries ran out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub cuboid_key: String,
    pub lookup: LookupKey,
    pub res: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reindexed: usize,
    pub dropped: usize,
    pub failed: usize,
}

async fn add_with_retry(ctx: &CoreContext, head: &CuboidKey, ids: &[u64]) -> Result<()> {
    let retries = ctx.config.annotation.index_retries;
    let delay = Duration::from_millis(ctx.config.annotation.index_retry_delay_ms);
    let key = head.canonical();
    let mut attempt = 0;
    loop {
        match ctx.id_index.add_ids(&head.lookup, head.res, &key, ids).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(key = %key, attempt, error = %e, "retrying id index update");
                tokio::time::sleep(delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Record every label of a freshly flushed annotation cuboid in the id index
///
/// An update that still fails after its retries goes to the dead-letter queue and the
/// flush carries on.
pub async fn index_cuboid(ctx: &Arc<CoreContext>, head: &CuboidKey, payload: &Bytes) -> Result<()> {
    let block = TieredStore::new(ctx.clone()).decode_cube(DataType::U64, payload)?;
    let ids: Vec<u64> = block.unique_labels().into_iter().collect();
    if ids.is_empty() {
        return Ok(());
    }
    if let Err(e) = add_with_retry(ctx, head, &ids).await {
        warn!(key = %head, labels = ids.len(), error = %e, "id index update failed, parking key");
        let letter = DeadLetter {
            cuboid_key: head.canonical(),
            lookup: head.lookup,
            res: head.res,
        };
        let queue = ctx.queues.create(INDEX_DEAD_LETTER_QUEUE).await?;
        queue.send(serde_json::to_string(&letter)?).await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct AnnotationService {
    cutout: CutoutEngine,
}

impl AnnotationService {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            cutout: CutoutEngine::new(ctx),
        }
    }

    fn ctx(&self) -> &Arc<CoreContext> {
        self.cutout.store().context()
    }

    fn require_annotation(resource: &ResourceDescriptor) -> Result<()> {
        if !resource.is_annotation() {
            return Err(BossError::validation(format!(
                "Channel {} is not an annotation channel",
                resource.boss_key()
            )));
        }
        Ok(())
    }

    /// Reserve `count` consecutive ids; ranges never overlap earlier reservations
    pub async fn reserve_ids(&self, resource: &ResourceDescriptor, count: u64) -> Result<ReservedIds> {
        Self::require_annotation(resource)?;
        if count == 0 {
            return Err(BossError::validation("Must reserve at least one id"));
        }
        let previous = self
            .ctx()
            .directory
            .increment_id_counter(resource.channel.id, count)
            .await?;
        let reserved = ReservedIds {
            start_id: previous + 1,
            count,
        };
        debug!(resource = %resource.boss_key(), start = reserved.start_id, count, "reserved ids");
        Ok(reserved)
    }

    /// Keys of every cuboid known to contain `id`
    pub async fn cuboids_from_id(
        &self,
        resource: &ResourceDescriptor,
        res: u32,
        id: u64,
    ) -> Result<Vec<String>> {
        Self::require_annotation(resource)?;
        self.ctx()
            .id_index
            .cuboids_for_id(&resource.lookup, res, id)
            .await
    }

    pub async fn bounding_box(
        &self,
        resource: &ResourceDescriptor,
        res: u32,
        id: u64,
        kind: BoundingBoxKind,
    ) -> Result<BoundingBox> {
        Self::require_annotation(resource)?;
        let hierarchy = resource.hierarchy();
        if res >= hierarchy.num_levels {
            return Err(BossError::validation(format!(
                "Resolution {} is out of range",
                res
            )));
        }
        let keys = self
            .cuboids_from_id(resource, res, id)
            .await?
            .iter()
            .map(|k| parse_cuboid_key(k))
            .collect::<Result<Vec<_>>>()?;
        let keys: Vec<CuboidKey> = keys.into_iter().filter(|k| !k.iso).collect();
        if keys.is_empty() {
            return Err(BossError::not_found(format!(
                "Id {} has no index entries at resolution {}",
                id, res
            )));
        }

        let cube_size = self.ctx().config.cuboid.cube_size;
        let origin = hierarchy.frame_box(&resource.frame, res, false).corner();
        let shift = |b: Box3D| Box3D {
            x: b.x.start + origin[0]..b.x.end + origin[0],
            y: b.y.start + origin[1]..b.y.end + origin[1],
            z: b.z.start + origin[2]..b.z.end + origin[2],
        };

        let mut found: Option<(Box3D, u64, u64)> = None;
        let mut merge = |b: Box3D, t: u64| {
            found = Some(match found.take() {
                None => (b, t, t + 1),
                Some((acc, t0, t1)) => (acc.union(&b), t0.min(t), t1.max(t + 1)),
            });
        };
        for key in &keys {
            let cube_box = cube_size.cube_box(key.cube());
            match kind {
                BoundingBoxKind::Loose => merge(shift(cube_box), key.t),
                BoundingBoxKind::Tight => {
                    let Some(block) = self
                        .cutout
                        .store()
                        .read_cube(key, DataType::U64, AccessMode::Cache)
                        .await?
                    else {
                        continue;
                    };
                    let Some([x, y, z]) = block.bounds_of(0, id) else {
                        continue;
                    };
                    let at = |r: std::ops::Range<usize>, start: u64| {
                        start + r.start as u64..start + r.end as u64
                    };
                    let tight = Box3D {
                        x: at(x, cube_box.x.start),
                        y: at(y, cube_box.y.start),
                        z: at(z, cube_box.z.start),
                    };
                    merge(shift(tight), key.t);
                }
            }
        }

        match found {
            Some((b, t0, t1)) => Ok(BoundingBox::from_box(&b, t0..t1)),
            // index entries are stale: the label was overwritten since
            None => Err(BossError::not_found(format!(
                "Id {} not found at resolution {}",
                id, res
            ))),
        }
    }

    /// Sorted non-zero labels inside a cutout region
    pub async fn ids_in_region(&self, resource: &ResourceDescriptor, cutout: &Cutout) -> Result<Vec<u64>> {
        Self::require_annotation(resource)?;
        let block = self
            .cutout
            .read(resource, cutout, AccessMode::Cache, None)
            .await?;
        Ok(block.unique_labels().into_iter().collect())
    }

    /// Replay up to one batch of parked index updates
    pub async fn sweep_dead_letters(&self) -> Result<SweepReport> {
        let ctx = self.ctx();
        let queue = ctx.queues.create(INDEX_DEAD_LETTER_QUEUE).await?;
        let visibility = Duration::from_secs(ctx.config.flush.visibility_timeout_secs);
        let messages = queue
            .receive(ctx.config.annotation.sweep_batch, visibility)
            .await?;
        let mut report = SweepReport::default();
        for message in messages {
            let letter: DeadLetter = match serde_json::from_str(&message.body) {
                Ok(letter) => letter,
                Err(e) => {
                    warn!(error = %e, body = %message.body, "dropping malformed dead letter");
                    queue.delete(&message.receipt).await?;
                    report.dropped += 1;
                    continue;
                }
            };
            let head = parse_cuboid_key(&letter.cuboid_key)?.head();
            let block = self
                .cutout
                .store()
                .read_cube(&head, DataType::U64, AccessMode::Cache)
                .await?;
            let Some(block) = block else {
                queue.delete(&message.receipt).await?;
                report.dropped += 1;
                continue;
            };
            let ids: Vec<u64> = block.unique_labels().into_iter().collect();
            match add_with_retry(ctx, &head, &ids).await {
                Ok(()) => {
                    queue.delete(&message.receipt).await?;
                    report.reindexed += 1;
                }
                Err(e) => {
                    warn!(key = %head, error = %e, "dead letter still failing");
                    report.failed += 1;
                }
            }
        }
        if report != SweepReport::default() {
            info!(
                reindexed = report.reindexed,
                dropped = report.dropped,
                failed = report.failed,
                "id index dead letters swept"
            );
        }
        Ok(report)
    }

    /// Run the dead-letter sweeper in the background; false if one is already running
    pub fn start_sweeper(&self) -> bool {
        let service = self.clone();
        let interval = Duration::from_millis(self.ctx().config.annotation.sweep_interval_ms);
        self.ctx().ensure_worker(SWEEPER_WORKER, move |token| async move {
            while !token.is_cancelled() {
                if let Err(e) = service.sweep_dead_letters().await {
                    warn!(error = %e, "dead letter sweep failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::cuboid::VoxelBlock;
    use crate::directory::{ChannelSpec, MemoryDirectory};
    use crate::flush::FlushEngine;
    use crate::index::MemoryIdIndex;
    use crate::layout::{CoordinateFrame, CubeSize};
    use ndarray::Array4;

    struct Fixture {
        service: AnnotationService,
        flush: FlushEngine,
        resource: ResourceDescriptor,
        id_index: Arc<MemoryIdIndex>,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let frame = CoordinateFrame::new(0..64, 0..64, 0..16, [4.0, 4.0, 35.0]).unwrap();
        let resource = directory
            .create_channel(ChannelSpec::annotation("col1", "exp1", "anno", frame))
            .unwrap();
        let mut config = CoreConfig::default();
        config.cuboid.cube_size = CubeSize::new(16, 16, 4);
        config.annotation.index_retries = 1;
        config.annotation.index_retry_delay_ms = 1;
        let id_index = Arc::new(MemoryIdIndex::new(1024));
        let ctx = CoreContext::builder(config)
            .directory(directory)
            .id_index(id_index.clone())
            .build()
            .unwrap();
        Fixture {
            service: AnnotationService::new(ctx.clone()),
            flush: FlushEngine::new(ctx),
            resource,
            id_index,
        }
    }

    /// Fill `region` with `label` and flush it
    async fn paint(f: &Fixture, region: Box3D, label: u64) {
        let cutout = Cutout::new(0, region);
        let [t, z, y, x] = cutout.shape();
        let block = VoxelBlock::from_typed(&Array4::from_elem((t, z, y, x), label));
        f.service.cutout.write(&f.resource, &cutout, &block).await.unwrap();
        f.flush.flush_pending().await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_ids_are_consecutive() {
        let f = fixture().await;
        let first = f.service.reserve_ids(&f.resource, 10).await.unwrap();
        assert_eq!(first, ReservedIds { start_id: 1, count: 10 });
        let second = f.service.reserve_ids(&f.resource, 5).await.unwrap();
        assert_eq!(second, ReservedIds { start_id: 11, count: 5 });
        assert!(f.service.reserve_ids(&f.resource, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_indexes_labels() {
        let f = fixture().await;
        paint(&f, Box3D::new(10..20, 0..4, 0..2).unwrap(), 7).await;
        let keys = f.service.cuboids_from_id(&f.resource, 0, 7).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(f.service.cuboids_from_id(&f.resource, 0, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bounding_boxes() {
        let f = fixture().await;
        paint(&f, Box3D::new(18..30, 20..24, 1..3).unwrap(), 3).await;

        let tight = f
            .service
            .bounding_box(&f.resource, 0, 3, BoundingBoxKind::Tight)
            .await
            .unwrap();
        assert_eq!(tight.x_range, [18, 30]);
        assert_eq!(tight.y_range, [20, 24]);
        assert_eq!(tight.z_range, [1, 3]);
        assert_eq!(tight.t_range, [0, 1]);

        let loose = f
            .service
            .bounding_box(&f.resource, 0, 3, BoundingBoxKind::Loose)
            .await
            .unwrap();
        assert_eq!(loose.x_range, [16, 32]);
        assert_eq!(loose.y_range, [16, 32]);
        assert_eq!(loose.z_range, [0, 4]);

        let err = f
            .service
            .bounding_box(&f.resource, 0, 99, BoundingBoxKind::Loose)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_ids_in_region() {
        let f = fixture().await;
        paint(&f, Box3D::new(0..4, 0..4, 0..1).unwrap(), 5).await;
        paint(&f, Box3D::new(40..44, 0..4, 0..1).unwrap(), 2).await;
        let all = Cutout::new(0, Box3D::new(0..64, 0..8, 0..4).unwrap());
        assert_eq!(f.service.ids_in_region(&f.resource, &all).await.unwrap(), vec![2, 5]);
        let left = Cutout::new(0, Box3D::new(0..16, 0..8, 0..4).unwrap());
        assert_eq!(f.service.ids_in_region(&f.resource, &left).await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_failed_index_update_is_swept_later() {
        let f = fixture().await;
        // the first attempt and its single retry both fail
        f.id_index.fail_next(2);
        paint(&f, Box3D::new(0..4, 0..4, 0..1).unwrap(), 9).await;
        assert!(f.service.cuboids_from_id(&f.resource, 0, 9).await.unwrap().is_empty());

        let report = f.service.sweep_dead_letters().await.unwrap();
        assert_eq!(report.reindexed, 1);
        assert_eq!(f.service.cuboids_from_id(&f.resource, 0, 9).await.unwrap().len(), 1);
        assert_eq!(f.service.sweep_dead_letters().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_image_channel_rejected() {
        let directory = Arc::new(MemoryDirectory::new());
        let frame = CoordinateFrame::new(0..64, 0..64, 0..16, [4.0, 4.0, 35.0]).unwrap();
        let image = directory
            .create_channel(ChannelSpec::image("col1", "exp1", "chan1", frame))
            .unwrap();
        let ctx = CoreContext::builder(CoreConfig::default())
            .directory(directory)
            .build()
            .unwrap();
        let service = AnnotationService::new(ctx);
        let err = service.reserve_ids(&image, 10).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
