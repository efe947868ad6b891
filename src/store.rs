//! Tiered cuboid store
//!
//! Tier 1 is the [`KvCache`](crate::cache::KvCache), tier 2 the blob store and tier 3 the
//! cuboid index. Writes land in tier 1 as a dirty entry plus a pending pointer and are
//! persisted by the flush engine; reads go through tier 1 according to the access mode.

use crate::cache::AdvisoryLock;
use crate::context::{CoreContext, FLUSH_QUEUE};
use crate::cuboid::VoxelBlock;
use crate::directory::ResourceDescriptor;
use crate::error::{BossError, Result};
use crate::executor::{CancelToken, OrderedExecutor};
use crate::flush::FlushTask;
use crate::keys::{channel_prefix, CuboidKey, LookupKey, CACHED_CUBOID_PREFIX, ISO_PREFIX};
use crate::types::{AccessMode, DataType};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Pointer from a head key to its newest unflushed write entry
pub const PENDING_PREFIX: &str = "PENDING&";
/// Ordered set of unflushed write entries of one channel resolution
pub const DIRTY_SET_PREFIX: &str = "DIRTY&";

const LIST_PAGE_SIZE: usize = 500;

pub fn pending_key(key: &CuboidKey) -> String {
    format!("{}{}", PENDING_PREFIX, key.head().canonical())
}

pub fn dirty_set_key(key: &CuboidKey) -> String {
    format!(
        "{}{}",
        DIRTY_SET_PREFIX,
        channel_prefix(&key.lookup, key.res, key.iso)
    )
}

#[derive(Clone)]
pub struct TieredStore {
    ctx: Arc<CoreContext>,
}

impl TieredStore {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Exclusive write lock on one cuboid
    pub async fn lock(&self, key: &CuboidKey) -> Result<AdvisoryLock> {
        self.ctx.cache.advisory_lock(&key.cache_key()).await
    }

    /// Compressed bytes of one cuboid, `None` if it was never written
    pub async fn get_cube(&self, key: &CuboidKey, mode: AccessMode) -> Result<Option<Bytes>> {
        let key = key.head();
        match mode {
            AccessMode::Cache => {
                if let Some(bytes) = self.ctx.cache.get(&key.cache_key()).await? {
                    return Ok(Some(bytes));
                }
                if let Some(bytes) = self.pending_payload(&key).await? {
                    return Ok(Some(bytes));
                }
                let found = self.read_blob(&key).await?;
                if let Some(bytes) = &found {
                    self.populate(key, bytes.clone());
                }
                Ok(found)
            }
            AccessMode::NoCache => {
                let found = self.read_blob(&key).await?;
                if let Some(bytes) = &found {
                    self.populate(key, bytes.clone());
                }
                Ok(found)
            }
            AccessMode::Raw => self.read_blob(&key).await,
        }
    }

    /// Cuboids of one resource in request order
    pub async fn get_cubes(
        &self,
        resource: &ResourceDescriptor,
        keys: &[CuboidKey],
        mode: AccessMode,
        token: &CancelToken,
    ) -> Result<Vec<Option<Bytes>>> {
        check_owner(resource, keys.iter())?;
        let executor = OrderedExecutor::new(self.ctx.config.cutout.concurrency);
        let tasks: Vec<_> = keys.iter().map(|key| self.get_cube(key, mode)).collect();
        executor.run(tasks, token).await
    }

    /// Merge compressed cuboids into tier 1 and queue them for flushing
    pub async fn put_cubes(
        &self,
        resource: &ResourceDescriptor,
        cubes: Vec<(CuboidKey, Bytes)>,
    ) -> Result<()> {
        check_owner(resource, cubes.iter().map(|(key, _)| key))?;
        for (key, payload) in cubes {
            let lock = self.lock(&key).await?;
            self.put_locked(&lock, &key, payload, resource.is_annotation())
                .await?;
        }
        Ok(())
    }

    /// Write one cuboid while holding its advisory lock
    pub async fn put_locked(
        &self,
        lock: &AdvisoryLock,
        key: &CuboidKey,
        payload: Bytes,
        annotation: bool,
    ) -> Result<()> {
        let head = key.head();
        if lock.key() != head.cache_key() {
            return Err(BossError::Internal(format!(
                "lock on {} does not cover {}",
                lock.key(),
                head
            )));
        }
        let write_key = head.write_key(&Uuid::new_v4());
        let cache = &self.ctx.cache;
        cache.put_dirty(&write_key, payload.clone()).await?;
        cache
            .put_dirty(&pending_key(&head), Bytes::from(write_key.clone()))
            .await?;
        cache.put(&head.cache_key(), payload).await?;
        cache.set_add(&dirty_set_key(&head), &write_key).await?;

        let task = FlushTask {
            write_key: write_key.clone(),
            annotation,
        };
        let queue = self.ctx.queues.create(FLUSH_QUEUE).await?;
        queue.send(serde_json::to_string(&task)?).await?;
        debug!(key = %head, write_key = %write_key, "cuboid marked dirty");
        Ok(())
    }

    async fn pending_payload(&self, key: &CuboidKey) -> Result<Option<Bytes>> {
        let Some(pointer) = self.ctx.cache.get_dirty(&pending_key(key)).await? else {
            return Ok(None);
        };
        let write_key = String::from_utf8(pointer.to_vec())
            .map_err(|e| BossError::Corrupt(format!("pending pointer for {}: {}", key, e)))?;
        self.ctx.cache.get_dirty(&write_key).await
    }

    /// Latest flushed version from the blob store
    async fn read_blob(&self, key: &CuboidKey) -> Result<Option<Bytes>> {
        let Some(row) = self.ctx.index.latest(key).await? else {
            return Ok(None);
        };
        match self.ctx.blob.get(&row.object_key).await? {
            Some(bytes) => Ok(Some(bytes)),
            None => Err(BossError::backend(format!(
                "Cuboid index references missing object {}",
                row.object_key
            ))),
        }
    }

    /// Fill tier 1 in the background unless a newer write got there first
    fn populate(&self, key: CuboidKey, bytes: Bytes) {
        let cache = self.ctx.cache.clone();
        tokio::spawn(async move {
            let result: Result<()> = async {
                let _lock = cache.advisory_lock(&key.cache_key()).await?;
                if cache.get_dirty(&pending_key(&key)).await?.is_some()
                    || cache.get(&key.cache_key()).await?.is_some()
                {
                    return Ok(());
                }
                cache.put(&key.cache_key(), bytes).await
            }
            .await;
            if let Err(e) = result {
                debug!(key = %key, error = %e, "cache populate skipped");
            }
        });
    }

    fn cube_len(&self, dtype: DataType) -> usize {
        self.ctx.config.cuboid.cube_size.voxels() as usize * dtype.size_in_bytes()
    }

    /// Decode a stored payload into a single-sample cube
    pub fn decode_cube(&self, dtype: DataType, payload: &[u8]) -> Result<VoxelBlock> {
        let raw = self.ctx.codec.decode(payload, self.cube_len(dtype))?;
        let (z, y, x) = self.ctx.config.cuboid.cube_size.shape_zyx();
        VoxelBlock::from_bytes(dtype, [1, z, y, x], raw)
    }

    pub fn encode_cube(&self, block: &VoxelBlock) -> Result<Bytes> {
        if block.as_bytes().len() != self.cube_len(block.dtype()) {
            return Err(BossError::Internal(format!(
                "block of shape {:?} is not a cuboid",
                block.shape()
            )));
        }
        self.ctx
            .codec
            .encode(block.as_bytes(), block.dtype().size_in_bytes())
    }

    /// Decoded cuboid, zero-filled if it was never written
    pub async fn read_cube(
        &self,
        key: &CuboidKey,
        dtype: DataType,
        mode: AccessMode,
    ) -> Result<Option<VoxelBlock>> {
        match self.get_cube(key, mode).await? {
            Some(payload) => Ok(Some(self.decode_cube(dtype, &payload)?)),
            None => Ok(None),
        }
    }

    /// Keys of every flushed cuboid of a channel resolution, paging through the index
    pub fn list_cubes(
        &self,
        lookup: LookupKey,
        res: u32,
        iso: bool,
    ) -> BoxStream<'static, Result<CuboidKey>> {
        let index = self.ctx.index.clone();
        stream::try_unfold(
            (None::<String>, false),
            move |(cursor, done)| {
                let index = index.clone();
                async move {
                    if done {
                        return Ok::<_, BossError>(None);
                    }
                    let page = index
                        .list_page(&lookup, res, iso, cursor.as_deref(), LIST_PAGE_SIZE)
                        .await?;
                    let keys = page
                        .rows
                        .iter()
                        .map(|row| row.key())
                        .collect::<Result<Vec<_>>>()?;
                    let done = page.next.is_none();
                    Ok(Some((stream::iter(keys.into_iter().map(Ok)), (page.next, done))))
                }
            },
        )
        .try_flatten()
        .boxed()
    }

    pub async fn list_all(&self, lookup: LookupKey, res: u32, iso: bool) -> Result<Vec<CuboidKey>> {
        self.list_cubes(lookup, res, iso).try_collect().await
    }

    /// Unflushed write entries of a channel resolution
    pub async fn dirty_keys(&self, lookup: &LookupKey, res: u32, iso: bool) -> Result<Vec<String>> {
        let probe = CuboidKey::new(*lookup, res, [0, 0, 0], 0).with_iso(iso);
        self.ctx.cache.set_members(&dirty_set_key(&probe)).await
    }

    /// Drop every clean cached cuboid of a channel, isotropic track included
    pub async fn clear_cached(&self, lookup: &LookupKey) -> Result<usize> {
        let mut removed = 0;
        for prefix in [
            format!("{}{}&", CACHED_CUBOID_PREFIX, lookup),
            format!("{}{}{}&", CACHED_CUBOID_PREFIX, ISO_PREFIX, lookup),
        ] {
            removed += self.ctx.cache.delete_prefix(&prefix).await?;
        }
        debug!(lookup = %lookup, removed, "cleared cached cuboids");
        Ok(removed)
    }
}

fn check_owner<'a>(
    resource: &ResourceDescriptor,
    mut keys: impl Iterator<Item = &'a CuboidKey>,
) -> Result<()> {
    match keys.find(|key| key.lookup != resource.lookup) {
        Some(key) => Err(BossError::validation(format!(
            "Cuboid {} does not belong to {}",
            key,
            resource.boss_key()
        ))),
        None => Ok(()),
    }
}
