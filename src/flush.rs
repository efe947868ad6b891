//! Flush engine
//!
//! Workers drain the flush queue, moving dirty tier-1 entries into the blob store under a
//! fresh version and recording them in the cuboid index. A write superseded by a newer
//! write to the same cuboid is dropped; only the newest entry is ever persisted.

use crate::annotation;
use crate::context::{CoreContext, FLUSH_OPERATOR_QUEUE, FLUSH_QUEUE};
use crate::error::{BossError, Result};
use crate::executor::CancelToken;
use crate::index::IndexRow;
use crate::keys::{parse_cuboid_key, CuboidKey};
use crate::queue::{Message, MessageQueue};
use crate::store::{dirty_set_key, pending_key, TieredStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Body of a flush queue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushTask {
    pub write_key: String,
    pub annotation: bool,
}

/// Escalation sent to operators after repeated flush failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonReport {
    pub write_key: String,
    pub attempts: i64,
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed { version: u64 },
    Superseded,
    Failed,
    Escalated,
}

/// Tally of one [`FlushEngine::flush_pending`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub superseded: usize,
    pub failed: usize,
    pub escalated: usize,
}

impl FlushReport {
    fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Flushed { .. } => self.flushed += 1,
            FlushOutcome::Superseded => self.superseded += 1,
            FlushOutcome::Failed => self.failed += 1,
            FlushOutcome::Escalated => self.escalated += 1,
        }
    }
}

fn poison_key(head: &CuboidKey) -> String {
    format!("FLUSH-ATTEMPTS&{}", head.canonical())
}

#[derive(Clone)]
pub struct FlushEngine {
    store: TieredStore,
}

impl FlushEngine {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            store: TieredStore::new(ctx),
        }
    }

    fn ctx(&self) -> &Arc<CoreContext> {
        self.store.context()
    }

    fn visibility(&self) -> Duration {
        Duration::from_secs(self.ctx().config.flush.visibility_timeout_secs)
    }

    /// Spawn the configured number of background workers
    pub fn start(&self) {
        let workers = self.ctx().config.flush.workers;
        for n in 0..workers {
            let engine = self.clone();
            let token = CancelToken::new();
            let worker_token = token.clone();
            let handle = tokio::spawn(async move { engine.run_worker(n, worker_token).await });
            self.ctx()
                .register_worker(format!("flush-{}", n), token, handle);
        }
        info!(workers, "flush engine started");
    }

    async fn run_worker(&self, n: usize, token: CancelToken) {
        let poll = Duration::from_millis(self.ctx().config.flush.poll_interval_ms);
        while !token.is_cancelled() {
            let processed = match self.poll_once().await {
                Ok(processed) => processed,
                Err(e) => {
                    warn!(worker = n, error = %e, "flush poll failed");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
        debug!(worker = n, "flush worker exiting");
    }

    async fn poll_once(&self) -> Result<usize> {
        let queue = self.ctx().queues.create(FLUSH_QUEUE).await?;
        let messages = queue.receive(1, self.visibility()).await?;
        let count = messages.len();
        for message in messages {
            self.process(queue.as_ref(), &message).await?;
        }
        Ok(count)
    }

    /// Flush everything currently queued; failed tasks are retried in later passes
    /// until they either succeed or are escalated
    pub async fn flush_pending(&self) -> Result<FlushReport> {
        let queue = self.ctx().queues.create(FLUSH_QUEUE).await?;
        let mut report = FlushReport::default();
        loop {
            let messages = queue.receive(10, self.visibility()).await?;
            if messages.is_empty() {
                break;
            }
            // a task that keeps failing is escalated once its poison counter reaches
            // the threshold, so this terminates
            for message in &messages {
                let outcome = self.process(queue.as_ref(), message).await?;
                if outcome == FlushOutcome::Failed {
                    queue
                        .change_visibility(&message.receipt, Duration::ZERO)
                        .await?;
                }
                report.record(outcome);
            }
        }
        Ok(report)
    }

    /// Handle one flush message
    pub async fn process(&self, queue: &dyn MessageQueue, message: &Message) -> Result<FlushOutcome> {
        let task: FlushTask = match serde_json::from_str(&message.body) {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, body = %message.body, "dropping malformed flush task");
                queue.delete(&message.receipt).await?;
                return Ok(FlushOutcome::Superseded);
            }
        };
        let head = parse_cuboid_key(&task.write_key)?.head();
        let cache = self.ctx().cache.clone();
        let _lock = self.store.lock(&head).await?;

        let pointer = cache.get_dirty(&pending_key(&head)).await?;
        let current = pointer.as_deref() == Some(task.write_key.as_bytes());
        let payload = cache.get_dirty(&task.write_key).await?;
        let Some(payload) = payload.filter(|_| current) else {
            cache.remove_dirty(&task.write_key).await?;
            cache.set_remove(&dirty_set_key(&head), &task.write_key).await?;
            queue.delete(&message.receipt).await?;
            debug!(write_key = %task.write_key, "superseded write dropped");
            return Ok(FlushOutcome::Superseded);
        };

        match self.persist(&head, payload, task.annotation).await {
            Ok(version) => {
                cache.remove_dirty(&task.write_key).await?;
                cache.remove_dirty(&pending_key(&head)).await?;
                cache.set_remove(&dirty_set_key(&head), &task.write_key).await?;
                cache.reset_counter(&poison_key(&head)).await?;
                queue.delete(&message.receipt).await?;
                debug!(key = %head, version, "cuboid flushed");
                Ok(FlushOutcome::Flushed { version })
            }
            Err(e) => {
                let attempts = cache.incr(&poison_key(&head), 1).await?;
                let threshold = i64::from(self.ctx().config.flush.poison_threshold);
                if attempts < threshold {
                    warn!(key = %head, attempts, error = %e, "cuboid flush failed");
                    return Ok(FlushOutcome::Failed);
                }
                let report = PoisonReport {
                    write_key: task.write_key.clone(),
                    attempts,
                    last_error: e.to_string(),
                };
                let operators = self.ctx().queues.create(FLUSH_OPERATOR_QUEUE).await?;
                operators.send(serde_json::to_string(&report)?).await?;
                cache.reset_counter(&poison_key(&head)).await?;
                queue.delete(&message.receipt).await?;
                error!(key = %head, attempts, error = %e, "cuboid flush escalated to operators");
                Ok(FlushOutcome::Escalated)
            }
        }
    }

    async fn persist(&self, head: &CuboidKey, payload: Bytes, annotation: bool) -> Result<u64> {
        let ctx = self.ctx();
        let version = ctx.index.allocate_version(&head.lookup).await?;
        let versioned = head.with_version(version);
        ctx.blob
            .put(&versioned.object_key(), payload.clone())
            .await
            .map_err(|e| BossError::backend(format!("flush of {} failed: {}", versioned, e)))?;
        ctx.index
            .put_row(IndexRow::new(
                &versioned,
                payload.len() as u64,
                ctx.clock.now(),
            ))
            .await?;
        if annotation {
            annotation::index_cuboid(ctx, head, &payload).await?;
        }
        ctx.cache.put(&head.cache_key(), payload).await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::CoreConfig;
    use crate::directory::{ChannelSpec, MemoryDirectory, ResourceDescriptor};
    use crate::layout::{CoordinateFrame, CubeSize};
    use crate::types::AccessMode;

    async fn setup(blob: Arc<MemoryBlobStore>) -> (FlushEngine, TieredStore, ResourceDescriptor) {
        let directory = Arc::new(MemoryDirectory::new());
        let frame = CoordinateFrame::new(0..64, 0..64, 0..16, [4.0, 4.0, 35.0]).unwrap();
        let resource = directory
            .create_channel(ChannelSpec::image("col1", "exp1", "chan1", frame))
            .unwrap();
        let mut config = CoreConfig::default();
        config.cuboid.cube_size = CubeSize::new(8, 8, 4);
        config.blob.max_retries = 0;
        config.flush.poison_threshold = 2;
        let ctx = CoreContext::builder(config)
            .directory(directory)
            .blob(blob)
            .build()
            .unwrap();
        (FlushEngine::new(ctx.clone()), TieredStore::new(ctx), resource)
    }

    #[tokio::test]
    async fn test_flush_persists_latest_write_only() {
        let blob = Arc::new(MemoryBlobStore::new());
        let (engine, store, resource) = setup(blob.clone()).await;
        let key = CuboidKey::new(resource.lookup, 0, [0, 0, 0], 0);
        store
            .put_cubes(&resource, vec![(key, Bytes::from_static(b"first"))])
            .await
            .unwrap();
        store
            .put_cubes(&resource, vec![(key, Bytes::from_static(b"second"))])
            .await
            .unwrap();

        let report = engine.flush_pending().await.unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(report.superseded, 1);
        assert_eq!(blob.len(), 1);

        let raw = store.get_cube(&key, AccessMode::Raw).await.unwrap();
        assert_eq!(raw, Some(Bytes::from_static(b"second")));
        assert!(store.dirty_keys(&resource.lookup, 0, false).await.unwrap().is_empty());
        assert_eq!(store.context().cache.get_dirty(&pending_key(&key)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_versions_increase_per_flush() {
        let blob = Arc::new(MemoryBlobStore::new());
        let (engine, store, resource) = setup(blob).await;
        let key = CuboidKey::new(resource.lookup, 0, [1, 0, 0], 0);
        for payload in [&b"a"[..], &b"b"[..]] {
            store
                .put_cubes(&resource, vec![(key, Bytes::copy_from_slice(payload))])
                .await
                .unwrap();
            engine.flush_pending().await.unwrap();
        }
        let row = store.context().index.latest(&key).await.unwrap().unwrap();
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_entry_dirty_then_escalates() {
        let blob = Arc::new(MemoryBlobStore::new());
        let (engine, store, resource) = setup(blob.clone()).await;
        let key = CuboidKey::new(resource.lookup, 0, [0, 1, 0], 0);
        store
            .put_cubes(&resource, vec![(key, Bytes::from_static(b"payload"))])
            .await
            .unwrap();
        blob.fail_next(10);

        let report = engine.flush_pending().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.escalated, 1);

        let operators = store
            .context()
            .queues
            .create(FLUSH_OPERATOR_QUEUE)
            .await
            .unwrap();
        assert_eq!(operators.approximate_len().await.unwrap(), 1);
        // still readable from tier 1 and still dirty
        assert_eq!(
            store.get_cube(&key, AccessMode::Cache).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(store.dirty_keys(&resource.lookup, 0, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_background_workers_drain_queue() {
        let blob = Arc::new(MemoryBlobStore::new());
        let (engine, store, resource) = setup(blob.clone()).await;
        engine.start();
        let key = CuboidKey::new(resource.lookup, 0, [2, 2, 0], 0);
        store
            .put_cubes(&resource, vec![(key, Bytes::from_static(b"bg"))])
            .await
            .unwrap();

        let ctx = store.context().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.index.latest(&key).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        ctx.shutdown().await;
        assert_eq!(ctx.worker_count(), 0);
    }
}
