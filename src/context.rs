//! Shared, immutable runtime context threaded through every component

use crate::blob::{BlobStore, MemoryBlobStore, RetryingBlobStore};
use crate::cache::{KvCache, MemoryCache};
use crate::compression::CuboidCodec;
use crate::config::CoreConfig;
use crate::directory::{CachedDirectory, MemoryDirectory, ResourceDirectory};
use crate::error::Result;
use crate::executor::{CancelToken, ExecutionRegistry};
use crate::index::{CuboidIndex, IdIndex, MemoryCuboidIndex, MemoryIdIndex};
use crate::ingest::{IngestJobStore, MemoryIngestJobStore};
use crate::queue::{MemoryQueueProvider, QueueProvider};
use crate::throttle::{MemoryNotifier, MemoryThrottleStore, ThrottleNotifier, ThrottleStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.write() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Well-known queue names
pub const FLUSH_QUEUE: &str = "cuboid-flush";
pub const FLUSH_OPERATOR_QUEUE: &str = "cuboid-flush-operator";
pub const INDEX_DEAD_LETTER_QUEUE: &str = "id-index-dead-letter";
pub const DOWNSAMPLE_QUEUE: &str = "downsample";

struct Worker {
    name: String,
    token: CancelToken,
    handle: JoinHandle<()>,
}

/// Configuration, backends and clock shared by all components
pub struct CoreContext {
    pub config: CoreConfig,
    pub codec: CuboidCodec,
    pub cache: Arc<dyn KvCache>,
    pub blob: Arc<dyn BlobStore>,
    pub index: Arc<dyn CuboidIndex>,
    pub id_index: Arc<dyn IdIndex>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub queues: Arc<dyn QueueProvider>,
    pub jobs: Arc<dyn IngestJobStore>,
    pub throttle_store: Arc<dyn ThrottleStore>,
    pub notifier: Arc<dyn ThrottleNotifier>,
    pub clock: Arc<dyn Clock>,
    /// Running downsample coordinators and other cancellable executions
    pub executions: ExecutionRegistry,
    workers: Mutex<Vec<Worker>>,
}

impl CoreContext {
    pub fn builder(config: CoreConfig) -> CoreContextBuilder {
        CoreContextBuilder::new(config)
    }

    /// Context backed entirely by in-memory stores
    pub fn in_memory(config: CoreConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Keep a background worker alive until [`CoreContext::shutdown`]
    pub fn register_worker(&self, name: impl Into<String>, token: CancelToken, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(worker = %name, "registered background worker");
        self.workers.lock().push(Worker {
            name,
            token,
            handle,
        });
    }

    /// Spawn the worker `name` unless a live one already exists; true if spawned
    pub fn ensure_worker<F, Fut>(&self, name: &str, make: F) -> bool
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock();
        if workers
            .iter()
            .any(|w| w.name == name && !w.handle.is_finished())
        {
            return false;
        }
        workers.retain(|w| w.name != name);
        let token = CancelToken::new();
        let handle = tokio::spawn(make(token.clone()));
        debug!(worker = %name, "spawned background worker");
        workers.push(Worker {
            name: name.to_string(),
            token,
            handle,
        });
        true
    }

    pub fn has_worker(&self, name: &str) -> bool {
        self.workers
            .lock()
            .iter()
            .any(|w| w.name == name && !w.handle.is_finished())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop background workers, most recently started first
    pub async fn shutdown(&self) {
        loop {
            let worker = self.workers.lock().pop();
            let Some(worker) = worker else { break };
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                debug!(worker = %worker.name, error = %e, "worker ended abnormally");
            }
            info!(worker = %worker.name, "worker stopped");
        }
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("workers", &self.worker_count())
            .finish()
    }
}

/// Assembles a [`CoreContext`], defaulting every unset backend to its in-memory form
pub struct CoreContextBuilder {
    config: CoreConfig,
    cache: Option<Arc<dyn KvCache>>,
    blob: Option<Arc<dyn BlobStore>>,
    index: Option<Arc<dyn CuboidIndex>>,
    id_index: Option<Arc<dyn IdIndex>>,
    directory: Option<Arc<dyn ResourceDirectory>>,
    queues: Option<Arc<dyn QueueProvider>>,
    jobs: Option<Arc<dyn IngestJobStore>>,
    throttle_store: Option<Arc<dyn ThrottleStore>>,
    notifier: Option<Arc<dyn ThrottleNotifier>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreContextBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            cache: None,
            blob: None,
            index: None,
            id_index: None,
            directory: None,
            queues: None,
            jobs: None,
            throttle_store: None,
            notifier: None,
            clock: None,
        }
    }

    pub fn cache(mut self, cache: Arc<dyn KvCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Raw blob store; it is wrapped with retries on build
    pub fn blob(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn index(mut self, index: Arc<dyn CuboidIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn id_index(mut self, id_index: Arc<dyn IdIndex>) -> Self {
        self.id_index = Some(id_index);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ResourceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn queues(mut self, queues: Arc<dyn QueueProvider>) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn jobs(mut self, jobs: Arc<dyn IngestJobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn throttle_store(mut self, store: Arc<dyn ThrottleStore>) -> Self {
        self.throttle_store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ThrottleNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<CoreContext>> {
        self.config.validate()?;
        let config = self.config;
        let raw_blob = self
            .blob
            .unwrap_or_else(|| Arc::new(MemoryBlobStore::new()));
        let blob: Arc<dyn BlobStore> = Arc::new(RetryingBlobStore::new(raw_blob, &config.blob));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(MemoryDirectory::new()));

        let context = CoreContext {
            codec: CuboidCodec::from_config(&config.cuboid),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(MemoryCache::from_config(&config.cache))),
            blob,
            index: self
                .index
                .unwrap_or_else(|| Arc::new(MemoryCuboidIndex::new())),
            id_index: self.id_index.unwrap_or_else(|| {
                Arc::new(MemoryIdIndex::new(
                    config.annotation.id_index_new_chunk_threshold,
                ))
            }),
            directory: Arc::new(CachedDirectory::new(directory)),
            queues: self
                .queues
                .unwrap_or_else(|| Arc::new(MemoryQueueProvider::new())),
            jobs: self
                .jobs
                .unwrap_or_else(|| Arc::new(MemoryIngestJobStore::new())),
            throttle_store: self
                .throttle_store
                .unwrap_or_else(|| Arc::new(MemoryThrottleStore::new())),
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(MemoryNotifier::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            executions: ExecutionRegistry::new(),
            config,
            workers: Mutex::new(Vec::new()),
        };
        info!(
            cube = ?context.config.cuboid.cube_size,
            compression = ?context.config.cuboid.compression,
            "core context ready"
        );
        Ok(Arc::new(context))
    }
}
