//! Ingest pipeline
//!
//! A job owns up to four queues. The upload queue holds one task per tile (or per chunk
//! for volumetric jobs) for clients to claim. Uploaded tiles are recorded on the
//! tile-index queue; once every tile of a chunk has been seen an assembly task moves to
//! the ingest queue, whose worker stitches the tiles together and writes them through the
//! cutout path. Tiles that fail validation land on the tile-error queue.
//!
//! Completion is a state machine serialized by compare-and-set on the job status:
//!
//! ```text
//! UPLOADING --enter_wait--> WAIT_ON_QUEUES --(timer)--> COMPLETING --ok--> COMPLETE
//! WAIT_ON_QUEUES --queue refilled--> UPLOADING
//! COMPLETING --partial chunks--> FAILED
//! any non-terminal --delete--> DELETED
//! ```

use crate::context::CoreContext;
use crate::cuboid::VoxelBlock;
use crate::cutout::{Cutout, CutoutEngine};
use crate::directory::Principal;
use crate::error::{BossError, ErrorCode, Result};
use crate::executor::CancelToken;
use crate::keys::{decode_chunk_key, encode_chunk_key, encode_tile_key, LookupKey};
use crate::queue::MessageQueue;
use crate::throttle::{MetricType, MetricUnits, ThrottleEngine};
use crate::types::Box3D;
use crate::utils::ceil_div;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStatus {
    Preparing,
    Uploading,
    WaitOnQueues,
    Completing,
    Complete,
    Deleted,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Preparing => "PREPARING",
            IngestStatus::Uploading => "UPLOADING",
            IngestStatus::WaitOnQueues => "WAIT_ON_QUEUES",
            IngestStatus::Completing => "COMPLETING",
            IngestStatus::Complete => "COMPLETE",
            IngestStatus::Deleted => "DELETED",
            IngestStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestStatus::Complete | IngestStatus::Deleted | IngestStatus::Failed
        )
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestType {
    /// Clients push single-slice tiles
    #[default]
    Tile,
    /// Clients push whole chunks
    Volumetric,
}

/// Parameters of a new ingest job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJobRequest {
    pub collection: String,
    pub experiment: String,
    pub channel: String,
    #[serde(default)]
    pub ingest_type: IngestType,
    /// Region to ingest at the channel's base resolution
    pub extent: Box3D,
    pub t: Range<u64>,
    /// Tile x and y size; for volumetric jobs z is the chunk depth, 0 for the default
    pub tile_size: [u64; 3],
}

/// Upload credentials handed to the job's creator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl IngestCredentials {
    fn generate() -> Self {
        Self {
            access_key: Uuid::new_v4().simple().to_string(),
            secret_key: Uuid::new_v4().simple().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: u64,
    pub creator: String,
    pub collection: String,
    pub experiment: String,
    pub channel: String,
    pub lookup: LookupKey,
    pub resolution: u32,
    pub ingest_type: IngestType,
    pub extent: Box3D,
    pub t: Range<u64>,
    pub tile_size: [u64; 3],
    /// z slices grouped into one chunk
    pub z_chunk_size: u64,
    pub status: IngestStatus,
    pub wait_on_queues_ts: Option<DateTime<Utc>>,
    pub upload_queue: Option<String>,
    pub ingest_queue: Option<String>,
    pub tile_index_queue: Option<String>,
    pub tile_error_queue: Option<String>,
    pub credentials: Option<IngestCredentials>,
    /// Upload tasks generated for the job
    pub tile_count: u64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

impl IngestJob {
    /// Chunk `[cx, cy, cz]` clipped to the job extent
    pub fn chunk_region(&self, chunk: [u64; 3]) -> Box3D {
        let [tx, ty, _] = self.tile_size;
        let clip = |lo: u64, size: u64, range: &Range<u64>| {
            (lo * size).max(range.start)..((lo + 1) * size).min(range.end)
        };
        Box3D {
            x: clip(chunk[0], tx, &self.extent.x),
            y: clip(chunk[1], ty, &self.extent.y),
            z: clip(chunk[2], self.z_chunk_size, &self.extent.z),
        }
    }

    /// Every task clients must complete, in t, z, y, x order
    pub fn upload_tasks(&self) -> Vec<UploadTask> {
        let [tx, ty, _] = self.tile_size;
        let zc = self.z_chunk_size;
        let e = &self.extent;
        let mut tasks = Vec::new();
        for t in self.t.clone() {
            for cz in e.z.start / zc..ceil_div(e.z.end, zc) {
                for cy in e.y.start / ty..ceil_div(e.y.end, ty) {
                    for cx in e.x.start / tx..ceil_div(e.x.end, tx) {
                        let region = self.chunk_region([cx, cy, cz]);
                        match self.ingest_type {
                            IngestType::Tile => {
                                let depth = region.z.end - region.z.start;
                                let chunk_key = encode_chunk_key(
                                    depth,
                                    &self.lookup,
                                    self.resolution,
                                    cx,
                                    cy,
                                    cz,
                                    t,
                                );
                                for tz in region.z.clone() {
                                    tasks.push(UploadTask {
                                        job_id: self.id,
                                        chunk_key: chunk_key.clone(),
                                        tile_key: encode_tile_key(
                                            &self.lookup,
                                            self.resolution,
                                            cx,
                                            cy,
                                            tz,
                                            t,
                                        ),
                                        region: Box3D {
                                            x: region.x.clone(),
                                            y: region.y.clone(),
                                            z: tz..tz + 1,
                                        },
                                        t,
                                    });
                                }
                            }
                            IngestType::Volumetric => {
                                let chunk_key = encode_chunk_key(
                                    1,
                                    &self.lookup,
                                    self.resolution,
                                    cx,
                                    cy,
                                    cz,
                                    t,
                                );
                                tasks.push(UploadTask {
                                    job_id: self.id,
                                    tile_key: chunk_key.clone(),
                                    chunk_key,
                                    region,
                                    t,
                                });
                            }
                        }
                    }
                }
            }
        }
        tasks
    }

    fn queue_urls(&self) -> Vec<&String> {
        [
            &self.upload_queue,
            &self.ingest_queue,
            &self.tile_index_queue,
            &self.tile_error_queue,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// One unit of client work, also the body of tile-index messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub job_id: u64,
    pub chunk_key: String,
    pub tile_key: String,
    /// Voxels the upload must cover
    pub region: Box3D,
    pub t: u64,
}

impl UploadTask {
    /// Shape `[t, z, y, x]` of the data expected for this task
    pub fn shape(&self) -> [usize; 4] {
        let [x, y, z] = self.region.extent();
        [1, z as usize, y as usize, x as usize]
    }
}

/// An upload task claimed from the upload queue
#[derive(Debug, Clone, PartialEq)]
pub struct UploadLease {
    pub task: UploadTask,
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IngestTask {
    job_id: u64,
    chunk_key: String,
    region: Box3D,
    t: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TileError {
    job_id: u64,
    tile_key: String,
    reason: String,
}

/// Answer to a complete request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub job_status: IngestStatus,
    pub wait_secs: u64,
    #[serde(skip)]
    pub http_status: u16,
}

impl CompleteResponse {
    fn new(job_status: IngestStatus, wait_secs: u64, http_status: u16) -> Self {
        Self {
            job_status,
            wait_secs,
            http_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatusReport {
    pub id: u64,
    pub status: IngestStatus,
    pub total_message_count: u64,
    pub current_message_count: u64,
}

/// A job as shown to its creator, with credentials while uploads are possible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJobView {
    pub job: IngestJob,
    pub credentials: Option<IngestCredentials>,
}

/// Persistent ingest job rows
#[async_trait]
pub trait IngestJobStore: Send + Sync {
    /// Store a new job, assigning its id
    async fn insert(&self, job: IngestJob) -> Result<IngestJob>;

    async fn get(&self, id: u64) -> Result<IngestJob>;

    async fn update(&self, job: &IngestJob) -> Result<()>;

    /// Replace the row only if its stored status is still `expected`
    async fn compare_and_set(&self, expected: IngestStatus, job: &IngestJob) -> Result<bool>;

    async fn list(&self) -> Result<Vec<IngestJob>>;
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    jobs: BTreeMap<u64, IngestJob>,
}

#[derive(Default)]
pub struct MemoryIngestJobStore {
    table: RwLock<JobTable>,
}

impl MemoryIngestJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngestJobStore for MemoryIngestJobStore {
    async fn insert(&self, mut job: IngestJob) -> Result<IngestJob> {
        let mut table = self.table.write();
        table.next_id += 1;
        job.id = table.next_id;
        table.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: u64) -> Result<IngestJob> {
        self.table
            .read()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| BossError::not_found(format!("Ingest job {} not found", id)))
    }

    async fn update(&self, job: &IngestJob) -> Result<()> {
        match self.table.write().jobs.get_mut(&job.id) {
            Some(row) => {
                *row = job.clone();
                Ok(())
            }
            None => Err(BossError::not_found(format!("Ingest job {} not found", job.id))),
        }
    }

    async fn compare_and_set(&self, expected: IngestStatus, job: &IngestJob) -> Result<bool> {
        match self.table.write().jobs.get_mut(&job.id) {
            Some(row) if row.status == expected => {
                *row = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BossError::not_found(format!("Ingest job {} not found", job.id))),
        }
    }

    async fn list(&self) -> Result<Vec<IngestJob>> {
        Ok(self.table.read().jobs.values().cloned().collect())
    }
}

fn tile_index_key(job_id: u64, chunk_key: &str) -> String {
    format!("TILE-INDEX&{}&{}", job_id, chunk_key)
}

/// Chunks with at least one indexed tile that have not been ingested yet
fn open_chunks_key(job_id: u64) -> String {
    format!("TILE-INDEX-OPEN&{}", job_id)
}

/// Chunks already written through cutout
fn ingested_chunks_key(job_id: u64) -> String {
    format!("TILE-INDEX-DONE&{}", job_id)
}

/// Tiles with an unresolved tile-error message
fn rejected_tiles_key(job_id: u64) -> String {
    format!("TILE-ERROR&{}", job_id)
}

fn tile_object_prefix(job_id: u64) -> String {
    format!("ingest/{}/", job_id)
}

fn tile_object_key(job_id: u64, tile_key: &str) -> String {
    format!("{}{}", tile_object_prefix(job_id), tile_key)
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    TileIndex,
    Ingest,
}

impl Stage {
    fn worker_name(&self, job_id: u64) -> String {
        match self {
            Stage::TileIndex => format!("ingest-{}-tile-index", job_id),
            Stage::Ingest => format!("ingest-{}-ingest", job_id),
        }
    }
}

/// Creates ingest jobs and drives them to completion
#[derive(Clone)]
pub struct IngestManager {
    ctx: Arc<CoreContext>,
}

impl IngestManager {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    fn config(&self) -> &crate::config::IngestConfig {
        &self.ctx.config.ingest
    }

    fn visibility(&self) -> Duration {
        Duration::from_secs(self.config().queue_visibility_secs)
    }

    async fn load(&self, job_id: u64) -> Result<IngestJob> {
        self.ctx.jobs.get(job_id).await
    }

    fn check_owner(principal: &Principal, job: &IngestJob) -> Result<()> {
        if principal.is_admin || principal.username == job.creator {
            Ok(())
        } else {
            Err(BossError::Permission(format!(
                "Only the creator or an admin can act on ingest job {}",
                job.id
            )))
        }
    }

    /// Queue at `url`, or None once it has been deleted
    async fn queue(&self, url: &Option<String>) -> Result<Option<Arc<dyn MessageQueue>>> {
        let Some(url) = url else { return Ok(None) };
        match self.ctx.queues.get(url).await {
            Ok(queue) => Ok(Some(queue)),
            Err(BossError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn required_queue(&self, url: &Option<String>, what: &str) -> Result<Arc<dyn MessageQueue>> {
        self.queue(url)
            .await?
            .ok_or_else(|| BossError::invalid_state("no queue", format!("Job has no {} queue", what)))
    }

    async fn queue_len(&self, url: &Option<String>) -> Result<usize> {
        match self.queue(url).await? {
            Some(queue) => queue.approximate_len().await,
            None => Ok(0),
        }
    }

    /// Register a job, create its queues and publish its upload tasks
    pub async fn create(&self, principal: &Principal, request: IngestJobRequest) -> Result<IngestJob> {
        let config = self.config();
        let resource = self
            .ctx
            .directory
            .resolve_names(&request.collection, &request.experiment, &request.channel)
            .await?;

        request.extent.validate()?;
        let frame = resource.frame.base_box();
        let e = &request.extent;
        if e.x.start < frame.x.start
            || e.x.end > frame.x.end
            || e.y.start < frame.y.start
            || e.y.end > frame.y.end
            || e.z.start < frame.z.start
            || e.z.end > frame.z.end
        {
            return Err(BossError::validation(
                "Ingest extent must lie within the coordinate frame",
            ));
        }
        if request.t.start >= request.t.end || request.t.end > resource.experiment.num_time_samples {
            return Err(BossError::validation(format!(
                "Time range {:?} is outside 0..{}",
                request.t, resource.experiment.num_time_samples
            )));
        }
        let [tx, ty, tz] = request.tile_size;
        if tx == 0 || ty == 0 {
            return Err(BossError::validation("Tile sizes must be positive"));
        }
        let (tile_size, z_chunk_size) = match request.ingest_type {
            IngestType::Tile => ([tx, ty, 1], config.tile_z_chunk_size),
            IngestType::Volumetric => {
                let depth = if tz == 0 { config.volumetric_z_chunk_size } else { tz };
                ([tx, ty, depth], depth)
            }
        };

        let voxels = e.num_voxels() * (request.t.end - request.t.start);
        if voxels > config.ingest_max_size && !principal.in_group(&config.large_ingest_group) {
            return Err(BossError::RequestTooLarge(format!(
                "Ingest of {} voxels exceeds {}; larger jobs require membership in {}",
                voxels, config.ingest_max_size, config.large_ingest_group
            )));
        }
        let cost = voxels * resource.dtype().size_in_bytes() as u64;
        ThrottleEngine::from_context(&self.ctx)
            .check(
                "ingest",
                MetricType::Ingress,
                &principal.username,
                cost as i64,
                MetricUnits::Bytes,
            )
            .await?;

        let job = IngestJob {
            id: 0,
            creator: principal.username.clone(),
            collection: request.collection,
            experiment: request.experiment,
            channel: request.channel,
            lookup: resource.lookup,
            resolution: resource.channel.base_resolution,
            ingest_type: request.ingest_type,
            extent: request.extent,
            t: request.t,
            tile_size,
            z_chunk_size,
            status: IngestStatus::Preparing,
            wait_on_queues_ts: None,
            upload_queue: None,
            ingest_queue: None,
            tile_index_queue: None,
            tile_error_queue: None,
            credentials: None,
            tile_count: 0,
            start_date: self.ctx.clock.now(),
            end_date: None,
        };
        let mut job = self.ctx.jobs.insert(job).await?;
        if let Err(e) = self.prepare(&mut job).await {
            error!(job = job.id, error = %e, "ingest job preparation failed");
            self.ctx.jobs.update(&job).await?;
            self.cleanup(job, IngestStatus::Failed).await?;
            return Err(e);
        }

        let mut ready = job.clone();
        ready.status = IngestStatus::Uploading;
        ready.credentials = Some(IngestCredentials::generate());
        if !self
            .ctx
            .jobs
            .compare_and_set(IngestStatus::Preparing, &ready)
            .await?
        {
            let current = self.load(job.id).await?;
            return Err(BossError::invalid_state(
                current.status,
                format!("Ingest job {} changed state while preparing", job.id),
            ));
        }
        info!(
            job = ready.id,
            resource = %format!("{}/{}/{}", ready.collection, ready.experiment, ready.channel),
            kind = ?ready.ingest_type,
            tiles = ready.tile_count,
            "ingest job created"
        );
        self.attach_worker(&ready, Stage::TileIndex);
        self.attach_worker(&ready, Stage::Ingest);
        Ok(ready)
    }

    async fn prepare(&self, job: &mut IngestJob) -> Result<()> {
        let queues = &self.ctx.queues;
        let upload = queues.create(&format!("ingest-{}-upload", job.id)).await?;
        job.upload_queue = Some(upload.url().to_string());
        if job.ingest_type == IngestType::Tile {
            for (slot, name) in [
                (&mut job.ingest_queue, "ingest"),
                (&mut job.tile_index_queue, "tile-index"),
                (&mut job.tile_error_queue, "tile-error"),
            ] {
                let queue = queues.create(&format!("ingest-{}-{}", job.id, name)).await?;
                *slot = Some(queue.url().to_string());
            }
        }
        let tasks = job.upload_tasks();
        let bodies = tasks
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        upload.send_batch(bodies).await?;
        job.tile_count = tasks.len() as u64;
        debug!(job = job.id, tasks = tasks.len(), "upload queue populated");
        Ok(())
    }

    /// Claim up to `max` upload tasks
    pub async fn receive_upload_tasks(
        &self,
        principal: &Principal,
        job_id: u64,
        max: usize,
    ) -> Result<Vec<UploadLease>> {
        let job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        if job.status != IngestStatus::Uploading {
            return Err(BossError::invalid_state(
                job.status,
                "Upload tasks are only handed out while uploading",
            ));
        }
        let queue = self.required_queue(&job.upload_queue, "upload").await?;
        let mut leases = Vec::new();
        for message in queue.receive(max, self.visibility()).await? {
            leases.push(UploadLease {
                task: serde_json::from_str(&message.body)?,
                receipt: message.receipt,
            });
        }
        Ok(leases)
    }

    /// Push the data for a claimed task
    ///
    /// Tiles are staged in the blob store and announced on the tile-index queue;
    /// volumetric chunks are written straight through the cutout path.
    pub async fn upload(
        &self,
        principal: &Principal,
        job_id: u64,
        lease: &UploadLease,
        data: &VoxelBlock,
    ) -> Result<()> {
        let job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        if !matches!(
            job.status,
            IngestStatus::Uploading | IngestStatus::WaitOnQueues
        ) {
            return Err(BossError::invalid_state(
                job.status,
                format!("Ingest job {} is not accepting uploads", job.id),
            ));
        }
        let task = &lease.task;
        if task.job_id != job.id {
            return Err(BossError::validation(format!(
                "Task belongs to ingest job {}",
                task.job_id
            )));
        }
        let resource = self.ctx.directory.resolve(&job.lookup).await?;
        let upload = self.required_queue(&job.upload_queue, "upload").await?;

        let problem = if data.dtype() != resource.dtype() {
            Some(BossError::validation_with(
                ErrorCode::DatatypeDoesNotMatch,
                format!("Expected {} data, got {}", resource.dtype(), data.dtype()),
            ))
        } else if data.shape() != task.shape() {
            Some(BossError::validation_with(
                ErrorCode::DataDimensionMismatch,
                format!("Expected shape {:?}, got {:?}", task.shape(), data.shape()),
            ))
        } else {
            None
        };

        match job.ingest_type {
            IngestType::Tile => {
                if let Some(problem) = problem {
                    let errors = self.required_queue(&job.tile_error_queue, "tile-error").await?;
                    if self
                        .ctx
                        .cache
                        .set_add(&rejected_tiles_key(job.id), &task.tile_key)
                        .await?
                    {
                        errors
                            .send(serde_json::to_string(&TileError {
                                job_id: job.id,
                                tile_key: task.tile_key.clone(),
                                reason: problem.to_string(),
                            })?)
                            .await?;
                    }
                    // the task goes back on the queue for another attempt
                    if let Err(e) = upload.change_visibility(&lease.receipt, Duration::ZERO).await {
                        debug!(job = job.id, error = %e, "lease of rejected tile already lapsed");
                    }
                    warn!(job = job.id, tile = %task.tile_key, error = %problem, "tile rejected");
                    return Err(problem);
                }
                let payload = self
                    .ctx
                    .codec
                    .encode(data.as_bytes(), data.dtype().size_in_bytes())?;
                self.ctx
                    .blob
                    .put(&tile_object_key(job.id, &task.tile_key), payload)
                    .await?;
                let index = self.required_queue(&job.tile_index_queue, "tile-index").await?;
                index.send(serde_json::to_string(task)?).await?;
                if self
                    .ctx
                    .cache
                    .set_remove(&rejected_tiles_key(job.id), &task.tile_key)
                    .await?
                {
                    self.clear_tile_errors(&job, &task.tile_key).await?;
                }
            }
            IngestType::Volumetric => {
                if let Some(problem) = problem {
                    return Err(problem);
                }
                let cutout = Cutout::new(job.resolution, task.region.clone())
                    .with_time(task.t..task.t + 1);
                CutoutEngine::new(self.ctx.clone())
                    .write(&resource, &cutout, data)
                    .await?;
            }
        }
        upload.delete(&lease.receipt).await?;
        debug!(job = job.id, tile = %task.tile_key, "upload accepted");
        Ok(())
    }

    /// Drop the tile-error messages of a tile that has since been accepted
    async fn clear_tile_errors(&self, job: &IngestJob, tile_key: &str) -> Result<usize> {
        let Some(errors) = self.queue(&job.tile_error_queue).await? else {
            return Ok(0);
        };
        let mut held = Vec::new();
        loop {
            let batch = errors.receive(10, self.visibility()).await?;
            if batch.is_empty() {
                break;
            }
            held.extend(batch);
        }
        let mut cleared = 0;
        for message in held {
            let ours = serde_json::from_str::<TileError>(&message.body)
                .map(|e| e.tile_key == tile_key)
                .unwrap_or(false);
            if ours {
                errors.delete(&message.receipt).await?;
                cleared += 1;
            } else {
                errors.change_visibility(&message.receipt, Duration::ZERO).await?;
            }
        }
        debug!(job = job.id, tile = %tile_key, cleared, "tile errors resolved");
        Ok(cleared)
    }

    /// Record visible tile-index messages; returns how many were handled
    pub async fn drain_tile_index(&self, job_id: u64) -> Result<usize> {
        let job = self.load(job_id).await?;
        let Some(queue) = self.queue(&job.tile_index_queue).await? else {
            return Ok(0);
        };
        let mut handled = 0;
        loop {
            let batch = queue.receive(10, self.visibility()).await?;
            if batch.is_empty() {
                break;
            }
            for message in batch {
                if self.load(job_id).await?.status == IngestStatus::Deleted {
                    info!(job = job_id, "job deleted, tile indexing aborted");
                    return Ok(handled);
                }
                match serde_json::from_str::<UploadTask>(&message.body) {
                    Ok(task) => self.index_tile(&job, &task).await?,
                    Err(e) => warn!(job = job_id, error = %e, "dropping malformed tile-index message"),
                }
                queue.delete(&message.receipt).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn index_tile(&self, job: &IngestJob, task: &UploadTask) -> Result<()> {
        let chunk = decode_chunk_key(&task.chunk_key)?;
        let set = tile_index_key(job.id, &task.chunk_key);
        let cache = &self.ctx.cache;
        if cache
            .set_members(&ingested_chunks_key(job.id))
            .await?
            .contains(&task.chunk_key)
        {
            debug!(job = job.id, tile = %task.tile_key, "tile of an ingested chunk ignored");
            return Ok(());
        }
        cache.set_add(&open_chunks_key(job.id), &task.chunk_key).await?;
        if !cache.set_add(&set, &task.tile_key).await? {
            return Ok(());
        }
        let uploaded = cache.set_members(&set).await?.len() as u64;
        if uploaded >= chunk.num_tiles {
            let ingest = self.required_queue(&job.ingest_queue, "ingest").await?;
            ingest
                .send(serde_json::to_string(&IngestTask {
                    job_id: job.id,
                    chunk_key: task.chunk_key.clone(),
                    region: job.chunk_region(chunk.chunk),
                    t: chunk.t,
                })?)
                .await?;
            debug!(job = job.id, chunk = %task.chunk_key, "chunk ready for ingest");
        }
        Ok(())
    }

    /// Assemble every visible ready chunk; returns how many were written
    pub async fn drain_ingest(&self, job_id: u64) -> Result<usize> {
        let job = self.load(job_id).await?;
        let Some(queue) = self.queue(&job.ingest_queue).await? else {
            return Ok(0);
        };
        let mut handled = 0;
        loop {
            let batch = queue.receive(10, self.visibility()).await?;
            if batch.is_empty() {
                break;
            }
            for message in batch {
                if self.load(job_id).await?.status == IngestStatus::Deleted {
                    info!(job = job_id, "job deleted, chunk ingest aborted");
                    return Ok(handled);
                }
                let task: IngestTask = match serde_json::from_str(&message.body) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(job = job_id, error = %e, "dropping malformed ingest message");
                        queue.delete(&message.receipt).await?;
                        continue;
                    }
                };
                match self.ingest_chunk(&job, &task).await {
                    Ok(()) => {
                        queue.delete(&message.receipt).await?;
                        handled += 1;
                    }
                    // left in flight; it becomes visible again after the timeout
                    Err(e) => warn!(job = job_id, chunk = %task.chunk_key, error = %e, "chunk ingest failed"),
                }
            }
        }
        Ok(handled)
    }

    async fn ingest_chunk(&self, job: &IngestJob, task: &IngestTask) -> Result<()> {
        let resource = self.ctx.directory.resolve(&job.lookup).await?;
        let dtype = resource.dtype();
        let chunk = decode_chunk_key(&task.chunk_key)?;
        let [nx, ny, nz] = task.region.extent().map(|v| v as usize);
        let slice_len = nx * ny * dtype.size_in_bytes();

        let mut block = VoxelBlock::zeros(dtype, [1, nz, ny, nx]);
        let mut objects = Vec::with_capacity(nz);
        for (i, tz) in task.region.z.clone().enumerate() {
            let tile_key = encode_tile_key(
                &job.lookup,
                job.resolution,
                chunk.chunk[0],
                chunk.chunk[1],
                tz,
                task.t,
            );
            let object = tile_object_key(job.id, &tile_key);
            let payload = self
                .ctx
                .blob
                .get(&object)
                .await?
                .ok_or_else(|| BossError::not_found(format!("Tile {} is missing", tile_key)))?;
            let raw = self.ctx.codec.decode(&payload, slice_len)?;
            let tile = VoxelBlock::from_bytes(dtype, [1, 1, ny, nx], raw)?;
            block.copy_region(0, &[0..nx, 0..ny, i..i + 1], &tile, 0, &[0..nx, 0..ny, 0..1])?;
            objects.push(object);
        }

        let cutout = Cutout::new(job.resolution, task.region.clone()).with_time(task.t..task.t + 1);
        CutoutEngine::new(self.ctx.clone())
            .write(&resource, &cutout, &block)
            .await?;

        self.ctx
            .cache
            .set_add(&ingested_chunks_key(job.id), &task.chunk_key)
            .await?;
        for object in &objects {
            self.ctx.blob.delete(object).await?;
        }
        self.close_chunk(job.id, &task.chunk_key).await?;
        debug!(job = job.id, chunk = %task.chunk_key, "chunk ingested");
        Ok(())
    }

    async fn close_chunk(&self, job_id: u64, chunk_key: &str) -> Result<()> {
        let cache = &self.ctx.cache;
        let set = tile_index_key(job_id, chunk_key);
        for member in cache.set_members(&set).await? {
            cache.set_remove(&set, &member).await?;
        }
        cache.set_remove(&open_chunks_key(job_id), chunk_key).await?;
        Ok(())
    }

    fn attach_worker(&self, job: &IngestJob, stage: Stage) {
        if !self.config().attach_workers || job.ingest_type == IngestType::Volumetric {
            return;
        }
        let manager = self.clone();
        let job_id = job.id;
        self.ctx
            .ensure_worker(&stage.worker_name(job_id), move |token| async move {
                manager.poll(job_id, stage, token).await
            });
    }

    async fn poll(&self, job_id: u64, stage: Stage, token: CancelToken) {
        let interval = Duration::from_millis(self.config().poll_interval_ms);
        while !token.is_cancelled() {
            match self.load(job_id).await {
                Ok(job) if job.status.is_terminal() => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(job = job_id, error = %e, "ingest worker lost its job");
                    break;
                }
            }
            let pass = match stage {
                Stage::TileIndex => self.drain_tile_index(job_id).await,
                Stage::Ingest => self.drain_ingest(job_id).await,
            };
            if let Err(e) = pass {
                warn!(job = job_id, stage = ?stage, error = %e, "ingest worker pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
        debug!(job = job_id, stage = ?stage, "ingest worker exiting");
    }

    /// Seconds left before a waiting job may start completing
    fn remaining_wait(&self, job: &IngestJob) -> u64 {
        let wait = self.config().wait_for_queues_secs;
        match job.wait_on_queues_ts {
            None => wait,
            Some(ts) => {
                let elapsed = (self.ctx.clock.now() - ts).num_seconds().max(0) as u64;
                wait.saturating_sub(elapsed)
            }
        }
    }

    async fn ensure_queues_empty(&self, job: &IngestJob) -> Result<()> {
        if self.queue_len(&job.upload_queue).await? > 0 {
            return Err(BossError::validation_with(
                ErrorCode::UploadQueueNotEmpty,
                "Upload queue is not empty. Finish uploading before completing the job.",
            ));
        }
        if job.ingest_type == IngestType::Volumetric {
            return Ok(());
        }
        if self.queue_len(&job.ingest_queue).await? > 0 {
            self.attach_worker(job, Stage::Ingest);
            return Err(BossError::validation_with(
                ErrorCode::IngestQueueNotEmpty,
                "Ingest queue is not empty. Chunks are still being written.",
            ));
        }
        if self.queue_len(&job.tile_index_queue).await? > 0 {
            return Err(BossError::validation_with(
                ErrorCode::TileIndexQueueNotEmpty,
                "Tile index queue is not empty. Uploaded tiles are still being recorded.",
            ));
        }
        if self.queue_len(&job.tile_error_queue).await? > 0 {
            return Err(BossError::validation_with(
                ErrorCode::TileErrorQueueNotEmpty,
                "Tile error queue is not empty. Some tiles failed validation.",
            ));
        }
        Ok(())
    }

    async fn try_enter_wait_on_queue_state(&self, job: IngestJob) -> Result<CompleteResponse> {
        if job.status == IngestStatus::WaitOnQueues {
            return Ok(CompleteResponse::new(
                IngestStatus::WaitOnQueues,
                self.remaining_wait(&job),
                202,
            ));
        }
        if job.status != IngestStatus::Uploading {
            return Err(BossError::invalid_state(
                job.status,
                "Only an uploading job can start waiting on its queues",
            ));
        }
        self.ensure_queues_empty(&job).await?;

        let mut next = job.clone();
        next.status = IngestStatus::WaitOnQueues;
        next.wait_on_queues_ts = Some(self.ctx.clock.now());
        if !self
            .ctx
            .jobs
            .compare_and_set(IngestStatus::Uploading, &next)
            .await?
        {
            next = self.load(job.id).await?;
            if next.status != IngestStatus::WaitOnQueues {
                return Err(BossError::invalid_state(
                    next.status,
                    format!("Ingest job {} changed state while entering wait", job.id),
                ));
            }
        }
        info!(job = job.id, "ingest job waiting on queues");
        Ok(CompleteResponse::new(
            IngestStatus::WaitOnQueues,
            self.remaining_wait(&next),
            202,
        ))
    }

    async fn try_start_completing(&self, job: IngestJob) -> Result<CompleteResponse> {
        if job.status == IngestStatus::Completing {
            return Ok(CompleteResponse::new(IngestStatus::Completing, 0, 202));
        }
        if let Err(e) = self.ensure_queues_empty(&job).await {
            if matches!(
                e.code(),
                ErrorCode::UploadQueueNotEmpty | ErrorCode::IngestQueueNotEmpty
            ) {
                let mut back = job.clone();
                back.status = IngestStatus::Uploading;
                if self
                    .ctx
                    .jobs
                    .compare_and_set(IngestStatus::WaitOnQueues, &back)
                    .await?
                {
                    warn!(job = job.id, code = %e.code(), "queues refilled, job back to uploading");
                }
            }
            return Err(e);
        }
        if job.status != IngestStatus::WaitOnQueues {
            return Err(BossError::invalid_state(
                job.status,
                "Only a job waiting on its queues can start completing",
            ));
        }
        let remaining = self.remaining_wait(&job);
        if remaining > 0 {
            return Ok(CompleteResponse::new(
                IngestStatus::WaitOnQueues,
                remaining,
                400,
            ));
        }

        let mut next = job.clone();
        next.status = IngestStatus::Completing;
        if self
            .ctx
            .jobs
            .compare_and_set(IngestStatus::WaitOnQueues, &next)
            .await?
        {
            info!(job = job.id, "ingest job completing");
            self.start_completion(job.id);
        } else {
            let current = self.load(job.id).await?;
            if current.status != IngestStatus::Completing {
                return Err(BossError::invalid_state(
                    current.status,
                    format!("Ingest job {} changed state while completing", job.id),
                ));
            }
        }
        Ok(CompleteResponse::new(IngestStatus::Completing, 0, 202))
    }

    fn start_completion(&self, job_id: u64) {
        if !self.config().attach_workers {
            return;
        }
        let manager = self.clone();
        self.ctx
            .ensure_worker(&format!("ingest-{}-complete", job_id), move |_token| async move {
                if let Err(e) = manager.run_completion(job_id).await {
                    error!(job = job_id, error = %e, "ingest completion failed");
                }
            });
    }

    /// Finish a COMPLETING job, failing it if any chunk was only partly uploaded
    pub async fn run_completion(&self, job_id: u64) -> Result<IngestStatus> {
        let job = self.load(job_id).await?;
        if job.status != IngestStatus::Completing {
            return Ok(job.status);
        }
        let open = self.ctx.cache.set_members(&open_chunks_key(job.id)).await?;
        let outcome = if open.is_empty() {
            IngestStatus::Complete
        } else {
            error!(job = job.id, chunks = open.len(), "partially uploaded chunks remain");
            IngestStatus::Failed
        };
        if !self.cleanup(job, outcome).await? {
            return Ok(self.load(job_id).await?.status);
        }
        info!(job = job_id, status = %outcome, "ingest job finished");
        Ok(outcome)
    }

    /// Move a job to `status`, then drop its queues, credentials and staged tiles
    async fn cleanup(&self, job: IngestJob, status: IngestStatus) -> Result<bool> {
        let mut next = job.clone();
        next.status = status;
        next.upload_queue = None;
        next.ingest_queue = None;
        next.tile_index_queue = None;
        next.tile_error_queue = None;
        next.credentials = None;
        next.end_date = Some(self.ctx.clock.now());
        if !self.ctx.jobs.compare_and_set(job.status, &next).await? {
            return Ok(false);
        }

        for url in job.queue_urls() {
            self.ctx.queues.delete(url).await?;
        }
        let cache = &self.ctx.cache;
        for chunk_key in cache.set_members(&open_chunks_key(job.id)).await? {
            self.close_chunk(job.id, &chunk_key).await?;
        }
        for set in [ingested_chunks_key(job.id), rejected_tiles_key(job.id)] {
            for member in cache.set_members(&set).await? {
                cache.set_remove(&set, &member).await?;
            }
        }
        for object in self.ctx.blob.list(&tile_object_prefix(job.id)).await? {
            self.ctx.blob.delete(&object).await?;
        }
        Ok(true)
    }

    /// Advance the completion state machine
    pub async fn complete(&self, principal: &Principal, job_id: u64) -> Result<CompleteResponse> {
        let job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        match job.status {
            IngestStatus::Preparing => Err(BossError::validation(
                "Cannot complete a job that is still preparing. Please wait.",
            )),
            IngestStatus::Uploading => self.try_enter_wait_on_queue_state(job).await,
            IngestStatus::WaitOnQueues => self.try_start_completing(job).await,
            IngestStatus::Completing => {
                Ok(CompleteResponse::new(IngestStatus::Completing, 0, 202))
            }
            IngestStatus::Complete => Ok(CompleteResponse::new(IngestStatus::Complete, 0, 204)),
            IngestStatus::Deleted => Err(BossError::validation(format!(
                "Ingest job {} has been deleted",
                job.id
            ))),
            IngestStatus::Failed => Err(BossError::validation(format!(
                "Ingest job {} has failed",
                job.id
            ))),
        }
    }

    /// Cancel a job, dropping its queues and staged tiles
    pub async fn delete(&self, principal: &Principal, job_id: u64) -> Result<()> {
        let job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        if matches!(job.status, IngestStatus::Complete | IngestStatus::Deleted) {
            return Err(BossError::invalid_state(
                job.status,
                format!("Ingest job {} has already finished", job.id),
            ));
        }
        if !self.cleanup(job, IngestStatus::Deleted).await? {
            return Err(BossError::Conflict(format!(
                "Ingest job {} changed state during delete",
                job_id
            )));
        }
        info!(job = job_id, "ingest job deleted");
        Ok(())
    }

    pub async fn status(&self, principal: &Principal, job_id: u64) -> Result<IngestStatusReport> {
        let job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        let current = match job.status {
            IngestStatus::Deleted => {
                return Err(BossError::validation(format!(
                    "Ingest job {} has been deleted",
                    job.id
                )))
            }
            IngestStatus::Complete => 0,
            _ => self.queue_len(&job.upload_queue).await? as u64,
        };
        Ok(IngestStatusReport {
            id: job.id,
            status: job.status,
            total_message_count: job.tile_count,
            current_message_count: current,
        })
    }

    /// Job details for a client joining the upload
    pub async fn join(&self, principal: &Principal, job_id: u64) -> Result<IngestJobView> {
        let mut job = self.load(job_id).await?;
        Self::check_owner(principal, &job)?;
        if job.status == IngestStatus::Deleted {
            return Err(BossError::validation(format!(
                "Ingest job {} has been deleted",
                job.id
            )));
        }
        let live = matches!(
            job.status,
            IngestStatus::Uploading | IngestStatus::WaitOnQueues | IngestStatus::Completing
        );
        let credentials = job.credentials.take().filter(|_| live);
        Ok(IngestJobView { job, credentials })
    }

    /// Non-deleted jobs of the caller, or of everyone for admins
    pub async fn list(&self, principal: &Principal) -> Result<Vec<IngestJob>> {
        Ok(self
            .ctx
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|j| j.status != IngestStatus::Deleted)
            .filter(|j| principal.is_admin || j.creator == principal.username)
            .map(|mut j| {
                j.credentials = None;
                j
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::context::ManualClock;
    use crate::directory::{ChannelSpec, MemoryDirectory};
    use crate::layout::{CoordinateFrame, CubeSize};
    use crate::types::AccessMode;
    use ndarray::Array4;

    struct Fixture {
        ingest: IngestManager,
        cutout: CutoutEngine,
        clock: Arc<ManualClock>,
        ctx: Arc<CoreContext>,
    }

    fn fixture_with(tweak: impl FnOnce(&mut CoreConfig)) -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let frame = CoordinateFrame::new(0..64, 0..64, 0..8, [4.0, 4.0, 35.0]).unwrap();
        directory
            .create_channel(ChannelSpec::image("col1", "exp1", "em", frame))
            .unwrap();
        let mut config = CoreConfig::default();
        config.cuboid.cube_size = CubeSize::new(16, 16, 4);
        config.ingest.tile_z_chunk_size = 4;
        config.ingest.attach_workers = false;
        tweak(&mut config);
        let clock = Arc::new(ManualClock::default());
        let ctx = CoreContext::builder(config)
            .directory(directory)
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture {
            ingest: IngestManager::new(ctx.clone()),
            cutout: CutoutEngine::new(ctx.clone()),
            clock,
            ctx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn request(ingest_type: IngestType, extent: Box3D, tile_size: [u64; 3]) -> IngestJobRequest {
        IngestJobRequest {
            collection: "col1".to_string(),
            experiment: "exp1".to_string(),
            channel: "em".to_string(),
            ingest_type,
            extent,
            t: 0..1,
            tile_size,
        }
    }

    fn tile_request() -> IngestJobRequest {
        request(
            IngestType::Tile,
            Box3D::new(0..32, 0..32, 0..8).unwrap(),
            [16, 16, 0],
        )
    }

    /// Data for a task, every voxel set to its slice index plus one
    fn tile_data(task: &UploadTask) -> VoxelBlock {
        let [t, z, y, x] = task.shape();
        let base = task.region.z.start as u8;
        VoxelBlock::from_typed(&Array4::from_shape_fn((t, z, y, x), |(_, dz, _, _)| {
            base + dz as u8 + 1
        }))
    }

    async fn upload_all(f: &Fixture, who: &Principal, job_id: u64) -> usize {
        let mut uploaded = 0;
        loop {
            let leases = f.ingest.receive_upload_tasks(who, job_id, 10).await.unwrap();
            if leases.is_empty() {
                break;
            }
            for lease in &leases {
                f.ingest
                    .upload(who, job_id, lease, &tile_data(&lease.task))
                    .await
                    .unwrap();
                uploaded += 1;
            }
        }
        uploaded
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&IngestStatus::WaitOnQueues).unwrap(),
            "\"WAIT_ON_QUEUES\""
        );
        assert!(IngestStatus::Failed.is_terminal());
        assert!(!IngestStatus::Completing.is_terminal());
    }

    #[tokio::test]
    async fn test_tile_job_runs_to_completion() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f.ingest.create(&alice, tile_request()).await.unwrap();
        assert_eq!(job.status, IngestStatus::Uploading);
        assert_eq!(job.tile_count, 32);
        assert!(job.credentials.is_some());

        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UploadQueueNotEmpty);
        assert_eq!(err.http_status(), 400);

        let report = f.ingest.status(&alice, job.id).await.unwrap();
        assert_eq!(report.total_message_count, 32);
        assert_eq!(report.current_message_count, 32);

        assert_eq!(upload_all(&f, &alice, job.id).await, 32);
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 32);
        assert_eq!(f.ingest.drain_ingest(job.id).await.unwrap(), 8);

        let first = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(first.job_status, IngestStatus::WaitOnQueues);
        assert_eq!(first.wait_secs, 180);
        assert_eq!(first.http_status, 202);

        f.clock.advance(chrono::Duration::seconds(60));
        let early = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(early.job_status, IngestStatus::WaitOnQueues);
        assert_eq!(early.wait_secs, 120);
        assert_eq!(early.http_status, 400);

        f.clock.advance(chrono::Duration::seconds(120));
        let started = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(started.job_status, IngestStatus::Completing);
        assert_eq!(started.http_status, 202);
        assert_eq!(
            f.ingest.run_completion(job.id).await.unwrap(),
            IngestStatus::Complete
        );

        let report = f.ingest.status(&alice, job.id).await.unwrap();
        assert_eq!(report.status, IngestStatus::Complete);
        assert_eq!(report.current_message_count, 0);
        let done = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(done.job_status, IngestStatus::Complete);
        assert_eq!(done.http_status, 204);

        let view = f.ingest.join(&alice, job.id).await.unwrap();
        assert!(view.credentials.is_none());
        assert!(view.job.upload_queue.is_none());
        assert!(view.job.end_date.is_some());

        let resource = f
            .ctx
            .directory
            .resolve_names("col1", "exp1", "em")
            .await
            .unwrap();
        let block = f
            .cutout
            .read(
                &resource,
                &Cutout::new(0, Box3D::new(0..32, 0..32, 0..8).unwrap()),
                AccessMode::Cache,
                None,
            )
            .await
            .unwrap();
        let voxels = block.typed::<u8>().unwrap();
        assert_eq!(voxels[[0, 0, 0, 0]], 1);
        assert_eq!(voxels[[0, 5, 20, 31]], 6);
        assert_eq!(voxels[[0, 7, 31, 31]], 8);
    }

    #[tokio::test]
    async fn test_partial_chunk_fails_job() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f.ingest.create(&alice, tile_request()).await.unwrap();

        let leases = f.ingest.receive_upload_tasks(&alice, job.id, 1).await.unwrap();
        f.ingest
            .upload(&alice, job.id, &leases[0], &tile_data(&leases[0].task))
            .await
            .unwrap();
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 1);
        assert_eq!(f.ingest.drain_ingest(job.id).await.unwrap(), 0);

        // tasks abandoned by the client
        let upload = job.upload_queue.clone().unwrap();
        f.ctx.queues.get(&upload).await.unwrap().purge().await.unwrap();

        f.ingest.complete(&alice, job.id).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(180));
        f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(
            f.ingest.run_completion(job.id).await.unwrap(),
            IngestStatus::Failed
        );
        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_refilled_queue_returns_job_to_uploading() {
        let f = fixture_with(|c| c.ingest.wait_for_queues_secs = 0);
        let alice = Principal::user("alice");
        let job = f.ingest.create(
            &alice,
            request(IngestType::Tile, Box3D::new(0..16, 0..16, 0..1).unwrap(), [16, 16, 0]),
        )
        .await
        .unwrap();
        upload_all(&f, &alice, job.id).await;
        f.ingest.drain_tile_index(job.id).await.unwrap();

        // ingest queue still holds the chunk
        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::IngestQueueNotEmpty);

        f.ingest.drain_ingest(job.id).await.unwrap();
        let waiting = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(waiting.job_status, IngestStatus::WaitOnQueues);
        assert_eq!(waiting.wait_secs, 0);

        let stray = f.ctx.queues.get(job.ingest_queue.as_ref().unwrap()).await.unwrap();
        stray.send("{}".to_string()).await.unwrap();
        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::IngestQueueNotEmpty);
        let report = f.ingest.status(&alice, job.id).await.unwrap();
        assert_eq!(report.status, IngestStatus::Uploading);
    }

    async fn queue_len(f: &Fixture, url: &Option<String>) -> usize {
        let queue = f.ctx.queues.get(url.as_ref().unwrap()).await.unwrap();
        queue.approximate_len().await.unwrap()
    }

    async fn single_tile_job(f: &Fixture, who: &Principal) -> IngestJob {
        f.ingest
            .create(
                who,
                request(IngestType::Tile, Box3D::new(0..16, 0..16, 0..1).unwrap(), [16, 16, 0]),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_tile_stays_retryable() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = single_tile_job(&f, &alice).await;
        assert_eq!(job.tile_count, 1);
        let leases = f.ingest.receive_upload_tasks(&alice, job.id, 10).await.unwrap();
        let wrong = VoxelBlock::zeros(crate::types::DataType::U8, [1, 1, 8, 8]);
        let err = f
            .ingest
            .upload(&alice, job.id, &leases[0], &wrong)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataDimensionMismatch);
        assert_eq!(queue_len(&f, &job.upload_queue).await, 1);
        assert_eq!(queue_len(&f, &job.tile_error_queue).await, 1);

        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UploadQueueNotEmpty);

        f.ingest
            .upload(&alice, job.id, &leases[0], &tile_data(&leases[0].task))
            .await
            .unwrap();
        assert_eq!(queue_len(&f, &job.upload_queue).await, 0);
        assert_eq!(queue_len(&f, &job.tile_error_queue).await, 0);
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 1);
        assert_eq!(f.ingest.drain_ingest(job.id).await.unwrap(), 1);

        let waiting = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(waiting.job_status, IngestStatus::WaitOnQueues);
        f.clock.advance(chrono::Duration::seconds(180));
        let started = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(started.job_status, IngestStatus::Completing);
        assert_eq!(
            f.ingest.run_completion(job.id).await.unwrap(),
            IngestStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_unresolved_tile_error_blocks_completion() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = single_tile_job(&f, &alice).await;
        let wrong = VoxelBlock::zeros(crate::types::DataType::U16, [1, 1, 16, 16]);
        for _ in 0..2 {
            let leases = f.ingest.receive_upload_tasks(&alice, job.id, 10).await.unwrap();
            let err = f
                .ingest
                .upload(&alice, job.id, &leases[0], &wrong)
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::DatatypeDoesNotMatch);
        }
        // one entry per tile, however often it is rejected
        assert_eq!(queue_len(&f, &job.tile_error_queue).await, 1);

        // tasks abandoned by the client
        let upload = job.upload_queue.clone().unwrap();
        f.ctx.queues.get(&upload).await.unwrap().purge().await.unwrap();
        let err = f.ingest.complete(&alice, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TileErrorQueueNotEmpty);
    }

    #[tokio::test]
    async fn test_redelivered_tile_after_ingest_is_ignored() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f.ingest.create(&alice, tile_request()).await.unwrap();
        let first = f.ingest.receive_upload_tasks(&alice, job.id, 1).await.unwrap();
        let first = first[0].clone();
        f.ingest
            .upload(&alice, job.id, &first, &tile_data(&first.task))
            .await
            .unwrap();
        assert_eq!(upload_all(&f, &alice, job.id).await, 31);
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 32);
        assert_eq!(f.ingest.drain_ingest(job.id).await.unwrap(), 8);

        // client retry of a tile whose chunk is already written
        f.ingest
            .upload(&alice, job.id, &first, &tile_data(&first.task))
            .await
            .unwrap();
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 1);
        assert_eq!(f.ingest.drain_ingest(job.id).await.unwrap(), 0);

        f.ingest.complete(&alice, job.id).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(180));
        let started = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(started.job_status, IngestStatus::Completing);
        assert_eq!(
            f.ingest.run_completion(job.id).await.unwrap(),
            IngestStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_volumetric_job_writes_chunks_directly() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f
            .ingest
            .create(
                &alice,
                request(
                    IngestType::Volumetric,
                    Box3D::new(0..32, 0..32, 0..8).unwrap(),
                    [16, 16, 4],
                ),
            )
            .await
            .unwrap();
        assert_eq!(job.tile_count, 8);
        assert!(job.ingest_queue.is_none());

        assert_eq!(upload_all(&f, &alice, job.id).await, 8);
        let waiting = f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(waiting.job_status, IngestStatus::WaitOnQueues);
        assert!(f.ingest.join(&alice, job.id).await.unwrap().credentials.is_some());

        f.clock.advance(chrono::Duration::seconds(180));
        f.ingest.complete(&alice, job.id).await.unwrap();
        assert_eq!(
            f.ingest.run_completion(job.id).await.unwrap(),
            IngestStatus::Complete
        );

        let resource = f
            .ctx
            .directory
            .resolve_names("col1", "exp1", "em")
            .await
            .unwrap();
        let block = f
            .cutout
            .read(
                &resource,
                &Cutout::new(0, Box3D::new(0..32, 0..32, 4..8).unwrap()),
                AccessMode::Cache,
                None,
            )
            .await
            .unwrap();
        let voxels = block.typed::<u8>().unwrap();
        assert_eq!(voxels[[0, 0, 0, 0]], 5);
        assert_eq!(voxels[[0, 3, 31, 31]], 8);
    }

    #[tokio::test]
    async fn test_delete_aborts_workers() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f.ingest.create(&alice, tile_request()).await.unwrap();
        let leases = f.ingest.receive_upload_tasks(&alice, job.id, 2).await.unwrap();
        for lease in &leases {
            f.ingest
                .upload(&alice, job.id, lease, &tile_data(&lease.task))
                .await
                .unwrap();
        }

        f.ingest.delete(&alice, job.id).await.unwrap();
        assert_eq!(f.ingest.drain_tile_index(job.id).await.unwrap(), 0);
        assert!(f.ctx.queues.get(job.upload_queue.as_ref().unwrap()).await.is_err());
        assert!(f.ctx.blob.list(&tile_object_prefix(job.id)).await.unwrap().is_empty());

        assert_eq!(f.ingest.status(&alice, job.id).await.unwrap_err().http_status(), 400);
        assert_eq!(f.ingest.complete(&alice, job.id).await.unwrap_err().http_status(), 400);
        assert_eq!(f.ingest.delete(&alice, job.id).await.unwrap_err().http_status(), 400);
    }

    #[tokio::test]
    async fn test_only_creator_or_admin() {
        let f = fixture();
        let alice = Principal::user("alice");
        let job = f.ingest.create(&alice, tile_request()).await.unwrap();
        let err = f
            .ingest
            .complete(&Principal::user("mallory"), job.id)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert!(f.ingest.status(&Principal::admin("root"), job.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_hides_deleted_and_foreign_jobs() {
        let f = fixture();
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        let a = f.ingest.create(&alice, tile_request()).await.unwrap();
        f.ingest.create(&bob, tile_request()).await.unwrap();

        let mine = f.ingest.list(&alice).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].credentials.is_none());
        assert_eq!(f.ingest.list(&Principal::admin("root")).await.unwrap().len(), 2);

        f.ingest.delete(&alice, a.id).await.unwrap();
        assert!(f.ingest.list(&alice).await.unwrap().is_empty());
        assert_eq!(f.ingest.list(&Principal::admin("root")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_large_ingest_needs_group() {
        let f = fixture_with(|c| c.ingest.ingest_max_size = 1000);
        let err = f
            .ingest
            .create(&Principal::user("alice"), tile_request())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 413);

        let mut member = Principal::user("alice");
        member.groups.push("bossingest-large".to_string());
        assert!(f.ingest.create(&member, tile_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_extent_outside_frame_rejected() {
        let f = fixture();
        let err = f
            .ingest
            .create(
                &Principal::user("alice"),
                request(IngestType::Tile, Box3D::new(0..128, 0..32, 0..8).unwrap(), [16, 16, 0]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
