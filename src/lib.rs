//! Cuboidstore - cuboid-addressed tiered volume store
//!
//! Stores very large 3D/4D image and annotation volumes as fixed-size cuboids behind a
//! three-tier store: an in-process cache with write-back overlay, a blob store of
//! versioned compressed cuboids, and an index of which versions exist.
//!
//! # Features
//!
//! - Arbitrary subvolume reads and writes mapped onto cuboids (cutouts)
//! - Background flush with per-key versioning and poison escalation
//! - Annotation id index, bounding boxes and id reservation
//! - Tile and volumetric ingest with a queue-draining completion state machine
//! - Resolution hierarchy downsampling with cancellation
//! - Monthly usage throttling per user, API and system
//!
//! Every backend sits behind a trait with an in-memory implementation, so a complete
//! store can be assembled with [`CoreContext::in_memory`].
//!
//! # Example
//!
//! ```rust,ignore
//! use cuboidstore::{CoreConfig, CoreContext, Cutout, CutoutEngine, FlushEngine};
//!
//! # async fn example(resource: cuboidstore::ResourceDescriptor) -> cuboidstore::Result<()> {
//! let ctx = CoreContext::in_memory(CoreConfig::default())?;
//! FlushEngine::new(ctx.clone()).start();
//!
//! let cutout = Cutout::new(0, cuboidstore::Box3D::new(0..512, 0..512, 0..16)?);
//! let block = CutoutEngine::new(ctx)
//!     .read(&resource, &cutout, cuboidstore::AccessMode::Cache, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod annotation;
pub mod blob;
pub mod cache;
pub mod compression;
pub mod config;
pub mod context;
pub mod cuboid;
pub mod cutout;
pub mod directory;
pub mod downsample;
pub mod error;
pub mod executor;
pub mod flush;
pub mod index;
pub mod ingest;
pub mod keys;
pub mod layout;
pub mod queue;
pub mod request;
pub mod store;
pub mod throttle;
pub mod types;
pub mod utils;

// Re-exports
pub use annotation::AnnotationService;
pub use blob::{BlobStore, StorageBackend};
pub use compression::{CompressionMethod, Compressor, CuboidCodec};
pub use config::CoreConfig;
pub use context::{Clock, CoreContext, ManualClock, SystemClock};
pub use cuboid::VoxelBlock;
pub use cutout::{Cutout, CutoutEngine};
pub use directory::{Principal, ResourceDescriptor, ResourceDirectory};
pub use downsample::DownsampleManager;
pub use error::{BossError, ErrorCode, Result};
pub use flush::FlushEngine;
pub use ingest::{IngestManager, IngestStatus};
pub use keys::{CuboidKey, LookupKey};
pub use layout::{CoordinateFrame, CubeSize, Hierarchy};
pub use request::{Request, RequestHandler};
pub use store::TieredStore;
pub use throttle::ThrottleEngine;
pub use types::{AccessMode, Box3D, DataType, DownsampleStatus};

/// Version of the cuboidstore implementation
pub const CUBOIDSTORE_VERSION: &str = env!("CARGO_PKG_VERSION");
