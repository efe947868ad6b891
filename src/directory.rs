//! Resource directory: the read-mostly catalog of collections, experiments, frames and channels

use crate::error::{BossError, Result};
use crate::keys::LookupKey;
use crate::layout::{CoordinateFrame, Hierarchy};
use crate::types::{ChannelKind, DataType, DownsampleStatus, HierarchyMethod};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: u64,
    pub name: String,
    pub collection_id: u64,
    pub hierarchy_method: HierarchyMethod,
    pub num_hierarchy_levels: u32,
    pub num_time_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub name: String,
    pub experiment_id: u64,
    pub kind: ChannelKind,
    pub dtype: DataType,
    pub base_resolution: u32,
    pub downsample_status: DownsampleStatus,
    pub downsample_arn: Option<String>,
    #[serde(default)]
    pub sources: Vec<u64>,
    #[serde(default)]
    pub related: Vec<u64>,
}

/// Everything the core needs to know about one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub collection: Collection,
    pub experiment: Experiment,
    pub frame: CoordinateFrame,
    pub channel: Channel,
    pub lookup: LookupKey,
}

impl ResourceDescriptor {
    /// `<collection>&<experiment>&<channel>` by name
    pub fn boss_key(&self) -> String {
        boss_key(&self.collection.name, &self.experiment.name, &self.channel.name)
    }

    pub fn is_annotation(&self) -> bool {
        self.channel.kind == ChannelKind::Annotation
    }

    pub fn dtype(&self) -> DataType {
        self.channel.dtype
    }

    pub fn hierarchy(&self) -> Hierarchy {
        Hierarchy::new(
            self.experiment.hierarchy_method,
            self.experiment.num_hierarchy_levels,
            &self.frame,
        )
    }
}

pub fn boss_key(collection: &str, experiment: &str, channel: &str) -> String {
    format!("{}&{}&{}", collection, experiment, channel)
}

/// Caller identity, already authenticated at the edge
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub is_admin: bool,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Principal {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: true,
            groups: Vec::new(),
        }
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn resolve(&self, lookup: &LookupKey) -> Result<ResourceDescriptor>;

    async fn resolve_names(
        &self,
        collection: &str,
        experiment: &str,
        channel: &str,
    ) -> Result<ResourceDescriptor>;

    /// Set the status to `new` only if it currently equals `expected`
    async fn cas_downsample_status(
        &self,
        channel_id: u64,
        expected: DownsampleStatus,
        new: DownsampleStatus,
    ) -> Result<bool>;

    async fn update_downsample_arn(&self, channel_id: u64, arn: Option<String>) -> Result<()>;

    /// Add `count` to the channel's id counter, returning the previous value
    async fn increment_id_counter(&self, channel_id: u64, count: u64) -> Result<u64>;
}

/// Parameters for registering a channel in a [`MemoryDirectory`]
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub collection: String,
    pub experiment: String,
    pub channel: String,
    pub frame: CoordinateFrame,
    pub hierarchy_method: HierarchyMethod,
    pub num_hierarchy_levels: u32,
    pub num_time_samples: u64,
    pub kind: ChannelKind,
    pub dtype: DataType,
}

impl ChannelSpec {
    pub fn image(collection: &str, experiment: &str, channel: &str, frame: CoordinateFrame) -> Self {
        Self {
            collection: collection.to_string(),
            experiment: experiment.to_string(),
            channel: channel.to_string(),
            frame,
            hierarchy_method: HierarchyMethod::Slice,
            num_hierarchy_levels: 1,
            num_time_samples: 1,
            kind: ChannelKind::Image,
            dtype: DataType::U8,
        }
    }

    pub fn annotation(
        collection: &str,
        experiment: &str,
        channel: &str,
        frame: CoordinateFrame,
    ) -> Self {
        Self {
            kind: ChannelKind::Annotation,
            dtype: DataType::U64,
            ..Self::image(collection, experiment, channel, frame)
        }
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_hierarchy(mut self, method: HierarchyMethod, levels: u32) -> Self {
        self.hierarchy_method = method;
        self.num_hierarchy_levels = levels;
        self
    }

    pub fn with_time_samples(mut self, samples: u64) -> Self {
        self.num_time_samples = samples;
        self
    }
}

#[derive(Default)]
struct DirectoryState {
    next_id: u64,
    descriptors: HashMap<LookupKey, ResourceDescriptor>,
    by_channel: HashMap<u64, LookupKey>,
    id_counters: HashMap<u64, u64>,
}

/// In-memory resource directory
#[derive(Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, creating its collection and experiment if needed
    pub fn create_channel(&self, spec: ChannelSpec) -> Result<ResourceDescriptor> {
        spec.frame.validate()?;
        if spec.kind == ChannelKind::Annotation && spec.dtype != DataType::U64 {
            return Err(BossError::validation("Annotation channels must be uint64"));
        }
        if spec.num_hierarchy_levels == 0 {
            return Err(BossError::validation("A channel needs at least one resolution level"));
        }

        let mut state = self.state.write();
        if state.descriptors.values().any(|d| {
            d.collection.name == spec.collection
                && d.experiment.name == spec.experiment
                && d.channel.name == spec.channel
        }) {
            return Err(BossError::Conflict(format!(
                "Channel {} already exists",
                boss_key(&spec.collection, &spec.experiment, &spec.channel)
            )));
        }
        let reuse = state
            .descriptors
            .values()
            .find(|d| d.collection.name == spec.collection && d.experiment.name == spec.experiment)
            .map(|d| (d.collection.clone(), d.experiment.clone()));
        let collection_match = state
            .descriptors
            .values()
            .find(|d| d.collection.name == spec.collection)
            .map(|d| d.collection.clone());

        let (collection, experiment) = match reuse {
            Some(pair) => pair,
            None => {
                let collection = match collection_match {
                    Some(c) => c,
                    None => {
                        state.next_id += 1;
                        Collection {
                            id: state.next_id,
                            name: spec.collection.clone(),
                        }
                    }
                };
                state.next_id += 1;
                let experiment = Experiment {
                    id: state.next_id,
                    name: spec.experiment.clone(),
                    collection_id: collection.id,
                    hierarchy_method: spec.hierarchy_method,
                    num_hierarchy_levels: spec.num_hierarchy_levels,
                    num_time_samples: spec.num_time_samples,
                };
                (collection, experiment)
            }
        };

        state.next_id += 1;
        let channel = Channel {
            id: state.next_id,
            name: spec.channel,
            experiment_id: experiment.id,
            kind: spec.kind,
            dtype: spec.dtype,
            base_resolution: 0,
            downsample_status: DownsampleStatus::NotDownsampled,
            downsample_arn: None,
            sources: Vec::new(),
            related: Vec::new(),
        };
        let lookup = LookupKey::new(collection.id, experiment.id, channel.id);
        let descriptor = ResourceDescriptor {
            collection,
            experiment,
            frame: spec.frame,
            channel,
            lookup,
        };
        state.by_channel.insert(descriptor.channel.id, lookup);
        state.descriptors.insert(lookup, descriptor.clone());
        Ok(descriptor)
    }

    fn with_channel<T>(
        &self,
        channel_id: u64,
        f: impl FnOnce(&mut Channel) -> T,
    ) -> Result<T> {
        let mut state = self.state.write();
        let lookup = *state
            .by_channel
            .get(&channel_id)
            .ok_or_else(|| BossError::not_found(format!("Channel {} not found", channel_id)))?;
        let descriptor = state
            .descriptors
            .get_mut(&lookup)
            .ok_or_else(|| BossError::not_found(format!("Channel {} not found", channel_id)))?;
        Ok(f(&mut descriptor.channel))
    }
}

#[async_trait]
impl ResourceDirectory for MemoryDirectory {
    async fn resolve(&self, lookup: &LookupKey) -> Result<ResourceDescriptor> {
        self.state
            .read()
            .descriptors
            .get(lookup)
            .cloned()
            .ok_or_else(|| BossError::not_found(format!("No resource with lookup key {}", lookup)))
    }

    async fn resolve_names(
        &self,
        collection: &str,
        experiment: &str,
        channel: &str,
    ) -> Result<ResourceDescriptor> {
        self.state
            .read()
            .descriptors
            .values()
            .find(|d| {
                d.collection.name == collection
                    && d.experiment.name == experiment
                    && d.channel.name == channel
            })
            .cloned()
            .ok_or_else(|| {
                BossError::not_found(format!(
                    "Resource {} not found",
                    boss_key(collection, experiment, channel)
                ))
            })
    }

    async fn cas_downsample_status(
        &self,
        channel_id: u64,
        expected: DownsampleStatus,
        new: DownsampleStatus,
    ) -> Result<bool> {
        self.with_channel(channel_id, |channel| {
            if channel.downsample_status == expected {
                channel.downsample_status = new;
                true
            } else {
                false
            }
        })
    }

    async fn update_downsample_arn(&self, channel_id: u64, arn: Option<String>) -> Result<()> {
        self.with_channel(channel_id, |channel| channel.downsample_arn = arn)
    }

    async fn increment_id_counter(&self, channel_id: u64, count: u64) -> Result<u64> {
        let mut state = self.state.write();
        if !state.by_channel.contains_key(&channel_id) {
            return Err(BossError::not_found(format!("Channel {} not found", channel_id)));
        }
        let counter = state.id_counters.entry(channel_id).or_insert(0);
        let previous = *counter;
        *counter += count;
        Ok(previous)
    }
}

/// Descriptor cache in front of a directory, keyed by lookup key and by name
pub struct CachedDirectory {
    inner: Arc<dyn ResourceDirectory>,
    by_lookup: RwLock<HashMap<LookupKey, ResourceDescriptor>>,
    by_boss_key: RwLock<HashMap<String, LookupKey>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn ResourceDirectory>) -> Self {
        Self {
            inner,
            by_lookup: RwLock::new(HashMap::new()),
            by_boss_key: RwLock::new(HashMap::new()),
        }
    }

    fn remember(&self, descriptor: &ResourceDescriptor) {
        self.by_lookup
            .write()
            .insert(descriptor.lookup, descriptor.clone());
        self.by_boss_key
            .write()
            .insert(descriptor.boss_key(), descriptor.lookup);
    }

    pub fn invalidate_channel(&self, channel_id: u64) {
        let mut by_lookup = self.by_lookup.write();
        let doomed: Vec<(LookupKey, String)> = by_lookup
            .values()
            .filter(|d| d.channel.id == channel_id)
            .map(|d| (d.lookup, d.boss_key()))
            .collect();
        let mut by_boss_key = self.by_boss_key.write();
        for (lookup, name) in doomed {
            by_lookup.remove(&lookup);
            by_boss_key.remove(&name);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.by_lookup.read().len()
    }
}

#[async_trait]
impl ResourceDirectory for CachedDirectory {
    async fn resolve(&self, lookup: &LookupKey) -> Result<ResourceDescriptor> {
        let hit = self.by_lookup.read().get(lookup).cloned();
        if let Some(hit) = hit {
            return Ok(hit);
        }
        let descriptor = self.inner.resolve(lookup).await?;
        self.remember(&descriptor);
        Ok(descriptor)
    }

    async fn resolve_names(
        &self,
        collection: &str,
        experiment: &str,
        channel: &str,
    ) -> Result<ResourceDescriptor> {
        let name = boss_key(collection, experiment, channel);
        let lookup = self.by_boss_key.read().get(&name).copied();
        let cached = lookup.and_then(|lookup| self.by_lookup.read().get(&lookup).cloned());
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let descriptor = self.inner.resolve_names(collection, experiment, channel).await?;
        self.remember(&descriptor);
        Ok(descriptor)
    }

    async fn cas_downsample_status(
        &self,
        channel_id: u64,
        expected: DownsampleStatus,
        new: DownsampleStatus,
    ) -> Result<bool> {
        let swapped = self
            .inner
            .cas_downsample_status(channel_id, expected, new)
            .await?;
        self.invalidate_channel(channel_id);
        Ok(swapped)
    }

    async fn update_downsample_arn(&self, channel_id: u64, arn: Option<String>) -> Result<()> {
        self.inner.update_downsample_arn(channel_id, arn).await?;
        self.invalidate_channel(channel_id);
        Ok(())
    }

    async fn increment_id_counter(&self, channel_id: u64, count: u64) -> Result<u64> {
        self.inner.increment_id_counter(channel_id, count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> CoordinateFrame {
        CoordinateFrame::new(0..2048, 0..2048, 0..64, [4.0, 4.0, 35.0]).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let dir = MemoryDirectory::new();
        let a = dir.create_channel(ChannelSpec::image("col1", "exp1", "chan1", frame())).unwrap();
        let b = dir.create_channel(ChannelSpec::image("col1", "exp1", "chan2", frame())).unwrap();
        assert_eq!(a.lookup.collection, b.lookup.collection);
        assert_eq!(a.lookup.experiment, b.lookup.experiment);
        assert_ne!(a.lookup.channel, b.lookup.channel);

        let resolved = dir.resolve_names("col1", "exp1", "chan2").await.unwrap();
        assert_eq!(resolved.lookup, b.lookup);
        assert_eq!(dir.resolve(&a.lookup).await.unwrap().boss_key(), "col1&exp1&chan1");
        assert!(dir.resolve_names("col1", "exp1", "nope").await.is_err());
        assert!(dir.create_channel(ChannelSpec::image("col1", "exp1", "chan1", frame())).is_err());
    }

    #[tokio::test]
    async fn test_annotation_requires_u64() {
        let dir = MemoryDirectory::new();
        let spec = ChannelSpec::annotation("c", "e", "ann", frame()).with_dtype(DataType::U8);
        assert!(dir.create_channel(spec).is_err());
    }

    #[tokio::test]
    async fn test_cas_downsample_status() {
        let dir = MemoryDirectory::new();
        let d = dir.create_channel(ChannelSpec::image("c", "e", "ch", frame())).unwrap();
        let id = d.channel.id;
        assert!(dir
            .cas_downsample_status(id, DownsampleStatus::NotDownsampled, DownsampleStatus::Queued)
            .await
            .unwrap());
        assert!(!dir
            .cas_downsample_status(id, DownsampleStatus::NotDownsampled, DownsampleStatus::Queued)
            .await
            .unwrap());
        let now = dir.resolve(&d.lookup).await.unwrap();
        assert_eq!(now.channel.downsample_status, DownsampleStatus::Queued);
    }

    #[tokio::test]
    async fn test_id_counter() {
        let dir = MemoryDirectory::new();
        let d = dir.create_channel(ChannelSpec::annotation("c", "e", "ann", frame())).unwrap();
        assert_eq!(dir.increment_id_counter(d.channel.id, 10).await.unwrap(), 0);
        assert_eq!(dir.increment_id_counter(d.channel.id, 5).await.unwrap(), 10);
        assert!(dir.increment_id_counter(999, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_directory_invalidates_on_mutation() {
        let inner = Arc::new(MemoryDirectory::new());
        let d = inner.create_channel(ChannelSpec::image("c", "e", "ch", frame())).unwrap();
        let cached = CachedDirectory::new(inner.clone());

        cached.resolve_names("c", "e", "ch").await.unwrap();
        assert_eq!(cached.cached_len(), 1);

        cached
            .cas_downsample_status(
                d.channel.id,
                DownsampleStatus::NotDownsampled,
                DownsampleStatus::Queued,
            )
            .await
            .unwrap();
        assert_eq!(cached.cached_len(), 0);
        let fresh = cached.resolve(&d.lookup).await.unwrap();
        assert_eq!(fresh.channel.downsample_status, DownsampleStatus::Queued);
    }
}
