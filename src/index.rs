//! Tier-3 tables: the cuboid index and the annotation ID index

use crate::error::{BossError, Result};
use crate::keys::{channel_prefix, CuboidKey, LookupKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

/// One persisted cuboid version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    /// Canonical key including the version
    pub cuboid_key: String,
    pub lookup_key: String,
    pub res: u32,
    pub morton: u64,
    pub t: u64,
    pub version: u64,
    pub write_time: DateTime<Utc>,
    pub byte_len: u64,
    pub object_key: String,
    #[serde(default)]
    pub iso: bool,
}

impl IndexRow {
    pub fn new(key: &CuboidKey, byte_len: u64, write_time: DateTime<Utc>) -> Self {
        Self {
            cuboid_key: key.canonical(),
            lookup_key: key.lookup.to_string(),
            res: key.res,
            morton: key.morton,
            t: key.t,
            version: key.version,
            write_time,
            byte_len,
            object_key: key.object_key(),
            iso: key.iso,
        }
    }

    pub fn key(&self) -> Result<CuboidKey> {
        crate::keys::parse_cuboid_key(&self.cuboid_key)
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    pub rows: Vec<IndexRow>,
    /// Cursor for the following page
    pub next: Option<String>,
}

/// Cuboid index: latest stored version of every cuboid, listable per channel resolution
#[async_trait]
pub trait CuboidIndex: Send + Sync {
    async fn put_row(&self, row: IndexRow) -> Result<()>;

    /// Highest version recorded for the cuboid addressed by `key` (version ignored)
    async fn latest(&self, key: &CuboidKey) -> Result<Option<IndexRow>>;

    /// Latest rows of a channel resolution in key order, starting after `cursor`
    async fn list_page(
        &self,
        lookup: &LookupKey,
        res: u32,
        iso: bool,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage>;

    /// Next version for a channel, starting at 1
    async fn allocate_version(&self, lookup: &LookupKey) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryCuboidIndex {
    rows: RwLock<BTreeMap<String, BTreeMap<u64, IndexRow>>>,
    versions: RwLock<HashMap<LookupKey, u64>>,
}

impl MemoryCuboidIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CuboidIndex for MemoryCuboidIndex {
    async fn put_row(&self, row: IndexRow) -> Result<()> {
        let head = row.key()?.head().canonical();
        self.rows
            .write()
            .entry(head)
            .or_default()
            .insert(row.version, row);
        Ok(())
    }

    async fn latest(&self, key: &CuboidKey) -> Result<Option<IndexRow>> {
        Ok(self
            .rows
            .read()
            .get(&key.head().canonical())
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn list_page(
        &self,
        lookup: &LookupKey,
        res: u32,
        iso: bool,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage> {
        let prefix = channel_prefix(lookup, res, iso);
        let rows = self.rows.read();
        let start = match cursor {
            Some(c) => std::ops::Bound::Excluded(c.to_string()),
            None => std::ops::Bound::Included(prefix.clone()),
        };
        let mut page: Vec<(String, IndexRow)> = rows
            .range((start, std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, versions)| versions.values().next_back().map(|r| (k.clone(), r.clone())))
            .take(limit.max(1) + 1)
            .collect();

        let next = if page.len() > limit.max(1) {
            page.pop();
            page.last().map(|(k, _)| k.clone())
        } else {
            None
        };
        Ok(IndexPage {
            rows: page.into_iter().map(|(_, r)| r).collect(),
            next,
        })
    }

    async fn allocate_version(&self, lookup: &LookupKey) -> Result<u64> {
        let mut versions = self.versions.write();
        let version = versions.entry(*lookup).or_insert(0);
        *version += 1;
        Ok(*version)
    }
}

/// Reverse index from annotation label to the cuboids containing it
#[async_trait]
pub trait IdIndex: Send + Sync {
    /// Record that `cuboid_key` contains each of `ids`
    async fn add_ids(&self, lookup: &LookupKey, res: u32, cuboid_key: &str, ids: &[u64])
        -> Result<()>;

    /// Union of every chunk for `id`, sorted
    async fn cuboids_for_id(&self, lookup: &LookupKey, res: u32, id: u64) -> Result<Vec<String>>;

    /// Number of chunks holding `id`
    async fn chunk_count(&self, lookup: &LookupKey, res: u32, id: u64) -> Result<usize>;
}

type IdEntryKey = (LookupKey, u32, u64);

/// In-memory ID index with chunked growth
pub struct MemoryIdIndex {
    entries: RwLock<HashMap<IdEntryKey, Vec<BTreeSet<String>>>>,
    new_chunk_threshold: u64,
    failures: AtomicU32,
}

impl MemoryIdIndex {
    pub fn new(new_chunk_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            new_chunk_threshold: new_chunk_threshold as u64,
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` updates fail with a backend error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Default for MemoryIdIndex {
    fn default() -> Self {
        Self::new(crate::config::AnnotationConfig::default().id_index_new_chunk_threshold)
    }
}

#[async_trait]
impl IdIndex for MemoryIdIndex {
    async fn add_ids(
        &self,
        lookup: &LookupKey,
        res: u32,
        cuboid_key: &str,
        ids: &[u64],
    ) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BossError::backend("injected id index failure"));
        }

        let mut entries = self.entries.write();
        for id in ids {
            let chunks = entries.entry((*lookup, res, *id)).or_default();
            if chunks.iter().any(|c| c.contains(cuboid_key)) {
                continue;
            }
            let needs_chunk = match chunks.last() {
                None => true,
                Some(current) => bincode::serialized_size(current)? > self.new_chunk_threshold,
            };
            if needs_chunk {
                chunks.push(BTreeSet::new());
            }
            if let Some(current) = chunks.last_mut() {
                current.insert(cuboid_key.to_string());
            }
        }
        Ok(())
    }

    async fn cuboids_for_id(&self, lookup: &LookupKey, res: u32, id: u64) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let mut all = BTreeSet::new();
        if let Some(chunks) = entries.get(&(*lookup, res, id)) {
            for chunk in chunks {
                all.extend(chunk.iter().cloned());
            }
        }
        Ok(all.into_iter().collect())
    }

    async fn chunk_count(&self, lookup: &LookupKey, res: u32, id: u64) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .get(&(*lookup, res, id))
            .map(Vec::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(cube: [u64; 3], version: u64) -> CuboidKey {
        CuboidKey::new(LookupKey::new(1, 1, 1), 0, cube, 0).with_version(version)
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let index = MemoryCuboidIndex::new();
        index.put_row(IndexRow::new(&key([0, 0, 0], 1), 10, Utc::now())).await.unwrap();
        index.put_row(IndexRow::new(&key([0, 0, 0], 3), 12, Utc::now())).await.unwrap();
        let latest = index.latest(&key([0, 0, 0], 0)).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(latest.byte_len, 12);
        assert!(index.latest(&key([1, 0, 0], 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paginated_listing() {
        let index = MemoryCuboidIndex::new();
        for x in 0..5 {
            index.put_row(IndexRow::new(&key([x, 0, 0], 1), 1, Utc::now())).await.unwrap();
        }
        let other = CuboidKey::new(LookupKey::new(1, 1, 2), 0, [0, 0, 0], 0).with_version(1);
        index.put_row(IndexRow::new(&other, 1, Utc::now())).await.unwrap();

        let lookup = LookupKey::new(1, 1, 1);
        let first = index.list_page(&lookup, 0, false, None, 2).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let cursor = first.next.unwrap();
        let second = index.list_page(&lookup, 0, false, Some(&cursor), 10).await.unwrap();
        assert_eq!(second.rows.len(), 3);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_versions_monotonic_per_channel() {
        let index = MemoryCuboidIndex::new();
        let a = LookupKey::new(1, 1, 1);
        let b = LookupKey::new(1, 1, 2);
        assert_eq!(index.allocate_version(&a).await.unwrap(), 1);
        assert_eq!(index.allocate_version(&a).await.unwrap(), 2);
        assert_eq!(index.allocate_version(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_id_index_chunks_grow() {
        let index = MemoryIdIndex::new(64);
        let lookup = LookupKey::new(1, 1, 1);
        for x in 0..10 {
            let cuboid = key([x, 0, 0], 0).canonical();
            index.add_ids(&lookup, 0, &cuboid, &[3, 4]).await.unwrap();
        }
        // re-adding is a no-op
        index.add_ids(&lookup, 0, &key([0, 0, 0], 0).canonical(), &[3]).await.unwrap();

        assert!(index.chunk_count(&lookup, 0, 3).await.unwrap() > 1);
        assert_eq!(index.cuboids_for_id(&lookup, 0, 3).await.unwrap().len(), 10);
        assert!(index.cuboids_for_id(&lookup, 0, 5).await.unwrap().is_empty());
    }
}
