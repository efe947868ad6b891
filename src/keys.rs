//! Cuboid key schema
//!
//! Canonical key: `<lookup_key>&<res>&<morton>&<t>&<version>`, optionally preceded by
//! `ISO&` for the isotropic track of a `near_iso` channel. Tier-1 and index rows wrap
//! the canonical key in a namespace prefix.

use crate::error::{BossError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const CACHED_CUBOID_PREFIX: &str = "CACHED-CUBOID&";
pub const S3_KEY_PREFIX: &str = "S3-KEY&";
pub const WRITE_CUBOID_PREFIX: &str = "WRITE-CUBOID&";
pub const ISO_PREFIX: &str = "ISO&";

/// Bits per axis in a morton code
pub const MORTON_BITS: u32 = 21;
/// Largest cube index representable along one axis
pub const MAX_CUBE_INDEX: u64 = (1 << MORTON_BITS) - 1;

/// Spread the low 21 bits of `v` so that two zero bits follow each one
fn spread(v: u64) -> u64 {
    let mut x = v & MAX_CUBE_INDEX;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

fn compact(v: u64) -> u64 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & MAX_CUBE_INDEX;
    x
}

/// Interleave cube indices, x in the lowest bit
pub fn morton_encode(cx: u64, cy: u64, cz: u64) -> u64 {
    spread(cx) | (spread(cy) << 1) | (spread(cz) << 2)
}

pub fn morton_decode(code: u64) -> [u64; 3] {
    [compact(code), compact(code >> 1), compact(code >> 2)]
}

/// First 8 hex characters of the SHA-256 of `s`
pub fn hash_prefix(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_num<T: FromStr>(part: Option<&str>, what: &str, key: &str) -> Result<T> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| BossError::validation(format!("Invalid {} in key {}", what, key)))
}

/// Numeric identity of a channel: `<collection>&<experiment>&<channel>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LookupKey {
    pub collection: u64,
    pub experiment: u64,
    pub channel: u64,
}

impl LookupKey {
    pub fn new(collection: u64, experiment: u64, channel: u64) -> Self {
        Self {
            collection,
            experiment,
            channel,
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}&{}&{}", self.collection, self.experiment, self.channel)
    }
}

impl FromStr for LookupKey {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('&');
        let key = LookupKey {
            collection: parse_num(parts.next(), "collection id", s)?,
            experiment: parse_num(parts.next(), "experiment id", s)?,
            channel: parse_num(parts.next(), "channel id", s)?,
        };
        if parts.next().is_some() {
            return Err(BossError::validation(format!("Invalid lookup key {}", s)));
        }
        Ok(key)
    }
}

/// Logical address of one stored cuboid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CuboidKey {
    pub lookup: LookupKey,
    pub res: u32,
    pub morton: u64,
    pub t: u64,
    /// 0 addresses the head (tier-1) copy; flushed objects carry versions >= 1
    pub version: u64,
    pub iso: bool,
}

impl CuboidKey {
    pub fn new(lookup: LookupKey, res: u32, cube: [u64; 3], t: u64) -> Self {
        Self {
            lookup,
            res,
            morton: morton_encode(cube[0], cube[1], cube[2]),
            t,
            version: 0,
            iso: false,
        }
    }

    pub fn with_iso(mut self, iso: bool) -> Self {
        self.iso = iso;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Same cuboid at version 0
    pub fn head(&self) -> Self {
        self.with_version(0)
    }

    pub fn cube(&self) -> [u64; 3] {
        morton_decode(self.morton)
    }

    pub fn canonical(&self) -> String {
        format!(
            "{}{}&{}&{}&{}&{}",
            if self.iso { ISO_PREFIX } else { "" },
            self.lookup,
            self.res,
            self.morton,
            self.t,
            self.version
        )
    }

    pub fn cache_key(&self) -> String {
        format!("{}{}", CACHED_CUBOID_PREFIX, self.head().canonical())
    }

    /// Dirty tier-1 entry for one pending write
    pub fn write_key(&self, write_id: &uuid::Uuid) -> String {
        format!("{}{}&{}", WRITE_CUBOID_PREFIX, self.head().canonical(), write_id)
    }

    pub fn index_key(&self) -> String {
        format!("{}{}", S3_KEY_PREFIX, self.canonical())
    }

    /// Blob object key, hashed so objects spread across partitions
    pub fn object_key(&self) -> String {
        let canonical = self.canonical();
        format!("{}&{}", hash_prefix(&canonical), canonical)
    }
}

impl fmt::Display for CuboidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for CuboidKey {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        parse_cuboid_key(s)
    }
}

/// Prefix shared by every key of a channel resolution, used for listing
pub fn channel_prefix(lookup: &LookupKey, res: u32, iso: bool) -> String {
    format!(
        "{}{}&{}&",
        if iso { ISO_PREFIX } else { "" },
        lookup,
        res
    )
}

/// Parse a canonical key, tolerating a namespace prefix and a write-id suffix
pub fn parse_cuboid_key(s: &str) -> Result<CuboidKey> {
    let mut rest = s;
    for prefix in [CACHED_CUBOID_PREFIX, S3_KEY_PREFIX, WRITE_CUBOID_PREFIX] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let iso = rest.starts_with(ISO_PREFIX);
    if iso {
        rest = &rest[ISO_PREFIX.len()..];
    }

    let mut parts = rest.split('&');
    let lookup = LookupKey {
        collection: parse_num(parts.next(), "collection id", s)?,
        experiment: parse_num(parts.next(), "experiment id", s)?,
        channel: parse_num(parts.next(), "channel id", s)?,
    };
    let key = CuboidKey {
        lookup,
        res: parse_num(parts.next(), "resolution", s)?,
        morton: parse_num(parts.next(), "morton code", s)?,
        t: parse_num(parts.next(), "time sample", s)?,
        version: parse_num(parts.next(), "version", s)?,
        iso,
    };
    // a trailing write id is only valid on write keys
    match parts.next() {
        None => Ok(key),
        Some(_) if s.starts_with(WRITE_CUBOID_PREFIX) && parts.next().is_none() => Ok(key),
        Some(_) => Err(BossError::validation(format!("Invalid cuboid key {}", s))),
    }
}

/// Key of one ingest chunk: `<hash>&<num_tiles>&<col>&<exp>&<chan>&<res>&<x>&<y>&<z>&<t>`
pub fn encode_chunk_key(
    num_tiles: u64,
    lookup: &LookupKey,
    res: u32,
    cx: u64,
    cy: u64,
    cz: u64,
    t: u64,
) -> String {
    let base = format!(
        "{}&{}&{}&{}&{}&{}&{}",
        num_tiles, lookup, res, cx, cy, cz, t
    );
    format!("{}&{}", hash_prefix(&base), base)
}

/// Fields of a chunk key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKey {
    pub num_tiles: u64,
    pub lookup: LookupKey,
    pub res: u32,
    pub chunk: [u64; 3],
    pub t: u64,
}

pub fn decode_chunk_key(s: &str) -> Result<ChunkKey> {
    let parts: Vec<&str> = s.split('&').collect();
    if parts.len() != 10 {
        return Err(BossError::validation(format!("Invalid chunk key {}", s)));
    }
    let n = |i: usize, what: &str| parse_num::<u64>(Some(parts[i]), what, s);
    Ok(ChunkKey {
        num_tiles: n(1, "tile count")?,
        lookup: LookupKey::new(n(2, "collection id")?, n(3, "experiment id")?, n(4, "channel id")?),
        res: parse_num(Some(parts[5]), "resolution", s)?,
        chunk: [n(6, "x")?, n(7, "y")?, n(8, "z")?],
        t: n(9, "t")?,
    })
}

/// Key of one uploaded tile, a CX x CY x 1 slab at absolute slice `tz`
pub fn encode_tile_key(lookup: &LookupKey, res: u32, cx: u64, cy: u64, tz: u64, t: u64) -> String {
    let base = format!("{}&{}&{}&{}&{}&{}", lookup, res, cx, cy, tz, t);
    format!("{}&{}", hash_prefix(&base), base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_morton_known_values() {
        assert_eq!(morton_encode(0, 0, 0), 0);
        assert_eq!(morton_encode(1, 0, 0), 1);
        assert_eq!(morton_encode(0, 1, 0), 2);
        assert_eq!(morton_encode(0, 0, 1), 4);
        assert_eq!(morton_encode(1, 1, 1), 7);
        assert_eq!(morton_encode(2, 0, 0), 8);
    }

    #[test]
    fn test_morton_decode_max() {
        let code = morton_encode(MAX_CUBE_INDEX, 5, 1234);
        assert_eq!(morton_decode(code), [MAX_CUBE_INDEX, 5, 1234]);
    }

    #[test]
    fn test_canonical_form() {
        let key = CuboidKey::new(LookupKey::new(4, 2, 7), 0, [1, 0, 1], 3).with_version(2);
        assert_eq!(key.canonical(), "4&2&7&0&5&3&2");
        assert_eq!(key.cache_key(), "CACHED-CUBOID&4&2&7&0&5&3&0");
        assert_eq!(key.index_key(), "S3-KEY&4&2&7&0&5&3&2");
        assert!(key.object_key().ends_with("&4&2&7&0&5&3&2"));
        assert_eq!(key.object_key().split('&').next().unwrap().len(), 8);
    }

    #[test]
    fn test_iso_namespace() {
        let key = CuboidKey::new(LookupKey::new(1, 1, 1), 5, [0, 0, 0], 0).with_iso(true);
        assert_eq!(key.cache_key(), "CACHED-CUBOID&ISO&1&1&1&5&0&0&0");
        let parsed = parse_cuboid_key(&key.cache_key()).unwrap();
        assert!(parsed.iso);
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_write_key() {
        let key = CuboidKey::new(LookupKey::new(1, 2, 3), 1, [2, 3, 4], 0);
        let id = uuid::Uuid::new_v4();
        let parsed = parse_cuboid_key(&key.write_key(&id)).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.cube(), [2, 3, 4]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cuboid_key("1&2&3&x&0&0&0").is_err());
        assert!(parse_cuboid_key("1&2&3&0&0&0").is_err());
        assert!(parse_cuboid_key("1&2&3&0&0&0&0&extra").is_err());
    }

    #[test]
    fn test_chunk_key() {
        let lookup = LookupKey::new(1, 2, 3);
        let key = encode_chunk_key(16, &lookup, 0, 1, 2, 3, 0);
        let decoded = decode_chunk_key(&key).unwrap();
        assert_eq!(decoded.num_tiles, 16);
        assert_eq!(decoded.lookup, lookup);
        assert_eq!(decoded.chunk, [1, 2, 3]);
        assert_ne!(
            encode_tile_key(&lookup, 0, 1, 2, 48, 0),
            encode_tile_key(&lookup, 0, 1, 2, 49, 0)
        );
    }
}
