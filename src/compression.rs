//! Chunked block codec for cuboid payloads
//!
//! A payload is a small header followed by independently compressed blocks of the
//! raw C-ordered voxel bytes. Each block is byte-shuffled by the scalar width before
//! compression and carries a CRC32 of its uncompressed bytes.
//!
//! ```text
//! magic "CUB1" | method u8 | typesize u8 | reserved u16 | raw_len u64 | block_size u32 | blocks u32
//! per block:   compressed_len u32 | crc32 u32 | compressed bytes
//! ```

use crate::config::CuboidConfig;
use crate::error::{BossError, Result};
use crate::utils::{calculate_checksum, verify_checksum};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

const MAGIC: &[u8; 4] = b"CUB1";
const HEADER_LEN: usize = 24;
const BLOCK_HEADER_LEN: usize = 8;

/// Per-block compressors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Stored as-is
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 3,
}

impl CompressionMethod {
    /// Get the method from a header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression of a single block
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| BossError::Internal(format!("deflate: {}", e)))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| BossError::Corrupt(format!("deflate: {}", e)))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| BossError::Internal(format!("zstd: {}", e)))
    }

    fn decompress(&self, data: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| BossError::Corrupt(format!("zstd: {}", e)))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Group byte `k` of every element together
fn shuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || data.len() % typesize != 0 {
        return data.to_vec();
    }
    let elements = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(typesize).enumerate() {
        for (k, byte) in element.iter().enumerate() {
            out[k * elements + i] = *byte;
        }
    }
    out
}

fn unshuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || data.len() % typesize != 0 {
        return data.to_vec();
    }
    let elements = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for (i, element) in out.chunks_exact_mut(typesize).enumerate() {
        for (k, byte) in element.iter_mut().enumerate() {
            *byte = data[k * elements + i];
        }
    }
    out
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Blocked codec applied to whole cuboid payloads
#[derive(Debug, Clone, Copy)]
pub struct CuboidCodec {
    method: CompressionMethod,
    level: CompressionLevel,
    block_size: usize,
}

impl CuboidCodec {
    pub fn new(method: CompressionMethod, level: CompressionLevel, block_size: usize) -> Self {
        Self {
            method,
            level,
            block_size: block_size.max(1),
        }
    }

    pub fn from_config(config: &CuboidConfig) -> Self {
        Self::new(
            config.compression,
            CompressionLevel::new(config.compression_level),
            config.block_size,
        )
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Compress raw C-ordered voxel bytes whose scalar width is `typesize`
    pub fn encode(&self, raw: &[u8], typesize: usize) -> Result<Bytes> {
        let typesize = typesize.max(1);
        // keep elements whole inside a block
        let block_size = (self.block_size / typesize).max(1) * typesize;
        let compressor = get_compressor(self.method);
        let blocks = raw.len().div_ceil(block_size);

        let mut out = Vec::with_capacity(HEADER_LEN + raw.len() / 4);
        out.extend_from_slice(MAGIC);
        out.push(self.method as u8);
        out.push(typesize as u8);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        out.extend_from_slice(&(block_size as u32).to_le_bytes());
        out.extend_from_slice(&(blocks as u32).to_le_bytes());

        for block in raw.chunks(block_size) {
            let compressed = compressor.compress(&shuffle(block, typesize), self.level)?;
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&calculate_checksum(block).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
        Ok(Bytes::from(out))
    }

    /// Decompress a payload, rejecting it unless it holds exactly `expected_len` bytes
    pub fn decode(&self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if payload.len() < HEADER_LEN || &payload[..4] != MAGIC {
            return Err(BossError::Corrupt("Missing cuboid codec header".to_string()));
        }
        let method = CompressionMethod::from_u8(payload[4]).ok_or_else(|| {
            BossError::Corrupt(format!("Unknown compression method {}", payload[4]))
        })?;
        let typesize = payload[5] as usize;
        let raw_len = read_u64(payload, 8) as usize;
        let block_size = read_u32(payload, 16) as usize;
        let blocks = read_u32(payload, 20) as usize;

        if raw_len != expected_len {
            return Err(BossError::Corrupt(format!(
                "Decompressed length {} does not match expected {}",
                raw_len, expected_len
            )));
        }
        if block_size == 0 || blocks != raw_len.div_ceil(block_size) {
            return Err(BossError::Corrupt("Inconsistent block table".to_string()));
        }

        let compressor = get_compressor(method);
        let mut raw = Vec::with_capacity(raw_len);
        let mut at = HEADER_LEN;
        for index in 0..blocks {
            if at + BLOCK_HEADER_LEN > payload.len() {
                return Err(BossError::Corrupt("Truncated block header".to_string()));
            }
            let len = read_u32(payload, at) as usize;
            let crc = read_u32(payload, at + 4);
            at += BLOCK_HEADER_LEN;
            if at + len > payload.len() {
                return Err(BossError::Corrupt("Truncated block".to_string()));
            }
            let want = block_size.min(raw_len - index * block_size);
            let shuffled = compressor.decompress(&payload[at..at + len], want)?;
            if shuffled.len() != want {
                return Err(BossError::Corrupt(format!(
                    "Block {} decompressed to {} bytes, expected {}",
                    index,
                    shuffled.len(),
                    want
                )));
            }
            let block = unshuffle(&shuffled, typesize);
            if !verify_checksum(&block, crc) {
                return Err(BossError::Corrupt(format!("Checksum mismatch in block {}", index)));
            }
            raw.extend_from_slice(&block);
            at += len;
        }
        Ok(raw)
    }
}

impl Default for CuboidCodec {
    fn default() -> Self {
        Self::from_config(&CuboidConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 7 % 251) as u8).collect()
    }

    #[test]
    fn test_no_compression() {
        let compressor = NoneCompressor;
        let data = b"Hello, world!";
        let compressed = compressor
            .compress(data, CompressionLevel::default())
            .unwrap();
        assert_eq!(compressed, data);
    }

    #[test]
    fn test_deflate() {
        let compressor = DeflateCompressor;
        let data = b"Hello, world! ".repeat(100);
        let compressed = compressor
            .compress(&data, CompressionLevel::default())
            .unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = compressor.decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_shuffle_inverse() {
        let data: Vec<u8> = (0..64).collect();
        let shuffled = shuffle(&data, 8);
        assert_eq!(shuffled[0], 0);
        assert_eq!(shuffled[1], 8);
        assert_eq!(unshuffle(&shuffled, 8), data);
    }

    #[test]
    fn test_codec_multi_block() {
        for method in [
            CompressionMethod::None,
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
        ] {
            let codec = CuboidCodec::new(method, CompressionLevel::fast(), 1000);
            let raw = sample(4096 * 2);
            let payload = codec.encode(&raw, 2).unwrap();
            assert_eq!(codec.decode(&payload, raw.len()).unwrap(), raw);
        }
    }

    #[test]
    fn test_zeros_compress_well() {
        let codec = CuboidCodec::default();
        let raw = vec![0u8; 512 * 512 * 16];
        let payload = codec.encode(&raw, 1).unwrap();
        assert!(payload.len() < raw.len() / 100);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let codec = CuboidCodec::default();
        let payload = codec.encode(&sample(100), 1).unwrap();
        let err = codec.decode(&payload, 101).unwrap_err();
        assert!(matches!(err, BossError::Corrupt(_)));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let codec = CuboidCodec::new(CompressionMethod::None, CompressionLevel::fast(), 64);
        let raw = sample(128);
        let mut payload = codec.encode(&raw, 1).unwrap().to_vec();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&payload, raw.len()),
            Err(BossError::Corrupt(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = CuboidCodec::default();
        assert!(codec.decode(b"not a cuboid", 12).is_err());
    }
}
