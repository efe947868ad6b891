//! Utility functions

use crate::error::{BossError, Result};
use crate::types::Voxel;

/// Decode little-endian voxel bytes into typed values
pub fn bytes_to_voxels<T: Voxel>(bytes: &[u8]) -> Result<Vec<T>> {
    let width = T::DATA_TYPE.size_in_bytes();
    if bytes.len() % width != 0 {
        return Err(BossError::Corrupt(
            "Byte length not aligned with data type size".to_string(),
        ));
    }
    Ok(bytes.chunks_exact(width).map(T::read_le).collect())
}

/// Encode typed voxels as little-endian bytes
pub fn voxels_to_bytes<T: Voxel>(data: &[T]) -> Vec<u8> {
    let width = T::DATA_TYPE.size_in_bytes();
    let mut bytes = vec![0u8; data.len() * width];
    for (value, out) in data.iter().zip(bytes.chunks_exact_mut(width)) {
        value.write_le(out);
    }
    bytes
}

/// Calculate checksum (CRC32) for data
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}

/// Verify checksum
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Parse an integer with an optional `K`, `M`, `G` or `T` suffix (powers of 1024)
///
/// Negative values are allowed since a limit `<= 0` means unlimited.
pub fn parse_size_suffix(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BossError::validation("Empty size value"));
    }

    let (digits, multiplier) = match trimmed.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1i64 << 10),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1i64 << 20),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1i64 << 30),
        Some('T') => (&trimmed[..trimmed.len() - 1], 1i64 << 40),
        _ => (trimmed, 1),
    };

    let value: i64 = digits
        .trim()
        .parse()
        .map_err(|_| BossError::validation(format!("Invalid size value: {}", input)))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| BossError::validation(format!("Size value overflows: {}", input)))
}

/// Integer division rounding up
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    debug_assert!(divisor > 0);
    value.div_ceil(divisor)
}
