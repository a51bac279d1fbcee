//! Per-block compression for TAS files
//!
//! **Methods**:
//! - `None`: raw little-endian element bytes
//! - `Rice`: Rice coding of 8/16/32-bit integers, block size 32
//! - `Gzip`: a zlib stream (what the legacy writer produced under this name)
//! - `Zstd`: Zstd frame, any element type

use crate::core::codec::rice::{self, RiceSample, DEFAULT_BLOCK_SIZE};
use crate::core::tas::types::{ElementType, Element};
use crate::error::{Result, SumsError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression method code as stored in the TAS header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Compression {
    None = 0,
    Rice = 1,
    Gzip = 2,
    Zstd = 3,
}

impl Compression {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Rice),
            2 => Some(Compression::Gzip),
            3 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Whether this method can store elements of type `t`.
    pub fn supports(self, t: ElementType) -> bool {
        match self {
            Compression::Rice => matches!(
                t,
                ElementType::Char | ElementType::Short | ElementType::Int
            ),
            _ => t.size().is_some(),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Rice => "rice",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Compression tuning
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Method to use
    pub method: Compression,

    /// Samples per Rice coding block
    pub rice_block: usize,

    /// zlib level (0-9)
    pub zlib_level: u32,

    /// Zstd level
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            method: Compression::None,
            rice_block: DEFAULT_BLOCK_SIZE,
            zlib_level: 6,
            zstd_level: 3,
        }
    }
}

impl CompressionConfig {
    /// Default tuning for `method`
    pub fn for_method(method: Compression) -> Self {
        CompressionConfig {
            method,
            ..Default::default()
        }
    }

    /// Create config with no compression
    pub fn none() -> Self {
        Self::default()
    }

    /// Create config with Rice compression
    pub fn rice() -> Self {
        CompressionConfig {
            method: Compression::Rice,
            ..Default::default()
        }
    }

    /// Create config with zlib compression
    pub fn gzip() -> Self {
        CompressionConfig {
            method: Compression::Gzip,
            ..Default::default()
        }
    }

    /// Create config with Zstd compression
    pub fn zstd() -> Self {
        CompressionConfig {
            method: Compression::Zstd,
            ..Default::default()
        }
    }
}

fn unsupported(method: Compression, t: ElementType) -> SumsError {
    SumsError::UnsupportedCodec {
        method: method.to_string(),
        element_type: t.to_string(),
    }
}

fn rice_encode<T: RiceSample + Element>(data: &[u8], blksz: usize) -> Result<Vec<u8>> {
    let samples: Vec<T> = data.chunks_exact(T::BYTES).map(T::read_le).collect();
    // Worst case: raw samples plus one code per block
    let max_out = data.len() + samples.len() / blksz.max(1) + 16;
    Ok(rice::encode(&samples, blksz, max_out)?)
}

fn rice_decode<T: RiceSample + Element>(data: &[u8], count: usize, blksz: usize) -> Result<Vec<u8>> {
    let samples: Vec<T> = rice::decode(data, count, blksz)?;
    let mut out = Vec::with_capacity(count * T::BYTES);
    for s in samples {
        s.write_le(&mut out);
    }
    Ok(out)
}

/// Compress the raw bytes of `data` holding elements of type `t`.
pub fn compress(config: &CompressionConfig, t: ElementType, data: &[u8]) -> Result<Vec<u8>> {
    if !config.method.supports(t) {
        return Err(unsupported(config.method, t));
    }
    match config.method {
        Compression::None => Ok(data.to_vec()),
        Compression::Rice => match t {
            ElementType::Char => rice_encode::<i8>(data, config.rice_block),
            ElementType::Short => rice_encode::<i16>(data, config.rice_block),
            ElementType::Int => rice_encode::<i32>(data, config.rice_block),
            other => Err(unsupported(Compression::Rice, other)),
        },
        Compression::Gzip => {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(data.len() / 2 + 64),
                flate2::Compression::new(config.zlib_level),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Zstd => zstd::bulk::compress(data, config.zstd_level)
            .map_err(|e| SumsError::Compression(format!("Zstd compression failed: {}", e))),
    }
}

/// Decompress a block expected to hold `count` elements of type `t`.
pub fn decompress(
    config: &CompressionConfig,
    t: ElementType,
    data: &[u8],
    count: usize,
) -> Result<Vec<u8>> {
    let expected = count * t.storage_size()?;
    let out = match config.method {
        Compression::None => data.to_vec(),
        Compression::Rice => match t {
            ElementType::Char => rice_decode::<i8>(data, count, config.rice_block)?,
            ElementType::Short => rice_decode::<i16>(data, count, config.rice_block)?,
            ElementType::Int => rice_decode::<i32>(data, count, config.rice_block)?,
            other => return Err(unsupported(Compression::Rice, other)),
        },
        Compression::Gzip => {
            let mut out = Vec::with_capacity(expected);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| SumsError::Compression(format!("zlib decompression failed: {}", e)))?;
            out
        }
        Compression::Zstd => zstd::bulk::decompress(data, expected)
            .map_err(|e| SumsError::Compression(format!("Zstd decompression failed: {}", e)))?,
    };

    if out.len() != expected {
        return Err(SumsError::Compression(format!(
            "block decompressed to {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tas::types::Array;

    fn sample_block() -> Array {
        let values: Vec<i16> = (0..500).map(|i| ((i * 13) % 97 - 40) as i16).collect();
        Array::from_values(vec![500], &values).unwrap()
    }

    #[test]
    fn test_compression_method_conversion() {
        assert_eq!(Compression::from_i32(0), Some(Compression::None));
        assert_eq!(Compression::from_i32(1), Some(Compression::Rice));
        assert_eq!(Compression::from_i32(2), Some(Compression::Gzip));
        assert_eq!(Compression::from_i32(3), Some(Compression::Zstd));
        assert_eq!(Compression::from_i32(99), None);
    }

    #[test]
    fn test_all_methods_round_trip() {
        let block = sample_block();
        for config in [
            CompressionConfig::none(),
            CompressionConfig::rice(),
            CompressionConfig::gzip(),
            CompressionConfig::zstd(),
        ] {
            let packed = compress(&config, ElementType::Short, &block.data).unwrap();
            let unpacked = decompress(&config, ElementType::Short, &packed, 500).unwrap();
            assert_eq!(unpacked, block.data, "method {}", config.method);
        }
    }

    #[test]
    fn test_rice_rejects_floats() {
        let data = vec![0u8; 16];
        assert!(matches!(
            compress(&CompressionConfig::rice(), ElementType::Double, &data),
            Err(SumsError::UnsupportedCodec { .. })
        ));
    }

    #[test]
    fn test_gzip_is_zlib_stream() {
        let data = b"DRMS TAS".repeat(64);
        let packed = compress(&CompressionConfig::gzip(), ElementType::Char, &data).unwrap();
        // zlib header: CM = 8 (deflate), header checksum divisible by 31
        assert_eq!(packed[0] & 0x0f, 8);
        assert_eq!((u16::from(packed[0]) << 8 | u16::from(packed[1])) % 31, 0);
    }

    #[test]
    fn test_short_block_detected() {
        let block = sample_block();
        let packed = compress(&CompressionConfig::none(), ElementType::Short, &block.data).unwrap();
        assert!(decompress(&CompressionConfig::none(), ElementType::Short, &packed, 501).is_err());
    }
}
