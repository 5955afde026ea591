//! Payload container with optional LZ4 compression, mirroring `datablock.c`.
//!
//! A `DataBlock` always remembers the *uncompressed* length of the payload
//! it carries, regardless of whether the bytes on the wire are compressed.
//! Below [`COMPRESSION_THRESHOLD`] bytes compression is skipped outright:
//! LZ4's own framing overhead would eat whatever it saved.

use crate::netfuse::{CompressionType, DataBlock};
use thiserror::Error;

/// Below this many bytes, compression isn't attempted — LZ4 needs enough
/// payload before it has any chance of winning against its own overhead.
pub const COMPRESSION_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum DataBlockError {
    #[error("lz4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("decompressed size {actual} does not match the advertised uncompressed size {expected}")]
    SizeMismatch { expected: u64, actual: usize },
}

/// Builds a `DataBlock` from raw bytes, compressing with LZ4 when the
/// payload clears [`COMPRESSION_THRESHOLD`] and compression actually pays
/// off. Short payloads are stored verbatim.
pub fn from_bytes(data: &[u8]) -> DataBlock {
    if data.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::block::compress(data);
        if compressed.len() < data.len() {
            return DataBlock {
                uncompressed_size: data.len() as u64,
                codec: CompressionType::ComprLz4 as i32,
                bytes: compressed,
            };
        }
    }
    DataBlock {
        uncompressed_size: data.len() as u64,
        codec: CompressionType::ComprNone as i32,
        bytes: data.to_vec(),
    }
}

/// Recovers the original bytes from a `DataBlock`, decompressing if
/// necessary and verifying the result matches `uncompressed_size`.
pub fn to_bytes(block: &DataBlock) -> Result<Vec<u8>, DataBlockError> {
    match block.codec() {
        CompressionType::ComprNone => Ok(block.bytes.clone()),
        CompressionType::ComprLz4 => {
            let expected = block.uncompressed_size as usize;
            let decompressed = lz4_flex::block::decompress(&block.bytes, expected)?;
            if decompressed.len() != expected {
                return Err(DataBlockError::SizeMismatch {
                    expected: block.uncompressed_size,
                    actual: decompressed.len(),
                });
            }
            Ok(decompressed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payload_is_never_compressed() {
        let block = from_bytes(b"hello");
        assert_eq!(block.codec(), CompressionType::ComprNone);
        assert_eq!(block.uncompressed_size, 5);
    }

    #[test]
    fn long_compressible_payload_round_trips_through_lz4() {
        let data = vec![b'a'; 4096];
        let block = from_bytes(&data);
        assert_eq!(block.codec(), CompressionType::ComprLz4);
        assert!(block.bytes.len() < data.len());
        assert_eq!(to_bytes(&block).unwrap(), data);
    }

    #[test]
    fn incompressible_payload_falls_back_to_raw_storage() {
        // Random-looking bytes above the threshold that LZ4 can't shrink.
        let data: Vec<u8> = (0..200u32).map(|i| (i * 2654435761) as u8).collect();
        let block = from_bytes(&data);
        if block.codec() == CompressionType::ComprNone {
            assert_eq!(block.bytes, data);
        }
        assert_eq!(to_bytes(&block).unwrap(), data);
    }

    #[test]
    fn empty_payload_round_trips() {
        let block = from_bytes(&[]);
        assert_eq!(block.codec(), CompressionType::ComprNone);
        assert_eq!(to_bytes(&block).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut block = from_bytes(&vec![b'z'; 512]);
        block.uncompressed_size += 1;
        assert!(matches!(to_bytes(&block), Err(DataBlockError::SizeMismatch { .. })));
    }
}
