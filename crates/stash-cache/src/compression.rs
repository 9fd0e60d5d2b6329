//! Compression of blob and snapshot files.
//!
//! Every compressed buffer starts with a one byte frame tag so that files
//! written with [`CompressionLevel::None`] can be told apart from zstd frames.

use std::io::{Read, Write};

use stash_core::error::{StashError, StashResult};
use stash_core::CompressionLevel;

const FRAME_RAW: u8 = 0;
const FRAME_ZSTD: u8 = 1;

/// Compress data using zstd
pub fn compress(data: &[u8], level: CompressionLevel) -> StashResult<Vec<u8>> {
    if level == CompressionLevel::None {
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(FRAME_RAW);
        framed.extend_from_slice(data);
        return Ok(framed);
    }

    let mut encoder = zstd::Encoder::new(vec![FRAME_ZSTD], level.into())
        .map_err(|e| StashError::corrupt(format!("Failed to create zstd encoder: {}", e)))?;

    encoder
        .write_all(data)
        .map_err(|e| StashError::corrupt(format!("Failed to compress data: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| StashError::corrupt(format!("Failed to finish compression: {}", e)))
}

/// Decompress data produced by [`compress`]
pub fn decompress(data: &[u8]) -> StashResult<Vec<u8>> {
    match data.split_first() {
        Some((&FRAME_RAW, payload)) => Ok(payload.to_vec()),
        Some((&FRAME_ZSTD, payload)) => {
            let mut decoder = zstd::Decoder::new(payload).map_err(|e| {
                StashError::corrupt(format!("Failed to create zstd decoder: {}", e))
            })?;

            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| StashError::corrupt(format!("Failed to decompress data: {}", e)))?;

            Ok(decompressed)
        }
        Some((tag, _)) => Err(StashError::corrupt(format!(
            "Unknown compression frame tag: {}",
            tag
        ))),
        None => Err(StashError::corrupt("Empty compressed buffer")),
    }
}
