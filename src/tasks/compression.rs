//! Task description compression.
//!
//! Long descriptions are stored as `COMPRESSED:gzip:<base64>`; reads
//! decompress transparently so the rest of the system only ever sees plain
//! text.

use crate::utils::error::{OrchestratorError, OrchestratorResult};
use base64::{engine::general_purpose, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Marker prefix for compressed descriptions.
pub const COMPRESSED_PREFIX: &str = "COMPRESSED:gzip:";

/// Compress a description unconditionally.
pub fn compress(text: &str) -> OrchestratorResult<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| OrchestratorError::OperationFailed {
            reason: format!("compression failed: {e}"),
        })?;
    let compressed = encoder
        .finish()
        .map_err(|e| OrchestratorError::OperationFailed {
            reason: format!("compression failed: {e}"),
        })?;
    Ok(format!(
        "{COMPRESSED_PREFIX}{}",
        general_purpose::STANDARD.encode(compressed)
    ))
}

/// Compress only when the description exceeds the configured threshold.
pub fn maybe_compress(text: &str, threshold: usize) -> OrchestratorResult<String> {
    if text.len() > threshold && !text.starts_with(COMPRESSED_PREFIX) {
        compress(text)
    } else {
        Ok(text.to_string())
    }
}

/// Return the plain text form of a possibly-compressed description.
pub fn decompress(text: &str) -> OrchestratorResult<String> {
    let Some(encoded) = text.strip_prefix(COMPRESSED_PREFIX) else {
        return Ok(text.to_string());
    };

    let raw = general_purpose::STANDARD.decode(encoded).map_err(|e| {
        OrchestratorError::OperationFailed {
            reason: format!("invalid compressed description: {e}"),
        }
    })?;

    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| OrchestratorError::OperationFailed {
            reason: format!("decompression failed: {e}"),
        })?;
    Ok(out)
}
