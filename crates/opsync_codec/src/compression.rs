//! Threshold-based payload compression.

use crate::error::{CodecError, CodecResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Serialized JSON size at which payloads start being compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Tag stored next to a compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Payload is stored uncompressed.
    #[default]
    None,
    /// Payload is a zlib-wrapped deflate stream of its JSON form.
    Deflate,
}

impl CompressionAlgorithm {
    /// The tag as persisted.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deflate => "deflate",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = CodecError;

    fn from_str(tag: &str) -> CodecResult<Self> {
        match tag {
            "none" => Ok(Self::None),
            "deflate" => Ok(Self::Deflate),
            other => Err(CodecError::UnknownAlgorithm {
                tag: other.to_string(),
            }),
        }
    }
}

/// Output of [`compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    /// Compressed bytes; empty when `algorithm` is `None`.
    pub bytes: Vec<u8>,
    /// Algorithm used.
    pub algorithm: CompressionAlgorithm,
}

impl CompressedPayload {
    /// The "skipped" result for payloads under the threshold.
    pub const fn uncompressed() -> Self {
        Self {
            bytes: Vec::new(),
            algorithm: CompressionAlgorithm::None,
        }
    }

    /// Returns true if the payload was actually compressed.
    pub fn is_compressed(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }
}

/// Length in bytes of the compact UTF-8 JSON serialization of `data`.
pub fn serialized_len(data: &Value) -> CodecResult<usize> {
    serde_json::to_vec(data)
        .map(|bytes| bytes.len())
        .map_err(|e| CodecError::encode(e.to_string()))
}

/// Compresses `data` if its JSON form is at least [`COMPRESSION_THRESHOLD`] bytes.
pub fn compress(data: &Value) -> CodecResult<CompressedPayload> {
    compress_with_threshold(data, COMPRESSION_THRESHOLD)
}

/// Like [`compress`] with an explicit threshold.
pub fn compress_with_threshold(data: &Value, threshold: usize) -> CodecResult<CompressedPayload> {
    let json = serde_json::to_vec(data).map_err(|e| CodecError::encode(e.to_string()))?;
    if json.len() < threshold {
        return Ok(CompressedPayload::uncompressed());
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CodecError::encode(format!("deflate: {e}")))?;
    let bytes = encoder
        .finish()
        .map_err(|e| CodecError::encode(format!("deflate: {e}")))?;

    Ok(CompressedPayload {
        bytes,
        algorithm: CompressionAlgorithm::Deflate,
    })
}

/// Reverses [`compress`].
///
/// Returns `Ok(None)` for [`CompressionAlgorithm::None`]: the caller keeps
/// using its uncompressed copy.
pub fn decompress(bytes: &[u8], algorithm: CompressionAlgorithm) -> CodecResult<Option<Value>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(None),
        CompressionAlgorithm::Deflate => {
            let mut json = Vec::new();
            ZlibDecoder::new(bytes)
                .read_to_end(&mut json)
                .map_err(|e| CodecError::decode(format!("inflate: {e}")))?;
            let value = serde_json::from_slice(&json)
                .map_err(|e| CodecError::decode(format!("inflated payload is not JSON: {e}")))?;
            Ok(Some(value))
        }
    }
}
