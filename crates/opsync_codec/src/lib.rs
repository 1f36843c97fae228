//! # opsync Codec
//!
//! Byte-level transforms used by the mutation queue:
//!
//! - **Payload compression**: a queued payload whose JSON form is at least
//!   [`COMPRESSION_THRESHOLD`] bytes is stored as a deflate stream tagged
//!   `"deflate"`; smaller payloads are tagged `"none"` and stored as-is.
//! - **Record encoding**: queue entries are written to the log as CBOR.
//!
//! Failures are never swallowed. A stream that cannot be inflated, or that
//! inflates to something other than JSON, is a [`CodecError::Decode`] so a
//! corrupted entry is surfaced instead of being read as an empty payload.
//!
//! ```
//! use opsync_codec::{compress, decompress, CompressionAlgorithm};
//! use serde_json::json;
//!
//! let small = compress(&json!({"name": "Espresso"})).unwrap();
//! assert_eq!(small.algorithm, CompressionAlgorithm::None);
//! assert!(small.bytes.is_empty());
//!
//! let large = json!({"notes": "x".repeat(2048)});
//! let packed = compress(&large).unwrap();
//! assert_eq!(packed.algorithm, CompressionAlgorithm::Deflate);
//! assert_eq!(decompress(&packed.bytes, packed.algorithm).unwrap(), Some(large));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod compression;
mod error;

pub use cbor::{from_cbor, to_cbor, Decode, Encode};
pub use compression::{
    compress, compress_with_threshold, decompress, serialized_len, CompressedPayload,
    CompressionAlgorithm, COMPRESSION_THRESHOLD,
};
pub use error::{CodecError, CodecResult};
