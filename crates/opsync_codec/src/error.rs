//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding, compressing or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to serialize or compress a value.
    #[error("encoding failed: {message}")]
    Encode {
        /// Description of the encoding error.
        message: String,
    },

    /// Stored bytes could not be turned back into a value.
    #[error("decoding failed: {message}")]
    Decode {
        /// Description of the decoding error.
        message: String,
    },

    /// Algorithm tag not understood by this build.
    #[error("unknown compression algorithm: {tag}")]
    UnknownAlgorithm {
        /// The tag found in storage.
        tag: String,
    },
}

impl CodecError {
    /// Creates an encoding error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns true for errors raised while reading stored bytes.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::UnknownAlgorithm { .. })
    }
}
