//! Error types for the protocol crate.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or framing messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Failed to encode a message to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A frame header announced more bytes than the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Configured maximum frame size.
        max: usize,
    },

    /// A filter change cannot be applied to the local filter.
    #[error("filter change {request_id} cannot be applied: {reason}")]
    InvalidFilterChange {
        /// Request ID of the rejected change.
        request_id: String,
        /// Why the change was rejected.
        reason: String,
    },

    /// I/O error while reading or writing frames.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        Self::EncodingFailed {
            message: err.to_string(),
        }
    }

    pub(crate) fn decoding(err: impl std::fmt::Display) -> Self {
        Self::DecodingFailed {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 10 };
        assert_eq!(err.to_string(), "frame of 100 bytes exceeds maximum of 10 bytes");

        let err = ProtocolError::InvalidFilterChange {
            request_id: "req-1".into(),
            reason: "table not subscribed".into(),
        };
        assert!(err.to_string().contains("req-1"));
    }
}
