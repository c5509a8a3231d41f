//! Replicated log records.
//!
//! A `LogRecord` is the logical content of one entry in the feeder's
//! change log. Records travel inside [`Entry`](crate::Entry) messages as
//! opaque CBOR bytes and are only decoded on the consumer side, so the
//! network reader never pays the decode cost.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// The prior state of a record, carried alongside a put or delete when
/// before-images are enabled on the feeder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeforeImage {
    /// Previous value, if the record existed.
    pub value: Option<Vec<u8>>,
    /// Previous modification time (Unix millis).
    pub modification_time_ms: u64,
    /// Previous expiration time (Unix millis, 0 if none).
    pub expiration_time_ms: u64,
}

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A put (insert or update).
    Put,
    /// A delete.
    Delete,
    /// A transaction commit marker.
    Commit,
    /// A transaction abort marker.
    Abort,
}

/// A single logical record from the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A record was written.
    Put {
        /// Record key.
        key: Vec<u8>,
        /// Record value. For tombstones this is the tombstone payload.
        value: Vec<u8>,
        /// Owning transaction.
        txn_id: u64,
        /// Database (table partition) the record belongs to.
        db_id: u64,
        /// Modification time (Unix millis).
        modification_time_ms: u64,
        /// Expiration time (Unix millis, 0 if none).
        expiration_time_ms: u64,
        /// Whether this put masks a deleted row.
        tombstone: bool,
        /// Optional prior state.
        before_image: Option<BeforeImage>,
    },
    /// A record was deleted.
    Delete {
        /// Record key.
        key: Vec<u8>,
        /// Owning transaction.
        txn_id: u64,
        /// Database (table partition) the record belongs to.
        db_id: u64,
        /// Modification time (Unix millis).
        modification_time_ms: u64,
        /// Optional prior state.
        before_image: Option<BeforeImage>,
    },
    /// A transaction committed.
    Commit {
        /// Transaction ID.
        txn_id: u64,
        /// Commit timestamp (Unix millis).
        timestamp_ms: u64,
    },
    /// A transaction aborted.
    Abort {
        /// Transaction ID.
        txn_id: u64,
        /// Abort timestamp (Unix millis).
        timestamp_ms: u64,
    },
}

impl LogRecord {
    /// Creates a put record without a before-image.
    pub fn put(
        key: Vec<u8>,
        value: Vec<u8>,
        txn_id: u64,
        db_id: u64,
        modification_time_ms: u64,
    ) -> Self {
        Self::Put {
            key,
            value,
            txn_id,
            db_id,
            modification_time_ms,
            expiration_time_ms: 0,
            tombstone: false,
            before_image: None,
        }
    }

    /// Creates a tombstone put, which consumers observe as a delete.
    pub fn tombstone(
        key: Vec<u8>,
        value: Vec<u8>,
        txn_id: u64,
        db_id: u64,
        modification_time_ms: u64,
    ) -> Self {
        Self::Put {
            key,
            value,
            txn_id,
            db_id,
            modification_time_ms,
            expiration_time_ms: 0,
            tombstone: true,
            before_image: None,
        }
    }

    /// Creates a delete record without a before-image.
    pub fn delete(key: Vec<u8>, txn_id: u64, db_id: u64, modification_time_ms: u64) -> Self {
        Self::Delete {
            key,
            txn_id,
            db_id,
            modification_time_ms,
            before_image: None,
        }
    }

    /// Creates a commit marker.
    pub fn commit(txn_id: u64, timestamp_ms: u64) -> Self {
        Self::Commit { txn_id, timestamp_ms }
    }

    /// Creates an abort marker.
    pub fn abort(txn_id: u64, timestamp_ms: u64) -> Self {
        Self::Abort { txn_id, timestamp_ms }
    }

    /// Attaches a before-image to a put or delete. Markers are returned unchanged.
    pub fn with_before_image(mut self, image: BeforeImage) -> Self {
        match &mut self {
            Self::Put { before_image, .. } | Self::Delete { before_image, .. } => {
                *before_image = Some(image);
            }
            Self::Commit { .. } | Self::Abort { .. } => {}
        }
        self
    }

    /// Returns the record kind.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Put { .. } => RecordKind::Put,
            Self::Delete { .. } => RecordKind::Delete,
            Self::Commit { .. } => RecordKind::Commit,
            Self::Abort { .. } => RecordKind::Abort,
        }
    }

    /// Returns the owning transaction ID.
    pub fn txn_id(&self) -> u64 {
        match self {
            Self::Put { txn_id, .. }
            | Self::Delete { txn_id, .. }
            | Self::Commit { txn_id, .. }
            | Self::Abort { txn_id, .. } => *txn_id,
        }
    }

    /// Returns true for commit and abort markers.
    pub fn is_txn_end(&self) -> bool {
        matches!(self, Self::Commit { .. } | Self::Abort { .. })
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(ProtocolError::encoding)?;
        Ok(bytes)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(ProtocolError::decoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_is_a_put() {
        let record = LogRecord::tombstone(b"k".to_vec(), b"gone".to_vec(), 7, 1, 100);
        assert_eq!(record.kind(), RecordKind::Put);
        assert!(matches!(record, LogRecord::Put { tombstone: true, .. }));
    }

    #[test]
    fn before_image_only_attaches_to_data() {
        let image = BeforeImage {
            value: Some(b"old".to_vec()),
            modification_time_ms: 5,
            expiration_time_ms: 0,
        };

        let put =
            LogRecord::put(b"k".to_vec(), b"v".to_vec(), 1, 1, 10).with_before_image(image.clone());
        assert!(matches!(put, LogRecord::Put { before_image: Some(ref b), .. } if *b == image));

        let commit = LogRecord::commit(1, 11).with_before_image(image);
        assert_eq!(commit, LogRecord::commit(1, 11));
    }

    #[test]
    fn txn_markers() {
        assert!(LogRecord::commit(3, 0).is_txn_end());
        assert!(LogRecord::abort(3, 0).is_txn_end());
        assert!(!LogRecord::delete(b"k".to_vec(), 3, 1, 0).is_txn_end());
        assert_eq!(LogRecord::abort(9, 0).txn_id(), 9);
    }

    #[test]
    fn decode_delete_with_before_image() {
        let image = BeforeImage {
            value: None,
            modification_time_ms: 900,
            expiration_time_ms: 2_000,
        };
        let record = LogRecord::delete(b"user/1".to_vec(), 12, 4, 1_000).with_before_image(image);
        let bytes = record.encode().unwrap();
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            LogRecord::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::DecodingFailed { .. })
        ));
    }
}
