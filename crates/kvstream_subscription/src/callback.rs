//! Consumer callback interface.

use crate::error::SubscriptionError;
use kvstream_protocol::{BeforeImage, Vlsn};

/// A streamed put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPut {
    /// Stream position of the put.
    pub vlsn: Vlsn,
    /// Record key.
    pub key: Vec<u8>,
    /// New value.
    pub value: Vec<u8>,
    /// Owning transaction.
    pub txn_id: u64,
    /// Database the record belongs to.
    pub db_id: u64,
    /// Modification time (Unix millis).
    pub modification_time_ms: u64,
    /// Expiration time (Unix millis, 0 if none).
    pub expiration_time_ms: u64,
    /// Prior state, when before-images are enabled.
    pub before_image: Option<BeforeImage>,
}

/// A streamed delete, either explicit or a tombstone put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelete {
    /// Stream position of the delete.
    pub vlsn: Vlsn,
    /// Record key.
    pub key: Vec<u8>,
    /// Tombstone payload, for deletes that arrived as tombstone puts.
    pub tombstone: Option<Vec<u8>>,
    /// Owning transaction.
    pub txn_id: u64,
    /// Database the record belongs to.
    pub db_id: u64,
    /// Modification time (Unix millis).
    pub modification_time_ms: u64,
    /// Prior state, when before-images are enabled.
    pub before_image: Option<BeforeImage>,
}

/// Receives the stream.
///
/// All methods run on the dispatcher thread, one at a time and in stream
/// order. A slow callback delays delivery but never stalls network reads.
pub trait SubscriptionCallback: Send + Sync {
    /// A record was written.
    fn process_put(&self, put: StreamPut);

    /// A record was deleted.
    fn process_del(&self, del: StreamDelete);

    /// A transaction committed.
    fn process_commit(&self, vlsn: Vlsn, txn_id: u64, timestamp_ms: u64);

    /// A transaction aborted.
    fn process_abort(&self, vlsn: Vlsn, txn_id: u64, timestamp_ms: u64);

    /// The stream was interrupted or terminated.
    fn process_exception(&self, error: &SubscriptionError);
}
