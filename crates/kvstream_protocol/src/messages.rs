//! Protocol messages exchanged between a subscriber and a feeder.
//!
//! Messages are split by direction: [`ClientMessage`] flows from the
//! subscriber to the feeder and [`FeederMessage`] flows back. Both are
//! encoded as CBOR and carried in length-prefixed frames (see
//! [`frame`](crate::frame)).

use crate::error::ProtocolResult;
use crate::filter::{FilterChange, FilterChangeStatus, StreamFilter};
use crate::record::LogRecord;
use crate::vlsn::Vlsn;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Highest protocol version this crate speaks.
pub const PROTOCOL_VERSION: u32 = 4;

/// Service name a subscriber asks for during the service handshake.
pub const FEEDER_SERVICE: &str = "feeder";

/// Role a node announces during the service handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// An external stream subscriber.
    Subscriber,
    /// A secondary (read-only) replica node.
    Secondary,
}

/// How the feeder chooses the first streamed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    /// Start exactly at the requested VLSN; fail if it is gone.
    Exact,
    /// Start at the requested VLSN, or the oldest available one if later.
    Available,
    /// Ignore the requested VLSN and start after the newest entry.
    Now,
    /// Resume a previously established stream at the requested VLSN.
    Resume,
}

/// Syncup request naming the desired start position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncupRequest {
    /// Requested start position.
    pub start_vlsn: Vlsn,
    /// How to interpret `start_vlsn`.
    pub mode: StreamMode,
    /// Filter the feeder should apply.
    pub filter: StreamFilter,
}

/// Feeder heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Correlation ID echoed in the heartbeat response.
    pub heartbeat_id: u64,
    /// Feeder wall clock (Unix millis).
    pub master_now_ms: u64,
    /// VLSN of the latest transaction end on the feeder.
    pub current_txn_end_vlsn: Vlsn,
    /// Last VLSN the feeder filtered out for this subscriber.
    pub last_filter_vlsn: Vlsn,
    /// Last VLSN the feeder passed through to this subscriber.
    pub last_pass_vlsn: Vlsn,
    /// Modification time of the last streamed record (Unix millis).
    pub last_mod_time_ms: u64,
    /// Commit time of the last streamed transaction (Unix millis).
    pub last_commit_time_ms: u64,
}

/// A streamed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position of this entry.
    pub vlsn: Vlsn,
    /// CBOR-encoded [`LogRecord`].
    pub payload: Bytes,
}

impl Entry {
    /// Creates an entry by encoding a log record.
    pub fn new(vlsn: Vlsn, record: &LogRecord) -> ProtocolResult<Self> {
        Ok(Self {
            vlsn,
            payload: Bytes::from(record.encode()?),
        })
    }

    /// Decodes the wrapped log record.
    pub fn record(&self) -> ProtocolResult<LogRecord> {
        LogRecord::decode(&self.payload)
    }
}

/// Feeder answer to a filter change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChangeResponse {
    /// Request ID of the change being answered.
    pub request_id: String,
    /// Wire status code, see [`FilterChangeStatus`].
    pub status_code: u8,
    /// Stream position at which the change took effect.
    pub effective_vlsn: Vlsn,
    /// Feeder-supplied explanation.
    pub reason: Option<String>,
}

impl FilterChangeResponse {
    /// Creates a response with a known status.
    pub fn new(request_id: impl Into<String>, status: FilterChangeStatus, vlsn: Vlsn) -> Self {
        Self {
            request_id: request_id.into(),
            status_code: status.to_code(),
            effective_vlsn: vlsn,
            reason: None,
        }
    }

    /// Sets the explanation.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Decodes the status, `None` if the code is unknown.
    pub fn status(&self) -> Option<FilterChangeStatus> {
        FilterChangeStatus::from_code(self.status_code)
    }
}

/// Feeder answer to a service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceResponse {
    /// The service accepted the connection.
    Accepted,
    /// The service is temporarily unable to accept the connection.
    Busy {
        /// Suggested wait before retrying (millis).
        retry_after_ms: u64,
    },
    /// The presented credentials were rejected.
    AuthFailure {
        /// Rejection reason.
        reason: String,
    },
}

/// A message sent from a subscriber to a feeder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Service discovery handshake.
    ServiceRequest {
        /// Requested service name.
        service: String,
        /// Name of the connecting node.
        node_name: String,
        /// Role of the connecting node.
        node_type: NodeType,
        /// Authentication token, if security is enabled.
        auth_token: Option<Vec<u8>>,
    },
    /// Highest protocol version the subscriber speaks.
    ProtocolVersion {
        /// Proposed version.
        version: u32,
    },
    /// Start position negotiation.
    SyncupRequest(SyncupRequest),
    /// Acknowledges a heartbeat.
    HeartbeatResponse {
        /// Heartbeat being acknowledged.
        heartbeat_id: u64,
        /// Highest VLSN delivered to the consumer path.
        high_vlsn: Vlsn,
    },
    /// Presents a renewed authentication token.
    ReAuthenticate {
        /// The renewed token.
        token: Vec<u8>,
    },
    /// Requests a filter change.
    FilterChangeRequest(FilterChange),
}

impl ClientMessage {
    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ServiceRequest { .. } => "service_request",
            ClientMessage::ProtocolVersion { .. } => "protocol_version",
            ClientMessage::SyncupRequest(_) => "syncup_request",
            ClientMessage::HeartbeatResponse { .. } => "heartbeat_response",
            ClientMessage::ReAuthenticate { .. } => "reauthenticate",
            ClientMessage::FilterChangeRequest(_) => "filter_change_request",
        }
    }
}

/// A message sent from a feeder to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeederMessage {
    /// Answer to a service request.
    ServiceResponse(ServiceResponse),
    /// Version the feeder will speak.
    ProtocolVersion {
        /// Feeder's version.
        version: u32,
    },
    /// Syncup succeeded.
    SyncupResponse {
        /// Agreed start position.
        start_vlsn: Vlsn,
        /// Partition generation the stream belongs to, if known.
        partition_generation: Option<u64>,
    },
    /// The requested position is no longer in the feeder's log.
    LogNotAvailable {
        /// Oldest available position.
        first: Vlsn,
        /// Newest available position.
        last: Vlsn,
    },
    /// Liveness heartbeat.
    Heartbeat(Heartbeat),
    /// A streamed log entry.
    Entry(Entry),
    /// Answer to a filter change request.
    FilterChangeResponse(FilterChangeResponse),
    /// The feeder rejected the subscriber's credentials.
    SecurityFailure {
        /// Rejection reason.
        reason: String,
    },
    /// The replication group is shutting down.
    ShutdownRequest {
        /// Feeder time of the shutdown (Unix millis).
        shutdown_time_ms: u64,
    },
}

impl FeederMessage {
    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FeederMessage::ServiceResponse(_) => "service_response",
            FeederMessage::ProtocolVersion { .. } => "protocol_version",
            FeederMessage::SyncupResponse { .. } => "syncup_response",
            FeederMessage::LogNotAvailable { .. } => "log_not_available",
            FeederMessage::Heartbeat(_) => "heartbeat",
            FeederMessage::Entry(_) => "entry",
            FeederMessage::FilterChangeResponse(_) => "filter_change_response",
            FeederMessage::SecurityFailure { .. } => "security_failure",
            FeederMessage::ShutdownRequest { .. } => "shutdown_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wraps_record() {
        let record = LogRecord::put(b"k".to_vec(), b"v".to_vec(), 1, 2, 3);
        let entry = Entry::new(Vlsn::new(10), &record).unwrap();
        assert_eq!(entry.vlsn, Vlsn::new(10));
        assert_eq!(entry.record().unwrap(), record);
    }

    #[test]
    fn filter_change_response_status() {
        let resp = FilterChangeResponse::new("r1", FilterChangeStatus::NotApplicable, Vlsn::FIRST)
            .with_reason("table already removed");
        assert_eq!(resp.status(), Some(FilterChangeStatus::NotApplicable));
        assert_eq!(resp.reason.as_deref(), Some("table already removed"));

        let unknown = FilterChangeResponse {
            status_code: 99,
            ..resp
        };
        assert_eq!(unknown.status(), None);
    }

    #[test]
    fn message_kinds() {
        assert_eq!(
            FeederMessage::ShutdownRequest { shutdown_time_ms: 0 }.kind(),
            "shutdown_request"
        );
        assert_eq!(
            ClientMessage::ProtocolVersion { version: PROTOCOL_VERSION }.kind(),
            "protocol_version"
        );
    }
}
