//! Error types for the subscription client.

use crate::status::SubscriptionStatus;
use kvstream_protocol::{ProtocolError, Vlsn};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors that can occur in a subscription.
///
/// Errors are cloneable because the same terminal error is stored for
/// later retrieval, delivered to the callback, and returned from `start`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Transient network failure or connect refusal.
    #[error("connection to feeder failed: {message}")]
    Connection {
        /// Error message.
        message: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// The feeder connection timed out or went idle.
    #[error("feeder connection timed out: {message}")]
    Timeout {
        /// Error message.
        message: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// Authentication or authorization failed.
    #[error("security check failed: {0}")]
    Security(String),

    /// The requested stream position is no longer available at the feeder.
    #[error("insufficient log: requested {requested}, feeder has {first}..{last}")]
    InsufficientLog {
        /// Requested start position.
        requested: Vlsn,
        /// Oldest position the feeder still has.
        first: Vlsn,
        /// Newest position the feeder has.
        last: Vlsn,
    },

    /// The replication group is shutting down.
    #[error("replication group shut down at {shutdown_time_ms}")]
    GroupShutdown {
        /// Feeder time of the shutdown (Unix millis).
        shutdown_time_ms: u64,
    },

    /// A filter change failed and the local filter may diverge from the feeder's.
    #[error("filter change {request_id} failed: {reason}")]
    FilterChange {
        /// Request ID of the failed change.
        request_id: String,
        /// Failure reason.
        reason: String,
    },

    /// The feeder sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current subscription state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The subscription is shutting down.
    #[error("subscription is shutting down")]
    ShuttingDown,
}

impl SubscriptionError {
    /// Creates a retryable connection error.
    pub fn connection(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Connection {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a retryable timeout error.
    pub fn timeout(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Timeout {
            message: message.into(),
            retry_after,
        }
    }

    /// Classifies an I/O error from the transport.
    pub fn from_io(err: &io::Error, retry_after: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::Security(err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::timeout(err.to_string(), retry_after)
            }
            _ => Self::connection(err.to_string(), retry_after),
        }
    }

    /// Returns true if the coordinator may reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Suggested wait before retrying, for retryable errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Connection { retry_after, .. } | Self::Timeout { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// The status a subscription ends in when this error terminates it.
    pub fn terminal_status(&self) -> SubscriptionStatus {
        match self {
            Self::Connection { .. } => SubscriptionStatus::ConnectionError,
            Self::Timeout { .. } => SubscriptionStatus::TimeoutError,
            Self::Security(_) => SubscriptionStatus::SecurityCheckError,
            Self::InsufficientLog { .. } => SubscriptionStatus::VlsnNotAvailable,
            Self::GroupShutdown { .. } => SubscriptionStatus::GrpShutdown,
            Self::FilterChange { .. } => SubscriptionStatus::FilterChangeError,
            _ => SubscriptionStatus::UnknownError,
        }
    }
}

impl From<ProtocolError> for SubscriptionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidFilterChange { request_id, reason } => {
                Self::FilterChange { request_id, reason }
            }
            ProtocolError::Io(io) => Self::from_io(&io, Duration::ZERO),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SubscriptionError::connection("reset", Duration::ZERO).is_retryable());
        assert!(SubscriptionError::timeout("idle", Duration::ZERO).is_retryable());
        assert!(!SubscriptionError::Security("expired".into()).is_retryable());
        assert!(!SubscriptionError::GroupShutdown { shutdown_time_ms: 1 }.is_retryable());
        assert!(!SubscriptionError::InsufficientLog {
            requested: Vlsn::FIRST,
            first: Vlsn::new(10),
            last: Vlsn::new(20),
        }
        .is_retryable());
    }

    #[test]
    fn terminal_status_mapping() {
        assert_eq!(
            SubscriptionError::connection("x", Duration::ZERO).terminal_status(),
            SubscriptionStatus::ConnectionError
        );
        assert_eq!(
            SubscriptionError::FilterChange {
                request_id: "r".into(),
                reason: "x".into()
            }
            .terminal_status(),
            SubscriptionStatus::FilterChangeError
        );
        assert_eq!(
            SubscriptionError::Protocol("x".into()).terminal_status(),
            SubscriptionStatus::UnknownError
        );
    }

    #[test]
    fn io_classification() {
        let retry = Duration::from_millis(5);
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "bad token");
        assert!(matches!(
            SubscriptionError::from_io(&denied, retry),
            SubscriptionError::Security(_)
        ));

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            SubscriptionError::from_io(&timed_out, retry).retry_after(),
            Some(retry)
        );

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            SubscriptionError::from_io(&refused, retry),
            SubscriptionError::Connection { .. }
        ));
    }

    #[test]
    fn protocol_error_conversion() {
        let err: SubscriptionError = ProtocolError::InvalidFilterChange {
            request_id: "r9".into(),
            reason: "unknown table".into(),
        }
        .into();
        assert_eq!(err.terminal_status(), SubscriptionStatus::FilterChangeError);
    }
}
