//! Subscription lifecycle status.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Outcome of the coordinator's most recent connection attempt.
///
/// `Success` means the last attempt reached the streaming state; it is
/// not a liveness flag for the stream itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// No attempt has finished yet.
    Init,
    /// Connected, synced up, and streaming.
    Success,
    /// The requested start position is not available at the feeder.
    VlsnNotAvailable,
    /// The replication group shut down.
    GrpShutdown,
    /// Connection failed and the retry budget is exhausted.
    ConnectionError,
    /// The connection timed out and the retry budget is exhausted.
    TimeoutError,
    /// An unexpected failure.
    UnknownError,
    /// Authentication or authorization failed.
    SecurityCheckError,
    /// A filter change failed.
    FilterChangeError,
}

impl SubscriptionStatus {
    fn to_code(self) -> u8 {
        match self {
            SubscriptionStatus::Init => 0,
            SubscriptionStatus::Success => 1,
            SubscriptionStatus::VlsnNotAvailable => 2,
            SubscriptionStatus::GrpShutdown => 3,
            SubscriptionStatus::ConnectionError => 4,
            SubscriptionStatus::TimeoutError => 5,
            SubscriptionStatus::UnknownError => 6,
            SubscriptionStatus::SecurityCheckError => 7,
            SubscriptionStatus::FilterChangeError => 8,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => SubscriptionStatus::Init,
            1 => SubscriptionStatus::Success,
            2 => SubscriptionStatus::VlsnNotAvailable,
            3 => SubscriptionStatus::GrpShutdown,
            4 => SubscriptionStatus::ConnectionError,
            5 => SubscriptionStatus::TimeoutError,
            7 => SubscriptionStatus::SecurityCheckError,
            8 => SubscriptionStatus::FilterChangeError,
            _ => SubscriptionStatus::UnknownError,
        }
    }

    /// Returns true for every status that ends the subscription with an error.
    pub fn is_error(&self) -> bool {
        !matches!(self, SubscriptionStatus::Init | SubscriptionStatus::Success)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionStatus::Init => "INIT",
            SubscriptionStatus::Success => "SUCCESS",
            SubscriptionStatus::VlsnNotAvailable => "VLSN_NOT_AVAILABLE",
            SubscriptionStatus::GrpShutdown => "GRP_SHUTDOWN",
            SubscriptionStatus::ConnectionError => "CONNECTION_ERROR",
            SubscriptionStatus::TimeoutError => "TIMEOUT_ERROR",
            SubscriptionStatus::UnknownError => "UNKNOWN_ERROR",
            SubscriptionStatus::SecurityCheckError => "SECURITY_CHECK_ERROR",
            SubscriptionStatus::FilterChangeError => "FILTER_CHANGE_ERROR",
        };
        f.write_str(name)
    }
}

/// Atomically readable and writable status shared between threads.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SubscriptionStatus::Init.to_code()))
    }

    pub(crate) fn get(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_code(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: SubscriptionStatus) {
        self.0.store(status.to_code(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_starts_at_init() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), SubscriptionStatus::Init);
        cell.set(SubscriptionStatus::FilterChangeError);
        assert_eq!(cell.get(), SubscriptionStatus::FilterChangeError);
    }

    #[test]
    fn codes_are_stable() {
        for status in [
            SubscriptionStatus::Init,
            SubscriptionStatus::Success,
            SubscriptionStatus::VlsnNotAvailable,
            SubscriptionStatus::GrpShutdown,
            SubscriptionStatus::ConnectionError,
            SubscriptionStatus::TimeoutError,
            SubscriptionStatus::UnknownError,
            SubscriptionStatus::SecurityCheckError,
            SubscriptionStatus::FilterChangeError,
        ] {
            assert_eq!(SubscriptionStatus::from_code(status.to_code()), status);
        }
    }

    #[test]
    fn error_statuses() {
        assert!(!SubscriptionStatus::Init.is_error());
        assert!(!SubscriptionStatus::Success.is_error());
        assert!(SubscriptionStatus::GrpShutdown.is_error());
        assert_eq!(SubscriptionStatus::VlsnNotAvailable.to_string(), "VLSN_NOT_AVAILABLE");
    }
}
