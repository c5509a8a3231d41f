//! Subscription statistics.
//!
//! Every field lives behind a single lock so a snapshot is always
//! internally consistent. The block is created with the subscription and
//! survives reconnects.

use kvstream_protocol::{Heartbeat, Vlsn};
use parking_lot::Mutex;

/// Point-in-time copy of the subscription statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    // Counters
    /// Messages written to the feeder.
    pub messages_sent: u64,
    /// Messages read from the feeder.
    pub messages_received: u64,
    /// Times an entry could not be queued for the dispatcher within the
    /// offer timeout and was retried.
    pub queue_overflow_retries: u64,
    /// Deepest observed dispatcher queue.
    pub max_pending_input: u64,
    /// Commit markers delivered to the callback.
    pub txns_committed: u64,
    /// Abort markers delivered to the callback.
    pub txns_aborted: u64,
    /// Puts delivered to the callback.
    pub puts_delivered: u64,
    /// Deletes delivered to the callback.
    pub deletes_delivered: u64,
    /// Heartbeats received from the feeder.
    pub heartbeats_received: u64,
    /// Heartbeat responses written to the feeder.
    pub heartbeats_sent: u64,
    /// Successful reconnects after the first connection.
    pub reconnects: u64,

    // Gauges
    /// Last VLSN the feeder filtered out.
    pub last_filter_vlsn: Vlsn,
    /// Last VLSN the feeder passed through.
    pub last_pass_vlsn: Vlsn,
    /// Modification time of the last streamed record (Unix millis).
    pub last_mod_time_ms: u64,
    /// Commit time of the last streamed transaction (Unix millis).
    pub last_commit_time_ms: u64,
    /// Partition generation discovered during syncup.
    pub partition_generation: Option<u64>,
    /// Start VLSN agreed during the most recent syncup.
    pub start_vlsn: Vlsn,
    /// Highest VLSN handed to the dispatcher.
    pub high_vlsn: Vlsn,
}

/// Shared statistics block.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    inner: Mutex<StatsSnapshot>,
}

impl SubscriptionStats {
    /// Creates an empty statistics block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consistent copy of all fields.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }

    /// Returns the high-water VLSN.
    pub fn high_vlsn(&self) -> Vlsn {
        self.inner.lock().high_vlsn
    }

    pub(crate) fn record_sent(&self) {
        self.inner.lock().messages_sent += 1;
    }

    pub(crate) fn record_received(&self) {
        self.inner.lock().messages_received += 1;
    }

    pub(crate) fn record_queue_overflow(&self) {
        self.inner.lock().queue_overflow_retries += 1;
    }

    pub(crate) fn record_pending_input(&self, depth: usize) {
        let mut stats = self.inner.lock();
        stats.max_pending_input = stats.max_pending_input.max(depth as u64);
    }

    pub(crate) fn record_commit(&self) {
        self.inner.lock().txns_committed += 1;
    }

    pub(crate) fn record_abort(&self) {
        self.inner.lock().txns_aborted += 1;
    }

    pub(crate) fn record_put(&self) {
        self.inner.lock().puts_delivered += 1;
    }

    pub(crate) fn record_delete(&self) {
        self.inner.lock().deletes_delivered += 1;
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.inner.lock().heartbeats_sent += 1;
    }

    pub(crate) fn record_reconnect(&self) {
        self.inner.lock().reconnects += 1;
    }

    /// Copies the feeder's view of the stream out of a heartbeat.
    pub(crate) fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut stats = self.inner.lock();
        stats.heartbeats_received += 1;
        stats.last_filter_vlsn = heartbeat.last_filter_vlsn;
        stats.last_pass_vlsn = heartbeat.last_pass_vlsn;
        stats.last_mod_time_ms = heartbeat.last_mod_time_ms;
        stats.last_commit_time_ms = heartbeat.last_commit_time_ms;
    }

    pub(crate) fn record_syncup(&self, start_vlsn: Vlsn, partition_generation: Option<u64>) {
        let mut stats = self.inner.lock();
        stats.start_vlsn = start_vlsn;
        if partition_generation.is_some() {
            stats.partition_generation = partition_generation;
        }
    }

    /// Raises the high-water mark. Never lowers it.
    pub(crate) fn advance_high_vlsn(&self, vlsn: Vlsn) {
        let mut stats = self.inner.lock();
        if vlsn > stats.high_vlsn {
            stats.high_vlsn = vlsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SubscriptionStats::new();
        stats.record_sent();
        stats.record_sent();
        stats.record_received();
        stats.record_queue_overflow();
        stats.record_commit();
        stats.record_abort();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.queue_overflow_retries, 1);
        assert_eq!(snap.txns_committed, 1);
        assert_eq!(snap.txns_aborted, 1);
    }

    #[test]
    fn high_vlsn_is_monotonic() {
        let stats = SubscriptionStats::new();
        stats.advance_high_vlsn(Vlsn::new(10));
        stats.advance_high_vlsn(Vlsn::new(4));
        assert_eq!(stats.high_vlsn(), Vlsn::new(10));
        stats.advance_high_vlsn(Vlsn::new(11));
        assert_eq!(stats.high_vlsn(), Vlsn::new(11));
    }

    #[test]
    fn max_pending_tracks_peak() {
        let stats = SubscriptionStats::new();
        stats.record_pending_input(3);
        stats.record_pending_input(7);
        stats.record_pending_input(2);
        assert_eq!(stats.snapshot().max_pending_input, 7);
    }

    #[test]
    fn heartbeat_updates_gauges() {
        let stats = SubscriptionStats::new();
        stats.record_heartbeat(&Heartbeat {
            heartbeat_id: 1,
            master_now_ms: 100,
            current_txn_end_vlsn: Vlsn::new(50),
            last_filter_vlsn: Vlsn::new(40),
            last_pass_vlsn: Vlsn::new(45),
            last_mod_time_ms: 90,
            last_commit_time_ms: 95,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.heartbeats_received, 1);
        assert_eq!(snap.last_filter_vlsn, Vlsn::new(40));
        assert_eq!(snap.last_pass_vlsn, Vlsn::new(45));
        assert_eq!(snap.last_commit_time_ms, 95);
    }

    #[test]
    fn syncup_keeps_known_generation() {
        let stats = SubscriptionStats::new();
        stats.record_syncup(Vlsn::new(5), Some(3));
        stats.record_syncup(Vlsn::new(9), None);
        let snap = stats.snapshot();
        assert_eq!(snap.start_vlsn, Vlsn::new(9));
        assert_eq!(snap.partition_generation, Some(3));
    }
}
