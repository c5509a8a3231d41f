//! Filter change bookkeeping.
//!
//! A submitted change is tracked in two maps keyed by request ID: the
//! pending map, which lets it be resent after a reconnect, and the handler
//! map, which guarantees the consumer's handler runs exactly once. Both
//! are concurrent maps because the façade's caller and the coordinator
//! touch them from different threads.

use crate::error::{SubscriptionError, SubscriptionResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kvstream_protocol::{FilterChange, FilterChangeStatus, Vlsn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a filter change the feeder answered without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChangeOutcome {
    /// Request ID of the change.
    pub request_id: String,
    /// `Ok` or `NotApplicable`.
    pub status: FilterChangeStatus,
    /// Stream position at which the change took effect.
    pub effective_vlsn: Vlsn,
    /// Feeder-supplied explanation.
    pub reason: Option<String>,
}

/// Completion handler for a filter change. Runs exactly once.
pub type FilterChangeHandler =
    Box<dyn FnOnce(Result<FilterChangeOutcome, SubscriptionError>) + Send + 'static>;

struct PendingChange {
    seq: u64,
    change: FilterChange,
}

#[derive(Default)]
pub(crate) struct FilterChangeTracker {
    pending: DashMap<String, PendingChange>,
    handlers: DashMap<String, Mutex<FilterChangeHandler>>,
    outbound: Mutex<VecDeque<FilterChange>>,
    next_seq: AtomicU64,
    /// Set by `fail_all`. Held for reading across a whole `submit`.
    closed: RwLock<bool>,
}

impl FilterChangeTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a change and queues it for the writer.
    pub(crate) fn submit(
        &self,
        change: FilterChange,
        handler: FilterChangeHandler,
    ) -> SubscriptionResult<()> {
        let closed = self.closed.read();
        if *closed {
            return Err(SubscriptionError::IllegalState(
                "subscription has stopped accepting filter changes".into(),
            ));
        }
        let request_id = change.request_id.clone();
        if request_id.is_empty() {
            return Err(SubscriptionError::InvalidArgument(
                "filter change request ID is empty".into(),
            ));
        }
        if self.handlers.contains_key(&request_id) {
            return Err(duplicate(&request_id));
        }

        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(duplicate(&request_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingChange {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    change: change.clone(),
                });
            }
        }
        self.handlers.insert(request_id, Mutex::new(handler));
        self.outbound.lock().push_back(change);
        Ok(())
    }

    /// Takes every queued change in submission order.
    pub(crate) fn drain_outbound(&self) -> Vec<FilterChange> {
        self.outbound.lock().drain(..).collect()
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    /// Rebuilds the outbound queue from every unresolved change, for a
    /// fresh connection. Returns the number queued.
    pub(crate) fn requeue_pending(&self) -> usize {
        let mut changes: Vec<(u64, FilterChange)> = self
            .pending
            .iter()
            .map(|entry| (entry.seq, entry.change.clone()))
            .collect();
        changes.sort_by_key(|(seq, _)| *seq);

        let mut outbound = self.outbound.lock();
        outbound.clear();
        outbound.extend(changes.into_iter().map(|(_, change)| change));
        outbound.len()
    }

    /// Removes a change and its handler once the feeder has answered it.
    /// Returns `None` if no handler is registered for the ID.
    pub(crate) fn resolve(&self, request_id: &str) -> Option<(FilterChange, FilterChangeHandler)> {
        let (_, handler) = self.handlers.remove(request_id)?;
        let (_, pending) = self.pending.remove(request_id)?;
        Some((pending.change, handler.into_inner()))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fails every outstanding change with `error` and rejects later
    /// submissions.
    pub(crate) fn fail_all(&self, error: &SubscriptionError) {
        *self.closed.write() = true;
        self.outbound.lock().clear();
        let ids: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.pending.remove(&id);
            if let Some((_, handler)) = self.handlers.remove(&id) {
                (handler.into_inner())(Err(error.clone()));
            }
        }
        self.pending.clear();
    }
}

fn duplicate(request_id: &str) -> SubscriptionError {
    SubscriptionError::InvalidArgument(format!(
        "filter change {request_id} is already pending"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (
        Arc<Mutex<Vec<Result<FilterChangeOutcome, SubscriptionError>>>>,
        FilterChangeHandler,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (results, Box::new(move |r| sink.lock().push(r)))
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let tracker = FilterChangeTracker::new();
        let (_, first) = recorder();
        let (_, second) = recorder();

        tracker
            .submit(FilterChange::add_table("r1", "orders"), first)
            .unwrap();
        let err = tracker
            .submit(FilterChange::add_table("r1", "users"), second)
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidArgument(_)));

        assert_eq!(tracker.pending_count(), 1);
        let (change, _) = tracker.resolve("r1").unwrap();
        assert_eq!(change, FilterChange::add_table("r1", "orders"));
        assert!(tracker.resolve("r1").is_none());
    }

    #[test]
    fn outbound_preserves_order() {
        let tracker = FilterChangeTracker::new();
        for id in ["a", "b", "c"] {
            let (_, handler) = recorder();
            tracker
                .submit(FilterChange::add_table(id, id), handler)
                .unwrap();
        }
        let ids: Vec<_> = tracker
            .drain_outbound()
            .into_iter()
            .map(|c| c.request_id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(!tracker.has_outbound());
    }

    #[test]
    fn requeue_resends_unresolved_in_order() {
        let tracker = FilterChangeTracker::new();
        for id in ["a", "b", "c"] {
            let (_, handler) = recorder();
            tracker
                .submit(FilterChange::remove_table(id, id), handler)
                .unwrap();
        }
        tracker.drain_outbound();
        tracker.resolve("b").unwrap();

        assert_eq!(tracker.requeue_pending(), 2);
        let ids: Vec<_> = tracker
            .drain_outbound()
            .into_iter()
            .map(|c| c.request_id)
            .collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[test]
    fn fail_all_runs_each_handler_once() {
        let tracker = FilterChangeTracker::new();
        let (results, handler) = recorder();
        tracker
            .submit(FilterChange::add_table("r1", "t"), handler)
            .unwrap();

        tracker.fail_all(&SubscriptionError::ShuttingDown);
        tracker.fail_all(&SubscriptionError::ShuttingDown);

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(SubscriptionError::ShuttingDown));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn submit_after_fail_all_is_rejected() {
        let tracker = FilterChangeTracker::new();
        tracker.fail_all(&SubscriptionError::ShuttingDown);

        let (results, handler) = recorder();
        let err = tracker
            .submit(FilterChange::add_table("late", "t"), handler)
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::IllegalState(_)));
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.has_outbound());
        assert!(results.lock().is_empty());
    }

    #[test]
    fn empty_request_id_is_rejected() {
        let tracker = FilterChangeTracker::new();
        let (_, handler) = recorder();
        assert!(tracker
            .submit(FilterChange::add_table("", "t"), handler)
            .is_err());
    }
}
