//! Recording subscription callback.

use kvstream_protocol::Vlsn;
use kvstream_subscription::{StreamDelete, StreamPut, SubscriptionCallback, SubscriptionError};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `process_put`.
    Put(StreamPut),
    /// `process_del`.
    Del(StreamDelete),
    /// `process_commit`.
    Commit {
        /// Stream position.
        vlsn: Vlsn,
        /// Transaction ID.
        txn_id: u64,
    },
    /// `process_abort`.
    Abort {
        /// Stream position.
        vlsn: Vlsn,
        /// Transaction ID.
        txn_id: u64,
    },
    /// `process_exception`.
    Exception(SubscriptionError),
}

impl CallbackEvent {
    /// Stream position of a data event, `None` for exceptions.
    pub fn vlsn(&self) -> Option<Vlsn> {
        match self {
            CallbackEvent::Put(put) => Some(put.vlsn),
            CallbackEvent::Del(del) => Some(del.vlsn),
            CallbackEvent::Commit { vlsn, .. } | CallbackEvent::Abort { vlsn, .. } => Some(*vlsn),
            CallbackEvent::Exception(_) => None,
        }
    }
}

/// Records every invocation and can be stalled to back up the
/// dispatcher queue.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
    recorded: Condvar,
    stalled: Mutex<bool>,
    released: Condvar,
}

impl RecordingCallback {
    /// Creates a callback that records without stalling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks every following invocation until [`release`](Self::release).
    pub fn stall(&self) {
        *self.stalled.lock() = true;
    }

    /// Lets stalled invocations proceed.
    pub fn release(&self) {
        *self.stalled.lock() = false;
        self.released.notify_all();
    }

    /// All recorded events, in invocation order.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    /// Positions of the recorded data events, in invocation order.
    pub fn vlsns(&self) -> Vec<Vlsn> {
        self.events
            .lock()
            .iter()
            .filter_map(CallbackEvent::vlsn)
            .collect()
    }

    /// Errors delivered through `process_exception`.
    pub fn exceptions(&self) -> Vec<SubscriptionError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::Exception(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    /// Waits until `condition` holds for the recorded events.
    pub fn wait_for(&self, timeout: Duration, condition: impl Fn(&[CallbackEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !condition(&events) {
            if self.recorded.wait_until(&mut events, deadline).timed_out() {
                return condition(&events);
            }
        }
        true
    }

    /// Waits until at least `count` data events were recorded.
    pub fn wait_for_data(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |events| {
            events.iter().filter(|e| e.vlsn().is_some()).count() >= count
        })
    }

    fn record(&self, event: CallbackEvent) {
        let mut stalled = self.stalled.lock();
        while *stalled {
            self.released.wait(&mut stalled);
        }
        drop(stalled);

        self.events.lock().push(event);
        self.recorded.notify_all();
    }
}

impl SubscriptionCallback for RecordingCallback {
    fn process_put(&self, put: StreamPut) {
        self.record(CallbackEvent::Put(put));
    }

    fn process_del(&self, del: StreamDelete) {
        self.record(CallbackEvent::Del(del));
    }

    fn process_commit(&self, vlsn: Vlsn, txn_id: u64, _timestamp_ms: u64) {
        self.record(CallbackEvent::Commit { vlsn, txn_id });
    }

    fn process_abort(&self, vlsn: Vlsn, txn_id: u64, _timestamp_ms: u64) {
        self.record(CallbackEvent::Abort { vlsn, txn_id });
    }

    fn process_exception(&self, error: &SubscriptionError) {
        self.events
            .lock()
            .push(CallbackEvent::Exception(error.clone()));
        self.recorded.notify_all();
    }
}
