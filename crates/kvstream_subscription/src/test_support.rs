//! Helpers for unit tests inside this crate.

use crate::callback::{StreamDelete, StreamPut, SubscriptionCallback};
use crate::channel::{FeederChannel, Received};
use crate::config::{FeederAddress, SubscriptionConfig};
use crate::context::SubscriptionContext;
use crate::error::SubscriptionError;
use kvstream_protocol::{ClientMessage, FeederMessage, Heartbeat, ProtocolResult, Vlsn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Put(StreamPut),
    Del(StreamDelete),
    Commit { vlsn: Vlsn, txn_id: u64 },
    Abort { vlsn: Vlsn, txn_id: u64 },
    Exception(SubscriptionError),
}

impl Event {
    pub(crate) fn vlsn(&self) -> Vlsn {
        match self {
            Event::Put(p) => p.vlsn,
            Event::Del(d) => d.vlsn,
            Event::Commit { vlsn, .. } | Event::Abort { vlsn, .. } => *vlsn,
            Event::Exception(_) => Vlsn::NULL,
        }
    }
}

#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) events: Arc<Mutex<Vec<Event>>>,
}

impl SubscriptionCallback for Recorder {
    fn process_put(&self, put: StreamPut) {
        self.events.lock().push(Event::Put(put));
    }

    fn process_del(&self, del: StreamDelete) {
        self.events.lock().push(Event::Del(del));
    }

    fn process_commit(&self, vlsn: Vlsn, txn_id: u64, _timestamp_ms: u64) {
        self.events.lock().push(Event::Commit { vlsn, txn_id });
    }

    fn process_abort(&self, vlsn: Vlsn, txn_id: u64, _timestamp_ms: u64) {
        self.events.lock().push(Event::Abort { vlsn, txn_id });
    }

    fn process_exception(&self, error: &SubscriptionError) {
        self.events.lock().push(Event::Exception(error.clone()));
    }
}

/// Builds a context with short timeouts and a recording callback.
pub(crate) fn context(
    configure: impl FnOnce(SubscriptionConfig) -> SubscriptionConfig,
) -> (Arc<SubscriptionContext>, Arc<Mutex<Vec<Event>>>) {
    let config = SubscriptionConfig::new(FeederAddress::new("localhost", 5001))
        .with_node_name("test-node")
        .with_poll_interval(Duration::from_millis(10))
        .with_offer_timeout(Duration::from_millis(10))
        .with_idle_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_secs(2));
    let recorder = Recorder::default();
    let events = recorder.events.clone();
    let ctx = SubscriptionContext::new(configure(config), Arc::new(recorder));
    (Arc::new(ctx), events)
}

pub(crate) fn heartbeat(id: u64, txn_end: u64) -> Heartbeat {
    Heartbeat {
        heartbeat_id: id,
        master_now_ms: 1_000,
        current_txn_end_vlsn: Vlsn::new(txn_end),
        last_filter_vlsn: Vlsn::NULL,
        last_pass_vlsn: Vlsn::new(txn_end),
        last_mod_time_ms: 900,
        last_commit_time_ms: 950,
    }
}

/// Channel that replays a fixed script and records what was sent.
#[derive(Debug)]
pub(crate) struct ScriptedChannel {
    replies: Mutex<VecDeque<FeederMessage>>,
    sent: Mutex<Vec<ClientMessage>>,
    open: AtomicBool,
}

impl ScriptedChannel {
    pub(crate) fn new(replies: impl IntoIterator<Item = FeederMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }
}

impl FeederChannel for ScriptedChannel {
    fn send(&self, message: &ClientMessage) -> ProtocolResult<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn receive(&self, _timeout: Duration) -> ProtocolResult<Received> {
        Ok(self
            .replies
            .lock()
            .pop_front()
            .map(Received::Message)
            .unwrap_or(Received::EndOfStream))
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
