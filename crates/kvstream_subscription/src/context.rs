//! State shared by the façade and the worker threads.

use crate::callback::SubscriptionCallback;
use crate::channel::FeederChannel;
use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;
use crate::filter_change::FilterChangeTracker;
use crate::stats::SubscriptionStats;
use crate::status::{StatusCell, SubscriptionStatus};
use crate::writer::OutputToken;
use crossbeam_channel::Sender;
use kvstream_protocol::StreamFilter;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Context shared by every thread of one subscription.
///
/// Lives as long as the façade and survives reconnects.
pub(crate) struct SubscriptionContext {
    pub(crate) config: SubscriptionConfig,
    pub(crate) callback: Arc<dyn SubscriptionCallback>,
    pub(crate) stats: SubscriptionStats,
    pub(crate) status: StatusCell,
    /// Local mirror of the feeder's filter.
    pub(crate) filter: Mutex<StreamFilter>,
    pub(crate) filter_changes: FilterChangeTracker,
    node_name: RwLock<Option<String>>,
    stored_error: Mutex<Option<SubscriptionError>>,
    /// Token queue of the current writer, present only while streaming.
    writer: RwLock<Option<Sender<OutputToken>>>,
    /// Channel of the current connection attempt.
    channel: Mutex<Option<Arc<dyn FeederChannel>>>,
    streaming: AtomicBool,
    shutdown: AtomicBool,
}

impl SubscriptionContext {
    pub(crate) fn new(config: SubscriptionConfig, callback: Arc<dyn SubscriptionCallback>) -> Self {
        let filter = config.filter.clone();
        let node_name = config.node_name.clone();
        Self {
            config,
            callback,
            stats: SubscriptionStats::new(),
            status: StatusCell::new(),
            filter: Mutex::new(filter),
            filter_changes: FilterChangeTracker::new(),
            node_name: RwLock::new(node_name),
            stored_error: Mutex::new(None),
            writer: RwLock::new(None),
            channel: Mutex::new(None),
            streaming: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn node_name(&self) -> Option<String> {
        self.node_name.read().clone()
    }

    pub(crate) fn set_node_name(&self, name: String) {
        *self.node_name.write() = Some(name);
    }

    pub(crate) fn stored_error(&self) -> Option<SubscriptionError> {
        self.stored_error.lock().clone()
    }

    /// Records the error that ended the subscription and its status.
    pub(crate) fn terminate(&self, error: &SubscriptionError) {
        let mut stored = self.stored_error.lock();
        if stored.is_none() {
            *stored = Some(error.clone());
            self.status.set(error.terminal_status());
        }
    }

    pub(crate) fn set_status(&self, status: SubscriptionStatus) {
        self.status.set(status);
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flags shutdown and closes the current channel so a blocked read
    /// returns. Returns false if shutdown was already requested.
    pub(crate) fn request_shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        true
    }

    /// Publishes the channel of a new connection attempt. Closes it at once
    /// if shutdown raced with the connect.
    pub(crate) fn attach_channel(&self, channel: Arc<dyn FeederChannel>) -> bool {
        let mut slot = self.channel.lock();
        if self.is_shutting_down() {
            channel.close();
            return false;
        }
        *slot = Some(channel);
        true
    }

    pub(crate) fn detach_channel(&self) {
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
    }

    pub(crate) fn attach_writer(&self, tokens: Sender<OutputToken>) {
        *self.writer.write() = Some(tokens);
    }

    pub(crate) fn detach_writer(&self) {
        self.writer.write().take();
    }

    /// Wakes the current writer without blocking. A full queue already
    /// holds a pending wakeup, and the writer also flushes on its own poll.
    pub(crate) fn signal_writer(&self, token: OutputToken) {
        if let Some(tokens) = self.writer.read().as_ref() {
            let _ = tokens.try_send(token);
        }
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    /// Returns false if interrupted.
    pub(crate) fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = self.config.poll_interval;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// Joins a worker thread, giving up after `timeout`.
///
/// Returns false if the thread was still running and has been detached.
pub(crate) fn join_within(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    if handle.thread().id() == thread::current().id() {
        return false;
    }
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, ?timeout, "thread did not stop in time, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!(thread = name, "thread panicked");
    }
    true
}
