//! Dispatcher thread.
//!
//! Decouples consumer callbacks from the network reader. The coordinator
//! pushes items into a bounded FIFO queue; the dispatcher is its only
//! consumer, so callbacks observe entries in exactly the order the feeder
//! sent them.

use crate::callback::{StreamDelete, StreamPut, SubscriptionCallback};
use crate::context::{join_within, SubscriptionContext};
use crate::error::{SubscriptionError, SubscriptionResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use kvstream_protocol::{Entry, LogRecord, Vlsn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, trace};

/// An item on the dispatcher's input queue.
#[derive(Debug, Clone)]
pub(crate) enum InputItem {
    /// A streamed log entry.
    Data(Entry),
    /// An error to report to the callback. Dispatch continues.
    Exception(SubscriptionError),
    /// A terminal error to report to the callback. Dispatch ends.
    Shutdown(SubscriptionError),
}

#[derive(Debug, Default)]
struct DispatcherShared {
    stop: AtomicBool,
    failure: Mutex<Option<SubscriptionError>>,
}

/// Handle the coordinator keeps for the dispatcher of one connection.
pub(crate) struct DispatcherHandle {
    items: Sender<InputItem>,
    shared: Arc<DispatcherShared>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub(crate) fn spawn(ctx: Arc<SubscriptionContext>) -> SubscriptionResult<Self> {
        let (items, queue) = bounded(ctx.config.input_queue_capacity);
        let shared = Arc::new(DispatcherShared::default());
        let node = ctx.node_name().unwrap_or_default();

        let worker = Dispatcher {
            ctx,
            queue,
            shared: shared.clone(),
        };
        let thread = thread::Builder::new()
            .name("kvstream-dispatcher".into())
            .spawn(move || {
                let span = info_span!("dispatcher", node = %node);
                let _guard = span.enter();
                worker.run();
            })
            .map_err(|e| SubscriptionError::Internal(format!("failed to spawn dispatcher: {e}")))?;

        Ok(Self {
            items,
            shared,
            thread: Some(thread),
        })
    }

    /// The error that stopped the dispatcher, if any.
    pub(crate) fn failure(&self) -> Option<SubscriptionError> {
        self.shared.failure.lock().clone()
    }

    /// Number of queued items.
    pub(crate) fn pending(&self) -> usize {
        self.items.len()
    }

    /// Queues an item. While the queue is full, every wait of one offer
    /// timeout counts as an overflow retry. Nothing is dropped; the call
    /// only gives up on shutdown or when the dispatcher has exited.
    pub(crate) fn offer(&self, ctx: &SubscriptionContext, item: InputItem) -> SubscriptionResult<()> {
        let mut item = item;
        loop {
            match self.items.send_timeout(item, ctx.config.offer_timeout) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    ctx.stats.record_queue_overflow();
                    if ctx.is_shutting_down() {
                        return Err(SubscriptionError::ShuttingDown);
                    }
                    if let Some(err) = self.failure() {
                        return Err(err);
                    }
                    trace!("dispatcher queue full, retrying");
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(self.failure().unwrap_or_else(|| {
                        SubscriptionError::Internal("dispatcher thread exited".into())
                    }));
                }
            }
        }
    }

    /// Queues an item if room frees up within `timeout`.
    pub(crate) fn offer_within(&self, item: InputItem, timeout: Duration) -> bool {
        self.items.send_timeout(item, timeout).is_ok()
    }

    /// Stops dispatch at once. Queued items are discarded.
    pub(crate) fn stop(mut self, ctx: &SubscriptionContext) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            join_within(thread, ctx.config.shutdown_timeout, "dispatcher");
        }
    }

    /// Lets the dispatcher deliver everything already queued, then stops
    /// it. Waits without a bound unless `bounded_wait` is set, but always gives
    /// up on shutdown.
    pub(crate) fn drain(mut self, ctx: &SubscriptionContext, bounded_wait: bool) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let DispatcherHandle { items, shared, .. } = self;
        drop(items);

        let started = Instant::now();
        while !thread.is_finished() {
            let timed_out = bounded_wait && started.elapsed() >= ctx.config.shutdown_timeout;
            if ctx.is_shutting_down() || timed_out {
                shared.stop.store(true, Ordering::Release);
                join_within(thread, ctx.config.shutdown_timeout, "dispatcher");
                return;
            }
            thread::sleep(ctx.config.poll_interval.min(Duration::from_millis(10)));
        }
        join_within(thread, ctx.config.shutdown_timeout, "dispatcher");
    }
}

struct Dispatcher {
    ctx: Arc<SubscriptionContext>,
    queue: Receiver<InputItem>,
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    fn run(self) {
        debug!("dispatcher started");
        let poll = self.ctx.config.poll_interval;
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                debug!(discarded = self.queue.len(), "dispatcher stopped");
                return;
            }
            let item = match self.queue.recv_timeout(poll) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let callback = self.ctx.callback.as_ref();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(callback, item)));
            match outcome {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Exit)) => break,
                Ok(Err(err)) => {
                    self.fail(err);
                    return;
                }
                Err(_) => {
                    self.fail(SubscriptionError::Internal("subscription callback panicked".into()));
                    return;
                }
            }
        }
        debug!("dispatcher finished");
    }

    fn fail(&self, err: SubscriptionError) {
        error!(error = %err, "dispatcher failed");
        *self.shared.failure.lock() = Some(err);
    }

    fn dispatch(
        &self,
        callback: &dyn SubscriptionCallback,
        item: InputItem,
    ) -> SubscriptionResult<Flow> {
        match item {
            InputItem::Data(entry) => {
                let record = entry.record()?;
                self.deliver(callback, entry.vlsn, record);
                Ok(Flow::Continue)
            }
            InputItem::Exception(err) => {
                callback.process_exception(&err);
                Ok(Flow::Continue)
            }
            InputItem::Shutdown(err) => {
                callback.process_exception(&err);
                Ok(Flow::Exit)
            }
        }
    }

    fn deliver(&self, callback: &dyn SubscriptionCallback, vlsn: Vlsn, record: LogRecord) {
        let stats = &self.ctx.stats;
        let keep_image = self.ctx.config.include_before_image;

        match record {
            LogRecord::Commit { txn_id, timestamp_ms } => {
                callback.process_commit(vlsn, txn_id, timestamp_ms);
                stats.record_commit();
            }
            LogRecord::Abort { txn_id, timestamp_ms } => {
                callback.process_abort(vlsn, txn_id, timestamp_ms);
                stats.record_abort();
            }
            LogRecord::Put {
                key,
                value,
                txn_id,
                db_id,
                modification_time_ms,
                tombstone: true,
                before_image,
                ..
            } => {
                callback.process_del(StreamDelete {
                    vlsn,
                    key,
                    tombstone: Some(value),
                    txn_id,
                    db_id,
                    modification_time_ms,
                    before_image: before_image.filter(|_| keep_image),
                });
                stats.record_delete();
            }
            LogRecord::Put {
                key,
                value,
                txn_id,
                db_id,
                modification_time_ms,
                expiration_time_ms,
                before_image,
                ..
            } => {
                callback.process_put(StreamPut {
                    vlsn,
                    key,
                    value,
                    txn_id,
                    db_id,
                    modification_time_ms,
                    expiration_time_ms,
                    before_image: before_image.filter(|_| keep_image),
                });
                stats.record_put();
            }
            LogRecord::Delete {
                key,
                txn_id,
                db_id,
                modification_time_ms,
                before_image,
            } => {
                callback.process_del(StreamDelete {
                    vlsn,
                    key,
                    tombstone: None,
                    txn_id,
                    db_id,
                    modification_time_ms,
                    before_image: before_image.filter(|_| keep_image),
                });
                stats.record_delete();
            }
        }
    }
}

enum Flow {
    Continue,
    Exit,
}
