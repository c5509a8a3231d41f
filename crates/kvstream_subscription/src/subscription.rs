//! Public subscription handle.

use crate::callback::SubscriptionCallback;
use crate::config::SubscriptionConfig;
use crate::context::{join_within, SubscriptionContext};
use crate::coordinator::Coordinator;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::filter_change::FilterChangeOutcome;
use crate::stats::StatsSnapshot;
use crate::status::SubscriptionStatus;
use crate::writer::OutputToken;
use crossbeam_channel::{bounded, RecvTimeoutError};
use kvstream_protocol::{FilterChange, Vlsn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// A subscription to a feeder's replication stream.
///
/// Statistics and status live as long as the handle and stay readable
/// before `start` and after `shutdown`.
///
/// # Example
///
/// ```rust,ignore
/// let config = SubscriptionConfig::new(FeederAddress::new("feeder.local", 5001))
///     .with_filter(StreamFilter::tables(["orders"]));
/// let subscription = Subscription::new(config, Arc::new(MyCallback))?;
/// subscription.start(Vlsn::FIRST)?;
/// // ...
/// subscription.shutdown();
/// ```
pub struct Subscription {
    ctx: Arc<SubscriptionContext>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    allocated_name: Mutex<Option<String>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Subscription {
    /// Creates a subscription. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: SubscriptionConfig,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> SubscriptionResult<Self> {
        config.validate()?;
        Ok(Self {
            ctx: Arc::new(SubscriptionContext::new(config, callback)),
            coordinator: Mutex::new(None),
            allocated_name: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Connects and starts streaming from `from_vlsn`.
    ///
    /// Blocks until the first connection attempt either streams or fails
    /// for good, or until the configured start timeout. On failure the
    /// subscription is shut down and the terminal error returned. Errors
    /// after a successful start are reported through [`status`](Self::status),
    /// [`stored_error`](Self::stored_error) and the callback.
    pub fn start(&self, from_vlsn: Vlsn) -> SubscriptionResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SubscriptionError::IllegalState(
                "subscription has been shut down".into(),
            ));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SubscriptionError::IllegalState(
                "subscription already started".into(),
            ));
        }

        let node_name = match self.ctx.node_name() {
            Some(name) => name,
            None => {
                let name = self.ctx.config.node_ids.allocate();
                debug!(node = %name, "allocated node name");
                *self.allocated_name.lock() = Some(name.clone());
                self.ctx.set_node_name(name.clone());
                name
            }
        };

        let (started_tx, started_rx) = bounded(1);
        let handle = match Coordinator::spawn(self.ctx.clone(), from_vlsn, node_name, started_tx) {
            Ok(handle) => handle,
            Err(err) => {
                self.ctx.terminate(&err);
                self.shutdown();
                return Err(err);
            }
        };
        *self.coordinator.lock() = Some(handle);

        let timeout = self.ctx.config.start_timeout;
        let outcome = match started_rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(SubscriptionError::timeout(
                format!("subscription did not start within {timeout:?}"),
                Duration::ZERO,
            )),
            Err(RecvTimeoutError::Disconnected) => Err(self.ctx.stored_error().unwrap_or_else(
                || SubscriptionError::Internal("coordinator exited without an outcome".into()),
            )),
        };

        match outcome {
            Ok(()) => {
                info!(from = %from_vlsn, "subscription started");
                Ok(())
            }
            Err(err) => {
                self.ctx.terminate(&err);
                self.shutdown();
                Err(err)
            }
        }
    }

    /// Stops streaming and releases the connection.
    ///
    /// Safe to call from any thread and any number of times; only the
    /// first call does anything. Waits at most the configured shutdown
    /// timeout for the coordinator.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down subscription");
        self.ctx.request_shutdown();

        if let Some(handle) = self.coordinator.lock().take() {
            join_within(handle, self.ctx.config.shutdown_timeout, "coordinator");
        }
        if let Some(name) = self.allocated_name.lock().take() {
            self.ctx.config.node_ids.release(&name);
        }
        self.ctx.set_streaming(false);
        info!("subscription shut down");
    }

    /// Requests a change to the live stream's filter.
    ///
    /// `handler` runs exactly once with the feeder's answer, or with an
    /// error if the subscription ends first. Fails with `InvalidArgument`
    /// if a change with the same request ID is still pending, and with
    /// `IllegalState` if the subscription is not streaming.
    pub fn change_filter<F>(&self, change: FilterChange, handler: F) -> SubscriptionResult<()>
    where
        F: FnOnce(Result<FilterChangeOutcome, SubscriptionError>) + Send + 'static,
    {
        if !self.ctx.is_streaming() || self.shut_down.load(Ordering::Acquire) {
            return Err(SubscriptionError::IllegalState(
                "filter changes require a streaming subscription".into(),
            ));
        }
        let request_id = change.request_id.clone();
        self.ctx.filter_changes.submit(change, Box::new(handler))?;
        self.ctx.signal_writer(OutputToken::FilterChange);
        debug!(%request_id, "filter change queued");
        Ok(())
    }

    /// Outcome of the most recent connection attempt.
    pub fn status(&self) -> SubscriptionStatus {
        self.ctx.status.get()
    }

    /// Copy of the statistics.
    pub fn statistics(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// The error that terminated the subscription, if any.
    pub fn stored_error(&self) -> Option<SubscriptionError> {
        self.ctx.stored_error()
    }

    /// Node name in use, once configured or allocated.
    pub fn node_name(&self) -> Option<String> {
        self.ctx.node_name()
    }

    /// Returns true while a connection is streaming.
    ///
    /// The flag clears when the coordinator notices the connection ended.
    /// While it is blocked handing an entry to a full dispatcher queue
    /// (a stalled callback), it notices only once room frees up or
    /// shutdown is requested, so the flag can stay true after the
    /// feeder has already dropped the connection.
    pub fn is_streaming(&self) -> bool {
        self.ctx.is_streaming()
    }

    /// The local mirror of the stream filter.
    pub fn filter(&self) -> kvstream_protocol::StreamFilter {
        self.ctx.filter.lock().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}
