//! Writer thread.
//!
//! Serializes all outbound control traffic so the coordinator's read loop
//! never blocks on a write. The coordinator feeds it tokens; each token
//! names what to write, and the message content is read from shared state
//! at write time.

use crate::channel::FeederChannel;
use crate::context::{join_within, SubscriptionContext};
use crate::error::{SubscriptionError, SubscriptionResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use kvstream_protocol::ClientMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info_span, trace, warn};

/// Work item for the writer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputToken {
    /// Acknowledge a heartbeat with the current high-water VLSN.
    HeartbeatAck {
        /// Heartbeat being acknowledged.
        heartbeat_id: u64,
    },
    /// Present a renewed token, if one is available.
    ReAuth,
    /// Flush every queued filter change.
    FilterChange,
}

#[derive(Debug, Default)]
struct WriterShared {
    stop: AtomicBool,
    failure: Mutex<Option<SubscriptionError>>,
}

/// Handle the coordinator keeps for the writer of one connection.
pub(crate) struct WriterHandle {
    tokens: Sender<OutputToken>,
    shared: Arc<WriterShared>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    pub(crate) fn spawn(
        ctx: Arc<SubscriptionContext>,
        channel: Arc<dyn FeederChannel>,
    ) -> SubscriptionResult<Self> {
        let (tokens, queue) = bounded(ctx.config.output_queue_capacity);
        let shared = Arc::new(WriterShared::default());
        let node = ctx.node_name().unwrap_or_default();

        let worker = Writer {
            ctx,
            channel,
            queue,
            shared: shared.clone(),
        };
        let thread = thread::Builder::new()
            .name("kvstream-writer".into())
            .spawn(move || {
                let span = info_span!("writer", node = %node);
                let _guard = span.enter();
                worker.run();
            })
            .map_err(|e| SubscriptionError::Internal(format!("failed to spawn writer: {e}")))?;

        Ok(Self {
            tokens,
            shared,
            thread: Some(thread),
        })
    }

    /// A sender the façade can use to wake the writer.
    pub(crate) fn sender(&self) -> Sender<OutputToken> {
        self.tokens.clone()
    }

    /// The error that stopped the writer, if any.
    pub(crate) fn failure(&self) -> Option<SubscriptionError> {
        self.shared.failure.lock().clone()
    }

    /// Queues a token, waiting for room in bounded steps.
    pub(crate) fn offer(&self, ctx: &SubscriptionContext, token: OutputToken) -> SubscriptionResult<()> {
        let mut token = token;
        loop {
            match self.tokens.send_timeout(token, ctx.config.offer_timeout) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    if ctx.is_shutting_down() {
                        return Err(SubscriptionError::ShuttingDown);
                    }
                    if let Some(err) = self.failure() {
                        return Err(err);
                    }
                    trace!("writer queue full, retrying");
                    token = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(self.failure().unwrap_or_else(|| {
                        SubscriptionError::Internal("writer thread exited".into())
                    }));
                }
            }
        }
    }

    /// Stops the writer and waits up to `timeout` for it to exit.
    pub(crate) fn stop(mut self, ctx: &SubscriptionContext) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            join_within(thread, ctx.config.shutdown_timeout, "writer");
        }
    }
}

struct Writer {
    ctx: Arc<SubscriptionContext>,
    channel: Arc<dyn FeederChannel>,
    queue: Receiver<OutputToken>,
    shared: Arc<WriterShared>,
}

impl Writer {
    fn run(self) {
        debug!("writer started");
        let poll = self.ctx.config.poll_interval;
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            let result = match self.queue.recv_timeout(poll) {
                Ok(token) => self.handle(&token),
                Err(RecvTimeoutError::Timeout) if self.ctx.filter_changes.has_outbound() => {
                    self.flush_filter_changes()
                }
                Err(RecvTimeoutError::Timeout) => Ok(()),
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if let Err(err) = result {
                if !self.shared.stop.load(Ordering::Acquire) {
                    warn!(error = %err, "writer failed");
                    *self.shared.failure.lock() = Some(err);
                }
                break;
            }
        }
        debug!("writer stopped");
    }

    fn handle(&self, token: &OutputToken) -> SubscriptionResult<()> {
        self.ctx.config.faults.before_write(token)?;
        match token {
            OutputToken::HeartbeatAck { heartbeat_id } => {
                let high_vlsn = self.ctx.stats.high_vlsn();
                self.send(&ClientMessage::HeartbeatResponse {
                    heartbeat_id: *heartbeat_id,
                    high_vlsn,
                })?;
                self.ctx.stats.record_heartbeat_sent();
                trace!(heartbeat_id, %high_vlsn, "heartbeat acknowledged");
                Ok(())
            }
            OutputToken::ReAuth => match self.ctx.config.auth.renewed_token() {
                Some(token) => {
                    self.send(&ClientMessage::ReAuthenticate { token })?;
                    debug!("renewed token presented");
                    Ok(())
                }
                None => Ok(()),
            },
            OutputToken::FilterChange => self.flush_filter_changes(),
        }
    }

    fn flush_filter_changes(&self) -> SubscriptionResult<()> {
        for change in self.ctx.filter_changes.drain_outbound() {
            debug!(request_id = %change.request_id, "sending filter change");
            self.send(&ClientMessage::FilterChangeRequest(change))?;
        }
        Ok(())
    }

    fn send(&self, message: &ClientMessage) -> SubscriptionResult<()> {
        self.channel.send(message)?;
        self.ctx.stats.record_sent();
        Ok(())
    }
}
