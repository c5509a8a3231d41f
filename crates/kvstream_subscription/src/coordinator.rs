//! Coordinator thread.
//!
//! Owns the feeder channel and drives each connection attempt through
//!
//! ```text
//! CONNECTING -> HANDSHAKING -> SYNCING_UP -> STREAMING -> DISCONNECTED
//!      ^                                                      |
//!      +--------------------- retry --------------------------+
//! ```
//!
//! until shutdown or a terminal error. Retryable errors (connection,
//! timeout) consume the retry budget; every other error ends the
//! subscription at once. The budget is refilled each time an attempt
//! reaches the streaming state.

use crate::channel::{FeederChannel, Received};
use crate::context::SubscriptionContext;
use crate::dispatcher::{DispatcherHandle, InputItem};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::filter_change::FilterChangeOutcome;
use crate::handshake::Handshake;
use crate::status::SubscriptionStatus;
use crate::writer::{OutputToken, WriterHandle};
use crossbeam_channel::Sender;
use kvstream_protocol::{
    FeederMessage, FilterChangeResponse, FilterChangeStatus, StreamMode, SyncupRequest, Vlsn,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

pub(crate) struct Coordinator {
    ctx: Arc<SubscriptionContext>,
    requested_vlsn: Vlsn,
    node_name: String,
    started: Option<Sender<SubscriptionResult<()>>>,
}

impl Coordinator {
    /// Starts the coordinator thread. The first connection outcome is sent
    /// on `started`: `Ok` once streaming, or the terminal error.
    pub(crate) fn spawn(
        ctx: Arc<SubscriptionContext>,
        requested_vlsn: Vlsn,
        node_name: String,
        started: Sender<SubscriptionResult<()>>,
    ) -> SubscriptionResult<JoinHandle<()>> {
        let coordinator = Coordinator {
            ctx,
            requested_vlsn,
            node_name,
            started: Some(started),
        };
        let node = coordinator.node_name.clone();
        thread::Builder::new()
            .name("kvstream-coordinator".into())
            .spawn(move || {
                let span = info_span!("subscription", node = %node);
                let _guard = span.enter();
                coordinator.run();
            })
            .map_err(|e| SubscriptionError::Internal(format!("failed to spawn coordinator: {e}")))
    }

    fn run(mut self) {
        info!(requested = %self.requested_vlsn, feeder = %self.ctx.config.feeder, "subscription starting");
        let result = self.run_attempts();
        self.ctx.set_streaming(false);

        let reason = match result {
            Ok(()) | Err(SubscriptionError::ShuttingDown) => {
                info!("subscription stopped");
                SubscriptionError::ShuttingDown
            }
            Err(err) => {
                error!(error = %err, status = %err.terminal_status(), "subscription terminated");
                self.ctx.terminate(&err);
                err
            }
        };
        self.notify_started(Err(reason.clone()));
        self.ctx.filter_changes.fail_all(&reason);
    }

    fn notify_started(&mut self, outcome: SubscriptionResult<()>) {
        if let Some(started) = self.started.take() {
            let _ = started.send(outcome);
        }
    }

    fn run_attempts(&mut self) -> SubscriptionResult<()> {
        let retry = self.ctx.config.retry.clone();
        let mut retries = 0u32;
        let mut attempt = 0u64;

        loop {
            if self.ctx.is_shutting_down() {
                return Ok(());
            }

            let mut reached_streaming = false;
            let err = match self.run_connection(attempt, &mut reached_streaming) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            attempt += 1;
            if reached_streaming {
                retries = 0;
            }

            if !err.is_retryable() || self.ctx.is_shutting_down() {
                return Err(err);
            }
            if retries >= retry.max_retries {
                warn!(retries, error = %err, "retry budget exhausted");
                return Err(err);
            }
            retries += 1;

            let sleep = retry
                .delay_for_attempt(retries)
                .max(err.retry_after().unwrap_or_default());
            warn!(error = %err, retry = retries, max_retries = retry.max_retries, ?sleep, "connection lost, retrying");
            if !self.ctx.sleep_unless_shutdown(sleep) {
                return Ok(());
            }
        }
    }

    /// One connection attempt. `Ok` means shutdown was requested.
    fn run_connection(&mut self, attempt: u64, reached_streaming: &mut bool) -> SubscriptionResult<()> {
        let config = &self.ctx.config;
        debug!(attempt, feeder = %config.feeder, "connecting");
        let channel = config
            .connector
            .connect(&config.feeder, &config.connect)
            .map_err(|e| SubscriptionError::from_io(&e, Duration::ZERO))?;

        if !self.ctx.attach_channel(channel.clone()) {
            return Ok(());
        }
        let result = self.stream_on(&channel, attempt, reached_streaming);
        self.ctx.detach_channel();
        channel.close();

        match result {
            Err(_) if self.ctx.is_shutting_down() => Ok(()),
            other => other,
        }
    }

    fn stream_on(
        &mut self,
        channel: &Arc<dyn FeederChannel>,
        attempt: u64,
        reached_streaming: &mut bool,
    ) -> SubscriptionResult<()> {
        let handshake = Handshake::new(channel.as_ref(), &self.ctx);
        handshake.request_service(&self.node_name)?;
        let version = handshake.negotiate_version()?;

        // The first attempt honors the configured mode; every later one
        // resumes after what was already handed to the dispatcher.
        let (start_vlsn, mode) = if attempt == 0 {
            (self.requested_vlsn, self.ctx.config.stream_mode)
        } else {
            (
                self.requested_vlsn.max(self.ctx.stats.high_vlsn()),
                StreamMode::Resume,
            )
        };
        let filter = self.ctx.filter.lock().clone();
        let outcome = handshake.syncup(SyncupRequest {
            start_vlsn,
            mode,
            filter,
        })?;

        let stats = &self.ctx.stats;
        stats.record_syncup(outcome.start_vlsn, outcome.partition_generation);
        stats.record_heartbeat(&outcome.heartbeat);
        if attempt > 0 {
            stats.record_reconnect();
        }

        let resent = self.ctx.filter_changes.requeue_pending();
        let dispatcher = DispatcherHandle::spawn(self.ctx.clone())?;
        let writer = match WriterHandle::spawn(self.ctx.clone(), channel.clone()) {
            Ok(writer) => writer,
            Err(err) => {
                dispatcher.stop(&self.ctx);
                return Err(err);
            }
        };

        self.ctx.attach_writer(writer.sender());
        *reached_streaming = true;
        self.ctx.set_status(SubscriptionStatus::Success);
        self.ctx.set_streaming(true);
        self.notify_started(Ok(()));
        info!(
            attempt,
            version,
            start = %outcome.start_vlsn,
            ?mode,
            resent_filter_changes = resent,
            "streaming"
        );

        let mut result = writer.offer(
            &self.ctx,
            OutputToken::HeartbeatAck {
                heartbeat_id: outcome.heartbeat.heartbeat_id,
            },
        );
        if result.is_ok() && resent > 0 {
            result = writer.offer(&self.ctx, OutputToken::FilterChange);
        }
        if result.is_ok() {
            result = self.read_loop(channel.as_ref(), &writer, &dispatcher);
        }

        self.ctx.set_streaming(false);
        self.ctx.detach_writer();
        self.teardown(writer, dispatcher, &result);
        result
    }

    fn read_loop(
        &self,
        channel: &dyn FeederChannel,
        writer: &WriterHandle,
        dispatcher: &DispatcherHandle,
    ) -> SubscriptionResult<()> {
        let config = &self.ctx.config;
        let mut last_message = Instant::now();
        let mut last_reauth = Instant::now();

        loop {
            if self.ctx.is_shutting_down() {
                return Ok(());
            }
            if let Some(err) = writer.failure() {
                return Err(err);
            }
            if let Some(err) = dispatcher.failure() {
                return Err(err);
            }
            if let Some(interval) = config.reauth_interval {
                if last_reauth.elapsed() >= interval {
                    last_reauth = Instant::now();
                    writer.offer(&self.ctx, OutputToken::ReAuth)?;
                }
            }

            match channel.receive(config.poll_interval)? {
                Received::Message(message) => {
                    last_message = Instant::now();
                    self.ctx.stats.record_received();
                    self.handle_message(message, writer, dispatcher)?;
                }
                Received::Idle => {
                    if last_message.elapsed() >= config.idle_timeout {
                        channel.close();
                        return Err(SubscriptionError::timeout(
                            format!("no message from feeder within {:?}", config.idle_timeout),
                            Duration::ZERO,
                        ));
                    }
                }
                Received::EndOfStream => {
                    if self.ctx.is_shutting_down() {
                        return Ok(());
                    }
                    return Err(SubscriptionError::connection(
                        "feeder closed the stream",
                        Duration::ZERO,
                    ));
                }
            }
        }
    }

    fn handle_message(
        &self,
        message: FeederMessage,
        writer: &WriterHandle,
        dispatcher: &DispatcherHandle,
    ) -> SubscriptionResult<()> {
        match message {
            FeederMessage::Heartbeat(heartbeat) => {
                trace!(id = heartbeat.heartbeat_id, "heartbeat");
                self.ctx.stats.record_heartbeat(&heartbeat);
                writer.offer(
                    &self.ctx,
                    OutputToken::HeartbeatAck {
                        heartbeat_id: heartbeat.heartbeat_id,
                    },
                )
            }
            FeederMessage::Entry(entry) => {
                let vlsn = entry.vlsn;
                if vlsn <= self.ctx.stats.high_vlsn() {
                    trace!(%vlsn, "skipping entry already delivered");
                    return Ok(());
                }
                dispatcher.offer(&self.ctx, InputItem::Data(entry))?;
                self.ctx.stats.advance_high_vlsn(vlsn);
                self.ctx.stats.record_pending_input(dispatcher.pending());
                Ok(())
            }
            FeederMessage::FilterChangeResponse(response) => self.handle_filter_response(response),
            FeederMessage::SecurityFailure { reason } => Err(SubscriptionError::Security(reason)),
            FeederMessage::ShutdownRequest { shutdown_time_ms } => {
                let err = SubscriptionError::GroupShutdown { shutdown_time_ms };
                info!(shutdown_time_ms, "feeder requested group shutdown");
                dispatcher.offer(&self.ctx, InputItem::Shutdown(err.clone()))?;
                Err(err)
            }
            other => Err(SubscriptionError::Protocol(format!(
                "unexpected {} while streaming",
                other.kind()
            ))),
        }
    }

    fn handle_filter_response(&self, response: FilterChangeResponse) -> SubscriptionResult<()> {
        let request_id = response.request_id.clone();
        let Some((change, handler)) = self.ctx.filter_changes.resolve(&request_id) else {
            return Err(SubscriptionError::Internal(format!(
                "filter change response {request_id} has no registered handler"
            )));
        };

        let fail = |reason: String| SubscriptionError::FilterChange {
            request_id: request_id.clone(),
            reason,
        };
        let outcome = |status: FilterChangeStatus| FilterChangeOutcome {
            request_id: request_id.clone(),
            status,
            effective_vlsn: response.effective_vlsn,
            reason: response.reason.clone(),
        };

        match response.status() {
            Some(FilterChangeStatus::Ok) => {
                let applied = self
                    .ctx
                    .config
                    .faults
                    .before_filter_apply(&request_id)
                    .and_then(|()| {
                        self.ctx
                            .filter
                            .lock()
                            .apply(&change)
                            .map_err(SubscriptionError::from)
                    });
                match applied {
                    Ok(()) => {
                        info!(%request_id, vlsn = %response.effective_vlsn, "filter change applied");
                        handler(Ok(outcome(FilterChangeStatus::Ok)));
                        Ok(())
                    }
                    Err(err) => {
                        let err = fail(format!("local filter rejected an accepted change: {err}"));
                        handler(Err(err.clone()));
                        Err(err)
                    }
                }
            }
            Some(FilterChangeStatus::NotApplicable) => {
                warn!(%request_id, reason = ?response.reason, "filter change not applicable");
                handler(Ok(outcome(FilterChangeStatus::NotApplicable)));
                Ok(())
            }
            Some(FilterChangeStatus::Fail) => {
                let err = fail(
                    response
                        .reason
                        .clone()
                        .unwrap_or_else(|| "feeder failed to apply the change".into()),
                );
                handler(Err(err.clone()));
                Err(err)
            }
            None => {
                let err = SubscriptionError::Protocol(format!(
                    "filter change {request_id} answered with unknown status code {}",
                    response.status_code
                ));
                handler(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Stops the writer and dispatcher of a finished connection.
    ///
    /// On a retryable error the dispatcher first delivers everything
    /// already queued, so resuming after the high-water mark loses nothing.
    /// A terminal error is reported to the callback before dispatch ends.
    fn teardown(
        &self,
        writer: WriterHandle,
        dispatcher: DispatcherHandle,
        result: &SubscriptionResult<()>,
    ) {
        writer.stop(&self.ctx);

        match result {
            _ if self.ctx.is_shutting_down() => dispatcher.stop(&self.ctx),
            Ok(()) | Err(SubscriptionError::ShuttingDown) => dispatcher.stop(&self.ctx),
            Err(SubscriptionError::GroupShutdown { .. }) => dispatcher.drain(&self.ctx, true),
            Err(err) if err.is_retryable() => {
                let _ = dispatcher.offer(&self.ctx, InputItem::Exception(err.clone()));
                dispatcher.drain(&self.ctx, false);
            }
            Err(err) if dispatcher.failure().is_none() => {
                let timeout = self.ctx.config.shutdown_timeout;
                if dispatcher.offer_within(InputItem::Shutdown(err.clone()), timeout) {
                    dispatcher.drain(&self.ctx, true);
                } else {
                    dispatcher.stop(&self.ctx);
                }
            }
            Err(_) => dispatcher.stop(&self.ctx),
        }
        debug!(
            pending_filter_changes = self.ctx.filter_changes.pending_count(),
            "connection torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, Event, ScriptedChannel};
    use kvstream_protocol::{Entry, FilterChange, LogRecord, StreamFilter};
    use parking_lot::Mutex;

    type Outcomes = Arc<Mutex<Vec<Result<FilterChangeOutcome, SubscriptionError>>>>;

    fn coordinator(ctx: &Arc<SubscriptionContext>) -> Coordinator {
        Coordinator {
            ctx: ctx.clone(),
            requested_vlsn: Vlsn::FIRST,
            node_name: "test-node".into(),
            started: None,
        }
    }

    fn submit(ctx: &SubscriptionContext, change: FilterChange) -> Outcomes {
        let outcomes: Outcomes = Arc::default();
        let sink = outcomes.clone();
        ctx.filter_changes
            .submit(change, Box::new(move |r| sink.lock().push(r)))
            .unwrap();
        outcomes
    }

    fn workers(ctx: &Arc<SubscriptionContext>) -> (WriterHandle, DispatcherHandle) {
        let channel: Arc<dyn FeederChannel> = Arc::new(ScriptedChannel::new(Vec::new()));
        let writer = WriterHandle::spawn(ctx.clone(), channel).unwrap();
        let dispatcher = DispatcherHandle::spawn(ctx.clone()).unwrap();
        (writer, dispatcher)
    }

    fn put(vlsn: u64) -> InputItem {
        let record = LogRecord::put(b"k".to_vec(), b"v".to_vec(), 1, 1, 0);
        InputItem::Data(Entry::new(Vlsn::new(vlsn), &record).unwrap())
    }

    fn exceptions(events: &Mutex<Vec<Event>>) -> Vec<SubscriptionError> {
        events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Exception(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn accepted_filter_change_is_mirrored() {
        let (ctx, _) = context(|c| c.with_filter(StreamFilter::tables(["orders"])));
        let outcomes = submit(&ctx, FilterChange::add_table("r1", "users"));

        let response = FilterChangeResponse::new("r1", FilterChangeStatus::Ok, Vlsn::new(9));
        coordinator(&ctx).handle_filter_response(response).unwrap();

        assert_eq!(*ctx.filter.lock(), StreamFilter::tables(["orders", "users"]));
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        let outcome = outcomes[0].as_ref().unwrap();
        assert_eq!(outcome.status, FilterChangeStatus::Ok);
        assert_eq!(outcome.effective_vlsn, Vlsn::new(9));
        assert_eq!(ctx.filter_changes.pending_count(), 0);
    }

    #[test]
    fn not_applicable_leaves_filter_alone() {
        let (ctx, _) = context(|c| c.with_filter(StreamFilter::tables(["orders"])));
        let outcomes = submit(&ctx, FilterChange::remove_table("r1", "users"));

        let response = FilterChangeResponse::new("r1", FilterChangeStatus::NotApplicable, Vlsn::new(3))
            .with_reason("not filtered");
        coordinator(&ctx).handle_filter_response(response).unwrap();

        assert_eq!(*ctx.filter.lock(), StreamFilter::tables(["orders"]));
        let outcome = outcomes.lock()[0].clone().unwrap();
        assert_eq!(outcome.status, FilterChangeStatus::NotApplicable);
        assert_eq!(outcome.reason.as_deref(), Some("not filtered"));
    }

    #[test]
    fn failed_filter_change_is_terminal() {
        let (ctx, _) = context(|c| c.with_filter(StreamFilter::tables(["orders"])));
        let outcomes = submit(&ctx, FilterChange::add_table("r1", "ghosts"));

        let response =
            FilterChangeResponse::new("r1", FilterChangeStatus::Fail, Vlsn::NULL).with_reason("nope");
        let err = coordinator(&ctx).handle_filter_response(response).unwrap_err();

        let expected = SubscriptionError::FilterChange {
            request_id: "r1".into(),
            reason: "nope".into(),
        };
        assert_eq!(err, expected);
        assert_eq!(outcomes.lock()[0], Err(expected));
        assert_eq!(*ctx.filter.lock(), StreamFilter::tables(["orders"]));
    }

    #[test]
    fn unknown_status_code_fails_handler_and_stream() {
        let (ctx, _) = context(|c| c.with_filter(StreamFilter::tables(["orders"])));
        let outcomes = submit(&ctx, FilterChange::add_table("r1", "users"));

        let mut response = FilterChangeResponse::new("r1", FilterChangeStatus::Ok, Vlsn::NULL);
        response.status_code = 200;
        let err = coordinator(&ctx).handle_filter_response(response).unwrap_err();

        assert!(matches!(err, SubscriptionError::Protocol(_)));
        assert_eq!(err.terminal_status(), SubscriptionStatus::UnknownError);
        assert!(matches!(outcomes.lock()[0], Err(SubscriptionError::Protocol(_))));
    }

    #[test]
    fn response_without_handler_is_internal_error() {
        let (ctx, _) = context(|c| c);
        let response = FilterChangeResponse::new("ghost", FilterChangeStatus::Ok, Vlsn::NULL);
        let err = coordinator(&ctx).handle_filter_response(response).unwrap_err();
        assert!(matches!(err, SubscriptionError::Internal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_teardown_delivers_queue_then_reports() {
        let (ctx, events) = context(|c| c);
        let (writer, dispatcher) = workers(&ctx);
        dispatcher.offer(&ctx, put(1)).unwrap();
        dispatcher.offer(&ctx, put(2)).unwrap();

        let err = SubscriptionError::connection("reset", Duration::ZERO);
        coordinator(&ctx).teardown(writer, dispatcher, &Err(err.clone()));

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].vlsn(), Vlsn::new(1));
        assert_eq!(events[1].vlsn(), Vlsn::new(2));
        assert_eq!(events[2], Event::Exception(err));
    }

    #[test]
    fn terminal_teardown_reports_once() {
        let (ctx, events) = context(|c| c);
        let (writer, dispatcher) = workers(&ctx);

        let err = SubscriptionError::Security("revoked".into());
        coordinator(&ctx).teardown(writer, dispatcher, &Err(err.clone()));
        assert_eq!(exceptions(&events), [err]);
    }

    #[test]
    fn group_shutdown_is_reported_by_the_message_not_teardown() {
        let (ctx, events) = context(|c| c);
        let (writer, dispatcher) = workers(&ctx);
        let coordinator = coordinator(&ctx);

        let result = coordinator.handle_message(
            FeederMessage::ShutdownRequest { shutdown_time_ms: 5 },
            &writer,
            &dispatcher,
        );
        let expected = SubscriptionError::GroupShutdown { shutdown_time_ms: 5 };
        assert_eq!(result, Err(expected.clone()));

        coordinator.teardown(writer, dispatcher, &result);
        assert_eq!(exceptions(&events), [expected]);
    }

    #[test]
    fn shutdown_teardown_reports_nothing() {
        let (ctx, events) = context(|c| c);
        let (writer, dispatcher) = workers(&ctx);
        ctx.request_shutdown();

        let err = SubscriptionError::connection("closed by shutdown", Duration::ZERO);
        coordinator(&ctx).teardown(writer, dispatcher, &Err(err));
        assert!(exceptions(&events).is_empty());
    }
}
