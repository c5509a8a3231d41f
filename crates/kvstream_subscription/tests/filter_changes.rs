//! Integration tests for dynamic filter changes.

use crossbeam_channel::{unbounded, Receiver};
use kvstream_protocol::{FilterChange, FilterChangeStatus, StreamFilter, Vlsn};
use kvstream_subscription::{
    FaultInjector, FilterChangeOutcome, Subscription, SubscriptionError, SubscriptionResult,
    SubscriptionStatus,
};
use kvstream_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

type Outcome = Result<FilterChangeOutcome, SubscriptionError>;

fn streaming(feeder: &Arc<SimulatedFeeder>) -> (Subscription, Arc<RecordingCallback>) {
    streaming_with(test_config(feeder))
}

fn streaming_with(
    config: kvstream_subscription::SubscriptionConfig,
) -> (Subscription, Arc<RecordingCallback>) {
    let config = config.with_filter(StreamFilter::tables(["orders"]));
    let (sub, callback) = subscribe(config).unwrap();
    sub.start(Vlsn::FIRST).unwrap();
    (sub, callback)
}

fn submit(sub: &Subscription, change: FilterChange) -> SubscriptionResult<Receiver<Outcome>> {
    let (tx, rx) = unbounded();
    sub.change_filter(change, move |outcome| {
        let _ = tx.send(outcome);
    })?;
    Ok(rx)
}

#[test]
fn accepted_change_updates_local_filter() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.append_txn(1, &[("a", "1")]);
    let (sub, _callback) = streaming(&feeder);

    assert_eq!(
        feeder.syncup_requests()[0].filter,
        StreamFilter::tables(["orders"])
    );

    let outcome = submit(&sub, FilterChange::add_table("r1", "users"))
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.request_id, "r1");
    assert_eq!(outcome.status, FilterChangeStatus::Ok);
    assert_eq!(outcome.effective_vlsn, Vlsn::new(2));
    assert_eq!(sub.filter(), StreamFilter::tables(["orders", "users"]));
    assert_eq!(feeder.filter_requests(), [FilterChange::add_table("r1", "users")]);
    assert!(sub.is_streaming());
    sub.shutdown();
}

#[test]
fn duplicate_request_id_is_rejected_while_pending() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::Hold);
    let (sub, _callback) = streaming(&feeder);

    let first = submit(&sub, FilterChange::add_table("r1", "users")).unwrap();
    let err = submit(&sub, FilterChange::add_table("r1", "items")).unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidArgument(_)));

    assert!(feeder.wait_until(WAIT, |f| f.filter_requests().len() == 1));
    feeder.answer_filter_change("r1", FilterChangeStatus::Ok);

    let outcome = first.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(outcome.status, FilterChangeStatus::Ok);
    assert_eq!(sub.filter(), StreamFilter::tables(["orders", "users"]));

    // Once resolved, the ID can be reused.
    feeder.set_filter_reply(FilterReply::Ok);
    let reused = submit(&sub, FilterChange::remove_table("r1", "users")).unwrap();
    assert!(reused.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(sub.filter(), StreamFilter::tables(["orders"]));
    sub.shutdown();
}

#[derive(Debug)]
struct RejectLocalApply;

impl FaultInjector for RejectLocalApply {
    fn before_filter_apply(&self, request_id: &str) -> SubscriptionResult<()> {
        Err(SubscriptionError::Internal(format!(
            "forced failure applying {request_id}"
        )))
    }
}

#[test]
fn local_apply_failure_stops_the_stream() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.append_txn(1, &[("a", "1")]);
    let config = test_config(&feeder).with_fault_injector(Arc::new(RejectLocalApply));
    let (sub, callback) = streaming_with(config);
    assert!(callback.wait_for_data(2, WAIT));

    let outcome = submit(&sub, FilterChange::add_table("r1", "users"))
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap();
    assert!(matches!(
        outcome,
        Err(SubscriptionError::FilterChange { ref request_id, .. }) if request_id == "r1"
    ));

    assert!(wait_until(WAIT, || sub.status() == SubscriptionStatus::FilterChangeError));
    assert!(matches!(
        sub.stored_error(),
        Some(SubscriptionError::FilterChange { .. })
    ));
    assert!(!sub.is_streaming());
    assert_eq!(sub.filter(), StreamFilter::tables(["orders"]));
    assert!(callback.wait_for(WAIT, |events| {
        events
            .iter()
            .any(|e| matches!(e, CallbackEvent::Exception(SubscriptionError::FilterChange { .. })))
    }));

    feeder.append_txn(2, &[("b", "2")]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(callback.vlsns(), [Vlsn::new(1), Vlsn::new(2)]);
    assert_eq!(feeder.connect_attempts(), 1);
}

#[test]
fn not_applicable_keeps_streaming() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::NotApplicable);
    let (sub, _callback) = streaming(&feeder);

    let outcome = submit(&sub, FilterChange::remove_table("r1", "users"))
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, FilterChangeStatus::NotApplicable);
    assert_eq!(sub.filter(), StreamFilter::tables(["orders"]));
    assert!(sub.is_streaming());
    assert_eq!(sub.status(), SubscriptionStatus::Success);
    sub.shutdown();
}

#[test]
fn feeder_rejection_is_terminal() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::Fail("no such table".into()));
    let (sub, _callback) = streaming(&feeder);

    let outcome = submit(&sub, FilterChange::add_table("r1", "ghosts"))
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap();
    assert_eq!(
        outcome,
        Err(SubscriptionError::FilterChange {
            request_id: "r1".into(),
            reason: "no such table".into(),
        })
    );
    assert!(wait_until(WAIT, || sub.status() == SubscriptionStatus::FilterChangeError));
}

#[test]
fn unknown_status_code_is_a_protocol_error() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::Code(42));
    let (sub, _callback) = streaming(&feeder);

    let outcome = submit(&sub, FilterChange::add_table("r1", "users"))
        .unwrap()
        .recv_timeout(WAIT)
        .unwrap();
    assert!(matches!(outcome, Err(SubscriptionError::Protocol(_))));
    assert!(wait_until(WAIT, || sub.status() == SubscriptionStatus::UnknownError));
}

#[test]
fn pending_change_is_resent_after_reconnect() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::Hold);
    let (sub, _callback) = streaming(&feeder);

    let pending = submit(&sub, FilterChange::add_table("r1", "users")).unwrap();
    assert!(feeder.wait_until(WAIT, |f| f.filter_requests().len() == 1));

    feeder.disconnect_all();
    assert!(feeder.wait_until(WAIT, |f| {
        f.filter_requests().len() == 2 && f.streaming_sessions() == 1
    }));
    let requests = feeder.filter_requests();
    assert_eq!(requests[0], requests[1]);

    feeder.answer_filter_change("r1", FilterChangeStatus::Ok);
    assert!(pending.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(sub.filter(), StreamFilter::tables(["orders", "users"]));
    sub.shutdown();
}

#[test]
fn shutdown_fails_pending_handlers() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.set_filter_reply(FilterReply::Hold);
    let (sub, _callback) = streaming(&feeder);

    let pending = submit(&sub, FilterChange::add_table("r1", "users")).unwrap();
    sub.shutdown();
    assert_eq!(
        pending.recv_timeout(WAIT).unwrap(),
        Err(SubscriptionError::ShuttingDown)
    );
    // The handler runs exactly once.
    assert!(pending.recv_timeout(Duration::from_millis(50)).is_err());

    let err = submit(&sub, FilterChange::add_table("r2", "users")).unwrap_err();
    assert!(matches!(err, SubscriptionError::IllegalState(_)));
}

#[test]
fn answer_for_unknown_request_is_fatal() {
    init_test_logging();
    let feeder = SimulatedFeeder::new();
    feeder.append_txn(1, &[("a", "1")]);
    let (sub, callback) = streaming(&feeder);
    assert!(callback.wait_for_data(2, WAIT));

    feeder.answer_filter_change("ghost", FilterChangeStatus::Ok);
    assert!(wait_until(WAIT, || sub.status() == SubscriptionStatus::UnknownError));
    assert!(matches!(
        sub.stored_error(),
        Some(SubscriptionError::Internal(ref reason)) if reason.contains("ghost")
    ));
    assert!(!sub.is_streaming());
    assert_eq!(sub.filter(), StreamFilter::tables(["orders"]));
    assert_eq!(feeder.connect_attempts(), 1);
}
