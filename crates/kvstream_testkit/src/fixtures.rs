//! Subscription fixtures.

use crate::callback::RecordingCallback;
use crate::feeder::SimulatedFeeder;
use kvstream_subscription::{
    FeederAddress, RetryConfig, Subscription, SubscriptionConfig, SubscriptionResult,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A config wired to `feeder` with timeouts short enough for tests.
///
/// Retries are fast and jitter-free; the idle timeout is generous so
/// tests do not need to send heartbeats.
pub fn test_config(feeder: &Arc<SimulatedFeeder>) -> SubscriptionConfig {
    SubscriptionConfig::new(FeederAddress::new("simulated-feeder", 5001))
        .with_connector(feeder.clone())
        .with_poll_interval(Duration::from_millis(5))
        .with_offer_timeout(Duration::from_millis(5))
        .with_idle_timeout(Duration::from_secs(10))
        .with_start_timeout(Duration::from_secs(10))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(false),
        )
}

/// A subscription against `feeder` with a recording callback.
pub fn subscribe(
    config: SubscriptionConfig,
) -> SubscriptionResult<(Subscription, Arc<RecordingCallback>)> {
    let callback = Arc::new(RecordingCallback::new());
    let subscription = Subscription::new(config, callback.clone())?;
    Ok((subscription, callback))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
