//! Configuration for a subscription.

use crate::auth::{AuthTokenProvider, NoAuth};
use crate::channel::{Connector, TcpConnector};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::fault::{FaultInjector, NoFaults};
use crate::identity::{NodeIdAllocator, UuidNodeIdAllocator};
use kvstream_protocol::{NodeType, StreamFilter, StreamMode, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Network address of a feeder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeederAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl FeederAddress {
    /// Creates a feeder address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for FeederAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options applied when opening a feeder channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Size of each socket read.
    pub receive_buffer_size: usize,
    /// Capacity of the buffered socket writer.
    pub send_buffer_size: usize,
    /// Connect timeout.
    pub open_timeout: Duration,
    /// Largest frame accepted or sent.
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            receive_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            open_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Reconnect attempts allowed after the first connection attempt.
    pub max_retries: u32,
    /// Sleep before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the sleep between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration allowing `max_retries` reconnects.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never reconnects.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the sleep before a given retry (1-indexed; 0 is the
    /// first connection attempt and never sleeps).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap pseudo-random jitter without an RNG dependency.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Configuration for a subscription.
///
/// Read-only once the subscription is constructed.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Feeder to subscribe to.
    pub feeder: FeederAddress,
    /// Node name. Allocated on start when absent.
    pub node_name: Option<String>,
    /// Role announced in the service handshake.
    pub node_type: NodeType,
    /// Capacity of the dispatcher's input queue.
    pub input_queue_capacity: usize,
    /// Capacity of the writer's token queue.
    pub output_queue_capacity: usize,
    /// Read and queue poll interval.
    pub poll_interval: Duration,
    /// How long to wait for room in the dispatcher queue before counting
    /// an overflow and retrying.
    pub offer_timeout: Duration,
    /// Close the channel if no message arrives for this long.
    pub idle_timeout: Duration,
    /// How long `start` waits for the first connection outcome.
    pub start_timeout: Duration,
    /// Soft bound on each thread's shutdown.
    pub shutdown_timeout: Duration,
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Lowest acceptable negotiated protocol version.
    pub min_protocol_version: u32,
    /// Stream mode for the first connection attempt.
    pub stream_mode: StreamMode,
    /// Initial stream filter.
    pub filter: StreamFilter,
    /// Deliver before-images to the callback.
    pub include_before_image: bool,
    /// Re-authenticate on this interval, if set.
    pub reauth_interval: Option<Duration>,
    /// Channel options.
    pub connect: ConnectOptions,
    /// Opens feeder channels.
    pub connector: Arc<dyn Connector>,
    /// Supplies authentication tokens.
    pub auth: Arc<dyn AuthTokenProvider>,
    /// Allocates transient node names.
    pub node_ids: Arc<dyn NodeIdAllocator>,
    /// Failure hooks.
    pub faults: Arc<dyn FaultInjector>,
}

impl SubscriptionConfig {
    /// Creates a configuration with defaults for the given feeder.
    pub fn new(feeder: FeederAddress) -> Self {
        Self {
            feeder,
            node_name: None,
            node_type: NodeType::Subscriber,
            input_queue_capacity: 1024,
            output_queue_capacity: 128,
            poll_interval: Duration::from_millis(100),
            offer_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            min_protocol_version: 1,
            stream_mode: StreamMode::Exact,
            filter: StreamFilter::all_tables(),
            include_before_image: false,
            reauth_interval: None,
            connect: ConnectOptions::default(),
            connector: Arc::new(TcpConnector),
            auth: Arc::new(NoAuth),
            node_ids: Arc::new(UuidNodeIdAllocator::new()),
            faults: Arc::new(NoFaults),
        }
    }

    /// Sets a fixed node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Sets the node type.
    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    /// Sets the dispatcher input queue capacity.
    pub fn with_input_queue_capacity(mut self, capacity: usize) -> Self {
        self.input_queue_capacity = capacity;
        self
    }

    /// Sets the writer token queue capacity.
    pub fn with_output_queue_capacity(mut self, capacity: usize) -> Self {
        self.output_queue_capacity = capacity;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the queue offer timeout.
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    /// Sets the channel idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the start timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Sets the soft shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the minimum protocol version.
    pub fn with_min_protocol_version(mut self, version: u32) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Sets the stream mode used on the first connection attempt.
    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Sets the initial filter.
    pub fn with_filter(mut self, filter: StreamFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Enables before-image delivery.
    pub fn with_before_images(mut self, include: bool) -> Self {
        self.include_before_image = include;
        self
    }

    /// Re-authenticates on the given interval.
    pub fn with_reauth_interval(mut self, interval: Duration) -> Self {
        self.reauth_interval = Some(interval);
        self
    }

    /// Sets the channel options.
    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect = options;
        self
    }

    /// Sets the connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Sets the token provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthTokenProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the node name allocator.
    pub fn with_node_id_allocator(mut self, allocator: Arc<dyn NodeIdAllocator>) -> Self {
        self.node_ids = allocator;
        self
    }

    /// Sets the fault injector.
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Checks the configuration for values the subscription cannot run with.
    pub fn validate(&self) -> SubscriptionResult<()> {
        let invalid = |msg: &str| Err(SubscriptionError::InvalidConfig(msg.to_string()));

        if self.feeder.host.trim().is_empty() {
            return invalid("feeder host is empty");
        }
        if self.node_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return invalid("node name is empty");
        }
        if self.input_queue_capacity == 0 || self.output_queue_capacity == 0 {
            return invalid("queue capacities must be non-zero");
        }
        if self.poll_interval.is_zero() || self.offer_timeout.is_zero() {
            return invalid("poll interval and offer timeout must be non-zero");
        }
        if self.idle_timeout.is_zero() || self.start_timeout.is_zero() {
            return invalid("idle and start timeouts must be non-zero");
        }
        if self.reauth_interval.is_some_and(|i| i.is_zero()) {
            return invalid("re-authentication interval must be non-zero");
        }
        if self.connect.max_frame_size == 0 || self.connect.receive_buffer_size == 0 {
            return invalid("frame and buffer sizes must be non-zero");
        }
        Ok(())
    }
}
