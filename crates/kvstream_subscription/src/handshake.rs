//! Connection handshake and syncup.
//!
//! Runs on the coordinator thread right after a channel opens:
//!
//! 1. Service request: identify as a subscriber and present a token.
//! 2. Version negotiation: both sides settle on the lower version.
//! 3. Syncup: agree on the start VLSN. The feeder confirms with a syncup
//!    response followed by a heartbeat.

use crate::channel::{FeederChannel, Received};
use crate::context::SubscriptionContext;
use crate::error::{SubscriptionError, SubscriptionResult};
use kvstream_protocol::{
    ClientMessage, FeederMessage, Heartbeat, ServiceResponse, SyncupRequest, Vlsn, FEEDER_SERVICE,
    PROTOCOL_VERSION,
};
use std::time::{Duration, Instant};
use tracing::debug;

/// What a successful syncup established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyncupOutcome {
    pub(crate) start_vlsn: Vlsn,
    pub(crate) partition_generation: Option<u64>,
    pub(crate) heartbeat: Heartbeat,
}

pub(crate) struct Handshake<'a> {
    channel: &'a dyn FeederChannel,
    ctx: &'a SubscriptionContext,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(channel: &'a dyn FeederChannel, ctx: &'a SubscriptionContext) -> Self {
        Self { channel, ctx }
    }

    /// Asks the feeder for the stream service.
    pub(crate) fn request_service(&self, node_name: &str) -> SubscriptionResult<()> {
        self.send(&ClientMessage::ServiceRequest {
            service: FEEDER_SERVICE.to_string(),
            node_name: node_name.to_string(),
            node_type: self.ctx.config.node_type,
            auth_token: self.ctx.config.auth.initial_token(),
        })?;

        match self.await_reply("service response")? {
            FeederMessage::ServiceResponse(ServiceResponse::Accepted) => Ok(()),
            FeederMessage::ServiceResponse(ServiceResponse::Busy { retry_after_ms }) => {
                Err(SubscriptionError::connection(
                    "feeder service is busy",
                    Duration::from_millis(retry_after_ms),
                ))
            }
            FeederMessage::ServiceResponse(ServiceResponse::AuthFailure { reason }) => {
                Err(SubscriptionError::Security(reason))
            }
            other => Err(unexpected(&other, "service response")),
        }
    }

    /// Negotiates the protocol version and checks it against the minimum.
    pub(crate) fn negotiate_version(&self) -> SubscriptionResult<u32> {
        self.send(&ClientMessage::ProtocolVersion {
            version: PROTOCOL_VERSION,
        })?;

        let offered = match self.await_reply("protocol version")? {
            FeederMessage::ProtocolVersion { version } => version,
            other => return Err(unexpected(&other, "protocol version")),
        };
        let negotiated = offered.min(PROTOCOL_VERSION);
        let minimum = self.ctx.config.min_protocol_version;
        if negotiated < minimum {
            return Err(SubscriptionError::Protocol(format!(
                "negotiated protocol version {negotiated} is below the required minimum {minimum}"
            )));
        }
        debug!(negotiated, "protocol version agreed");
        Ok(negotiated)
    }

    /// Agrees on the start position.
    pub(crate) fn syncup(&self, request: SyncupRequest) -> SubscriptionResult<SyncupOutcome> {
        let requested = request.start_vlsn;
        self.send(&ClientMessage::SyncupRequest(request))?;

        let (start_vlsn, partition_generation) = match self.await_reply("syncup response")? {
            FeederMessage::SyncupResponse {
                start_vlsn,
                partition_generation,
            } => (start_vlsn, partition_generation),
            FeederMessage::LogNotAvailable { first, last } => {
                return Err(SubscriptionError::InsufficientLog {
                    requested,
                    first,
                    last,
                })
            }
            other => return Err(unexpected(&other, "syncup response")),
        };
        if start_vlsn.is_null() {
            return Err(SubscriptionError::InsufficientLog {
                requested,
                first: Vlsn::NULL,
                last: Vlsn::NULL,
            });
        }

        let heartbeat = match self.await_reply("first heartbeat")? {
            FeederMessage::Heartbeat(heartbeat) => heartbeat,
            other => return Err(unexpected(&other, "first heartbeat")),
        };
        debug!(%start_vlsn, ?partition_generation, "syncup complete");

        Ok(SyncupOutcome {
            start_vlsn,
            partition_generation,
            heartbeat,
        })
    }

    fn send(&self, message: &ClientMessage) -> SubscriptionResult<()> {
        self.channel.send(message)?;
        self.ctx.stats.record_sent();
        Ok(())
    }

    /// Waits for the next message. Security failures and shutdown notices
    /// end the handshake wherever they arrive.
    fn await_reply(&self, waiting_for: &str) -> SubscriptionResult<FeederMessage> {
        let config = &self.ctx.config;
        let deadline = Instant::now() + config.idle_timeout;
        loop {
            if self.ctx.is_shutting_down() {
                return Err(SubscriptionError::ShuttingDown);
            }
            match self.channel.receive(config.poll_interval)? {
                Received::Message(message) => {
                    self.ctx.stats.record_received();
                    return match message {
                        FeederMessage::SecurityFailure { reason } => {
                            Err(SubscriptionError::Security(reason))
                        }
                        FeederMessage::ShutdownRequest { shutdown_time_ms } => {
                            Err(SubscriptionError::GroupShutdown { shutdown_time_ms })
                        }
                        other => Ok(other),
                    };
                }
                Received::Idle if Instant::now() >= deadline => {
                    return Err(SubscriptionError::timeout(
                        format!("no {waiting_for} within {:?}", config.idle_timeout),
                        Duration::ZERO,
                    ));
                }
                Received::Idle => {}
                Received::EndOfStream if self.ctx.is_shutting_down() => {
                    return Err(SubscriptionError::ShuttingDown);
                }
                Received::EndOfStream => {
                    return Err(SubscriptionError::connection(
                        format!("feeder closed the connection while awaiting {waiting_for}"),
                        Duration::ZERO,
                    ));
                }
            }
        }
    }
}

fn unexpected(message: &FeederMessage, waiting_for: &str) -> SubscriptionError {
    SubscriptionError::Protocol(format!(
        "unexpected {} while awaiting {waiting_for}",
        message.kind()
    ))
}
