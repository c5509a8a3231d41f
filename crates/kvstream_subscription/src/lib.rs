//! # kvstream Subscription
//!
//! Replication stream subscription client for kvstream.
//!
//! This crate provides:
//! - Feeder handshake, protocol version negotiation and syncup
//! - A three-thread streaming pipeline (coordinator, writer, dispatcher)
//! - Bounded queues with overflow accounting
//! - Dynamic filter changes with exactly-once completion handlers
//! - Reconnect with a bounded retry budget, resuming after the last
//!   delivered position
//! - Statistics and lifecycle status
//!
//! ## Architecture
//!
//! The coordinator thread owns the feeder channel. It reads messages,
//! answers heartbeats through the writer thread, resolves filter change
//! responses, and hands data entries to the dispatcher thread, which runs
//! the consumer's [`SubscriptionCallback`]. A slow callback fills the
//! dispatcher queue but never stalls network reads.
//!
//! ## Key Invariants
//!
//! - Entries reach the callback in feeder order
//! - A reconnect resumes at the highest VLSN handed to the dispatcher, and
//!   nothing at or below it is delivered twice
//! - Security, protocol, insufficient-log, group-shutdown and filter-change
//!   failures are terminal; only connection and timeout errors are retried
//! - Shutdown is idempotent and bounded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod callback;
mod channel;
mod config;
mod context;
mod coordinator;
mod dispatcher;
mod error;
mod fault;
mod filter_change;
mod handshake;
mod identity;
mod stats;
mod status;
mod subscription;
mod writer;

#[cfg(test)]
mod test_support;

pub use auth::{AuthTokenProvider, NoAuth, RenewableToken};
pub use callback::{StreamDelete, StreamPut, SubscriptionCallback};
pub use channel::{Connector, FeederChannel, Received, TcpChannel, TcpConnector};
pub use config::{ConnectOptions, FeederAddress, RetryConfig, SubscriptionConfig};
pub use error::{SubscriptionError, SubscriptionResult};
pub use fault::{FaultInjector, NoFaults};
pub use filter_change::{FilterChangeHandler, FilterChangeOutcome};
pub use identity::{NodeIdAllocator, UuidNodeIdAllocator};
pub use stats::{StatsSnapshot, SubscriptionStats};
pub use status::SubscriptionStatus;
pub use subscription::Subscription;
pub use writer::OutputToken;
