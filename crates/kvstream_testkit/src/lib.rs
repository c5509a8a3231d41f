//! # kvstream Testkit
//!
//! Test utilities for kvstream.
//!
//! This crate provides:
//! - In-memory feeder channels that carry real protocol frames
//! - A simulated feeder that speaks the full stream protocol and can
//!   refuse connections, truncate its log, reject credentials, hold
//!   filter changes and shut the group down
//! - A recording callback that can be stalled
//! - Subscription fixtures and test logging
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kvstream_testkit::prelude::*;
//!
//! #[test]
//! fn streams_a_transaction() {
//!     let feeder = SimulatedFeeder::new();
//!     feeder.append_txn(1, &[("k", "v")]);
//!
//!     let (subscription, callback) = subscribe(test_config(&feeder)).unwrap();
//!     subscription.start(Vlsn::FIRST).unwrap();
//!     assert!(callback.wait_for_data(2, Duration::from_secs(5)));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod callback;
pub mod feeder;
pub mod fixtures;
pub mod logging;
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callback::*;
    pub use crate::feeder::*;
    pub use crate::fixtures::*;
    pub use crate::logging::*;
    pub use crate::memory::*;
}

pub use callback::{CallbackEvent, RecordingCallback};
pub use feeder::{FilterReply, HeartbeatAck, SimulatedFeeder};
pub use fixtures::{subscribe, test_config, wait_until};
pub use logging::init_test_logging;
pub use memory::{memory_pair, FeederEnd, LinkState, MemoryChannel};
