//! # kvstream Protocol
//!
//! Feeder stream protocol types and CBOR framing for kvstream.
//!
//! This crate provides:
//! - `Vlsn` stream positions
//! - `LogRecord` for replicated puts, deletes, commits and aborts
//! - `StreamFilter` and `FilterChange` for dynamic reconfiguration
//! - Protocol messages (service handshake, syncup, heartbeat, entry,
//!   filter change, security failure, shutdown)
//! - Length-prefixed CBOR framing
//!
//! This is a pure protocol crate; the only I/O is writing frames to a
//! caller-supplied `std::io::Write`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod filter;
pub mod frame;
mod messages;
mod record;
mod vlsn;

pub use error::{ProtocolError, ProtocolResult};
pub use filter::{FilterChange, FilterChangeStatus, FilterOperation, StreamFilter};
pub use frame::{encode_frame, write_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use messages::{
    ClientMessage, Entry, FeederMessage, FilterChangeResponse, Heartbeat, NodeType,
    ServiceResponse, StreamMode, SyncupRequest, FEEDER_SERVICE, PROTOCOL_VERSION,
};
pub use record::{BeforeImage, LogRecord, RecordKind};
pub use vlsn::Vlsn;
