//! In-memory feeder channels.
//!
//! A [`memory_pair`] links a client-side [`MemoryChannel`] to a
//! [`FeederEnd`]. Every message is encoded into a length-prefixed CBOR
//! frame and decoded on the other side, so tests exercise the same codec
//! as the TCP transport without touching the network.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use kvstream_protocol::{
    encode_frame, ClientMessage, FeederMessage, FrameDecoder, ProtocolError, ProtocolResult,
};
use kvstream_subscription::{FeederChannel, Received};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Close bookkeeping shared by both ends of a pair.
#[derive(Debug, Default)]
pub struct LinkState {
    client_closed: AtomicBool,
    feeder_closed: AtomicBool,
    close_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl LinkState {
    /// Returns true once the client closed its end.
    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::Acquire)
    }

    /// Returns true once the feeder closed its end.
    pub fn feeder_closed(&self) -> bool {
        self.feeder_closed.load(Ordering::Acquire)
    }

    /// Number of `close` calls made on the client end.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Number of times the client end was actually closed (0 or 1).
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

/// Creates a linked client channel and feeder end.
pub fn memory_pair(max_frame_size: usize) -> (MemoryChannel, FeederEnd) {
    let (to_feeder, from_client) = unbounded();
    let (to_client, from_feeder) = unbounded();
    let state = Arc::new(LinkState::default());

    let client = MemoryChannel {
        outbound: to_feeder,
        inbound: from_feeder,
        decoder: Mutex::new(FrameDecoder::new(max_frame_size)),
        max_frame_size,
        state: state.clone(),
    };
    let feeder = FeederEnd {
        outbound: Mutex::new(Some(to_client)),
        inbound: from_client,
        decoder: Mutex::new(FrameDecoder::new(max_frame_size)),
        max_frame_size,
        state,
    };
    (client, feeder)
}

/// Client side of an in-memory link.
#[derive(Debug)]
pub struct MemoryChannel {
    outbound: Sender<Bytes>,
    inbound: Receiver<Bytes>,
    decoder: Mutex<FrameDecoder>,
    max_frame_size: usize,
    state: Arc<LinkState>,
}

impl MemoryChannel {
    /// Close bookkeeping for this link.
    pub fn state(&self) -> Arc<LinkState> {
        self.state.clone()
    }
}

impl FeederChannel for MemoryChannel {
    fn send(&self, message: &ClientMessage) -> ProtocolResult<()> {
        if self.state.client_closed() || self.state.feeder_closed() {
            return Err(closed());
        }
        let frame = encode_frame(message, self.max_frame_size)?;
        self.outbound.send(frame).map_err(|_| closed())
    }

    fn receive(&self, timeout: Duration) -> ProtocolResult<Received> {
        if self.state.client_closed() {
            return Ok(Received::EndOfStream);
        }
        let mut decoder = self.decoder.lock();
        decode_or_wait(&mut decoder, &self.inbound, timeout).map(|message| match message {
            Poll::Ready(message) => Received::Message(message),
            Poll::Pending => Received::Idle,
            Poll::Closed => Received::EndOfStream,
        })
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::AcqRel);
        if !self.state.client_closed.swap(true, Ordering::AcqRel) {
            self.state.closes.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn is_open(&self) -> bool {
        !self.state.client_closed()
    }
}

/// Feeder side of an in-memory link.
#[derive(Debug)]
pub struct FeederEnd {
    outbound: Mutex<Option<Sender<Bytes>>>,
    inbound: Receiver<Bytes>,
    decoder: Mutex<FrameDecoder>,
    max_frame_size: usize,
    state: Arc<LinkState>,
}

impl FeederEnd {
    /// Sends a message to the client.
    pub fn send(&self, message: &FeederMessage) -> ProtocolResult<()> {
        let frame = encode_frame(message, self.max_frame_size)?;
        match self.outbound.lock().as_ref() {
            Some(outbound) if !self.state.client_closed() => {
                outbound.send(frame).map_err(|_| closed())
            }
            _ => Err(closed()),
        }
    }

    /// Waits up to `timeout` for the next client message. Returns `None`
    /// on timeout and once the client has gone away.
    pub fn recv(&self, timeout: Duration) -> Option<ClientMessage> {
        if self.is_closed() {
            return None;
        }
        let mut decoder = self.decoder.lock();
        match decode_or_wait(&mut decoder, &self.inbound, timeout) {
            Ok(Poll::Ready(message)) => Some(message),
            _ => None,
        }
    }

    /// Drops the connection. The client sees end of stream.
    pub fn close(&self) {
        self.state.feeder_closed.store(true, Ordering::Release);
        self.outbound.lock().take();
    }

    /// Returns true once either side closed the link.
    pub fn is_closed(&self) -> bool {
        self.state.client_closed() || self.state.feeder_closed()
    }

    /// Close bookkeeping for this link.
    pub fn state(&self) -> Arc<LinkState> {
        self.state.clone()
    }
}

enum Poll<T> {
    Ready(T),
    Pending,
    Closed,
}

fn decode_or_wait<T: DeserializeOwned>(
    decoder: &mut FrameDecoder,
    inbound: &Receiver<Bytes>,
    timeout: Duration,
) -> ProtocolResult<Poll<T>> {
    if let Some(message) = decoder.decode()? {
        return Ok(Poll::Ready(message));
    }
    match inbound.recv_timeout(timeout) {
        Ok(frame) => {
            decoder.extend(&frame);
            Ok(decoder.decode()?.map_or(Poll::Pending, Poll::Ready))
        }
        Err(RecvTimeoutError::Timeout) => Ok(Poll::Pending),
        Err(RecvTimeoutError::Disconnected) => Ok(Poll::Closed),
    }
}

fn closed() -> ProtocolError {
    ProtocolError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "memory channel is closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstream_protocol::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};

    #[test]
    fn messages_cross_the_link() {
        let (client, feeder) = memory_pair(DEFAULT_MAX_FRAME_SIZE);
        client
            .send(&ClientMessage::ProtocolVersion {
                version: PROTOCOL_VERSION,
            })
            .unwrap();
        assert_eq!(
            feeder.recv(Duration::from_secs(1)),
            Some(ClientMessage::ProtocolVersion {
                version: PROTOCOL_VERSION
            })
        );

        feeder
            .send(&FeederMessage::ProtocolVersion { version: 2 })
            .unwrap();
        assert_eq!(
            client.receive(Duration::from_secs(1)).unwrap(),
            Received::Message(FeederMessage::ProtocolVersion { version: 2 })
        );
        assert_eq!(
            client.receive(Duration::from_millis(5)).unwrap(),
            Received::Idle
        );
    }

    #[test]
    fn feeder_close_ends_the_stream() {
        let (client, feeder) = memory_pair(DEFAULT_MAX_FRAME_SIZE);
        feeder.close();
        assert_eq!(
            client.receive(Duration::from_millis(5)).unwrap(),
            Received::EndOfStream
        );
        assert!(client
            .send(&ClientMessage::ProtocolVersion { version: 1 })
            .is_err());
    }

    #[test]
    fn client_close_counts_once() {
        let (client, feeder) = memory_pair(DEFAULT_MAX_FRAME_SIZE);
        client.close();
        client.close();
        let state = client.state();
        assert_eq!(state.close_calls(), 2);
        assert_eq!(state.closes(), 1);
        assert!(feeder.is_closed());
        assert!(feeder
            .send(&FeederMessage::ProtocolVersion { version: 1 })
            .is_err());
    }
}
