//! Feeder channel abstraction.
//!
//! The coordinator owns a channel for reading; the writer thread holds a
//! clone of the same `Arc` for writing only. Implementations must allow a
//! concurrent `send` and `receive` and make `close` idempotent.

use crate::config::{ConnectOptions, FeederAddress};
use kvstream_protocol::{
    write_frame, ClientMessage, FeederMessage, FrameDecoder, ProtocolError, ProtocolResult,
};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, BufWriter, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete message.
    Message(FeederMessage),
    /// No complete message arrived within the timeout.
    Idle,
    /// The peer closed the stream or the channel was closed locally.
    EndOfStream,
}

/// A bidirectional, message-oriented connection to a feeder.
pub trait FeederChannel: Send + Sync + fmt::Debug {
    /// Writes one message.
    fn send(&self, message: &ClientMessage) -> ProtocolResult<()>;

    /// Waits up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> ProtocolResult<Received>;

    /// Closes the channel. Only the first call has an effect.
    fn close(&self);

    /// Returns true until the channel is closed.
    fn is_open(&self) -> bool;
}

/// Opens feeder channels.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to a feeder.
    fn connect(
        &self,
        address: &FeederAddress,
        options: &ConnectOptions,
    ) -> io::Result<Arc<dyn FeederChannel>>;
}

/// Connector for plain TCP feeders.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &FeederAddress,
        options: &ConnectOptions,
    ) -> io::Result<Arc<dyn FeederChannel>> {
        let mut last_err = None;
        for addr in (address.host.as_str(), address.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, options.open_timeout) {
                Ok(stream) => return Ok(Arc::new(TcpChannel::new(stream, options)?)),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {address}"),
            )
        }))
    }
}

struct ReadHalf {
    stream: TcpStream,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

/// A feeder channel over a TCP stream.
///
/// Reads and writes use separate clones of the socket behind separate
/// locks, so the writer never waits for a blocked read.
pub struct TcpChannel {
    reader: Mutex<ReadHalf>,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
    peer: SocketAddr,
    max_frame_size: usize,
    open: AtomicBool,
}

impl TcpChannel {
    /// Wraps a connected stream.
    pub fn new(stream: TcpStream, options: &ConnectOptions) -> io::Result<Self> {
        stream.set_nodelay(options.no_delay)?;
        let peer = stream.peer_addr()?;
        let write_half = stream.try_clone()?;
        let control = stream.try_clone()?;

        Ok(Self {
            reader: Mutex::new(ReadHalf {
                stream,
                decoder: FrameDecoder::new(options.max_frame_size),
                chunk: vec![0u8; options.receive_buffer_size],
            }),
            writer: Mutex::new(BufWriter::with_capacity(
                options.send_buffer_size,
                write_half,
            )),
            control,
            peer,
            max_frame_size: options.max_frame_size,
            open: AtomicBool::new(true),
        })
    }

    /// Address of the feeder.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl FeederChannel for TcpChannel {
    fn send(&self, message: &ClientMessage) -> ProtocolResult<()> {
        if !self.is_open() {
            return Err(closed());
        }
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, message, self.max_frame_size)
    }

    fn receive(&self, timeout: Duration) -> ProtocolResult<Received> {
        let mut half = self.reader.lock();
        if let Some(message) = half.decoder.decode()? {
            return Ok(Received::Message(message));
        }
        if !self.is_open() {
            return Ok(Received::EndOfStream);
        }

        // A zero read timeout means "block forever" to the OS.
        half.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let ReadHalf {
            stream,
            decoder,
            chunk,
        } = &mut *half;
        match stream.read(chunk) {
            Ok(0) => Ok(Received::EndOfStream),
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                Ok(decoder
                    .decode()?
                    .map(Received::Message)
                    .unwrap_or(Received::Idle))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(Received::Idle)
            }
            Err(_) if !self.is_open() => Ok(Received::EndOfStream),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.peer, "closing feeder channel");
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

fn closed() -> ProtocolError {
    ProtocolError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "feeder channel is closed",
    ))
}
