//! Simulated feeder.
//!
//! [`SimulatedFeeder`] implements [`Connector`] by handing out in-memory
//! channels, each served by its own session thread that speaks the full
//! feeder protocol: service handshake, version negotiation, syncup, entry
//! streaming, heartbeats and filter change responses. Tests append records
//! to the feeder's log and inject failures through its methods, then
//! inspect what the subscriber sent.

use crate::memory::{memory_pair, FeederEnd, LinkState};
use kvstream_protocol::{
    ClientMessage, Entry, FeederMessage, FilterChange, FilterChangeResponse, FilterChangeStatus,
    Heartbeat, LogRecord, ServiceResponse, StreamMode, SyncupRequest, Vlsn, PROTOCOL_VERSION,
};
use kvstream_subscription::{ConnectOptions, Connector, FeederAddress, FeederChannel};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const SESSION_POLL: Duration = Duration::from_millis(5);

/// How the feeder answers filter change requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReply {
    /// Accept the change.
    Ok,
    /// Report the change as not applicable.
    NotApplicable,
    /// Reject the change with a reason.
    Fail(String),
    /// Answer with a raw status code.
    Code(u8),
    /// Record the request and leave it unanswered until
    /// [`SimulatedFeeder::answer_filter_change`] is called.
    Hold,
}

/// A heartbeat response the feeder received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// Heartbeat being acknowledged.
    pub heartbeat_id: u64,
    /// High-water VLSN the subscriber reported.
    pub high_vlsn: Vlsn,
}

/// A connection served by the feeder.
#[derive(Debug)]
struct Session {
    end: FeederEnd,
    streaming: AtomicBool,
}

/// An in-process feeder driven by tests.
#[derive(Debug)]
pub struct SimulatedFeeder {
    this: Weak<SimulatedFeeder>,
    log: Mutex<Vec<(Vlsn, LogRecord)>>,
    first_available: Mutex<Vlsn>,
    sessions: Mutex<Vec<Arc<Session>>>,
    links: Mutex<Vec<Arc<LinkState>>>,

    refusing: AtomicBool,
    auth_rejection: Mutex<Option<String>>,
    protocol_version: AtomicU32,
    filter_reply: Mutex<FilterReply>,
    max_frame_size: usize,

    connect_attempts: AtomicUsize,
    next_heartbeat: AtomicU64,
    service_requests: Mutex<Vec<ClientMessage>>,
    syncups: Mutex<Vec<SyncupRequest>>,
    heartbeat_acks: Mutex<Vec<HeartbeatAck>>,
    filter_requests: Mutex<Vec<FilterChange>>,
    reauth_tokens: Mutex<Vec<Vec<u8>>>,
}

impl SimulatedFeeder {
    /// Creates a feeder with an empty log.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            log: Mutex::new(Vec::new()),
            first_available: Mutex::new(Vlsn::FIRST),
            sessions: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            refusing: AtomicBool::new(false),
            auth_rejection: Mutex::new(None),
            protocol_version: AtomicU32::new(PROTOCOL_VERSION),
            filter_reply: Mutex::new(FilterReply::Ok),
            max_frame_size: kvstream_protocol::DEFAULT_MAX_FRAME_SIZE,
            connect_attempts: AtomicUsize::new(0),
            next_heartbeat: AtomicU64::new(1),
            service_requests: Mutex::new(Vec::new()),
            syncups: Mutex::new(Vec::new()),
            heartbeat_acks: Mutex::new(Vec::new()),
            filter_requests: Mutex::new(Vec::new()),
            reauth_tokens: Mutex::new(Vec::new()),
        })
    }

    // === Log ===

    /// Appends a record and streams it to every synced-up session.
    pub fn append(&self, record: LogRecord) -> Vlsn {
        let mut log = self.log.lock();
        let vlsn = log.last().map_or(Vlsn::FIRST, |(v, _)| v.next());
        let entry = Entry::new(vlsn, &record).expect("log record encodes");
        log.push((vlsn, record));
        self.broadcast_streaming(&FeederMessage::Entry(entry));
        vlsn
    }

    /// Appends a put followed by a commit for transaction `txn_id`.
    pub fn append_txn(&self, txn_id: u64, puts: &[(&str, &str)]) -> Vlsn {
        for (key, value) in puts {
            self.append(LogRecord::put(
                key.as_bytes().to_vec(),
                value.as_bytes().to_vec(),
                txn_id,
                1,
                1_000 + txn_id,
            ));
        }
        self.append(LogRecord::commit(txn_id, 2_000 + txn_id))
    }

    /// Newest VLSN in the log, or null if empty.
    pub fn last_vlsn(&self) -> Vlsn {
        self.log.lock().last().map_or(Vlsn::NULL, |(v, _)| *v)
    }

    /// Pretends everything before `vlsn` was cleaned from the log.
    pub fn truncate_before(&self, vlsn: Vlsn) {
        *self.first_available.lock() = vlsn;
    }

    // === Behavior ===

    /// Refuses (or stops refusing) new connections at the transport level.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Release);
    }

    /// Rejects the service handshake with `reason`, or accepts it again.
    pub fn set_auth_rejection(&self, reason: Option<&str>) {
        *self.auth_rejection.lock() = reason.map(str::to_string);
    }

    /// Sets the protocol version the feeder offers.
    pub fn set_protocol_version(&self, version: u32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    /// Sets how filter change requests are answered.
    pub fn set_filter_reply(&self, reply: FilterReply) {
        *self.filter_reply.lock() = reply;
    }

    // === Events pushed to live sessions ===

    /// Sends a heartbeat to every synced-up session. Returns its ID.
    pub fn heartbeat(&self) -> u64 {
        let id = self.next_heartbeat.fetch_add(1, Ordering::AcqRel);
        let heartbeat = make_heartbeat(id, self.last_vlsn());
        self.broadcast_streaming(&FeederMessage::Heartbeat(heartbeat));
        id
    }

    /// Answers a held filter change.
    pub fn answer_filter_change(&self, request_id: &str, status: FilterChangeStatus) {
        let response = FilterChangeResponse::new(request_id, status, self.last_vlsn());
        self.broadcast_streaming(&FeederMessage::FilterChangeResponse(response));
    }

    /// Reports a security failure to every synced-up session.
    pub fn security_failure(&self, reason: &str) {
        self.broadcast_streaming(&FeederMessage::SecurityFailure {
            reason: reason.to_string(),
        });
    }

    /// Announces a group shutdown to every synced-up session.
    pub fn request_shutdown(&self, shutdown_time_ms: u64) {
        self.broadcast_streaming(&FeederMessage::ShutdownRequest { shutdown_time_ms });
    }

    /// Drops every open connection.
    pub fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in sessions {
            session.end.close();
        }
    }

    // === Inspection ===

    /// Number of connection attempts, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Acquire)
    }

    /// Number of connections accepted.
    pub fn connections(&self) -> usize {
        self.links.lock().len()
    }

    /// Service requests received, in order.
    pub fn service_requests(&self) -> Vec<ClientMessage> {
        self.service_requests.lock().clone()
    }

    /// Syncup requests received, in order.
    pub fn syncup_requests(&self) -> Vec<SyncupRequest> {
        self.syncups.lock().clone()
    }

    /// Heartbeat responses received, in order.
    pub fn heartbeat_acks(&self) -> Vec<HeartbeatAck> {
        self.heartbeat_acks.lock().clone()
    }

    /// Filter change requests received, in order.
    pub fn filter_requests(&self) -> Vec<FilterChange> {
        self.filter_requests.lock().clone()
    }

    /// Renewed tokens received, in order.
    pub fn reauth_tokens(&self) -> Vec<Vec<u8>> {
        self.reauth_tokens.lock().clone()
    }

    /// Total number of times a subscriber closed one of its channels.
    pub fn channel_closes(&self) -> usize {
        self.links.lock().iter().map(|l| l.closes()).sum()
    }

    /// Close bookkeeping of every accepted connection.
    pub fn links(&self) -> Vec<Arc<LinkState>> {
        self.links.lock().clone()
    }

    /// Number of sessions currently streaming.
    pub fn streaming_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.streaming.load(Ordering::Acquire) && !s.end.is_closed())
            .count()
    }

    /// Polls `condition` until it holds or `timeout` elapses.
    pub fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition(self)
    }

    // === Internals ===

    fn broadcast_streaming(&self, message: &FeederMessage) {
        for session in self.sessions.lock().iter() {
            if session.streaming.load(Ordering::Acquire) {
                let _ = session.end.send(message);
            }
        }
    }

    fn serve(self: Arc<Self>, session: Arc<Session>) {
        if let Err(reason) = self.handshake(&session) {
            debug!(%reason, "session ended during handshake");
            return;
        }
        while !session.end.is_closed() {
            let Some(message) = session.end.recv(SESSION_POLL) else {
                continue;
            };
            trace!(kind = message.kind(), "feeder received");
            match message {
                ClientMessage::HeartbeatResponse {
                    heartbeat_id,
                    high_vlsn,
                } => self.heartbeat_acks.lock().push(HeartbeatAck {
                    heartbeat_id,
                    high_vlsn,
                }),
                ClientMessage::ReAuthenticate { token } => self.reauth_tokens.lock().push(token),
                ClientMessage::FilterChangeRequest(change) => {
                    self.filter_requests.lock().push(change.clone());
                    self.reply_to_filter_change(&session, &change);
                }
                other => {
                    debug!(kind = other.kind(), "unexpected message while streaming");
                    session.end.close();
                }
            }
        }
        debug!("session closed");
    }

    fn reply_to_filter_change(&self, session: &Session, change: &FilterChange) {
        let reply = self.filter_reply.lock().clone();
        let (status_code, reason) = match reply {
            FilterReply::Hold => return,
            FilterReply::Ok => (FilterChangeStatus::Ok.to_code(), None),
            FilterReply::NotApplicable => (FilterChangeStatus::NotApplicable.to_code(), None),
            FilterReply::Fail(reason) => (FilterChangeStatus::Fail.to_code(), Some(reason)),
            FilterReply::Code(code) => (code, None),
        };
        let response = FilterChangeResponse {
            request_id: change.request_id.clone(),
            status_code,
            effective_vlsn: self.last_vlsn(),
            reason,
        };
        let _ = session
            .end
            .send(&FeederMessage::FilterChangeResponse(response));
    }

    fn handshake(&self, session: &Session) -> Result<(), String> {
        let end = &session.end;

        let request = self.expect_message(end, "service request")?;
        if !matches!(request, ClientMessage::ServiceRequest { .. }) {
            return Err(format!("expected service request, got {}", request.kind()));
        }
        self.service_requests.lock().push(request);
        let rejection = self.auth_rejection.lock().clone();
        if let Some(reason) = rejection {
            let _ = end.send(&FeederMessage::ServiceResponse(
                ServiceResponse::AuthFailure { reason },
            ));
            return Err("authentication rejected".into());
        }
        send(end, FeederMessage::ServiceResponse(ServiceResponse::Accepted))?;

        match self.expect_message(end, "protocol version")? {
            ClientMessage::ProtocolVersion { .. } => {}
            other => return Err(format!("expected protocol version, got {}", other.kind())),
        }
        let version = self.protocol_version.load(Ordering::Acquire);
        send(end, FeederMessage::ProtocolVersion { version })?;

        let request = match self.expect_message(end, "syncup request")? {
            ClientMessage::SyncupRequest(request) => request,
            other => return Err(format!("expected syncup request, got {}", other.kind())),
        };
        self.syncups.lock().push(request.clone());
        self.syncup(session, &request)
    }

    /// Answers a syncup and streams the backlog. Holding the log lock while
    /// the session turns streaming keeps concurrent appends in order.
    fn syncup(&self, session: &Session, request: &SyncupRequest) -> Result<(), String> {
        let end = &session.end;
        let log = self.log.lock();
        let first = *self.first_available.lock();
        let last = log.last().map_or(Vlsn::NULL, |(v, _)| *v);

        let start = match request.mode {
            StreamMode::Now => last.next(),
            StreamMode::Available => request.start_vlsn.max(first),
            StreamMode::Exact | StreamMode::Resume => request.start_vlsn,
        };
        if start < first || start > last.next() {
            let _ = end.send(&FeederMessage::LogNotAvailable { first, last });
            return Err(format!("start {start} outside log [{first}, {last}]"));
        }

        send(
            end,
            FeederMessage::SyncupResponse {
                start_vlsn: start,
                partition_generation: Some(1),
            },
        )?;
        let id = self.next_heartbeat.fetch_add(1, Ordering::AcqRel);
        send(end, FeederMessage::Heartbeat(make_heartbeat(id, last)))?;

        for (vlsn, record) in log.iter().filter(|(v, _)| *v >= start) {
            let entry = Entry::new(*vlsn, record).map_err(|e| e.to_string())?;
            send(end, FeederMessage::Entry(entry))?;
        }
        session.streaming.store(true, Ordering::Release);
        debug!(%start, mode = ?request.mode, "session streaming");
        Ok(())
    }

    fn expect_message(&self, end: &FeederEnd, waiting_for: &str) -> Result<ClientMessage, String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if end.is_closed() {
                return Err(format!("closed while waiting for {waiting_for}"));
            }
            if let Some(message) = end.recv(SESSION_POLL) {
                return Ok(message);
            }
        }
        Err(format!("no {waiting_for}"))
    }
}

fn send(end: &FeederEnd, message: FeederMessage) -> Result<(), String> {
    end.send(&message).map_err(|e| e.to_string())
}

fn make_heartbeat(id: u64, last: Vlsn) -> Heartbeat {
    Heartbeat {
        heartbeat_id: id,
        master_now_ms: 10_000 + id,
        current_txn_end_vlsn: last,
        last_filter_vlsn: Vlsn::NULL,
        last_pass_vlsn: last,
        last_mod_time_ms: 9_000,
        last_commit_time_ms: 9_500,
    }
}

impl Connector for SimulatedFeeder {
    fn connect(
        &self,
        address: &FeederAddress,
        _options: &ConnectOptions,
    ) -> io::Result<Arc<dyn FeederChannel>> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let feeder = self
            .this
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "feeder dropped"))?;
        if self.refusing.load(Ordering::Acquire) {
            debug!(attempt, %address, "refusing connection");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{address} refused the connection"),
            ));
        }

        let (client, end) = memory_pair(self.max_frame_size);
        let session = Arc::new(Session {
            end,
            streaming: AtomicBool::new(false),
        });
        self.links.lock().push(client.state());
        self.sessions.lock().push(session.clone());

        thread::Builder::new()
            .name("simulated-feeder".into())
            .spawn(move || feeder.serve(session))?;
        debug!(attempt, %address, "connection accepted");
        Ok(Arc::new(client))
    }
}
