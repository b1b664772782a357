use crate::logging::{self, Logger};
use crate::net::buffer::Buffer;
use crate::net::pkg::{self, Pkg};
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::net::Shutdown;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub type StreamId = usize;

const READ_BUF_SIZE: usize = 8 * 65536;
const WRITE_BUF_SIZE: usize = 8 * 65536;

/// Queued egress beyond this marks the peer queue-full; draining below it
/// clears the mark again.
pub const QUEUE_FULL_THRESHOLD: usize = 4 * 65536;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamKind {
    /// Accepted on the client port; authenticates as a user.
    Client,
    /// Peer traffic: accepted on the backend port or initiated by us.
    Backend,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Disconnected,
    /// Initiated socket waiting for the connect to finish.
    Connecting(Instant),
    Open,
}

/// Who the peer turned out to be, set during authentication. A lookup key,
/// never a strong reference: servers are owned by their database.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Origin {
    None,
    User(String),
    Server(Uuid),
}

/// One duplex byte channel in the endpoint arena. Owns its buffers for the
/// lifetime of the slot; sockets come and go as the slot is recycled.
pub struct Stream {
    id: Option<StreamId>,
    sock: Option<TcpStream>,
    kind: StreamKind,
    state: StreamState,
    refs: u16,

    pub origin: Origin,
    /// Database this stream authenticated against.
    pub dbname: Option<String>,

    read_buffer: Buffer,
    write_buffer: Buffer,

    last_ingress: Instant,
    last_egress: Instant,

    log: Logger,
}

impl Stream {
    #[inline]
    pub fn new(log: &Logger) -> Stream {
        let now = Instant::now();

        Stream {
            id: None,
            sock: None,
            kind: StreamKind::Client,
            state: StreamState::Disconnected,
            refs: 0,
            origin: Origin::None,
            dbname: None,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            last_ingress: now,
            last_egress: now,
            log: log.new(logging::o!()),
        }
    }

    /// Bind a fresh socket to this slot. The slot must be disconnected.
    pub fn open(
        &mut self,
        id: StreamId,
        sock: TcpStream,
        kind: StreamKind,
        state: StreamState,
        now: Instant,
    ) {
        if self.state != StreamState::Disconnected {
            panic!("Attempted to open an already open stream slot");
        }

        self.id = Some(id);
        self.sock = Some(sock);
        self.kind = kind;
        self.state = state;
        self.refs = 1;
        self.origin = Origin::None;
        self.dbname = None;
        self.last_ingress = now;
        self.last_egress = now;

        logging::debug!(self.log, "stream opened";
                        "stream_id" => id,
                        "kind" => ?kind,
                        "state" => ?state);
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.state == StreamState::Disconnected
    }

    #[inline]
    pub fn is_connecting(&self) -> bool {
        matches!(self.state, StreamState::Connecting(_))
    }

    /// Promote a connecting socket once the connect completed. Surfaces a
    /// deferred connect error, if any.
    pub fn finish_connect(&mut self) -> NetworkResult<()> {
        let sock = self.sock.as_ref().ok_or(NetworkError::Fatal(ErrorType::NotConnected))?;

        if let Some(err) = sock.take_error()? {
            return Err(err.into());
        }

        // A connect that is still in flight reports ENOTCONN here; keep
        // waiting for the next writable event.
        match sock.peer_addr() {
            Ok(_) => {
                self.state = StreamState::Open;
                logging::debug!(self.log, "connect finished"; "stream_id" => self.id);
                Ok(())
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::NotConnected => {
                Err(NetworkError::Wait)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Time spent in the connecting state, for handshake timeouts.
    pub fn connecting_elapsed(&self, now: Instant) -> Option<Duration> {
        match self.state {
            StreamState::Connecting(since) => Some(now.duration_since(since)),
            _ => None,
        }
    }

    #[inline]
    pub fn incref(&mut self) {
        self.refs += 1;
    }

    /// Drop one hold; returns true when this was the last one and the slot
    /// has been released.
    #[inline]
    pub fn decref(&mut self) -> bool {
        self.refs = self.refs.saturating_sub(1);

        if self.refs == 0 && self.state != StreamState::Disconnected {
            self.close();
            return true;
        }

        self.refs == 0
    }

    /// Tear the slot down: best-effort flush of queued egress, socket
    /// shutdown, buffers cleared.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing stream";
                        "stream_id" => self.id,
                        "origin" => ?self.origin,
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len(),
                        "last_ingress" => ?self.last_ingress,
                        "last_egress" => ?self.last_egress);

        if let Some(sock) = self.sock.as_mut() {
            if !self.write_buffer.is_empty() {
                drop(self.write_buffer.egress(sock));
            }
        }

        self.read_buffer.clear();
        self.write_buffer.clear();

        if let Some(sock) = self.sock.take() {
            drop(sock.shutdown(Shutdown::Both));
        }

        self.id = None;
        self.refs = 0;
        self.origin = Origin::None;
        self.dbname = None;
        self.state = StreamState::Disconnected;
    }

    /// Register this stream's socket on the poll.
    pub fn register(&mut self, registry: &Registry, token: Token) -> NetworkResult<()> {
        let sock = self
            .sock
            .as_mut()
            .ok_or(NetworkError::Fatal(ErrorType::NotConnected))?;

        registry
            .register(sock, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(Into::into)
    }

    pub fn deregister(&mut self, registry: &Registry) -> NetworkResult<()> {
        let sock = self
            .sock
            .as_mut()
            .ok_or(NetworkError::Fatal(ErrorType::NotConnected))?;

        registry.deregister(sock).map_err(Into::into)
    }

    /// Queue one whole packet for transmission. Frames are appended in
    /// submission order and never interleaved.
    #[inline]
    pub fn submit(&mut self, pkg: &Pkg) -> NetworkResult<()> {
        self.submit_frame(pkg.pid, pkg.tp, &pkg.data)
    }

    pub fn submit_frame(&mut self, pid: u16, tp: u8, data: &[u8]) -> NetworkResult<()> {
        if self.state == StreamState::Disconnected {
            return Err(NetworkError::Fatal(ErrorType::NotConnected));
        }

        logging::trace!(self.log, "queueing frame";
                        "stream_id" => self.id,
                        "pid" => pid,
                        "tp" => tp,
                        "payload_size" => data.len(),
                        "queued" => self.write_buffer.len());

        pkg::encode_frame(&mut self.write_buffer, pid, tp, data)
    }

    /// Bytes queued but not yet handed to the kernel.
    #[inline]
    pub fn queued_egress(&self) -> usize {
        self.write_buffer.len()
    }

    /// Read whatever the socket has and decode whole packets out of it.
    /// Loops so that a full buffer drained by decoding picks up the
    /// remaining kernel bytes in the same readiness event.
    pub fn receive(&mut self, now: Instant) -> NetworkResult<Vec<Pkg>> {
        let mut pkgs = Vec::new();

        loop {
            let received = {
                let sock = self
                    .sock
                    .as_mut()
                    .ok_or(NetworkError::Fatal(ErrorType::NotConnected))?;
                self.read_buffer.ingress(sock)
            };

            let received = match received {
                Ok(n) => n,
                Err(err) => {
                    // Decode what we already have before surfacing the
                    // error; the caller closes the stream either way.
                    self.decode_pending(&mut pkgs)?;
                    return Err(err.into());
                }
            };

            if received > 0 {
                self.last_ingress = now;
            }

            self.decode_pending(&mut pkgs)?;

            // Stopped short of a full buffer: the socket is drained.
            if self.read_buffer.free_capacity() > 0 {
                return Ok(pkgs);
            }
        }
    }

    fn decode_pending(&mut self, pkgs: &mut Vec<Pkg>) -> NetworkResult<()> {
        loop {
            match Pkg::decode(self.read_buffer.data()) {
                Ok(Some((pkg, consumed))) => {
                    self.read_buffer.consume(consumed);

                    logging::trace!(self.log, "frame received";
                                    "stream_id" => self.id,
                                    "pid" => pkg.pid,
                                    "tp" => pkg.tp,
                                    "payload_size" => pkg.data.len());

                    pkgs.push(pkg);
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    logging::warn!(self.log, "protocol error on stream";
                                   "stream_id" => self.id,
                                   "error" => ?err);
                    return Err(NetworkError::Fatal(err));
                }
            }
        }
    }

    /// Push queued egress to the kernel.
    pub fn flush(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let sock = self
            .sock
            .as_mut()
            .ok_or(NetworkError::Fatal(ErrorType::NotConnected))?;

        let sent = match self.write_buffer.egress(sock) {
            Ok(n) => n,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // Partial write; the buffer head already advanced past
                // whatever the kernel took.
                self.last_egress = now;
                return Err(NetworkError::Wait);
            }
            Err(err) => return Err(err.into()),
        };

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// Time since the peer last sent us anything.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }
}
