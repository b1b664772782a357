use crate::logging::{self, Logger};
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use crate::net::stream::{Origin, Stream, StreamId, StreamKind, StreamState};
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Client listener readiness.
pub const CLIENT_TOKEN: Token = Token(0);
/// Backend listener readiness.
pub const BACKEND_TOKEN: Token = Token(1);
/// Signal watcher readiness; the watcher itself is owned by the supervisor.
pub const SIGNAL_TOKEN: Token = Token(2);

const TOKEN_OFFSET: usize = 3;

const EVENTS_CAPACITY: usize = 1024;

/// Initiated connections that never leave the connecting state are cut
/// after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single readiness observation, copied out of the mio event so the
/// caller can dispatch without borrowing the event buffer.
#[derive(Debug, Copy, Clone)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Listener sockets plus the stream arena. The endpoint knows nothing
/// about packet semantics; it hands whole packets up and takes whole
/// packets down.
pub struct Endpoint {
    client_listener: TcpListener,
    backend_listener: TcpListener,

    poll: Poll,
    events: Events,

    streams: Vec<Stream>,
    free: Vec<StreamId>,
    live: IndexSet<StreamId>,

    log: Logger,
}

impl Endpoint {
    /// Bind both listeners and set up the poll. Addresses are
    /// `<ip>:<port>` strings.
    pub fn new(client_addr: &str, backend_addr: &str, log: &Logger) -> NetworkResult<Endpoint> {
        let poll = Poll::new()?;

        let mut client_listener = TcpListener::bind(client_addr.parse::<SocketAddr>()?)?;
        let mut backend_listener = TcpListener::bind(backend_addr.parse::<SocketAddr>()?)?;

        poll.registry()
            .register(&mut client_listener, CLIENT_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut backend_listener, BACKEND_TOKEN, Interest::READABLE)?;

        logging::info!(log, "listening";
                       "client" => client_addr,
                       "backend" => backend_addr);

        Ok(Endpoint {
            client_listener,
            backend_listener,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            streams: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            log: log.new(logging::o!()),
        })
    }

    /// Registry handle so the supervisor can hook its signal watcher onto
    /// the same poll.
    #[inline]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Bound client listener address (useful with port 0 in tests).
    #[inline]
    pub fn client_addr(&self) -> io::Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    /// Bound backend listener address.
    #[inline]
    pub fn backend_addr(&self) -> io::Result<SocketAddr> {
        self.backend_listener.local_addr()
    }

    /// One poll turn; readiness is copied out so the caller is free to
    /// mutate the endpoint while dispatching.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            })
            .collect())
    }

    #[inline]
    pub fn token_to_stream(token: Token) -> Option<StreamId> {
        if token.0 >= TOKEN_OFFSET {
            Some(token.0 - TOKEN_OFFSET)
        } else {
            None
        }
    }

    #[inline]
    fn stream_token(id: StreamId) -> Token {
        Token(id + TOKEN_OFFSET)
    }

    /// Accept every pending connection on the given listener. Fatal accept
    /// errors (handle exhaustion and friends) are surfaced so the
    /// supervisor can raise the process fault flag.
    pub fn accept(&mut self, kind: StreamKind) -> io::Result<Vec<StreamId>> {
        let mut accepted = Vec::new();
        let now = Instant::now();

        loop {
            let listener = match kind {
                StreamKind::Client => &self.client_listener,
                StreamKind::Backend => &self.backend_listener,
            };

            match listener.accept() {
                Ok((sock, peer)) => {
                    let id = self.install(sock, kind, StreamState::Open, now)?;

                    logging::debug!(self.log, "connection accepted";
                                    "stream_id" => id,
                                    "kind" => ?kind,
                                    "peer" => %peer);

                    accepted.push(id);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(accepted)
    }

    /// Initiate a backend connection. The stream shows up as connecting
    /// until the socket reports writable.
    pub fn connect(&mut self, address: &str, port: u16) -> NetworkResult<StreamId> {
        let addr = (address, port)
            .to_socket_addrs()
            .map_err(NetworkError::from)?
            .next()
            .ok_or(NetworkError::Fatal(ErrorType::AddrParse))?;

        let sock = TcpStream::connect(addr)?;
        let now = Instant::now();

        let id = self
            .install(sock, StreamKind::Backend, StreamState::Connecting(now), now)
            .map_err(NetworkError::from)?;

        logging::debug!(self.log, "connecting";
                        "stream_id" => id,
                        "peer" => %addr);

        Ok(id)
    }

    /// Retrieve an existing slot or grow the arena, then register the
    /// socket on the poll.
    fn install(
        &mut self,
        sock: TcpStream,
        kind: StreamKind,
        state: StreamState,
        now: Instant,
    ) -> io::Result<StreamId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.streams.len();
                self.streams.push(Stream::new(&self.log));
                id
            }
        };

        self.streams[id].open(id, sock, kind, state, now);

        if let Err(err) = self.streams[id].register(self.poll.registry(), Self::stream_token(id)) {
            logging::error!(self.log, "stream registration failed";
                            "stream_id" => id,
                            "error" => ?err);

            self.streams[id].close();
            self.free.push(id);

            return Err(io::ErrorKind::Other.into());
        }

        self.live.insert(id);

        Ok(id)
    }

    #[inline]
    pub fn stream(&self, id: StreamId) -> &Stream {
        &self.streams[id]
    }

    #[inline]
    pub fn stream_mut(&mut self, id: StreamId) -> &mut Stream {
        &mut self.streams[id]
    }

    /// Whether the slot currently holds a live stream.
    #[inline]
    pub fn is_live(&self, id: StreamId) -> bool {
        self.live.contains(&id)
    }

    pub fn live_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.live.iter().copied()
    }

    /// Release every hold on the stream and recycle the slot. Returns the
    /// origin that was bound to it so the caller can unhook the server or
    /// user side.
    pub fn close_stream(&mut self, id: StreamId) -> Origin {
        if !self.live.swap_remove(&id) {
            return Origin::None;
        }

        let stream = &mut self.streams[id];
        let origin = stream.origin.clone();

        drop(stream.deregister(self.poll.registry()));

        // Base hold plus the authentication hold, when bound.
        stream.decref();
        if origin != Origin::None && !stream.is_disconnected() {
            stream.decref();
        }

        // Whatever holds remain are gone too; the socket is.
        if !stream.is_disconnected() {
            stream.close();
        }

        self.free.push(id);

        logging::debug!(self.log, "stream released"; "stream_id" => id, "origin" => ?origin);

        origin
    }

    /// Connecting streams that exceeded the connect timeout.
    pub fn stale_connects(&self, now: Instant) -> Vec<StreamId> {
        self.live
            .iter()
            .copied()
            .filter(|&id| {
                self.streams[id]
                    .connecting_elapsed(now)
                    .map(|elapsed| elapsed >= CONNECT_TIMEOUT)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Open streams that never authenticated and have gone quiet; the
    /// housekeeping sweep reclaims them.
    pub fn stale_unauthenticated(&self, now: Instant, timeout: Duration) -> Vec<StreamId> {
        self.live
            .iter()
            .copied()
            .filter(|&id| {
                let stream = &self.streams[id];
                stream.state() == StreamState::Open
                    && stream.origin == Origin::None
                    && stream.last_ingress_elapsed(now) >= timeout
            })
            .collect()
    }

    /// Close every live stream. Forced-shutdown path.
    pub fn close_all(&mut self) -> Vec<Origin> {
        let ids: Vec<StreamId> = self.live.iter().copied().collect();

        ids.into_iter().map(|id| self.close_stream(id)).collect()
    }

    /// Adopt an already-connected std socket into the arena. Test rigs
    /// use this to skip the accept path.
    #[cfg(test)]
    pub(crate) fn adopt_for_tests(
        &mut self,
        sock: std::net::TcpStream,
        kind: StreamKind,
    ) -> StreamId {
        sock.set_nonblocking(true).unwrap();
        let sock = TcpStream::from_std(sock);

        self.install(sock, kind, StreamState::Open, Instant::now())
            .unwrap()
    }
}
