//! Process lifecycle: the supervisor owning the event loop, the hosted
//! databases and the signal-driven shutdown path.
//!
//! The loop is single-threaded and tick-driven. There is no timer wheel;
//! every turn computes the nearest deadline (promise expiry, heartbeat,
//! housekeeping, drain tick) and polls with that as the timeout, then
//! fires whatever came due. Shutdown arms a bounded drain: a tick every
//! three seconds, forty attempts, then a forced close.

use crate::cluster::auth;
use crate::cluster::database::Database;
use crate::cluster::flags;
use crate::cluster::promise::{CancelReason, Outcome, PromiseCb, DEFAULT_TIMEOUT, ONLY_CHECK_ONLINE};
use crate::logging::{self, Logger};
use crate::net::endpoint::{Endpoint, Ready, BACKEND_TOKEN, CLIENT_TOKEN, SIGNAL_TOKEN};
use crate::net::pkg::Pkg;
use crate::net::shared::{ErrorUtils, NetworkError};
use crate::net::stream::{Origin, StreamId, StreamKind, QUEUE_FULL_THRESHOLD};
use crate::protocol::{ClientAuthReq, FlagsUpdate, ServerAuthReq, Tp};
use crate::{DB_VERSION, MIN_SUPPORTED_VERSION};
use mio::{Interest, Token};
use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Drain tick period times attempts bounds shutdown at two minutes.
pub const CLOSE_INTERVAL: Duration = Duration::from_secs(3);
pub const CLOSE_ATTEMPTS: u32 = 40;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted streams must authenticate within this budget or be
/// reclaimed.
const AUTH_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Loading,
    Running,
    Closing,
}

/// Why the process is going down with a non-zero exit code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// The drain budget ran out with work still outstanding.
    CloseTimeoutReached,
    /// A second signal arrived while we were already closing.
    CloseEnforced,
    /// Allocation or handle exhaustion forced the shutdown.
    Resource,
}

/// Bounded-drain bookkeeping.
struct Drain {
    attempts_left: u32,
    next_tick: Instant,
}

enum DrainVerdict {
    Waiting(usize),
    Close,
    TimeoutClose,
}

/// One drain tick: burn an attempt, decide whether to keep waiting.
fn drain_step(drain: &mut Drain, outstanding: usize, now: Instant) -> DrainVerdict {
    drain.next_tick = now + CLOSE_INTERVAL;
    drain.attempts_left = drain.attempts_left.saturating_sub(1);

    if drain.attempts_left == 0 && outstanding > 0 {
        return DrainVerdict::TimeoutClose;
    }

    if outstanding == 0 {
        DrainVerdict::Close
    } else {
        DrainVerdict::Waiting(outstanding)
    }
}

/// Deferred work produced inside promise callbacks and applied on the
/// loop between dispatch rounds.
enum Action {
    HandshakeDone {
        dbname: String,
        uuid: Uuid,
        ok: bool,
        detail: &'static str,
    },
}

type Actions = Rc<RefCell<VecDeque<Action>>>;

/// The supervisor: event loop, databases, signal watcher and lifecycle
/// state, threaded explicitly through everything that needs it.
pub struct Siri {
    pub status: Status,
    pub fault: Option<Fault>,

    endpoint: Endpoint,
    dbs: Vec<Database>,
    signals: Signals,
    actions: Actions,

    drain: Option<Drain>,
    stopped: bool,

    next_heartbeat: Instant,
    next_housekeeping: Instant,
    started_at: Instant,

    log: Logger,
}

impl Siri {
    /// Wire the signal watcher onto the endpoint's poll and assemble the
    /// supervisor. Databases come in already loaded.
    pub fn new(endpoint: Endpoint, dbs: Vec<Database>, log: &Logger) -> io::Result<Siri> {
        if dbs.len() > crate::MAX_NUMBER_DB {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("no more than {} databases per process", crate::MAX_NUMBER_DB),
            ));
        }

        let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGPIPE])?;

        endpoint
            .registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let now = Instant::now();

        Ok(Siri {
            status: Status::Loading,
            fault: None,
            endpoint,
            dbs,
            signals,
            actions: Rc::new(RefCell::new(VecDeque::new())),
            drain: None,
            stopped: false,
            next_heartbeat: now,
            next_housekeeping: now + HOUSEKEEPING_INTERVAL,
            started_at: now,
            log: log.new(logging::o!("unit" => "siri")),
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Mark the process running: local servers get the RUNNING bit and
    /// the group evaluators leave INIT.
    pub fn set_running(&mut self) {
        self.status = Status::Running;

        for db in self.dbs.iter_mut() {
            if let Some(local) = db.local_server_mut() {
                local.flags |= flags::RUNNING;
                local.startup_time = crate::time::timestamp_secs();
            }
            db.groups.start();
        }

        logging::info!(self.log, "running";
                       "databases" => self.dbs.len(),
                       "startup_ms" => self.started_at.elapsed().as_millis() as u64);
    }

    /// Drive the loop until shutdown completes. Returns the process exit
    /// code.
    pub fn run(&mut self) -> i32 {
        self.set_running();

        while !self.stopped {
            self.turn();
        }

        match self.fault {
            None => 0,
            Some(fault) => {
                logging::error!(self.log, "exiting with fault"; "fault" => ?fault);
                1
            }
        }
    }

    /// One loop turn: poll, dispatch readiness, apply deferred actions,
    /// fire due deadlines, drain worker results.
    pub fn turn(&mut self) {
        let timeout = self.poll_timeout(Instant::now());

        let readiness = match self.endpoint.poll(Some(timeout)) {
            Ok(readiness) => readiness,
            Err(err) => {
                logging::crit!(self.log, "event loop poll failed"; "error" => %err);
                self.resource_fault();
                return;
            }
        };

        for ready in readiness {
            self.handle_ready(ready);
        }

        self.drain_actions();
        self.tick(Instant::now());

        for db in self.dbs.iter_mut() {
            db.groups.apply_events();
            db.groups.join();
        }
    }

    /// Nearest deadline bounds the poll timeout.
    fn poll_timeout(&self, now: Instant) -> Duration {
        let mut deadline = now + HOUSEKEEPING_INTERVAL;

        if self.next_housekeeping < deadline {
            deadline = self.next_housekeeping;
        }
        if self.next_heartbeat < deadline {
            deadline = self.next_heartbeat;
        }
        if let Some(drain) = self.drain.as_ref() {
            if drain.next_tick < deadline {
                deadline = drain.next_tick;
            }
        }
        for db in self.dbs.iter() {
            for server in db.servers.values() {
                if let Some(promise_deadline) = server.promises.next_deadline() {
                    if promise_deadline < deadline {
                        deadline = promise_deadline;
                    }
                }
            }
        }

        deadline.saturating_duration_since(now)
    }

    fn handle_ready(&mut self, ready: Ready) {
        match ready.token {
            CLIENT_TOKEN => self.accept(StreamKind::Client),
            BACKEND_TOKEN => self.accept(StreamKind::Backend),
            SIGNAL_TOKEN => self.handle_signals(),
            token => self.handle_stream_ready(token, ready),
        }
    }

    fn accept(&mut self, kind: StreamKind) {
        if let Err(err) = self.endpoint.accept(kind) {
            logging::crit!(self.log, "accept failed"; "kind" => ?kind, "error" => %err);
            self.resource_fault();
        }
    }

    fn handle_stream_ready(&mut self, token: Token, ready: Ready) {
        let id = match Endpoint::token_to_stream(token) {
            Some(id) => id,
            None => return,
        };

        if !self.endpoint.is_live(id) {
            return;
        }

        let now = Instant::now();

        if ready.readable {
            match self.endpoint.stream_mut(id).receive(now) {
                Ok(pkgs) => {
                    for pkg in pkgs {
                        if !self.endpoint.is_live(id) {
                            // A handler closed the stream mid-batch.
                            break;
                        }
                        self.dispatch(id, pkg);
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "stream read failed";
                                    "stream_id" => id,
                                    "error" => ?err);
                    self.close_stream(id);
                    return;
                }
            }
        }

        if !self.endpoint.is_live(id) {
            return;
        }

        if ready.writable {
            if self.endpoint.stream(id).is_connecting() {
                self.finish_connect(id, now);
            }

            if self.endpoint.is_live(id)
                && self.endpoint.stream_mut(id).flush(now).has_failed()
            {
                self.close_stream(id);
                return;
            }

            self.update_queue_observation(id);
        }
    }

    /// An initiated backend socket became writable: the connect finished,
    /// one way or the other. On success the handshake goes out.
    fn finish_connect(&mut self, id: StreamId, now: Instant) {
        match self.endpoint.stream_mut(id).finish_connect() {
            Ok(()) => self.send_handshake(id, now),
            Err(NetworkError::Wait) => {}
            Err(err) => {
                logging::warn!(self.log, "backend connect failed";
                               "stream_id" => id,
                               "error" => ?err);
                self.close_stream(id);
            }
        }
    }

    /// Issue the backend handshake over a freshly connected stream. This
    /// bypasses the online/available gates on purpose; nothing is
    /// authenticated yet.
    fn send_handshake(&mut self, id: StreamId, now: Instant) {
        let (uuid, dbname) = match (
            self.endpoint.stream(id).origin.clone(),
            self.endpoint.stream(id).dbname.clone(),
        ) {
            (Origin::Server(uuid), Some(dbname)) => (uuid, dbname),
            _ => {
                logging::error!(self.log, "connected stream without a server origin";
                                "stream_id" => id);
                self.close_stream(id);
                return;
            }
        };

        let payload = rmp_serde::to_vec_named(&ServerAuthReq {
            uuid: uuid.as_bytes().to_vec(),
            dbname: dbname.clone(),
            version: DB_VERSION.to_string(),
            min_version: MIN_SUPPORTED_VERSION.to_string(),
        });

        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                logging::error!(self.log, "handshake encode failed"; "error" => %err);
                self.close_stream(id);
                return;
            }
        };

        let cb = handshake_cb(&self.actions, dbname.clone(), uuid);

        let Siri { endpoint, dbs, log, .. } = self;

        let server = match dbs
            .iter_mut()
            .find(|db| db.name == dbname)
            .and_then(|db| db.servers.get_mut(&uuid))
        {
            Some(server) => server,
            None => {
                logging::warn!(log, "handshake target vanished"; "uuid" => %uuid);
                self.close_stream(id);
                return;
            }
        };

        let pid = match server.promises.register(now + HANDSHAKE_TIMEOUT, cb) {
            Ok(pid) => pid,
            Err(_) => {
                logging::error!(log, "no free pid for the handshake"; "uuid" => %uuid);
                self.close_stream(id);
                return;
            }
        };

        let submitted = endpoint
            .stream_mut(id)
            .submit_frame(pid, Tp::ReqServerAuth.into(), &payload);

        if submitted.has_failed() {
            server.promises.complete(pid, Outcome::WriteError);
            self.close_stream(id);
            return;
        }

        drop(endpoint.stream_mut(id).flush(now));

        logging::debug!(self.log, "handshake sent";
                        "stream_id" => id,
                        "server" => %uuid,
                        "pid" => pid);
    }

    /// Route one inbound packet: replies complete promises, requests get
    /// handlers, anything unknown is a protocol error.
    fn dispatch(&mut self, id: StreamId, pkg: Pkg) {
        let tp = match Tp::try_from(pkg.tp) {
            Ok(tp) => tp,
            Err(unknown) => {
                logging::warn!(self.log, "unknown message type, closing stream";
                               "stream_id" => id,
                               "tp" => unknown);
                self.close_stream(id);
                return;
            }
        };

        if tp.is_response() {
            self.on_response(id, pkg);
            return;
        }

        // Each listener speaks its own half of the protocol.
        let kind = self.endpoint.stream(id).kind();

        match (tp, kind) {
            (Tp::ReqClientAuth, StreamKind::Client) => self.on_client_auth(id, pkg),
            (Tp::ReqServerAuth, StreamKind::Backend) => self.on_server_auth(id, pkg),
            (Tp::ReqFlagsUpdate, StreamKind::Backend) => self.on_flags_update(id, pkg),
            (Tp::ReqPing, _) => {
                self.reply(id, Pkg::new(pkg.pid, Tp::ResAck.into(), Vec::new()))
            }
            (tp, kind) => {
                logging::warn!(self.log, "request on the wrong stream kind";
                               "stream_id" => id,
                               "tp" => ?tp,
                               "kind" => ?kind);
                self.close_stream(id);
            }
        }
    }

    /// A reply: find the owning server through the stream's origin and
    /// settle the matching promise. A reply nobody waits for is dropped.
    fn on_response(&mut self, id: StreamId, pkg: Pkg) {
        let (origin, dbname) = {
            let stream = self.endpoint.stream(id);
            (stream.origin.clone(), stream.dbname.clone())
        };

        let uuid = match origin {
            Origin::Server(uuid) => uuid,
            _ => {
                logging::warn!(self.log, "reply on an unauthenticated stream";
                               "stream_id" => id,
                               "tp" => pkg.tp);
                self.close_stream(id);
                return;
            }
        };

        let server = dbname
            .and_then(|dbname| self.dbs.iter_mut().find(|db| db.name == dbname))
            .and_then(|db| db.servers.get_mut(&uuid));

        let completed = match server {
            Some(server) => {
                let pid = pkg.pid;
                server.promises.complete(pid, Outcome::Reply(pkg))
            }
            None => false,
        };

        if !completed {
            logging::debug!(self.log, "late or unsolicited reply dropped";
                            "stream_id" => id);
        }
    }

    fn on_client_auth(&mut self, id: StreamId, pkg: Pkg) {
        let req: ClientAuthReq = match rmp_serde::from_slice(&pkg.data) {
            Ok(req) => req,
            Err(err) => {
                logging::warn!(self.log, "malformed client auth payload"; "error" => %err);
                self.reply(
                    id,
                    Pkg::err(pkg.pid, Tp::ErrInvalidRequest.into(), "invalid auth request"),
                );
                return;
            }
        };

        let Siri { endpoint, dbs, log, .. } = self;
        let tp = auth::client_auth(dbs, endpoint.stream_mut(id), &req, log);

        // Client streams stay open on failure so the user can retry.
        self.reply(id, Pkg::new(pkg.pid, tp.into(), Vec::new()));
    }

    fn on_server_auth(&mut self, id: StreamId, pkg: Pkg) {
        let req: ServerAuthReq = match rmp_serde::from_slice(&pkg.data) {
            Ok(req) => req,
            Err(err) => {
                logging::warn!(self.log, "malformed handshake payload"; "error" => %err);
                self.reply(
                    id,
                    Pkg::err(pkg.pid, Tp::ErrInvalidRequest.into(), "invalid handshake"),
                );
                self.close_stream(id);
                return;
            }
        };

        let Siri { endpoint, dbs, log, .. } = self;
        let tp = auth::server_auth(dbs, endpoint.stream_mut(id), &req, log);

        self.reply(id, Pkg::new(pkg.pid, tp.into(), Vec::new()));

        // Backend auth failures close the stream; the reply rides out on
        // the close-time flush.
        if tp != Tp::ResServerAuthSuccess {
            self.close_stream(id);
        }
    }

    fn on_flags_update(&mut self, id: StreamId, pkg: Pkg) {
        let (origin, dbname) = {
            let stream = self.endpoint.stream(id);
            (stream.origin.clone(), stream.dbname.clone())
        };

        let uuid = match origin {
            Origin::Server(uuid) => uuid,
            _ => {
                logging::warn!(self.log, "flags update on an unauthenticated stream";
                               "stream_id" => id);
                self.close_stream(id);
                return;
            }
        };

        let update: FlagsUpdate = match rmp_serde::from_slice(&pkg.data) {
            Ok(update) => update,
            Err(err) => {
                logging::warn!(self.log, "malformed flags payload"; "error" => %err);
                self.close_stream(id);
                return;
            }
        };

        if let Some(server) = dbname
            .and_then(|dbname| self.dbs.iter_mut().find(|db| db.name == dbname))
            .and_then(|db| db.servers.get_mut(&uuid))
        {
            server.update_flags(update.flags);
        }

        self.reply(id, Pkg::new(pkg.pid, Tp::ResAck.into(), Vec::new()));
    }

    /// Queue a reply and push it toward the kernel right away.
    fn reply(&mut self, id: StreamId, pkg: Pkg) {
        if !self.endpoint.is_live(id) {
            return;
        }

        let now = Instant::now();
        let stream = self.endpoint.stream_mut(id);

        if stream.submit(&pkg).has_failed() || stream.flush(now).has_failed() {
            logging::warn!(self.log, "reply submission failed";
                           "stream_id" => id,
                           "tp" => pkg.tp);
            self.close_stream(id);
        }
    }

    /// Apply deferred promise-callback work.
    fn drain_actions(&mut self) {
        loop {
            let action = match self.actions.borrow_mut().pop_front() {
                Some(action) => action,
                None => break,
            };

            match action {
                Action::HandshakeDone {
                    dbname,
                    uuid,
                    ok,
                    detail,
                } => self.on_handshake_done(&dbname, uuid, ok, detail),
            }
        }
    }

    fn on_handshake_done(&mut self, dbname: &str, uuid: Uuid, ok: bool, detail: &'static str) {
        let server = self
            .dbs
            .iter_mut()
            .find(|db| db.name == dbname)
            .and_then(|db| db.servers.get_mut(&uuid));

        let server = match server {
            Some(server) => server,
            None => return,
        };

        if ok {
            server.set_observation(flags::AUTHENTICATED, true);
            logging::info!(self.log, "authenticated against peer";
                           "server" => %uuid,
                           "db" => dbname,
                           "liveness" => ?server.liveness());
        } else {
            let stream = server.stream.take();

            logging::warn!(self.log, "handshake with peer failed";
                           "server" => %uuid,
                           "db" => dbname,
                           "detail" => detail);

            if let Some(id) = stream {
                self.close_stream(id);
            }
        }
    }

    /// Fire everything that came due: promise expiry every turn, stale
    /// connects and heartbeat on their intervals, drain ticks while
    /// closing.
    fn tick(&mut self, now: Instant) {
        for db in self.dbs.iter_mut() {
            for server in db.servers.values_mut() {
                server.promises.expire_due(now);
            }
        }

        if now >= self.next_housekeeping {
            self.next_housekeeping = now + HOUSEKEEPING_INTERVAL;

            for id in self.endpoint.stale_connects(now) {
                logging::warn!(self.log, "backend connect timed out"; "stream_id" => id);
                self.close_stream(id);
            }

            for id in self.endpoint.stale_unauthenticated(now, AUTH_IDLE_TIMEOUT) {
                logging::debug!(self.log, "reclaiming idle unauthenticated stream";
                                "stream_id" => id);
                self.close_stream(id);
            }
        }

        if self.status == Status::Running && now >= self.next_heartbeat {
            self.next_heartbeat = now + HEARTBEAT_INTERVAL;
            self.heartbeat(now);
        }

        if let Some(drain) = self.drain.as_mut() {
            if now >= drain.next_tick {
                let outstanding = outstanding_work(&self.endpoint, &self.dbs);

                match drain_step(drain, outstanding, now) {
                    DrainVerdict::Waiting(count) => {
                        logging::info!(self.log, "closing, waiting for outstanding work";
                                       "count" => count);
                    }
                    DrainVerdict::Close => self.force_close(),
                    DrainVerdict::TimeoutClose => {
                        logging::error!(self.log, "close timeout reached with work remaining";
                                        "count" => outstanding);
                        self.fault.get_or_insert(Fault::CloseTimeoutReached);
                        self.force_close();
                    }
                }
            }
        }
    }

    /// Reconnect unconnected peers and broadcast our flag byte to the
    /// connected ones. Doubles as the keepalive.
    fn heartbeat(&mut self, now: Instant) {
        for db_index in 0..self.dbs.len() {
            let dbname = self.dbs[db_index].name.clone();
            let local_flags = self.dbs[db_index]
                .local_server()
                .map(|local| local.flags)
                .unwrap_or(0);

            for uuid in self.dbs[db_index].remote_uuids() {
                let (connected, address, port) = {
                    let server = &self.dbs[db_index].servers[&uuid];
                    (
                        server
                            .stream
                            .map(|id| self.endpoint.is_live(id))
                            .unwrap_or(false),
                        server.address.clone(),
                        server.port,
                    )
                };

                if !connected {
                    self.connect_server(db_index, uuid, &dbname, &address, port);
                } else {
                    self.broadcast_flags(db_index, uuid, local_flags, now);
                }
            }
        }
    }

    fn connect_server(
        &mut self,
        db_index: usize,
        uuid: Uuid,
        dbname: &str,
        address: &str,
        port: u16,
    ) {
        match self.endpoint.connect(address, port) {
            Ok(id) => {
                {
                    let stream = self.endpoint.stream_mut(id);
                    stream.origin = Origin::Server(uuid);
                    stream.dbname = Some(dbname.to_string());
                }

                if let Some(server) = self.dbs[db_index].servers.get_mut(&uuid) {
                    server.stream = Some(id);
                }

                logging::debug!(self.log, "connecting to peer";
                                "server" => %uuid,
                                "address" => address,
                                "port" => port);
            }
            Err(err) => {
                logging::warn!(self.log, "peer connect failed";
                               "server" => %uuid,
                               "address" => address,
                               "error" => ?err);
            }
        }
    }

    /// Send our local flag byte to one peer; the outcome only gets a log
    /// line.
    fn broadcast_flags(&mut self, db_index: usize, uuid: Uuid, local_flags: u8, now: Instant) {
        let payload = match rmp_serde::to_vec_named(&FlagsUpdate { flags: local_flags }) {
            Ok(payload) => payload,
            Err(err) => {
                logging::error!(self.log, "flags encode failed"; "error" => %err);
                return;
            }
        };

        let pkg = Pkg::new(0, Tp::ReqFlagsUpdate.into(), payload);

        let cb: PromiseCb = {
            let log = self.log.clone();
            Box::new(move |outcome| {
                logging::debug!(log, "flags broadcast settled"; "outcome" => outcome.label());
            })
        };

        let Siri { endpoint, dbs, .. } = self;

        let server = match dbs[db_index].servers.get_mut(&uuid) {
            Some(server) => server,
            None => return,
        };

        let stream_id = match server.stream.filter(|&id| endpoint.is_live(id)) {
            Some(id) => id,
            None => return,
        };

        match server.send_pkg(
            endpoint.stream_mut(stream_id),
            &pkg,
            DEFAULT_TIMEOUT,
            cb,
            ONLY_CHECK_ONLINE,
            now,
        ) {
            Ok(_) => {
                drop(endpoint.stream_mut(stream_id).flush(now));
            }
            Err((cb, reason)) => {
                logging::debug!(self.log, "flags broadcast skipped";
                                "server" => %uuid,
                                "reason" => ?reason);
                cb(Outcome::Unavailable);
            }
        }
    }

    fn handle_signals(&mut self) {
        let pending: Vec<i32> = self.signals.pending().collect();

        for signal in pending {
            if signal == SIGPIPE {
                logging::warn!(self.log, "SIGPIPE received, probably a connection was lost");
                continue;
            }

            if self.status == Status::Closing {
                logging::error!(self.log, "second signal received, stopping immediately";
                                "signal" => signal);
                self.fault.get_or_insert(Fault::CloseEnforced);
                self.force_close();
            } else {
                logging::warn!(self.log, "asked to stop"; "signal" => signal);
                self.begin_close(Instant::now());
            }
        }
    }

    /// First shutdown step: stop background work, clear RUNNING locally,
    /// tell the peers, then start the bounded drain.
    fn begin_close(&mut self, now: Instant) {
        self.status = Status::Closing;

        for db_index in 0..self.dbs.len() {
            self.dbs[db_index].groups.signal_stop();

            let local_flags = {
                let db = &mut self.dbs[db_index];
                match db.local_server_mut() {
                    Some(local) => {
                        local.flags &= !flags::RUNNING;
                        local.flags
                    }
                    None => continue,
                }
            };

            for uuid in self.dbs[db_index].remote_uuids() {
                self.broadcast_flags(db_index, uuid, local_flags, now);
            }
        }

        // First drain tick fires immediately.
        self.drain = Some(Drain {
            attempts_left: CLOSE_ATTEMPTS,
            next_tick: now,
        });
    }

    /// Allocation or handle exhaustion: note the fault and go through the
    /// orderly shutdown path.
    fn resource_fault(&mut self) {
        self.fault.get_or_insert(Fault::Resource);

        if self.status == Status::Closing {
            self.force_close();
        } else {
            self.begin_close(Instant::now());
        }
    }

    /// Tear everything down: cancel promises, close streams, reap or
    /// abandon workers, leave the loop.
    fn force_close(&mut self) {
        logging::warn!(self.log, "closing now");

        for db in self.dbs.iter_mut() {
            for server in db.servers.values_mut() {
                server.promises.cancel_all(CancelReason::Cancelled);
                server.stream = None;
            }

            db.groups.signal_stop();
            db.groups.join();
        }

        self.endpoint.close_all();

        self.stopped = true;
    }

    fn close_stream(&mut self, id: StreamId) {
        let origin = self.endpoint.close_stream(id);

        // Unhook the server side when this was its outbound stream.
        if let Origin::Server(uuid) = origin {
            for db in self.dbs.iter_mut() {
                if let Some(server) = db.servers.get_mut(&uuid) {
                    if server.stream == Some(id) {
                        server.stream = None;
                    }
                }
            }
        }
    }

    /// Mark or clear the queue-full observation for the peer behind an
    /// outbound stream.
    fn update_queue_observation(&mut self, id: StreamId) {
        let (origin, dbname, queued) = {
            let stream = self.endpoint.stream(id);
            (
                stream.origin.clone(),
                stream.dbname.clone(),
                stream.queued_egress(),
            )
        };

        let uuid = match origin {
            Origin::Server(uuid) => uuid,
            _ => return,
        };

        if let Some(server) = dbname
            .and_then(|dbname| self.dbs.iter_mut().find(|db| db.name == dbname))
            .and_then(|db| db.servers.get_mut(&uuid))
        {
            if server.stream == Some(id) {
                server.set_observation(flags::QUEUE_FULL, queued > QUEUE_FULL_THRESHOLD);
            }
        }
    }
}

/// Work that keeps the drain waiting: pending promises, undelivered
/// egress and group workers that have not closed yet.
fn outstanding_work(endpoint: &Endpoint, dbs: &[Database]) -> usize {
    let promises: usize = dbs
        .iter()
        .flat_map(|db| db.servers.values())
        .map(|server| server.promises.len())
        .sum();

    let egress = endpoint
        .live_streams()
        .filter(|&id| endpoint.stream(id).queued_egress() > 0)
        .count();

    let workers = dbs.iter().filter(|db| !db.groups.is_closed()).count();

    promises + egress + workers
}

fn handshake_cb(actions: &Actions, dbname: String, uuid: Uuid) -> PromiseCb {
    let actions = Rc::clone(actions);

    Box::new(move |outcome| {
        let (ok, detail) = match &outcome {
            Outcome::Reply(pkg) if pkg.tp == u8::from(Tp::ResServerAuthSuccess) => {
                (true, "accepted")
            }
            Outcome::Reply(pkg) => (false, reject_detail(pkg.tp)),
            other => (false, other.label()),
        };

        actions.borrow_mut().push_back(Action::HandshakeDone {
            dbname,
            uuid,
            ok,
            detail,
        });
    })
}

fn reject_detail(tp: u8) -> &'static str {
    match Tp::try_from(tp) {
        Ok(Tp::ErrServerAuthInvalidUuid) => "invalid uuid",
        Ok(Tp::ErrServerAuthVersionTooOld) => "version too old",
        Ok(Tp::ErrServerAuthVersionTooNew) => "version too new",
        Ok(Tp::ErrServerAuthUnknownDbname) => "unknown dbname",
        Ok(Tp::ErrServerAuthUnknownUuid) => "unknown uuid",
        _ => "unexpected reply",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::database::Database;
    use crate::net::pkg::Pkg;
    use hashbrown::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use tempfile::TempDir;

    const LOCAL: u128 = 1;

    fn test_siri() -> (Siri, TempDir) {
        let log = crate::logging::discard();
        let dir = tempfile::tempdir().unwrap();

        let endpoint = Endpoint::new("127.0.0.1:0", "127.0.0.1:0", &log).unwrap();

        let mut users = HashMap::new();
        users.insert("root".to_string(), "pw".to_string());

        let mut db = Database::open(
            "mydb",
            &dir.path().join("mydb"),
            Uuid::from_u128(LOCAL),
            users,
            &log,
        )
        .unwrap();
        db.register_server(Uuid::from_u128(LOCAL), "127.0.0.1".to_string(), 0, 0)
            .unwrap();

        let siri = Siri::new(endpoint, vec![db], &log).unwrap();

        (siri, dir)
    }

    /// Read one whole packet off a std socket, driving the supervisor
    /// between read attempts so replies actually get produced.
    fn read_reply(siri: &mut Siri, sock: &mut StdTcpStream) -> Pkg {
        sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let mut bytes = Vec::new();
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);

        while Instant::now() < deadline {
            siri.turn();

            match sock.read(&mut chunk) {
                Ok(0) => panic!("peer closed before replying"),
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {}", err),
            }

            if let Some((pkg, _)) = Pkg::decode(&bytes).unwrap() {
                return pkg;
            }
        }

        panic!("no reply within the deadline");
    }

    fn auth_frame(pid: u16, username: &str, password: &str, dbname: &str) -> Vec<u8> {
        let payload = rmp_serde::to_vec_named(&ClientAuthReq {
            username: username.to_string(),
            password: password.to_string(),
            dbname: dbname.to_string(),
        })
        .unwrap();

        Pkg::new(pid, Tp::ReqClientAuth.into(), payload).to_bytes()
    }

    #[test]
    fn test_client_auth_success_over_the_wire() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        let addr = siri.endpoint().client_addr().unwrap();
        let mut sock = StdTcpStream::connect(addr).unwrap();

        sock.write_all(&auth_frame(7, "root", "pw", "mydb")).unwrap();

        let reply = read_reply(&mut siri, &mut sock);

        assert_eq!(reply.pid, 7);
        assert_eq!(reply.tp, u8::from(Tp::ResClientAuthSuccess));

        // The stream is now bound to the database and the user.
        let bound = siri
            .endpoint
            .live_streams()
            .map(|id| siri.endpoint.stream(id))
            .any(|stream| {
                stream.dbname.as_deref() == Some("mydb")
                    && stream.origin == Origin::User("root".to_string())
            });
        assert!(bound);
    }

    #[test]
    fn test_client_auth_unknown_db_keeps_stream_open() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        let addr = siri.endpoint().client_addr().unwrap();
        let mut sock = StdTcpStream::connect(addr).unwrap();

        sock.write_all(&auth_frame(1, "root", "pw", "nope")).unwrap();

        let reply = read_reply(&mut siri, &mut sock);
        assert_eq!(reply.tp, u8::from(Tp::ErrAuthUnknownDb));

        // Retry on the same connection succeeds.
        sock.write_all(&auth_frame(2, "root", "pw", "mydb")).unwrap();

        let reply = read_reply(&mut siri, &mut sock);
        assert_eq!(reply.pid, 2);
        assert_eq!(reply.tp, u8::from(Tp::ResClientAuthSuccess));
    }

    #[test]
    fn test_ping_acked() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        let addr = siri.endpoint().client_addr().unwrap();
        let mut sock = StdTcpStream::connect(addr).unwrap();

        sock.write_all(&Pkg::new(21, Tp::ReqPing.into(), Vec::new()).to_bytes())
            .unwrap();

        let reply = read_reply(&mut siri, &mut sock);

        assert_eq!(reply.pid, 21);
        assert_eq!(reply.tp, u8::from(Tp::ResAck));
    }

    #[test]
    fn test_bad_checkbit_closes_stream() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        let addr = siri.endpoint().client_addr().unwrap();
        let mut sock = StdTcpStream::connect(addr).unwrap();

        let mut bytes = Pkg::new(1, Tp::ReqPing.into(), Vec::new()).to_bytes();
        bytes[7] ^= 0x20;
        sock.write_all(&bytes).unwrap();

        // The peer should observe a close rather than a reply.
        sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut chunk = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(10);

        loop {
            assert!(Instant::now() < deadline, "stream never closed");

            siri.turn();

            match sock.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => panic!("unexpected reply to a desynced frame"),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(_) => break, // reset also counts as closed
            }
        }
    }

    #[test]
    fn test_drain_waits_then_times_out() {
        let now = Instant::now();
        let mut drain = Drain {
            attempts_left: CLOSE_ATTEMPTS,
            next_tick: now,
        };

        for _ in 0..CLOSE_ATTEMPTS - 1 {
            match drain_step(&mut drain, 3, now) {
                DrainVerdict::Waiting(3) => {}
                _ => panic!("expected to keep waiting"),
            }
        }

        match drain_step(&mut drain, 3, now) {
            DrainVerdict::TimeoutClose => {}
            _ => panic!("expected the budget to expire"),
        }
    }

    #[test]
    fn test_drain_closes_once_clear() {
        let now = Instant::now();
        let mut drain = Drain {
            attempts_left: CLOSE_ATTEMPTS,
            next_tick: now,
        };

        match drain_step(&mut drain, 2, now) {
            DrainVerdict::Waiting(2) => {}
            _ => panic!("expected to wait"),
        }

        match drain_step(&mut drain, 0, now) {
            DrainVerdict::Close => {}
            _ => panic!("expected a clean close"),
        }

        assert!(drain.attempts_left < CLOSE_ATTEMPTS);
    }

    #[test]
    fn test_begin_close_drains_and_stops() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        siri.begin_close(Instant::now());
        assert_eq!(siri.status, Status::Closing);

        let deadline = Instant::now() + Duration::from_secs(15);

        while !siri.stopped {
            assert!(Instant::now() < deadline, "drain never completed");
            siri.turn();
        }

        // Clean close: the group worker acknowledged the stop in time.
        assert_eq!(siri.fault, None);
        assert!(siri.dbs[0].groups.is_closed());
    }

    #[test]
    fn test_forced_close_cancels_promises() {
        let (mut siri, _dir) = test_siri();
        siri.set_running();

        let hits = Rc::new(RefCell::new(Vec::new()));
        let deadline = Instant::now() + Duration::from_secs(60);

        {
            let local = Uuid::from_u128(LOCAL);
            let server = siri.dbs[0].servers.get_mut(&local).unwrap();

            for _ in 0..3 {
                let hits = Rc::clone(&hits);
                server
                    .promises
                    .register(
                        deadline,
                        Box::new(move |outcome: Outcome| {
                            hits.borrow_mut().push(outcome.label())
                        }),
                    )
                    .ok()
                    .unwrap();
            }
        }

        siri.fault.get_or_insert(Fault::CloseEnforced);
        siri.force_close();

        assert!(siri.stopped);
        assert_eq!(*hits.borrow(), vec!["cancelled"; 3]);
    }
}
