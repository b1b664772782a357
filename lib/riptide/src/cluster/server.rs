use crate::cluster::flags;
use crate::cluster::promise::{CancelReason, Outcome, PromiseCb, PromiseTable, ONLY_CHECK_ONLINE};
use crate::logging::{self, Logger};
use crate::net::pkg::Pkg;
use crate::net::stream::{Stream, StreamId};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Why an issue was rejected. The callback is handed back alongside so
/// the caller can reroute or resolve it with `Unavailable`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    Dropped,
    NotConnected,
    NotOnline,
    NotAvailable,
    PidExhausted,
}

/// One member of the cluster: identity, observed liveness, the stream we
/// hold toward it and the promises waiting on its replies.
///
/// Servers are totally ordered by uuid; pool slots derive from that order.
pub struct Server {
    pub uuid: Uuid,
    pub address: String,
    pub port: u16,
    pub pool: u16,
    /// Slot within the pool, 0 or 1, assigned at registration.
    pub slot: u8,
    pub flags: u8,
    pub stream: Option<StreamId>,
    /// Version string the peer reported during the handshake.
    pub version: Option<String>,
    pub startup_time: u64,
    pub promises: PromiseTable,
    dropped: bool,
    log: Logger,
}

impl Server {
    pub fn new(uuid: Uuid, address: String, port: u16, pool: u16, log: &Logger) -> Server {
        let name = format!("{}:{}", address, port);

        Server {
            uuid,
            address,
            port,
            pool,
            slot: 0,
            flags: 0,
            stream: None,
            version: None,
            startup_time: 0,
            promises: PromiseTable::new(),
            dropped: false,
            log: log.new(logging::o!("server" => name)),
        }
    }

    /// "address:port"; shows up in every log line about this server.
    #[inline]
    pub fn name(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        flags::is_online(self.flags)
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        flags::is_available(self.flags)
    }

    #[inline]
    pub fn is_accessible(&self) -> bool {
        flags::is_accessible(self.flags)
    }

    #[inline]
    pub fn is_synchronizing(&self) -> bool {
        flags::is_synchronizing(self.flags)
    }

    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// The named bucket the current flag byte falls into.
    #[inline]
    pub fn liveness(&self) -> flags::Liveness {
        flags::classify(self.flags)
    }

    /// Apply a flag broadcast from this peer. AUTHENTICATED and QUEUE_FULL
    /// reflect our own observations and survive the update.
    pub fn update_flags(&mut self, new: u8) {
        let merged = flags::merge(self.flags, new);

        if merged != self.flags {
            logging::info!(self.log, "server status changed";
                           "from" => flags::status_str(self.flags),
                           "to" => flags::status_str(merged));
        }

        self.flags = merged;
    }

    /// Set or clear a single observation bit (AUTHENTICATED, QUEUE_FULL).
    pub fn set_observation(&mut self, bit: u8, on: bool) {
        let updated = if on { self.flags | bit } else { self.flags & !bit };

        if updated != self.flags {
            logging::debug!(self.log, "server observation changed";
                            "from" => flags::status_str(self.flags),
                            "to" => flags::status_str(updated));
        }

        self.flags = updated;
    }

    /// Rebind address and port. Returns false when nothing changed. The
    /// caller closes any live stream so the next heartbeat reconnects to
    /// the new address.
    pub fn update_address(&mut self, address: &str, port: u16) -> bool {
        if self.address == address && self.port == port {
            return false;
        }

        logging::info!(self.log, "server address changed";
                       "address" => address,
                       "port" => port);

        self.address = address.to_string();
        self.port = port;

        true
    }

    /// Issue a request toward this server: install a promise, stamp the
    /// allocated pid into the frame and queue it on the stream.
    ///
    /// The caller always keeps `pkg`; frames are copied into the stream
    /// buffer, so the same packet can be issued to several servers.
    pub fn send_pkg(
        &mut self,
        stream: &mut Stream,
        pkg: &Pkg,
        timeout: Duration,
        cb: PromiseCb,
        flags: u8,
        now: Instant,
    ) -> Result<u16, (PromiseCb, SendError)> {
        if self.dropped {
            return Err((cb, SendError::Dropped));
        }

        if !self.is_online() {
            return Err((cb, SendError::NotOnline));
        }

        if flags & ONLY_CHECK_ONLINE == 0 && !self.is_available() {
            return Err((cb, SendError::NotAvailable));
        }

        if !self.is_connected() {
            return Err((cb, SendError::NotConnected));
        }

        let pid = match self.promises.register(now + timeout, cb) {
            Ok(pid) => pid,
            Err(cb) => return Err((cb, SendError::PidExhausted)),
        };

        match stream.submit_frame(pid, pkg.tp, &pkg.data) {
            Ok(()) => {
                logging::debug!(self.log, "request issued";
                                "pid" => pid,
                                "tp" => pkg.tp,
                                "timeout_ms" => timeout.as_millis() as u64);

                Ok(pid)
            }
            Err(err) => {
                logging::warn!(self.log, "request submission failed";
                               "pid" => pid,
                               "tp" => pkg.tp,
                               "error" => ?err);

                // The promise never made it onto the wire; resolve it
                // synchronously so the caller sees exactly one outcome.
                self.promises.complete(pid, Outcome::WriteError);

                Ok(pid)
            }
        }
    }

    /// Take this server out of the cluster: refuse new issues and resolve
    /// everything pending with `ServerGone`. Returns the number of
    /// promises that were cancelled.
    pub fn mark_dropped(&mut self) -> usize {
        self.dropped = true;

        let cancelled = self.promises.cancel_all(CancelReason::ServerGone);

        if cancelled > 0 {
            logging::info!(self.log, "cancelled pending requests on drop";
                           "count" => cancelled);
        }

        cancelled
    }

    /// Human readable status for listings and logs.
    pub fn status_str(&self) -> String {
        flags::status_str(self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_server(flag_bits: u8) -> Server {
        let mut server = Server::new(
            Uuid::from_u128(1),
            "10.0.0.1".to_string(),
            9010,
            0,
            &logging::discard(),
        );
        server.flags = flag_bits;
        server
    }

    fn outcome_sink() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn() -> PromiseCb) {
        let hits: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let for_cb = Rc::clone(&hits);
        let make = move || -> PromiseCb {
            let hits = Rc::clone(&for_cb);
            Box::new(move |outcome: Outcome| hits.borrow_mut().push(outcome.label()))
        };
        (hits, make)
    }

    #[test]
    fn test_send_rejected_when_offline() {
        let (hits, make_cb) = outcome_sink();
        let mut server = test_server(0);
        let mut stream = Stream::new(&logging::discard());

        let result = server.send_pkg(
            &mut stream,
            &Pkg::new(0, 0x04, vec![]),
            Duration::from_secs(5),
            make_cb(),
            0,
            Instant::now(),
        );

        assert_eq!(result.err().map(|(_, e)| e), Some(SendError::NotOnline));
        assert!(hits.borrow().is_empty());
        assert!(server.promises.is_empty());
    }

    #[test]
    fn test_send_requires_availability_unless_flagged() {
        let (_, make_cb) = outcome_sink();
        let online_busy = flags::RUNNING | flags::AUTHENTICATED | flags::BACKUP_MODE;
        let mut server = test_server(online_busy);
        let mut stream = Stream::new(&logging::discard());

        let rejected = server.send_pkg(
            &mut stream,
            &Pkg::new(0, 0x04, vec![]),
            Duration::from_secs(5),
            make_cb(),
            0,
            Instant::now(),
        );

        assert_eq!(
            rejected.err().map(|(_, e)| e),
            Some(SendError::NotAvailable)
        );

        // With ONLY_CHECK_ONLINE the next gate is the missing stream.
        let rejected = server.send_pkg(
            &mut stream,
            &Pkg::new(0, 0x04, vec![]),
            Duration::from_secs(5),
            make_cb(),
            ONLY_CHECK_ONLINE,
            Instant::now(),
        );

        assert_eq!(
            rejected.err().map(|(_, e)| e),
            Some(SendError::NotConnected)
        );
    }

    #[test]
    fn test_send_write_error_resolves_synchronously() {
        let (hits, make_cb) = outcome_sink();
        let mut server = test_server(flags::RUNNING | flags::AUTHENTICATED);
        server.stream = Some(0);

        // Disconnected stream slot: submission fails immediately.
        let mut stream = Stream::new(&logging::discard());

        let result = server.send_pkg(
            &mut stream,
            &Pkg::new(0, 0x04, vec![]),
            Duration::from_secs(5),
            make_cb(),
            0,
            Instant::now(),
        );

        assert!(result.is_ok());
        assert_eq!(*hits.borrow(), vec!["write-error"]);
        assert!(server.promises.is_empty());
    }

    #[test]
    fn test_drop_cancels_pending() {
        let (hits, make_cb) = outcome_sink();
        let mut server = test_server(flags::RUNNING | flags::AUTHENTICATED);
        let deadline = Instant::now() + Duration::from_secs(10);

        for _ in 0..5 {
            server.promises.register(deadline, make_cb()).ok().unwrap();
        }

        let cancelled = server.mark_dropped();

        assert_eq!(cancelled, 5);
        assert_eq!(*hits.borrow(), vec!["server-gone"; 5]);

        // New issues are refused after the drop.
        let mut stream = Stream::new(&logging::discard());
        let result = server.send_pkg(
            &mut stream,
            &Pkg::new(0, 0x04, vec![]),
            Duration::from_secs(5),
            make_cb(),
            0,
            Instant::now(),
        );

        assert_eq!(result.err().map(|(_, e)| e), Some(SendError::Dropped));
    }

    #[test]
    fn test_update_flags_preserves_observations() {
        let mut server = test_server(flags::AUTHENTICATED | flags::QUEUE_FULL);

        server.update_flags(flags::RUNNING | flags::SYNCHRONIZING);

        assert_eq!(
            server.flags,
            flags::RUNNING | flags::SYNCHRONIZING | flags::AUTHENTICATED | flags::QUEUE_FULL
        );

        server.set_observation(flags::QUEUE_FULL, false);
        server.update_flags(flags::RUNNING);

        assert_eq!(server.flags, flags::RUNNING | flags::AUTHENTICATED);
    }

    #[test]
    fn test_update_address() {
        let mut server = test_server(0);

        assert!(!server.update_address("10.0.0.1", 9010));
        assert!(server.update_address("10.0.0.2", 9010));
        assert_eq!(server.name(), "10.0.0.2:9010");
    }

    #[test]
    fn test_uuid_order_is_total() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        assert!(a < b);
        assert!(a.as_bytes() < b.as_bytes());
    }
}
