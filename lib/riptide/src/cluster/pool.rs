use crate::cluster::flags;
use crate::cluster::promise::{Outcome, PromiseCb};
use crate::cluster::server::Server;
use crate::logging::{self, Logger};
use crate::net::endpoint::Endpoint;
use crate::net::pkg::Pkg;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How the pool router picks a target.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Route {
    /// Prefer slot 0, fall back to slot 1.
    Primary,
    /// Any usable member; ties break toward slot 0.
    AnyAvailable,
}

#[derive(Debug, Eq, PartialEq)]
pub enum PoolError {
    Full,
    Duplicate,
}

/// A replication group of one or two servers. Slot 0 always holds the
/// smaller uuid; registration order does not matter.
#[derive(Debug, Clone, Default)]
pub struct Pool {
    servers: [Option<Uuid>; 2],
}

/// Pool-level facts handed to the conditional-expression engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolWalker {
    pub pool: u16,
    pub servers: u8,
    pub series: u64,
}

impl Pool {
    #[inline]
    pub fn new() -> Pool {
        Pool::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.iter().filter(|slot| slot.is_some()).count()
    }

    #[inline]
    pub fn server(&self, slot: usize) -> Option<Uuid> {
        self.servers[slot]
    }

    #[inline]
    pub fn members(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.servers.iter().filter_map(|slot| *slot)
    }

    pub fn slot_of(&self, uuid: Uuid) -> Option<u8> {
        match (self.servers[0], self.servers[1]) {
            (Some(a), _) if a == uuid => Some(0),
            (_, Some(b)) if b == uuid => Some(1),
            _ => None,
        }
    }

    /// Insert a member, keeping slot 0 on the smaller uuid. The existing
    /// member moves over to slot 1 when the newcomer sorts below it.
    pub fn add(&mut self, uuid: Uuid) -> Result<(), PoolError> {
        match (self.servers[0], self.servers[1]) {
            (None, None) => {
                self.servers[0] = Some(uuid);
                Ok(())
            }
            (Some(existing), None) => {
                if existing == uuid {
                    Err(PoolError::Duplicate)
                } else if uuid < existing {
                    self.servers = [Some(uuid), Some(existing)];
                    Ok(())
                } else {
                    self.servers[1] = Some(uuid);
                    Ok(())
                }
            }
            _ => Err(PoolError::Full),
        }
    }

    /// Take a member out. A remaining slot-1 member shifts down to slot 0
    /// so a single-member pool always routes through its primary slot.
    pub fn remove(&mut self, uuid: Uuid) -> Option<u8> {
        match self.slot_of(uuid)? {
            0 => {
                self.servers[0] = self.servers[1].take();
                Some(0)
            }
            slot => {
                self.servers[1] = None;
                Some(slot)
            }
        }
    }

    /// At least one member is online.
    pub fn online(&self, servers: &HashMap<Uuid, Server>) -> bool {
        self.members()
            .any(|uuid| servers.get(&uuid).map_or(false, Server::is_online))
    }

    /// At least one member is available.
    pub fn available(&self, servers: &HashMap<Uuid, Server>) -> bool {
        self.members()
            .any(|uuid| servers.get(&uuid).map_or(false, Server::is_available))
    }

    /// Any member carries the re-indexing bit.
    pub fn reindexing(&self, servers: &HashMap<Uuid, Server>) -> bool {
        self.members().any(|uuid| {
            servers
                .get(&uuid)
                .map_or(false, |server| server.flags & flags::REINDEXING != 0)
        })
    }
}

/// Route one request into the pool. Candidates are tried in slot order;
/// a member that rejects the issue hands the callback back and the next
/// one is tried. When nobody takes it the callback resolves with
/// `Unavailable`.
///
/// Returns the uuid and pid of the accepted issue, when there was one.
#[allow(clippy::too_many_arguments)]
pub fn send_pkg(
    pool: &Pool,
    servers: &mut HashMap<Uuid, Server>,
    endpoint: &mut Endpoint,
    pkg: &Pkg,
    timeout: Duration,
    mut cb: PromiseCb,
    flags: u8,
    route: Route,
    now: Instant,
    log: &Logger,
) -> Option<(Uuid, u16)> {
    let mut candidates: Vec<Uuid> = pool.members().collect();

    // Primary sticks to slot order. Any-available spreads load toward the
    // member with fewer requests in flight; the sort is stable, so equal
    // load still breaks toward slot 0.
    if route == Route::AnyAvailable {
        candidates.sort_by_key(|uuid| {
            servers
                .get(uuid)
                .map_or(usize::max_value(), |server| server.promises.len())
        });
    }

    for uuid in candidates {
        let server = match servers.get_mut(&uuid) {
            Some(server) => server,
            None => continue,
        };

        let stream_id = match server.stream {
            Some(id) => id,
            None => continue,
        };

        if !endpoint.is_live(stream_id) {
            continue;
        }

        match server.send_pkg(
            endpoint.stream_mut(stream_id),
            pkg,
            timeout,
            cb,
            flags,
            now,
        ) {
            Ok(pid) => return Some((uuid, pid)),
            Err((returned, reason)) => {
                logging::debug!(log, "pool member skipped";
                                "server" => %uuid,
                                "reason" => ?reason);
                cb = returned;
            }
        }
    }

    logging::warn!(log, "no pool member could take the request"; "tp" => pkg.tp);
    cb(Outcome::Unavailable);

    None
}

/// Issue the same request to both members and invoke `cb` once with the
/// aggregated outcomes, slot order preserved. Members that cannot take
/// the issue contribute `Unavailable` immediately.
pub fn send_pkg_both(
    pool: &Pool,
    servers: &mut HashMap<Uuid, Server>,
    endpoint: &mut Endpoint,
    pkg: &Pkg,
    timeout: Duration,
    cb: Box<dyn FnOnce(Vec<Outcome>)>,
    flags: u8,
    now: Instant,
    log: &Logger,
) {
    let members: Vec<Uuid> = pool.members().collect();

    if members.is_empty() {
        logging::warn!(log, "broadcast into an empty pool"; "tp" => pkg.tp);
        cb(vec![Outcome::Unavailable]);
        return;
    }

    let join = Rc::new(RefCell::new(BothJoin {
        outcomes: (0..members.len()).map(|_| None).collect(),
        cb: Some(cb),
    }));

    for (index, uuid) in members.into_iter().enumerate() {
        let member_cb: PromiseCb = {
            let join = Rc::clone(&join);
            Box::new(move |outcome| BothJoin::settle(&join, index, outcome))
        };

        let server = match servers.get_mut(&uuid) {
            Some(server) => server,
            None => {
                member_cb(Outcome::Unavailable);
                continue;
            }
        };

        let issued = server
            .stream
            .filter(|&id| endpoint.is_live(id))
            .map(|id| {
                server.send_pkg(endpoint.stream_mut(id), pkg, timeout, member_cb, flags, now)
            });

        match issued {
            Some(Ok(_)) => {}
            Some(Err((returned, reason))) => {
                logging::debug!(log, "broadcast member unavailable";
                                "server" => %uuid,
                                "reason" => ?reason);
                returned(Outcome::Unavailable);
            }
            None => {
                logging::debug!(log, "broadcast member not connected"; "server" => %uuid);
                // The callback moved into `issued`; it was never built
                // when the stream filter failed, so settle directly.
                BothJoin::settle(&join, index, Outcome::Unavailable);
            }
        }
    }
}

struct BothJoin {
    outcomes: Vec<Option<Outcome>>,
    cb: Option<Box<dyn FnOnce(Vec<Outcome>)>>,
}

impl BothJoin {
    fn settle(join: &Rc<RefCell<BothJoin>>, index: usize, outcome: Outcome) {
        let mut inner = join.borrow_mut();

        if inner.outcomes[index].is_some() {
            return;
        }

        inner.outcomes[index] = Some(outcome);

        if inner.outcomes.iter().all(Option::is_some) {
            let outcomes: Vec<Outcome> = inner.outcomes.drain(..).flatten().collect();

            if let Some(cb) = inner.cb.take() {
                drop(inner);
                cb(outcomes);
            }
        }
    }
}
