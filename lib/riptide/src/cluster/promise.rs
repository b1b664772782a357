use crate::net::pkg::Pkg;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

/// Issue flag: ownership of the submitted packet stays with the caller so
/// it can be reused for a broadcast.
pub const KEEP_PKG: u8 = 0x1;

/// Issue flag: proceed when the target is merely online instead of
/// requiring full availability (replicate-during-sync).
pub const ONLY_CHECK_ONLINE: u8 = 0x2;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The one and only outcome a pending request ever observes.
#[derive(Debug)]
pub enum Outcome {
    Reply(Pkg),
    Timeout,
    Cancelled,
    ServerGone,
    WriteError,
    Unavailable,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Reply(_) => "reply",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
            Outcome::ServerGone => "server-gone",
            Outcome::WriteError => "write-error",
            Outcome::Unavailable => "unavailable",
        }
    }
}

pub type PromiseCb = Box<dyn FnOnce(Outcome)>;

/// Reason used when draining a whole table at once.
#[derive(Debug, Copy, Clone)]
pub enum CancelReason {
    Cancelled,
    ServerGone,
}

impl CancelReason {
    fn outcome(self) -> Outcome {
        match self {
            CancelReason::Cancelled => Outcome::Cancelled,
            CancelReason::ServerGone => Outcome::ServerGone,
        }
    }
}

struct Promise {
    deadline: Instant,
    cb: PromiseCb,
}

/// Pending replies for one server, keyed by request id.
///
/// The at-most-once guarantee hinges on one rule: an entry is removed from
/// the map before its callback runs. A reply and an expiry racing for the
/// same pid both funnel through that removal; whichever gets there first
/// wins and the loser finds nothing.
pub struct PromiseTable {
    pending: HashMap<u16, Promise>,
    next_pid: u16,
}

impl PromiseTable {
    #[inline]
    pub fn new() -> PromiseTable {
        PromiseTable {
            pending: HashMap::new(),
            next_pid: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Install a promise under a fresh pid. The callback is handed back
    /// untouched in the unlikely case every one of the 65536 pids is
    /// occupied by a live promise.
    pub fn register(&mut self, deadline: Instant, cb: PromiseCb) -> Result<u16, PromiseCb> {
        if self.pending.len() > usize::from(u16::max_value()) {
            return Err(cb);
        }

        let pid = self.alloc_pid();

        self.pending.insert(pid, Promise { deadline, cb });

        Ok(pid)
    }

    /// Monotonic 16-bit counter with wrap; pids still pending are skipped.
    /// Only called when at least one pid is free.
    fn alloc_pid(&mut self) -> u16 {
        loop {
            let pid = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1);

            if !self.pending.contains_key(&pid) {
                return pid;
            }
        }
    }

    /// Resolve the promise for `pid` with `outcome`. Returns false when no
    /// promise is pending under that pid (late reply after expiry, or a
    /// reply we never asked for); the caller logs and drops the packet.
    pub fn complete(&mut self, pid: u16, outcome: Outcome) -> bool {
        match self.pending.remove(&pid) {
            Some(promise) => {
                (promise.cb)(outcome);
                true
            }
            None => false,
        }
    }

    /// Fire `Timeout` for every promise whose deadline has passed, oldest
    /// deadline first. Returns the number fired.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<(u16, Instant)> = self
            .pending
            .iter()
            .filter(|(_, promise)| promise.deadline <= now)
            .map(|(&pid, promise)| (pid, promise.deadline))
            .collect();

        due.sort_by_key(|&(_, deadline)| deadline);

        for &(pid, _) in due.iter() {
            self.complete(pid, Outcome::Timeout);
        }

        due.len()
    }

    /// Earliest pending deadline; drives the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|promise| promise.deadline).min()
    }

    /// Drain the table, resolving everything with `reason`. Used when the
    /// server record is dropped or the process is closing.
    pub fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let pids: Vec<u16> = self.pending.keys().copied().collect();

        for pid in pids.iter() {
            self.complete(*pid, reason.outcome());
        }

        pids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counting_cb(hits: &Rc<RefCell<Vec<&'static str>>>) -> PromiseCb {
        let hits = Rc::clone(hits);
        Box::new(move |outcome| hits.borrow_mut().push(outcome.label()))
    }

    #[test]
    fn test_complete_resolves_once() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut table = PromiseTable::new();

        let deadline = Instant::now() + Duration::from_secs(10);
        let pid = table.register(deadline, counting_cb(&hits)).ok().unwrap();

        assert!(table.complete(pid, Outcome::Reply(Pkg::new(pid, 0x42, vec![]))));
        assert!(!table.complete(pid, Outcome::Reply(Pkg::new(pid, 0x42, vec![]))));

        assert_eq!(*hits.borrow(), vec!["reply"]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_expire_due_in_deadline_order() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut table = PromiseTable::new();
        let now = Instant::now();

        let order = Rc::new(RefCell::new(Vec::new()));
        for offset in [30u64, 10, 20] {
            let order = Rc::clone(&order);
            table
                .register(
                    now + Duration::from_millis(offset),
                    Box::new(move |_| order.borrow_mut().push(offset)),
                )
                .ok()
                .unwrap();
        }
        let far = table
            .register(now + Duration::from_secs(60), counting_cb(&hits))
            .ok()
            .unwrap();

        let fired = table.expire_due(now + Duration::from_millis(50));

        assert_eq!(fired, 3);
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
        assert!(table.complete(far, Outcome::Cancelled));
    }

    #[test]
    fn test_reply_timeout_race_exactly_once() {
        // A reply arriving right around the deadline must produce exactly
        // one callback no matter who gets there first.
        let mut rng = rand::thread_rng();
        let mut replies = 0usize;
        let mut timeouts = 0usize;

        for _ in 0..10_000 {
            let hits = Rc::new(RefCell::new(Vec::new()));
            let mut table = PromiseTable::new();
            let now = Instant::now();

            let pid = table
                .register(now + Duration::from_millis(100), counting_cb(&hits))
                .ok()
                .unwrap();

            if rng.gen_bool(0.5) {
                // Reply first, then the timer fires anyway.
                table.complete(pid, Outcome::Reply(Pkg::new(pid, 0x42, vec![])));
                table.expire_due(now + Duration::from_millis(100));
            } else {
                // Timer first, then a stray late reply shows up.
                table.expire_due(now + Duration::from_millis(100));
                assert!(!table.complete(pid, Outcome::Reply(Pkg::new(pid, 0x42, vec![]))));
            }

            let hits = hits.borrow();
            assert_eq!(hits.len(), 1);
            match hits[0] {
                "reply" => replies += 1,
                "timeout" => timeouts += 1,
                other => panic!("unexpected outcome {}", other),
            }
        }

        assert_eq!(replies + timeouts, 10_000);
    }

    #[test]
    fn test_cancel_all() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut table = PromiseTable::new();
        let deadline = Instant::now() + Duration::from_secs(10);

        for _ in 0..5 {
            table.register(deadline, counting_cb(&hits)).ok().unwrap();
        }

        let cancelled = table.cancel_all(CancelReason::ServerGone);

        assert_eq!(cancelled, 5);
        assert!(table.is_empty());
        assert_eq!(*hits.borrow(), vec!["server-gone"; 5]);
    }

    #[test]
    fn test_pid_wraps_and_skips_live_entries() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut table = PromiseTable::new();
        let deadline = Instant::now() + Duration::from_secs(10);

        table.next_pid = u16::max_value();
        let last = table.register(deadline, counting_cb(&hits)).ok().unwrap();
        assert_eq!(last, u16::max_value());

        // Wrapped around to zero.
        let zero = table.register(deadline, counting_cb(&hits)).ok().unwrap();
        assert_eq!(zero, 0);

        // Force the counter onto a live pid; allocation must skip it.
        table.next_pid = u16::max_value();
        let skipped = table.register(deadline, counting_cb(&hits)).ok().unwrap();
        assert_eq!(skipped, 1);
    }
}
