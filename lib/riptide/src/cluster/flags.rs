//! Liveness flag byte and the predicates derived from it.
//!
//! A server's state is one byte of independent bits. AUTHENTICATED,
//! QUEUE_FULL and UNAVAILABLE describe our observation of a remote peer
//! and are never set on the local server; the `self_*` predicate family
//! drops them from the requirement accordingly.

pub const RUNNING: u8 = 1;
pub const SYNCHRONIZING: u8 = 2;
pub const REINDEXING: u8 = 4;
pub const BACKUP_MODE: u8 = 8;
pub const QUEUE_FULL: u8 = 16;
pub const UNAVAILABLE: u8 = 32;
pub const AUTHENTICATED: u8 = 64;

const IS_ONLINE: u8 = RUNNING | AUTHENTICATED;
const IS_SYNCHRONIZING: u8 = RUNNING | SYNCHRONIZING | AUTHENTICATED;
const IS_REINDEXING: u8 = RUNNING | REINDEXING | AUTHENTICATED;

const SELF_ONLINE: u8 = RUNNING;
const SELF_SYNCHRONIZING: u8 = RUNNING | SYNCHRONIZING;
const SELF_REINDEXING: u8 = RUNNING | REINDEXING;

/// Merge a flag broadcast into the previous byte. AUTHENTICATED and
/// QUEUE_FULL are our own observations and survive the update; everything
/// else is overwritten. The operation is associative, so concurrent
/// broadcasts settle on the same value regardless of arrival order.
#[inline]
pub fn merge(org: u8, new: u8) -> u8 {
    new | (org & (AUTHENTICATED | QUEUE_FULL))
}

/// Running and authenticated, with room in the queue. Unavailable status
/// is intentionally ignored here.
#[inline]
pub fn is_online(flags: u8) -> bool {
    flags & IS_ONLINE == IS_ONLINE && flags & QUEUE_FULL == 0
}

#[inline]
pub fn self_online(flags: u8) -> bool {
    flags & SELF_ONLINE == SELF_ONLINE
}

/// Exactly running and authenticated; nothing else going on.
#[inline]
pub fn is_available(flags: u8) -> bool {
    flags == IS_ONLINE
}

#[inline]
pub fn self_available(flags: u8) -> bool {
    flags == SELF_ONLINE
}

/// Exactly running, authenticated and synchronizing.
#[inline]
pub fn is_synchronizing(flags: u8) -> bool {
    flags == IS_SYNCHRONIZING
}

#[inline]
pub fn self_synchronizing(flags: u8) -> bool {
    flags == SELF_SYNCHRONIZING
}

/// Available, or exactly available-plus-reindexing.
#[inline]
pub fn is_accessible(flags: u8) -> bool {
    flags == IS_ONLINE || flags == IS_REINDEXING
}

#[inline]
pub fn self_accessible(flags: u8) -> bool {
    flags == SELF_ONLINE || flags == SELF_REINDEXING
}

/// One named bucket per flag byte. Every byte lands in exactly one
/// variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Liveness {
    /// Not running, not authenticated, or explicitly unavailable.
    Offline,
    /// Exactly running and authenticated.
    Available,
    /// Exactly available plus synchronizing.
    Synchronizing,
    /// Exactly available plus reindexing.
    Reindexing,
    /// Online, but carrying extra state (backup mode, combined bits).
    OnlineOnly,
    /// Running and authenticated with a saturated queue.
    QueueFull,
}

pub fn classify(flags: u8) -> Liveness {
    if flags == IS_ONLINE {
        Liveness::Available
    } else if flags == IS_SYNCHRONIZING {
        Liveness::Synchronizing
    } else if flags == IS_REINDEXING {
        Liveness::Reindexing
    } else if flags & IS_ONLINE == IS_ONLINE && flags & QUEUE_FULL != 0 {
        Liveness::QueueFull
    } else if is_online(flags) {
        Liveness::OnlineOnly
    } else {
        Liveness::Offline
    }
}

/// Human readable status line, e.g. "running | synchronizing".
pub fn status_str(flags: u8) -> String {
    if flags == 0 {
        return "offline".to_string();
    }

    let mut parts = Vec::new();

    if flags & RUNNING != 0 {
        parts.push("running");
    }
    if flags & SYNCHRONIZING != 0 {
        parts.push("synchronizing");
    }
    if flags & REINDEXING != 0 {
        parts.push("re-indexing");
    }
    if flags & BACKUP_MODE != 0 {
        parts.push("backup-mode");
    }
    if flags & QUEUE_FULL != 0 {
        parts.push("queue-full");
    }
    if flags & UNAVAILABLE != 0 {
        parts.push("unavailable");
    }
    if flags & AUTHENTICATED != 0 {
        parts.push("authenticated");
    }

    parts.join(" | ")
}
