#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Cluster coordination core for the riptide time-series database: packet
//! framing, promise-tracked backend traffic, pool routing, liveness flags
//! and the process lifecycle around them.

/// Version reported during the backend handshake.
pub const DB_VERSION: &str = "2.0.3";

/// Oldest peer version this build is willing to talk to.
pub const MIN_SUPPORTED_VERSION: &str = "2.0.0";

/// Upper bound on databases hosted by a single process.
pub const MAX_NUMBER_DB: usize = 4;

pub mod cluster;
pub mod groups;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod time;
pub mod version;
