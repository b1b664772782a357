//! Groups: saved regular expressions evaluated against series names.
//!
//! The registry itself lives on the loop thread. Matching runs on a
//! background worker that wakes every two seconds, drains whatever new
//! groups and series queued up, and reports match results back over a
//! bounded channel. The loop thread applies those results to the
//! authoritative member sets, so the registry is never written from two
//! threads.

use crate::cluster::database::{atomic_write, StoreError};
use crate::logging::{self, Logger};
use crossbeam_channel::{bounded, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const GROUPS_SCHEMA: u8 = 1;

const GROUPS_FN: &str = "groups.dat";
const LOOP_SLEEP: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_SIZE: usize = 64;
const EVENT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum GroupsStatus {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Closed = 3,
}

impl GroupsStatus {
    fn from_u8(value: u8) -> GroupsStatus {
        match value {
            0 => GroupsStatus::Init,
            1 => GroupsStatus::Running,
            2 => GroupsStatus::Stopping,
            _ => GroupsStatus::Closed,
        }
    }
}

#[derive(Debug)]
pub enum GroupError {
    Exists(String),
    Missing(String),
    Pattern(String),
    Store(StoreError),
}

impl From<StoreError> for GroupError {
    fn from(err: StoreError) -> GroupError {
        GroupError::Store(err)
    }
}

/// One saved expression and the series names matched so far.
pub struct Group {
    pub name: String,
    pub source: String,
    pub members: HashSet<String>,
}

/// Worker result: series that matched a group's pattern.
#[derive(Debug)]
struct MatchEvent {
    group: String,
    series: Vec<String>,
}

/// State shared with the worker. The loop thread appends, the worker
/// drains; the full series/pattern views are read-only snapshots for the
/// worker under the same lock.
#[derive(Default)]
struct Pending {
    series: Vec<String>,
    patterns: Vec<(String, Regex)>,
    nseries: Vec<String>,
    ngroups: Vec<String>,
}

struct Shared {
    status: AtomicU8,
    pending: Mutex<Pending>,
}

impl Shared {
    fn status(&self) -> GroupsStatus {
        GroupsStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: GroupsStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

pub struct Groups {
    path: PathBuf,
    groups: HashMap<String, Group>,
    shared: Arc<Shared>,
    rx: Receiver<MatchEvent>,
    worker: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl Groups {
    /// Load `groups.dat` (when present) and start the evaluator worker.
    pub fn open(dbpath: &Path, log: &Logger) -> Result<Groups, GroupError> {
        Groups::open_inner(dbpath, LOOP_SLEEP, log)
    }

    fn open_inner(dbpath: &Path, sleep: Duration, log: &Logger) -> Result<Groups, GroupError> {
        let path = dbpath.join(GROUPS_FN);
        let log = log.new(logging::o!("unit" => "groups"));

        logging::info!(log, "loading groups"; "path" => %path.display());

        let shared = Arc::new(Shared {
            status: AtomicU8::new(GroupsStatus::Init as u8),
            pending: Mutex::new(Pending::default()),
        });

        let (tx, rx) = bounded(EVENT_CHANNEL_SIZE);

        let mut groups = Groups {
            path,
            groups: HashMap::new(),
            shared: Arc::clone(&shared),
            rx,
            worker: None,
            log: log.clone(),
        };

        if groups.path.exists() {
            for (name, source) in load_file(&groups.path)? {
                groups.install_group(&name, &source)?;
            }
        }

        groups.worker = Some(spawn_worker(shared, tx, sleep, log));

        Ok(groups)
    }

    #[inline]
    pub fn status(&self) -> GroupsStatus {
        self.shared.status()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status() == GroupsStatus::Closed
    }

    /// Kick the worker out of INIT once the process is running.
    pub fn start(&self) {
        if self.status() == GroupsStatus::Init {
            self.shared.set_status(GroupsStatus::Running);
        }
    }

    /// Ask the worker to wind down; it transitions to CLOSED on its next
    /// wake.
    pub fn signal_stop(&self) {
        match self.status() {
            GroupsStatus::Closed => {}
            _ => self.shared.set_status(GroupsStatus::Stopping),
        }
    }

    /// Reap the worker thread after it reported CLOSED.
    pub fn join(&mut self) {
        if self.is_closed() {
            if let Some(handle) = self.worker.take() {
                drop(handle.join());
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Create a group. The name must be free and the pattern must
    /// compile; the registry file is rewritten before the call returns.
    pub fn add_group(&mut self, name: &str, source: &str) -> Result<(), GroupError> {
        if self.groups.contains_key(name) {
            return Err(GroupError::Exists(name.to_string()));
        }

        self.install_group(name, source)?;
        self.save()?;

        logging::info!(self.log, "group added"; "name" => name, "source" => source);

        Ok(())
    }

    /// Insert without persisting; shared with the load path.
    fn install_group(&mut self, name: &str, source: &str) -> Result<(), GroupError> {
        let pattern = Regex::new(source).map_err(|err| GroupError::Pattern(err.to_string()))?;

        self.groups.insert(
            name.to_string(),
            Group {
                name: name.to_string(),
                source: source.to_string(),
                members: HashSet::new(),
            },
        );

        let mut pending = self.shared.pending.lock().expect("groups lock poisoned");
        pending.patterns.push((name.to_string(), pattern));
        pending.ngroups.push(name.to_string());

        Ok(())
    }

    /// Remove a group and rewrite the registry file.
    pub fn drop_group(&mut self, name: &str) -> Result<(), GroupError> {
        if self.groups.remove(name).is_none() {
            return Err(GroupError::Missing(name.to_string()));
        }

        {
            let mut pending = self.shared.pending.lock().expect("groups lock poisoned");
            pending.patterns.retain(|(gname, _)| gname != name);
            pending.ngroups.retain(|gname| gname != name);
        }

        self.save()?;

        logging::info!(self.log, "group dropped"; "name" => name);

        Ok(())
    }

    /// Queue a new series for evaluation against every group.
    pub fn add_series(&mut self, name: &str) {
        let mut pending = self.shared.pending.lock().expect("groups lock poisoned");
        pending.series.push(name.to_string());
        pending.nseries.push(name.to_string());
    }

    /// Apply whatever match results the worker produced since the last
    /// turn. Returns the number of events applied.
    pub fn apply_events(&mut self) -> usize {
        let mut applied = 0;

        while let Ok(event) = self.rx.try_recv() {
            applied += 1;

            match self.groups.get_mut(&event.group) {
                Some(group) => {
                    logging::debug!(self.log, "series matched group";
                                    "group" => &event.group,
                                    "count" => event.series.len());

                    group.members.extend(event.series);
                }
                // Dropped while the worker was matching; nothing to do.
                None => continue,
            }
        }

        applied
    }

    /// Rewrite `groups.dat`: `[schema, [name, source], ...]`, written to a
    /// temp file and renamed into place.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut rows: Vec<(&str, &str)> = self
            .groups
            .values()
            .map(|group| (group.name.as_str(), group.source.as_str()))
            .collect();

        rows.sort_unstable();

        let bytes = rmp_serde::to_vec(&(GROUPS_SCHEMA, rows))?;

        atomic_write(&self.path, &bytes)?;

        Ok(())
    }
}

impl Drop for Groups {
    fn drop(&mut self) {
        // Never block the loop thread on a sleeping worker; it observes
        // STOPPING on its next wake and exits on its own.
        self.signal_stop();
    }
}

fn load_file(path: &Path) -> Result<Vec<(String, String)>, StoreError> {
    let bytes = std::fs::read(path)?;
    let (schema, rows): (u8, Vec<(String, String)>) = rmp_serde::from_slice(&bytes)?;

    if schema != GROUPS_SCHEMA {
        return Err(StoreError::Schema(schema));
    }

    Ok(rows)
}

fn spawn_worker(
    shared: Arc<Shared>,
    tx: Sender<MatchEvent>,
    sleep: Duration,
    log: Logger,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("groups".to_string())
        .spawn(move || {
            loop {
                thread::sleep(sleep);

                match shared.status() {
                    GroupsStatus::Init => continue,
                    GroupsStatus::Running => reconcile(&shared, &tx, &log),
                    GroupsStatus::Stopping | GroupsStatus::Closed => break,
                }
            }

            shared.set_status(GroupsStatus::Closed);
            logging::debug!(log, "groups worker closed");
        })
        .expect("spawning the groups worker")
}

/// One worker pass: match new groups against every known series and new
/// series against every known group. Runs off the loop thread; only the
/// queue drain holds the lock.
fn reconcile(shared: &Shared, tx: &Sender<MatchEvent>, log: &Logger) {
    let (series, patterns, nseries, ngroups) = {
        let mut pending = match shared.pending.lock() {
            Ok(pending) => pending,
            Err(_) => return,
        };

        if pending.nseries.is_empty() && pending.ngroups.is_empty() {
            return;
        }

        (
            pending.series.clone(),
            pending.patterns.clone(),
            std::mem::take(&mut pending.nseries),
            std::mem::take(&mut pending.ngroups),
        )
    };

    let mut matched: HashMap<String, Vec<String>> = HashMap::new();

    // New groups sweep the full series set...
    for gname in ngroups.iter() {
        if let Some((_, pattern)) = patterns.iter().find(|(name, _)| name == gname) {
            let hits: Vec<String> = series
                .iter()
                .filter(|name| pattern.is_match(name))
                .cloned()
                .collect();

            if !hits.is_empty() {
                matched.entry(gname.clone()).or_default().extend(hits);
            }
        }
    }

    // ...and new series sweep every group. A series that arrived together
    // with a new group was already covered by the full sweep above.
    for sname in nseries.iter() {
        for (gname, pattern) in patterns.iter() {
            if ngroups.contains(gname) {
                continue;
            }

            if pattern.is_match(sname) {
                matched.entry(gname.clone()).or_default().push(sname.clone());
            }
        }
    }

    for (group, series) in matched {
        let count = series.len();

        if tx
            .send_timeout(MatchEvent { group, series }, EVENT_SEND_TIMEOUT)
            .is_err()
        {
            logging::warn!(log, "dropping match results, loop not draining";
                           "count" => count);
        }
    }
}
