use crate::cluster::pool::{Pool, PoolError, PoolWalker};
use crate::cluster::server::Server;
use crate::groups::{GroupError, Groups};
use crate::logging::{self, Logger};
use hashbrown::HashMap;
use serde_bytes::ByteBuf;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SERVERS_SCHEMA: u8 = 1;

const SERVERS_FN: &str = "servers.dat";

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Decode(rmp_serde::decode::Error),
    Encode(rmp_serde::encode::Error),
    /// Persisted schema id does not match this build.
    Schema(u8),
    /// Structurally valid file with nonsense in it.
    Invalid(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> StoreError {
        StoreError::Io(err)
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> StoreError {
        StoreError::Decode(err)
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> StoreError {
        StoreError::Encode(err)
    }
}

#[derive(Debug)]
pub enum RegisterError {
    Duplicate(Uuid),
    PoolFull(u16),
    Store(StoreError),
}

#[derive(Debug)]
pub enum DropError {
    Missing(Uuid),
    /// Refusing to drop the server we are.
    Local,
    Store(StoreError),
}

/// Replace `path` with `bytes` in one step: write a sibling temp file,
/// then rename it into place.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// One hosted database: its server registry, pools, users, series names
/// and saved groups.
pub struct Database {
    pub name: String,
    pub path: PathBuf,
    pub local_uuid: Uuid,
    pub servers: HashMap<Uuid, Server>,
    pub pools: Vec<Pool>,
    /// Username to opaque password. Verification policy lives elsewhere.
    pub users: HashMap<String, String>,
    /// Series name to owning pool.
    pub series: HashMap<String, u16>,
    pub groups: Groups,
    log: Logger,
}

impl Database {
    /// Open (or create) the database directory, load the server registry
    /// and the groups file, and start the group evaluator.
    pub fn open(
        name: &str,
        path: &Path,
        local_uuid: Uuid,
        users: HashMap<String, String>,
        log: &Logger,
    ) -> Result<Database, StoreError> {
        let log = log.new(logging::o!("db" => name.to_string()));

        fs::create_dir_all(path)?;

        let groups = Groups::open(path, &log).map_err(|err| match err {
            GroupError::Store(err) => err,
            other => StoreError::Invalid(format!("groups file: {:?}", other)),
        })?;

        let mut database = Database {
            name: name.to_string(),
            path: path.to_path_buf(),
            local_uuid,
            servers: HashMap::new(),
            pools: Vec::new(),
            users,
            series: HashMap::new(),
            groups,
            log,
        };

        let registry = database.path.join(SERVERS_FN);

        if registry.exists() {
            let bytes = fs::read(&registry)?;
            let (schema, rows): (u8, Vec<(ByteBuf, String, u16, u16)>) =
                rmp_serde::from_slice(&bytes)?;

            if schema != SERVERS_SCHEMA {
                return Err(StoreError::Schema(schema));
            }

            for (uuid, address, port, pool) in rows {
                let uuid = Uuid::from_slice(&uuid)
                    .map_err(|_| StoreError::Invalid("server uuid".to_string()))?;

                database.install_server(uuid, address, port, pool).map_err(
                    |err| match err {
                        RegisterError::Store(err) => err,
                        other => StoreError::Invalid(format!("server registry: {:?}", other)),
                    },
                )?;
            }

            logging::info!(database.log, "server registry loaded";
                           "servers" => database.servers.len(),
                           "pools" => database.pools.len());
        }

        Ok(database)
    }

    /// Register a server and persist the updated registry.
    pub fn register_server(
        &mut self,
        uuid: Uuid,
        address: String,
        port: u16,
        pool: u16,
    ) -> Result<(), RegisterError> {
        self.install_server(uuid, address, port, pool)?;
        self.save_servers().map_err(RegisterError::Store)?;

        Ok(())
    }

    /// Insert into the pool and the registry map; no persistence.
    fn install_server(
        &mut self,
        uuid: Uuid,
        address: String,
        port: u16,
        pool: u16,
    ) -> Result<(), RegisterError> {
        if self.servers.contains_key(&uuid) {
            return Err(RegisterError::Duplicate(uuid));
        }

        while self.pools.len() <= usize::from(pool) {
            self.pools.push(Pool::new());
        }

        self.pools[usize::from(pool)].add(uuid).map_err(|err| match err {
            PoolError::Full => RegisterError::PoolFull(pool),
            PoolError::Duplicate => RegisterError::Duplicate(uuid),
        })?;

        let server = Server::new(uuid, address, port, pool, &self.log);

        logging::info!(self.log, "server registered";
                       "server" => server.name(),
                       "uuid" => %uuid,
                       "pool" => pool);

        self.servers.insert(uuid, server);
        self.sync_slots(pool);

        Ok(())
    }

    /// Drop a remote server: cancel everything pending against it, pull it
    /// out of its pool and persist the new registry. Returns the number of
    /// cancelled promises.
    pub fn drop_server(&mut self, uuid: Uuid) -> Result<usize, DropError> {
        if uuid == self.local_uuid {
            return Err(DropError::Local);
        }

        let mut server = match self.servers.remove(&uuid) {
            Some(server) => server,
            None => return Err(DropError::Missing(uuid)),
        };

        let cancelled = server.mark_dropped();
        let pool = server.pool;

        if let Some(pool) = self.pools.get_mut(usize::from(pool)) {
            pool.remove(uuid);
        }
        self.sync_slots(pool);

        self.save_servers().map_err(DropError::Store)?;

        logging::info!(self.log, "server dropped";
                       "server" => server.name(),
                       "uuid" => %uuid,
                       "cancelled" => cancelled);

        Ok(cancelled)
    }

    /// Re-stamp the slot field of every member after a pool mutation.
    fn sync_slots(&mut self, pool: u16) {
        if let Some(members) = self
            .pools
            .get(usize::from(pool))
            .map(|p| p.members().collect::<Vec<Uuid>>())
        {
            for uuid in members {
                let slot = self.pools[usize::from(pool)].slot_of(uuid).unwrap_or(0);
                if let Some(server) = self.servers.get_mut(&uuid) {
                    server.slot = slot;
                }
            }
        }
    }

    #[inline]
    pub fn local_server(&self) -> Option<&Server> {
        self.servers.get(&self.local_uuid)
    }

    #[inline]
    pub fn local_server_mut(&mut self) -> Option<&mut Server> {
        self.servers.get_mut(&self.local_uuid)
    }

    pub fn remote_uuids(&self) -> Vec<Uuid> {
        self.servers
            .keys()
            .copied()
            .filter(|&uuid| uuid != self.local_uuid)
            .collect()
    }

    /// Check a client credential pair against the user table.
    pub fn check_user(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map_or(false, |stored| stored == password)
    }

    /// Track a series under its owning pool and queue it for group
    /// evaluation.
    pub fn add_series(&mut self, name: &str, pool: u16) {
        if self.series.insert(name.to_string(), pool).is_none() {
            self.groups.add_series(name);
        }
    }

    pub fn series_count(&self, pool: u16) -> u64 {
        self.series.values().filter(|&&p| p == pool).count() as u64
    }

    /// Per-pool facts for the conditional-expression engine. The walk
    /// visits every pool unconditionally; per-pool evaluation results
    /// never short-circuit it.
    pub fn pool_walkers(&self) -> Vec<PoolWalker> {
        self.pools
            .iter()
            .enumerate()
            .map(|(index, pool)| PoolWalker {
                pool: index as u16,
                servers: pool.len() as u8,
                series: self.series_count(index as u16),
            })
            .collect()
    }

    /// Persist `[schema, [uuid, address, port, pool], ...]` atomically.
    pub fn save_servers(&self) -> Result<(), StoreError> {
        let mut rows: Vec<(ByteBuf, &str, u16, u16)> = self
            .servers
            .values()
            .map(|server| {
                (
                    ByteBuf::from(server.uuid.as_bytes().to_vec()),
                    server.address.as_str(),
                    server.port,
                    server.pool,
                )
            })
            .collect();

        rows.sort();

        let bytes = rmp_serde::to_vec(&(SERVERS_SCHEMA, rows))?;

        atomic_write(&self.path.join(SERVERS_FN), &bytes)?;

        Ok(())
    }
}
