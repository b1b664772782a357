//! Authentication request handling for both stream kinds.
//!
//! Client auth keeps the stream open on failure so the user can retry;
//! backend auth failures close the stream. The responder answers an
//! unknown uuid and its own uuid identically so a probing peer cannot
//! tell the two apart.

use crate::cluster::database::Database;
use crate::cluster::flags;
use crate::logging::{self, Logger};
use crate::net::stream::{Origin, Stream};
use crate::protocol::{ClientAuthReq, ServerAuthReq, Tp};
use crate::version;
use crate::{DB_VERSION, MIN_SUPPORTED_VERSION};
use std::cmp::Ordering;
use uuid::Uuid;

/// Handle a client authentication request. On success the stream is bound
/// to the database and to the user.
pub fn client_auth(
    dbs: &[Database],
    stream: &mut Stream,
    req: &ClientAuthReq,
    log: &Logger,
) -> Tp {
    let database = match dbs.iter().find(|db| db.name == req.dbname) {
        Some(database) => database,
        None => {
            logging::warn!(log, "user authentication failed: unknown database";
                           "dbname" => &req.dbname);
            return Tp::ErrAuthUnknownDb;
        }
    };

    if !database.check_user(&req.username, &req.password) {
        logging::warn!(log, "user authentication failed: invalid credentials";
                       "dbname" => &req.dbname,
                       "username" => &req.username);
        return Tp::ErrAuthCredentials;
    }

    stream.dbname = Some(database.name.clone());
    stream.origin = Origin::User(req.username.clone());
    stream.incref();

    logging::info!(log, "user authenticated";
                   "dbname" => &req.dbname,
                   "username" => &req.username);

    Tp::ResClientAuthSuccess
}

/// Handle a backend handshake request. On success the peer's server
/// record is marked authenticated, its version is stored and the stream
/// is bound to it.
pub fn server_auth(
    dbs: &mut [Database],
    stream: &mut Stream,
    req: &ServerAuthReq,
    log: &Logger,
) -> Tp {
    if req.uuid.len() != 16 {
        logging::warn!(log, "backend handshake rejected: invalid uuid length";
                       "len" => req.uuid.len());
        return Tp::ErrServerAuthInvalidUuid;
    }

    if version::cmp(&req.version, MIN_SUPPORTED_VERSION) == Ordering::Less {
        logging::warn!(log, "backend handshake rejected: peer too old";
                       "version" => &req.version,
                       "min_supported" => MIN_SUPPORTED_VERSION);
        return Tp::ErrServerAuthVersionTooOld;
    }

    if version::cmp(&req.min_version, DB_VERSION) == Ordering::Greater {
        logging::warn!(log, "backend handshake rejected: peer requires newer";
                       "peer_min" => &req.min_version,
                       "version" => DB_VERSION);
        return Tp::ErrServerAuthVersionTooNew;
    }

    let database = match dbs.iter_mut().find(|db| db.name == req.dbname) {
        Some(database) => database,
        None => {
            logging::warn!(log, "backend handshake rejected: unknown database";
                           "dbname" => &req.dbname);
            return Tp::ErrServerAuthUnknownDbname;
        }
    };

    let uuid = match Uuid::from_slice(&req.uuid) {
        Ok(uuid) => uuid,
        Err(_) => return Tp::ErrServerAuthInvalidUuid,
    };

    let dbname = database.name.clone();
    let local_uuid = database.local_uuid;

    // An unregistered uuid and our own uuid get the same answer.
    let server = match database.servers.get_mut(&uuid) {
        Some(server) if uuid != local_uuid => server,
        _ => {
            logging::warn!(log, "backend handshake rejected: unknown uuid";
                           "uuid" => %uuid,
                           "dbname" => &req.dbname);
            return Tp::ErrServerAuthUnknownUuid;
        }
    };

    server.version = Some(req.version.clone());
    server.set_observation(flags::AUTHENTICATED, true);

    stream.dbname = Some(dbname);
    stream.origin = Origin::Server(uuid);
    stream.incref();

    logging::info!(log, "backend peer authenticated";
                   "server" => server.name(),
                   "uuid" => %uuid,
                   "version" => &req.version);

    Tp::ResServerAuthSuccess
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use hashbrown::HashMap;

    fn test_db(dir: &std::path::Path) -> Database {
        let mut users = HashMap::new();
        users.insert("root".to_string(), "pw".to_string());

        let mut db = Database::open(
            "mydb",
            &dir.join("mydb"),
            Uuid::from_u128(1),
            users,
            &logging::discard(),
        )
        .unwrap();

        db.register_server(Uuid::from_u128(1), "10.0.0.1".to_string(), 9010, 0)
            .unwrap();
        db.register_server(Uuid::from_u128(2), "10.0.0.2".to_string(), 9010, 0)
            .unwrap();

        db
    }

    fn server_req(uuid: Vec<u8>) -> ServerAuthReq {
        ServerAuthReq {
            uuid,
            dbname: "mydb".to_string(),
            version: DB_VERSION.to_string(),
            min_version: MIN_SUPPORTED_VERSION.to_string(),
        }
    }

    #[test]
    fn test_client_auth_success_binds_stream() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = vec![test_db(dir.path())];
        let mut stream = Stream::new(&logging::discard());

        let req = ClientAuthReq {
            username: "root".to_string(),
            password: "pw".to_string(),
            dbname: "mydb".to_string(),
        };

        let tp = client_auth(&dbs, &mut stream, &req, &logging::discard());

        assert_eq!(tp, Tp::ResClientAuthSuccess);
        assert_eq!(stream.dbname.as_deref(), Some("mydb"));
        assert_eq!(stream.origin, Origin::User("root".to_string()));
    }

    #[test]
    fn test_client_auth_unknown_db_leaves_stream_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = vec![test_db(dir.path())];
        let mut stream = Stream::new(&logging::discard());

        let req = ClientAuthReq {
            username: "root".to_string(),
            password: "pw".to_string(),
            dbname: "nope".to_string(),
        };

        let tp = client_auth(&dbs, &mut stream, &req, &logging::discard());

        assert_eq!(tp, Tp::ErrAuthUnknownDb);
        assert_eq!(stream.dbname, None);
        assert_eq!(stream.origin, Origin::None);
    }

    #[test]
    fn test_client_auth_bad_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = vec![test_db(dir.path())];
        let mut stream = Stream::new(&logging::discard());

        let req = ClientAuthReq {
            username: "root".to_string(),
            password: "wrong".to_string(),
            dbname: "mydb".to_string(),
        };

        assert_eq!(
            client_auth(&dbs, &mut stream, &req, &logging::discard()),
            Tp::ErrAuthCredentials
        );
    }

    #[test]
    fn test_server_auth_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut dbs = vec![test_db(dir.path())];
        let mut stream = Stream::new(&logging::discard());

        let peer = Uuid::from_u128(2);
        let req = server_req(peer.as_bytes().to_vec());

        let tp = server_auth(&mut dbs, &mut stream, &req, &logging::discard());

        assert_eq!(tp, Tp::ResServerAuthSuccess);
        assert_eq!(stream.origin, Origin::Server(peer));
        assert_eq!(stream.dbname.as_deref(), Some("mydb"));

        let server = &dbs[0].servers[&peer];
        assert_ne!(server.flags & flags::AUTHENTICATED, 0);
        assert_eq!(server.version.as_deref(), Some(DB_VERSION));
    }

    #[test]
    fn test_server_auth_outcomes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut dbs = vec![test_db(dir.path())];
        let mut stream = Stream::new(&logging::discard());
        let log = logging::discard();

        // Invalid uuid wins over everything else.
        let mut req = server_req(vec![1, 2, 3]);
        req.dbname = "nope".to_string();
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthInvalidUuid
        );

        // Version gates come before database lookup.
        let mut req = server_req(Uuid::from_u128(2).as_bytes().to_vec());
        req.version = "1.9.0".to_string();
        req.dbname = "nope".to_string();
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthVersionTooOld
        );

        let mut req = server_req(Uuid::from_u128(2).as_bytes().to_vec());
        req.min_version = "99.0.0".to_string();
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthVersionTooNew
        );

        let mut req = server_req(Uuid::from_u128(2).as_bytes().to_vec());
        req.dbname = "nope".to_string();
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthUnknownDbname
        );

        // Unregistered uuid and our own uuid are indistinguishable.
        let req = server_req(Uuid::from_u128(99).as_bytes().to_vec());
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthUnknownUuid
        );

        let req = server_req(Uuid::from_u128(1).as_bytes().to_vec());
        assert_eq!(
            server_auth(&mut dbs, &mut stream, &req, &log),
            Tp::ErrServerAuthUnknownUuid
        );
    }
}
