use hashbrown::HashMap;
use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_CLIENT_BIND: &str = "0.0.0.0:9000";
pub const DEFAULT_BACKEND_BIND: &str = "0.0.0.0:9010";

#[derive(Deserialize)]
pub struct ServerSection {
    pub client_bind: Option<String>,
    pub backend_bind: Option<String>,
    pub db_path: PathBuf,
}

/// One seeded registry entry; ignored once `servers.dat` exists.
#[derive(Deserialize)]
pub struct SeedServer {
    pub uuid: Uuid,
    pub address: String,
    pub port: u16,
    pub pool: u16,
}

#[derive(Deserialize)]
pub struct ClusterSection {
    /// Identity of this server. Generated (and logged) when absent.
    pub uuid: Option<Uuid>,
    pub dbname: String,
    #[serde(default)]
    pub servers: Vec<SeedServer>,
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct Config {
    pub server: ServerSection,
    pub cluster: ClusterSection,
    pub log: Option<LoggerConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn client_bind(&self) -> &str {
        self.server
            .client_bind
            .as_deref()
            .unwrap_or(DEFAULT_CLIENT_BIND)
    }

    pub fn backend_bind(&self) -> &str {
        self.server
            .backend_bind
            .as_deref()
            .unwrap_or(DEFAULT_BACKEND_BIND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = serdeconv::from_toml_str(
            r#"
[server]
client_bind = "127.0.0.1:9000"
backend_bind = "127.0.0.1:9010"
db_path = "/var/lib/riptide"

[cluster]
uuid = "a7f1bc5e-6c2b-4af0-9d52-1be74e2e0a11"
dbname = "mydb"

[[cluster.servers]]
uuid = "a7f1bc5e-6c2b-4af0-9d52-1be74e2e0a11"
address = "127.0.0.1"
port = 9010
pool = 0

[cluster.users]
root = "pw"

[log]
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        assert_eq!(config.client_bind(), "127.0.0.1:9000");
        assert_eq!(config.cluster.dbname, "mydb");
        assert_eq!(config.cluster.servers.len(), 1);
        assert_eq!(config.cluster.users["root"], "pw");
        assert!(config.log.is_some());
    }

    #[test]
    fn test_defaults() {
        let config: Config = serdeconv::from_toml_str(
            r#"
[server]
db_path = "/var/lib/riptide"

[cluster]
dbname = "mydb"
"#,
        )
        .unwrap();

        assert_eq!(config.client_bind(), DEFAULT_CLIENT_BIND);
        assert_eq!(config.backend_bind(), DEFAULT_BACKEND_BIND);
        assert!(config.cluster.uuid.is_none());
        assert!(config.cluster.servers.is_empty());
        assert!(config.log.is_none());
    }
}
