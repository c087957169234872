use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use ipnet::IpNet;
use serde::Deserialize;

/// Top-level configuration, loaded from the JSON file handed to `--conf`.
///
/// Keys are PascalCase on disk. `Upstreams` and `Users` are keyed by name;
/// the embedded `Name` field may be omitted and is filled from the map key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub upstreams: HashMap<String, UpstreamConfig>,
    pub users: HashMap<String, UserConfig>,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamConfig {
    #[serde(default)]
    pub name: String,
    pub server_addr: String,
    pub username: String,
    pub password: String,
    /// Slave server id announced to the master. Must be unique in the
    /// master's replication set.
    pub server_id: u32,
    pub local_dir: PathBuf,
    /// Initial binlog filename when no local files exist yet.
    pub start_file: String,
    #[serde(default)]
    pub semisync: bool,
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: u32,
    /// Back-off ceiling in seconds for the reconnect delayer.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Per-I/O deadline on the upstream socket, seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Heartbeat period requested from the master, seconds.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period: u64,
    /// fsync the local binlog every N completed events.
    #[serde(default = "default_sync_binlog")]
    pub sync_binlog: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserConfig {
    #[serde(default)]
    pub name: String,
    pub password: String,
    /// Client addresses allowed for this user.
    pub host: IpNet,
    /// Key into `Upstreams`; the binlogs this user may dump.
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    pub addr: String,
    pub server_id: u32,
    pub uuid: String,
    /// Version string advertised to downstream replicas.
    pub version: String,
}

fn default_max_retry_times() -> u32 {
    10
}

fn default_retry_interval() -> u64 {
    1
}

fn default_read_timeout() -> u64 {
    60
}

fn default_heartbeat_period() -> u64 {
    30
}

fn default_sync_binlog() -> u32 {
    1
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut conf: Config = serde_json::from_str(&raw)?;
        for (key, upstream) in conf.upstreams.iter_mut() {
            if upstream.name.is_empty() {
                upstream.name = key.clone();
            }
        }
        for (key, user) in conf.users.iter_mut() {
            if user.name.is_empty() {
                user.name = key.clone();
            }
        }
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.upstreams.is_empty() {
            anyhow::bail!("config has no upstreams");
        }
        for (name, upstream) in self.upstreams.iter() {
            if upstream.start_file.is_empty() {
                anyhow::bail!("upstream {name:?} has an empty StartFile");
            }
            if upstream.sync_binlog == 0 {
                anyhow::bail!("upstream {name:?} has SyncBinlog=0");
            }
        }
        for (name, user) in self.users.iter() {
            if !self.upstreams.contains_key(&user.upstream) {
                anyhow::bail!(
                    "user {name:?} references unknown upstream {:?}",
                    user.upstream
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Upstreams": {
            "main": {
                "ServerAddr": "127.0.0.1:3306",
                "Username": "repl",
                "Password": "12345678",
                "ServerId": 12,
                "LocalDir": "/var/lib/mysql-relay/main",
                "StartFile": "mysql-bin.000001",
                "Semisync": true
            }
        },
        "Users": {
            "slave1": {
                "Password": "secret",
                "Host": "10.0.0.0/8",
                "Upstream": "main"
            }
        },
        "Server": {
            "Addr": "0.0.0.0:13306",
            "ServerId": 2,
            "Uuid": "8a9f1c5e-71a2-11e4-9d9b-0800276f99ff",
            "Version": "5.6.19-log"
        }
    }"#;

    #[test]
    fn parse_sample() {
        let mut conf: Config = serde_json::from_str(SAMPLE).unwrap();
        for (key, upstream) in conf.upstreams.iter_mut() {
            upstream.name = key.clone();
        }
        conf.validate().unwrap();

        let main = conf.upstreams.get("main").unwrap();
        assert_eq!(main.server_id, 12);
        assert!(main.semisync);
        assert_eq!(main.max_retry_times, 10);
        assert_eq!(main.sync_binlog, 1);
        assert_eq!(main.heartbeat_period, 30);

        let user = conf.users.get("slave1").unwrap();
        assert_eq!(user.upstream, "main");
        assert!(user.host.contains(&"10.1.2.3".parse::<std::net::IpAddr>().unwrap()));
        assert!(!user.host.contains(&"192.168.0.1".parse::<std::net::IpAddr>().unwrap()));

        assert_eq!(conf.server.version, "5.6.19-log");
    }

    #[test]
    fn unknown_upstream_rejected() {
        let mut conf: Config = serde_json::from_str(SAMPLE).unwrap();
        conf.users.get_mut("slave1").unwrap().upstream = "nope".into();
        assert!(conf.validate().is_err());
    }
}
