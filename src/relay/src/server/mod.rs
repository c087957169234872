pub mod auth;
pub mod binlog_dump;
pub mod peer;
pub mod query_table;

use crate::server::auth::password_hash2;
use crate::upstream::file_index::FileIndex;

use common::config::{Config, ServerConfig};
use common::metrics::metric_def::{RELAY_CURR_PEERS, RELAY_PEERS_TOTAL};
use common::metrics::{counter_add, gauge_dec, gauge_inc};
use common::ShutdownMessage;
use dashmap::DashMap;
use hashbrown::HashMap;
use ipnet::IpNet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::util::AutoDelayer;

/// What a downstream peer needs from the upstream it is bound to.
#[derive(Clone)]
pub struct UpstreamHandle {
    pub index: Arc<FileIndex>,
    pub local_dir: PathBuf,
}

/// A downstream account, with the double SHA1 the native-password check
/// verifies against.
pub struct UserEntry {
    pub name: String,
    pub hash2: [u8; 20],
    pub host: IpNet,
    pub upstream: String,
}

/// Shared state every peer session reads: server identity, accounts, and
/// the capture state of each upstream.
pub struct ServerCtx {
    pub server: ServerConfig,
    pub users: HashMap<String, UserEntry>,
    pub upstreams: HashMap<String, UpstreamHandle>,
}

impl ServerCtx {
    pub fn new(config: &Config, upstreams: HashMap<String, UpstreamHandle>) -> Self {
        let users = config
            .users
            .values()
            .map(|user| {
                (
                    user.name.clone(),
                    UserEntry {
                        name: user.name.clone(),
                        hash2: password_hash2(&user.password),
                        host: user.host,
                        upstream: user.upstream.clone(),
                    },
                )
            })
            .collect();
        ServerCtx {
            server: config.server.clone(),
            users,
            upstreams,
        }
    }

    /// Pre-auth gate: is this address inside any user's CIDR at all.
    pub fn host_allowed(&self, ip: &IpAddr) -> bool {
        self.users.values().any(|user| user.host.contains(ip))
    }

    pub fn lookup_user(&self, name: &str) -> Option<&UserEntry> {
        self.users.get(name)
    }
}

struct PeerInfo {
    #[allow(dead_code)]
    addr: SocketAddr,
}

/// The TCP front of the relay: accepts replicas and runs one peer session
/// per connection.
pub struct RelayServer {
    ctx: Arc<ServerCtx>,
    peers: Arc<DashMap<u32, PeerInfo>>,
    next_conn_id: AtomicU32,
}

impl RelayServer {
    pub fn new(ctx: ServerCtx) -> Self {
        RelayServer {
            ctx: Arc::new(ctx),
            peers: Arc::new(DashMap::new()),
            next_conn_id: AtomicU32::new(0),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<ShutdownMessage>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.ctx.server.addr).await?;
        info!(addr = %self.ctx.server.addr, "listening for replicas");

        // retired peers come back on this channel and leave the map
        let (closed_tx, mut closed_rx) = mpsc::channel::<u32>(64);
        let peers = self.peers.clone();
        tokio::spawn(async move {
            while let Some(conn_id) = closed_rx.recv().await {
                peers.remove(&conn_id);
                gauge_dec(RELAY_CURR_PEERS, 1.0, None);
            }
        });

        let mut delayer = AutoDelayer::default();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let ShutdownMessage::Cancel(msg) = shutdown.borrow_and_update().clone() {
                        info!("server shutting down: {msg}");
                    }
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            delayer.reset();
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                            self.peers.insert(conn_id, PeerInfo { addr });
                            gauge_inc(RELAY_CURR_PEERS, 1.0, None);
                            counter_add(RELAY_PEERS_TOTAL, 1, None);
                            let ctx = self.ctx.clone();
                            let closed_tx = closed_tx.clone();
                            tokio::spawn(async move {
                                debug!(conn_id, %addr, "peer connected");
                                if let Err(e) = peer::serve(ctx, conn_id, stream, addr).await {
                                    warn!(conn_id, %addr, "peer session ended: {e}");
                                }
                                debug!(conn_id, "peer closed");
                                let _ = closed_tx.send(conn_id).await;
                            });
                        }
                        Err(e) if is_temporary_accept_error(&e) => {
                            warn!("temporary accept error: {e}");
                            delayer.delay().await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn is_temporary_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{UpstreamConfig, UserConfig};

    fn sample_config(dir: &std::path::Path) -> Config {
        let mut upstreams = hashbrown::HashMap::new();
        upstreams.insert(
            "main".to_string(),
            UpstreamConfig {
                name: "main".into(),
                server_addr: "127.0.0.1:3306".into(),
                username: "repl".into(),
                password: "x".into(),
                server_id: 7,
                local_dir: dir.to_path_buf(),
                start_file: "log-bin.000001".into(),
                semisync: false,
                max_retry_times: 10,
                retry_interval: 1,
                read_timeout: 60,
                heartbeat_period: 30,
                sync_binlog: 1,
            },
        );
        let mut users = hashbrown::HashMap::new();
        users.insert(
            "slave1".to_string(),
            UserConfig {
                name: "slave1".into(),
                password: "secret".into(),
                host: "10.0.0.0/8".parse().unwrap(),
                upstream: "main".into(),
            },
        );
        Config {
            upstreams,
            users,
            server: ServerConfig {
                addr: "127.0.0.1:0".into(),
                server_id: 2,
                uuid: "8a9f1c5e-71a2-11e4-9d9b-0800276f99ff".into(),
                version: "5.6.19-log".into(),
            },
        }
    }

    #[test]
    fn host_allow_is_union_of_user_cidrs() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let ctx = ServerCtx::new(&config, HashMap::new());

        assert!(ctx.host_allowed(&"10.9.9.9".parse().unwrap()));
        assert!(!ctx.host_allowed(&"192.168.1.1".parse().unwrap()));

        let user = ctx.lookup_user("slave1").unwrap();
        assert_eq!(user.upstream, "main");
        assert_eq!(user.hash2, password_hash2("secret"));
        assert!(ctx.lookup_user("nobody").is_none());
    }
}
