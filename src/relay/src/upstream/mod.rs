pub mod file_index;
pub mod master_client;
pub mod ops_log;
pub mod pipeline;

use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::binlog::parse_binlog_name;
use crate::protocol::mysql::constants::BINLOG_START_POS;
use crate::upstream::file_index::FileIndex;
use crate::upstream::master_client::MasterEndpoint;
use crate::upstream::ops_log::OpsLog;
use crate::util::AutoDelayer;

use common::config::UpstreamConfig;
use common::metrics::metric_def::RELAY_UPSTREAM_RECONNECTS;
use common::metrics::{counter_add, upstream_labels};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One configured upstream: captures that master's binlog stream into
/// `LocalDir` and owns the [`FileIndex`] downstream peers tail.
pub struct UpstreamRelay {
    cfg: UpstreamConfig,
    index: Arc<FileIndex>,
    ops: Arc<OpsLog>,
}

impl UpstreamRelay {
    pub fn new(cfg: UpstreamConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.local_dir)?;
        let ops = Arc::new(OpsLog::open(&cfg.local_dir, &cfg.name)?);
        let index = Arc::new(FileIndex::new());
        scan_local_dir(&cfg, &index)?;
        if let Some((name, size)) = index.current_position() {
            info!(upstream = %cfg.name, tail = %name, size, "recovered local binlogs");
        }
        Ok(Arc::new(UpstreamRelay { cfg, index, ops }))
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn index(&self) -> Arc<FileIndex> {
        self.index.clone()
    }

    pub fn local_dir(&self) -> &Path {
        &self.cfg.local_dir
    }

    /// Connect-dump-reconnect until the retry budget is spent. Any progress
    /// (the tail moved) resets the budget; exhaustion abandons the upstream.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let labels = upstream_labels(&self.cfg.name);
        let mut delayer =
            AutoDelayer::with_max(Duration::from_secs(self.cfg.retry_interval.max(1)));
        let mut retries: u32 = 0;
        loop {
            let tail_before = self.index.current_position();
            match self.serve_once().await {
                Ok(()) => {
                    self.ops.warn("master ended the dump stream");
                    warn!(upstream = %self.cfg.name, "master ended the dump stream");
                }
                Err(e) => {
                    self.ops.error(&format!("dump session failed: {e}"));
                    warn!(upstream = %self.cfg.name, "dump session failed: {e}");
                }
            }
            if self.index.current_position() != tail_before {
                retries = 0;
                delayer.reset();
            }
            retries += 1;
            counter_add(RELAY_UPSTREAM_RECONNECTS, 1, Some(&labels));
            if retries > self.cfg.max_retry_times {
                self.ops
                    .fatal(&format!("giving up after {} retries", self.cfg.max_retry_times));
                error!(upstream = %self.cfg.name, "abandoned after {} retries", retries - 1);
                anyhow::bail!(
                    "upstream {} abandoned after {} retries",
                    self.cfg.name,
                    retries - 1
                );
            }
            delayer.delay().await;
        }
    }

    async fn serve_once(&self) -> RelayResult<()> {
        // resume from the local tail, not the configured start
        let (start_file, start_pos) = self
            .index
            .current_position()
            .unwrap_or_else(|| (self.cfg.start_file.clone(), BINLOG_START_POS));

        let endpoint = MasterEndpoint {
            addr: self.cfg.server_addr.clone(),
            username: self.cfg.username.clone(),
            password: self.cfg.password.clone(),
            server_id: self.cfg.server_id,
            read_timeout: Duration::from_secs(self.cfg.read_timeout.max(1)),
        };
        let mut conn = endpoint.connect().await?;
        self.ops
            .info(&format!("connected to {}", self.cfg.server_addr));

        // raw bytes are stored as-is; checksum handling follows the FDE
        conn.query_ok("SET @master_binlog_checksum='NONE';").await?;
        let heartbeat_ns = self.cfg.heartbeat_period.max(1) * 1_000_000_000;
        conn.query_ok(&format!("SET @master_heartbeat_period={heartbeat_ns};"))
            .await?;
        let semisync = if self.cfg.semisync {
            match conn.query_ok("SET @rpl_semi_sync_slave=1;").await {
                Ok(_) => true,
                Err(RelayError::Server { code, message, .. }) => {
                    self.ops.warn(&format!(
                        "semisync rejected ({code}: {message}); continuing without"
                    ));
                    false
                }
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        conn.register_slave(self.cfg.server_id).await?;
        conn.start_dump(&start_file, start_pos as u32, self.cfg.server_id)
            .await?;
        self.ops
            .info(&format!("dump started at {start_file}:{start_pos}"));
        info!(upstream = %self.cfg.name, file = %start_file, pos = start_pos, semisync, "dump started");

        let (raw_reader, ack_writer) = conn.into_parts();
        let dump_cfg = pipeline::DumpConfig {
            upstream: self.cfg.name.clone(),
            local_dir: self.cfg.local_dir.clone(),
            start_file,
            start_pos,
            read_timeout: Duration::from_secs(self.cfg.read_timeout.max(1)),
            sync_binlog: self.cfg.sync_binlog,
            semisync,
        };
        pipeline::run(
            raw_reader,
            ack_writer,
            self.index.clone(),
            self.ops.clone(),
            dump_cfg,
        )
        .await
        .map_err(|pair| {
            pair.dumper
                .or(pair.writer)
                .unwrap_or(RelayError::BadPacket)
        })
    }
}

/// Record already-captured `<prefix>.NNNNNN` files, lowest sequence first,
/// each at its current on-disk size.
fn scan_local_dir(cfg: &UpstreamConfig, index: &FileIndex) -> RelayResult<()> {
    let (prefix, _) = parse_binlog_name(&cfg.start_file)?;
    let mut found: Vec<(u32, String, u64)> = Vec::new();
    for entry in std::fs::read_dir(&cfg.local_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok((file_prefix, seq)) = parse_binlog_name(&name) else {
            continue;
        };
        if file_prefix != prefix {
            continue;
        }
        found.push((seq, name, entry.metadata()?.len()));
    }
    found.sort_by_key(|(seq, _, _)| *seq);
    for (_, name, size) in found {
        index.append_file(&name, size);
    }
    Ok(())
}
