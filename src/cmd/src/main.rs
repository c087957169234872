use clap::Parser;
use common::config::Config;
use common::ShutdownMessage;
use hashbrown::HashMap;
use relay::server::{RelayServer, ServerCtx, UpstreamHandle};
use relay::upstream::UpstreamRelay;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(name = "mysql-relay", about = "MySQL binlog relay server")]
struct RelayArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c')]
    conf: PathBuf,

    #[arg(long)]
    log_level: Option<String>,

    /// Tokio worker threads.
    #[arg(long, default_value_t = 4)]
    works: usize,
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => ShutdownMessage::Cancel("ctrl-c".to_string()),
        _ = terminate => ShutdownMessage::Cancel("SIGTERM".to_string()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = RelayArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let config = Config::from_json_file(&args.conf)?;
    info!("relay starting with config {:?}", args.conf);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("MYSQL_RELAY")
        .worker_threads(args.works)
        .build()?;

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

        // one capture pipeline per configured upstream
        let mut handles: HashMap<String, UpstreamHandle> = HashMap::new();
        for upstream_cfg in config.upstreams.values() {
            let upstream = UpstreamRelay::new(upstream_cfg.clone())?;
            handles.insert(
                upstream.name().to_string(),
                UpstreamHandle {
                    index: upstream.index(),
                    local_dir: upstream.local_dir().to_path_buf(),
                },
            );
            let name = upstream.name().to_string();
            tokio::spawn(async move {
                if let Err(e) = upstream.run().await {
                    error!(upstream = %name, "upstream relay stopped: {e}");
                }
            });
        }

        let server = RelayServer::new(ServerCtx::new(&config, handles));
        tokio::select! {
            msg = shutdown_signal() => {
                let _ = shutdown_tx.send(msg.clone());
                if let ShutdownMessage::Cancel(reason) = msg {
                    info!("shutting down: {reason}");
                }
                Ok(())
            }
            result = server.run(shutdown_rx.clone()) => result.map_err(Into::into),
        }
    })
}
