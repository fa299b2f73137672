use anyhow::Result;
use brickfs_mgmt::cli::{Cli, Command};
use brickfs_mgmt::http_transport::{HttpBrickTransport, HttpPeerTransport};
use brickfs_mgmt::services::InMemorySupervisor;
use brickfs_mgmt::state::ClusterState;
use brickfs_mgmt::store::FileStore;
use brickfs_mgmt::{AdminApi, MgmtConfig, MgmtDaemon};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            bind,
            hostname,
            workdir,
        } => serve(config, bind, hostname, workdir).await,
        _ => {
            init_tracing("warn");
            cli.run().await
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

async fn serve(
    config_path: PathBuf,
    bind: Option<SocketAddr>,
    hostname: Option<String>,
    workdir: Option<PathBuf>,
) -> Result<()> {
    let config_found = config_path.exists();
    let mut config = if config_found {
        MgmtConfig::from_file(&config_path)?
    } else {
        MgmtConfig::default()
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
        config.port = bind.port();
    }
    if let Some(hostname) = hostname {
        config.hostname = hostname;
    }
    if let Some(workdir) = workdir {
        config.workdir = workdir;
    }

    init_tracing(&config.log_level);
    if !config_found {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
    }
    tracing::info!("BrickFS management daemon starting...");

    std::fs::create_dir_all(&config.workdir)?;
    let store = Arc::new(FileStore::new(config.workdir.clone()));
    // helper processes are tracked in memory; launching them is left to the host
    let services = Arc::new(InMemorySupervisor::new());
    let state = Arc::new(ClusterState::new(
        config.hostname.clone(),
        config.port,
        config.workdir.clone(),
        store,
        services,
    )?);

    let daemon = Arc::new(MgmtDaemon::new(
        state,
        Arc::new(HttpPeerTransport::new(config.frame_timeout())),
        Arc::new(HttpBrickTransport::new(config.frame_timeout())),
        config.frame_timeout(),
        config.disconnect_grace(),
    ));
    let config = Arc::new(config);

    let heartbeat_daemon = daemon.clone();
    let interval = config.heartbeat_interval();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            heartbeat_daemon.refresh_peers().await;
        }
    });

    let api = AdminApi::new(daemon, config);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::select! {
        _ = heartbeat_handle => {}
        _ = api_handle => {}
    }

    Ok(())
}
