#![warn(missing_docs)]

//! metafs metadata server daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metafs_mds::{MdsConfig, MdsService, MemoryMounter};
use metafs_transport::tcp::TcpTransport;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "metafs-mds", version, about = "metafs metadata server")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "METAFS_MDS_CONFIG")]
    config: Option<PathBuf>,

    /// Backing filesystem type.
    #[arg(long)]
    fstype: Option<String>,

    /// Backing device.
    #[arg(long)]
    device: Option<String>,

    /// Listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Worker tasks.
    #[arg(long)]
    workers: Option<usize>,

    /// Log as JSON.
    #[arg(long)]
    log_json: bool,
}

fn load_config(args: &Args) -> Result<MdsConfig> {
    let mut config = match &args.config {
        Some(path) => MdsConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MdsConfig::default(),
    };
    if let Some(fstype) = &args.fstype {
        config.mount.fstype = fstype.clone();
    }
    if let Some(device) = &args.device {
        config.mount.device = device.clone();
    }
    if let Some(listen) = &args.listen {
        config.service.listen_addr = listen.clone();
    }
    if let Some(workers) = args.workers {
        config.service.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (plain, json) = if args.log_json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("metafs MDS starting...");

    let config = load_config(&args)?;
    let transport = Arc::new(TcpTransport::new(config.service.listen_addr.clone()));
    let mounter = Arc::new(MemoryMounter::new());
    let service = MdsService::new(config, mounter, transport.clone());

    service.setup().await.context("MDS setup failed")?;
    if let Some(addr) = transport.local_addr() {
        tracing::info!(%addr, "accepting requests");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    service.teardown().await.context("MDS teardown failed")?;
    let stats = service.stats().snapshot();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "final counters");
    Ok(())
}
