//! Zircon frontend - stateless chunk-id router
//!
//! Maps chunk ids to the metadata cache responsible for their shard, from a
//! watch-maintained view of the etcd registry.

mod registry;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use registry::RegistryCache;
use service::FrontendGrpc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zircon_common::{Config, ServerAddress, ServerName, ServerRole};
use zircon_etcd::{EtcdSession, MetadataStore};
use zircon_proto::frontend::frontend_service_server::FrontendServiceServer;

#[derive(Parser, Debug)]
#[command(name = "zircon-frontend")]
#[command(about = "Zircon frontend daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/zircon/zircon.toml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the configured server name
    #[arg(long)]
    name: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.address = listen;
    }
    if let Some(name) = args.name {
        config.server_name = name;
    }
    let name = ServerName::new(config.server_name.clone());

    info!(server = %name, "subscribing to etcd");
    let session = EtcdSession::connect(
        name.clone(),
        &config.etcd_servers,
        Duration::from_secs(config.lease.metadata_ttl_secs as u64),
    )
    .await?;

    let registry = RegistryCache::new(session.clone()).await?;
    let watchers = registry.spawn_watchers();

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("bind {}", config.address))?;
    let bound = listener.local_addr()?;
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| anyhow::anyhow!("listener setup: {e}"))?;

    session
        .update_address(ServerAddress::new(bound.to_string()), ServerRole::Frontend)
        .await?;

    info!(server = %name, address = %bound, "launched frontend");

    Server::builder()
        .add_service(FrontendServiceServer::new(FrontendGrpc::new(registry)))
        .serve_with_incoming_shutdown(incoming, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;

    for watcher in watchers {
        watcher.abort();
    }
    session.shutdown().await;
    info!("frontend shut down cleanly");
    Ok(())
}
