//! Zircon chunkserver - replica storage daemon
//!
//! Owns a local store of chunk blobs, serves reads, and participates in the
//! two-phase replicated write protocol.

mod service;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use service::ChunkserverGrpc;
use state::ChunkserverState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zircon_client::ConnectionCache;
use zircon_common::{Config, ServerAddress, ServerName, ServerRole};
use zircon_etcd::{EtcdSession, MetadataStore};
use zircon_proto::chunkserver::chunkserver_service_server::ChunkserverServiceServer;

#[derive(Parser, Debug)]
#[command(name = "zircon-chunkserver")]
#[command(about = "Zircon chunkserver daemon")]
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

    info!(server = %name, "beginning chunkserver launch");

    let storage = zircon_storage::open_storage(&config).await?;
    let cache = ConnectionCache::new(config.client_config.connection_idle_ttl());
    let state = Arc::new(ChunkserverState::new(
        storage,
        cache.clone(),
        config.lease.staged_write_ttl(),
        config.client_config.request_deadline(),
    ));
    state.recover().await?;
    let gc = state.spawn_gc();

    info!(server = %name, "subscribing to etcd");
    let session = EtcdSession::connect(
        name.clone(),
        &config.etcd_servers,
        Duration::from_secs(config.lease.metadata_ttl_secs as u64),
    )
    .await?;

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("bind {}", config.address))?;
    let bound = listener.local_addr()?;
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| anyhow::anyhow!("listener setup: {e}"))?;

    session
        .update_address(
            ServerAddress::new(bound.to_string()),
            ServerRole::Chunkserver,
        )
        .await?;

    info!(
        server = %name,
        address = %bound,
        storage = ?config.storage_type,
        "launched chunkserver"
    );

    Server::builder()
        .add_service(ChunkserverServiceServer::new(ChunkserverGrpc::new(state)))
        .serve_with_incoming_shutdown(incoming, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;

    gc.abort();
    session.shutdown().await;
    cache.close_all().await;
    info!("chunkserver shut down cleanly");
    Ok(())
}
