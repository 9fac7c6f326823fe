//! Zircon metadata cache - chunk metadata ownership daemon
//!
//! Owns metadata shards under an etcd lease, resolves chunk ids to replica
//! sets, and coordinates the version bump on every write.

mod cache;
mod reconcile;
mod service;

use anyhow::{Context, Result};
use cache::MetadataCache;
use clap::Parser;
use service::MetadataCacheGrpc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zircon_client::ConnectionCache;
use zircon_common::{Config, ServerAddress, ServerName, ServerRole};
use zircon_etcd::{EtcdSession, MetadataStore};
use zircon_proto::meta::metadata_cache_service_server::MetadataCacheServiceServer;

#[derive(Parser, Debug)]
#[command(name = "zircon-meta")]
#[command(about = "Zircon metadata-cache daemon")]
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
    session.begin_metadata_lease().await?;

    let conncache = ConnectionCache::new(config.client_config.connection_idle_ttl());
    let store: Arc<dyn MetadataStore> = session.clone();
    let mc = Arc::new(MetadataCache::new(
        store,
        conncache.clone(),
        config.replication.clone(),
        config.lease.clone(),
        config.client_config.request_deadline(),
    ));

    let gc = mc.spawn_gc();
    let reconciler = tokio::spawn(reconcile::run_reconciler(
        mc.clone(),
        config.reconcile.clone(),
    ));
    let renewal = tokio::spawn(mc.clone().run_renewal());

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("bind {}", config.address))?;
    let bound = listener.local_addr()?;
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| anyhow::anyhow!("listener setup: {e}"))?;

    session
        .update_address(
            ServerAddress::new(bound.to_string()),
            ServerRole::MetadataCache,
        )
        .await?;

    info!(server = %name, address = %bound, "launched metadata cache");

    let server = Server::builder()
        .add_service(MetadataCacheServiceServer::new(MetadataCacheGrpc::new(
            mc.clone(),
        )))
        .serve_with_incoming_shutdown(incoming, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        });

    // The renewal loop only returns on a fatal etcd condition; that takes
    // the process down with it.
    let result = tokio::select! {
        served = server => served.map_err(anyhow::Error::from),
        renewed = renewal => match renewed {
            Ok(Err(e)) => {
                error!(error = %e, "metadata lease irrecoverable");
                Err(anyhow::Error::from(e))
            }
            Ok(Ok(())) => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)),
        },
    };

    gc.abort();
    reconciler.abort();
    mc.disclaim_all().await;
    session.shutdown().await;
    conncache.close_all().await;
    match result {
        Ok(()) => {
            info!("metadata cache shut down cleanly");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
