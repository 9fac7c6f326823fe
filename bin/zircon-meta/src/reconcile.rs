//! Background reconciliation.
//!
//! Each scan walks the owned shards and restores invariants the write path
//! could not finish synchronously: under-replicated chunks get a new replica
//! copied from a healthy source, replicas whose tag disagrees with the
//! record are rewritten in place, and tombstones retry their replica reaps.

use crate::cache::{rendezvous_select, MetadataCache};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zircon_common::{ChunkId, Error, Metametadata, ReconcileConfig, Result, ServerRole, Version};
use zircon_proto::check;
use zircon_proto::chunkserver as cs_proto;

pub async fn run_reconciler(cache: Arc<MetadataCache>, config: ReconcileConfig) {
    let mut interval = tokio::time::interval(config.scan_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = tick(&cache, config.max_concurrent).await {
            warn!(error = %e, "reconciliation scan failed");
        }
    }
}

async fn tick(cache: &Arc<MetadataCache>, max_concurrent: usize) -> Result<()> {
    let mut targets: HashSet<ChunkId> = cache.drain_repair_queue().into_iter().collect();
    for meta in cache.store().scan_metadata().await? {
        if !cache.owns(meta.chunk_id.shard()) {
            continue;
        }
        if meta.tombstone || (meta.is_live() && meta.locations.len() < cache.replication_target())
        {
            targets.insert(meta.chunk_id);
        }
    }
    if targets.is_empty() {
        return Ok(());
    }
    debug!(chunks = targets.len(), "reconciling");
    stream::iter(targets)
        .for_each_concurrent(max_concurrent.max(1), |id| {
            let cache = cache.clone();
            async move {
                if let Err(e) = reconcile_chunk(&cache, id).await {
                    debug!(chunk = %id, error = %e, "reconciliation deferred");
                }
            }
        })
        .await;
    Ok(())
}

async fn reconcile_chunk(cache: &Arc<MetadataCache>, id: ChunkId) -> Result<()> {
    if !cache.owns(id.shard()) {
        return Ok(());
    }
    // Work from the authoritative record, not the read-through cache.
    let meta = cache.store().get_metametadata(id).await?;
    if meta.tombstone {
        return cache.reap_tombstone(&meta).await;
    }
    if !meta.is_live() {
        return Ok(());
    }
    repair_replication(cache, meta).await
}

/// Probe the listed replicas, rewrite strays, and copy to new hosts until
/// the replication target is met again.
async fn repair_replication(cache: &Arc<MetadataCache>, meta: Metametadata) -> Result<()> {
    let id = meta.chunk_id;
    let mut healthy = Vec::new();
    let mut strays = Vec::new();
    for (name, address) in addressed(cache, &meta).await {
        if address.is_empty() {
            continue;
        }
        match probe_replica(cache, id, &address).await {
            Ok(version) if version == meta.version => healthy.push((name, address)),
            Ok(version) => {
                debug!(chunk = %id, replica = %name, replica_version = %version,
                       record_version = %meta.version, "stray replica");
                strays.push((name, address));
            }
            Err(e) => debug!(chunk = %id, replica = %name, error = %e, "replica probe failed"),
        }
    }
    let Some((_, source_address)) = healthy.first().cloned() else {
        warn!(chunk = %id, "no healthy replica to repair from");
        return Ok(());
    };

    // Rewrite strays in place first; they are already in the location set.
    for (name, address) in strays {
        if let Err(e) =
            replicate(cache, id, address.as_str(), &source_address, meta.version).await
        {
            debug!(chunk = %id, replica = %name, error = %e, "stray rewrite failed");
        }
    }

    // Then extend the location set back up to the replication target.
    let shortfall = cache
        .replication_target()
        .saturating_sub(meta.locations.len());
    if shortfall == 0 {
        return Ok(());
    }
    let servers = cache.store().list_servers(ServerRole::Chunkserver).await?;
    let candidates: Vec<_> = servers
        .into_iter()
        .filter(|(name, _)| !meta.locations.contains(name))
        .collect();
    let mut updated = meta.clone();
    let mut added = 0usize;
    for name in rendezvous_select(&candidates, id, candidates.len()) {
        if added == shortfall {
            break;
        }
        let Some((_, address)) = candidates.iter().find(|(n, _)| *n == name) else {
            continue;
        };
        match replicate(cache, id, address.as_str(), &source_address, meta.version).await {
            Ok(()) => {
                updated.locations.push(name.clone());
                added += 1;
                info!(chunk = %id, replica = %name, "replication restored");
            }
            Err(e) => debug!(chunk = %id, replica = %name, error = %e, "copy failed"),
        }
    }
    if added > 0 {
        cache
            .store()
            .update_metametadata(id, meta.version, updated.clone())
            .await?;
        cache.cache_record(updated).await;
    }
    Ok(())
}

async fn addressed(
    cache: &Arc<MetadataCache>,
    meta: &Metametadata,
) -> Vec<(zircon_common::ServerName, zircon_common::ServerAddress)> {
    let mut out = Vec::with_capacity(meta.locations.len());
    for name in &meta.locations {
        let address = cache.store().get_address(name).await.unwrap_or_default();
        out.push((name.clone(), address));
    }
    out
}

/// The replica's version tag, or an error if unreachable or corrupt.
async fn probe_replica(
    cache: &Arc<MetadataCache>,
    id: ChunkId,
    address: &zircon_common::ServerAddress,
) -> Result<Version> {
    let mut cs = cache.connections().chunkserver(address.as_str()).await?;
    let fut = cs.exists(cs_proto::ExistsRequest {
        chunk_id: id.as_u64(),
    });
    let resp = match tokio::time::timeout(cache.peer_deadline(), fut).await {
        Ok(Ok(resp)) => resp.into_inner(),
        Ok(Err(status)) => return Err(Error::unreachable(status.to_string())),
        Err(_) => return Err(Error::unreachable("probe deadline exceeded")),
    };
    check(resp.error)?;
    if !resp.exists {
        return Err(Error::NotFound);
    }
    Ok(Version::from_raw(resp.version))
}

/// Ask `destination` to pull the chunk from `source` at `version`.
async fn replicate(
    cache: &Arc<MetadataCache>,
    id: ChunkId,
    destination: &str,
    source: &zircon_common::ServerAddress,
    version: Version,
) -> Result<()> {
    let mut cs = cache.connections().chunkserver(destination).await?;
    let fut = cs.replicate_from(cs_proto::ReplicateFromRequest {
        chunk_id: id.as_u64(),
        peer_address: source.as_str().to_string(),
        version: version.as_u64(),
    });
    let resp = match tokio::time::timeout(cache.peer_deadline(), fut).await {
        Ok(Ok(resp)) => resp.into_inner(),
        Ok(Err(status)) => return Err(Error::unreachable(status.to_string())),
        Err(_) => return Err(Error::unreachable("replicate deadline exceeded")),
    };
    check(resp.error)
}
