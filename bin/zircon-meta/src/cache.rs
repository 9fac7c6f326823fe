//! The metadata cache: shard ownership and versioned write coordination.
//!
//! Shards are claimed on demand: the first request touching an unowned
//! shard attempts the claim, and requests for shards owned elsewhere fail
//! with `NotOwner` so the caller can reroute. Per-shard state (cached
//! records, pending writes) sits behind per-shard async locks so progress
//! stays parallel across shards.
//!
//! The write algorithm: `start_write` checks the version precondition and
//! hands out a target version under a pending entry; the client stages and
//! commits on the replicas; `commit_write` applies the quorum floor and
//! CAS-advances the record in etcd, which is the linearization point.
//! Pending entries expire by deadline with no etcd effect.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zircon_client::ConnectionCache;
use zircon_common::{
    ChunkId, Error, LeaseConfig, Metametadata, ReplicationConfig, Result, ServerAddress,
    ServerName, ServerRole, ShardId, Version, SHARD_COUNT,
};
use zircon_etcd::MetadataStore;
use zircon_proto::check;
use zircon_proto::chunkserver as cs_proto;

struct PendingWrite {
    chunk: ChunkId,
    base: Version,
    target: Version,
    locations: Vec<ServerName>,
    deadline: Instant,
}

#[derive(Default)]
struct ShardState {
    /// Read-through cache of the shard's records.
    meta: HashMap<ChunkId, Metametadata>,
    pending: HashMap<Uuid, PendingWrite>,
    /// Chunks minted here that have never been written, by creation time.
    pending_creates: HashMap<ChunkId, Instant>,
}

/// What `start_write` hands back to the client.
#[derive(Debug)]
pub struct StartedWrite {
    pub write_id: Uuid,
    pub base: Version,
    pub target: Version,
    pub locations: Vec<(ServerName, ServerAddress)>,
}

/// What `resolve` hands back to the client.
pub struct ResolvedChunk {
    pub version: Version,
    pub last_writer: Option<ServerName>,
    pub locations: Vec<(ServerName, ServerAddress)>,
}

pub struct MetadataCache {
    store: Arc<dyn MetadataStore>,
    cache: ConnectionCache,
    replication: ReplicationConfig,
    lease: LeaseConfig,
    peer_deadline: Duration,
    shards: Vec<tokio::sync::Mutex<ShardState>>,
    owned: RwLock<HashSet<ShardId>>,
    /// write id -> shard, so commit/abort can find the pending entry.
    write_index: parking_lot::Mutex<HashMap<Uuid, ShardId>>,
    /// Chunks flagged for the reconciler outside its regular scan.
    repair_queue: parking_lot::Mutex<HashSet<ChunkId>>,
    next_mint: AtomicUsize,
}

impl MetadataCache {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cache: ConnectionCache,
        replication: ReplicationConfig,
        lease: LeaseConfig,
        peer_deadline: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            replication,
            lease,
            peer_deadline,
            shards: (0..SHARD_COUNT)
                .map(|_| tokio::sync::Mutex::new(ShardState::default()))
                .collect(),
            owned: RwLock::new(HashSet::new()),
            write_index: parking_lot::Mutex::new(HashMap::new()),
            repair_queue: parking_lot::Mutex::new(HashSet::new()),
            next_mint: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &ServerName {
        self.store.name()
    }

    pub fn replication_target(&self) -> usize {
        self.replication.target
    }

    fn shard_state(&self, shard: ShardId) -> &tokio::sync::Mutex<ShardState> {
        &self.shards[shard.as_u32() as usize]
    }

    /// Claim the shard if nobody owns it; `NotOwner` if somebody else does.
    async fn ensure_owned(&self, shard: ShardId) -> Result<()> {
        if self.owned.read().contains(&shard) {
            return Ok(());
        }
        let owner = self.store.try_claiming_metadata(shard).await?;
        if owner != *self.store.name() {
            return Err(Error::NotOwner(owner));
        }
        // A fresh claim must not serve records cached under an earlier
        // ownership epoch.
        self.shard_state(shard).lock().await.meta.clear();
        self.owned.write().insert(shard);
        debug!(%shard, "claimed shard");
        Ok(())
    }

    pub fn owns(&self, shard: ShardId) -> bool {
        self.owned.read().contains(&shard)
    }

    /// Map a chunk to its record and addressed replicas.
    pub async fn resolve(&self, id: ChunkId) -> Result<ResolvedChunk> {
        let shard = id.shard();
        self.ensure_owned(shard).await?;
        let meta = {
            let mut state = self.shard_state(shard).lock().await;
            self.load_meta(&mut state, id).await?
        };
        if !meta.is_live() {
            return Err(Error::NotFound);
        }
        Ok(ResolvedChunk {
            version: meta.version,
            last_writer: meta.last_writer,
            locations: self.addressed(&meta.locations).await,
        })
    }

    /// Mint a chunk id and place its replica set. The record starts at
    /// version 0 bound to our metadata lease and stays invisible to readers
    /// until the first commit promotes it.
    pub async fn begin_new(&self) -> Result<ChunkId> {
        let shard = self.pick_mint_shard().await?;
        let id = self.store.next_chunk_id(shard).await?;
        let servers = self.store.list_servers(ServerRole::Chunkserver).await?;
        if servers.is_empty() {
            return Err(Error::unreachable("no chunkservers registered"));
        }
        let locations = rendezvous_select(&servers, id, self.replication.target);
        let meta = Metametadata {
            chunk_id: id,
            version: Version::ZERO,
            locations,
            last_writer: None,
            tombstone: false,
        };
        self.store.put_metametadata_ephemeral(meta.clone()).await?;
        let mut state = self.shard_state(shard).lock().await;
        state.meta.insert(id, meta);
        state.pending_creates.insert(id, Instant::now());
        Ok(id)
    }

    /// Open a coordinated write: verify the precondition, pick the target
    /// version, record the pending entry.
    pub async fn start_write(&self, id: ChunkId, expected: Version) -> Result<StartedWrite> {
        let shard = id.shard();
        self.ensure_owned(shard).await?;
        let mut state = self.shard_state(shard).lock().await;
        self.purge_pending(&mut state);
        let meta = self.load_meta(&mut state, id).await?;
        if meta.tombstone {
            return Err(Error::NotFound);
        }
        if meta.version.is_zero() && meta.locations.is_empty() {
            // Never minted; only BeginNew brings a chunk into existence.
            return Err(Error::NotFound);
        }
        if !meta.version.satisfies(expected) {
            return Err(Error::Stale(meta.version));
        }
        let write_id = Uuid::new_v4();
        let pending = PendingWrite {
            chunk: id,
            base: meta.version,
            target: meta.version.next(),
            locations: meta.locations.clone(),
            deadline: Instant::now() + self.lease.pending_write_ttl(),
        };
        let started = StartedWrite {
            write_id,
            base: pending.base,
            target: pending.target,
            locations: self.addressed(&pending.locations).await,
        };
        state.pending.insert(write_id, pending);
        self.write_index.lock().insert(write_id, shard);
        Ok(started)
    }

    /// Close a coordinated write with the set of replicas that committed.
    /// Applies the quorum floor, CAS-advances the record, prunes failed
    /// replicas out of the location set.
    pub async fn commit_write(&self, write_id: Uuid, succeeded: &[ServerName]) -> Result<Version> {
        let Some(shard) = self.write_index.lock().remove(&write_id) else {
            return Err(Error::NotFound);
        };
        self.ensure_owned(shard).await?;
        let mut state = self.shard_state(shard).lock().await;
        let Some(pending) = state.pending.remove(&write_id) else {
            return Err(Error::NotFound);
        };
        if pending.deadline <= Instant::now() {
            return Err(Error::NotFound);
        }
        let committed: Vec<ServerName> = pending
            .locations
            .iter()
            .filter(|name| succeeded.contains(name))
            .cloned()
            .collect();
        let required = self
            .replication
            .commit_floor
            .required(pending.locations.len());
        if committed.len() < required {
            drop(state);
            // Free any replica slots still staged, then let the reconciler
            // rewrite whichever replica committed ahead of the unchanged
            // record.
            self.abort_replicas(pending.chunk, &pending.locations).await;
            self.queue_repair(pending.chunk);
            return Err(Error::unreachable(format!(
                "insufficient commits: {}/{} (need {})",
                committed.len(),
                pending.locations.len(),
                required
            )));
        }
        let pruned = committed.len() < pending.locations.len();
        let new_meta = Metametadata {
            chunk_id: pending.chunk,
            version: pending.target,
            locations: committed,
            last_writer: Some(self.store.name().clone()),
            tombstone: false,
        };
        match self
            .store
            .update_metametadata(pending.chunk, pending.base, new_meta.clone())
            .await
        {
            Ok(()) => {
                state.meta.insert(pending.chunk, new_meta);
                state.pending_creates.remove(&pending.chunk);
                drop(state);
                if pruned {
                    self.queue_repair(pending.chunk);
                }
                Ok(pending.target)
            }
            Err(e) => {
                // The record moved or ownership lapsed; drop the cached copy.
                state.meta.remove(&pending.chunk);
                Err(e)
            }
        }
    }

    /// Drop a pending write; etcd was never touched.
    pub async fn abort_write(&self, write_id: Uuid) -> Result<()> {
        let Some(shard) = self.write_index.lock().remove(&write_id) else {
            return Ok(());
        };
        self.shard_state(shard).lock().await.pending.remove(&write_id);
        Ok(())
    }

    /// Commit a delete: tombstone the record at version + 1, then reap the
    /// replicas. Replicas that cannot be reached stay on the tombstone for
    /// the reconciler to retry.
    pub async fn commit_delete(&self, id: ChunkId, expected: Version) -> Result<()> {
        let shard = id.shard();
        self.ensure_owned(shard).await?;
        let tombstone = {
            let mut state = self.shard_state(shard).lock().await;
            let meta = self.load_meta(&mut state, id).await?;
            if !meta.is_live() {
                return Err(Error::NotFound);
            }
            if !meta.version.satisfies(expected) {
                return Err(Error::Stale(meta.version));
            }
            let tombstone = Metametadata {
                chunk_id: id,
                version: meta.version.next(),
                locations: meta.locations.clone(),
                last_writer: Some(self.store.name().clone()),
                tombstone: true,
            };
            self.store
                .update_metametadata(id, meta.version, tombstone.clone())
                .await?;
            state.meta.insert(id, tombstone.clone());
            tombstone
        };
        // Linearized; reaping is cleanup and may partially fail.
        if let Err(e) = self.reap_tombstone(&tombstone).await {
            warn!(chunk = %id, error = %e, "tombstone reap incomplete");
        }
        Ok(())
    }

    /// Instruct every replica of a tombstoned chunk to delete, dropping
    /// acknowledged replicas from the record; the record itself goes once
    /// the location set is empty.
    pub(crate) async fn reap_tombstone(&self, tombstone: &Metametadata) -> Result<()> {
        let id = tombstone.chunk_id;
        let mut remaining = Vec::new();
        for (name, address) in self.addressed(&tombstone.locations).await {
            if address.is_empty() {
                remaining.push(name);
                continue;
            }
            match self.delete_replica(id, address.as_str()).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => {
                    debug!(chunk = %id, replica = %name, error = %e, "replica reap failed");
                    remaining.push(name);
                }
            }
        }
        let shard = id.shard();
        let mut state = self.shard_state(shard).lock().await;
        if remaining.is_empty() {
            self.store.delete_metametadata(id).await?;
            state.meta.remove(&id);
            state.pending_creates.remove(&id);
        } else {
            let mut updated = tombstone.clone();
            updated.locations = remaining;
            self.store
                .update_metametadata(id, tombstone.version, updated.clone())
                .await?;
            state.meta.insert(id, updated);
        }
        Ok(())
    }

    /// Graceful surrender of every claim, for clean shutdown. Ungraceful
    /// exits reach the same end through lease expiry.
    pub async fn disclaim_all(&self) {
        let owned: Vec<ShardId> = self.owned.read().iter().copied().collect();
        for shard in owned {
            if let Err(e) = self.store.disclaim_metadata(shard).await {
                debug!(%shard, error = %e, "disclaim failed");
            }
        }
        self.reset_ownership().await;
    }

    /// Drop all owned shards and in-memory coordination state, after a
    /// lease lapse. Uncommitted writes die here, safely: their CAS never
    /// ran, so the new owner serves the pre-write version.
    pub async fn reset_ownership(&self) {
        let owned: Vec<ShardId> = self.owned.write().drain().collect();
        for shard in &owned {
            let mut state = self.shard_state(*shard).lock().await;
            state.meta.clear();
            state.pending.clear();
            state.pending_creates.clear();
        }
        self.write_index.lock().clear();
        warn!(shards = owned.len(), "released shard ownership");
    }

    /// Renewal loop: heartbeat at half the lease TTL, re-lease after a
    /// lapse, give up (Fatal) when etcd stays unreachable.
    pub async fn run_renewal(self: Arc<Self>) -> Result<()> {
        let period = self.store.metadata_lease_ttl() / 2;
        let mut consecutive_failures = 0u32;
        loop {
            tokio::time::sleep(period).await;
            match self.store.renew_metadata_claims().await {
                Ok(()) => consecutive_failures = 0,
                Err(Error::LeaseExpired) => {
                    warn!("metadata lease expired; dropping shard ownership");
                    self.reset_ownership().await;
                    match self.store.begin_metadata_lease().await {
                        Ok(()) | Err(Error::AlreadyExists) => consecutive_failures = 0,
                        Err(e) => {
                            warn!(error = %e, "could not re-establish metadata lease");
                            consecutive_failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "metadata lease renewal failed");
                    consecutive_failures += 1;
                }
            }
            if consecutive_failures > 5 {
                return Err(Error::fatal("etcd unavailable: giving up on lease renewal"));
            }
        }
    }

    /// Periodic sweep: expired pending writes and abandoned creations.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = (self.lease.pending_write_ttl() / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(cache) = cache.upgrade() else { return };
                cache.gc_once().await;
            }
        })
    }

    async fn gc_once(&self) {
        let owned: Vec<ShardId> = self.owned.read().iter().copied().collect();
        for shard in owned {
            let expired_creates: Vec<ChunkId> = {
                let mut state = self.shard_state(shard).lock().await;
                self.purge_pending(&mut state);
                let cutoff = Instant::now().checked_sub(self.lease.pending_create_ttl());
                let expired = state
                    .pending_creates
                    .iter()
                    .filter(|(_, created)| cutoff.is_some_and(|cutoff| **created <= cutoff))
                    .map(|(id, _)| *id)
                    .collect();
                expired
            };
            for id in expired_creates {
                if let Err(e) = self.reap_abandoned_create(shard, id).await {
                    debug!(chunk = %id, error = %e, "abandoned-create reap failed");
                }
            }
        }
    }

    /// Delete a chunk created by `New` but never written, once its creator
    /// session deadline has passed.
    async fn reap_abandoned_create(&self, shard: ShardId, id: ChunkId) -> Result<()> {
        let current = self.store.get_metametadata(id).await?;
        let mut state = self.shard_state(shard).lock().await;
        state.pending_creates.remove(&id);
        if current.is_pending_create() {
            info!(chunk = %id, "reaping never-written chunk");
            self.store.delete_metametadata(id).await?;
            state.meta.remove(&id);
        }
        Ok(())
    }

    pub fn queue_repair(&self, id: ChunkId) {
        self.repair_queue.lock().insert(id);
    }

    pub fn drain_repair_queue(&self) -> Vec<ChunkId> {
        self.repair_queue.lock().drain().collect()
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Update the cached copy of a record (reconciler writes through).
    pub(crate) async fn cache_record(&self, meta: Metametadata) {
        let shard = meta.chunk_id.shard();
        let mut state = self.shard_state(shard).lock().await;
        state.meta.insert(meta.chunk_id, meta);
    }

    async fn load_meta(&self, state: &mut ShardState, id: ChunkId) -> Result<Metametadata> {
        if let Some(meta) = state.meta.get(&id) {
            return Ok(meta.clone());
        }
        let meta = self.store.get_metametadata(id).await?;
        state.meta.insert(id, meta.clone());
        Ok(meta)
    }

    fn purge_pending(&self, state: &mut ShardState) {
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut index = self.write_index.lock();
        for write_id in expired {
            state.pending.remove(&write_id);
            index.remove(&write_id);
        }
    }

    /// Prefer a shard we already own; otherwise claim one, starting from a
    /// name-derived offset so servers spread across the space.
    async fn pick_mint_shard(&self) -> Result<ShardId> {
        {
            let owned = self.owned.read();
            if !owned.is_empty() {
                let nth = self.next_mint.fetch_add(1, Ordering::Relaxed) % owned.len();
                if let Some(shard) = owned.iter().nth(nth) {
                    return Ok(*shard);
                }
            }
        }
        let mut hasher = DefaultHasher::new();
        self.store.name().as_str().hash(&mut hasher);
        let start = (hasher.finish() % u64::from(SHARD_COUNT)) as u32;
        for i in 0..SHARD_COUNT {
            let shard = ShardId::from_raw((start + i) % SHARD_COUNT);
            match self.ensure_owned(shard).await {
                Ok(()) => return Ok(shard),
                Err(Error::NotOwner(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::unreachable("every metadata shard is owned elsewhere"))
    }

    async fn addressed(&self, names: &[ServerName]) -> Vec<(ServerName, ServerAddress)> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let address = self.store.get_address(name).await.unwrap_or_default();
            out.push((name.clone(), address));
        }
        out
    }

    /// Best-effort abort of any staged slot on the listed replicas.
    async fn abort_replicas(&self, id: ChunkId, locations: &[ServerName]) {
        for (name, address) in self.addressed(locations).await {
            if address.is_empty() {
                continue;
            }
            match self.cache.chunkserver(address.as_str()).await {
                Ok(mut cs) => {
                    let fut = cs.abort_write(cs_proto::AbortWriteRequest {
                        token: Vec::new(),
                        chunk_id: id.as_u64(),
                    });
                    if tokio::time::timeout(self.peer_deadline, fut).await.is_err() {
                        debug!(chunk = %id, replica = %name, "abort deadline exceeded");
                    }
                }
                Err(e) => debug!(chunk = %id, replica = %name, error = %e, "abort unreachable"),
            }
        }
    }

    async fn delete_replica(&self, id: ChunkId, address: &str) -> Result<()> {
        let mut cs = self.cache.chunkserver(address).await?;
        let fut = cs.delete(cs_proto::DeleteRequest {
            chunk_id: id.as_u64(),
            version: Version::ANY.as_u64(),
        });
        let resp = match tokio::time::timeout(self.peer_deadline, fut).await {
            Ok(Ok(resp)) => resp.into_inner(),
            Ok(Err(status)) => return Err(Error::unreachable(status.to_string())),
            Err(_) => return Err(Error::unreachable("delete deadline exceeded")),
        };
        check(resp.error)
    }

    pub(crate) fn connections(&self) -> &ConnectionCache {
        &self.cache
    }

    pub(crate) fn peer_deadline(&self) -> Duration {
        self.peer_deadline
    }
}

/// Rendezvous ranking of chunkservers for a chunk: the "least-loaded"
/// placeholder. Deterministic, spreads chunks across the fleet, needs no
/// load feed.
pub fn rendezvous_select(
    servers: &[(ServerName, ServerAddress)],
    id: ChunkId,
    count: usize,
) -> Vec<ServerName> {
    let mut ranked: Vec<(u64, &ServerName)> = servers
        .iter()
        .map(|(name, _)| {
            let mut hasher = DefaultHasher::new();
            name.as_str().hash(&mut hasher);
            id.as_u64().hash(&mut hasher);
            (hasher.finish(), name)
        })
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    ranked
        .into_iter()
        .take(count)
        .map(|(_, name)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zircon_common::CommitFloor;
    use zircon_etcd::MemoryCluster;

    const TTL: Duration = Duration::from_secs(60);

    fn lease_config() -> LeaseConfig {
        LeaseConfig::default()
    }

    async fn cluster_with_chunkservers(count: usize) -> MemoryCluster {
        let cluster = MemoryCluster::new(TTL);
        for i in 0..count {
            let handle = cluster.subscribe(format!("chunk-{i}"));
            handle
                .update_address(
                    ServerAddress::new(format!("127.0.0.1:{}", 42_000 + i)),
                    ServerRole::Chunkserver,
                )
                .await
                .unwrap();
        }
        cluster
    }

    async fn metadata_cache(
        cluster: &MemoryCluster,
        name: &str,
        replication: ReplicationConfig,
        lease: LeaseConfig,
    ) -> Arc<MetadataCache> {
        let store: Arc<dyn MetadataStore> = Arc::new(cluster.subscribe(name));
        store.begin_metadata_lease().await.unwrap();
        Arc::new(MetadataCache::new(
            store,
            ConnectionCache::new(Duration::from_secs(5)),
            replication,
            lease,
            Duration::from_millis(200),
        ))
    }

    fn all_names(started: &StartedWrite) -> Vec<ServerName> {
        started.locations.iter().map(|(n, _)| n.clone()).collect()
    }

    #[tokio::test]
    async fn versions_advance_by_one_per_commit() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc.begin_new().await.unwrap();
        // never-written chunks are invisible to readers
        assert!(matches!(mc.resolve(id).await, Err(Error::NotFound)));

        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        assert_eq!(started.base, Version::ZERO);
        assert_eq!(started.target, Version::from_raw(1));
        assert_eq!(started.locations.len(), 3);

        let names = all_names(&started);
        let committed = mc.commit_write(started.write_id, &names).await.unwrap();
        assert_eq!(committed, Version::from_raw(1));

        let resolved = mc.resolve(id).await.unwrap();
        assert_eq!(resolved.version, Version::from_raw(1));
        assert_eq!(resolved.locations.len(), 3);

        let started = mc.start_write(id, Version::from_raw(1)).await.unwrap();
        assert_eq!(started.target, Version::from_raw(2));
        let names = all_names(&started);
        assert_eq!(
            mc.commit_write(started.write_id, &names).await.unwrap(),
            Version::from_raw(2)
        );
    }

    #[tokio::test]
    async fn stale_write_carries_current_version() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc.begin_new().await.unwrap();
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        let names = all_names(&started);
        mc.commit_write(started.write_id, &names).await.unwrap();

        let err = mc.start_write(id, Version::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::Stale(v) if v == Version::from_raw(1)));
        // ANY bypasses the check
        let started = mc.start_write(id, Version::ANY).await.unwrap();
        assert_eq!(started.target, Version::from_raw(2));
    }

    #[tokio::test]
    async fn default_floor_rejects_partial_commits() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc.begin_new().await.unwrap();
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        let mut names = all_names(&started);
        names.truncate(2);
        let err = mc.commit_write(started.write_id, &names).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));

        // no CAS ran: the chunk is still unwritten and the chunk was queued
        // for a reconciliation probe
        assert!(matches!(mc.resolve(id).await, Err(Error::NotFound)));
        assert!(mc.drain_repair_queue().contains(&id));
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        assert_eq!(started.target, Version::from_raw(1));
    }

    #[tokio::test]
    async fn n_minus_one_floor_prunes_the_failed_replica() {
        let cluster = cluster_with_chunkservers(3).await;
        let replication = ReplicationConfig {
            target: 3,
            commit_floor: CommitFloor::NMinusOne,
        };
        let mc = metadata_cache(&cluster, "mc-a", replication, lease_config()).await;

        let id = mc.begin_new().await.unwrap();
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        let mut names = all_names(&started);
        let dropped = names.pop().unwrap();
        assert_eq!(
            mc.commit_write(started.write_id, &names).await.unwrap(),
            Version::from_raw(1)
        );

        let resolved = mc.resolve(id).await.unwrap();
        assert_eq!(resolved.version, Version::from_raw(1));
        assert_eq!(resolved.locations.len(), 2);
        assert!(!resolved.locations.iter().any(|(n, _)| *n == dropped));
        // under-replicated: flagged for reconciliation
        assert!(mc.drain_repair_queue().contains(&id));
    }

    #[tokio::test]
    async fn unknown_or_expired_write_ids_are_rejected() {
        let cluster = cluster_with_chunkservers(3).await;
        let mut lease = lease_config();
        lease.pending_write_ttl_ms = 1;
        let mc = metadata_cache(&cluster, "mc-a", ReplicationConfig::default(), lease).await;

        assert!(matches!(
            mc.commit_write(Uuid::new_v4(), &[]).await,
            Err(Error::NotFound)
        ));

        let id = mc.begin_new().await.unwrap();
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let names = all_names(&started);
        assert!(matches!(
            mc.commit_write(started.write_id, &names).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_tombstones_and_hides_the_chunk() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc.begin_new().await.unwrap();
        let started = mc.start_write(id, Version::ZERO).await.unwrap();
        let names = all_names(&started);
        mc.commit_write(started.write_id, &names).await.unwrap();

        assert!(matches!(
            mc.commit_delete(id, Version::from_raw(9)).await,
            Err(Error::Stale(v)) if v == Version::from_raw(1)
        ));
        mc.commit_delete(id, Version::from_raw(1)).await.unwrap();

        assert!(matches!(mc.resolve(id).await, Err(Error::NotFound)));
        assert!(matches!(
            mc.start_write(id, Version::ANY).await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            mc.commit_delete(id, Version::ANY).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn foreign_shards_answer_not_owner() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc_a = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;
        let mc_b = metadata_cache(
            &cluster,
            "mc-b",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc_a.begin_new().await.unwrap();
        let err = mc_b.start_write(id, Version::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner(owner) if owner.as_str() == "mc-a"));
    }

    #[tokio::test]
    async fn handoff_drops_uncommitted_writes() {
        let cluster = cluster_with_chunkservers(3).await;
        let mc_a = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        let id = mc_a.begin_new().await.unwrap();
        let started = mc_a.start_write(id, Version::ZERO).await.unwrap();
        let names = all_names(&started);
        mc_a.commit_write(started.write_id, &names).await.unwrap();

        // a second write is coordinated but never committed
        let uncommitted = mc_a.start_write(id, Version::from_raw(1)).await.unwrap();

        // kill mc-a without disclaim; after the lease lapses mc-b takes over
        cluster.expire_lease(mc_a.name());
        let mc_b = metadata_cache(
            &cluster,
            "mc-b",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;

        // the client retry sees the pre-write version at the new owner
        let resolved = mc_b.resolve(id).await.unwrap();
        assert_eq!(resolved.version, Version::from_raw(1));
        let retried = mc_b.start_write(id, Version::from_raw(1)).await.unwrap();
        assert_eq!(retried.target, Version::from_raw(2));

        // and the stale coordinator can no longer commit its pending write
        let names = all_names(&uncommitted);
        assert!(mc_a
            .commit_write(uncommitted.write_id, &names)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn begin_new_needs_chunkservers() {
        let cluster = MemoryCluster::new(TTL);
        let mc = metadata_cache(
            &cluster,
            "mc-a",
            ReplicationConfig::default(),
            lease_config(),
        )
        .await;
        assert!(matches!(
            mc.begin_new().await,
            Err(Error::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_creates_are_reaped() {
        let cluster = cluster_with_chunkservers(3).await;
        let mut lease = lease_config();
        lease.pending_create_ttl_ms = 0;
        let mc = metadata_cache(&cluster, "mc-a", ReplicationConfig::default(), lease).await;

        let id = mc.begin_new().await.unwrap();
        mc.gc_once().await;
        assert!(matches!(mc.resolve(id).await, Err(Error::NotFound)));
        assert!(mc.store().scan_metadata().await.unwrap().is_empty());
    }

    #[test]
    fn rendezvous_is_deterministic_and_distinct() {
        let servers: Vec<(ServerName, ServerAddress)> = (0..5)
            .map(|i| {
                (
                    ServerName::new(format!("chunk-{i}")),
                    ServerAddress::new(format!("127.0.0.1:{i}")),
                )
            })
            .collect();
        let id = ChunkId::from_raw(0xfeed);
        let first = rendezvous_select(&servers, id, 3);
        let second = rendezvous_select(&servers, id, 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        let unique: HashSet<&ServerName> = first.iter().collect();
        assert_eq!(unique.len(), 3);
        // a different chunk generally ranks differently; at minimum the
        // selection stays within the fleet
        let other = rendezvous_select(&servers, ChunkId::from_raw(0xbeef), 3);
        assert!(other.iter().all(|name| servers.iter().any(|(n, _)| n == name)));
    }
}
