//! Watch-maintained view of the fleet.
//!
//! Two etcd prefix watches keep a local copy of the server registry and the
//! shard-claim table. A watch that ends or errors triggers a full snapshot
//! reload before re-watching, so the cache converges after any interruption.

use etcd_client::EventType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zircon_common::{
    ChunkId, Error, Result, ServerAddress, ServerName, ServerRole, ShardId,
};
use zircon_etcd::{keys, EtcdSession, RegistryEntry};

pub struct RegistryCache {
    session: Arc<EtcdSession>,
    servers: RwLock<HashMap<ServerName, RegistryEntry>>,
    shard_owners: RwLock<HashMap<ShardId, ServerName>>,
    round_robin: AtomicUsize,
}

impl RegistryCache {
    pub async fn new(session: Arc<EtcdSession>) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            session,
            servers: RwLock::new(HashMap::new()),
            shard_owners: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        });
        cache.reload().await?;
        Ok(cache)
    }

    /// Route a chunk to a metadata cache: its shard's owner when one is
    /// claimed and live, otherwise a live metadata cache round-robin (the
    /// chosen server claims the shard on first touch).
    pub fn locate(&self, id: ChunkId) -> Result<ServerAddress> {
        let shard = id.shard();
        let servers = self.servers.read();
        let owners = self.shard_owners.read();
        let rr = self.round_robin.fetch_add(1, Ordering::Relaxed);
        select_cache(&servers, owners.get(&shard), shard, rr)
    }

    /// Spawn the two prefix watches feeding this cache.
    pub fn spawn_watchers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_watch(keys::SERVERS_PREFIX),
            self.spawn_watch(keys::SHARDS_PREFIX),
        ]
    }

    fn spawn_watch(self: &Arc<Self>, prefix: &'static str) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(strong) = cache.upgrade() else { return };
                if let Err(e) = strong.watch_once(prefix).await {
                    warn!(prefix, error = %e, "watch interrupted; reloading");
                }
                drop(strong);
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(strong) = cache.upgrade() else { return };
                if let Err(e) = strong.reload().await {
                    warn!(error = %e, "registry reload failed");
                }
            }
        })
    }

    async fn watch_once(&self, prefix: &str) -> Result<()> {
        let (_watcher, mut stream) = self.session.watch_prefix(prefix).await?;
        while let Some(resp) = stream
            .message()
            .await
            .map_err(|e| Error::unreachable(format!("etcd watch: {e}")))?
        {
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let Ok(key) = kv.key_str() else { continue };
                match event.event_type() {
                    EventType::Put => self.apply_put(key, kv.value()),
                    EventType::Delete => self.apply_delete(key),
                }
            }
        }
        Err(Error::unreachable("etcd watch stream closed"))
    }

    fn apply_put(&self, key: &str, value: &[u8]) {
        if let Some(name) = keys::parse_server_key(key) {
            match serde_json::from_slice::<RegistryEntry>(value) {
                Ok(entry) => {
                    self.servers.write().insert(name, entry);
                }
                Err(e) => warn!(server = %name, error = %e, "malformed registry entry"),
            }
        } else if let Some(shard) = keys::parse_shard_key(key) {
            match std::str::from_utf8(value) {
                Ok(owner) => {
                    self.shard_owners
                        .write()
                        .insert(shard, ServerName::new(owner));
                }
                Err(_) => warn!(%shard, "malformed shard owner"),
            }
        }
    }

    fn apply_delete(&self, key: &str) {
        if let Some(name) = keys::parse_server_key(key) {
            self.servers.write().remove(&name);
        } else if let Some(shard) = keys::parse_shard_key(key) {
            self.shard_owners.write().remove(&shard);
        }
    }

    /// Replace both tables from fresh snapshots.
    async fn reload(&self) -> Result<()> {
        let servers = self.session.snapshot_servers().await?;
        let owners = self.session.snapshot_shard_owners().await?;
        *self.servers.write() = servers.into_iter().collect();
        *self.shard_owners.write() = owners.into_iter().collect();
        Ok(())
    }
}

/// The routing decision, separated from the cache plumbing.
fn select_cache(
    servers: &HashMap<ServerName, RegistryEntry>,
    owner: Option<&ServerName>,
    shard: ShardId,
    round_robin: usize,
) -> Result<ServerAddress> {
    if let Some(owner) = owner {
        if let Some(entry) = servers.get(owner) {
            if entry.role == ServerRole::MetadataCache {
                return Ok(entry.address.clone());
            }
        }
        // Owner registered no address (yet); fall through to any MC and let
        // NotOwner rerouting sort it out.
        debug!(%shard, %owner, "shard owner not in registry");
    }
    let mut caches: Vec<&RegistryEntry> = servers
        .values()
        .filter(|entry| entry.role == ServerRole::MetadataCache)
        .collect();
    if caches.is_empty() {
        return Err(Error::unreachable("no metadata caches registered"));
    }
    caches.sort_by_key(|entry| entry.id);
    Ok(caches[round_robin % caches.len()].address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zircon_common::ServerId;

    fn entry(address: &str, role: ServerRole, id: u64) -> RegistryEntry {
        RegistryEntry {
            address: ServerAddress::new(address),
            role,
            id: ServerId::from_raw(id),
        }
    }

    fn fleet() -> HashMap<ServerName, RegistryEntry> {
        HashMap::from([
            (
                ServerName::new("mc-a"),
                entry("127.0.0.1:1", ServerRole::MetadataCache, 1),
            ),
            (
                ServerName::new("mc-b"),
                entry("127.0.0.1:2", ServerRole::MetadataCache, 2),
            ),
            (
                ServerName::new("chunk-1"),
                entry("127.0.0.1:3", ServerRole::Chunkserver, 3),
            ),
        ])
    }

    #[test]
    fn claimed_shard_routes_to_its_owner() {
        let servers = fleet();
        let owner = ServerName::new("mc-b");
        let address =
            select_cache(&servers, Some(&owner), ShardId::from_raw(7), 0).unwrap();
        assert_eq!(address, ServerAddress::new("127.0.0.1:2"));
    }

    #[test]
    fn unclaimed_shard_round_robins_over_caches() {
        let servers = fleet();
        let a = select_cache(&servers, None, ShardId::from_raw(7), 0).unwrap();
        let b = select_cache(&servers, None, ShardId::from_raw(7), 1).unwrap();
        assert_ne!(a, b);
        let again = select_cache(&servers, None, ShardId::from_raw(7), 2).unwrap();
        assert_eq!(a, again);
    }

    #[test]
    fn vanished_owner_falls_back_to_round_robin() {
        let servers = fleet();
        let owner = ServerName::new("mc-gone");
        let address =
            select_cache(&servers, Some(&owner), ShardId::from_raw(7), 0).unwrap();
        assert!(
            address == ServerAddress::new("127.0.0.1:1")
                || address == ServerAddress::new("127.0.0.1:2")
        );
    }

    #[test]
    fn chunkservers_are_never_routing_targets() {
        let mut servers = HashMap::new();
        servers.insert(
            ServerName::new("chunk-1"),
            entry("127.0.0.1:3", ServerRole::Chunkserver, 3),
        );
        assert!(matches!(
            select_cache(&servers, None, ShardId::from_raw(7), 0),
            Err(Error::Unreachable(_))
        ));
    }
}
