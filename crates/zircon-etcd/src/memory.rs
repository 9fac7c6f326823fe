//! In-process metadata store with real lease-expiry semantics.
//!
//! Several `MemoryMetadataStore` handles subscribed to one `MemoryCluster`
//! behave like separate servers sharing one etcd: claims require a live
//! metadata lease, expiry releases claims and reaps ephemeral records, CAS
//! updates check the stored version. Used by the metadata-cache tests and
//! single-process demos.

use crate::keys::RegistryEntry;
use crate::store::MetadataStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use zircon_common::{
    ChunkId, Error, Metametadata, Result, ServerAddress, ServerId, ServerName, ServerRole,
    ShardId, Version, SHARD_COUNT,
};

#[derive(Default)]
struct Shared {
    /// Live metadata leases by owner, with expiry instants.
    leases: HashMap<ServerName, Instant>,
    claims: HashMap<ShardId, ServerName>,
    meta: HashMap<ChunkId, MetaRecord>,
    counters: HashMap<ShardId, u64>,
    servers: HashMap<ServerName, RegistryEntry>,
    server_id_counter: u64,
}

struct MetaRecord {
    meta: Metametadata,
    /// Set while the record is bound to its minting server's lease.
    ephemeral_owner: Option<ServerName>,
}

impl Shared {
    /// Drop expired leases along with their claims and ephemeral records.
    fn purge(&mut self, now: Instant) {
        let expired: Vec<ServerName> = self
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.drop_lease(&name);
        }
    }

    fn drop_lease(&mut self, name: &ServerName) {
        self.leases.remove(name);
        self.claims.retain(|_, owner| owner != name);
        self.meta
            .retain(|_, record| record.ephemeral_owner.as_ref() != Some(name));
    }

    fn owner(&self, shard: ShardId) -> Option<&ServerName> {
        self.claims.get(&shard)
    }
}

/// A shared in-process "etcd" multiple stores subscribe to.
#[derive(Clone)]
pub struct MemoryCluster {
    shared: Arc<Mutex<Shared>>,
    ttl: Duration,
}

impl MemoryCluster {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            ttl,
        }
    }

    /// A store handle acting as the named server.
    #[must_use]
    pub fn subscribe(&self, name: impl Into<String>) -> MemoryMetadataStore {
        MemoryMetadataStore {
            name: ServerName::new(name),
            ttl: self.ttl,
            shared: self.shared.clone(),
        }
    }

    /// Forcibly expire a server's metadata lease (kill without disclaim).
    pub fn expire_lease(&self, name: &ServerName) {
        self.shared.lock().drop_lease(name);
    }

    /// Drop a server's registry entry, as session-lease expiry would.
    pub fn drop_registration(&self, name: &ServerName) {
        self.shared.lock().servers.remove(name);
    }
}

pub struct MemoryMetadataStore {
    name: ServerName,
    ttl: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryMetadataStore {
    fn ensure_owner(&self, shared: &Shared, shard: ShardId) -> Result<()> {
        match shared.owner(shard) {
            Some(owner) if *owner == self.name => Ok(()),
            Some(owner) => Err(Error::NotOwner(owner.clone())),
            None => Err(Error::NotOwner(ServerName::default())),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    fn name(&self) -> &ServerName {
        &self.name
    }

    fn metadata_lease_ttl(&self) -> Duration {
        self.ttl
    }

    async fn begin_metadata_lease(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        shared.purge(now);
        if shared.leases.contains_key(&self.name) {
            return Err(Error::AlreadyExists);
        }
        shared.leases.insert(self.name.clone(), now + self.ttl);
        Ok(())
    }

    async fn renew_metadata_claims(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        shared.purge(now);
        match shared.leases.get_mut(&self.name) {
            Some(deadline) => {
                *deadline = now + self.ttl;
                Ok(())
            }
            None => Err(Error::LeaseExpired),
        }
    }

    async fn try_claiming_metadata(&self, shard: ShardId) -> Result<ServerName> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        shared.purge(now);
        if !shared.leases.contains_key(&self.name) {
            return Err(Error::LeaseExpired);
        }
        let owner = shared
            .claims
            .entry(shard)
            .or_insert_with(|| self.name.clone());
        Ok(owner.clone())
    }

    async fn disclaim_metadata(&self, shard: ShardId) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.purge(Instant::now());
        match shared.claims.get(&shard) {
            Some(owner) if *owner == self.name => {
                shared.claims.remove(&shard);
                Ok(())
            }
            Some(owner) => Err(Error::NotOwner(owner.clone())),
            None => Err(Error::NotFound),
        }
    }

    async fn get_metametadata(&self, id: ChunkId) -> Result<Metametadata> {
        let mut shared = self.shared.lock();
        shared.purge(Instant::now());
        self.ensure_owner(&shared, id.shard())?;
        Ok(shared
            .meta
            .get(&id)
            .map(|record| record.meta.clone())
            .unwrap_or_else(|| Metametadata::zero(id)))
    }

    async fn update_metametadata(
        &self,
        id: ChunkId,
        expected: Version,
        meta: Metametadata,
    ) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.purge(Instant::now());
        self.ensure_owner(&shared, id.shard())?;
        let current = shared
            .meta
            .get(&id)
            .map(|record| record.meta.version)
            .unwrap_or(Version::ZERO);
        if !current.satisfies(expected) {
            return Err(Error::Stale(current));
        }
        shared.meta.insert(
            id,
            MetaRecord {
                meta,
                ephemeral_owner: None,
            },
        );
        Ok(())
    }

    async fn put_metametadata_ephemeral(&self, meta: Metametadata) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.purge(Instant::now());
        if !shared.leases.contains_key(&self.name) {
            return Err(Error::LeaseExpired);
        }
        self.ensure_owner(&shared, meta.chunk_id.shard())?;
        if shared.meta.contains_key(&meta.chunk_id) {
            return Err(Error::AlreadyExists);
        }
        shared.meta.insert(
            meta.chunk_id,
            MetaRecord {
                meta,
                ephemeral_owner: Some(self.name.clone()),
            },
        );
        Ok(())
    }

    async fn delete_metametadata(&self, id: ChunkId) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.purge(Instant::now());
        self.ensure_owner(&shared, id.shard())?;
        shared.meta.remove(&id);
        Ok(())
    }

    async fn scan_metadata(&self) -> Result<Vec<Metametadata>> {
        let shared = self.shared.lock();
        Ok(shared
            .meta
            .values()
            .map(|record| record.meta.clone())
            .collect())
    }

    async fn next_chunk_id(&self, shard: ShardId) -> Result<ChunkId> {
        let mut shared = self.shared.lock();
        let counter = shared.counters.entry(shard).or_insert(0);
        *counter += 1;
        Ok(ChunkId::from_raw(
            *counter * u64::from(SHARD_COUNT) + u64::from(shard.as_u32()),
        ))
    }

    async fn update_address(&self, address: ServerAddress, role: ServerRole) -> Result<ServerId> {
        let mut shared = self.shared.lock();
        let id = match shared.servers.get(&self.name) {
            Some(entry) => entry.id,
            None => {
                shared.server_id_counter += 1;
                ServerId::from_raw(shared.server_id_counter)
            }
        };
        shared
            .servers
            .insert(self.name.clone(), RegistryEntry { address, role, id });
        Ok(id)
    }

    async fn get_address(&self, name: &ServerName) -> Result<ServerAddress> {
        let shared = self.shared.lock();
        shared
            .servers
            .get(name)
            .map(|entry| entry.address.clone())
            .ok_or(Error::NotFound)
    }

    async fn get_id_by_name(&self, name: &ServerName) -> Result<ServerId> {
        let shared = self.shared.lock();
        shared
            .servers
            .get(name)
            .map(|entry| entry.id)
            .ok_or(Error::NotFound)
    }

    async fn get_name_by_id(&self, id: ServerId) -> Result<ServerName> {
        let shared = self.shared.lock();
        shared
            .servers
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(name, _)| name.clone())
            .ok_or(Error::NotFound)
    }

    async fn list_servers(&self, role: ServerRole) -> Result<Vec<(ServerName, ServerAddress)>> {
        let shared = self.shared.lock();
        let mut servers: Vec<_> = shared
            .servers
            .iter()
            .filter(|(_, entry)| entry.role == role)
            .map(|(name, entry)| (name.clone(), entry.address.clone()))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn two_servers() -> (MemoryCluster, MemoryMetadataStore, MemoryMetadataStore) {
        let cluster = MemoryCluster::new(TTL);
        let a = cluster.subscribe("test-name");
        let b = cluster.subscribe("test-name-2");
        (cluster, a, b)
    }

    #[tokio::test]
    async fn addresses_and_ids() {
        let (_cluster, a, b) = two_servers();

        assert!(a.get_address(a.name()).await.is_err());
        assert!(a.get_address(b.name()).await.is_err());

        b.update_address(ServerAddress::new("test-address"), ServerRole::Chunkserver)
            .await
            .unwrap();
        assert_eq!(
            a.get_address(b.name()).await.unwrap(),
            ServerAddress::new("test-address")
        );

        // re-registration keeps the stable id
        let first = b.get_id_by_name(b.name()).await.unwrap();
        b.update_address(ServerAddress::new("test-address-2"), ServerRole::Chunkserver)
            .await
            .unwrap();
        assert_eq!(b.get_id_by_name(b.name()).await.unwrap(), first);
        assert_eq!(a.get_name_by_id(first).await.unwrap(), *b.name());

        a.update_address(ServerAddress::new("other"), ServerRole::Frontend)
            .await
            .unwrap();
        assert_ne!(a.get_id_by_name(a.name()).await.unwrap(), first);
    }

    #[tokio::test]
    async fn claims_disclaims_and_expiry() {
        let (cluster, a, b) = two_servers();
        let shard = ShardId::from_raw(3);

        // no lease yet: renewal and claims fail
        assert!(a.renew_metadata_claims().await.is_err());
        assert!(a.try_claiming_metadata(shard).await.is_err());

        a.begin_metadata_lease().await.unwrap();
        b.begin_metadata_lease().await.unwrap();
        assert!(matches!(
            a.begin_metadata_lease().await,
            Err(Error::AlreadyExists)
        ));

        // first claimer wins, both observe the same owner
        assert_eq!(b.try_claiming_metadata(shard).await.unwrap(), *b.name());
        assert_eq!(a.try_claiming_metadata(shard).await.unwrap(), *b.name());

        // disclaim is owner-only
        assert!(matches!(
            a.disclaim_metadata(shard).await,
            Err(Error::NotOwner(_))
        ));
        b.disclaim_metadata(shard).await.unwrap();
        assert_eq!(a.try_claiming_metadata(shard).await.unwrap(), *a.name());

        // killing a without disclaim releases its claims after expiry
        cluster.expire_lease(a.name());
        assert!(matches!(
            a.renew_metadata_claims().await,
            Err(Error::LeaseExpired)
        ));
        assert_eq!(b.try_claiming_metadata(shard).await.unwrap(), *b.name());

        // a can start over with a fresh lease
        a.begin_metadata_lease().await.unwrap();
        a.renew_metadata_claims().await.unwrap();
        assert_eq!(
            a.try_claiming_metadata(ShardId::from_raw(7)).await.unwrap(),
            *a.name()
        );
    }

    #[tokio::test]
    async fn metadata_requires_claim_and_cas() {
        let (_cluster, a, b) = two_servers();
        a.begin_metadata_lease().await.unwrap();
        b.begin_metadata_lease().await.unwrap();

        let id = ChunkId::from_raw(3);
        assert!(a.get_metametadata(id).await.is_err());

        assert_eq!(a.try_claiming_metadata(id.shard()).await.unwrap(), *a.name());

        // unclaimed-record read returns the zero record
        let zero = a.get_metametadata(id).await.unwrap();
        assert_eq!(zero.version, Version::ZERO);
        assert!(zero.locations.is_empty());

        let sample = Metametadata {
            chunk_id: id,
            version: Version::from_raw(61),
            locations: vec![
                ServerName::new("topaz-5"),
                ServerName::new("quartz-43"),
                ServerName::new("ruby-1524"),
            ],
            last_writer: None,
            tombstone: false,
        };
        a.update_metametadata(id, Version::ZERO, sample.clone())
            .await
            .unwrap();
        assert_eq!(a.get_metametadata(id).await.unwrap(), sample);

        // CAS refuses a wrong expected version
        assert!(matches!(
            a.update_metametadata(id, Version::from_raw(60), sample.clone())
                .await,
            Err(Error::Stale(v)) if v == Version::from_raw(61)
        ));

        // the non-owner can learn who owns the shard but not read through it
        assert_eq!(b.try_claiming_metadata(id.shard()).await.unwrap(), *a.name());
        assert!(matches!(
            b.get_metametadata(id).await,
            Err(Error::NotOwner(owner)) if owner == *a.name()
        ));
    }

    #[tokio::test]
    async fn ephemeral_records_die_with_the_lease() {
        let (cluster, a, b) = two_servers();
        a.begin_metadata_lease().await.unwrap();
        b.begin_metadata_lease().await.unwrap();

        let shard = ShardId::from_raw(5);
        assert_eq!(a.try_claiming_metadata(shard).await.unwrap(), *a.name());
        let id = a.next_chunk_id(shard).await.unwrap();
        assert_eq!(id.shard(), shard);

        a.put_metametadata_ephemeral(Metametadata::zero(id))
            .await
            .unwrap();
        assert!(a.get_metametadata(id).await.unwrap().is_pending_create());

        cluster.expire_lease(a.name());
        assert_eq!(b.try_claiming_metadata(shard).await.unwrap(), *b.name());
        // the pending creation is gone; the record reads as zero again
        let record = b.get_metametadata(id).await.unwrap();
        assert_eq!(record, Metametadata::zero(id));
    }

    #[tokio::test]
    async fn minted_ids_are_unique_and_land_in_shard() {
        let (_cluster, a, _b) = two_servers();
        let shard = ShardId::from_raw(9);
        let first = a.next_chunk_id(shard).await.unwrap();
        let second = a.next_chunk_id(shard).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first.shard(), shard);
        assert_eq!(second.shard(), shard);
    }
}
