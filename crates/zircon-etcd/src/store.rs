//! The metadata-store interface the fleet programs against.
//!
//! [`EtcdSession`](crate::EtcdSession) is the production implementation;
//! [`MemoryCluster`](crate::MemoryCluster) provides an in-process twin with
//! the same claim and lease semantics for tests.

use async_trait::async_trait;
use std::time::Duration;
use zircon_common::{
    ChunkId, Metametadata, Result, ServerAddress, ServerId, ServerName, ServerRole, ShardId,
    Version,
};

/// Server registry, shard-ownership claims and per-chunk metadata CAS.
///
/// All operations are idempotent where the backing store allows it. The
/// metadata operations require the caller to hold the claim for the shard
/// covering the chunk; violations surface as `NotOwner` with the actual
/// owner's name.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// The stable identity this session was subscribed under.
    fn name(&self) -> &ServerName;

    /// TTL of the metadata lease; renewal should run at half this.
    fn metadata_lease_ttl(&self) -> Duration;

    /// Grant the metadata lease for this server. Fails with `AlreadyExists`
    /// if one is already active.
    async fn begin_metadata_lease(&self) -> Result<()>;

    /// Heartbeat the metadata lease. `LeaseExpired` means every claim is
    /// gone and the caller must begin a new lease.
    async fn renew_metadata_claims(&self) -> Result<()>;

    /// Claim a shard if it is unowned (prior owner's lease expired or
    /// disclaimed). Always returns the resulting owner, whether self or
    /// another server.
    async fn try_claiming_metadata(&self, shard: ShardId) -> Result<ServerName>;

    /// Release a shard claim; errors if the claim is not held by self.
    async fn disclaim_metadata(&self, shard: ShardId) -> Result<()>;

    /// Read a chunk's metadata record. An absent record reads as the zero
    /// record (version 0, no locations).
    async fn get_metametadata(&self, id: ChunkId) -> Result<Metametadata>;

    /// Compare-and-swap a chunk's metadata record: applies only if the
    /// stored version equals `expected`, else `Stale(current)`. This is the
    /// linearization point of the write protocol.
    async fn update_metametadata(
        &self,
        id: ChunkId,
        expected: Version,
        meta: Metametadata,
    ) -> Result<()>;

    /// Write a freshly-minted zero-version record bound to the metadata
    /// lease, so it is reaped if this server dies before the first commit.
    async fn put_metametadata_ephemeral(&self, meta: Metametadata) -> Result<()>;

    /// Remove a chunk's metadata record outright (final reap of a delete).
    async fn delete_metametadata(&self, id: ChunkId) -> Result<()>;

    /// All metadata records; the reconciler filters for shards it owns.
    async fn scan_metadata(&self) -> Result<Vec<Metametadata>>;

    /// Mint a fresh chunk id from the shard's counter. The id hashes back
    /// into `shard`.
    async fn next_chunk_id(&self, shard: ShardId) -> Result<ChunkId>;

    /// Publish this server's address and role; the registry entry is bound
    /// to the session lease. The first call mints the stable server id.
    async fn update_address(&self, address: ServerAddress, role: ServerRole) -> Result<ServerId>;

    /// Look up a live server's address.
    async fn get_address(&self, name: &ServerName) -> Result<ServerAddress>;

    async fn get_id_by_name(&self, name: &ServerName) -> Result<ServerId>;

    async fn get_name_by_id(&self, id: ServerId) -> Result<ServerName>;

    /// All live servers registered with the given role.
    async fn list_servers(&self, role: ServerRole) -> Result<Vec<(ServerName, ServerAddress)>>;
}
