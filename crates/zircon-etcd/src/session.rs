//! The production etcd session.
//!
//! One `EtcdSession` per process. It holds two leases: the *session lease*
//! backing the server's registry entry (kept alive by a background task for
//! the life of the process) and the *metadata lease* backing shard claims
//! (granted on demand, renewed explicitly by the metadata cache's renewal
//! loop so a missed renewal is observed, not papered over).

use crate::keys::{self, RegistryEntry};
use crate::store::MetadataStore;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, Txn,
    TxnOp, TxnOpResponse, WatchOptions, WatchStream, Watcher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zircon_common::{
    ChunkId, Error, Metametadata, Result, ServerAddress, ServerId, ServerName, ServerRole,
    ShardId, Version, SHARD_COUNT,
};

/// Bounded retries for optimistic transactions that can race.
const CAS_RETRIES: usize = 8;

struct LeaseHandle {
    id: i64,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

pub struct EtcdSession {
    name: ServerName,
    lease_ttl: i64,
    client: Client,
    session_lease: Mutex<Option<LeaseHandle>>,
    metadata_lease: Mutex<Option<LeaseHandle>>,
    /// Last published (address, role), re-published if the session lease is
    /// ever re-granted after a lapse.
    registration: Mutex<Option<(ServerAddress, ServerRole)>>,
    keepalive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

fn map_etcd(err: etcd_client::Error) -> Error {
    Error::unreachable(format!("etcd: {err}"))
}

fn map_json(err: serde_json::Error) -> Error {
    Error::serialization(err.to_string())
}

impl EtcdSession {
    /// Dial the cluster, grant the session lease and start its keep-alive.
    pub async fn connect(
        name: ServerName,
        endpoints: &[String],
        lease_ttl: Duration,
    ) -> Result<Arc<Self>> {
        if endpoints.is_empty() {
            return Err(Error::config("etcd-servers must not be empty"));
        }
        let client = Client::connect(endpoints, None).await.map_err(map_etcd)?;
        let session = Arc::new(Self {
            name,
            lease_ttl: lease_ttl.as_secs().max(1) as i64,
            client,
            session_lease: Mutex::new(None),
            metadata_lease: Mutex::new(None),
            registration: Mutex::new(None),
            keepalive_task: parking_lot::Mutex::new(None),
        });
        let handle = session.grant_lease().await?;
        *session.session_lease.lock().await = Some(handle);
        session.spawn_session_keepalive();
        info!(name = %session.name, "etcd session established");
        Ok(session)
    }

    /// Revoke leases and stop the keep-alive task. Registry entries and
    /// shard claims die with their leases.
    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        let mut client = self.client.clone();
        for slot in [&self.session_lease, &self.metadata_lease] {
            if let Some(handle) = slot.lock().await.take() {
                if let Err(e) = client.lease_revoke(handle.id).await {
                    debug!(error = %e, "lease revoke on shutdown failed");
                }
            }
        }
    }

    async fn grant_lease(&self) -> Result<LeaseHandle> {
        let mut client = self.client.clone();
        let granted = client
            .lease_grant(self.lease_ttl, None)
            .await
            .map_err(map_etcd)?;
        let id = granted.id();
        let (keeper, stream) = client.lease_keep_alive(id).await.map_err(map_etcd)?;
        Ok(LeaseHandle { id, keeper, stream })
    }

    fn spawn_session_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs((self.lease_ttl as u64 / 2).max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(session) = weak.upgrade() else { return };
                if let Err(e) = session.renew_session_lease().await {
                    warn!(error = %e, "session lease renewal failed");
                    if let Err(e) = session.restart_session_lease().await {
                        warn!(error = %e, "session lease restart failed; will retry");
                    }
                }
            }
        });
        *self.keepalive_task.lock() = Some(task);
    }

    async fn renew_session_lease(&self) -> Result<()> {
        let mut slot = self.session_lease.lock().await;
        let handle = slot.as_mut().ok_or(Error::LeaseExpired)?;
        if let Err(e) = Self::heartbeat(handle).await {
            if matches!(e, Error::LeaseExpired) {
                *slot = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Grant a fresh session lease and re-publish the registry entry.
    async fn restart_session_lease(&self) -> Result<()> {
        let handle = self.grant_lease().await?;
        let lease_id = handle.id;
        *self.session_lease.lock().await = Some(handle);
        let registration = self.registration.lock().await.clone();
        if let Some((address, role)) = registration {
            self.publish_registration(&address, role, lease_id).await?;
            info!(name = %self.name, "re-registered after session lease lapse");
        }
        Ok(())
    }

    async fn heartbeat(handle: &mut LeaseHandle) -> Result<()> {
        handle.keeper.keep_alive().await.map_err(map_etcd)?;
        match handle.stream.message().await.map_err(map_etcd)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            Some(_) => Err(Error::LeaseExpired),
            None => Err(Error::unreachable("etcd: keep-alive stream closed")),
        }
    }

    async fn metadata_lease_id(&self) -> Result<i64> {
        self.metadata_lease
            .lock()
            .await
            .as_ref()
            .map(|h| h.id)
            .ok_or(Error::LeaseExpired)
    }

    async fn session_lease_id(&self) -> Result<i64> {
        self.session_lease
            .lock()
            .await
            .as_ref()
            .map(|h| h.id)
            .ok_or(Error::LeaseExpired)
    }

    /// The current owner of a shard claim, if any.
    async fn shard_owner(&self, shard: ShardId) -> Result<Option<ServerName>> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::shard_key(shard), None)
            .await
            .map_err(map_etcd)?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(ServerName::new(kv.value_str().map_err(map_etcd)?))),
            None => Ok(None),
        }
    }

    async fn ensure_shard_owner(&self, shard: ShardId) -> Result<()> {
        match self.shard_owner(shard).await? {
            Some(owner) if owner == self.name => Ok(()),
            Some(owner) => Err(Error::NotOwner(owner)),
            None => Err(Error::NotOwner(ServerName::default())),
        }
    }

    async fn publish_registration(
        &self,
        address: &ServerAddress,
        role: ServerRole,
        lease_id: i64,
    ) -> Result<ServerId> {
        let id = match self.lookup_server_id().await? {
            Some(id) => id,
            None => self.mint_server_id().await?,
        };
        let entry = RegistryEntry {
            address: address.clone(),
            role,
            id,
        };
        let value = serde_json::to_vec(&entry).map_err(map_json)?;
        let mut client = self.client.clone();
        client
            .put(
                keys::server_key(&self.name),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(map_etcd)?;
        Ok(id)
    }

    /// Find this server's stable id: from the live registry entry if one
    /// exists, otherwise from the persistent reverse mapping.
    async fn lookup_server_id(&self) -> Result<Option<ServerId>> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::server_key(&self.name), None)
            .await
            .map_err(map_etcd)?;
        if let Some(kv) = resp.kvs().first() {
            let entry: RegistryEntry = serde_json::from_slice(kv.value()).map_err(map_json)?;
            return Ok(Some(entry.id));
        }
        let resp = client
            .get(
                keys::SERVER_ID_PREFIX,
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(map_etcd)?;
        for kv in resp.kvs() {
            if kv.value_str().map_err(map_etcd)? == self.name.as_str() {
                if let Some(id) = keys::parse_server_id_key(kv.key_str().map_err(map_etcd)?) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    async fn mint_server_id(&self) -> Result<ServerId> {
        let next = self.increment_counter(keys::SERVER_ID_COUNTER).await?;
        let id = ServerId::from_raw(next);
        let mut client = self.client.clone();
        client
            .put(keys::server_id_key(id), self.name.as_str(), None)
            .await
            .map_err(map_etcd)?;
        Ok(id)
    }

    /// CAS-increment a decimal counter key, returning the new value.
    async fn increment_counter(&self, key: &str) -> Result<u64> {
        let mut client = self.client.clone();
        for _ in 0..CAS_RETRIES {
            let resp = client.get(key, None).await.map_err(map_etcd)?;
            let (txn, next) = match resp.kvs().first() {
                None => (
                    Txn::new()
                        .when([Compare::create_revision(key, CompareOp::Equal, 0)])
                        .and_then([TxnOp::put(key, "1", None)]),
                    1,
                ),
                Some(kv) => {
                    let current: u64 = kv
                        .value_str()
                        .map_err(map_etcd)?
                        .parse()
                        .map_err(|_| Error::corrupt(format!("counter {key} is not a number")))?;
                    let next = current + 1;
                    (
                        Txn::new()
                            .when([Compare::mod_revision(key, CompareOp::Equal, kv.mod_revision())])
                            .and_then([TxnOp::put(key, next.to_string(), None)]),
                        next,
                    )
                }
            };
            if client.txn(txn).await.map_err(map_etcd)?.succeeded() {
                return Ok(next);
            }
        }
        Err(Error::unreachable(format!(
            "etcd: counter {key} kept racing"
        )))
    }

    /// Snapshot of every registered server, for routing caches.
    pub async fn snapshot_servers(&self) -> Result<Vec<(ServerName, RegistryEntry)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::SERVERS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_etcd)?;
        let mut servers = Vec::new();
        for kv in resp.kvs() {
            let Some(name) = keys::parse_server_key(kv.key_str().map_err(map_etcd)?) else {
                continue;
            };
            match serde_json::from_slice::<RegistryEntry>(kv.value()) {
                Ok(entry) => servers.push((name, entry)),
                Err(e) => warn!(server = %name, error = %e, "malformed registry entry"),
            }
        }
        Ok(servers)
    }

    /// Snapshot of every shard claim, for routing caches.
    pub async fn snapshot_shard_owners(&self) -> Result<Vec<(ShardId, ServerName)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::SHARDS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_etcd)?;
        let mut owners = Vec::new();
        for kv in resp.kvs() {
            if let Some(shard) = keys::parse_shard_key(kv.key_str().map_err(map_etcd)?) {
                owners.push((shard, ServerName::new(kv.value_str().map_err(map_etcd)?)));
            }
        }
        Ok(owners)
    }

    /// Open a prefix watch; callers own reconnection on stream end.
    pub async fn watch_prefix(&self, prefix: &str) -> Result<(Watcher, WatchStream)> {
        let mut client = self.client.clone();
        client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(map_etcd)
    }
}

#[async_trait]
impl MetadataStore for EtcdSession {
    fn name(&self) -> &ServerName {
        &self.name
    }

    fn metadata_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl as u64)
    }

    async fn begin_metadata_lease(&self) -> Result<()> {
        let mut slot = self.metadata_lease.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyExists);
        }
        *slot = Some(self.grant_lease().await?);
        Ok(())
    }

    async fn renew_metadata_claims(&self) -> Result<()> {
        let mut slot = self.metadata_lease.lock().await;
        let handle = slot.as_mut().ok_or(Error::LeaseExpired)?;
        match Self::heartbeat(handle).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, Error::LeaseExpired) {
                    *slot = None;
                }
                Err(e)
            }
        }
    }

    async fn try_claiming_metadata(&self, shard: ShardId) -> Result<ServerName> {
        let lease_id = self.metadata_lease_id().await?;
        let key = keys::shard_key(shard);
        let mut client = self.client.clone();
        for _ in 0..CAS_RETRIES {
            let txn = Txn::new()
                .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(
                    key.as_str(),
                    self.name.as_str(),
                    Some(PutOptions::new().with_lease(lease_id)),
                )])
                .or_else([TxnOp::get(key.as_str(), None)]);
            let resp = client.txn(txn).await.map_err(map_etcd)?;
            if resp.succeeded() {
                debug!(%shard, "claimed metadata shard");
                return Ok(self.name.clone());
            }
            for op in resp.op_responses() {
                if let TxnOpResponse::Get(get) = op {
                    if let Some(kv) = get.kvs().first() {
                        return Ok(ServerName::new(kv.value_str().map_err(map_etcd)?));
                    }
                }
            }
            // The holder vanished between the two branches; try again.
        }
        Err(Error::unreachable("etcd: shard claim kept racing"))
    }

    async fn disclaim_metadata(&self, shard: ShardId) -> Result<()> {
        let key = keys::shard_key(shard);
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::value(
                key.as_str(),
                CompareOp::Equal,
                self.name.as_str(),
            )])
            .and_then([TxnOp::delete(key.as_str(), None)])
            .or_else([TxnOp::get(key.as_str(), None)]);
        let resp = client.txn(txn).await.map_err(map_etcd)?;
        if resp.succeeded() {
            debug!(%shard, "disclaimed metadata shard");
            return Ok(());
        }
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    return Err(Error::NotOwner(ServerName::new(
                        kv.value_str().map_err(map_etcd)?,
                    )));
                }
            }
        }
        Err(Error::NotFound)
    }

    async fn get_metametadata(&self, id: ChunkId) -> Result<Metametadata> {
        self.ensure_shard_owner(id.shard()).await?;
        let mut client = self.client.clone();
        let resp = client
            .get(keys::meta_key(id), None)
            .await
            .map_err(map_etcd)?;
        match resp.kvs().first() {
            Some(kv) => serde_json::from_slice(kv.value()).map_err(map_json),
            None => Ok(Metametadata::zero(id)),
        }
    }

    async fn update_metametadata(
        &self,
        id: ChunkId,
        expected: Version,
        meta: Metametadata,
    ) -> Result<()> {
        let shard = id.shard();
        let meta_key = keys::meta_key(id);
        let shard_key = keys::shard_key(shard);
        let value = serde_json::to_vec(&meta).map_err(map_json)?;
        let mut client = self.client.clone();
        for _ in 0..CAS_RETRIES {
            let resp = client
                .get(meta_key.as_str(), None)
                .await
                .map_err(map_etcd)?;
            let (current_version, revision) = match resp.kvs().first() {
                Some(kv) => {
                    let current: Metametadata =
                        serde_json::from_slice(kv.value()).map_err(map_json)?;
                    (current.version, kv.mod_revision())
                }
                None => (Version::ZERO, 0),
            };
            if !current_version.satisfies(expected) {
                return Err(Error::Stale(current_version));
            }
            let record_guard = if revision == 0 {
                Compare::create_revision(meta_key.as_str(), CompareOp::Equal, 0)
            } else {
                Compare::mod_revision(meta_key.as_str(), CompareOp::Equal, revision)
            };
            let txn = Txn::new()
                .when([
                    Compare::value(shard_key.as_str(), CompareOp::Equal, self.name.as_str()),
                    record_guard,
                ])
                .and_then([TxnOp::put(meta_key.as_str(), value.clone(), None)]);
            if client.txn(txn).await.map_err(map_etcd)?.succeeded() {
                return Ok(());
            }
            // Either ownership moved or the record raced; find out which.
            match self.shard_owner(shard).await? {
                Some(owner) if owner == self.name => continue,
                Some(owner) => return Err(Error::NotOwner(owner)),
                None => return Err(Error::NotOwner(ServerName::default())),
            }
        }
        Err(Error::unreachable("etcd: metadata CAS kept racing"))
    }

    async fn put_metametadata_ephemeral(&self, meta: Metametadata) -> Result<()> {
        let lease_id = self.metadata_lease_id().await?;
        self.ensure_shard_owner(meta.chunk_id.shard()).await?;
        let key = keys::meta_key(meta.chunk_id);
        let value = serde_json::to_vec(&meta).map_err(map_json)?;
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        if client.txn(txn).await.map_err(map_etcd)?.succeeded() {
            Ok(())
        } else {
            Err(Error::AlreadyExists)
        }
    }

    async fn delete_metametadata(&self, id: ChunkId) -> Result<()> {
        self.ensure_shard_owner(id.shard()).await?;
        let mut client = self.client.clone();
        client
            .delete(keys::meta_key(id), None)
            .await
            .map_err(map_etcd)?;
        Ok(())
    }

    async fn scan_metadata(&self) -> Result<Vec<Metametadata>> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::META_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_etcd)?;
        let mut records = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Metametadata>(kv.value()) {
                Ok(meta) => records.push(meta),
                Err(e) => warn!(
                    key = kv.key_str().unwrap_or("<binary>"),
                    error = %e,
                    "malformed metadata record"
                ),
            }
        }
        Ok(records)
    }

    async fn next_chunk_id(&self, shard: ShardId) -> Result<ChunkId> {
        let counter = self.increment_counter(&keys::counter_key(shard)).await?;
        Ok(ChunkId::from_raw(
            counter * u64::from(SHARD_COUNT) + u64::from(shard.as_u32()),
        ))
    }

    async fn update_address(&self, address: ServerAddress, role: ServerRole) -> Result<ServerId> {
        let lease_id = self.session_lease_id().await?;
        let id = self.publish_registration(&address, role, lease_id).await?;
        *self.registration.lock().await = Some((address, role));
        Ok(id)
    }

    async fn get_address(&self, name: &ServerName) -> Result<ServerAddress> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::server_key(name), None)
            .await
            .map_err(map_etcd)?;
        let kv = resp.kvs().first().ok_or(Error::NotFound)?;
        let entry: RegistryEntry = serde_json::from_slice(kv.value()).map_err(map_json)?;
        Ok(entry.address)
    }

    async fn get_id_by_name(&self, name: &ServerName) -> Result<ServerId> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::server_key(name), None)
            .await
            .map_err(map_etcd)?;
        if let Some(kv) = resp.kvs().first() {
            let entry: RegistryEntry = serde_json::from_slice(kv.value()).map_err(map_json)?;
            return Ok(entry.id);
        }
        let resp = client
            .get(
                keys::SERVER_ID_PREFIX,
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(map_etcd)?;
        for kv in resp.kvs() {
            if kv.value_str().map_err(map_etcd)? == name.as_str() {
                if let Some(id) = keys::parse_server_id_key(kv.key_str().map_err(map_etcd)?) {
                    return Ok(id);
                }
            }
        }
        Err(Error::NotFound)
    }

    async fn get_name_by_id(&self, id: ServerId) -> Result<ServerName> {
        let mut client = self.client.clone();
        let resp = client
            .get(keys::server_id_key(id), None)
            .await
            .map_err(map_etcd)?;
        match resp.kvs().first() {
            Some(kv) => Ok(ServerName::new(kv.value_str().map_err(map_etcd)?)),
            None => Err(Error::NotFound),
        }
    }

    async fn list_servers(&self, role: ServerRole) -> Result<Vec<(ServerName, ServerAddress)>> {
        Ok(self
            .snapshot_servers()
            .await?
            .into_iter()
            .filter(|(_, entry)| entry.role == role)
            .map(|(name, entry)| (name, entry.address))
            .collect())
    }
}
