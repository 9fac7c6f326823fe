//! Zircon client library
//!
//! Public operations: `new_chunk`, `read`, `write`, `delete`, `stat`,
//! `close`. Under the hood the client resolves chunk ids through a frontend
//! to the owning metadata cache, then runs the replicated write protocol
//! directly against the chunkservers: stage on every replica in parallel,
//! commit what staged, report the committed set back to the coordinator.
//!
//! Reads and resolves retry bounded times with exponential backoff. Writes
//! are never retried automatically: `Stale` carries the current version
//! and the caller decides.

mod conncache;

pub use conncache::ConnectionCache;

use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use zircon_common::{
    check_read_bounds, check_write_bounds, ChunkId, ClientConfig, Error, Result, ServerName,
    Version,
};
use zircon_proto::check;
use zircon_proto::chunkserver as cs_proto;
use zircon_proto::frontend as fe_proto;
use zircon_proto::meta as mc_proto;

const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// A resolved chunk: its version and replica endpoints.
#[derive(Clone, Debug)]
pub struct ChunkStat {
    pub version: Version,
    pub locations: Vec<(ServerName, String)>,
}

/// A replica that accepted our StartWrite and owes us a commit or abort.
struct StagedReplica {
    name: String,
    address: String,
    token: Vec<u8>,
}

pub struct Client {
    config: ClientConfig,
    cache: ConnectionCache,
    next_frontend: AtomicUsize,
}

impl Client {
    /// Build a client from its configuration; connections open lazily.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        if config.frontend_servers.is_empty() {
            return Err(Error::config("client-config needs frontend-servers"));
        }
        let cache = ConnectionCache::new(config.connection_idle_ttl());
        Ok(Self {
            config,
            cache,
            next_frontend: AtomicUsize::new(0),
        })
    }

    /// The connection cache, for sharing with embedding servers.
    #[must_use]
    pub fn connection_cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Allocate a new chunk, all zeroed out. The first write must be done
    /// with version 0; a chunk never written before this client goes away
    /// is reaped and never becomes visible.
    pub async fn new_chunk(&self) -> Result<ChunkId> {
        // Any metadata cache can mint; route via an arbitrary id.
        let probe = ChunkId::from_raw(Uuid::new_v4().as_u64_pair().0);
        let mut last = Error::unreachable("no metadata cache reachable");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let mc_addr = match self.locate(probe).await {
                Ok(addr) => addr,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            let mut mc = match self.cache.metadata_cache(&mc_addr).await {
                Ok(mc) => mc,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            let resp = match self
                .with_deadline(mc.begin_new(mc_proto::BeginNewRequest {}))
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            match check(resp.error) {
                Ok(()) => return Ok(ChunkId::from_raw(resp.chunk_id)),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Read part or all of a chunk. Returns the bytes and the version they
    /// were read at; the version can be passed to `write`.
    pub async fn read(&self, id: ChunkId, offset: u32, length: u32) -> Result<(Bytes, Version)> {
        check_read_bounds(offset, length)?;
        let mut last = Error::unreachable("no replica served the read");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let stat = self.stat(id).await?;
            for (_, address) in self.order_replicas(&stat.locations).await {
                let mut cs = match self.cache.chunkserver(&address).await {
                    Ok(cs) => cs,
                    Err(e) => {
                        last = e;
                        continue;
                    }
                };
                let resp = match self
                    .with_deadline(cs.read(cs_proto::ReadRequest {
                        chunk_id: id.as_u64(),
                        offset,
                        length,
                    }))
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        last = e;
                        continue;
                    }
                };
                match check(resp.error) {
                    Ok(()) if resp.version == stat.version.as_u64() => {
                        return Ok((Bytes::from(resp.data), stat.version));
                    }
                    Ok(()) => {
                        // The replica lags reconciliation; resolve afresh.
                        debug!(chunk = %id, replica = %address, "replica version mismatch");
                        last = Error::Stale(Version::from_raw(resp.version));
                        break;
                    }
                    Err(e) => last = e,
                }
            }
        }
        Err(last)
    }

    /// Write part or all of a chunk at the given version (`Version::ANY`
    /// skips the check). Returns the new version on success; `Stale`
    /// carries the current version on version mismatch. Never retried.
    pub async fn write(
        &self,
        id: ChunkId,
        offset: u32,
        version: Version,
        data: &[u8],
    ) -> Result<Version> {
        check_write_bounds(offset, data.len())?;

        // 1. Coordinate: the owning metadata cache picks the target version.
        let (mc_addr, start) = self.start_write_at_mc(id, version).await?;
        let target = start.target_version;
        let base = start.base_version;
        let write_id = start.write_id.clone();

        // 2. Stage the bytes on every listed replica in parallel.
        let stage_results = join_all(start.locations.iter().map(|loc| {
            let cache = self.cache.clone();
            let deadline = self.config.request_deadline();
            let payload = data.to_vec();
            async move {
                if loc.address.is_empty() {
                    return Err(Error::unreachable(format!("{} has no address", loc.name)));
                }
                let mut cs = cache.chunkserver(&loc.address).await?;
                let fut = cs.start_write(cs_proto::StartWriteRequest {
                    chunk_id: id.as_u64(),
                    expected_version: base,
                    offset,
                    data: payload,
                });
                let resp = match tokio::time::timeout(deadline, fut).await {
                    Ok(Ok(resp)) => resp.into_inner(),
                    Ok(Err(status)) => return Err(Error::unreachable(status.to_string())),
                    Err(_) => return Err(Error::unreachable("stage deadline exceeded")),
                };
                check(resp.error)?;
                Ok(StagedReplica {
                    name: loc.name.clone(),
                    address: loc.address.clone(),
                    token: resp.token,
                })
            }
        }))
        .await;

        let mut staged = Vec::new();
        let mut stage_error = None;
        for result in stage_results {
            match result {
                Ok(replica) => staged.push(replica),
                Err(e) => stage_error = Some(e),
            }
        }
        if staged.is_empty() {
            self.abort_at_mc(&mc_addr, write_id).await;
            return Err(stage_error
                .unwrap_or_else(|| Error::unreachable("no replica accepted the write")));
        }

        // 3. Commit everything that staged.
        let commit_results = join_all(staged.iter().map(|replica| {
            let cache = self.cache.clone();
            let deadline = self.config.request_deadline();
            let token = replica.token.clone();
            async move {
                let mut cs = cache.chunkserver(&replica.address).await?;
                let fut = cs.commit_write(cs_proto::CommitWriteRequest {
                    token,
                    new_version: target,
                });
                let resp = match tokio::time::timeout(deadline, fut).await {
                    Ok(Ok(resp)) => resp.into_inner(),
                    Ok(Err(status)) => return Err(Error::unreachable(status.to_string())),
                    Err(_) => return Err(Error::unreachable("commit deadline exceeded")),
                };
                check(resp.error)
            }
        }))
        .await;

        let mut committed = Vec::new();
        let mut uncommitted = Vec::new();
        for (replica, result) in staged.iter().zip(commit_results) {
            match result {
                Ok(()) => committed.push(replica.name.clone()),
                Err(e) => {
                    warn!(chunk = %id, replica = %replica.name, error = %e, "commit failed");
                    uncommitted.push(replica);
                }
            }
        }
        // A failed commit may still hold the staged slot; free it.
        self.abort_staged(&uncommitted).await;

        // 4. Report the committed set; the coordinator's CAS decides.
        let mut mc = self.cache.metadata_cache(&mc_addr).await?;
        let resp = match self
            .with_deadline(mc.commit_write(mc_proto::CommitWriteRequest {
                write_id,
                succeeded: committed,
            }))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let staged_refs: Vec<&StagedReplica> = staged.iter().collect();
                self.abort_staged(&staged_refs).await;
                return Err(e);
            }
        };
        check(resp.error)?;
        Ok(Version::from_raw(resp.version))
    }

    /// Destroy a chunk at the given version. Version checking works as for
    /// `write`.
    pub async fn delete(&self, id: ChunkId, version: Version) -> Result<()> {
        let mut last = Error::unreachable("no metadata cache reachable");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let mc_addr = self.locate(id).await?;
            let mut mc = self.cache.metadata_cache(&mc_addr).await?;
            let resp = self
                .with_deadline(mc.commit_delete(mc_proto::CommitDeleteRequest {
                    chunk_id: id.as_u64(),
                    expected_version: version.as_u64(),
                }))
                .await?;
            match check(resp.error) {
                Ok(()) => return Ok(()),
                // Only rerouting is retried; staleness surfaces immediately.
                Err(Error::NotOwner(owner)) => last = Error::NotOwner(owner),
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Resolve a chunk to its current version and replica set.
    pub async fn stat(&self, id: ChunkId) -> Result<ChunkStat> {
        let mut last = Error::unreachable("no metadata cache reachable");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let mc_addr = match self.locate(id).await {
                Ok(addr) => addr,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            let mut mc = match self.cache.metadata_cache(&mc_addr).await {
                Ok(mc) => mc,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            let resp = match self
                .with_deadline(mc.resolve(mc_proto::ResolveRequest {
                    chunk_id: id.as_u64(),
                }))
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            match check(resp.error) {
                Ok(()) => {
                    let meta = resp
                        .meta
                        .ok_or_else(|| Error::unreachable("resolve returned no metadata"))?;
                    return Ok(ChunkStat {
                        version: Version::from_raw(meta.version),
                        locations: meta
                            .locations
                            .into_iter()
                            .map(|loc| (ServerName::new(loc.name), loc.address))
                            .collect(),
                    });
                }
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Close every connection owned by this client.
    pub async fn close(&self) {
        self.cache.close_all().await;
    }

    /// Route a chunk id to a live metadata cache via a frontend.
    async fn locate(&self, id: ChunkId) -> Result<String> {
        let mut last = Error::unreachable("no frontend reachable");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let index = self.next_frontend.fetch_add(1, Ordering::Relaxed);
            let frontend = &self.config.frontend_servers[index % self.config.frontend_servers.len()];
            let mut fe = match self.cache.frontend(frontend).await {
                Ok(fe) => fe,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            let resp = match self
                .with_deadline(fe.locate(fe_proto::LocateRequest {
                    chunk_id: id.as_u64(),
                }))
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            match check(resp.error) {
                Ok(()) if !resp.mc_address.is_empty() => return Ok(resp.mc_address),
                Ok(()) => last = Error::unreachable("frontend returned no address"),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Open the write at the owning metadata cache, rerouting on `NotOwner`.
    async fn start_write_at_mc(
        &self,
        id: ChunkId,
        expected: Version,
    ) -> Result<(String, mc_proto::StartWriteResponse)> {
        let mut last = Error::unreachable("no metadata cache reachable");
        for attempt in 0..=self.config.resolve_retries {
            self.backoff(attempt).await;
            let mc_addr = self.locate(id).await?;
            let mut mc = self.cache.metadata_cache(&mc_addr).await?;
            let resp = self
                .with_deadline(mc.start_write(mc_proto::StartWriteRequest {
                    chunk_id: id.as_u64(),
                    expected_version: expected.as_u64(),
                }))
                .await?;
            match check(resp.error.clone()) {
                Ok(()) => return Ok((mc_addr, resp)),
                Err(Error::NotOwner(owner)) => last = Error::NotOwner(owner),
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Best-effort abort of staged writes after a failure.
    async fn abort_staged(&self, staged: &[&StagedReplica]) {
        join_all(staged.iter().map(|replica| {
            let cache = self.cache.clone();
            let token = replica.token.clone();
            let address = replica.address.clone();
            async move {
                if let Ok(mut cs) = cache.chunkserver(&address).await {
                    let _ = cs
                        .abort_write(cs_proto::AbortWriteRequest { token, chunk_id: 0 })
                        .await;
                }
            }
        }))
        .await;
    }

    /// Best-effort release of the coordinator's pending entry.
    async fn abort_at_mc(&self, mc_addr: &str, write_id: Vec<u8>) {
        if let Ok(mut mc) = self.cache.metadata_cache(mc_addr).await {
            let _ = mc
                .abort_write(mc_proto::AbortWriteRequest { write_id })
                .await;
        }
    }

    /// Replicas with a warm connection first, addressless replicas dropped.
    async fn order_replicas(&self, locations: &[(ServerName, String)]) -> Vec<(ServerName, String)> {
        let mut warm = Vec::new();
        let mut cold = Vec::new();
        for (name, address) in locations {
            if address.is_empty() {
                continue;
            }
            if self.cache.contains(address).await {
                warm.push((name.clone(), address.clone()));
            } else {
                cold.push((name.clone(), address.clone()));
            }
        }
        warm.extend(cold);
        warm
    }

    async fn backoff(&self, attempt: u32) {
        if attempt > 0 {
            tokio::time::sleep(BACKOFF_BASE * 2u32.saturating_pow(attempt - 1)).await;
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.request_deadline(), fut).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(Error::unreachable(format!("rpc: {status}"))),
            Err(_) => Err(Error::unreachable("rpc deadline exceeded")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_requires_frontends() {
        let config = ClientConfig::default();
        assert!(matches!(Client::connect(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn replica_ordering_prefers_warm_connections() {
        let mut config = ClientConfig::default();
        config.frontend_servers.push("127.0.0.1:1".to_string());
        let client = Client::connect(config).unwrap();
        let locations = vec![
            (ServerName::new("a"), "127.0.0.1:10".to_string()),
            (ServerName::new("b"), String::new()),
            (ServerName::new("c"), "127.0.0.1:12".to_string()),
        ];
        // no warm connections: listed order, addressless dropped
        let ordered = client.order_replicas(&locations).await;
        assert_eq!(
            ordered.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        client.close().await;
    }
}
