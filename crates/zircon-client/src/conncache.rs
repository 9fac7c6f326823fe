//! Connection cache
//!
//! At most one reusable channel per server address: opened lazily, shared by
//! clone, closed by a sweeper task once idle past the TTL. Constructed
//! explicitly and handed to whoever fans out RPCs (client library, metadata
//! cache, chunkserver replication) so teardown is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use zircon_common::{Error, Result};
use zircon_proto::chunkserver::chunkserver_service_client::ChunkserverServiceClient;
use zircon_proto::frontend::frontend_service_client::FrontendServiceClient;
use zircon_proto::meta::metadata_cache_service_client::MetadataCacheServiceClient;

struct Entry {
    channel: Channel,
    last_used: Instant,
}

struct Inner {
    entries: tokio::sync::Mutex<HashMap<String, Entry>>,
    idle_ttl: Duration,
}

#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<Inner>,
    sweeper: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionCache {
    /// Create a cache whose idle connections are closed after `idle_ttl`.
    #[must_use]
    pub fn new(idle_ttl: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            idle_ttl,
        });
        let weak = Arc::downgrade(&inner);
        let period = (idle_ttl / 2).max(Duration::from_millis(100));
        let sweeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else { return };
                let now = Instant::now();
                let mut entries = inner.entries.lock().await;
                let before = entries.len();
                entries.retain(|_, entry| now.duration_since(entry.last_used) < inner.idle_ttl);
                if entries.len() < before {
                    debug!(closed = before - entries.len(), "closed idle connections");
                }
            }
        });
        Self {
            inner,
            sweeper: Arc::new(parking_lot::Mutex::new(Some(sweeper))),
        }
    }

    /// A channel to `addr`, dialing if none is cached.
    pub async fn channel(&self, addr: &str) -> Result<Channel> {
        {
            let mut entries = self.inner.entries.lock().await;
            if let Some(entry) = entries.get_mut(addr) {
                entry.last_used = Instant::now();
                return Ok(entry.channel.clone());
            }
        }
        // Dial outside the lock; on a race the first insert wins.
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| Error::unreachable(format!("bad address {addr}: {e}")))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::unreachable(format!("dial {addr}: {e}")))?;
        let mut entries = self.inner.entries.lock().await;
        let entry = entries.entry(addr.to_string()).or_insert(Entry {
            channel,
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Ok(entry.channel.clone())
    }

    /// Whether a connection to `addr` is already open (read-path hint).
    pub async fn contains(&self, addr: &str) -> bool {
        self.inner.entries.lock().await.contains_key(addr)
    }

    pub async fn chunkserver(&self, addr: &str) -> Result<ChunkserverServiceClient<Channel>> {
        Ok(ChunkserverServiceClient::new(self.channel(addr).await?))
    }

    pub async fn metadata_cache(&self, addr: &str) -> Result<MetadataCacheServiceClient<Channel>> {
        Ok(MetadataCacheServiceClient::new(self.channel(addr).await?))
    }

    pub async fn frontend(&self, addr: &str) -> Result<FrontendServiceClient<Channel>> {
        Ok(FrontendServiceClient::new(self.channel(addr).await?))
    }

    /// Stop the sweeper and drop every cached connection.
    pub async fn close_all(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.inner.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_cache_has_no_entries() {
        let cache = ConnectionCache::new(Duration::from_secs(1));
        assert!(!cache.contains("127.0.0.1:1").await);
        cache.close_all().await;
    }

    #[tokio::test]
    async fn bad_address_is_unreachable() {
        let cache = ConnectionCache::new(Duration::from_secs(1));
        let err = cache.channel("not an address").await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        cache.close_all().await;
    }
}
