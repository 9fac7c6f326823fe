//! Chunkserver replica state.
//!
//! Writes are two-phase per replica: `start_write` validates the version
//! precondition and stages the bytes in memory under a token, `commit_write`
//! re-validates and applies them. At most one uncommitted write may be
//! staged per chunk; concurrent attempts fail with `Busy`, which localizes
//! write serialization to the chunkserver.
//!
//! The per-replica state machine is
//! `Absent -> PendingCreate -> Present(v) -> PendingWrite(v->v') ->
//! Present(v') -> Tombstone`; durability comes from the storage backend's
//! data-then-version write order, so a restart recovers each replica at its
//! last durably-committed version.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zircon_client::ConnectionCache;
use zircon_common::{
    check_read_bounds, check_write_bounds, ChunkId, Error, Result, Version,
};
use zircon_proto::check;
use zircon_proto::chunkserver as cs_proto;
use zircon_storage::ChunkStorage;

struct StagedWrite {
    token: Uuid,
    expected: Version,
    offset: u32,
    data: Bytes,
    staged_at: Instant,
}

#[derive(Default)]
struct StagedTable {
    by_chunk: HashMap<ChunkId, StagedWrite>,
    by_token: HashMap<Uuid, ChunkId>,
}

impl StagedTable {
    fn insert(&mut self, chunk: ChunkId, write: StagedWrite) {
        self.by_token.insert(write.token, chunk);
        self.by_chunk.insert(chunk, write);
    }

    fn remove_token(&mut self, token: Uuid) -> Option<(ChunkId, StagedWrite)> {
        let chunk = self.by_token.remove(&token)?;
        let write = self.by_chunk.remove(&chunk)?;
        Some((chunk, write))
    }

    fn remove_chunk(&mut self, chunk: ChunkId) {
        if let Some(write) = self.by_chunk.remove(&chunk) {
            self.by_token.remove(&write.token);
        }
    }

    fn purge(&mut self, ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .by_chunk
            .values()
            .filter(|w| now.duration_since(w.staged_at) >= ttl)
            .map(|w| w.token)
            .collect();
        for token in expired {
            debug!(%token, "dropping expired staged write");
            self.remove_token(token);
        }
    }
}

pub struct ChunkserverState {
    storage: Arc<dyn ChunkStorage>,
    cache: ConnectionCache,
    staged: Mutex<StagedTable>,
    /// Serializes reads against the brief apply-staged-bytes section.
    io_locks: Mutex<HashMap<ChunkId, Arc<tokio::sync::Mutex<()>>>>,
    staged_ttl: Duration,
    peer_deadline: Duration,
}

impl ChunkserverState {
    pub fn new(
        storage: Arc<dyn ChunkStorage>,
        cache: ConnectionCache,
        staged_ttl: Duration,
        peer_deadline: Duration,
    ) -> Self {
        Self {
            storage,
            cache,
            staged: Mutex::new(StagedTable::default()),
            io_locks: Mutex::new(HashMap::new()),
            staged_ttl,
            peer_deadline,
        }
    }

    /// Scan the store after a restart; corrupt replicas are demoted (deleted)
    /// so reconciliation can restore them from a healthy peer.
    pub async fn recover(&self) -> Result<()> {
        let mut present = 0usize;
        for id in self.storage.list().await? {
            match self.storage.version(id).await {
                Ok(Some(_)) => present += 1,
                Ok(None) => {}
                Err(Error::Corrupt(reason)) => {
                    warn!(chunk = %id, %reason, "demoting corrupt replica");
                    let _ = self.storage.delete(id).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(replicas = present, "replica store recovered");
        Ok(())
    }

    /// Stage a write. Returns the token to commit or abort with.
    pub async fn start_write(
        &self,
        id: ChunkId,
        expected: Version,
        offset: u32,
        data: Bytes,
    ) -> Result<Uuid> {
        check_write_bounds(offset, data.len())?;
        let token = Uuid::new_v4();
        {
            let mut staged = self.staged.lock();
            staged.purge(self.staged_ttl);
            if staged.by_chunk.contains_key(&id) {
                return Err(Error::Busy);
            }
            staged.insert(
                id,
                StagedWrite {
                    token,
                    expected,
                    offset,
                    data,
                    staged_at: Instant::now(),
                },
            );
        }
        // The slot is reserved before the version check so a concurrent
        // staging attempt sees Busy, not a torn precondition.
        match self.current_version(id).await {
            Ok(current) if current.satisfies(expected) => Ok(token),
            Ok(current) => {
                self.staged.lock().remove_token(token);
                Err(Error::Stale(current))
            }
            Err(e) => {
                self.staged.lock().remove_token(token);
                Err(e)
            }
        }
    }

    /// Apply a staged write and advance the replica tag to `new_version`.
    pub async fn commit_write(&self, token: Uuid, new_version: Version) -> Result<()> {
        let Some((id, write)) = self.staged.lock().remove_token(token) else {
            return Err(Error::NotFound);
        };
        let lock = self.io_lock(id);
        let _guard = lock.lock().await;
        // Re-validate: a delete may have raced the staging.
        let current = self.current_version(id).await?;
        if !current.satisfies(write.expected) {
            return Err(Error::Stale(current));
        }
        self.storage.write(id, write.offset, &write.data).await?;
        self.storage.set_version(id, new_version).await?;
        Ok(())
    }

    /// Discard a staged write, by token or by chunk. Idempotent.
    pub fn abort_write(&self, token: Option<Uuid>, chunk: Option<ChunkId>) {
        let mut staged = self.staged.lock();
        if let Some(token) = token {
            staged.remove_token(token);
        } else if let Some(chunk) = chunk {
            staged.remove_chunk(chunk);
        }
    }

    /// Read bytes and the version they are tagged with. `length` 0 reads
    /// the stored extent from `offset`.
    pub async fn read(&self, id: ChunkId, offset: u32, length: u32) -> Result<(Bytes, Version)> {
        check_read_bounds(offset, length)?;
        let lock = self.io_lock(id);
        let _guard = lock.lock().await;
        let version = self.storage.version(id).await?.ok_or(Error::NotFound)?;
        let data = if length == 0 {
            self.storage.read_extent(id, offset).await?
        } else {
            self.storage.read(id, offset, length).await?
        };
        Ok((data, version))
    }

    /// Destroy the replica if the version precondition holds.
    pub async fn delete(&self, id: ChunkId, expected: Version) -> Result<()> {
        let lock = self.io_lock(id);
        let _guard = lock.lock().await;
        let current = self.storage.version(id).await?.ok_or(Error::NotFound)?;
        if !current.satisfies(expected) {
            return Err(Error::Stale(current));
        }
        // A staged write for a deleted chunk can never commit; free the slot.
        self.staged.lock().remove_chunk(id);
        self.storage.delete(id).await
    }

    pub async fn exists(&self, id: ChunkId) -> Result<(bool, Version)> {
        match self.storage.version(id).await? {
            Some(version) => Ok((true, version)),
            None => Ok((false, Version::ZERO)),
        }
    }

    /// Pull a chunk at `version` from a peer chunkserver and install it
    /// locally. Used by reconciliation.
    pub async fn replicate_from(&self, id: ChunkId, peer: &str, version: Version) -> Result<()> {
        let mut cs = self.cache.chunkserver(peer).await?;
        let fut = cs.read(cs_proto::ReadRequest {
            chunk_id: id.as_u64(),
            offset: 0,
            length: 0,
        });
        let resp = match tokio::time::timeout(self.peer_deadline, fut).await {
            Ok(Ok(resp)) => resp.into_inner(),
            Ok(Err(status)) => return Err(Error::unreachable(format!("peer {peer}: {status}"))),
            Err(_) => return Err(Error::unreachable(format!("peer {peer}: deadline exceeded"))),
        };
        check(resp.error)?;
        if resp.version != version.as_u64() {
            return Err(Error::Stale(Version::from_raw(resp.version)));
        }
        let lock = self.io_lock(id);
        let _guard = lock.lock().await;
        // Replace, not overlay: a stale local tail must not survive.
        if self.storage.version(id).await.is_ok_and(|v| v.is_some()) {
            self.storage.delete(id).await?;
        }
        self.storage.write(id, 0, &resp.data).await?;
        self.storage.set_version(id, version).await?;
        info!(chunk = %id, %peer, %version, "replica installed from peer");
        Ok(())
    }

    /// Periodic sweep of expired staged writes and idle lock entries.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::downgrade(self);
        let period = (self.staged_ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(state) = state.upgrade() else { return };
                state.staged.lock().purge(state.staged_ttl);
                state
                    .io_locks
                    .lock()
                    .retain(|_, lock| Arc::strong_count(lock) > 1);
            }
        })
    }

    async fn current_version(&self, id: ChunkId) -> Result<Version> {
        Ok(self.storage.version(id).await?.unwrap_or(Version::ZERO))
    }

    fn io_lock(&self, id: ChunkId) -> Arc<tokio::sync::Mutex<()>> {
        self.io_locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zircon_common::MAX_CHUNK_SIZE;
    use zircon_storage::MemoryStorage;

    fn state() -> Arc<ChunkserverState> {
        Arc::new(ChunkserverState::new(
            Arc::new(MemoryStorage::new()),
            ConnectionCache::new(Duration::from_secs(60)),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn basic_write_read() {
        let state = state();
        let id = ChunkId::from_raw(1);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();
        let (data, version) = state.read(id, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(version, Version::from_raw(1));
    }

    #[tokio::test]
    async fn stale_write_leaves_bytes_unchanged() {
        let state = state();
        let id = ChunkId::from_raw(2);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();

        // version 0 is no longer current
        let err = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stale(v) if v == Version::from_raw(1)));
        let (data, version) = state.read(id, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(version, Version::from_raw(1));

        // the right version overlays in place
        let token = state
            .start_write(id, Version::from_raw(1), 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(2)).await.unwrap();
        let (data, version) = state.read(id, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"xello");
        assert_eq!(version, Version::from_raw(2));
    }

    #[tokio::test]
    async fn second_staging_is_busy() {
        let state = state();
        let id = ChunkId::from_raw(3);
        let _token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let err = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[tokio::test]
    async fn abort_frees_the_slot_and_discards_bytes() {
        let state = state();
        let id = ChunkId::from_raw(4);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"junk"))
            .await
            .unwrap();
        state.abort_write(Some(token), None);
        assert!(matches!(
            state.commit_write(token, Version::from_raw(1)).await,
            Err(Error::NotFound)
        ));
        // nothing was created
        assert_eq!(state.exists(id).await.unwrap(), (false, Version::ZERO));
        // and the slot is free again
        state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"ok"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_after_delete_revalidates() {
        let state = state();
        let id = ChunkId::from_raw(5);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"v1"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();

        let token = state
            .start_write(id, Version::from_raw(1), 0, Bytes::from_static(b"v2"))
            .await
            .unwrap();
        state.delete(id, Version::from_raw(1)).await.unwrap();
        // the staged slot died with the chunk
        assert!(matches!(
            state.commit_write(token, Version::from_raw(2)).await,
            Err(Error::NotFound)
        ));
        assert!(matches!(state.read(id, 0, 2).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn delete_checks_version() {
        let state = state();
        let id = ChunkId::from_raw(6);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"v1"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();
        assert!(matches!(
            state.delete(id, Version::from_raw(9)).await,
            Err(Error::Stale(v)) if v == Version::from_raw(1)
        ));
        state.delete(id, Version::ANY).await.unwrap();
    }

    #[tokio::test]
    async fn offset_bound_rejected_without_state_change() {
        let state = state();
        let id = ChunkId::from_raw(7);
        let err = state
            .start_write(id, Version::ZERO, MAX_CHUNK_SIZE - 1, Bytes::from_static(b"xy"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SizeExceeded));
        assert_eq!(state.exists(id).await.unwrap(), (false, Version::ZERO));
        // the slot was never taken
        state
            .start_write(id, Version::ZERO, MAX_CHUNK_SIZE - 2, Bytes::from_static(b"xy"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_length_reads_stored_extent() {
        let state = state();
        let id = ChunkId::from_raw(8);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"abcdef"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();
        let (data, _) = state.read(id, 2, 0).await.unwrap();
        assert_eq!(&data[..], b"cdef");
    }

    #[tokio::test]
    async fn any_version_skips_the_precondition() {
        let state = state();
        let id = ChunkId::from_raw(9);
        let token = state
            .start_write(id, Version::ZERO, 0, Bytes::from_static(b"v1"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(1)).await.unwrap();
        let token = state
            .start_write(id, Version::ANY, 0, Bytes::from_static(b"v2"))
            .await
            .unwrap();
        state.commit_write(token, Version::from_raw(2)).await.unwrap();
        let (data, version) = state.read(id, 0, 2).await.unwrap();
        assert_eq!(&data[..], b"v2");
        assert_eq!(version, Version::from_raw(2));
    }
}
