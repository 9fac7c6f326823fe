//! In-memory chunk storage, for tests and single-node demos.

use crate::ChunkStorage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use zircon_common::{ChunkId, Error, Result, Version};

#[derive(Default)]
struct MemoryChunk {
    data: Vec<u8>,
    version: Version,
}

/// HashMap-backed storage. Every operation completes without suspension.
#[derive(Default)]
pub struct MemoryStorage {
    chunks: RwLock<HashMap<ChunkId, MemoryChunk>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStorage for MemoryStorage {
    async fn read(&self, id: ChunkId, offset: u32, length: u32) -> Result<Bytes> {
        let chunks = self.chunks.read();
        let chunk = chunks.get(&id).ok_or(Error::NotFound)?;
        let mut out = vec![0u8; length as usize];
        let start = offset as usize;
        if start < chunk.data.len() {
            let end = chunk.data.len().min(start + length as usize);
            out[..end - start].copy_from_slice(&chunk.data[start..end]);
        }
        Ok(Bytes::from(out))
    }

    async fn read_extent(&self, id: ChunkId, offset: u32) -> Result<Bytes> {
        let chunks = self.chunks.read();
        let chunk = chunks.get(&id).ok_or(Error::NotFound)?;
        let start = (offset as usize).min(chunk.data.len());
        Ok(Bytes::copy_from_slice(&chunk.data[start..]))
    }

    async fn write(&self, id: ChunkId, offset: u32, data: &[u8]) -> Result<()> {
        let mut chunks = self.chunks.write();
        let chunk = chunks.entry(id).or_default();
        let end = offset as usize + data.len();
        if chunk.data.len() < end {
            chunk.data.resize(end, 0);
        }
        chunk.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn set_version(&self, id: ChunkId, version: Version) -> Result<()> {
        let mut chunks = self.chunks.write();
        let chunk = chunks.get_mut(&id).ok_or(Error::NotFound)?;
        chunk.version = version;
        Ok(())
    }

    async fn version(&self, id: ChunkId) -> Result<Option<Version>> {
        Ok(self.chunks.read().get(&id).map(|c| c.version))
    }

    async fn list(&self) -> Result<Vec<ChunkId>> {
        Ok(self.chunks.read().keys().copied().collect())
    }

    async fn delete(&self, id: ChunkId) -> Result<()> {
        self.chunks
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_round_trip() {
        let storage = MemoryStorage::new();
        let id = ChunkId::from_raw(1);
        storage.write(id, 0, b"hello").await.unwrap();
        storage.set_version(id, Version::from_raw(1)).await.unwrap();
        let data = storage.read(id, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(storage.version(id).await.unwrap(), Some(Version::from_raw(1)));
    }

    #[tokio::test]
    async fn reads_past_extent_are_zero_filled() {
        let storage = MemoryStorage::new();
        let id = ChunkId::from_raw(2);
        storage.write(id, 0, b"ab").await.unwrap();
        let data = storage.read(id, 0, 6).await.unwrap();
        assert_eq!(&data[..], b"ab\0\0\0\0");
        let tail = storage.read(id, 100, 4).await.unwrap();
        assert_eq!(&tail[..], b"\0\0\0\0");
    }

    #[tokio::test]
    async fn gap_writes_zero_fill() {
        let storage = MemoryStorage::new();
        let id = ChunkId::from_raw(3);
        storage.write(id, 4, b"xy").await.unwrap();
        let data = storage.read(id, 0, 6).await.unwrap();
        assert_eq!(&data[..], b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn delete_then_not_found() {
        let storage = MemoryStorage::new();
        let id = ChunkId::from_raw(4);
        storage.write(id, 0, b"x").await.unwrap();
        storage.delete(id).await.unwrap();
        assert!(matches!(storage.read(id, 0, 1).await, Err(Error::NotFound)));
        assert!(matches!(storage.delete(id).await, Err(Error::NotFound)));
        assert_eq!(storage.version(id).await.unwrap(), None);
    }
}
