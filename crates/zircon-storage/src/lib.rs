//! Chunk storage backends
//!
//! A chunkserver owns its replica bytes through the [`ChunkStorage`]
//! interface: offset reads and writes, a per-chunk version tag, listing and
//! deletion. Chunks are logically zero-filled to [`MAX_CHUNK_SIZE`]; reads
//! past the stored extent return zeroes and writes past it zero-fill the gap.
//!
//! [`MAX_CHUNK_SIZE`]: zircon_common::MAX_CHUNK_SIZE

mod filesystem;
mod memory;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use zircon_common::{ChunkId, Config, Error, Result, StorageType, Version};

/// Backend interface a chunkserver stores replica blobs through.
///
/// Implementations are thin: bounds checking and write staging live in the
/// chunkserver, the backend only persists bytes and the version tag. The
/// durability contract is that `write` followed by `set_version` leaves the
/// replica recoverable at the new version, and a crash between the two
/// recovers the previous tag.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Read `length` bytes at `offset`. Reads past the stored extent return
    /// zeroes; a missing chunk is `NotFound`.
    async fn read(&self, id: ChunkId, offset: u32, length: u32) -> Result<Bytes>;

    /// Read the stored extent from `offset` (no zero padding).
    async fn read_extent(&self, id: ChunkId, offset: u32) -> Result<Bytes>;

    /// Write bytes at `offset`, creating the chunk if absent and
    /// zero-filling any gap before `offset`. Durable on return.
    async fn write(&self, id: ChunkId, offset: u32, data: &[u8]) -> Result<()>;

    /// Durably set the replica's version tag.
    async fn set_version(&self, id: ChunkId, version: Version) -> Result<()>;

    /// The replica's version tag, or `None` if the chunk is absent.
    /// A chunk whose tag cannot be recovered reads as `Corrupt`.
    async fn version(&self, id: ChunkId) -> Result<Option<Version>>;

    /// All chunk ids with stored data.
    async fn list(&self) -> Result<Vec<ChunkId>>;

    /// Remove the chunk's data and version tag.
    async fn delete(&self, id: ChunkId) -> Result<()>;
}

/// Construct the backend selected by the configuration.
pub async fn open_storage(config: &Config) -> Result<Arc<dyn ChunkStorage>> {
    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageType::Filesystem => {
            let path = config
                .storage_path
                .as_ref()
                .ok_or_else(|| Error::config("storage-type \"filesystem\" requires storage-path"))?;
            Ok(Arc::new(FilesystemStorage::open(path).await?))
        }
        StorageType::Block => Err(Error::config(
            "storage-type \"block\" is not supported by this build",
        )),
    }
}
