//! Filesystem-backed chunk storage.
//!
//! Layout: one file per chunk named by the chunk's hex id, plus a sidecar
//! `<hex-id>.v` holding the 8-byte little-endian version tag. A committed
//! write updates data first and the sidecar second; recovery reads both, so
//! a crash between the two leaves the replica at its previous tag.

use crate::ChunkStorage;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;
use zircon_common::{ChunkId, Error, Result, Version};

const VERSION_SUFFIX: &str = ".v";

pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Open (creating if needed) a storage directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn data_path(&self, id: ChunkId) -> PathBuf {
        self.root.join(id.to_hex())
    }

    fn version_path(&self, id: ChunkId) -> PathBuf {
        self.root.join(format!("{}{}", id.to_hex(), VERSION_SUFFIX))
    }

    async fn open_data(&self, id: ChunkId) -> Result<fs::File> {
        match fs::File::open(self.data_path(id)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ChunkStorage for FilesystemStorage {
    async fn read(&self, id: ChunkId, offset: u32, length: u32) -> Result<Bytes> {
        let mut file = self.open_data(id).await?;
        file.seek(SeekFrom::Start(u64::from(offset))).await?;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break; // rest of the buffer stays zero
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    async fn read_extent(&self, id: ChunkId, offset: u32) -> Result<Bytes> {
        let mut file = self.open_data(id).await?;
        file.seek(SeekFrom::Start(u64::from(offset))).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, id: ChunkId, offset: u32, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.data_path(id))
            .await?;
        // Seeking past EOF leaves a hole; the hole reads back as zeroes.
        file.seek(SeekFrom::Start(u64::from(offset))).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn set_version(&self, id: ChunkId, version: Version) -> Result<()> {
        if !fs::try_exists(self.data_path(id)).await? {
            return Err(Error::NotFound);
        }
        let mut file = fs::File::create(self.version_path(id)).await?;
        file.write_all(&version.as_u64().to_le_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn version(&self, id: ChunkId) -> Result<Option<Version>> {
        if !fs::try_exists(self.data_path(id)).await? {
            return Ok(None);
        }
        let raw = match fs::read(self.version_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::corrupt(format!("chunk {id} has no version tag")));
            }
            Err(e) => return Err(e.into()),
        };
        let tag: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::corrupt(format!("chunk {id} has a malformed version tag")))?;
        Ok(Some(Version::from_raw(u64::from_le_bytes(tag))))
    }

    async fn list(&self) -> Result<Vec<ChunkId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(VERSION_SUFFIX) {
                continue;
            }
            match ChunkId::from_hex(name) {
                Some(id) => ids.push(id),
                None => warn!(file = name, "ignoring foreign file in storage directory"),
            }
        }
        Ok(ids)
    }

    async fn delete(&self, id: ChunkId) -> Result<()> {
        match fs::remove_file(self.data_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = fs::remove_file(self.version_path(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trip_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = ChunkId::from_raw(0x42);
        {
            let storage = FilesystemStorage::open(dir.path()).await.unwrap();
            storage.write(id, 0, b"hello").await.unwrap();
            storage.set_version(id, Version::from_raw(3)).await.unwrap();
        }
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.version(id).await.unwrap(), Some(Version::from_raw(3)));
        let data = storage.read(id, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(storage.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn offset_write_and_zero_padding() {
        let dir = tempdir().unwrap();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = ChunkId::from_raw(7);
        storage.write(id, 4, b"xy").await.unwrap();
        let data = storage.read(id, 0, 8).await.unwrap();
        assert_eq!(&data[..], b"\0\0\0\0xy\0\0");
    }

    #[tokio::test]
    async fn missing_sidecar_is_corrupt() {
        let dir = tempdir().unwrap();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = ChunkId::from_raw(9);
        storage.write(id, 0, b"data").await.unwrap();
        // data durable, sidecar never written: the pre-image had no replica
        assert!(matches!(storage.version(id).await, Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn delete_removes_both_files() {
        let dir = tempdir().unwrap();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = ChunkId::from_raw(11);
        storage.write(id, 0, b"data").await.unwrap();
        storage.set_version(id, Version::from_raw(1)).await.unwrap();
        storage.delete(id).await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
        assert!(matches!(storage.delete(id).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn read_extent_stops_at_eof() {
        let dir = tempdir().unwrap();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = ChunkId::from_raw(13);
        storage.write(id, 0, b"abcdef").await.unwrap();
        let data = storage.read_extent(id, 2).await.unwrap();
        assert_eq!(&data[..], b"cdef");
    }
}
