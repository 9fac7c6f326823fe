//! Core type definitions for Zircon
//!
//! This module defines the fundamental types used throughout the system:
//! chunk and version identifiers, server identity, shard math, and the
//! per-chunk metadata record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a chunk in bytes (16 MiB).
///
/// Every read obeys `offset + length <= MAX_CHUNK_SIZE` and every write
/// `offset + data.len() <= MAX_CHUNK_SIZE`.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Number of metadata shards the chunk-id space is partitioned into.
pub const SHARD_COUNT: u32 = 1024;

/// Opaque identifier of a chunk, globally unique across the fleet.
///
/// Minted by a metadata cache; the low bits encode the minting shard so
/// that an id always hashes back into the shard that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(u64);

impl ChunkId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The metadata shard covering this chunk.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        ShardId((self.0 % u64::from(SHARD_COUNT)) as u32)
    }

    /// Fixed-width hex rendering, also used for on-disk replica file names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse the fixed-width hex rendering produced by [`ChunkId::to_hex`].
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw: [u8; 8] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(raw)))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Per-chunk monotonic version counter used for optimistic concurrency.
///
/// Version 0 means "does not yet exist"; [`Version::ANY`] bypasses the
/// compare-and-set check entirely.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The "not yet written" version.
    pub const ZERO: Self = Self(0);

    /// Sentinel that skips the version precondition.
    pub const ANY: Self = Self(u64::MAX);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_any(&self) -> bool {
        self.0 == u64::MAX
    }

    /// The version a successful write advances to.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this (current) version satisfies the caller's precondition.
    #[must_use]
    pub fn satisfies(&self, expected: Version) -> bool {
        expected.is_any() || *self == expected
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "Version(any)")
        } else {
            write!(f, "Version({})", self.0)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a metadata shard, `0..SHARD_COUNT`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(u32);

impl ShardId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable string identity of a process, registered in etcd at startup.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName(String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerName({:?})", self.0)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current network address of a server, updated at startup and on rebind.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerAddress({:?})", self.0)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable 64-bit server identifier, issued at first registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u64);

impl ServerId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a registered server fills in the fleet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerRole {
    Chunkserver,
    MetadataCache,
    Frontend,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunkserver => write!(f, "chunkserver"),
            Self::MetadataCache => write!(f, "metadata-cache"),
            Self::Frontend => write!(f, "frontend"),
        }
    }
}

/// The metadata record mapping a chunk to its current version and replicas.
///
/// Stored serialized in etcd under `/meta/<chunkId>` and mutated only under
/// the shard owner's lease. A record at version 0 is a pending creation and
/// is invisible to readers; a tombstoned record is a committed delete that
/// still has replicas left to reap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metametadata {
    pub chunk_id: ChunkId,
    pub version: Version,
    pub locations: Vec<ServerName>,
    #[serde(default)]
    pub last_writer: Option<ServerName>,
    #[serde(default)]
    pub tombstone: bool,
}

impl Metametadata {
    /// The record a freshly-claimed chunk id starts from.
    #[must_use]
    pub fn zero(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            version: Version::ZERO,
            locations: Vec::new(),
            last_writer: None,
            tombstone: false,
        }
    }

    /// Created by `New` but never successfully written.
    #[must_use]
    pub fn is_pending_create(&self) -> bool {
        self.version.is_zero() && !self.tombstone
    }

    /// Visible to readers: written at least once and not deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.version.is_zero() && !self.tombstone
    }
}

/// Validate read bounds against the chunk size limit.
pub fn check_read_bounds(offset: u32, length: u32) -> crate::error::Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= MAX_CHUNK_SIZE => Ok(()),
        _ => Err(crate::error::Error::SizeExceeded),
    }
}

/// Validate write bounds against the chunk size limit.
pub fn check_write_bounds(offset: u32, len: usize) -> crate::error::Result<()> {
    let len = u32::try_from(len).map_err(|_| crate::error::Error::SizeExceeded)?;
    check_read_bounds(offset, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_hex_round_trip() {
        let id = ChunkId::from_raw(0xdead_beef_0042_1234);
        assert_eq!(id.to_hex(), "deadbeef00421234");
        assert_eq!(ChunkId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(ChunkId::from_hex("zz"), None);
        // anything shorter than the fixed width is rejected, not zero-padded
        assert_eq!(ChunkId::from_hex("ff"), None);
    }

    #[test]
    fn shard_mapping_is_modulo() {
        let id = ChunkId::from_raw(7 * u64::from(SHARD_COUNT) + 13);
        assert_eq!(id.shard(), ShardId::from_raw(13));
    }

    #[test]
    fn version_precondition() {
        let current = Version::from_raw(4);
        assert!(current.satisfies(Version::from_raw(4)));
        assert!(current.satisfies(Version::ANY));
        assert!(!current.satisfies(Version::from_raw(3)));
        assert_eq!(current.next(), Version::from_raw(5));
    }

    #[test]
    fn read_bounds() {
        assert!(check_read_bounds(0, MAX_CHUNK_SIZE).is_ok());
        assert!(check_read_bounds(MAX_CHUNK_SIZE - 1, 1).is_ok());
        assert!(check_read_bounds(MAX_CHUNK_SIZE - 1, 2).is_err());
        assert!(check_read_bounds(u32::MAX, 2).is_err());
    }

    #[test]
    fn pending_create_is_not_live() {
        let meta = Metametadata::zero(ChunkId::from_raw(1));
        assert!(meta.is_pending_create());
        assert!(!meta.is_live());
    }
}
