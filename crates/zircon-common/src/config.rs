//! Configuration types for Zircon
//!
//! One TOML file is shared by every role; each binary reads the sections it
//! needs. Key names are kebab-case (`server-name`, `etcd-servers`, ...).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration shared by all Zircon processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Stable identity this process registers under.
    pub server_name: String,
    /// Listen address (`host:port`).
    #[serde(default = "default_address")]
    pub address: String,
    /// Chunkserver storage backend.
    #[serde(default)]
    pub storage_type: StorageType,
    /// Root directory for the filesystem backend.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    /// Addresses of the external etcd cluster.
    #[serde(default)]
    pub etcd_servers: Vec<String>,
    /// Addresses of sync servers (consumed by the filesystem layer).
    #[serde(default)]
    pub sync_servers: Vec<String>,
    /// FUSE mount point (consumed by the filesystem layer).
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub client_config: ClientConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl Config {
    /// Load the shared configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&raw)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

fn default_address() -> String {
    "127.0.0.1:0".to_string()
}

/// Chunkserver storage backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Filesystem,
    Block,
}

/// Client-library tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// Frontend addresses the client round-robins over.
    #[serde(default)]
    pub frontend_servers: Vec<String>,
    /// Bounded retries for resolves and reads.
    #[serde(default = "default_resolve_retries")]
    pub resolve_retries: u32,
    /// Idle connections are closed after this long.
    #[serde(default = "default_connection_idle_ttl_ms")]
    pub connection_idle_ttl_ms: u64,
    /// Deadline applied to every outgoing RPC.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
}

impl ClientConfig {
    #[must_use]
    pub fn connection_idle_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_idle_ttl_ms)
    }

    #[must_use]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            frontend_servers: Vec::new(),
            resolve_retries: default_resolve_retries(),
            connection_idle_ttl_ms: default_connection_idle_ttl_ms(),
            request_deadline_ms: default_request_deadline_ms(),
        }
    }
}

fn default_resolve_retries() -> u32 {
    3
}

fn default_connection_idle_ttl_ms() -> u64 {
    60_000
}

fn default_request_deadline_ms() -> u64 {
    10_000
}

/// Replication parameters for the write protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicationConfig {
    /// Replicas each chunk is placed on.
    #[serde(default = "default_replication_target")]
    pub target: usize,
    /// How many listed replicas must commit before the version advances.
    #[serde(default)]
    pub commit_floor: CommitFloor,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            target: default_replication_target(),
            commit_floor: CommitFloor::default(),
        }
    }
}

fn default_replication_target() -> usize {
    3
}

/// Quorum floor for accepting a write with fewer than all replicas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitFloor {
    /// Every listed replica must commit (strongest durability).
    #[default]
    All,
    /// Tolerates one failed replica.
    NMinusOne,
}

impl CommitFloor {
    /// Minimum commits required out of `replicas` listed locations.
    #[must_use]
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            Self::All => replicas,
            Self::NMinusOne => replicas.saturating_sub(1).max(1),
        }
    }
}

/// Reconciliation triggering and throttling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconcileConfig {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl ReconcileConfig {
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    5_000
}

fn default_max_concurrent() -> usize {
    4
}

/// Lease TTLs and grace intervals.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LeaseConfig {
    /// TTL of the metadata lease; renewal runs at half this.
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: i64,
    /// Pending write entries at a metadata cache expire after this long.
    #[serde(default = "default_pending_write_ttl_ms")]
    pub pending_write_ttl_ms: u64,
    /// Never-written chunks are reaped after this long.
    #[serde(default = "default_pending_create_ttl_ms")]
    pub pending_create_ttl_ms: u64,
    /// Staged (uncommitted) writes on a chunkserver are dropped after this.
    #[serde(default = "default_staged_write_ttl_ms")]
    pub staged_write_ttl_ms: u64,
}

impl LeaseConfig {
    #[must_use]
    pub fn pending_write_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_write_ttl_ms)
    }

    #[must_use]
    pub fn pending_create_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_create_ttl_ms)
    }

    #[must_use]
    pub fn staged_write_ttl(&self) -> Duration {
        Duration::from_millis(self.staged_write_ttl_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: default_metadata_ttl_secs(),
            pending_write_ttl_ms: default_pending_write_ttl_ms(),
            pending_create_ttl_ms: default_pending_create_ttl_ms(),
            staged_write_ttl_ms: default_staged_write_ttl_ms(),
        }
    }
}

fn default_metadata_ttl_secs() -> i64 {
    10
}

fn default_pending_write_ttl_ms() -> u64 {
    30_000
}

fn default_pending_create_ttl_ms() -> u64 {
    60_000
}

fn default_staged_write_ttl_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_keys() {
        let config: Config = toml::from_str(
            r#"
            server-name = "topaz-5"
            address = "127.0.0.1:4040"
            storage-type = "filesystem"
            storage-path = "/var/lib/zircon"
            etcd-servers = ["127.0.0.1:2379"]

            [client-config]
            frontend-servers = ["127.0.0.1:4100"]
            resolve-retries = 5

            [replication]
            target = 3
            commit-floor = "n-minus-one"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_name, "topaz-5");
        assert_eq!(config.storage_type, StorageType::Filesystem);
        assert_eq!(config.client_config.resolve_retries, 5);
        assert_eq!(config.replication.commit_floor, CommitFloor::NMinusOne);
        // untouched sections fall back to defaults
        assert_eq!(config.lease.metadata_ttl_secs, 10);
    }

    #[test]
    fn commit_floor_required() {
        assert_eq!(CommitFloor::All.required(3), 3);
        assert_eq!(CommitFloor::NMinusOne.required(3), 2);
        assert_eq!(CommitFloor::NMinusOne.required(1), 1);
    }
}
