//! Zircon common - shared types, errors and configuration
//!
//! Everything here is consumed by every other crate in the workspace: the
//! identifier and version newtypes, the per-chunk metadata record, the
//! fleet-wide error enum, and the shared TOML configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    ClientConfig, CommitFloor, Config, LeaseConfig, ReconcileConfig, ReplicationConfig,
    StorageType,
};
pub use error::{Error, Result};
pub use types::{
    check_read_bounds, check_write_bounds, ChunkId, Metametadata, ServerAddress, ServerId,
    ServerName, ServerRole, ShardId, Version, MAX_CHUNK_SIZE, SHARD_COUNT,
};
