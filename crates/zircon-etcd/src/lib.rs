//! Zircon etcd interface
//!
//! Wraps the external etcd cluster with the primitives the fleet needs:
//! server registry, metadata lease granting, shard ownership claims, and
//! per-chunk metadata compare-and-swap. Only etcd's linearizable CAS,
//! lease-attached keys and prefix reads are assumed.

pub mod keys;
mod memory;
mod session;
mod store;

pub use keys::RegistryEntry;
pub use memory::{MemoryCluster, MemoryMetadataStore};
pub use session::EtcdSession;
pub use store::MetadataStore;
