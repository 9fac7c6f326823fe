//! Zircon protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for Zircon's internal
//! gRPC services, plus the conversions between the wire-level [`RpcError`]
//! and [`zircon_common::Error`].
//!
//! [`RpcError`]: common::RpcError

/// Shared wire types (errors)
pub mod common {
    tonic::include_proto!("zircon.common");
}

/// Chunkserver service (per-replica reads and two-phase writes)
pub mod chunkserver {
    tonic::include_proto!("zircon.chunkserver");
}

/// Metadata-cache service (resolution and write coordination)
pub mod meta {
    tonic::include_proto!("zircon.meta");
}

/// Frontend service (chunk-id to metadata-cache routing)
pub mod frontend {
    tonic::include_proto!("zircon.frontend");
}

mod convert;

pub use convert::{check, rpc_error};
