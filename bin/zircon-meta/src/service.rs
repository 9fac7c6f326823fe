//! Metadata-cache gRPC service implementation.

use crate::cache::MetadataCache;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;
use zircon_common::{ChunkId, Error, ServerName, Version};
use zircon_proto::common::RpcError;
use zircon_proto::meta::metadata_cache_service_server::MetadataCacheService;
use zircon_proto::meta::{
    AbortWriteRequest, AbortWriteResponse, BeginNewRequest, BeginNewResponse, ChunkMeta,
    CommitDeleteRequest, CommitDeleteResponse, CommitWriteRequest, CommitWriteResponse,
    ReplicaLocation, ResolveRequest, ResolveResponse, StartWriteRequest, StartWriteResponse,
};

pub struct MetadataCacheGrpc {
    cache: Arc<MetadataCache>,
}

impl MetadataCacheGrpc {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }
}

/// Errors as clients should see them: a lapsed lease here means the shard
/// has (or will shortly have) another owner, so it surfaces as `NotOwner`
/// and the client re-resolves.
fn client_error(err: Error) -> RpcError {
    match err {
        Error::LeaseExpired => RpcError::from(&Error::NotOwner(ServerName::default())),
        other => RpcError::from(&other),
    }
}

fn client_result<T>(result: &Result<T, Error>) -> Option<RpcError> {
    match result {
        Ok(_) => None,
        Err(Error::LeaseExpired) => Some(client_error(Error::LeaseExpired)),
        Err(e) => Some(RpcError::from(e)),
    }
}

#[tonic::async_trait]
impl MetadataCacheService for MetadataCacheGrpc {
    async fn resolve(
        &self,
        request: Request<ResolveRequest>,
    ) -> Result<Response<ResolveResponse>, Status> {
        let req = request.into_inner();
        let id = ChunkId::from_raw(req.chunk_id);
        Ok(Response::new(match self.cache.resolve(id).await {
            Ok(resolved) => ResolveResponse {
                error: None,
                meta: Some(ChunkMeta {
                    chunk_id: id.as_u64(),
                    version: resolved.version.as_u64(),
                    locations: resolved
                        .locations
                        .into_iter()
                        .map(|(name, address)| ReplicaLocation {
                            name: name.as_str().to_string(),
                            address: address.as_str().to_string(),
                        })
                        .collect(),
                    last_writer: resolved
                        .last_writer
                        .map(|name| name.as_str().to_string())
                        .unwrap_or_default(),
                }),
            },
            Err(e) => ResolveResponse {
                error: Some(client_error(e)),
                meta: None,
            },
        }))
    }

    async fn begin_new(
        &self,
        _request: Request<BeginNewRequest>,
    ) -> Result<Response<BeginNewResponse>, Status> {
        let result = self.cache.begin_new().await;
        Ok(Response::new(BeginNewResponse {
            error: client_result(&result),
            chunk_id: result.map(|id| id.as_u64()).unwrap_or_default(),
        }))
    }

    async fn start_write(
        &self,
        request: Request<StartWriteRequest>,
    ) -> Result<Response<StartWriteResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .cache
            .start_write(
                ChunkId::from_raw(req.chunk_id),
                Version::from_raw(req.expected_version),
            )
            .await;
        Ok(Response::new(match result {
            Ok(started) => StartWriteResponse {
                error: None,
                base_version: started.base.as_u64(),
                target_version: started.target.as_u64(),
                locations: started
                    .locations
                    .into_iter()
                    .map(|(name, address)| ReplicaLocation {
                        name: name.as_str().to_string(),
                        address: address.as_str().to_string(),
                    })
                    .collect(),
                write_id: started.write_id.as_bytes().to_vec(),
            },
            Err(e) => StartWriteResponse {
                error: Some(client_error(e)),
                base_version: 0,
                target_version: 0,
                locations: Vec::new(),
                write_id: Vec::new(),
            },
        }))
    }

    async fn commit_write(
        &self,
        request: Request<CommitWriteRequest>,
    ) -> Result<Response<CommitWriteResponse>, Status> {
        let req = request.into_inner();
        let result = match Uuid::from_slice(&req.write_id) {
            Ok(write_id) => {
                let succeeded: Vec<ServerName> =
                    req.succeeded.into_iter().map(ServerName::new).collect();
                self.cache.commit_write(write_id, &succeeded).await
            }
            Err(_) => Err(Error::NotFound),
        };
        Ok(Response::new(CommitWriteResponse {
            error: client_result(&result),
            version: result.map(|v| v.as_u64()).unwrap_or_default(),
        }))
    }

    async fn abort_write(
        &self,
        request: Request<AbortWriteRequest>,
    ) -> Result<Response<AbortWriteResponse>, Status> {
        let req = request.into_inner();
        let result = match Uuid::from_slice(&req.write_id) {
            Ok(write_id) => self.cache.abort_write(write_id).await,
            Err(_) => Ok(()),
        };
        Ok(Response::new(AbortWriteResponse {
            error: client_result(&result),
        }))
    }

    async fn commit_delete(
        &self,
        request: Request<CommitDeleteRequest>,
    ) -> Result<Response<CommitDeleteResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .cache
            .commit_delete(
                ChunkId::from_raw(req.chunk_id),
                Version::from_raw(req.expected_version),
            )
            .await;
        Ok(Response::new(CommitDeleteResponse {
            error: client_result(&result),
        }))
    }
}
