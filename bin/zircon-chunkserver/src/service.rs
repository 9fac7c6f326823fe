//! Chunkserver gRPC service implementation.
//!
//! Thin wire glue over [`ChunkserverState`]: every handler converts its
//! request, runs the state operation, and folds the outcome into the
//! response's structured error field so retry payloads reach the caller.

use crate::state::ChunkserverState;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;
use zircon_common::{ChunkId, Version};
use zircon_proto::chunkserver::chunkserver_service_server::ChunkserverService;
use zircon_proto::chunkserver::{
    AbortWriteRequest, AbortWriteResponse, CommitWriteRequest, CommitWriteResponse, DeleteRequest,
    DeleteResponse, ExistsRequest, ExistsResponse, ReadRequest, ReadResponse, ReplicateFromRequest,
    ReplicateFromResponse, StartWriteRequest, StartWriteResponse,
};
use zircon_proto::common::RpcError;
use zircon_proto::rpc_error;

pub struct ChunkserverGrpc {
    state: Arc<ChunkserverState>,
}

impl ChunkserverGrpc {
    pub fn new(state: Arc<ChunkserverState>) -> Self {
        Self { state }
    }
}

fn parse_token(raw: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(raw).ok()
}

#[tonic::async_trait]
impl ChunkserverService for ChunkserverGrpc {
    async fn start_write(
        &self,
        request: Request<StartWriteRequest>,
    ) -> Result<Response<StartWriteResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .state
            .start_write(
                ChunkId::from_raw(req.chunk_id),
                Version::from_raw(req.expected_version),
                req.offset,
                req.data.into(),
            )
            .await;
        Ok(Response::new(StartWriteResponse {
            error: rpc_error(&result),
            token: result
                .map(|token| token.as_bytes().to_vec())
                .unwrap_or_default(),
        }))
    }

    async fn commit_write(
        &self,
        request: Request<CommitWriteRequest>,
    ) -> Result<Response<CommitWriteResponse>, Status> {
        let req = request.into_inner();
        let result = match parse_token(&req.token) {
            Some(token) => {
                self.state
                    .commit_write(token, Version::from_raw(req.new_version))
                    .await
            }
            None => Err(zircon_common::Error::NotFound),
        };
        Ok(Response::new(CommitWriteResponse {
            error: rpc_error(&result),
        }))
    }

    async fn abort_write(
        &self,
        request: Request<AbortWriteRequest>,
    ) -> Result<Response<AbortWriteResponse>, Status> {
        let req = request.into_inner();
        let chunk = (req.chunk_id != 0).then(|| ChunkId::from_raw(req.chunk_id));
        self.state.abort_write(parse_token(&req.token), chunk);
        Ok(Response::new(AbortWriteResponse { error: None }))
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .state
            .read(ChunkId::from_raw(req.chunk_id), req.offset, req.length)
            .await;
        Ok(Response::new(match result {
            Ok((data, version)) => ReadResponse {
                error: None,
                data: data.to_vec(),
                version: version.as_u64(),
            },
            Err(e) => ReadResponse {
                error: Some(RpcError::from(&e)),
                data: Vec::new(),
                version: 0,
            },
        }))
    }

    async fn replicate_from(
        &self,
        request: Request<ReplicateFromRequest>,
    ) -> Result<Response<ReplicateFromResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .state
            .replicate_from(
                ChunkId::from_raw(req.chunk_id),
                &req.peer_address,
                Version::from_raw(req.version),
            )
            .await;
        Ok(Response::new(ReplicateFromResponse {
            error: rpc_error(&result),
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .state
            .delete(ChunkId::from_raw(req.chunk_id), Version::from_raw(req.version))
            .await;
        Ok(Response::new(DeleteResponse {
            error: rpc_error(&result),
        }))
    }

    async fn exists(
        &self,
        request: Request<ExistsRequest>,
    ) -> Result<Response<ExistsResponse>, Status> {
        let req = request.into_inner();
        let result = self.state.exists(ChunkId::from_raw(req.chunk_id)).await;
        Ok(Response::new(match result {
            Ok((exists, version)) => ExistsResponse {
                error: None,
                exists,
                version: version.as_u64(),
            },
            Err(e) => ExistsResponse {
                error: Some(RpcError::from(&e)),
                exists: false,
                version: 0,
            },
        }))
    }
}
