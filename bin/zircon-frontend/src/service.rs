//! Frontend gRPC service implementation.

use crate::registry::RegistryCache;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use zircon_common::ChunkId;
use zircon_proto::common::RpcError;
use zircon_proto::frontend::frontend_service_server::FrontendService;
use zircon_proto::frontend::{LocateRequest, LocateResponse};

pub struct FrontendGrpc {
    registry: Arc<RegistryCache>,
}

impl FrontendGrpc {
    pub fn new(registry: Arc<RegistryCache>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl FrontendService for FrontendGrpc {
    async fn locate(
        &self,
        request: Request<LocateRequest>,
    ) -> Result<Response<LocateResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(
            match self.registry.locate(ChunkId::from_raw(req.chunk_id)) {
                Ok(address) => LocateResponse {
                    error: None,
                    mc_address: address.as_str().to_string(),
                },
                Err(e) => LocateResponse {
                    error: Some(RpcError::from(&e)),
                    mc_address: String::new(),
                },
            },
        ))
    }
}
