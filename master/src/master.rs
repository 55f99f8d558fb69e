//! The coordinator: namespace and chunk-directory RPCs plus the periodic
//! dead-server / re-replication scan.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::Instrument;

use gfs_common::rpc::connect;
use gfs_common::telemetry::RequestId;
use gfs_common::{Config, GfsError};

use crate::chunk_directory::ChunkDirectory;
use crate::chunkserver_manager::ChunkServerManager;
use crate::gfs::chunk_server_service_client::ChunkServerServiceClient;
use crate::gfs::master_service_server::MasterService;
use crate::gfs::{
    CreateFileRequest, CreateFileResponse, DeleteFileRequest, DeleteFileResponse,
    GetChunkHandleRequest, GetChunkHandleResponse, GetFileInfoRequest, GetFileInfoResponse,
    GetPrimaryAndSecondariesRequest, GetPrimaryAndSecondariesResponse, GetReplicasRequest,
    GetReplicasResponse, HeartbeatRequest, HeartbeatResponse, ListRequest, ListResponse,
    MkdirRequest, MkdirResponse, SendCopyRequest,
};

#[derive(Clone)]
pub struct Master {
    config: Config,
    directory: Arc<ChunkDirectory>,
    manager: Arc<ChunkServerManager>,
}

impl Master {
    pub fn new(config: Config) -> Self {
        Master {
            config,
            directory: Arc::new(ChunkDirectory::new()),
            manager: Arc::new(ChunkServerManager::new()),
        }
    }

    pub fn live_server_count(&self) -> usize {
        self.manager.live_servers().len()
    }

    /// One pass of the background scan: drop servers that missed their
    /// heartbeats, then schedule a copy for every chunk that fell below the
    /// replica floor.
    pub async fn check_servers(&self) {
        for addr in self.manager.detect_dead_servers(self.config.server_timeout) {
            tracing::warn!("chunkserver {} missed heartbeats, removing", addr);
            match self.manager.remove_server(&addr) {
                Ok(handles) => self.directory.remove_location(&handles, &addr),
                Err(e) => tracing::warn!("remove of {} failed: {}", addr, e),
            }
        }

        for handle in self.directory.under_replicated(self.config.min_replicas) {
            let (from, to) = match self.manager.choose_re_replication(handle) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("chunk {} stays under-replicated: {}", handle, e);
                    continue;
                }
            };

            tracing::info!("re-replicating chunk {}: {} -> {}", handle, from, to);
            match send_copy_on(&from, handle, &to).await {
                Ok(()) => {
                    self.manager.record_chunk(&to, handle);
                    self.directory.add_location(handle, &to);
                }
                // The source may refuse while the chunk is mutating; the
                // next scan retries.
                Err(e) => tracing::warn!(
                    "re-replication of chunk {} from {} to {} failed: {}",
                    handle,
                    from,
                    to,
                    e
                ),
            }
        }
    }
}

async fn send_copy_on(from: &str, handle: u64, to: &str) -> Result<(), GfsError> {
    let channel = connect(from).await?;
    let mut client = ChunkServerServiceClient::new(channel);
    client
        .send_copy(SendCopyRequest {
            handle,
            address: to.to_string(),
        })
        .await
        .map_err(GfsError::rpc)?;
    Ok(())
}

/// Dead-server detection and re-replication, every `server_check_interval`.
pub async fn run_server_check_loop(master: Master) {
    let mut interval = tokio::time::interval(master.config.server_check_interval);
    loop {
        interval.tick().await;
        master.check_servers().await;
    }
}

#[tonic::async_trait]
impl MasterService for Master {
    async fn create_file(
        &self,
        request: Request<CreateFileRequest>,
    ) -> Result<Response<CreateFileResponse>, Status> {
        let span = RequestId::of(&request).span("create_file");
        async move {
            let req = request.into_inner();
            self.directory.create_file(&req.path)?;
            Ok(Response::new(CreateFileResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let span = RequestId::of(&request).span("delete_file");
        async move {
            let req = request.into_inner();
            self.directory.delete_file(&req.path)?;
            Ok(Response::new(DeleteFileResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn mkdir(
        &self,
        request: Request<MkdirRequest>,
    ) -> Result<Response<MkdirResponse>, Status> {
        let span = RequestId::of(&request).span("mkdir");
        async move {
            let req = request.into_inner();
            self.directory.mkdir(&req.path)?;
            Ok(Response::new(MkdirResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let span = RequestId::of(&request).span("list");
        async move {
            let req = request.into_inner();
            let files = self.directory.list(&req.path)?;
            Ok(Response::new(ListResponse { files }))
        }
        .instrument(span)
        .await
    }

    async fn get_file_info(
        &self,
        request: Request<GetFileInfoRequest>,
    ) -> Result<Response<GetFileInfoResponse>, Status> {
        let span = RequestId::of(&request).span("get_file_info");
        async move {
            let req = request.into_inner();
            let (is_dir, chunk_count) = self.directory.file_info(&req.path)?;
            Ok(Response::new(GetFileInfoResponse {
                is_dir,
                chunk_count,
            }))
        }
        .instrument(span)
        .await
    }

    async fn get_chunk_handle(
        &self,
        request: Request<GetChunkHandleRequest>,
    ) -> Result<Response<GetChunkHandleResponse>, Status> {
        let span = RequestId::of(&request).span("get_chunk_handle");
        async move {
            let req = request.into_inner();

            if let Some(handle) = self.directory.handle_at(&req.path, req.index)? {
                return Ok(Response::new(GetChunkHandleResponse { handle }));
            }

            // index == chunk_count: extend the file with a fresh chunk.
            let locations = self
                .manager
                .choose_servers(self.config.replication_factor)
                .map_err(Status::from)?;
            let (handle, created) = self.directory.allocate_chunk(
                &req.path,
                req.index,
                locations.clone(),
                self.config.lease_timeout,
            )?;

            if created {
                tracing::info!(
                    "allocated chunk {} for {:?}[{}] on {:?}",
                    handle,
                    req.path,
                    req.index,
                    locations
                );
                if let Err(e) = self.manager.add_chunk(&locations, handle).await {
                    // Membership is already recorded; the client retry will
                    // find the handle in place and the scan reconciles any
                    // replica that never materialized.
                    return Err(Status::unavailable(format!(
                        "chunk {} creation incomplete: {}",
                        handle, e
                    )));
                }
            }

            Ok(Response::new(GetChunkHandleResponse { handle }))
        }
        .instrument(span)
        .await
    }

    async fn get_replicas(
        &self,
        request: Request<GetReplicasRequest>,
    ) -> Result<Response<GetReplicasResponse>, Status> {
        let span = RequestId::of(&request).span("get_replicas");
        async move {
            let req = request.into_inner();
            let locations = self.directory.replicas(req.handle)?;
            Ok(Response::new(GetReplicasResponse { locations }))
        }
        .instrument(span)
        .await
    }

    async fn get_primary_and_secondaries(
        &self,
        request: Request<GetPrimaryAndSecondariesRequest>,
    ) -> Result<Response<GetPrimaryAndSecondariesResponse>, Status> {
        let span = RequestId::of(&request).span("get_primary_and_secondaries");
        async move {
            let req = request.into_inner();
            let live = self.manager.live_servers();
            let (primary, secondaries, lease_expire_ms) = self
                .directory
                .primary_and_secondaries(req.handle, &live, self.config.lease_timeout)?;
            Ok(Response::new(GetPrimaryAndSecondariesResponse {
                primary,
                secondaries,
                lease_expire_ms,
            }))
        }
        .instrument(span)
        .await
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let span = RequestId::of(&request).span("heartbeat");
        async move {
            let req = request.into_inner();
            self.manager.heartbeat(&req.address);
            for handle in req.lease_extensions {
                self.directory
                    .extend_lease(handle, &req.address, self.config.lease_timeout);
            }
            Ok(Response::new(HeartbeatResponse {}))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master() -> Master {
        Master::new(Config::default())
    }

    #[tokio::test]
    async fn namespace_round_trip_via_rpc_surface() {
        let master = test_master();
        master
            .mkdir(Request::new(MkdirRequest {
                path: "/dir".to_string(),
            }))
            .await
            .unwrap();
        master
            .create_file(Request::new(CreateFileRequest {
                path: "/dir/f".to_string(),
            }))
            .await
            .unwrap();

        let info = master
            .get_file_info(Request::new(GetFileInfoRequest {
                path: "/dir/f".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!info.is_dir);
        assert_eq!(info.chunk_count, 0);

        let listing = master
            .list(Request::new(ListRequest {
                path: "/dir".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].name, "f");

        master
            .delete_file(Request::new(DeleteFileRequest {
                path: "/dir/f".to_string(),
            }))
            .await
            .unwrap();
        let err = master
            .get_file_info(Request::new(GetFileInfoRequest {
                path: "/dir/f".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn chunk_handle_requires_live_servers() {
        let master = test_master();
        master
            .create_file(Request::new(CreateFileRequest {
                path: "/f".to_string(),
            }))
            .await
            .unwrap();

        let err = master
            .get_chunk_handle(Request::new(GetChunkHandleRequest {
                path: "/f".to_string(),
                index: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn chunk_index_past_end_is_rejected() {
        let master = test_master();
        master
            .create_file(Request::new(CreateFileRequest {
                path: "/f".to_string(),
            }))
            .await
            .unwrap();

        let err = master
            .get_chunk_handle(Request::new(GetChunkHandleRequest {
                path: "/f".to_string(),
                index: 1,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn heartbeat_registers_server_for_placement() {
        let master = test_master();
        master
            .heartbeat(Request::new(HeartbeatRequest {
                address: "127.0.0.1:7001".to_string(),
                lease_extensions: vec![],
            }))
            .await
            .unwrap();
        assert_eq!(master.live_server_count(), 1);
    }
}
