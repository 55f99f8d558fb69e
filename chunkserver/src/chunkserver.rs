//! Chunk replica: owns a set of chunks on one disk, applies mutations in
//! version order, and serves the data plane of the mutation pipeline.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tonic::{Request, Response, Status};
use tracing::Instrument;

use gfs_common::rpc::{call_all, connect};
use gfs_common::telemetry::{RequestId, RequestTag};
use gfs_common::{Config, GfsError};

use crate::download_buffer::{DataKey, DownloadBuffer};
use crate::gfs::chunk_server_service_client::ChunkServerServiceClient;
use crate::gfs::chunk_server_service_server::ChunkServerService;
use crate::gfs::master_service_client::MasterServiceClient;
use crate::gfs::{
    ApplyCopyRequest, ApplyCopyResponse, ApplyMutationRequest, ApplyMutationResponse,
    AppendChunkRequest, AppendChunkResponse, CreateChunkRequest, CreateChunkResponse, DataId,
    ErrorCode, ForwardDataRequest, ForwardDataResponse, HeartbeatRequest, MutationKind,
    PushDataAndForwardRequest, PushDataAndForwardResponse, ReadChunkRequest, ReadChunkResponse,
    SendCopyRequest, SendCopyResponse, WriteChunkRequest, WriteChunkResponse,
};

/// A mutation buffered on a replica until its predecessor version has been
/// applied to disk.
#[derive(Debug)]
struct Mutation {
    kind: MutationKind,
    data: Vec<u8>,
    offset: u64,
}

#[derive(Debug, Default)]
struct ChunkState {
    /// Byte length of the chunk as committed (may briefly run ahead of the
    /// persisted bytes while mutations drain).
    length: u64,
    /// Greatest version applied to disk.
    version: u64,
    /// Greatest version ever assigned.
    newest_version: u64,
    /// Pending mutations keyed by version.
    mutations: HashMap<u64, Mutation>,
}

impl ChunkState {
    /// Allocate the next version (pre-increment of `newest_version`).
    fn next_version(&mut self) -> u64 {
        self.newest_version += 1;
        self.newest_version
    }

    fn quiescent(&self) -> bool {
        self.version == self.newest_version
    }
}

#[derive(Debug, Default)]
struct ChunkInfo {
    state: RwLock<ChunkState>,
}

#[derive(Clone)]
pub struct ChunkServer {
    /// Address this server advertises to the master and its peers.
    address: String,
    master: String,
    server_root: PathBuf,
    config: Config,
    buffer: Arc<DownloadBuffer>,
    chunks: Arc<RwLock<HashMap<u64, Arc<ChunkInfo>>>>,
    /// Handles mutated as primary since the last heartbeat; flushed as
    /// lease-extension hints.
    pending_extensions: Arc<Mutex<HashSet<u64>>>,
}

impl ChunkServer {
    pub fn new(
        address: String,
        master: String,
        server_root: PathBuf,
        config: Config,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&server_root)?;
        let buffer = Arc::new(DownloadBuffer::new(config.download_buffer_expire));
        Ok(ChunkServer {
            address,
            master,
            server_root,
            config,
            buffer,
            chunks: Arc::new(RwLock::new(HashMap::new())),
            pending_extensions: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn download_buffer(&self) -> Arc<DownloadBuffer> {
        self.buffer.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().expect("chunk table lock poisoned").len()
    }

    fn chunk_path(&self, handle: u64) -> PathBuf {
        self.server_root.join(format!("chunk{}.chk", handle))
    }

    fn chunk(&self, handle: u64) -> Result<Arc<ChunkInfo>, GfsError> {
        self.chunks
            .read()
            .expect("chunk table lock poisoned")
            .get(&handle)
            .cloned()
            .ok_or(GfsError::ChunkNotFound(handle))
    }

    /// Registry entry for `handle`, created on demand. Used by the
    /// re-replication sink, where the local replica may not have seen the
    /// chunk before.
    fn chunk_or_register(&self, handle: u64) -> Arc<ChunkInfo> {
        let mut chunks = self.chunks.write().expect("chunk table lock poisoned");
        chunks.entry(handle).or_default().clone()
    }

    fn take_staged(&self, id: DataKey) -> Result<Vec<u8>, GfsError> {
        self.buffer.take(id).ok_or(GfsError::DataNotFound {
            handle: id.handle,
            nonce: id.nonce,
        })
    }

    fn note_lease_extension(&self, handle: u64) {
        self.pending_extensions
            .lock()
            .expect("lease extension lock poisoned")
            .insert(handle);
    }

    /// Write `data` at `offset` into the backing file, creating it if
    /// needed.
    fn write_chunk_file(&self, handle: u64, data: &[u8], offset: u64) -> Result<(), GfsError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o744)
            .open(self.chunk_path(handle))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Replace the backing file's contents wholesale (re-replication sink).
    fn overwrite_chunk_file(&self, handle: u64, data: &[u8]) -> Result<(), GfsError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o744)
            .open(self.chunk_path(handle))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; returns what the disk actually
    /// holds, which may be short while mutations are still draining.
    fn read_chunk_file(&self, handle: u64, offset: u64, len: usize) -> Result<Vec<u8>, GfsError> {
        let mut file = File::open(self.chunk_path(handle))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Drain the mutation buffer in strictly ascending version order.
    /// `Pad` extends the file to the chunk boundary by writing a single
    /// zero byte at `max_chunk_size - 1`. When the buffer empties, the
    /// version counters are resynced.
    fn apply_mutations(&self, handle: u64, chunk: &ChunkInfo) -> Result<(), GfsError> {
        let mut st = chunk.state.write().expect("chunk lock poisoned");
        loop {
            let next = st.version + 1;
            let Some(m) = st.mutations.remove(&next) else {
                break;
            };

            let pad = [0u8];
            let (data, offset): (&[u8], u64) = match m.kind {
                MutationKind::MutationPad => (&pad, self.config.max_chunk_size - 1),
                _ => (&m.data, m.offset),
            };

            st.version = next;
            let end = offset + data.len() as u64;
            if end > st.length {
                st.length = end;
            }
            tracing::debug!(
                "{} : apply {:?} to chunk {} version {}",
                self.address,
                m.kind,
                handle,
                next
            );
            self.write_chunk_file(handle, data, offset)?;
        }

        if st.mutations.is_empty() {
            st.newest_version = st.version;
        }
        Ok(())
    }

    /// Buffer a mutation at `version`, failing on a slot collision.
    fn buffer_mutation(
        chunk: &ChunkInfo,
        handle: u64,
        version: u64,
        mutation: Mutation,
    ) -> Result<(), GfsError> {
        let mut st = chunk.state.write().expect("chunk lock poisoned");
        if st.mutations.contains_key(&version) {
            return Err(GfsError::DuplicatedVersion { handle, version });
        }
        if version > st.newest_version {
            st.newest_version = version;
        }
        st.mutations.insert(version, mutation);
        Ok(())
    }

    async fn fan_out_mutation(
        &self,
        secondaries: &[String],
        kind: MutationKind,
        version: u64,
        data_id: DataId,
        offset: u64,
        request_id: RequestId,
    ) -> Result<(), GfsError> {
        let calls = secondaries
            .iter()
            .map(|addr| {
                let addr = addr.clone();
                let data_id = data_id.clone();
                let request_id = request_id.clone();
                async move {
                    apply_mutation_on(addr, kind, version, data_id, offset, request_id).await
                }
            })
            .collect();
        call_all(calls).await
    }
}

async fn forward_data_to(
    addr: String,
    data_id: DataId,
    data: Vec<u8>,
    request_id: RequestId,
) -> Result<(), GfsError> {
    let channel = connect(&addr).await?;
    let mut client =
        ChunkServerServiceClient::with_interceptor(channel, RequestTag::Propagate(request_id));
    client
        .forward_data(ForwardDataRequest {
            data_id: Some(data_id),
            data,
        })
        .await
        .map_err(GfsError::rpc)?;
    Ok(())
}

async fn apply_mutation_on(
    addr: String,
    kind: MutationKind,
    version: u64,
    data_id: DataId,
    offset: u64,
    request_id: RequestId,
) -> Result<(), GfsError> {
    let channel = connect(&addr).await?;
    let mut client =
        ChunkServerServiceClient::with_interceptor(channel, RequestTag::Propagate(request_id));
    client
        .apply_mutation(ApplyMutationRequest {
            kind: kind as i32,
            version,
            data_id: Some(data_id),
            offset,
        })
        .await
        .map_err(GfsError::rpc)?;
    Ok(())
}

async fn apply_copy_on(
    addr: String,
    handle: u64,
    data: Vec<u8>,
    version: u64,
    request_id: RequestId,
) -> Result<(), GfsError> {
    let channel = connect(&addr).await?;
    let mut client =
        ChunkServerServiceClient::with_interceptor(channel, RequestTag::Propagate(request_id));
    client
        .apply_copy(ApplyCopyRequest {
            handle,
            data,
            version,
        })
        .await
        .map_err(GfsError::rpc)?;
    Ok(())
}

#[tonic::async_trait]
impl ChunkServerService for ChunkServer {
    async fn push_data_and_forward(
        &self,
        request: Request<PushDataAndForwardRequest>,
    ) -> Result<Response<PushDataAndForwardResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("push_data_and_forward");
        async move {
            let req = request.into_inner();
            if req.data.len() as u64 > self.config.max_chunk_size {
                return Err(Status::invalid_argument(format!(
                    "data is too large: {} > {}",
                    req.data.len(),
                    self.config.max_chunk_size
                )));
            }

            let id = self.buffer.new_data_id(req.handle);
            self.buffer.set(id, req.data.clone());
            let data_id = DataId::from(id);

            let calls = req
                .forward_to
                .iter()
                .map(|addr| {
                    let addr = addr.clone();
                    let data_id = data_id.clone();
                    let data = req.data.clone();
                    let request_id = request_id.clone();
                    async move { forward_data_to(addr, data_id, data, request_id).await }
                })
                .collect();
            call_all(calls).await.map_err(Status::from)?;

            Ok(Response::new(PushDataAndForwardResponse {
                data_id: Some(data_id),
            }))
        }
        .instrument(span)
        .await
    }

    async fn forward_data(
        &self,
        request: Request<ForwardDataRequest>,
    ) -> Result<Response<ForwardDataResponse>, Status> {
        let req = request.into_inner();
        let data_id = req
            .data_id
            .ok_or_else(|| Status::invalid_argument("missing data id"))?;
        let key = DataKey::from(&data_id);
        if self.buffer.contains(key) {
            return Err(GfsError::DuplicateData {
                handle: key.handle,
                nonce: key.nonce,
            }
            .into());
        }
        self.buffer.set(key, req.data);
        Ok(Response::new(ForwardDataResponse {}))
    }

    async fn create_chunk(
        &self,
        request: Request<CreateChunkRequest>,
    ) -> Result<Response<CreateChunkResponse>, Status> {
        let req = request.into_inner();
        tracing::info!("{} : create chunk {}", self.address, req.handle);

        {
            let mut chunks = self.chunks.write().expect("chunk table lock poisoned");
            if chunks.contains_key(&req.handle) {
                tracing::warn!("chunk {} already exists, ignoring create", req.handle);
                return Ok(Response::new(CreateChunkResponse {}));
            }
            chunks.insert(req.handle, Arc::new(ChunkInfo::default()));
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o744)
            .open(self.chunk_path(req.handle))
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(CreateChunkResponse {}))
    }

    async fn read_chunk(
        &self,
        request: Request<ReadChunkRequest>,
    ) -> Result<Response<ReadChunkResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("read_chunk");
        async move {
            let req = request.into_inner();
            let chunk = self.chunk(req.handle).map_err(Status::from)?;

            let st = chunk.state.read().expect("chunk lock poisoned");
            if req.offset >= st.length {
                return Ok(Response::new(ReadChunkResponse {
                    data: Vec::new(),
                    length: 0,
                    error_code: ErrorCode::ReadEof as i32,
                }));
            }

            let to_read = req.length.min(st.length - req.offset) as usize;
            let data = self
                .read_chunk_file(req.handle, req.offset, to_read)
                .map_err(Status::from)?;
            let length = data.len() as u64;
            let error_code = if req.offset + req.length > st.length {
                ErrorCode::ReadEof
            } else {
                ErrorCode::NoError
            };
            drop(st);

            Ok(Response::new(ReadChunkResponse {
                data,
                length,
                error_code: error_code as i32,
            }))
        }
        .instrument(span)
        .await
    }

    async fn write_chunk(
        &self,
        request: Request<WriteChunkRequest>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("write_chunk");
        async move {
            let req = request.into_inner();
            let data_id = req
                .data_id
                .ok_or_else(|| Status::invalid_argument("missing data id"))?;
            let key = DataKey::from(&data_id);
            let data = self.take_staged(key).map_err(Status::from)?;

            let new_len = req.offset + data.len() as u64;
            if new_len > self.config.max_chunk_size {
                return Err(Status::invalid_argument(format!(
                    "write end {} exceeds max chunk size {}",
                    new_len, self.config.max_chunk_size
                )));
            }

            let handle = key.handle;
            let chunk = self.chunk(handle).map_err(Status::from)?;

            // Raise the committed length and claim the next version in one
            // lock scope; the drain below may run on another handler's
            // thread the moment the lock drops.
            let version = {
                let mut st = chunk.state.write().expect("chunk lock poisoned");
                if new_len > st.length {
                    st.length = new_len;
                }
                let version = st.next_version();
                if st.mutations.contains_key(&version) {
                    return Err(GfsError::DuplicatedVersion { handle, version }.into());
                }
                st.mutations.insert(
                    version,
                    Mutation {
                        kind: MutationKind::MutationWrite,
                        data,
                        offset: req.offset,
                    },
                );
                version
            };

            self.apply_mutations(handle, &chunk).map_err(Status::from)?;

            self.fan_out_mutation(
                &req.secondaries,
                MutationKind::MutationWrite,
                version,
                data_id,
                req.offset,
                request_id.clone(),
            )
            .await
            .map_err(Status::from)?;

            self.note_lease_extension(handle);
            Ok(Response::new(WriteChunkResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn append_chunk(
        &self,
        request: Request<AppendChunkRequest>,
    ) -> Result<Response<AppendChunkResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("append_chunk");
        async move {
            let req = request.into_inner();
            let data_id = req
                .data_id
                .ok_or_else(|| Status::invalid_argument("missing data id"))?;
            let key = DataKey::from(&data_id);
            let data = self.take_staged(key).map_err(Status::from)?;

            if data.len() as u64 > self.config.max_append_size {
                return Err(Status::invalid_argument(format!(
                    "append size {} exceeds max append size {}",
                    data.len(),
                    self.config.max_append_size
                )));
            }

            let handle = key.handle;
            let chunk = self.chunk(handle).map_err(Status::from)?;

            // Elect the mutation kind under the chunk lock: an append that
            // would overflow pads the chunk instead and tells the client to
            // move on to the next one.
            let (kind, version, offset, error_code) = {
                let mut st = chunk.state.write().expect("chunk lock poisoned");
                let offset = st.length;
                let new_len = st.length + data.len() as u64;
                let (kind, error_code) = if new_len > self.config.max_chunk_size {
                    st.length = self.config.max_chunk_size;
                    (MutationKind::MutationPad, ErrorCode::AppendExceedChunkSize)
                } else {
                    st.length = new_len;
                    (MutationKind::MutationAppend, ErrorCode::NoError)
                };
                let version = st.next_version();
                if st.mutations.contains_key(&version) {
                    return Err(GfsError::DuplicatedVersion { handle, version }.into());
                }
                st.mutations.insert(version, Mutation { kind, data, offset });
                (kind, version, offset, error_code)
            };

            tracing::info!(
                "primary {} : append chunk {} version {}",
                self.address,
                handle,
                version
            );

            self.apply_mutations(handle, &chunk).map_err(Status::from)?;

            self.fan_out_mutation(
                &req.secondaries,
                kind,
                version,
                data_id,
                offset,
                request_id.clone(),
            )
            .await
            .map_err(Status::from)?;

            self.note_lease_extension(handle);
            Ok(Response::new(AppendChunkResponse {
                offset,
                error_code: error_code as i32,
            }))
        }
        .instrument(span)
        .await
    }

    async fn apply_mutation(
        &self,
        request: Request<ApplyMutationRequest>,
    ) -> Result<Response<ApplyMutationResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("apply_mutation");
        async move {
            let req = request.into_inner();
            let kind = req.kind();
            let data_id = req
                .data_id
                .ok_or_else(|| Status::invalid_argument("missing data id"))?;
            let key = DataKey::from(&data_id);
            let data = self.take_staged(key).map_err(Status::from)?;

            let handle = key.handle;
            let chunk = self.chunk(handle).map_err(Status::from)?;

            Self::buffer_mutation(
                &chunk,
                handle,
                req.version,
                Mutation {
                    kind,
                    data,
                    offset: req.offset,
                },
            )
            .map_err(Status::from)?;

            tracing::debug!(
                "{} : buffered mutation for chunk {} version {}",
                self.address,
                handle,
                req.version
            );

            self.apply_mutations(handle, &chunk).map_err(Status::from)?;
            Ok(Response::new(ApplyMutationResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn send_copy(
        &self,
        request: Request<SendCopyRequest>,
    ) -> Result<Response<SendCopyResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("send_copy");
        async move {
            let req = request.into_inner();
            let chunk = self.chunk(req.handle).map_err(Status::from)?;

            let (data, version) = {
                let st = chunk.state.read().expect("chunk lock poisoned");
                if !st.quiescent() {
                    return Err(Status::unavailable(format!(
                        "chunk {} has mutations in flight",
                        req.handle
                    )));
                }
                let data = self
                    .read_chunk_file(req.handle, 0, st.length as usize)
                    .map_err(Status::from)?;
                (data, st.version)
            };

            tracing::info!(
                "{} : send copy of chunk {} to {}",
                self.address,
                req.handle,
                req.address
            );
            apply_copy_on(req.address, req.handle, data, version, request_id.clone())
                .await
                .map_err(Status::from)?;
            Ok(Response::new(SendCopyResponse {}))
        }
        .instrument(span)
        .await
    }

    async fn apply_copy(
        &self,
        request: Request<ApplyCopyRequest>,
    ) -> Result<Response<ApplyCopyResponse>, Status> {
        let request_id = RequestId::of(&request);
        let span = request_id.span("apply_copy");
        async move {
            let req = request.into_inner();
            tracing::info!("{} : apply copy of chunk {}", self.address, req.handle);

            let chunk = self.chunk_or_register(req.handle);
            let mut st = chunk.state.write().expect("chunk lock poisoned");
            st.mutations.clear();
            self.overwrite_chunk_file(req.handle, &req.data)
                .map_err(Status::from)?;
            st.length = req.data.len() as u64;
            st.version = req.version;
            st.newest_version = req.version;

            Ok(Response::new(ApplyCopyResponse {}))
        }
        .instrument(span)
        .await
    }
}

/// Heartbeat to the master every `heartbeat_interval`, flushing the pending
/// lease-extension set. Failures are logged and the hints re-queued for the
/// next beat.
pub async fn run_heartbeat_loop(server: ChunkServer) {
    let mut interval = tokio::time::interval(server.config.heartbeat_interval);
    loop {
        interval.tick().await;

        let extensions: Vec<u64> = {
            let mut pending = server
                .pending_extensions
                .lock()
                .expect("lease extension lock poisoned");
            pending.drain().collect()
        };

        let result = async {
            let channel = connect(&server.master).await?;
            let mut client =
                MasterServiceClient::with_interceptor(channel, RequestTag::PerCall);
            client
                .heartbeat(HeartbeatRequest {
                    address: server.address.clone(),
                    lease_extensions: extensions.clone(),
                })
                .await
                .map_err(GfsError::rpc)?;
            Ok::<(), GfsError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("heartbeat to {} failed: {}", server.master, e);
            server
                .pending_extensions
                .lock()
                .expect("lease extension lock poisoned")
                .extend(extensions);
        }
    }
}
