//! Client-side driver: translates file-offset reads, writes, and record
//! appends into chunk operations against the master and the chunkservers.

pub mod gfs {
    tonic::include_proto!("gfs");
}

use std::time::Duration;

use anyhow::{anyhow, bail};
use rand::seq::SliceRandom;
use tokio::time::sleep;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use gfs_common::rpc::connect;
use gfs_common::telemetry::RequestTag;
use gfs_common::{Config, GfsError};

use crate::gfs::chunk_server_service_client::ChunkServerServiceClient;
use crate::gfs::master_service_client::MasterServiceClient;
use crate::gfs::{
    AppendChunkRequest, CreateFileRequest, DeleteFileRequest, ErrorCode, GetChunkHandleRequest,
    GetFileInfoRequest, GetFileInfoResponse, GetPrimaryAndSecondariesRequest, GetReplicasRequest,
    ListRequest, MkdirRequest, PathInfo, PushDataAndForwardRequest, ReadChunkRequest,
    WriteChunkRequest,
};

const MAX_RETRIES: usize = 5;
const INITIAL_BACKOFF_MS: u64 = 100;
const BACKOFF_CAP: Duration = Duration::from_secs(5);

type MasterClient = MasterServiceClient<InterceptedService<Channel, RequestTag>>;
type ChunkClient = ChunkServerServiceClient<InterceptedService<Channel, RequestTag>>;

/// Outcome of a file-level read. `eof` is set once any chunk read reported
/// end of file; `data` holds whatever was read before that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Clone)]
pub struct Client {
    master: String,
    config: Config,
    max_retries: usize,
    initial_backoff_ms: u64,
}

impl Client {
    pub fn new(master: impl Into<String>, config: Config) -> Self {
        Client {
            master: master.into(),
            config,
            max_retries: MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    pub fn with_retry_config(mut self, max_retries: usize, initial_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    async fn master_client(&self) -> Result<MasterClient, GfsError> {
        let channel = connect(&self.master).await?;
        Ok(MasterServiceClient::with_interceptor(
            channel,
            RequestTag::PerCall,
        ))
    }

    async fn chunk_client(addr: &str) -> Result<ChunkClient, GfsError> {
        let channel = connect(addr).await?;
        Ok(ChunkServerServiceClient::with_interceptor(
            channel,
            RequestTag::PerCall,
        ))
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    // ---- namespace operations ----

    pub async fn create(&self, path: &str) -> anyhow::Result<()> {
        let mut client = self.master_client().await?;
        client
            .create_file(CreateFileRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let mut client = self.master_client().await?;
        client
            .delete_file(DeleteFileRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        let mut client = self.master_client().await?;
        client
            .mkdir(MkdirRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn list(&self, path: &str) -> anyhow::Result<Vec<PathInfo>> {
        let mut client = self.master_client().await?;
        let reply = client
            .list(ListRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(reply.into_inner().files)
    }

    pub async fn file_info(&self, path: &str) -> anyhow::Result<GetFileInfoResponse> {
        let mut client = self.master_client().await?;
        let reply = client
            .get_file_info(GetFileInfoRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(reply.into_inner())
    }

    /// Handle of `(path, index)`; the master allocates the chunk when
    /// `index` equals the current chunk count.
    pub async fn get_chunk_handle(&self, path: &str, index: u64) -> Result<u64, GfsError> {
        let mut client = self.master_client().await?;
        let reply = client
            .get_chunk_handle(GetChunkHandleRequest {
                path: path.to_string(),
                index,
            })
            .await
            .map_err(GfsError::rpc)?;
        Ok(reply.into_inner().handle)
    }

    // ---- chunk-level operations ----

    pub async fn get_replicas(&self, handle: u64) -> Result<Vec<String>, GfsError> {
        let mut client = self.master_client().await?;
        let reply = client
            .get_replicas(GetReplicasRequest { handle })
            .await
            .map_err(GfsError::rpc)?;
        Ok(reply.into_inner().locations)
    }

    async fn get_primary_and_secondaries(
        &self,
        handle: u64,
    ) -> Result<(String, Vec<String>), GfsError> {
        let mut client = self.master_client().await?;
        let reply = client
            .get_primary_and_secondaries(GetPrimaryAndSecondariesRequest { handle })
            .await
            .map_err(GfsError::rpc)?
            .into_inner();
        Ok((reply.primary, reply.secondaries))
    }

    /// Read up to `length` bytes at `offset` within a chunk from a randomly
    /// chosen replica, appending them to `out`. Returns the byte count, or
    /// `ReadEof` once the final bytes of the chunk have been appended.
    pub async fn read_chunk(
        &self,
        handle: u64,
        offset: u64,
        length: u64,
        out: &mut Vec<u8>,
    ) -> Result<u64, GfsError> {
        let replicas = self.get_replicas(handle).await?;
        let location = {
            let mut rng = rand::thread_rng();
            replicas
                .choose(&mut rng)
                .cloned()
                .ok_or_else(|| GfsError::Unknown(format!("chunk {} has no replicas", handle)))?
        };

        let mut client = Self::chunk_client(&location).await?;
        let reply = client
            .read_chunk(ReadChunkRequest {
                handle,
                offset,
                length,
            })
            .await
            .map_err(GfsError::rpc)?
            .into_inner();
        out.extend_from_slice(&reply.data);
        if reply.error_code() == ErrorCode::ReadEof {
            return Err(GfsError::ReadEof);
        }
        Ok(reply.data.len() as u64)
    }

    /// Push-then-commit a write of `data` at `offset` within a chunk.
    pub async fn write_chunk(
        &self,
        handle: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GfsError> {
        if offset + data.len() as u64 > self.config.max_chunk_size {
            return Err(GfsError::Unknown(format!(
                "write end {} exceeds max chunk size {}",
                offset + data.len() as u64,
                self.config.max_chunk_size
            )));
        }

        let (primary, secondaries) = self.get_primary_and_secondaries(handle).await?;

        let mut client = Self::chunk_client(&primary).await?;
        let pushed = client
            .push_data_and_forward(PushDataAndForwardRequest {
                handle,
                data: data.to_vec(),
                forward_to: secondaries.clone(),
            })
            .await
            .map_err(GfsError::rpc)?
            .into_inner();

        client
            .write_chunk(WriteChunkRequest {
                data_id: pushed.data_id,
                offset,
                secondaries,
            })
            .await
            .map_err(GfsError::rpc)?;
        Ok(())
    }

    /// Push-then-commit a record append; returns the chunk offset the
    /// record landed at, or `AppendExceedChunkSize` when the primary padded
    /// the chunk instead.
    pub async fn append_chunk(&self, handle: u64, data: &[u8]) -> Result<u64, GfsError> {
        let (primary, secondaries) = self.get_primary_and_secondaries(handle).await?;

        let mut client = Self::chunk_client(&primary).await?;
        let pushed = client
            .push_data_and_forward(PushDataAndForwardRequest {
                handle,
                data: data.to_vec(),
                forward_to: secondaries.clone(),
            })
            .await
            .map_err(GfsError::rpc)?
            .into_inner();

        let reply = client
            .append_chunk(AppendChunkRequest {
                data_id: pushed.data_id,
                secondaries,
            })
            .await
            .map_err(GfsError::rpc)?
            .into_inner();
        if reply.error_code() == ErrorCode::AppendExceedChunkSize {
            return Err(GfsError::AppendExceedChunkSize);
        }
        Ok(reply.offset)
    }

    // ---- file-level operations ----

    /// Read up to `length` bytes of `path` starting at `offset`.
    pub async fn read(&self, path: &str, offset: u64, length: u64) -> anyhow::Result<ReadResult> {
        let info = self.file_info(path).await?;
        if info.is_dir {
            bail!("{:?} is a directory", path);
        }

        let mut data = Vec::with_capacity(length as usize);
        let mut offset = offset;
        let mut remaining = length;

        while remaining > 0 {
            let index = self.config.chunk_index(offset);
            if index >= info.chunk_count {
                return Ok(ReadResult { data, eof: true });
            }
            let chunk_offset = self.config.chunk_offset(offset);
            let want = remaining.min(self.config.max_chunk_size - chunk_offset);

            let mut backoff = self.backoff();
            let mut attempt = 0;
            let (bytes, eof) = loop {
                attempt += 1;
                let mut bytes = Vec::new();
                let result = async {
                    let handle = self.get_chunk_handle(path, index).await?;
                    self.read_chunk(handle, chunk_offset, want, &mut bytes).await
                }
                .await;
                match result {
                    // A short read without an EOF signal means the disk is
                    // behind the committed length; try again.
                    Ok(n) if n < want => {
                        tracing::warn!(
                            "short read of chunk index {} ({} < {}), retrying",
                            index,
                            n,
                            want
                        );
                    }
                    Ok(_) => break (bytes, false),
                    Err(GfsError::ReadEof) => break (bytes, true),
                    Err(e) => {
                        tracing::warn!("read of {:?}[{}] failed: {}", path, index, e);
                    }
                }
                if attempt >= self.max_retries {
                    bail!(
                        "read of {:?} at offset {} failed after {} attempts",
                        path,
                        offset,
                        attempt
                    );
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            };

            let n = bytes.len() as u64;
            data.extend_from_slice(&bytes);
            if eof {
                return Ok(ReadResult { data, eof: true });
            }
            offset += n;
            remaining -= n;
        }

        Ok(ReadResult { data, eof: false })
    }

    /// Write `data` to `path` at `offset`. The write may span chunks; each
    /// chunk-aligned slice goes through the push-then-commit pipeline.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let info = self.file_info(path).await?;
        if info.is_dir {
            bail!("{:?} is a directory", path);
        }
        if self.config.chunk_index(offset) > info.chunk_count {
            bail!("write offset {} exceeds file size", offset);
        }

        let mut begin = 0usize;
        let mut offset = offset;
        while begin < data.len() {
            let index = self.config.chunk_index(offset);
            let chunk_offset = self.config.chunk_offset(offset);
            let write_len = ((data.len() - begin) as u64)
                .min(self.config.max_chunk_size - chunk_offset) as usize;
            let slice = &data[begin..begin + write_len];

            let mut backoff = self.backoff();
            let mut attempt = 0;
            loop {
                attempt += 1;
                let result = async {
                    let handle = self.get_chunk_handle(path, index).await?;
                    // Every retry re-pushes: a fresh data id and, on the
                    // primary, a fresh version.
                    self.write_chunk(handle, chunk_offset, slice).await
                }
                .await;
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!("write to {:?}[{}] failed: {}", path, index, e);
                        if attempt >= self.max_retries {
                            return Err(anyhow!(
                                "write to {:?} at offset {} failed after {} attempts: {}",
                                path,
                                offset,
                                attempt,
                                e
                            ));
                        }
                    }
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }

            offset += write_len as u64;
            begin += write_len;
        }

        Ok(())
    }

    /// Atomically append `data` as one record; returns the file offset the
    /// record landed at.
    pub async fn append(&self, path: &str, data: &[u8]) -> anyhow::Result<u64> {
        if data.len() as u64 > self.config.max_append_size {
            bail!(
                "append of {} bytes exceeds max append size {}",
                data.len(),
                self.config.max_append_size
            );
        }

        let info = self.file_info(path).await?;
        if info.is_dir {
            bail!("{:?} is a directory", path);
        }
        let mut index = info.chunk_count.saturating_sub(1);

        loop {
            let mut backoff = self.backoff();
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                let result = async {
                    let handle = self.get_chunk_handle(path, index).await?;
                    self.append_chunk(handle, data).await
                }
                .await;
                match result {
                    Ok(chunk_offset) => break Some(chunk_offset),
                    // The chunk was padded; move on to the next index.
                    Err(GfsError::AppendExceedChunkSize) => break None,
                    Err(e) => {
                        tracing::warn!("append to {:?}[{}] failed: {}", path, index, e);
                        if attempt >= self.max_retries {
                            return Err(anyhow!(
                                "append to {:?} failed after {} attempts: {}",
                                path,
                                attempt,
                                e
                            ));
                        }
                    }
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            };

            match outcome {
                Some(chunk_offset) => {
                    return Ok(index * self.config.max_chunk_size + chunk_offset)
                }
                None => {
                    tracing::info!("chunk index {} of {:?} padded, trying next", index, path);
                    index += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_rejects_oversized_records_before_any_rpc() {
        // No cluster behind this address; the size check fires first.
        let config = Config {
            max_chunk_size: 64,
            max_append_size: 16,
            ..Config::default()
        };
        let client = Client::new("127.0.0.1:1", config);
        let err = client.append("/f", &[0u8; 17]).await.unwrap_err();
        assert!(err.to_string().contains("max append size"));
    }

    #[test]
    fn chunk_slicing_math() {
        let config = Config {
            max_chunk_size: 64,
            ..Config::default()
        };
        // A write at 60 of 8 bytes touches chunks 0 and 1.
        assert_eq!(config.chunk_index(60), 0);
        assert_eq!(config.chunk_offset(60), 60);
        let first = 8u64.min(config.max_chunk_size - config.chunk_offset(60));
        assert_eq!(first, 4);
        assert_eq!(config.chunk_index(64), 1);
        assert_eq!(config.chunk_offset(64), 0);
    }
}
