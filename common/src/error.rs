use tonic::Status;

/// The closed set of failures the protocol distinguishes. Everything a
/// client might need to branch on is a variant here; free-text detail rides
/// along in the message.
#[derive(Debug, thiserror::Error)]
pub enum GfsError {
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Read reached the end of the chunk. Travels in-band as the reply's
    /// error code; the client driver raises it as this variant once the
    /// final bytes have been delivered.
    #[error("read reached end of chunk")]
    ReadEof,

    /// The primary padded the chunk; the caller should retry on the next
    /// chunk index.
    #[error("append exceeds chunk size")]
    AppendExceedChunkSize,

    /// A commit referenced a download-buffer entry that expired or was
    /// already consumed.
    #[error("data {handle}/{nonce} not found in download buffer")]
    DataNotFound { handle: u64, nonce: u64 },

    /// A mutation arrived for a version slot that is already occupied;
    /// a retry raced an earlier success.
    #[error("duplicated mutation version {version} for chunk {handle}")]
    DuplicatedVersion { handle: u64, version: u64 },

    /// `ForwardData` for an id that is already staged.
    #[error("data {handle}/{nonce} already staged")]
    DuplicateData { handle: u64, nonce: u64 },

    #[error("not enough live servers: want {want}, have {have}")]
    NotEnoughServers { want: usize, have: usize },

    /// Re-replication found no (holder, non-holder) pair.
    #[error("no re-replication candidates for chunk {0}")]
    NoCandidates(u64),

    #[error("chunk {0} not found")]
    ChunkNotFound(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("rpc failure: {0}")]
    Rpc(String),
}

impl GfsError {
    pub fn rpc(status: Status) -> Self {
        GfsError::Rpc(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<Status> for GfsError {
    fn from(status: Status) -> Self {
        GfsError::rpc(status)
    }
}

impl From<GfsError> for Status {
    fn from(err: GfsError) -> Self {
        let msg = err.to_string();
        match err {
            GfsError::ChunkNotFound(_) => Status::not_found(msg),
            GfsError::DataNotFound { .. } => Status::failed_precondition(msg),
            GfsError::DuplicateData { .. } => Status::already_exists(msg),
            GfsError::DuplicatedVersion { .. } => Status::aborted(msg),
            GfsError::NotEnoughServers { .. } => Status::unavailable(msg),
            GfsError::NoCandidates(_) => Status::failed_precondition(msg),
            GfsError::ReadEof | GfsError::AppendExceedChunkSize => Status::out_of_range(msg),
            GfsError::Io(_) => Status::internal(msg),
            GfsError::Rpc(_) => Status::unavailable(msg),
            GfsError::Unknown(_) => Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        let s: Status = GfsError::ChunkNotFound(7).into();
        assert_eq!(s.code(), tonic::Code::NotFound);

        let s: Status = GfsError::DataNotFound { handle: 1, nonce: 2 }.into();
        assert_eq!(s.code(), tonic::Code::FailedPrecondition);

        let s: Status = GfsError::NotEnoughServers { want: 3, have: 1 }.into();
        assert_eq!(s.code(), tonic::Code::Unavailable);
    }
}
