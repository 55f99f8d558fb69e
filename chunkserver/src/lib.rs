pub mod gfs {
    tonic::include_proto!("gfs");
}

pub mod chunkserver;
pub mod download_buffer;
