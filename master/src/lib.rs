pub mod gfs {
    tonic::include_proto!("gfs");
}

pub mod chunk_directory;
pub mod chunkserver_manager;
pub mod master;
