use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use gfs_client::Client;
use gfs_common::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    long_about = "GFS command-line client\n\nTalks to the master for namespace operations and to chunkservers for data."
)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    master: String,

    #[arg(long, default_value_t = 5)]
    max_retries: usize,

    #[arg(long, default_value_t = 100)]
    initial_backoff_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty file
    Create { path: String },
    /// Delete a file
    Delete { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Read a byte range and print it to stdout
    Read {
        path: String,
        offset: u64,
        length: u64,
    },
    /// Write a string at an offset
    Write {
        path: String,
        offset: u64,
        data: String,
    },
    /// Append a record; prints the offset it landed at
    Append { path: String, data: String },
    /// Upload a local file
    Put { source: PathBuf, dest: String },
    /// Download a file
    Get { source: String, dest: PathBuf },
}

// Download in steps well under the chunk size.
const GET_STEP: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gfs_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let client = Client::new(cli.master, Config::from_env())
        .with_retry_config(cli.max_retries, cli.initial_backoff_ms);

    match cli.command {
        Commands::Create { path } => {
            client.create(&path).await?;
            println!("created {}", path);
        }
        Commands::Delete { path } => {
            client.delete(&path).await?;
            println!("deleted {}", path);
        }
        Commands::Mkdir { path } => {
            client.mkdir(&path).await?;
            println!("created directory {}", path);
        }
        Commands::Ls { path } => {
            for entry in client.list(&path).await? {
                if entry.is_dir {
                    println!("{}/", entry.name);
                } else {
                    println!("{} ({} chunks)", entry.name, entry.chunk_count);
                }
            }
        }
        Commands::Read {
            path,
            offset,
            length,
        } => {
            let result = client.read(&path, offset, length).await?;
            use std::io::Write;
            std::io::stdout().write_all(&result.data)?;
            if result.eof {
                eprintln!("(eof after {} bytes)", result.data.len());
            }
        }
        Commands::Write { path, offset, data } => {
            client.write(&path, offset, data.as_bytes()).await?;
            println!("wrote {} bytes at {}", data.len(), offset);
        }
        Commands::Append { path, data } => {
            let offset = client.append(&path, data.as_bytes()).await?;
            println!("{}", offset);
        }
        Commands::Put { source, dest } => {
            let data = std::fs::read(&source)?;
            client.create(&dest).await?;
            client.write(&dest, 0, &data).await?;
            println!("uploaded {} bytes to {}", data.len(), dest);
        }
        Commands::Get { source, dest } => {
            let info = client.file_info(&source).await?;
            if info.is_dir {
                bail!("{:?} is a directory", source);
            }
            let mut data = Vec::new();
            let mut offset = 0u64;
            loop {
                let result = client.read(&source, offset, GET_STEP).await?;
                offset += result.data.len() as u64;
                data.extend_from_slice(&result.data);
                if result.eof || result.data.is_empty() {
                    break;
                }
            }
            std::fs::write(&dest, &data)?;
            println!("downloaded {} bytes to {}", data.len(), dest.display());
        }
    }

    Ok(())
}
