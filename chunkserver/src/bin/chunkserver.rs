use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use gfs_chunkserver::chunkserver::{self, ChunkServer};
use gfs_chunkserver::download_buffer;
use gfs_chunkserver::gfs::chunk_server_service_server::ChunkServerServiceServer;
use gfs_common::Config;
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use std::path::PathBuf;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    chunk_server: ChunkServer,
    server_root: PathBuf,
}

struct InternalError;

impl IntoResponse for InternalError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:50052")]
    addr: String,

    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    master: String,

    #[arg(short, long, default_value = "/tmp/gfs_chunkserver_data")]
    server_root: PathBuf,

    /// Address to advertise to the master (defaults to addr)
    #[arg(long)]
    advertise_addr: Option<String>,

    #[arg(long, default_value = "8082")]
    http_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gfs_chunkserver=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let addr = args.addr.parse()?;
    let advertise = args.advertise_addr.unwrap_or_else(|| args.addr.clone());
    let config = Config::from_env();

    let chunk_server = ChunkServer::new(
        advertise,
        args.master.clone(),
        args.server_root.clone(),
        config.clone(),
    )?;

    let app_state = AppState {
        chunk_server: chunk_server.clone(),
        server_root: args.server_root.clone(),
    };
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(app_state);

    let http_addr: std::net::SocketAddr = ([0, 0, 0, 0], args.http_port).into();
    tokio::spawn(async move {
        tracing::info!("HTTP server listening on {}", http_addr);
        let listener = tokio::net::TcpListener::bind(http_addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    tokio::spawn(download_buffer::run_purge_loop(
        chunk_server.download_buffer(),
        config.download_buffer_tick,
    ));

    tokio::spawn(chunkserver::run_heartbeat_loop(chunk_server.clone()));

    tracing::info!(
        "chunkserver listening on {}, root path {}",
        addr,
        args.server_root.display()
    );

    Server::builder()
        .add_service(ChunkServerServiceServer::new(chunk_server))
        .serve(addr)
        .await?;

    Ok(())
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_metrics(State(app_state): State<AppState>) -> Result<String, InternalError> {
    let registry = Registry::new();

    let available_space_gauge = Gauge::new(
        "gfs_chunkserver_available_space_bytes",
        "Available space on chunkserver in bytes",
    )
    .map_err(|_| InternalError)?;
    let chunk_count_gauge = Gauge::new(
        "gfs_chunkserver_total_chunks",
        "Number of chunks held by this chunkserver",
    )
    .map_err(|_| InternalError)?;

    registry
        .register(Box::new(available_space_gauge.clone()))
        .map_err(|_| InternalError)?;
    registry
        .register(Box::new(chunk_count_gauge.clone()))
        .map_err(|_| InternalError)?;

    let available_space = fs2::free_space(&app_state.server_root).unwrap_or(0);
    available_space_gauge.set(available_space as f64);
    chunk_count_gauge.set(app_state.chunk_server.chunk_count() as f64);

    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|_| InternalError)?;
    String::from_utf8(buffer).map_err(|_| InternalError)
}
