use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use gfs_common::Config;
use gfs_master::gfs::master_service_server::MasterServiceServer;
use gfs_master::master::{self, Master};
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    master: Master,
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
    #[arg(short, long, default_value = "127.0.0.1:50051")]
    addr: String,

    #[arg(long, default_value = "8080")]
    http_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gfs_master=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let addr = args.addr.parse()?;
    let config = Config::from_env();

    let master = Master::new(config);

    let app_state = AppState {
        master: master.clone(),
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

    tokio::spawn(master::run_server_check_loop(master.clone()));

    tracing::info!("master listening on {}", addr);

    Server::builder()
        .add_service(MasterServiceServer::new(master))
        .serve(addr)
        .await?;

    Ok(())
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_metrics(State(app_state): State<AppState>) -> Result<String, InternalError> {
    let registry = Registry::new();

    let live_servers_gauge = Gauge::new(
        "gfs_master_live_chunkservers",
        "Number of chunkservers with a recent heartbeat",
    )
    .map_err(|_| InternalError)?;
    registry
        .register(Box::new(live_servers_gauge.clone()))
        .map_err(|_| InternalError)?;

    live_servers_gauge.set(app_state.master.live_server_count() as f64);

    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|_| InternalError)?;
    String::from_utf8(buffer).map_err(|_| InternalError)
}
