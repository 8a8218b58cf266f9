use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use vidrelay::{
    catalog::Container,
    config::AppConfig,
    error::ApiError,
    extractor::YtDlp,
    fallback::{RemuxFallback, cleanup_stale_jobs},
    orchestrator::Orchestrator,
    proxy::StreamProxy,
    retry::TokioSleeper,
    routes::{AppState, build_cors_layer, build_router},
    selector::SelectionPolicy,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the transfer directory: {error}"))
        })?;
    cleanup_stale_jobs(&config.transfer_dir, config.stale_job_after).await;

    let extractor = Arc::new(YtDlp::new(
        config.extractor_path.clone(),
        config.extractor_timeout,
    ));
    match extractor.version().await {
        Some(version) => info!("Using {:?} version {version}", extractor.executable()),
        None => warn!(
            "{:?} is not runnable. Every request will fail until yt-dlp is installed \
             or YT_DLP_PATH is set.",
            extractor.executable()
        ),
    }

    let client = StreamProxy::build_client(
        config.upstream_connect_timeout,
        config.upstream_read_timeout,
    )
    .map_err(|error| ApiError::internal(format!("Could not create HTTP client: {error}")))?;

    let merge_container = config
        .accepted_containers
        .first()
        .cloned()
        .unwrap_or(Container::Mp4);
    let fallback = RemuxFallback::new(
        extractor.clone(),
        config.remux_tool.clone(),
        config.transfer_dir.clone(),
        merge_container,
    );
    let orchestrator = Orchestrator::new(
        extractor,
        StreamProxy::new(client, config.stream_buffer_chunks)
            .with_idle_timeout(config.upstream_read_timeout),
        fallback,
        config.fallback_retry,
        Arc::new(TokioSleeper),
        SelectionPolicy {
            accepted_containers: config.accepted_containers.clone(),
        },
        config.max_concurrent_downloads,
    );

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(
        AppState {
            orchestrator: Arc::new(orchestrator),
        },
        cors,
    );

    let addr = config.bind_addr.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Server ready at http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
