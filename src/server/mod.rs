use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    routing::{get, post},
    Router,
};
use sizeforge_av::{FfmpegEncoder, FfprobeProber, ToolInfo, ToolRegistry};
use sizeforge_core::config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::orchestrator::Orchestrator;

pub mod error;
pub mod openapi;
pub mod routes;

pub use error::AppError;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Orchestrator,
    /// Tool availability captured at startup, reported by `/health`
    pub tools: Arc<Vec<ToolInfo>>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext, static_dir: Option<PathBuf>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    // The orchestrator enforces the exact limit while streaming; this only
    // lifts axum's 2 MB default for the multipart route.
    let upload_limit =
        usize::try_from(ctx.orchestrator.config().server.max_upload_bytes).unwrap_or(usize::MAX);

    let mut app = Router::new()
        .route("/health", get(routes::health))
        .route(
            "/upload",
            post(routes::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/compress", post(routes::compress))
        .route("/status/{job_id}", get(routes::status))
        .route("/download/{job_id}", get(routes::download))
        .route("/cleanup/{job_id}", post(routes::cleanup))
        .route("/jobs/{job_id}", axum::routing::delete(routes::cleanup))
        .nest("/api", openapi::openapi_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    // Serve the browser UI if a directory is configured
    // Uses SPA fallback: serves index.html for any route that doesn't match a file
    if let Some(dir) = static_dir {
        if dir.exists() {
            tracing::info!("Serving static files from {:?}", dir);
            let index_path = dir.join("index.html");
            app = app.fallback_service(
                ServeDir::new(&dir)
                    .append_index_html_on_directories(true)
                    .not_found_service(ServeFile::new(index_path)),
            );
        }
    }

    app
}

/// Build the orchestrator from discovered tools and start the HTTP server.
///
/// Returns once a shutdown signal arrived, every running encode was
/// cancelled and the retention sweeper stopped.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let registry = ToolRegistry::discover(&config.encoder);
    let ffmpeg = registry.require("ffmpeg")?.to_path_buf();
    let ffprobe = registry.require("ffprobe")?.to_path_buf();
    let tools = tokio::task::spawn_blocking(move || registry.check_all())
        .await
        .context("Tool version check panicked")?;
    for tool in &tools {
        tracing::info!(
            "Using {} at {:?} ({})",
            tool.name,
            tool.path,
            tool.version.as_deref().unwrap_or("unknown version")
        );
    }

    let config = Arc::new(config);
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(FfprobeProber::new(ffprobe)),
        Arc::new(FfmpegEncoder::new(
            ffmpeg,
            config.encoder.clone(),
            config.jobs.log_tail_lines,
        )),
    );
    orchestrator
        .prepare_dirs()
        .await
        .context("Failed to create storage directories")?;

    let sweeper_cancel = CancellationToken::new();
    let sweeper = tokio::spawn(orchestrator.clone().run_sweeper(sweeper_cancel.clone()));

    let ctx = AppContext {
        orchestrator: orchestrator.clone(),
        tools: Arc::new(tools),
    };
    let app = create_router(ctx, config.server.static_dir.clone());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping running encodes");
    sweeper_cancel.cancel();
    orchestrator.shutdown().await;
    if let Err(e) = sweeper.await {
        tracing::error!("Retention sweeper task failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
