//! urdf-hub server binary.
//!
//! Serves uploaded URDF documents with their mesh references rewritten to
//! HTTP resource URLs, the resources themselves, a small file-management API
//! and control of a single external viewer process.

mod atomic;
mod config;
mod documents;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod resolver;
mod resources;
mod rewrite;
mod sandbox;
mod storage;
mod version;
mod viewer;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{Args, parse_extensions};
use crate::files::UploadConfig;
use crate::http::build_cors_layer;
use crate::locking::LockManager;
use crate::resources::ResourceConfig;
use crate::storage::Storage;
use crate::viewer::ViewerSupervisor;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.upload_root)));
    storage.ensure_root().await?;
    let body_limit = usize::try_from(args.max_content_length).unwrap_or(usize::MAX);
    let upload_config = Arc::new(UploadConfig {
        max_content_length: args.max_content_length,
        allowed_extensions: parse_extensions(&args.allowed_extensions),
    });
    let resource_config = Arc::new(ResourceConfig {
        base_url: args.resource_base_url.clone(),
    });
    let resource_route = resource_config.route();
    let supervisor = Arc::new(ViewerSupervisor::new(
        args.viewer_cmd.clone(),
        args.viewer_args.clone(),
        Duration::from_secs(args.viewer_stop_timeout_secs),
    ));
    let lock_manager = Arc::new(LockManager::new());

    let mut app = Router::new()
        .route("/api/files/list", get(files::list_files))
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/upload", put(files::upload_file))
        .route("/api/files/upload-folder", post(files::upload_folder))
        .route("/api/urdf/processed", get(documents::get_processed_document))
        .route("/api/urdf/save", post(documents::save_document))
        .route(&resource_route, get(resources::get_resource))
        .route("/api/viewer/start", post(viewer::start_viewer))
        .route("/api/viewer/stop", post(viewer::stop_viewer))
        .route("/api/viewer/status", get(viewer::viewer_status))
        .route("/api/version", get(version::get_version_info))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(upload_config))
        .layer(Extension(resource_config))
        .layer(Extension(supervisor))
        .layer(Extension(lock_manager));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        upload_root = args.upload_root,
        resource_base_url = args.resource_base_url,
        %resource_route,
        "🚀 Starting HTTP server at {}",
        addr
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
