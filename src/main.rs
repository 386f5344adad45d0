//! upldr server binary.
//!
//! Accepts Dropzone-style chunked uploads authorized by short-lived tokens,
//! reassembles them in a scratch directory and hands each finished file to a
//! single storage backend (a local directory tree or an object store).

mod assembler;
mod atomic;
mod auth;
mod background;
mod chunk_store;
mod config;
mod coordinator;
mod destination;
mod error;
mod frontend;
mod http;
mod locking;
mod logging;
mod storage;
mod tls;
mod upload;
mod version;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};
use uuid::Uuid;

use crate::auth::TokenAuthority;
use crate::background::spawn_background_tasks;
use crate::chunk_store::ChunkStore;
use crate::config::Args;
use crate::coordinator::UploadCoordinator;
use crate::http::build_cors_layer;
use crate::storage::build_backend;

shadow!(build);

fn invalid_input(err: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage_config = args.storage_config().map_err(invalid_input)?;
    let tls_paths = args.tls_paths().map_err(invalid_input)?;
    let backend = build_backend(&storage_config)
        .await
        .map_err(invalid_input)?;
    info!(backend = %backend.describe(), "storage backend ready");

    let chunks = Arc::new(ChunkStore::new(args.scratch_root(), args.max_chunk_size));
    chunks.ensure_root().await?;
    info!(scratch = %chunks.root_path().display(), "chunk scratch directory ready");
    let coordinator = Arc::new(UploadCoordinator::new(chunks, backend, args.max_chunks));

    let jwt_secret = match args.jwt_secret.as_deref() {
        Some(secret) if !secret.is_empty() => secret.to_string(),
        _ => {
            warn!("no jwt secret configured, tokens will not survive a restart");
            Uuid::new_v4().simple().to_string()
        }
    };
    let authority = Arc::new(TokenAuthority::new(&jwt_secret, args.admin_secret.clone()));

    let mut app = Router::new()
        .route(
            "/api/upload",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/complete", post(upload::complete_upload))
        .route("/api/token", post(auth::issue_token))
        .route("/api/version", get(version::get_version_info))
        .fallback(frontend::serve_frontend)
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
        .layer(Extension(coordinator.clone()))
        .layer(Extension(authority));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args.host.parse::<IpAddr>().map_err(invalid_input)?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    spawn_background_tasks(coordinator, Duration::from_secs(args.temp_ttl_secs));

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    match tls_paths {
        Some((cert, key)) => {
            let tls_config = tls::build_rustls_config(&cert, &key).await?;
            let https_addr = SocketAddr::new(host, args.https_port);
            info!("🔒 Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
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
