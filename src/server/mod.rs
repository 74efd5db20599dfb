//! Frontend HTTP process: session handling, uploads, queue/progress views,
//! editor round-trip and artifact downloads. Serves many concurrent browser
//! sessions from a single event loop; anything blocking (zip builds, base64
//! embeds) runs on the blocking pool.

mod auth;
mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

use crate::dikto_core::media::{DurationProber, Ffprobe};
use crate::dikto_core::session::Sessions;
use crate::dikto_core::settings::Settings;
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::upload::MAX_UPLOAD_BYTES;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreRoot,
    pub settings: Arc<Settings>,
    pub sessions: Arc<Sessions>,
    pub prober: Arc<dyn DurationProber>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::main_page))
        .route("/api/queue", get(handlers::queue_view))
        .route("/api/events", get(handlers::event_stream))
        .route("/upload", post(handlers::upload))
        .route("/api/delete/{file}", post(handlers::delete_job))
        .route("/api/editor/{file}/open", post(handlers::open_editor))
        .route("/api/editor/{file}/save", post(handlers::save_editor))
        .route("/editor", get(handlers::editor_page))
        .route("/download/editor/{file}", get(handlers::download_editor))
        .route("/download/srt/{file}", get(handlers::download_srt))
        .route("/download/all", get(handlers::download_all))
        .route("/data/{user}/{file}", get(handlers::serve_media))
        // Multipart overhead on top of the media payload itself.
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES as usize + 1_048_576))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the frontend until shutdown. TLS is enabled when both halves of the
/// certificate pair are configured.
pub async fn run(settings: Settings) -> Result<()> {
    settings.validate_frontend()?;
    let store = StoreRoot::new(&settings.root);
    store.ensure_tree()?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let tls = match (&settings.ssl_certfile, &settings.ssl_keyfile) {
        (Some(cert), Some(key)) => Some(
            RustlsConfig::from_pem_file(cert.clone(), key.clone())
                .await
                .context("failed to load the TLS certificate pair")?,
        ),
        _ => None,
    };

    let state = AppState {
        store,
        settings: Arc::new(settings),
        sessions: Arc::new(Sessions::default()),
        prober: Arc::new(Ffprobe),
    };
    let app = build_router(state);

    tracing::info!("frontend listening on {addr}");
    match tls {
        Some(config) => {
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
                .context("server error")?;
        }
        None => {
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
                .context("server error")?;
        }
    }
    Ok(())
}
