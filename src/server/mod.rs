//! HTTP API over the application context.
//!
//! JSON endpoints for clients, documents, chunks, ingestion and sessions, plus a
//! server-sent-event endpoint that streams answers. Errors are returned as
//! `{"error":{"code":...,"message":...}}` with the status taken from
//! [`RagError::code`].
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::error::RagError;

const MIB: usize = 1024 * 1024;

// ── Error response ───────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// A [`RagError`] on its way out as an HTTP response.
pub struct ApiError(pub RagError);

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "bad_request" => StatusCode::BAD_REQUEST,
            "index_failure" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ── Router ───────────────────────────────────────────────────────────

/// Build the API router for `ctx`.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let body_limit = ctx.config.server.max_upload_mb.saturating_mul(MIB);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/clients", get(routes::list_clients).post(routes::create_client))
        .route("/clients/:id", get(routes::get_client))
        .route("/clients/:id/documents", get(routes::list_documents))
        .route("/clients/:id/chunks", get(routes::list_chunks))
        .route(
            "/clients/:id/documents/:filename",
            put(routes::upload_document).delete(routes::delete_document),
        )
        .route(
            "/clients/:id/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/clients/:id/sessions/:session_id",
            get(routes::get_session)
                .put(routes::update_session)
                .delete(routes::delete_session),
        )
        .route("/ingest", post(routes::ingest))
        .route("/query", post(routes::query))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(ctx)
}

/// Serve until Ctrl-C. The caller owns `ctx` shutdown.
pub async fn serve(ctx: Arc<AppContext>, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address '{bind}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
