//! Token management API. Bound only to the host-loopback interface — never
//! reachable from the sandbox network.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::allowlist::AllowlistCache;
use crate::tokens::{SandboxIdentity, TokenRegistry};

/// A slow/stalled client must not hold a connection open forever.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct ApiState {
    registry: Arc<TokenRegistry>,
    allowlist: Arc<AllowlistCache>,
}

#[derive(Deserialize)]
struct RegisterRequest {
    token: String,
    cloister: String,
    #[serde(default)]
    project: String,
    #[serde(default)]
    worktree: String,
}

#[derive(Serialize)]
struct TokenSummary {
    token: String,
    cloister: String,
}

pub fn router(registry: Arc<TokenRegistry>, allowlist: Arc<AllowlistCache>) -> Router {
    let state = ApiState { registry, allowlist };
    Router::new()
        .route("/tokens", post(register_token).get(list_tokens))
        .route("/tokens/:token", delete(revoke_token))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(HEADER_READ_TIMEOUT))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    registry: Arc<TokenRegistry>,
    allowlist: Arc<AllowlistCache>,
    addr_file: Option<&FsPath>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    let local_addr = listener.local_addr().context("read listener local addr")?;
    tracing::info!(%local_addr, "guardian token api listening");

    if let Some(path) = addr_file {
        std::fs::write(path, local_addr.to_string())
            .with_context(|| format!("write addr file {}", path.display()))?;
    }

    axum::serve(listener, router(registry, allowlist))
        .with_graceful_shutdown(wait_for_ctrl_c())
        .await
        .context("token api server error")
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn register_token(State(state): State<ApiState>, Json(body): Json<RegisterRequest>) -> Response {
    if body.token.is_empty() || body.cloister.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token and cloister are required");
    }

    state.allowlist.register_project(&body.project).await;
    state
        .registry
        .register(
            body.token,
            SandboxIdentity { cloister: body.cloister, project: body.project, worktree: body.worktree },
        )
        .await;
    (StatusCode::CREATED, Json(serde_json::json!({"status": "registered"}))).into_response()
}

async fn revoke_token(State(state): State<ApiState>, Path(token): Path<String>) -> Response {
    if state.registry.revoke(&token).await {
        (StatusCode::OK, Json(serde_json::json!({"status": "revoked"}))).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "unknown token")
    }
}

async fn list_tokens(State(state): State<ApiState>) -> Response {
    let tokens: Vec<TokenSummary> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|(token, identity)| TokenSummary { token, cloister: identity.cloister })
        .collect();
    Json(serde_json::json!({"tokens": tokens})).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}
