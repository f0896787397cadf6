//! Approval API consumed by the (out-of-scope) approval Web UI: list
//! pending requests, approve/deny them, and stream state-change events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::events::EventHub;
use crate::queue::{ApprovalQueue, Resolution, Scope};

#[derive(Clone)]
struct ApiState {
    queue: Arc<ApprovalQueue>,
    events: Arc<EventHub>,
}

#[derive(Deserialize)]
struct ApproveRequest {
    scope: Scope,
}

#[derive(Deserialize)]
struct DenyRequest {
    #[serde(default)]
    reason: String,
}

pub fn router(queue: Arc<ApprovalQueue>, events: Arc<EventHub>) -> Router {
    let state = ApiState { queue, events };
    Router::new()
        .route("/pending-domains", get(pending_domains))
        .route("/approve-domain/:id", post(approve_domain))
        .route("/deny-domain/:id", post(deny_domain))
        .route("/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    queue: Arc<ApprovalQueue>,
    events: Arc<EventHub>,
    addr_file: Option<&FsPath>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    let local_addr = listener.local_addr().context("read listener local addr")?;
    tracing::info!(%local_addr, "guardian approval api listening");

    if let Some(path) = addr_file {
        std::fs::write(path, local_addr.to_string())
            .with_context(|| format!("write addr file {}", path.display()))?;
    }

    axum::serve(listener, router(queue, events))
        .with_graceful_shutdown(wait_for_ctrl_c())
        .await
        .context("approval api server error")
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn pending_domains(State(state): State<ApiState>) -> Response {
    Json(serde_json::json!({"requests": state.queue.list()})).into_response()
}

async fn approve_domain(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<ApproveRequest>) -> Response {
    if state.queue.resolve(&id, Resolution::Approved { scope: body.scope }) {
        (StatusCode::OK, Json(serde_json::json!({"status": "approved"}))).into_response()
    } else {
        not_found()
    }
}

async fn deny_domain(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<DenyRequest>) -> Response {
    let reason = if body.reason.is_empty() { "denied by operator".to_string() } else { body.reason };
    if state.queue.resolve(&id, Resolution::Denied { reason }) {
        (StatusCode::OK, Json(serde_json::json!({"status": "denied"}))).into_response()
    } else {
        not_found()
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "no such pending request"}))).into_response()
}

async fn event_stream(State(state): State<ApiState>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (id, rx) = state.events.subscribe();
    let events = state.events.clone();
    let stream = async_stream_from_receiver(rx, move || events.unsubscribe(id));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Wraps an `mpsc::Receiver` as an SSE item stream, running `on_drop` once
/// the client disconnects so the hub stops tracking a dead subscriber.
fn async_stream_from_receiver(
    mut rx: tokio::sync::mpsc::Receiver<crate::events::Event>,
    on_drop: impl FnOnce() + Send + 'static,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let mut on_drop = Some(on_drop);
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().data(payload));
        }
        if let Some(on_drop) = on_drop.take() {
            on_drop();
        }
    }
}
