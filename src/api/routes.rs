//! API route definitions and handlers.
//!
//! Responses use a `{ "data": ..., "meta": ... }` envelope; errors use
//! `{ "error": ... }` with a matching status code.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::netif;
use crate::runner::{StartError, TestConfig};
use crate::telemetry::{StreamMessage, TelemetrySink};

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/test/start", post(start_test))
        .route("/test/stop", post(stop_test))
        .route("/test/active", get(test_active))
        .route("/test/marker", post(add_marker))
        .route("/test/stream", get(stream))
        .route("/runs", get(list_runs))
        .route("/runs/search", get(search_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/network/interfaces", get(network_interfaces))
        .route("/power/probe", post(probe_power))
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn start_test(
    State(state): State<AppState>,
    Json(config): Json<TestConfig>,
) -> Response {
    let sink: Arc<dyn TelemetrySink> = state.stream.clone();
    match state.runner.try_start(config, sink) {
        Ok(handle) => {
            // Drive the run to completion in the background and persist
            // the result; the live view goes through the stream.
            let store = state.store.clone();
            tokio::spawn(async move {
                match handle.await {
                    Ok(result) => {
                        let save =
                            tokio::task::spawn_blocking(move || store.save(&result)).await;
                        match save {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "failed to store run"),
                            Err(e) => error!(error = %e, "store task failed"),
                        }
                    }
                    Err(e) => error!(error = %e, "test task failed"),
                }
            });
            (StatusCode::ACCEPTED, envelope(json!({ "accepted": true }))).into_response()
        }
        Err(StartError::AlreadyActive) => {
            error_response(StatusCode::CONFLICT, "a test is already active")
        }
        Err(e @ StartError::InvalidConfig(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

async fn stop_test(State(state): State<AppState>) -> Json<Value> {
    state.runner.stop();
    envelope(json!({ "stopped": true }))
}

async fn test_active(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({ "active": state.runner.is_active() }))
}

#[derive(Debug, Deserialize)]
struct MarkerRequest {
    message: String,
}

async fn add_marker(
    State(state): State<AppState>,
    Json(request): Json<MarkerRequest>,
) -> Response {
    if state.runner.add_marker(&request.message) {
        envelope(json!({ "accepted": true })).into_response()
    } else {
        error_response(
            StatusCode::CONFLICT,
            "marker rejected: no active test or empty message",
        )
    }
}

async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.stream.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(StreamMessage::Point(point)) => match SseEvent::default()
                    .event("point")
                    .json_data(&point)
                {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize data point for SSE");
                        continue;
                    }
                },
                Ok(StreamMessage::Done) => {
                    return Some((Ok(SseEvent::default().event("done").data("done")), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Live telemetry is lossy by design; the stored run
                    // has everything.
                    debug!(skipped, "SSE subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_runs(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.list()).await {
        Ok(Ok(runs)) => envelope(json!({ "runs": runs })).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search_runs(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.search(&query.q)).await {
        Ok(Ok(runs)) => envelope(json!({ "runs": runs })).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.get(id)).await {
        Ok(Ok(Some(record))) => envelope(json!(record)).into_response(),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, format!("run {} not found", id)),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_run(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.delete(id)).await {
        Ok(Ok(true)) => envelope(json!({ "deleted": id })).into_response(),
        Ok(Ok(false)) => error_response(StatusCode::NOT_FOUND, format!("run {} not found", id)),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn network_interfaces() -> Json<Value> {
    envelope(json!({ "interfaces": netif::list_interfaces() }))
}

async fn probe_power(State(state): State<AppState>) -> Response {
    let power = state.power.clone();
    match tokio::task::spawn_blocking(move || power.probe()).await {
        Ok(Ok(())) => envelope(json!({ "reachable": true })).into_response(),
        Ok(Err(e)) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
