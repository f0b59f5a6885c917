//! API routes
//!
//! Binds the conversation manager to HTTP for a display layer: snapshot reads,
//! the three commands, cancellation, and a server-sent event feed of
//! snapshots.

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::core::ConversationSnapshot;
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn conversation(State(state): State<AppState>) -> Json<ConversationSnapshot> {
    Json(state.manager.snapshot())
}

/// Runs the turn on its own task so a disconnecting client cannot abort it
async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<ConversationSnapshot>, StatusCode> {
    let manager = state.manager.clone();
    tokio::spawn(async move { manager.send_message(&request.message).await })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Send task failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(state.manager.snapshot()))
}

async fn retry(State(state): State<AppState>) -> Result<Json<ConversationSnapshot>, StatusCode> {
    let manager = state.manager.clone();
    tokio::spawn(async move { manager.retry_last_message().await })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Retry task failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(state.manager.snapshot()))
}

async fn cancel(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.manager.cancel(),
    })
}

async fn clear(State(state): State<AppState>) -> Json<ConversationSnapshot> {
    state.manager.clear_conversation().await;
    Json(state.manager.snapshot())
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut updates = state.manager.subscribe();

    let events = stream! {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            match Event::default().event("snapshot").json_data(&snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(error = %e, "Could not encode snapshot event"),
            }

            if updates.changed().await.is_err() {
                break;
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/conversation", get(conversation).delete(clear))
        .route("/v1/conversation/messages", post(send_message))
        .route("/v1/conversation/retry", post(retry))
        .route("/v1/conversation/cancel", post(cancel))
        .route("/v1/conversation/events", get(events))
}
