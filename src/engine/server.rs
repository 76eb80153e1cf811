use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::stream::{Inbound, Outbound, StreamContext, TailSession};
use crate::error::{ControlError, Result};
use crate::providers::servers::ControlPlane;
use crate::security::auth::require_token;
use crate::upstream::assistant::{CompletionService, SYSTEM_PROMPT};

/// Messages buffered per tail session before the follower is back-pressured.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub assistant: Option<Arc<dyn CompletionService>>,
    pub stream: StreamContext,
}

/// `{ok:false, error, kind}` with the status matching the error kind.
pub fn error_response(err: &ControlError) -> (StatusCode, Json<Value>) {
    (
        err.status(),
        Json(serde_json::json!({
            "ok": false,
            "error": err.public_message(),
            "kind": err.kind(),
        })),
    )
}

fn respond(result: Result<Value>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(kind = e.kind(), error = %e, "Request failed");
            }
            error_response(&e).into_response()
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // Every /api route sits behind the token check; the tail session checks
    // its own handshake message.
    let api = Router::new()
        .route("/servers", get(list_servers))
        .route("/servers/{key}/health", get(server_health))
        .route("/servers/{key}/logs", get(server_logs))
        .route("/servers/{key}/{action}", post(server_action))
        .route("/assistant", post(assistant))
        .layer(middleware::from_fn_with_state(
            state.stream.gate.clone(),
            require_token,
        ));

    Router::new()
        .nest("/api", api)
        .route("/ws/logs", get(tail_logs_ws))
        .with_state(state)
}

async fn list_servers(State(state): State<AppState>) -> Response {
    respond(state.plane.list().await)
}

async fn server_health(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    respond(state.plane.health(&key).await)
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<String>,
}

async fn server_logs(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    respond(state.plane.read_logs(&key, query.lines.as_deref()).await)
}

async fn server_action(
    State(state): State<AppState>,
    Path((key, action)): Path<(String, String)>,
) -> Response {
    respond(state.plane.invoke(&key, &action).await)
}

#[derive(Deserialize)]
struct AssistantRequest {
    prompt: Option<String>,
}

async fn assistant(
    State(state): State<AppState>,
    body: std::result::Result<Json<AssistantRequest>, JsonRejection>,
) -> Response {
    respond(ask_assistant(state.assistant.as_deref(), body).await)
}

async fn ask_assistant(
    service: Option<&dyn CompletionService>,
    body: std::result::Result<Json<AssistantRequest>, JsonRejection>,
) -> Result<Value> {
    let service = service.ok_or_else(|| ControlError::ServiceUnavailable("assistant".to_string()))?;

    let prompt = body
        .ok()
        .and_then(|Json(req)| req.prompt)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ControlError::BadRequest("prompt required".to_string()))?;

    tracing::info!(prompt_len = prompt.len(), "Assistant request");
    let reply = service.complete(SYSTEM_PROMPT, &prompt).await?;
    Ok(serde_json::json!({ "ok": true, "reply": reply }))
}

async fn tail_logs_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_tail_socket(socket, state.stream))
}

/// Bridge a WebSocket to a [`TailSession`].
async fn run_tail_socket(socket: WebSocket, ctx: StreamContext) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = receiver.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => {
                Some(Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) | Err(_) => Some(Inbound::Close),
        }
    });
    tokio::pin!(inbound);

    let state = TailSession::new(ctx, tx).run(inbound).await;
    tracing::debug!(state = ?state, "Tail session finished");

    let _ = writer.await;
}
