// HTTP and WebSocket handlers for the Optilab gateway

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use optilab_common::redis as record_store;
use optilab_common::types::{
    new_execution_id, ClientMessage, ExecutionRecord, ExecutionRequest, LogEvent, LogLevel,
    LogSource, StreamEnvelope,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::orchestrator;
use crate::registry::EventSink;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub execution_id: String,
}

/// POST /api/execute - accept an execution request and start the
/// orchestrator task for it.
pub async fn submit_execution(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecutionRequest>,
) -> impl IntoResponse {
    if request.problem_name.trim().is_empty()
        || request.problem_owner.trim().is_empty()
        || request.optimizer_name.trim().is_empty()
        || request.optimizer_owner.trim().is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "problem and optimizer coordinates are required"
            })),
        )
            .into_response();
    }

    // Cheap existence probe against the content store. Its outages must
    // not block submissions, so only a definite 404 rejects.
    for (owner, repo) in [
        (&request.problem_owner, &request.problem_name),
        (&request.optimizer_owner, &request.optimizer_name),
    ] {
        match state.content.get_file_content(owner, repo, "config.json").await {
            Ok(file) if !file.ok && file.status == 404 => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": format!("repository {}/{} has no manifest", owner, repo)
                    })),
                )
                    .into_response();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(owner = %owner, repo = %repo, error = %e, "Manifest probe failed");
            }
        }
    }

    let execution_id = new_execution_id();
    let record = ExecutionRecord::new(execution_id.clone(), request);

    info!(
        execution_id = %execution_id,
        problem = %record.request.problem_repo(),
        optimizer = %record.request.optimizer_repo(),
        "Execution accepted"
    );

    tokio::spawn(orchestrator::run_execution(state.clone(), record));

    (
        StatusCode::CREATED,
        Json(serde_json::to_value(SubmitResponse { execution_id }).unwrap_or_default()),
    )
        .into_response()
}

/// GET /api/executions/{execution_id} - durable result lookup.
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    if uuid::Uuid::try_parse(&execution_id).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Invalid execution ID format" })),
        )
            .into_response();
    }

    let mut conn = state.redis.clone();
    match record_store::get_result(&mut conn, &execution_id).await {
        Ok(Some(result)) => {
            debug!(execution_id = %execution_id, success = result.success, "Result retrieved");
            (StatusCode::OK, Json(serde_json::to_value(result).unwrap_or_default()))
                .into_response()
        }
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "execution_id": execution_id,
                "status": "pending",
                "message": "Execution is queued or still running"
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(execution_id = %execution_id, error = %e, "Result lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("Failed to query execution: {}", e)
                })),
            )
                .into_response()
        }
    }
}

/// GET /status - health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/errors - recent classified failures, newest first.
pub async fn recent_errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let errors = state.errors.recent(50).await;
    Json(serde_json::json!({
        "count": errors.len(),
        "errors": errors,
    }))
}

/// GET /metrics - Prometheus text format.
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// GET /ws/{execution_id} - bind a streaming channel to an execution.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(execution_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, execution_id))
}

/// Write half of one channel behind the registry's sink seam.
struct WsEventSink {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl EventSink for WsEventSink {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn send_ping(&self) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, execution_id: String) {
    let (sink_half, mut receiver) = socket.split();
    let sink: Arc<dyn EventSink> = Arc::new(WsEventSink {
        sink: tokio::sync::Mutex::new(sink_half),
    });

    state.registry.register(&execution_id, sink.clone()).await;
    state
        .registry
        .send(
            &execution_id,
            &StreamEnvelope::connection_established(&execution_id),
        )
        .await;
    info!(execution_id = %execution_id, "Channel connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, &execution_id, &text).await;
            }
            Ok(Message::Pong(_)) => {
                state.registry.handle_pong(&execution_id).await;
            }
            // The transport answers protocol pings itself.
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(execution_id = %execution_id, "Client closed channel");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(execution_id = %execution_id, error = %e, "Channel read failed");
                break;
            }
        }
    }

    // Only retire the channel if a reconnect has not replaced it.
    state
        .registry
        .unregister_if_current(&execution_id, &sink)
        .await;
    info!(execution_id = %execution_id, "Channel disconnected");
}

async fn handle_client_message(state: &Arc<AppState>, execution_id: &str, text: &str) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Ping) => {
            state
                .registry
                .send(execution_id, &StreamEnvelope::pong(execution_id))
                .await;
        }
        Ok(ClientMessage::StopExecution) => {
            info!(execution_id = %execution_id, "Client requested stop");
            let mut conn = state.redis.clone();
            if let Err(e) = record_store::request_cancel(&mut conn, execution_id).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to flag cancellation");
            }
            let event = LogEvent::new(
                LogLevel::Warning,
                LogSource::System,
                "Stop requested; the job is being terminated",
            );
            state
                .registry
                .send(execution_id, &StreamEnvelope::log(execution_id, &event))
                .await;
        }
        Ok(ClientMessage::RequestStatus) => {
            let message = match state.tracker.get(execution_id).await {
                Some(record) => {
                    let step = serde_json::to_value(record.state)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    StreamEnvelope::progress(
                        execution_id,
                        &step,
                        0.0,
                        "Current execution state",
                    )
                }
                None => StreamEnvelope::error(
                    execution_id,
                    "No execution in flight for this id",
                    "status",
                ),
            };
            state.registry.send(execution_id, &message).await;
        }
        Ok(ClientMessage::RequestLogs { data }) => {
            let events = state.tracker.recent_logs(execution_id, data.limit).await;
            for event in events {
                state
                    .registry
                    .send(execution_id, &StreamEnvelope::log(execution_id, &event))
                    .await;
            }
        }
        Err(e) => {
            debug!(execution_id = %execution_id, error = %e, "Unparseable client message");
            state
                .registry
                .send(
                    execution_id,
                    &StreamEnvelope::error(execution_id, "Unrecognized message", "channel"),
                )
                .await;
        }
    }
}
