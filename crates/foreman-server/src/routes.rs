//! HTTP/WS ingress.
//!
//! Thin by design: handlers translate requests, validate minimally, and
//! return the scheduler's outcome. No business logic lives here.

use std::pin::pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use foreman_core::bus::{self, TaskEvent};
use foreman_core::scheduler::{ApprovalError, Scheduler};
use foreman_db::models::{Expert, Phase, TaskRecord, TaskStatus};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::TaskNotFound(_) | ApprovalError::PhaseNotFound(_) => {
                Self::not_found(err.to_string())
            }
            ApprovalError::WrongState { .. } => Self::conflict(err.to_string()),
            ApprovalError::Internal(e) => Self::internal(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub task: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub task_id: String,
    pub phase_id: String,
    pub approved: bool,
    #[serde(default)]
    pub user_feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub success: bool,
    pub phase: Phase,
    pub task: TaskRecord,
}

#[derive(Debug, Serialize)]
pub struct PhaseDetailResponse {
    pub phase: Phase,
    pub experts: Vec<Expert>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub tasks: usize,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/api/task", post(submit_task).get(list_tasks))
        .route("/api/task/{id}", get(get_task))
        .route("/api/task/{id}/phase/{phase_id}", get(get_phase))
        .route("/api/phase/{id}/{phase_id}", get(get_phase_detail))
        .route("/api/phases/approve", post(approve_phase))
        .route("/api/task/{id}/events", get(task_events))
        .route("/ws", get(ws_subscribe))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(scheduler)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_task(
    State(scheduler): State<Arc<Scheduler>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    if request.task.trim().is_empty() {
        return Err(AppError::bad_request("task must not be empty"));
    }

    let record = scheduler
        .submit(&request.task)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(SubmitResponse {
        id: record.id,
        status: record.status,
    }))
}

async fn list_tasks(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<TaskRecord>> {
    Json(scheduler.list_tasks().await)
}

async fn get_task(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    let task = scheduler
        .get_task(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(task))
}

async fn get_phase(
    State(scheduler): State<Arc<Scheduler>>,
    Path((id, phase_id)): Path<(String, String)>,
) -> Result<Json<Phase>, AppError> {
    let task = scheduler
        .get_task(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    let phase = task
        .phase_by_id(&phase_id)
        .cloned()
        .ok_or_else(|| AppError::not_found(format!("phase {phase_id} not found")))?;
    Ok(Json(phase))
}

async fn get_phase_detail(
    State(scheduler): State<Arc<Scheduler>>,
    Path((id, phase_id)): Path<(String, String)>,
) -> Result<Json<PhaseDetailResponse>, AppError> {
    let task = scheduler
        .get_task(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    let phase = task
        .phase_by_id(&phase_id)
        .cloned()
        .ok_or_else(|| AppError::not_found(format!("phase {phase_id} not found")))?;
    let experts = phase.experts.clone();
    Ok(Json(PhaseDetailResponse { phase, experts }))
}

async fn approve_phase(
    State(scheduler): State<Arc<Scheduler>>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<ApproveResponse>, AppError> {
    let task = scheduler
        .approve_phase(
            &request.task_id,
            &request.phase_id,
            request.approved,
            request.user_feedback,
        )
        .await?;

    let phase = task
        .phase_by_id(&request.phase_id)
        .cloned()
        .ok_or_else(|| {
            AppError::internal(anyhow::anyhow!(
                "phase {} vanished after approval",
                request.phase_id
            ))
        })?;

    Ok(Json(ApproveResponse {
        success: true,
        phase,
        task,
    }))
}

async fn task_events(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let (snapshot, rx) = scheduler
        .subscribe(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    // Late joiners get a synthetic snapshot first, then the live feed.
    let first = TaskEvent::snapshot(&snapshot);
    let events = stream::once(async move { first }).chain(bus::into_event_stream(id, rx));
    let frames = events.map(|event| Event::default().json_data(&event));

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

async fn ws_subscribe(
    State(scheduler): State<Arc<Scheduler>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, scheduler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsSubscribe {
    task_id: String,
}

/// Bidirectional subscription: the first text frame selects the task, then
/// the same event payloads as the SSE stream flow out as JSON frames.
async fn handle_socket(mut socket: WebSocket, scheduler: Arc<Scheduler>) {
    let task_id = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<WsSubscribe>(text.as_str()) {
                    Ok(subscribe) => break subscribe.task_id,
                    Err(_) => {
                        let frame =
                            serde_json::json!({"error": "expected {\"taskId\": \"...\"}"});
                        let _ = socket.send(Message::Text(frame.to_string().into())).await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };

    let Some((snapshot, rx)) = scheduler.subscribe(&task_id).await else {
        let frame = serde_json::json!({"error": format!("task {task_id} not found")});
        let _ = socket.send(Message::Text(frame.to_string().into())).await;
        return;
    };

    let first = TaskEvent::snapshot(&snapshot);
    let events = stream::once(async move { first }).chain(bus::into_event_stream(task_id, rx));
    let mut events = pin!(events);

    // Split so the event pump and the client's frames can run concurrently.
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { return };
                let Ok(frame) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn health(State(scheduler): State<Arc<Scheduler>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        tasks: scheduler.task_count().await,
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
