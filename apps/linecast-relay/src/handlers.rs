use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use linecast_core::ChannelId;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::broadcast::ChannelBroadcaster;
use crate::directory::DisplayDirectory;
use crate::pairing::PairingCoordinator;
use crate::quick_pair::{QuickPairError, QuickPairService};
use crate::registry::ConnectionRegistry;
use crate::trigger::{TriggerOrchestrator, TriggerRequest, TriggerStatus};
use crate::websocket;

/// Long-poll bounds; requests above the cap are clamped, not rejected.
const DEFAULT_POLL_MS: u64 = 20_000;
const MAX_POLL_MS: u64 = 25_000;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub broadcaster: ChannelBroadcaster,
    pub pairing: PairingCoordinator,
    pub quick_pair: QuickPairService,
    pub trigger: TriggerOrchestrator,
    pub directory: Arc<dyn DisplayDirectory>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::ws_handler))
        .route("/pairing/qr", post(create_qr_session))
        .route("/pairing/qr/:session_id/poll", get(poll_qr_session))
        .route("/pairing/qr/:session_id/approve", post(approve_qr_session))
        .route("/pairing/quick", post(create_quick_session))
        .route("/pairing/quick/:sid/verify", post(verify_quick_session))
        .route("/pairing/quick/:sid/complete", post(complete_quick_session))
        .route("/pairing/quick/:sid", delete(release_quick_session))
        .route("/trigger", post(trigger))
        .route("/channels/:channel_id/status", get(channel_status))
        .route("/displays", post(register_display).get(list_displays))
        .route("/displays/:display_id/heartbeat", post(display_heartbeat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(status: StatusCode, code: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": code })))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn create_qr_session(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pairing.create_session())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollQuery {
    timeout_ms: Option<u64>,
}

async fn poll_qr_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<PollQuery>,
) -> impl IntoResponse {
    let timeout =
        Duration::from_millis(query.timeout_ms.unwrap_or(DEFAULT_POLL_MS).min(MAX_POLL_MS));
    let session = state.pairing.poll(session_id, timeout).await;
    Json(json!({ "session": session }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    code: String,
    approved_by: String,
    device_id: String,
    org_id: String,
    line_id: String,
}

async fn approve_qr_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> impl IntoResponse {
    match state.pairing.approve(
        session_id,
        &request.code,
        &request.approved_by,
        &request.device_id,
        &request.org_id,
        &request.line_id,
    ) {
        Some(approved) => (
            StatusCode::OK,
            Json(json!({
                "token": approved.token,
                "channelId": approved.channel_id,
            })),
        )
            .into_response(),
        None => error_body(StatusCode::CONFLICT, "not_approvable").into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQuickRequest {
    subject: String,
}

async fn create_quick_session(
    State(state): State<AppState>,
    Json(request): Json<CreateQuickRequest>,
) -> impl IntoResponse {
    match state.quick_pair.create_session(&request.subject) {
        Ok(created) => Json(created).into_response(),
        Err(_) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "token_mint_failed").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyQuickRequest {
    token: String,
}

async fn verify_quick_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(request): Json<VerifyQuickRequest>,
) -> impl IntoResponse {
    match state.quick_pair.verify(&sid, &request.token) {
        Ok(session) => Json(json!({ "valid": true, "session": session })).into_response(),
        Err(err) => {
            let status = match err {
                QuickPairError::SessionNotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::UNAUTHORIZED,
            };
            (status, Json(json!({ "valid": false, "error": err.code() }))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteQuickRequest {
    mobile_socket_id: String,
    #[serde(default)]
    monitor_socket_id: Option<String>,
}

async fn complete_quick_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(request): Json<CompleteQuickRequest>,
) -> impl IntoResponse {
    match state.quick_pair.complete_pairing(
        &sid,
        &request.mobile_socket_id,
        request.monitor_socket_id.as_deref(),
    ) {
        Ok(session) => Json(session).into_response(),
        Err(err) => error_body(StatusCode::NOT_FOUND, err.code()).into_response(),
    }
}

async fn release_quick_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    if state.quick_pair.release_session(&sid) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_body(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND").into_response()
    }
}

async fn trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    let outcome = state.trigger.trigger(request);
    let status = if outcome.status == TriggerStatus::Invalid {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(outcome))
}

async fn channel_status(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    Json(state.broadcaster.status(&channel_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDisplayRequest {
    name: String,
    #[serde(default)]
    channel_id: Option<String>,
}

async fn register_display(
    State(state): State<AppState>,
    Json(request): Json<RegisterDisplayRequest>,
) -> impl IntoResponse {
    let channel_id = match request.channel_id.as_deref() {
        Some(raw) => match ChannelId::parse(raw) {
            Ok(channel_id) => Some(channel_id),
            Err(_) => {
                return error_body(StatusCode::BAD_REQUEST, "invalid_channel_id").into_response()
            }
        },
        None => None,
    };
    Json(state.directory.register(&request.name, channel_id)).into_response()
}

async fn list_displays(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.directory.list())
}

async fn display_heartbeat(
    State(state): State<AppState>,
    Path(display_id): Path<String>,
) -> impl IntoResponse {
    match state.directory.heartbeat(&display_id) {
        Some(record) => Json(record).into_response(),
        None => error_body(StatusCode::NOT_FOUND, "display_not_found").into_response(),
    }
}
